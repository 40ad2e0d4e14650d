//! Reservation engine: the only path that takes stock away from `available`.

use tracing::{error, info, warn};

use crate::error::{Result, StockError};
use crate::lock::LockClient;
use crate::models::{NewReservationRecord, StockLedgerEntry};
use crate::scope::LockedScope;
use crate::store::{StockStore, StockTx};

#[derive(Clone)]
pub struct ReservationEngine<S> {
    scope: LockedScope<S>,
}

impl<S: StockStore> ReservationEngine<S> {
    pub fn new(store: S, locks: LockClient) -> Self {
        Self {
            scope: LockedScope::new(store, locks),
        }
    }

    pub fn store(&self) -> &S {
        self.scope.store()
    }

    /// Creates the ledger row or overwrites its total. Admin path: it does
    /// not take the goods lock, so it can race a concurrent reservation.
    pub async fn set_stock(&self, goods_id: i64, num: i64) -> Result<StockLedgerEntry> {
        if num < 0 {
            return Err(StockError::Validation(format!(
                "stock of goods {goods_id} cannot be negative"
            )));
        }
        let entry = self.store().upsert_initial(goods_id, num).await?;
        info!(goods_id, num, "stock set");
        Ok(entry)
    }

    /// Current snapshot; a goods id without a row reads as zero stock.
    pub async fn get_stock(&self, goods_id: i64) -> Result<StockLedgerEntry> {
        match self.store().read_one(goods_id).await {
            Ok(entry) => Ok(entry),
            Err(StockError::GoodsNotFound(_)) => Ok(StockLedgerEntry::empty(goods_id)),
            Err(e) => Err(e),
        }
    }

    /// Moves `num` units of `goods_id` into reservation for `order_id` and
    /// records a pending reservation, all under the goods lock.
    pub async fn reserve(&self, goods_id: i64, num: i64, order_id: i64) -> Result<StockLedgerEntry> {
        if num <= 0 {
            return Err(StockError::Validation(format!(
                "reserve quantity must be positive, got {num}"
            )));
        }

        let result = self
            .scope
            .run(goods_id, move |tx| {
                Box::pin(apply_reservation(tx, goods_id, num, order_id))
            })
            .await;

        match &result {
            Ok(entry) => info!(
                goods_id,
                order_id,
                num,
                total_stock = entry.total_stock,
                reserved = entry.reserved,
                "stock reserved"
            ),
            Err(e @ StockError::InsufficientStock { .. }) => {
                warn!(goods_id, order_id, num, "{}", e)
            }
            Err(e) => error!(goods_id, order_id, num, error = %e, "stock reservation failed"),
        }
        result
    }
}

async fn apply_reservation(
    tx: &mut dyn StockTx,
    goods_id: i64,
    num: i64,
    order_id: i64,
) -> Result<StockLedgerEntry> {
    let mut entry = tx.read_one(goods_id).await?;

    // Checked against the row as it will be written, so the commit keeps
    // `reserved <= total_stock`.
    let available = entry.reservable();
    if available < num {
        return Err(StockError::InsufficientStock {
            goods_id,
            available,
            requested: num,
        });
    }

    entry.total_stock -= num;
    entry.reserved += num;
    let entry = tx.save_atomic(&entry).await?;

    tx.create_record(NewReservationRecord::pending(order_id, goods_id, num))
        .await?;

    Ok(entry)
}

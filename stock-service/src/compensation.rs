//! Compensation handler: returns reserved units when an order is cancelled
//! or times out.
//!
//! Rollback signals arrive at-least-once. Only the first delivery for an
//! (order_id, goods_id) pair finds a pending record; every later delivery,
//! and any signal for an order that never reserved, is a successful no-op.

use std::time::Duration;

use shared::{RollbackSignal, RollbackStockResponse};
use tracing::{error, info, warn};

use crate::error::{Result, StockError};
use crate::lock::LockClient;
use crate::models::{RecordStatus, StockLedgerEntry};
use crate::scope::LockedScope;
use crate::store::{StockStore, StockTx};

const RETRY_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackOutcome {
    /// Stock restored and the record closed as rolled back.
    RolledBack(StockLedgerEntry),
    /// No pending record: never reserved, or already rolled back or
    /// confirmed.
    NothingPending,
}

impl RollbackOutcome {
    pub fn message(&self) -> &'static str {
        match self {
            RollbackOutcome::RolledBack(_) => "stock rolled back",
            RollbackOutcome::NothingPending => "no pending reservation, nothing to roll back",
        }
    }
}

#[derive(Clone)]
pub struct CompensationHandler<S> {
    scope: LockedScope<S>,
}

impl<S: StockStore> CompensationHandler<S> {
    pub fn new(store: S, locks: LockClient) -> Self {
        Self {
            scope: LockedScope::new(store, locks),
        }
    }

    pub async fn rollback(&self, order_id: i64, goods_id: i64, num: i64) -> Result<RollbackOutcome> {
        if num <= 0 {
            return Err(StockError::Validation(format!(
                "rollback quantity must be positive, got {num}"
            )));
        }

        let result = self
            .scope
            .run(goods_id, move |tx| {
                Box::pin(apply_rollback(tx, order_id, goods_id, num))
            })
            .await;

        match &result {
            Ok(RollbackOutcome::RolledBack(entry)) => info!(
                goods_id,
                order_id,
                num,
                total_stock = entry.total_stock,
                reserved = entry.reserved,
                "stock rolled back"
            ),
            Ok(RollbackOutcome::NothingPending) => {
                info!(goods_id, order_id, "no pending reservation to roll back")
            }
            Err(e @ StockError::RollbackInvariantViolation { .. }) => error!(
                target: "stock_service::integrity",
                goods_id,
                order_id,
                num,
                error = %e,
                "ledger and reservation records have drifted"
            ),
            Err(e) => error!(goods_id, order_id, num, error = %e, "stock rollback failed"),
        }
        result
    }

    /// Runs a rollback signal to a structured outcome, retrying transient
    /// failures up to `max_retries` times.
    pub async fn handle_signal(
        &self,
        signal: &RollbackSignal,
        max_retries: u32,
    ) -> RollbackStockResponse {
        let mut attempt = 0;
        loop {
            match self
                .rollback(signal.order_id, signal.goods_id, signal.num)
                .await
            {
                Ok(outcome) => return RollbackStockResponse::success(outcome.message()),
                Err(e) if e.is_transient() && attempt < max_retries => {
                    attempt += 1;
                    warn!(
                        goods_id = signal.goods_id,
                        order_id = signal.order_id,
                        attempt,
                        error = %e,
                        "retrying stock rollback"
                    );
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                }
                Err(e) => return RollbackStockResponse::failed(format!("stock rollback failed: {e}")),
            }
        }
    }
}

async fn apply_rollback(
    tx: &mut dyn StockTx,
    order_id: i64,
    goods_id: i64,
    num: i64,
) -> Result<RollbackOutcome> {
    let Some(mut record) = tx.find_active(order_id, goods_id).await? else {
        return Ok(RollbackOutcome::NothingPending);
    };

    if record.num != num {
        warn!(
            goods_id,
            order_id,
            reserved_num = record.num,
            rollback_num = num,
            "rollback quantity differs from reserved quantity"
        );
    }

    let mut entry = tx.read_one(goods_id).await?;
    if entry.reserved - num < 0 {
        return Err(StockError::RollbackInvariantViolation {
            order_id,
            goods_id,
            reserved: entry.reserved,
            num,
        });
    }
    entry.total_stock += num;
    entry.reserved -= num;
    let entry = tx.save_atomic(&entry).await?;

    record.status = RecordStatus::RolledBack;
    tx.save_record(&record).await?;

    Ok(RollbackOutcome::RolledBack(entry))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::engine::ReservationEngine;
    use crate::lock::{InMemoryLockBackend, LockOptions};
    use crate::memory::InMemoryStockStore;

    fn wire() -> (ReservationEngine<InMemoryStockStore>, CompensationHandler<InMemoryStockStore>) {
        let store = InMemoryStockStore::new();
        let locks = LockClient::new(Arc::new(InMemoryLockBackend::new()), LockOptions::default());
        (
            ReservationEngine::new(store.clone(), locks.clone()),
            CompensationHandler::new(store, locks),
        )
    }

    #[tokio::test]
    async fn rollback_restores_and_closes_record() {
        let (engine, handler) = wire();
        engine.set_stock(2001, 100).await.unwrap();
        engine.reserve(2001, 30, 1).await.unwrap();

        let outcome = handler.rollback(1, 2001, 30).await.unwrap();

        let RollbackOutcome::RolledBack(entry) = outcome else {
            panic!("expected a rollback, got {outcome:?}");
        };
        assert_eq!((entry.total_stock, entry.reserved), (100, 0));
        let records = engine.store().records_for(1, 2001).await.unwrap();
        assert_eq!(records[0].status, RecordStatus::RolledBack);
    }

    #[tokio::test]
    async fn second_rollback_is_a_no_op() {
        let (engine, handler) = wire();
        engine.set_stock(2001, 100).await.unwrap();
        engine.reserve(2001, 30, 1).await.unwrap();
        handler.rollback(1, 2001, 30).await.unwrap();

        let outcome = handler.rollback(1, 2001, 30).await.unwrap();

        assert_eq!(outcome, RollbackOutcome::NothingPending);
        let entry = engine.get_stock(2001).await.unwrap();
        assert_eq!((entry.total_stock, entry.reserved), (100, 0));
    }

    #[tokio::test]
    async fn confirmed_record_is_not_rolled_back() {
        let (engine, handler) = wire();
        engine.set_stock(3, 10).await.unwrap();
        engine.reserve(3, 4, 8).await.unwrap();
        assert!(engine.store().confirm(8, 3));

        let outcome = handler.rollback(8, 3, 4).await.unwrap();

        assert_eq!(outcome, RollbackOutcome::NothingPending);
        let entry = engine.get_stock(3).await.unwrap();
        assert_eq!((entry.total_stock, entry.reserved), (6, 4));
    }

    #[tokio::test]
    async fn drift_is_reported_not_clamped() {
        let (engine, handler) = wire();
        engine.set_stock(4, 10).await.unwrap();
        engine.reserve(4, 5, 2).await.unwrap();
        engine.store().force_ledger(4, 5, 1);

        let err = handler.rollback(2, 4, 5).await.unwrap_err();

        assert!(matches!(
            err,
            StockError::RollbackInvariantViolation {
                reserved: 1,
                num: 5,
                ..
            }
        ));
        let entry = engine.get_stock(4).await.unwrap();
        assert_eq!((entry.total_stock, entry.reserved), (5, 1));
        let records = engine.store().records_for(2, 4).await.unwrap();
        assert_eq!(records[0].status, RecordStatus::Pending);
    }

    #[tokio::test]
    async fn signal_failure_is_structured() {
        let (engine, handler) = wire();
        engine.set_stock(4, 10).await.unwrap();
        engine.reserve(4, 5, 2).await.unwrap();
        engine.store().force_ledger(4, 5, 0);

        let signal = RollbackSignal {
            order_id: 2,
            goods_id: 4,
            num: 5,
        };
        let response = handler.handle_signal(&signal, 3).await;

        assert!(!response.success);
        assert!(response.message.contains("negative"));
    }

    #[tokio::test]
    async fn signal_for_unknown_order_succeeds() {
        let (_, handler) = wire();
        let signal = RollbackSignal {
            order_id: 99,
            goods_id: 1,
            num: 1,
        };
        let response = handler.handle_signal(&signal, 0).await;
        assert!(response.success);
    }
}

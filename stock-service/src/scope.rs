//! Lock-then-transaction scoping shared by reservation and rollback.
//!
//! [`LockedScope::run`] takes the per-goods lock, runs the body inside a
//! store transaction and releases the lock once the transaction is closed,
//! whichever way the body exits. The body never commits under an expired
//! lease: if the lease ran out while it worked, the transaction rolls back
//! with `LockExpired`.
//!
//! The lease is checked once the body returns, which is the last point
//! before the store commits. The commit itself can still outlast the lease.
//! On Postgres that window is covered by the `FOR UPDATE` row lock taken on
//! the ledger read: a second holder of the goods lock blocks on the row until
//! this transaction ends, so it never reads the ledger mid-commit.

use tracing::warn;

use crate::error::{Result, StockError};
use crate::lock::{lock_key, LockClient, LockLease};
use crate::store::{StockStore, StockTx, TxFuture};

#[derive(Clone)]
pub struct LockedScope<S> {
    store: S,
    locks: LockClient,
}

impl<S: StockStore> LockedScope<S> {
    pub fn new(store: S, locks: LockClient) -> Self {
        Self { store, locks }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub async fn run<T, F>(&self, goods_id: i64, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: for<'t> FnOnce(&'t mut dyn StockTx) -> TxFuture<'t, T> + Send + 'static,
    {
        let lease = self.locks.acquire(&lock_key(goods_id)).await?;

        let guard = lease.clone();
        let outcome = self
            .store
            .transaction(move |tx| Box::pin(within_lease(tx, f, guard)))
            .await;

        // The transaction is closed here, committed or rolled back.
        if outcome.is_ok() && lease.is_expired() {
            warn!(goods_id, "stock lock lease expired while committing");
        }
        if let Err(e) = self.locks.release(lease).await {
            warn!(goods_id, error = %e, "failed to release stock lock");
        }

        outcome
    }
}

async fn within_lease<'t, T, F>(tx: &'t mut dyn StockTx, f: F, lease: LockLease) -> Result<T>
where
    F: FnOnce(&'t mut dyn StockTx) -> TxFuture<'t, T>,
{
    let value = f(tx).await?;
    if lease.is_expired() {
        return Err(StockError::LockExpired {
            key: lease.key().to_string(),
        });
    }
    Ok(value)
}

//! Storage contracts for the stock ledger and the reservation records.
//!
//! Concurrent paths only touch storage through [`StockStore::transaction`]:
//! the closure receives a [`StockTx`] and everything it does commits when it
//! returns `Ok` and rolls back when it returns `Err`.

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::error::Result;
use crate::models::{NewReservationRecord, ReservationRecord, StockLedgerEntry};

/// Future returned by a transaction body, borrowing the transaction handle.
pub type TxFuture<'t, T> = BoxFuture<'t, Result<T>>;

/// Operations available inside an open transaction.
#[async_trait]
pub trait StockTx: Send {
    /// Reads and locks the ledger row. `GoodsNotFound` if absent.
    async fn read_one(&mut self, goods_id: i64) -> Result<StockLedgerEntry>;

    /// Writes totals back to an existing row and returns the stored row.
    async fn save_atomic(&mut self, entry: &StockLedgerEntry) -> Result<StockLedgerEntry>;

    /// Inserts a reservation record. At most one pending record may exist
    /// per (order_id, goods_id); a second one fails with
    /// `DuplicateReservation`.
    async fn create_record(&mut self, record: NewReservationRecord) -> Result<ReservationRecord>;

    /// Finds the pending record for an order and goods id, if any.
    async fn find_active(
        &mut self,
        order_id: i64,
        goods_id: i64,
    ) -> Result<Option<ReservationRecord>>;

    /// Persists a status transition.
    async fn save_record(&mut self, record: &ReservationRecord) -> Result<ReservationRecord>;
}

#[async_trait]
pub trait StockStore: Clone + Send + Sync + 'static {
    /// Creates the ledger row or overwrites its `total_stock`. Admin path,
    /// no concurrency check.
    async fn upsert_initial(&self, goods_id: i64, num: i64) -> Result<StockLedgerEntry>;

    /// Read-only snapshot outside any transaction.
    async fn read_one(&self, goods_id: i64) -> Result<StockLedgerEntry>;

    /// Every record ever written for (order_id, goods_id), oldest first.
    async fn records_for(&self, order_id: i64, goods_id: i64) -> Result<Vec<ReservationRecord>>;

    /// Runs `f` inside a transaction.
    async fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: for<'t> FnOnce(&'t mut dyn StockTx) -> TxFuture<'t, T> + Send + 'static;
}

//! In-memory stock store for tests and local runs.
//!
//! A transaction works on a private copy taken at begin and publishes only the
//! rows it wrote when it commits. Nothing here serializes two transactions on
//! the same goods id, the same as a row store without the distributed lock.
//! The store still enforces the checks of the SQL schema: non-negative
//! counters, `reserved <= total_stock` and a single pending record per
//! (order_id, goods_id).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use diesel::result::{DatabaseErrorKind, Error as DieselError};

use crate::error::{Result, StockError};
use crate::models::{NewReservationRecord, RecordStatus, ReservationRecord, StockLedgerEntry};
use crate::store::{StockStore, StockTx, TxFuture};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    ledger: HashMap<i64, StockLedgerEntry>,
    records: BTreeMap<i64, ReservationRecord>,
}

#[derive(Debug, Default)]
struct Sequences {
    stock: AtomicI64,
    records: AtomicI64,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryStockStore {
    state: Arc<Mutex<MemoryState>>,
    ids: Arc<Sequences>,
}

impl InMemoryStockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pending records across all goods.
    pub fn pending_count(&self) -> usize {
        self.lock_state()
            .records
            .values()
            .filter(|r| r.status == RecordStatus::Pending)
            .count()
    }

    /// Marks the pending record confirmed, as business completion would.
    pub fn confirm(&self, order_id: i64, goods_id: i64) -> bool {
        let mut state = self.lock_state();
        match state.records.values_mut().find(|r| {
            r.order_id == order_id && r.goods_id == goods_id && r.status == RecordStatus::Pending
        }) {
            Some(record) => {
                record.status = RecordStatus::Confirmed;
                record.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Overwrites ledger counters directly, bypassing every check. Used to
    /// simulate ledger/record drift.
    pub fn force_ledger(&self, goods_id: i64, total_stock: i64, reserved: i64) {
        let mut state = self.lock_state();
        if let Some(entry) = state.ledger.get_mut(&goods_id) {
            entry.total_stock = total_stock;
            entry.reserved = reserved;
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn commit(&self, tx: MemoryTx) -> Result<()> {
        let mut live = self.lock_state();

        for id in &tx.written_records {
            if let Some(record) = tx.working.records.get(id) {
                if record.status == RecordStatus::Pending
                    && live.records.values().any(|other| {
                        other.id != record.id
                            && other.status == RecordStatus::Pending
                            && other.order_id == record.order_id
                            && other.goods_id == record.goods_id
                    })
                {
                    return Err(StockError::DuplicateReservation {
                        order_id: record.order_id,
                        goods_id: record.goods_id,
                    });
                }
            }
        }

        for goods_id in &tx.written_ledger {
            if let Some(entry) = tx.working.ledger.get(goods_id) {
                live.ledger.insert(*goods_id, entry.clone());
            }
        }
        for id in &tx.written_records {
            if let Some(record) = tx.working.records.get(id) {
                live.records.insert(*id, record.clone());
            }
        }
        Ok(())
    }
}

fn check_counters(goods_id: i64, total_stock: i64, reserved: i64) -> Result<()> {
    if total_stock < 0 || reserved < 0 || reserved > total_stock {
        return Err(StockError::Database(DieselError::DatabaseError(
            DatabaseErrorKind::CheckViolation,
            Box::new(format!(
                "stock of goods {goods_id} violates 0 <= reserved ({reserved}) <= total ({total_stock})"
            )),
        )));
    }
    Ok(())
}

struct MemoryTx {
    working: MemoryState,
    ids: Arc<Sequences>,
    written_ledger: BTreeSet<i64>,
    written_records: BTreeSet<i64>,
}

#[async_trait]
impl StockTx for MemoryTx {
    async fn read_one(&mut self, goods_id: i64) -> Result<StockLedgerEntry> {
        self.working
            .ledger
            .get(&goods_id)
            .cloned()
            .ok_or(StockError::GoodsNotFound(goods_id))
    }

    async fn save_atomic(&mut self, entry: &StockLedgerEntry) -> Result<StockLedgerEntry> {
        check_counters(entry.goods_id, entry.total_stock, entry.reserved)?;
        let stored = self
            .working
            .ledger
            .get_mut(&entry.goods_id)
            .ok_or(StockError::GoodsNotFound(entry.goods_id))?;
        stored.total_stock = entry.total_stock;
        stored.reserved = entry.reserved;
        stored.version += 1;
        stored.updated_at = Utc::now();
        let saved = stored.clone();
        self.written_ledger.insert(entry.goods_id);
        Ok(saved)
    }

    async fn create_record(&mut self, record: NewReservationRecord) -> Result<ReservationRecord> {
        let duplicate = record.status == RecordStatus::Pending
            && self.working.records.values().any(|r| {
                r.status == RecordStatus::Pending
                    && r.order_id == record.order_id
                    && r.goods_id == record.goods_id
            });
        if duplicate {
            return Err(StockError::DuplicateReservation {
                order_id: record.order_id,
                goods_id: record.goods_id,
            });
        }

        let now = Utc::now();
        let id = self.ids.records.fetch_add(1, Ordering::SeqCst) + 1;
        let created = ReservationRecord {
            id,
            order_id: record.order_id,
            goods_id: record.goods_id,
            num: record.num,
            status: record.status,
            created_at: now,
            updated_at: now,
        };
        self.working.records.insert(id, created.clone());
        self.written_records.insert(id);
        Ok(created)
    }

    async fn find_active(
        &mut self,
        order_id: i64,
        goods_id: i64,
    ) -> Result<Option<ReservationRecord>> {
        Ok(self
            .working
            .records
            .values()
            .find(|r| {
                r.order_id == order_id
                    && r.goods_id == goods_id
                    && r.status == RecordStatus::Pending
            })
            .cloned())
    }

    async fn save_record(&mut self, record: &ReservationRecord) -> Result<ReservationRecord> {
        let stored = self
            .working
            .records
            .get_mut(&record.id)
            .ok_or(StockError::Database(DieselError::NotFound))?;
        stored.status = record.status;
        stored.updated_at = Utc::now();
        let saved = stored.clone();
        self.written_records.insert(record.id);
        Ok(saved)
    }
}

#[async_trait]
impl StockStore for InMemoryStockStore {
    async fn upsert_initial(&self, goods_id: i64, num: i64) -> Result<StockLedgerEntry> {
        let mut state = self.lock_state();
        let reserved = state.ledger.get(&goods_id).map_or(0, |e| e.reserved);
        check_counters(goods_id, num, reserved)?;
        let now = Utc::now();
        let entry = state.ledger.entry(goods_id).or_insert_with(|| StockLedgerEntry {
            id: self.ids.stock.fetch_add(1, Ordering::SeqCst) + 1,
            version: -1,
            ..StockLedgerEntry::empty(goods_id)
        });
        entry.total_stock = num;
        entry.version += 1;
        entry.updated_at = now;
        Ok(entry.clone())
    }

    async fn read_one(&self, goods_id: i64) -> Result<StockLedgerEntry> {
        self.lock_state()
            .ledger
            .get(&goods_id)
            .cloned()
            .ok_or(StockError::GoodsNotFound(goods_id))
    }

    async fn records_for(&self, order_id: i64, goods_id: i64) -> Result<Vec<ReservationRecord>> {
        Ok(self
            .lock_state()
            .records
            .values()
            .filter(|r| r.order_id == order_id && r.goods_id == goods_id)
            .cloned()
            .collect())
    }

    async fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: for<'t> FnOnce(&'t mut dyn StockTx) -> TxFuture<'t, T> + Send + 'static,
    {
        let working = self.lock_state().clone();
        let mut tx = MemoryTx {
            working,
            ids: self.ids.clone(),
            written_ledger: BTreeSet::new(),
            written_records: BTreeSet::new(),
        };

        let value = f(&mut tx).await?;
        self.commit(tx)?;
        Ok(value)
    }
}

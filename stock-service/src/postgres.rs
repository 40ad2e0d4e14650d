use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::pooled_connection::bb8::{Pool, PooledConnection};
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};

use crate::error::{Result, StockError};
use crate::models::*;
use crate::schema::*;
use crate::store::{StockStore, StockTx, TxFuture};

pub type DbPool = Pool<AsyncPgConnection>;

#[derive(Clone)]
pub struct PgStockStore {
    pool: DbPool,
}

impl PgStockStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> Result<PooledConnection<'_, AsyncPgConnection>> {
        self.pool
            .get()
            .await
            .map_err(|e| StockError::Pool(e.to_string()))
    }
}

struct PgStockTx<'c> {
    conn: &'c mut AsyncPgConnection,
}

#[async_trait]
impl<'c> StockTx for PgStockTx<'c> {
    async fn read_one(&mut self, goods_id: i64) -> Result<StockLedgerEntry> {
        stock::table
            .filter(stock::goods_id.eq(goods_id))
            .for_update()
            .first::<StockLedgerEntry>(&mut *self.conn)
            .await
            .optional()?
            .ok_or(StockError::GoodsNotFound(goods_id))
    }

    async fn save_atomic(&mut self, entry: &StockLedgerEntry) -> Result<StockLedgerEntry> {
        diesel::update(stock::table.filter(stock::goods_id.eq(entry.goods_id)))
            .set((
                stock::total_stock.eq(entry.total_stock),
                stock::reserved.eq(entry.reserved),
                stock::version.eq(stock::version + 1),
                stock::updated_at.eq(Utc::now()),
            ))
            .get_result::<StockLedgerEntry>(&mut *self.conn)
            .await
            .optional()?
            .ok_or(StockError::GoodsNotFound(entry.goods_id))
    }

    async fn create_record(&mut self, record: NewReservationRecord) -> Result<ReservationRecord> {
        diesel::insert_into(stock_records::table)
            .values(&record)
            .get_result::<ReservationRecord>(&mut *self.conn)
            .await
            .map_err(|e| StockError::from_insert(e, record.order_id, record.goods_id))
    }

    async fn find_active(
        &mut self,
        order_id: i64,
        goods_id: i64,
    ) -> Result<Option<ReservationRecord>> {
        let record = stock_records::table
            .filter(stock_records::order_id.eq(order_id))
            .filter(stock_records::goods_id.eq(goods_id))
            .filter(stock_records::status.eq(RecordStatus::Pending))
            .for_update()
            .first::<ReservationRecord>(&mut *self.conn)
            .await
            .optional()?;
        Ok(record)
    }

    async fn save_record(&mut self, record: &ReservationRecord) -> Result<ReservationRecord> {
        let saved = diesel::update(stock_records::table.filter(stock_records::id.eq(record.id)))
            .set((
                stock_records::status.eq(record.status),
                stock_records::updated_at.eq(Utc::now()),
            ))
            .get_result::<ReservationRecord>(&mut *self.conn)
            .await?;
        Ok(saved)
    }
}

#[async_trait]
impl StockStore for PgStockStore {
    async fn upsert_initial(&self, goods_id: i64, num: i64) -> Result<StockLedgerEntry> {
        let mut conn = self.conn().await?;

        let new_entry = NewStockLedgerEntry {
            goods_id,
            total_stock: num,
            reserved: 0,
        };

        let entry = diesel::insert_into(stock::table)
            .values(&new_entry)
            .on_conflict(stock::goods_id)
            .do_update()
            .set((
                stock::total_stock.eq(num),
                stock::version.eq(stock::version + 1),
                stock::updated_at.eq(Utc::now()),
            ))
            .get_result::<StockLedgerEntry>(&mut *conn)
            .await?;

        Ok(entry)
    }

    async fn read_one(&self, goods_id: i64) -> Result<StockLedgerEntry> {
        let mut conn = self.conn().await?;

        stock::table
            .filter(stock::goods_id.eq(goods_id))
            .first::<StockLedgerEntry>(&mut *conn)
            .await
            .optional()?
            .ok_or(StockError::GoodsNotFound(goods_id))
    }

    async fn records_for(&self, order_id: i64, goods_id: i64) -> Result<Vec<ReservationRecord>> {
        let mut conn = self.conn().await?;

        let records = stock_records::table
            .filter(stock_records::order_id.eq(order_id))
            .filter(stock_records::goods_id.eq(goods_id))
            .order(stock_records::id.asc())
            .load::<ReservationRecord>(&mut *conn)
            .await?;

        Ok(records)
    }

    async fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: for<'t> FnOnce(&'t mut dyn StockTx) -> TxFuture<'t, T> + Send + 'static,
    {
        let mut conn = self.conn().await?;

        conn.transaction::<T, StockError, _>(|conn| {
            async move {
                let mut tx = PgStockTx { conn };
                f(&mut tx).await
            }
            .scope_boxed()
        })
        .await
    }
}

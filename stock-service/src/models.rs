use chrono::{DateTime, Utc};
use diesel::deserialize::{self, FromSql, FromSqlRow};
use diesel::expression::AsExpression;
use diesel::pg::{Pg, PgValue};
use diesel::prelude::*;
use diesel::serialize::{self, Output, ToSql};
use diesel::sql_types::SmallInt;
use serde::{Deserialize, Serialize};

/// One row of the stock ledger. `total_stock` is already net of completed
/// sales; `reserved` is the part held against in-flight orders.
#[derive(Debug, Clone, PartialEq, Eq, Queryable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::stock)]
pub struct StockLedgerEntry {
    pub id: i64,
    pub goods_id: i64,
    pub total_stock: i64,
    pub reserved: i64,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StockLedgerEntry {
    /// Zero-valued snapshot used when a goods id has no ledger row yet.
    pub fn empty(goods_id: i64) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            goods_id,
            total_stock: 0,
            reserved: 0,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn available(&self) -> i64 {
        self.total_stock - self.reserved
    }

    /// Largest quantity a single reservation can take. Reserving `num` moves
    /// it out of `total_stock` and into `reserved`, which shrinks `available`
    /// by `2 * num`; anything above half of `available` would leave
    /// `reserved > total_stock`.
    pub fn reservable(&self) -> i64 {
        self.available().max(0) / 2
    }

    /// `0 <= reserved <= total_stock`, the shape every committed row keeps.
    pub fn is_consistent(&self) -> bool {
        0 <= self.reserved && self.reserved <= self.total_stock
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::stock)]
pub struct NewStockLedgerEntry {
    pub goods_id: i64,
    pub total_stock: i64,
    pub reserved: i64,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsExpression, FromSqlRow,
)]
#[diesel(sql_type = SmallInt)]
pub enum RecordStatus {
    Pending,
    Confirmed,
    RolledBack,
}

impl RecordStatus {
    pub fn code(self) -> i16 {
        match self {
            RecordStatus::Pending => 1,
            RecordStatus::Confirmed => 2,
            RecordStatus::RolledBack => 3,
        }
    }

    /// Confirmed and RolledBack absorb every further signal.
    pub fn is_terminal(self) -> bool {
        !matches!(self, RecordStatus::Pending)
    }
}

impl TryFrom<i16> for RecordStatus {
    type Error = String;

    fn try_from(code: i16) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(RecordStatus::Pending),
            2 => Ok(RecordStatus::Confirmed),
            3 => Ok(RecordStatus::RolledBack),
            other => Err(format!("unknown stock record status {other}")),
        }
    }
}

impl ToSql<SmallInt, Pg> for RecordStatus {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
        match self {
            RecordStatus::Pending => <i16 as ToSql<SmallInt, Pg>>::to_sql(&1, out),
            RecordStatus::Confirmed => <i16 as ToSql<SmallInt, Pg>>::to_sql(&2, out),
            RecordStatus::RolledBack => <i16 as ToSql<SmallInt, Pg>>::to_sql(&3, out),
        }
    }
}

impl FromSql<SmallInt, Pg> for RecordStatus {
    fn from_sql(bytes: PgValue<'_>) -> deserialize::Result<Self> {
        let code = <i16 as FromSql<SmallInt, Pg>>::from_sql(bytes)?;
        RecordStatus::try_from(code).map_err(Into::into)
    }
}

/// A reservation attempt for one (order, goods) pair.
#[derive(Debug, Clone, PartialEq, Eq, Queryable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::stock_records)]
pub struct ReservationRecord {
    pub id: i64,
    pub order_id: i64,
    pub goods_id: i64,
    pub num: i64,
    pub status: RecordStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::stock_records)]
pub struct NewReservationRecord {
    pub order_id: i64,
    pub goods_id: i64,
    pub num: i64,
    pub status: RecordStatus,
}

impl NewReservationRecord {
    pub fn pending(order_id: i64, goods_id: i64, num: i64) -> Self {
        Self {
            order_id,
            goods_id,
            num,
            status: RecordStatus::Pending,
        }
    }
}

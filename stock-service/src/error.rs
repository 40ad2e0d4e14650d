//! Stock service error types.

use diesel::result::{DatabaseErrorKind, Error as DieselError};
use thiserror::Error;

/// Errors raised by the reservation engine, the compensation handler and the
/// stores beneath them.
#[derive(Debug, Error)]
pub enum StockError {
    /// Bad input, rejected at the boundary.
    #[error("Invalid request: {0}")]
    Validation(String),

    /// The per-goods lock could not be taken within the retry budget.
    #[error("Reduce failed: could not acquire lock {key} after {attempts} attempts")]
    LockAcquisitionFailed { key: String, attempts: u32 },

    /// Release was attempted with a token that no longer owns the key.
    #[error("Lock {key} is not held by this token")]
    LockNotHeld { key: String },

    /// The lease ran out before the transaction could commit.
    #[error("Lock {key} expired before commit")]
    LockExpired { key: String },

    #[error("Lock backend error: {0}")]
    LockBackend(#[from] redis::RedisError),

    #[error("Goods not found: {0}")]
    GoodsNotFound(i64),

    #[error("Insufficient stock for goods {goods_id}: available {available}, requested {requested}")]
    InsufficientStock {
        goods_id: i64,
        available: i64,
        requested: i64,
    },

    /// A pending reservation already exists for this (order, goods) pair.
    #[error("Order {order_id} already holds a pending reservation for goods {goods_id}")]
    DuplicateReservation { order_id: i64, goods_id: i64 },

    /// Ledger and reservation records have drifted apart.
    #[error(
        "Rollback of order {order_id} would drive reserved stock of goods {goods_id} negative (reserved {reserved}, rollback {num})"
    )]
    RollbackInvariantViolation {
        order_id: i64,
        goods_id: i64,
        reserved: i64,
        num: i64,
    },

    #[error("Database error: {0}")]
    Database(#[from] DieselError),

    #[error("Connection pool error: {0}")]
    Pool(String),
}

impl StockError {
    /// Failures worth retrying as a whole operation. Business rejections and
    /// integrity alarms are final.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StockError::LockAcquisitionFailed { .. }
                | StockError::LockNotHeld { .. }
                | StockError::LockExpired { .. }
                | StockError::LockBackend(_)
                | StockError::Database(_)
                | StockError::Pool(_)
        )
    }

    /// Maps a unique-index violation on the pending-record index into a
    /// `DuplicateReservation`, passing every other database error through.
    pub(crate) fn from_insert(err: DieselError, order_id: i64, goods_id: i64) -> Self {
        match err {
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
                StockError::DuplicateReservation { order_id, goods_id }
            }
            other => StockError::Database(other),
        }
    }
}

/// Convenience type alias for stock results.
pub type Result<T> = std::result::Result<T, StockError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn business_rejections_are_not_transient() {
        assert!(!StockError::InsufficientStock {
            goods_id: 1,
            available: 0,
            requested: 1
        }
        .is_transient());
        assert!(!StockError::RollbackInvariantViolation {
            order_id: 1,
            goods_id: 1,
            reserved: 0,
            num: 1
        }
        .is_transient());
        assert!(!StockError::GoodsNotFound(1).is_transient());
    }

    #[test]
    fn lock_and_store_failures_are_transient() {
        assert!(StockError::LockAcquisitionFailed {
            key: "stock-lock-1".into(),
            attempts: 3
        }
        .is_transient());
        assert!(StockError::Database(DieselError::RollbackTransaction).is_transient());
        assert!(StockError::Pool("timed out".into()).is_transient());
    }

    #[test]
    fn non_unique_insert_errors_pass_through() {
        let err = StockError::from_insert(DieselError::NotFound, 1, 2);
        assert!(matches!(err, StockError::Database(DieselError::NotFound)));
    }
}

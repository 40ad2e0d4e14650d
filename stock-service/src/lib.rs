//! Stock reservation and compensation engine.
//!
//! Reservations and rollbacks for one goods id are serialized through a
//! distributed lock shared by every service instance, and each one applies
//! its ledger and reservation-record writes in a single store transaction.

pub mod api;
pub mod compensation;
pub mod config;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod lock;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod redis_lock;
pub mod schema;
pub mod scope;
pub mod store;

pub use compensation::{CompensationHandler, RollbackOutcome};
pub use config::Config;
pub use engine::ReservationEngine;
pub use error::{Result, StockError};
pub use lock::{lock_key, InMemoryLockBackend, LockBackend, LockClient, LockLease, LockOptions};
pub use memory::InMemoryStockStore;
pub use models::{RecordStatus, ReservationRecord, StockLedgerEntry};
pub use postgres::PgStockStore;
pub use redis_lock::RedisLockBackend;
pub use store::{StockStore, StockTx};

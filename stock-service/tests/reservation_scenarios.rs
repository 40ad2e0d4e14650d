//! End-to-end reservation and rollback behaviour on the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use stock_service::{
    CompensationHandler, InMemoryLockBackend, InMemoryStockStore, LockClient, LockOptions,
    RecordStatus, ReservationEngine, RollbackOutcome, StockError, StockStore,
};

/// One simulated service instance. Instances built from the same harness share
/// the store and the lock service but nothing else.
struct Instance {
    engine: ReservationEngine<InMemoryStockStore>,
    compensation: CompensationHandler<InMemoryStockStore>,
}

struct TestHarness {
    store: InMemoryStockStore,
    locks: InMemoryLockBackend,
}

impl TestHarness {
    fn new() -> Self {
        Self {
            store: InMemoryStockStore::new(),
            locks: InMemoryLockBackend::new(),
        }
    }

    fn instance(&self) -> Instance {
        let options = LockOptions {
            ttl: Duration::from_secs(5),
            retry_delay: Duration::from_millis(1),
            max_attempts: 5_000,
        };
        let locks = LockClient::new(Arc::new(self.locks.clone()), options);
        Instance {
            engine: ReservationEngine::new(self.store.clone(), locks.clone()),
            compensation: CompensationHandler::new(self.store.clone(), locks),
        }
    }

    async fn ledger(&self, goods_id: i64) -> (i64, i64) {
        let entry = self.store.read_one(goods_id).await.unwrap();
        (entry.total_stock, entry.reserved)
    }
}

#[tokio::test]
async fn test_scenario_a_reserve_thirty() {
    let h = TestHarness::new();
    let node = h.instance();
    node.engine.set_stock(2001, 100).await.unwrap();

    let entry = node.engine.reserve(2001, 30, 1).await.unwrap();

    assert_eq!((entry.total_stock, entry.reserved), (70, 30));
    assert_eq!(h.ledger(2001).await, (70, 30));
    let records = h.store.records_for(1, 2001).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, RecordStatus::Pending);
    assert_eq!(records[0].num, 30);
}

#[tokio::test]
async fn test_scenario_b_insufficient_stock() {
    let h = TestHarness::new();
    let node = h.instance();
    node.engine.set_stock(2001, 100).await.unwrap();
    node.engine.reserve(2001, 30, 1).await.unwrap();

    let err = node.engine.reserve(2001, 80, 2).await.unwrap_err();

    assert!(matches!(err, StockError::InsufficientStock { .. }));
    assert_eq!(h.ledger(2001).await, (70, 30));
    assert!(h.store.records_for(2, 2001).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_scenario_c_rollback_restores() {
    let h = TestHarness::new();
    let node = h.instance();
    node.engine.set_stock(2001, 100).await.unwrap();
    node.engine.reserve(2001, 30, 1).await.unwrap();

    let outcome = node.compensation.rollback(1, 2001, 30).await.unwrap();

    assert!(matches!(outcome, RollbackOutcome::RolledBack(_)));
    assert_eq!(h.ledger(2001).await, (100, 0));
    let records = h.store.records_for(1, 2001).await.unwrap();
    assert_eq!(records[0].status, RecordStatus::RolledBack);
}

#[tokio::test]
async fn test_scenario_d_repeated_rollback_is_idempotent() {
    let h = TestHarness::new();
    let node = h.instance();
    node.engine.set_stock(2001, 100).await.unwrap();
    node.engine.reserve(2001, 30, 1).await.unwrap();
    node.compensation.rollback(1, 2001, 30).await.unwrap();
    let after_first = h.ledger(2001).await;

    let outcome = node.compensation.rollback(1, 2001, 30).await.unwrap();

    assert_eq!(outcome, RollbackOutcome::NothingPending);
    assert_eq!(h.ledger(2001).await, after_first);
}

#[tokio::test]
async fn test_scenario_e_rollback_without_record() {
    let h = TestHarness::new();
    let node = h.instance();
    node.engine.set_stock(2001, 100).await.unwrap();

    let outcome = node.compensation.rollback(12345, 2001, 30).await.unwrap();

    assert_eq!(outcome, RollbackOutcome::NothingPending);
    assert_eq!(h.ledger(2001).await, (100, 0));
}

#[tokio::test]
async fn test_reserve_then_rollback_round_trip() {
    let h = TestHarness::new();
    let node = h.instance();
    node.engine.set_stock(7, 41).await.unwrap();
    node.engine.reserve(7, 3, 100).await.unwrap();
    let before = h.ledger(7).await;

    node.engine.reserve(7, 9, 101).await.unwrap();
    node.compensation.rollback(101, 7, 9).await.unwrap();

    assert_eq!(h.ledger(7).await, before);
}

#[tokio::test]
async fn test_rollback_from_another_instance() {
    let h = TestHarness::new();
    let first = h.instance();
    let second = h.instance();
    first.engine.set_stock(9, 10).await.unwrap();
    first.engine.reserve(9, 4, 1).await.unwrap();

    second.compensation.rollback(1, 9, 4).await.unwrap();
    let again = first.compensation.rollback(1, 9, 4).await.unwrap();

    assert_eq!(again, RollbackOutcome::NothingPending);
    assert_eq!(h.ledger(9).await, (10, 0));
}

/// Races `callers` one-unit reservations from separate instances against a
/// ledger holding `stock` units and returns how many went through.
async fn reserve_one_unit_concurrently(stock: i64, callers: i64) -> i64 {
    let h = TestHarness::new();
    h.instance().engine.set_stock(2001, stock).await.unwrap();

    let mut tasks = Vec::new();
    for order_id in 0..callers {
        let node = h.instance();
        tasks.push(tokio::spawn(async move {
            node.engine.reserve(2001, 1, 8001 + order_id).await
        }));
    }

    let mut succeeded = 0;
    let mut rejected = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(entry) => {
                assert!(entry.is_consistent(), "committed {entry:?}");
                succeeded += 1;
            }
            Err(StockError::InsufficientStock { .. }) => rejected += 1,
            Err(e) => panic!("unexpected reservation failure: {e}"),
        }
    }
    assert_eq!(succeeded + rejected, callers);

    let (total, reserved) = h.ledger(2001).await;
    assert_eq!(reserved, succeeded);
    assert_eq!(total, stock - succeeded);
    assert!(0 <= reserved && reserved <= total, "ledger {total}/{reserved}");
    assert_eq!(h.store.pending_count() as i64, succeeded);
    succeeded
}

// Each unit reserved leaves `total - reserved` two lower, so a ledger of S
// units admits floor(S / 2) one-unit reservations before `reserved` would
// pass `total_stock`.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reservations_lose_no_updates() {
    assert_eq!(reserve_one_unit_concurrently(20, 40).await, 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reservations_with_odd_stock() {
    assert_eq!(reserve_one_unit_concurrently(21, 40).await, 10);
}

#[tokio::test]
async fn test_large_reservation_keeps_reserved_within_total() {
    let h = TestHarness::new();
    let node = h.instance();
    node.engine.set_stock(2001, 100).await.unwrap();

    let err = node.engine.reserve(2001, 60, 1).await.unwrap_err();
    assert!(matches!(err, StockError::InsufficientStock { .. }));
    assert_eq!(h.ledger(2001).await, (100, 0));

    node.engine.reserve(2001, 50, 1).await.unwrap();
    assert_eq!(h.ledger(2001).await, (50, 50));
}

#[tokio::test]
async fn test_single_unit_ledger_admits_no_reservation() {
    let h = TestHarness::new();
    let node = h.instance();
    node.engine.set_stock(1, 1).await.unwrap();

    let err = node.engine.reserve(1, 1, 1).await.unwrap_err();

    assert!(matches!(err, StockError::InsufficientStock { .. }));
    assert_eq!(h.ledger(1).await, (1, 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicate_rollbacks_apply_once() {
    let h = TestHarness::new();
    let node = h.instance();
    node.engine.set_stock(3, 50).await.unwrap();
    node.engine.reserve(3, 10, 77).await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let node = h.instance();
        tasks.push(tokio::spawn(async move {
            node.compensation.rollback(77, 3, 10).await
        }));
    }

    let mut applied = 0;
    for task in tasks {
        if let RollbackOutcome::RolledBack(_) = task.await.unwrap().unwrap() {
            applied += 1;
        }
    }

    assert_eq!(applied, 1);
    assert_eq!(h.ledger(3).await, (50, 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_different_goods_proceed_independently() {
    let h = TestHarness::new();
    let admin = h.instance();
    for goods_id in 1..=4 {
        admin.engine.set_stock(goods_id, 100).await.unwrap();
    }

    let mut tasks = Vec::new();
    for goods_id in 1..=4 {
        for order_id in 0..10 {
            let node = h.instance();
            tasks.push(tokio::spawn(async move {
                node.engine.reserve(goods_id, 2, order_id).await
            }));
        }
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    for goods_id in 1..=4 {
        assert_eq!(h.ledger(goods_id).await, (80, 20));
    }
}

#[tokio::test]
async fn test_random_sequences_keep_ledger_invariant() {
    let h = TestHarness::new();
    let node = h.instance();
    let mut rng = StdRng::seed_from_u64(7);
    node.engine.set_stock(11, 60).await.unwrap();

    let mut open: Vec<(i64, i64)> = Vec::new();
    for order_id in 0..200 {
        if !open.is_empty() && rng.gen_bool(0.4) {
            let (order, num) = open.swap_remove(rng.gen_range(0..open.len()));
            node.compensation.rollback(order, 11, num).await.unwrap();
            // redelivery
            if rng.gen_bool(0.5) {
                node.compensation.rollback(order, 11, num).await.unwrap();
            }
        } else {
            let num = rng.gen_range(1..=6);
            let reservable = h.store.read_one(11).await.unwrap().reservable();
            match node.engine.reserve(11, num, order_id).await {
                Ok(_) => {
                    assert!(num <= reservable);
                    open.push((order_id, num));
                }
                Err(StockError::InsufficientStock { .. }) => assert!(num > reservable),
                Err(e) => panic!("unexpected reservation failure: {e}"),
            }
        }

        let (total, reserved) = h.ledger(11).await;
        assert!(0 <= reserved && reserved <= total, "ledger {total}/{reserved}");
        let held: i64 = open.iter().map(|(_, num)| num).sum();
        assert_eq!(reserved, held);
    }
}

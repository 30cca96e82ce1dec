//! Property-based tests for the book lock manager
//!
//! Random sequences of acquire, extend, release and sweep operations are
//! replayed against a fresh store. After every step the manager must agree
//! with a simple reading of the rules: a grant succeeds exactly when the book
//! had no active lock, an extension succeeds exactly when the lock is active
//! and under the cap, and no book ever shows more than one active lock
//! across all trades.
//!
//! Lock durations are drawn from {0, 1, 48} hours; a zero-hour lock expires
//! on creation, which is how these tests reach the expired branches without
//! waiting on the clock.

use proptest::prelude::*;
use tempfile::tempdir;

use book_exchange::ledger::{Book, NewBook};
use book_exchange::lock::{BookLock, LockManager, LockRequest};
use book_exchange::store::Store;
use book_exchange::{Config, LockError, Marketplace};

const BOOKS: usize = 3;
const TRADES: usize = 4;

#[derive(Debug, Clone)]
enum Op {
    Acquire { book: usize, trade: usize, hours: u32 },
    Extend { book: usize },
    Release { trade: usize },
    Sweep,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..BOOKS, 0..TRADES, prop_oneof![Just(0u32), Just(1u32), Just(48u32)])
            .prop_map(|(book, trade, hours)| Op::Acquire { book, trade, hours }),
        3 => (0..BOOKS).prop_map(|book| Op::Extend { book }),
        2 => (0..TRADES).prop_map(|trade| Op::Release { trade }),
        1 => Just(Op::Sweep),
    ]
}

fn active_locks_on(manager: &LockManager, book_id: &str) -> usize {
    (0..TRADES)
        .flat_map(|t| manager.locks_for_trade(&format!("trade_{t}")).unwrap())
        .filter(|lock| lock.book_id == book_id && lock.is_active())
        .count()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn lock_rules_hold_over_any_sequence(ops in prop::collection::vec(op_strategy(), 1..25)) {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("locks.db")).unwrap();
        let market = Marketplace::new(&Config::default(), store);
        let owner = market.directory.register_user("Owner", "Lisbon").unwrap();
        let books: Vec<Book> = (0..BOOKS)
            .map(|n| market.ledger.add_book(&owner.id, NewBook::inventory(&format!("Title {n}"), "Author")).unwrap())
            .collect();
        let manager = &market.locks;
        let policy = manager.policy();

        for op in ops {
            match op {
                Op::Acquire { book, trade, hours } => {
                    let book_id = &books[book].id;
                    let was_free = manager.active_lock(book_id).unwrap().is_none();
                    let trade_id = format!("trade_{trade}");
                    let result = manager.acquire_lock(&LockRequest {
                        book_id,
                        owner_id: &owner.id,
                        locked_for_user_id: "user_other",
                        chat_id: "chat_1",
                        trade_proposal_id: &trade_id,
                        duration_hours: Some(hours),
                    });
                    match result {
                        Ok(lock) => {
                            prop_assert!(was_free);
                            prop_assert_eq!(lock.extension_history.len(), 0);
                        }
                        Err(LockError::AlreadyLocked { .. }) => prop_assert!(!was_free),
                        Err(other) => prop_assert!(false, "unexpected error {:?}", other),
                    }
                }
                Op::Extend { book } => {
                    let Some(current) = store_lock(manager, &books[book].id) else { continue };
                    let result = manager.extend_lock(&current.id, 24);
                    if !current.is_active() {
                        prop_assert!(matches!(result, Err(LockError::Expired { .. })), "{:?}", result);
                    } else if current.extension_history.len() >= policy.max_extensions {
                        prop_assert!(
                            matches!(result, Err(LockError::MaxExtensionsReached { .. })),
                            "{:?}",
                            result
                        );
                    } else {
                        let extended = result.unwrap();
                        prop_assert_eq!(extended.extension_history.len(), current.extension_history.len() + 1);
                        prop_assert!(extended.expires_at > current.expires_at);
                    }
                }
                Op::Release { trade } => {
                    let trade_id = format!("trade_{trade}");
                    manager.release_locks_for_trade(&trade_id).unwrap();
                    prop_assert!(manager.locks_for_trade(&trade_id).unwrap().is_empty());
                }
                Op::Sweep => {
                    manager.cleanup_expired_locks().unwrap();
                    for b in &books {
                        if let Some(lock) = store_lock(manager, &b.id) {
                            prop_assert!(lock.is_active());
                        }
                    }
                }
            }

            for b in &books {
                prop_assert!(active_locks_on(manager, &b.id) <= 1);
            }
        }
    }
}

/// The stored lock row for a book, active or not.
fn store_lock(manager: &LockManager, book_id: &str) -> Option<BookLock> {
    (0..TRADES)
        .flat_map(|t| manager.locks_for_trade(&format!("trade_{t}")).unwrap())
        .find(|lock| lock.book_id == book_id)
}

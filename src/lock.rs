//! Book lock manager
//!
//! A lock is a time-bounded exclusive claim on a book for one trade proposal.
//! Lock rows are keyed by book id, so a book has at most one row; the row is
//! active while `expires_at > now`. Grants run inside a sled transaction that
//! reads the book and its lock row and writes the new row, which makes the
//! check-then-create step atomic per book.
use serde::Serialize;
use sled::Transactional;
use sled::transaction::TransactionalTree;

use crate::config::LockConfig;
use crate::error::{LockError, StoreError};
use crate::ledger::{Book, abort_with};
use crate::store::{self, Store, TxResult};
use crate::types::{BookId, ChatId, LockId, TimeStamp, TradeId, UserId};
use crate::utils::new_id;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionRecord {
    #[n(0)]
    pub extended_at: TimeStamp,
    #[n(1)]
    pub additional_hours: u32,
    #[n(2)]
    pub previous_expires_at: TimeStamp,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookLock {
    #[n(0)]
    pub id: LockId,
    #[n(1)]
    pub book_id: BookId,
    #[n(2)]
    pub owner_id: UserId,
    #[n(3)]
    pub locked_for_user_id: UserId,
    #[n(4)]
    pub chat_id: ChatId,
    #[n(5)]
    pub trade_proposal_id: TradeId,
    #[n(6)]
    pub duration_hours: u32,
    #[n(7)]
    pub expires_at: TimeStamp,
    #[n(8)]
    pub extension_history: Vec<ExtensionRecord>,
    #[n(9)]
    pub created_at: TimeStamp,
}

impl BookLock {
    pub fn is_active_at(&self, now: TimeStamp) -> bool {
        self.expires_at > now
    }

    pub fn is_active(&self) -> bool {
        self.is_active_at(TimeStamp::new())
    }
}

/// Parameters of a lock grant.
#[derive(Debug, Clone)]
pub struct LockRequest<'a> {
    pub book_id: &'a str,
    pub owner_id: &'a str,
    pub locked_for_user_id: &'a str,
    pub chat_id: &'a str,
    pub trade_proposal_id: &'a str,
    /// Falls back to the configured default when `None`.
    pub duration_hours: Option<u32>,
}

#[derive(Clone)]
pub struct LockManager {
    store: Store,
    policy: LockConfig,
}

impl LockManager {
    pub fn new(store: Store, policy: LockConfig) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> LockConfig {
        self.policy
    }

    /// Grant a lock on one book. Checks, in order: the book exists, is
    /// available, belongs to `owner_id`, and carries no active lock.
    pub fn acquire_lock(&self, request: &LockRequest<'_>) -> Result<BookLock, LockError> {
        let s = &self.store;
        let lock = store::settle((&s.books, &s.locks, &s.lock_ids).transaction(
            |(books, locks, lock_ids)| -> TxResult<BookLock, LockError> {
                acquire_in(books, locks, lock_ids, request, &self.policy, TimeStamp::new())
            },
        ))?;
        tracing::info!(
            lock_id = %lock.id,
            book_id = %lock.book_id,
            trade_id = %lock.trade_proposal_id,
            expires_at = ?lock.expires_at,
            "book locked"
        );
        Ok(lock)
    }

    /// Push a lock's expiry back. Expired locks cannot be revived and each
    /// lock may be extended at most `max_extensions` times.
    pub fn extend_lock(&self, lock_id: &str, additional_hours: u32) -> Result<BookLock, LockError> {
        if additional_hours == 0 {
            return Err(LockError::InvalidExtension);
        }
        let policy = self.policy;
        within_bound(additional_hours, &policy)?;
        let max = self.policy.max_extensions;
        let s = &self.store;
        let lock = store::settle((&s.locks, &s.lock_ids).transaction(
            |(locks, lock_ids)| -> TxResult<BookLock, LockError> {
                let mut lock = lock_in(locks, lock_ids, lock_id)?;
                let now = TimeStamp::new();
                if !lock.is_active_at(now) {
                    return Err(abort_with(LockError::Expired {
                        lock_id: lock_id.to_string(),
                    }));
                }
                if lock.extension_history.len() >= max {
                    return Err(abort_with(LockError::MaxExtensionsReached {
                        lock_id: lock_id.to_string(),
                        max,
                    }));
                }
                let expires_at = expiry(lock.expires_at, additional_hours, &policy).map_err(abort_with)?;
                lock.extension_history.push(ExtensionRecord {
                    extended_at: now,
                    additional_hours,
                    previous_expires_at: lock.expires_at,
                });
                lock.expires_at = expires_at;
                store::tx_put::<_, LockError>(locks, &lock.book_id, &lock)?;
                Ok(lock)
            },
        ))?;
        tracing::info!(
            lock_id = %lock_id,
            extensions = lock.extension_history.len(),
            expires_at = ?lock.expires_at,
            "book lock extended"
        );
        Ok(lock)
    }

    /// Delete every lock held for the trade. Safe to call repeatedly.
    pub fn release_locks_for_trade(&self, trade_id: &str) -> Result<usize, LockError> {
        let held: Vec<BookId> = self
            .locks_for_trade(trade_id)?
            .into_iter()
            .map(|lock| lock.book_id)
            .collect();
        let s = &self.store;
        let released = store::settle((&s.locks, &s.lock_ids).transaction(
            |(locks, lock_ids)| -> TxResult<usize, LockError> {
                release_in(locks, lock_ids, trade_id, &held)
            },
        ))?;
        if released > 0 {
            tracing::info!(trade_id = %trade_id, released, "trade locks released");
        }
        Ok(released)
    }

    /// Whether a new lock on the book would be granted right now: the book
    /// exists, is available, and has no active lock.
    pub fn can_acquire(&self, book_id: &str) -> Result<bool, LockError> {
        let Some(book) = store::get::<Book>(&self.store.books, book_id)? else {
            return Ok(false);
        };
        Ok(book.is_available && self.active_lock(book_id)?.is_none())
    }

    pub fn active_lock(&self, book_id: &str) -> Result<Option<BookLock>, LockError> {
        let lock: Option<BookLock> = store::get(&self.store.locks, book_id)?;
        Ok(lock.filter(BookLock::is_active))
    }

    pub fn get_lock(&self, lock_id: &str) -> Result<Option<BookLock>, LockError> {
        let Some(book_id) = self.store.lock_ids.get(lock_id.as_bytes())? else {
            return Ok(None);
        };
        let book_id = String::from_utf8_lossy(&book_id).into_owned();
        let lock: Option<BookLock> = store::get(&self.store.locks, &book_id)?;
        Ok(lock.filter(|lock| lock.id == lock_id))
    }

    /// Every lock row held for the trade, expired ones included until swept.
    pub fn locks_for_trade(&self, trade_id: &str) -> Result<Vec<BookLock>, LockError> {
        let mut locks: Vec<BookLock> = store::scan(&self.store.locks, "")?;
        locks.retain(|lock| lock.trade_proposal_id == trade_id);
        locks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(locks)
    }

    /// Active locks on books the user owns, soonest expiry first.
    pub fn user_book_locks(&self, user_id: &str) -> Result<Vec<BookLock>, LockError> {
        let now = TimeStamp::new();
        let mut locks: Vec<BookLock> = store::scan(&self.store.locks, "")?;
        locks.retain(|lock| lock.owner_id == user_id && lock.is_active_at(now));
        locks.sort_by(|a, b| a.expires_at.cmp(&b.expires_at));
        Ok(locks)
    }

    /// Delete every lock whose expiry has passed; returns how many went.
    pub fn cleanup_expired_locks(&self) -> Result<usize, LockError> {
        let now = TimeStamp::new();
        let expired: Vec<BookLock> = store::scan::<BookLock>(&self.store.locks, "")?
            .into_iter()
            .filter(|lock| !lock.is_active_at(now))
            .collect();

        let mut removed = 0;
        for stale in expired {
            let s = &self.store;
            // the row may have been replaced or extended since the scan
            let gone = store::settle((&s.locks, &s.lock_ids).transaction(
                |(locks, lock_ids)| -> TxResult<bool, LockError> {
                    match store::tx_get::<BookLock, LockError>(locks, &stale.book_id)? {
                        Some(current) if current.id == stale.id && !current.is_active_at(now) => {
                            locks.remove(current.book_id.as_bytes())?;
                            lock_ids.remove(current.id.as_bytes())?;
                            Ok(true)
                        }
                        _ => Ok(false),
                    }
                },
            ))?;
            if gone {
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, "expired book locks swept");
        }
        Ok(removed)
    }
}

/// Grant a lock inside a caller's transaction over the books, locks and
/// lock id trees. Aborts with the first failed precondition.
pub(crate) fn acquire_in<E>(
    books: &TransactionalTree,
    locks: &TransactionalTree,
    lock_ids: &TransactionalTree,
    request: &LockRequest<'_>,
    policy: &LockConfig,
    now: TimeStamp,
) -> TxResult<BookLock, E>
where
    E: From<LockError> + From<StoreError>,
{
    let book_id = request.book_id;
    let book = store::tx_get::<Book, E>(books, book_id)?.ok_or_else(|| {
        abort_with(E::from(LockError::NotFound {
            entity: "book",
            id: book_id.to_string(),
        }))
    })?;
    if !book.is_available {
        return Err(abort_with(E::from(LockError::BookUnavailable {
            book_id: book_id.to_string(),
        })));
    }
    if book.owner_id != request.owner_id {
        return Err(abort_with(E::from(LockError::NotOwner {
            book_id: book_id.to_string(),
            owner_id: request.owner_id.to_string(),
        })));
    }
    if let Some(existing) = store::tx_get::<BookLock, E>(locks, book_id)? {
        if existing.is_active_at(now) {
            return Err(abort_with(E::from(LockError::AlreadyLocked {
                book_id: book_id.to_string(),
                expires_at: existing.expires_at,
            })));
        }
        lock_ids.remove(existing.id.as_bytes())?;
    }

    let duration_hours = request
        .duration_hours
        .unwrap_or(policy.default_duration_hours);
    let expires_at = expiry(now, duration_hours, policy).map_err(|err| abort_with(E::from(err)))?;
    let lock = BookLock {
        id: new_id("lock_"),
        book_id: book_id.to_string(),
        owner_id: request.owner_id.to_string(),
        locked_for_user_id: request.locked_for_user_id.to_string(),
        chat_id: request.chat_id.to_string(),
        trade_proposal_id: request.trade_proposal_id.to_string(),
        duration_hours,
        expires_at,
        extension_history: Vec::new(),
        created_at: now,
    };
    store::tx_put::<_, E>(locks, book_id, &lock)?;
    lock_ids.insert(lock.id.as_bytes(), book_id.as_bytes())?;
    Ok(lock)
}

fn within_bound(hours: u32, policy: &LockConfig) -> Result<(), LockError> {
    if hours > policy.max_duration_hours {
        return Err(LockError::InvalidDuration {
            hours,
            max: policy.max_duration_hours,
        });
    }
    Ok(())
}

/// `from + hours`, refusing anything over the policy bound or past the
/// range a stored timestamp can hold.
fn expiry(from: TimeStamp, hours: u32, policy: &LockConfig) -> Result<TimeStamp, LockError> {
    within_bound(hours, policy)?;
    from.checked_plus_hours(hours).ok_or(LockError::InvalidDuration {
        hours,
        max: policy.max_duration_hours,
    })
}

/// Remove the trade's locks on the given books inside a caller's
/// transaction. Rows on those books held by other trades are left alone.
pub(crate) fn release_in<E>(
    locks: &TransactionalTree,
    lock_ids: &TransactionalTree,
    trade_id: &str,
    book_ids: &[BookId],
) -> TxResult<usize, E>
where
    E: From<StoreError>,
{
    let mut released = 0;
    for book_id in book_ids {
        if let Some(lock) = store::tx_get::<BookLock, E>(locks, book_id)? {
            if lock.trade_proposal_id == trade_id {
                locks.remove(book_id.as_bytes())?;
                lock_ids.remove(lock.id.as_bytes())?;
                released += 1;
            }
        }
    }
    Ok(released)
}

/// Remove whatever lock row sits on each book, whichever trade holds it.
/// Used once the books have changed hands.
pub(crate) fn clear_in<E>(locks: &TransactionalTree, lock_ids: &TransactionalTree, book_ids: &[BookId]) -> TxResult<usize, E>
where
    E: From<StoreError>,
{
    let mut cleared = 0;
    for book_id in book_ids {
        if let Some(lock) = store::tx_get::<BookLock, E>(locks, book_id)? {
            locks.remove(book_id.as_bytes())?;
            lock_ids.remove(lock.id.as_bytes())?;
            cleared += 1;
        }
    }
    Ok(cleared)
}

/// Look a lock up by id inside a transaction.
pub(crate) fn lock_in<E>(locks: &TransactionalTree, lock_ids: &TransactionalTree, lock_id: &str) -> TxResult<BookLock, E>
where
    E: From<LockError> + From<StoreError>,
{
    let not_found = || {
        abort_with(E::from(LockError::NotFound {
            entity: "lock",
            id: lock_id.to_string(),
        }))
    };
    let book_id = lock_ids.get(lock_id.as_bytes())?.ok_or_else(not_found)?;
    let book_id = String::from_utf8_lossy(&book_id).into_owned();
    store::tx_get::<BookLock, E>(locks, &book_id)?
        .filter(|lock| lock.id == lock_id)
        .ok_or_else(not_found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::Scope;
    use crate::store::tests::temp_store;
    use crate::types::{Condition, ListType};

    fn seed_book(store: &Store, owner: &str, available: bool) -> Book {
        let book = Book {
            id: new_id("book_"),
            owner_id: owner.into(),
            title: "Dune".into(),
            author: "Herbert".into(),
            isbn: None,
            condition: Condition::Good,
            description: String::new(),
            list_type: ListType::Inventory,
            is_available: available,
            scope: Scope::Global,
            created_at: TimeStamp::new(),
        };
        store::put(&store.books, &book.id, &book).unwrap();
        book
    }

    fn request<'a>(book: &'a Book, trade: &'a str, hours: Option<u32>) -> LockRequest<'a> {
        LockRequest {
            book_id: &book.id,
            owner_id: &book.owner_id,
            locked_for_user_id: "user_b",
            chat_id: "chat_1",
            trade_proposal_id: trade,
            duration_hours: hours,
        }
    }

    #[test]
    fn default_duration_is_applied() {
        let (_dir, store) = temp_store();
        let manager = LockManager::new(store.clone(), LockConfig::default());
        let book = seed_book(&store, "user_a", true);

        let lock = manager.acquire_lock(&request(&book, "trade_1", None)).unwrap();

        let hours = (lock.expires_at.to_datetime_utc() - lock.created_at.to_datetime_utc()).num_hours();
        assert_eq!(hours, 48);
        assert_eq!(lock.duration_hours, 48);
        assert!(!manager.can_acquire(&book.id).unwrap());
    }

    #[test]
    fn preconditions_are_checked_in_order() {
        let (_dir, store) = temp_store();
        let manager = LockManager::new(store.clone(), LockConfig::default());
        let unavailable = seed_book(&store, "user_a", false);

        let mut wrong_owner = request(&unavailable, "trade_1", None);
        wrong_owner.owner_id = "user_z";
        // unavailability is reported before ownership
        assert!(matches!(
            manager.acquire_lock(&wrong_owner),
            Err(LockError::BookUnavailable { .. })
        ));

        let book = seed_book(&store, "user_a", true);
        let mut wrong_owner = request(&book, "trade_1", None);
        wrong_owner.owner_id = "user_z";
        assert!(matches!(
            manager.acquire_lock(&wrong_owner),
            Err(LockError::NotOwner { .. })
        ));

        let mut missing = request(&book, "trade_1", None);
        missing.book_id = "book_missing";
        assert!(matches!(
            manager.acquire_lock(&missing),
            Err(LockError::NotFound { entity: "book", .. })
        ));
        assert!(manager.locks_for_trade("trade_1").unwrap().is_empty());
    }

    #[test]
    fn expired_lock_is_replaced_by_new_grant() {
        let (_dir, store) = temp_store();
        let manager = LockManager::new(store.clone(), LockConfig::default());
        let book = seed_book(&store, "user_a", true);

        let stale = manager.acquire_lock(&request(&book, "trade_1", Some(0))).unwrap();
        assert!(manager.can_acquire(&book.id).unwrap());

        let fresh = manager.acquire_lock(&request(&book, "trade_2", None)).unwrap();

        assert!(manager.get_lock(&stale.id).unwrap().is_none());
        assert_eq!(manager.active_lock(&book.id).unwrap().map(|l| l.id), Some(fresh.id));
    }

    #[test]
    fn release_leaves_other_trades_alone() {
        let (_dir, store) = temp_store();
        let manager = LockManager::new(store.clone(), LockConfig::default());
        let first = seed_book(&store, "user_a", true);
        let second = seed_book(&store, "user_a", true);
        manager.acquire_lock(&request(&first, "trade_1", None)).unwrap();
        manager.acquire_lock(&request(&second, "trade_2", None)).unwrap();

        assert_eq!(manager.release_locks_for_trade("trade_1").unwrap(), 1);
        assert_eq!(manager.release_locks_for_trade("trade_1").unwrap(), 0);
        assert!(manager.active_lock(&first.id).unwrap().is_none());
        assert!(manager.active_lock(&second.id).unwrap().is_some());
    }

    #[test]
    fn expired_lock_cannot_be_extended_and_is_swept() {
        let (_dir, store) = temp_store();
        let manager = LockManager::new(store.clone(), LockConfig::default());
        let book = seed_book(&store, "user_a", true);
        let lock = manager.acquire_lock(&request(&book, "trade_1", Some(0))).unwrap();

        assert!(matches!(
            manager.extend_lock(&lock.id, 24),
            Err(LockError::Expired { .. })
        ));
        assert_eq!(manager.cleanup_expired_locks().unwrap(), 1);
        assert!(manager.get_lock(&lock.id).unwrap().is_none());
        assert_eq!(manager.cleanup_expired_locks().unwrap(), 0);
    }

    #[test]
    fn zero_hour_extension_is_rejected() {
        let (_dir, store) = temp_store();
        let manager = LockManager::new(store.clone(), LockConfig::default());
        let book = seed_book(&store, "user_a", true);
        let lock = manager.acquire_lock(&request(&book, "trade_1", None)).unwrap();

        assert!(matches!(
            manager.extend_lock(&lock.id, 0),
            Err(LockError::InvalidExtension)
        ));
    }

    #[test]
    fn durations_are_bounded_by_policy() {
        let (_dir, store) = temp_store();
        let policy = LockConfig::default();
        let manager = LockManager::new(store.clone(), policy);
        let book = seed_book(&store, "user_a", true);

        for hours in [policy.max_duration_hours + 1, 3_000_000, u32::MAX] {
            assert!(matches!(
                manager.acquire_lock(&request(&book, "trade_1", Some(hours))),
                Err(LockError::InvalidDuration { .. })
            ));
        }
        assert!(manager.locks_for_trade("trade_1").unwrap().is_empty());

        let lock = manager
            .acquire_lock(&request(&book, "trade_1", Some(policy.max_duration_hours)))
            .unwrap();
        assert!(matches!(
            manager.extend_lock(&lock.id, u32::MAX),
            Err(LockError::InvalidDuration { .. })
        ));
        let extended = manager.extend_lock(&lock.id, policy.max_duration_hours).unwrap();
        assert_eq!(extended.extension_history.len(), 1);
    }
}

//! Book ledger
//!
//! Owns the book records. Every mutation that can change what a user offers
//! or wants ends by handing the affected user to the [`Invalidator`], the one
//! place where the derived match view is refreshed.
use serde::{Deserialize, Serialize};
use sled::Transactional;

use crate::config::RecomputeMode;
use crate::directory::User;
use crate::error::{Result, TradeError};
use crate::lock::BookLock;
use crate::matching::MatchEngine;
use crate::scope::Scope;
use crate::store::{self, Store, TxResult};
use crate::types::{BookId, Condition, ListType, TimeStamp, UserId};
use crate::utils::new_id;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Book {
    #[n(0)]
    pub id: BookId,
    #[n(1)]
    pub owner_id: UserId,
    #[n(2)]
    pub title: String,
    #[n(3)]
    pub author: String,
    #[n(4)]
    pub isbn: Option<String>,
    #[n(5)]
    pub condition: Condition,
    #[n(6)]
    pub description: String,
    #[n(7)]
    pub list_type: ListType,
    #[n(8)]
    pub is_available: bool,
    #[n(9)]
    pub scope: Scope,
    #[n(10)]
    pub created_at: TimeStamp,
}

impl Book {
    /// ISBN equality when both sides carry one, otherwise a case-insensitive
    /// (title, author) comparison. Scope is not considered here.
    pub fn same_work(&self, other: &Book) -> bool {
        if let (Some(a), Some(b)) = (self.isbn.as_deref(), other.isbn.as_deref()) {
            if a == b {
                return true;
            }
        }
        self.title.to_lowercase() == other.title.to_lowercase()
            && self.author.to_lowercase() == other.author.to_lowercase()
    }
}

/// Input for a new ledger entry.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewBook {
    pub title: String,
    pub author: String,
    #[serde(default)]
    pub isbn: Option<String>,
    #[serde(default)]
    pub condition: Condition,
    #[serde(default)]
    pub description: String,
    pub list_type: Option<ListType>,
    #[serde(default)]
    pub room_id: Option<String>,
}

impl NewBook {
    pub fn inventory(title: &str, author: &str) -> Self {
        Self {
            title: title.into(),
            author: author.into(),
            list_type: Some(ListType::Inventory),
            ..Self::default()
        }
    }
    pub fn wishlist(title: &str, author: &str) -> Self {
        Self {
            title: title.into(),
            author: author.into(),
            list_type: Some(ListType::Wishlist),
            ..Self::default()
        }
    }
    pub fn with_isbn(mut self, isbn: &str) -> Self {
        self.isbn = Some(isbn.into());
        self
    }
    pub fn in_room(mut self, room_id: &str) -> Self {
        self.room_id = Some(room_id.into());
        self
    }
}

/// Refreshes a user's matches after something they own or want changed.
///
/// Failures are logged and swallowed: the ledger write that triggered the
/// refresh has already committed and the next mutation triggers another.
#[derive(Clone)]
pub struct Invalidator {
    engine: MatchEngine,
    mode: RecomputeMode,
}

impl Invalidator {
    pub fn new(engine: MatchEngine, mode: RecomputeMode) -> Self {
        Self { engine, mode }
    }

    pub fn invalidate(&self, user_id: &str) {
        match self.mode {
            RecomputeMode::Inline => refresh(&self.engine, user_id),
            RecomputeMode::Background => {
                let engine = self.engine.clone();
                let user_id = user_id.to_string();
                std::thread::spawn(move || refresh(&engine, &user_id));
            }
        }
    }
}

fn refresh(engine: &MatchEngine, user_id: &str) {
    if let Err(err) = engine.recompute_matches(user_id) {
        tracing::warn!(user_id = %user_id, error = %err, "match recompute failed");
    }
}

#[derive(Clone)]
pub struct BookLedger {
    store: Store,
    invalidator: Invalidator,
}

impl BookLedger {
    pub fn new(store: Store, invalidator: Invalidator) -> Self {
        Self { store, invalidator }
    }

    pub fn add_book(&self, owner_id: &str, new_book: NewBook) -> Result<Book> {
        if store::get::<User>(&self.store.users, owner_id)?.is_none() {
            return Err(TradeError::not_found("user", owner_id));
        }
        let title = new_book.title.trim();
        let author = new_book.author.trim();
        if title.is_empty() || author.is_empty() {
            return Err(TradeError::ValidationFailed(
                "title and author are required".into(),
            ));
        }
        let list_type = new_book.list_type.ok_or_else(|| {
            TradeError::ValidationFailed("listType must be inventory or wishlist".into())
        })?;

        let book = Book {
            id: new_id("book_"),
            owner_id: owner_id.to_string(),
            title: title.to_string(),
            author: author.to_string(),
            isbn: new_book
                .isbn
                .map(|isbn| isbn.trim().to_string())
                .filter(|isbn| !isbn.is_empty()),
            condition: new_book.condition,
            description: new_book.description,
            list_type,
            is_available: true,
            scope: Scope::from_room_id(new_book.room_id.as_deref()),
            created_at: TimeStamp::new(),
        };
        store::put(&self.store.books, &book.id, &book)?;
        tracing::info!(book_id = %book.id, owner_id = %owner_id, list_type = ?list_type, "book added");

        self.invalidator.invalidate(owner_id);
        Ok(book)
    }

    /// Removes a book. A book with an active lock is claimed by a pending
    /// trade and cannot be removed until that lock is released or expires.
    pub fn remove_book(&self, actor_id: &str, book_id: &str) -> Result<Book> {
        let now = TimeStamp::new();
        let removed = store::settle((&self.store.books, &self.store.locks).transaction(
            |(books, locks)| -> TxResult<Book> {
                let book = store::tx_get::<Book, TradeError>(books, book_id)?
                    .ok_or_else(|| abort_with(TradeError::not_found("book", book_id)))?;
                if book.owner_id != actor_id {
                    return Err(abort_with(TradeError::Forbidden(format!(
                        "book {book_id} belongs to another user"
                    ))));
                }
                let lock = store::tx_get::<BookLock, TradeError>(locks, book_id)?;
                if let Some(lock) = lock.filter(|lock| lock.is_active_at(now)) {
                    return Err(abort_with(TradeError::Conflict {
                        book_id: book_id.to_string(),
                        expires_at: Some(lock.expires_at),
                    }));
                }
                books.remove(book_id.as_bytes())?;
                Ok(book)
            },
        ))?;
        tracing::info!(book_id = %book_id, "book removed");

        self.invalidator.invalidate(actor_id);
        Ok(removed)
    }

    pub fn set_availability(&self, actor_id: &str, book_id: &str, is_available: bool) -> Result<Book> {
        let book = self.update_owned(actor_id, book_id, |book| book.is_available = is_available)?;
        tracing::info!(book_id = %book_id, is_available, "book availability changed");

        self.invalidator.invalidate(actor_id);
        Ok(book)
    }

    pub fn set_scope(&self, actor_id: &str, book_id: &str, scope: Scope) -> Result<Book> {
        let book = self.update_owned(actor_id, book_id, |book| book.scope = scope.clone())?;
        tracing::info!(book_id = %book_id, scope = ?book.scope, "book scope changed");

        self.invalidator.invalidate(actor_id);
        Ok(book)
    }

    pub fn get_book(&self, book_id: &str) -> Result<Option<Book>> {
        Ok(store::get(&self.store.books, book_id)?)
    }

    pub fn require_book(&self, book_id: &str) -> Result<Book> {
        self.get_book(book_id)?
            .ok_or_else(|| TradeError::not_found("book", book_id))
    }

    pub fn books_of(&self, user_id: &str, list_type: Option<ListType>) -> Result<Vec<Book>> {
        let mut books: Vec<Book> = store::scan(&self.store.books, "")?;
        books.retain(|b| b.owner_id == user_id && list_type.is_none_or(|t| b.list_type == t));
        books.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(books)
    }

    fn update_owned(&self, actor_id: &str, book_id: &str, apply: impl Fn(&mut Book)) -> Result<Book> {
        store::settle(self.store.books.transaction(|books| -> TxResult<Book> {
            let mut book = store::tx_get::<Book, TradeError>(books, book_id)?
                .ok_or_else(|| abort_with(TradeError::not_found("book", book_id)))?;
            if book.owner_id != actor_id {
                return Err(abort_with(TradeError::Forbidden(format!(
                    "book {book_id} belongs to another user"
                ))));
            }
            apply(&mut book);
            store::tx_put::<_, TradeError>(books, book_id, &book)?;
            Ok(book)
        }))
    }
}

pub(crate) fn abort_with<E>(err: E) -> sled::transaction::ConflictableTransactionError<E> {
    sled::transaction::ConflictableTransactionError::Abort(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book(title: &str, author: &str, isbn: Option<&str>) -> Book {
        Book {
            id: new_id("book_"),
            owner_id: "user_a".into(),
            title: title.into(),
            author: author.into(),
            isbn: isbn.map(Into::into),
            condition: Condition::Good,
            description: String::new(),
            list_type: ListType::Inventory,
            is_available: true,
            scope: Scope::Global,
            created_at: TimeStamp::new(),
        }
    }

    #[test]
    fn title_and_author_compare_case_insensitively() {
        let a = book("Dune", "Frank Herbert", None);
        let b = book("DUNE", "frank herbert", None);
        assert!(a.same_work(&b));
    }

    #[test]
    fn matching_isbn_wins_over_differing_titles() {
        let a = book("Dune", "Herbert", Some("9780441013593"));
        let b = book("Dune (Deluxe)", "F. Herbert", Some("9780441013593"));
        assert!(a.same_work(&b));
    }

    #[test]
    fn differing_isbn_falls_back_to_title_author() {
        let a = book("Dune", "Herbert", Some("1"));
        let b = book("Dune", "Herbert", Some("2"));
        let c = book("Emma", "Austen", Some("3"));
        assert!(a.same_work(&b));
        assert!(!a.same_work(&c));
    }
}

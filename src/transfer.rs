//! Book transfer engine
//!
//! Executes the ownership swap of an accepted trade. Re-validation, owner
//! reassignment, audit rows, lock release and the trade's completion are one
//! sled transaction over five trees: it commits whole or not at all.
use serde::Serialize;
use sled::Transactional;
use sled::transaction::TransactionalTree;

use crate::error::{Result, StoreError, TradeError};
use crate::ledger::{Book, abort_with};
use crate::lock::{self, BookLock};
use crate::store::{self, Store, TxResult};
use crate::trade::{Trade, TradeEventKind, TradeStatus};
use crate::types::{BookId, TimeStamp, TradeId, UserId};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    #[n(0)]
    TradeCompleted,
}

/// Which side of the trade a book travelled on.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferLeg {
    #[n(0)]
    Offered,
    #[n(1)]
    Requested,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditMetadata {
    #[n(0)]
    pub leg: TransferLeg,
    #[n(1)]
    pub title: String,
    #[n(2)]
    pub author: String,
}

/// Append-only record of one book changing hands.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookAuditLog {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub book_id: BookId,
    #[n(2)]
    pub from_user_id: UserId,
    #[n(3)]
    pub to_user_id: UserId,
    #[n(4)]
    pub trade_id: TradeId,
    #[n(5)]
    pub action: AuditAction,
    #[n(6)]
    pub metadata: AuditMetadata,
    #[n(7)]
    pub created_at: TimeStamp,
}

impl BookAuditLog {
    fn new(book: &Book, to_user_id: &str, trade_id: &str, leg: TransferLeg, created_at: TimeStamp) -> Self {
        Self {
            id: String::new(),
            book_id: book.id.clone(),
            from_user_id: book.owner_id.clone(),
            to_user_id: to_user_id.to_string(),
            trade_id: trade_id.to_string(),
            action: AuditAction::TradeCompleted,
            metadata: AuditMetadata {
                leg,
                title: book.title.clone(),
                author: book.author.clone(),
            },
            created_at,
        }
    }

    /// Fix the id to the digest of the entry's encoding and return the
    /// stored bytes.
    pub fn seal(&mut self) -> std::result::Result<Vec<u8>, StoreError> {
        self.id.clear();
        let body = store::encode(&*self)?;
        self.id = sha256::digest(&body);
        store::encode(&*self)
    }
}

#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub trade_id: TradeId,
    pub offered_books: Vec<BookId>,
    pub requested_books: Vec<BookId>,
    pub proposer_id: UserId,
    pub recipient_id: UserId,
}

impl TransferRequest {
    pub fn for_trade(trade: &Trade) -> Self {
        Self {
            trade_id: trade.id.clone(),
            offered_books: trade.books_offered.clone(),
            requested_books: trade.books_requested.clone(),
            proposer_id: trade.proposer_id.clone(),
            recipient_id: trade.recipient_id().to_string(),
        }
    }

    /// Whether the request still describes the trade as stored.
    fn describes(&self, trade: &Trade) -> bool {
        self.trade_id == trade.id
            && self.proposer_id == trade.proposer_id
            && self.recipient_id == trade.recipient_id()
            && self.offered_books == trade.books_offered
            && self.requested_books == trade.books_requested
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferSummary {
    pub trade: Trade,
    /// Offered books, now owned by the recipient.
    pub to_recipient: Vec<Book>,
    /// Requested books, now owned by the proposer.
    pub to_proposer: Vec<Book>,
    pub audit_log_ids: Vec<String>,
}

#[derive(Clone)]
pub struct TransferEngine {
    store: Store,
}

impl TransferEngine {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Swap ownership of the trade's books. `actor_id` must be the trade's
    /// recipient and is recorded on the completion event.
    pub fn transfer_books(&self, request: &TransferRequest, actor_id: &str) -> Result<TransferSummary> {
        self.apply(request, actor_id, |_| Ok(()))
    }

    /// Run the transfer; `before_commit` sees the finished summary and can
    /// still abort the whole transaction.
    fn apply(
        &self,
        request: &TransferRequest,
        actor_id: &str,
        before_commit: impl Fn(&TransferSummary) -> Result<()>,
    ) -> Result<TransferSummary> {
        let s = &self.store;
        let outcome = store::settle(
            (&s.books, &s.locks, &s.lock_ids, &s.trades, &s.audit).transaction(
                |(books, locks, lock_ids, trades, audit)| -> TxResult<TransferSummary> {
                    let summary = transfer_in(books, locks, lock_ids, trades, audit, request, actor_id)?;
                    before_commit(&summary).map_err(abort_with)?;
                    Ok(summary)
                },
            ),
        );

        match outcome {
            Ok(summary) => {
                tracing::info!(
                    trade_id = %request.trade_id,
                    to_recipient = summary.to_recipient.len(),
                    to_proposer = summary.to_proposer.len(),
                    "books transferred"
                );
                Ok(summary)
            }
            Err(TradeError::Store(err)) => {
                tracing::error!(trade_id = %request.trade_id, error = %err, "transfer rolled back");
                Err(TradeError::TransferFailed {
                    trade_id: request.trade_id.clone(),
                })
            }
            Err(err) => {
                tracing::warn!(trade_id = %request.trade_id, error = %err, "transfer refused");
                Err(err)
            }
        }
    }

    /// Audit rows for one book, newest first.
    pub fn book_audit_history(&self, book_id: &str) -> Result<Vec<BookAuditLog>> {
        self.audit_where(|entry| entry.book_id == book_id)
    }

    pub fn trade_audit_history(&self, trade_id: &str) -> Result<Vec<BookAuditLog>> {
        self.audit_where(|entry| entry.trade_id == trade_id)
    }

    fn audit_where(&self, keep: impl Fn(&BookAuditLog) -> bool) -> Result<Vec<BookAuditLog>> {
        let mut entries: Vec<BookAuditLog> = store::scan(&self.store.audit, "")?;
        entries.retain(|entry| keep(entry));
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(entries)
    }
}

fn load_leg(
    books: &TransactionalTree,
    locks: &TransactionalTree,
    book_ids: &[BookId],
    owner_id: &str,
    held_for: Option<&str>,
    now: TimeStamp,
) -> TxResult<Vec<Book>> {
    let mut loaded = Vec::with_capacity(book_ids.len());
    for book_id in book_ids {
        let book = store::tx_get::<Book, TradeError>(books, book_id)?
            .ok_or_else(|| abort_with(TradeError::not_found("book", book_id.as_str())))?;
        if book.owner_id != owner_id {
            return Err(abort_with(TradeError::ValidationFailed(format!(
                "book {book_id} is no longer owned by {owner_id}"
            ))));
        }
        if !book.is_available {
            return Err(abort_with(TradeError::ValidationFailed(format!(
                "book {book_id} is no longer available"
            ))));
        }
        // requested books must not be claimed by a competing trade; offered
        // books leave their owner, so any claim on them is dropped with the move
        if let Some(trade_id) = held_for {
            let lock = store::tx_get::<BookLock, TradeError>(locks, book_id)?;
            if let Some(lock) = lock.filter(|l| l.is_active_at(now) && l.trade_proposal_id != trade_id) {
                return Err(abort_with(TradeError::ValidationFailed(format!(
                    "book {book_id} is locked by trade {}",
                    lock.trade_proposal_id
                ))));
            }
        }
        loaded.push(book);
    }
    Ok(loaded)
}

fn transfer_in(
    books: &TransactionalTree,
    locks: &TransactionalTree,
    lock_ids: &TransactionalTree,
    trades: &TransactionalTree,
    audit: &TransactionalTree,
    request: &TransferRequest,
    actor_id: &str,
) -> TxResult<TransferSummary> {
    let trade_id = request.trade_id.as_str();
    let mut trade = store::tx_get::<Trade, TradeError>(trades, trade_id)?
        .ok_or_else(|| abort_with(TradeError::not_found("trade", trade_id)))?;
    trade.ensure_pending().map_err(abort_with)?;
    if !request.describes(&trade) {
        return Err(abort_with(TradeError::InvalidState(format!(
            "trade {trade_id} was changed after it was read; review the current proposal"
        ))));
    }
    trade.ensure_responder(actor_id, "accept").map_err(abort_with)?;

    let now = TimeStamp::new();
    let offered = load_leg(books, locks, &trade.books_offered, &trade.proposer_id, None, now)?;
    let requested = load_leg(
        books,
        locks,
        &trade.books_requested,
        trade.recipient_id(),
        Some(trade_id),
        now,
    )?;

    let mut audit_log_ids = Vec::with_capacity(offered.len() + requested.len());
    let recipient_id = trade.recipient_id().to_string();
    let legs = [
        (offered, recipient_id.as_str(), TransferLeg::Offered),
        (requested, trade.proposer_id.as_str(), TransferLeg::Requested),
    ];
    let mut moved: Vec<Vec<Book>> = Vec::with_capacity(2);
    for (leg_books, to_user_id, leg) in legs {
        let mut leg_moved = Vec::with_capacity(leg_books.len());
        for mut book in leg_books {
            let mut entry = BookAuditLog::new(&book, to_user_id, trade_id, leg, now);
            let bytes = entry.seal().map_err(store::abort::<TradeError>)?;
            audit.insert(entry.id.as_bytes(), bytes)?;
            audit_log_ids.push(entry.id);

            book.owner_id = to_user_id.to_string();
            book.is_available = true;
            store::tx_put::<_, TradeError>(books, &book.id, &book)?;
            leg_moved.push(book);
        }
        moved.push(leg_moved);
    }

    let moved_ids: Vec<BookId> = moved.iter().flatten().map(|book| book.id.clone()).collect();
    lock::clear_in::<TradeError>(locks, lock_ids, &moved_ids)?;

    trade.close(actor_id, TradeStatus::Completed, TradeEventKind::Completed);
    store::tx_put::<_, TradeError>(trades, trade_id, &trade)?;

    let to_proposer = moved.pop().unwrap_or_default();
    let to_recipient = moved.pop().unwrap_or_default();
    Ok(TransferSummary {
        trade,
        to_recipient,
        to_proposer,
        audit_log_ids,
    })
}

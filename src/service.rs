//! Service layer for the trade negotiation workflow
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sled::Transactional;
use sled::transaction::TransactionalTree;

use crate::config::LockConfig;
use crate::directory::Directory;
use crate::error::{Result, TradeError};
use crate::ledger::{Book, Invalidator, abort_with};
use crate::lock::{self, BookLock, LockManager, LockRequest};
use crate::matching::MatchEngine;
use crate::store::{self, Store, TxResult};
use crate::trade::{BookInterest, Trade, TradeEventKind, TradeStatus, validate_book_sets};
use crate::transfer::{TransferEngine, TransferRequest, TransferSummary};
use crate::types::{BookId, LockId, TimeStamp};
use crate::utils::new_id;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProposal {
    pub match_id: String,
    #[serde(default)]
    pub books_offered: Vec<BookId>,
    #[serde(default)]
    pub books_requested: Vec<BookId>,
    #[serde(default)]
    pub lock_duration_hours: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterProposal {
    #[serde(default)]
    pub books_offered: Vec<BookId>,
    #[serde(default)]
    pub books_requested: Vec<BookId>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalOutcome {
    pub trade: Trade,
    pub locks: Vec<BookLock>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionFailure {
    pub lock_id: LockId,
    pub book_id: BookId,
    pub reason: String,
}

/// Per-lock outcome of extending a trade's locks.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionReport {
    pub trade_id: String,
    pub extended: Vec<BookLock>,
    pub failed: Vec<ExtensionFailure>,
}

pub struct TradeService {
    store: Store,
    directory: Directory,
    matches: MatchEngine,
    locks: LockManager,
    transfers: TransferEngine,
    invalidator: Invalidator,
}

impl TradeService {
    pub fn new(
        store: Store,
        directory: Directory,
        matches: MatchEngine,
        locks: LockManager,
        transfers: TransferEngine,
        invalidator: Invalidator,
    ) -> Self {
        Self {
            store,
            directory,
            matches,
            locks,
            transfers,
            invalidator,
        }
    }

    fn load_trade(&self, trade_id: &str) -> Result<Trade> {
        store::get(&self.store.trades, trade_id)?
            .ok_or_else(|| TradeError::not_found("trade", trade_id))
    }

    /// Propose a trade to the counterparty of one of the proposer's matches.
    ///
    /// Every requested book is checked with `can_acquire` first so a busy book
    /// is reported before anything is written. The trade row, its locks and
    /// the interest rows are then written in one transaction; a lock that
    /// cannot be granted aborts all of it.
    pub fn create_trade_proposal(&self, proposer_id: &str, proposal: NewProposal) -> Result<ProposalOutcome> {
        validate_book_sets(&proposal.books_offered, &proposal.books_requested)?;

        let found = self
            .matches
            .get_match(proposer_id, &proposal.match_id)?
            .ok_or_else(|| TradeError::not_found("match", proposal.match_id.as_str()))?;
        let recipient_id = found.counterparty_user_id;
        let chat = self
            .directory
            .find_chat_between(proposer_id, &recipient_id)?
            .ok_or_else(|| TradeError::not_found("chat", format!("{proposer_id}/{recipient_id}")))?;

        for book_id in &proposal.books_requested {
            if !self.locks.can_acquire(book_id)? {
                return Err(self.unavailable_for_lock(book_id)?);
            }
        }

        let trade_id = new_id("trade_");
        let policy = self.locks.policy();
        let s = &self.store;
        let outcome = store::settle(
            (&s.books, &s.locks, &s.lock_ids, &s.trades, &s.interests).transaction(
                |(books, locks, lock_ids, trades, interests)| -> TxResult<ProposalOutcome> {
                    ensure_offerable(books, &proposal.books_offered, proposer_id)?;
                    let trade = Trade::propose(
                        trade_id.clone(),
                        proposer_id,
                        &recipient_id,
                        &chat.id,
                        proposal.books_offered.clone(),
                        proposal.books_requested.clone(),
                    );
                    let locks = claim_requested(
                        (books, locks, lock_ids, interests),
                        &trade,
                        proposal.lock_duration_hours,
                        &policy,
                    )?;
                    store::tx_put::<_, TradeError>(trades, &trade.id, &trade)?;
                    Ok(ProposalOutcome { trade, locks })
                },
            ),
        )?;

        tracing::info!(
            trade_id = %outcome.trade.id,
            proposer_id = %proposer_id,
            recipient_id = %recipient_id,
            locks = outcome.locks.len(),
            "trade proposed"
        );
        Ok(outcome)
    }

    /// Map a failed `can_acquire` to the error that explains it.
    fn unavailable_for_lock(&self, book_id: &str) -> Result<TradeError> {
        if let Some(lock) = self.locks.active_lock(book_id)? {
            return Ok(TradeError::Conflict {
                book_id: book_id.to_string(),
                expires_at: Some(lock.expires_at),
            });
        }
        Ok(match store::get::<Book>(&self.store.books, book_id)? {
            None => TradeError::not_found("book", book_id),
            Some(_) => TradeError::ValidationFailed(format!("book {book_id} is not available")),
        })
    }

    /// The recipient accepts: books change hands and the trade completes.
    pub fn accept_trade(&self, actor_id: &str, trade_id: &str) -> Result<TransferSummary> {
        let trade = self.load_trade(trade_id)?;
        trade.ensure_responder(actor_id, "accept")?;
        trade.ensure_pending()?;

        let summary = self
            .transfers
            .transfer_books(&TransferRequest::for_trade(&trade), actor_id)?;
        tracing::info!(trade_id = %trade_id, actor_id = %actor_id, "trade accepted");

        self.invalidator.invalidate(&trade.participant1_id);
        self.invalidator.invalidate(&trade.participant2_id);
        Ok(summary)
    }

    pub fn reject_trade(&self, actor_id: &str, trade_id: &str, reason: Option<String>) -> Result<Trade> {
        let trade = self.resolve(trade_id, TradeStatus::Rejected, |trade| {
            trade.ensure_responder(actor_id, "reject")?;
            Ok((actor_id, TradeEventKind::Rejected { reason: reason.clone() }))
        })?;
        tracing::info!(trade_id = %trade_id, actor_id = %actor_id, "trade rejected");
        Ok(trade)
    }

    pub fn cancel_trade(&self, actor_id: &str, trade_id: &str) -> Result<Trade> {
        let trade = self.resolve(trade_id, TradeStatus::Cancelled, |trade| {
            trade.ensure_proposer(actor_id, "cancel")?;
            Ok((actor_id, TradeEventKind::Cancelled))
        })?;
        tracing::info!(trade_id = %trade_id, actor_id = %actor_id, "trade cancelled");
        Ok(trade)
    }

    /// Close a pending trade without a transfer, releasing its locks.
    fn resolve<'a>(
        &self,
        trade_id: &str,
        status: TradeStatus,
        guard: impl Fn(&Trade) -> Result<(&'a str, TradeEventKind)>,
    ) -> Result<Trade> {
        let s = &self.store;
        store::settle((&s.trades, &s.locks, &s.lock_ids).transaction(
            |(trades, locks, lock_ids)| -> TxResult<Trade> {
                let mut trade = store::tx_get::<Trade, TradeError>(trades, trade_id)?
                    .ok_or_else(|| abort_with(TradeError::not_found("trade", trade_id)))?;
                let (actor_id, kind) = guard(&trade).map_err(abort_with)?;
                trade.ensure_pending().map_err(abort_with)?;

                lock::release_in::<TradeError>(locks, lock_ids, trade_id, &trade.books_requested)?;
                trade.close(actor_id, status, kind);
                store::tx_put::<_, TradeError>(trades, trade_id, &trade)?;
                Ok(trade)
            },
        ))
    }

    /// The recipient replaces the proposal in place and becomes its proposer.
    ///
    /// The current locks are released and the new requested books locked in
    /// the same transaction, so a conflict leaves the original proposal and
    /// its locks untouched.
    pub fn counter_propose(&self, actor_id: &str, trade_id: &str, counter: CounterProposal) -> Result<ProposalOutcome> {
        validate_book_sets(&counter.books_offered, &counter.books_requested)?;

        let policy = self.locks.policy();
        let s = &self.store;
        let outcome = store::settle(
            (&s.books, &s.locks, &s.lock_ids, &s.trades, &s.interests).transaction(
                |(books, locks, lock_ids, trades, interests)| -> TxResult<ProposalOutcome> {
                    let mut trade = store::tx_get::<Trade, TradeError>(trades, trade_id)?
                        .ok_or_else(|| abort_with(TradeError::not_found("trade", trade_id)))?;
                    trade.ensure_responder(actor_id, "counter").map_err(abort_with)?;
                    trade.ensure_pending().map_err(abort_with)?;

                    lock::release_in::<TradeError>(locks, lock_ids, trade_id, &trade.books_requested)?;
                    ensure_offerable(books, &counter.books_offered, actor_id)?;
                    trade.counter(
                        actor_id,
                        counter.books_offered.clone(),
                        counter.books_requested.clone(),
                    );
                    let locks = claim_requested((books, locks, lock_ids, interests), &trade, None, &policy)?;
                    store::tx_put::<_, TradeError>(trades, trade_id, &trade)?;
                    Ok(ProposalOutcome { trade, locks })
                },
            ),
        )?;

        tracing::info!(
            trade_id = %trade_id,
            proposer_id = %actor_id,
            locks = outcome.locks.len(),
            "trade countered"
        );
        Ok(outcome)
    }

    /// Extend every lock attached to a pending trade. Locks are extended
    /// independently; the call fails only when none could be extended.
    pub fn extend_trade_locks(&self, actor_id: &str, trade_id: &str, additional_hours: Option<u32>) -> Result<ExtensionReport> {
        let trade = self.load_trade(trade_id)?;
        trade.ensure_participant(actor_id)?;
        trade.ensure_pending()?;

        let held = self.locks.locks_for_trade(trade_id)?;
        if held.is_empty() {
            return Err(TradeError::not_found("lock", format!("for trade {trade_id}")));
        }
        let hours = additional_hours.unwrap_or(self.locks.policy().default_extension_hours);

        let mut report = ExtensionReport {
            trade_id: trade_id.to_string(),
            extended: Vec::new(),
            failed: Vec::new(),
        };
        let mut first_error = None;
        for held_lock in held {
            match self.locks.extend_lock(&held_lock.id, hours) {
                Ok(extended) => report.extended.push(extended),
                Err(err) => {
                    let err = TradeError::from(err);
                    report.failed.push(ExtensionFailure {
                        lock_id: held_lock.id,
                        book_id: held_lock.book_id,
                        reason: err.to_string(),
                    });
                    first_error.get_or_insert(err);
                }
            }
        }

        if report.extended.is_empty() {
            if let Some(err) = first_error {
                return Err(err);
            }
        }

        let extended: Vec<LockId> = report.extended.iter().map(|l| l.id.clone()).collect();
        store::settle(self.store.trades.transaction(|trades| -> TxResult<()> {
            if let Some(mut trade) = store::tx_get::<Trade, TradeError>(trades, trade_id)? {
                if trade.status == TradeStatus::Pending {
                    trade.record(
                        actor_id,
                        TradeEventKind::LocksExtended {
                            additional_hours: hours,
                            extended: extended.clone(),
                        },
                    );
                    store::tx_put::<_, TradeError>(trades, trade_id, &trade)?;
                }
            }
            Ok(())
        }))?;

        tracing::info!(
            trade_id = %trade_id,
            extended = report.extended.len(),
            failed = report.failed.len(),
            "trade locks extended"
        );
        Ok(report)
    }

    pub fn get_locks_for_trade(&self, actor_id: &str, trade_id: &str) -> Result<Vec<BookLock>> {
        let trade = self.load_trade(trade_id)?;
        trade.ensure_participant(actor_id)?;
        Ok(self.locks.locks_for_trade(trade_id)?)
    }

    pub fn get_trade(&self, actor_id: &str, trade_id: &str) -> Result<Trade> {
        let trade = self.load_trade(trade_id)?;
        trade.ensure_participant(actor_id)?;
        Ok(trade)
    }

    /// Trades the user takes part in, newest first.
    pub fn list_trades(&self, user_id: &str) -> Result<Vec<Trade>> {
        let mut trades: Vec<Trade> = store::scan(&self.store.trades, "")?;
        trades.retain(|t| t.is_participant(user_id));
        trades.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(trades)
    }

    /// Claims recorded against one of the owner's books, oldest first.
    pub fn competing_interests(&self, owner_id: &str, book_id: &str) -> Result<Vec<BookInterest>> {
        let book: Book = store::get(&self.store.books, book_id)?
            .ok_or_else(|| TradeError::not_found("book", book_id))?;
        if book.owner_id != owner_id {
            return Err(TradeError::Forbidden(format!(
                "book {book_id} belongs to another user"
            )));
        }
        let mut interests: Vec<BookInterest> =
            store::scan(&self.store.interests, &format!("{book_id}/"))?;
        interests.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(interests)
    }

    /// Every claim on the owner's books, grouped by book.
    pub fn interests_for_owner(&self, owner_id: &str) -> Result<BTreeMap<BookId, Vec<BookInterest>>> {
        let mut interests: Vec<BookInterest> = store::scan(&self.store.interests, "")?;
        interests.retain(|i| i.owner_id == owner_id);
        interests.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let mut grouped: BTreeMap<BookId, Vec<BookInterest>> = BTreeMap::new();
        for interest in interests {
            grouped.entry(interest.book_id.clone()).or_default().push(interest);
        }
        Ok(grouped)
    }
}

/// Offered books must exist, belong to the proposer and be available.
fn ensure_offerable(books: &TransactionalTree, book_ids: &[BookId], owner_id: &str) -> TxResult<()> {
    for book_id in book_ids {
        let book = store::tx_get::<Book, TradeError>(books, book_id)?
            .ok_or_else(|| abort_with(TradeError::not_found("book", book_id.as_str())))?;
        if book.owner_id != owner_id || !book.is_available {
            return Err(abort_with(TradeError::ValidationFailed(format!(
                "book {book_id} is not available or does not belong to {owner_id}"
            ))));
        }
    }
    Ok(())
}

/// Lock every requested book for the trade and record the proposer's
/// interest in it.
fn claim_requested(
    (books, locks, lock_ids, interests): (&TransactionalTree, &TransactionalTree, &TransactionalTree, &TransactionalTree),
    trade: &Trade,
    duration_hours: Option<u32>,
    policy: &LockConfig,
) -> TxResult<Vec<BookLock>> {
    let now = TimeStamp::new();
    let owner_id = trade.recipient_id();
    let mut granted = Vec::with_capacity(trade.books_requested.len());
    for book_id in &trade.books_requested {
        let request = LockRequest {
            book_id,
            owner_id,
            locked_for_user_id: &trade.proposer_id,
            chat_id: &trade.chat_id,
            trade_proposal_id: &trade.id,
            duration_hours,
        };
        granted.push(lock::acquire_in::<TradeError>(books, locks, lock_ids, &request, policy, now)?);

        let interest = BookInterest {
            id: new_id("intr_"),
            book_id: book_id.clone(),
            owner_id: owner_id.to_string(),
            interested_user_id: trade.proposer_id.clone(),
            chat_id: trade.chat_id.clone(),
            trade_id: trade.id.clone(),
            created_at: now,
        };
        store::tx_put::<_, TradeError>(interests, &interest.key(), &interest)?;
    }
    Ok(granted)
}

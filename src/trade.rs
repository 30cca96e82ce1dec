//! Trade proposals and their negotiation state machine
//!
//! A trade is a single record updated in place; each transition appends an
//! event to its history, the way an approval record accumulates witnesses.
//! The guards here are pure so the service can run them inside its
//! transactions.
use std::collections::HashSet;

use serde::Serialize;

use crate::error::{Result, TradeError};
use crate::types::{BookId, ChatId, LockId, TimeStamp, TradeId, UserId};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeStatus {
    #[n(0)]
    Pending,
    /// Acceptance completes the trade in the same transaction, so this state
    /// is never observed in storage.
    #[n(1)]
    Accepted,
    #[n(2)]
    Completed,
    #[n(3)]
    Rejected,
    #[n(4)]
    Cancelled,
}

impl TradeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TradeStatus::Completed | TradeStatus::Rejected | TradeStatus::Cancelled
        )
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TradeEventKind {
    #[n(0)]
    Proposed {
        #[n(0)]
        #[serde(rename = "booksOffered")]
        offered: Vec<BookId>,
        #[n(1)]
        #[serde(rename = "booksRequested")]
        requested: Vec<BookId>,
    },
    #[n(1)]
    Countered {
        #[n(0)]
        #[serde(rename = "booksOffered")]
        offered: Vec<BookId>,
        #[n(1)]
        #[serde(rename = "booksRequested")]
        requested: Vec<BookId>,
    },
    #[n(2)]
    Rejected {
        #[n(0)]
        reason: Option<String>,
    },
    #[n(3)]
    Cancelled,
    #[n(4)]
    LocksExtended {
        #[n(0)]
        #[serde(rename = "additionalHours")]
        additional_hours: u32,
        #[n(1)]
        extended: Vec<LockId>,
    },
    #[n(5)]
    Completed,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeEvent {
    #[n(0)]
    pub actor_id: UserId,
    #[n(1)]
    pub at: TimeStamp,
    #[n(2)]
    pub kind: TradeEventKind,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    #[n(0)]
    pub id: TradeId,
    #[n(1)]
    pub participant1_id: UserId,
    #[n(2)]
    pub participant2_id: UserId,
    #[n(3)]
    pub proposer_id: UserId,
    #[n(4)]
    pub chat_id: ChatId,
    /// The proposer's books going out.
    #[n(5)]
    pub books_offered: Vec<BookId>,
    /// What the proposer asks of the other participant.
    #[n(6)]
    pub books_requested: Vec<BookId>,
    #[n(7)]
    pub status: TradeStatus,
    #[n(8)]
    pub created_at: TimeStamp,
    #[n(9)]
    pub updated_at: TimeStamp,
    #[n(10)]
    pub completed_at: Option<TimeStamp>,
    #[n(11)]
    pub events: Vec<TradeEvent>,
}

impl Trade {
    pub fn propose(
        id: TradeId,
        proposer_id: &str,
        recipient_id: &str,
        chat_id: &str,
        offered: Vec<BookId>,
        requested: Vec<BookId>,
    ) -> Self {
        let now = TimeStamp::new();
        let mut trade = Self {
            id,
            participant1_id: proposer_id.to_string(),
            participant2_id: recipient_id.to_string(),
            proposer_id: proposer_id.to_string(),
            chat_id: chat_id.to_string(),
            books_offered: offered.clone(),
            books_requested: requested.clone(),
            status: TradeStatus::Pending,
            created_at: now,
            updated_at: now,
            completed_at: None,
            events: Vec::new(),
        };
        trade.record(proposer_id, TradeEventKind::Proposed { offered, requested });
        trade
    }

    pub fn is_participant(&self, user_id: &str) -> bool {
        self.participant1_id == user_id || self.participant2_id == user_id
    }

    /// The participant who did not make the current proposal.
    pub fn recipient_id(&self) -> &str {
        if self.participant1_id == self.proposer_id {
            &self.participant2_id
        } else {
            &self.participant1_id
        }
    }

    pub fn ensure_participant(&self, actor_id: &str) -> Result<()> {
        if self.is_participant(actor_id) {
            Ok(())
        } else {
            Err(TradeError::Forbidden(format!(
                "user {actor_id} is not a participant in trade {}",
                self.id
            )))
        }
    }

    /// Accept, reject and counter belong to the participant who did not propose.
    pub fn ensure_responder(&self, actor_id: &str, action: &str) -> Result<()> {
        self.ensure_participant(actor_id)?;
        if self.proposer_id == actor_id {
            return Err(TradeError::Forbidden(format!(
                "the proposer cannot {action} their own trade {}",
                self.id
            )));
        }
        Ok(())
    }

    pub fn ensure_proposer(&self, actor_id: &str, action: &str) -> Result<()> {
        self.ensure_participant(actor_id)?;
        if self.proposer_id != actor_id {
            return Err(TradeError::Forbidden(format!(
                "only the proposer can {action} trade {}",
                self.id
            )));
        }
        Ok(())
    }

    pub fn ensure_pending(&self) -> Result<()> {
        if self.status == TradeStatus::Pending {
            Ok(())
        } else {
            Err(TradeError::InvalidState(format!(
                "trade {} is {:?}, not pending",
                self.id, self.status
            )))
        }
    }

    pub fn record(&mut self, actor_id: &str, kind: TradeEventKind) {
        let at = TimeStamp::new();
        self.updated_at = at;
        self.events.push(TradeEvent {
            actor_id: actor_id.to_string(),
            at,
            kind,
        });
    }

    /// Swap roles and book sets in place; the trade stays pending.
    pub fn counter(&mut self, actor_id: &str, offered: Vec<BookId>, requested: Vec<BookId>) {
        self.proposer_id = actor_id.to_string();
        self.books_offered = offered.clone();
        self.books_requested = requested.clone();
        self.record(actor_id, TradeEventKind::Countered { offered, requested });
    }

    pub fn close(&mut self, actor_id: &str, status: TradeStatus, kind: TradeEventKind) {
        self.status = status;
        self.record(actor_id, kind);
        if status == TradeStatus::Completed {
            self.completed_at = Some(self.updated_at);
        }
    }
}

/// A trade needs at least one book, and no book may appear twice across
/// the offered and requested sets.
pub fn validate_book_sets(offered: &[BookId], requested: &[BookId]) -> Result<()> {
    if offered.is_empty() && requested.is_empty() {
        return Err(TradeError::ValidationFailed(
            "a trade must offer or request at least one book".into(),
        ));
    }
    let mut seen = HashSet::new();
    for book_id in offered.iter().chain(requested) {
        if !seen.insert(book_id.as_str()) {
            return Err(TradeError::ValidationFailed(format!(
                "book {book_id} appears more than once"
            )));
        }
    }
    Ok(())
}

/// A user's claim on someone else's book, recorded whenever a proposal asks
/// for it. Informational only.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookInterest {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub book_id: BookId,
    #[n(2)]
    pub owner_id: UserId,
    #[n(3)]
    pub interested_user_id: UserId,
    #[n(4)]
    pub chat_id: ChatId,
    #[n(5)]
    pub trade_id: TradeId,
    #[n(6)]
    pub created_at: TimeStamp,
}

impl BookInterest {
    pub fn key(&self) -> String {
        format!("{}/{}", self.book_id, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending() -> Trade {
        Trade::propose(
            "trade_1".into(),
            "user_a",
            "user_b",
            "chat_1",
            vec!["book_dune".into()],
            vec!["book_foundation".into()],
        )
    }

    #[test]
    fn proposal_starts_pending_with_one_event() {
        let trade = pending();
        assert_eq!(trade.status, TradeStatus::Pending);
        assert_eq!(trade.recipient_id(), "user_b");
        assert_eq!(trade.events.len(), 1);
        assert!(matches!(trade.events[0].kind, TradeEventKind::Proposed { .. }));
    }

    #[test]
    fn only_the_recipient_responds() {
        let trade = pending();
        assert!(trade.ensure_responder("user_b", "accept").is_ok());
        assert!(matches!(
            trade.ensure_responder("user_a", "accept"),
            Err(TradeError::Forbidden(_))
        ));
        assert!(matches!(
            trade.ensure_responder("user_c", "accept"),
            Err(TradeError::Forbidden(_))
        ));
    }

    #[test]
    fn only_the_proposer_cancels() {
        let trade = pending();
        assert!(trade.ensure_proposer("user_a", "cancel").is_ok());
        assert!(trade.ensure_proposer("user_b", "cancel").is_err());
    }

    #[test]
    fn counter_swaps_roles_in_place() {
        let mut trade = pending();
        trade.counter("user_b", vec!["book_emma".into()], vec!["book_dune".into()]);

        assert_eq!(trade.id, "trade_1");
        assert_eq!(trade.proposer_id, "user_b");
        assert_eq!(trade.recipient_id(), "user_a");
        assert_eq!(trade.status, TradeStatus::Pending);
        assert_eq!(trade.books_requested, vec!["book_dune".to_string()]);
        assert!(trade.ensure_responder("user_a", "accept").is_ok());
    }

    #[test]
    fn closed_trade_is_not_pending() {
        let mut trade = pending();
        trade.close("user_b", TradeStatus::Completed, TradeEventKind::Completed);

        assert!(trade.status.is_terminal());
        assert!(trade.completed_at.is_some());
        assert!(matches!(trade.ensure_pending(), Err(TradeError::InvalidState(_))));
    }

    #[test]
    fn book_sets_must_be_non_empty_and_distinct() {
        assert!(validate_book_sets(&[], &[]).is_err());
        assert!(validate_book_sets(&["a".into()], &["a".into()]).is_err());
        assert!(validate_book_sets(&["a".into(), "a".into()], &[]).is_err());
        assert!(validate_book_sets(&[], &["b".into()]).is_ok());
    }
}

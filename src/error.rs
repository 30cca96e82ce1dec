use crate::types::{BookId, LockId, TimeStamp, TradeId, UserId};

/// Failures of the storage layer itself.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("storage failure: {0}")]
    Sled(#[from] sled::Error),
    #[error("failed to decode stored record: {0}")]
    Decode(#[from] minicbor::decode::Error),
    #[error("failed to encode record: {0}")]
    Encode(String),
}

#[derive(thiserror::Error, Debug)]
pub enum LockError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("book {book_id} is already locked for another trade until {expires_at:?}")]
    AlreadyLocked {
        book_id: BookId,
        expires_at: TimeStamp,
    },
    #[error("user {owner_id} does not own book {book_id}")]
    NotOwner { book_id: BookId, owner_id: UserId },
    #[error("book {book_id} is not available")]
    BookUnavailable { book_id: BookId },
    #[error("lock {lock_id} has expired and cannot be extended")]
    Expired { lock_id: LockId },
    #[error("lock {lock_id} has reached the maximum of {max} extensions")]
    MaxExtensionsReached { lock_id: LockId, max: usize },
    #[error("extension must add at least one hour")]
    InvalidExtension,
    #[error("lock duration of {hours} hours is outside the allowed 0..={max}")]
    InvalidDuration { hours: u32, max: u32 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Error taxonomy surfaced by every marketplace operation.
#[derive(thiserror::Error, Debug)]
pub enum TradeError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("book {book_id} is already locked for another trade")]
    Conflict {
        book_id: BookId,
        expires_at: Option<TimeStamp>,
    },
    #[error("validation failed: {0}")]
    ValidationFailed(String),
    #[error("failed to transfer books for trade {trade_id}; transaction rolled back")]
    TransferFailed { trade_id: TradeId },
    #[error("lock {lock_id} has expired; the trade must be proposed again")]
    LockExpired { lock_id: LockId },
    #[error("lock {lock_id} has reached the maximum of {max} extensions")]
    MaxExtensionsReached { lock_id: LockId, max: usize },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TradeError {
    pub(crate) fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        TradeError::NotFound {
            entity,
            id: id.into(),
        }
    }
}

impl From<sled::Error> for TradeError {
    fn from(value: sled::Error) -> Self {
        TradeError::Store(StoreError::Sled(value))
    }
}

impl From<sled::Error> for LockError {
    fn from(value: sled::Error) -> Self {
        LockError::Store(StoreError::Sled(value))
    }
}

impl From<LockError> for TradeError {
    fn from(value: LockError) -> Self {
        match value {
            LockError::NotFound { entity, id } => TradeError::NotFound { entity, id },
            LockError::AlreadyLocked {
                book_id,
                expires_at,
            } => TradeError::Conflict {
                book_id,
                expires_at: Some(expires_at),
            },
            err @ LockError::NotOwner { .. } => TradeError::ValidationFailed(err.to_string()),
            err @ LockError::BookUnavailable { .. } => {
                TradeError::ValidationFailed(err.to_string())
            }
            err @ (LockError::InvalidExtension | LockError::InvalidDuration { .. }) => {
                TradeError::ValidationFailed(err.to_string())
            }
            LockError::Expired { lock_id } => TradeError::LockExpired { lock_id },
            LockError::MaxExtensionsReached { lock_id, max } => {
                TradeError::MaxExtensionsReached { lock_id, max }
            }
            LockError::Store(err) => TradeError::Store(err),
        }
    }
}

pub type Result<T, E = TradeError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn already_locked_maps_to_conflict_naming_the_book() {
        let err: TradeError = LockError::AlreadyLocked {
            book_id: "book_1".into(),
            expires_at: TimeStamp::new(),
        }
        .into();

        match err {
            TradeError::Conflict { book_id, expires_at } => {
                assert_eq!(book_id, "book_1");
                assert!(expires_at.is_some());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn ownership_failures_map_to_validation() {
        let err: TradeError = LockError::NotOwner {
            book_id: "book_1".into(),
            owner_id: "user_1".into(),
        }
        .into();

        assert!(matches!(err, TradeError::ValidationFailed(msg) if msg.contains("book_1")));
    }

    #[test]
    fn out_of_range_duration_maps_to_validation() {
        let err: TradeError = LockError::InvalidDuration { hours: 9_999, max: 720 }.into();

        assert!(matches!(err, TradeError::ValidationFailed(msg) if msg.contains("9999")));
    }
}

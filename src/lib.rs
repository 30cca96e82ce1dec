//! Book exchange core: a book ledger with match recomputation, per-book
//! trade locks, a negotiation state machine and an atomic ownership transfer,
//! persisted in sled and served over a JSON HTTP API.
pub mod api;
pub mod config;
pub mod directory;
pub mod error;
pub mod ledger;
pub mod lock;
pub mod marketplace;
pub mod matching;
pub mod scope;
pub mod service;
pub mod store;
pub mod trade;
pub mod transfer;
pub mod types;
pub mod utils;

pub use config::Config;
pub use error::{LockError, Result, TradeError};
pub use marketplace::Marketplace;

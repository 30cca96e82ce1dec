//! Composition root
use crate::config::Config;
use crate::directory::Directory;
use crate::error::Result;
use crate::ledger::{BookLedger, Invalidator};
use crate::lock::LockManager;
use crate::matching::MatchEngine;
use crate::service::TradeService;
use crate::store::Store;
use crate::transfer::TransferEngine;

/// Every component of the exchange, wired over one store.
pub struct Marketplace {
    pub directory: Directory,
    pub ledger: BookLedger,
    pub matches: MatchEngine,
    pub locks: LockManager,
    pub transfers: TransferEngine,
    pub trades: TradeService,
    store: Store,
}

impl Marketplace {
    pub fn new(config: &Config, store: Store) -> Self {
        let directory = Directory::new(store.clone());
        let matches = MatchEngine::new(store.clone(), directory.clone());
        let invalidator = Invalidator::new(matches.clone(), config.matching.recompute);
        let ledger = BookLedger::new(store.clone(), invalidator.clone());
        let locks = LockManager::new(store.clone(), config.locks);
        let transfers = TransferEngine::new(store.clone());
        let trades = TradeService::new(
            store.clone(),
            directory.clone(),
            matches.clone(),
            locks.clone(),
            transfers.clone(),
            invalidator,
        );

        Self {
            directory,
            ledger,
            matches,
            locks,
            transfers,
            trades,
            store,
        }
    }

    /// Open the sled database named in the configuration.
    pub fn open(config: &Config) -> Result<Self> {
        let store = Store::open(&config.storage.path)?;
        Ok(Self::new(config, store))
    }

    /// Drop expired locks; returns how many were removed.
    pub fn sweep_expired_locks(&self) -> Result<usize> {
        Ok(self.locks.cleanup_expired_locks()?)
    }

    pub fn flush(&self) -> Result<usize> {
        Ok(self.store.flush()?)
    }
}

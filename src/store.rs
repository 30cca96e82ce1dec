//! sled-backed record storage
//!
//! Every record kind lives in its own tree and is encoded as CBOR. Operations
//! that must change several records together go through sled's multi-tree
//! transactions; the helpers here keep encode/decode errors inside the
//! transaction's abort channel.
use std::path::Path;

use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
    TransactionResult, TransactionalTree,
};
use sled::{Db, Tree};

use crate::error::{StoreError, TradeError};

pub(crate) type TxResult<T, E = TradeError> = ConflictableTransactionResult<T, E>;

#[derive(Clone)]
pub struct Store {
    db: Db,
    pub(crate) users: Tree,
    pub(crate) sessions: Tree,
    pub(crate) chats: Tree,
    pub(crate) books: Tree,
    pub(crate) matches: Tree,
    pub(crate) hidden_matches: Tree,
    // keyed by book id, at most one row per book
    pub(crate) locks: Tree,
    pub(crate) lock_ids: Tree,
    pub(crate) trades: Tree,
    pub(crate) audit: Tree,
    pub(crate) interests: Tree,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    pub fn from_db(db: Db) -> Result<Self, StoreError> {
        Ok(Self {
            users: db.open_tree("users")?,
            sessions: db.open_tree("sessions")?,
            chats: db.open_tree("chats")?,
            books: db.open_tree("books")?,
            matches: db.open_tree("matches")?,
            hidden_matches: db.open_tree("hidden_matches")?,
            locks: db.open_tree("locks")?,
            lock_ids: db.open_tree("lock_ids")?,
            trades: db.open_tree("trades")?,
            audit: db.open_tree("audit")?,
            interests: db.open_tree("interests")?,
            db,
        })
    }

    pub fn flush(&self) -> Result<usize, StoreError> {
        Ok(self.db.flush()?)
    }
}

pub(crate) fn encode<T: minicbor::Encode<()>>(value: &T) -> Result<Vec<u8>, StoreError> {
    minicbor::to_vec(value).map_err(|e| StoreError::Encode(e.to_string()))
}

pub(crate) fn decode<T>(bytes: &[u8]) -> Result<T, StoreError>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    Ok(minicbor::decode(bytes)?)
}

pub(crate) fn get<T>(tree: &Tree, key: &str) -> Result<Option<T>, StoreError>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    match tree.get(key.as_bytes())? {
        Some(bytes) => decode(&bytes).map(Some),
        None => Ok(None),
    }
}

pub(crate) fn put<T: minicbor::Encode<()>>(tree: &Tree, key: &str, value: &T) -> Result<(), StoreError> {
    tree.insert(key.as_bytes(), encode(value)?)?;
    Ok(())
}

/// Decode every record in the tree, optionally restricted to a key prefix.
pub(crate) fn scan<T>(tree: &Tree, prefix: &str) -> Result<Vec<T>, StoreError>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    tree.scan_prefix(prefix.as_bytes())
        .map(|entry| {
            let (_, bytes) = entry?;
            decode(&bytes)
        })
        .collect()
}

pub(crate) fn abort<E: From<StoreError>>(err: StoreError) -> ConflictableTransactionError<E> {
    ConflictableTransactionError::Abort(E::from(err))
}

pub(crate) fn tx_get<T, E>(tree: &TransactionalTree, key: &str) -> ConflictableTransactionResult<Option<T>, E>
where
    T: for<'b> minicbor::Decode<'b, ()>,
    E: From<StoreError>,
{
    match tree.get(key.as_bytes())? {
        Some(bytes) => decode(&bytes).map(Some).map_err(abort),
        None => Ok(None),
    }
}

pub(crate) fn tx_put<T, E>(tree: &TransactionalTree, key: &str, value: &T) -> ConflictableTransactionResult<(), E>
where
    T: minicbor::Encode<()>,
    E: From<StoreError>,
{
    let bytes = encode(value).map_err(abort::<E>)?;
    tree.insert(key.as_bytes(), bytes)?;
    Ok(())
}

/// Collapse a transaction outcome into the caller's error type.
pub(crate) fn settle<T, E: From<sled::Error>>(result: TransactionResult<T, E>) -> Result<T, E> {
    result.map_err(|err| match err {
        TransactionError::Abort(err) => err,
        TransactionError::Storage(err) => E::from(err),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn temp_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("store.db")).unwrap();
        (dir, store)
    }

    #[derive(minicbor::Encode, minicbor::Decode, Debug, PartialEq)]
    struct Row {
        #[n(0)]
        name: String,
        #[n(1)]
        count: u32,
    }

    #[test]
    fn put_get_and_scan_by_prefix() {
        let (_dir, store) = temp_store();
        let row = Row {
            name: "a".into(),
            count: 3,
        };

        put(&store.books, "x/1", &row).unwrap();
        put(&store.books, "y/1", &Row { name: "b".into(), count: 1 }).unwrap();

        let fetched: Option<Row> = get(&store.books, "x/1").unwrap();
        assert_eq!(fetched, Some(row));

        let under_x: Vec<Row> = scan(&store.books, "x/").unwrap();
        assert_eq!(under_x.len(), 1);
        assert!(get::<Row>(&store.books, "missing").unwrap().is_none());
    }
}

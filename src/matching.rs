//! Match engine
//!
//! Matches are a derived view over the book ledger: for every pair of
//! co-located users the engine compares one side's inventory against the
//! other's wishlist, within a single scope partition, and stores one directed
//! row per direction. Rows are keyed `"{owner}/{counterparty}"` so a pair can
//! never be stored twice, and a recompute rewrites every row touching the
//! user in one atomic batch.
use std::collections::HashMap;

use serde::Serialize;
use sled::Batch;

use crate::directory::{Directory, User};
use crate::error::{Result, TradeError};
use crate::ledger::Book;
use crate::scope::{Scope, in_same_scope};
use crate::store::{self, Store};
use crate::types::{BookId, ListType, TimeStamp, UserId};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MatchType {
    /// Both users hold something the other wants.
    #[n(0)]
    #[serde(rename = "perfect")]
    Perfect,
    /// The counterparty holds something the owner wants.
    #[n(1)]
    #[serde(rename = "partial_type1")]
    PartialType1,
    /// The owner holds something the counterparty wants.
    #[n(2)]
    #[serde(rename = "partial_type2")]
    PartialType2,
}

impl MatchType {
    /// The classification of the same evidence seen from the other side.
    pub fn inverse(self) -> Self {
        match self {
            MatchType::Perfect => MatchType::Perfect,
            MatchType::PartialType1 => MatchType::PartialType2,
            MatchType::PartialType2 => MatchType::PartialType1,
        }
    }
}

/// One book behind a match, seen from the match owner's side.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchingBook {
    /// The owner's inventory book the counterparty wants.
    #[n(0)]
    pub source_book_id: Option<BookId>,
    /// The counterparty's inventory book the owner wants.
    #[n(1)]
    pub counterparty_book_id: Option<BookId>,
    #[n(2)]
    pub title: String,
    #[n(3)]
    pub author: String,
    #[n(4)]
    pub scope: Scope,
}

impl MatchingBook {
    fn mirrored(&self) -> Self {
        Self {
            source_book_id: self.counterparty_book_id.clone(),
            counterparty_book_id: self.source_book_id.clone(),
            ..self.clone()
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Match {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub owner_user_id: UserId,
    #[n(2)]
    pub counterparty_user_id: UserId,
    #[n(3)]
    pub match_type: MatchType,
    #[n(4)]
    pub matching_books: Vec<MatchingBook>,
    #[n(5)]
    pub is_hidden: bool,
    #[n(6)]
    pub created_at: TimeStamp,
}

impl Match {
    fn new(owner: &str, counterparty: &str, match_type: MatchType, books: Vec<MatchingBook>) -> Self {
        Self {
            id: match_id(owner, counterparty),
            owner_user_id: owner.to_string(),
            counterparty_user_id: counterparty.to_string(),
            match_type,
            matching_books: books,
            is_hidden: false,
            created_at: TimeStamp::new(),
        }
    }

    /// The reciprocal row: same evidence, roles swapped.
    pub fn mirrored(&self) -> Self {
        Self {
            id: match_id(&self.counterparty_user_id, &self.owner_user_id),
            owner_user_id: self.counterparty_user_id.clone(),
            counterparty_user_id: self.owner_user_id.clone(),
            match_type: self.match_type.inverse(),
            matching_books: self.matching_books.iter().map(MatchingBook::mirrored).collect(),
            is_hidden: false,
            created_at: self.created_at,
        }
    }

    fn key(&self) -> String {
        pair_key(&self.owner_user_id, &self.counterparty_user_id)
    }

    fn in_filter(&self, filter: &MatchFilter) -> bool {
        match filter {
            MatchFilter::All => true,
            MatchFilter::Global => self.matching_books.iter().all(|b| b.scope.is_global()),
            MatchFilter::Room(room_id) => self
                .matching_books
                .iter()
                .any(|b| b.scope.room_id() == Some(room_id.as_str())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MatchFilter {
    #[default]
    All,
    /// Only matches built entirely from global books.
    Global,
    /// Matches with at least one book in the room.
    Room(String),
}

fn pair_key(owner: &str, counterparty: &str) -> String {
    format!("{owner}/{counterparty}")
}

fn match_id(owner: &str, counterparty: &str) -> String {
    let digest = sha256::digest(pair_key(owner, counterparty));
    format!("match_{}", &digest[..24])
}

/// Compare one user's lists against a candidate's, returning the owner-side
/// classification and the books behind it, or `None` if neither side wants
/// anything the other has.
///
/// Inventory slices are expected to hold available books only.
pub fn classify(
    my_inventory: &[&Book],
    my_wishlist: &[&Book],
    their_inventory: &[&Book],
    their_wishlist: &[&Book],
) -> Option<(MatchType, Vec<MatchingBook>)> {
    let wanted = |offer: &Book, wishes: &[&Book]| {
        wishes
            .iter()
            .any(|wish| in_same_scope(&offer.scope, &wish.scope) && offer.same_work(wish))
    };

    let they_offer_i_want: Vec<&Book> = their_inventory
        .iter()
        .copied()
        .filter(|b| wanted(*b, my_wishlist))
        .collect();
    let i_offer_they_want: Vec<&Book> = my_inventory
        .iter()
        .copied()
        .filter(|b| wanted(*b, their_wishlist))
        .collect();

    let match_type = match (they_offer_i_want.is_empty(), i_offer_they_want.is_empty()) {
        (false, false) => MatchType::Perfect,
        (false, true) => MatchType::PartialType1,
        (true, false) => MatchType::PartialType2,
        (true, true) => return None,
    };

    let theirs = they_offer_i_want.into_iter().map(|b| MatchingBook {
        source_book_id: None,
        counterparty_book_id: Some(b.id.clone()),
        title: b.title.clone(),
        author: b.author.clone(),
        scope: b.scope.clone(),
    });
    let mine = i_offer_they_want.into_iter().map(|b| MatchingBook {
        source_book_id: Some(b.id.clone()),
        counterparty_book_id: None,
        title: b.title.clone(),
        author: b.author.clone(),
        scope: b.scope.clone(),
    });

    Some((match_type, theirs.chain(mine).collect()))
}

#[derive(Default)]
struct Lists<'a> {
    inventory: Vec<&'a Book>,
    wishlist: Vec<&'a Book>,
    // counts every inventory book, available or not, for the trader prefilter
    listed_inventory: usize,
}

impl Lists<'_> {
    /// Lists at least one inventory book and one wish. A pair is only
    /// compared when both sides pass, whichever of them recomputes.
    fn is_trader(&self) -> bool {
        self.listed_inventory > 0 && !self.wishlist.is_empty()
    }
}

fn lists_by_owner(books: &[Book]) -> HashMap<&str, Lists<'_>> {
    let mut by_owner: HashMap<&str, Lists<'_>> = HashMap::new();
    for book in books {
        let lists = by_owner.entry(book.owner_id.as_str()).or_default();
        match book.list_type {
            ListType::Inventory => {
                lists.listed_inventory += 1;
                if book.is_available {
                    lists.inventory.push(book);
                }
            }
            ListType::Wishlist => lists.wishlist.push(book),
        }
    }
    by_owner
}

#[derive(Clone)]
pub struct MatchEngine {
    store: Store,
    directory: Directory,
}

impl MatchEngine {
    pub fn new(store: Store, directory: Directory) -> Self {
        Self { store, directory }
    }

    /// Rebuild every match row touching `user_id`, in both directions.
    pub fn recompute_matches(&self, user_id: &str) -> Result<Vec<Match>> {
        let user = self.directory.require_user(user_id)?;

        let books: Vec<Book> = store::scan(&self.store.books, "")?;
        let lists = lists_by_owner(&books);
        let empty = Lists::default();
        let mine = lists.get(user_id).unwrap_or(&empty);

        let neighbours: Vec<User> = if mine.is_trader() {
            self.directory
                .users_in_location(&user.location)?
                .into_iter()
                .filter(|u| u.id != user.id)
                .collect()
        } else {
            Vec::new()
        };
        let mut outgoing = Vec::new();
        for candidate in &neighbours {
            let Some(theirs) = lists.get(candidate.id.as_str()) else {
                continue;
            };
            if !theirs.is_trader() {
                continue;
            }
            if let Some((match_type, books)) = classify(
                &mine.inventory,
                &mine.wishlist,
                &theirs.inventory,
                &theirs.wishlist,
            ) {
                outgoing.push(Match::new(user_id, &candidate.id, match_type, books));
            }
        }

        self.replace_rows(user_id, &mut outgoing)?;
        tracing::debug!(user_id = %user_id, matches = outgoing.len(), "matches recomputed");
        Ok(outgoing)
    }

    fn replace_rows(&self, user_id: &str, outgoing: &mut [Match]) -> Result<()> {
        let mut batch = Batch::default();
        let suffix = format!("/{user_id}");
        for entry in self.store.matches.iter() {
            let (key, _) = entry?;
            let touches_user = key.starts_with(format!("{user_id}/").as_bytes())
                || key.ends_with(suffix.as_bytes());
            if touches_user {
                batch.remove(key);
            }
        }

        for row in outgoing.iter_mut() {
            let mut reciprocal = row.mirrored();
            row.is_hidden = self.is_hidden_key(&row.key())?;
            reciprocal.is_hidden = self.is_hidden_key(&reciprocal.key())?;
            batch.insert(row.key().as_bytes(), store::encode(row)?);
            batch.insert(reciprocal.key().as_bytes(), store::encode(&reciprocal)?);
        }

        self.store.matches.apply_batch(batch)?;
        Ok(())
    }

    fn is_hidden_key(&self, key: &str) -> Result<bool> {
        Ok(self.store.hidden_matches.contains_key(key.as_bytes())?)
    }

    fn outgoing(&self, user_id: &str) -> Result<Vec<Match>> {
        let mut rows: Vec<Match> = store::scan(&self.store.matches, &format!("{user_id}/"))?;
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    /// Visible matches owned by the user, narrowed by scope.
    pub fn list_matches(&self, user_id: &str, filter: &MatchFilter) -> Result<Vec<Match>> {
        let mut rows = self.outgoing(user_id)?;
        rows.retain(|m| !m.is_hidden && m.in_filter(filter));
        Ok(rows)
    }

    pub fn get_match(&self, user_id: &str, match_id: &str) -> Result<Option<Match>> {
        Ok(self.outgoing(user_id)?.into_iter().find(|m| m.id == match_id))
    }

    pub fn hide_match(&self, user_id: &str, match_id: &str) -> Result<Match> {
        let mut row = self
            .get_match(user_id, match_id)?
            .ok_or_else(|| TradeError::not_found("match", match_id))?;
        self.set_hidden(&mut row, true)?;
        Ok(row)
    }

    pub fn hide_all_matches(&self, user_id: &str) -> Result<usize> {
        let mut rows = self.outgoing(user_id)?;
        for row in rows.iter_mut() {
            self.set_hidden(row, true)?;
        }
        Ok(rows.len())
    }

    /// Un-hide everything the user hid, including pairs with no current match.
    pub fn clear_hidden_matches(&self, user_id: &str) -> Result<usize> {
        let prefix = format!("{user_id}/");
        let mut cleared = 0;
        for entry in self.store.hidden_matches.scan_prefix(prefix.as_bytes()) {
            let (key, _) = entry?;
            self.store.hidden_matches.remove(&key)?;
            cleared += 1;
        }
        let mut rows = self.outgoing(user_id)?;
        for row in rows.iter_mut().filter(|m| m.is_hidden) {
            self.set_hidden(row, false)?;
        }
        Ok(cleared)
    }

    fn set_hidden(&self, row: &mut Match, hidden: bool) -> Result<()> {
        let key = row.key();
        if hidden {
            self.store.hidden_matches.insert(key.as_bytes(), Vec::<u8>::new())?;
        } else {
            self.store.hidden_matches.remove(key.as_bytes())?;
        }
        row.is_hidden = hidden;
        store::put(&self.store.matches, &key, row)?;
        Ok(())
    }

    /// Visible matches that involve one of the user's books, by id or by
    /// (title, author).
    pub fn matches_for_book(&self, user_id: &str, book_id: &str) -> Result<Vec<Match>> {
        let book: Book = store::get(&self.store.books, book_id)?
            .filter(|b: &Book| b.owner_id == user_id)
            .ok_or_else(|| TradeError::not_found("book", book_id))?;

        let mut rows = self.list_matches(user_id, &MatchFilter::All)?;
        rows.retain(|m| {
            m.matching_books.iter().any(|mb| {
                mb.source_book_id.as_deref() == Some(book_id)
                    || mb.counterparty_book_id.as_deref() == Some(book_id)
                    || (mb.title.to_lowercase() == book.title.to_lowercase()
                        && mb.author.to_lowercase() == book.author.to_lowercase())
            })
        });
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Condition;

    fn book(owner: &str, title: &str, list_type: ListType, scope: Scope) -> Book {
        Book {
            id: crate::utils::new_id("book_"),
            owner_id: owner.into(),
            title: title.into(),
            author: "Author".into(),
            isbn: None,
            condition: Condition::Good,
            description: String::new(),
            list_type,
            is_available: true,
            scope,
            created_at: TimeStamp::new(),
        }
    }

    #[test]
    fn both_directions_is_perfect() {
        let a_has = book("a", "Dune", ListType::Inventory, Scope::Global);
        let a_wants = book("a", "Foundation", ListType::Wishlist, Scope::Global);
        let b_has = book("b", "Foundation", ListType::Inventory, Scope::Global);
        let b_wants = book("b", "Dune", ListType::Wishlist, Scope::Global);

        let (kind, books) = classify(&[&a_has], &[&a_wants], &[&b_has], &[&b_wants]).unwrap();

        assert_eq!(kind, MatchType::Perfect);
        assert_eq!(books.len(), 2);
        assert_eq!(books[0].counterparty_book_id.as_deref(), Some(b_has.id.as_str()));
        assert_eq!(books[1].source_book_id.as_deref(), Some(a_has.id.as_str()));
    }

    #[test]
    fn one_direction_is_partial() {
        let a_has = book("a", "Dune", ListType::Inventory, Scope::Global);
        let b_wants = book("b", "Dune", ListType::Wishlist, Scope::Global);

        let (kind, _) = classify(&[&a_has], &[], &[], &[&b_wants]).unwrap();
        assert_eq!(kind, MatchType::PartialType2);

        let (kind, _) = classify(&[], &[&b_wants], &[&a_has], &[]).unwrap();
        assert_eq!(kind, MatchType::PartialType1);
    }

    #[test]
    fn scopes_do_not_cross() {
        let a_has = book("a", "Dune", ListType::Inventory, Scope::room("r1"));
        let b_wants_r2 = book("b", "Dune", ListType::Wishlist, Scope::room("r2"));
        let b_wants_global = book("b", "Dune", ListType::Wishlist, Scope::Global);

        assert!(classify(&[&a_has], &[], &[], &[&b_wants_r2, &b_wants_global]).is_none());
    }

    #[test]
    fn mirrored_match_inverts_type_and_sides() {
        let row = Match::new(
            "a",
            "b",
            MatchType::PartialType1,
            vec![MatchingBook {
                source_book_id: None,
                counterparty_book_id: Some("book_x".into()),
                title: "Dune".into(),
                author: "Herbert".into(),
                scope: Scope::Global,
            }],
        );

        let back = row.mirrored();

        assert_eq!(back.owner_user_id, "b");
        assert_eq!(back.match_type, MatchType::PartialType2);
        assert_eq!(back.matching_books[0].source_book_id.as_deref(), Some("book_x"));
        assert_eq!(back.mirrored().match_type, MatchType::PartialType1);
        assert_ne!(row.id, back.id);
    }

    #[test]
    fn room_filter_needs_one_book_in_room() {
        let mut row = Match::new("a", "b", MatchType::Perfect, vec![]);
        row.matching_books.push(MatchingBook {
            source_book_id: Some("x".into()),
            counterparty_book_id: None,
            title: "t".into(),
            author: "a".into(),
            scope: Scope::room("r1"),
        });

        assert!(row.in_filter(&MatchFilter::Room("r1".into())));
        assert!(!row.in_filter(&MatchFilter::Room("r2".into())));
        assert!(!row.in_filter(&MatchFilter::Global));
        assert!(row.in_filter(&MatchFilter::All));
    }
}

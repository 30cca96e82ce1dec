//! Property-based tests for match classification
//!
//! Two users draw inventory and wishlist entries from a small pool of works
//! spread over the global scope and two rooms, so overlaps and scope
//! mismatches are frequent. The properties:
//!
//! 1. Reciprocity: classifying B against A gives the inverse of A against B.
//! 2. Scope isolation: every book behind a match shares one scope with the
//!    wish it satisfies, so a room book never pairs across partitions.
//! 3. Stored views agree: after a recompute for either user, the two directed
//!    rows exist together or not at all and carry inverse classifications,
//!    and recomputing for the other user afterwards changes nothing. Either
//!    side may have an empty list.

use proptest::prelude::*;
use tempfile::tempdir;

use book_exchange::ledger::{Book, NewBook};
use book_exchange::matching::{MatchFilter, classify};
use book_exchange::scope::{Scope, in_same_scope};
use book_exchange::store::Store;
use book_exchange::types::{Condition, ListType, TimeStamp};
use book_exchange::{Config, Marketplace};

const WORKS: [(&str, &str); 4] = [
    ("Dune", "Frank Herbert"),
    ("Foundation", "Isaac Asimov"),
    ("Emma", "Jane Austen"),
    ("Ulysses", "James Joyce"),
];

#[derive(Debug, Clone)]
struct Entry {
    work: usize,
    room: Option<&'static str>,
    available: bool,
}

fn entry_strategy() -> impl Strategy<Value = Entry> {
    (
        0..WORKS.len(),
        prop_oneof![Just(None), Just(Some("r1")), Just(Some("r2"))],
        prop::bool::weighted(0.8),
    )
        .prop_map(|(work, room, available)| Entry { work, room, available })
}

fn lists_strategy() -> impl Strategy<Value = (Vec<Entry>, Vec<Entry>)> {
    (
        prop::collection::vec(entry_strategy(), 0..4),
        prop::collection::vec(entry_strategy(), 0..4),
    )
}

fn to_book(owner: &str, entry: &Entry, list_type: ListType, n: usize) -> Book {
    let (title, author) = WORKS[entry.work];
    Book {
        id: format!("{owner}_{n}"),
        owner_id: owner.into(),
        title: title.into(),
        author: author.into(),
        isbn: None,
        condition: Condition::Good,
        description: String::new(),
        list_type,
        is_available: entry.available || list_type == ListType::Wishlist,
        scope: Scope::from_room_id(entry.room),
        created_at: TimeStamp::new(),
    }
}

fn books(owner: &str, (inventory, wishlist): &(Vec<Entry>, Vec<Entry>)) -> (Vec<Book>, Vec<Book>) {
    let inv = inventory
        .iter()
        .enumerate()
        .map(|(n, e)| to_book(owner, e, ListType::Inventory, n))
        .filter(|b| b.is_available)
        .collect();
    let wish = wishlist
        .iter()
        .enumerate()
        .map(|(n, e)| to_book(owner, e, ListType::Wishlist, n + 100))
        .collect();
    (inv, wish)
}

fn refs(books: &[Book]) -> Vec<&Book> {
    books.iter().collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn classification_is_reciprocal(a in lists_strategy(), b in lists_strategy()) {
        let (a_inv, a_wish) = books("a", &a);
        let (b_inv, b_wish) = books("b", &b);

        let forward = classify(&refs(&a_inv), &refs(&a_wish), &refs(&b_inv), &refs(&b_wish));
        let backward = classify(&refs(&b_inv), &refs(&b_wish), &refs(&a_inv), &refs(&a_wish));

        match (forward, backward) {
            (None, None) => {}
            (Some((ab, ab_books)), Some((ba, ba_books))) => {
                prop_assert_eq!(ab.inverse(), ba);
                prop_assert_eq!(ab_books.len(), ba_books.len());
            }
            (f, r) => prop_assert!(false, "one-sided classification {:?} / {:?}", f, r),
        }
    }

    #[test]
    fn matched_books_share_a_scope_with_a_wish(a in lists_strategy(), b in lists_strategy()) {
        let (a_inv, a_wish) = books("a", &a);
        let (b_inv, b_wish) = books("b", &b);

        if let Some((_, matched)) = classify(&refs(&a_inv), &refs(&a_wish), &refs(&b_inv), &refs(&b_wish)) {
            for mb in matched {
                // a book offered by b is wanted by a, and the other way round
                let wishes = if mb.counterparty_book_id.is_some() { &a_wish } else { &b_wish };
                let wanted = wishes.iter().any(|w| {
                    in_same_scope(&w.scope, &mb.scope)
                        && w.title.eq_ignore_ascii_case(&mb.title)
                        && w.author.eq_ignore_ascii_case(&mb.author)
                });
                prop_assert!(wanted);
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn stored_rows_are_reciprocal(a in lists_strategy(), b in lists_strategy(), recompute_a in any::<bool>()) {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("matches.db")).unwrap();
        let market = Marketplace::new(&Config::default(), store);
        let ana = market.directory.register_user("Ana", "Porto").unwrap();
        let ben = market.directory.register_user("Ben", "Porto").unwrap();

        for (user, lists) in [(&ana, &a), (&ben, &b)] {
            for (entries, list_type) in [(&lists.0, ListType::Inventory), (&lists.1, ListType::Wishlist)] {
                for entry in entries {
                    let (title, author) = WORKS[entry.work];
                    let mut new_book = match list_type {
                        ListType::Inventory => NewBook::inventory(title, author),
                        ListType::Wishlist => NewBook::wishlist(title, author),
                    };
                    if let Some(room) = entry.room {
                        new_book = new_book.in_room(room);
                    }
                    let book = market.ledger.add_book(&user.id, new_book).unwrap();
                    if list_type == ListType::Inventory && !entry.available {
                        market.ledger.set_availability(&user.id, &book.id, false).unwrap();
                    }
                }
            }
        }

        let (first, second) = if recompute_a { (&ana, &ben) } else { (&ben, &ana) };
        market.matches.recompute_matches(&first.id).unwrap();

        let ab = market.matches.list_matches(&ana.id, &MatchFilter::All).unwrap();
        let ba = market.matches.list_matches(&ben.id, &MatchFilter::All).unwrap();
        prop_assert_eq!(ab.len(), ba.len());
        prop_assert!(ab.len() <= 1);
        if let (Some(ab), Some(ba)) = (ab.first(), ba.first()) {
            prop_assert_eq!(ab.match_type.inverse(), ba.match_type);
            prop_assert_eq!(&ab.counterparty_user_id, &ben.id);
            prop_assert_eq!(&ba.counterparty_user_id, &ana.id);
        }

        market.matches.recompute_matches(&second.id).unwrap();
        let again = market.matches.list_matches(&ana.id, &MatchFilter::All).unwrap();
        prop_assert_eq!(
            again.iter().map(|m| m.match_type).collect::<Vec<_>>(),
            ab.iter().map(|m| m.match_type).collect::<Vec<_>>()
        );
    }
}

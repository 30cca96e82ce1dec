//! Users, chats and sessions
//!
//! These are collaborators of the trading core: matching needs a user's
//! location, trade creation needs an existing chat between the two parties,
//! and every request needs an authenticated user id.
use serde::Serialize;

use crate::error::{Result, TradeError};
use crate::store::{self, Store};
use crate::types::{ChatId, TimeStamp, UserId};
use crate::utils::new_id;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[n(0)]
    pub id: UserId,
    #[n(1)]
    pub name: String,
    #[n(2)]
    pub location: String,
    #[n(3)]
    pub created_at: TimeStamp,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    #[n(0)]
    pub id: ChatId,
    #[n(1)]
    pub participant1_id: UserId,
    #[n(2)]
    pub participant2_id: UserId,
    #[n(3)]
    pub created_at: TimeStamp,
}

/// Resolves a bearer credential to the user it was issued for.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, token: &str) -> Result<UserId>;
}

#[derive(Clone)]
pub struct Directory {
    store: Store,
}

// chats are keyed by the unordered participant pair so lookups need no scan
fn chat_key(a: &str, b: &str) -> String {
    if a <= b {
        format!("{a}/{b}")
    } else {
        format!("{b}/{a}")
    }
}

impl Directory {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn register_user(&self, name: &str, location: &str) -> Result<User> {
        let name = name.trim();
        if name.is_empty() {
            return Err(TradeError::ValidationFailed("name is required".into()));
        }
        let user = User {
            id: new_id("user_"),
            name: name.to_string(),
            location: location.trim().to_string(),
            created_at: TimeStamp::new(),
        };
        store::put(&self.store.users, &user.id, &user)?;
        tracing::info!(user_id = %user.id, location = %user.location, "user registered");
        Ok(user)
    }

    pub fn get_user(&self, user_id: &str) -> Result<Option<User>> {
        Ok(store::get(&self.store.users, user_id)?)
    }

    pub fn require_user(&self, user_id: &str) -> Result<User> {
        self.get_user(user_id)?
            .ok_or_else(|| TradeError::not_found("user", user_id))
    }

    /// Everyone registered in the location, the match engine's candidate pool.
    pub fn users_in_location(&self, location: &str) -> Result<Vec<User>> {
        let users: Vec<User> = store::scan(&self.store.users, "")?;
        Ok(users.into_iter().filter(|u| u.location == location).collect())
    }

    pub fn issue_token(&self, user_id: &str) -> Result<String> {
        self.require_user(user_id)?;
        let token = new_id("tok_");
        self.store
            .sessions
            .insert(token.as_bytes(), user_id.as_bytes())?;
        Ok(token)
    }

    /// Returns the chat between the two users, opening one if none exists.
    pub fn open_chat(&self, user_id: &str, counterparty_id: &str) -> Result<Chat> {
        if user_id == counterparty_id {
            return Err(TradeError::ValidationFailed(
                "cannot open a chat with yourself".into(),
            ));
        }
        self.require_user(user_id)?;
        self.require_user(counterparty_id)?;

        let key = chat_key(user_id, counterparty_id);
        let chat = Chat {
            id: new_id("chat_"),
            participant1_id: user_id.to_string(),
            participant2_id: counterparty_id.to_string(),
            created_at: TimeStamp::new(),
        };
        let encoded = store::encode(&chat)?;
        // first writer wins when both parties open the chat at once
        match self
            .store
            .chats
            .compare_and_swap(key.as_bytes(), None as Option<&[u8]>, Some(encoded))?
        {
            Ok(()) => {
                tracing::info!(chat_id = %chat.id, "chat opened");
                Ok(chat)
            }
            Err(existing) => match existing.current {
                Some(bytes) => Ok(store::decode(&bytes)?),
                None => Err(TradeError::InvalidState(format!(
                    "chat between {user_id} and {counterparty_id} vanished while opening"
                ))),
            },
        }
    }

    pub fn find_chat_between(&self, a: &str, b: &str) -> Result<Option<Chat>> {
        Ok(store::get(&self.store.chats, &chat_key(a, b))?)
    }
}

impl Authenticator for Directory {
    fn authenticate(&self, token: &str) -> Result<UserId> {
        let user_id = self
            .store
            .sessions
            .get(token.as_bytes())?
            .ok_or_else(|| TradeError::Unauthorized("invalid or expired token".into()))?;
        String::from_utf8(user_id.to_vec())
            .map_err(|_| TradeError::Unauthorized("malformed session".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::temp_store;

    #[test]
    fn tokens_authenticate_their_user() {
        let (_dir, store) = temp_store();
        let directory = Directory::new(store);
        let user = directory.register_user("Ada", "Lisbon").unwrap();

        let token = directory.issue_token(&user.id).unwrap();

        assert_eq!(directory.authenticate(&token).unwrap(), user.id);
        assert!(matches!(
            directory.authenticate("tok_bogus"),
            Err(TradeError::Unauthorized(_))
        ));
    }

    #[test]
    fn chat_is_shared_by_both_orderings() {
        let (_dir, store) = temp_store();
        let directory = Directory::new(store);
        let a = directory.register_user("A", "Lisbon").unwrap();
        let b = directory.register_user("B", "Lisbon").unwrap();

        let first = directory.open_chat(&a.id, &b.id).unwrap();
        let second = directory.open_chat(&b.id, &a.id).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(
            directory.find_chat_between(&b.id, &a.id).unwrap().map(|c| c.id),
            Some(first.id)
        );
    }

    #[test]
    fn users_filtered_by_location() {
        let (_dir, store) = temp_store();
        let directory = Directory::new(store);
        directory.register_user("A", "Lisbon").unwrap();
        directory.register_user("B", "Porto").unwrap();

        let lisbon = directory.users_in_location("Lisbon").unwrap();
        assert_eq!(lisbon.len(), 1);
        assert_eq!(lisbon[0].name, "A");
    }
}

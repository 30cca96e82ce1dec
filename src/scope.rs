//! Visibility partition of the marketplace
//!
//! Every book is either visible to the whole location (global) or exclusive
//! to one room. Two books are only ever comparable inside the same partition.
use serde::{Deserialize, Serialize};

#[derive(
    minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Scope {
    #[default]
    #[n(0)]
    Global,
    #[n(1)]
    Room {
        #[n(0)]
        #[serde(rename = "roomId")]
        room_id: String,
    },
}

impl Scope {
    pub fn room(room_id: impl Into<String>) -> Self {
        Scope::Room {
            room_id: room_id.into(),
        }
    }

    /// Treats a missing or blank room id as the global scope.
    pub fn from_room_id(room_id: Option<&str>) -> Self {
        match room_id.map(str::trim) {
            Some(id) if !id.is_empty() => Scope::room(id),
            _ => Scope::Global,
        }
    }

    pub fn room_id(&self) -> Option<&str> {
        match self {
            Scope::Global => None,
            Scope::Room { room_id } => Some(room_id),
        }
    }

    pub fn is_global(&self) -> bool {
        matches!(self, Scope::Global)
    }
}

/// Global/Global and Room(x)/Room(x) compare; nothing else does.
pub fn in_same_scope(a: &Scope, b: &Scope) -> bool {
    match (a, b) {
        (Scope::Global, Scope::Global) => true,
        (Scope::Room { room_id: x }, Scope::Room { room_id: y }) => x == y,
        _ => false,
    }
}

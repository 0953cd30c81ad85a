//! Entity model shared by the store, the backend boundary and the feed.
//!
//! Rows crossing the wire tolerate unknown fields; the hosted store is
//! free to grow columns without breaking older clients.

pub mod message;
pub mod participant;
pub mod room;

pub use message::{Message, MessageKind, MessagePreview, MessageRow, MessageState, NewMessage, Poll};
pub use participant::{Participant, Role};
pub use room::{Room, Visibility};

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier of a room.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

/// Unique identifier of a user, issued by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

/// Unique identifier of a server-confirmed message.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

macro_rules! impl_id {
    ($name:ident) => {
        impl $name {
            /// Wrap a raw identifier string.
            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            /// The raw identifier string.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(raw: &str) -> Self {
                Self(raw.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(raw: String) -> Self {
                Self(raw)
            }
        }
    };
}

impl_id!(RoomId);
impl_id!(UserId);
impl_id!(MessageId);

/// Logical tables watched through the change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Rooms,
    RoomParticipants,
    Messages,
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rooms => f.write_str("rooms"),
            Self::RoomParticipants => f.write_str("room_participants"),
            Self::Messages => f.write_str("messages"),
        }
    }
}

/// Kind of change carried by a feed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Insert,
    Update,
    Delete,
}

/// A single insert/update/delete notification from the change feed.
///
/// The row is kept loosely typed until the reducer deserializes it; a
/// malformed row is a reducer-level drop, never a transport failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: EventKind,
    pub table: Table,
    pub row: serde_json::Value,
}

impl ChangeEvent {
    pub fn new(kind: EventKind, table: Table, row: serde_json::Value) -> Self {
        Self { kind, table, row }
    }
}

/// Push-channel key: either the global room list or a single room's
/// participants and messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Rooms,
    Room(RoomId),
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rooms => f.write_str("rooms"),
            Self::Room(id) => write!(f, "room:{}", id),
        }
    }
}

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::message::MessagePreview;
use super::{RoomId, UserId};
use crate::error::{Error, Result};

/// Who can discover and join a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Private,
}

/// A bounded chat channel with a lifecycle and a visibility mode.
///
/// `join_code` and `password_hash` are present iff the room is private;
/// [`Room::validate`] enforces the pairing. A room is never hard-deleted
/// by the engine — termination and expiry flip `active` off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    pub visibility: Visibility,
    pub owner_id: UserId,
    #[serde(default)]
    pub join_code: Option<String>,
    #[serde(default)]
    pub password_hash: Option<String>,
    pub active: bool,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub participant_count: u32,
    #[serde(default)]
    pub last_message: Option<MessagePreview>,
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Room {
    /// Construct an active room, generating no credentials.
    pub fn new_public(id: RoomId, name: impl Into<String>, owner_id: UserId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            name: name.into(),
            visibility: Visibility::Public,
            owner_id,
            join_code: None,
            password_hash: None,
            active: true,
            expires_at: None,
            participant_count: 0,
            last_message: None,
            updated_at: now,
            extra: Map::new(),
        }
    }

    /// Construct an active private room with its credentials.
    pub fn new_private(
        id: RoomId,
        name: impl Into<String>,
        owner_id: UserId,
        join_code: String,
        password_hash: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            visibility: Visibility::Private,
            owner_id,
            join_code: Some(join_code),
            password_hash: Some(password_hash),
            active: true,
            expires_at: None,
            participant_count: 0,
            last_message: None,
            updated_at: now,
            extra: Map::new(),
        }
    }

    pub fn is_private(&self) -> bool {
        self.visibility == Visibility::Private
    }

    pub fn is_owner(&self, user: &UserId) -> bool {
        &self.owner_id == user
    }

    /// Time left until the deadline; `None` when the room never expires
    /// on its own.
    pub fn time_remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.expires_at.map(|deadline| deadline - now)
    }

    /// Checks the credential/visibility pairing invariant.
    pub fn validate(&self) -> Result<()> {
        let has_credentials = self.join_code.is_some() && self.password_hash.is_some();
        match self.visibility {
            Visibility::Private if !has_credentials => Err(Error::conflict(format!(
                "private room {} is missing join credentials",
                self.id
            ))),
            Visibility::Public if self.join_code.is_some() || self.password_hash.is_some() => {
                Err(Error::conflict(format!(
                    "public room {} carries join credentials",
                    self.id
                )))
            }
            _ => Ok(()),
        }
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::room::Room;
use super::{RoomId, UserId};

/// Role of a participant within a room, derived from room ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Member,
}

/// A user's membership record in a room, keyed by `(room_id, user_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub joined_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Participant {
    /// A fresh membership row joining `user_id` to `room_id` at `now`.
    pub fn joining(room_id: RoomId, user_id: UserId, now: DateTime<Utc>) -> Self {
        Self {
            room_id,
            user_id,
            joined_at: now,
            last_activity: now,
            updated_at: now,
            extra: Map::new(),
        }
    }

    /// Role is not stored on the row; it follows the room's owner column.
    pub fn role(&self, room: &Room) -> Role {
        if room.is_owner(&self.user_id) {
            Role::Owner
        } else {
            Role::Member
        }
    }
}

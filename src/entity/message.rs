use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{MessageId, RoomId, UserId};
use crate::error::{Error, Result};

/// Kind of message payload. Unknown kinds from newer servers degrade to
/// [`MessageKind::Unknown`] instead of failing the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Code,
    Poll,
    Link,
    Quote,
    #[serde(other)]
    Unknown,
}

/// Structured options and tallies carried by a poll message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Poll {
    pub options: Vec<String>,
    #[serde(default)]
    pub multiple_choice: bool,
    /// Votes per option index. Each user holds at most one vote unless
    /// the poll is multiple-choice.
    #[serde(default)]
    pub votes: BTreeMap<usize, BTreeSet<UserId>>,
}

impl Poll {
    pub fn new(options: Vec<String>, multiple_choice: bool) -> Self {
        Self { options, multiple_choice, votes: BTreeMap::new() }
    }

    /// Record `user`'s vote for `option`.
    ///
    /// Single-choice polls move the user's existing vote; multiple-choice
    /// polls toggle the chosen option.
    pub fn cast(&mut self, user: &UserId, option: usize) -> Result<()> {
        if option >= self.options.len() {
            return Err(Error::conflict(format!(
                "poll has {} options, vote for index {} rejected",
                self.options.len(),
                option
            )));
        }
        if self.multiple_choice {
            let chosen = self.votes.entry(option).or_default();
            if !chosen.remove(user) {
                chosen.insert(user.clone());
            }
        } else {
            for voters in self.votes.values_mut() {
                voters.remove(user);
            }
            self.votes.entry(option).or_default().insert(user.clone());
        }
        Ok(())
    }

    /// Vote counts in option order.
    pub fn tally(&self) -> Vec<usize> {
        (0..self.options.len())
            .map(|i| self.votes.get(&i).map_or(0, BTreeSet::len))
            .collect()
    }
}

/// Denormalized cache of a room's most recent message, for list views.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePreview {
    pub author_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// A message row as stored and broadcast by the external store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: MessageId,
    /// Client-generated id correlating this row with its optimistic
    /// local counterpart. Absent for rows created by other clients.
    #[serde(default)]
    pub correlation_id: Option<String>,
    pub room_id: RoomId,
    pub author_id: UserId,
    pub content: String,
    pub kind: MessageKind,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub poll: Option<Poll>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Payload for a message insert issued by this client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub correlation_id: String,
    pub room_id: RoomId,
    pub author_id: UserId,
    pub content: String,
    pub kind: MessageKind,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub poll: Option<Poll>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// Confirmation state of a message in the local store.
///
/// An optimistic local entry stays `Pending` until the server echo with
/// the same correlation id replaces it in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MessageState {
    Pending { correlation_id: String },
    Confirmed { id: MessageId },
}

/// A message as held by the entity store and exposed in snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(flatten)]
    pub state: MessageState,
    pub room_id: RoomId,
    pub author_id: UserId,
    pub content: String,
    pub kind: MessageKind,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted: bool,
    pub poll: Option<Poll>,
    pub metadata: Option<Value>,
}

impl Message {
    /// Optimistic local entry for a send that has not been confirmed yet.
    pub fn pending(new: &NewMessage) -> Self {
        Self {
            state: MessageState::Pending { correlation_id: new.correlation_id.clone() },
            room_id: new.room_id.clone(),
            author_id: new.author_id.clone(),
            content: new.content.clone(),
            kind: new.kind,
            created_at: new.created_at,
            updated_at: new.created_at,
            deleted: false,
            poll: new.poll.clone(),
            metadata: new.metadata.clone(),
        }
    }

    /// Confirmed entry built from a server row.
    pub fn from_row(row: MessageRow) -> Self {
        Self {
            state: MessageState::Confirmed { id: row.id },
            room_id: row.room_id,
            author_id: row.author_id,
            content: row.content,
            kind: row.kind,
            created_at: row.created_at,
            updated_at: row.updated_at,
            deleted: row.deleted,
            poll: row.poll,
            metadata: row.metadata,
        }
    }

    pub fn id(&self) -> Option<&MessageId> {
        match &self.state {
            MessageState::Confirmed { id } => Some(id),
            MessageState::Pending { .. } => None,
        }
    }

    pub fn correlation_id(&self) -> Option<&str> {
        match &self.state {
            MessageState::Pending { correlation_id } => Some(correlation_id),
            MessageState::Confirmed { .. } => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.state, MessageState::Pending { .. })
    }

    /// Stable ordering key: chronological, ties broken by identity so
    /// that replaying the same log always yields the same sequence.
    pub fn order_key(&self) -> (DateTime<Utc>, &str) {
        let tie = match &self.state {
            MessageState::Confirmed { id } => id.as_str(),
            MessageState::Pending { correlation_id } => correlation_id.as_str(),
        };
        (self.created_at, tie)
    }

    pub fn preview(&self) -> MessagePreview {
        MessagePreview {
            author_id: self.author_id.clone(),
            content: self.content.clone(),
            created_at: self.created_at,
        }
    }
}

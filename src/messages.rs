//! Message synchronization: optimistic sends, edits, tombstones, votes.
//!
//! A send inserts a pending local entry keyed by a client-generated
//! correlation id; the server echo carrying the same id replaces it in
//! place, so the list never grows a duplicate or reorders under the
//! user's cursor. Edits and deletes are author-only and roll back their
//! optimistic mutation if the confirming write fails.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::Backend;
use crate::entity::{
    Message, MessageId, MessageKind, MessageRow, NewMessage, Poll, RoomId, UserId,
};
use crate::error::{Error, Result};
use crate::store::SharedStore;

pub struct MessageSynchronizer {
    store: SharedStore,
    backend: Arc<dyn Backend>,
    local_user: UserId,
}

impl MessageSynchronizer {
    pub fn new(store: SharedStore, backend: Arc<dyn Backend>, local_user: UserId) -> Self {
        Self { store, backend, local_user }
    }

    /// Send a message. Returns the correlation id of the optimistic
    /// entry so callers can track its confirmation.
    pub async fn send(
        &self,
        room_id: &RoomId,
        content: impl Into<String>,
        kind: MessageKind,
        metadata: Option<Value>,
    ) -> Result<String> {
        self.send_inner(room_id, content.into(), kind, None, metadata).await
    }

    /// Send a poll message with its structured options.
    pub async fn send_poll(
        &self,
        room_id: &RoomId,
        question: impl Into<String>,
        options: Vec<String>,
        multiple_choice: bool,
    ) -> Result<String> {
        if options.len() < 2 {
            return Err(Error::conflict("a poll needs at least two options"));
        }
        let poll = Poll::new(options, multiple_choice);
        self.send_inner(room_id, question.into(), MessageKind::Poll, Some(poll), None)
            .await
    }

    async fn send_inner(
        &self,
        room_id: &RoomId,
        content: String,
        kind: MessageKind,
        poll: Option<Poll>,
        metadata: Option<Value>,
    ) -> Result<String> {
        self.require_joined(room_id)?;

        let new = NewMessage {
            correlation_id: Uuid::new_v4().to_string(),
            room_id: room_id.clone(),
            author_id: self.local_user.clone(),
            content,
            kind,
            created_at: Utc::now(),
            poll,
            metadata,
        };
        self.store.with(|store| store.insert_pending(Message::pending(&new)));

        match self.backend.insert_message(&new).await {
            Ok(row) => {
                // Direct confirmation; the feed echo for the same row is
                // an idempotent re-apply.
                self.store.with(|store| store.integrate_message_row(row));
                debug!(room = %room_id, correlation = %new.correlation_id, "message confirmed");
                Ok(new.correlation_id)
            }
            Err(err) => {
                self.store.with(|store| {
                    store.evict_pending(room_id, &new.correlation_id);
                    if err.is_not_found() {
                        store.evict_room(room_id);
                    }
                });
                warn!(room = %room_id, %err, "send rolled back");
                Err(err)
            }
        }
    }

    /// Edit a message's content. Author-only; id and position are
    /// preserved.
    pub async fn edit(
        &self,
        room_id: &RoomId,
        message_id: &MessageId,
        content: impl Into<String>,
    ) -> Result<()> {
        let saved = self.authored_message(room_id, message_id)?;
        if saved.deleted {
            return Err(Error::conflict(format!("message {} is deleted", message_id)));
        }

        let content = content.into();
        let now = Utc::now();
        self.store
            .with(|store| store.edit_message(room_id, message_id, &content, now));

        let mut row = row_from(&saved, message_id);
        row.content = content;
        row.updated_at = now;
        self.write_back(room_id, message_id, row, saved).await
    }

    /// Tombstone a message. Author-only; the entry keeps its id and
    /// position, only the flag flips. Deleting twice is a no-op.
    pub async fn delete(&self, room_id: &RoomId, message_id: &MessageId) -> Result<()> {
        let saved = self.authored_message(room_id, message_id)?;
        if saved.deleted {
            debug!(message = %message_id, "delete is a no-op, already tombstoned");
            return Ok(());
        }

        let now = Utc::now();
        self.store
            .with(|store| store.tombstone_message(room_id, message_id, now));

        let mut row = row_from(&saved, message_id);
        row.deleted = true;
        row.updated_at = now;
        self.write_back(room_id, message_id, row, saved).await
    }

    /// Cast the local user's vote on a poll message.
    pub async fn vote(
        &self,
        room_id: &RoomId,
        message_id: &MessageId,
        option: usize,
    ) -> Result<()> {
        self.require_joined(room_id)?;

        let saved = self
            .store
            .with(|store| store.message(room_id, message_id))
            .ok_or_else(|| Error::not_found(format!("message {}", message_id)))?;
        if saved.is_pending() {
            return Err(Error::conflict("message is not confirmed yet"));
        }

        let mut voted = saved.clone();
        let poll = voted
            .poll
            .as_mut()
            .ok_or_else(|| Error::conflict(format!("message {} is not a poll", message_id)))?;
        poll.cast(&self.local_user, option)?;
        voted.updated_at = Utc::now();

        self.store.with(|store| store.replace_message(room_id, voted.clone()));

        let row = row_from(&voted, message_id);
        self.write_back(room_id, message_id, row, saved).await
    }

    /// Push an updated row, restoring `saved` locally if the write fails.
    async fn write_back(
        &self,
        room_id: &RoomId,
        message_id: &MessageId,
        row: MessageRow,
        saved: Message,
    ) -> Result<()> {
        match self.backend.update_message(&row).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.store.with(|store| store.replace_message(room_id, saved));
                warn!(message = %message_id, %err, "message write rolled back");
                Err(err)
            }
        }
    }

    fn require_joined(&self, room_id: &RoomId) -> Result<()> {
        if self.store.with(|store| store.is_joined(room_id)) {
            Ok(())
        } else {
            Err(Error::authorization(format!(
                "join room {} before posting to it",
                room_id
            )))
        }
    }

    /// Confirmed message authored by the local user, or the matching
    /// authorization/not-found error.
    fn authored_message(&self, room_id: &RoomId, message_id: &MessageId) -> Result<Message> {
        let message = self
            .store
            .with(|store| store.message(room_id, message_id))
            .ok_or_else(|| Error::not_found(format!("message {}", message_id)))?;
        if message.author_id != self.local_user {
            return Err(Error::authorization(format!(
                "message {} belongs to another author",
                message_id
            )));
        }
        Ok(message)
    }
}

/// Rebuild the wire row for a confirmed in-store message.
fn row_from(message: &Message, id: &MessageId) -> MessageRow {
    MessageRow {
        id: id.clone(),
        correlation_id: None,
        room_id: message.room_id.clone(),
        author_id: message.author_id.clone(),
        content: message.content.clone(),
        kind: message.kind,
        created_at: message.created_at,
        updated_at: message.updated_at,
        deleted: message.deleted,
        poll: message.poll.clone(),
        metadata: message.metadata.clone(),
        extra: serde_json::Map::new(),
    }
}

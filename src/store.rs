//! Process-local cache of rooms, participants and messages.
//!
//! The store is a pure reducer over change events plus a handful of named
//! local operations for optimistic state. Nothing outside this module
//! mutates the maps; reads hand out cloned snapshots. Replaying the same
//! event log against a fresh store always reproduces the same state,
//! which is what the deterministic tests lean on.
//!
//! Conflict resolution is last-write-wins on row `updated_at`: an event
//! older than the stored row is ignored, an equal or newer one is
//! applied. Clock skew between writers is accepted, not corrected.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::entity::{
    ChangeEvent, EventKind, Message, MessageId, MessageRow, Participant, Room, RoomId, Table,
    UserId,
};
use crate::error::{Error, Result};

/// Immutable snapshot of one room with everything a room screen renders.
#[derive(Debug, Clone)]
pub struct RoomView {
    pub room: Room,
    pub participants: Vec<Participant>,
    pub messages: Vec<Message>,
}

/// In-memory entity cache for a single engine instance.
pub struct EntityStore {
    local_user: UserId,
    rooms: HashMap<RoomId, Room>,
    participants: HashMap<RoomId, Vec<Participant>>,
    messages: HashMap<RoomId, Vec<Message>>,
    joined: HashSet<RoomId>,
}

impl EntityStore {
    pub fn new(local_user: UserId) -> Self {
        Self {
            local_user,
            rooms: HashMap::new(),
            participants: HashMap::new(),
            messages: HashMap::new(),
            joined: HashSet::new(),
        }
    }

    // ── Reducer over change events ──────────────────────────────────────

    /// Apply one change event. Malformed events are logged and dropped;
    /// one room's bad row must not corrupt the rest of the cache.
    pub fn apply(&mut self, event: &ChangeEvent) {
        let applied = match event.table {
            Table::Rooms => self.apply_room(event),
            Table::RoomParticipants => self.apply_participant(event),
            Table::Messages => self.apply_message(event),
        };
        if let Err(err) = applied {
            warn!(table = %event.table, %err, "dropping change event the reducer cannot apply");
        }
    }

    fn apply_room(&mut self, event: &ChangeEvent) -> Result<()> {
        match event.kind {
            EventKind::Insert | EventKind::Update => {
                let row: Room = serde_json::from_value(event.row.clone())?;
                self.upsert_room(row);
            }
            EventKind::Delete => {
                let id = row_id(&event.row)?;
                self.evict_room(&RoomId::from(id));
            }
        }
        Ok(())
    }

    fn apply_participant(&mut self, event: &ChangeEvent) -> Result<()> {
        match event.kind {
            EventKind::Insert | EventKind::Update => {
                let row: Participant = serde_json::from_value(event.row.clone())?;
                self.upsert_participant(row);
            }
            EventKind::Delete => {
                let row: Participant = serde_json::from_value(event.row.clone())?;
                self.remove_participant(&row.room_id, &row.user_id);
            }
        }
        Ok(())
    }

    fn apply_message(&mut self, event: &ChangeEvent) -> Result<()> {
        match event.kind {
            EventKind::Insert => {
                let row: MessageRow = serde_json::from_value(event.row.clone())?;
                self.integrate_message_row(row);
            }
            EventKind::Update => {
                let row: MessageRow = serde_json::from_value(event.row.clone())?;
                self.integrate_message_row(row);
            }
            EventKind::Delete => {
                // A physical delete from the feed is still rendered as a
                // tombstone; removing the id would shift every index the
                // UI is virtualizing over.
                let row: MessageRow = serde_json::from_value(event.row.clone())?;
                self.tombstone_message(&row.room_id, &row.id, row.updated_at);
            }
        }
        Ok(())
    }

    // ── Room reducers ───────────────────────────────────────────────────

    /// Insert or LWW-merge a room row.
    pub fn upsert_room(&mut self, mut row: Room) {
        if let Some(existing) = self.rooms.get(&row.id) {
            if existing.updated_at > row.updated_at {
                debug!(room = %row.id, "ignoring stale room row");
                return;
            }
            // The hosted store does not maintain the preview column; keep
            // the locally derived one when the incoming row lacks it.
            if row.last_message.is_none() {
                row.last_message = existing.last_message.clone();
            }
        }
        self.rooms.insert(row.id.clone(), row);
    }

    /// Drop a room and every index derived from it.
    pub fn evict_room(&mut self, id: &RoomId) {
        self.rooms.remove(id);
        self.participants.remove(id);
        self.messages.remove(id);
        self.joined.remove(id);
    }

    /// Flip a room inactive, stamping the local write time. Participant
    /// tracking for the room stops here.
    pub fn mark_room_inactive(&mut self, id: &RoomId, now: DateTime<Utc>) {
        self.participants.remove(id);
        self.joined.remove(id);
        if let Some(room) = self.rooms.get_mut(id) {
            room.active = false;
            room.updated_at = now;
            room.participant_count = 0;
        }
    }

    // ── Participant reducers ────────────────────────────────────────────

    /// Insert or LWW-merge a membership row, keeping the joined set and
    /// the derived participant count in step.
    pub fn upsert_participant(&mut self, row: Participant) {
        let rows = self.participants.entry(row.room_id.clone()).or_default();
        match rows.iter_mut().find(|p| p.user_id == row.user_id) {
            Some(existing) => {
                if existing.updated_at > row.updated_at {
                    debug!(room = %row.room_id, user = %row.user_id, "ignoring stale participant row");
                    return;
                }
                *existing = row;
            }
            None => {
                if row.user_id == self.local_user {
                    self.joined.insert(row.room_id.clone());
                }
                rows.push(row);
            }
        }
        self.refresh_participant_count();
    }

    /// Remove a membership row. Removing the local user also clears the
    /// room from the joined set.
    pub fn remove_participant(&mut self, room_id: &RoomId, user_id: &UserId) {
        if let Some(rows) = self.participants.get_mut(room_id) {
            rows.retain(|p| &p.user_id != user_id);
        }
        if user_id == &self.local_user {
            self.joined.remove(room_id);
        }
        self.refresh_participant_count();
    }

    fn refresh_participant_count(&mut self) {
        for (room_id, room) in self.rooms.iter_mut() {
            if let Some(rows) = self.participants.get(room_id) {
                room.participant_count = rows.len() as u32;
            }
        }
    }

    // ── Message reducers ────────────────────────────────────────────────

    /// Merge a server message row: confirm a matching pending entry in
    /// place, LWW-update a known id, or insert at the sorted position.
    pub fn integrate_message_row(&mut self, row: MessageRow) {
        let room_id = row.room_id.clone();
        let messages = self.messages.entry(room_id.clone()).or_default();

        let correlated = row
            .correlation_id
            .as_deref()
            .and_then(|cid| messages.iter().position(|m| m.correlation_id() == Some(cid)));
        if let Some(position) = correlated {
            // In-place replacement: same index, no duplicate.
            messages[position] = Message::from_row(row);
            self.refresh_last_message_for(&room_id);
            return;
        }

        if let Some(position) = messages.iter().position(|m| m.id() == Some(&row.id)) {
            if messages[position].updated_at > row.updated_at {
                debug!(message = %row.id, "ignoring stale message row");
                return;
            }
            messages[position] = Message::from_row(row);
            self.refresh_last_message_for(&room_id);
            return;
        }

        let message = Message::from_row(row);
        let position = messages
            .binary_search_by(|m| m.order_key().cmp(&message.order_key()))
            .unwrap_or_else(|insert_at| insert_at);
        messages.insert(position, message);
        self.refresh_last_message_for(&room_id);
    }

    /// Tombstone a message by id: the flag flips, the position and the
    /// sequence length never change.
    pub fn tombstone_message(&mut self, room_id: &RoomId, id: &MessageId, at: DateTime<Utc>) {
        if let Some(message) = self
            .messages
            .get_mut(room_id)
            .and_then(|rows| rows.iter_mut().find(|m| m.id() == Some(id)))
        {
            message.deleted = true;
            message.updated_at = at;
        }
        self.refresh_last_message_for(room_id);
    }

    /// Add an optimistic local message at its sorted position.
    pub fn insert_pending(&mut self, message: Message) {
        let room_id = message.room_id.clone();
        let messages = self.messages.entry(room_id.clone()).or_default();
        let position = messages
            .binary_search_by(|m| m.order_key().cmp(&message.order_key()))
            .unwrap_or_else(|insert_at| insert_at);
        messages.insert(position, message);
        self.refresh_last_message_for(&room_id);
    }

    /// Roll back an optimistic send that never reached the server. Unlike
    /// a tombstone this is a physical removal; the row has no identity to
    /// preserve.
    pub fn evict_pending(&mut self, room_id: &RoomId, correlation_id: &str) {
        if let Some(messages) = self.messages.get_mut(room_id) {
            messages.retain(|m| m.correlation_id() != Some(correlation_id));
        }
        self.refresh_last_message_for(room_id);
    }

    /// Edit a message in place, returning the previous content for
    /// rollback. Position and created_at are preserved.
    pub fn edit_message(
        &mut self,
        room_id: &RoomId,
        id: &MessageId,
        content: &str,
        now: DateTime<Utc>,
    ) -> Option<String> {
        let message = self
            .messages
            .get_mut(room_id)?
            .iter_mut()
            .find(|m| m.id() == Some(id))?;
        let previous = std::mem::replace(&mut message.content, content.to_owned());
        message.updated_at = now;
        self.refresh_last_message_for(room_id);
        Some(previous)
    }

    /// Replace a confirmed message wholesale, keeping its position. Used
    /// for local poll updates and for rolling back failed writes.
    pub fn replace_message(&mut self, room_id: &RoomId, replacement: Message) {
        if let Some(slot) = self
            .messages
            .get_mut(room_id)
            .and_then(|rows| rows.iter_mut().find(|m| m.id() == replacement.id()))
        {
            *slot = replacement;
        }
        self.refresh_last_message_for(room_id);
    }

    fn refresh_last_message_for(&mut self, room_id: &RoomId) {
        let preview = self
            .messages
            .get(room_id)
            .and_then(|rows| rows.iter().rev().find(|m| !m.deleted))
            .map(Message::preview);
        if let Some(room) = self.rooms.get_mut(room_id) {
            room.last_message = preview;
        }
    }

    // ── Resynchronization ───────────────────────────────────────────────

    /// Authoritative room-list refresh after (re)subscribing the list
    /// feed. Per-room caches for rooms still present are kept.
    pub fn replace_room_list(&mut self, rows: Vec<Room>) {
        let known: HashSet<RoomId> = rows.iter().map(|r| r.id.clone()).collect();
        let stale: Vec<RoomId> = self
            .rooms
            .keys()
            .filter(|id| !known.contains(*id))
            .cloned()
            .collect();
        for id in stale {
            self.evict_room(&id);
        }
        for row in rows {
            self.upsert_room(row);
        }
    }

    /// Authoritative single-room refresh. Pending local messages whose
    /// echo has not arrived survive the rebuild.
    pub fn replace_room_view(
        &mut self,
        room_id: &RoomId,
        participants: Vec<Participant>,
        rows: Vec<MessageRow>,
    ) {
        let pending: Vec<Message> = self
            .messages
            .remove(room_id)
            .unwrap_or_default()
            .into_iter()
            .filter(|m| {
                m.is_pending()
                    && !rows
                        .iter()
                        .any(|row| row.correlation_id.as_deref() == m.correlation_id())
            })
            .collect();

        self.joined.remove(room_id);
        self.participants.insert(room_id.clone(), Vec::new());
        for participant in participants {
            self.upsert_participant(participant);
        }

        self.messages.insert(room_id.clone(), Vec::new());
        for row in rows {
            self.integrate_message_row(row);
        }
        for message in pending {
            self.insert_pending(message);
        }
    }

    // ── Joined-set bookkeeping ──────────────────────────────────────────

    pub fn set_joined(&mut self, room_id: &RoomId, joined: bool) {
        if joined {
            self.joined.insert(room_id.clone());
        } else {
            self.joined.remove(room_id);
        }
    }

    pub fn is_joined(&self, room_id: &RoomId) -> bool {
        self.joined.contains(room_id)
    }

    // ── Snapshots ───────────────────────────────────────────────────────

    pub fn room(&self, id: &RoomId) -> Option<Room> {
        self.rooms.get(id).cloned()
    }

    /// All known rooms, stably ordered by id.
    pub fn rooms_snapshot(&self) -> Vec<Room> {
        let mut all: Vec<Room> = self.rooms.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn room_view(&self, id: &RoomId) -> Option<RoomView> {
        let room = self.rooms.get(id)?.clone();
        Some(RoomView {
            room,
            participants: self.participants.get(id).cloned().unwrap_or_default(),
            messages: self.messages.get(id).cloned().unwrap_or_default(),
        })
    }

    pub fn message(&self, room_id: &RoomId, id: &MessageId) -> Option<Message> {
        self.messages
            .get(room_id)?
            .iter()
            .find(|m| m.id() == Some(id))
            .cloned()
    }

    pub fn participant(&self, room_id: &RoomId, user_id: &UserId) -> Option<Participant> {
        self.participants
            .get(room_id)?
            .iter()
            .find(|p| &p.user_id == user_id)
            .cloned()
    }

    pub fn joined_room_ids(&self) -> HashSet<RoomId> {
        self.joined.clone()
    }
}

fn row_id(row: &serde_json::Value) -> Result<&str> {
    row.get("id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::conflict("delete event without a row id"))
}

/// Cheaply clonable handle to the store shared between the engine's
/// tasks. The lock is never held across an await point.
#[derive(Clone)]
pub struct SharedStore(Arc<Mutex<EntityStore>>);

impl SharedStore {
    pub fn new(local_user: UserId) -> Self {
        Self(Arc::new(Mutex::new(EntityStore::new(local_user))))
    }

    /// Run `f` against the store under the lock.
    pub fn with<R>(&self, f: impl FnOnce(&mut EntityStore) -> R) -> R {
        let mut guard = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }
}

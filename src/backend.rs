//! Boundary to the hosted relational store and its change-feed service.
//!
//! The engine only ever talks to [`Backend`]; the production transport
//! lives in the embedding application. [`MemoryBackend`] is the reference
//! implementation used by the test suite: the same tables, the same push
//! fan-out, plus fault-injection hooks for transport failures.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::entity::{
    ChangeEvent, EventKind, MessageId, MessageRow, NewMessage, Participant, Room, RoomId, Table,
    Topic, UserId,
};
use crate::error::{Error, Result};

/// CRUD and subscription surface of the external store.
///
/// Rows mirror the entity shapes; every row carries `updated_at` so the
/// entity store can resolve conflicts by last-write-wins.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn fetch_rooms(&self) -> Result<Vec<Room>>;

    async fn fetch_room(&self, id: &RoomId) -> Result<Room>;

    async fn fetch_participants(&self, room: &RoomId) -> Result<Vec<Participant>>;

    async fn fetch_messages(&self, room: &RoomId) -> Result<Vec<MessageRow>>;

    async fn insert_room(&self, row: &Room) -> Result<()>;

    async fn update_room(&self, row: &Room) -> Result<()>;

    /// Upsert semantics: inserting an existing `(room, user)` row is a
    /// no-op success, which is what makes double-join races harmless.
    async fn insert_participant(&self, row: &Participant) -> Result<()>;

    async fn delete_participant(&self, room: &RoomId, user: &UserId) -> Result<()>;

    /// Insert a message and return the authoritative row, echoing the
    /// client's correlation id.
    async fn insert_message(&self, new: &NewMessage) -> Result<MessageRow>;

    async fn update_message(&self, row: &MessageRow) -> Result<()>;

    /// Refresh the caller's `last_activity` on its participant row.
    async fn touch_presence(&self, room: &RoomId, user: &UserId, at: DateTime<Utc>) -> Result<()>;

    /// Open a push channel for `topic`. At-least-once delivery; ordering
    /// is only monotonic per row, never across tables.
    fn subscribe(&self, topic: &Topic) -> broadcast::Receiver<ChangeEvent>;
}

/// In-memory store with broadcast fan-out, for tests and replay.
pub struct MemoryBackend {
    rooms: RwLock<HashMap<RoomId, Room>>,
    participants: RwLock<HashMap<RoomId, BTreeMap<UserId, Participant>>>,
    messages: RwLock<HashMap<RoomId, Vec<MessageRow>>>,
    channels: StdMutex<HashMap<Topic, broadcast::Sender<ChangeEvent>>>,
    channel_capacity: usize,
    fail_writes: AtomicU32,
    refuse_subscriptions: AtomicBool,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            participants: RwLock::new(HashMap::new()),
            messages: RwLock::new(HashMap::new()),
            channels: StdMutex::new(HashMap::new()),
            channel_capacity: 64,
            fail_writes: AtomicU32::new(0),
            refuse_subscriptions: AtomicBool::new(false),
        }
    }

    /// Make the next `n` write operations fail with a transport error.
    pub fn fail_next_writes(&self, n: u32) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    /// Drop the push channel for `topic`, disconnecting its subscribers.
    pub fn close_topic(&self, topic: &Topic) {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels.remove(topic);
    }

    /// When set, new subscriptions are handed an already-dead channel,
    /// which exhausts the feed client's retries.
    pub fn refuse_subscriptions(&self, refuse: bool) {
        self.refuse_subscriptions.store(refuse, Ordering::SeqCst);
    }

    /// Publish a hand-built event, bypassing the tables. Lets tests
    /// replay arbitrary delivery orders.
    pub fn publish_raw(&self, topic: &Topic, event: ChangeEvent) {
        self.publish(topic, event);
    }

    fn take_write_fault(&self) -> Result<()> {
        let remaining = self.fail_writes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_writes.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::transport("injected write failure"));
        }
        Ok(())
    }

    fn publish(&self, topic: &Topic, event: ChangeEvent) {
        let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(sender) = channels.get(topic) {
            // No receivers is fine; nobody is watching this topic.
            let _ = sender.send(event);
        }
    }

    fn publish_row<T: serde::Serialize>(&self, topic: &Topic, kind: EventKind, table: Table, row: &T) {
        match serde_json::to_value(row) {
            Ok(value) => self.publish(topic, ChangeEvent::new(kind, table, value)),
            Err(err) => debug!(%table, %err, "skipping change event for unserializable row"),
        }
    }

    async fn republish_room(&self, room_id: &RoomId, kind: EventKind) {
        let rooms = self.rooms.read().await;
        if let Some(room) = rooms.get(room_id) {
            self.publish_row(&Topic::Rooms, kind, Table::Rooms, room);
            self.publish_row(&Topic::Room(room_id.clone()), kind, Table::Rooms, room);
        }
    }

    async fn refresh_participant_count(&self, room_id: &RoomId) {
        let count = {
            let participants = self.participants.read().await;
            participants.get(room_id).map_or(0, |rows| rows.len() as u32)
        };
        {
            let mut rooms = self.rooms.write().await;
            if let Some(room) = rooms.get_mut(room_id) {
                room.participant_count = count;
                room.updated_at = Utc::now();
            }
        }
        self.republish_room(room_id, EventKind::Update).await;
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn fetch_rooms(&self) -> Result<Vec<Room>> {
        let rooms = self.rooms.read().await;
        let mut all: Vec<Room> = rooms.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    async fn fetch_room(&self, id: &RoomId) -> Result<Room> {
        let rooms = self.rooms.read().await;
        rooms
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("room {}", id)))
    }

    async fn fetch_participants(&self, room: &RoomId) -> Result<Vec<Participant>> {
        let participants = self.participants.read().await;
        Ok(participants
            .get(room)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn fetch_messages(&self, room: &RoomId) -> Result<Vec<MessageRow>> {
        let messages = self.messages.read().await;
        let mut rows = messages.get(room).cloned().unwrap_or_default();
        rows.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Ok(rows)
    }

    async fn insert_room(&self, row: &Room) -> Result<()> {
        self.take_write_fault()?;
        row.validate()?;
        {
            let mut rooms = self.rooms.write().await;
            if rooms.contains_key(&row.id) {
                return Err(Error::conflict(format!("room {} already exists", row.id)));
            }
            rooms.insert(row.id.clone(), row.clone());
        }
        self.republish_room(&row.id, EventKind::Insert).await;
        Ok(())
    }

    async fn update_room(&self, row: &Room) -> Result<()> {
        self.take_write_fault()?;
        {
            let mut rooms = self.rooms.write().await;
            let existing = rooms
                .get_mut(&row.id)
                .ok_or_else(|| Error::not_found(format!("room {}", row.id)))?;
            *existing = row.clone();
            existing.updated_at = Utc::now();
        }
        self.republish_room(&row.id, EventKind::Update).await;
        Ok(())
    }

    async fn insert_participant(&self, row: &Participant) -> Result<()> {
        self.take_write_fault()?;
        {
            let rooms = self.rooms.read().await;
            if !rooms.contains_key(&row.room_id) {
                return Err(Error::not_found(format!("room {}", row.room_id)));
            }
        }
        let inserted = {
            let mut participants = self.participants.write().await;
            let rows = participants.entry(row.room_id.clone()).or_default();
            if rows.contains_key(&row.user_id) {
                false
            } else {
                rows.insert(row.user_id.clone(), row.clone());
                true
            }
        };
        if inserted {
            self.publish_row(
                &Topic::Room(row.room_id.clone()),
                EventKind::Insert,
                Table::RoomParticipants,
                row,
            );
            self.refresh_participant_count(&row.room_id).await;
        }
        Ok(())
    }

    async fn delete_participant(&self, room: &RoomId, user: &UserId) -> Result<()> {
        self.take_write_fault()?;
        let removed = {
            let mut participants = self.participants.write().await;
            participants.get_mut(room).and_then(|rows| rows.remove(user))
        };
        match removed {
            Some(row) => {
                self.publish_row(
                    &Topic::Room(room.clone()),
                    EventKind::Delete,
                    Table::RoomParticipants,
                    &row,
                );
                self.refresh_participant_count(room).await;
                Ok(())
            }
            None => Err(Error::not_found(format!("participant {} in room {}", user, room))),
        }
    }

    async fn insert_message(&self, new: &NewMessage) -> Result<MessageRow> {
        self.take_write_fault()?;
        {
            let rooms = self.rooms.read().await;
            if !rooms.contains_key(&new.room_id) {
                return Err(Error::not_found(format!("room {}", new.room_id)));
            }
        }
        let row = MessageRow {
            id: MessageId::new(format!("msg_{}", Uuid::new_v4())),
            correlation_id: Some(new.correlation_id.clone()),
            room_id: new.room_id.clone(),
            author_id: new.author_id.clone(),
            content: new.content.clone(),
            kind: new.kind,
            created_at: new.created_at,
            updated_at: Utc::now(),
            deleted: false,
            poll: new.poll.clone(),
            metadata: new.metadata.clone(),
            extra: serde_json::Map::new(),
        };
        {
            let mut messages = self.messages.write().await;
            messages.entry(new.room_id.clone()).or_default().push(row.clone());
        }
        self.publish_row(
            &Topic::Room(new.room_id.clone()),
            EventKind::Insert,
            Table::Messages,
            &row,
        );
        Ok(row)
    }

    async fn update_message(&self, row: &MessageRow) -> Result<()> {
        self.take_write_fault()?;
        let stamped = {
            let mut messages = self.messages.write().await;
            let rows = messages
                .get_mut(&row.room_id)
                .ok_or_else(|| Error::not_found(format!("room {}", row.room_id)))?;
            let existing = rows
                .iter_mut()
                .find(|candidate| candidate.id == row.id)
                .ok_or_else(|| Error::not_found(format!("message {}", row.id)))?;
            *existing = row.clone();
            existing.updated_at = Utc::now();
            existing.clone()
        };
        self.publish_row(
            &Topic::Room(row.room_id.clone()),
            EventKind::Update,
            Table::Messages,
            &stamped,
        );
        Ok(())
    }

    async fn touch_presence(&self, room: &RoomId, user: &UserId, at: DateTime<Utc>) -> Result<()> {
        self.take_write_fault()?;
        let touched = {
            let mut participants = self.participants.write().await;
            match participants.get_mut(room).and_then(|rows| rows.get_mut(user)) {
                Some(row) => {
                    row.last_activity = at;
                    row.updated_at = at;
                    Some(row.clone())
                }
                None => None,
            }
        };
        match touched {
            Some(row) => {
                self.publish_row(
                    &Topic::Room(room.clone()),
                    EventKind::Update,
                    Table::RoomParticipants,
                    &row,
                );
                Ok(())
            }
            None => Err(Error::not_found(format!("participant {} in room {}", user, room))),
        }
    }

    fn subscribe(&self, topic: &Topic) -> broadcast::Receiver<ChangeEvent> {
        if self.refuse_subscriptions.load(Ordering::SeqCst) {
            // Hand out a receiver whose sender is gone; the feed client
            // observes an immediate disconnect.
            let (sender, receiver) = broadcast::channel(1);
            drop(sender);
            return receiver;
        }
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(topic.clone())
            .or_insert_with(|| broadcast::channel(self.channel_capacity).0)
            .subscribe()
    }
}

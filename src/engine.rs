//! Engine facade: wiring, task lifecycle and the public operation set.
//!
//! A `SyncEngine` is constructor-injected with its backend, identity and
//! config; nothing lives in module-level state, so independent instances
//! can run side by side in one process (two tabs, two tests). `init()`
//! brings the instance up, `dispose()` tears it down.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures::Stream;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::config::SyncConfig;
use crate::entity::{MessageId, MessageKind, Participant, Room, RoomId, Topic, UserId};
use crate::error::{Error, Result};
use crate::feed::{FeedNotice, FeedSubscription};
use crate::lifecycle::{LifecycleManager, LifecycleSignal, WatchLevel};
use crate::membership::{Credentials, MembershipController, NewRoom};
use crate::messages::MessageSynchronizer;
use crate::presence::{Presence, PresenceTracker};
use crate::store::{RoomView, SharedStore};

/// Opaque inputs from the identity provider. The engine never manages
/// login; it only carries what it was given.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: UserId,
    pub access_token: Option<String>,
}

impl Identity {
    pub fn new(user_id: UserId) -> Self {
        Self { user_id, access_token: None }
    }
}

/// Everything the engine pushes at the UI collaborator: lifecycle
/// transitions to navigate on, and staleness it can only fix by a
/// manual refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineSignal {
    ExpiringSoon(RoomId),
    Expired(RoomId),
    Terminated(RoomId),
    Stale(Topic),
}

/// Client-side synchronization engine for one authenticated user.
pub struct SyncEngine {
    backend: Arc<dyn Backend>,
    store: SharedStore,
    config: SyncConfig,
    identity: Identity,
    membership: MembershipController,
    messages: MessageSynchronizer,
    presence: PresenceTracker,
    lifecycle: Arc<LifecycleManager>,
    notice_tx: mpsc::Sender<FeedNotice>,
    notice_rx: Mutex<Option<mpsc::Receiver<FeedNotice>>>,
    lifecycle_rx: Mutex<Option<mpsc::Receiver<LifecycleSignal>>>,
    signal_tx: mpsc::Sender<EngineSignal>,
    signal_rx: Mutex<Option<mpsc::Receiver<EngineSignal>>>,
    subscriptions: Mutex<HashMap<Topic, FeedSubscription>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    disposed: AtomicBool,
}

impl SyncEngine {
    pub fn new(backend: Arc<dyn Backend>, identity: Identity, config: SyncConfig) -> Result<Self> {
        config.validate()?;

        let store = SharedStore::new(identity.user_id.clone());
        let (notice_tx, notice_rx) = mpsc::channel(config.event_queue_depth);
        let (lifecycle_tx, lifecycle_rx) = mpsc::channel(config.event_queue_depth);
        let (signal_tx, signal_rx) = mpsc::channel(config.event_queue_depth);

        let membership = MembershipController::new(
            store.clone(),
            backend.clone(),
            identity.user_id.clone(),
        );
        let messages = MessageSynchronizer::new(
            store.clone(),
            backend.clone(),
            identity.user_id.clone(),
        );
        let presence = PresenceTracker::new(
            store.clone(),
            backend.clone(),
            identity.user_id.clone(),
            config.clone(),
        );
        let lifecycle = Arc::new(LifecycleManager::new(
            store.clone(),
            backend.clone(),
            identity.user_id.clone(),
            config.clone(),
            lifecycle_tx,
        ));

        Ok(Self {
            backend,
            store,
            config,
            identity,
            membership,
            messages,
            presence,
            lifecycle,
            notice_tx,
            notice_rx: Mutex::new(Some(notice_rx)),
            lifecycle_rx: Mutex::new(Some(lifecycle_rx)),
            signal_tx,
            signal_rx: Mutex::new(Some(signal_rx)),
            subscriptions: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        })
    }

    /// Bring the engine up: fetch the room list, subscribe its feed and
    /// start the reducer and lifecycle tasks.
    pub async fn init(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::conflict("engine is already initialized"));
        }

        let rooms = self.backend.fetch_rooms().await?;
        let watchable: Vec<RoomId> = rooms
            .iter()
            .filter(|room| room.active)
            .map(|room| room.id.clone())
            .collect();
        self.store.with(|store| store.replace_room_list(rooms));
        for room_id in watchable {
            self.lifecycle.watch(room_id, WatchLevel::Background);
        }

        self.subscribe(Topic::Rooms);
        self.spawn_drain_task()?;
        self.spawn_signal_forwarder()?;
        self.spawn_ticker();
        info!(user = %self.identity.user_id, "sync engine initialized");
        Ok(())
    }

    /// Tear the engine down: unsubscribe every topic, stop the tasks and
    /// attempt one final presence write. Idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut subscriptions = lock(&self.subscriptions);
            for (_, mut subscription) in subscriptions.drain() {
                subscription.unsubscribe();
            }
        }
        self.presence.shutdown().await;
        let tasks = {
            let mut tasks = lock(&self.tasks);
            std::mem::take(&mut *tasks)
        };
        for task in tasks {
            task.abort();
        }
        debug!(user = %self.identity.user_id, "sync engine disposed");
    }

    /// Take the signal receiver. Available once; the UI collaborator
    /// owns it afterwards.
    pub fn signals(&self) -> Option<mpsc::Receiver<EngineSignal>> {
        lock(&self.signal_rx).take()
    }

    /// The same signals as a stream, for UI layers that compose with
    /// stream combinators.
    pub fn signal_stream(&self) -> Option<impl Stream<Item = EngineSignal>> {
        self.signals().map(ReceiverStream::new)
    }

    // ── Room feeds ──────────────────────────────────────────────────────

    /// Start viewing a room: full resync of its entities, a per-room
    /// feed subscription and a fast lifecycle cadence.
    pub async fn open_room(&self, room_id: &RoomId) -> Result<()> {
        resync_room(&*self.backend, &self.store, room_id).await?;
        self.subscribe(Topic::Room(room_id.clone()));
        self.lifecycle.watch(room_id.clone(), WatchLevel::Viewed);
        Ok(())
    }

    /// Stop viewing a room. Safe to call repeatedly; the subscription
    /// teardown is idempotent and pending writes are left to finish.
    pub fn close_room(&self, room_id: &RoomId) {
        let removed = {
            let mut subscriptions = lock(&self.subscriptions);
            subscriptions.remove(&Topic::Room(room_id.clone()))
        };
        if let Some(mut subscription) = removed {
            subscription.unsubscribe();
        }
        self.lifecycle.watch(room_id.clone(), WatchLevel::Background);
    }

    fn subscribe(&self, topic: Topic) {
        let mut subscriptions = lock(&self.subscriptions);
        if subscriptions.contains_key(&topic) {
            return;
        }
        let subscription = FeedSubscription::spawn(
            self.backend.clone(),
            topic.clone(),
            self.notice_tx.clone(),
            &self.config,
        );
        subscriptions.insert(topic, subscription);
    }

    // ── Snapshots ───────────────────────────────────────────────────────

    pub fn rooms(&self) -> Vec<Room> {
        self.store.with(|store| store.rooms_snapshot())
    }

    pub fn room_view(&self, room_id: &RoomId) -> Option<RoomView> {
        self.store.with(|store| store.room_view(room_id))
    }

    pub fn joined_room_ids(&self) -> HashSet<RoomId> {
        self.store.with(|store| store.joined_room_ids())
    }

    /// Authoritative room-list refresh on demand (pull-to-refresh, or
    /// recovery after a stale signal).
    pub async fn refresh_rooms(&self) -> Result<Vec<Room>> {
        let rooms = self.backend.fetch_rooms().await?;
        self.store.with(|store| store.replace_room_list(rooms));
        Ok(self.rooms())
    }

    // ── Membership operations ───────────────────────────────────────────

    pub async fn create_room(&self, new: NewRoom) -> Result<Room> {
        let room = self.membership.create_room(new).await?;
        self.lifecycle.watch(room.id.clone(), WatchLevel::Background);
        Ok(room)
    }

    pub async fn join(&self, room_id: &RoomId, credentials: Option<&Credentials>) -> Result<()> {
        self.membership.join(room_id, credentials).await?;
        self.lifecycle.watch(room_id.clone(), WatchLevel::Background);
        Ok(())
    }

    pub async fn join_by_code(
        &self,
        join_code: &str,
        credentials: Option<&Credentials>,
    ) -> Result<RoomId> {
        let room_id = self.membership.join_by_code(join_code, credentials).await?;
        self.lifecycle.watch(room_id.clone(), WatchLevel::Background);
        Ok(room_id)
    }

    pub async fn leave(&self, room_id: &RoomId) -> Result<()> {
        self.membership.leave(room_id).await
    }

    pub async fn terminate(&self, room_id: &RoomId) -> Result<()> {
        self.membership.terminate(room_id).await?;
        self.lifecycle.note_terminated(room_id, Utc::now());
        Ok(())
    }

    /// Owner-only deadline extension; returns the new deadline.
    pub async fn extend(&self, room_id: &RoomId) -> Result<chrono::DateTime<Utc>> {
        self.lifecycle.extend(room_id).await
    }

    // ── Message operations ──────────────────────────────────────────────

    pub async fn send(
        &self,
        room_id: &RoomId,
        content: impl Into<String>,
        kind: MessageKind,
        metadata: Option<Value>,
    ) -> Result<String> {
        self.messages.send(room_id, content, kind, metadata).await
    }

    pub async fn send_poll(
        &self,
        room_id: &RoomId,
        question: impl Into<String>,
        options: Vec<String>,
        multiple_choice: bool,
    ) -> Result<String> {
        self.messages.send_poll(room_id, question, options, multiple_choice).await
    }

    pub async fn edit(
        &self,
        room_id: &RoomId,
        message_id: &MessageId,
        content: impl Into<String>,
    ) -> Result<()> {
        self.messages.edit(room_id, message_id, content).await
    }

    pub async fn delete(&self, room_id: &RoomId, message_id: &MessageId) -> Result<()> {
        self.messages.delete(room_id, message_id).await
    }

    pub async fn vote(&self, room_id: &RoomId, message_id: &MessageId, option: usize) -> Result<()> {
        self.messages.vote(room_id, message_id, option).await
    }

    // ── Presence ────────────────────────────────────────────────────────

    /// Report local user activity (pointer/key events, debounced).
    pub async fn touch(&self, room_id: &RoomId) -> Result<()> {
        self.presence.touch(room_id).await
    }

    pub fn presence_of(&self, participant: &Participant) -> Presence {
        self.presence.presence_of(participant, Utc::now())
    }

    // ── Internal tasks ──────────────────────────────────────────────────

    fn spawn_drain_task(&self) -> Result<()> {
        let mut notice_rx = lock(&self.notice_rx)
            .take()
            .ok_or_else(|| Error::conflict("event queue already drained"))?;
        let backend = self.backend.clone();
        let store = self.store.clone();
        let signal_tx = self.signal_tx.clone();

        let task = tokio::spawn(async move {
            while let Some(notice) = notice_rx.recv().await {
                match notice {
                    FeedNotice::Event(event) => {
                        store.with(|store| store.apply(&event));
                    }
                    FeedNotice::Resync(Topic::Rooms) => match backend.fetch_rooms().await {
                        Ok(rooms) => store.with(|store| store.replace_room_list(rooms)),
                        Err(err) => warn!(%err, "room list resync failed"),
                    },
                    FeedNotice::Resync(Topic::Room(room_id)) => {
                        if let Err(err) = resync_room(&*backend, &store, &room_id).await {
                            warn!(room = %room_id, %err, "room resync failed");
                        }
                    }
                    FeedNotice::Stale(topic) => {
                        warn!(%topic, "subscription went stale");
                        let _ = signal_tx.send(EngineSignal::Stale(topic)).await;
                    }
                }
            }
        });
        lock(&self.tasks).push(task);
        Ok(())
    }

    fn spawn_signal_forwarder(&self) -> Result<()> {
        let mut lifecycle_rx = lock(&self.lifecycle_rx)
            .take()
            .ok_or_else(|| Error::conflict("lifecycle channel already drained"))?;
        let signal_tx = self.signal_tx.clone();

        let task = tokio::spawn(async move {
            while let Some(signal) = lifecycle_rx.recv().await {
                let forwarded = match signal {
                    LifecycleSignal::ExpiringSoon(id) => EngineSignal::ExpiringSoon(id),
                    LifecycleSignal::Expired(id) => EngineSignal::Expired(id),
                    LifecycleSignal::Terminated(id) => EngineSignal::Terminated(id),
                };
                if signal_tx.send(forwarded).await.is_err() {
                    break;
                }
            }
        });
        lock(&self.tasks).push(task);
        Ok(())
    }

    fn spawn_ticker(&self) {
        let lifecycle = self.lifecycle.clone();
        let cadence = self.config.viewed_tick;

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(cadence);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                lifecycle.tick(Utc::now());
            }
        });
        lock(&self.tasks).push(task);
    }
}

/// Full per-room refresh: room row, participants and messages, merged
/// through the store's reducers. A room gone from the server evicts its
/// local leftovers.
async fn resync_room(backend: &dyn Backend, store: &SharedStore, room_id: &RoomId) -> Result<()> {
    let room = match backend.fetch_room(room_id).await {
        Ok(room) => room,
        Err(err) if err.is_not_found() => {
            store.with(|store| store.evict_room(room_id));
            return Err(err);
        }
        Err(err) => return Err(err),
    };
    let participants = backend.fetch_participants(room_id).await?;
    let messages = backend.fetch_messages(room_id).await?;
    store.with(|store| {
        store.upsert_room(room);
        store.replace_room_view(room_id, participants, messages);
    });
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

//! Room lifecycle: deadline tracking and terminal transitions.
//!
//! One central ticker evaluates every watched room instead of each view
//! running its own countdown; rooms being viewed are checked at 1 Hz,
//! background list entries far less often. Terminal phases absorb all
//! further ticks, so a transition fires exactly once per instance.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::config::SyncConfig;
use crate::entity::{Room, RoomId, UserId};
use crate::error::{Error, Result};
use crate::store::SharedStore;

/// Phase of a room's lifecycle state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomPhase {
    Active,
    ExpiringSoon,
    Expired,
    Terminated,
}

impl RoomPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Expired | Self::Terminated)
    }
}

/// How closely a watched room's deadline is re-evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchLevel {
    /// The room is on screen; tick every second.
    Viewed,
    /// The room is only a list entry; tick about once a minute.
    Background,
}

/// Lifecycle transitions surfaced to the UI collaborator, which reacts
/// by warning the user or navigating away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleSignal {
    ExpiringSoon(RoomId),
    Expired(RoomId),
    Terminated(RoomId),
}

struct Watch {
    level: WatchLevel,
    phase: RoomPhase,
    last_eval: Option<DateTime<Utc>>,
}

/// Owns the watched-room table and the expiry state machine.
pub struct LifecycleManager {
    store: SharedStore,
    backend: Arc<dyn Backend>,
    config: SyncConfig,
    local_user: UserId,
    watched: Mutex<HashMap<RoomId, Watch>>,
    signals: mpsc::Sender<LifecycleSignal>,
}

impl LifecycleManager {
    pub fn new(
        store: SharedStore,
        backend: Arc<dyn Backend>,
        local_user: UserId,
        config: SyncConfig,
        signals: mpsc::Sender<LifecycleSignal>,
    ) -> Self {
        Self {
            store,
            backend,
            config,
            local_user,
            watched: Mutex::new(HashMap::new()),
            signals,
        }
    }

    /// Start (or re-level) deadline tracking for a room. The first tick
    /// after this call evaluates the room regardless of cadence.
    pub fn watch(&self, room_id: RoomId, level: WatchLevel) {
        let mut watched = self.watched.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        watched
            .entry(room_id)
            .and_modify(|watch| {
                watch.level = level;
                watch.last_eval = None;
            })
            .or_insert(Watch { level, phase: RoomPhase::Active, last_eval: None });
    }

    pub fn unwatch(&self, room_id: &RoomId) {
        let mut watched = self.watched.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        watched.remove(room_id);
    }

    /// Current phase of a watched room, if tracked.
    pub fn phase(&self, room_id: &RoomId) -> Option<RoomPhase> {
        let watched = self.watched.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        watched.get(room_id).map(|watch| watch.phase)
    }

    /// One pass of the central ticker. Errors in a single room's
    /// recomputation are logged and deferred to the next tick.
    pub fn tick(&self, now: DateTime<Utc>) {
        let due: Vec<RoomId> = {
            let mut watched = self.watched.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            watched
                .iter_mut()
                .filter_map(|(id, watch)| {
                    if watch.phase.is_terminal() {
                        return None;
                    }
                    let cadence = match watch.level {
                        WatchLevel::Viewed => self.config.viewed_tick,
                        WatchLevel::Background => self.config.background_tick,
                    };
                    let cadence = Duration::from_std(cadence).unwrap_or_else(|_| Duration::seconds(1));
                    let is_due = watch.last_eval.map_or(true, |at| now - at >= cadence);
                    if is_due {
                        watch.last_eval = Some(now);
                        Some(id.clone())
                    } else {
                        None
                    }
                })
                .collect()
        };

        for room_id in due {
            if let Err(err) = self.evaluate(&room_id, now) {
                warn!(room = %room_id, %err, "lifecycle recomputation failed, deferring to next tick");
            }
        }
    }

    /// Explicit termination path, also used when a remote terminate
    /// arrives. Idempotent: a room already in a terminal phase is left
    /// alone.
    pub fn note_terminated(&self, room_id: &RoomId, now: DateTime<Utc>) {
        {
            let mut watched = self.watched.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            watched.entry(room_id.clone()).or_insert(Watch {
                level: WatchLevel::Background,
                phase: RoomPhase::Active,
                last_eval: Some(now),
            });
        }
        self.transition(room_id, RoomPhase::Terminated, now);
    }

    /// Owner-only deadline extension. Returns the new deadline.
    pub async fn extend(&self, room_id: &RoomId) -> Result<DateTime<Utc>> {
        let mut room: Room = self
            .store
            .with(|store| store.room(room_id))
            .ok_or_else(|| Error::not_found(format!("room {}", room_id)))?;

        if !room.is_owner(&self.local_user) {
            return Err(Error::authorization("only the room owner may extend its deadline"));
        }
        if !room.active {
            return Err(Error::conflict(format!("room {} is no longer active", room_id)));
        }
        let deadline = room
            .expires_at
            .ok_or_else(|| Error::conflict(format!("room {} has no deadline to extend", room_id)))?;

        let now = Utc::now();
        let extended = deadline + self.config.extension_increment();
        room.expires_at = Some(extended);
        room.updated_at = now;

        self.backend.update_room(&room).await?;
        self.store.with(|store| store.upsert_room(room.clone()));

        // A deadline pushed past the warning threshold re-arms the
        // expiring-soon transition.
        let next = self.phase_for(&room, now);
        self.transition(room_id, next, now);
        debug!(room = %room_id, %extended, "room deadline extended");
        Ok(extended)
    }

    fn evaluate(&self, room_id: &RoomId, now: DateTime<Utc>) -> Result<()> {
        let Some(room) = self.store.with(|store| store.room(room_id)) else {
            // The room vanished from the store; stop tracking it.
            self.unwatch(room_id);
            return Ok(());
        };
        let next = self.phase_for(&room, now);
        self.transition(room_id, next, now);
        Ok(())
    }

    fn phase_for(&self, room: &Room, now: DateTime<Utc>) -> RoomPhase {
        if !room.active {
            // An inactive row can mean either terminal cause; a passed
            // deadline reads as expiry, anything else as termination.
            return match room.expires_at {
                Some(deadline) if now >= deadline => RoomPhase::Expired,
                _ => RoomPhase::Terminated,
            };
        }
        match room.expires_at {
            None => RoomPhase::Active,
            Some(deadline) if now >= deadline => RoomPhase::Expired,
            Some(deadline) if deadline - now <= self.config.expiry_warning() => {
                RoomPhase::ExpiringSoon
            }
            Some(_) => RoomPhase::Active,
        }
    }

    fn transition(&self, room_id: &RoomId, next: RoomPhase, now: DateTime<Utc>) {
        let fire = {
            let mut watched = self.watched.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            match watched.get_mut(room_id) {
                Some(watch) if !watch.phase.is_terminal() && watch.phase != next => {
                    watch.phase = next;
                    true
                }
                _ => false,
            }
        };
        if !fire {
            return;
        }

        let signal = match next {
            RoomPhase::Active => None,
            RoomPhase::ExpiringSoon => Some(LifecycleSignal::ExpiringSoon(room_id.clone())),
            RoomPhase::Expired => {
                self.store.with(|store| store.mark_room_inactive(room_id, now));
                Some(LifecycleSignal::Expired(room_id.clone()))
            }
            RoomPhase::Terminated => {
                self.store.with(|store| store.mark_room_inactive(room_id, now));
                Some(LifecycleSignal::Terminated(room_id.clone()))
            }
        };
        if let Some(signal) = signal {
            if self.signals.try_send(signal).is_err() {
                warn!(room = %room_id, "lifecycle signal dropped, receiver is full or gone");
            }
        }
    }
}

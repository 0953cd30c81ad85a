//! Presence: liveness heartbeats and online/offline inference.
//!
//! There is no disconnect signal in the system; a participant is shown
//! online while their `last_activity` is fresh, and quietly ages out
//! otherwise. Heartbeats are debounced so pointer noise does not turn
//! into a write per event.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::config::SyncConfig;
use crate::entity::{Participant, RoomId, UserId};
use crate::error::Result;
use crate::store::SharedStore;

/// Heuristic liveness state inferred from activity recency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Online,
    Offline,
}

pub struct PresenceTracker {
    store: SharedStore,
    backend: Arc<dyn Backend>,
    local_user: UserId,
    config: SyncConfig,
    last_beat: Mutex<HashMap<RoomId, DateTime<Utc>>>,
}

impl PresenceTracker {
    pub fn new(
        store: SharedStore,
        backend: Arc<dyn Backend>,
        local_user: UserId,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            backend,
            local_user,
            config,
            last_beat: Mutex::new(HashMap::new()),
        }
    }

    /// Report local user activity in a room. Calls inside the debounce
    /// window are absorbed without a write.
    pub async fn touch(&self, room_id: &RoomId) -> Result<()> {
        self.touch_at(room_id, Utc::now()).await
    }

    pub(crate) async fn touch_at(&self, room_id: &RoomId, now: DateTime<Utc>) -> Result<()> {
        if !self.store.with(|store| store.is_joined(room_id)) {
            // Nothing to report against; the user has no row here.
            return Ok(());
        }

        let debounced = {
            let mut beats = self.last_beat.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            match beats.get(room_id) {
                Some(last) if now - *last < min_interval(&self.config) => true,
                _ => {
                    beats.insert(room_id.clone(), now);
                    false
                }
            }
        };
        if debounced {
            return Ok(());
        }

        self.store.with(|store| {
            if let Some(mut row) = store.participant(room_id, &self.local_user) {
                row.last_activity = now;
                row.updated_at = now;
                store.upsert_participant(row);
            }
        });

        if let Err(err) = self.backend.touch_presence(room_id, &self.local_user, now).await {
            warn!(room = %room_id, %err, "presence heartbeat failed");
            return Err(err);
        }
        Ok(())
    }

    /// Infer a participant's liveness from the freshness of their
    /// `last_activity`. A heuristic, not a guarantee.
    pub fn presence_of(&self, participant: &Participant, now: DateTime<Utc>) -> Presence {
        if now - participant.last_activity <= self.config.presence_window() {
            Presence::Online
        } else {
            Presence::Offline
        }
    }

    /// Best-effort final heartbeat for every joined room. Failures are
    /// logged and otherwise unobserved; teardown must not block on them.
    pub async fn shutdown(&self) {
        let rooms = self.store.with(|store| store.joined_room_ids());
        let now = Utc::now();
        for room_id in rooms {
            if let Err(err) = self.backend.touch_presence(&room_id, &self.local_user, now).await {
                debug!(room = %room_id, %err, "final presence write failed");
            }
        }
    }
}

fn min_interval(config: &SyncConfig) -> chrono::Duration {
    chrono::Duration::from_std(config.heartbeat_min_interval)
        .unwrap_or_else(|_| chrono::Duration::seconds(30))
}

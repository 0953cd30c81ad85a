//! Membership: join, leave, terminate and room creation.
//!
//! Authorization is checked before any write leaves the client: a wrong
//! password or a non-owner terminate produces zero mutation, locally and
//! remotely. Joins are optimistic — the participant row lands in the
//! store immediately and is rolled back if the confirming write fails.

use std::sync::Arc;

use chrono::Utc;
use rand::distr::Alphanumeric;
use rand::Rng;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::Backend;
use crate::entity::{Participant, Room, RoomId, UserId, Visibility};
use crate::error::{Error, Result};
use crate::store::SharedStore;

/// Length of generated private-room join codes.
const JOIN_CODE_LEN: usize = 6;

/// Credentials presented when joining a private room. The password is
/// already hashed by the identity layer; the engine only compares.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub password_hash: String,
}

/// Parameters for creating a room.
#[derive(Debug, Clone)]
pub struct NewRoom {
    pub name: String,
    pub visibility: Visibility,
    /// Required for private rooms; opaque to the engine.
    pub password_hash: Option<String>,
    /// Lifetime from creation; `None` means the room never expires on
    /// its own.
    pub expires_in: Option<chrono::Duration>,
}

/// Enforces membership rules and writes membership state through.
pub struct MembershipController {
    store: SharedStore,
    backend: Arc<dyn Backend>,
    local_user: UserId,
}

impl MembershipController {
    pub fn new(store: SharedStore, backend: Arc<dyn Backend>, local_user: UserId) -> Self {
        Self { store, backend, local_user }
    }

    /// Create a room owned by the local user, who becomes its first
    /// participant. Private rooms get a generated join code.
    pub async fn create_room(&self, new: NewRoom) -> Result<Room> {
        let now = Utc::now();
        let id = RoomId::new(format!("room_{}", Uuid::new_v4()));

        let mut room = match new.visibility {
            Visibility::Public => {
                if new.password_hash.is_some() {
                    return Err(Error::conflict("public rooms take no password"));
                }
                Room::new_public(id, new.name, self.local_user.clone(), now)
            }
            Visibility::Private => {
                let password_hash = new
                    .password_hash
                    .ok_or_else(|| Error::conflict("private rooms require a password"))?;
                Room::new_private(
                    id,
                    new.name,
                    self.local_user.clone(),
                    generate_join_code(),
                    password_hash,
                    now,
                )
            }
        };
        room.expires_at = new.expires_in.map(|lifetime| now + lifetime);

        self.backend.insert_room(&room).await?;
        let membership = Participant::joining(room.id.clone(), self.local_user.clone(), now);
        self.backend.insert_participant(&membership).await?;

        self.store.with(|store| {
            store.upsert_room(room.clone());
            store.upsert_participant(membership);
            store.set_joined(&room.id, true);
        });
        debug!(room = %room.id, "room created");
        Ok(room)
    }

    /// Join a room. Re-joining a room the user is already in succeeds as
    /// a no-op; joining a private room requires matching credentials
    /// before anything is written.
    pub async fn join(&self, room_id: &RoomId, credentials: Option<&Credentials>) -> Result<()> {
        let room = self.resolve_room(room_id).await?;

        if !room.active {
            return Err(Error::conflict(format!("room {} is no longer active", room_id)));
        }

        let already_joined = self
            .store
            .with(|store| store.participant(room_id, &self.local_user).is_some());
        if already_joined {
            debug!(room = %room_id, "join is a no-op, membership already present");
            return Ok(());
        }

        if room.is_private() {
            let presented = credentials.map(|c| c.password_hash.as_str());
            if presented != room.password_hash.as_deref() {
                return Err(Error::authorization(format!(
                    "wrong password for room {}",
                    room_id
                )));
            }
        }

        let membership = Participant::joining(room_id.clone(), self.local_user.clone(), Utc::now());
        self.store.with(|store| {
            store.upsert_participant(membership.clone());
            store.set_joined(room_id, true);
        });

        match self.backend.insert_participant(&membership).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.store.with(|store| {
                    store.remove_participant(room_id, &self.local_user);
                    store.set_joined(room_id, false);
                    if err.is_not_found() {
                        store.evict_room(room_id);
                    }
                });
                warn!(room = %room_id, %err, "join rolled back");
                Err(err)
            }
        }
    }

    /// Resolve a private room by its join code, then join it.
    pub async fn join_by_code(
        &self,
        join_code: &str,
        credentials: Option<&Credentials>,
    ) -> Result<RoomId> {
        let cached = self.store.with(|store| {
            store
                .rooms_snapshot()
                .into_iter()
                .find(|room| room.join_code.as_deref() == Some(join_code))
                .map(|room| room.id)
        });
        let room_id = match cached {
            Some(id) => id,
            None => {
                let rooms = self.backend.fetch_rooms().await?;
                let room = rooms
                    .into_iter()
                    .find(|room| room.join_code.as_deref() == Some(join_code))
                    .ok_or_else(|| Error::not_found(format!("no room with join code {join_code}")))?;
                let id = room.id.clone();
                self.store.with(|store| store.upsert_room(room));
                id
            }
        };
        self.join(&room_id, credentials).await?;
        Ok(room_id)
    }

    /// Leave a room. The owner leaving does not terminate the room;
    /// ownership stays on the room row.
    pub async fn leave(&self, room_id: &RoomId) -> Result<()> {
        let Some(saved) = self
            .store
            .with(|store| store.participant(room_id, &self.local_user))
        else {
            debug!(room = %room_id, "leave is a no-op, no membership present");
            return Ok(());
        };

        self.store
            .with(|store| store.remove_participant(room_id, &self.local_user));

        match self.backend.delete_participant(room_id, &self.local_user).await {
            Ok(()) => Ok(()),
            // Already gone server-side; the optimistic removal stands.
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => {
                self.store.with(|store| store.upsert_participant(saved));
                warn!(room = %room_id, %err, "leave rolled back");
                Err(err)
            }
        }
    }

    /// Terminate a room. Owner-only; an already-terminated room is a
    /// conflict the caller may treat as a success no-op.
    pub async fn terminate(&self, room_id: &RoomId) -> Result<()> {
        let mut room = self.resolve_room(room_id).await?;

        if !room.is_owner(&self.local_user) {
            return Err(Error::authorization(format!(
                "only the owner may terminate room {}",
                room_id
            )));
        }
        if !room.active {
            return Err(Error::conflict(format!("room {} is already terminated", room_id)));
        }

        let now = Utc::now();
        room.active = false;
        room.updated_at = now;
        self.backend.update_room(&room).await?;
        self.store.with(|store| store.mark_room_inactive(room_id, now));
        debug!(room = %room_id, "room terminated");
        Ok(())
    }

    /// Room from the local cache, falling back to an authoritative
    /// fetch. A room missing on both sides evicts any local leftovers.
    async fn resolve_room(&self, room_id: &RoomId) -> Result<Room> {
        if let Some(room) = self.store.with(|store| store.room(room_id)) {
            return Ok(room);
        }
        match self.backend.fetch_room(room_id).await {
            Ok(room) => {
                self.store.with(|store| store.upsert_room(room.clone()));
                Ok(room)
            }
            Err(err) => {
                if err.is_not_found() {
                    self.store.with(|store| store.evict_room(room_id));
                }
                Err(err)
            }
        }
    }
}

fn generate_join_code() -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(JOIN_CODE_LEN)
        .map(char::from)
        .collect::<String>()
        .to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn me() -> UserId {
        UserId::new("me")
    }

    async fn setup() -> (MembershipController, SharedStore, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let store = SharedStore::new(me());
        let controller = MembershipController::new(store.clone(), backend.clone(), me());
        (controller, store, backend)
    }

    async fn seed_public_room(backend: &MemoryBackend, id: &str, owner: &str) -> Room {
        let room = Room::new_public(RoomId::new(id), "seeded", UserId::new(owner), Utc::now());
        backend.insert_room(&room).await.expect("seed room");
        room
    }

    async fn seed_private_room(backend: &MemoryBackend, id: &str, password_hash: &str) -> Room {
        let room = Room::new_private(
            RoomId::new(id),
            "hidden",
            UserId::new("owner"),
            "AB12CD".into(),
            password_hash.into(),
            Utc::now(),
        );
        backend.insert_room(&room).await.expect("seed room");
        room
    }

    #[tokio::test]
    async fn join_twice_leaves_one_membership() {
        let (controller, store, backend) = setup().await;
        seed_public_room(&backend, "r1", "owner").await;

        controller.join(&RoomId::new("r1"), None).await.expect("first join");
        controller.join(&RoomId::new("r1"), None).await.expect("second join no-op");

        let rows = backend.fetch_participants(&RoomId::new("r1")).await.expect("fetch");
        assert_eq!(rows.len(), 1);
        assert!(store.with(|s| s.is_joined(&RoomId::new("r1"))));
    }

    #[tokio::test]
    async fn private_room_join_checks_password_before_writing() {
        let (controller, store, backend) = setup().await;
        seed_private_room(&backend, "r1", "hashedABC").await;

        let wrong = Credentials { password_hash: "wrong".into() };
        let err = controller
            .join(&RoomId::new("r1"), Some(&wrong))
            .await
            .expect_err("wrong password rejected");
        assert!(err.is_authorization());
        let rows = backend.fetch_participants(&RoomId::new("r1")).await.expect("fetch");
        assert!(rows.is_empty(), "no write on mismatch");
        assert!(!store.with(|s| s.is_joined(&RoomId::new("r1"))));

        let right = Credentials { password_hash: "hashedABC".into() };
        controller.join(&RoomId::new("r1"), Some(&right)).await.expect("correct password");
        assert!(store.with(|s| s.is_joined(&RoomId::new("r1"))));
    }

    #[tokio::test]
    async fn missing_credentials_are_rejected() {
        let (controller, _store, backend) = setup().await;
        seed_private_room(&backend, "r1", "hashedABC").await;

        let err = controller
            .join(&RoomId::new("r1"), None)
            .await
            .expect_err("credentials required");
        assert!(err.is_authorization());
    }

    #[tokio::test]
    async fn failed_join_rolls_back_optimistic_state() {
        let (controller, store, backend) = setup().await;
        seed_public_room(&backend, "r1", "owner").await;

        // Make the room known locally first so no fetch burns the fault.
        let room = backend.fetch_room(&RoomId::new("r1")).await.expect("fetch");
        store.with(|s| s.upsert_room(room));

        backend.fail_next_writes(1);
        let err = controller.join(&RoomId::new("r1"), None).await.expect_err("write fails");
        assert!(err.is_transport());
        assert!(!store.with(|s| s.is_joined(&RoomId::new("r1"))));
        assert!(store.with(|s| s.participant(&RoomId::new("r1"), &me()).is_none()));
    }

    #[tokio::test]
    async fn owner_leaving_does_not_terminate() {
        let (controller, store, backend) = setup().await;
        seed_public_room(&backend, "r1", "me").await;

        controller.join(&RoomId::new("r1"), None).await.expect("owner joins own room");
        controller.leave(&RoomId::new("r1")).await.expect("owner leaves");

        let room = backend.fetch_room(&RoomId::new("r1")).await.expect("fetch");
        assert!(room.active, "room survives its owner leaving");
        assert!(!store.with(|s| s.is_joined(&RoomId::new("r1"))));
    }

    #[tokio::test]
    async fn non_owner_terminate_is_rejected_without_mutation() {
        let (controller, store, backend) = setup().await;
        seed_public_room(&backend, "r1", "someone-else").await;
        controller.join(&RoomId::new("r1"), None).await.expect("join");

        let err = controller.terminate(&RoomId::new("r1")).await.expect_err("not the owner");
        assert!(err.is_authorization());

        let room = backend.fetch_room(&RoomId::new("r1")).await.expect("fetch");
        assert!(room.active);
        assert_eq!(room.participant_count, 1);
        assert!(store.with(|s| s.is_joined(&RoomId::new("r1"))));
    }

    #[tokio::test]
    async fn terminate_twice_is_a_conflict() {
        let (controller, _store, backend) = setup().await;
        seed_public_room(&backend, "r1", "me").await;

        controller.terminate(&RoomId::new("r1")).await.expect("first terminate");
        let err = controller.terminate(&RoomId::new("r1")).await.expect_err("second terminate");
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn created_private_room_carries_code_and_owner_membership() {
        let (controller, store, backend) = setup().await;

        let room = controller
            .create_room(NewRoom {
                name: "study".into(),
                visibility: Visibility::Private,
                password_hash: Some("hashed".into()),
                expires_in: Some(chrono::Duration::minutes(30)),
            })
            .await
            .expect("create");

        assert_eq!(room.join_code.as_ref().map(String::len), Some(JOIN_CODE_LEN));
        assert!(room.expires_at.is_some());
        room.validate().expect("credential pairing holds");

        let rows = backend.fetch_participants(&room.id).await.expect("fetch");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].user_id, me());
        assert!(store.with(|s| s.is_joined(&room.id)));
    }

    #[tokio::test]
    async fn join_by_code_resolves_the_room() {
        let (controller, _store, backend) = setup().await;
        let seeded = seed_private_room(&backend, "r1", "hashedABC").await;
        let code = seeded.join_code.clone().expect("seeded code");

        let credentials = Credentials { password_hash: "hashedABC".into() };
        let room_id = controller
            .join_by_code(&code, Some(&credentials))
            .await
            .expect("join by code");
        assert_eq!(room_id, RoomId::new("r1"));
    }

    #[tokio::test]
    async fn joining_a_vanished_room_self_heals() {
        let (controller, store, _backend) = setup().await;
        // Room exists only locally; the store fetch comes back empty.
        store.with(|s| {
            s.upsert_room(Room::new_public(RoomId::new("ghost"), "gone", me(), Utc::now()))
        });
        store.with(|s| s.evict_room(&RoomId::new("ghost")));

        let err = controller
            .join(&RoomId::new("ghost"), None)
            .await
            .expect_err("room is gone");
        assert!(err.is_not_found());
        assert!(store.with(|s| s.room(&RoomId::new("ghost")).is_none()));
    }
}

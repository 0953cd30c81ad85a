use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;
use uuid::Uuid;

use parlor_sync::backend::MemoryBackend;
use parlor_sync::Backend;
use parlor_sync::engine::{EngineSignal, Identity, SyncEngine};
use parlor_sync::entity::{MessageKind, Room, RoomId, Topic, UserId, Visibility};
use parlor_sync::membership::{Credentials, NewRoom};
use parlor_sync::SyncConfig;

/// Config with test-friendly cadences: fast lifecycle ticks and fast
/// feed backoff so failure paths finish in milliseconds.
fn fast_config() -> SyncConfig {
    SyncConfig {
        viewed_tick: Duration::from_millis(20),
        background_tick: Duration::from_millis(50),
        feed_backoff_base: Duration::from_millis(2),
        feed_backoff_cap: Duration::from_millis(10),
        feed_max_retries: 3,
        ..SyncConfig::default()
    }
}

async fn engine_for(backend: Arc<MemoryBackend>, user: &str) -> SyncEngine {
    let engine = SyncEngine::new(backend, Identity::new(UserId::new(user)), fast_config())
        .expect("engine builds");
    engine.init().await.expect("engine initializes");
    engine
}

/// Let spawned tasks drain the feed queues.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(80)).await;
}

fn random_user() -> String {
    format!("user_{}", Uuid::new_v4())
}

async fn seed_public_room(backend: &MemoryBackend, id: &str, owner: &str) -> Room {
    let room = Room::new_public(RoomId::new(id), "seeded", UserId::new(owner), Utc::now());
    backend.insert_room(&room).await.expect("seed room");
    room
}

#[tokio::test]
async fn join_is_idempotent_across_calls() -> Result<()> {
    let backend = Arc::new(MemoryBackend::new());
    seed_public_room(&backend, "r1", "owner").await;
    let engine = engine_for(backend.clone(), &random_user()).await;

    engine.join(&RoomId::new("r1"), None).await?;
    engine.join(&RoomId::new("r1"), None).await?;

    let rows = backend.fetch_participants(&RoomId::new("r1")).await?;
    assert_eq!(rows.len(), 1, "exactly one membership row");
    assert!(engine.joined_room_ids().contains(&RoomId::new("r1")));

    engine.dispose().await;
    Ok(())
}

#[tokio::test]
async fn private_room_join_scenario() -> Result<()> {
    let backend = Arc::new(MemoryBackend::new());
    let room = Room::new_private(
        RoomId::new("r1"),
        "hideout",
        UserId::new("owner"),
        "AB12CD".into(),
        "hashedABC".into(),
        Utc::now(),
    );
    backend.insert_room(&room).await?;
    let engine = engine_for(backend.clone(), &random_user()).await;

    let wrong = Credentials { password_hash: "wrong".into() };
    let err = engine
        .join(&RoomId::new("r1"), Some(&wrong))
        .await
        .expect_err("wrong password");
    assert!(err.is_authorization());
    assert_eq!(backend.fetch_participants(&RoomId::new("r1")).await?.len(), 0);

    let correct = Credentials { password_hash: "hashedABC".into() };
    engine.join(&RoomId::new("r1"), Some(&correct)).await?;
    assert!(engine.joined_room_ids().contains(&RoomId::new("r1")));

    engine.dispose().await;
    Ok(())
}

#[tokio::test]
async fn optimistic_send_merges_with_echo() -> Result<()> {
    let backend = Arc::new(MemoryBackend::new());
    seed_public_room(&backend, "r1", "owner").await;
    let engine = engine_for(backend.clone(), &random_user()).await;

    engine.join(&RoomId::new("r1"), None).await?;
    engine.open_room(&RoomId::new("r1")).await?;

    engine.send(&RoomId::new("r1"), "hello", MessageKind::Text, None).await?;
    settle().await;

    // Direct confirmation plus the feed echo: still exactly one entry.
    let view = engine.room_view(&RoomId::new("r1")).expect("room view");
    assert_eq!(view.messages.len(), 1);
    assert!(!view.messages[0].is_pending());
    assert_eq!(view.messages[0].content, "hello");

    engine.dispose().await;
    Ok(())
}

#[tokio::test]
async fn messages_flow_between_clients() -> Result<()> {
    let backend = Arc::new(MemoryBackend::new());
    seed_public_room(&backend, "r1", "owner").await;
    let alice = engine_for(backend.clone(), "alice").await;
    let bob = engine_for(backend.clone(), "bob").await;

    alice.join(&RoomId::new("r1"), None).await?;
    bob.join(&RoomId::new("r1"), None).await?;
    alice.open_room(&RoomId::new("r1")).await?;
    bob.open_room(&RoomId::new("r1")).await?;

    alice.send(&RoomId::new("r1"), "hi bob", MessageKind::Text, None).await?;
    settle().await;

    let bob_view = bob.room_view(&RoomId::new("r1")).expect("bob's view");
    assert_eq!(bob_view.messages.len(), 1);
    assert_eq!(bob_view.messages[0].content, "hi bob");
    assert_eq!(bob_view.messages[0].author_id, UserId::new("alice"));

    // Edits propagate with the same id and position.
    let id = bob_view.messages[0].id().cloned().expect("confirmed id");
    alice.edit(&RoomId::new("r1"), &id, "hi bob!").await?;
    settle().await;
    let bob_view = bob.room_view(&RoomId::new("r1")).expect("bob's view");
    assert_eq!(bob_view.messages[0].content, "hi bob!");

    // A delete arrives as a tombstone, not a removal.
    alice.delete(&RoomId::new("r1"), &id).await?;
    settle().await;
    let bob_view = bob.room_view(&RoomId::new("r1")).expect("bob's view");
    assert_eq!(bob_view.messages.len(), 1);
    assert!(bob_view.messages[0].deleted);

    alice.dispose().await;
    bob.dispose().await;
    Ok(())
}

#[tokio::test]
async fn non_author_edits_are_rejected() -> Result<()> {
    let backend = Arc::new(MemoryBackend::new());
    seed_public_room(&backend, "r1", "owner").await;
    let alice = engine_for(backend.clone(), "alice").await;
    let bob = engine_for(backend.clone(), "bob").await;

    alice.join(&RoomId::new("r1"), None).await?;
    bob.join(&RoomId::new("r1"), None).await?;
    alice.open_room(&RoomId::new("r1")).await?;
    bob.open_room(&RoomId::new("r1")).await?;

    alice.send(&RoomId::new("r1"), "mine", MessageKind::Text, None).await?;
    settle().await;

    let id = bob
        .room_view(&RoomId::new("r1"))
        .expect("bob's view")
        .messages[0]
        .id()
        .cloned()
        .expect("confirmed id");
    let err = bob
        .edit(&RoomId::new("r1"), &id, "defaced")
        .await
        .expect_err("bob is not the author");
    assert!(err.is_authorization());

    settle().await;
    let view = alice.room_view(&RoomId::new("r1")).expect("alice's view");
    assert_eq!(view.messages[0].content, "mine", "content untouched");

    alice.dispose().await;
    bob.dispose().await;
    Ok(())
}

#[tokio::test]
async fn terminate_is_owner_only_and_signalled() -> Result<()> {
    let backend = Arc::new(MemoryBackend::new());
    let owner = engine_for(backend.clone(), "owner").await;
    let room = owner
        .create_room(NewRoom {
            name: "ours".into(),
            visibility: Visibility::Public,
            password_hash: None,
            expires_in: None,
        })
        .await?;

    let guest = engine_for(backend.clone(), "guest").await;
    let mut guest_signals = guest.signals().expect("signals receiver");
    guest.join(&room.id, None).await?;
    guest.open_room(&room.id).await?;

    let err = guest.terminate(&room.id).await.expect_err("guest may not terminate");
    assert!(err.is_authorization());
    assert!(backend.fetch_room(&room.id).await?.active, "no mutation on rejection");

    owner.terminate(&room.id).await?;
    settle().await;

    // Guest's ticker sees the inactive row and tells the UI to leave.
    let signal = tokio::time::timeout(Duration::from_secs(2), guest_signals.recv())
        .await
        .expect("signal before timeout")
        .expect("channel open");
    assert_eq!(signal, EngineSignal::Terminated(room.id.clone()));
    assert!(!guest.room_view(&room.id).expect("view").room.active);

    owner.dispose().await;
    guest.dispose().await;
    Ok(())
}

#[tokio::test]
async fn expiry_fires_once_and_evicts() -> Result<()> {
    let backend = Arc::new(MemoryBackend::new());
    let owner = engine_for(backend.clone(), "owner").await;
    let mut signals = owner.signals().expect("signals receiver");

    let room = owner
        .create_room(NewRoom {
            name: "short-lived".into(),
            visibility: Visibility::Public,
            password_hash: None,
            expires_in: Some(chrono::Duration::milliseconds(150)),
        })
        .await?;
    owner.open_room(&room.id).await?;

    // A deadline this close is already inside the warning window, so an
    // expiring-soon signal may precede the expiry itself.
    let expired = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match signals.recv().await {
                Some(EngineSignal::Expired(id)) => break id,
                Some(EngineSignal::ExpiringSoon(_)) => continue,
                other => panic!("unexpected signal {:?}", other),
            }
        }
    })
    .await
    .expect("expiry before timeout");
    assert_eq!(expired, room.id);
    assert!(!owner.room_view(&room.id).expect("view").room.active);

    // Several more ticks pass; the transition stays single-fire.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(signals.try_recv().is_err(), "no duplicate transition");

    owner.dispose().await;
    Ok(())
}

#[tokio::test]
async fn extension_postpones_the_deadline() -> Result<()> {
    let backend = Arc::new(MemoryBackend::new());
    let owner = engine_for(backend.clone(), "owner").await;

    let room = owner
        .create_room(NewRoom {
            name: "extendable".into(),
            visibility: Visibility::Public,
            password_hash: None,
            expires_in: Some(chrono::Duration::seconds(20)),
        })
        .await?;

    let original = room.expires_at.expect("deadline set");
    let extended = owner.extend(&room.id).await?;
    assert_eq!(extended, original + chrono::Duration::minutes(30));

    let stored = backend.fetch_room(&room.id).await?;
    assert_eq!(stored.expires_at, Some(extended), "write-through to the store");

    owner.dispose().await;
    Ok(())
}

#[tokio::test]
async fn join_by_code_reaches_the_hidden_room() -> Result<()> {
    let backend = Arc::new(MemoryBackend::new());
    let owner = engine_for(backend.clone(), "owner").await;
    let room = owner
        .create_room(NewRoom {
            name: "invitation only".into(),
            visibility: Visibility::Private,
            password_hash: Some("hashed".into()),
            expires_in: None,
        })
        .await?;
    let code = room.join_code.clone().expect("generated code");

    let guest = engine_for(backend.clone(), "guest").await;
    let credentials = Credentials { password_hash: "hashed".into() };
    let joined = guest.join_by_code(&code, Some(&credentials)).await?;
    assert_eq!(joined, room.id);
    assert!(guest.joined_room_ids().contains(&room.id));

    owner.dispose().await;
    guest.dispose().await;
    Ok(())
}

#[tokio::test]
async fn presence_propagates_between_clients() -> Result<()> {
    let backend = Arc::new(MemoryBackend::new());
    seed_public_room(&backend, "r1", "owner").await;
    let alice = engine_for(backend.clone(), "alice").await;
    let bob = engine_for(backend.clone(), "bob").await;

    alice.join(&RoomId::new("r1"), None).await?;
    bob.join(&RoomId::new("r1"), None).await?;
    bob.open_room(&RoomId::new("r1")).await?;

    alice.touch(&RoomId::new("r1")).await?;
    settle().await;

    let view = bob.room_view(&RoomId::new("r1")).expect("bob's view");
    let alice_row = view
        .participants
        .iter()
        .find(|p| p.user_id == UserId::new("alice"))
        .expect("alice's row");
    assert_eq!(
        bob.presence_of(alice_row),
        parlor_sync::Presence::Online,
        "fresh activity reads as online"
    );

    alice.dispose().await;
    bob.dispose().await;
    Ok(())
}

#[tokio::test]
async fn dropped_feed_resyncs_the_room() -> Result<()> {
    let backend = Arc::new(MemoryBackend::new());
    seed_public_room(&backend, "r1", "owner").await;
    let alice = engine_for(backend.clone(), "alice").await;
    let bob = engine_for(backend.clone(), "bob").await;

    alice.join(&RoomId::new("r1"), None).await?;
    bob.join(&RoomId::new("r1"), None).await?;
    bob.open_room(&RoomId::new("r1")).await?;

    // Kill the push channel; messages sent while it is down are only
    // recoverable through the resync fetch.
    backend.close_topic(&Topic::Room(RoomId::new("r1")));
    alice.send(&RoomId::new("r1"), "sent during outage", MessageKind::Text, None).await?;
    settle().await;

    let view = bob.room_view(&RoomId::new("r1")).expect("bob's view");
    assert!(
        view.messages.iter().any(|m| m.content == "sent during outage"),
        "resync recovered the gap"
    );

    alice.dispose().await;
    bob.dispose().await;
    Ok(())
}

#[tokio::test]
async fn exhausted_feed_surfaces_stale_signal() -> Result<()> {
    let backend = Arc::new(MemoryBackend::new());
    seed_public_room(&backend, "r1", "owner").await;
    let engine = engine_for(backend.clone(), &random_user()).await;
    let mut signals = engine.signals().expect("signals receiver");

    engine.join(&RoomId::new("r1"), None).await?;
    backend.refuse_subscriptions(true);
    backend.close_topic(&Topic::Room(RoomId::new("r1")));
    engine.open_room(&RoomId::new("r1")).await?;

    let signal = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match signals.recv().await {
                Some(EngineSignal::Stale(topic)) => break topic,
                Some(_) => continue,
                None => panic!("signal channel closed"),
            }
        }
    })
    .await
    .expect("stale before timeout");
    assert_eq!(signal, Topic::Room(RoomId::new("r1")));

    engine.dispose().await;
    Ok(())
}

#[tokio::test]
async fn concurrent_votes_settle_on_the_feed() -> Result<()> {
    let backend = Arc::new(MemoryBackend::new());
    seed_public_room(&backend, "r1", "owner").await;
    let alice = engine_for(backend.clone(), "alice").await;
    let bob = engine_for(backend.clone(), "bob").await;

    alice.join(&RoomId::new("r1"), None).await?;
    bob.join(&RoomId::new("r1"), None).await?;
    alice.open_room(&RoomId::new("r1")).await?;
    bob.open_room(&RoomId::new("r1")).await?;

    alice
        .send_poll(&RoomId::new("r1"), "lunch?", vec!["soup".into(), "salad".into()], false)
        .await?;
    settle().await;

    let id = bob
        .room_view(&RoomId::new("r1"))
        .expect("bob's view")
        .messages[0]
        .id()
        .cloned()
        .expect("confirmed id");

    alice.vote(&RoomId::new("r1"), &id, 0).await?;
    settle().await;
    bob.vote(&RoomId::new("r1"), &id, 1).await?;
    settle().await;

    // Bob voted on a row that already carried alice's vote, so the
    // last write holds both.
    let view = alice.room_view(&RoomId::new("r1")).expect("alice's view");
    let poll = view.messages[0].poll.clone().expect("poll payload");
    assert_eq!(poll.tally(), vec![1, 1]);

    alice.dispose().await;
    bob.dispose().await;
    Ok(())
}

#[tokio::test]
async fn leave_then_rejoin_resolves_to_joined() -> Result<()> {
    let backend = Arc::new(MemoryBackend::new());
    seed_public_room(&backend, "r1", "owner").await;
    let engine = engine_for(backend.clone(), &random_user()).await;

    engine.join(&RoomId::new("r1"), None).await?;
    engine.leave(&RoomId::new("r1")).await?;
    engine.join(&RoomId::new("r1"), None).await?;
    settle().await;

    assert!(engine.joined_room_ids().contains(&RoomId::new("r1")));
    assert_eq!(backend.fetch_participants(&RoomId::new("r1")).await?.len(), 1);

    engine.dispose().await;
    Ok(())
}

#[tokio::test]
async fn lifecycle_signal_receiver_is_single_take() {
    let backend = Arc::new(MemoryBackend::new());
    let engine = engine_for(backend, &random_user()).await;

    assert!(engine.signals().is_some());
    assert!(engine.signals().is_none(), "second take comes back empty");
    engine.dispose().await;
}

//! Client-side realtime synchronization core for Parlor chat rooms.
//!
//! Every browser-style client runs an independent instance of this engine
//! against the same hosted store. Convergence comes from each instance
//! reducing the same stream of change events into its local [`store`]
//! rather than from any shared memory or coordinating server process.
//!
//! The UI layer is an external collaborator: it reads immutable snapshots
//! from the engine, invokes the mutation operations, and reacts to the
//! lifecycle and staleness signals the engine emits.

pub mod backend;
pub mod config;
pub mod engine;
pub mod entity;
pub mod error;
pub mod feed;
pub mod lifecycle;
pub mod membership;
pub mod messages;
pub mod presence;
pub mod store;

pub use backend::{Backend, MemoryBackend};
pub use config::SyncConfig;
pub use engine::{EngineSignal, Identity, SyncEngine};
pub use entity::{
    ChangeEvent, EventKind, Message, MessageId, MessageKind, MessageState, Participant, Room,
    RoomId, Table, Topic, UserId, Visibility,
};
pub use error::{Error, Result};
pub use lifecycle::{RoomPhase, WatchLevel};
pub use presence::Presence;

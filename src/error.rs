use std::fmt;
use thiserror::Error;

/// Errors surfaced by the synchronization engine.
///
/// Mutation operations fail with exactly one of these categories; the UI
/// collaborator decides how each is rendered. Reconciliation-time failures
/// never reach here — the reducer logs and drops the offending event.
#[derive(Error, Debug)]
pub enum Error {
    /// The caller lacks permission for the requested mutation: wrong
    /// password, non-owner terminate, non-author edit/delete. Never
    /// retried automatically.
    #[error("authorization denied: {0}")]
    Authorization(String),

    /// The referenced room/message/participant no longer exists in the
    /// external store. The corresponding local entry is evicted.
    #[error("not found: {0}")]
    NotFound(String),

    /// An optimistic write's precondition no longer holds, e.g. a
    /// terminate on an already-terminated room. Callers usually treat
    /// this as a success no-op.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A change-feed disconnect or request failure. The engine retries
    /// subscriptions with backoff before giving up.
    #[error("transport error: {0}")]
    Transport(String),

    /// Automatic resubscription was exhausted; the local view of the
    /// topic can no longer be trusted and a manual refresh is needed.
    #[error("stale subscription: {0}")]
    StaleSubscription(String),

    /// An error during serialization/deserialization of a row.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Create an authorization error
    pub fn authorization(msg: impl Into<String>) -> Self {
        Self::Authorization(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a conflict error
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a transport error from any displayable source
    pub fn transport<E: fmt::Display>(error: E) -> Self {
        Self::Transport(error.to_string())
    }

    /// Create a stale subscription error
    pub fn stale(msg: impl Into<String>) -> Self {
        Self::StaleSubscription(msg.into())
    }

    /// Check if this is an authorization error
    pub fn is_authorization(&self) -> bool {
        matches!(self, Self::Authorization(_))
    }

    /// Check if this is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Check if this is a conflict error
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Check if this is a recoverable transport error
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;

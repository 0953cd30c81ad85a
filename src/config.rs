use std::time::Duration;

use crate::error::{Error, Result};

/// Default warning threshold before a room's deadline, in seconds.
const DEFAULT_EXPIRY_WARNING_SECS: i64 = 30;

/// Default lifecycle tick cadence for a room currently being viewed.
const DEFAULT_VIEWED_TICK: Duration = Duration::from_secs(1);

/// Default lifecycle tick cadence for background list entries.
const DEFAULT_BACKGROUND_TICK: Duration = Duration::from_secs(60);

/// Default increment added to a room's deadline by an owner extension.
const DEFAULT_EXTENSION_MINS: i64 = 30;

/// Default minimum interval between presence heartbeat writes.
const DEFAULT_HEARTBEAT_MIN_INTERVAL: Duration = Duration::from_secs(30);

/// Default window within which a participant's last activity counts as online.
const DEFAULT_PRESENCE_FRESH_SECS: i64 = 60;

/// Engine configuration with hardcoded defaults.
///
/// The embedding application owns any config-file or environment layering;
/// the engine only sees the resolved values.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// How long before `expires_at` a room enters the expiring-soon phase
    pub expiry_warning_secs: i64,

    /// Lifecycle tick cadence while a room is viewed
    pub viewed_tick: Duration,

    /// Lifecycle tick cadence for background list entries
    pub background_tick: Duration,

    /// Minutes added to `expires_at` by an owner-initiated extension
    pub extension_increment_mins: i64,

    /// Minimum interval between presence heartbeat writes
    pub heartbeat_min_interval: Duration,

    /// Freshness window for inferring a participant as online, in seconds
    pub presence_fresh_secs: i64,

    /// Base delay for change-feed resubscription backoff
    pub feed_backoff_base: Duration,

    /// Upper bound on the resubscription backoff delay
    pub feed_backoff_cap: Duration,

    /// Resubscription attempts before the topic is declared stale
    pub feed_max_retries: u32,

    /// Depth of the feed-to-store event queue
    pub event_queue_depth: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            expiry_warning_secs: DEFAULT_EXPIRY_WARNING_SECS,
            viewed_tick: DEFAULT_VIEWED_TICK,
            background_tick: DEFAULT_BACKGROUND_TICK,
            extension_increment_mins: DEFAULT_EXTENSION_MINS,
            heartbeat_min_interval: DEFAULT_HEARTBEAT_MIN_INTERVAL,
            presence_fresh_secs: DEFAULT_PRESENCE_FRESH_SECS,
            feed_backoff_base: Duration::from_millis(250),
            feed_backoff_cap: Duration::from_secs(10),
            feed_max_retries: 5,
            event_queue_depth: 256,
        }
    }
}

impl SyncConfig {
    /// Warning threshold as a chrono duration for deadline math.
    pub fn expiry_warning(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.expiry_warning_secs)
    }

    /// Extension increment as a chrono duration for deadline math.
    pub fn extension_increment(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.extension_increment_mins)
    }

    /// Presence freshness window as a chrono duration.
    pub fn presence_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.presence_fresh_secs)
    }

    /// Validates that the configured values can drive the engine.
    pub fn validate(&self) -> Result<()> {
        if self.viewed_tick.is_zero() || self.background_tick.is_zero() {
            return Err(Error::conflict("tick cadence must be non-zero"));
        }
        if self.background_tick < self.viewed_tick {
            return Err(Error::conflict(
                "background tick must not be faster than the viewed tick",
            ));
        }
        if self.expiry_warning_secs < 0 || self.presence_fresh_secs <= 0 {
            return Err(Error::conflict("time windows must be positive"));
        }
        if self.event_queue_depth == 0 {
            return Err(Error::conflict("event queue depth must be non-zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        SyncConfig::default().validate().expect("defaults must validate");
    }

    #[test]
    fn rejects_inverted_tick_rates() {
        let config = SyncConfig {
            viewed_tick: Duration::from_secs(120),
            ..SyncConfig::default()
        };
        assert!(config.validate().is_err());
    }
}

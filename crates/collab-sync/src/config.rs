use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::protocol::ActionType;

/// Token bucket settings for one action type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimit {
    pub limit: u32,
    pub refill_interval_ms: u64,
}

impl RateLimit {
    pub const fn new(limit: u32, refill_interval_ms: u64) -> Self {
        Self {
            limit,
            refill_interval_ms,
        }
    }

    pub fn refill_interval(&self) -> Duration {
        Duration::from_millis(self.refill_interval_ms)
    }
}

/// Tunables for a sync node
///
/// Every field has a default; a JSON config file only needs to name the
/// values it overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    /// Ceiling for one inbound or outbound message, in bytes
    pub max_message_bytes: usize,
    pub heartbeat_interval_ms: u64,
    pub pong_timeout_ms: u64,
    pub max_missed_pongs: u32,
    /// Deadline for a single outbound push
    pub push_timeout_ms: u64,
    /// Upper bound on the registry write performed during the connect handshake
    pub register_timeout_ms: u64,
    /// Rolling expiry applied to registry entries
    pub connection_ttl_ms: u64,
    pub max_connections_per_user: usize,
    pub idle_reap_after_ms: u64,
    pub orphan_reap_after_ms: u64,
    pub max_connections_per_document: usize,
    pub snapshot_op_threshold: usize,
    pub snapshot_interval_ms: u64,
    /// Updates at or above this size never trigger a `snapshot_needed` hint
    pub snapshot_hint_max_update_bytes: usize,
    /// Per-action buckets. Actions without an entry are not limited.
    pub rate_limits: HashMap<ActionType, RateLimit>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let rate_limits = HashMap::from([
            (ActionType::Join, RateLimit::new(10, 60_000)),
            (ActionType::Update, RateLimit::new(60, 1_000)),
            (ActionType::Presence, RateLimit::new(30, 1_000)),
            (ActionType::CreateSnapshot, RateLimit::new(1, 60_000)),
            (ActionType::Leave, RateLimit::new(10, 60_000)),
        ]);

        Self {
            max_message_bytes: 28 * 1024,
            heartbeat_interval_ms: 30_000,
            pong_timeout_ms: 10_000,
            max_missed_pongs: 3,
            push_timeout_ms: 5_000,
            register_timeout_ms: 2_000,
            connection_ttl_ms: 60 * 60 * 1_000,
            max_connections_per_user: 10,
            idle_reap_after_ms: 5 * 60 * 1_000,
            orphan_reap_after_ms: 2 * 60 * 1_000,
            max_connections_per_document: 100,
            snapshot_op_threshold: 100,
            snapshot_interval_ms: 5 * 60 * 1_000,
            snapshot_hint_max_update_bytes: 16 * 1024,
            rate_limits,
        }
    }
}

impl SyncConfig {
    /// Load a config from a JSON file. Missing fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> crate::SyncResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: SyncConfig = serde_json::from_str(&raw)?;

        // A partial rate limit table should extend the defaults, not replace them
        let mut limits = SyncConfig::default().rate_limits;
        limits.extend(config.rate_limits.drain());
        config.rate_limits = limits;
        Ok(config)
    }

    pub fn with_max_message_bytes(mut self, bytes: usize) -> Self {
        self.max_message_bytes = bytes;
        self
    }

    pub fn with_rate_limit(mut self, action: ActionType, limit: RateLimit) -> Self {
        self.rate_limits.insert(action, limit);
        self
    }

    pub fn without_rate_limit(mut self, action: ActionType) -> Self {
        self.rate_limits.remove(&action);
        self
    }

    pub fn with_push_timeout(mut self, timeout: Duration) -> Self {
        self.push_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn rate_limit(&self, action: ActionType) -> Option<RateLimit> {
        self.rate_limits.get(&action).copied()
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.pong_timeout_ms)
    }

    pub fn push_timeout(&self) -> Duration {
        Duration::from_millis(self.push_timeout_ms)
    }

    pub fn register_timeout(&self) -> Duration {
        Duration::from_millis(self.register_timeout_ms)
    }

    pub fn connection_ttl(&self) -> Duration {
        Duration::from_millis(self.connection_ttl_ms)
    }

    pub fn idle_reap_after(&self) -> Duration {
        Duration::from_millis(self.idle_reap_after_ms)
    }

    pub fn orphan_reap_after(&self) -> Duration {
        Duration::from_millis(self.orphan_reap_after_ms)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms)
    }
}

//! Transport tuning.

use serde::Deserialize;

/// Configuration for the relay connection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Fixed delay before each reconnect attempt.
    pub reconnect_interval_ms: u64,
    /// Consecutive failed attempts before giving up.
    pub max_reconnect_attempts: u32,
    /// Silence longer than this force-closes the connection.
    pub liveness_timeout_ms: u64,
    /// How often the watchdog checks for silence.
    pub watchdog_interval_ms: u64,
    /// How often a keep-alive ping is sent while open.
    pub ping_interval_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            reconnect_interval_ms: 3_000,
            max_reconnect_attempts: 5,
            liveness_timeout_ms: 30_000,
            watchdog_interval_ms: 1_000,
            ping_interval_ms: 10_000,
        }
    }
}

/// Configuration for peer links.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// A link with no open data channel after this long is failed.
    pub handshake_timeout_ms: u64,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 10_000,
        }
    }
}

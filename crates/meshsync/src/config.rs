//! Session configuration.
//!
//! Every field has a default, so a JSON document only needs the values it
//! overrides:
//!
//! ```
//! use meshsync::MeshsyncConfig;
//!
//! let config = MeshsyncConfig::from_json(r#"{ "retry": { "max_retries": 4 } }"#).unwrap();
//! assert_eq!(config.retry.max_retries, 4);
//! assert_eq!(config.retry.retry_delay_ms, 2_000);
//! ```

use serde::Deserialize;

use meshsync_core::Millis;
use meshsync_reconcile::ReconcilerConfig;
use meshsync_transport::{MeshConfig, RelayConfig};

use crate::error::{MeshsyncError, Result};

/// Per-peer link retry policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries before elimination arbitration runs.
    pub max_retries: u32,
    pub retry_delay_ms: Millis,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_delay_ms: 2_000,
        }
    }
}

/// State sync cadence and limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Period of the full-state rebroadcast.
    pub rebroadcast_interval_ms: Millis,
    /// Upper bound of the per-instance offset added to the period.
    pub rebroadcast_jitter_ms: Millis,
    /// Relay messages processed per loop iteration.
    pub drain_batch: usize,
    /// Spatial cell side length in world units.
    pub cell_size: f32,
    /// How long failures are swallowed after a death or respawn.
    pub suppression_window_ms: Millis,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            rebroadcast_interval_ms: 5_000,
            rebroadcast_jitter_ms: 1_000,
            drain_batch: 64,
            cell_size: 64.0,
            suppression_window_ms: 10_000,
        }
    }
}

/// Complete session configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MeshsyncConfig {
    pub relay: RelayConfig,
    pub mesh: MeshConfig,
    pub retry: RetryConfig,
    pub sync: SyncConfig,
}

impl MeshsyncConfig {
    /// Parse a JSON document, filling omitted fields with defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the session cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.sync.drain_batch == 0 {
            return Err(MeshsyncError::Config("sync.drain_batch must be positive".into()));
        }
        if self.sync.cell_size.is_nan() || self.sync.cell_size <= 0.0 {
            return Err(MeshsyncError::Config("sync.cell_size must be positive".into()));
        }
        if self.relay.watchdog_interval_ms == 0 {
            return Err(MeshsyncError::Config(
                "relay.watchdog_interval_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn with_relay(mut self, relay: RelayConfig) -> Self {
        self.relay = relay;
        self
    }

    pub fn with_mesh(mut self, mesh: MeshConfig) -> Self {
        self.mesh = mesh;
        self
    }

    pub fn with_retry(mut self, max_retries: u32, retry_delay_ms: Millis) -> Self {
        self.retry = RetryConfig {
            max_retries,
            retry_delay_ms,
        };
        self
    }

    pub fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }

    pub fn with_suppression_window(mut self, window_ms: Millis) -> Self {
        self.sync.suppression_window_ms = window_ms;
        self
    }

    pub fn with_liveness_timeout(mut self, timeout_ms: Millis) -> Self {
        self.relay.liveness_timeout_ms = timeout_ms;
        self
    }

    pub(crate) fn reconciler(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            cell_size: self.sync.cell_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MeshsyncConfig::default();
        assert_eq!(config.relay.reconnect_interval_ms, 3_000);
        assert_eq!(config.relay.max_reconnect_attempts, 5);
        assert_eq!(config.relay.liveness_timeout_ms, 30_000);
        assert_eq!(config.mesh.handshake_timeout_ms, 10_000);
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.sync.suppression_window_ms, 10_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_partial() {
        let config = MeshsyncConfig::from_json(
            r#"{ "relay": { "liveness_timeout_ms": 5000 }, "sync": { "drain_batch": 8 } }"#,
        )
        .unwrap();
        assert_eq!(config.relay.liveness_timeout_ms, 5_000);
        assert_eq!(config.relay.reconnect_interval_ms, 3_000);
        assert_eq!(config.sync.drain_batch, 8);
        assert_eq!(config.sync.rebroadcast_interval_ms, 5_000);
    }

    #[test]
    fn test_from_json_rejects_invalid() {
        assert!(matches!(
            MeshsyncConfig::from_json(r#"{ "sync": { "drain_batch": 0 } }"#),
            Err(MeshsyncError::Config(_))
        ));
        assert!(matches!(
            MeshsyncConfig::from_json("not json"),
            Err(MeshsyncError::Config(_))
        ));
    }

    #[test]
    fn test_builders() {
        let config = MeshsyncConfig::default()
            .with_retry(3, 500)
            .with_suppression_window(1_000)
            .with_liveness_timeout(9_000);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.retry_delay_ms, 500);
        assert_eq!(config.sync.suppression_window_ms, 1_000);
        assert_eq!(config.relay.liveness_timeout_ms, 9_000);
        assert_eq!(config.reconciler().cell_size, 64.0);
    }
}

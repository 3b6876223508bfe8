//! Update sequencer timing and transfer settings

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::ConfigError;

/// Timing and transfer parameters for one update run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequencerConfig {
    /// How long enter-pre-programming broadcasts are repeated after the reset broadcast
    #[serde(default = "default_activation_window")]
    pub activation_window_ms: u64,

    /// Pause between two broadcasts inside the activation window
    #[serde(default = "default_broadcast_interval")]
    pub broadcast_interval_ms: u64,

    /// Post-reset wait used when a device definition carries no specific value
    #[serde(default = "default_reset_wait")]
    pub default_reset_wait_ms: u64,

    /// Upper bound for a single transfer-data block (the device may ask for less)
    #[serde(default = "default_max_block_size")]
    pub max_block_size: u32,

    /// Chunk size for legacy program requests
    #[serde(default = "default_legacy_chunk")]
    pub legacy_program_chunk: u32,

    /// Write a fingerprint before transferring applications
    #[serde(default = "default_true")]
    pub write_fingerprint: bool,

    /// User name recorded in the fingerprint (login name if unset)
    #[serde(default)]
    pub fingerprint_user: Option<String>,

    /// Granularity of abort checks while waiting
    #[serde(default = "default_abort_poll")]
    pub abort_poll_interval_ms: u64,
}

fn default_activation_window() -> u64 {
    5000
}

fn default_broadcast_interval() -> u64 {
    5
}

fn default_reset_wait() -> u64 {
    1000
}

fn default_max_block_size() -> u32 {
    4090
}

fn default_legacy_chunk() -> u32 {
    1024
}

fn default_true() -> bool {
    true
}

fn default_abort_poll() -> u64 {
    10
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            activation_window_ms: default_activation_window(),
            broadcast_interval_ms: default_broadcast_interval(),
            default_reset_wait_ms: default_reset_wait(),
            max_block_size: default_max_block_size(),
            legacy_program_chunk: default_legacy_chunk(),
            write_fingerprint: true,
            fingerprint_user: None,
            abort_poll_interval_ms: default_abort_poll(),
        }
    }
}

impl SequencerConfig {
    /// Configuration without waits, for simulated buses
    pub fn immediate() -> Self {
        Self {
            activation_window_ms: 0,
            broadcast_interval_ms: 0,
            default_reset_wait_ms: 0,
            abort_poll_interval_ms: 1,
            ..Self::default()
        }
    }

    pub fn activation_window(&self) -> Duration {
        Duration::from_millis(self.activation_window_ms)
    }

    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.broadcast_interval_ms)
    }

    pub fn default_reset_wait(&self) -> Duration {
        Duration::from_millis(self.default_reset_wait_ms)
    }

    pub fn abort_poll_interval(&self) -> Duration {
        Duration::from_millis(self.abort_poll_interval_ms.max(1))
    }

    /// Fingerprint user name, falling back to the login name
    pub fn resolved_fingerprint_user(&self) -> String {
        self.fingerprint_user
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .or_else(|| std::env::var("USERNAME").ok())
            .unwrap_or_else(|| "unknown".to_string())
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.max_block_size < 16 {
            return Err(ConfigError::Invalid(format!(
                "sequencer.max_block_size too small: {}",
                self.max_block_size
            )));
        }

        if self.legacy_program_chunk == 0 {
            return Err(ConfigError::Invalid(
                "sequencer.legacy_program_chunk must not be 0".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = SequencerConfig::default();
        assert_eq!(config.activation_window(), Duration::from_secs(5));
        assert_eq!(config.default_reset_wait(), Duration::from_secs(1));
        assert!(config.write_fingerprint);
    }

    #[test]
    fn test_immediate_has_no_waits() {
        let config = SequencerConfig::immediate();
        assert_eq!(config.activation_window(), Duration::ZERO);
        assert_eq!(config.default_reset_wait(), Duration::ZERO);
        assert_eq!(config.abort_poll_interval(), Duration::from_millis(1));
    }

    #[test]
    fn test_fingerprint_user_override() {
        let config = SequencerConfig {
            fingerprint_user: Some("flash-station-3".into()),
            ..SequencerConfig::default()
        };
        assert_eq!(config.resolved_fingerprint_user(), "flash-station-3");
    }

    #[test]
    fn test_validate_rejects_zero_chunk() {
        let config = SequencerConfig {
            legacy_program_chunk: 0,
            ..SequencerConfig::default()
        };
        assert!(config.validate().is_err());
    }
}

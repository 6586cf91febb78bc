// src/config.rs
//! System configuration with TOML loading and validation

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Top-level configuration for the core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SystemConfig {
    pub storage: StorageConfig,
    pub bridge: BridgeConfig,
    pub online: OnlineConfig,
    pub recording: RecordingConfig,
}

/// Filesystem locations for persisted sessions and model artifacts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub root_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { root_dir: PathBuf::from("myoctl_data") }
    }
}

/// Visual interface bridge tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Handshake deadline for `activate` in milliseconds
    pub handshake_timeout_ms: u64,
    /// Interval between handshake resends in milliseconds
    pub handshake_retry_ms: u64,
    /// Bounded outbound frame queue length per instance
    pub outbound_queue_len: usize,
    /// Bounded ground-truth buffer length per instance (drop-oldest)
    pub ground_truth_buffer_len: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 2000,
            handshake_retry_ms: 500,
            outbound_queue_len: 256,
            ground_truth_buffer_len: 4096,
        }
    }
}

/// Online inference loop tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OnlineConfig {
    /// Bounded device-sample queue length (drop-oldest under backpressure)
    pub sample_queue_len: usize,
    /// Persist predictions and incoming ground truth during an Online session
    pub record_predictions: bool,
}

impl Default for OnlineConfig {
    fn default() -> Self {
        Self { sample_queue_len: 64, record_predictions: false }
    }
}

/// Recording phase tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Default feature window length in frames when a model does not
    /// request a specific `feature_window_size`
    pub default_window_len: usize,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self { default_window_len: 32 }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found: {0}")]
    FileNotFound(PathBuf),
    #[error("configuration parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SystemConfig {
    /// Load configuration from a TOML file, falling back to defaults for
    /// missing sections
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        let config: SystemConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.online.sample_queue_len == 0 {
            return Err(ConfigError::Invalid(
                "online.sample_queue_len must be at least 1".to_string(),
            ));
        }
        if self.bridge.outbound_queue_len == 0 {
            return Err(ConfigError::Invalid(
                "bridge.outbound_queue_len must be at least 1".to_string(),
            ));
        }
        if self.bridge.ground_truth_buffer_len == 0 {
            return Err(ConfigError::Invalid(
                "bridge.ground_truth_buffer_len must be at least 1".to_string(),
            ));
        }
        if self.recording.default_window_len == 0 {
            return Err(ConfigError::Invalid(
                "recording.default_window_len must be at least 1".to_string(),
            ));
        }
        if self.bridge.handshake_retry_ms > self.bridge.handshake_timeout_ms {
            return Err(ConfigError::Invalid(
                "bridge.handshake_retry_ms must not exceed handshake_timeout_ms".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = SystemConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.bridge.handshake_timeout_ms, 2000);
        assert_eq!(config.online.sample_queue_len, 64);
    }

    #[test]
    fn test_load_partial_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[online]\nsample_queue_len = 128\n\n[storage]\nroot_dir = \"/tmp/myoctl\"\n"
        )
        .unwrap();

        let config = SystemConfig::load(file.path()).unwrap();
        assert_eq!(config.online.sample_queue_len, 128);
        assert_eq!(config.storage.root_dir, PathBuf::from("/tmp/myoctl"));
        // untouched section keeps defaults
        assert_eq!(config.bridge.outbound_queue_len, 256);
    }

    #[test]
    fn test_missing_file() {
        let err = SystemConfig::load("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }

    #[test]
    fn test_invalid_queue_len_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[online]\nsample_queue_len = 0\n").unwrap();
        let err = SystemConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}

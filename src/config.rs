use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_MEMORY_QUOTA_BYTES: usize = 64 * 1024 * 1024;

/// When closed, unreferenced checkpoints are detached from a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalMode {
    /// As soon as a cursor move or a checkpoint close makes them removable.
    #[default]
    Eager,
    /// Only when the remover task runs.
    Lazy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub max_items_per_checkpoint: usize,
    pub checkpoint_period_ms: u64,
    pub removal_mode: RemovalMode,
    pub expel_enabled: bool,
    pub memory_quota_bytes: usize,
    pub memory_recovery_upper_mark: f64,
    pub memory_recovery_lower_mark: f64,
    pub remover_interval_ms: u64,
    pub visitor_max_expected_ms: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            max_items_per_checkpoint: 10_000,
            checkpoint_period_ms: 5_000,
            removal_mode: RemovalMode::Eager,
            expel_enabled: true,
            memory_quota_bytes: DEFAULT_MEMORY_QUOTA_BYTES,
            memory_recovery_upper_mark: 0.9,
            memory_recovery_lower_mark: 0.6,
            remover_interval_ms: 5_000,
            visitor_max_expected_ms: 50,
        }
    }
}

impl CheckpointConfig {
    pub fn checkpoint_period(&self) -> Duration {
        Duration::from_millis(self.checkpoint_period_ms)
    }

    pub fn remover_interval(&self) -> Duration {
        Duration::from_millis(self.remover_interval_ms)
    }

    pub fn eager_removal(&self) -> bool {
        self.removal_mode == RemovalMode::Eager
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_items_per_checkpoint == 0 {
            return Err(ConfigError::invalid(
                "checkpoint.max_items_per_checkpoint",
                "must be non-zero",
            ));
        }
        if self.checkpoint_period_ms == 0 {
            return Err(ConfigError::invalid(
                "checkpoint.checkpoint_period_ms",
                "must be non-zero",
            ));
        }
        if self.remover_interval_ms == 0 {
            return Err(ConfigError::invalid(
                "checkpoint.remover_interval_ms",
                "must be non-zero",
            ));
        }
        let lower = self.memory_recovery_lower_mark;
        let upper = self.memory_recovery_upper_mark;
        if !(0.0..=1.0).contains(&lower) || !(0.0..=1.0).contains(&upper) {
            return Err(ConfigError::invalid(
                "checkpoint.memory_recovery_*_mark",
                "marks must lie within [0, 1]",
            ));
        }
        if lower > upper {
            return Err(ConfigError::invalid(
                "checkpoint.memory_recovery_lower_mark",
                "must not exceed the upper mark",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlusherConfig {
    /// Items per flush batch beyond which disk checkpoints are split.
    pub batch_split_trigger: usize,
    pub idle_interval_ms: u64,
}

impl Default for FlusherConfig {
    fn default() -> Self {
        Self {
            batch_split_trigger: 10_000,
            idle_interval_ms: 100,
        }
    }
}

impl FlusherConfig {
    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DurabilityConfig {
    pub default_timeout_ms: u64,
    pub timeout_check_interval_ms: u64,
}

impl Default for DurabilityConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            timeout_check_interval_ms: 25,
        }
    }
}

impl DurabilityConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn timeout_check_interval(&self) -> Duration {
        Duration::from_millis(self.timeout_check_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub checkpoint: CheckpointConfig,
    pub flusher: FlusherConfig,
    pub durability: DurabilityConfig,
    /// False models the memory-only variant: no flusher and no persistence
    /// levels.
    pub persistent: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            checkpoint: CheckpointConfig::default(),
            flusher: FlusherConfig::default(),
            durability: DurabilityConfig::default(),
            persistent: true,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig =
            serde_json::from_str(raw).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|err| ConfigError::Io {
            path: path.display().to_string(),
            message: err.to_string(),
        })?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.checkpoint.validate()?;
        if self.flusher.batch_split_trigger == 0 {
            return Err(ConfigError::invalid(
                "flusher.batch_split_trigger",
                "must be non-zero",
            ));
        }
        if self.durability.timeout_check_interval_ms == 0 {
            return Err(ConfigError::invalid(
                "durability.timeout_check_interval_ms",
                "must be non-zero",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
    #[error("config parse error: {0}")]
    Parse(String),
    #[error("failed to read config {path}: {message}")]
    Io { path: String, message: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: &'static str) -> Self {
        ConfigError::Invalid { field, reason }
    }
}

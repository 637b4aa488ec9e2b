//! Configuration management for Rhyolite
//!
//! Provides hierarchical configuration loading from multiple sources:
//! 1. Environment variables (RHY_* prefix, highest precedence)
//! 2. rhyolite.local.toml (gitignored, local overrides)
//! 3. rhyolite.toml in the node home
//! 4. ~/.config/rhyolite/config.toml (user defaults)
//! 5. Built-in defaults (lowest precedence)

use serde::{Deserialize, Serialize};
use std::path::Path;

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use paths::{local_config_file, node_config_file, user_config_file};

/// Main Rhyolite configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RhyoliteConfig {
    pub node: NodeConfig,
    pub replica: ReplicaConfig,
    pub replay: ReplayConfig,
}

/// Identity of this node within its replication group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub name: String,
    pub group: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "rhyolite-node".to_string(),
            group: "rhyolite-group".to_string(),
        }
    }
}

/// Settings for the replica loop and its channel to the feeder.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicaConfig {
    /// Capacity of the replay and output queues.
    pub message_queue_size: usize,
    /// Per-read channel timeout before the first heartbeat arrives (ms).
    pub pre_heartbeat_timeout_ms: u64,
    /// Per-read channel timeout during steady state (ms).
    pub feeder_channel_timeout_ms: u64,
    /// Artificial per-message replay delay (ms). Test builds only; the
    /// release engine ignores it.
    pub test_delay_ms: u64,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            message_queue_size: 1000,
            pre_heartbeat_timeout_ms: 60_000,
            feeder_channel_timeout_ms: 30_000,
            test_delay_ms: 0,
        }
    }
}

/// Settings for the replay stage itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Run CPU-bound entry preprocessing on a small pool ahead of the
    /// replayer.
    pub preprocessor: bool,
    /// Preprocessor pool size.
    pub preprocessor_threads: usize,
    /// Bound on the DB handle cache.
    pub max_open_db_handles: usize,
    /// Idle eviction timeout for cached DB handles (ms).
    pub db_handle_timeout_ms: u64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            preprocessor: false,
            preprocessor_threads: 2,
            max_open_db_handles: 100,
            db_handle_timeout_ms: 30_000,
        }
    }
}

impl RhyoliteConfig {
    /// Load configuration with the current directory as the node home.
    pub fn load() -> Result<Self, ConfigError> {
        ConfigLoader::new().load()
    }

    /// Load configuration for a node rooted at `node_home`.
    pub fn load_from_node_home(node_home: impl AsRef<Path>) -> Result<Self, ConfigError> {
        ConfigLoader::new().with_node_home(node_home).load()
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.replica.message_queue_size == 0 {
            return Err(ConfigError::Validation(
                "replica.message_queue_size must be positive".to_string(),
            ));
        }
        if self.replay.preprocessor && self.replay.preprocessor_threads == 0 {
            return Err(ConfigError::Validation(
                "replay.preprocessor_threads must be positive when the preprocessor is enabled"
                    .to_string(),
            ));
        }
        if self.replay.max_open_db_handles == 0 {
            return Err(ConfigError::Validation(
                "replay.max_open_db_handles must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

//! Runtime configuration.
//!
//! This module defines the configuration tree consumed by the consistent-region
//! runtime: the checkpoint dispatcher, the checkpoint store, and the static
//! description of each consistent region.  The whole tree can be deserialized
//! from a YAML or JSON document.

use crate::error::ConfigError;
use crate::RegionIndex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

/// Default number of checkpoint dispatcher workers.
pub const fn default_dispatcher_threads() -> usize {
    4
}

/// Default capacity of each dispatcher worker queue, in work items.
pub const fn default_queue_capacity() -> usize {
    1024
}

pub const fn default_connect_timeout_ms() -> u64 {
    5_000
}

pub const fn default_command_timeout_ms() -> u64 {
    30_000
}

pub const fn default_drain_timeout_ms() -> u64 {
    180_000
}

pub const fn default_reset_timeout_ms() -> u64 {
    180_000
}

pub const fn default_max_consecutive_reset_attempts() -> u32 {
    5
}

fn default_store_name() -> String {
    "checkpoints".to_string()
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Checkpoint dispatcher configuration.
    pub dispatcher: DispatcherConfig,

    /// Replicated checkpoint store.
    ///
    /// When this is `None`, checkpoints are kept in memory, which is only
    /// useful for testing and for single-process deployments that do not
    /// need to survive a restart.
    pub store: Option<StoreConfig>,

    /// Consistent regions hosted by this process.
    pub regions: Vec<RegionConfig>,
}

impl RuntimeConfig {
    /// Parses a YAML (or JSON, which is a subset of YAML) document.
    pub fn from_yaml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(s).map_err(|e| ConfigError::Parse {
            error: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates a configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;
        Self::from_yaml_str(&contents)
    }

    pub fn region(&self, index: RegionIndex) -> Option<&RegionConfig> {
        self.regions.iter().find(|region| region.index == index)
    }

    /// Checks invariants that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.dispatcher.validate()?;
        if let Some(store) = &self.store {
            store.validate()?;
        }

        let mut seen = BTreeSet::new();
        for region in self.regions.iter() {
            if !seen.insert(region.index) {
                return Err(ConfigError::DuplicateRegion {
                    region: region.index,
                });
            }
            region.validate()?;
        }
        Ok(())
    }
}

/// Checkpoint dispatcher configuration.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Number of worker threads.
    ///
    /// Work for a given operator always runs on worker
    /// `operator_index % num_threads`.
    pub num_threads: usize,

    /// Maximum number of queued work items per worker.  Submitting to a full
    /// queue blocks (or fails, for non-blocking submission).
    pub queue_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            num_threads: default_dispatcher_threads(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_threads == 0 {
            return Err(ConfigError::NoDispatcherThreads);
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::ZeroQueueCapacity);
        }
        Ok(())
    }
}

/// One replica server of the checkpoint store.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,

    /// Password sent with `AUTH` right after connecting.
    #[serde(default)]
    pub password: Option<String>,
}

impl ServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Replicated checkpoint store configuration.
///
/// Servers are listed replica-major: the server for `(shard, replica)` is
/// `servers[shard + num_shards * replica]`.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Name of the key space.  Checkpoints live in the hash `D{store_name}`.
    #[serde(default = "default_store_name")]
    pub store_name: String,

    pub num_shards: usize,

    pub num_replicas: usize,

    pub servers: Vec<ServerConfig>,

    /// Timeout for establishing a replica connection, in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Timeout for a batch of commands to be acknowledged, in milliseconds.
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

impl StoreConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_shards == 0 || self.num_replicas == 0 {
            return Err(ConfigError::EmptyStore {
                num_shards: self.num_shards,
                num_replicas: self.num_replicas,
            });
        }
        let expected = self.num_shards * self.num_replicas;
        if self.servers.len() != expected {
            return Err(ConfigError::ServerCountMismatch {
                num_shards: self.num_shards,
                num_replicas: self.num_replicas,
                expected,
                actual: self.servers.len(),
            });
        }
        Ok(())
    }

    /// Number of replicas that must acknowledge a command.
    pub fn majority(&self) -> usize {
        self.num_replicas / 2 + 1
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

/// What starts a new drain cycle.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum TriggerConfig {
    /// The control plane starts a drain every `period_ms` milliseconds.
    Periodic { period_ms: u64 },

    /// The trigger operator starts a drain by calling `make_consistent`.
    OperatorDriven,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self::OperatorDriven
    }
}

/// Static description of one consistent region.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct RegionConfig {
    /// Stable region identifier.
    pub index: RegionIndex,

    #[serde(default)]
    pub trigger: TriggerConfig,

    /// Maximum time a drain may take before the region is reset.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,

    /// Maximum time a reset may take before it is retried.
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,

    /// Number of consecutive failed resets after which the region gives up.
    #[serde(default = "default_max_consecutive_reset_attempts")]
    pub max_consecutive_reset_attempts: u32,

    /// Allow stateless operators to complete their checkpoint without
    /// pausing tuple submission.
    #[serde(default)]
    pub non_blocking_checkpoints: bool,
}

impl RegionConfig {
    pub fn new(index: RegionIndex) -> Self {
        Self {
            index,
            trigger: TriggerConfig::default(),
            drain_timeout_ms: default_drain_timeout_ms(),
            reset_timeout_ms: default_reset_timeout_ms(),
            max_consecutive_reset_attempts: default_max_consecutive_reset_attempts(),
            non_blocking_checkpoints: false,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let TriggerConfig::Periodic { period_ms: 0 } = self.trigger {
            return Err(ConfigError::ZeroPeriod { region: self.index });
        }
        Ok(())
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn period(&self) -> Option<Duration> {
        match self.trigger {
            TriggerConfig::Periodic { period_ms } => Some(Duration::from_millis(period_ms)),
            TriggerConfig::OperatorDriven => None,
        }
    }
}

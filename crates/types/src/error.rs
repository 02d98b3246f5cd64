use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::{borrow::Cow, error::Error as StdError};
use thiserror::Error;

/// Machine-readable summary of an error, suitable for logging or for
/// shipping to the control plane.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorReport {
    /// Human-readable error message.
    pub message: String,
    /// Error code is a string that specifies this error type.
    pub error_code: Cow<'static, str>,
    /// Detailed error metadata.
    /// The contents of this field is determined by `error_code`.
    pub details: JsonValue,
}

impl ErrorReport {
    pub fn from_error<E>(error: &E) -> Self
    where
        E: DetailedError,
    {
        let details = serde_json::to_value(error).unwrap_or_else(|e| {
            JsonValue::String(format!("Failed to serialize error details: '{e}'"))
        });

        Self {
            message: error.to_string(),
            error_code: error.error_code(),
            details,
        }
    }
}

impl<E> From<&E> for ErrorReport
where
    E: DetailedError,
{
    fn from(error: &E) -> ErrorReport {
        Self::from_error(error)
    }
}

/// Error trait which internal errors must implement such that it
/// can be transformed to an [`ErrorReport`].
pub trait DetailedError: StdError + Serialize {
    /// Identifying name of the error.
    fn error_code(&self) -> Cow<'static, str>;
}

/// Invalid runtime configuration.
///
/// These errors are raised while the runtime is being constructed and
/// prevent it from starting.
#[derive(Clone, Debug, Error, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ConfigError {
    /// Failed to parse the configuration document.
    #[error("failed to parse configuration: {error}")]
    Parse { error: String },

    /// Failed to read the configuration file.
    #[error("failed to read configuration file '{path}': {error}")]
    Io { path: String, error: String },

    /// The checkpoint dispatcher needs at least one worker.
    #[error("checkpoint dispatcher must have at least one worker thread")]
    NoDispatcherThreads,

    /// Dispatcher queues must be able to hold at least one work item.
    #[error("checkpoint dispatcher queue capacity must be positive")]
    ZeroQueueCapacity,

    /// The store must have at least one shard and one replica.
    #[error("checkpoint store needs at least one shard and one replica (shards: {num_shards}, replicas: {num_replicas})")]
    EmptyStore {
        num_shards: usize,
        num_replicas: usize,
    },

    /// Number of configured servers does not match `shards * replicas`.
    #[error("checkpoint store lists {actual} servers, but {num_shards} shards with {num_replicas} replicas need {expected}")]
    ServerCountMismatch {
        num_shards: usize,
        num_replicas: usize,
        expected: usize,
        actual: usize,
    },

    /// Two regions share the same index.
    #[error("consistent region {region} is configured more than once")]
    DuplicateRegion { region: u32 },

    /// Periodic trigger with zero period.
    #[error("consistent region {region} has a periodic trigger with a zero period")]
    ZeroPeriod { region: u32 },

    /// An operator refers to a region that is not configured.
    #[error("operator '{operator}' refers to unknown consistent region {region}")]
    UnknownRegion { operator: String, region: u32 },
}

impl DetailedError for ConfigError {
    fn error_code(&self) -> Cow<'static, str> {
        match self {
            Self::Parse { .. } => Cow::from("ConfigParseError"),
            Self::Io { .. } => Cow::from("ConfigIoError"),
            Self::NoDispatcherThreads => Cow::from("NoDispatcherThreads"),
            Self::ZeroQueueCapacity => Cow::from("ZeroQueueCapacity"),
            Self::EmptyStore { .. } => Cow::from("EmptyStore"),
            Self::ServerCountMismatch { .. } => Cow::from("ServerCountMismatch"),
            Self::DuplicateRegion { .. } => Cow::from("DuplicateRegion"),
            Self::ZeroPeriod { .. } => Cow::from("ZeroPeriod"),
            Self::UnknownRegion { .. } => Cow::from("UnknownRegion"),
        }
    }
}

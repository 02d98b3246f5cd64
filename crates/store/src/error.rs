use crate::BatchState;
use cregion_types::error::{ConfigError, DetailedError};
use serde::{Serialize, Serializer};
use std::borrow::Cow;
use std::io::ErrorKind;
use thiserror::Error;

/// An error that can occur when using the checkpoint store.
#[derive(Clone, Error, Debug, Serialize)]
pub enum StoreError {
    /// I/O error on an established replica connection.
    #[error("I/O error talking to {server}: {message}")]
    Io {
        server: String,
        #[serde(serialize_with = "serialize_error_kind")]
        kind: ErrorKind,
        message: String,
    },

    /// Could not connect to a replica.
    #[error("Cannot connect to replica {server}: {message}")]
    Connect { server: String, message: String },

    /// Fewer than a majority of the shard's replicas could be reached when
    /// commands were queued, so the batch cannot possibly commit.
    #[error("Only {reachable} replicas of shard {shard} are reachable, {required} are required.")]
    InsufficientReplicas {
        shard: usize,
        reachable: usize,
        required: usize,
    },

    /// A command was acknowledged by fewer than a majority of replicas.
    #[error("Only {acked} replicas of shard {shard} acknowledged, {required} are required.")]
    NoQuorum {
        shard: usize,
        acked: usize,
        required: usize,
    },

    /// Replies did not arrive before the deadline.
    #[error("Timed out waiting for {pending} outstanding replies.")]
    Timeout { pending: usize },

    /// The replica sent something we could not parse.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The replica answered with an error reply.
    #[error("Replica {server} returned an error: {message}")]
    Server { server: String, message: String },

    /// The connection to the replica was lost.
    #[error("Connection to replica {server} is closed.")]
    Disconnected { server: String },

    /// Operation does not apply to a batch in this state.
    #[error("Cannot {operation} a batch in state {state:?}.")]
    InvalidBatchState {
        state: BatchState,
        operation: &'static str,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

fn serialize_error_kind<S>(kind: &ErrorKind, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&kind.to_string())
}

impl StoreError {
    pub(crate) fn io(server: &str, error: std::io::Error) -> Self {
        Self::Io {
            server: server.to_string(),
            kind: error.kind(),
            message: error.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Io { kind, .. } => *kind,
            StoreError::Connect { .. } => ErrorKind::ConnectionRefused,
            StoreError::InsufficientReplicas { .. } => ErrorKind::NotConnected,
            StoreError::NoQuorum { .. } => ErrorKind::Other,
            StoreError::Timeout { .. } => ErrorKind::TimedOut,
            StoreError::Protocol(_) => ErrorKind::InvalidData,
            StoreError::Server { .. } => ErrorKind::Other,
            StoreError::Disconnected { .. } => ErrorKind::NotConnected,
            StoreError::InvalidBatchState { .. } => ErrorKind::Other,
            StoreError::Config(_) => ErrorKind::InvalidInput,
        }
    }
}

impl DetailedError for StoreError {
    fn error_code(&self) -> Cow<'static, str> {
        match self {
            Self::Io { .. } => Cow::from("StoreIoError"),
            Self::Connect { .. } => Cow::from("StoreConnectError"),
            Self::InsufficientReplicas { .. } => Cow::from("InsufficientReplicas"),
            Self::NoQuorum { .. } => Cow::from("NoQuorum"),
            Self::Timeout { .. } => Cow::from("StoreTimeout"),
            Self::Protocol(_) => Cow::from("StoreProtocolError"),
            Self::Server { .. } => Cow::from("StoreServerError"),
            Self::Disconnected { .. } => Cow::from("StoreDisconnected"),
            Self::InvalidBatchState { .. } => Cow::from("InvalidBatchState"),
            Self::Config(error) => error.error_code(),
        }
    }
}

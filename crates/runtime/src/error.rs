use crate::dispatcher::DispatchError;
use crate::marker::DecodeError;
use cregion_store::StoreError;
use cregion_types::error::{ConfigError, DetailedError};
use cregion_types::{OperatorIndex, RegionIndex, SequenceId};
use serde::{Serialize, Serializer};
use std::borrow::Cow;
use thiserror::Error;

/// Errors reported by the consistent-region runtime.
#[derive(Debug, Error, Serialize)]
#[serde(untagged)]
pub enum RegionError {
    /// `make_consistent` was called on an operator that does not start its
    /// region.
    #[error("operator {operator} is not a start operator of region {region}")]
    NotStartOfRegion {
        operator: OperatorIndex,
        region: RegionIndex,
    },

    #[error("operator {operator} has no input port {port}")]
    UnknownPort { operator: OperatorIndex, port: usize },

    #[error("the runtime is shutting down")]
    Shutdown,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// A user callback failed.
    #[error("operator {operator} failed in region {region} at sequence {seq}: {error}")]
    Handler {
        operator: OperatorIndex,
        region: RegionIndex,
        seq: SequenceId,
        #[serde(serialize_with = "serialize_anyhow")]
        error: anyhow::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Marker(#[from] DecodeError),
}

fn serialize_anyhow<S>(error: &anyhow::Error, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format!("{error:#}"))
}

impl DetailedError for RegionError {
    fn error_code(&self) -> Cow<'static, str> {
        match self {
            Self::NotStartOfRegion { .. } => Cow::from("NotStartOfRegion"),
            Self::UnknownPort { .. } => Cow::from("UnknownPort"),
            Self::Shutdown => Cow::from("Shutdown"),
            Self::Store(error) => error.error_code(),
            Self::Dispatch(error) => error.error_code(),
            Self::Handler { .. } => Cow::from("OperatorFailed"),
            Self::Config(error) => error.error_code(),
            Self::Marker(_) => Cow::from("InvalidMarker"),
        }
    }
}

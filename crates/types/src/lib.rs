//! Configuration and error types shared by the consistent-region crates.

pub mod config;
pub mod error;

/// Identifies one drain/checkpoint cycle of a region.
pub type SequenceId = i64;

/// Identifies one retry of a reset to a given [`SequenceId`].
pub type ResetAttempt = i32;

/// Stable index of a consistent region.
pub type RegionIndex = u32;

/// Index of an operator in the operator graph.
pub type OperatorIndex = usize;

/// Sequence id meaning "no checkpoint has completed yet".
///
/// Resetting to this id restores an operator to its initial state.
pub const NO_CHECKPOINT: SequenceId = 0;

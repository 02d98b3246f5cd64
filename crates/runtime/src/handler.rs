//! Traits implemented by the operators that take part in a region.

use crate::marker::Marker;
use anyhow::Result as AnyResult;
use cregion_types::SequenceId;

/// User state of an operator.
///
/// The runtime calls these methods from the region's event-loop thread, from
/// the thread that delivers markers, and from dispatcher workers, but never
/// concurrently for one operator.
pub trait StateHandler: Send + Sync {
    /// Called before the operator's input is cut.  The operator may still
    /// submit tuples.
    fn drain(&self) -> AnyResult<()> {
        Ok(())
    }

    /// Serializes the operator's state for cycle `seq`.
    fn checkpoint(&self, seq: SequenceId) -> AnyResult<Vec<u8>>;

    /// Restores the state written by [`checkpoint`](Self::checkpoint) for
    /// `seq`.
    fn reset(&self, seq: SequenceId, checkpoint: &[u8]) -> AnyResult<()>;

    /// Restores the state the operator had before its first checkpoint.
    fn reset_to_initial_state(&self) -> AnyResult<()>;

    /// The checkpoint for `seq` will not be used again.
    fn retire_checkpoint(&self, _seq: SequenceId) -> AnyResult<()> {
        Ok(())
    }

    /// Every operator of the region has checkpointed `seq`.
    fn region_checkpointed(&self, _seq: SequenceId) -> AnyResult<()> {
        Ok(())
    }

    /// The next checkpoint, for `seq`, will be taken while tuples keep
    /// flowing.
    fn prepare_for_non_blocking_checkpoint(&self, _seq: SequenceId) -> AnyResult<()> {
        Ok(())
    }

    /// Operators without state are not checkpointed at all.
    fn has_state(&self) -> bool {
        true
    }
}

/// The output side of an operator, used to send markers downstream.
pub trait MarkerSink: Send + Sync {
    fn submit_marker(&self, port: usize, marker: &Marker) -> AnyResult<()>;
}

/// A handler for operators that keep no state.
#[derive(Clone, Copy, Debug, Default)]
pub struct Stateless;

impl StateHandler for Stateless {
    fn checkpoint(&self, _seq: SequenceId) -> AnyResult<Vec<u8>> {
        Ok(Vec::new())
    }

    fn reset(&self, _seq: SequenceId, _checkpoint: &[u8]) -> AnyResult<()> {
        Ok(())
    }

    fn reset_to_initial_state(&self) -> AnyResult<()> {
        Ok(())
    }

    fn has_state(&self) -> bool {
        false
    }
}

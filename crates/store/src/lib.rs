//! Client for the replicated store that holds consistent-region checkpoints.
//!
//! The store is a set of key-value servers speaking the Redis protocol.  Keys
//! are spread over `num_shards` shards and each shard is replicated on
//! `num_replicas` servers.  [`QuorumStore`] writes every command to all
//! replicas of a shard and treats it as durable once a majority has
//! acknowledged it.  [`MemoryStore`] keeps everything in process memory.

use cregion_types::{OperatorIndex, RegionIndex, SequenceId};
use serde::Serialize;

mod connection;
pub mod error;
mod memory;
pub mod metrics;
mod pool;
mod quorum;
pub mod resp;
mod runtime;
mod session;

pub use error::StoreError;
pub use memory::{MemoryBatch, MemoryStore};
pub use pool::ReplicaPool;
pub use quorum::{QuorumBatch, QuorumStore};
pub use runtime::io_runtime;

/// Lifecycle of a [`CheckpointBatch`].
///
/// A batch starts `Open` and moves to exactly one of the other states, after
/// which it accepts no more operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum BatchState {
    Open,
    Committed,
    Aborted,
    /// The batch could not reach a quorum.
    Error,
}

impl BatchState {
    pub fn is_terminal(&self) -> bool {
        *self != BatchState::Open
    }
}

/// A store of checkpoint blobs.
pub trait CheckpointStore: Send + Sync {
    /// Starts a batch.  Nothing in the batch is visible until it commits.
    fn begin_batch(&self) -> Result<Box<dyn CheckpointBatch>, StoreError>;

    /// Reads `key`.  Returns `None` if the key does not exist.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Writes `key` in a batch of its own.
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut batch = self.begin_batch()?;
        batch.put(key, value)?;
        batch.commit()
    }

    /// Writes every entry in a batch of its own.
    fn put_many(&self, entries: &[(String, Vec<u8>)]) -> Result<(), StoreError> {
        let mut batch = self.begin_batch()?;
        batch.put_many(entries)?;
        batch.commit()
    }

    /// Deletes `key` in a batch of its own.
    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut batch = self.begin_batch()?;
        batch.remove(key)?;
        batch.commit()
    }
}

/// A group of writes that commit together.
///
/// Every method except [`state`](CheckpointBatch::state) and
/// [`abort`](CheckpointBatch::abort) fails with
/// [`StoreError::InvalidBatchState`] once the batch left
/// [`BatchState::Open`].
pub trait CheckpointBatch: Send {
    fn put(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    fn put_many(&mut self, entries: &[(String, Vec<u8>)]) -> Result<(), StoreError>;

    fn remove(&mut self, key: &str) -> Result<(), StoreError>;

    fn commit(&mut self) -> Result<(), StoreError>;

    /// Discards the batch.  Has no effect on a batch that is no longer open.
    fn abort(&mut self);

    fn state(&self) -> BatchState;
}

/// Key under which `operator` stores its checkpoint for cycle `seq` of
/// `region`.
pub fn checkpoint_key(region: RegionIndex, operator: OperatorIndex, seq: SequenceId) -> String {
    format!("ckpt:{region}:{operator}:{seq}")
}

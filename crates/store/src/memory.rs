use crate::error::StoreError;
use crate::{BatchState, CheckpointBatch, CheckpointStore};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// A [`CheckpointStore`] that keeps everything in memory.
///
/// Clones share the same contents.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
    fail_commits: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following commit fail with [`StoreError::NoQuorum`], as if
    /// the replicas had gone away, until called again with `false`.
    pub fn set_fail_commits(&self, fail: bool) {
        self.inner.fail_commits.store(fail, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.entries.lock().unwrap().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.entries.lock().unwrap().keys().cloned().collect()
    }

    pub fn batch(&self) -> MemoryBatch {
        MemoryBatch {
            store: self.clone(),
            state: BatchState::Open,
            ops: Vec::new(),
        }
    }
}

impl CheckpointStore for MemoryStore {
    fn begin_batch(&self) -> Result<Box<dyn CheckpointBatch>, StoreError> {
        Ok(Box::new(self.batch()))
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.inner.entries.lock().unwrap().get(key).cloned())
    }
}

enum Op {
    Put(String, Vec<u8>),
    Remove(String),
}

/// Batch of a [`MemoryStore`].  Operations are applied in order, under one
/// lock, on commit.
pub struct MemoryBatch {
    store: MemoryStore,
    state: BatchState,
    ops: Vec<Op>,
}

impl MemoryBatch {
    fn check_open(&self, operation: &'static str) -> Result<(), StoreError> {
        if self.state.is_terminal() {
            return Err(StoreError::InvalidBatchState {
                state: self.state,
                operation,
            });
        }
        Ok(())
    }
}

impl CheckpointBatch for MemoryBatch {
    fn put(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.check_open("add commands to")?;
        self.ops.push(Op::Put(key.to_string(), value.to_vec()));
        Ok(())
    }

    fn put_many(&mut self, entries: &[(String, Vec<u8>)]) -> Result<(), StoreError> {
        self.check_open("add commands to")?;
        self.ops.extend(
            entries
                .iter()
                .map(|(key, value)| Op::Put(key.clone(), value.clone())),
        );
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        self.check_open("add commands to")?;
        self.ops.push(Op::Remove(key.to_string()));
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.check_open("commit")?;
        let ops = std::mem::take(&mut self.ops);
        if self.store.inner.fail_commits.load(Ordering::Acquire) {
            self.state = BatchState::Error;
            return Err(StoreError::NoQuorum {
                shard: 0,
                acked: 0,
                required: 1,
            });
        }
        let mut entries = self.store.inner.entries.lock().unwrap();
        for op in ops {
            match op {
                Op::Put(key, value) => {
                    entries.insert(key, value);
                }
                Op::Remove(key) => {
                    entries.remove(&key);
                }
            }
        }
        self.state = BatchState::Committed;
        Ok(())
    }

    fn abort(&mut self) {
        if self.state == BatchState::Open {
            self.ops.clear();
            self.state = BatchState::Aborted;
        }
    }

    fn state(&self) -> BatchState {
        self.state
    }
}

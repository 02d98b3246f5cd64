use crate::error::StoreError;
use crate::metrics::{
    describe_store_metrics, BATCHES_COMMITTED, BATCHES_FAILED, COMMANDS_ACKED, COMMIT_LATENCY,
    READ_LATENCY,
};
use crate::pool::ReplicaPool;
use crate::resp::{Command, Reply};
use crate::session::{Request, Session};
use crate::{BatchState, CheckpointBatch, CheckpointStore};
use bytes::Bytes;
use cregion_types::config::StoreConfig;
use metrics::{counter, histogram};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::runtime::Handle;
use tracing::{debug, warn};

/// Client for a sharded store in which every shard is actively replicated on
/// several servers.
///
/// Writes go to every replica of the key's shard and succeed once a majority
/// of replicas acknowledge every command.  Reads ask one replica at a time,
/// starting at a random one.
pub struct QuorumStore {
    pool: Arc<ReplicaPool>,
    runtime: Handle,
}

impl QuorumStore {
    /// Creates a store client.  Replica I/O runs on `runtime`, which must be
    /// a multi-threaded runtime; store methods must not be called from within
    /// it.
    pub fn new(config: StoreConfig, runtime: Handle) -> Result<Self, StoreError> {
        config.validate()?;
        describe_store_metrics();
        Ok(Self {
            pool: Arc::new(ReplicaPool::new(config)),
            runtime,
        })
    }

    pub fn pool(&self) -> &ReplicaPool {
        &self.pool
    }

    /// Starts an empty batch.
    pub fn batch(&self) -> QuorumBatch {
        QuorumBatch {
            pool: self.pool.clone(),
            runtime: self.runtime.clone(),
            state: BatchState::Open,
            session: Session::new(self.pool.clone()),
            shards: BTreeMap::new(),
        }
    }
}

impl CheckpointStore for QuorumStore {
    fn begin_batch(&self) -> Result<Box<dyn CheckpointBatch>, StoreError> {
        Ok(Box::new(self.batch()))
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let start = Instant::now();
        let result = self.runtime.block_on(read(self.pool.clone(), key.to_string()));
        histogram!(READ_LATENCY).record(start.elapsed().as_secs_f64());
        result.map(|value| value.map(|bytes| bytes.to_vec()))
    }
}

/// A set of commands committed to the replicas of their shards.
///
/// The batch checks that a majority of a shard's replicas is reachable the
/// first time a command for that shard is added, and fails immediately if
/// not.  [`commit`](CheckpointBatch::commit) sends every command to every
/// reachable replica, in the order the commands were added, and succeeds if
/// each command was acknowledged by a majority.
pub struct QuorumBatch {
    pool: Arc<ReplicaPool>,
    runtime: Handle,
    state: BatchState,
    session: Session,
    /// Commands per shard, in insertion order.
    shards: BTreeMap<usize, Vec<Command>>,
}

impl QuorumBatch {
    fn check_open(&self, operation: &'static str) -> Result<(), StoreError> {
        if self.state != BatchState::Open {
            return Err(StoreError::InvalidBatchState {
                state: self.state,
                operation,
            });
        }
        Ok(())
    }

    fn add(&mut self, shard: usize, command: Command) -> Result<(), StoreError> {
        self.check_open("add commands to")?;
        if !self.shards.contains_key(&shard) {
            let reachable = self.runtime.block_on(self.session.connect_shard(shard));
            let required = self.pool.majority();
            if reachable < required {
                warn!(
                    shard,
                    reachable, required, "not enough replicas reachable, failing batch"
                );
                self.finish(BatchState::Error);
                counter!(BATCHES_FAILED).increment(1);
                return Err(StoreError::InsufficientReplicas {
                    shard,
                    reachable,
                    required,
                });
            }
        }
        self.shards.entry(shard).or_default().push(command);
        Ok(())
    }

    /// Moves to a terminal state and releases connections and buffers.
    fn finish(&mut self, state: BatchState) {
        self.state = state;
        self.shards.clear();
        self.session = Session::new(self.pool.clone());
    }

    /// Number of shards this batch writes to.
    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }
}

impl CheckpointBatch for QuorumBatch {
    fn put(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let shard = self.pool.shard_of(key);
        let command = Command::hset(self.pool.hash_name(), key, Bytes::copy_from_slice(value));
        self.add(shard, command)
    }

    fn put_many(&mut self, entries: &[(String, Vec<u8>)]) -> Result<(), StoreError> {
        let mut by_shard: BTreeMap<usize, Vec<(&str, Bytes)>> = BTreeMap::new();
        for (key, value) in entries {
            by_shard
                .entry(self.pool.shard_of(key))
                .or_default()
                .push((key.as_str(), Bytes::copy_from_slice(value)));
        }
        for (shard, entries) in by_shard {
            let command = Command::hmset(self.pool.hash_name(), entries);
            self.add(shard, command)?;
        }
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        let shard = self.pool.shard_of(key);
        let command = Command::hdel(self.pool.hash_name(), key);
        self.add(shard, command)
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.check_open("commit")?;
        let start = Instant::now();
        let result = self
            .runtime
            .block_on(commit_shards(&self.pool, &mut self.session, &self.shards));
        match &result {
            Ok(()) => {
                debug!(shards = self.shards.len(), "batch committed");
                counter!(BATCHES_COMMITTED).increment(1);
                histogram!(COMMIT_LATENCY).record(start.elapsed().as_secs_f64());
                self.finish(BatchState::Committed);
            }
            Err(error) => {
                warn!("batch commit failed: {error}");
                counter!(BATCHES_FAILED).increment(1);
                self.finish(BatchState::Error);
            }
        }
        result
    }

    fn abort(&mut self) {
        if self.state == BatchState::Open {
            self.finish(BatchState::Aborted);
        }
    }

    fn state(&self) -> BatchState {
        self.state
    }
}

async fn commit_shards(
    pool: &ReplicaPool,
    session: &mut Session,
    shards: &BTreeMap<usize, Vec<Command>>,
) -> Result<(), StoreError> {
    let mut acks = Vec::with_capacity(shards.len());
    for (shard, commands) in shards {
        let counters: Arc<Vec<AtomicUsize>> =
            Arc::new(commands.iter().map(|_| AtomicUsize::new(0)).collect());
        for server in pool.replicas_of(*shard) {
            for (index, command) in commands.iter().enumerate() {
                let counters = counters.clone();
                session.submit(Request::new(server, command.clone(), move |reply| {
                    match reply {
                        Ok(reply) if reply.is_ack() => {
                            counters[index].fetch_add(1, Ordering::Relaxed);
                            counter!(COMMANDS_ACKED).increment(1);
                        }
                        Ok(reply) => warn!(server, "replica rejected command: {reply:?}"),
                        Err(error) => debug!(server, "no acknowledgement: {error}"),
                    }
                    Vec::new()
                }));
            }
        }
        acks.push((*shard, counters));
    }

    let waited = session.wait(pool.command_timeout()).await;

    let required = pool.majority();
    for (shard, counters) in acks {
        let acked = counters
            .iter()
            .map(|counter| counter.load(Ordering::Relaxed))
            .min()
            .unwrap_or(required);
        if acked < required {
            return Err(match waited {
                Err(error @ StoreError::Timeout { .. }) => error,
                _ => StoreError::NoQuorum {
                    shard,
                    acked,
                    required,
                },
            });
        }
    }
    // A slow replica may time out after a majority has already acknowledged
    // everything.
    if let Err(error) = waited {
        debug!("batch reached quorum despite: {error}");
    }
    Ok(())
}

#[derive(Default)]
struct ReadState {
    value: Option<Bytes>,
    /// Replicas that answered, with or without the key.
    replied: usize,
    negative: usize,
    failed: usize,
}

/// Reads `key` from the replicas of its shard, one at a time.
///
/// Replicas are asked until a majority has answered.  The key exists if any
/// of them has it and is absent otherwise.  Fewer than a majority of answers
/// is an error, even if one of them has the key.
async fn read(pool: Arc<ReplicaPool>, key: String) -> Result<Option<Bytes>, StoreError> {
    let shard = pool.shard_of(&key);
    let order = Arc::new(pool.read_order(shard));
    let state = Arc::new(Mutex::new(ReadState::default()));

    let mut session = Session::new(pool.clone());
    session.connect_shard(shard).await;
    session.submit(read_request(
        pool.clone(),
        Arc::from(key.as_str()),
        order,
        0,
        state.clone(),
    ));
    let waited = session.wait(pool.command_timeout()).await;

    let state = state.lock().unwrap();
    let required = pool.majority();
    if state.replied >= required {
        return Ok(state.value.clone());
    }
    waited?;
    debug!(
        shard,
        replied = state.replied,
        negative = state.negative,
        failed = state.failed,
        "read did not reach a quorum"
    );
    Err(StoreError::NoQuorum {
        shard,
        acked: state.replied,
        required,
    })
}

fn read_request(
    pool: Arc<ReplicaPool>,
    key: Arc<str>,
    order: Arc<Vec<usize>>,
    position: usize,
    state: Arc<Mutex<ReadState>>,
) -> Request {
    let server = order[position];
    let command = Command::hget(pool.hash_name(), &key);
    Request::new(server, command, move |reply| {
        {
            let mut state = state.lock().unwrap();
            match reply {
                Ok(Reply::Bulk(Some(value))) => {
                    state.replied += 1;
                    state.value.get_or_insert(value);
                }
                Ok(Reply::Bulk(None)) => {
                    state.replied += 1;
                    state.negative += 1;
                }
                Ok(reply) => {
                    warn!(server, "unexpected reply to HGET: {reply:?}");
                    state.failed += 1;
                }
                Err(error) => {
                    debug!(server, "read failed: {error}");
                    state.failed += 1;
                }
            }
            if state.replied >= pool.majority() {
                return Vec::new();
            }
        }
        if position + 1 < order.len() {
            vec![read_request(pool, key, order, position + 1, state)]
        } else {
            Vec::new()
        }
    })
}

//! Worker pool that performs checkpoint I/O off the data path.
//!
//! Work for one operator always runs on the same worker (`operator %
//! num_threads`), so it executes in submission order.  Batch boundaries are
//! process-wide, so [`BeginBatch`](WorkItem::BeginBatch),
//! [`CommitBatch`](WorkItem::CommitBatch) and
//! [`AbortBatch`](WorkItem::AbortBatch) go to every worker.  They travel on
//! a separate unbounded channel per worker, so a broadcast never waits for
//! a full queue, and a worker runs them before any item queued after them.

use crate::metrics::{
    CHECKPOINTS_CREATED, CHECKPOINTS_RESTORED, CHECKPOINT_LATENCY, RESTORE_LATENCY,
    WORK_ITEMS_FAILED,
};
use anyhow::{anyhow, Result as AnyResult};
use crossbeam::channel::{bounded, never, select, unbounded, Receiver, Sender, TrySendError};
use cregion_store::{checkpoint_key, CheckpointBatch, CheckpointStore};
use cregion_types::config::DispatcherConfig;
use cregion_types::error::{ConfigError, DetailedError};
use cregion_types::{OperatorIndex, RegionIndex, ResetAttempt, SequenceId, NO_CHECKPOINT};
use metrics::{counter, histogram};
use serde::Serialize;
use std::any::Any;
use std::borrow::Cow;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, trace, warn};

/// An operator whose state the dispatcher saves and restores.
pub trait CheckpointTarget: Send + Sync {
    fn operator(&self) -> OperatorIndex;

    fn region(&self) -> RegionIndex;

    fn has_state(&self) -> bool;

    /// Whether a checkpoint for `seq` is still wanted.  A reset or a newer
    /// cycle makes older checkpoint requests obsolete.
    fn should_proceed_with_checkpoint(&self, seq: SequenceId) -> bool;

    fn should_proceed_with_reset(&self, seq: SequenceId, attempt: ResetAttempt) -> bool;

    fn checkpoint(&self, seq: SequenceId) -> AnyResult<Vec<u8>>;

    /// Restores the checkpoint of `seq`, or the initial state if `checkpoint`
    /// is `None`.
    fn restore(&self, seq: SequenceId, checkpoint: Option<&[u8]>) -> AnyResult<()>;

    fn checkpoint_completed(&self, seq: SequenceId);

    fn reset_completed(&self, seq: SequenceId, attempt: ResetAttempt);

    fn operator_failed(&self, seq: SequenceId, error: anyhow::Error);
}

/// Callback of a [`BatchLatch`].
pub type LatchCallback = Box<dyn FnOnce(AnyResult<()>) + Send>;

/// Collects the results of one broadcast item from every worker and invokes
/// a callback once, with the first error if there was one.
pub struct BatchLatch {
    inner: Mutex<LatchInner>,
}

struct LatchInner {
    remaining: usize,
    error: Option<anyhow::Error>,
    callback: Option<LatchCallback>,
}

impl BatchLatch {
    pub fn new<F>(count: usize, callback: F) -> Arc<Self>
    where
        F: FnOnce(AnyResult<()>) + Send + 'static,
    {
        Arc::new(Self {
            inner: Mutex::new(LatchInner {
                remaining: count,
                error: None,
                callback: Some(Box::new(callback)),
            }),
        })
    }

    /// A latch nobody waits for.
    pub fn detached(count: usize) -> Arc<Self> {
        Self::new(count, |_| {})
    }

    pub fn done(&self, result: AnyResult<()>) {
        let callback = {
            let mut inner = self.inner.lock().unwrap();
            if let Err(error) = result {
                inner.error.get_or_insert(error);
            }
            inner.remaining = inner.remaining.saturating_sub(1);
            if inner.remaining > 0 {
                return;
            }
            inner
                .callback
                .take()
                .map(|callback| (callback, inner.error.take()))
        };
        if let Some((callback, error)) = callback {
            callback(match error {
                Some(error) => Err(error),
                None => Ok(()),
            });
        }
    }
}

/// A unit of work for the dispatcher.
pub enum WorkItem {
    CreateCheckpoint {
        target: Arc<dyn CheckpointTarget>,
        seq: SequenceId,
    },
    ResetCheckpoint {
        target: Arc<dyn CheckpointTarget>,
        seq: SequenceId,
        attempt: ResetAttempt,
    },
    /// Deletes a retired checkpoint.
    DeleteCheckpoint {
        region: RegionIndex,
        operator: OperatorIndex,
        seq: SequenceId,
    },
    BeginBatch {
        region: RegionIndex,
        seq: SequenceId,
        latch: Arc<BatchLatch>,
    },
    CommitBatch {
        region: RegionIndex,
        seq: SequenceId,
        latch: Arc<BatchLatch>,
    },
    AbortBatch {
        region: RegionIndex,
        seq: SequenceId,
        latch: Arc<BatchLatch>,
    },
}

impl WorkItem {
    pub fn name(&self) -> &'static str {
        match self {
            WorkItem::CreateCheckpoint { .. } => "CreateCheckpoint",
            WorkItem::ResetCheckpoint { .. } => "ResetCheckpoint",
            WorkItem::DeleteCheckpoint { .. } => "DeleteCheckpoint",
            WorkItem::BeginBatch { .. } => "BeginBatch",
            WorkItem::CommitBatch { .. } => "CommitBatch",
            WorkItem::AbortBatch { .. } => "AbortBatch",
        }
    }

    /// The operator whose worker runs this item.  `None` for broadcast
    /// items.
    pub fn operator(&self) -> Option<OperatorIndex> {
        match self {
            WorkItem::CreateCheckpoint { target, .. } | WorkItem::ResetCheckpoint { target, .. } => {
                Some(target.operator())
            }
            WorkItem::DeleteCheckpoint { operator, .. } => Some(*operator),
            WorkItem::BeginBatch { .. }
            | WorkItem::CommitBatch { .. }
            | WorkItem::AbortBatch { .. } => None,
        }
    }
}

#[derive(Clone, Debug, Error, Serialize, PartialEq, Eq)]
pub enum DispatchError {
    #[error("queue of dispatcher worker {worker} is full")]
    QueueFull { worker: usize },

    #[error("dispatcher is shut down")]
    Shutdown,
}

impl DetailedError for DispatchError {
    fn error_code(&self) -> Cow<'static, str> {
        match self {
            Self::QueueFull { .. } => Cow::from("DispatcherQueueFull"),
            Self::Shutdown => Cow::from("DispatcherShutdown"),
        }
    }
}

static NEXT_DISPATCHER_ID: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    /// `(dispatcher id, worker index)` if this thread is a dispatcher worker.
    static CURRENT_WORKER: Cell<Option<(usize, usize)>> = const { Cell::new(None) };

    /// Items a worker submitted to its own queue.  They run right after the
    /// current item instead of going through the (possibly full) queue.
    static DEFERRED: RefCell<VecDeque<WorkItem>> = const { RefCell::new(VecDeque::new()) };
}

/// Sending halves of one worker's channels.
#[derive(Clone)]
struct WorkerQueues {
    /// Bounded queue for per-operator items.
    items: Sender<WorkItem>,
    /// Batch boundaries.
    control: Sender<WorkItem>,
}

/// A fixed pool of single-threaded workers with bounded queues.
pub struct Dispatcher {
    id: usize,
    num_threads: usize,
    senders: Mutex<Vec<WorkerQueues>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(
        config: &DispatcherConfig,
        store: Arc<dyn CheckpointStore>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let id = NEXT_DISPATCHER_ID.fetch_add(1, Ordering::Relaxed);

        let mut senders = Vec::with_capacity(config.num_threads);
        let mut workers = Vec::with_capacity(config.num_threads);
        for index in 0..config.num_threads {
            let (items, items_receiver) = bounded(config.queue_capacity);
            let (control, control_receiver) = unbounded();
            let worker = Worker {
                dispatcher: id,
                index,
                store: store.clone(),
                regions: BTreeMap::new(),
            };
            let handle = thread::Builder::new()
                .name(format!("cregion-dispatch-{index}"))
                .spawn(move || worker.run(items_receiver, control_receiver))
                .unwrap_or_else(|error| {
                    panic!("failed to spawn dispatcher worker {index}: {error}");
                });
            senders.push(WorkerQueues { items, control });
            workers.push(handle);
        }

        Ok(Self {
            id,
            num_threads: config.num_threads,
            senders: Mutex::new(senders),
            workers: Mutex::new(workers),
        })
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Worker that runs items for `operator`.
    pub fn worker_of(&self, operator: OperatorIndex) -> usize {
        operator % self.num_threads
    }

    fn queues(&self, worker: usize) -> Result<WorkerQueues, DispatchError> {
        self.senders
            .lock()
            .unwrap()
            .get(worker)
            .cloned()
            .ok_or(DispatchError::Shutdown)
    }

    fn send(&self, worker: usize, item: WorkItem, block: bool) -> Result<(), DispatchError> {
        if CURRENT_WORKER.with(Cell::get) == Some((self.id, worker)) {
            DEFERRED.with(|deferred| deferred.borrow_mut().push_back(item));
            return Ok(());
        }

        let sender = self.queues(worker)?.items;
        if block {
            sender.send(item).map_err(|_| DispatchError::Shutdown)
        } else {
            sender.try_send(item).map_err(|error| match error {
                TrySendError::Full(_) => DispatchError::QueueFull { worker },
                TrySendError::Disconnected(_) => DispatchError::Shutdown,
            })
        }
    }

    /// Puts a batch boundary on `worker`'s control channel.  Never blocks,
    /// so it is safe to call from a worker or with a lock held.
    fn send_control(&self, worker: usize, item: WorkItem) -> Result<(), DispatchError> {
        if CURRENT_WORKER.with(Cell::get) == Some((self.id, worker)) {
            DEFERRED.with(|deferred| deferred.borrow_mut().push_back(item));
            return Ok(());
        }
        self.queues(worker)?
            .control
            .send(item)
            .map_err(|_| DispatchError::Shutdown)
    }

    fn route(&self, item: &WorkItem) -> usize {
        item.operator()
            .map(|operator| self.worker_of(operator))
            .unwrap_or(0)
    }

    /// Queues `item` on its operator's worker, waiting while the queue is
    /// full.
    pub fn submit(&self, item: WorkItem) -> Result<(), DispatchError> {
        trace!(item = item.name(), "submitting work item");
        self.send(self.route(&item), item, true)
    }

    /// Like [`submit`](Self::submit), but fails with
    /// [`DispatchError::QueueFull`] instead of waiting.
    pub fn try_submit(&self, item: WorkItem) -> Result<(), DispatchError> {
        self.send(self.route(&item), item, false)
    }

    fn broadcast<F>(&self, latch: Arc<BatchLatch>, make_item: F) -> Result<(), DispatchError>
    where
        F: Fn(Arc<BatchLatch>) -> WorkItem,
    {
        for worker in 0..self.num_threads {
            if let Err(error) = self.send_control(worker, make_item(latch.clone())) {
                // Workers that never got the item must still count down.
                for _ in worker..self.num_threads {
                    latch.done(Err(anyhow!("{error}")));
                }
                return Err(error);
            }
        }
        Ok(())
    }

    /// Opens a batch for `seq` of `region` on every worker.
    pub fn begin_batch<F>(
        &self,
        region: RegionIndex,
        seq: SequenceId,
        callback: F,
    ) -> Result<(), DispatchError>
    where
        F: FnOnce(AnyResult<()>) + Send + 'static,
    {
        let latch = BatchLatch::new(self.num_threads, callback);
        self.broadcast(latch, |latch| WorkItem::BeginBatch { region, seq, latch })
    }

    /// Commits every worker's batch for `seq` of `region`.  `callback` gets
    /// the combined result.
    pub fn commit_batch<F>(
        &self,
        region: RegionIndex,
        seq: SequenceId,
        callback: F,
    ) -> Result<(), DispatchError>
    where
        F: FnOnce(AnyResult<()>) + Send + 'static,
    {
        let latch = BatchLatch::new(self.num_threads, callback);
        self.broadcast(latch, |latch| WorkItem::CommitBatch { region, seq, latch })
    }

    /// Aborts open batches of `region` up to `seq`.
    pub fn abort_batch(&self, region: RegionIndex, seq: SequenceId) -> Result<(), DispatchError> {
        let latch = BatchLatch::detached(self.num_threads);
        self.broadcast(latch, |latch| WorkItem::AbortBatch { region, seq, latch })
    }

    /// Closes the queues and waits for the workers to finish the items
    /// already queued.
    pub fn shutdown(&self) {
        self.senders.lock().unwrap().clear();
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        let current = thread::current().id();
        for worker in workers {
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                error!("dispatcher worker panicked");
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Open batch of one region on one worker.
struct RegionBatch {
    batch: Option<Box<dyn CheckpointBatch>>,
    current_seq: SequenceId,
}

impl Default for RegionBatch {
    fn default() -> Self {
        Self {
            batch: None,
            current_seq: NO_CHECKPOINT,
        }
    }
}

struct Worker {
    dispatcher: usize,
    index: usize,
    store: Arc<dyn CheckpointStore>,
    regions: BTreeMap<RegionIndex, RegionBatch>,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl Worker {
    fn run(mut self, mut items: Receiver<WorkItem>, mut control: Receiver<WorkItem>) {
        CURRENT_WORKER.with(|current| current.set(Some((self.dispatcher, self.index))));
        let (mut items_open, mut control_open) = (true, true);
        while items_open || control_open {
            let (queued, item) = select! {
                recv(control) -> item => (false, item),
                recv(items) -> item => (true, item),
            };
            match item {
                Ok(item) => {
                    // A boundary broadcast before this item was queued runs
                    // first.
                    if queued {
                        while let Ok(boundary) = control.try_recv() {
                            self.run_item(boundary);
                        }
                    }
                    self.run_item(item);
                }
                Err(_) if queued => {
                    items_open = false;
                    items = never();
                }
                Err(_) => {
                    control_open = false;
                    control = never();
                }
            }
        }
        for (_, mut region) in std::mem::take(&mut self.regions) {
            if let Some(mut batch) = region.batch.take() {
                batch.abort();
            }
        }
        debug!(worker = self.index, "dispatcher worker exiting");
    }

    /// Runs `item` and whatever it submitted to this worker.
    fn run_item(&mut self, item: WorkItem) {
        self.process(item);
        while let Some(item) = DEFERRED.with(|deferred| deferred.borrow_mut().pop_front()) {
            self.process(item);
        }
    }

    /// Runs `item`, turning panics into failures of the item.
    fn process(&mut self, item: WorkItem) {
        let name = item.name();
        let on_panic: Box<dyn FnOnce(anyhow::Error)> = match &item {
            WorkItem::CreateCheckpoint { target, seq }
            | WorkItem::ResetCheckpoint { target, seq, .. } => {
                let (target, seq) = (target.clone(), *seq);
                Box::new(move |error| target.operator_failed(seq, error))
            }
            WorkItem::BeginBatch { latch, .. }
            | WorkItem::CommitBatch { latch, .. }
            | WorkItem::AbortBatch { latch, .. } => {
                let latch = latch.clone();
                Box::new(move |error| latch.done(Err(error)))
            }
            WorkItem::DeleteCheckpoint { .. } => Box::new(|_| {}),
        };

        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| self.execute(item))) {
            let message = panic_message(payload.as_ref());
            error!(worker = self.index, item = name, "work item panicked: {message}");
            counter!(WORK_ITEMS_FAILED).increment(1);
            on_panic(anyhow!("{name} panicked: {message}"));
        }
    }

    fn execute(&mut self, item: WorkItem) {
        match item {
            WorkItem::CreateCheckpoint { target, seq } => {
                if !target.should_proceed_with_checkpoint(seq) {
                    debug!(
                        operator = target.operator(),
                        region = target.region(),
                        seq,
                        "skipping obsolete checkpoint"
                    );
                    return;
                }
                let start = Instant::now();
                match self.create_checkpoint(target.as_ref(), seq) {
                    Ok(()) => {
                        counter!(CHECKPOINTS_CREATED).increment(1);
                        histogram!(CHECKPOINT_LATENCY).record(start.elapsed().as_secs_f64());
                        target.checkpoint_completed(seq);
                    }
                    Err(error) => {
                        error!(
                            operator = target.operator(),
                            region = target.region(),
                            seq,
                            "checkpoint failed: {error:#}"
                        );
                        counter!(WORK_ITEMS_FAILED).increment(1);
                        target.operator_failed(seq, error);
                    }
                }
            }
            WorkItem::ResetCheckpoint {
                target,
                seq,
                attempt,
            } => {
                if !target.should_proceed_with_reset(seq, attempt) {
                    debug!(
                        operator = target.operator(),
                        region = target.region(),
                        seq,
                        attempt,
                        "skipping superseded reset"
                    );
                    return;
                }
                let start = Instant::now();
                match self.restore_checkpoint(target.as_ref(), seq) {
                    Ok(()) => {
                        counter!(CHECKPOINTS_RESTORED).increment(1);
                        histogram!(RESTORE_LATENCY).record(start.elapsed().as_secs_f64());
                        target.reset_completed(seq, attempt);
                    }
                    Err(error) => {
                        error!(
                            operator = target.operator(),
                            region = target.region(),
                            seq,
                            attempt,
                            "reset failed: {error:#}"
                        );
                        counter!(WORK_ITEMS_FAILED).increment(1);
                        target.operator_failed(seq, error);
                    }
                }
            }
            WorkItem::DeleteCheckpoint {
                region,
                operator,
                seq,
            } => {
                if let Err(error) = self.store.remove(&checkpoint_key(region, operator, seq)) {
                    warn!(operator, region, seq, "cannot delete retired checkpoint: {error}");
                }
            }
            WorkItem::BeginBatch { region, seq, latch } => {
                let entry = self.regions.entry(region).or_default();
                let result = if seq > entry.current_seq {
                    if let Some(mut stale) = entry.batch.take() {
                        stale.abort();
                    }
                    entry.current_seq = seq;
                    match self.store.begin_batch() {
                        Ok(batch) => {
                            entry.batch = Some(batch);
                            Ok(())
                        }
                        Err(error) => Err(error.into()),
                    }
                } else {
                    trace!(region, seq, "batch already started");
                    Ok(())
                };
                latch.done(result);
            }
            WorkItem::CommitBatch { region, seq, latch } => {
                let result = match self.regions.get_mut(&region) {
                    Some(entry) if entry.current_seq == seq => match entry.batch.take() {
                        Some(mut batch) => batch.commit().map_err(Into::into),
                        None => Ok(()),
                    },
                    _ => Ok(()),
                };
                if let Err(error) = &result {
                    warn!(worker = self.index, region, seq, "batch commit failed: {error}");
                }
                latch.done(result);
            }
            WorkItem::AbortBatch { region, seq, latch } => {
                if let Some(entry) = self.regions.get_mut(&region) {
                    if entry.current_seq <= seq {
                        if let Some(mut batch) = entry.batch.take() {
                            debug!(worker = self.index, region, seq, "aborting batch");
                            batch.abort();
                        }
                    }
                }
                latch.done(Ok(()));
            }
        }
    }

    fn create_checkpoint(
        &mut self,
        target: &dyn CheckpointTarget,
        seq: SequenceId,
    ) -> AnyResult<()> {
        let data = target.checkpoint(seq)?;
        let key = checkpoint_key(target.region(), target.operator(), seq);
        match self.regions.get_mut(&target.region()) {
            Some(RegionBatch {
                batch: Some(batch),
                current_seq,
            }) if *current_seq == seq => batch.put(&key, &data)?,
            _ => self.store.put(&key, &data)?,
        }
        Ok(())
    }

    fn restore_checkpoint(&mut self, target: &dyn CheckpointTarget, seq: SequenceId) -> AnyResult<()> {
        if seq == NO_CHECKPOINT {
            return target.restore(seq, None);
        }
        if !target.has_state() {
            return Ok(());
        }
        let key = checkpoint_key(target.region(), target.operator(), seq);
        let data = self
            .store
            .get(&key)?
            .ok_or_else(|| anyhow!("checkpoint '{key}' does not exist"))?;
        target.restore(seq, Some(&data))
    }
}

#[cfg(test)]
mod test {
    use super::{BatchLatch, CheckpointTarget, DispatchError, Dispatcher, WorkItem};
    use anyhow::{anyhow, Result as AnyResult};
    use crossbeam::channel::{bounded, Receiver, Sender};
    use cregion_store::{checkpoint_key, CheckpointStore, MemoryStore};
    use cregion_types::config::DispatcherConfig;
    use cregion_types::error::ConfigError;
    use cregion_types::{OperatorIndex, RegionIndex, ResetAttempt, SequenceId};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Clone, Debug, PartialEq, Eq)]
    enum Event {
        Checkpointed(OperatorIndex, SequenceId),
        Restored(OperatorIndex, SequenceId, Option<Vec<u8>>),
        ResetCompleted(OperatorIndex, SequenceId, ResetAttempt),
        Failed(OperatorIndex, SequenceId),
    }

    struct TestTarget {
        operator: OperatorIndex,
        proceed: bool,
        panic: bool,
        /// Checkpoints wait for a token on this channel.
        gate: Option<Receiver<()>>,
        /// Runs on the worker before the completion is recorded.
        on_completed: Option<Box<dyn Fn(SequenceId) + Send + Sync>>,
        events: Arc<Mutex<Vec<Event>>>,
    }

    impl TestTarget {
        fn new(operator: OperatorIndex, events: &Arc<Mutex<Vec<Event>>>) -> Self {
            Self {
                operator,
                proceed: true,
                panic: false,
                gate: None,
                on_completed: None,
                events: events.clone(),
            }
        }

        fn push(&self, event: Event) {
            self.events.lock().unwrap().push(event);
        }
    }

    impl CheckpointTarget for TestTarget {
        fn operator(&self) -> OperatorIndex {
            self.operator
        }

        fn region(&self) -> RegionIndex {
            0
        }

        fn has_state(&self) -> bool {
            true
        }

        fn should_proceed_with_checkpoint(&self, _seq: SequenceId) -> bool {
            self.proceed
        }

        fn should_proceed_with_reset(&self, _seq: SequenceId, _attempt: ResetAttempt) -> bool {
            self.proceed
        }

        fn checkpoint(&self, seq: SequenceId) -> AnyResult<Vec<u8>> {
            if let Some(gate) = &self.gate {
                gate.recv()?;
            }
            if self.panic {
                panic!("checkpoint exploded");
            }
            Ok(format!("{}:{seq}", self.operator).into_bytes())
        }

        fn restore(&self, seq: SequenceId, checkpoint: Option<&[u8]>) -> AnyResult<()> {
            self.push(Event::Restored(
                self.operator,
                seq,
                checkpoint.map(<[u8]>::to_vec),
            ));
            Ok(())
        }

        fn checkpoint_completed(&self, seq: SequenceId) {
            if let Some(on_completed) = &self.on_completed {
                on_completed(seq);
            }
            self.push(Event::Checkpointed(self.operator, seq));
        }

        fn reset_completed(&self, seq: SequenceId, attempt: ResetAttempt) {
            self.push(Event::ResetCompleted(self.operator, seq, attempt));
        }

        fn operator_failed(&self, seq: SequenceId, _error: anyhow::Error) {
            self.push(Event::Failed(self.operator, seq));
        }
    }

    fn dispatcher(num_threads: usize, queue_capacity: usize, store: &MemoryStore) -> Dispatcher {
        let config = DispatcherConfig {
            num_threads,
            queue_capacity,
        };
        Dispatcher::new(&config, Arc::new(store.clone())).unwrap()
    }

    fn wait_for(events: &Arc<Mutex<Vec<Event>>>, count: usize) -> Vec<Event> {
        for _ in 0..500 {
            let events = events.lock().unwrap();
            if events.len() >= count {
                return events.clone();
            }
            drop(events);
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("timeout waiting for {count} events");
    }

    #[test]
    fn zero_threads_is_rejected() {
        let config = DispatcherConfig {
            num_threads: 0,
            queue_capacity: 1,
        };
        assert!(matches!(
            Dispatcher::new(&config, Arc::new(MemoryStore::new())),
            Err(ConfigError::NoDispatcherThreads)
        ));
    }

    #[test]
    fn work_for_one_operator_runs_in_order() {
        let store = MemoryStore::new();
        let dispatcher = dispatcher(3, 64, &store);
        let events = Arc::new(Mutex::new(Vec::new()));
        let targets: Vec<Arc<TestTarget>> = (0..5)
            .map(|operator| Arc::new(TestTarget::new(operator, &events)))
            .collect();

        for seq in 1..=10 {
            for target in targets.iter() {
                dispatcher
                    .submit(WorkItem::CreateCheckpoint {
                        target: target.clone(),
                        seq,
                    })
                    .unwrap();
            }
        }
        let events = wait_for(&events, 50);
        for operator in 0..5 {
            let seqs: Vec<SequenceId> = events
                .iter()
                .filter_map(|event| match event {
                    Event::Checkpointed(op, seq) if *op == operator => Some(*seq),
                    _ => None,
                })
                .collect();
            assert_eq!(seqs, (1..=10).collect::<Vec<_>>());
        }
        assert_eq!(
            store.get(&checkpoint_key(0, 4, 7)).unwrap(),
            Some(b"4:7".to_vec())
        );
    }

    #[test]
    fn full_queue_rejects_try_submit() {
        let store = MemoryStore::new();
        let dispatcher = dispatcher(1, 1, &store);
        let events = Arc::new(Mutex::new(Vec::new()));
        let (release, gate): (Sender<()>, Receiver<()>) = bounded(0);
        let blocked = Arc::new(TestTarget {
            gate: Some(gate),
            ..TestTarget::new(0, &events)
        });

        // The first item occupies the worker, the second fills the queue.
        dispatcher
            .submit(WorkItem::CreateCheckpoint {
                target: blocked.clone(),
                seq: 1,
            })
            .unwrap();
        let mut queued = 0;
        let mut rejected = None;
        for seq in 2..10 {
            match dispatcher.try_submit(WorkItem::CreateCheckpoint {
                target: blocked.clone(),
                seq,
            }) {
                Ok(()) => queued += 1,
                Err(error) => {
                    rejected = Some(error);
                    break;
                }
            }
        }
        assert_eq!(rejected, Some(DispatchError::QueueFull { worker: 0 }));
        assert!(queued <= 2);

        for _ in 0..queued + 1 {
            release.send(()).unwrap();
        }
        wait_for(&events, queued + 1);
    }

    #[test]
    fn obsolete_items_are_skipped() {
        let store = MemoryStore::new();
        let dispatcher = dispatcher(1, 8, &store);
        let events = Arc::new(Mutex::new(Vec::new()));
        let stale = Arc::new(TestTarget {
            proceed: false,
            ..TestTarget::new(1, &events)
        });
        let live = Arc::new(TestTarget::new(2, &events));

        dispatcher
            .submit(WorkItem::CreateCheckpoint {
                target: stale,
                seq: 3,
            })
            .unwrap();
        dispatcher
            .submit(WorkItem::CreateCheckpoint {
                target: live,
                seq: 3,
            })
            .unwrap();
        assert_eq!(wait_for(&events, 1), vec![Event::Checkpointed(2, 3)]);
        assert!(!store.contains(&checkpoint_key(0, 1, 3)));
    }

    #[test]
    fn panics_become_operator_failures() {
        let store = MemoryStore::new();
        let dispatcher = dispatcher(2, 8, &store);
        let events = Arc::new(Mutex::new(Vec::new()));
        let target = Arc::new(TestTarget {
            panic: true,
            ..TestTarget::new(1, &events)
        });
        dispatcher
            .submit(WorkItem::CreateCheckpoint { target, seq: 4 })
            .unwrap();
        assert_eq!(wait_for(&events, 1), vec![Event::Failed(1, 4)]);

        // The worker survived.
        let target = Arc::new(TestTarget::new(3, &events));
        dispatcher
            .submit(WorkItem::CreateCheckpoint { target, seq: 4 })
            .unwrap();
        assert_eq!(wait_for(&events, 2)[1], Event::Checkpointed(3, 4));
    }

    #[test]
    fn batches_commit_on_every_worker() {
        let store = MemoryStore::new();
        let dispatcher = dispatcher(2, 8, &store);
        let events = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = bounded(2);

        let tx = done_tx.clone();
        dispatcher
            .begin_batch(0, 5, move |result| tx.send(result.is_ok()).unwrap())
            .unwrap();
        assert!(done_rx.recv().unwrap());

        for operator in 0..2 {
            let target = Arc::new(TestTarget::new(operator, &events));
            dispatcher
                .submit(WorkItem::CreateCheckpoint { target, seq: 5 })
                .unwrap();
        }
        wait_for(&events, 2);
        // Written into the open batches, not visible yet.
        assert!(store.is_empty());

        dispatcher
            .commit_batch(0, 5, move |result| done_tx.send(result.is_ok()).unwrap())
            .unwrap();
        assert!(done_rx.recv().unwrap());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn broadcasts_do_not_wait_for_full_queues() {
        let store = MemoryStore::new();
        let dispatcher = Arc::new(dispatcher(2, 1, &store));
        let events = Arc::new(Mutex::new(Vec::new()));
        let (release, gate): (Sender<()>, Receiver<()>) = bounded(0);
        let blocked = Arc::new(TestTarget {
            gate: Some(gate),
            ..TestTarget::new(1, &events)
        });

        // Worker 1 is stuck in seq 1 and its queue holds seq 2.
        for seq in 1..=2 {
            dispatcher
                .submit(WorkItem::CreateCheckpoint {
                    target: blocked.clone(),
                    seq,
                })
                .unwrap();
        }
        assert_eq!(
            dispatcher.try_submit(WorkItem::CreateCheckpoint {
                target: blocked.clone(),
                seq: 3,
            }),
            Err(DispatchError::QueueFull { worker: 1 })
        );

        // Worker 0 commits the batch from inside a work item.
        let (done_tx, done_rx) = bounded(1);
        let committer = dispatcher.clone();
        let committing = Arc::new(TestTarget {
            on_completed: Some(Box::new(move |seq| {
                let done_tx = done_tx.clone();
                committer
                    .commit_batch(0, seq, move |result| {
                        done_tx.send(result.is_ok()).unwrap()
                    })
                    .unwrap();
            })),
            ..TestTarget::new(0, &events)
        });
        dispatcher.begin_batch(0, 7, |_| {}).unwrap();
        dispatcher
            .submit(WorkItem::CreateCheckpoint {
                target: committing.clone(),
                seq: 7,
            })
            .unwrap();
        assert_eq!(wait_for(&events, 1), vec![Event::Checkpointed(0, 7)]);
        assert!(done_rx.try_recv().is_err());

        release.send(()).unwrap();
        release.send(()).unwrap();
        assert!(done_rx.recv_timeout(Duration::from_secs(10)).unwrap());
        assert!(store.contains(&checkpoint_key(0, 0, 7)));
        let events = wait_for(&events, 3);
        assert!(events.contains(&Event::Checkpointed(1, 1)));
        assert!(events.contains(&Event::Checkpointed(1, 2)));
    }

    #[test]
    fn failed_commit_reaches_the_callback() {
        let store = MemoryStore::new();
        let dispatcher = dispatcher(2, 8, &store);
        let events = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = bounded(1);

        dispatcher.begin_batch(0, 1, |_| {}).unwrap();
        dispatcher
            .submit(WorkItem::CreateCheckpoint {
                target: Arc::new(TestTarget::new(1, &events)),
                seq: 1,
            })
            .unwrap();
        wait_for(&events, 1);

        store.set_fail_commits(true);
        dispatcher
            .commit_batch(0, 1, move |result| done_tx.send(result.is_err()).unwrap())
            .unwrap();
        assert!(done_rx.recv().unwrap());
        assert!(store.is_empty());
    }

    #[test]
    fn reset_restores_from_store() {
        let store = MemoryStore::new();
        store.put(&checkpoint_key(0, 1, 6), b"saved").unwrap();
        let dispatcher = dispatcher(2, 8, &store);
        let events = Arc::new(Mutex::new(Vec::new()));
        let target = Arc::new(TestTarget::new(1, &events));

        dispatcher
            .submit(WorkItem::ResetCheckpoint {
                target: target.clone(),
                seq: 6,
                attempt: 2,
            })
            .unwrap();
        dispatcher
            .submit(WorkItem::ResetCheckpoint {
                target: target.clone(),
                seq: 0,
                attempt: 0,
            })
            .unwrap();
        // Missing checkpoint.
        dispatcher
            .submit(WorkItem::ResetCheckpoint {
                target,
                seq: 9,
                attempt: 0,
            })
            .unwrap();

        assert_eq!(
            wait_for(&events, 5),
            vec![
                Event::Restored(1, 6, Some(b"saved".to_vec())),
                Event::ResetCompleted(1, 6, 2),
                Event::Restored(1, 0, None),
                Event::ResetCompleted(1, 0, 0),
                Event::Failed(1, 9),
            ]
        );
    }

    #[test]
    fn retired_checkpoints_are_deleted() {
        let store = MemoryStore::new();
        store.put(&checkpoint_key(2, 3, 1), b"old").unwrap();
        let dispatcher = dispatcher(2, 8, &store);
        dispatcher
            .submit(WorkItem::DeleteCheckpoint {
                region: 2,
                operator: 3,
                seq: 1,
            })
            .unwrap();
        dispatcher.shutdown();
        assert!(store.is_empty());
        assert_eq!(
            dispatcher.submit(WorkItem::DeleteCheckpoint {
                region: 2,
                operator: 3,
                seq: 1,
            }),
            Err(DispatchError::Shutdown)
        );
    }

    #[test]
    fn latch_reports_first_error() {
        let (tx, rx) = bounded(1);
        let latch = BatchLatch::new(3, move |result: AnyResult<()>| {
            tx.send(result.map_err(|e| e.to_string())).unwrap()
        });
        latch.done(Ok(()));
        latch.done(Err(anyhow!("first")));
        assert!(rx.try_recv().is_err());
        latch.done(Err(anyhow!("second")));
        assert_eq!(rx.recv().unwrap(), Err("first".to_string()));
    }
}

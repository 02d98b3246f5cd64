//! Drives one operator through the drain, checkpoint, reset and resume
//! cycles of its region.
//!
//! Submission threads hold a permit while they run user code.  Before a
//! drain or a reset, the coordinator pauses: new permits are refused and it
//! waits until every permit held outside [`make_consistent`] is released.
//! A resume lifts the pause.
//!
//! Start operators of a region run an event loop that receives controller
//! [`Notification`]s.  Other operators learn about cycles from the markers
//! that arrive on their input ports, see [`RegionCoordinator::receive`].
//!
//! [`make_consistent`]: RegionCoordinator::make_consistent

use crate::aggregator::RegionAggregator;
use crate::channel::{Delivery, MarkerChannel};
use crate::control::Notification;
use crate::dispatcher::{CheckpointTarget, Dispatcher, WorkItem};
use crate::error::RegionError;
use crate::handler::{MarkerSink, StateHandler};
use crate::marker::Marker;
use crate::topology::OperatorRegionInfo;
use anyhow::{anyhow, Context, Result as AnyResult};
use crossbeam::channel::{bounded, select, unbounded, Receiver, Sender};
use cregion_types::{OperatorIndex, RegionIndex, ResetAttempt, SequenceId, NO_CHECKPOINT};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// How long the event loop sleeps when nothing happens, which bounds the
/// delay with which drain and reset timeouts are noticed.
const EVENT_LOOP_TICK: Duration = Duration::from_millis(50);

/// Outcome of [`RegionCoordinator::make_consistent`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum DrainResult {
    /// The region checkpointed the cycle.
    Completed,
    /// Blocking operators checkpointed the cycle; non-blocking ones are
    /// still at it.
    CheckpointPending,
    /// The region was reset instead.
    Failed,
}

/// Where the operator is in the current cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum RegionPhase {
    Initial,
    Draining,
    Drained,
    CheckpointPending,
    Resetting,
}

/// What a thread waiting in `make_consistent` will be told.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ThreadPhase {
    Initial,
    Drained,
    CheckpointPending,
    Reset,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Step {
    Reset,
    Drain,
    Resume,
    DrainCompleted,
}

struct CoordinatorState {
    phase: RegionPhase,
    seq: SequenceId,
    next_seq: SequenceId,
    retired: SequenceId,
    /// The cycle that was drained before the last resume.
    drain_seq: SequenceId,
    reset_seq: SequenceId,
    reset_attempt: ResetAttempt,
    must_reset: bool,
    has_initiated_reset: bool,

    to_drain: bool,
    to_reset: bool,
    to_resume: bool,
    drain_completed: bool,
    to_pause: bool,
    to_wait_for_drain_completed: bool,
    allow_non_blocking: bool,

    active_threads: usize,
    threads_in_make_consistent: usize,
    thread_phases: HashMap<ThreadId, ThreadPhase>,

    drains_for_forwarding: usize,
    drains_for_completion: usize,
    drain_forwarded: bool,
    resets_for_forwarding: usize,
    resets_for_completion: usize,
    reset_forwarded: bool,
    resumes: usize,

    drain_deadline: Option<Instant>,
    reset_deadline: Option<Instant>,
    shutdown: bool,
}

impl CoordinatorState {
    fn new() -> Self {
        Self {
            phase: RegionPhase::Initial,
            seq: 1,
            next_seq: 1,
            retired: NO_CHECKPOINT,
            drain_seq: NO_CHECKPOINT,
            reset_seq: NO_CHECKPOINT,
            reset_attempt: -1,
            must_reset: false,
            has_initiated_reset: false,
            to_drain: false,
            to_reset: false,
            to_resume: false,
            drain_completed: false,
            to_pause: false,
            to_wait_for_drain_completed: false,
            allow_non_blocking: true,
            active_threads: 0,
            threads_in_make_consistent: 0,
            thread_phases: HashMap::new(),
            drains_for_forwarding: 0,
            drains_for_completion: 0,
            drain_forwarded: false,
            resets_for_forwarding: 0,
            resets_for_completion: 0,
            reset_forwarded: false,
            resumes: 0,
            drain_deadline: None,
            reset_deadline: None,
            shutdown: false,
        }
    }

    /// Tells threads still waiting in `make_consistent` how the cycle ended.
    fn change_thread_phases(&mut self, from: &[ThreadPhase], to: ThreadPhase) {
        for phase in self.thread_phases.values_mut() {
            if from.contains(phase) {
                *phase = to;
            }
        }
    }

    fn reset_drain_counters(&mut self) {
        self.drains_for_forwarding = 0;
        self.drains_for_completion = 0;
        self.drain_forwarded = false;
    }

    fn reset_reset_counters(&mut self) {
        self.resets_for_forwarding = 0;
        self.resets_for_completion = 0;
        self.reset_forwarded = false;
    }

    fn is_superseded(&self, seq: SequenceId, attempt: ResetAttempt) -> bool {
        (seq, attempt) < (self.reset_seq, self.reset_attempt)
    }
}

/// Releases its permit when dropped.
pub struct PermitGuard<'a> {
    coordinator: &'a RegionCoordinator,
}

impl Drop for PermitGuard<'_> {
    fn drop(&mut self) {
        self.coordinator.release_permit();
    }
}

/// Region state of one operator.
pub struct RegionCoordinator {
    me: Weak<Self>,
    info: OperatorRegionInfo,
    handler: Arc<dyn StateHandler>,
    sink: Arc<dyn MarkerSink>,
    aggregator: Arc<RegionAggregator>,
    dispatcher: Arc<Dispatcher>,
    inputs: Vec<MarkerChannel>,
    non_blocking_wanted: bool,
    state: Mutex<CoordinatorState>,
    changed: Condvar,
    notifications: (Sender<Notification>, Receiver<Notification>),
    wake: (Sender<()>, Receiver<()>),
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl RegionCoordinator {
    pub fn new(
        info: OperatorRegionInfo,
        handler: Arc<dyn StateHandler>,
        sink: Arc<dyn MarkerSink>,
        aggregator: Arc<RegionAggregator>,
        dispatcher: Arc<Dispatcher>,
    ) -> Arc<Self> {
        let inputs = info
            .inputs
            .iter()
            .enumerate()
            .map(|(port, port_info)| {
                let channel = MarkerChannel::new(port, port_info.clone(), true);
                if port_info.event_time {
                    channel.with_event_time()
                } else {
                    channel
                }
            })
            .collect();
        let non_blocking_wanted = info.non_blocking && aggregator.config().non_blocking_checkpoints;

        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            info,
            handler,
            sink,
            aggregator,
            dispatcher,
            inputs,
            non_blocking_wanted,
            state: Mutex::new(CoordinatorState::new()),
            changed: Condvar::new(),
            notifications: unbounded(),
            wake: bounded(1),
            event_loop: Mutex::new(None),
        })
    }

    pub fn info(&self) -> &OperatorRegionInfo {
        &self.info
    }

    pub fn operator(&self) -> OperatorIndex {
        self.info.operator
    }

    pub fn region(&self) -> RegionIndex {
        self.info.region
    }

    pub fn phase(&self) -> RegionPhase {
        self.state.lock().unwrap().phase
    }

    /// The cycle the operator is in.
    pub fn sequence_id(&self) -> SequenceId {
        self.state.lock().unwrap().seq
    }

    pub fn reset_attempt(&self) -> ResetAttempt {
        self.state.lock().unwrap().reset_attempt
    }

    pub fn must_reset(&self) -> bool {
        self.state.lock().unwrap().must_reset
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().unwrap().to_pause
    }

    /// The marker state of input `port`.
    pub fn channel(&self, port: usize) -> Option<&MarkerChannel> {
        self.inputs.get(port)
    }

    /// Whether a tuple arriving on `port` should be processed.
    pub fn on_tuple(&self, port: usize) -> bool {
        self.inputs.get(port).is_some_and(MarkerChannel::on_tuple)
    }

    /// Sender for controller notifications addressed to this operator.
    pub fn notifier(&self) -> Sender<Notification> {
        self.notifications.0.clone()
    }

    fn target(&self) -> Option<Arc<dyn CheckpointTarget>> {
        self.me
            .upgrade()
            .map(|me| me as Arc<dyn CheckpointTarget>)
    }

    fn wake_event_loop(&self) {
        let _ = self.wake.0.try_send(());
    }

    /// Blocks while the coordinator is paused, then takes a permit.
    pub fn acquire_permit(&self) -> Result<(), RegionError> {
        let mut state = self.state.lock().unwrap();
        while state.to_pause && !state.shutdown {
            state = self.changed.wait(state).unwrap();
        }
        if state.shutdown {
            return Err(RegionError::Shutdown);
        }
        state.active_threads += 1;
        Ok(())
    }

    pub fn release_permit(&self) {
        let mut state = self.state.lock().unwrap();
        state.active_threads = state.active_threads.saturating_sub(1);
        self.changed.notify_all();
    }

    pub fn permit(&self) -> Result<PermitGuard<'_>, RegionError> {
        self.acquire_permit()?;
        Ok(PermitGuard { coordinator: self })
    }

    /// Refuses new permits and waits until only threads inside
    /// `make_consistent` hold one.
    fn pause<'a>(
        &'a self,
        mut state: MutexGuard<'a, CoordinatorState>,
    ) -> MutexGuard<'a, CoordinatorState> {
        state.to_pause = true;
        state.to_wait_for_drain_completed = true;
        self.changed.notify_all();
        while state.active_threads > state.threads_in_make_consistent && !state.shutdown {
            state = self.changed.wait(state).unwrap();
        }
        state
    }

    fn wait_for_resume<'a>(
        &'a self,
        mut state: MutexGuard<'a, CoordinatorState>,
    ) -> MutexGuard<'a, CoordinatorState> {
        while (state.to_pause || (state.to_wait_for_drain_completed && !state.allow_non_blocking))
            && !state.shutdown
        {
            state = self.changed.wait(state).unwrap();
        }
        state
    }

    /// Establishes a consistent state and blocks until the region has
    /// checkpointed it or was reset.
    ///
    /// The trigger operator calls this to start a cycle; other start
    /// operators wait for the next cycle.
    pub fn make_consistent(&self) -> Result<DrainResult, RegionError> {
        self.make_consistent_internal(false)
    }

    /// Like [`make_consistent`](Self::make_consistent), but returns
    /// [`DrainResult::CheckpointPending`] as soon as tuple processing may
    /// resume.
    pub fn make_consistent_non_blocking(&self) -> Result<DrainResult, RegionError> {
        self.make_consistent_internal(true)
    }

    fn make_consistent_internal(&self, allow_non_blocking: bool) -> Result<DrainResult, RegionError> {
        if !self.info.start_of_region {
            return Err(RegionError::NotStartOfRegion {
                operator: self.info.operator,
                region: self.info.region,
            });
        }
        let thread = thread::current().id();
        let mut state = self.state.lock().unwrap();
        // Let a cycle that is already finishing finish without this thread.
        while (state.to_resume || state.drain_completed) && !state.shutdown {
            state = self.changed.wait(state).unwrap();
        }
        state.thread_phases.insert(thread, ThreadPhase::Initial);
        state.threads_in_make_consistent += 1;
        self.changed.notify_all();

        if state.to_pause {
            // A drain or reset is under way; the cycle has not resumed yet,
            // so the caller still decides how it completes.
            state.allow_non_blocking = allow_non_blocking;
            state = self.wait_for_resume(state);
        } else {
            while state.to_wait_for_drain_completed && !state.shutdown {
                state = self.changed.wait(state).unwrap();
                if state.to_pause {
                    break;
                }
            }
            state.allow_non_blocking = allow_non_blocking;
            if self.info.trigger {
                state.to_drain = true;
                self.wake_event_loop();
                trace!(operator = self.info.operator, "requested drain");
            } else {
                while !state.to_drain && !state.to_reset && !state.shutdown {
                    state = self.changed.wait(state).unwrap();
                    if state.to_pause {
                        break;
                    }
                }
            }
            // The event loop clears these once the operator is paused.
            while (state.to_drain || state.to_reset) && !state.shutdown {
                state = self.changed.wait(state).unwrap();
            }
            state = self.wait_for_resume(state);
        }

        state.threads_in_make_consistent -= 1;
        let phase = state
            .thread_phases
            .remove(&thread)
            .unwrap_or(ThreadPhase::Initial);
        debug!(
            operator = self.info.operator,
            region = self.info.region,
            "make_consistent finished in {phase:?}"
        );
        match phase {
            ThreadPhase::Drained => Ok(DrainResult::Completed),
            ThreadPhase::CheckpointPending => Ok(DrainResult::CheckpointPending),
            ThreadPhase::Reset => Ok(DrainResult::Failed),
            ThreadPhase::Initial if state.shutdown => Err(RegionError::Shutdown),
            ThreadPhase::Initial => Ok(DrainResult::Failed),
        }
    }

    /// Marks the operator as having to restore checkpoint `seq` before it
    /// processes anything else.  Drains are dropped until the reset
    /// completes.
    pub fn set_reset_information(&self, seq: SequenceId) {
        let mut state = self.state.lock().unwrap();
        self.set_reset_information_locked(&mut state, seq);
    }

    fn set_reset_information_locked(&self, state: &mut CoordinatorState, seq: SequenceId) {
        state.must_reset = true;
        state.reset_seq = seq;
        for channel in &self.inputs {
            channel.set_resetting(true);
        }
    }

    /// Reports a failure of this operator.  The region will be reset.
    fn fail(&self, seq: SequenceId, error: anyhow::Error) {
        let attempt = {
            let mut state = self.state.lock().unwrap();
            state.must_reset = true;
            state.reset_attempt
        };
        error!(
            operator = self.info.operator,
            region = self.info.region,
            seq,
            attempt,
            "{error:#}"
        );
        self.aggregator
            .operator_failed(self.info.operator, seq, error);
    }

    fn emit(&self, marker: &Marker) -> AnyResult<()> {
        for port in 0..self.info.num_outputs {
            self.sink
                .submit_marker(port, marker)
                .with_context(|| format!("cannot submit {marker} on output port {port}"))?;
        }
        Ok(())
    }

    fn enqueue_checkpoint(&self, seq: SequenceId) {
        if !self.handler.has_state() {
            self.checkpoint_completed(seq);
            return;
        }
        let Some(target) = self.target() else {
            return;
        };
        if let Err(error) = self.aggregator.checkpoint_started(seq) {
            self.fail(seq, anyhow!(error).context("cannot open checkpoint batch"));
            return;
        }
        trace!(operator = self.info.operator, seq, "enqueueing checkpoint");
        if let Err(error) = self
            .dispatcher
            .submit(WorkItem::CreateCheckpoint { target, seq })
        {
            self.fail(seq, anyhow!(error).context("cannot enqueue checkpoint"));
        }
    }

    fn enqueue_reset(&self, seq: SequenceId, attempt: ResetAttempt) {
        let Some(target) = self.target() else {
            return;
        };
        self.aggregator.reset_started(seq, attempt);
        trace!(operator = self.info.operator, seq, attempt, "enqueueing reset");
        if let Err(error) = self.dispatcher.submit(WorkItem::ResetCheckpoint {
            target,
            seq,
            attempt,
        }) {
            self.fail(seq, anyhow!(error).context("cannot enqueue reset"));
        }
    }

    /// The operator has received every Drain of the current cycle.
    pub fn drain_completed(&self) {
        let seq = {
            let mut state = self.state.lock().unwrap();
            state.phase = RegionPhase::Drained;
            state.seq
        };
        debug!(operator = self.info.operator, seq, "drain completed");
        self.aggregator.drain_completed(self.info.operator, seq);
    }

    /// The operator's checkpoint for `seq` is written.
    pub fn checkpoint_completed(&self, seq: SequenceId) {
        trace!(operator = self.info.operator, seq, "checkpoint completed");
        self.aggregator.checkpoint_completed(self.info.operator, seq);
    }

    /// The operator restored checkpoint `seq` for reset `attempt`.
    pub fn reset_completed(&self, seq: SequenceId, attempt: ResetAttempt) {
        {
            let mut state = self.state.lock().unwrap();
            if state.is_superseded(seq, attempt) {
                debug!(
                    operator = self.info.operator,
                    seq, attempt, "ignoring superseded reset completion"
                );
                return;
            }
            state.must_reset = false;
            for channel in &self.inputs {
                channel.set_resetting(false);
            }
        }
        debug!(operator = self.info.operator, seq, attempt, "reset completed");
        self.aggregator
            .reset_completed(self.info.operator, seq, attempt);
    }

    fn drain_sequence(&self) {
        let seq = {
            let mut state = self.state.lock().unwrap();
            if state.must_reset {
                // A reset arrived first.
                state.to_drain = false;
                self.changed.notify_all();
                return;
            }
            state.phase = RegionPhase::Draining;
            state.seq
        };
        debug!(operator = self.info.operator, seq, "drain started");

        if let Err(error) = self.handler.drain() {
            self.fail(seq, error.context("drain failed"));
        }
        if self.non_blocking_wanted {
            if let Err(error) = self.handler.prepare_for_non_blocking_checkpoint(seq) {
                self.fail(seq, error.context("cannot prepare non-blocking checkpoint"));
            }
        }

        let enqueue = {
            let mut state = self.state.lock().unwrap();
            state = self.pause(state);
            state.to_drain = false;
            if self.info.start_of_region {
                state.drain_deadline = Some(Instant::now() + self.info.drain_timeout);
            }
            self.changed.notify_all();
            if state.must_reset || state.shutdown {
                return;
            }
            !self.info.has_consistent_control_port()
        };
        if enqueue {
            self.enqueue_checkpoint(seq);
        }

        if self.info.start_of_region {
            self.state.lock().unwrap().has_initiated_reset = false;
            if let Err(error) = self.aggregator.drain(&self.info.name, seq) {
                self.fail(seq, error.context("control plane rejected drain"));
                return;
            }
            if let Err(error) = self.emit(&Marker::Drain { seq }) {
                self.fail(seq, error);
                return;
            }
            self.drain_completed();
        }
    }

    fn reset_sequence(&self) {
        let (seq, attempt, enqueue) = {
            let mut state = self.state.lock().unwrap();
            state = self.pause(state);
            state.to_reset = false;
            state.phase = RegionPhase::Resetting;
            state.drain_deadline = None;
            if self.info.start_of_region {
                state.reset_deadline = Some(Instant::now() + self.info.reset_timeout);
            }
            state.change_thread_phases(&[ThreadPhase::Initial], ThreadPhase::Reset);
            self.changed.notify_all();
            if state.shutdown {
                return;
            }
            (
                state.reset_seq,
                state.reset_attempt,
                !self.info.has_consistent_control_port(),
            )
        };
        info!(
            operator = self.info.operator,
            region = self.info.region,
            seq,
            attempt,
            "resetting operator"
        );
        if enqueue {
            self.enqueue_reset(seq, attempt);
        }
        if self.info.start_of_region {
            if let Err(error) = self.emit(&Marker::Reset { seq, attempt }) {
                self.fail(seq, error);
            }
        }
    }

    fn resume_sequence(&self) {
        let start = self.info.start_of_region;
        let (resume, drain_seq, drain_completed) = {
            let mut state = self.state.lock().unwrap();
            state.to_resume = false;
            state.drain_seq = state.seq;
            if start && !state.drain_completed && !state.allow_non_blocking {
                // Stay paused until the pending checkpoint completes.
                self.changed.notify_all();
                return;
            }
            state.seq = state.next_seq;
            state.to_pause = false;
            state.drain_deadline = None;
            state.reset_deadline = None;
            state.phase = if start && !state.drain_completed {
                RegionPhase::CheckpointPending
            } else {
                RegionPhase::Initial
            };
            self.changed.notify_all();
            (
                Marker::Resume {
                    seq: state.seq,
                    retired: state.retired,
                },
                state.drain_seq,
                state.drain_completed,
            )
        };
        debug!(operator = self.info.operator, "resuming with {resume}");

        if start {
            if let Err(error) = self.emit(&resume) {
                self.fail(drain_seq, error);
            }
            if !drain_completed {
                return;
            }
            self.release_drain_waiters(drain_seq);
        }
        self.retire();
    }

    fn drain_completed_sequence(&self) {
        if !self.info.start_of_region {
            return;
        }
        let (resume, drain_seq) = {
            let mut state = self.state.lock().unwrap();
            if !state.drain_completed {
                return;
            }
            let resume = if state.allow_non_blocking {
                None
            } else {
                state.seq = state.next_seq;
                state.to_pause = false;
                state.drain_deadline = None;
                self.changed.notify_all();
                Some(Marker::Resume {
                    seq: state.seq,
                    retired: state.retired,
                })
            };
            (resume, state.drain_seq)
        };
        if let Some(resume) = resume {
            if let Err(error) = self.emit(&resume) {
                self.fail(drain_seq, error);
            }
        }
        self.release_drain_waiters(drain_seq);
        self.retire();
    }

    /// Finishes cycle `drain_seq` for the threads in `make_consistent`.
    fn release_drain_waiters(&self, drain_seq: SequenceId) {
        let initiated_reset = self.state.lock().unwrap().has_initiated_reset;
        if !initiated_reset {
            if let Err(error) = self.handler.region_checkpointed(drain_seq) {
                self.fail(drain_seq, error.context("region_checkpointed failed"));
            }
        }
        let mut state = self.state.lock().unwrap();
        state.to_wait_for_drain_completed = false;
        state.drain_completed = false;
        state.phase = RegionPhase::Initial;
        if !self.info.trigger {
            // Periodic regions checkpoint without blocking when they can.
            state.allow_non_blocking = true;
        }
        self.changed.notify_all();
    }

    fn retire(&self) {
        let (retired, initiated_reset) = {
            let state = self.state.lock().unwrap();
            (state.retired, state.has_initiated_reset)
        };
        if retired <= NO_CHECKPOINT || initiated_reset {
            return;
        }
        trace!(operator = self.info.operator, retired, "retiring checkpoint");
        if let Err(error) = self.handler.retire_checkpoint(retired) {
            warn!(
                operator = self.info.operator,
                retired, "cannot retire checkpoint: {error:#}"
            );
        }
        if self.handler.has_state() {
            let item = WorkItem::DeleteCheckpoint {
                region: self.info.region,
                operator: self.info.operator,
                seq: retired,
            };
            if let Err(error) = self.dispatcher.submit(item) {
                warn!(
                    operator = self.info.operator,
                    retired, "cannot delete retired checkpoint: {error}"
                );
            }
        }
    }

    /// Applies a controller notification.  The event loop picks up the work
    /// it schedules.
    pub fn handle_notification(&self, notification: Notification) {
        debug!(
            operator = self.info.operator,
            region = self.info.region,
            "received {notification}"
        );
        match notification {
            Notification::TriggerDrain { seq } => self.handle_drain(seq),
            Notification::TriggerReset { seq, attempt } => self.handle_reset(seq, attempt),
            Notification::ResumeSubmission {
                seq,
                retired,
                pending_checkpoint,
            } => self.handle_resume_submission(seq, retired, pending_checkpoint),
            Notification::Drained { seq } => self.handle_drained(seq),
            Notification::ResetFailed { seq } => error!(
                operator = self.info.operator,
                region = self.info.region,
                seq,
                "region gave up resetting"
            ),
            Notification::Shutdown => self.prepare_to_shutdown(),
        }
    }

    fn handle_drain(&self, seq: SequenceId) {
        let mut state = self.state.lock().unwrap();
        // The operator must reset before it drains again.
        if state.must_reset {
            return;
        }
        state.seq = seq;
        state.to_drain = true;
        state.to_resume = false;
        self.changed.notify_all();
    }

    fn handle_reset(&self, seq: SequenceId, attempt: ResetAttempt) {
        let mut state = self.state.lock().unwrap();
        self.set_reset_information_locked(&mut state, seq);
        state.reset_attempt = attempt;
        state.to_drain = false;
        state.to_resume = false;
        state.to_reset = true;
        state.has_initiated_reset = true;
        self.changed.notify_all();
    }

    fn handle_resume_submission(&self, seq: SequenceId, retired: SequenceId, pending: bool) {
        let mut state = self.state.lock().unwrap();
        state.to_resume = true;
        state.next_seq = seq;
        state.retired = retired;
        state.drain_completed = !pending;
        if !state.has_initiated_reset {
            let phase = if pending {
                ThreadPhase::CheckpointPending
            } else {
                ThreadPhase::Drained
            };
            state.change_thread_phases(&[ThreadPhase::Initial], phase);
        }
        self.changed.notify_all();
    }

    fn handle_drained(&self, seq: SequenceId) {
        let mut state = self.state.lock().unwrap();
        if seq != state.drain_seq {
            debug!(
                operator = self.info.operator,
                seq,
                expected = state.drain_seq,
                "drained notification for another cycle"
            );
        }
        state.drain_completed = true;
        if !state.has_initiated_reset {
            state.change_thread_phases(
                &[ThreadPhase::Initial, ThreadPhase::CheckpointPending],
                ThreadPhase::Drained,
            );
        }
        self.changed.notify_all();
    }

    fn next_step(&self) -> Option<Step> {
        let state = self.state.lock().unwrap();
        if state.shutdown {
            None
        } else if state.to_reset {
            Some(Step::Reset)
        } else if state.to_drain {
            Some(Step::Drain)
        } else if state.to_resume {
            Some(Step::Resume)
        } else if state.drain_completed {
            Some(Step::DrainCompleted)
        } else {
            None
        }
    }

    /// Turns expired drain and reset deadlines into operator failures.
    fn check_deadlines(&self) {
        let now = Instant::now();
        let expired = {
            let mut state = self.state.lock().unwrap();
            if state.drain_deadline.is_some_and(|deadline| deadline <= now) {
                state.drain_deadline = None;
                Some(("drain", state.seq, self.info.drain_timeout))
            } else if state.reset_deadline.is_some_and(|deadline| deadline <= now) {
                state.reset_deadline = None;
                Some(("reset", state.reset_seq, self.info.reset_timeout))
            } else {
                None
            }
        };
        if let Some((what, seq, timeout)) = expired {
            warn!(
                operator = self.info.operator,
                region = self.info.region,
                seq,
                "{what} timed out"
            );
            self.aggregator.operator_failed(
                self.info.operator,
                seq,
                anyhow!("{what} of sequence {seq} did not complete within {timeout:?}"),
            );
        }
    }

    fn run(self: Arc<Self>) {
        let notifications = self.notifications.1.clone();
        let wake = self.wake.1.clone();
        debug!(operator = self.info.operator, "event loop started");
        loop {
            select! {
                recv(notifications) -> notification => {
                    if let Ok(notification) = notification {
                        self.handle_notification(notification);
                    }
                }
                recv(wake) -> _ => {}
                default(EVENT_LOOP_TICK) => {}
            }
            if self.state.lock().unwrap().shutdown {
                break;
            }
            self.check_deadlines();
            while let Some(step) = self.next_step() {
                trace!(operator = self.info.operator, "running {step:?} sequence");
                match step {
                    Step::Reset => self.reset_sequence(),
                    Step::Drain => self.drain_sequence(),
                    Step::Resume => self.resume_sequence(),
                    Step::DrainCompleted => self.drain_completed_sequence(),
                }
            }
        }
        debug!(operator = self.info.operator, "event loop exited");
    }

    /// Subscribes a start operator to its region's notifications and starts
    /// its event loop.  Does nothing for other operators.
    pub fn start(&self) -> Result<(), RegionError> {
        if !self.info.start_of_region {
            return Ok(());
        }
        let mut event_loop = self.event_loop.lock().unwrap();
        if event_loop.is_some() {
            return Ok(());
        }
        let Some(me) = self.me.upgrade() else {
            return Err(RegionError::Shutdown);
        };
        self.aggregator
            .register_start_operator(self.info.operator, self.notifier());
        let operator = self.info.operator;
        let handle = thread::Builder::new()
            .name(format!("cregion-loop-{operator}"))
            .spawn(move || me.run())
            .unwrap_or_else(|error| panic!("failed to spawn event loop of operator {operator}: {error}"));
        *event_loop = Some(handle);
        Ok(())
    }

    /// Wakes every waiting thread and makes it give up.  A start operator
    /// also stops receiving region notifications.
    pub fn prepare_to_shutdown(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.shutdown = true;
            self.changed.notify_all();
        }
        if self.info.start_of_region {
            self.aggregator.unregister_start_operator(self.info.operator);
        }
        self.wake_event_loop();
    }

    /// Waits for the event loop to exit.
    pub fn join(&self) {
        let handle = self.event_loop.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    /// Handles a marker that arrived on `connection` of input `port`.
    ///
    /// Drain, Reset and Resume markers are forwarded to every output port
    /// once the operator has acted on them; Final and Watermark markers are
    /// forwarded when their port releases them.  Must be called without
    /// holding a permit: a Drain or Reset pauses the operator.
    pub fn receive(
        &self,
        port: usize,
        connection: usize,
        marker: Marker,
    ) -> Result<Delivery, RegionError> {
        let channel = self.inputs.get(port).ok_or(RegionError::UnknownPort {
            operator: self.info.operator,
            port,
        })?;
        let delivery = channel.on_marker(connection, marker);
        let Delivery::Deliver(marker) = delivery else {
            return Ok(delivery);
        };

        match marker {
            Marker::Final | Marker::Watermark { .. } => {
                self.emit(&marker).map_err(|error| RegionError::Handler {
                    operator: self.info.operator,
                    region: self.info.region,
                    seq: self.sequence_id(),
                    error,
                })?;
            }
            Marker::Drain { .. } | Marker::Reset { .. } | Marker::Resume { .. } => {
                if self.must_forward_marker(&marker, port) {
                    match self.emit(&marker) {
                        Ok(()) => self.forwarded_marker(&marker, port),
                        Err(error) => self.fail(marker.seq().unwrap_or(NO_CHECKPOINT), error),
                    }
                }
                self.post_marker_processing(&marker, port);
            }
        }
        Ok(delivery)
    }

    fn is_control_port(&self, port: usize) -> bool {
        self.info.inputs.get(port).is_some_and(|info| info.control)
    }

    /// Whether the operator must now send `marker`, delivered by `port`, to
    /// its outputs.  Runs the drain or reset sequence when the marker
    /// completes the forwarding count.
    pub fn must_forward_marker(&self, marker: &Marker, port: usize) -> bool {
        let ignored_control =
            self.is_control_port(port) && !self.info.consistent_ports_are_control();
        match *marker {
            Marker::Drain { seq } => {
                {
                    let mut state = self.state.lock().unwrap();
                    state.has_initiated_reset = false;
                    if ignored_control {
                        return false;
                    }
                    state.drains_for_forwarding += 1;
                    if state.drains_for_forwarding != self.info.num_markers_for_forwarding() {
                        return false;
                    }
                    state.seq = seq;
                    state.resumes = 0;
                }
                self.drain_sequence();
                // A failed drain is not forwarded.
                if self.must_reset() {
                    return false;
                }
                !self.info.end_of_region
            }
            Marker::Reset { seq, attempt } => {
                self.must_forward_reset(seq, attempt, self.is_control_port(port))
            }
            Marker::Resume { .. } => {
                if self.info.end_of_region {
                    return false;
                }
                let mut state = self.state.lock().unwrap();
                if ignored_control {
                    return false;
                }
                state.resumes += 1;
                state.resumes == 1
            }
            Marker::Final | Marker::Watermark { .. } => false,
        }
    }

    fn must_forward_reset(&self, seq: SequenceId, attempt: ResetAttempt, control: bool) -> bool {
        {
            let mut state = self.state.lock().unwrap();
            if state.is_superseded(seq, attempt) {
                debug!(
                    operator = self.info.operator,
                    seq, attempt, "ignoring superseded reset"
                );
                return false;
            }
            if (seq, attempt) > (state.reset_seq, state.reset_attempt) {
                state.reset_reset_counters();
                state.reset_attempt = attempt;
            }
            state = self.pause(state);
            self.set_reset_information_locked(&mut state, seq);
            state.has_initiated_reset = true;
            if control {
                return false;
            }
            state.resets_for_forwarding += 1;
            if state.resets_for_forwarding != self.info.num_markers_for_forwarding() {
                return false;
            }
            state.resumes = 0;
        }
        self.reset_sequence();
        !self.info.end_of_region
    }

    /// Records that `marker` was sent to every output.
    pub fn forwarded_marker(&self, marker: &Marker, _port: usize) {
        match *marker {
            Marker::Drain { .. } => self.state.lock().unwrap().drain_forwarded = true,
            Marker::Reset { .. } => self.state.lock().unwrap().reset_forwarded = true,
            Marker::Resume { seq, retired } => {
                if self.info.end_of_region {
                    return;
                }
                {
                    let mut state = self.state.lock().unwrap();
                    state.next_seq = seq;
                    state.retired = retired;
                }
                self.resume_sequence();
            }
            Marker::Final | Marker::Watermark { .. } => {}
        }
    }

    /// Counts `marker` toward completion of its phase and completes the
    /// phase once every consistent port delivered it and it was forwarded
    /// (or the operator ends the region).
    pub fn post_marker_processing(&self, marker: &Marker, _port: usize) {
        match *marker {
            Marker::Drain { .. } => {
                let (seq, must_reset) = {
                    let mut state = self.state.lock().unwrap();
                    state.drains_for_completion += 1;
                    if state.drains_for_completion != self.info.num_markers_for_completion() {
                        return;
                    }
                    if !self.info.end_of_region && !state.drain_forwarded {
                        return;
                    }
                    state.reset_drain_counters();
                    (state.seq, state.must_reset)
                };
                if must_reset {
                    return;
                }
                if self.info.has_consistent_control_port() {
                    self.enqueue_checkpoint(seq);
                }
                self.drain_completed();
            }
            Marker::Reset { seq, attempt } => {
                {
                    let mut state = self.state.lock().unwrap();
                    if (seq, attempt) != (state.reset_seq, state.reset_attempt) {
                        return;
                    }
                    state.resets_for_completion += 1;
                    if state.resets_for_completion != self.info.num_markers_for_completion() {
                        return;
                    }
                    if !self.info.end_of_region && !state.reset_forwarded {
                        return;
                    }
                    state.reset_drain_counters();
                    state.reset_reset_counters();
                }
                if self.info.has_consistent_control_port() {
                    self.enqueue_reset(seq, attempt);
                }
            }
            Marker::Resume { seq, retired } => {
                {
                    let mut state = self.state.lock().unwrap();
                    if !self.info.end_of_region || !state.to_pause {
                        return;
                    }
                    state.next_seq = seq;
                    state.retired = retired;
                }
                self.resume_sequence();
            }
            Marker::Final | Marker::Watermark { .. } => {}
        }
    }
}

impl CheckpointTarget for RegionCoordinator {
    fn operator(&self) -> OperatorIndex {
        self.info.operator
    }

    fn region(&self) -> RegionIndex {
        self.info.region
    }

    fn has_state(&self) -> bool {
        self.handler.has_state()
    }

    fn should_proceed_with_checkpoint(&self, seq: SequenceId) -> bool {
        {
            let state = self.state.lock().unwrap();
            if state.shutdown || state.must_reset {
                return false;
            }
        }
        self.aggregator.should_proceed_with_checkpoint(seq)
    }

    fn should_proceed_with_reset(&self, seq: SequenceId, attempt: ResetAttempt) -> bool {
        {
            let state = self.state.lock().unwrap();
            if state.shutdown || state.is_superseded(seq, attempt) {
                return false;
            }
        }
        self.aggregator.should_proceed_with_reset(seq, attempt)
    }

    fn checkpoint(&self, seq: SequenceId) -> AnyResult<Vec<u8>> {
        self.handler.checkpoint(seq)
    }

    fn restore(&self, seq: SequenceId, checkpoint: Option<&[u8]>) -> AnyResult<()> {
        match checkpoint {
            Some(checkpoint) => self.handler.reset(seq, checkpoint),
            None => self.handler.reset_to_initial_state(),
        }
    }

    fn checkpoint_completed(&self, seq: SequenceId) {
        RegionCoordinator::checkpoint_completed(self, seq);
    }

    fn reset_completed(&self, seq: SequenceId, attempt: ResetAttempt) {
        RegionCoordinator::reset_completed(self, seq, attempt);
    }

    fn operator_failed(&self, seq: SequenceId, error: anyhow::Error) {
        self.fail(seq, error);
    }
}

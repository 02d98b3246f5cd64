//! Per-region merge of operator completions.
//!
//! Every operator of a region hosted in this process reports its drain,
//! checkpoint and reset completions to the region's [`RegionAggregator`].
//! The aggregator turns them into one verdict per cycle and forwards it to
//! the [`ControlPlane`].

use crate::control::{ControlPlane, Notification, NotificationHub};
use crate::dispatcher::{DispatchError, Dispatcher};
use crate::error::RegionError;
use crate::metrics::{REGION_CHECKPOINTS, REGION_RESETS};
use anyhow::Result as AnyResult;
use crossbeam::channel::Sender;
use cregion_store::StoreError;
use cregion_types::config::RegionConfig;
use cregion_types::error::ErrorReport;
use cregion_types::{OperatorIndex, RegionIndex, ResetAttempt, SequenceId, NO_CHECKPOINT};
use metrics::counter;
use serde_json::{json, Value as JsonValue};
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, trace, warn};

#[derive(Default)]
struct AggregateState {
    /// Registered operators and their names.
    operators: BTreeMap<OperatorIndex, String>,
    non_blocking: BTreeSet<OperatorIndex>,

    /// The cycle the counters below belong to.
    seq: SequenceId,
    drains: BTreeSet<OperatorIndex>,
    blocking_done: BTreeSet<OperatorIndex>,
    non_blocking_done: BTreeSet<OperatorIndex>,
    blocking_reported: bool,
    latest_checkpoint_id: SequenceId,

    /// The reset the `resets` counter belongs to.
    reset_cut: Option<(SequenceId, ResetAttempt)>,
    resets: BTreeSet<OperatorIndex>,
    latest_reset: Option<(SequenceId, ResetAttempt)>,
    resetting: bool,
    reset_requested: bool,
}

impl AggregateState {
    fn clear_checkpoint_counters(&mut self) {
        self.drains.clear();
        self.blocking_done.clear();
        self.non_blocking_done.clear();
        self.blocking_reported = false;
    }

    /// Whether a drain or checkpoint completion for `seq` still counts.
    /// A newer `seq` restarts the counters.
    fn admit(&mut self, seq: SequenceId) -> bool {
        if self.resetting || seq <= self.latest_checkpoint_id || seq < self.seq {
            return false;
        }
        if seq > self.seq {
            self.seq = seq;
            self.clear_checkpoint_counters();
        }
        true
    }

    fn verdict(&mut self) -> Verdict {
        let n = self.operators.len();
        if n == 0 || self.drains.len() < n {
            return Verdict::Pending;
        }
        if self.blocking_done.len() + self.non_blocking_done.len() >= n {
            let seq = self.seq;
            self.latest_checkpoint_id = seq;
            self.clear_checkpoint_counters();
            return Verdict::Complete(seq);
        }
        if !self.non_blocking.is_empty()
            && !self.blocking_reported
            && self.blocking_done.len() >= n - self.non_blocking.len()
        {
            self.blocking_reported = true;
            return Verdict::Blocking(self.seq);
        }
        Verdict::Pending
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Verdict {
    Pending,
    /// Every blocking operator has checkpointed.
    Blocking(SequenceId),
    /// Every operator has checkpointed.
    Complete(SequenceId),
}

/// Merges the completions of one region's operators in this process.
pub struct RegionAggregator {
    config: RegionConfig,
    dispatcher: Arc<Dispatcher>,
    control: Arc<dyn ControlPlane>,
    hub: NotificationHub,
    /// Last cycle for which a batch was opened.  Held while the batch is
    /// opened so that no checkpoint of that cycle is queued before it.
    /// Opening a batch only enqueues on the workers' control channels and
    /// never waits for a worker.
    started: Mutex<SequenceId>,
    state: Mutex<AggregateState>,
    /// The failure behind the latest reset request.
    last_failure: Arc<Mutex<Option<ErrorReport>>>,
}

/// Reports the first typed error in `error`'s chain, or `error` itself
/// under `error_code`.
fn failure_report(error: &anyhow::Error, error_code: &'static str, details: JsonValue) -> ErrorReport {
    for cause in error.chain() {
        if let Some(error) = cause.downcast_ref::<StoreError>() {
            return ErrorReport::from_error(error);
        }
        if let Some(error) = cause.downcast_ref::<DispatchError>() {
            return ErrorReport::from_error(error);
        }
        if let Some(error) = cause.downcast_ref::<RegionError>() {
            return ErrorReport::from_error(error);
        }
    }
    ErrorReport {
        message: format!("{error:#}"),
        error_code: Cow::Borrowed(error_code),
        details,
    }
}

impl RegionAggregator {
    pub fn new(
        config: RegionConfig,
        dispatcher: Arc<Dispatcher>,
        control: Arc<dyn ControlPlane>,
        hub: NotificationHub,
    ) -> Self {
        Self {
            config,
            dispatcher,
            control,
            hub,
            started: Mutex::new(NO_CHECKPOINT),
            state: Mutex::new(AggregateState::default()),
            last_failure: Arc::new(Mutex::new(None)),
        }
    }

    /// What made the region ask for its latest reset.
    pub fn last_failure(&self) -> Option<ErrorReport> {
        self.last_failure.lock().unwrap().clone()
    }

    pub fn index(&self) -> RegionIndex {
        self.config.index
    }

    pub fn config(&self) -> &RegionConfig {
        &self.config
    }

    /// Adds `operator` to the set of operators whose completions are
    /// awaited.  A non-blocking operator only counts as such if the region
    /// allows non-blocking checkpoints.
    pub fn register_operator(&self, operator: OperatorIndex, name: &str, non_blocking: bool) {
        let mut state = self.state.lock().unwrap();
        state.operators.insert(operator, name.to_string());
        if non_blocking && self.config.non_blocking_checkpoints {
            state.non_blocking.insert(operator);
        }
        debug!(region = self.index(), operator, non_blocking, "registered operator");
    }

    pub fn num_operators(&self) -> usize {
        self.state.lock().unwrap().operators.len()
    }

    /// Subscribes a start operator to controller notifications.
    pub fn register_start_operator(&self, operator: OperatorIndex, sender: Sender<Notification>) {
        self.hub.subscribe(self.index(), operator, sender);
    }

    pub fn unregister_start_operator(&self, operator: OperatorIndex) {
        self.hub.unsubscribe(self.index(), operator);
    }

    /// Tells the control plane that every start operator is listening.
    pub fn start_operator_subscribed(&self) -> AnyResult<()> {
        self.control.start_operator_subscribed(self.index())
    }

    /// Fans `notification` out to the start operators of the region and
    /// returns how many received it.
    pub fn notify_start_operators(&self, notification: Notification) -> usize {
        self.hub.publish(self.index(), notification)
    }

    pub fn latest_checkpoint_id(&self) -> SequenceId {
        self.state.lock().unwrap().latest_checkpoint_id
    }

    pub fn latest_reset_id(&self) -> SequenceId {
        self.state
            .lock()
            .unwrap()
            .latest_reset
            .map_or(NO_CHECKPOINT, |(seq, _)| seq)
    }

    pub fn is_resetting(&self) -> bool {
        self.state.lock().unwrap().resetting
    }

    /// Whether a checkpoint of cycle `seq` is still wanted.
    pub fn should_proceed_with_checkpoint(&self, seq: SequenceId) -> bool {
        let state = self.state.lock().unwrap();
        !state.resetting && seq > state.latest_checkpoint_id
    }

    /// Whether reset `(seq, attempt)` has not been superseded.
    pub fn should_proceed_with_reset(&self, seq: SequenceId, attempt: ResetAttempt) -> bool {
        let state = self.state.lock().unwrap();
        state.reset_cut.map_or(true, |cut| (seq, attempt) >= cut)
    }

    /// Tells the control plane that `operator` started cycle `seq`.
    pub fn drain(&self, operator: &str, seq: SequenceId) -> AnyResult<()> {
        self.control.drain(self.index(), operator, seq)
    }

    /// Opens the store batch of cycle `seq` on every dispatcher worker, the
    /// first time any operator checkpoints `seq`.
    pub fn checkpoint_started(&self, seq: SequenceId) -> Result<(), DispatchError> {
        let mut started = self.started.lock().unwrap();
        if seq <= *started {
            return Ok(());
        }
        *started = seq;
        trace!(region = self.index(), seq, "opening checkpoint batch");
        let region = self.index();
        let control = self.control.clone();
        self.dispatcher.begin_batch(region, seq, move |result| {
            if let Err(error) = result {
                error!(region, seq, "cannot open checkpoint batch: {error:#}");
                if let Err(error) = control.reset(region, "checkpoint batch") {
                    warn!(region, "reset request failed: {error:#}");
                }
            }
        })
    }

    pub fn drain_completed(&self, operator: OperatorIndex, seq: SequenceId) {
        let verdict = {
            let mut state = self.state.lock().unwrap();
            if !state.admit(seq) {
                trace!(region = self.index(), operator, seq, "ignoring drain completion");
                return;
            }
            state.drains.insert(operator);
            state.verdict()
        };
        self.report(verdict);
    }

    pub fn checkpoint_completed(&self, operator: OperatorIndex, seq: SequenceId) {
        let verdict = {
            let mut state = self.state.lock().unwrap();
            if !state.admit(seq) {
                trace!(region = self.index(), operator, seq, "ignoring checkpoint completion");
                return;
            }
            if state.non_blocking.contains(&operator) {
                state.non_blocking_done.insert(operator);
            } else {
                state.blocking_done.insert(operator);
            }
            state.verdict()
        };
        self.report(verdict);
    }

    fn report(&self, verdict: Verdict) {
        let region = self.index();
        match verdict {
            Verdict::Pending => {}
            Verdict::Blocking(seq) => {
                debug!(region, seq, "blocking operators checkpointed");
                if let Err(error) = self.control.blocking_checkpoint_completed(region, seq) {
                    warn!(region, seq, "cannot report blocking checkpoint: {error:#}");
                }
            }
            Verdict::Complete(seq) => self.commit(seq),
        }
    }

    /// Commits the batch of `seq` and reports the checkpoint once every
    /// worker has committed.
    fn commit(&self, seq: SequenceId) {
        let region = self.index();
        let control = self.control.clone();
        let last_failure = self.last_failure.clone();
        let result = self.dispatcher.commit_batch(region, seq, move |result| match result {
            Ok(()) => {
                info!(region, seq, "region checkpoint committed");
                counter!(REGION_CHECKPOINTS).increment(1);
                if let Err(error) = control.checkpoint_completed(region, seq) {
                    warn!(region, seq, "cannot report checkpoint: {error:#}");
                }
            }
            Err(error) => {
                error!(region, seq, "cannot commit region checkpoint: {error:#}");
                *last_failure.lock().unwrap() = Some(failure_report(
                    &error,
                    "CheckpointCommitFailed",
                    json!({ "seq": seq }),
                ));
                if let Err(error) = control.reset(region, "checkpoint commit") {
                    warn!(region, "reset request failed: {error:#}");
                }
            }
        });
        if let Err(error) = result {
            debug!(region, seq, "commit not dispatched: {error}");
        }
    }

    /// Records the start of reset `(seq, attempt)`.  The first call for a
    /// newer reset abandons the current cycle and aborts its batch.
    pub fn reset_started(&self, seq: SequenceId, attempt: ResetAttempt) {
        {
            let mut state = self.state.lock().unwrap();
            if state.reset_cut.is_some_and(|cut| (seq, attempt) <= cut) {
                return;
            }
            info!(region = self.index(), seq, attempt, "region reset started");
            state.reset_cut = Some((seq, attempt));
            state.resets.clear();
            state.resetting = true;
            state.reset_requested = false;
            state.clear_checkpoint_counters();
        }
        let started = *self.started.lock().unwrap();
        if let Err(error) = self.dispatcher.abort_batch(self.index(), started) {
            debug!(region = self.index(), "abort not dispatched: {error}");
        }
    }

    pub fn reset_completed(&self, operator: OperatorIndex, seq: SequenceId, attempt: ResetAttempt) {
        {
            let mut state = self.state.lock().unwrap();
            if state.latest_reset.is_some_and(|last| (seq, attempt) <= last) {
                trace!(region = self.index(), operator, seq, attempt, "reset already completed");
                return;
            }
            match state.reset_cut {
                Some(cut) if (seq, attempt) < cut => {
                    debug!(
                        region = self.index(),
                        operator, seq, attempt, "ignoring superseded reset completion"
                    );
                    return;
                }
                Some(cut) if (seq, attempt) == cut => {}
                _ => {
                    state.reset_cut = Some((seq, attempt));
                    state.resets.clear();
                }
            }
            state.resets.insert(operator);
            if state.resets.len() < state.operators.len() {
                return;
            }
            state.resets.clear();
            state.latest_reset = Some((seq, attempt));
            state.resetting = false;
        }
        info!(region = self.index(), seq, attempt, "region reset completed");
        if let Err(error) = self.control.reset_completed(self.index(), seq, attempt) {
            warn!(region = self.index(), "cannot report reset: {error:#}");
        }
    }

    /// Turns an operator failure into one reset request per reset.
    pub fn operator_failed(&self, operator: OperatorIndex, seq: SequenceId, error: anyhow::Error) {
        let name = {
            let mut state = self.state.lock().unwrap();
            error!(
                region = self.index(),
                operator,
                seq,
                "operator failed: {error:#}"
            );
            if state.reset_requested {
                return;
            }
            state.reset_requested = true;
            state
                .operators
                .get(&operator)
                .cloned()
                .unwrap_or_else(|| operator.to_string())
        };
        *self.last_failure.lock().unwrap() = Some(failure_report(
            &error,
            "OperatorFailed",
            json!({ "operator": name, "seq": seq }),
        ));
        counter!(REGION_RESETS).increment(1);
        if let Err(error) = self.control.reset(self.index(), &name) {
            warn!(region = self.index(), "reset request failed: {error:#}");
            self.state.lock().unwrap().reset_requested = false;
        }
    }
}

//! The control plane that advances each region through its cycles.
//!
//! Operators report progress through [`ControlPlane`]; the control plane
//! answers with [`Notification`]s addressed to the start operators of the
//! region.  [`LocalControlPlane`] is an in-process implementation.

use anyhow::{bail, Result as AnyResult};
use crossbeam::channel::Sender;
use crossbeam::sync::{Parker, Unparker};
use cregion_types::config::{RegionConfig, TriggerConfig};
use cregion_types::{OperatorIndex, RegionIndex, ResetAttempt, SequenceId, NO_CHECKPOINT};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

/// Calls from a region's operators to its controller.
///
/// Only the start operators time out a cycle.  Their drain deadline runs
/// until the region resumes and their reset deadline until the whole region
/// has reset, so an operator further downstream that never reports ends in
/// [`reset`](Self::reset) as well.
pub trait ControlPlane: Send + Sync {
    /// The trigger operator `operator` started cycle `seq`.
    fn drain(&self, region: RegionIndex, operator: &str, seq: SequenceId) -> AnyResult<()>;

    /// `operator` asks for the region to roll back to its last checkpoint.
    fn reset(&self, region: RegionIndex, operator: &str) -> AnyResult<()>;

    /// Every operator hosted here has committed its checkpoint for `seq`.
    fn checkpoint_completed(&self, region: RegionIndex, seq: SequenceId) -> AnyResult<()>;

    /// Every blocking operator has checkpointed `seq`; non-blocking ones may
    /// still be working on it.
    fn blocking_checkpoint_completed(&self, region: RegionIndex, seq: SequenceId)
        -> AnyResult<()>;

    fn reset_completed(
        &self,
        region: RegionIndex,
        seq: SequenceId,
        attempt: ResetAttempt,
    ) -> AnyResult<()>;

    /// Every start operator of the region is listening for notifications.
    fn start_operator_subscribed(&self, region: RegionIndex) -> AnyResult<()>;
}

/// A message from the controller to the start operators of a region.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Notification {
    /// Start cycle `seq`.
    TriggerDrain { seq: SequenceId },
    /// Roll back to checkpoint `seq`.
    TriggerReset {
        seq: SequenceId,
        attempt: ResetAttempt,
    },
    /// Continue with cycle `seq`.  With `pending_checkpoint`, non-blocking
    /// operators are still checkpointing the previous cycle.
    ResumeSubmission {
        seq: SequenceId,
        retired: SequenceId,
        pending_checkpoint: bool,
    },
    /// The pending checkpoint `seq` has completed.
    Drained { seq: SequenceId },
    /// The region gave up resetting to `seq`.
    ResetFailed { seq: SequenceId },
    Shutdown,
}

#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize)]
pub enum ParseNotificationError {
    #[error("unknown notification type '{0}'")]
    UnknownType(String),

    #[error("notification is missing field '{0}'")]
    MissingField(&'static str),

    #[error("invalid value '{value}' for notification field '{field}'")]
    InvalidField { field: &'static str, value: String },
}

impl Notification {
    /// Name of the notification type on the wire.
    pub fn type_name(&self) -> &'static str {
        match self {
            Notification::TriggerDrain { .. } => "TRIGGER_DRAIN",
            Notification::TriggerReset { .. } => "TRIGGER_RESET",
            Notification::ResumeSubmission { .. } => "RESUME_SUBMISSION",
            Notification::Drained { .. } => "REGION_DRAINED",
            Notification::ResetFailed { .. } => "RESET_FAILED",
            Notification::Shutdown => "SHUTDOWN",
        }
    }

    /// The message body sent along with [`type_name`](Self::type_name).
    pub fn to_user_data(&self) -> String {
        match self {
            Notification::TriggerDrain { seq }
            | Notification::Drained { seq }
            | Notification::ResetFailed { seq } => format!("seqId={seq}"),
            Notification::TriggerReset { seq, attempt } => {
                format!("seqId={seq};resetAttempt={attempt}")
            }
            Notification::ResumeSubmission {
                seq,
                retired,
                pending_checkpoint,
            } => format!(
                "seqId={seq};retId={retired};pendCkpt={}",
                u8::from(*pending_checkpoint)
            ),
            Notification::Shutdown => String::new(),
        }
    }

    /// Parses a notification of type `type_name` with body `data`.
    pub fn parse(type_name: &str, data: &str) -> Result<Self, ParseNotificationError> {
        let fields: BTreeMap<&str, &str> = data
            .split(';')
            .filter_map(|field| field.split_once('='))
            .map(|(name, value)| (name.trim(), value.trim()))
            .collect();

        fn field<T: std::str::FromStr>(
            fields: &BTreeMap<&str, &str>,
            name: &'static str,
        ) -> Result<T, ParseNotificationError> {
            let value = fields
                .get(name)
                .ok_or(ParseNotificationError::MissingField(name))?;
            value
                .parse()
                .map_err(|_| ParseNotificationError::InvalidField {
                    field: name,
                    value: value.to_string(),
                })
        }

        match type_name {
            "TRIGGER_DRAIN" => Ok(Notification::TriggerDrain {
                seq: field(&fields, "seqId")?,
            }),
            "TRIGGER_RESET" => Ok(Notification::TriggerReset {
                seq: field(&fields, "seqId")?,
                attempt: field(&fields, "resetAttempt")?,
            }),
            "RESUME_SUBMISSION" => {
                let pending: u8 = field(&fields, "pendCkpt")?;
                if pending > 1 {
                    return Err(ParseNotificationError::InvalidField {
                        field: "pendCkpt",
                        value: pending.to_string(),
                    });
                }
                Ok(Notification::ResumeSubmission {
                    seq: field(&fields, "seqId")?,
                    retired: field(&fields, "retId")?,
                    pending_checkpoint: pending == 1,
                })
            }
            "REGION_DRAINED" => Ok(Notification::Drained {
                seq: field(&fields, "seqId")?,
            }),
            "RESET_FAILED" => Ok(Notification::ResetFailed {
                seq: field(&fields, "seqId")?,
            }),
            "SHUTDOWN" => Ok(Notification::Shutdown),
            other => Err(ParseNotificationError::UnknownType(other.to_string())),
        }
    }
}

impl Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.type_name(), self.to_user_data())
    }
}

/// Routes notifications to the start operators of each region.
///
/// Cloning the hub yields another handle to the same subscriber lists.
#[derive(Clone, Default)]
pub struct NotificationHub {
    subscribers: Arc<Mutex<BTreeMap<RegionIndex, Vec<(OperatorIndex, Sender<Notification>)>>>>,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any earlier subscription of `operator` to `region`.
    pub fn subscribe(
        &self,
        region: RegionIndex,
        operator: OperatorIndex,
        sender: Sender<Notification>,
    ) {
        let mut subscribers = self.subscribers.lock().unwrap();
        let list = subscribers.entry(region).or_default();
        list.retain(|(op, _)| *op != operator);
        list.push((operator, sender));
    }

    pub fn unsubscribe(&self, region: RegionIndex, operator: OperatorIndex) {
        if let Some(list) = self.subscribers.lock().unwrap().get_mut(&region) {
            list.retain(|(op, _)| *op != operator);
        }
    }

    pub fn num_subscribers(&self, region: RegionIndex) -> usize {
        self.subscribers
            .lock()
            .unwrap()
            .get(&region)
            .map_or(0, Vec::len)
    }

    /// Sends `notification` to every subscriber of `region` and returns how
    /// many received it.  Subscribers that went away are forgotten.
    pub fn publish(&self, region: RegionIndex, notification: Notification) -> usize {
        let mut subscribers = self.subscribers.lock().unwrap();
        let Some(list) = subscribers.get_mut(&region) else {
            debug!(region, "no subscribers for {notification}");
            return 0;
        };
        list.retain(|(operator, sender)| {
            let delivered = sender.send(notification).is_ok();
            if !delivered {
                debug!(region, operator, "dropping closed subscription");
            }
            delivered
        });
        trace!(region, subscribers = list.len(), "published {notification}");
        list.len()
    }
}

/// State of a region as seen by [`LocalControlPlane`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ControlState {
    /// Waiting for the start operators to subscribe.
    Started,
    Processing,
    Draining,
    /// Blocking operators checkpointed; non-blocking ones are still at it.
    CheckpointPending,
    Resetting,
    /// The region stopped retrying resets.
    MaximumResetAttemptsReached,
    /// Some operator of the region is down.
    Unhealthy,
}

/// Snapshot of a region's controller bookkeeping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct RegionProgress {
    pub state: ControlState,
    pub current_seq: SequenceId,
    pub pending_seq: SequenceId,
    pub last_completed_seq: SequenceId,
    pub to_retire_seq: SequenceId,
    pub reset_attempt: ResetAttempt,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TimerEvent {
    DrainPeriod,
    DrainTimeout,
    ResetTimeout,
}

struct RegionControl {
    config: RegionConfig,
    progress: RegionProgress,
    must_reset: bool,
    timer: Option<(Instant, TimerEvent)>,
}

impl RegionControl {
    fn new(config: RegionConfig) -> Self {
        Self {
            config,
            progress: RegionProgress {
                state: ControlState::Started,
                current_seq: 1,
                pending_seq: 1,
                last_completed_seq: NO_CHECKPOINT,
                to_retire_seq: NO_CHECKPOINT,
                reset_attempt: 0,
            },
            must_reset: false,
            timer: None,
        }
    }

    fn index(&self) -> RegionIndex {
        self.config.index
    }

    fn clear_timer(&mut self) {
        self.timer = None;
    }

    fn set_timer(&mut self, event: TimerEvent, delay: Duration) {
        trace!(region = self.index(), "arming {event:?} in {delay:?}");
        self.timer = Some((Instant::now() + delay, event));
    }

    fn start_period(&mut self) {
        if let Some(period) = self.config.period() {
            self.set_timer(TimerEvent::DrainPeriod, period);
        }
    }
}

struct TimerThread {
    exit: Arc<AtomicBool>,
    join_handle: Option<JoinHandle<()>>,
}

/// In-process controller for the regions hosted by this process.
///
/// Drives each region through `Started -> Processing -> Draining ->
/// (CheckpointPending ->) Processing`, with `Resetting` reachable from any
/// of them.  A background thread fires the periodic trigger and the drain
/// and reset timeouts.
pub struct LocalControlPlane {
    hub: NotificationHub,
    regions: Mutex<BTreeMap<RegionIndex, RegionControl>>,
    unparker: Unparker,
    timer: Mutex<Option<TimerThread>>,
}

impl LocalControlPlane {
    pub fn new(regions: &[RegionConfig], hub: NotificationHub) -> Arc<Self> {
        let parker = Parker::new();
        let control = Arc::new(Self {
            hub,
            regions: Mutex::new(
                regions
                    .iter()
                    .map(|config| (config.index, RegionControl::new(config.clone())))
                    .collect(),
            ),
            unparker: parker.unparker().clone(),
            timer: Mutex::new(None),
        });

        let exit = Arc::new(AtomicBool::new(false));
        let weak = Arc::downgrade(&control);
        let join_handle = thread::Builder::new()
            .name("cregion-control-timer".to_string())
            .spawn({
                let exit = exit.clone();
                move || Self::timer_thread(weak, parker, exit)
            })
            .unwrap_or_else(|error| panic!("failed to spawn control timer thread: {error}"));
        *control.timer.lock().unwrap() = Some(TimerThread {
            exit,
            join_handle: Some(join_handle),
        });
        control
    }

    fn timer_thread(control: Weak<Self>, parker: Parker, exit: Arc<AtomicBool>) {
        while !exit.load(Ordering::Acquire) {
            let Some(control) = control.upgrade() else {
                return;
            };
            let next = control.fire_timers(Instant::now());
            drop(control);
            match next {
                Some(deadline) => parker.park_deadline(deadline),
                None => parker.park(),
            }
        }
    }

    /// Handles every expired timer and returns the earliest remaining
    /// deadline.
    fn fire_timers(&self, now: Instant) -> Option<Instant> {
        let mut regions = self.regions.lock().unwrap();
        for region in regions.values_mut() {
            match region.timer {
                Some((deadline, event)) if deadline <= now => {
                    region.timer = None;
                    self.on_timer(region, event);
                }
                _ => {}
            }
        }
        regions
            .values()
            .filter_map(|region| region.timer.map(|(deadline, _)| deadline))
            .min()
    }

    fn on_timer(&self, region: &mut RegionControl, event: TimerEvent) {
        match event {
            TimerEvent::DrainTimeout | TimerEvent::ResetTimeout => {
                if region.progress.state != ControlState::Unhealthy {
                    warn!(region = region.index(), "{event:?} expired, resetting region");
                    self.reset_region(region);
                }
            }
            TimerEvent::DrainPeriod => {
                if region.progress.state == ControlState::Processing {
                    let seq = region.progress.current_seq;
                    debug!(region = region.index(), seq, "starting periodic drain");
                    region.progress.state = ControlState::Draining;
                    self.send(region, Notification::TriggerDrain { seq });
                    region.set_timer(TimerEvent::DrainTimeout, region.config.drain_timeout());
                }
            }
        }
    }

    fn send(&self, region: &RegionControl, notification: Notification) {
        debug!(region = region.index(), "sending {notification}");
        // Wake the timer thread so that it sees newly armed timers.
        self.unparker.unpark();
        self.hub.publish(region.index(), notification);
    }

    fn with_region<F, T>(&self, index: RegionIndex, f: F) -> AnyResult<T>
    where
        F: FnOnce(&mut RegionControl) -> AnyResult<T>,
    {
        let mut regions = self.regions.lock().unwrap();
        let Some(region) = regions.get_mut(&index) else {
            bail!("unknown consistent region {index}");
        };
        let result = f(region);
        self.unparker.unpark();
        result
    }

    pub fn progress(&self, region: RegionIndex) -> Option<RegionProgress> {
        self.regions
            .lock()
            .unwrap()
            .get(&region)
            .map(|region| region.progress)
    }

    /// Reports whether every operator of `region` is up.
    pub fn set_healthy(&self, region: RegionIndex, healthy: bool) -> AnyResult<()> {
        self.with_region(region, |region| {
            let state = region.progress.state;
            match (healthy, state) {
                (true, ControlState::Unhealthy) => self.reset_region(region),
                (true, ControlState::MaximumResetAttemptsReached) => error!(
                    region = region.index(),
                    "region is healthy, but it reached the maximum number of reset attempts"
                ),
                (true, _) => {}
                (
                    false,
                    ControlState::Processing
                    | ControlState::Draining
                    | ControlState::CheckpointPending
                    | ControlState::Resetting,
                ) => {
                    info!(region = region.index(), "region is unhealthy");
                    region.progress.state = ControlState::Unhealthy;
                    region.clear_timer();
                }
                (false, _) => {}
            }
            Ok(())
        })
    }

    fn reset_region(&self, region: &mut RegionControl) {
        region.clear_timer();
        let progress = &mut region.progress;
        let seq = progress.last_completed_seq;
        let attempt = progress.reset_attempt;
        if attempt as i64 >= region.config.max_consecutive_reset_attempts as i64 {
            error!(
                region = region.config.index,
                attempts = attempt,
                "maximum number of consecutive reset attempts reached"
            );
            progress.state = ControlState::MaximumResetAttemptsReached;
            self.send(region, Notification::ResetFailed { seq });
            return;
        }
        info!(region = region.config.index, seq, attempt, "resetting region");
        progress.state = ControlState::Resetting;
        progress.reset_attempt += 1;
        self.send(region, Notification::TriggerReset { seq, attempt });
        region.set_timer(TimerEvent::ResetTimeout, region.config.reset_timeout());
    }

    fn finish_checkpoint(&self, region: &mut RegionControl) {
        let progress = &mut region.progress;
        let notification = match progress.state {
            ControlState::Draining => {
                progress.to_retire_seq = progress.last_completed_seq;
                progress.last_completed_seq = progress.current_seq;
                progress.current_seq += 1;
                Notification::ResumeSubmission {
                    seq: progress.current_seq,
                    retired: progress.to_retire_seq,
                    pending_checkpoint: false,
                }
            }
            _ => {
                progress.to_retire_seq = progress.last_completed_seq;
                progress.last_completed_seq = progress.pending_seq;
                Notification::Drained {
                    seq: progress.pending_seq,
                }
            }
        };
        progress.reset_attempt = 0;
        progress.state = ControlState::Processing;
        progress.pending_seq = progress.current_seq;
        info!(
            region = region.index(),
            seq = region.progress.last_completed_seq,
            "region checkpoint completed"
        );
        self.send(region, notification);
        region.clear_timer();
        region.start_period();
    }
}

impl ControlPlane for LocalControlPlane {
    fn drain(&self, region: RegionIndex, operator: &str, seq: SequenceId) -> AnyResult<()> {
        self.with_region(region, |region| {
            if region.config.trigger != TriggerConfig::OperatorDriven {
                return Ok(());
            }
            match region.progress.state {
                ControlState::Started => {
                    // The region is not ready yet; reset it once it is.
                    debug!(region = region.index(), operator, "drain before start");
                    region.must_reset = true;
                    Ok(())
                }
                ControlState::Processing => {
                    if seq != region.progress.current_seq {
                        bail!(
                            "operator '{operator}' started unexpected cycle {seq} in region {}, expected {}",
                            region.index(),
                            region.progress.current_seq
                        );
                    }
                    debug!(region = region.index(), operator, seq, "drain started");
                    region.progress.state = ControlState::Draining;
                    region.set_timer(TimerEvent::DrainTimeout, region.config.drain_timeout());
                    Ok(())
                }
                _ => Ok(()),
            }
        })
    }

    fn reset(&self, region: RegionIndex, operator: &str) -> AnyResult<()> {
        self.with_region(region, |region| {
            info!(region = region.index(), operator, "reset requested");
            match region.progress.state {
                ControlState::Started => region.must_reset = true,
                ControlState::Unhealthy | ControlState::MaximumResetAttemptsReached => {}
                ControlState::Processing
                | ControlState::Draining
                | ControlState::CheckpointPending
                | ControlState::Resetting => self.reset_region(region),
            }
            Ok(())
        })
    }

    fn checkpoint_completed(&self, region: RegionIndex, seq: SequenceId) -> AnyResult<()> {
        self.with_region(region, |region| {
            let expected = match region.progress.state {
                ControlState::Draining => region.progress.current_seq,
                ControlState::CheckpointPending => region.progress.pending_seq,
                state => {
                    debug!(region = region.index(), seq, "ignoring checkpoint in {state:?}");
                    return Ok(());
                }
            };
            if seq != expected {
                bail!(
                    "unexpected checkpoint {seq} completed in region {}, expected {expected}",
                    region.index()
                );
            }
            self.finish_checkpoint(region);
            Ok(())
        })
    }

    fn blocking_checkpoint_completed(
        &self,
        region: RegionIndex,
        seq: SequenceId,
    ) -> AnyResult<()> {
        self.with_region(region, |region| {
            match region.progress.state {
                ControlState::Draining if seq == region.progress.current_seq => {}
                ControlState::Draining => bail!(
                    "unexpected blocking checkpoint {seq} in region {}, expected {}",
                    region.index(),
                    region.progress.current_seq
                ),
                _ => return Ok(()),
            }
            let progress = &mut region.progress;
            progress.pending_seq = seq;
            progress.current_seq += 1;
            progress.state = ControlState::CheckpointPending;
            let notification = Notification::ResumeSubmission {
                seq: progress.current_seq,
                retired: progress.to_retire_seq,
                pending_checkpoint: true,
            };
            self.send(region, notification);
            Ok(())
        })
    }

    fn reset_completed(
        &self,
        region: RegionIndex,
        seq: SequenceId,
        attempt: ResetAttempt,
    ) -> AnyResult<()> {
        self.with_region(region, |region| {
            let progress = &mut region.progress;
            if progress.state != ControlState::Resetting
                || seq != progress.last_completed_seq
                || attempt != progress.reset_attempt - 1
            {
                debug!(
                    region = region.config.index,
                    seq, attempt, "ignoring stale reset completion"
                );
                return Ok(());
            }
            progress.current_seq += 1;
            progress.state = ControlState::Processing;
            let notification = Notification::ResumeSubmission {
                seq: progress.current_seq,
                retired: progress.to_retire_seq,
                pending_checkpoint: false,
            };
            info!(region = region.index(), seq, attempt, "region reset completed");
            region.clear_timer();
            self.send(region, notification);
            region.start_period();
            Ok(())
        })
    }

    fn start_operator_subscribed(&self, region: RegionIndex) -> AnyResult<()> {
        self.with_region(region, |region| {
            if region.progress.state != ControlState::Started {
                return Ok(());
            }
            if region.must_reset {
                region.must_reset = false;
                self.reset_region(region);
            } else {
                info!(region = region.index(), "region is processing");
                region.progress.state = ControlState::Processing;
                region.start_period();
            }
            Ok(())
        })
    }
}

impl Drop for LocalControlPlane {
    fn drop(&mut self) {
        let Some(mut timer) = self.timer.lock().unwrap().take() else {
            return;
        };
        timer.exit.store(true, Ordering::Release);
        self.unparker.unpark();
        if let Some(join_handle) = timer.join_handle.take() {
            // The timer thread may drop the last reference itself.
            if join_handle.thread().id() != thread::current().id() {
                let _ = join_handle.join();
            }
        }
    }
}

//! Per-input-port marker counting.
//!
//! Every upstream connection of a port carries its own copy of each logical
//! marker.  A [`MarkerChannel`] counts the copies and tells the operator when
//! all of them have arrived, so that the operator acts on each logical marker
//! exactly once.

use crate::marker::Marker;
use crate::metrics::MARKERS_DROPPED;
use crate::topology::PortInfo;
use cregion_types::{ResetAttempt, SequenceId};
use metrics::counter;
use serde::Serialize;
use std::sync::Mutex;
use tracing::{debug, trace};

/// What the operator should do with a marker that arrived on a port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Every connection has delivered the marker: act on it now.
    Deliver(Marker),
    /// Counted; more connections must deliver it first.
    Absorbed,
    Dropped(DropReason),
}

impl Delivery {
    pub fn is_deliver(&self) -> bool {
        matches!(self, Delivery::Deliver(_))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum DropReason {
    NotInRegion,
    ImportPort,
    NotConsistent,
    /// A reset is in progress; drains are meaningless until it finishes.
    Resetting,
    /// The marker belongs to an older (or a not yet started) cycle.
    StaleSequence,
    /// A newer reset attempt superseded this one.
    StaleAttempt,
    /// The port has delivered its final marker.
    Closed,
    NoEventTimeTracker,
    /// Final markers do not propagate inside a region.
    FinalInRegion,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::NotInRegion => "not_in_region",
            DropReason::ImportPort => "import_port",
            DropReason::NotConsistent => "not_consistent",
            DropReason::Resetting => "resetting",
            DropReason::StaleSequence => "stale_sequence",
            DropReason::StaleAttempt => "stale_attempt",
            DropReason::Closed => "closed",
            DropReason::NoEventTimeTracker => "no_event_time_tracker",
            DropReason::FinalInRegion => "final_in_region",
        }
    }
}

/// Combines the watermarks of a port's upstream connections.
///
/// The port's watermark is the minimum over its connections.  It is released
/// only once every connection has reported and only when it advances.
#[derive(Clone, Debug)]
pub struct EventTimeTracker {
    watermarks: Vec<Option<i64>>,
    released: Option<i64>,
}

impl EventTimeTracker {
    pub fn new(connections: usize) -> Self {
        Self {
            watermarks: vec![None; connections.max(1)],
            released: None,
        }
    }

    /// Records `timestamp` for `connection` and returns the new port
    /// watermark if it advanced.
    pub fn update(&mut self, connection: usize, timestamp: i64) -> Option<i64> {
        let slot = self.watermarks.get_mut(connection)?;
        // A connection's watermark never goes back.
        *slot = Some(slot.map_or(timestamp, |current| current.max(timestamp)));

        let minimum = self
            .watermarks
            .iter()
            .copied()
            .collect::<Option<Vec<i64>>>()?
            .into_iter()
            .min()?;
        if self.released.is_some_and(|released| minimum <= released) {
            return None;
        }
        self.released = Some(minimum);
        Some(minimum)
    }

    pub fn watermark(&self) -> Option<i64> {
        self.released
    }
}

struct DrainCut {
    seq: SequenceId,
    remaining: usize,
}

struct ResetCut {
    seq: SequenceId,
    attempt: ResetAttempt,
    remaining: usize,
}

struct ChannelState {
    closed: bool,
    finals_remaining: usize,
    resetting: bool,
    drain: Option<DrainCut>,
    last_drain: Option<SequenceId>,
    reset: Option<ResetCut>,
    last_reset: Option<(SequenceId, ResetAttempt)>,
    event_time: Option<EventTimeTracker>,
}

/// Marker state of one input port.
pub struct MarkerChannel {
    port: usize,
    in_region: bool,
    info: PortInfo,
    state: Mutex<ChannelState>,
}

impl MarkerChannel {
    pub fn new(port: usize, info: PortInfo, in_region: bool) -> Self {
        let connections = info.connections.max(1);
        Self {
            port,
            in_region,
            info,
            state: Mutex::new(ChannelState {
                closed: false,
                finals_remaining: connections,
                resetting: false,
                drain: None,
                last_drain: None,
                reset: None,
                last_reset: None,
                event_time: None,
            }),
        }
    }

    /// Tracks watermarks on this port.
    pub fn with_event_time(self) -> Self {
        self.state.lock().unwrap().event_time = Some(EventTimeTracker::new(self.connections()));
        self
    }

    pub fn port(&self) -> usize {
        self.port
    }

    pub fn connections(&self) -> usize {
        self.info.connections.max(1)
    }

    /// Tells the port whether the operator is resetting.  Drains are dropped
    /// while it is.
    pub fn set_resetting(&self, resetting: bool) {
        let mut state = self.state.lock().unwrap();
        state.resetting = resetting;
        if resetting {
            state.drain = None;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    /// Whether a data tuple arriving on this port should be processed.
    pub fn on_tuple(&self) -> bool {
        !self.is_closed()
    }

    /// Dispatches `marker`, received on `connection`, to its handler.
    pub fn on_marker(&self, connection: usize, marker: Marker) -> Delivery {
        match marker {
            Marker::Final => self.on_final(),
            Marker::Drain { seq } => self.on_drain(seq),
            Marker::Reset { seq, attempt } => self.on_reset(seq, attempt),
            Marker::Resume { seq, retired } => self.on_resume(seq, retired),
            Marker::Watermark { timestamp } => self.on_watermark(connection, timestamp),
        }
    }

    fn drop_marker(&self, marker: Marker, reason: DropReason) -> Delivery {
        match reason {
            DropReason::StaleSequence | DropReason::StaleAttempt => {
                debug!(port = self.port, "dropping delayed or future {marker}: {reason:?}")
            }
            _ => trace!(port = self.port, "dropping {marker}: {reason:?}"),
        }
        counter!(MARKERS_DROPPED, "reason" => reason.as_str()).increment(1);
        Delivery::Dropped(reason)
    }

    /// Checks the port properties that every counted marker requires.
    fn gate(&self) -> Option<DropReason> {
        if !self.in_region {
            Some(DropReason::NotInRegion)
        } else if self.info.import {
            Some(DropReason::ImportPort)
        } else if !self.info.consistent {
            Some(DropReason::NotConsistent)
        } else {
            None
        }
    }

    pub fn on_final(&self) -> Delivery {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return self.drop_marker(Marker::Final, DropReason::Closed);
        }
        state.finals_remaining = state.finals_remaining.saturating_sub(1);
        if state.finals_remaining > 0 {
            return Delivery::Absorbed;
        }
        if self.in_region {
            // Rearm so that a later incarnation of the upstream operators
            // can finish again.
            state.finals_remaining = self.connections();
            return self.drop_marker(Marker::Final, DropReason::FinalInRegion);
        }
        state.closed = true;
        Delivery::Deliver(Marker::Final)
    }

    pub fn on_drain(&self, seq: SequenceId) -> Delivery {
        let marker = Marker::Drain { seq };
        if let Some(reason) = self.gate() {
            return self.drop_marker(marker, reason);
        }
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return self.drop_marker(marker, DropReason::Closed);
        }
        if state.resetting {
            return self.drop_marker(marker, DropReason::Resetting);
        }
        if state.last_drain.is_some_and(|last| seq <= last) {
            return self.drop_marker(marker, DropReason::StaleSequence);
        }

        let connections = self.connections();
        let cut = state.drain.get_or_insert(DrainCut {
            seq,
            remaining: connections,
        });
        if cut.seq != seq {
            return self.drop_marker(marker, DropReason::StaleSequence);
        }
        cut.remaining -= 1;
        if cut.remaining > 0 {
            return Delivery::Absorbed;
        }
        state.drain = None;
        state.last_drain = Some(seq);
        Delivery::Deliver(marker)
    }

    pub fn on_reset(&self, seq: SequenceId, attempt: ResetAttempt) -> Delivery {
        let marker = Marker::Reset { seq, attempt };
        if let Some(reason) = self.gate() {
            return self.drop_marker(marker, reason);
        }
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return self.drop_marker(marker, DropReason::Closed);
        }
        if let Some((last_seq, last_attempt)) = state.last_reset {
            if seq < last_seq {
                return self.drop_marker(marker, DropReason::StaleSequence);
            }
            if seq == last_seq && attempt <= last_attempt {
                return self.drop_marker(marker, DropReason::StaleAttempt);
            }
        }

        let restart = match &state.reset {
            Some(cut) if seq < cut.seq => Err(DropReason::StaleSequence),
            Some(cut) if seq == cut.seq && attempt < cut.attempt => Err(DropReason::StaleAttempt),
            Some(cut) if seq == cut.seq && attempt == cut.attempt => Ok(false),
            _ => Ok(true),
        };
        match restart {
            Err(reason) => return self.drop_marker(marker, reason),
            // First copy of a newer reset: it supersedes whatever was being
            // counted.
            Ok(true) => {
                state.reset = Some(ResetCut {
                    seq,
                    attempt,
                    remaining: self.connections(),
                })
            }
            Ok(false) => {}
        }

        let Some(cut) = state.reset.as_mut() else {
            return Delivery::Absorbed;
        };
        cut.remaining -= 1;
        if cut.remaining > 0 {
            return Delivery::Absorbed;
        }
        state.reset = None;
        state.last_reset = Some((seq, attempt));
        // A completed reset abandons any drain that was in progress.
        state.drain = None;
        Delivery::Deliver(marker)
    }

    pub fn on_resume(&self, seq: SequenceId, retired: SequenceId) -> Delivery {
        let marker = Marker::Resume { seq, retired };
        if let Some(reason) = self.gate() {
            return self.drop_marker(marker, reason);
        }
        if self.is_closed() {
            return self.drop_marker(marker, DropReason::Closed);
        }
        Delivery::Deliver(marker)
    }

    pub fn on_watermark(&self, connection: usize, timestamp: i64) -> Delivery {
        let marker = Marker::Watermark { timestamp };
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return self.drop_marker(marker, DropReason::Closed);
        }
        let Some(tracker) = state.event_time.as_mut() else {
            return self.drop_marker(marker, DropReason::NoEventTimeTracker);
        };
        match tracker.update(connection, timestamp) {
            Some(timestamp) => Delivery::Deliver(Marker::Watermark { timestamp }),
            None => Delivery::Absorbed,
        }
    }
}

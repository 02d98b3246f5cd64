//! What the runtime needs to know about the operator graph.

use cregion_types::config::RegionConfig;
use cregion_types::{OperatorIndex, RegionIndex};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One input port of an operator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    /// The port belongs to the consistent region.  Markers on other ports
    /// are not counted.
    pub consistent: bool,

    /// Control ports carry configuration rather than data.  Their markers
    /// count toward completion but not toward forwarding.
    pub control: bool,

    /// The port receives tuples from outside the graph (an import).
    pub import: bool,

    /// Number of static upstream connections, i.e. how many copies of each
    /// marker arrive on this port.
    pub connections: usize,

    /// The port combines the watermarks of its connections.
    #[serde(default)]
    pub event_time: bool,
}

impl PortInfo {
    /// A consistent data port with `connections` upstream connections.
    pub fn consistent(connections: usize) -> Self {
        Self {
            consistent: true,
            control: false,
            import: false,
            connections,
            event_time: false,
        }
    }

    pub fn control(connections: usize) -> Self {
        Self {
            control: true,
            ..Self::consistent(connections)
        }
    }

    pub fn with_event_time(mut self) -> Self {
        self.event_time = true;
        self
    }
}

/// Describes one operator's membership in a consistent region.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorRegionInfo {
    pub operator: OperatorIndex,
    pub name: String,
    pub region: RegionIndex,
    pub inputs: Vec<PortInfo>,
    pub num_outputs: usize,

    /// The operator has no consistent inputs inside the region: it creates
    /// cycles rather than receiving them.
    pub start_of_region: bool,

    /// Markers stop here.
    pub end_of_region: bool,

    /// The operator decides when a cycle starts (`make_consistent`).
    pub trigger: bool,

    /// The operator can keep processing tuples while its checkpoint is
    /// written.  Only honored when the region allows non-blocking
    /// checkpoints.
    pub non_blocking: bool,

    pub drain_timeout: Duration,
    pub reset_timeout: Duration,
}

impl OperatorRegionInfo {
    /// A member of `region` with the region's timeouts and no ports.
    pub fn new(operator: OperatorIndex, name: &str, region: &RegionConfig) -> Self {
        Self {
            operator,
            name: name.to_string(),
            region: region.index,
            inputs: Vec::new(),
            num_outputs: 0,
            start_of_region: false,
            end_of_region: false,
            trigger: false,
            non_blocking: false,
            drain_timeout: region.drain_timeout(),
            reset_timeout: region.reset_timeout(),
        }
    }

    pub fn with_inputs(mut self, inputs: Vec<PortInfo>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_outputs(mut self, num_outputs: usize) -> Self {
        self.num_outputs = num_outputs;
        self
    }

    pub fn start(mut self, trigger: bool) -> Self {
        self.start_of_region = true;
        self.trigger = trigger;
        self
    }

    pub fn end(mut self) -> Self {
        self.end_of_region = true;
        self
    }

    pub fn non_blocking(mut self) -> Self {
        self.non_blocking = true;
        self
    }

    fn consistent_inputs(&self) -> impl Iterator<Item = &PortInfo> {
        self.inputs.iter().filter(|port| port.consistent)
    }

    pub fn has_consistent_control_port(&self) -> bool {
        self.consistent_inputs().any(|port| port.control)
    }

    /// Every consistent input is a control port.  Start operators never
    /// qualify.
    pub fn consistent_ports_are_control(&self) -> bool {
        !self.start_of_region
            && self.consistent_inputs().next().is_some()
            && self.consistent_inputs().all(|port| port.control)
    }

    /// Number of ports whose Drain or Reset must arrive before the operator
    /// forwards the marker.
    pub fn num_markers_for_forwarding(&self) -> usize {
        if self.consistent_ports_are_control() {
            1
        } else {
            self.consistent_inputs().filter(|port| !port.control).count()
        }
    }

    /// Number of ports whose Drain or Reset must arrive before the operator
    /// has completed the phase.
    pub fn num_markers_for_completion(&self) -> usize {
        self.consistent_inputs().count()
    }
}

//! Consistent regions for streaming operator graphs.
//!
//! A consistent region is a subgraph whose operators periodically agree on
//! a cut of the stream, checkpoint their state at that cut, and roll back
//! to the last complete checkpoint when any of them fails.  Cuts are made
//! by Drain markers that flow from the start operators of the region to its
//! end; Reset markers roll the region back and Resume markers let tuples
//! flow again.
//!
//! [`RegionService`] hosts the operators of one process.  Each operator gets
//! a [`RegionCoordinator`], which tracks markers on its input ports and
//! pauses the operator while it drains or resets.  Checkpoints are written
//! to a [`CheckpointStore`](cregion_store::CheckpointStore) by the
//! [`Dispatcher`]'s worker threads.  Per region, a [`RegionAggregator`]
//! merges the operators' completions and reports them to the
//! [`ControlPlane`].

pub mod aggregator;
pub mod channel;
pub mod control;
pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod marker;
pub mod metrics;
pub mod service;
pub mod topology;

pub use aggregator::RegionAggregator;
pub use channel::{Delivery, DropReason, MarkerChannel};
pub use control::{
    ControlPlane, ControlState, LocalControlPlane, Notification, NotificationHub, RegionProgress,
};
pub use coordinator::{DrainResult, PermitGuard, RegionCoordinator, RegionPhase};
pub use dispatcher::{CheckpointTarget, DispatchError, Dispatcher, WorkItem};
pub use error::RegionError;
pub use handler::{MarkerSink, StateHandler, Stateless};
pub use marker::{Marker, MarkerKind};
pub use service::RegionService;
pub use topology::{OperatorRegionInfo, PortInfo};

pub use cregion_types::{OperatorIndex, RegionIndex, ResetAttempt, SequenceId, NO_CHECKPOINT};

//! Consistent-region metrics.
//!
//! The constants defined in this module are the names of metrics that the
//! runtime maintains via [`metrics`] crate interfaces.
use ::metrics::{describe_counter, describe_histogram, Unit};

/// Total number of markers dropped by input ports, labeled by `reason`.
pub const MARKERS_DROPPED: &str = "region.total_markers_dropped";

/// Total number of operator checkpoints written.
pub const CHECKPOINTS_CREATED: &str = "region.total_checkpoints_created";

/// Total number of operator state restorations.
pub const CHECKPOINTS_RESTORED: &str = "region.total_checkpoints_restored";

/// Total number of failed dispatcher work items.
pub const WORK_ITEMS_FAILED: &str = "region.total_work_items_failed";

/// Total number of region-wide checkpoints committed.
pub const REGION_CHECKPOINTS: &str = "region.total_region_checkpoints";

/// Total number of region-wide resets requested.
pub const REGION_RESETS: &str = "region.total_region_resets";

/// Histogram of the time an operator spends writing one checkpoint.
pub const CHECKPOINT_LATENCY: &str = "region.checkpoint_latency";

/// Histogram of the time an operator spends restoring one checkpoint.
pub const RESTORE_LATENCY: &str = "region.restore_latency";

/// Adds descriptions for the metrics we expose.
pub fn describe_region_metrics() {
    describe_counter!(
        MARKERS_DROPPED,
        "total number of markers dropped by input ports"
    );
    describe_counter!(
        CHECKPOINTS_CREATED,
        "total number of operator checkpoints written"
    );
    describe_counter!(
        CHECKPOINTS_RESTORED,
        "total number of operator checkpoints restored"
    );
    describe_counter!(
        WORK_ITEMS_FAILED,
        "total number of failed checkpoint work items"
    );
    describe_counter!(
        REGION_CHECKPOINTS,
        "total number of committed region checkpoints"
    );
    describe_counter!(REGION_RESETS, "total number of requested region resets");

    describe_histogram!(
        CHECKPOINT_LATENCY,
        Unit::Seconds,
        "Operator checkpoint latency"
    );
    describe_histogram!(RESTORE_LATENCY, Unit::Seconds, "Operator restore latency");
}

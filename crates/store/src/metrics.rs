//! Checkpoint store metrics.
//!
//! The constants defined in this module are the names of metrics that the
//! store maintains via [`metrics`] crate interfaces.
use ::metrics::{describe_counter, describe_histogram, Unit};

/// Total number of commands written to replica connections.
pub const COMMANDS_SENT: &str = "store.total_commands_sent";

/// Total number of commands acknowledged by a replica.
pub const COMMANDS_ACKED: &str = "store.total_commands_acked";

/// Total number of failed replica connection attempts.
pub const CONNECT_FAILURES: &str = "store.total_connect_failures";

/// Total number of batches committed with a quorum.
pub const BATCHES_COMMITTED: &str = "store.total_batches_committed";

/// Total number of batches that failed to reach a quorum.
pub const BATCHES_FAILED: &str = "store.total_batches_failed";

/// Histogram of batch commit latency.
pub const COMMIT_LATENCY: &str = "store.commit_latency";

/// Histogram of read latency.
pub const READ_LATENCY: &str = "store.read_latency";

/// Adds descriptions for the metrics we expose.
pub fn describe_store_metrics() {
    describe_counter!(COMMANDS_SENT, "total number of commands sent to replicas");
    describe_counter!(
        COMMANDS_ACKED,
        "total number of commands acknowledged by replicas"
    );
    describe_counter!(
        CONNECT_FAILURES,
        "total number of failed replica connection attempts"
    );
    describe_counter!(BATCHES_COMMITTED, "total number of committed batches");
    describe_counter!(BATCHES_FAILED, "total number of failed batches");

    describe_histogram!(COMMIT_LATENCY, Unit::Seconds, "Batch commit latency");
    describe_histogram!(READ_LATENCY, Unit::Seconds, "Quorum read latency");
}

//! Collector metrics.
//!
//! Recorded through the `metrics` facade; they are no-ops until the host
//! process installs a recorder.

use metrics::{counter, describe_counter, describe_histogram, histogram};
use tokio::time::Instant;

/// Queue latency histogram, from enqueue to the start of processing.
pub const QUEUE_LATENCY: &str = "rkgc_queue_latency_seconds";

/// Objects deleted by the garbage processor.
pub const OBJECTS_DELETED: &str = "rkgc_objects_deleted_total";

/// Owner-reference patches the store accepted, by reason. A patch for a
/// reference that was already gone still counts.
pub const OWNER_REFERENCE_PATCHES: &str = "rkgc_owner_reference_patches_total";

/// Finalizers removed from owners.
pub const FINALIZERS_REMOVED: &str = "rkgc_finalizers_removed_total";

/// Events the propagator could not use.
pub const EVENTS_DROPPED: &str = "rkgc_events_dropped_total";

/// Items that failed and were requeued.
pub const PROCESSING_ERRORS: &str = "rkgc_processing_errors_total";

/// Conflict retries while removing finalizers.
pub const CONFLICT_RETRIES: &str = "rkgc_conflict_retries_total";

/// Registers all collector metric descriptions.
///
/// Call this once at startup after installing the metrics recorder.
pub fn register_metrics() {
    describe_histogram!(QUEUE_LATENCY, "Time items wait in a queue in seconds");
    describe_counter!(OBJECTS_DELETED, "Total objects deleted by the collector");
    describe_counter!(
        OWNER_REFERENCE_PATCHES,
        "Total owner-reference patches accepted by the store"
    );
    describe_counter!(FINALIZERS_REMOVED, "Total finalizers removed from owners");
    describe_counter!(EVENTS_DROPPED, "Total events dropped by the propagator");
    describe_counter!(PROCESSING_ERRORS, "Total queue items that failed");
    describe_counter!(CONFLICT_RETRIES, "Total conflict retries on finalizer removal");
}

pub fn record_queue_latency(queue: &'static str, enqueued_at: Instant) {
    histogram!(QUEUE_LATENCY, "queue" => queue).record(enqueued_at.elapsed().as_secs_f64());
}

pub fn record_deletion(policy: &'static str) {
    counter!(OBJECTS_DELETED, "policy" => policy).increment(1);
}

/// `reason` is `dangling` for stripped dead owners, `unblock` for cleared
/// `blockOwnerDeletion` flags and `orphan` for orphaned dependents.
pub fn record_owner_reference_patches(reason: &'static str, count: usize) {
    counter!(OWNER_REFERENCE_PATCHES, "reason" => reason).increment(count as u64);
}

pub fn record_finalizer_removed(finalizer: &str) {
    counter!(FINALIZERS_REMOVED, "finalizer" => finalizer.to_string()).increment(1);
}

pub fn record_event_dropped(reason: &'static str) {
    counter!(EVENTS_DROPPED, "reason" => reason).increment(1);
}

pub fn record_processing_error(queue: &'static str) {
    counter!(PROCESSING_ERRORS, "queue" => queue).increment(1);
}

pub fn record_conflict_retry() {
    counter!(CONFLICT_RETRIES).increment(1);
}

//! Metric names and descriptions.
//!
//! Metrics are emitted through the `metrics` facade. Installing a recorder
//! (Prometheus exporter or otherwise) is left to the host application.

use metrics::{describe_counter, describe_histogram, Unit};

pub const ACTIONS_EXECUTED: &str = "petri_actions_executed_total";
pub const ACTIONS_REJECTED: &str = "petri_actions_rejected_total";
pub const ACTION_DURATION: &str = "petri_action_duration_seconds";
pub const EVENTS_APPENDED: &str = "petri_events_appended_total";
pub const CONCURRENCY_CONFLICTS: &str = "petri_concurrency_conflicts_total";
pub const SUBSCRIPTION_DROPPED: &str = "petri_subscription_dropped_total";
pub const REPLAY_FAILURES: &str = "petri_replay_failures_total";
pub const SNAPSHOTS_SAVED: &str = "petri_snapshots_saved_total";
pub const ERRORS: &str = "petri_errors_total";

/// Register descriptions with the installed recorder. Call once after
/// installing it.
pub fn describe_metrics() {
    describe_counter!(ACTIONS_EXECUTED, Unit::Count, "Actions executed and persisted, by action");
    describe_counter!(ACTIONS_REJECTED, Unit::Count, "Actions refused as not enabled or guarded, by action");
    describe_histogram!(ACTION_DURATION, Unit::Seconds, "Wall time of engine action execution");
    describe_counter!(EVENTS_APPENDED, Unit::Count, "Events appended, by store backend");
    describe_counter!(CONCURRENCY_CONFLICTS, Unit::Count, "Appends rejected by the version check");
    describe_counter!(SUBSCRIPTION_DROPPED, Unit::Count, "Events dropped for full subscriber queues");
    describe_counter!(REPLAY_FAILURES, Unit::Count, "Stored events that could not be replayed");
    describe_counter!(SNAPSHOTS_SAVED, Unit::Count, "Aggregate snapshots written by the engine");
    describe_counter!(ERRORS, Unit::Count, "Errors constructed, by code and category");
}

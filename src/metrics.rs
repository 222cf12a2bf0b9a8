//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Registry creation, pruning and state transitions
//! - Transfer and verification durations
//! - Checksum mismatches (consistency violations)
//! - Lease contention
//! - Scheduling pass summaries
//!
//! All metrics are prefixed with `registry_`; counters end in `_total`.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a registry row created on first scheduling.
pub fn record_registry_created(resource_type: &str, site_id: &str) {
    counter!("registry_rows_created_total", "resource_type" => resource_type.to_string(), "site_id" => site_id.to_string()).increment(1);
}

/// Record registry rows pruned (resource deleted or out of scope).
pub fn record_registry_pruned(resource_type: &str, site_id: &str, count: u64) {
    counter!("registry_rows_pruned_total", "resource_type" => resource_type.to_string(), "site_id" => site_id.to_string()).increment(count);
}

/// Record a sync attempt result.
pub fn record_sync(resource_type: &str, site_id: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("registry_syncs_total", "resource_type" => resource_type.to_string(), "site_id" => site_id.to_string(), "status" => status).increment(1);
}

/// Record transfer duration for a successful sync.
pub fn record_sync_duration(resource_type: &str, site_id: &str, duration: Duration) {
    histogram!("registry_sync_duration_seconds", "resource_type" => resource_type.to_string(), "site_id" => site_id.to_string())
        .record(duration.as_secs_f64());
}

/// Record payload bytes moved by a successful transfer.
pub fn record_sync_bytes(resource_type: &str, site_id: &str, bytes: u64) {
    counter!("registry_sync_bytes_total", "resource_type" => resource_type.to_string(), "site_id" => site_id.to_string()).increment(bytes);
}

/// Record a verification attempt result.
pub fn record_verification(resource_type: &str, site_id: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("registry_verifications_total", "resource_type" => resource_type.to_string(), "site_id" => site_id.to_string(), "status" => status).increment(1);
}

/// Record verification duration.
pub fn record_verification_duration(resource_type: &str, site_id: &str, duration: Duration) {
    histogram!("registry_verification_duration_seconds", "resource_type" => resource_type.to_string(), "site_id" => site_id.to_string())
        .record(duration.as_secs_f64());
}

/// Record a detected consistency violation. Operators alert on this.
pub fn record_checksum_mismatch(resource_type: &str, site_id: &str) {
    counter!("registry_checksum_mismatches_total", "resource_type" => resource_type.to_string(), "site_id" => site_id.to_string()).increment(1);
}

/// Record a lease acquisition that found the lease busy.
pub fn record_lease_busy(operation: &str) {
    counter!("registry_lease_busy_total", "operation" => operation.to_string()).increment(1);
}

/// Record a scheduling pass summary for a site.
pub fn record_schedule_pass(site_id: &str, created: u64, enqueued: u64, pruned: u64, invalidated: u64) {
    counter!("registry_schedule_passes_total", "site_id" => site_id.to_string()).increment(1);
    gauge!("registry_schedule_created", "site_id" => site_id.to_string()).set(created as f64);
    gauge!("registry_schedule_enqueued", "site_id" => site_id.to_string()).set(enqueued as f64);
    gauge!("registry_schedule_pruned", "site_id" => site_id.to_string()).set(pruned as f64);
    gauge!("registry_schedule_invalidated", "site_id" => site_id.to_string()).set(invalidated as f64);
}

/// Record rows failed by the started-timeout sweeps.
pub fn record_timeout_sweep(axis: &str, count: u64) {
    if count > 0 {
        counter!("registry_timeout_failures_total", "axis" => axis.to_string()).increment(count);
    }
}

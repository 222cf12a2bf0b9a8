//! Engine lifecycle and work-outcome types.

/// State of the coordinator lifecycle.
///
/// - **Created**: constructed, no loop running. Call
///   [`run()`](super::SyncCoordinator::run) to begin scheduling passes.
/// - **Running**: poll loop active.
/// - **ShuttingDown**: shutdown requested, current pass draining.
/// - **Stopped**: loop exited cleanly. Safe to drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Created,
    Running,
    ShuttingDown,
    Stopped,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Created => write!(f, "Created"),
            EngineState::Running => write!(f, "Running"),
            EngineState::ShuttingDown => write!(f, "ShuttingDown"),
            EngineState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Result of one replication `process` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Transfer completed; row is `synced` and verification is queued.
    Synced,
    /// Transfer failed; row is `failed` with a backoff gate.
    Failed,
    /// Another worker holds the replicate lease.
    LeaseBusy,
    /// The row was no longer due (already processed, or pruned).
    Skipped,
}

/// Result of one verification `process` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// Digests matched; row is verified.
    Verified,
    /// Digests differed: consistency violation recorded, sync re-queued.
    Mismatch,
    /// Checksum computation failed; row is verification-failed with backoff.
    Failed,
    /// Another worker holds the verify lease.
    LeaseBusy,
    /// The row was no longer due (already processed, or pruned).
    Skipped,
}

/// Summary of one replication scheduling pass over a site.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulePassStats {
    /// Rows created for resources newly in scope.
    pub created: u64,
    /// Work items emitted (`pending` + backoff-due `failed`).
    pub enqueued: u64,
    /// Rows deleted for resources deleted or out of scope.
    pub pruned: u64,
    /// Synced rows flipped back to `pending` because the upstream changed.
    pub invalidated: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_state_display() {
        assert_eq!(EngineState::Created.to_string(), "Created");
        assert_eq!(EngineState::Running.to_string(), "Running");
        assert_eq!(EngineState::ShuttingDown.to_string(), "ShuttingDown");
        assert_eq!(EngineState::Stopped.to_string(), "Stopped");
    }

    #[test]
    fn test_stats_default_is_zeroed() {
        let stats = SchedulePassStats::default();
        assert_eq!(stats.created, 0);
        assert_eq!(stats.enqueued, 0);
        assert_eq!(stats.pruned, 0);
        assert_eq!(stats.invalidated, 0);
    }

    #[test]
    fn test_outcome_equality() {
        assert_eq!(SyncOutcome::Synced, SyncOutcome::Synced);
        assert_ne!(SyncOutcome::Synced, SyncOutcome::LeaseBusy);
        assert_ne!(VerifyOutcome::Verified, VerifyOutcome::Mismatch);
    }
}

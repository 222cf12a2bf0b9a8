// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The per-(resource, site) registry record and its state machine.
//!
//! A [`Registry`] tracks one resource's replication to one secondary site on
//! two axes:
//!
//! ```text
//! replication:                      verification (requires synced):
//!
//!   (none) ──schedule──→ pending      pending/disabled ──lease──→ started
//!      ┌───────────────────┤                                        │
//!      │                 lease              ┌───── compute error ───┤
//!      │                   ↓                ↓                       │
//!   manual              started          failed ──retry──→ started  │
//!   resync            ┌────┴────┐          │                        │
//!      │          success    error         ceiling → operator       │
//!      │             ↓          ↓                                   │
//!      │          synced     failed ──backoff retry──→ started   succeeded
//!      │             │          │                        (mismatch flag set
//!      └─────────────┤       ceiling → operator           when digests differ;
//!        upstream change                                  synced → pending)
//!        or mismatch ↓
//!                 pending
//! ```
//!
//! Transitions are monotonic forward; the only backward edges are the
//! explicit `failed → pending` retries and the `synced → pending`
//! invalidations (upstream content change, checksum mismatch). Every method
//! returns `InvalidTransition` on any other edge, so a buggy caller cannot
//! silently corrupt a row.
//!
//! The `checksum_mismatch` flag is sticky: only the verification engine sets
//! it, and only a later successful verification with matching digests clears
//! it. In particular a successful re-sync does NOT clear the flag — the row
//! keeps advertising the past divergence until a verification proves the
//! copies byte-identical again.

use crate::error::{ReplicationError, Result};
use crate::replicable::Checksum;
use crate::resilience::Backoff;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

/// Replication axis states. Numeric values are the persisted representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationState {
    Pending = 0,
    Started = 1,
    Synced = 2,
    Failed = 3,
}

impl ReplicationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Started => "started",
            Self::Synced => "synced",
            Self::Failed => "failed",
        }
    }

    pub fn from_i64(value: i64) -> Result<Self> {
        match value {
            0 => Ok(Self::Pending),
            1 => Ok(Self::Started),
            2 => Ok(Self::Synced),
            3 => Ok(Self::Failed),
            other => Err(ReplicationError::Internal(format!(
                "unknown replication_state value {other}"
            ))),
        }
    }
}

impl std::fmt::Display for ReplicationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verification axis states. Numeric values are the persisted representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationState {
    Pending = 0,
    Started = 1,
    Succeeded = 2,
    Failed = 3,
    Disabled = 4,
}

impl VerificationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Started => "started",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Disabled => "disabled",
        }
    }

    pub fn from_i64(value: i64) -> Result<Self> {
        match value {
            0 => Ok(Self::Pending),
            1 => Ok(Self::Started),
            2 => Ok(Self::Succeeded),
            3 => Ok(Self::Failed),
            4 => Ok(Self::Disabled),
            other => Err(ReplicationError::Internal(format!(
                "unknown verification_state value {other}"
            ))),
        }
    }
}

impl std::fmt::Display for VerificationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of comparing the primary and replica digests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationOutcome {
    /// Digests equal; copies are byte-identical.
    Match,
    /// Digests differ cleanly (no error). A consistency violation: the
    /// mismatch flag is set and the row is re-queued for replication.
    Mismatch,
}

/// One registry row: the tracking record for (resource_type, resource_id,
/// site_id).
#[derive(Debug, Clone, PartialEq)]
pub struct Registry {
    pub resource_type: String,
    pub resource_id: String,
    pub site_id: String,

    pub replication_state: ReplicationState,
    pub verification_state: VerificationState,

    pub retry_count: u32,
    pub verification_retry_count: u32,

    pub last_sync_failure: Option<String>,
    pub verification_failure: Option<String>,

    /// Digest of the secondary's copy, recorded by the verification engine.
    pub verification_checksum: Option<Checksum>,
    /// Sticky divergence flag; see the module docs.
    pub checksum_mismatch: bool,

    pub retry_at: Option<DateTime<Utc>>,
    pub verification_retry_at: Option<DateTime<Utc>>,

    /// When the last sync attempt started.
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_successful_sync_at: Option<DateTime<Utc>>,
    pub verification_started_at: Option<DateTime<Utc>>,
    pub verified_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

impl Registry {
    /// A fresh `pending` row, created lazily on first scheduling.
    pub fn new(
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        site_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            site_id: site_id.into(),
            replication_state: ReplicationState::Pending,
            verification_state: VerificationState::Pending,
            retry_count: 0,
            verification_retry_count: 0,
            last_sync_failure: None,
            verification_failure: None,
            verification_checksum: None,
            checksum_mismatch: false,
            retry_at: None,
            verification_retry_at: None,
            last_synced_at: None,
            last_successful_sync_at: None,
            verification_started_at: None,
            verified_at: None,
            created_at: now,
        }
    }

    /// Short human-readable identity for logs.
    pub fn describe(&self) -> String {
        format!("{}/{}@{}", self.resource_type, self.resource_id, self.site_id)
    }

    // =========================================================================
    // Replication axis
    // =========================================================================

    /// `pending | failed -> started`. Must be called under the replicate
    /// lease, before fetching.
    pub fn start_sync(&mut self, now: DateTime<Utc>) -> Result<()> {
        match self.replication_state {
            ReplicationState::Pending | ReplicationState::Failed => {
                self.replication_state = ReplicationState::Started;
                self.last_synced_at = Some(now);
                Ok(())
            }
            other => Err(ReplicationError::invalid_transition(other.as_str(), "started")),
        }
    }

    /// `started -> synced` on successful transfer.
    ///
    /// Clears the retry/backoff/failure fields and re-arms verification:
    /// `pending` if the adapter wants this resource verified, `disabled`
    /// otherwise. The previous verification digest is discarded (it described
    /// bytes that have just been rewritten) but a sticky mismatch flag
    /// survives until verification clears it.
    pub fn finish_sync(&mut self, wants_verification: bool, now: DateTime<Utc>) -> Result<()> {
        if self.replication_state != ReplicationState::Started {
            return Err(ReplicationError::invalid_transition(
                self.replication_state.as_str(),
                "synced",
            ));
        }

        self.replication_state = ReplicationState::Synced;
        self.last_successful_sync_at = Some(now);
        self.retry_count = 0;
        self.retry_at = None;
        self.last_sync_failure = None;

        self.verification_state = if wants_verification {
            VerificationState::Pending
        } else {
            VerificationState::Disabled
        };
        self.verification_checksum = None;
        self.verification_failure = None;
        self.verification_retry_count = 0;
        self.verification_retry_at = None;
        self.verification_started_at = None;

        Ok(())
    }

    /// `started -> failed` on transfer error.
    ///
    /// Bumps `retry_count` and computes the backoff gate. Once the count
    /// reaches the configured ceiling the row stays `failed` and
    /// [`sync_due`](Self::sync_due) never selects it again; only
    /// [`resync`](Self::resync) re-arms it.
    pub fn fail_sync(
        &mut self,
        reason: impl Into<String>,
        backoff: &Backoff,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if self.replication_state != ReplicationState::Started {
            return Err(ReplicationError::invalid_transition(
                self.replication_state.as_str(),
                "failed",
            ));
        }

        self.replication_state = ReplicationState::Failed;
        self.retry_count += 1;
        self.retry_at = Some(backoff.next_retry_time(self.retry_count, now));
        self.last_sync_failure = Some(truncate(reason.into(), 255));
        Ok(())
    }

    /// `failed | synced -> pending`: manual resync request.
    ///
    /// Resets the retry budget so the row is picked up by the next
    /// scheduling pass.
    pub fn resync(&mut self) -> Result<()> {
        match self.replication_state {
            ReplicationState::Failed | ReplicationState::Synced => {
                self.replication_state = ReplicationState::Pending;
                self.retry_count = 0;
                self.retry_at = None;
                Ok(())
            }
            other => Err(ReplicationError::invalid_transition(other.as_str(), "pending")),
        }
    }

    /// `synced -> pending`: the upstream resource changed after sync, so the
    /// copy is stale. Verification state is re-pended and the stale digest
    /// discarded. The mismatch flag, if set, survives.
    pub fn mark_updated(&mut self) -> Result<()> {
        if self.replication_state != ReplicationState::Synced {
            return Err(ReplicationError::invalid_transition(
                self.replication_state.as_str(),
                "pending",
            ));
        }

        self.replication_state = ReplicationState::Pending;
        self.retry_count = 0;
        self.retry_at = None;
        self.verification_state = VerificationState::Pending;
        self.verification_checksum = None;
        self.verification_failure = None;
        self.verification_retry_count = 0;
        self.verification_retry_at = None;
        self.verification_started_at = None;
        Ok(())
    }

    /// Whether a scheduling pass should emit this row as sync work.
    pub fn sync_due(&self, now: DateTime<Utc>, max_retry_count: u32) -> bool {
        match self.replication_state {
            ReplicationState::Pending => true,
            ReplicationState::Failed => {
                self.retry_count < max_retry_count
                    && self.retry_at.map(|at| at <= now).unwrap_or(true)
            }
            ReplicationState::Started | ReplicationState::Synced => false,
        }
    }

    // =========================================================================
    // Verification axis
    // =========================================================================

    /// `pending | disabled | failed -> started`, only while the replication
    /// axis is `synced`. Must be called under the verify lease.
    pub fn start_verification(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.replication_state != ReplicationState::Synced {
            return Err(ReplicationError::invalid_transition(
                format!("verification while {}", self.replication_state),
                "verification started",
            ));
        }

        match self.verification_state {
            VerificationState::Pending
            | VerificationState::Disabled
            | VerificationState::Failed => {
                self.verification_state = VerificationState::Started;
                self.verification_started_at = Some(now);
                Ok(())
            }
            other => Err(ReplicationError::invalid_transition(
                other.as_str(),
                "verification started",
            )),
        }
    }

    /// `started -> succeeded`, recording the replica digest.
    ///
    /// Matching digests clear any prior mismatch flag. Differing digests set
    /// the sticky flag and flip the replication axis `synced -> pending` so
    /// the divergence is corrected rather than left silently in place.
    pub fn finish_verification(
        &mut self,
        replica: Checksum,
        primary: &Checksum,
        now: DateTime<Utc>,
    ) -> Result<VerificationOutcome> {
        if self.verification_state != VerificationState::Started {
            return Err(ReplicationError::invalid_transition(
                self.verification_state.as_str(),
                "verification succeeded",
            ));
        }

        let matched = replica == *primary;

        self.verification_state = VerificationState::Succeeded;
        self.verification_checksum = Some(replica);
        self.verification_failure = None;
        self.verification_retry_count = 0;
        self.verification_retry_at = None;
        self.verified_at = Some(now);

        if matched {
            self.checksum_mismatch = false;
            Ok(VerificationOutcome::Match)
        } else {
            self.checksum_mismatch = true;
            if self.replication_state == ReplicationState::Synced {
                self.replication_state = ReplicationState::Pending;
                self.retry_count = 0;
                self.retry_at = None;
            }
            Ok(VerificationOutcome::Mismatch)
        }
    }

    /// `started -> failed` on a checksum computation error (distinct from a
    /// mismatch). Bounded by its own retry count and backoff gate.
    pub fn fail_verification(
        &mut self,
        reason: impl Into<String>,
        backoff: &Backoff,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if self.verification_state != VerificationState::Started {
            return Err(ReplicationError::invalid_transition(
                self.verification_state.as_str(),
                "verification failed",
            ));
        }

        self.verification_state = VerificationState::Failed;
        self.verification_retry_count += 1;
        self.verification_retry_at =
            Some(backoff.next_retry_time(self.verification_retry_count, now));
        self.verification_failure = Some(truncate(reason.into(), 255));
        self.verification_checksum = None;
        Ok(())
    }

    /// `succeeded -> pending`: manual or periodic reverification request.
    /// The recorded digest is discarded; it is about to be recomputed.
    pub fn reverify(&mut self) -> Result<()> {
        if self.verification_state != VerificationState::Succeeded {
            return Err(ReplicationError::invalid_transition(
                self.verification_state.as_str(),
                "verification pending",
            ));
        }
        self.verification_state = VerificationState::Pending;
        self.verification_checksum = None;
        self.verification_retry_count = 0;
        self.verification_retry_at = None;
        Ok(())
    }

    /// Whether a scheduling pass should emit this row as verification work.
    ///
    /// `reverification_interval` re-queues rows whose last successful
    /// verification has gone stale.
    pub fn verification_due(
        &self,
        now: DateTime<Utc>,
        max_retry_count: u32,
        reverification_interval: ChronoDuration,
    ) -> bool {
        if self.replication_state != ReplicationState::Synced {
            return false;
        }

        match self.verification_state {
            VerificationState::Pending => true,
            VerificationState::Failed => {
                self.verification_retry_count < max_retry_count
                    && self.verification_retry_at.map(|at| at <= now).unwrap_or(true)
            }
            VerificationState::Succeeded => self
                .verified_at
                .map(|at| now - at >= reverification_interval)
                .unwrap_or(false),
            VerificationState::Started | VerificationState::Disabled => false,
        }
    }
}

fn truncate(mut message: String, limit: usize) -> String {
    if message.len() > limit {
        let mut end = limit;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        message.truncate(end);
    }
    message
}

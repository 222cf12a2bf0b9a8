//! The verification engine: drives synced rows through
//! `verification pending -> started -> (succeeded | failed)`.
//!
//! `process` recomputes the replica's digest, compares it with the primary's,
//! and applies the outcome:
//!
//! - equal digests: verified, any prior mismatch flag cleared;
//! - differing digests: a consistency violation — the sticky mismatch flag is
//!   set, a violation event is logged and counted, and the row's replication
//!   axis flips back to `pending` so the divergence gets corrected rather
//!   than left silently in place;
//! - computation error: verification `failed`, retried with its own bounded
//!   counter and backoff.

use crate::config::{EngineSettings, SiteConfig, VerificationSettings};
use crate::engine::types::VerifyOutcome;
use crate::error::Result;
use crate::lease::{LeaseKey, LeaseOperation, LeaseStore};
use crate::metrics;
use crate::registry::{Registry, VerificationOutcome, VerificationState};
use crate::replicable::{AdapterRegistry, Replicable};
use crate::resilience::Backoff;
use crate::store::RegistryStore;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub struct VerificationEngine {
    store: Arc<RegistryStore>,
    adapters: Arc<AdapterRegistry>,
    leases: Arc<dyn LeaseStore>,
    settings: VerificationSettings,
    enabled: bool,
    lease_ttl: Duration,
    backoff: Backoff,
}

impl VerificationEngine {
    pub fn new(
        store: Arc<RegistryStore>,
        adapters: Arc<AdapterRegistry>,
        leases: Arc<dyn LeaseStore>,
        settings: &EngineSettings,
    ) -> Self {
        Self {
            store,
            adapters,
            leases,
            settings: settings.verification.clone(),
            enabled: settings.checks.verification_enabled,
            lease_ttl: settings.lease.ttl(),
            backoff: Backoff::for_verification(&settings.verification),
        }
    }

    /// One verification scheduling pass over `site`: synced rows never
    /// verified, failed-and-retry-due, or verified too long ago.
    pub async fn schedule(&self, site: &SiteConfig) -> Result<Vec<Registry>> {
        if !self.enabled {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let reverify_before = now - self.settings.reverification_interval();
        let work = self
            .store
            .verification_batch(
                &site.site_id,
                now,
                self.settings.max_retry_count,
                reverify_before,
                self.settings.batch_size,
            )
            .await?;

        debug!(site_id = %site.site_id, enqueued = work.len(),
               "Verification scheduling pass complete");
        Ok(work)
    }

    /// Verify one registry's copy under the verify lease.
    pub async fn process(&self, registry: Registry) -> Result<VerifyOutcome> {
        let adapter = Arc::clone(self.adapters.get(&registry.resource_type)?);

        let key = LeaseKey::new(
            &registry.resource_type,
            &registry.resource_id,
            &registry.site_id,
            LeaseOperation::Verify,
        );
        let Some(token) = self.leases.acquire(&key, self.lease_ttl).await? else {
            metrics::record_lease_busy(LeaseOperation::Verify.as_str());
            return Ok(VerifyOutcome::LeaseBusy);
        };

        let outcome = self.process_under_lease(adapter.as_ref(), &registry).await;

        if let Err(e) = self.leases.release(&key, &token).await {
            warn!(key = %key.storage_key(), error = %e, "Lease release failed");
        }

        outcome
    }

    async fn process_under_lease(
        &self,
        adapter: &dyn Replicable,
        registry: &Registry,
    ) -> Result<VerifyOutcome> {
        let Some(mut row) = self
            .store
            .get(&registry.resource_type, &registry.resource_id, &registry.site_id)
            .await?
        else {
            return Ok(VerifyOutcome::Skipped);
        };

        let now = Utc::now();
        if !row.verification_due(now, self.settings.max_retry_count, self.settings.reverification_interval())
        {
            return Ok(VerifyOutcome::Skipped);
        }

        // A stale succeeded row re-enters through pending (reverification).
        if row.verification_state == VerificationState::Succeeded {
            row.reverify()?;
        }
        row.start_verification(now)?;
        self.store.save(&row).await?;

        let started = Instant::now();
        let (replica, primary) = tokio::join!(
            adapter.replica_checksum(&row.resource_id, &row.site_id),
            adapter.checksum(&row.resource_id),
        );

        let (replica, primary) = match (replica, primary) {
            (Ok(replica), Ok(primary)) => (replica, primary),
            (Err(e), _) | (_, Err(e)) => {
                row.fail_verification(e.to_string(), &self.backoff, Utc::now())?;
                self.store.save(&row).await?;

                metrics::record_verification(&row.resource_type, &row.site_id, false);
                warn!(registry = %row.describe(),
                      retry_count = row.verification_retry_count,
                      error = %e, "Verification failed");
                return Ok(VerifyOutcome::Failed);
            }
        };

        let outcome = row.finish_verification(replica, &primary, Utc::now())?;
        self.store.save(&row).await?;

        metrics::record_verification(&row.resource_type, &row.site_id, true);
        metrics::record_verification_duration(&row.resource_type, &row.site_id, started.elapsed());

        match outcome {
            VerificationOutcome::Match => {
                info!(registry = %row.describe(), "Checksum verified");
                Ok(VerifyOutcome::Verified)
            }
            VerificationOutcome::Mismatch => {
                metrics::record_checksum_mismatch(&row.resource_type, &row.site_id);
                warn!(registry = %row.describe(),
                      primary_checksum = %primary,
                      replica_checksum = %row.verification_checksum.as_ref().map(|c| c.as_str()).unwrap_or(""),
                      "Consistency violation: replica diverged from primary, re-queued for sync");
                Ok(VerifyOutcome::Mismatch)
            }
        }
    }
}

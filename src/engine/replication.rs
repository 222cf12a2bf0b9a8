//! The replication engine: drives registry rows through
//! `pending -> started -> (synced | failed)`.
//!
//! `schedule` reconciles the registry table with the adapters' current view
//! of the primary (create, invalidate, prune) and emits work items.
//! `process` performs one transfer under the replicate lease.
//!
//! Everything here is at-least-once: a lease can expire mid-transfer and the
//! row will be picked up again, so `process` re-fetches the row under the
//! lease and re-checks eligibility before touching it. Adapter errors never
//! escape as errors — they become `failed` rows with a recorded reason, and
//! the scheduler keeps making progress on other rows.

use crate::config::{ChecksConfig, EngineSettings, ReplicationSettings, SiteConfig};
use crate::engine::types::{SchedulePassStats, SyncOutcome};
use crate::error::Result;
use crate::lease::{LeaseKey, LeaseOperation, LeaseStore};
use crate::metrics;
use crate::registry::Registry;
use crate::replicable::{AdapterRegistry, Replicable};
use crate::resilience::{Backoff, RateLimitConfig, RateLimiter};
use crate::scope::SelectiveSync;
use crate::store::RegistryStore;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub struct ReplicationEngine {
    store: Arc<RegistryStore>,
    adapters: Arc<AdapterRegistry>,
    leases: Arc<dyn LeaseStore>,
    settings: ReplicationSettings,
    checks: ChecksConfig,
    lease_ttl: Duration,
    backoff: Backoff,
    resolver: SelectiveSync,
    pacer: RateLimiter,
}

impl ReplicationEngine {
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
            settings: settings.replication.clone(),
            checks: settings.checks.clone(),
            lease_ttl: settings.lease.ttl(),
            backoff: Backoff::for_sync(&settings.replication),
            resolver: SelectiveSync::new(settings.checks.clone()),
            pacer: RateLimiter::new(RateLimitConfig::default()),
        }
    }

    /// Override the fetch pacing (tests, constrained deployments).
    pub fn with_pacer(mut self, config: RateLimitConfig) -> Self {
        self.pacer = RateLimiter::new(config);
        self
    }

    /// One scheduling pass over `site`.
    ///
    /// Reconciles rows against each adapter's enumeration, then returns the
    /// batch of work items (`pending` plus backoff-due `failed` rows).
    pub async fn schedule(&self, site: &SiteConfig) -> Result<(SchedulePassStats, Vec<Registry>)> {
        let mut stats = SchedulePassStats::default();
        let now = Utc::now();

        for adapter in self.adapters.adapters() {
            let name = adapter.replicable_name();

            let descriptors = match adapter.resources().await {
                Ok(descriptors) => descriptors,
                Err(e) => {
                    // Keep making progress on the other resource types.
                    warn!(resource_type = name, site_id = %site.site_id, error = %e,
                          "Adapter enumeration failed, skipping this pass");
                    continue;
                }
            };

            let existing = self.store.registries_for_site(&site.site_id, name).await?;
            let existing_by_id: HashMap<&str, &Registry> = existing
                .iter()
                .map(|r| (r.resource_id.as_str(), r))
                .collect();

            let mut in_scope: HashSet<&str> = HashSet::with_capacity(descriptors.len());

            for descriptor in &descriptors {
                if !self.resolver.in_scope(descriptor, site) {
                    continue;
                }
                in_scope.insert(descriptor.resource_id.as_str());

                match existing_by_id.get(descriptor.resource_id.as_str()) {
                    None => {
                        let row =
                            Registry::new(name, &descriptor.resource_id, &site.site_id, now);
                        if self.store.create_pending(&row).await? {
                            metrics::record_registry_created(name, &site.site_id);
                            stats.created += 1;
                        }
                    }
                    Some(row) => {
                        // A content change after sync invalidates the copy.
                        let stale = matches!(
                            (descriptor.updated_at, row.last_successful_sync_at),
                            (Some(updated), Some(synced)) if updated > synced
                        );
                        if stale && row.replication_state == crate::registry::ReplicationState::Synced
                        {
                            let mut row = (*row).clone();
                            row.mark_updated()?;
                            self.store.save(&row).await?;
                            stats.invalidated += 1;
                            debug!(registry = %row.describe(), "Upstream changed, re-queued for sync");
                        }
                    }
                }
            }

            // Out-of-scope resources must not retain stale rows.
            let mut pruned = 0;
            for row in &existing {
                if !in_scope.contains(row.resource_id.as_str()) {
                    self.store
                        .delete(&row.resource_type, &row.resource_id, &row.site_id)
                        .await?;
                    pruned += 1;
                }
            }
            if pruned > 0 {
                metrics::record_registry_pruned(name, &site.site_id, pruned);
                stats.pruned += pruned;
            }
        }

        let work = self
            .store
            .sync_batch(&site.site_id, now, self.settings.max_retry_count, self.settings.batch_size)
            .await?;
        stats.enqueued = work.len() as u64;

        metrics::record_schedule_pass(
            &site.site_id,
            stats.created,
            stats.enqueued,
            stats.pruned,
            stats.invalidated,
        );
        debug!(site_id = %site.site_id, ?stats, "Replication scheduling pass complete");

        Ok((stats, work))
    }

    /// Transfer one registry's resource under the replicate lease.
    pub async fn process(&self, registry: Registry) -> Result<SyncOutcome> {
        let adapter = Arc::clone(self.adapters.get(&registry.resource_type)?);

        let key = LeaseKey::new(
            &registry.resource_type,
            &registry.resource_id,
            &registry.site_id,
            LeaseOperation::Replicate,
        );
        let Some(token) = self.leases.acquire(&key, self.lease_ttl).await? else {
            metrics::record_lease_busy(LeaseOperation::Replicate.as_str());
            return Ok(SyncOutcome::LeaseBusy);
        };

        let outcome = self.process_under_lease(adapter.as_ref(), &registry).await;

        if let Err(e) = self.leases.release(&key, &token).await {
            // Harmless: the lease expires on its own.
            warn!(key = %key.storage_key(), error = %e, "Lease release failed");
        }

        outcome
    }

    async fn process_under_lease(
        &self,
        adapter: &dyn Replicable,
        registry: &Registry,
    ) -> Result<SyncOutcome> {
        // Re-fetch under the lease: another worker may have finished this row
        // while we queued, or a scheduling pass may have pruned it.
        let Some(mut row) = self
            .store
            .get(&registry.resource_type, &registry.resource_id, &registry.site_id)
            .await?
        else {
            return Ok(SyncOutcome::Skipped);
        };

        let now = Utc::now();
        if !row.sync_due(now, self.settings.max_retry_count) {
            return Ok(SyncOutcome::Skipped);
        }

        row.start_sync(now)?;
        self.store.save(&row).await?;

        self.pacer.acquire().await;
        let started = Instant::now();

        match adapter.fetch(&row.resource_id, &row.site_id).await {
            Ok(fetched) => {
                let wants_verification = self.checks.verification_enabled
                    && match adapter.needs_verification(&row.resource_id).await {
                        Ok(wants) => wants,
                        Err(e) => {
                            warn!(registry = %row.describe(), error = %e,
                                  "needs_verification failed, defaulting to verify");
                            true
                        }
                    };

                row.finish_sync(wants_verification, Utc::now())?;
                self.store.save(&row).await?;

                metrics::record_sync(&row.resource_type, &row.site_id, true);
                metrics::record_sync_duration(&row.resource_type, &row.site_id, started.elapsed());
                metrics::record_sync_bytes(&row.resource_type, &row.site_id, fetched.bytes_transferred);
                info!(registry = %row.describe(), checksum = %fetched.checksum,
                      bytes = fetched.bytes_transferred, "Resource synced");

                Ok(SyncOutcome::Synced)
            }
            Err(e) => {
                row.fail_sync(e.to_string(), &self.backoff, Utc::now())?;
                self.store.save(&row).await?;

                metrics::record_sync(&row.resource_type, &row.site_id, false);
                warn!(registry = %row.describe(), retry_count = row.retry_count,
                      error = %e, "Sync failed");

                Ok(SyncOutcome::Failed)
            }
        }
    }
}

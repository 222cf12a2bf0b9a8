// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine coordination.
//!
//! The [`SyncCoordinator`] ties together:
//! - Registry persistence via [`crate::store::RegistryStore`]
//! - Adapter lookup via [`crate::replicable::AdapterRegistry`]
//! - Mutual exclusion via [`crate::lease::LeaseStore`]
//! - The [`ReplicationEngine`] and [`VerificationEngine`]
//!
//! # Architecture
//!
//! This is a batch/poll-driven, eventually-consistent system. Each pass:
//! 1. Sweeps rows stuck in `started` past the timeout (crashed workers)
//! 2. Runs a replication scheduling pass per site and processes the batch,
//!    bounded by the site's sync capacity
//! 3. Runs a verification scheduling pass per site and processes the batch,
//!    bounded by the site's verification capacity
//!
//! No operation is synchronous across sites, and no ordering is guaranteed
//! across different resources. Ordering *within* one registry's lifecycle is
//! enforced by the monotonic state machine plus the per-operation lease.

mod replication;
mod types;
mod verification;

pub use replication::ReplicationEngine;
pub use types::{EngineState, SchedulePassStats, SyncOutcome, VerifyOutcome};
pub use verification::VerificationEngine;

use crate::config::{EngineConfig, SiteConfig};
use crate::error::{ReplicationError, Result};
use crate::lease::LeaseStore;
use crate::metrics;
use crate::registry::Registry;
use crate::replicable::AdapterRegistry;
use crate::resilience::Bulkhead;
use crate::store::RegistryStore;
use chrono::{Duration as ChronoDuration, Utc};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// The top-level coordinator: owns both engines and runs the poll loop.
pub struct SyncCoordinator {
    config: EngineConfig,
    store: Arc<RegistryStore>,
    replication: ReplicationEngine,
    verification: VerificationEngine,

    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl SyncCoordinator {
    /// Wire up the engines.
    ///
    /// Fails fast on an empty adapter registry — an engine with nothing to
    /// replicate is a deployment mistake, not a valid idle state.
    pub fn new(
        config: EngineConfig,
        store: Arc<RegistryStore>,
        adapters: AdapterRegistry,
        leases: Arc<dyn LeaseStore>,
    ) -> Result<Self> {
        if adapters.is_empty() {
            return Err(ReplicationError::Config("no replicable adapters registered".into()));
        }

        let adapters = Arc::new(adapters);
        let replication = ReplicationEngine::new(
            Arc::clone(&store),
            Arc::clone(&adapters),
            Arc::clone(&leases),
            &config.settings,
        );
        let verification = VerificationEngine::new(
            Arc::clone(&store),
            Arc::clone(&adapters),
            leases,
            &config.settings,
        );

        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            config,
            store,
            replication,
            verification,
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Subscribe to lifecycle changes.
    pub fn watch_state(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    pub fn replication(&self) -> &ReplicationEngine {
        &self.replication
    }

    pub fn verification(&self) -> &VerificationEngine {
        &self.verification
    }

    pub fn store(&self) -> &Arc<RegistryStore> {
        &self.store
    }

    /// One full pass: timeout sweeps, then replication and verification over
    /// every configured site.
    pub async fn run_once(&self) -> Result<()> {
        self.sweep_timeouts().await?;

        for site in &self.config.sites {
            self.run_site_pass(site).await?;
        }
        Ok(())
    }

    async fn run_site_pass(&self, site: &SiteConfig) -> Result<()> {
        let (stats, work) = self.replication.schedule(site).await?;
        if stats.created > 0 || stats.pruned > 0 || stats.invalidated > 0 {
            info!(site_id = %site.site_id, created = stats.created, pruned = stats.pruned,
                  invalidated = stats.invalidated, "Registry reconciled");
        }

        self.drain_sync_batch(site, work).await;

        let work = self.verification.schedule(site).await?;
        self.drain_verification_batch(site, work).await;

        Ok(())
    }

    /// Process a sync batch, bounded by the site's sync capacity.
    async fn drain_sync_batch(&self, site: &SiteConfig, work: Vec<Registry>) {
        let bulkhead = Bulkhead::new(site.sync_max_capacity);
        futures::stream::iter(work)
            .for_each_concurrent(None, |item| {
                let bulkhead = &bulkhead;
                async move {
                    let _permit = bulkhead.acquire().await;
                    let describe = item.describe();
                    if let Err(e) = self.replication.process(item).await {
                        // Engine-level failures (store down, unknown type);
                        // adapter errors were already absorbed into the row.
                        error!(registry = %describe, error = %e, "Sync processing error");
                    }
                }
            })
            .await;
    }

    /// Process a verification batch, bounded by the site's verification
    /// capacity.
    async fn drain_verification_batch(&self, site: &SiteConfig, work: Vec<Registry>) {
        let bulkhead = Bulkhead::new(site.verification_max_capacity);
        futures::stream::iter(work)
            .for_each_concurrent(None, |item| {
                let bulkhead = &bulkhead;
                async move {
                    let _permit = bulkhead.acquire().await;
                    let describe = item.describe();
                    if let Err(e) = self.verification.process(item).await {
                        error!(registry = %describe, error = %e, "Verification processing error");
                    }
                }
            })
            .await;
    }

    /// Fail rows stuck in `started` past the configured timeouts. Catches
    /// workers that crashed after their lease expired.
    async fn sweep_timeouts(&self) -> Result<()> {
        let now = Utc::now();

        let sync_timeout = ChronoDuration::from_std(self.config.settings.replication.started_timeout())
            .unwrap_or_else(|_| ChronoDuration::hours(8));
        let swept = self.store.fail_sync_timeouts(now - sync_timeout, now).await?;
        metrics::record_timeout_sweep("sync", swept);
        if swept > 0 {
            warn!(count = swept, "Failed syncs stuck in started state");
        }

        let verification_timeout =
            ChronoDuration::from_std(self.config.settings.verification.started_timeout())
                .unwrap_or_else(|_| ChronoDuration::hours(8));
        let swept = self
            .store
            .fail_verification_timeouts(now - verification_timeout, now)
            .await?;
        metrics::record_timeout_sweep("verification", swept);
        if swept > 0 {
            warn!(count = swept, "Failed verifications stuck in started state");
        }

        Ok(())
    }

    /// Run scheduling passes until [`shutdown()`](Self::shutdown) is called.
    ///
    /// A failing pass is logged and the loop keeps going; only shutdown
    /// stops it.
    pub async fn run(&self) -> Result<()> {
        self.state_tx.send_replace(EngineState::Running);
        info!(sites = self.config.sites.len(),
              poll_interval_sec = self.config.settings.poll_interval_sec,
              "Coordinator running");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut interval = tokio::time::interval(self.config.settings.poll_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "Scheduling pass failed");
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        self.state_tx.send_replace(EngineState::Stopped);
        info!("Coordinator stopped");
        Ok(())
    }

    /// Spawn [`run()`](Self::run) on the current runtime.
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<Result<()>> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run().await })
    }

    /// Request shutdown. The current pass drains; `run()` then returns.
    pub fn shutdown(&self) {
        self.state_tx.send_replace(EngineState::ShuttingDown);
        self.shutdown_tx.send_replace(true);
    }
}

//! Shared test utilities for integration tests.
//!
//! This module provides:
//! - A programmable mock `Replicable` adapter backed by an in-memory
//!   primary/replica world
//! - A harness wiring store + adapters + leases + engines together

pub mod mock;

pub use mock::*;

use replication_registry::config::EngineConfig;
use replication_registry::engine::{ReplicationEngine, VerificationEngine};
use replication_registry::lease::InMemoryLeaseStore;
use replication_registry::replicable::AdapterRegistry;
use replication_registry::store::RegistryStore;
use std::sync::Arc;

/// Everything an integration test needs, wired with an in-memory store and
/// lease store.
pub struct Harness {
    pub store: Arc<RegistryStore>,
    pub leases: Arc<InMemoryLeaseStore>,
    pub adapter: Arc<MockReplicable>,
    pub replication: ReplicationEngine,
    pub verification: VerificationEngine,
}

/// Install a fmt subscriber once, honoring `RUST_LOG`. Safe to call from
/// every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

impl Harness {
    pub async fn new(config: &EngineConfig) -> Self {
        Self::with_adapter(config, Arc::new(MockReplicable::new("upload"))).await
    }

    pub async fn with_adapter(config: &EngineConfig, adapter: Arc<MockReplicable>) -> Self {
        init_tracing();
        let store = Arc::new(RegistryStore::in_memory().await.unwrap());
        let leases = Arc::new(InMemoryLeaseStore::new());

        let mut adapters = AdapterRegistry::new();
        adapters
            .register(Arc::clone(&adapter) as Arc<dyn replication_registry::Replicable>)
            .unwrap();
        let adapters = Arc::new(adapters);

        let replication = ReplicationEngine::new(
            Arc::clone(&store),
            Arc::clone(&adapters),
            Arc::clone(&leases) as Arc<dyn replication_registry::LeaseStore>,
            &config.settings,
        );
        let verification = VerificationEngine::new(
            Arc::clone(&store),
            adapters,
            Arc::clone(&leases) as Arc<dyn replication_registry::LeaseStore>,
            &config.settings,
        );

        Self {
            store,
            leases,
            adapter,
            replication,
            verification,
        }
    }
}

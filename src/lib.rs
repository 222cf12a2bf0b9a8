//! # Replication Registry
//!
//! A registry-driven engine for replicating resources (database-backed
//! records and their blobs) from a primary site to geographically remote
//! secondary sites, and continuously verifying that the copies are
//! byte-identical — without a shared storage layer or synchronous
//! transactions.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          replication-registry                           │
//! │                                                                         │
//! │  ┌───────────────┐   ┌─────────────────────┐   ┌─────────────────────┐  │
//! │  │ SyncCoordinator│──►│ ReplicationEngine   │──►│ Replicable adapters │  │
//! │  │ (poll loop)   │   │ schedule + process  │   │ (per resource type) │  │
//! │  └───────┬───────┘   └──────────┬──────────┘   └─────────────────────┘  │
//! │          │                      │                         ▲             │
//! │          │           ┌──────────▼──────────┐              │             │
//! │          └──────────►│ VerificationEngine  │──────────────┘             │
//! │                      │ checksum comparison │                            │
//! │                      └──────────┬──────────┘                            │
//! │   ┌──────────────┐   ┌──────────▼──────────┐   ┌───────────────────┐    │
//! │   │ LeaseStore   │   │ RegistryStore       │   │ SelectiveSync     │    │
//! │   │ (Redis TTL)  │   │ (SQLite)            │   │ (pure resolver)   │    │
//! │   └──────────────┘   └─────────────────────┘   └───────────────────┘    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## How it works
//!
//! Each registry row tracks one (resource, secondary site) pair on two axes:
//! replication (`pending → started → synced | failed`) and verification
//! (`pending → started → succeeded | failed`, gated on `synced`). A
//! scheduling pass enumerates in-scope resources per site, creates missing
//! rows, prunes out-of-scope ones, and emits work; workers advance rows under
//! an advisory TTL lease, so many processes can drain the same registry
//! without duplicating transfers. Checksum mismatches are recorded with a
//! sticky flag and automatically re-queued for sync.
//!
//! This is an eventually-consistent batch system: replication is
//! primary→secondary only, and the only cancellation signal is a lease
//! expiring.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use replication_registry::{
//!     AdapterRegistry, EngineConfig, InMemoryLeaseStore, RegistryStore, SyncCoordinator,
//! };
//! use std::sync::Arc;
//!
//! # async fn example(my_adapter: Arc<dyn replication_registry::Replicable>) -> replication_registry::Result<()> {
//! let store = Arc::new(RegistryStore::new("registries.db").await?);
//! let mut adapters = AdapterRegistry::new();
//! adapters.register(my_adapter)?;
//!
//! let coordinator = Arc::new(SyncCoordinator::new(
//!     EngineConfig::for_testing("site-frankfurt"),
//!     store,
//!     adapters,
//!     Arc::new(InMemoryLeaseStore::new()),
//! )?);
//!
//! let handle = coordinator.spawn();
//! // ... until shutdown:
//! coordinator.shutdown();
//! # handle.await.unwrap()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod lease;
pub mod metrics;
pub mod query;
pub mod registry;
pub mod replicable;
pub mod resilience;
pub mod scope;
pub mod store;

// Re-exports for convenience
pub use config::{EngineConfig, SelectiveSyncPolicy, SiteConfig};
pub use engine::{
    EngineState, ReplicationEngine, SchedulePassStats, SyncCoordinator, SyncOutcome,
    VerificationEngine, VerifyOutcome,
};
pub use error::{ReplicationError, Result};
pub use lease::{InMemoryLeaseStore, LeaseKey, LeaseOperation, LeaseStore, RedisLeaseStore};
pub use query::{Page, PageCursor, RegistryQuery};
pub use registry::{Registry, ReplicationState, VerificationOutcome, VerificationState};
pub use replicable::{AdapterRegistry, Checksum, FetchOutcome, Replicable};
pub use scope::{ResourceDescriptor, SelectiveSync, StorageLocation};
pub use store::{RegistryStore, StateCounts};

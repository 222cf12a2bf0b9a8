//! Configuration for the registry engine.
//!
//! This module defines all configuration types needed to run the replication
//! and verification engines. Configuration is passed to
//! [`SyncCoordinator::new()`](crate::engine::SyncCoordinator::new) and can be
//! constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use replication_registry::config::{EngineConfig, SiteConfig};
//!
//! let config = EngineConfig {
//!     sites: vec![SiteConfig::for_testing("site-tokyo")],
//!     ..Default::default()
//! };
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! EngineConfig
//! ├── sites: Vec<SiteConfig>        # Secondary sites to replicate to
//! │   ├── site_id
//! │   ├── selective_sync            # Namespace/shard allow-list
//! │   ├── sync_object_storage      # Replicate externally-stored blobs?
//! │   └── *_max_capacity            # Per-site concurrency caps
//! ├── settings: EngineSettings
//! │   ├── replication: ReplicationSettings  # Retry ceiling, backoff, batches
//! │   ├── verification: VerificationSettings
//! │   ├── lease: LeaseSettings      # TTL for the advisory lease
//! │   └── checks: ChecksConfig      # Optional behavior, explicit (no flags)
//! └── registry_db: RegistryDbConfig # SQLite registry persistence
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! sites:
//!   - site_id: "site.eu.frankfurt-1"
//!     sync_object_storage: false
//!     selective_sync:
//!       namespaces: [104, 271]
//!     sync_max_capacity: 25
//!     verification_max_capacity: 100
//!
//! settings:
//!   replication:
//!     max_retry_count: 5
//!   verification:
//!     reverification_interval_days: 7
//!   lease:
//!     ttl_sec: 3600
//!
//! registry_db:
//!   sqlite_path: "/var/lib/app/registries.db"
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config: passed from daemon to SyncCoordinator::new()
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object for the registry engine.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    /// Secondary sites this primary replicates to. One scheduling pass runs
    /// per site; sites never synchronize with each other.
    #[serde(default)]
    pub sites: Vec<SiteConfig>,

    /// Tunable engine parameters (retry ceilings, backoff, batch sizes, TTLs).
    #[serde(default)]
    pub settings: EngineSettings,

    /// Registry persistence settings.
    #[serde(default)]
    pub registry_db: RegistryDbConfig,
}

impl EngineConfig {
    /// Create a minimal config for testing: one unrestricted site, fast
    /// backoff, in-memory registry database.
    pub fn for_testing(site_id: &str) -> Self {
        Self {
            sites: vec![SiteConfig::for_testing(site_id)],
            settings: EngineSettings::for_testing(),
            registry_db: RegistryDbConfig::in_memory(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SiteConfig: one secondary site and its selective-sync scoping
// ═══════════════════════════════════════════════════════════════════════════════

/// A secondary site and its sync scoping rules.
///
/// The selective-sync fields are read on every scheduling pass; changing them
/// at runtime takes effect on the next pass (rows for newly out-of-scope
/// resources are pruned, newly in-scope resources get fresh `pending` rows).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    /// Unique identifier for the site (part of every registry row's key).
    pub site_id: String,

    /// Whether this site replicates resources held in object storage.
    /// When `false`, only resources stored on local disk are in scope.
    #[serde(default)]
    pub sync_object_storage: bool,

    /// Restricts which resources this site replicates.
    #[serde(default)]
    pub selective_sync: SelectiveSyncPolicy,

    /// Maximum concurrent transfers for this site.
    #[serde(default = "default_sync_max_capacity")]
    pub sync_max_capacity: u32,

    /// Maximum concurrent checksum verifications for this site.
    #[serde(default = "default_verification_max_capacity")]
    pub verification_max_capacity: u32,
}

fn default_sync_max_capacity() -> u32 {
    25
}

fn default_verification_max_capacity() -> u32 {
    100
}

impl SiteConfig {
    /// An unrestricted site ("sync everything", including object storage).
    pub fn for_testing(site_id: &str) -> Self {
        Self {
            site_id: site_id.to_string(),
            sync_object_storage: true,
            selective_sync: SelectiveSyncPolicy::Everything,
            sync_max_capacity: default_sync_max_capacity(),
            verification_max_capacity: default_verification_max_capacity(),
        }
    }
}

/// Which resources a site replicates.
///
/// `Everything` is the default. The allow-list variants scope by the
/// resource's owning namespace or by its repository shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SelectiveSyncPolicy {
    /// No restriction: every resource is in scope.
    #[default]
    Everything,
    /// Only resources owned by one of these namespaces.
    Namespaces(Vec<u64>),
    /// Only resources stored on one of these shards.
    Shards(Vec<String>),
}

impl SelectiveSyncPolicy {
    /// Whether this policy restricts anything at all.
    pub fn is_restricted(&self) -> bool {
        !matches!(self, Self::Everything)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// EngineSettings: replication / verification / lease tunables
// ═══════════════════════════════════════════════════════════════════════════════

/// Tunable parameters for the engines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default)]
    pub replication: ReplicationSettings,
    #[serde(default)]
    pub verification: VerificationSettings,
    #[serde(default)]
    pub lease: LeaseSettings,
    #[serde(default)]
    pub checks: ChecksConfig,

    /// Seconds between coordinator scheduling passes.
    #[serde(default = "default_poll_interval_sec")]
    pub poll_interval_sec: u64,
}

fn default_poll_interval_sec() -> u64 {
    60
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            replication: ReplicationSettings::default(),
            verification: VerificationSettings::default(),
            lease: LeaseSettings::default(),
            checks: ChecksConfig::default(),
            poll_interval_sec: default_poll_interval_sec(),
        }
    }
}

impl EngineSettings {
    /// Fast settings for tests: tiny backoff, short timeouts.
    pub fn for_testing() -> Self {
        Self {
            replication: ReplicationSettings::for_testing(),
            verification: VerificationSettings::for_testing(),
            lease: LeaseSettings { ttl_sec: 5 },
            checks: ChecksConfig::default(),
            poll_interval_sec: 1,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_sec)
    }
}

/// Settings for the replication axis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationSettings {
    /// Retry ceiling. A row whose `retry_count` reaches this value stays
    /// `failed` and is excluded from automatic rescheduling until an
    /// operator resync.
    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: u32,

    /// Work items fetched per scheduling pass per site.
    #[serde(default = "default_sync_batch_size")]
    pub batch_size: u32,

    /// Initial backoff after the first failure.
    #[serde(default = "default_backoff_base_sec")]
    pub backoff_base_sec: u64,

    /// Backoff ceiling.
    #[serde(default = "default_backoff_max_sec")]
    pub backoff_max_sec: u64,

    /// Rows stuck in `started` longer than this are failed by the
    /// maintenance sweep (worker crashed after its lease expired).
    #[serde(default = "default_started_timeout_sec")]
    pub started_timeout_sec: u64,
}

fn default_max_retry_count() -> u32 {
    5
}

fn default_sync_batch_size() -> u32 {
    100
}

fn default_backoff_base_sec() -> u64 {
    60
}

fn default_backoff_max_sec() -> u64 {
    3600
}

fn default_started_timeout_sec() -> u64 {
    8 * 60 * 60 // 8 hours
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            max_retry_count: default_max_retry_count(),
            batch_size: default_sync_batch_size(),
            backoff_base_sec: default_backoff_base_sec(),
            backoff_max_sec: default_backoff_max_sec(),
            started_timeout_sec: default_started_timeout_sec(),
        }
    }
}

impl ReplicationSettings {
    pub fn for_testing() -> Self {
        Self {
            max_retry_count: 5,
            batch_size: 100,
            backoff_base_sec: 0,
            backoff_max_sec: 0,
            started_timeout_sec: 60,
        }
    }

    pub fn started_timeout(&self) -> Duration {
        Duration::from_secs(self.started_timeout_sec)
    }
}

/// Settings for the verification axis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationSettings {
    /// Retry ceiling for verification compute errors.
    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: u32,

    /// Rows verified per scheduling pass per site.
    #[serde(default = "default_verification_batch_size")]
    pub batch_size: u32,

    /// Initial backoff after a verification compute error.
    #[serde(default = "default_backoff_base_sec")]
    pub backoff_base_sec: u64,

    /// Backoff ceiling.
    #[serde(default = "default_backoff_max_sec")]
    pub backoff_max_sec: u64,

    /// Rows stuck in verification `started` longer than this are failed by
    /// the maintenance sweep.
    #[serde(default = "default_started_timeout_sec")]
    pub started_timeout_sec: u64,

    /// How long a successful verification remains valid. Rows verified
    /// longer ago than this are re-queued for verification.
    #[serde(default = "default_reverification_interval_days")]
    pub reverification_interval_days: u32,
}

fn default_verification_batch_size() -> u32 {
    10
}

fn default_reverification_interval_days() -> u32 {
    7
}

impl Default for VerificationSettings {
    fn default() -> Self {
        Self {
            max_retry_count: default_max_retry_count(),
            batch_size: default_verification_batch_size(),
            backoff_base_sec: default_backoff_base_sec(),
            backoff_max_sec: default_backoff_max_sec(),
            started_timeout_sec: default_started_timeout_sec(),
            reverification_interval_days: default_reverification_interval_days(),
        }
    }
}

impl VerificationSettings {
    pub fn for_testing() -> Self {
        Self {
            max_retry_count: 5,
            batch_size: 100,
            backoff_base_sec: 0,
            backoff_max_sec: 0,
            started_timeout_sec: 60,
            reverification_interval_days: 7,
        }
    }

    pub fn started_timeout(&self) -> Duration {
        Duration::from_secs(self.started_timeout_sec)
    }

    pub fn reverification_interval(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.reverification_interval_days))
    }
}

/// Settings for the advisory lease.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseSettings {
    /// Lease TTL in seconds. Bounds worst-case staleness after a worker
    /// crash: the lease silently expires and another worker can retry.
    /// Size this to the worst-case single transfer.
    #[serde(default = "default_lease_ttl_sec")]
    pub ttl_sec: u64,
}

fn default_lease_ttl_sec() -> u64 {
    3600
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            ttl_sec: default_lease_ttl_sec(),
        }
    }
}

impl LeaseSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_sec)
    }
}

/// Explicitly enumerated optional checks.
///
/// The source system gated these behind runtime feature flags; here they are
/// plain configuration fixed at engine construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecksConfig {
    /// Apply the namespace/shard allow-lists. When `false`, only the
    /// object-storage policy scopes resources.
    #[serde(default = "default_true")]
    pub selective_sync_enabled: bool,

    /// Run the verification engine at all. When `false`, rows finish sync
    /// with verification `disabled`.
    #[serde(default = "default_true")]
    pub verification_enabled: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ChecksConfig {
    fn default() -> Self {
        Self {
            selective_sync_enabled: true,
            verification_enabled: true,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RegistryDbConfig: SQLite persistence
// ═══════════════════════════════════════════════════════════════════════════════

/// Registry persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryDbConfig {
    /// Path to the SQLite database file. `None` means in-memory (tests and
    /// ephemeral deployments; registry state is lost on restart and rebuilt
    /// by the next scheduling pass).
    #[serde(default)]
    pub sqlite_path: Option<String>,
}

impl Default for RegistryDbConfig {
    fn default() -> Self {
        Self {
            sqlite_path: Some("registries.db".to_string()),
        }
    }
}

impl RegistryDbConfig {
    pub fn in_memory() -> Self {
        Self { sqlite_path: None }
    }
}

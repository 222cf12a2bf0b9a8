//! Selective sync resolution.
//!
//! Decides whether a resource is in scope for a given secondary site. The
//! decision is pure and side-effect-free, and it is re-evaluated on every
//! scheduling pass — the allow-lists can change at runtime and there is no
//! cached decision inside the registry.
//!
//! Two checks, ANDed:
//!
//! 1. **Allow-list**: a site with no restriction syncs everything; otherwise
//!    the resource's owning namespace (or shard) must appear in the site's
//!    allow-list.
//! 2. **Object storage policy**: a site that does not sync externally-stored
//!    objects only accepts resources stored on local disk.

use crate::config::{ChecksConfig, SelectiveSyncPolicy, SiteConfig};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a resource's payload lives on the primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageLocation {
    /// Stored on the primary's local disk.
    LocalDisk,
    /// Stored in an external object store (S3 etc.).
    ObjectStorage,
}

/// Everything the scheduler needs to know about a resource without loading it.
///
/// Produced by [`Replicable::resources`](crate::replicable::Replicable::resources)
/// on each scheduling pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDescriptor {
    /// Resource-type tag; must match the owning adapter's
    /// [`replicable_name`](crate::replicable::Replicable::replicable_name).
    pub resource_type: String,
    /// Opaque identifier into the owning resource's domain.
    pub resource_id: String,
    /// Owning namespace, if the resource type is namespaced.
    pub namespace_id: Option<u64>,
    /// Repository shard the resource lives on, if sharded.
    pub shard: Option<String>,
    /// Where the payload is stored.
    pub storage: StorageLocation,
    /// Last content change on the primary. Used to invalidate synced copies.
    pub updated_at: Option<DateTime<Utc>>,
}

impl ResourceDescriptor {
    /// A local-disk descriptor with no namespace/shard ownership.
    pub fn new(resource_type: impl Into<String>, resource_id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            namespace_id: None,
            shard: None,
            storage: StorageLocation::LocalDisk,
            updated_at: None,
        }
    }

    pub fn with_namespace(mut self, namespace_id: u64) -> Self {
        self.namespace_id = Some(namespace_id);
        self
    }

    pub fn with_shard(mut self, shard: impl Into<String>) -> Self {
        self.shard = Some(shard.into());
        self
    }

    pub fn with_storage(mut self, storage: StorageLocation) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_updated_at(mut self, updated_at: DateTime<Utc>) -> Self {
        self.updated_at = Some(updated_at);
        self
    }
}

/// The selective sync resolver.
///
/// Holds only the explicit checks configuration; all per-site policy comes in
/// through the [`SiteConfig`] argument so a policy change is picked up on the
/// next pass.
#[derive(Debug, Clone)]
pub struct SelectiveSync {
    checks: ChecksConfig,
}

impl SelectiveSync {
    pub fn new(checks: ChecksConfig) -> Self {
        Self { checks }
    }

    /// Whether `resource` should be replicated to `site`.
    pub fn in_scope(&self, resource: &ResourceDescriptor, site: &SiteConfig) -> bool {
        self.allow_list_permits(resource, site) && self.storage_policy_permits(resource, site)
    }

    fn allow_list_permits(&self, resource: &ResourceDescriptor, site: &SiteConfig) -> bool {
        if !self.checks.selective_sync_enabled {
            return true;
        }

        match &site.selective_sync {
            SelectiveSyncPolicy::Everything => true,
            SelectiveSyncPolicy::Namespaces(ids) => resource
                .namespace_id
                .map(|id| ids.contains(&id))
                // Un-namespaced resources are not excluded by a namespace list.
                .unwrap_or(true),
            SelectiveSyncPolicy::Shards(shards) => resource
                .shard
                .as_ref()
                .map(|s| shards.contains(s))
                .unwrap_or(true),
        }
    }

    fn storage_policy_permits(&self, resource: &ResourceDescriptor, site: &SiteConfig) -> bool {
        match resource.storage {
            StorageLocation::LocalDisk => true,
            StorageLocation::ObjectStorage => site.sync_object_storage,
        }
    }
}

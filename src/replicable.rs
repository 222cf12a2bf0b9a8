//! Replicable adapter traits.
//!
//! Defines the capability interface a concrete resource type (file uploads,
//! pipeline artifacts, container images, ...) implements to participate in
//! cross-site replication. Adapters are composed into the engines via
//! dependency injection: the engines only ever see `Arc<dyn Replicable>`.
//!
//! Adapter lookup is a static map built at startup ([`AdapterRegistry`]),
//! keyed by the resource-type tag. There is no runtime reflection.
//!
//! # Example
//!
//! ```rust,no_run
//! use replication_registry::replicable::{
//!     AdapterFuture, Checksum, FetchOutcome, Replicable,
//! };
//! use replication_registry::scope::ResourceDescriptor;
//!
//! struct UploadAdapter { /* ... */ }
//!
//! impl Replicable for UploadAdapter {
//!     fn replicable_name(&self) -> &'static str {
//!         "upload"
//!     }
//!
//!     fn resources(&self) -> AdapterFuture<'_, Vec<ResourceDescriptor>> {
//!         Box::pin(async { Ok(vec![ResourceDescriptor::new("upload", "1")]) })
//!     }
//!
//!     fn checksum(&self, _resource_id: &str) -> AdapterFuture<'_, Checksum> {
//!         Box::pin(async { Ok(Checksum::digest(b"payload")) })
//!     }
//!
//!     fn fetch(&self, _resource_id: &str, _site_id: &str) -> AdapterFuture<'_, FetchOutcome> {
//!         Box::pin(async {
//!             Ok(FetchOutcome { checksum: Checksum::digest(b"payload"), bytes_transferred: 7 })
//!         })
//!     }
//!
//!     fn replica_checksum(&self, _resource_id: &str, _site_id: &str) -> AdapterFuture<'_, Checksum> {
//!         Box::pin(async { Ok(Checksum::digest(b"payload")) })
//!     }
//! }
//! ```

use crate::error::{ReplicationError, Result};
use crate::scope::ResourceDescriptor;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Type alias for boxed async adapter futures (reduces trait signature
/// complexity).
pub type AdapterFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// A SHA-256 digest, rendered as lowercase hex.
///
/// Compared byte-for-byte; two copies of a resource are considered identical
/// exactly when their checksums are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Checksum(String);

impl Checksum {
    /// Digest a payload.
    pub fn digest(bytes: &[u8]) -> Self {
        let hash = Sha256::digest(bytes);
        let mut hex = String::with_capacity(hash.len() * 2);
        for byte in hash {
            use fmt::Write;
            // Writing to a String cannot fail.
            let _ = write!(hex, "{:02x}", byte);
        }
        Self(hex)
    }

    /// Wrap an already-computed hex digest (e.g. read back from the store).
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of a completed transfer.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    /// Digest of the copy as written at the secondary, reported by the
    /// adapter at capture time.
    pub checksum: Checksum,
    /// Payload size, for logging and metrics.
    pub bytes_transferred: u64,
}

/// Capability interface for a replicable resource type.
///
/// The engines drive these operations; the adapter owns everything
/// resource-specific (how to enumerate, where payloads live, what transport
/// moves them). `fetch` must be idempotent or internally deduplicated by
/// content hash: the engines provide at-least-once semantics, so a transfer
/// may be re-invoked after a lease expires mid-flight.
pub trait Replicable: Send + Sync + 'static {
    /// The resource-type tag recorded in registry rows.
    fn replicable_name(&self) -> &'static str;

    /// Enumerate the current resources of this type on the primary.
    ///
    /// Called once per scheduling pass. Descriptors carry the ownership and
    /// storage facts selective sync needs, plus `updated_at` so the engine
    /// can invalidate stale synced copies.
    fn resources(&self) -> AdapterFuture<'_, Vec<ResourceDescriptor>>;

    /// Digest of the primary copy.
    fn checksum(&self, resource_id: &str) -> AdapterFuture<'_, Checksum>;

    /// Transfer the resource to `site_id` and report the digest of the
    /// transferred copy.
    fn fetch(&self, resource_id: &str, site_id: &str) -> AdapterFuture<'_, FetchOutcome>;

    /// Digest of the copy currently held at `site_id`, recomputed from the
    /// stored bytes. The verification engine compares this against
    /// [`checksum`](Self::checksum).
    fn replica_checksum(&self, resource_id: &str, site_id: &str) -> AdapterFuture<'_, Checksum>;

    /// Whether this resource should be verified after sync.
    ///
    /// Defaults to `true`. Return `false` for resources whose checksum
    /// cannot be computed (verification is marked `disabled` on the row).
    fn needs_verification(&self, _resource_id: &str) -> AdapterFuture<'_, bool> {
        Box::pin(async { Ok(true) })
    }
}

impl fmt::Debug for dyn Replicable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Replicable")
            .field("name", &self.replicable_name())
            .finish()
    }
}

/// Static map of resource-type tag to adapter, resolved at startup.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<&'static str, Arc<dyn Replicable>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own `replicable_name`.
    ///
    /// Registering two adapters with the same tag is a configuration error.
    pub fn register(&mut self, adapter: Arc<dyn Replicable>) -> Result<()> {
        let name = adapter.replicable_name();
        if self.adapters.insert(name, adapter).is_some() {
            return Err(ReplicationError::Config(format!(
                "duplicate adapter registered for resource type '{name}'"
            )));
        }
        Ok(())
    }

    /// Look up the adapter owning `resource_type`.
    pub fn get(&self, resource_type: &str) -> Result<&Arc<dyn Replicable>> {
        self.adapters
            .get(resource_type)
            .ok_or_else(|| ReplicationError::UnknownResourceType(resource_type.to_string()))
    }

    /// All registered resource-type tags, in registration-independent order.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.adapters.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// All registered adapters, ordered by tag.
    pub fn adapters(&self) -> Vec<Arc<dyn Replicable>> {
        let mut entries: Vec<_> = self.adapters.iter().collect();
        entries.sort_unstable_by_key(|(name, _)| **name);
        entries.into_iter().map(|(_, a)| Arc::clone(a)).collect()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticAdapter {
        name: &'static str,
        payload: Vec<u8>,
    }

    impl Replicable for StaticAdapter {
        fn replicable_name(&self) -> &'static str {
            self.name
        }

        fn resources(&self) -> AdapterFuture<'_, Vec<ResourceDescriptor>> {
            let name = self.name;
            Box::pin(async move { Ok(vec![ResourceDescriptor::new(name, "1")]) })
        }

        fn checksum(&self, _resource_id: &str) -> AdapterFuture<'_, Checksum> {
            Box::pin(async move { Ok(Checksum::digest(&self.payload)) })
        }

        fn fetch(&self, _resource_id: &str, _site_id: &str) -> AdapterFuture<'_, FetchOutcome> {
            Box::pin(async move {
                Ok(FetchOutcome {
                    checksum: Checksum::digest(&self.payload),
                    bytes_transferred: self.payload.len() as u64,
                })
            })
        }

        fn replica_checksum(
            &self,
            _resource_id: &str,
            _site_id: &str,
        ) -> AdapterFuture<'_, Checksum> {
            Box::pin(async move { Ok(Checksum::digest(&self.payload)) })
        }
    }

    #[test]
    fn test_checksum_digest_is_hex_sha256() {
        let checksum = Checksum::digest(b"hello world");
        // Well-known SHA-256 of "hello world".
        assert_eq!(
            checksum.as_str(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_checksum_equality() {
        assert_eq!(Checksum::digest(b"abc"), Checksum::digest(b"abc"));
        assert_ne!(Checksum::digest(b"abc"), Checksum::digest(b"abd"));
    }

    #[test]
    fn test_checksum_from_hex_roundtrip() {
        let original = Checksum::digest(b"payload");
        let restored = Checksum::from_hex(original.as_str());
        assert_eq!(original, restored);
        assert_eq!(original.to_string(), restored.as_str());
    }

    #[test]
    fn test_registry_register_and_get() {
        let mut registry = AdapterRegistry::new();
        registry
            .register(Arc::new(StaticAdapter { name: "upload", payload: b"x".to_vec() }))
            .unwrap();
        registry
            .register(Arc::new(StaticAdapter { name: "artifact", payload: b"y".to_vec() }))
            .unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names(), vec!["artifact", "upload"]);
        assert!(registry.get("upload").is_ok());
    }

    #[test]
    fn test_registry_unknown_type() {
        let registry = AdapterRegistry::new();
        let err = registry.get("snippet").unwrap_err();
        assert!(matches!(err, ReplicationError::UnknownResourceType(t) if t == "snippet"));
    }

    #[test]
    fn test_registry_rejects_duplicate_tag() {
        let mut registry = AdapterRegistry::new();
        registry
            .register(Arc::new(StaticAdapter { name: "upload", payload: b"x".to_vec() }))
            .unwrap();
        let err = registry
            .register(Arc::new(StaticAdapter { name: "upload", payload: b"y".to_vec() }))
            .unwrap_err();
        assert!(matches!(err, ReplicationError::Config(_)));
    }

    #[tokio::test]
    async fn test_needs_verification_defaults_to_true() {
        let adapter = StaticAdapter { name: "upload", payload: b"x".to_vec() };
        assert!(adapter.needs_verification("1").await.unwrap());
    }

    #[tokio::test]
    async fn test_fetch_reports_digest_of_transferred_copy() {
        let adapter = StaticAdapter { name: "upload", payload: b"payload".to_vec() };
        let outcome = adapter.fetch("1", "site-1").await.unwrap();
        assert_eq!(outcome.checksum, Checksum::digest(b"payload"));
        assert_eq!(outcome.bytes_transferred, 7);
    }
}

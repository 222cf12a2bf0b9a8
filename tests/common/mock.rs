//! Mock `Replicable` adapter for testing.
//!
//! Simulates a primary site and per-site replicas as in-memory payload maps.
//! `fetch` copies the primary payload into the replica map, so checksums
//! computed later really describe what was "transferred". Tests can corrupt a
//! replica to force a mismatch, or program fetch failures to exercise the
//! retry/backoff machinery.

use replication_registry::error::ReplicationError;
use replication_registry::replicable::{AdapterFuture, Checksum, FetchOutcome, Replicable};
use replication_registry::scope::ResourceDescriptor;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

/// A recorded fetch() call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchCall {
    pub resource_id: String,
    pub site_id: String,
}

/// Mock adapter with a programmable primary/replica world.
///
/// # Example
/// ```rust,ignore
/// let adapter = MockReplicable::new("upload");
/// adapter.add_resource(ResourceDescriptor::new("upload", "1"), b"payload").await;
///
/// // ... run engines ...
///
/// assert_eq!(adapter.fetch_count(), 1);
/// ```
pub struct MockReplicable {
    name: &'static str,
    /// Primary world: resource id -> (descriptor, payload)
    primary: RwLock<HashMap<String, (ResourceDescriptor, Vec<u8>)>>,
    /// Replica world: (resource id, site id) -> payload
    replicas: RwLock<HashMap<(String, String), Vec<u8>>>,
    /// Recorded fetch() calls
    fetches: RwLock<Vec<FetchCall>>,
    /// Remaining fetches to fail (usize::MAX = fail forever)
    failing_fetches: AtomicUsize,
    /// Fail replica_checksum() calls (compute error, not mismatch)
    failing_replica_checksums: AtomicUsize,
    /// Artificial fetch latency, to widen race windows in concurrency tests
    fetch_delay_ms: AtomicUsize,
}

impl MockReplicable {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            primary: RwLock::new(HashMap::new()),
            replicas: RwLock::new(HashMap::new()),
            fetches: RwLock::new(Vec::new()),
            failing_fetches: AtomicUsize::new(0),
            failing_replica_checksums: AtomicUsize::new(0),
            fetch_delay_ms: AtomicUsize::new(0),
        }
    }

    // =========================================================================
    // Primary world configuration
    // =========================================================================

    pub async fn add_resource(&self, descriptor: ResourceDescriptor, payload: &[u8]) {
        let mut primary = self.primary.write().await;
        primary.insert(descriptor.resource_id.clone(), (descriptor, payload.to_vec()));
    }

    pub async fn remove_resource(&self, resource_id: &str) {
        self.primary.write().await.remove(resource_id);
    }

    /// Change a resource's payload on the primary (content update).
    pub async fn update_payload(&self, resource_id: &str, payload: &[u8]) {
        if let Some((descriptor, stored)) = self.primary.write().await.get_mut(resource_id) {
            *stored = payload.to_vec();
            descriptor.updated_at = Some(chrono::Utc::now());
        }
    }

    // =========================================================================
    // Failure injection
    // =========================================================================

    /// Fail the next `n` fetch() calls with a transfer error.
    pub fn fail_fetches(&self, n: usize) {
        self.failing_fetches.store(n, Ordering::SeqCst);
    }

    /// Fail every fetch() until reset.
    pub fn fail_all_fetches(&self) {
        self.failing_fetches.store(usize::MAX, Ordering::SeqCst);
    }

    pub fn stop_failing_fetches(&self) {
        self.failing_fetches.store(0, Ordering::SeqCst);
    }

    /// Fail the next `n` replica_checksum() calls (compute error).
    pub fn fail_replica_checksums(&self, n: usize) {
        self.failing_replica_checksums.store(n, Ordering::SeqCst);
    }

    /// Slow fetches down, to widen race windows in concurrency tests.
    pub fn set_fetch_delay(&self, delay: Duration) {
        self.fetch_delay_ms.store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    /// Overwrite a replica's payload, diverging it from the primary.
    pub async fn corrupt_replica(&self, resource_id: &str, site_id: &str, payload: &[u8]) {
        self.replicas
            .write()
            .await
            .insert((resource_id.to_string(), site_id.to_string()), payload.to_vec());
    }

    // =========================================================================
    // Query methods
    // =========================================================================

    #[allow(dead_code)] // Useful for future detailed assertions
    pub async fn fetch_calls(&self) -> Vec<FetchCall> {
        self.fetches.read().await.clone()
    }

    pub async fn fetch_count(&self) -> usize {
        self.fetches.read().await.len()
    }

    pub async fn replica_payload(&self, resource_id: &str, site_id: &str) -> Option<Vec<u8>> {
        self.replicas
            .read()
            .await
            .get(&(resource_id.to_string(), site_id.to_string()))
            .cloned()
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        let remaining = counter.load(Ordering::SeqCst);
        if remaining == 0 {
            return false;
        }
        if remaining != usize::MAX {
            counter.fetch_sub(1, Ordering::SeqCst);
        }
        true
    }
}

impl Replicable for MockReplicable {
    fn replicable_name(&self) -> &'static str {
        self.name
    }

    fn resources(&self) -> AdapterFuture<'_, Vec<ResourceDescriptor>> {
        Box::pin(async {
            let primary = self.primary.read().await;
            let mut descriptors: Vec<_> =
                primary.values().map(|(d, _)| d.clone()).collect();
            descriptors.sort_by(|a, b| a.resource_id.cmp(&b.resource_id));
            Ok(descriptors)
        })
    }

    fn checksum(&self, resource_id: &str) -> AdapterFuture<'_, Checksum> {
        let resource_id = resource_id.to_string();
        Box::pin(async move {
            let primary = self.primary.read().await;
            let (_, payload) = primary.get(&resource_id).ok_or_else(|| {
                ReplicationError::checksum(&resource_id, "resource missing on primary")
            })?;
            Ok(Checksum::digest(payload))
        })
    }

    fn fetch(&self, resource_id: &str, site_id: &str) -> AdapterFuture<'_, FetchOutcome> {
        let resource_id = resource_id.to_string();
        let site_id = site_id.to_string();
        Box::pin(async move {
            self.fetches.write().await.push(FetchCall {
                resource_id: resource_id.clone(),
                site_id: site_id.clone(),
            });

            let delay = self.fetch_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay as u64)).await;
            }

            if Self::take_failure(&self.failing_fetches) {
                return Err(ReplicationError::transfer(&resource_id, "simulated transfer failure"));
            }

            let payload = {
                let primary = self.primary.read().await;
                let (_, payload) = primary.get(&resource_id).ok_or_else(|| {
                    ReplicationError::transfer(&resource_id, "resource missing on primary")
                })?;
                payload.clone()
            };

            let checksum = Checksum::digest(&payload);
            let bytes = payload.len() as u64;
            self.replicas.write().await.insert((resource_id, site_id), payload);

            Ok(FetchOutcome { checksum, bytes_transferred: bytes })
        })
    }

    fn replica_checksum(&self, resource_id: &str, site_id: &str) -> AdapterFuture<'_, Checksum> {
        let resource_id = resource_id.to_string();
        let site_id = site_id.to_string();
        Box::pin(async move {
            if Self::take_failure(&self.failing_replica_checksums) {
                return Err(ReplicationError::checksum(&resource_id, "simulated read failure"));
            }

            let replicas = self.replicas.read().await;
            let payload = replicas.get(&(resource_id.clone(), site_id)).ok_or_else(|| {
                ReplicationError::checksum(&resource_id, "no replica at site")
            })?;
            Ok(Checksum::digest(payload))
        })
    }
}

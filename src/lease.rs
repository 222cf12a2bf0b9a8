// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Advisory leases: distributed mutual exclusion per (registry, operation).
//!
//! A lease prevents two workers from replicating (or verifying) the same
//! registry at the same time. It is advisory, not transactional: it prevents
//! duplicate *work*, not duplicate *state rows* — the registry table's
//! uniqueness constraint is the actual correctness backstop, and every
//! engine re-checks row eligibility after acquiring the lease.
//!
//! The TTL bounds worst-case staleness: a worker that crashes mid-operation
//! simply lets its lease expire, and a later scheduling pass retries under a
//! fresh lease. There is no explicit cancellation.
//!
//! Two implementations:
//!
//! - [`RedisLeaseStore`]: production. `SET key token NX PX ttl` to acquire;
//!   a scripted compare-and-delete to release, so an expired worker cannot
//!   release a lease that has since been re-acquired by someone else.
//! - [`InMemoryLeaseStore`]: tests and single-process deployments.

use crate::error::{ReplicationError, Result};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

/// Type alias for boxed async lease futures.
pub type LeaseFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Which engine wants the lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LeaseOperation {
    Replicate,
    Verify,
}

impl LeaseOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Replicate => "replicate",
            Self::Verify => "verify",
        }
    }
}

/// Lease identity: one lease per (resource, site, operation).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeaseKey {
    pub resource_type: String,
    pub resource_id: String,
    pub site_id: String,
    pub operation: LeaseOperation,
}

impl LeaseKey {
    pub fn new(
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        site_id: impl Into<String>,
        operation: LeaseOperation,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            site_id: site_id.into(),
            operation,
        }
    }

    /// The key as stored in the lease backend.
    pub fn storage_key(&self) -> String {
        format!(
            "registry_lease:{}:{}:{}:{}",
            self.operation.as_str(),
            self.site_id,
            self.resource_type,
            self.resource_id
        )
    }
}

/// Proof of lease ownership, required to release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseToken(String);

impl LeaseToken {
    fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A distributed lock service keyed by lease key, with TTL expiry.
pub trait LeaseStore: Send + Sync + 'static {
    /// Try to acquire the lease. Returns `None` when another worker holds it.
    fn acquire(&self, key: &LeaseKey, ttl: Duration) -> LeaseFuture<'_, Option<LeaseToken>>;

    /// Release the lease if `token` still owns it. Returns whether a release
    /// happened (`false` means the lease expired or was taken over).
    fn release(&self, key: &LeaseKey, token: &LeaseToken) -> LeaseFuture<'_, bool>;
}

// =============================================================================
// In-memory implementation
// =============================================================================

/// Process-local lease store for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryLeaseStore {
    leases: Mutex<HashMap<String, (String, Instant)>>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) leases. Diagnostics only.
    pub fn live_count(&self) -> usize {
        let now = Instant::now();
        self.leases
            .lock()
            .expect("lease map poisoned")
            .values()
            .filter(|(_, expires)| *expires > now)
            .count()
    }
}

impl LeaseStore for InMemoryLeaseStore {
    fn acquire(&self, key: &LeaseKey, ttl: Duration) -> LeaseFuture<'_, Option<LeaseToken>> {
        let storage_key = key.storage_key();
        Box::pin(async move {
            let mut leases = self
                .leases
                .lock()
                .map_err(|_| ReplicationError::Internal("lease map poisoned".into()))?;

            let now = Instant::now();
            if let Some((_, expires)) = leases.get(&storage_key) {
                if *expires > now {
                    return Ok(None);
                }
                // Expired lease from a crashed worker; take it over.
            }

            let token = LeaseToken::generate();
            leases.insert(storage_key, (token.0.clone(), now + ttl));
            Ok(Some(token))
        })
    }

    fn release(&self, key: &LeaseKey, token: &LeaseToken) -> LeaseFuture<'_, bool> {
        let storage_key = key.storage_key();
        let token = token.0.clone();
        Box::pin(async move {
            let mut leases = self
                .leases
                .lock()
                .map_err(|_| ReplicationError::Internal("lease map poisoned".into()))?;

            match leases.get(&storage_key) {
                Some((owner, _)) if *owner == token => {
                    leases.remove(&storage_key);
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }
}

// =============================================================================
// Redis implementation
// =============================================================================

/// Redis-backed lease store.
///
/// Acquire is a single `SET NX PX`; release is a compare-and-delete script so
/// only the current owner can release.
pub struct RedisLeaseStore {
    conn: redis::aio::ConnectionManager,
    release_script: redis::Script,
}

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

impl RedisLeaseStore {
    /// Connect to the lease backend at `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| ReplicationError::Config(format!("invalid Redis URL: {e}")))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| ReplicationError::lease("connect", e.to_string()))?;
        Ok(Self {
            conn,
            release_script: redis::Script::new(RELEASE_SCRIPT),
        })
    }
}

impl LeaseStore for RedisLeaseStore {
    fn acquire(&self, key: &LeaseKey, ttl: Duration) -> LeaseFuture<'_, Option<LeaseToken>> {
        let storage_key = key.storage_key();
        let mut conn = self.conn.clone();
        Box::pin(async move {
            let token = LeaseToken::generate();
            let ttl_ms = ttl.as_millis().max(1) as u64;

            let reply: Option<String> = redis::cmd("SET")
                .arg(&storage_key)
                .arg(token.as_str())
                .arg("NX")
                .arg("PX")
                .arg(ttl_ms)
                .query_async(&mut conn)
                .await
                .map_err(|e| ReplicationError::lease("SET", e.to_string()))?;

            match reply.as_deref() {
                Some("OK") => Ok(Some(token)),
                _ => {
                    debug!(key = %storage_key, "Lease busy");
                    Ok(None)
                }
            }
        })
    }

    fn release(&self, key: &LeaseKey, token: &LeaseToken) -> LeaseFuture<'_, bool> {
        let storage_key = key.storage_key();
        let token = token.clone();
        let mut conn = self.conn.clone();
        Box::pin(async move {
            let deleted: i64 = self
                .release_script
                .key(&storage_key)
                .arg(token.as_str())
                .invoke_async(&mut conn)
                .await
                .map_err(|e| ReplicationError::lease("EVAL", e.to_string()))?;
            Ok(deleted > 0)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(op: LeaseOperation) -> LeaseKey {
        LeaseKey::new("upload", "42", "site-1", op)
    }

    #[test]
    fn test_storage_key_format() {
        let k = key(LeaseOperation::Replicate);
        assert_eq!(k.storage_key(), "registry_lease:replicate:site-1:upload:42");
    }

    #[test]
    fn test_operations_have_distinct_keys() {
        assert_ne!(
            key(LeaseOperation::Replicate).storage_key(),
            key(LeaseOperation::Verify).storage_key()
        );
    }

    #[tokio::test]
    async fn test_in_memory_acquire_and_release() {
        let store = InMemoryLeaseStore::new();
        let k = key(LeaseOperation::Replicate);

        let token = store.acquire(&k, Duration::from_secs(60)).await.unwrap();
        let token = token.expect("first acquire should succeed");
        assert_eq!(store.live_count(), 1);

        // Second acquire is busy.
        assert!(store.acquire(&k, Duration::from_secs(60)).await.unwrap().is_none());

        assert!(store.release(&k, &token).await.unwrap());
        assert_eq!(store.live_count(), 0);

        // Released lease can be re-acquired.
        assert!(store.acquire(&k, Duration::from_secs(60)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_in_memory_expired_lease_is_taken_over() {
        let store = InMemoryLeaseStore::new();
        let k = key(LeaseOperation::Verify);

        let stale = store
            .acquire(&k, Duration::from_millis(5))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Crashed worker's lease expired; a new worker takes over.
        let fresh = store
            .acquire(&k, Duration::from_secs(60))
            .await
            .unwrap()
            .expect("expired lease should be claimable");

        // The stale token can no longer release.
        assert!(!store.release(&k, &stale).await.unwrap());
        assert!(store.release(&k, &fresh).await.unwrap());
    }

    #[tokio::test]
    async fn test_in_memory_release_requires_matching_token() {
        let store = InMemoryLeaseStore::new();
        let k = key(LeaseOperation::Replicate);

        let _token = store
            .acquire(&k, Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        let impostor = LeaseToken("not-the-owner".to_string());
        assert!(!store.release(&k, &impostor).await.unwrap());
        assert_eq!(store.live_count(), 1);
    }

    #[tokio::test]
    async fn test_in_memory_different_operations_do_not_contend() {
        let store = InMemoryLeaseStore::new();
        let replicate = store
            .acquire(&key(LeaseOperation::Replicate), Duration::from_secs(60))
            .await
            .unwrap();
        let verify = store
            .acquire(&key(LeaseOperation::Verify), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(replicate.is_some());
        assert!(verify.is_some());
    }

    // Requires a local Redis server.
    #[tokio::test]
    #[ignore]
    async fn test_redis_acquire_and_release() {
        let store = RedisLeaseStore::connect("redis://127.0.0.1:6379").await.unwrap();
        let k = key(LeaseOperation::Replicate);

        let token = store
            .acquire(&k, Duration::from_secs(10))
            .await
            .unwrap()
            .expect("acquire should succeed");
        assert!(store.acquire(&k, Duration::from_secs(10)).await.unwrap().is_none());
        assert!(store.release(&k, &token).await.unwrap());
        assert!(!store.release(&k, &token).await.unwrap());
    }
}

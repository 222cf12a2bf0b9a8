// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Registry persistence.
//!
//! Stores registry rows in SQLite: one polymorphic table keyed by
//! `(resource_type, resource_id, site_id)`, indexed on
//! `(site_id, replication_state)` and `(site_id, verification_state)` so the
//! scheduling scans stay cheap as the table grows.
//!
//! Row creation is an `INSERT OR IGNORE` — re-running a scheduling pass over
//! an unchanged resource set never creates a second row for the same key.
//! That uniqueness constraint, not the lease, is the correctness backstop
//! against duplicate workers.
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED under contention. Writes are
//! retried with exponential backoff (5 attempts, 10ms base), mirroring the
//! approach used for every other hot write path in the daemon.
//!
//! ## Why SQLite?
//!
//! - Registry state must survive daemon restarts, but is site-local: no
//!   other process reads it, so a server database buys nothing.
//! - Rows are small and writes are low-rate (one per state transition).
//! - WAL mode gives durability with good performance.

use crate::error::{ReplicationError, Result};
use crate::registry::{Registry, ReplicationState, VerificationState};
use crate::replicable::Checksum;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

const BUSY_RETRY_MAX_ATTEMPTS: u32 = 5;
const BUSY_RETRY_BASE_DELAY_MS: u64 = 10;

/// Check if an error is a retryable SQLite busy/locked error.
fn is_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Run a database operation, retrying on SQLITE_BUSY/SQLITE_LOCKED.
async fn with_busy_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if is_busy_error(&e) && attempts < BUSY_RETRY_MAX_ATTEMPTS => {
                let delay_ms = BUSY_RETRY_BASE_DELAY_MS << (attempts - 1);
                warn!(operation = operation_name, attempts, delay_ms, "SQLite busy, retrying");
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Per-site registry counts, for health checks and dashboards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateCounts {
    pub pending: u64,
    pub started: u64,
    pub synced: u64,
    pub failed: u64,
    pub verification_succeeded: u64,
    pub verification_failed: u64,
    pub checksum_mismatched: u64,
}

/// Persistent registry storage backed by SQLite.
pub struct RegistryStore {
    pool: SqlitePool,
}

impl RegistryStore {
    /// Open (or create) the registry database at `path`.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy();
        info!(path = %path_str, "Initializing registry store");

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path_str))
            .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {e}")))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        Self::from_pool(pool).await
    }

    /// An in-memory store for tests and ephemeral deployments.
    ///
    /// Single connection, never reaped: each `:memory:` connection is its own
    /// database, so losing the connection would lose the data.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| ReplicationError::Config(format!("SQLite options: {e}")))?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS registries (
                resource_type TEXT NOT NULL,
                resource_id TEXT NOT NULL,
                site_id TEXT NOT NULL,
                replication_state INTEGER NOT NULL DEFAULT 0,
                verification_state INTEGER NOT NULL DEFAULT 0,
                retry_count INTEGER NOT NULL DEFAULT 0,
                verification_retry_count INTEGER NOT NULL DEFAULT 0,
                last_sync_failure TEXT,
                verification_failure TEXT,
                verification_checksum TEXT,
                checksum_mismatch INTEGER NOT NULL DEFAULT 0,
                retry_at INTEGER,
                verification_retry_at INTEGER,
                last_synced_at INTEGER,
                last_successful_sync_at INTEGER,
                verification_started_at INTEGER,
                verified_at INTEGER,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (resource_type, resource_id, site_id)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_registries_site_replication
             ON registries (site_id, replication_state)",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_registries_site_verification
             ON registries (site_id, verification_state)",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert a row if none exists for its key. Returns whether a row was
    /// actually created (idempotent under re-scheduling).
    pub async fn create_pending(&self, registry: &Registry) -> Result<bool> {
        let result = with_busy_retry("registry_insert", || async {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO registries (
                    resource_type, resource_id, site_id,
                    replication_state, verification_state,
                    retry_count, verification_retry_count,
                    last_sync_failure, verification_failure,
                    verification_checksum, checksum_mismatch,
                    retry_at, verification_retry_at,
                    last_synced_at, last_successful_sync_at,
                    verification_started_at, verified_at, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&registry.resource_type)
            .bind(&registry.resource_id)
            .bind(&registry.site_id)
            .bind(registry.replication_state as i64)
            .bind(registry.verification_state as i64)
            .bind(i64::from(registry.retry_count))
            .bind(i64::from(registry.verification_retry_count))
            .bind(&registry.last_sync_failure)
            .bind(&registry.verification_failure)
            .bind(registry.verification_checksum.as_ref().map(Checksum::as_str))
            .bind(registry.checksum_mismatch as i64)
            .bind(to_millis(registry.retry_at))
            .bind(to_millis(registry.verification_retry_at))
            .bind(to_millis(registry.last_synced_at))
            .bind(to_millis(registry.last_successful_sync_at))
            .bind(to_millis(registry.verification_started_at))
            .bind(to_millis(registry.verified_at))
            .bind(registry.created_at.timestamp_millis())
            .execute(&self.pool)
            .await
        })
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Fetch one row by key.
    pub async fn get(
        &self,
        resource_type: &str,
        resource_id: &str,
        site_id: &str,
    ) -> Result<Option<Registry>> {
        let row = sqlx::query(
            "SELECT * FROM registries
             WHERE resource_type = ? AND resource_id = ? AND site_id = ?",
        )
        .bind(resource_type)
        .bind(resource_id)
        .bind(site_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_registry).transpose()
    }

    /// Persist a row's mutable fields.
    pub async fn save(&self, registry: &Registry) -> Result<()> {
        with_busy_retry("registry_save", || async {
            sqlx::query(
                r#"
                UPDATE registries SET
                    replication_state = ?,
                    verification_state = ?,
                    retry_count = ?,
                    verification_retry_count = ?,
                    last_sync_failure = ?,
                    verification_failure = ?,
                    verification_checksum = ?,
                    checksum_mismatch = ?,
                    retry_at = ?,
                    verification_retry_at = ?,
                    last_synced_at = ?,
                    last_successful_sync_at = ?,
                    verification_started_at = ?,
                    verified_at = ?
                WHERE resource_type = ? AND resource_id = ? AND site_id = ?
                "#,
            )
            .bind(registry.replication_state as i64)
            .bind(registry.verification_state as i64)
            .bind(i64::from(registry.retry_count))
            .bind(i64::from(registry.verification_retry_count))
            .bind(&registry.last_sync_failure)
            .bind(&registry.verification_failure)
            .bind(registry.verification_checksum.as_ref().map(Checksum::as_str))
            .bind(registry.checksum_mismatch as i64)
            .bind(to_millis(registry.retry_at))
            .bind(to_millis(registry.verification_retry_at))
            .bind(to_millis(registry.last_synced_at))
            .bind(to_millis(registry.last_successful_sync_at))
            .bind(to_millis(registry.verification_started_at))
            .bind(to_millis(registry.verified_at))
            .bind(&registry.resource_type)
            .bind(&registry.resource_id)
            .bind(&registry.site_id)
            .execute(&self.pool)
            .await
        })
        .await?;

        Ok(())
    }

    /// Delete one row. Returns whether a row existed.
    pub async fn delete(
        &self,
        resource_type: &str,
        resource_id: &str,
        site_id: &str,
    ) -> Result<bool> {
        let result = with_busy_retry("registry_delete", || async {
            sqlx::query(
                "DELETE FROM registries
                 WHERE resource_type = ? AND resource_id = ? AND site_id = ?",
            )
            .bind(resource_type)
            .bind(resource_id)
            .bind(site_id)
            .execute(&self.pool)
            .await
        })
        .await?;

        if result.rows_affected() > 0 {
            debug!(resource_type, resource_id, site_id, "Deleted registry row");
        }
        Ok(result.rows_affected() > 0)
    }

    /// All rows of one resource type for a site. Used by the scheduling pass
    /// to diff against the adapter's enumeration.
    pub async fn registries_for_site(
        &self,
        site_id: &str,
        resource_type: &str,
    ) -> Result<Vec<Registry>> {
        let rows = sqlx::query(
            "SELECT * FROM registries
             WHERE site_id = ? AND resource_type = ?
             ORDER BY resource_id",
        )
        .bind(site_id)
        .bind(resource_type)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_registry).collect()
    }

    /// Rows eligible for sync work: `pending` plus backoff-due `failed` rows
    /// under the retry ceiling. Never-attempted rows come first.
    pub async fn sync_batch(
        &self,
        site_id: &str,
        now: DateTime<Utc>,
        max_retry_count: u32,
        limit: u32,
    ) -> Result<Vec<Registry>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM registries
            WHERE site_id = ?
              AND (
                    replication_state = 0
                 OR (replication_state = 3
                     AND retry_count < ?
                     AND (retry_at IS NULL OR retry_at <= ?))
              )
            ORDER BY last_synced_at ASC
            LIMIT ?
            "#,
        )
        .bind(site_id)
        .bind(i64::from(max_retry_count))
        .bind(now.timestamp_millis())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_registry).collect()
    }

    /// Rows eligible for verification work: synced rows never verified,
    /// failed-and-retry-due under the ceiling, or verified too long ago.
    pub async fn verification_batch(
        &self,
        site_id: &str,
        now: DateTime<Utc>,
        max_retry_count: u32,
        reverify_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Registry>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM registries
            WHERE site_id = ?
              AND replication_state = 2
              AND (
                    verification_state = 0
                 OR (verification_state = 3
                     AND verification_retry_count < ?
                     AND (verification_retry_at IS NULL OR verification_retry_at <= ?))
                 OR (verification_state = 2
                     AND verified_at IS NOT NULL AND verified_at <= ?)
              )
            ORDER BY verified_at ASC
            LIMIT ?
            "#,
        )
        .bind(site_id)
        .bind(i64::from(max_retry_count))
        .bind(now.timestamp_millis())
        .bind(reverify_before.timestamp_millis())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_registry).collect()
    }

    /// Fail sync rows stuck in `started` since before `cutoff` (worker died,
    /// lease long expired). Returns the number of rows failed.
    pub async fn fail_sync_timeouts(
        &self,
        cutoff: DateTime<Utc>,
        retry_at: DateTime<Utc>,
    ) -> Result<u64> {
        let result = with_busy_retry("sync_timeout_sweep", || async {
            sqlx::query(
                r#"
                UPDATE registries SET
                    replication_state = 3,
                    retry_count = retry_count + 1,
                    retry_at = ?,
                    last_sync_failure = 'Sync timed out'
                WHERE replication_state = 1 AND last_synced_at < ?
                "#,
            )
            .bind(retry_at.timestamp_millis())
            .bind(cutoff.timestamp_millis())
            .execute(&self.pool)
            .await
        })
        .await?;

        Ok(result.rows_affected())
    }

    /// Fail verification rows stuck in `started` since before `cutoff`.
    pub async fn fail_verification_timeouts(
        &self,
        cutoff: DateTime<Utc>,
        retry_at: DateTime<Utc>,
    ) -> Result<u64> {
        let result = with_busy_retry("verification_timeout_sweep", || async {
            sqlx::query(
                r#"
                UPDATE registries SET
                    verification_state = 3,
                    verification_retry_count = verification_retry_count + 1,
                    verification_retry_at = ?,
                    verification_failure = 'Verification timed out',
                    verification_checksum = NULL
                WHERE verification_state = 1 AND verification_started_at < ?
                "#,
            )
            .bind(retry_at.timestamp_millis())
            .bind(cutoff.timestamp_millis())
            .execute(&self.pool)
            .await
        })
        .await?;

        Ok(result.rows_affected())
    }

    /// Operator bulk reset: re-queue every failed row for a site.
    pub async fn resync_all_failed(&self, site_id: &str) -> Result<u64> {
        let result = with_busy_retry("resync_all_failed", || async {
            sqlx::query(
                "UPDATE registries SET
                     replication_state = 0, retry_count = 0, retry_at = NULL
                 WHERE site_id = ? AND replication_state = 3",
            )
            .bind(site_id)
            .execute(&self.pool)
            .await
        })
        .await?;

        info!(site_id, count = result.rows_affected(), "Flagged failed rows for resync");
        Ok(result.rows_affected())
    }

    /// Operator bulk reset: re-queue every verified row for reverification.
    pub async fn reverify_all(&self, site_id: &str) -> Result<u64> {
        let result = with_busy_retry("reverify_all", || async {
            sqlx::query(
                "UPDATE registries SET
                     verification_state = 0,
                     verification_checksum = NULL,
                     verification_retry_count = 0,
                     verification_retry_at = NULL
                 WHERE site_id = ? AND verification_state = 2",
            )
            .bind(site_id)
            .execute(&self.pool)
            .await
        })
        .await?;

        info!(site_id, count = result.rows_affected(), "Flagged verified rows for reverify");
        Ok(result.rows_affected())
    }

    /// Per-site registry counts.
    pub async fn state_counts(&self, site_id: &str) -> Result<StateCounts> {
        let rows = sqlx::query(
            "SELECT replication_state, verification_state, checksum_mismatch, COUNT(*) as n
             FROM registries WHERE site_id = ?
             GROUP BY replication_state, verification_state, checksum_mismatch",
        )
        .bind(site_id)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = StateCounts::default();
        for row in rows {
            let replication = ReplicationState::from_i64(row.try_get("replication_state")?)?;
            let verification = VerificationState::from_i64(row.try_get("verification_state")?)?;
            let mismatch: i64 = row.try_get("checksum_mismatch")?;
            let n: i64 = row.try_get("n")?;
            let n = n as u64;

            match replication {
                ReplicationState::Pending => counts.pending += n,
                ReplicationState::Started => counts.started += n,
                ReplicationState::Synced => counts.synced += n,
                ReplicationState::Failed => counts.failed += n,
            }
            match verification {
                VerificationState::Succeeded => counts.verification_succeeded += n,
                VerificationState::Failed => counts.verification_failed += n,
                _ => {}
            }
            if mismatch != 0 {
                counts.checksum_mismatched += n;
            }
        }
        Ok(counts)
    }

    /// Close the connection pool gracefully.
    pub async fn close(&self) {
        self.pool.close().await;
        info!("Registry store closed");
    }
}

fn to_millis(at: Option<DateTime<Utc>>) -> Option<i64> {
    at.map(|t| t.timestamp_millis())
}

fn from_millis(ms: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    ms.map(|v| {
        DateTime::<Utc>::from_timestamp_millis(v)
            .ok_or_else(|| ReplicationError::Internal(format!("timestamp out of range: {v}")))
    })
    .transpose()
}

pub(crate) fn row_to_registry(row: SqliteRow) -> Result<Registry> {
    let checksum: Option<String> = row.try_get("verification_checksum")?;
    let mismatch: i64 = row.try_get("checksum_mismatch")?;
    let created_at: i64 = row.try_get("created_at")?;

    Ok(Registry {
        resource_type: row.try_get("resource_type")?,
        resource_id: row.try_get("resource_id")?,
        site_id: row.try_get("site_id")?,
        replication_state: ReplicationState::from_i64(row.try_get("replication_state")?)?,
        verification_state: VerificationState::from_i64(row.try_get("verification_state")?)?,
        retry_count: row.try_get::<i64, _>("retry_count")? as u32,
        verification_retry_count: row.try_get::<i64, _>("verification_retry_count")? as u32,
        last_sync_failure: row.try_get("last_sync_failure")?,
        verification_failure: row.try_get("verification_failure")?,
        verification_checksum: checksum.map(Checksum::from_hex),
        checksum_mismatch: mismatch != 0,
        retry_at: from_millis(row.try_get("retry_at")?)?,
        verification_retry_at: from_millis(row.try_get("verification_retry_at")?)?,
        last_synced_at: from_millis(row.try_get("last_synced_at")?)?,
        last_successful_sync_at: from_millis(row.try_get("last_successful_sync_at")?)?,
        verification_started_at: from_millis(row.try_get("verification_started_at")?)?,
        verified_at: from_millis(row.try_get("verified_at")?)?,
        created_at: DateTime::<Utc>::from_timestamp_millis(created_at).ok_or_else(|| {
            ReplicationError::Internal(format!("timestamp out of range: {created_at}"))
        })?,
    })
}

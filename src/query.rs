//! Registry query layer.
//!
//! Read-only filtering and pagination over the registries table, consumed by
//! operator tooling and dashboards. Pagination is keyset-based (offset-free):
//! results are ordered by the stable `(resource_type, resource_id)` key and a
//! page carries an opaque cursor pointing past its last row, so a page scan
//! stays cheap no matter how deep into the table it is.

use crate::error::{ReplicationError, Result};
use crate::registry::{Registry, ReplicationState, VerificationState};
use crate::store::{row_to_registry, RegistryStore};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;

/// Filter over one site's registry rows.
#[derive(Debug, Clone)]
pub struct RegistryQuery {
    pub site_id: String,
    /// Restrict to one resource type.
    pub resource_type: Option<String>,
    /// Restrict to these resource ids.
    pub ids: Option<Vec<String>>,
    pub replication_state: Option<ReplicationState>,
    pub verification_state: Option<VerificationState>,
    /// `Some(true)` selects only diverged rows.
    pub checksum_mismatch: Option<bool>,
    /// Resume after this cursor (from a previous page).
    pub after: Option<PageCursor>,
    pub limit: u32,
}

impl RegistryQuery {
    /// An unfiltered query over a site, first page.
    pub fn for_site(site_id: impl Into<String>) -> Self {
        Self {
            site_id: site_id.into(),
            resource_type: None,
            ids: None,
            replication_state: None,
            verification_state: None,
            checksum_mismatch: None,
            after: None,
            limit: 100,
        }
    }

    pub fn with_replication_state(mut self, state: ReplicationState) -> Self {
        self.replication_state = Some(state);
        self
    }

    pub fn with_verification_state(mut self, state: VerificationState) -> Self {
        self.verification_state = Some(state);
        self
    }

    pub fn with_ids(mut self, ids: Vec<String>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn with_mismatch_only(mut self) -> Self {
        self.checksum_mismatch = Some(true);
        self
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    pub fn after(mut self, cursor: PageCursor) -> Self {
        self.after = Some(cursor);
        self
    }
}

/// Keyset cursor: the ordering key of the last row of a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageCursor {
    pub resource_type: String,
    pub resource_id: String,
}

impl PageCursor {
    /// Render as an opaque token for HTTP/GraphQL surfaces.
    pub fn encode(&self) -> String {
        // Infallible: the struct is two strings.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn decode(token: &str) -> Result<Self> {
        serde_json::from_str(token)
            .map_err(|e| ReplicationError::Config(format!("invalid page cursor: {e}")))
    }
}

/// One page of results.
#[derive(Debug)]
pub struct Page {
    pub entries: Vec<Registry>,
    /// Present when more rows follow this page.
    pub next: Option<PageCursor>,
}

impl RegistryStore {
    /// Run a filtered, keyset-paginated query.
    pub async fn find(&self, query: &RegistryQuery) -> Result<Page> {
        let mut sql = String::from("SELECT * FROM registries WHERE site_id = ?");

        if query.resource_type.is_some() {
            sql.push_str(" AND resource_type = ?");
        }
        if let Some(ids) = &query.ids {
            if ids.is_empty() {
                return Ok(Page { entries: Vec::new(), next: None });
            }
            sql.push_str(" AND resource_id IN (");
            sql.push_str(&vec!["?"; ids.len()].join(", "));
            sql.push(')');
        }
        if query.replication_state.is_some() {
            sql.push_str(" AND replication_state = ?");
        }
        if query.verification_state.is_some() {
            sql.push_str(" AND verification_state = ?");
        }
        if query.checksum_mismatch.is_some() {
            sql.push_str(" AND checksum_mismatch = ?");
        }
        if query.after.is_some() {
            sql.push_str(" AND (resource_type, resource_id) > (?, ?)");
        }
        sql.push_str(" ORDER BY resource_type, resource_id LIMIT ?");

        let mut q = sqlx::query(&sql).bind(&query.site_id);
        if let Some(resource_type) = &query.resource_type {
            q = q.bind(resource_type);
        }
        if let Some(ids) = &query.ids {
            for id in ids {
                q = q.bind(id);
            }
        }
        if let Some(state) = query.replication_state {
            q = q.bind(state as i64);
        }
        if let Some(state) = query.verification_state {
            q = q.bind(state as i64);
        }
        if let Some(mismatch) = query.checksum_mismatch {
            q = q.bind(mismatch as i64);
        }
        if let Some(cursor) = &query.after {
            q = q.bind(&cursor.resource_type).bind(&cursor.resource_id);
        }
        // Fetch one extra row to learn whether another page follows.
        q = q.bind(i64::from(query.limit) + 1);

        let rows: Vec<SqliteRow> = q.fetch_all(self.pool()).await?;

        let mut entries = rows
            .into_iter()
            .map(row_to_registry)
            .collect::<Result<Vec<_>>>()?;

        let next = if entries.len() > query.limit as usize {
            entries.truncate(query.limit as usize);
            entries.last().map(|last| PageCursor {
                resource_type: last.resource_type.clone(),
                resource_id: last.resource_id.clone(),
            })
        } else {
            None
        };

        Ok(Page { entries, next })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use crate::resilience::Backoff;
    use chrono::Utc;
    use std::time::Duration;

    async fn seeded_store() -> RegistryStore {
        let store = RegistryStore::in_memory().await.unwrap();
        let now = Utc::now();

        for i in 0..5 {
            let r = Registry::new("upload", format!("u{i}"), "site-1", now);
            store.create_pending(&r).await.unwrap();
        }
        for i in 0..3 {
            let r = Registry::new("artifact", format!("a{i}"), "site-1", now);
            store.create_pending(&r).await.unwrap();
        }

        // One failed upload.
        let mut failed = store.get("upload", "u4", "site-1").await.unwrap().unwrap();
        failed.start_sync(now).unwrap();
        failed
            .fail_sync("boom", &Backoff::new(Duration::ZERO, Duration::ZERO), now)
            .unwrap();
        store.save(&failed).await.unwrap();

        store
    }

    #[tokio::test]
    async fn test_find_all_for_site() {
        let store = seeded_store().await;
        let page = store.find(&RegistryQuery::for_site("site-1")).await.unwrap();
        assert_eq!(page.entries.len(), 8);
        assert!(page.next.is_none());
        // Stable order: artifacts sort before uploads.
        assert_eq!(page.entries[0].resource_type, "artifact");
    }

    #[tokio::test]
    async fn test_find_filters_by_replication_state() {
        let store = seeded_store().await;
        let page = store
            .find(&RegistryQuery::for_site("site-1").with_replication_state(ReplicationState::Failed))
            .await
            .unwrap();
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.entries[0].resource_id, "u4");
    }

    #[tokio::test]
    async fn test_find_filters_by_ids() {
        let store = seeded_store().await;
        let page = store
            .find(
                &RegistryQuery::for_site("site-1")
                    .with_ids(vec!["u1".into(), "u3".into(), "missing".into()]),
            )
            .await
            .unwrap();
        let ids: Vec<_> = page.entries.iter().map(|r| r.resource_id.as_str()).collect();
        assert_eq!(ids, vec!["u1", "u3"]);
    }

    #[tokio::test]
    async fn test_find_empty_ids_returns_empty_page() {
        let store = seeded_store().await;
        let page = store
            .find(&RegistryQuery::for_site("site-1").with_ids(vec![]))
            .await
            .unwrap();
        assert!(page.entries.is_empty());
        assert!(page.next.is_none());
    }

    #[tokio::test]
    async fn test_keyset_pagination_walks_all_rows() {
        let store = seeded_store().await;
        let mut seen = Vec::new();
        let mut cursor: Option<PageCursor> = None;

        loop {
            let mut query = RegistryQuery::for_site("site-1").with_limit(3);
            if let Some(c) = cursor.take() {
                query = query.after(c);
            }
            let page = store.find(&query).await.unwrap();
            assert!(page.entries.len() <= 3);
            seen.extend(page.entries.iter().map(|r| r.resource_id.clone()));
            match page.next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        assert_eq!(seen.len(), 8);
        // No row seen twice.
        let mut dedup = seen.clone();
        dedup.sort();
        dedup.dedup();
        assert_eq!(dedup.len(), 8);
    }

    #[tokio::test]
    async fn test_find_mismatch_only() {
        let store = seeded_store().await;
        let now = Utc::now();

        let mut diverged = store.get("upload", "u0", "site-1").await.unwrap().unwrap();
        diverged.start_sync(now).unwrap();
        diverged.finish_sync(true, now).unwrap();
        diverged.start_verification(now).unwrap();
        let primary = crate::replicable::Checksum::digest(b"a");
        diverged
            .finish_verification(crate::replicable::Checksum::digest(b"b"), &primary, now)
            .unwrap();
        store.save(&diverged).await.unwrap();

        let page = store
            .find(&RegistryQuery::for_site("site-1").with_mismatch_only())
            .await
            .unwrap();
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.entries[0].resource_id, "u0");
    }

    #[test]
    fn test_cursor_encode_decode() {
        let cursor = PageCursor {
            resource_type: "upload".into(),
            resource_id: "u7".into(),
        };
        let token = cursor.encode();
        let back = PageCursor::decode(&token).unwrap();
        assert_eq!(back, cursor);

        assert!(PageCursor::decode("not json").is_err());
    }
}

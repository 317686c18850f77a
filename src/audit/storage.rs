//! Audit storage trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::types::{AuditEntry, AuditFilter};
use crate::error::Result;

/// Append-only persistence for audit entries.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Insert one entry. Entries are never updated.
    async fn append(&self, entry: &AuditEntry) -> Result<()>;

    /// Entries matching `filter`, newest first, with `limit` and `offset`
    /// already validated. Returns the page and the number of matches.
    async fn query(&self, filter: &AuditFilter, limit: i64, offset: i64) -> Result<(Vec<AuditEntry>, u64)>;

    /// Hard-delete entries with `expires_at < now`. Returns how many were removed.
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// In-memory audit store for tests.
#[cfg(any(test, feature = "test-billing"))]
pub mod test {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::RwLock;

    #[derive(Default, Clone)]
    pub struct InMemoryAuditStore {
        entries: Arc<RwLock<Vec<AuditEntry>>>,
    }

    impl InMemoryAuditStore {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Every stored entry, oldest first.
        pub async fn entries(&self) -> Vec<AuditEntry> {
            self.entries.read().await.clone()
        }
    }

    #[async_trait]
    impl AuditStore for InMemoryAuditStore {
        async fn append(&self, entry: &AuditEntry) -> Result<()> {
            self.entries.write().await.push(entry.clone());
            Ok(())
        }

        async fn query(&self, filter: &AuditFilter, limit: i64, offset: i64) -> Result<(Vec<AuditEntry>, u64)> {
            let entries = self.entries.read().await;
            let mut matching: Vec<&AuditEntry> = entries.iter().filter(|e| filter.matches(e)).collect();
            matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            let total = matching.len() as u64;
            let page = matching
                .into_iter()
                .skip(offset as usize)
                .take(limit as usize)
                .cloned()
                .collect();
            Ok((page, total))
        }

        async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
            let mut entries = self.entries.write().await;
            let before = entries.len();
            entries.retain(|e| e.expires_at >= now);
            Ok((before - entries.len()) as u64)
        }
    }
}

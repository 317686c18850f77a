//! The audit log service.

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use super::storage::AuditStore;
use super::types::{AuditEntry, AuditEventType, AuditFilter, AuditPage, AuditSeverity, NewAuditEntry};
use crate::billing::error::{BillingError, BillingResult};

/// Page size when the query does not set one.
pub const DEFAULT_QUERY_LIMIT: i64 = 50;
/// Largest accepted page size.
pub const MAX_QUERY_LIMIT: i64 = 1000;
/// Retention when none is configured.
pub const DEFAULT_RETENTION_DAYS: i64 = 365;

/// Appends, queries and expires audit entries.
#[derive(Clone)]
pub struct AuditLog {
    store: Arc<dyn AuditStore>,
    retention: Duration,
}

impl AuditLog {
    #[must_use]
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self::with_retention_days(store, DEFAULT_RETENTION_DAYS)
    }

    #[must_use]
    pub fn with_retention_days(store: Arc<dyn AuditStore>, days: i64) -> Self {
        Self {
            store,
            retention: Duration::days(days.max(1)),
        }
    }

    fn materialize(&self, entry: NewAuditEntry, now: DateTime<Utc>) -> AuditEntry {
        let severity = entry.effective_severity();
        let metadata = match entry.metadata {
            serde_json::Value::Null => json!({}),
            serde_json::Value::Object(map) => serde_json::Value::Object(map),
            other => json!({ "value": other }),
        };
        AuditEntry {
            id: Uuid::new_v4(),
            event_type: entry.event_type,
            severity,
            actor: entry.actor,
            target: entry.target,
            organization_id: entry.organization_id,
            action: entry.action,
            status: entry.status,
            error_message: entry.error_message,
            metadata,
            amount: entry.amount,
            request_id: entry.request_id,
            session_id: entry.session_id,
            created_at: now,
            expires_at: now + self.retention,
        }
    }

    /// Insert one entry and return it as stored.
    pub async fn append(&self, entry: NewAuditEntry) -> crate::error::Result<AuditEntry> {
        let entry = self.materialize(entry, Utc::now());
        self.store.append(&entry).await?;

        match entry.severity {
            AuditSeverity::Warning => tracing::warn!(
                target: "tollgate::audit",
                event = %entry.event_type,
                actor = ?entry.actor.id,
                status = entry.status.as_str(),
                "{}", entry.action
            ),
            AuditSeverity::Error | AuditSeverity::Critical => tracing::error!(
                target: "tollgate::audit",
                event = %entry.event_type,
                actor = ?entry.actor.id,
                status = entry.status.as_str(),
                error = ?entry.error_message,
                "{}", entry.action
            ),
            AuditSeverity::Info => tracing::debug!(
                target: "tollgate::audit",
                event = %entry.event_type,
                actor = ?entry.actor.id,
                "{}", entry.action
            ),
        }
        Ok(entry)
    }

    /// Append without failing the caller. Store errors are logged.
    pub async fn record(&self, entry: NewAuditEntry) {
        let event = entry.event_type;
        if let Err(e) = self.append(entry).await {
            tracing::warn!(
                target: "tollgate::audit",
                event = %event,
                error = %e,
                "Failed to write audit entry"
            );
        }
    }

    /// Record a billing event. Payment failures are raised to `warning`.
    pub async fn log_billing(
        &self,
        event_type: AuditEventType,
        actor_id: Option<&str>,
        target_kind: &str,
        target_id: impl ToString,
        metadata: serde_json::Value,
    ) {
        let mut entry = NewAuditEntry::new(event_type, format!("Billing event: {}", event_type))
            .target(target_kind, target_id)
            .metadata(metadata);
        if let Some(actor) = actor_id {
            entry = entry.actor(actor);
        }
        self.record(entry).await;
    }

    pub async fn log_organization(
        &self,
        event_type: AuditEventType,
        actor_id: &str,
        organization_id: Uuid,
        action: impl Into<String>,
        metadata: serde_json::Value,
    ) {
        self.record(
            NewAuditEntry::new(event_type, action)
                .actor(actor_id)
                .organization(organization_id)
                .target("organization", organization_id)
                .metadata(metadata),
        )
        .await;
    }

    pub async fn log_security(
        &self,
        event_type: AuditEventType,
        actor_id: Option<&str>,
        action: impl Into<String>,
        severity: AuditSeverity,
        metadata: serde_json::Value,
    ) {
        let mut entry = NewAuditEntry::new(event_type, action)
            .severity(severity)
            .metadata(metadata);
        if let Some(actor) = actor_id {
            entry = entry.actor(actor);
        }
        self.record(entry).await;
    }

    /// Record an operation that failed with `error`.
    ///
    /// The entry is stored as `failed` with at least `warning` severity.
    pub async fn log_failure(&self, entry: NewAuditEntry, error: &BillingError) {
        self.record(entry.failed(error)).await;
    }

    /// Entries matching `filter`, newest first.
    ///
    /// `limit` defaults to 50 and must lie in `1..=1000`; `offset` must not be
    /// negative; `start_date` must not lie after `end_date`.
    pub async fn query(&self, filter: &AuditFilter) -> BillingResult<AuditPage> {
        let limit = filter.limit.unwrap_or(DEFAULT_QUERY_LIMIT);
        if !(1..=MAX_QUERY_LIMIT).contains(&limit) {
            return Err(BillingError::LimitOutOfRange {
                field: "limit".to_string(),
                value: limit,
                max: MAX_QUERY_LIMIT,
            });
        }
        let offset = filter.offset.unwrap_or(0);
        if offset < 0 {
            return Err(BillingError::LimitOutOfRange {
                field: "offset".to_string(),
                value: offset,
                max: i64::MAX,
            });
        }
        if let (Some(start), Some(end)) = (filter.start_date, filter.end_date) {
            if start > end {
                return Err(BillingError::InvalidDateRange {
                    message: format!("start_date {} is after end_date {}", start, end),
                });
            }
        }

        let (entries, total) = self.store.query(filter, limit, offset).await?;
        Ok(AuditPage {
            entries,
            total,
            limit,
            offset,
        })
    }

    /// Remove expired entries. Returns how many were deleted.
    pub async fn delete_expired(&self, now: DateTime<Utc>) -> crate::error::Result<u64> {
        let removed = self.store.delete_expired(now).await?;
        if removed > 0 {
            tracing::info!(target: "tollgate::audit", removed, "Expired audit entries deleted");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::storage::test::InMemoryAuditStore;
    use crate::audit::types::AuditStatus;

    fn log() -> (InMemoryAuditStore, AuditLog) {
        let store = InMemoryAuditStore::new();
        (store.clone(), AuditLog::new(Arc::new(store)))
    }

    #[tokio::test]
    async fn test_append_normalizes_metadata_and_expiry() {
        let (_, log) = log();
        let entry = log
            .append(NewAuditEntry::new(AuditEventType::UserCreated, "User created").actor("a1"))
            .await
            .unwrap();
        assert_eq!(entry.metadata, json!({}));
        assert_eq!((entry.expires_at - entry.created_at).num_days(), 365);
        assert_eq!(entry.severity, AuditSeverity::Info);
    }

    #[tokio::test]
    async fn test_query_filters_and_pages_newest_first() {
        let (_, log) = log();
        for i in 0..5 {
            log.append(
                NewAuditEntry::new(AuditEventType::LicenseAssigned, format!("assign {}", i))
                    .actor("purchaser"),
            )
            .await
            .unwrap();
        }
        log.append(NewAuditEntry::new(AuditEventType::LoginFailed, "login").actor("other"))
            .await
            .unwrap();

        let filter = AuditFilter {
            actor_id: Some("purchaser".into()),
            limit: Some(2),
            offset: Some(1),
            ..Default::default()
        };
        let page = log.query(&filter).await.unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.entries.len(), 2);
        assert!(page.entries[0].created_at >= page.entries[1].created_at);

        let warnings = log
            .query(&AuditFilter {
                severity: Some(AuditSeverity::Warning),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(warnings.total, 1);
        assert_eq!(warnings.entries[0].status, AuditStatus::Success);
    }

    #[tokio::test]
    async fn test_query_validation() {
        let (_, log) = log();
        let too_big = AuditFilter {
            limit: Some(1001),
            ..Default::default()
        };
        assert!(matches!(
            log.query(&too_big).await.unwrap_err(),
            BillingError::LimitOutOfRange { .. }
        ));

        let now = Utc::now();
        let backwards = AuditFilter {
            start_date: Some(now),
            end_date: Some(now - Duration::days(1)),
            ..Default::default()
        };
        assert!(matches!(
            log.query(&backwards).await.unwrap_err(),
            BillingError::InvalidDateRange { .. }
        ));
    }

    #[tokio::test]
    async fn test_failure_is_stored_with_raised_severity() {
        let (store, log) = log();
        log.log_failure(
            NewAuditEntry::new(AuditEventType::LicenseAssigned, "License assignment failed")
                .actor("purchaser")
                .target("license_batch", "b1"),
            &BillingError::NoAvailableLicenses {
                batch_id: "b1".into(),
            },
        )
        .await;

        let entries = store.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, AuditStatus::Failed);
        assert_eq!(entries[0].severity, AuditSeverity::Warning);
        assert!(entries[0]
            .error_message
            .as_deref()
            .is_some_and(|m| m.contains("b1")));
    }

    #[tokio::test]
    async fn test_delete_expired() {
        let (store, log) = log();
        log.append(NewAuditEntry::new(AuditEventType::Logout, "bye"))
            .await
            .unwrap();
        assert_eq!(log.delete_expired(Utc::now()).await.unwrap(), 0);
        assert_eq!(
            log.delete_expired(Utc::now() + Duration::days(366))
                .await
                .unwrap(),
            1
        );
        assert!(store.entries().await.is_empty());
    }
}

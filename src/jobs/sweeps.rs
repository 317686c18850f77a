//! Maintenance sweeps run by the scheduler.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use super::tokens::VerificationTokenStore;
use crate::audit::AuditLog;
use crate::billing::BillingStore;
use crate::error::Result;

/// A periodic cleanup task.
///
/// `run` removes whatever expired at `now` and reports how many rows it
/// deleted. The name doubles as the leader lease key.
#[async_trait]
pub trait Sweep: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// Deletes audit entries past their retention.
pub struct AuditRetentionSweep {
    audit: AuditLog,
}

impl AuditRetentionSweep {
    #[must_use]
    pub fn new(audit: AuditLog) -> Self {
        Self { audit }
    }
}

#[async_trait]
impl Sweep for AuditRetentionSweep {
    fn name(&self) -> &'static str {
        "audit_retention"
    }

    async fn run(&self, now: DateTime<Utc>) -> Result<u64> {
        self.audit.delete_expired(now).await
    }
}

/// Deletes expired webhook dedup records.
pub struct WebhookEventSweep {
    store: Arc<dyn BillingStore>,
}

impl WebhookEventSweep {
    #[must_use]
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Sweep for WebhookEventSweep {
    fn name(&self) -> &'static str {
        "webhook_events"
    }

    async fn run(&self, now: DateTime<Utc>) -> Result<u64> {
        Ok(self.store.delete_expired_webhook_events(now).await?)
    }
}

/// Deletes expired e-mail verification tokens.
pub struct VerificationTokenSweep {
    tokens: Arc<dyn VerificationTokenStore>,
}

impl VerificationTokenSweep {
    #[must_use]
    pub fn new(tokens: Arc<dyn VerificationTokenStore>) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl Sweep for VerificationTokenSweep {
    fn name(&self) -> &'static str {
        "verification_tokens"
    }

    async fn run(&self, now: DateTime<Utc>) -> Result<u64> {
        self.tokens.delete_expired(now).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditEventType, InMemoryAuditStore, NewAuditEntry};
    use crate::billing::storage::test::InMemoryBillingStore;
    use crate::billing::types::{WebhookEventRecord, WebhookEventStatus};
    use crate::jobs::tokens::test::InMemoryVerificationTokenStore;
    use chrono::Duration;

    #[tokio::test]
    async fn test_webhook_sweep_removes_expired_records() {
        let store = InMemoryBillingStore::new();
        let now = Utc::now();
        for (id, expires_at) in [("evt_old", now - Duration::days(1)), ("evt_new", now + Duration::days(1))] {
            store
                .claim_webhook_event(&WebhookEventRecord {
                    event_id: id.to_string(),
                    event_type: "invoice.payment_succeeded".to_string(),
                    status: WebhookEventStatus::Processed,
                    processed_at: now - Duration::days(30),
                    expires_at,
                    payload: None,
                })
                .await
                .unwrap();
        }

        let sweep = WebhookEventSweep::new(Arc::new(store.clone()));
        assert_eq!(sweep.run(now).await.unwrap(), 1);
        assert_eq!(store.processed_event_ids().await, vec!["evt_new".to_string()]);
    }

    #[tokio::test]
    async fn test_audit_sweep_uses_retention() {
        let store = InMemoryAuditStore::new();
        let audit = AuditLog::with_retention_days(Arc::new(store.clone()), 1);
        audit
            .append(NewAuditEntry::new(AuditEventType::MaintenanceStarted, "sweep test"))
            .await
            .unwrap();

        let sweep = AuditRetentionSweep::new(audit);
        assert_eq!(sweep.run(Utc::now()).await.unwrap(), 0);
        assert_eq!(sweep.run(Utc::now() + Duration::days(2)).await.unwrap(), 1);
        assert!(store.entries().await.is_empty());
    }

    #[tokio::test]
    async fn test_token_sweep() {
        let tokens = InMemoryVerificationTokenStore::new();
        let now = Utc::now();
        tokens.insert("t1", "u1", now - Duration::hours(1)).await;
        tokens.insert("t2", "u2", now + Duration::hours(1)).await;

        let sweep = VerificationTokenSweep::new(Arc::new(tokens.clone()));
        assert_eq!(sweep.run(now).await.unwrap(), 1);
        assert_eq!(tokens.len().await, 1);
    }
}

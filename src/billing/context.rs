//! Collaborators shared by the billing engines.

use std::sync::Arc;

use super::directory::Directory;
use super::error::BillingResult;
use super::gateway::PaymentGateway;
use super::storage::BillingStore;
use crate::audit::{AuditLog, NewAuditEntry};
use crate::config::{Config, UsageConfig};
use crate::organizations::MembershipStore;

/// Dedup records are kept this long by default.
pub const DEFAULT_WEBHOOK_RETENTION_DAYS: i64 = 30;

/// Ports and settings every engine is built from.
///
/// Cloning is cheap; every port is reference-counted.
#[derive(Clone)]
pub struct BillingContext {
    pub store: Arc<dyn BillingStore>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub directory: Arc<dyn Directory>,
    pub memberships: Arc<dyn MembershipStore>,
    pub audit: AuditLog,
    pub usage: UsageConfig,
    pub webhook_retention_days: i64,
}

impl BillingContext {
    #[must_use]
    pub fn new(
        store: Arc<dyn BillingStore>,
        gateway: Arc<dyn PaymentGateway>,
        directory: Arc<dyn Directory>,
        memberships: Arc<dyn MembershipStore>,
        audit: AuditLog,
    ) -> Self {
        Self {
            store,
            gateway,
            directory,
            memberships,
            audit,
            usage: UsageConfig::default(),
            webhook_retention_days: DEFAULT_WEBHOOK_RETENTION_DAYS,
        }
    }

    /// Apply the usage toggles and webhook retention from `config`.
    #[must_use]
    pub fn with_config(mut self, config: &Config) -> Self {
        self.usage = config.usage;
        self.webhook_retention_days = config.webhook.retention_days;
        self
    }

    #[must_use]
    pub fn with_usage(mut self, usage: UsageConfig) -> Self {
        self.usage = usage;
        self
    }

    /// Pass `result` through, recording a failed audit entry if it is an error.
    pub(crate) async fn audit_outcome<T>(
        &self,
        result: BillingResult<T>,
        entry: impl FnOnce() -> NewAuditEntry,
    ) -> BillingResult<T> {
        if let Err(e) = &result {
            self.audit.log_failure(entry(), e).await;
        }
        result
    }
}

/// A context wired to in-memory ports, with handles to each of them.
#[cfg(any(test, feature = "test-billing"))]
pub mod test {
    use super::*;
    use crate::audit::InMemoryAuditStore;
    use crate::billing::catalog::FeatureCatalog;
    use crate::billing::directory::test::MockDirectory;
    use crate::billing::gateway::test::MockGateway;
    use crate::billing::storage::test::InMemoryBillingStore;
    use crate::organizations::InMemoryMembershipStore;

    #[derive(Clone)]
    pub struct TestBilling {
        pub ctx: BillingContext,
        pub store: InMemoryBillingStore,
        pub gateway: MockGateway,
        pub directory: MockDirectory,
        pub memberships: InMemoryMembershipStore,
        pub audit_store: InMemoryAuditStore,
    }

    impl TestBilling {
        /// Fresh ports with the feature catalog seeded.
        pub async fn new() -> Self {
            let store = InMemoryBillingStore::new();
            let gateway = MockGateway::new();
            let directory = MockDirectory::new();
            let memberships = InMemoryMembershipStore::new();
            let audit_store = InMemoryAuditStore::new();

            let ctx = BillingContext::new(
                Arc::new(store.clone()),
                Arc::new(gateway.clone()),
                Arc::new(directory.clone()),
                Arc::new(memberships.clone()),
                AuditLog::new(Arc::new(audit_store.clone())),
            );
            FeatureCatalog::new(ctx.store.clone()).seed().await.unwrap();

            Self {
                ctx,
                store,
                gateway,
                directory,
                memberships,
                audit_store,
            }
        }
    }
}

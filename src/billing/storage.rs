//! Storage trait for billing data.
//!
//! Implement [`BillingStore`] to persist billing state. Composite operations
//! (`insert_batch_with_licenses`, `claim_unassigned_license`, `resize_batch`,
//! ...) must be atomic: either every row changes or none does.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::any::Any;
use std::fmt;
use uuid::Uuid;

use super::error::BillingResult;
use super::types::{
    BatchStatus, FeatureDefinition, Invoice, LicenseBatch, MetricType, ParkedSubscription, Plan,
    Subscription, UsageMetric, WebhookEventRecord,
};

/// Aggregate a caller serializes on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockKey {
    Batch(Uuid),
    User(String),
    Organization(Uuid),
    Subscription(Uuid),
    WebhookEvent(String),
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Batch(id) => write!(f, "batch:{}", id),
            Self::User(id) => write!(f, "user:{}", id),
            Self::Organization(id) => write!(f, "organization:{}", id),
            Self::Subscription(id) => write!(f, "subscription:{}", id),
            Self::WebhookEvent(id) => write!(f, "webhook_event:{}", id),
        }
    }
}

/// Guard for a [`LockKey`]. The lock is released on drop.
pub struct StoreLock {
    _guard: Box<dyn Any + Send>,
}

impl StoreLock {
    #[must_use]
    pub fn new(guard: impl Any + Send) -> Self {
        Self {
            _guard: Box::new(guard),
        }
    }
}

impl fmt::Debug for StoreLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StoreLock")
    }
}

/// Persistence for plans, subscriptions, batches, usage and webhook records.
///
/// Non-null upstream identifiers are unique: inserting or updating a row whose
/// upstream subscription, product or price ID is already used elsewhere fails
/// with [`BillingError::DuplicateUpstreamId`](super::BillingError::DuplicateUpstreamId).
/// `None` never conflicts.
#[async_trait]
pub trait BillingStore: Send + Sync {
    // Locking

    /// Serialize mutations of one aggregate until the returned guard drops.
    async fn lock(&self, key: LockKey) -> BillingResult<StoreLock>;

    // Plans and catalog

    async fn insert_plan(&self, plan: &Plan) -> BillingResult<()>;

    async fn update_plan(&self, plan: &Plan) -> BillingResult<()>;

    async fn get_plan(&self, plan_id: Uuid) -> BillingResult<Option<Plan>>;

    async fn list_plans(&self) -> BillingResult<Vec<Plan>>;

    async fn find_plan_by_upstream_price(&self, price_id: &str) -> BillingResult<Option<Plan>>;

    /// Insert a feature definition unless the key exists. Returns whether a row was written.
    async fn insert_feature_if_absent(&self, feature: &FeatureDefinition) -> BillingResult<bool>;

    async fn get_feature(&self, key: &str) -> BillingResult<Option<FeatureDefinition>>;

    async fn list_features(&self) -> BillingResult<Vec<FeatureDefinition>>;

    // Customers

    /// Gateway customer linked to a user or organization.
    async fn get_upstream_customer_id(&self, owner_id: &str) -> BillingResult<Option<String>>;

    async fn set_upstream_customer_id(&self, owner_id: &str, customer_id: &str) -> BillingResult<()>;

    // Subscriptions

    async fn insert_subscription(&self, subscription: &Subscription) -> BillingResult<()>;

    async fn update_subscription(&self, subscription: &Subscription) -> BillingResult<()>;

    async fn get_subscription(&self, id: Uuid) -> BillingResult<Option<Subscription>>;

    async fn find_subscription_by_upstream_id(
        &self,
        upstream_subscription_id: &str,
    ) -> BillingResult<Option<Subscription>>;

    /// Personal, assigned and license rows held by a user, newest first.
    async fn list_user_subscriptions(&self, user_id: &str) -> BillingResult<Vec<Subscription>>;

    /// Subscriptions of an organization, newest first.
    async fn list_organization_subscriptions(
        &self,
        organization_id: Uuid,
    ) -> BillingResult<Vec<Subscription>>;

    async fn list_subscriptions(&self) -> BillingResult<Vec<Subscription>>;

    /// Mark every entitled personal/assigned subscription of the user as
    /// replaced and insert `replacement`, atomically. Returns the replaced rows.
    async fn replace_user_subscriptions(
        &self,
        user_id: &str,
        replacement: &Subscription,
        now: DateTime<Utc>,
    ) -> BillingResult<Vec<Subscription>>;

    // License batches

    /// Insert a batch together with all of its license rows.
    async fn insert_batch_with_licenses(
        &self,
        batch: &LicenseBatch,
        licenses: &[Subscription],
    ) -> BillingResult<()>;

    async fn get_batch(&self, batch_id: Uuid) -> BillingResult<Option<LicenseBatch>>;

    async fn update_batch(&self, batch: &LicenseBatch) -> BillingResult<()>;

    async fn find_batch_by_upstream_id(
        &self,
        upstream_subscription_id: &str,
    ) -> BillingResult<Option<LicenseBatch>>;

    async fn list_batches(&self) -> BillingResult<Vec<LicenseBatch>>;

    async fn list_batches_by_purchaser(&self, purchaser_user_id: &str) -> BillingResult<Vec<LicenseBatch>>;

    async fn list_batch_licenses(&self, batch_id: Uuid) -> BillingResult<Vec<Subscription>>;

    /// Give one unassigned license of the batch to `user_id` and bump
    /// `assigned_quantity`. Fails with `NoAvailableLicenses` when none is free.
    async fn claim_unassigned_license(
        &self,
        batch_id: Uuid,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<Subscription>;

    /// Return an assigned license to the pool and decrement `assigned_quantity`.
    /// Fails with `InvalidStateTransition` unless both the license and its
    /// batch are active.
    async fn release_license(&self, license_id: Uuid, now: DateTime<Utc>) -> BillingResult<Subscription>;

    /// Set `total_quantity`, adding or removing unassigned license rows.
    /// Fails with `QuantityBelowAssigned` when `new_quantity < assigned_quantity`.
    async fn resize_batch(
        &self,
        batch_id: Uuid,
        new_quantity: i32,
        now: DateTime<Utc>,
    ) -> BillingResult<LicenseBatch>;

    /// Move a batch to `status` and cascade to its licenses: activation
    /// releases pending licenses into the pool, cancellation or expiry
    /// cancels every license.
    async fn set_batch_status(
        &self,
        batch_id: Uuid,
        status: BatchStatus,
        now: DateTime<Utc>,
    ) -> BillingResult<LicenseBatch>;

    /// Hard-delete a batch and its licenses.
    async fn delete_batch(&self, batch_id: Uuid) -> BillingResult<()>;

    // Usage

    /// Insert or replace the row for `(user_id, metric_type)`.
    async fn upsert_usage_metric(&self, metric: &UsageMetric) -> BillingResult<()>;

    /// Insert the row for `(user_id, metric_type)` unless one exists.
    /// Returns whether this call inserted it.
    async fn insert_usage_metric_if_absent(&self, metric: &UsageMetric) -> BillingResult<bool>;

    async fn get_usage_metric(
        &self,
        user_id: &str,
        metric_type: MetricType,
    ) -> BillingResult<Option<UsageMetric>>;

    async fn list_usage_metrics(&self, user_id: &str) -> BillingResult<Vec<UsageMetric>>;

    /// Atomically add `delta`, first resetting the counter when `now` lies
    /// past the stored period. Returns `None` when no row exists.
    async fn increment_usage(
        &self,
        user_id: &str,
        metric_type: MetricType,
        delta: i64,
        now: DateTime<Utc>,
    ) -> BillingResult<Option<UsageMetric>>;

    // Webhooks

    async fn get_webhook_event(&self, event_id: &str) -> BillingResult<Option<WebhookEventRecord>>;

    /// Insert `record` unless a record for its event already exists.
    /// Returns whether this call inserted it.
    async fn claim_webhook_event(&self, record: &WebhookEventRecord) -> BillingResult<bool>;

    /// Mark a claimed event `processed` at `at`.
    async fn complete_webhook_event(&self, event_id: &str, at: DateTime<Utc>) -> BillingResult<()>;

    /// Drop a claim still in `processing`. Processed records are kept.
    async fn release_webhook_event(&self, event_id: &str) -> BillingResult<()>;

    /// Delete dedup records whose `expires_at` is before `now`.
    async fn delete_expired_webhook_events(&self, now: DateTime<Utc>) -> BillingResult<u64>;

    /// Insert or replace a parked upstream subscription.
    async fn park_subscription(&self, parked: &ParkedSubscription) -> BillingResult<()>;

    async fn list_parked_subscriptions(&self) -> BillingResult<Vec<ParkedSubscription>>;

    async fn remove_parked_subscription(&self, upstream_subscription_id: &str) -> BillingResult<()>;

    /// Insert or replace an invoice keyed by its upstream ID.
    async fn upsert_invoice(&self, invoice: &Invoice) -> BillingResult<()>;

    async fn get_invoice_by_upstream_id(&self, upstream_invoice_id: &str) -> BillingResult<Option<Invoice>>;

    async fn list_invoices(&self) -> BillingResult<Vec<Invoice>>;
}

/// Lock guarding the aggregate that holds `subscription`.
///
/// Callers that also lock the subscription itself take this one first.
pub(crate) fn holder_lock_key(subscription: &Subscription) -> LockKey {
    use super::types::SubscriptionScope;

    match &subscription.scope {
        SubscriptionScope::User { user_id, .. } => LockKey::User(user_id.clone()),
        SubscriptionScope::License { batch_id, .. } => LockKey::Batch(*batch_id),
        SubscriptionScope::Organization {
            organization_id, ..
        } => LockKey::Organization(*organization_id),
    }
}

/// Key a subscription's upstream customer belongs to.
pub(crate) fn customer_owner(subscription: &Subscription) -> String {
    use super::types::SubscriptionScope;

    match &subscription.scope {
        SubscriptionScope::User { user_id, .. } => user_id.clone(),
        SubscriptionScope::License {
            purchaser_user_id, ..
        } => purchaser_user_id.clone(),
        SubscriptionScope::Organization {
            organization_id, ..
        } => organization_id.to_string(),
    }
}

/// In-memory implementation for tests.
#[cfg(any(test, feature = "test-billing"))]
pub mod test {
    use super::*;
    use crate::billing::error::BillingError;
    use crate::billing::types::{
        SubscriptionScope, SubscriptionStatus, SubscriptionType, WebhookEventStatus,
    };
    use crate::billing::usage::monthly_period;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::{Arc, Mutex as StdMutex};
    use tokio::sync::{Mutex, RwLock};

    /// In-memory billing store for testing.
    ///
    /// All tables sit behind one lock so composite operations are atomic.
    /// Wraps data in Arc for cheap cloning.
    #[derive(Default, Clone)]
    pub struct InMemoryBillingStore {
        inner: Arc<InMemoryBillingStoreInner>,
    }

    #[derive(Default)]
    struct InMemoryBillingStoreInner {
        tables: RwLock<Tables>,
        locks: Mutex<HashMap<LockKey, Arc<Mutex<()>>>>,
        faults: StdMutex<Vec<(&'static str, BillingError)>>,
    }

    #[derive(Default)]
    struct Tables {
        plans: HashMap<Uuid, Plan>,
        features: BTreeMap<String, FeatureDefinition>,
        customers: HashMap<String, String>,
        subscriptions: HashMap<Uuid, Subscription>,
        batches: HashMap<Uuid, LicenseBatch>,
        usage: HashMap<(String, MetricType), UsageMetric>,
        webhook_events: HashMap<String, WebhookEventRecord>,
        parked: HashMap<String, ParkedSubscription>,
        invoices: HashMap<String, Invoice>,
    }

    impl Tables {
        fn check_plan_unique(&self, plan: &Plan) -> BillingResult<()> {
            for other in self.plans.values().filter(|p| p.id != plan.id) {
                if plan.upstream_product_id.is_some()
                    && other.upstream_product_id == plan.upstream_product_id
                {
                    return Err(duplicate("upstream_product_id", &plan.upstream_product_id));
                }
                if plan.upstream_price_id.is_some()
                    && other.upstream_price_id == plan.upstream_price_id
                {
                    return Err(duplicate("upstream_price_id", &plan.upstream_price_id));
                }
            }
            Ok(())
        }

        fn check_subscription_unique(&self, sub: &Subscription) -> BillingResult<()> {
            let owner = customer_owner(sub);
            for other in self.subscriptions.values().filter(|s| s.id != sub.id) {
                if sub.upstream_subscription_id.is_some()
                    && other.upstream_subscription_id == sub.upstream_subscription_id
                {
                    return Err(duplicate(
                        "upstream_subscription_id",
                        &sub.upstream_subscription_id,
                    ));
                }
                if sub.upstream_customer_id.is_some()
                    && other.upstream_customer_id == sub.upstream_customer_id
                    && customer_owner(other) != owner
                {
                    return Err(duplicate("upstream_customer_id", &sub.upstream_customer_id));
                }
            }
            Ok(())
        }

        fn check_batch_unique(&self, batch: &LicenseBatch) -> BillingResult<()> {
            if batch.upstream_subscription_id.is_some()
                && self.batches.values().any(|b| {
                    b.id != batch.id && b.upstream_subscription_id == batch.upstream_subscription_id
                })
            {
                return Err(duplicate(
                    "batch upstream_subscription_id",
                    &batch.upstream_subscription_id,
                ));
            }
            Ok(())
        }

        fn licenses_of(&self, batch_id: Uuid) -> Vec<Subscription> {
            let mut licenses: Vec<Subscription> = self
                .subscriptions
                .values()
                .filter(|s| s.batch_id() == Some(batch_id))
                .cloned()
                .collect();
            licenses.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
            licenses
        }
    }

    fn duplicate(field: &str, value: &Option<String>) -> BillingError {
        BillingError::DuplicateUpstreamId {
            field: field.to_string(),
            value: value.clone().unwrap_or_default(),
        }
    }

    fn newest_first(mut subs: Vec<Subscription>) -> Vec<Subscription> {
        subs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        subs
    }

    impl InMemoryBillingStore {
        /// Create a new in-memory store.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Number of subscription rows (for testing).
        pub async fn subscription_count(&self) -> usize {
            self.inner.tables.read().await.subscriptions.len()
        }

        /// IDs of processed webhook events (for testing).
        pub async fn processed_event_ids(&self) -> Vec<String> {
            self.inner
                .tables
                .read()
                .await
                .webhook_events
                .values()
                .filter(|r| r.status == WebhookEventStatus::Processed)
                .map(|r| r.event_id.clone())
                .collect()
        }

        /// Make the next call to `operation` fail with `error`.
        ///
        /// Supported operations: `complete_webhook_event`, `resize_batch`.
        pub fn fail_next(&self, operation: &'static str, error: BillingError) {
            self.inner.faults.lock().unwrap().push((operation, error));
        }

        fn injected_fault(&self, operation: &str) -> BillingResult<()> {
            let mut faults = self.inner.faults.lock().unwrap();
            match faults.iter().position(|(op, _)| *op == operation) {
                Some(index) => Err(faults.remove(index).1),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl BillingStore for InMemoryBillingStore {
        async fn lock(&self, key: LockKey) -> BillingResult<StoreLock> {
            let mutex = {
                let mut locks = self.inner.locks.lock().await;
                locks.entry(key).or_default().clone()
            };
            Ok(StoreLock::new(mutex.lock_owned().await))
        }

        async fn insert_plan(&self, plan: &Plan) -> BillingResult<()> {
            let mut tables = self.inner.tables.write().await;
            tables.check_plan_unique(plan)?;
            tables.plans.insert(plan.id, plan.clone());
            Ok(())
        }

        async fn update_plan(&self, plan: &Plan) -> BillingResult<()> {
            let mut tables = self.inner.tables.write().await;
            if !tables.plans.contains_key(&plan.id) {
                return Err(BillingError::PlanNotFound {
                    id: plan.id.to_string(),
                });
            }
            tables.check_plan_unique(plan)?;
            tables.plans.insert(plan.id, plan.clone());
            Ok(())
        }

        async fn get_plan(&self, plan_id: Uuid) -> BillingResult<Option<Plan>> {
            Ok(self.inner.tables.read().await.plans.get(&plan_id).cloned())
        }

        async fn list_plans(&self) -> BillingResult<Vec<Plan>> {
            let mut plans: Vec<Plan> = self.inner.tables.read().await.plans.values().cloned().collect();
            plans.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.name.cmp(&b.name)));
            Ok(plans)
        }

        async fn find_plan_by_upstream_price(&self, price_id: &str) -> BillingResult<Option<Plan>> {
            Ok(self
                .inner
                .tables
                .read()
                .await
                .plans
                .values()
                .find(|p| p.upstream_price_id.as_deref() == Some(price_id))
                .cloned())
        }

        async fn insert_feature_if_absent(&self, feature: &FeatureDefinition) -> BillingResult<bool> {
            let mut tables = self.inner.tables.write().await;
            if tables.features.contains_key(&feature.key) {
                return Ok(false);
            }
            tables.features.insert(feature.key.clone(), feature.clone());
            Ok(true)
        }

        async fn get_feature(&self, key: &str) -> BillingResult<Option<FeatureDefinition>> {
            Ok(self.inner.tables.read().await.features.get(key).cloned())
        }

        async fn list_features(&self) -> BillingResult<Vec<FeatureDefinition>> {
            Ok(self.inner.tables.read().await.features.values().cloned().collect())
        }

        async fn get_upstream_customer_id(&self, owner_id: &str) -> BillingResult<Option<String>> {
            Ok(self.inner.tables.read().await.customers.get(owner_id).cloned())
        }

        async fn set_upstream_customer_id(&self, owner_id: &str, customer_id: &str) -> BillingResult<()> {
            let mut tables = self.inner.tables.write().await;
            if tables
                .customers
                .iter()
                .any(|(owner, customer)| owner != owner_id && customer == customer_id)
            {
                return Err(BillingError::DuplicateUpstreamId {
                    field: "upstream_customer_id".to_string(),
                    value: customer_id.to_string(),
                });
            }
            tables
                .customers
                .insert(owner_id.to_string(), customer_id.to_string());
            Ok(())
        }

        async fn insert_subscription(&self, subscription: &Subscription) -> BillingResult<()> {
            let mut tables = self.inner.tables.write().await;
            tables.check_subscription_unique(subscription)?;
            tables
                .subscriptions
                .insert(subscription.id, subscription.clone());
            Ok(())
        }

        async fn update_subscription(&self, subscription: &Subscription) -> BillingResult<()> {
            let mut tables = self.inner.tables.write().await;
            if !tables.subscriptions.contains_key(&subscription.id) {
                return Err(BillingError::SubscriptionNotFound {
                    id: subscription.id.to_string(),
                });
            }
            tables.check_subscription_unique(subscription)?;
            tables
                .subscriptions
                .insert(subscription.id, subscription.clone());
            Ok(())
        }

        async fn get_subscription(&self, id: Uuid) -> BillingResult<Option<Subscription>> {
            Ok(self.inner.tables.read().await.subscriptions.get(&id).cloned())
        }

        async fn find_subscription_by_upstream_id(
            &self,
            upstream_subscription_id: &str,
        ) -> BillingResult<Option<Subscription>> {
            Ok(self
                .inner
                .tables
                .read()
                .await
                .subscriptions
                .values()
                .find(|s| s.upstream_subscription_id.as_deref() == Some(upstream_subscription_id))
                .cloned())
        }

        async fn list_user_subscriptions(&self, user_id: &str) -> BillingResult<Vec<Subscription>> {
            let tables = self.inner.tables.read().await;
            Ok(newest_first(
                tables
                    .subscriptions
                    .values()
                    .filter(|s| s.user_id() == Some(user_id))
                    .cloned()
                    .collect(),
            ))
        }

        async fn list_organization_subscriptions(
            &self,
            organization_id: Uuid,
        ) -> BillingResult<Vec<Subscription>> {
            let tables = self.inner.tables.read().await;
            Ok(newest_first(
                tables
                    .subscriptions
                    .values()
                    .filter(|s| s.organization_id() == Some(organization_id))
                    .cloned()
                    .collect(),
            ))
        }

        async fn list_subscriptions(&self) -> BillingResult<Vec<Subscription>> {
            let tables = self.inner.tables.read().await;
            Ok(newest_first(tables.subscriptions.values().cloned().collect()))
        }

        async fn replace_user_subscriptions(
            &self,
            user_id: &str,
            replacement: &Subscription,
            now: DateTime<Utc>,
        ) -> BillingResult<Vec<Subscription>> {
            let mut tables = self.inner.tables.write().await;
            tables.check_subscription_unique(replacement)?;

            let mut replaced = Vec::new();
            for sub in tables.subscriptions.values_mut() {
                let is_users = matches!(
                    &sub.scope,
                    SubscriptionScope::User { user_id: owner, .. } if owner == user_id
                );
                if is_users && sub.is_entitled() {
                    sub.mark_replaced(now);
                    replaced.push(sub.clone());
                }
            }
            tables
                .subscriptions
                .insert(replacement.id, replacement.clone());
            Ok(replaced)
        }

        async fn insert_batch_with_licenses(
            &self,
            batch: &LicenseBatch,
            licenses: &[Subscription],
        ) -> BillingResult<()> {
            let mut tables = self.inner.tables.write().await;
            tables.check_batch_unique(batch)?;
            tables.batches.insert(batch.id, batch.clone());
            for license in licenses {
                tables.subscriptions.insert(license.id, license.clone());
            }
            Ok(())
        }

        async fn get_batch(&self, batch_id: Uuid) -> BillingResult<Option<LicenseBatch>> {
            Ok(self.inner.tables.read().await.batches.get(&batch_id).cloned())
        }

        async fn update_batch(&self, batch: &LicenseBatch) -> BillingResult<()> {
            let mut tables = self.inner.tables.write().await;
            if !tables.batches.contains_key(&batch.id) {
                return Err(BillingError::BatchNotFound {
                    id: batch.id.to_string(),
                });
            }
            tables.check_batch_unique(batch)?;
            tables.batches.insert(batch.id, batch.clone());
            Ok(())
        }

        async fn find_batch_by_upstream_id(
            &self,
            upstream_subscription_id: &str,
        ) -> BillingResult<Option<LicenseBatch>> {
            Ok(self
                .inner
                .tables
                .read()
                .await
                .batches
                .values()
                .find(|b| b.upstream_subscription_id.as_deref() == Some(upstream_subscription_id))
                .cloned())
        }

        async fn list_batches(&self) -> BillingResult<Vec<LicenseBatch>> {
            let mut batches: Vec<LicenseBatch> =
                self.inner.tables.read().await.batches.values().cloned().collect();
            batches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok(batches)
        }

        async fn list_batches_by_purchaser(&self, purchaser_user_id: &str) -> BillingResult<Vec<LicenseBatch>> {
            let mut batches: Vec<LicenseBatch> = self
                .inner
                .tables
                .read()
                .await
                .batches
                .values()
                .filter(|b| b.purchaser_user_id == purchaser_user_id)
                .cloned()
                .collect();
            batches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok(batches)
        }

        async fn list_batch_licenses(&self, batch_id: Uuid) -> BillingResult<Vec<Subscription>> {
            Ok(self.inner.tables.read().await.licenses_of(batch_id))
        }

        async fn claim_unassigned_license(
            &self,
            batch_id: Uuid,
            user_id: &str,
            now: DateTime<Utc>,
        ) -> BillingResult<Subscription> {
            let mut tables = self.inner.tables.write().await;
            if !tables.batches.contains_key(&batch_id) {
                return Err(BillingError::BatchNotFound {
                    id: batch_id.to_string(),
                });
            }

            let free = tables
                .licenses_of(batch_id)
                .into_iter()
                .find(|l| l.status == SubscriptionStatus::Unassigned && l.user_id().is_none())
                .ok_or_else(|| BillingError::NoAvailableLicenses {
                    batch_id: batch_id.to_string(),
                })?;

            let mut license = free;
            if let SubscriptionScope::License { user_id: slot, .. } = &mut license.scope {
                *slot = Some(user_id.to_string());
            }
            license.status = SubscriptionStatus::Active;
            license.updated_at = now;
            tables.subscriptions.insert(license.id, license.clone());

            if let Some(batch) = tables.batches.get_mut(&batch_id) {
                batch.assigned_quantity += 1;
                batch.updated_at = now;
            }
            Ok(license)
        }

        async fn release_license(&self, license_id: Uuid, now: DateTime<Utc>) -> BillingResult<Subscription> {
            let mut tables = self.inner.tables.write().await;
            let mut license = tables
                .subscriptions
                .get(&license_id)
                .filter(|s| s.batch_id().is_some())
                .cloned()
                .ok_or_else(|| BillingError::LicenseNotFound {
                    id: license_id.to_string(),
                })?;
            let batch_active = license
                .batch_id()
                .and_then(|id| tables.batches.get(&id))
                .is_some_and(|b| b.status == BatchStatus::Active);
            if license.status != SubscriptionStatus::Active || !batch_active {
                return Err(BillingError::invalid_transition(
                    license.status,
                    SubscriptionStatus::Unassigned,
                ));
            }

            let batch_id = match &mut license.scope {
                SubscriptionScope::License {
                    batch_id,
                    user_id: slot @ Some(_),
                    ..
                } => {
                    *slot = None;
                    *batch_id
                }
                _ => {
                    return Err(BillingError::invalid_transition(
                        license.status,
                        SubscriptionStatus::Unassigned,
                    ));
                }
            };
            license.status = SubscriptionStatus::Unassigned;
            license.updated_at = now;
            tables.subscriptions.insert(license.id, license.clone());

            if let Some(batch) = tables.batches.get_mut(&batch_id) {
                batch.assigned_quantity = (batch.assigned_quantity - 1).max(0);
                batch.updated_at = now;
            }
            Ok(license)
        }

        async fn resize_batch(
            &self,
            batch_id: Uuid,
            new_quantity: i32,
            now: DateTime<Utc>,
        ) -> BillingResult<LicenseBatch> {
            self.injected_fault("resize_batch")?;
            let mut tables = self.inner.tables.write().await;
            let mut batch = tables
                .batches
                .get(&batch_id)
                .cloned()
                .ok_or_else(|| BillingError::BatchNotFound {
                    id: batch_id.to_string(),
                })?;
            if new_quantity < batch.assigned_quantity {
                return Err(BillingError::QuantityBelowAssigned {
                    requested: new_quantity,
                    assigned: batch.assigned_quantity,
                });
            }

            let licenses = tables.licenses_of(batch_id);
            let current = licenses.len() as i32;
            if new_quantity > current {
                let status = if batch.status == BatchStatus::Active {
                    SubscriptionStatus::Unassigned
                } else {
                    SubscriptionStatus::PendingPayment
                };
                for _ in current..new_quantity {
                    let mut license = Subscription::new(
                        batch.plan_id,
                        SubscriptionScope::License {
                            batch_id,
                            purchaser_user_id: batch.purchaser_user_id.clone(),
                            user_id: None,
                        },
                        status,
                        batch.current_period_start,
                        batch.current_period_end,
                    );
                    license.created_at = now;
                    license.updated_at = now;
                    tables.subscriptions.insert(license.id, license);
                }
            } else {
                let surplus = (current - new_quantity) as usize;
                let removable: Vec<Uuid> = licenses
                    .iter()
                    .rev()
                    .filter(|l| l.user_id().is_none())
                    .take(surplus)
                    .map(|l| l.id)
                    .collect();
                for id in removable {
                    tables.subscriptions.remove(&id);
                }
            }

            batch.total_quantity = new_quantity;
            batch.updated_at = now;
            tables.batches.insert(batch_id, batch.clone());
            Ok(batch)
        }

        async fn set_batch_status(
            &self,
            batch_id: Uuid,
            status: BatchStatus,
            now: DateTime<Utc>,
        ) -> BillingResult<LicenseBatch> {
            let mut tables = self.inner.tables.write().await;
            let mut batch = tables
                .batches
                .get(&batch_id)
                .cloned()
                .ok_or_else(|| BillingError::BatchNotFound {
                    id: batch_id.to_string(),
                })?;

            for license in tables
                .subscriptions
                .values_mut()
                .filter(|s| s.batch_id() == Some(batch_id))
            {
                match status {
                    BatchStatus::Active if license.status == SubscriptionStatus::PendingPayment => {
                        license.status = SubscriptionStatus::Unassigned;
                        license.updated_at = now;
                    }
                    BatchStatus::Cancelled | BatchStatus::Expired => license.mark_cancelled(now),
                    _ => {}
                }
            }

            batch.status = status;
            batch.updated_at = now;
            if matches!(status, BatchStatus::Cancelled | BatchStatus::Expired) {
                batch.assigned_quantity = 0;
                batch.cancelled_at.get_or_insert(now);
            }
            tables.batches.insert(batch_id, batch.clone());
            Ok(batch)
        }

        async fn delete_batch(&self, batch_id: Uuid) -> BillingResult<()> {
            let mut tables = self.inner.tables.write().await;
            if tables.batches.remove(&batch_id).is_none() {
                return Err(BillingError::BatchNotFound {
                    id: batch_id.to_string(),
                });
            }
            tables
                .subscriptions
                .retain(|_, s| s.batch_id() != Some(batch_id));
            Ok(())
        }

        async fn upsert_usage_metric(&self, metric: &UsageMetric) -> BillingResult<()> {
            self.inner
                .tables
                .write()
                .await
                .usage
                .insert((metric.user_id.clone(), metric.metric_type), metric.clone());
            Ok(())
        }

        async fn insert_usage_metric_if_absent(&self, metric: &UsageMetric) -> BillingResult<bool> {
            let mut tables = self.inner.tables.write().await;
            let key = (metric.user_id.clone(), metric.metric_type);
            if tables.usage.contains_key(&key) {
                return Ok(false);
            }
            tables.usage.insert(key, metric.clone());
            Ok(true)
        }

        async fn get_usage_metric(
            &self,
            user_id: &str,
            metric_type: MetricType,
        ) -> BillingResult<Option<UsageMetric>> {
            Ok(self
                .inner
                .tables
                .read()
                .await
                .usage
                .get(&(user_id.to_string(), metric_type))
                .cloned())
        }

        async fn list_usage_metrics(&self, user_id: &str) -> BillingResult<Vec<UsageMetric>> {
            let mut metrics: Vec<UsageMetric> = self
                .inner
                .tables
                .read()
                .await
                .usage
                .values()
                .filter(|m| m.user_id == user_id)
                .cloned()
                .collect();
            metrics.sort_by_key(|m| m.metric_type);
            Ok(metrics)
        }

        async fn increment_usage(
            &self,
            user_id: &str,
            metric_type: MetricType,
            delta: i64,
            now: DateTime<Utc>,
        ) -> BillingResult<Option<UsageMetric>> {
            let mut tables = self.inner.tables.write().await;
            let Some(metric) = tables.usage.get_mut(&(user_id.to_string(), metric_type)) else {
                return Ok(None);
            };
            if now >= metric.period_end {
                let (start, end) = monthly_period(now);
                metric.current_value = 0;
                metric.period_start = start;
                metric.period_end = end;
            }
            metric.current_value += delta;
            metric.last_updated = now;
            Ok(Some(metric.clone()))
        }

        async fn get_webhook_event(&self, event_id: &str) -> BillingResult<Option<WebhookEventRecord>> {
            Ok(self
                .inner
                .tables
                .read()
                .await
                .webhook_events
                .get(event_id)
                .cloned())
        }

        async fn claim_webhook_event(&self, record: &WebhookEventRecord) -> BillingResult<bool> {
            let mut tables = self.inner.tables.write().await;
            if tables.webhook_events.contains_key(&record.event_id) {
                return Ok(false);
            }
            tables
                .webhook_events
                .insert(record.event_id.clone(), record.clone());
            Ok(true)
        }

        async fn complete_webhook_event(&self, event_id: &str, at: DateTime<Utc>) -> BillingResult<()> {
            self.injected_fault("complete_webhook_event")?;
            let mut tables = self.inner.tables.write().await;
            if let Some(record) = tables.webhook_events.get_mut(event_id) {
                record.status = WebhookEventStatus::Processed;
                record.processed_at = at;
            }
            Ok(())
        }

        async fn release_webhook_event(&self, event_id: &str) -> BillingResult<()> {
            self.inner
                .tables
                .write()
                .await
                .webhook_events
                .retain(|id, r| id != event_id || r.status != WebhookEventStatus::Processing);
            Ok(())
        }

        async fn delete_expired_webhook_events(&self, now: DateTime<Utc>) -> BillingResult<u64> {
            let mut tables = self.inner.tables.write().await;
            let before = tables.webhook_events.len();
            tables.webhook_events.retain(|_, r| r.expires_at >= now);
            Ok((before - tables.webhook_events.len()) as u64)
        }

        async fn park_subscription(&self, parked: &ParkedSubscription) -> BillingResult<()> {
            self.inner
                .tables
                .write()
                .await
                .parked
                .insert(parked.upstream_subscription_id.clone(), parked.clone());
            Ok(())
        }

        async fn list_parked_subscriptions(&self) -> BillingResult<Vec<ParkedSubscription>> {
            let mut parked: Vec<ParkedSubscription> =
                self.inner.tables.read().await.parked.values().cloned().collect();
            parked.sort_by(|a, b| a.parked_at.cmp(&b.parked_at));
            Ok(parked)
        }

        async fn remove_parked_subscription(&self, upstream_subscription_id: &str) -> BillingResult<()> {
            self.inner
                .tables
                .write()
                .await
                .parked
                .remove(upstream_subscription_id);
            Ok(())
        }

        async fn upsert_invoice(&self, invoice: &Invoice) -> BillingResult<()> {
            self.inner
                .tables
                .write()
                .await
                .invoices
                .insert(invoice.upstream_invoice_id.clone(), invoice.clone());
            Ok(())
        }

        async fn get_invoice_by_upstream_id(&self, upstream_invoice_id: &str) -> BillingResult<Option<Invoice>> {
            Ok(self
                .inner
                .tables
                .read()
                .await
                .invoices
                .get(upstream_invoice_id)
                .cloned())
        }

        async fn list_invoices(&self) -> BillingResult<Vec<Invoice>> {
            let mut invoices: Vec<Invoice> =
                self.inner.tables.read().await.invoices.values().cloned().collect();
            invoices.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            Ok(invoices)
        }
    }

    /// Personal subscription fixture.
    #[must_use]
    pub fn personal_subscription(user_id: &str, plan_id: Uuid, status: SubscriptionStatus) -> Subscription {
        let now = Utc::now();
        Subscription::new(
            plan_id,
            SubscriptionScope::User {
                user_id: user_id.to_string(),
                kind: SubscriptionType::Personal,
            },
            status,
            now,
            now + chrono::Duration::days(30),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::test::{InMemoryBillingStore, personal_subscription};
    use super::*;
    use crate::billing::error::BillingError;
    use crate::billing::types::{SubscriptionScope, SubscriptionStatus, WebhookEventStatus};

    fn batch(total: i32) -> (LicenseBatch, Vec<Subscription>) {
        let now = Utc::now();
        let batch = LicenseBatch {
            id: Uuid::new_v4(),
            purchaser_user_id: "buyer".into(),
            plan_id: Uuid::new_v4(),
            group_id: None,
            upstream_subscription_id: Some(format!("sub_{}", Uuid::new_v4().simple())),
            upstream_customer_id: Some("cus_buyer".into()),
            total_quantity: total,
            assigned_quantity: 0,
            status: BatchStatus::Active,
            current_period_start: now,
            current_period_end: now + chrono::Duration::days(30),
            cancelled_at: None,
            last_event_at: None,
            created_at: now,
            updated_at: now,
        };
        let licenses = (0..total)
            .map(|_| {
                Subscription::new(
                    batch.plan_id,
                    SubscriptionScope::License {
                        batch_id: batch.id,
                        purchaser_user_id: "buyer".into(),
                        user_id: None,
                    },
                    SubscriptionStatus::Unassigned,
                    now,
                    batch.current_period_end,
                )
            })
            .collect();
        (batch, licenses)
    }

    #[tokio::test]
    async fn test_null_upstream_ids_never_conflict() {
        let store = InMemoryBillingStore::new();
        let plan_id = Uuid::new_v4();
        for user in ["u1", "u2", "u3"] {
            store
                .insert_subscription(&personal_subscription(user, plan_id, SubscriptionStatus::Active))
                .await
                .unwrap();
        }
        assert_eq!(store.subscription_count().await, 3);
    }

    #[tokio::test]
    async fn test_duplicate_upstream_id_rejected() {
        let store = InMemoryBillingStore::new();
        let plan_id = Uuid::new_v4();
        let mut first = personal_subscription("u1", plan_id, SubscriptionStatus::Active);
        first.upstream_subscription_id = Some("sub_1".into());
        store.insert_subscription(&first).await.unwrap();

        let mut second = personal_subscription("u2", plan_id, SubscriptionStatus::Active);
        second.upstream_subscription_id = Some("sub_1".into());
        let err = store.insert_subscription(&second).await.unwrap_err();
        assert!(matches!(err, BillingError::DuplicateUpstreamId { .. }));
    }

    #[tokio::test]
    async fn test_customer_id_shared_by_same_owner_only() {
        let store = InMemoryBillingStore::new();
        let plan_id = Uuid::new_v4();
        let mut old = personal_subscription("u1", plan_id, SubscriptionStatus::Cancelled);
        old.upstream_customer_id = Some("cus_1".into());
        store.insert_subscription(&old).await.unwrap();

        let mut renewed = personal_subscription("u1", plan_id, SubscriptionStatus::Active);
        renewed.upstream_customer_id = Some("cus_1".into());
        store.insert_subscription(&renewed).await.unwrap();

        let mut other = personal_subscription("u2", plan_id, SubscriptionStatus::Active);
        other.upstream_customer_id = Some("cus_1".into());
        assert!(store.insert_subscription(&other).await.is_err());
    }

    #[tokio::test]
    async fn test_claim_and_release_keep_counters() {
        let store = InMemoryBillingStore::new();
        let (batch, licenses) = batch(2);
        store.insert_batch_with_licenses(&batch, &licenses).await.unwrap();

        let now = Utc::now();
        let first = store.claim_unassigned_license(batch.id, "alice", now).await.unwrap();
        store.claim_unassigned_license(batch.id, "bob", now).await.unwrap();
        let err = store
            .claim_unassigned_license(batch.id, "carol", now)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::NoAvailableLicenses { .. }));
        assert_eq!(store.get_batch(batch.id).await.unwrap().unwrap().assigned_quantity, 2);

        let released = store.release_license(first.id, now).await.unwrap();
        assert_eq!(released.status, SubscriptionStatus::Unassigned);
        assert_eq!(released.user_id(), None);
        assert_eq!(store.get_batch(batch.id).await.unwrap().unwrap().assigned_quantity, 1);
    }

    #[tokio::test]
    async fn test_resize_batch() {
        let store = InMemoryBillingStore::new();
        let (batch, licenses) = batch(5);
        store.insert_batch_with_licenses(&batch, &licenses).await.unwrap();
        let now = Utc::now();
        for user in ["a", "b", "c"] {
            store.claim_unassigned_license(batch.id, user, now).await.unwrap();
        }

        let err = store.resize_batch(batch.id, 2, now).await.unwrap_err();
        assert_eq!(
            err,
            BillingError::QuantityBelowAssigned {
                requested: 2,
                assigned: 3
            }
        );
        assert_eq!(store.list_batch_licenses(batch.id).await.unwrap().len(), 5);

        let resized = store.resize_batch(batch.id, 3, now).await.unwrap();
        assert_eq!(resized.total_quantity, 3);
        let remaining = store.list_batch_licenses(batch.id).await.unwrap();
        assert_eq!(remaining.len(), 3);
        assert!(remaining.iter().all(|l| l.user_id().is_some()));

        store.resize_batch(batch.id, 8, now).await.unwrap();
        assert_eq!(store.list_batch_licenses(batch.id).await.unwrap().len(), 8);
    }

    #[tokio::test]
    async fn test_lock_serializes_same_key() {
        let store = InMemoryBillingStore::new();
        let key = LockKey::User("u1".into());
        let guard = store.lock(key.clone()).await.unwrap();

        let contender = {
            let store = store.clone();
            let key = key.clone();
            tokio::spawn(async move { store.lock(key).await.map(|_| ()) })
        };
        tokio::task::yield_now().await;
        assert!(!contender.is_finished());

        // Other keys are independent
        let _other = store.lock(LockKey::User("u2".into())).await.unwrap();

        drop(guard);
        contender.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_increment_usage_rolls_period() {
        let store = InMemoryBillingStore::new();
        let now = Utc::now();
        let metric = UsageMetric {
            id: Uuid::new_v4(),
            user_id: "u1".into(),
            subscription_id: Uuid::new_v4(),
            metric_type: MetricType::CoursesCreated,
            current_value: 7,
            limit_value: 10,
            period_start: now - chrono::Duration::days(60),
            period_end: now - chrono::Duration::days(30),
            last_updated: now,
        };
        store.upsert_usage_metric(&metric).await.unwrap();

        let updated = store
            .increment_usage("u1", MetricType::CoursesCreated, 1, now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.current_value, 1);
        assert!(updated.period_end > now);

        assert!(
            store
                .increment_usage("nobody", MetricType::CoursesCreated, 1, now)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_release_requires_active_batch() {
        let store = InMemoryBillingStore::new();
        let (batch, licenses) = batch(2);
        store.insert_batch_with_licenses(&batch, &licenses).await.unwrap();
        let now = Utc::now();
        let license = store.claim_unassigned_license(batch.id, "alice", now).await.unwrap();
        store
            .set_batch_status(batch.id, BatchStatus::Cancelled, now)
            .await
            .unwrap();

        let err = store.release_license(license.id, now).await.unwrap_err();
        assert!(matches!(err, BillingError::InvalidStateTransition { .. }));
        let stored = store.get_subscription(license.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Cancelled);
        assert_eq!(stored.user_id(), Some("alice"));
        assert_eq!(store.get_batch(batch.id).await.unwrap().unwrap().assigned_quantity, 0);
    }

    #[tokio::test]
    async fn test_webhook_claim_lifecycle() {
        let store = InMemoryBillingStore::new();
        let now = Utc::now();
        let record = WebhookEventRecord {
            event_id: "evt_1".into(),
            event_type: "customer.subscription.created".into(),
            status: WebhookEventStatus::Processing,
            processed_at: now,
            expires_at: now + chrono::Duration::days(30),
            payload: None,
        };

        assert!(store.claim_webhook_event(&record).await.unwrap());
        assert!(!store.claim_webhook_event(&record).await.unwrap());
        assert!(store.processed_event_ids().await.is_empty());

        // Releasing an unfinished claim lets the event be claimed again
        store.release_webhook_event("evt_1").await.unwrap();
        assert!(store.claim_webhook_event(&record).await.unwrap());

        store.complete_webhook_event("evt_1", now).await.unwrap();
        store.release_webhook_event("evt_1").await.unwrap();
        assert_eq!(store.processed_event_ids().await, vec!["evt_1".to_string()]);
        assert!(!store.claim_webhook_event(&record).await.unwrap());
    }

    #[tokio::test]
    async fn test_usage_insert_if_absent_keeps_existing_row() {
        let store = InMemoryBillingStore::new();
        let now = Utc::now();
        let mut metric = UsageMetric {
            id: Uuid::new_v4(),
            user_id: "u1".into(),
            subscription_id: Uuid::new_v4(),
            metric_type: MetricType::CoursesCreated,
            current_value: 3,
            limit_value: 10,
            period_start: now,
            period_end: now + chrono::Duration::days(30),
            last_updated: now,
        };
        assert!(store.insert_usage_metric_if_absent(&metric).await.unwrap());

        metric.current_value = 0;
        assert!(!store.insert_usage_metric_if_absent(&metric).await.unwrap());
        let stored = store
            .get_usage_metric("u1", MetricType::CoursesCreated)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.current_value, 3);
    }
}

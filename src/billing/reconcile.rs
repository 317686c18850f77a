//! Backfill of local mirrors from the gateway.
//!
//! Every sweep handles subscriptions independently: a failure is recorded in
//! the result and the sweep moves on.

use serde::Serialize;

use super::context::BillingContext;
use super::error::{BillingError, BillingResult};
use super::gateway::{GatewayMetadata, GatewaySubscription};
use super::webhook::{Mirror, WebhookReconciler, merge_metadata};

/// One subscription a sweep could not reconcile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileFailure {
    pub upstream_subscription_id: String,
    pub reason: String,
}

/// Counters of a sweep. `created + updated + skipped + failed.len() == processed`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileResult {
    pub processed: usize,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: Vec<ReconcileFailure>,
}

impl ReconcileResult {
    #[must_use]
    pub fn total(&self) -> usize {
        self.created + self.updated + self.skipped + self.failed.len()
    }

    fn fail(&mut self, upstream_subscription_id: &str, reason: impl Into<String>) {
        self.processed += 1;
        self.failed.push(ReconcileFailure {
            upstream_subscription_id: upstream_subscription_id.to_string(),
            reason: reason.into(),
        });
    }

    fn record(&mut self, upstream_subscription_id: &str, outcome: BillingResult<Mirror>) {
        match outcome {
            Ok(Mirror::Created) => {
                self.processed += 1;
                self.created += 1;
            }
            Ok(Mirror::Updated) => {
                self.processed += 1;
                self.updated += 1;
            }
            Ok(Mirror::Parked) => {
                self.processed += 1;
                self.skipped += 1;
            }
            Err(e) => {
                tracing::warn!(
                    target: "tollgate::billing::reconcile",
                    upstream_id = %upstream_subscription_id,
                    error = %e,
                    "Failed to reconcile subscription"
                );
                self.fail(upstream_subscription_id, e.to_string());
            }
        }
    }
}

/// Administrative sweeps over upstream subscriptions.
#[derive(Clone)]
pub struct Reconciler {
    ctx: BillingContext,
    webhook: WebhookReconciler,
}

impl Reconciler {
    #[must_use]
    pub fn new(ctx: BillingContext) -> Self {
        Self {
            webhook: WebhookReconciler::new(ctx.clone()),
            ctx,
        }
    }

    async fn sweep(&self, subscriptions: Vec<GatewaySubscription>) -> ReconcileResult {
        let mut result = ReconcileResult::default();
        for upstream in &subscriptions {
            let outcome = self
                .webhook
                .mirror_subscription(upstream, &upstream.metadata(), None)
                .await;
            result.record(&upstream.id, outcome);
        }
        result
    }

    fn finish(&self, sweep: &str, result: ReconcileResult) -> ReconcileResult {
        tracing::info!(
            target: "tollgate::billing::reconcile",
            sweep,
            processed = result.processed,
            created = result.created,
            updated = result.updated,
            skipped = result.skipped,
            failed = result.failed.len(),
            "Reconciliation finished"
        );
        result
    }

    /// Create or refresh the mirror of every upstream subscription.
    pub async fn sync_existing(&self) -> BillingResult<ReconcileResult> {
        let upstream = self.ctx.gateway.list_subscriptions(None).await?;
        let result = self.sweep(upstream).await;
        Ok(self.finish("existing", result))
    }

    /// Like [`Self::sync_existing`], restricted to one user's gateway customer.
    pub async fn sync_user(&self, user_id: &str) -> BillingResult<ReconcileResult> {
        let Some(customer_id) = self.ctx.store.get_upstream_customer_id(user_id).await? else {
            tracing::debug!(
                target: "tollgate::billing::reconcile",
                user_id = %user_id,
                "User has no gateway customer"
            );
            return Ok(ReconcileResult::default());
        };
        let upstream = self
            .ctx
            .gateway
            .list_subscriptions(Some(&customer_id))
            .await?;
        let result = self.sweep(upstream).await;
        Ok(self.finish("user", result))
    }

    /// Recover parked subscriptions from their checkout sessions.
    pub async fn sync_missing_metadata(&self) -> BillingResult<ReconcileResult> {
        let mut result = ReconcileResult::default();
        for parked in self.ctx.store.list_parked_subscriptions().await? {
            let id = parked.upstream_subscription_id.as_str();
            match self.recover(id).await {
                Ok(Mirror::Parked) => result.fail(id, "checkout session metadata does not identify an owner and plan"),
                Ok(mirror) => result.record(id, Ok(mirror)),
                Err(e) => result.record(id, Err(e)),
            }
        }
        Ok(self.finish("missing_metadata", result))
    }

    async fn recover(&self, upstream_id: &str) -> BillingResult<Mirror> {
        let sessions = self.ctx.gateway.list_checkout_sessions(upstream_id).await?;
        let session_metadata = sessions
            .iter()
            .map(|s| GatewayMetadata::from_map(&s.metadata))
            .find(GatewayMetadata::identifies_owner)
            .ok_or_else(|| BillingError::InvalidWebhookPayload {
                message: format!("no checkout session with metadata for {}", upstream_id),
            })?;
        let upstream = self.ctx.gateway.get_subscription(upstream_id).await?;
        let metadata = merge_metadata(session_metadata, upstream.metadata());
        self.webhook.mirror_subscription(&upstream, &metadata, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::context::test::TestBilling;
    use crate::billing::gateway::CheckoutSession;
    use crate::billing::plans::PlanManager;
    use crate::billing::storage::BillingStore;
    use crate::billing::types::Plan;
    use crate::billing::webhook::tests::{event, subscription_object};
    use crate::billing::webhook::EVENT_SUBSCRIPTION_CREATED;
    use chrono::Utc;

    async fn setup() -> (TestBilling, Reconciler, Plan) {
        let t = TestBilling::new().await;
        let plan = PlanManager::new(t.ctx.store.clone())
            .create_plan(
                Plan::builder("Pro")
                    .price(1200, "eur")
                    .upstream_price("prod_pro", "price_pro")
                    .build(),
            )
            .await
            .unwrap();
        (t.clone(), Reconciler::new(t.ctx), plan)
    }

    fn upstream(id: &str, price: &str, metadata: &GatewayMetadata) -> GatewaySubscription {
        GatewaySubscription::from_json(&subscription_object(id, price, "active", 1, metadata)).unwrap()
    }

    #[tokio::test]
    async fn test_sync_existing_counts_reconcile() {
        let (t, reconciler, plan) = setup().await;
        let owned = GatewayMetadata {
            user_id: Some("u1".to_string()),
            plan_id: Some(plan.id),
            ..Default::default()
        };
        t.gateway.insert_subscription(upstream("sub_a", "price_pro", &owned));
        t.gateway
            .insert_subscription(upstream("sub_b", "price_other", &GatewayMetadata::default()));

        let first = reconciler.sync_existing().await.unwrap();
        assert_eq!(first.processed, 2);
        assert_eq!(first.created, 1);
        assert_eq!(first.skipped, 1);
        assert_eq!(first.total(), first.processed);

        let second = reconciler.sync_existing().await.unwrap();
        assert_eq!(second.updated, 1);
        assert_eq!(second.skipped, 1);
        assert_eq!(second.total(), second.processed);
        assert_eq!(t.store.subscription_count().await, 1);
    }

    #[tokio::test]
    async fn test_sync_user_without_customer_is_empty() {
        let (_t, reconciler, _) = setup().await;
        let result = reconciler.sync_user("nobody").await.unwrap();
        assert_eq!(result, ReconcileResult::default());
    }

    #[tokio::test]
    async fn test_sync_user_filters_by_customer() {
        let (t, reconciler, plan) = setup().await;
        t.store.set_upstream_customer_id("u1", "cus_test").await.unwrap();
        let owned = GatewayMetadata {
            user_id: Some("u1".to_string()),
            plan_id: Some(plan.id),
            ..Default::default()
        };
        t.gateway.insert_subscription(upstream("sub_a", "price_pro", &owned));
        let mut other = upstream("sub_z", "price_pro", &owned);
        other.customer_id = Some("cus_other".to_string());
        t.gateway.insert_subscription(other);

        let result = reconciler.sync_user("u1").await.unwrap();
        assert_eq!(result.processed, 1);
        assert_eq!(result.created, 1);
    }

    #[tokio::test]
    async fn test_missing_metadata_recovery() {
        let (t, reconciler, plan) = setup().await;
        let webhook = WebhookReconciler::new(t.ctx.clone());
        let now = Utc::now().timestamp();
        for id in ["sub_p1", "sub_p2"] {
            let object = subscription_object(id, "price_other", "active", 1, &GatewayMetadata::default());
            t.gateway
                .insert_subscription(GatewaySubscription::from_json(&object).unwrap());
            webhook
                .process(event(&format!("evt_{}", id), EVENT_SUBSCRIPTION_CREATED, object, now))
                .await
                .unwrap();
        }
        t.gateway.insert_checkout_session(CheckoutSession {
            id: "cs_1".to_string(),
            customer_id: Some("cus_test".to_string()),
            subscription_id: Some("sub_p1".to_string()),
            metadata: GatewayMetadata {
                user_id: Some("u1".to_string()),
                plan_id: Some(plan.id),
                ..Default::default()
            }
            .to_map(),
        });

        let result = reconciler.sync_missing_metadata().await.unwrap();
        assert_eq!(result.processed, 2);
        assert_eq!(result.created, 1);
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].upstream_subscription_id, "sub_p2");
        assert_eq!(result.total(), result.processed);

        let parked = t.store.list_parked_subscriptions().await.unwrap();
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].upstream_subscription_id, "sub_p2");
    }
}

//! Gateway webhook ingestion.
//!
//! Requests pass transport checks, signature verification and an age check
//! before an event is applied. Each event is applied at most once: under the
//! event ID's lock a `processing` dedup record is claimed before the handler
//! runs and marked `processed` after it succeeded. A failed handler releases
//! the claim, so the gateway's redelivery retries it. A claim that cannot be
//! completed stays behind and turns redeliveries into duplicates.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use super::bulk::{BulkLicenseEngine, batch_status_for};
use super::context::BillingContext;
use super::error::{BillingError, BillingResult};
use super::gateway::{
    CheckoutSession, GatewayInvoice, GatewayMetadata, GatewaySubscription, WebhookEvent, unix_to_datetime,
};
use super::organization::OrganizationEngine;
use super::plans::PlanManager;
use super::signature::DEFAULT_TOLERANCE_SECONDS;
use super::storage::{LockKey, StoreLock, holder_lock_key};
use super::subscription::SubscriptionEngine;
use super::types::{
    BatchStatus, Invoice, LicenseBatch, ParkedSubscription, Plan, Subscription, SubscriptionScope,
    SubscriptionStatus, SubscriptionType, WebhookEventRecord, WebhookEventStatus,
};
use crate::audit::{AuditEventType, AuditSeverity, NewAuditEntry};
use crate::config::WebhookConfig;

pub const EVENT_SUBSCRIPTION_CREATED: &str = "customer.subscription.created";
pub const EVENT_SUBSCRIPTION_UPDATED: &str = "customer.subscription.updated";
pub const EVENT_SUBSCRIPTION_DELETED: &str = "customer.subscription.deleted";
pub const EVENT_PAYMENT_SUCCEEDED: &str = "invoice.payment_succeeded";
pub const EVENT_PAYMENT_FAILED: &str = "invoice.payment_failed";
pub const EVENT_CHECKOUT_COMPLETED: &str = "checkout.session.completed";

/// Largest accepted webhook body.
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

/// User-agent prefix the gateway sends.
const GATEWAY_USER_AGENT_PREFIX: &str = "Stripe";

/// Header carrying the `t=...,v1=...` signature.
pub const SIGNATURE_HEADER: &str = "Stripe-Signature";

/// Headers the transport checks look at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebhookHeaders {
    pub content_type: Option<String>,
    pub user_agent: Option<String>,
    pub signature: Option<String>,
}

/// What happened to a delivered event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    Processed,
    /// Already applied earlier.
    Duplicate,
    /// Event type without a handler.
    Ignored,
    /// Subscription kept aside until its metadata can be recovered.
    Parked,
}

impl WebhookOutcome {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processed => "processed",
            Self::Duplicate => "duplicate",
            Self::Ignored => "ignored",
            Self::Parked => "parked",
        }
    }
}

/// Local effect of mirroring one upstream subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Mirror {
    Created,
    Updated,
    Parked,
}

/// Applies gateway events to local state.
#[derive(Clone)]
pub struct WebhookReconciler {
    ctx: BillingContext,
    plans: PlanManager,
    subscriptions: SubscriptionEngine,
    bulk: BulkLicenseEngine,
    organizations: OrganizationEngine,
    max_body_bytes: usize,
    tolerance_seconds: i64,
}

impl WebhookReconciler {
    #[must_use]
    pub fn new(ctx: BillingContext) -> Self {
        Self {
            plans: PlanManager::new(ctx.store.clone()),
            subscriptions: SubscriptionEngine::new(ctx.clone()),
            bulk: BulkLicenseEngine::new(ctx.clone()),
            organizations: OrganizationEngine::new(ctx.clone()),
            ctx,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            tolerance_seconds: DEFAULT_TOLERANCE_SECONDS,
        }
    }

    /// Apply the body cap and age tolerance from `config`.
    #[must_use]
    pub fn with_config(mut self, config: &WebhookConfig) -> Self {
        self.max_body_bytes = config.max_body_bytes;
        self.tolerance_seconds = config.tolerance_seconds;
        self
    }

    /// Transport checks, in the order the endpoint reports them.
    pub fn validate_transport<'h>(&self, body_len: usize, headers: &'h WebhookHeaders) -> BillingResult<&'h str> {
        if body_len > self.max_body_bytes {
            return Err(BillingError::PayloadTooLarge {
                size: body_len,
                max: self.max_body_bytes,
            });
        }
        let content_type = headers.content_type.as_deref().unwrap_or_default();
        let is_json = content_type
            .split(';')
            .next()
            .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("application/json"));
        if !is_json {
            return Err(BillingError::UnsupportedContentType {
                content_type: content_type.to_string(),
            });
        }
        if !headers
            .user_agent
            .as_deref()
            .is_some_and(|ua| ua.starts_with(GATEWAY_USER_AGENT_PREFIX))
        {
            return Err(BillingError::UntrustedUserAgent);
        }
        headers
            .signature
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or(BillingError::MissingSignature)
    }

    /// Validate, verify and apply a raw delivery.
    ///
    /// Missing or invalid signatures are recorded as suspicious activity.
    pub async fn ingest(&self, payload: &[u8], headers: &WebhookHeaders) -> BillingResult<WebhookOutcome> {
        let signature = match self.validate_transport(payload.len(), headers) {
            Ok(signature) => signature,
            Err(e) => {
                tracing::warn!(
                    target: "tollgate::billing::webhook",
                    error = %e,
                    size = payload.len(),
                    "Webhook rejected at transport"
                );
                if e == BillingError::MissingSignature {
                    self.log_rejected_signature(&e, payload.len()).await;
                }
                return Err(e);
            }
        };

        let event = match self.ctx.gateway.verify_webhook_signature(payload, signature) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(
                    target: "tollgate::billing::webhook",
                    error = %e,
                    "Webhook signature verification failed"
                );
                self.log_rejected_signature(&e, payload.len()).await;
                return Err(e);
            }
        };

        let age_seconds = Utc::now().timestamp() - event.created;
        if age_seconds > self.tolerance_seconds {
            tracing::warn!(
                target: "tollgate::billing::webhook",
                event_id = %event.id,
                age_seconds,
                "Webhook event too old"
            );
            return Err(BillingError::WebhookTooOld { age_seconds });
        }

        self.process(event).await
    }

    async fn log_rejected_signature(&self, error: &BillingError, size: usize) {
        self.ctx
            .audit
            .log_security(
                AuditEventType::SuspiciousActivity,
                None,
                "Webhook signature rejected",
                AuditSeverity::Warning,
                json!({ "error": error.to_string(), "size": size }),
            )
            .await;
    }

    /// Apply a verified event exactly once.
    pub async fn process(&self, event: WebhookEvent) -> BillingResult<WebhookOutcome> {
        let _lock = self
            .ctx
            .store
            .lock(LockKey::WebhookEvent(event.id.clone()))
            .await?;

        let now = Utc::now();
        let claim = WebhookEventRecord {
            event_id: event.id.clone(),
            event_type: event.event_type.clone(),
            status: WebhookEventStatus::Processing,
            processed_at: now,
            expires_at: now + Duration::days(self.ctx.webhook_retention_days),
            payload: None,
        };
        if !self.ctx.store.claim_webhook_event(&claim).await? {
            let unfinished = self
                .ctx
                .store
                .get_webhook_event(&event.id)
                .await?
                .is_some_and(|r| r.status == WebhookEventStatus::Processing);
            if unfinished {
                tracing::warn!(
                    target: "tollgate::billing::webhook",
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "Webhook event left unfinished by an earlier delivery; reconciliation repairs it"
                );
            } else {
                tracing::info!(
                    target: "tollgate::billing::webhook",
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "Webhook event already processed"
                );
            }
            return Ok(WebhookOutcome::Duplicate);
        }

        let outcome = match self.dispatch(&event).await {
            Ok(WebhookOutcome::Ignored) => {
                self.release_claim(&event.id).await;
                tracing::debug!(
                    target: "tollgate::billing::webhook",
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "Unhandled webhook event type"
                );
                return Ok(WebhookOutcome::Ignored);
            }
            Ok(outcome) => outcome,
            Err(e) => {
                self.release_claim(&event.id).await;
                tracing::error!(
                    target: "tollgate::billing::webhook",
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %e,
                    "Webhook handler failed"
                );
                self.log_failed_event(&event, &e).await;
                return Err(e);
            }
        };

        if let Err(e) = self
            .ctx
            .store
            .complete_webhook_event(&event.id, Utc::now())
            .await
        {
            // The claim stays, so a redelivery is reported as a duplicate
            tracing::error!(
                target: "tollgate::billing::webhook",
                event_id = %event.id,
                event_type = %event.event_type,
                error = %e,
                "Webhook event applied but not marked processed"
            );
            self.log_failed_event(&event, &e).await;
            return Err(e);
        }

        tracing::info!(
            target: "tollgate::billing::webhook",
            event_id = %event.id,
            event_type = %event.event_type,
            outcome = outcome.as_str(),
            "Webhook event processed"
        );
        self.ctx
            .audit
            .log_billing(
                AuditEventType::WebhookProcessed,
                None,
                "webhook_event",
                &event.id,
                json!({ "event_type": event.event_type, "outcome": outcome.as_str() }),
            )
            .await;
        Ok(outcome)
    }

    async fn dispatch(&self, event: &WebhookEvent) -> BillingResult<WebhookOutcome> {
        match event.event_type.as_str() {
            EVENT_SUBSCRIPTION_CREATED => self.on_subscription_created(event).await,
            EVENT_SUBSCRIPTION_UPDATED => self.on_subscription_updated(event).await,
            EVENT_SUBSCRIPTION_DELETED => self.on_subscription_deleted(event).await,
            EVENT_PAYMENT_SUCCEEDED => self.on_payment_succeeded(event).await,
            EVENT_PAYMENT_FAILED => self.on_payment_failed(event).await,
            EVENT_CHECKOUT_COMPLETED => self.on_checkout_completed(event).await,
            _ => Ok(WebhookOutcome::Ignored),
        }
    }

    /// Drop an unfinished claim so the event can be delivered again.
    async fn release_claim(&self, event_id: &str) {
        if let Err(e) = self.ctx.store.release_webhook_event(event_id).await {
            tracing::warn!(
                target: "tollgate::billing::webhook",
                event_id = %event_id,
                error = %e,
                "Failed to release webhook event claim"
            );
        }
    }

    async fn log_failed_event(&self, event: &WebhookEvent, error: &BillingError) {
        self.ctx
            .audit
            .log_failure(
                NewAuditEntry::new(AuditEventType::WebhookProcessed, "Webhook event failed")
                    .target("webhook_event", &event.id)
                    .metadata(json!({ "event_type": event.event_type })),
                error,
            )
            .await;
    }

    /// Lock the holder of `existing`, then the subscription itself, and
    /// return the guards with the reloaded row.
    async fn lock_subscription(&self, existing: &Subscription) -> BillingResult<(Vec<StoreLock>, Subscription)> {
        let holder = self.ctx.store.lock(holder_lock_key(existing)).await?;
        let own = self.ctx.store.lock(LockKey::Subscription(existing.id)).await?;
        let sub = self.reload(existing.id).await?;
        Ok((vec![holder, own], sub))
    }

    async fn on_subscription_created(&self, event: &WebhookEvent) -> BillingResult<WebhookOutcome> {
        let upstream = GatewaySubscription::from_json(&event.data.object)?;
        let mirror = self
            .mirror_subscription(&upstream, &upstream.metadata(), Some(event.created_at()))
            .await?;
        Ok(outcome_of(&mirror))
    }

    async fn on_subscription_updated(&self, event: &WebhookEvent) -> BillingResult<WebhookOutcome> {
        let upstream = GatewaySubscription::from_json(&event.data.object)?;
        let mirror = self
            .mirror_subscription(&upstream, &upstream.metadata(), Some(event.created_at()))
            .await?;
        Ok(outcome_of(&mirror))
    }

    async fn on_subscription_deleted(&self, event: &WebhookEvent) -> BillingResult<WebhookOutcome> {
        let upstream = GatewaySubscription::from_json(&event.data.object)?;
        let now = Utc::now();

        if let Some(batch) = self.ctx.store.find_batch_by_upstream_id(&upstream.id).await? {
            let _lock = self.ctx.store.lock(LockKey::Batch(batch.id)).await?;
            if batch.status != BatchStatus::Cancelled {
                self.bulk.cancel_batch(batch.id, now).await?;
            }
            return Ok(WebhookOutcome::Processed);
        }

        let Some(existing) = self
            .ctx
            .store
            .find_subscription_by_upstream_id(&upstream.id)
            .await?
        else {
            self.ctx
                .store
                .remove_parked_subscription(&upstream.id)
                .await?;
            tracing::info!(
                target: "tollgate::billing::webhook",
                upstream_id = %upstream.id,
                "Deleted upstream subscription has no local record"
            );
            return Ok(WebhookOutcome::Processed);
        };

        let (_locks, mut sub) = self.lock_subscription(&existing).await?;
        if sub.status.is_terminal() {
            return Ok(WebhookOutcome::Processed);
        }
        sub.mark_cancelled(now);
        sub.cancel_at_period_end = false;
        sub.last_event_at = Some(event.created_at());
        self.ctx.store.update_subscription(&sub).await?;
        if let Some(plan) = self.ctx.store.get_plan(sub.plan_id).await? {
            self.subscriptions.on_deactivated(&sub, &plan).await;
        }

        self.ctx
            .audit
            .log_billing(
                AuditEventType::SubscriptionCanceled,
                None,
                "subscription",
                sub.id,
                json!({ "upstream_subscription_id": upstream.id, "source": "gateway" }),
            )
            .await;
        Ok(WebhookOutcome::Processed)
    }

    async fn on_payment_succeeded(&self, event: &WebhookEvent) -> BillingResult<WebhookOutcome> {
        let upstream = GatewayInvoice::from_json(&event.data.object)?;
        let now = Utc::now();
        let existing = self
            .ctx
            .store
            .get_invoice_by_upstream_id(&upstream.id)
            .await?;
        let invoice = Invoice {
            id: existing.as_ref().map(|i| i.id).unwrap_or_else(Uuid::new_v4),
            upstream_invoice_id: upstream.id.clone(),
            upstream_subscription_id: upstream.subscription_id.clone(),
            upstream_customer_id: upstream.customer_id.clone(),
            amount_paid: upstream.amount_paid,
            currency: upstream.currency.clone(),
            status: upstream.status.clone(),
            paid_at: upstream.paid_at.and_then(unix_to_datetime).or(Some(now)),
            created_at: existing.map(|i| i.created_at).unwrap_or(now),
        };
        self.ctx.store.upsert_invoice(&invoice).await?;

        if let Some(upstream_sub_id) = upstream.subscription_id.as_deref() {
            if let Some(batch) = self.ctx.store.find_batch_by_upstream_id(upstream_sub_id).await? {
                let _lock = self.ctx.store.lock(LockKey::Batch(batch.id)).await?;
                if batch.status == BatchStatus::PendingPayment {
                    self.bulk.activate(batch.id).await?;
                }
            } else if let Some(existing) = self
                .ctx
                .store
                .find_subscription_by_upstream_id(upstream_sub_id)
                .await?
            {
                let (_locks, mut sub) = self.lock_subscription(&existing).await?;
                if matches!(sub.status, SubscriptionStatus::PastDue | SubscriptionStatus::Incomplete) {
                    let from = sub.status;
                    sub.status = SubscriptionStatus::Active;
                    sub.updated_at = now;
                    self.ctx.store.update_subscription(&sub).await?;
                    if let Some(plan) = self.ctx.store.get_plan(sub.plan_id).await? {
                        self.subscriptions.on_activated(&sub, &plan, now).await;
                    }
                    tracing::info!(
                        target: "tollgate::billing::webhook",
                        subscription_id = %sub.id,
                        from = %from,
                        "Subscription reactivated by payment"
                    );
                }
                if sub.is_entitled() {
                    self.organizations.supersede_previous(&sub, now).await?;
                }
            }
        }

        self.ctx
            .audit
            .log_billing(
                AuditEventType::PaymentSucceeded,
                None,
                "invoice",
                &upstream.id,
                json!({
                    "upstream_subscription_id": upstream.subscription_id,
                    "amount_paid": upstream.amount_paid,
                    "currency": upstream.currency,
                }),
            )
            .await;
        Ok(WebhookOutcome::Processed)
    }

    async fn on_payment_failed(&self, event: &WebhookEvent) -> BillingResult<WebhookOutcome> {
        let upstream = GatewayInvoice::from_json(&event.data.object)?;
        if let Some(upstream_sub_id) = upstream.subscription_id.as_deref() {
            if let Some(existing) = self
                .ctx
                .store
                .find_subscription_by_upstream_id(upstream_sub_id)
                .await?
            {
                let (_locks, mut sub) = self.lock_subscription(&existing).await?;
                if matches!(sub.status, SubscriptionStatus::Active | SubscriptionStatus::Trialing) {
                    sub.status = SubscriptionStatus::PastDue;
                    sub.updated_at = Utc::now();
                    self.ctx.store.update_subscription(&sub).await?;
                    tracing::warn!(
                        target: "tollgate::billing::webhook",
                        subscription_id = %sub.id,
                        invoice = %upstream.id,
                        "Payment failed; subscription is past due"
                    );
                }
            }
        }

        self.ctx
            .audit
            .log_billing(
                AuditEventType::PaymentFailed,
                None,
                "invoice",
                &upstream.id,
                json!({ "upstream_subscription_id": upstream.subscription_id }),
            )
            .await;
        Ok(WebhookOutcome::Processed)
    }

    async fn on_checkout_completed(&self, event: &WebhookEvent) -> BillingResult<WebhookOutcome> {
        let session = CheckoutSession::from_json(&event.data.object)?;
        let Some(upstream_id) = session.subscription_id.as_deref() else {
            // One-off payment, nothing to link
            return Ok(WebhookOutcome::Ignored);
        };
        let upstream = self.ctx.gateway.get_subscription(upstream_id).await?;
        let metadata = merge_metadata(GatewayMetadata::from_map(&session.metadata), upstream.metadata());
        let mirror = self.mirror_subscription(&upstream, &metadata, None).await?;
        Ok(outcome_of(&mirror))
    }

    async fn reload(&self, subscription_id: Uuid) -> BillingResult<Subscription> {
        self.ctx
            .store
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound {
                id: subscription_id.to_string(),
            })
    }

    /// Plan of an upstream subscription: by price first, then by metadata.
    async fn resolve_plan(&self, upstream: &GatewaySubscription, metadata: &GatewayMetadata) -> BillingResult<Option<Plan>> {
        if let Some(price_id) = upstream.price_id.as_deref() {
            if let Some(plan) = self.plans.find_by_upstream_price(price_id).await? {
                return Ok(Some(plan));
            }
        }
        match metadata.plan_id {
            Some(plan_id) => self.ctx.store.get_plan(plan_id).await,
            None => Ok(None),
        }
    }

    /// Create or update the local mirror of an upstream subscription.
    ///
    /// `event_at` is the gateway timestamp of the triggering event; `None`
    /// for backfills, which never mark records as newer.
    pub(crate) async fn mirror_subscription(
        &self,
        upstream: &GatewaySubscription,
        metadata: &GatewayMetadata,
        event_at: Option<DateTime<Utc>>,
    ) -> BillingResult<Mirror> {
        if let Some(batch) = self.ctx.store.find_batch_by_upstream_id(&upstream.id).await? {
            self.update_batch(batch, upstream, event_at).await?;
            return Ok(Mirror::Updated);
        }
        if let Some(sub) = self
            .ctx
            .store
            .find_subscription_by_upstream_id(&upstream.id)
            .await?
        {
            self.update_subscription(sub, upstream, event_at).await?;
            return Ok(Mirror::Updated);
        }

        let plan = self.resolve_plan(upstream, metadata).await?;
        let mirror = match (plan, metadata) {
            (Some(plan), GatewayMetadata {
                bulk_purchase: true,
                user_id: Some(purchaser),
                ..
            }) => {
                let batch = self
                    .bulk
                    .create_from_upstream(upstream, metadata, purchaser, &plan, event_at.unwrap_or_else(Utc::now))
                    .await?;
                self.ctx
                    .audit
                    .log_billing(
                        AuditEventType::BulkPurchase,
                        Some(purchaser.as_str()),
                        "license_batch",
                        batch.id,
                        json!({
                            "plan_id": plan.id,
                            "quantity": batch.total_quantity,
                            "upstream_subscription_id": upstream.id,
                        }),
                    )
                    .await;
                Mirror::Created
            }
            (Some(plan), GatewayMetadata {
                bulk_purchase: false,
                organization_id: Some(organization_id),
                ..
            }) => {
                let sub = self
                    .organizations
                    .create_from_upstream(
                        upstream,
                        *organization_id,
                        &plan,
                        metadata.user_id.clone(),
                        event_at.unwrap_or_else(Utc::now),
                    )
                    .await?;
                self.ctx
                    .audit
                    .log_billing(
                        AuditEventType::SubscriptionCreated,
                        metadata.user_id.as_deref(),
                        "subscription",
                        sub.id,
                        json!({
                            "organization_id": organization_id,
                            "plan_id": plan.id,
                            "upstream_subscription_id": upstream.id,
                        }),
                    )
                    .await;
                Mirror::Created
            }
            (Some(plan), GatewayMetadata {
                bulk_purchase: false,
                user_id: Some(user_id),
                ..
            }) => {
                self.create_personal(upstream, metadata, user_id, &plan, event_at)
                    .await?;
                Mirror::Created
            }
            _ => {
                self.park(upstream).await?;
                Mirror::Parked
            }
        };
        if mirror == Mirror::Created {
            self.ctx
                .store
                .remove_parked_subscription(&upstream.id)
                .await?;
        }
        Ok(mirror)
    }

    async fn park(&self, upstream: &GatewaySubscription) -> BillingResult<()> {
        self.ctx
            .store
            .park_subscription(&ParkedSubscription {
                upstream_subscription_id: upstream.id.clone(),
                upstream_customer_id: upstream.customer_id.clone(),
                upstream_price_id: upstream.price_id.clone(),
                status: upstream.status.clone(),
                quantity: upstream.quantity,
                parked_at: Utc::now(),
            })
            .await?;
        tracing::warn!(
            target: "tollgate::billing::webhook",
            upstream_id = %upstream.id,
            price_id = ?upstream.price_id,
            "Upstream subscription lacks usable metadata; parked for recovery"
        );
        Ok(())
    }

    async fn create_personal(
        &self,
        upstream: &GatewaySubscription,
        metadata: &GatewayMetadata,
        user_id: &str,
        plan: &Plan,
        event_at: Option<DateTime<Utc>>,
    ) -> BillingResult<Subscription> {
        let _lock = self.ctx.store.lock(LockKey::User(user_id.to_string())).await?;
        let now = Utc::now();
        let mut sub = Subscription::new(
            plan.id,
            SubscriptionScope::User {
                user_id: user_id.to_string(),
                kind: SubscriptionType::Personal,
            },
            SubscriptionStatus::from_gateway(&upstream.status),
            upstream.period_start(),
            upstream.period_end(),
        );
        sub.created_at = now;
        sub.updated_at = now;
        sub.trial_end = upstream.trial_end.and_then(unix_to_datetime);
        sub.cancel_at_period_end = upstream.cancel_at_period_end;
        sub.cancelled_at = upstream.canceled_at.and_then(unix_to_datetime);
        sub.upstream_subscription_id = Some(upstream.id.clone());
        sub.upstream_customer_id = upstream.customer_id.clone();
        sub.upstream_item_id = upstream.item_id.clone();
        sub.last_event_at = event_at;

        if let Some(replace_id) = metadata.replace_subscription_id {
            self.replace_free(user_id, replace_id, now).await?;
        }
        self.ctx.store.insert_subscription(&sub).await?;
        if sub.is_entitled() {
            self.subscriptions.on_activated(&sub, plan, now).await;
        }

        tracing::info!(
            target: "tollgate::billing::webhook",
            user_id = %user_id,
            subscription_id = %sub.id,
            upstream_id = %upstream.id,
            status = %sub.status,
            "Subscription created from gateway"
        );
        self.ctx
            .audit
            .log_billing(
                AuditEventType::SubscriptionCreated,
                Some(user_id),
                "subscription",
                sub.id,
                json!({ "plan_id": plan.id, "upstream_subscription_id": upstream.id }),
            )
            .await;
        Ok(sub)
    }

    /// Mark the user's free subscription `replace_id` as replaced.
    ///
    /// Paid or foreign subscriptions are left alone.
    async fn replace_free(&self, user_id: &str, replace_id: Uuid, now: DateTime<Utc>) -> BillingResult<()> {
        let Some(mut old) = self.ctx.store.get_subscription(replace_id).await? else {
            return Ok(());
        };
        let old_plan = self.ctx.store.get_plan(old.plan_id).await?;
        let replaceable = old.user_id() == Some(user_id)
            && !old.status.is_terminal()
            && old_plan.as_ref().is_some_and(Plan::is_free);
        if !replaceable {
            tracing::warn!(
                target: "tollgate::billing::webhook",
                user_id = %user_id,
                subscription_id = %replace_id,
                "Subscription named for replacement is not the user's free subscription; kept"
            );
            return Ok(());
        }
        old.mark_replaced(now);
        self.ctx.store.update_subscription(&old).await?;
        if let Some(plan) = old_plan {
            self.subscriptions.on_deactivated(&old, &plan).await;
        }
        Ok(())
    }

    async fn update_subscription(
        &self,
        existing: Subscription,
        upstream: &GatewaySubscription,
        event_at: Option<DateTime<Utc>>,
    ) -> BillingResult<()> {
        let (_locks, mut sub) = self.lock_subscription(&existing).await?;
        let now = Utc::now();
        let new_status = SubscriptionStatus::from_gateway(&upstream.status);
        let upstream_cancelled_at = upstream.canceled_at.and_then(unix_to_datetime);

        let stale = matches!((event_at, sub.last_event_at), (Some(at), Some(last)) if at < last);
        if stale {
            // Only advance what can never go back
            let mut changed = false;
            if sub.cancelled_at.is_none() && upstream_cancelled_at.is_some() {
                sub.cancelled_at = upstream_cancelled_at;
                changed = true;
            }
            if new_status.is_terminal() && !sub.status.is_terminal() {
                sub.status = new_status;
                changed = true;
            }
            if changed {
                sub.updated_at = now;
                self.ctx.store.update_subscription(&sub).await?;
            }
            tracing::debug!(
                target: "tollgate::billing::webhook",
                subscription_id = %sub.id,
                changed,
                "Out-of-order subscription event"
            );
            return Ok(());
        }

        let old_plan = self.ctx.store.get_plan(sub.plan_id).await?;
        let new_plan = match upstream.price_id.as_deref() {
            Some(price_id) => self.plans.find_by_upstream_price(price_id).await?,
            None => None,
        }
        .filter(|p| p.id != sub.plan_id);
        let was_entitled = sub.is_entitled();
        let previous = sub.clone();

        if let Some(plan) = &new_plan {
            tracing::info!(
                target: "tollgate::billing::webhook",
                subscription_id = %sub.id,
                from = %sub.plan_id,
                to = %plan.id,
                "Plan change detected from gateway"
            );
            sub.plan_id = plan.id;
        }
        if !sub.status.is_terminal() {
            sub.status = new_status;
        }
        sub.current_period_start = upstream.period_start();
        sub.current_period_end = upstream.period_end();
        sub.trial_end = upstream.trial_end.and_then(unix_to_datetime);
        sub.cancel_at_period_end = upstream.cancel_at_period_end;
        if sub.cancelled_at.is_none() && upstream_cancelled_at.is_some() {
            sub.cancelled_at = upstream_cancelled_at;
            tracing::info!(
                target: "tollgate::billing::webhook",
                subscription_id = %sub.id,
                at_period_end = upstream.cancel_at_period_end,
                "Cancellation reported by gateway"
            );
        }
        if let SubscriptionScope::Organization { quantity, .. } = &mut sub.scope {
            *quantity = upstream.quantity.max(1);
        }
        if upstream.item_id.is_some() {
            sub.upstream_item_id = upstream.item_id.clone();
        }
        if event_at.is_some() {
            sub.last_event_at = event_at;
        }
        sub.updated_at = now;
        self.ctx.store.update_subscription(&sub).await?;

        let current_plan = match &new_plan {
            Some(plan) => Some(plan.clone()),
            None => old_plan.clone(),
        };
        let is_entitled = sub.is_entitled();
        match (was_entitled, is_entitled) {
            (true, false) => {
                if let Some(plan) = &old_plan {
                    self.subscriptions.on_deactivated(&previous, plan).await;
                }
            }
            (false, true) => {
                if let Some(plan) = &current_plan {
                    self.subscriptions.on_activated(&sub, plan, now).await;
                }
            }
            (true, true) if new_plan.is_some() => {
                if let Some(plan) = &old_plan {
                    self.subscriptions.on_deactivated(&previous, plan).await;
                }
                if let Some(plan) = &current_plan {
                    self.subscriptions.on_activated(&sub, plan, now).await;
                }
            }
            _ => {}
        }
        if is_entitled {
            self.organizations.supersede_previous(&sub, now).await?;
        }

        if previous.status != sub.status || previous.plan_id != sub.plan_id {
            self.ctx
                .audit
                .log_billing(
                    AuditEventType::SubscriptionUpdated,
                    sub.user_id(),
                    "subscription",
                    sub.id,
                    json!({
                        "from_status": previous.status,
                        "to_status": sub.status,
                        "from_plan_id": previous.plan_id,
                        "to_plan_id": sub.plan_id,
                    }),
                )
                .await;
        }
        Ok(())
    }

    async fn update_batch(
        &self,
        existing: LicenseBatch,
        upstream: &GatewaySubscription,
        event_at: Option<DateTime<Utc>>,
    ) -> BillingResult<()> {
        let _lock = self.ctx.store.lock(LockKey::Batch(existing.id)).await?;
        let Some(mut batch) = self.ctx.store.get_batch(existing.id).await? else {
            return Ok(());
        };
        if matches!(batch.status, BatchStatus::Cancelled | BatchStatus::Expired) {
            return Ok(());
        }
        let now = Utc::now();
        let target_status = batch_status_for(&upstream.status);
        if target_status == BatchStatus::Cancelled {
            self.bulk.cancel_batch(batch.id, now).await?;
            return Ok(());
        }
        let stale = matches!((event_at, batch.last_event_at), (Some(at), Some(last)) if at < last);
        if stale {
            return Ok(());
        }

        if upstream.quantity != batch.total_quantity {
            match self
                .ctx
                .store
                .resize_batch(batch.id, upstream.quantity, now)
                .await
            {
                Ok(resized) => {
                    tracing::info!(
                        target: "tollgate::billing::webhook",
                        batch_id = %batch.id,
                        from = batch.total_quantity,
                        to = resized.total_quantity,
                        "Batch quantity changed upstream"
                    );
                    batch = resized;
                }
                Err(BillingError::QuantityBelowAssigned { requested, assigned }) => {
                    tracing::error!(
                        target: "tollgate::billing::webhook",
                        batch_id = %batch.id,
                        requested,
                        assigned,
                        "Upstream quantity is below assigned licenses; local quantity kept"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        if target_status == BatchStatus::Active && batch.status == BatchStatus::PendingPayment {
            batch = self.bulk.activate(batch.id).await?;
        }

        batch.current_period_start = upstream.period_start();
        batch.current_period_end = upstream.period_end();
        if event_at.is_some() {
            batch.last_event_at = event_at;
        }
        batch.updated_at = now;
        self.ctx.store.update_batch(&batch).await
    }
}

fn outcome_of(mirror: &Mirror) -> WebhookOutcome {
    match mirror {
        Mirror::Parked => WebhookOutcome::Parked,
        Mirror::Created | Mirror::Updated => WebhookOutcome::Processed,
    }
}

/// Field-wise merge preferring `primary`.
pub(crate) fn merge_metadata(primary: GatewayMetadata, fallback: GatewayMetadata) -> GatewayMetadata {
    GatewayMetadata {
        user_id: primary.user_id.or(fallback.user_id),
        plan_id: primary.plan_id.or(fallback.plan_id),
        organization_id: primary.organization_id.or(fallback.organization_id),
        bulk_purchase: primary.bulk_purchase || fallback.bulk_purchase,
        quantity: primary.quantity.or(fallback.quantity),
        group_id: primary.group_id.or(fallback.group_id),
        replace_subscription_id: primary
            .replace_subscription_id
            .or(fallback.replace_subscription_id),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::billing::context::test::TestBilling;
    use crate::billing::gateway::test::MockGateway;
    use crate::billing::invariants::check_batch;
    use crate::billing::storage::BillingStore;
    use crate::audit::AuditStatus;
    use crate::auth::Principal;
    use crate::billing::organization::OrganizationSubscriptionRequest;
    use crate::billing::storage::test::personal_subscription;
    use serde_json::Value;
    use std::collections::BTreeMap;

    pub(crate) fn subscription_object(
        id: &str,
        price_id: &str,
        status: &str,
        quantity: i64,
        metadata: &GatewayMetadata,
    ) -> Value {
        let now = Utc::now().timestamp();
        json!({
            "id": id,
            "object": "subscription",
            "customer": "cus_test",
            "status": status,
            "cancel_at_period_end": false,
            "items": { "data": [{
                "id": format!("si_{}", id),
                "quantity": quantity,
                "price": { "id": price_id },
                "current_period_start": now,
                "current_period_end": now + 30 * 86400,
            }]},
            "metadata": metadata.to_map(),
        })
    }

    pub(crate) fn event(id: &str, event_type: &str, object: Value, created: i64) -> WebhookEvent {
        serde_json::from_value(json!({
            "id": id,
            "type": event_type,
            "created": created,
            "data": { "object": object },
        }))
        .unwrap()
    }

    fn headers(gateway: &MockGateway, payload: &[u8]) -> WebhookHeaders {
        WebhookHeaders {
            content_type: Some("application/json; charset=utf-8".to_string()),
            user_agent: Some("Stripe/1.0 (+https://stripe.com/docs/webhooks)".to_string()),
            signature: Some(gateway.sign(payload)),
        }
    }

    async fn setup() -> (TestBilling, WebhookReconciler, Plan) {
        let t = TestBilling::new().await;
        let plan = PlanManager::new(t.ctx.store.clone())
            .create_plan(
                Plan::builder("Pro")
                    .priority(20)
                    .price(1200, "eur")
                    .upstream_price("prod_pro", "price_pro")
                    .required_role("pro_user")
                    .build(),
            )
            .await
            .unwrap();
        let reconciler = WebhookReconciler::new(t.ctx.clone());
        (t, reconciler, plan)
    }

    fn personal(user: &str, plan: &Plan) -> GatewayMetadata {
        GatewayMetadata {
            user_id: Some(user.to_string()),
            plan_id: Some(plan.id),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_transport_validation_order() {
        let (_t, reconciler, _) = setup().await;
        let good = WebhookHeaders {
            content_type: Some("application/json".to_string()),
            user_agent: Some("Stripe/1.0".to_string()),
            signature: Some("t=1,v1=00".to_string()),
        };
        assert!(reconciler.validate_transport(10, &good).is_ok());

        assert!(matches!(
            reconciler.validate_transport(DEFAULT_MAX_BODY_BYTES + 1, &good),
            Err(BillingError::PayloadTooLarge { .. })
        ));
        let mut h = good.clone();
        h.content_type = Some("text/plain".to_string());
        assert!(matches!(
            reconciler.validate_transport(10, &h),
            Err(BillingError::UnsupportedContentType { .. })
        ));
        let mut h = good.clone();
        h.user_agent = Some("curl/8.0".to_string());
        assert!(matches!(
            reconciler.validate_transport(10, &h),
            Err(BillingError::UntrustedUserAgent)
        ));
        let mut h = good;
        h.signature = None;
        assert!(matches!(
            reconciler.validate_transport(10, &h),
            Err(BillingError::MissingSignature)
        ));
    }

    #[tokio::test]
    async fn test_ingest_is_idempotent() {
        let (t, reconciler, plan) = setup().await;
        t.directory.add_user("u1", &[]);
        let object = subscription_object("sub_1", "price_pro", "active", 1, &personal("u1", &plan));
        let payload = serde_json::to_vec(&json!({
            "id": "evt_1",
            "type": EVENT_SUBSCRIPTION_CREATED,
            "created": Utc::now().timestamp(),
            "data": { "object": object },
        }))
        .unwrap();
        let h = headers(&t.gateway, &payload);

        assert_eq!(reconciler.ingest(&payload, &h).await.unwrap(), WebhookOutcome::Processed);
        assert_eq!(reconciler.ingest(&payload, &h).await.unwrap(), WebhookOutcome::Duplicate);
        assert_eq!(t.store.subscription_count().await, 1);
        assert_eq!(t.store.processed_event_ids().await, vec!["evt_1".to_string()]);

        let sub = t
            .store
            .find_subscription_by_upstream_id("sub_1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.user_id(), Some("u1"));
        assert_eq!(t.directory.roles("u1"), vec!["pro_user".to_string()]);
    }

    #[tokio::test]
    async fn test_ingest_rejects_bad_signature_and_old_events() {
        let (t, reconciler, plan) = setup().await;
        let object = subscription_object("sub_1", "price_pro", "active", 1, &personal("u1", &plan));
        let payload = serde_json::to_vec(&json!({
            "id": "evt_old",
            "type": EVENT_SUBSCRIPTION_CREATED,
            "created": Utc::now().timestamp() - 3600,
            "data": { "object": object },
        }))
        .unwrap();

        let mut h = headers(&t.gateway, &payload);
        assert!(matches!(
            reconciler.ingest(&payload, &h).await,
            Err(BillingError::WebhookTooOld { .. })
        ));

        h.signature = Some(MockGateway::with_webhook_secret("whsec_other").sign(&payload));
        assert!(matches!(
            reconciler.ingest(&payload, &h).await,
            Err(BillingError::InvalidSignature)
        ));
        assert_eq!(t.store.subscription_count().await, 0);

        let suspicious: Vec<_> = t
            .audit_store
            .entries()
            .await
            .into_iter()
            .filter(|e| e.event_type == AuditEventType::SuspiciousActivity)
            .collect();
        assert_eq!(suspicious.len(), 1);
        assert_eq!(suspicious[0].severity, AuditSeverity::Warning);
        assert_eq!(suspicious[0].metadata["size"], json!(payload.len()));
    }

    #[tokio::test]
    async fn test_missing_metadata_is_parked_then_recovered_by_checkout() {
        let (t, reconciler, plan) = setup().await;
        let now = Utc::now().timestamp();
        let object = subscription_object("sub_2", "price_unknown", "active", 1, &GatewayMetadata::default());
        t.gateway
            .insert_subscription(GatewaySubscription::from_json(&object).unwrap());

        let outcome = reconciler
            .process(event("evt_c", EVENT_SUBSCRIPTION_CREATED, object, now))
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Parked);
        assert_eq!(t.store.list_parked_subscriptions().await.unwrap().len(), 1);

        let session = json!({
            "id": "cs_1",
            "subscription": "sub_2",
            "customer": "cus_test",
            "metadata": personal("u2", &plan).to_map(),
        });
        let outcome = reconciler
            .process(event("evt_s", EVENT_CHECKOUT_COMPLETED, session, now))
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Processed);
        assert!(t.store.list_parked_subscriptions().await.unwrap().is_empty());
        let sub = t
            .store
            .find_subscription_by_upstream_id("sub_2")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sub.plan_id, plan.id);
        assert_eq!(sub.user_id(), Some("u2"));
    }

    #[tokio::test]
    async fn test_replace_free_subscription() {
        let (t, reconciler, plan) = setup().await;
        let free = PlanManager::new(t.ctx.store.clone())
            .create_plan(Plan::builder("Free").build())
            .await
            .unwrap();
        let old = personal_subscription("u1", free.id, SubscriptionStatus::Active);
        t.store.insert_subscription(&old).await.unwrap();

        let mut metadata = personal("u1", &plan);
        metadata.replace_subscription_id = Some(old.id);
        let object = subscription_object("sub_3", "price_pro", "active", 1, &metadata);
        reconciler
            .process(event("evt_r", EVENT_SUBSCRIPTION_CREATED, object, Utc::now().timestamp()))
            .await
            .unwrap();

        let old = t.store.get_subscription(old.id).await.unwrap().unwrap();
        assert_eq!(old.status, SubscriptionStatus::Replaced);
        assert!(old.cancelled_at.is_some());
    }

    #[tokio::test]
    async fn test_updated_detects_plan_change_and_cancellation() {
        let (t, reconciler, plan) = setup().await;
        let team = PlanManager::new(t.ctx.store.clone())
            .create_plan(
                Plan::builder("Team")
                    .priority(30)
                    .price(4900, "eur")
                    .upstream_price("prod_team", "price_team")
                    .max_concurrent_terminals(10)
                    .build(),
            )
            .await
            .unwrap();
        let now = Utc::now().timestamp();
        let metadata = personal("u1", &plan);
        reconciler
            .process(event(
                "evt_1",
                EVENT_SUBSCRIPTION_CREATED,
                subscription_object("sub_4", "price_pro", "active", 1, &metadata),
                now - 10,
            ))
            .await
            .unwrap();

        let mut object = subscription_object("sub_4", "price_team", "active", 1, &metadata);
        object["canceled_at"] = json!(now);
        object["cancel_at_period_end"] = json!(true);
        reconciler
            .process(event("evt_2", EVENT_SUBSCRIPTION_UPDATED, object, now))
            .await
            .unwrap();

        let sub = t
            .store
            .find_subscription_by_upstream_id("sub_4")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sub.plan_id, team.id);
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert!(sub.cancel_at_period_end);
        let first_cancel = sub.cancelled_at.unwrap();

        let metric = t
            .store
            .get_usage_metric("u1", crate::billing::types::MetricType::ConcurrentTerminals)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(metric.limit_value, 10);

        // Later report keeps the first cancellation time
        let mut object = subscription_object("sub_4", "price_team", "active", 1, &metadata);
        object["canceled_at"] = json!(now + 5);
        reconciler
            .process(event("evt_3", EVENT_SUBSCRIPTION_UPDATED, object, now + 5))
            .await
            .unwrap();
        let sub = t.store.get_subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(sub.cancelled_at, Some(first_cancel));
    }

    #[tokio::test]
    async fn test_stale_event_does_not_revert_status() {
        let (t, reconciler, plan) = setup().await;
        let now = Utc::now().timestamp();
        let metadata = personal("u1", &plan);
        reconciler
            .process(event(
                "evt_new",
                EVENT_SUBSCRIPTION_CREATED,
                subscription_object("sub_5", "price_pro", "past_due", 1, &metadata),
                now,
            ))
            .await
            .unwrap();
        reconciler
            .process(event(
                "evt_old",
                EVENT_SUBSCRIPTION_UPDATED,
                subscription_object("sub_5", "price_pro", "active", 1, &metadata),
                now - 60,
            ))
            .await
            .unwrap();

        let sub = t
            .store
            .find_subscription_by_upstream_id("sub_5")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sub.status, SubscriptionStatus::PastDue);
    }

    #[tokio::test]
    async fn test_payment_events_move_status() {
        let (t, reconciler, plan) = setup().await;
        let now = Utc::now().timestamp();
        reconciler
            .process(event(
                "evt_1",
                EVENT_SUBSCRIPTION_CREATED,
                subscription_object("sub_6", "price_pro", "active", 1, &personal("u1", &plan)),
                now,
            ))
            .await
            .unwrap();
        let invoice = |id: &str| {
            json!({
                "id": id,
                "subscription": "sub_6",
                "customer": "cus_test",
                "amount_paid": 1200,
                "currency": "eur",
                "status": "paid",
            })
        };

        reconciler
            .process(event("evt_f", EVENT_PAYMENT_FAILED, invoice("in_1"), now))
            .await
            .unwrap();
        let sub = t.store.find_subscription_by_upstream_id("sub_6").await.unwrap().unwrap();
        assert_eq!(sub.status, SubscriptionStatus::PastDue);

        reconciler
            .process(event("evt_p", EVENT_PAYMENT_SUCCEEDED, invoice("in_1"), now))
            .await
            .unwrap();
        let sub = t.store.get_subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);
        let recorded = t.store.get_invoice_by_upstream_id("in_1").await.unwrap().unwrap();
        assert_eq!(recorded.amount_paid, 1200);
    }

    #[tokio::test]
    async fn test_deleted_cancels_and_revokes_role() {
        let (t, reconciler, plan) = setup().await;
        t.directory.add_user("u1", &[]);
        let now = Utc::now().timestamp();
        let object = subscription_object("sub_7", "price_pro", "active", 1, &personal("u1", &plan));
        reconciler
            .process(event("evt_1", EVENT_SUBSCRIPTION_CREATED, object.clone(), now))
            .await
            .unwrap();
        assert_eq!(t.directory.roles("u1"), vec!["pro_user".to_string()]);

        reconciler
            .process(event("evt_2", EVENT_SUBSCRIPTION_DELETED, object, now))
            .await
            .unwrap();
        let sub = t.store.find_subscription_by_upstream_id("sub_7").await.unwrap().unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Cancelled);
        assert!(t.directory.roles("u1").is_empty());
    }

    #[tokio::test]
    async fn test_bulk_lifecycle_from_gateway() {
        let (t, reconciler, plan) = setup().await;
        let now = Utc::now().timestamp();
        let metadata = GatewayMetadata {
            user_id: Some("buyer".to_string()),
            plan_id: Some(plan.id),
            bulk_purchase: true,
            quantity: Some(4),
            ..Default::default()
        };
        reconciler
            .process(event(
                "evt_1",
                EVENT_SUBSCRIPTION_CREATED,
                subscription_object("sub_b", "price_pro", "incomplete", 4, &metadata),
                now,
            ))
            .await
            .unwrap();
        let batch = t.store.find_batch_by_upstream_id("sub_b").await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::PendingPayment);
        assert_eq!(batch.total_quantity, 4);
        assert!(t
            .store
            .list_batch_licenses(batch.id)
            .await
            .unwrap()
            .iter()
            .all(|l| l.upstream_subscription_id.is_none()));

        reconciler
            .process(event(
                "evt_2",
                EVENT_PAYMENT_SUCCEEDED,
                json!({ "id": "in_b", "subscription": "sub_b", "amount_paid": 4800, "currency": "eur" }),
                now,
            ))
            .await
            .unwrap();
        let batch = t.store.get_batch(batch.id).await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Active);

        reconciler
            .process(event(
                "evt_3",
                EVENT_SUBSCRIPTION_UPDATED,
                subscription_object("sub_b", "price_pro", "active", 6, &metadata),
                now + 1,
            ))
            .await
            .unwrap();
        let report = check_batch(t.ctx.store.as_ref(), batch.id).await.unwrap();
        assert_eq!(report.total_quantity, 6);
        assert!(report.is_consistent());

        reconciler
            .process(event(
                "evt_4",
                EVENT_SUBSCRIPTION_DELETED,
                subscription_object("sub_b", "price_pro", "canceled", 6, &metadata),
                now + 2,
            ))
            .await
            .unwrap();
        let batch = t.store.get_batch(batch.id).await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Cancelled);
        assert!(check_batch(t.ctx.store.as_ref(), batch.id).await.unwrap().is_consistent());
    }

    #[tokio::test]
    async fn test_organization_subscription_from_gateway() {
        let (t, reconciler, plan) = setup().await;
        let org = t.memberships.seed_organization("Acme", "owner");
        let metadata = GatewayMetadata {
            user_id: Some("owner".to_string()),
            organization_id: Some(org.id),
            ..Default::default()
        };
        reconciler
            .process(event(
                "evt_o",
                EVENT_SUBSCRIPTION_CREATED,
                subscription_object("sub_o", "price_pro", "active", 8, &metadata),
                Utc::now().timestamp(),
            ))
            .await
            .unwrap();
        let subs = t.store.list_organization_subscriptions(org.id).await.unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].plan_id, plan.id);
        assert_eq!(
            subs[0].scope,
            SubscriptionScope::Organization {
                organization_id: org.id,
                quantity: 8
            }
        );
    }

    #[tokio::test]
    async fn test_deleted_event_waits_for_holder_lock() {
        let (t, reconciler, plan) = setup().await;
        t.directory.add_user("u1", &[]);
        let now = Utc::now().timestamp();
        reconciler
            .process(event(
                "evt_c",
                EVENT_SUBSCRIPTION_CREATED,
                subscription_object("sub_l", "price_pro", "active", 1, &personal("u1", &plan)),
                now,
            ))
            .await
            .unwrap();

        let guard = t.store.lock(LockKey::User("u1".into())).await.unwrap();
        let mut deleted = {
            let reconciler = reconciler.clone();
            let object = subscription_object("sub_l", "price_pro", "canceled", 1, &personal("u1", &plan));
            tokio::spawn(async move {
                reconciler
                    .process(event("evt_d", EVENT_SUBSCRIPTION_DELETED, object, now + 1))
                    .await
            })
        };
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(50), &mut deleted)
                .await
                .is_err()
        );

        drop(guard);
        assert_eq!(deleted.await.unwrap().unwrap(), WebhookOutcome::Processed);
        let sub = t.store.find_subscription_by_upstream_id("sub_l").await.unwrap().unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_unknown_event_is_ignored_without_record() {
        let (t, reconciler, _) = setup().await;
        let outcome = reconciler
            .process(event("evt_x", "customer.updated", json!({}), Utc::now().timestamp()))
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Ignored);
        assert!(t.store.processed_event_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_handler_leaves_no_record() {
        let (t, reconciler, _) = setup().await;
        let session = json!({ "id": "cs_1", "subscription": "sub_missing", "metadata": BTreeMap::<String, String>::new() });
        let err = reconciler
            .process(event("evt_fail", EVENT_CHECKOUT_COMPLETED, session, Utc::now().timestamp()))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Gateway { .. }));
        assert!(t.store.processed_event_ids().await.is_empty());
        assert!(t.store.get_webhook_event("evt_fail").await.unwrap().is_none());

        let failures: Vec<_> = t
            .audit_store
            .entries()
            .await
            .into_iter()
            .filter(|e| e.event_type == AuditEventType::WebhookProcessed)
            .collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].status, AuditStatus::Failed);
        assert_eq!(failures[0].target.id.as_deref(), Some("evt_fail"));

        // The released claim lets a redelivery run the handler again
        let session = json!({ "id": "cs_1", "subscription": "sub_missing", "metadata": BTreeMap::<String, String>::new() });
        assert!(reconciler
            .process(event("evt_fail", EVENT_CHECKOUT_COMPLETED, session, Utc::now().timestamp()))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_unfinished_event_is_not_applied_twice() {
        let (t, reconciler, plan) = setup().await;
        t.directory.add_user("u1", &[]);
        t.store.fail_next(
            "complete_webhook_event",
            BillingError::store("connection reset"),
        );
        let created = || {
            event(
                "evt_half",
                EVENT_SUBSCRIPTION_CREATED,
                subscription_object("sub_half", "price_pro", "active", 1, &personal("u1", &plan)),
                Utc::now().timestamp(),
            )
        };

        assert!(reconciler.process(created()).await.is_err());
        assert_eq!(
            reconciler.process(created()).await.unwrap(),
            WebhookOutcome::Duplicate
        );
        assert_eq!(t.store.subscription_count().await, 1);
        let record = t.store.get_webhook_event("evt_half").await.unwrap().unwrap();
        assert_eq!(record.status, WebhookEventStatus::Processing);
        assert!(t.store.processed_event_ids().await.is_empty());

        let created_entries = t
            .audit_store
            .entries()
            .await
            .into_iter()
            .filter(|e| e.event_type == AuditEventType::SubscriptionCreated && e.status == AuditStatus::Success)
            .count();
        assert_eq!(created_entries, 1);
    }

    #[tokio::test]
    async fn test_payment_activation_replaces_organization_plan() {
        let (t, reconciler, plan) = setup().await;
        t.directory.add_user("owner", &[]);
        let org = t.memberships.seed_organization("Acme", "owner");
        let owner = Principal::new("owner");
        let organizations = OrganizationEngine::new(t.ctx.clone());
        let request = || OrganizationSubscriptionRequest {
            organization_id: org.id,
            plan_id: plan.id,
            quantity: 5,
            admin_assigned: false,
        };

        t.gateway.set_created_status("active");
        let current = organizations.create_subscription(&owner, request()).await.unwrap();
        t.gateway.set_created_status("incomplete");
        let pending = organizations.create_subscription(&owner, request()).await.unwrap();
        assert_eq!(pending.status, SubscriptionStatus::Incomplete);
        let pending_upstream = pending.upstream_subscription_id.clone().unwrap();

        reconciler
            .process(event(
                "evt_paid",
                EVENT_PAYMENT_SUCCEEDED,
                json!({
                    "id": "in_org",
                    "subscription": pending_upstream,
                    "customer": "cus_test",
                    "amount_paid": 6000,
                    "currency": "eur",
                    "status": "paid",
                }),
                Utc::now().timestamp(),
            ))
            .await
            .unwrap();

        let pending = t.store.get_subscription(pending.id).await.unwrap().unwrap();
        assert_eq!(pending.status, SubscriptionStatus::Active);
        let current = t.store.get_subscription(current.id).await.unwrap().unwrap();
        assert_eq!(current.status, SubscriptionStatus::Replaced);
        let old_upstream = t
            .gateway
            .subscription(current.upstream_subscription_id.as_deref().unwrap())
            .unwrap();
        assert_eq!(old_upstream.status, "canceled");
    }

    #[test]
    fn test_merge_metadata_prefers_primary() {
        let plan = Uuid::new_v4();
        let merged = merge_metadata(
            GatewayMetadata {
                user_id: Some("session-user".to_string()),
                ..Default::default()
            },
            GatewayMetadata {
                user_id: Some("sub-user".to_string()),
                plan_id: Some(plan),
                ..Default::default()
            },
        );
        assert_eq!(merged.user_id.as_deref(), Some("session-user"));
        assert_eq!(merged.plan_id, Some(plan));
    }
}

//! Personal subscription lifecycle.
//!
//! Handles purchase (free and paid), admin assignment, plan changes,
//! cancellation and usage metering for subscriptions held directly by a user.
//! Gateway state arrives later through the webhook reconciler, which reuses
//! [`SubscriptionEngine::on_activated`] and [`SubscriptionEngine::on_deactivated`].

use chrono::{DateTime, Duration, Months, Utc};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use super::context::BillingContext;
use super::error::{BillingError, BillingResult};
use super::gateway::{CreateSubscriptionRequest, GatewayMetadata, ProrationBehavior};
use super::plans::PlanManager;
use super::storage::{LockKey, holder_lock_key};
use super::types::{
    MetricType, Plan, Subscription, SubscriptionScope, SubscriptionStatus, SubscriptionType,
    UsageMetric,
};
use super::usage::{UsageCheck, UsageTracker};
use crate::audit::{AuditEventType, NewAuditEntry};
use crate::auth::Principal;

/// Admin assignments default to one year.
pub const DEFAULT_ASSIGNMENT_DAYS: u32 = 365;
/// Longest admin assignment accepted.
pub const MAX_ASSIGNMENT_DAYS: u32 = 3650;

/// A subscription together with its plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveSubscription {
    pub subscription: Subscription,
    pub plan: Plan,
}

/// Outcome of an admin assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdminAssignment {
    pub subscription: Subscription,
    /// Subscriptions moved to `replaced` by this assignment.
    pub replaced: Vec<Subscription>,
}

/// Subscription lifecycle operations for individual users.
#[derive(Clone)]
pub struct SubscriptionEngine {
    ctx: BillingContext,
    plans: PlanManager,
    usage: UsageTracker,
}

impl SubscriptionEngine {
    #[must_use]
    pub fn new(ctx: BillingContext) -> Self {
        Self {
            plans: PlanManager::new(ctx.store.clone()),
            usage: UsageTracker::new(ctx.store.clone(), ctx.usage),
            ctx,
        }
    }

    #[must_use]
    pub fn plans(&self) -> &PlanManager {
        &self.plans
    }

    #[must_use]
    pub fn usage(&self) -> &UsageTracker {
        &self.usage
    }

    /// Subscribe a user to a plan.
    ///
    /// Free plans activate immediately for one month with no upstream linkage.
    /// Paid plans require a verified e-mail and open an upstream subscription
    /// that stays `incomplete` until the gateway confirms payment.
    pub async fn create_subscription(&self, user_id: &str, plan_id: Uuid) -> BillingResult<Subscription> {
        let result = async {
            let plan = self.plans.active_plan(plan_id).await?;
            if plan.is_free() {
                self.create_free(user_id, &plan).await
            } else {
                self.create_paid(user_id, &plan).await
            }
        }
        .await;
        self.ctx
            .audit_outcome(result, || {
                NewAuditEntry::new(AuditEventType::SubscriptionCreated, "Subscription creation failed")
                    .actor(user_id)
                    .target("plan", plan_id)
            })
            .await
    }

    async fn create_free(&self, user_id: &str, plan: &Plan) -> BillingResult<Subscription> {
        let _lock = self.ctx.store.lock(LockKey::User(user_id.to_string())).await?;
        let now = Utc::now();
        let period_end = now
            .checked_add_months(Months::new(1))
            .unwrap_or(now + Duration::days(30));

        let subscription = Subscription::new(
            plan.id,
            SubscriptionScope::User {
                user_id: user_id.to_string(),
                kind: SubscriptionType::Personal,
            },
            SubscriptionStatus::Active,
            now,
            period_end,
        );
        self.ctx.store.insert_subscription(&subscription).await?;
        self.on_activated(&subscription, plan, now).await;

        tracing::info!(
            target: "tollgate::billing::subscription",
            user_id = %user_id,
            plan = %plan.name,
            subscription_id = %subscription.id,
            "Free subscription created"
        );
        self.ctx
            .audit
            .log_billing(
                AuditEventType::SubscriptionCreated,
                Some(user_id),
                "subscription",
                subscription.id,
                json!({ "plan_id": plan.id, "free": true }),
            )
            .await;
        Ok(subscription)
    }

    async fn create_paid(&self, user_id: &str, plan: &Plan) -> BillingResult<Subscription> {
        let price_id = plan
            .upstream_price_id
            .clone()
            .ok_or_else(|| BillingError::invalid_plan(plan.id, "no upstream price configured"))?;

        let user = self
            .ctx
            .directory
            .get_user(user_id)
            .await?
            .ok_or_else(|| BillingError::UserNotFound {
                user_id: user_id.to_string(),
            })?;
        if !user.email_verified {
            return Err(BillingError::EmailNotVerified {
                user_id: user_id.to_string(),
            });
        }

        let customer_id = self.ensure_customer(user_id, &user.email, &user.name).await?;
        let now = Utc::now();
        let mut subscription = Subscription::new(
            plan.id,
            SubscriptionScope::User {
                user_id: user_id.to_string(),
                kind: SubscriptionType::Personal,
            },
            SubscriptionStatus::Incomplete,
            now,
            now,
        );

        let upstream = self
            .ctx
            .gateway
            .create_subscription(CreateSubscriptionRequest {
                customer_id: customer_id.clone(),
                price_id,
                quantity: 1,
                trial_days: plan.trial_days,
                metadata: GatewayMetadata {
                    user_id: Some(user_id.to_string()),
                    plan_id: Some(plan.id),
                    ..Default::default()
                },
                idempotency_key: format!("subscription:{}", subscription.id),
            })
            .await?;

        subscription.status = SubscriptionStatus::from_gateway(&upstream.status);
        subscription.current_period_start = upstream.period_start();
        subscription.current_period_end = upstream.period_end();
        subscription.trial_end = upstream
            .trial_end
            .and_then(super::gateway::unix_to_datetime);
        subscription.upstream_subscription_id = Some(upstream.id.clone());
        subscription.upstream_customer_id = Some(customer_id);
        subscription.upstream_item_id = upstream.item_id.clone();

        if let Err(e) = self.ctx.store.insert_subscription(&subscription).await {
            compensate_cancel(&self.ctx, &upstream.id, &e).await;
            return Err(e);
        }
        if subscription.is_entitled() {
            self.on_activated(&subscription, plan, now).await;
        }

        tracing::info!(
            target: "tollgate::billing::subscription",
            user_id = %user_id,
            plan = %plan.name,
            subscription_id = %subscription.id,
            upstream_id = %upstream.id,
            status = %subscription.status,
            "Paid subscription created"
        );
        self.ctx
            .audit
            .log_billing(
                AuditEventType::SubscriptionCreated,
                Some(user_id),
                "subscription",
                subscription.id,
                json!({
                    "plan_id": plan.id,
                    "upstream_subscription_id": upstream.id,
                    "status": subscription.status,
                }),
            )
            .await;
        Ok(subscription)
    }

    /// The gateway customer of `owner_id`, created on first use.
    pub(crate) async fn ensure_customer(&self, owner_id: &str, email: &str, name: &str) -> BillingResult<String> {
        if let Some(existing) = self.ctx.store.get_upstream_customer_id(owner_id).await? {
            return Ok(existing);
        }
        let customer_id = self.ctx.gateway.create_customer(owner_id, email, name).await?;
        self.ctx
            .store
            .set_upstream_customer_id(owner_id, &customer_id)
            .await?;
        Ok(customer_id)
    }

    /// Give a user a plan without payment, replacing whatever they hold.
    ///
    /// `duration_days == 0` means one year. Previous entitled subscriptions
    /// are kept as `replaced`. The gateway is not contacted.
    pub async fn admin_assign(
        &self,
        user_id: &str,
        plan_id: Uuid,
        duration_days: u32,
        admin_id: &str,
    ) -> BillingResult<AdminAssignment> {
        let result = self.assign(user_id, plan_id, duration_days, admin_id).await;
        self.ctx
            .audit_outcome(result, || {
                NewAuditEntry::new(AuditEventType::SubscriptionCreated, "Plan assignment failed")
                    .actor(admin_id)
                    .target("user", user_id)
                    .metadata(json!({ "plan_id": plan_id, "duration_days": duration_days }))
            })
            .await
    }

    async fn assign(
        &self,
        user_id: &str,
        plan_id: Uuid,
        duration_days: u32,
        admin_id: &str,
    ) -> BillingResult<AdminAssignment> {
        if duration_days > MAX_ASSIGNMENT_DAYS {
            return Err(BillingError::LimitOutOfRange {
                field: "duration_days".to_string(),
                value: duration_days as i64,
                max: MAX_ASSIGNMENT_DAYS as i64,
            });
        }
        let days = if duration_days == 0 {
            DEFAULT_ASSIGNMENT_DAYS
        } else {
            duration_days
        };
        let plan = self.plans.active_plan(plan_id).await?;

        let _lock = self.ctx.store.lock(LockKey::User(user_id.to_string())).await?;
        let now = Utc::now();
        let mut subscription = Subscription::new(
            plan.id,
            SubscriptionScope::User {
                user_id: user_id.to_string(),
                kind: SubscriptionType::Assigned,
            },
            SubscriptionStatus::Active,
            now,
            now + Duration::days(days as i64),
        );
        subscription.created_by = Some(admin_id.to_string());

        let replaced = self
            .ctx
            .store
            .replace_user_subscriptions(user_id, &subscription, now)
            .await?;

        for old in &replaced {
            if let Ok(old_plan) = self.plans.get_plan(old.plan_id).await {
                self.on_deactivated(old, &old_plan).await;
            }
        }
        self.on_activated(&subscription, &plan, now).await;

        tracing::info!(
            target: "tollgate::billing::subscription",
            user_id = %user_id,
            plan = %plan.name,
            admin_id = %admin_id,
            duration_days = days,
            replaced = replaced.len(),
            "Plan assigned by administrator"
        );
        self.ctx
            .audit
            .log_billing(
                AuditEventType::SubscriptionCreated,
                Some(admin_id),
                "subscription",
                subscription.id,
                json!({
                    "user_id": user_id,
                    "plan_id": plan.id,
                    "duration_days": days,
                    "replaced": replaced.iter().map(|s| s.id).collect::<Vec<_>>(),
                }),
            )
            .await;

        Ok(AdminAssignment {
            subscription,
            replaced,
        })
    }

    /// Move the user's subscription to another plan.
    ///
    /// Upstream-linked subscriptions change price at the gateway first.
    /// Local-only subscriptions (free or admin-assigned) may only move to free
    /// plans. Usage limits follow the new plan; counters keep their values.
    pub async fn upgrade(
        &self,
        user_id: &str,
        new_plan_id: Uuid,
        proration: ProrationBehavior,
    ) -> BillingResult<Subscription> {
        let result = self.change_plan(user_id, new_plan_id, proration).await;
        self.ctx
            .audit_outcome(result, || {
                NewAuditEntry::new(AuditEventType::SubscriptionUpdated, "Plan change failed")
                    .actor(user_id)
                    .target("user", user_id)
                    .metadata(json!({ "new_plan_id": new_plan_id, "proration": proration.as_str() }))
            })
            .await
    }

    async fn change_plan(
        &self,
        user_id: &str,
        new_plan_id: Uuid,
        proration: ProrationBehavior,
    ) -> BillingResult<Subscription> {
        let new_plan = self.plans.active_plan(new_plan_id).await?;

        let _lock = self.ctx.store.lock(LockKey::User(user_id.to_string())).await?;
        let current = self
            .current_subscription(user_id)
            .await?
            .filter(|c| matches!(c.subscription.scope, SubscriptionScope::User { .. }))
            .ok_or_else(|| BillingError::SubscriptionNotFound {
                id: format!("active subscription of user {}", user_id),
            })?;
        let ActiveSubscription {
            subscription: mut sub,
            plan: old_plan,
        } = current;

        match &sub.upstream_subscription_id {
            Some(upstream_id) => {
                let price_id = new_plan.upstream_price_id.as_deref().ok_or_else(|| {
                    BillingError::invalid_plan(new_plan.id, "no upstream price configured")
                })?;
                let upstream = self
                    .ctx
                    .gateway
                    .update_subscription_price(upstream_id, price_id, proration)
                    .await?;
                sub.upstream_item_id = upstream.item_id.or(sub.upstream_item_id);
            }
            None if !new_plan.is_free() => {
                return Err(BillingError::invalid_plan(
                    new_plan.id,
                    "paid plans must be purchased; this subscription has no upstream billing",
                ));
            }
            None => {}
        }

        let now = Utc::now();
        sub.plan_id = new_plan.id;
        sub.updated_at = now;
        self.ctx.store.update_subscription(&sub).await?;

        if old_plan.required_role != new_plan.required_role {
            self.on_deactivated(&sub, &old_plan).await;
            self.sync_role(&sub, &new_plan, true).await;
        }
        self.usage.update_limits(user_id, &new_plan).await?;

        tracing::info!(
            target: "tollgate::billing::subscription",
            user_id = %user_id,
            from = %old_plan.name,
            to = %new_plan.name,
            proration = proration.as_str(),
            "Subscription plan changed"
        );
        self.ctx
            .audit
            .log_billing(
                AuditEventType::SubscriptionUpdated,
                Some(user_id),
                "subscription",
                sub.id,
                json!({
                    "old_plan_id": old_plan.id,
                    "new_plan_id": new_plan.id,
                    "proration": proration.as_str(),
                }),
            )
            .await;
        Ok(sub)
    }

    /// Cancel a subscription now or at the end of its period.
    ///
    /// Only the holder or an administrator may cancel. License rows are
    /// revoked through the batch, organization subscriptions through the
    /// organization.
    pub async fn cancel(
        &self,
        principal: &Principal,
        subscription_id: Uuid,
        at_period_end: bool,
    ) -> BillingResult<Subscription> {
        let result = self.cancel_locked(principal, subscription_id, at_period_end).await;
        self.ctx
            .audit_outcome(result, || {
                NewAuditEntry::new(AuditEventType::SubscriptionCanceled, "Subscription cancellation failed")
                    .actor(&principal.user_id)
                    .target("subscription", subscription_id)
                    .metadata(json!({ "at_period_end": at_period_end }))
            })
            .await
    }

    async fn cancel_locked(
        &self,
        principal: &Principal,
        subscription_id: Uuid,
        at_period_end: bool,
    ) -> BillingResult<Subscription> {
        // Holder before subscription, the order every writer of user rows uses
        let holder = holder_lock_key(&self.require_subscription(subscription_id).await?);
        let _holder_lock = self.ctx.store.lock(holder).await?;
        let _lock = self
            .ctx
            .store
            .lock(LockKey::Subscription(subscription_id))
            .await?;
        let mut sub = self.require_subscription(subscription_id).await?;

        match &sub.scope {
            SubscriptionScope::User { user_id, .. } => {
                if user_id != &principal.user_id && !principal.is_admin() {
                    return Err(BillingError::access_denied(
                        "You can only cancel your own subscriptions",
                    ));
                }
            }
            SubscriptionScope::License { .. } => {
                return Err(BillingError::access_denied(
                    "Licenses are revoked by the batch purchaser",
                ));
            }
            SubscriptionScope::Organization { .. } => {
                return Err(BillingError::access_denied(
                    "Organization subscriptions are managed through the organization",
                ));
            }
        }
        if sub.status.is_terminal() {
            return Err(BillingError::invalid_transition(
                sub.status,
                SubscriptionStatus::Cancelled,
            ));
        }

        if let Some(upstream_id) = &sub.upstream_subscription_id {
            self.ctx
                .gateway
                .cancel_subscription(upstream_id, at_period_end)
                .await?;
        }

        let now = Utc::now();
        if at_period_end {
            sub.cancel_at_period_end = true;
            sub.updated_at = now;
        } else {
            sub.mark_cancelled(now);
        }
        self.ctx.store.update_subscription(&sub).await?;

        if !at_period_end {
            if let Ok(plan) = self.plans.get_plan(sub.plan_id).await {
                self.on_deactivated(&sub, &plan).await;
            }
        }

        tracing::info!(
            target: "tollgate::billing::subscription",
            subscription_id = %sub.id,
            by = %principal.user_id,
            at_period_end,
            "Subscription cancelled"
        );
        self.ctx
            .audit
            .log_billing(
                AuditEventType::SubscriptionCanceled,
                Some(&principal.user_id),
                "subscription",
                sub.id,
                json!({ "at_period_end": at_period_end }),
            )
            .await;
        Ok(sub)
    }

    async fn require_subscription(&self, subscription_id: Uuid) -> BillingResult<Subscription> {
        self.ctx
            .store
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound {
                id: subscription_id.to_string(),
            })
    }

    /// The user's entitled subscription on the highest-priority plan.
    ///
    /// Assigned licenses count. Ties go to the newest subscription.
    pub async fn current_subscription(&self, user_id: &str) -> BillingResult<Option<ActiveSubscription>> {
        let mut best: Option<ActiveSubscription> = None;
        for subscription in self.ctx.store.list_user_subscriptions(user_id).await? {
            if !subscription.is_entitled() {
                continue;
            }
            let Some(plan) = self.ctx.store.get_plan(subscription.plan_id).await? else {
                continue;
            };
            let better = match &best {
                None => true,
                Some(b) => {
                    plan.priority > b.plan.priority
                        || (plan.priority == b.plan.priority
                            && subscription.created_at > b.subscription.created_at)
                }
            };
            if better {
                best = Some(ActiveSubscription { subscription, plan });
            }
        }
        Ok(best)
    }

    /// Whether `increment` more units of `metric` fit the user's plan.
    pub async fn check_usage(&self, user_id: &str, metric: MetricType, increment: i64) -> BillingResult<UsageCheck> {
        let active = self.current_subscription(user_id).await?;
        self.usage
            .check_limit(
                user_id,
                metric,
                increment,
                active.as_ref().map(|a| (&a.subscription, &a.plan)),
                Utc::now(),
            )
            .await
    }

    /// Add `delta` units of usage in the current period.
    pub async fn record_usage(&self, user_id: &str, metric: MetricType, delta: i64) -> BillingResult<UsageMetric> {
        let active = self.current_subscription(user_id).await?;
        self.usage
            .record(
                user_id,
                metric,
                delta,
                active.as_ref().map(|a| (&a.subscription, &a.plan)),
                Utc::now(),
            )
            .await
    }

    pub async fn usage_metrics(&self, user_id: &str) -> BillingResult<Vec<UsageMetric>> {
        self.usage.list(user_id).await
    }

    /// Grant the plan's role and set up usage counters for the holder.
    ///
    /// Failures are logged; the subscription stays active regardless.
    pub(crate) async fn on_activated(&self, subscription: &Subscription, plan: &Plan, now: DateTime<Utc>) {
        let Some(user_id) = subscription.user_id() else {
            return;
        };
        self.sync_role(subscription, plan, true).await;
        if let Err(e) = self.usage.initialize(user_id, subscription, plan, now).await {
            tracing::warn!(
                target: "tollgate::billing::subscription",
                user_id = %user_id,
                subscription_id = %subscription.id,
                error = %e,
                "Failed to initialize usage metrics"
            );
        }
    }

    /// Revoke the plan's role from the holder and move their limits onto
    /// whatever they still hold.
    ///
    /// Call after the subscription is stored as no longer entitled (or as
    /// moved to its new plan). Failures are logged.
    pub(crate) async fn on_deactivated(&self, subscription: &Subscription, plan: &Plan) {
        let Some(user_id) = subscription.user_id() else {
            return;
        };
        let fallback = match self.current_subscription(user_id).await {
            Ok(fallback) => fallback,
            Err(e) => {
                tracing::warn!(
                    target: "tollgate::billing::subscription",
                    user_id = %user_id,
                    error = %e,
                    "Failed to resolve remaining subscription"
                );
                None
            }
        };

        let keeps_role = fallback
            .as_ref()
            .is_some_and(|f| f.plan.required_role == plan.required_role);
        if !keeps_role {
            self.sync_role(subscription, plan, false).await;
        }
        let Some(fallback) = fallback else {
            return;
        };
        self.sync_role(&fallback.subscription, &fallback.plan, true).await;
        if let Err(e) = self.usage.update_limits(user_id, &fallback.plan).await {
            tracing::warn!(
                target: "tollgate::billing::subscription",
                user_id = %user_id,
                plan = %fallback.plan.name,
                error = %e,
                "Failed to move usage limits to remaining subscription"
            );
        }
    }

    async fn sync_role(&self, subscription: &Subscription, plan: &Plan, grant: bool) {
        let (Some(user_id), Some(role)) = (subscription.user_id(), plan.required_role.as_deref()) else {
            return;
        };
        let result = if grant {
            self.ctx.directory.assign_role(user_id, role).await
        } else {
            self.ctx.directory.revoke_role(user_id, role).await
        };
        match result {
            Ok(()) => tracing::debug!(
                target: "tollgate::billing::subscription",
                user_id = %user_id,
                role = %role,
                grant,
                "Plan role synchronized"
            ),
            Err(e) => tracing::warn!(
                target: "tollgate::billing::subscription",
                user_id = %user_id,
                role = %role,
                grant,
                error = %e,
                "Failed to synchronize plan role"
            ),
        }
    }
}

/// Cancel an upstream subscription whose local record could not be written.
pub(crate) async fn compensate_cancel(ctx: &BillingContext, upstream_id: &str, cause: &BillingError) {
    match ctx.gateway.cancel_subscription(upstream_id, false).await {
        Ok(_) => tracing::warn!(
            target: "tollgate::billing::subscription",
            upstream_id = %upstream_id,
            cause = %cause,
            "Upstream subscription cancelled after local write failed"
        ),
        Err(e) => tracing::error!(
            target: "tollgate::billing::subscription",
            upstream_id = %upstream_id,
            cause = %cause,
            error = %e,
            "Compensating cancellation failed; upstream subscription is orphaned"
        ),
    }
}

//! Organization subscriptions and effective features.
//!
//! An organization holds at most one live subscription. Every active member
//! is entitled to its plan, and a user who belongs to several organizations
//! gets the combination of all their plans.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeSet;
use uuid::Uuid;

use super::context::BillingContext;
use super::error::{BillingError, BillingResult};
use super::gateway::{CreateSubscriptionRequest, GatewayMetadata, GatewaySubscription, ProrationBehavior};
use super::plans::PlanManager;
use super::storage::LockKey;
use super::subscription::{SubscriptionEngine, compensate_cancel};
use super::types::{Plan, Subscription, SubscriptionScope, SubscriptionStatus, UNLIMITED};
use crate::audit::{AuditEventType, NewAuditEntry};
use crate::auth::Principal;
use crate::organizations::{OrgRole, OrganizationPolicy};

/// Free and admin-assigned organization subscriptions run for a year.
const LOCAL_TERM_DAYS: i64 = 365;

/// Request to subscribe an organization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrganizationSubscriptionRequest {
    pub organization_id: Uuid,
    pub plan_id: Uuid,
    /// Coerced to 1 when not positive.
    pub quantity: i32,
    /// Grant without payment. Administrators only.
    pub admin_assigned: bool,
}

/// An organization's subscription with its plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrganizationFeatures {
    pub organization_id: Uuid,
    pub subscription: Subscription,
    pub plan: Plan,
}

/// One organization's contribution to a user's effective features.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrganizationEntitlement {
    pub organization_id: Uuid,
    pub subscription_id: Uuid,
    pub plan_id: Uuid,
    pub plan_name: String,
    pub priority: i32,
    pub role: OrgRole,
    pub is_owner: bool,
    pub is_manager: bool,
    #[serde(skip)]
    subscribed_at: DateTime<Utc>,
}

/// Combined view of every organization plan a user receives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EffectiveFeatures {
    pub user_id: String,
    pub highest_plan: Plan,
    pub all_features: BTreeSet<String>,
    pub max_concurrent_terminals: i32,
    pub max_session_duration_minutes: i32,
    pub max_courses: i32,
    pub max_lab_sessions: i32,
    pub max_concurrent_users: i32,
    pub storage_gb: i32,
    /// Highest priority first.
    pub organizations: Vec<OrganizationEntitlement>,
}

/// Larger of two limits, where `-1` (unlimited) beats any finite value.
#[must_use]
pub fn max_limit(a: i32, b: i32) -> i32 {
    if a == UNLIMITED || b == UNLIMITED {
        UNLIMITED
    } else {
        a.max(b)
    }
}

impl EffectiveFeatures {
    fn combine(user_id: &str, mut contributions: Vec<(OrganizationEntitlement, Plan)>) -> Option<Self> {
        // Priority descending, then earliest subscription first
        contributions.sort_by(|(a, _), (b, _)| {
            b.priority
                .cmp(&a.priority)
                .then(a.subscribed_at.cmp(&b.subscribed_at))
        });
        let (_, highest) = contributions.first()?;
        let mut combined = Self {
            user_id: user_id.to_string(),
            highest_plan: highest.clone(),
            all_features: BTreeSet::new(),
            max_concurrent_terminals: highest.max_concurrent_terminals,
            max_session_duration_minutes: highest.max_session_duration_minutes,
            max_courses: highest.max_courses,
            max_lab_sessions: highest.max_lab_sessions,
            max_concurrent_users: highest.max_concurrent_users,
            storage_gb: highest.storage_gb,
            organizations: Vec::with_capacity(contributions.len()),
        };
        for (entitlement, plan) in contributions {
            combined.all_features.extend(plan.features.iter().cloned());
            combined.max_concurrent_terminals =
                max_limit(combined.max_concurrent_terminals, plan.max_concurrent_terminals);
            combined.max_session_duration_minutes =
                max_limit(combined.max_session_duration_minutes, plan.max_session_duration_minutes);
            combined.max_courses = max_limit(combined.max_courses, plan.max_courses);
            combined.max_lab_sessions = max_limit(combined.max_lab_sessions, plan.max_lab_sessions);
            combined.max_concurrent_users =
                max_limit(combined.max_concurrent_users, plan.max_concurrent_users);
            combined.storage_gb = max_limit(combined.storage_gb, plan.storage_gb);
            combined.organizations.push(entitlement);
        }
        Some(combined)
    }

    #[must_use]
    pub fn has_feature(&self, key: &str) -> bool {
        self.all_features.contains(key)
    }

    #[must_use]
    pub fn organization_ids(&self) -> Vec<Uuid> {
        self.organizations.iter().map(|o| o.organization_id).collect()
    }
}

/// Organization subscription lifecycle and entitlement resolution.
#[derive(Clone)]
pub struct OrganizationEngine {
    ctx: BillingContext,
    plans: PlanManager,
    subscriptions: SubscriptionEngine,
    policy: OrganizationPolicy,
}

impl OrganizationEngine {
    #[must_use]
    pub fn new(ctx: BillingContext) -> Self {
        Self {
            plans: PlanManager::new(ctx.store.clone()),
            subscriptions: SubscriptionEngine::new(ctx.clone()),
            policy: OrganizationPolicy::new(ctx.memberships.clone()),
            ctx,
        }
    }

    #[must_use]
    pub fn policy(&self) -> &OrganizationPolicy {
        &self.policy
    }

    /// The organization's newest entitled subscription, or failing that its
    /// newest non-terminal one (a purchase still awaiting payment).
    pub async fn current_subscription(&self, organization_id: Uuid) -> BillingResult<Option<Subscription>> {
        let live: Vec<Subscription> = self
            .ctx
            .store
            .list_organization_subscriptions(organization_id)
            .await?
            .into_iter()
            .filter(|s| !s.status.is_terminal())
            .collect();
        let entitled = live.iter().position(Subscription::is_entitled).unwrap_or(0);
        Ok(live.into_iter().nth(entitled))
    }

    /// Every subscription the organization has held, newest first.
    pub async fn subscriptions(&self, principal: &Principal, organization_id: Uuid) -> BillingResult<Vec<Subscription>> {
        self.policy.require_member(principal, organization_id).await?;
        self.ctx
            .store
            .list_organization_subscriptions(organization_id)
            .await
    }

    /// Retire every other live subscription of `current`'s organization.
    ///
    /// Upstream-billed ones are cancelled at the gateway before they are
    /// marked replaced. Callers hold the organization lock and only call this
    /// once `current` grants entitlement, so an unpaid purchase never takes
    /// away a working plan.
    pub(crate) async fn supersede_previous(&self, current: &Subscription, now: DateTime<Utc>) -> BillingResult<Vec<Uuid>> {
        let Some(organization_id) = current.organization_id() else {
            return Ok(Vec::new());
        };
        let mut replaced = Vec::new();
        for mut old in self
            .ctx
            .store
            .list_organization_subscriptions(organization_id)
            .await?
            .into_iter()
            .filter(|s| s.id != current.id && !s.status.is_terminal())
        {
            if let Some(upstream_id) = &old.upstream_subscription_id {
                self.ctx.gateway.cancel_subscription(upstream_id, false).await?;
            }
            old.mark_replaced(now);
            self.ctx.store.update_subscription(&old).await?;
            replaced.push(old.id);
        }
        if !replaced.is_empty() {
            tracing::info!(
                target: "tollgate::billing::organization",
                organization_id = %organization_id,
                subscription_id = %current.id,
                replaced = replaced.len(),
                "Previous organization subscription replaced"
            );
        }
        Ok(replaced)
    }

    /// Subscribe an organization to a plan.
    ///
    /// Requires an owner, a manager or an administrator. Free and
    /// admin-assigned subscriptions are active for a year and replace the
    /// previous plan at once. Paid ones start `incomplete` upstream and only
    /// replace it when the gateway confirms payment.
    pub async fn create_subscription(
        &self,
        principal: &Principal,
        request: OrganizationSubscriptionRequest,
    ) -> BillingResult<Subscription> {
        let result = self.subscribe(principal, &request).await;
        self.ctx
            .audit_outcome(result, || {
                NewAuditEntry::new(AuditEventType::SubscriptionCreated, "Organization subscription failed")
                    .actor(&principal.user_id)
                    .organization(request.organization_id)
                    .target("organization", request.organization_id)
                    .metadata(json!({
                        "plan_id": request.plan_id,
                        "admin_assigned": request.admin_assigned,
                    }))
            })
            .await
    }

    async fn subscribe(
        &self,
        principal: &Principal,
        request: &OrganizationSubscriptionRequest,
    ) -> BillingResult<Subscription> {
        let organization_id = request.organization_id;
        self.policy.require_manager(principal, organization_id).await?;
        if request.admin_assigned && !principal.is_admin() {
            return Err(BillingError::access_denied(
                "Only administrators can assign organization plans",
            ));
        }
        let plan = self.plans.active_plan(request.plan_id).await?;
        let quantity = request.quantity.max(1);

        let _lock = self
            .ctx
            .store
            .lock(LockKey::Organization(organization_id))
            .await?;
        let now = Utc::now();
        let scope = SubscriptionScope::Organization {
            organization_id,
            quantity,
        };

        let subscription = if plan.is_free() || request.admin_assigned {
            let mut sub = Subscription::new(
                plan.id,
                scope,
                SubscriptionStatus::Active,
                now,
                now + Duration::days(LOCAL_TERM_DAYS),
            );
            sub.created_by = Some(principal.user_id.clone());
            self.supersede_previous(&sub, now).await?;
            self.ctx.store.insert_subscription(&sub).await?;
            sub
        } else {
            self.create_paid(principal, organization_id, &plan, scope, quantity, now)
                .await?
        };

        tracing::info!(
            target: "tollgate::billing::organization",
            organization_id = %organization_id,
            plan = %plan.name,
            quantity,
            status = %subscription.status,
            by = %principal.user_id,
            "Organization subscription created"
        );
        self.ctx
            .audit
            .log_organization(
                AuditEventType::SubscriptionCreated,
                &principal.user_id,
                organization_id,
                format!("Organization subscribed to {}", plan.name),
                json!({
                    "subscription_id": subscription.id,
                    "plan_id": plan.id,
                    "quantity": quantity,
                    "admin_assigned": request.admin_assigned,
                }),
            )
            .await;
        Ok(subscription)
    }

    async fn create_paid(
        &self,
        principal: &Principal,
        organization_id: Uuid,
        plan: &Plan,
        scope: SubscriptionScope,
        quantity: i32,
        now: DateTime<Utc>,
    ) -> BillingResult<Subscription> {
        let price_id = plan
            .upstream_price_id
            .clone()
            .ok_or_else(|| BillingError::invalid_plan(plan.id, "no upstream price configured"))?;
        let organization = self
            .ctx
            .memberships
            .get_organization(organization_id)
            .await?
            .ok_or_else(|| BillingError::OrganizationNotFound {
                id: organization_id.to_string(),
            })?;
        let billing_contact = self
            .ctx
            .directory
            .get_user(&principal.user_id)
            .await?
            .ok_or_else(|| BillingError::UserNotFound {
                user_id: principal.user_id.clone(),
            })?;
        if !billing_contact.email_verified {
            return Err(BillingError::EmailNotVerified {
                user_id: principal.user_id.clone(),
            });
        }

        let customer_id = self
            .subscriptions
            .ensure_customer(&organization_id.to_string(), &billing_contact.email, &organization.name)
            .await?;

        let mut sub = Subscription::new(plan.id, scope, SubscriptionStatus::Incomplete, now, now);
        sub.created_by = Some(principal.user_id.clone());
        let upstream = self
            .ctx
            .gateway
            .create_subscription(CreateSubscriptionRequest {
                customer_id: customer_id.clone(),
                price_id,
                quantity,
                trial_days: plan.trial_days,
                metadata: GatewayMetadata {
                    user_id: Some(principal.user_id.clone()),
                    plan_id: Some(plan.id),
                    organization_id: Some(organization_id),
                    quantity: Some(quantity),
                    ..Default::default()
                },
                idempotency_key: format!("organization-subscription:{}", sub.id),
            })
            .await?;
        apply_upstream(&mut sub, &upstream);
        sub.upstream_customer_id = Some(customer_id);

        let result = async {
            if sub.is_entitled() {
                self.supersede_previous(&sub, now).await?;
            }
            self.ctx.store.insert_subscription(&sub).await
        }
        .await;
        if let Err(e) = result {
            compensate_cancel(&self.ctx, &upstream.id, &e).await;
            return Err(e);
        }
        Ok(sub)
    }

    /// Mirror an organization upstream subscription that has no local record.
    pub(crate) async fn create_from_upstream(
        &self,
        upstream: &GatewaySubscription,
        organization_id: Uuid,
        plan: &Plan,
        created_by: Option<String>,
        event_at: DateTime<Utc>,
    ) -> BillingResult<Subscription> {
        let _lock = self
            .ctx
            .store
            .lock(LockKey::Organization(organization_id))
            .await?;
        let now = Utc::now();
        let mut sub = Subscription::new(
            plan.id,
            SubscriptionScope::Organization {
                organization_id,
                quantity: upstream.quantity.max(1),
            },
            SubscriptionStatus::Incomplete,
            now,
            now,
        );
        apply_upstream(&mut sub, upstream);
        sub.upstream_customer_id = upstream.customer_id.clone();
        sub.created_by = created_by;
        sub.last_event_at = Some(event_at);
        if sub.is_entitled() {
            self.supersede_previous(&sub, now).await?;
        }
        self.ctx.store.insert_subscription(&sub).await?;
        Ok(sub)
    }

    async fn require_current(&self, organization_id: Uuid) -> BillingResult<Subscription> {
        self.current_subscription(organization_id)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound {
                id: format!("organization {}", organization_id),
            })
    }

    /// Move the organization to another plan.
    pub async fn update_subscription(
        &self,
        principal: &Principal,
        organization_id: Uuid,
        plan_id: Uuid,
    ) -> BillingResult<Subscription> {
        let result = self.change_plan(principal, organization_id, plan_id).await;
        self.ctx
            .audit_outcome(result, || {
                NewAuditEntry::new(AuditEventType::SubscriptionUpdated, "Organization plan change failed")
                    .actor(&principal.user_id)
                    .organization(organization_id)
                    .target("organization", organization_id)
                    .metadata(json!({ "new_plan_id": plan_id }))
            })
            .await
    }

    async fn change_plan(
        &self,
        principal: &Principal,
        organization_id: Uuid,
        plan_id: Uuid,
    ) -> BillingResult<Subscription> {
        self.policy.require_manager(principal, organization_id).await?;
        let plan = self.plans.active_plan(plan_id).await?;

        let _lock = self
            .ctx
            .store
            .lock(LockKey::Organization(organization_id))
            .await?;
        let mut sub = self.require_current(organization_id).await?;
        let old_plan_id = sub.plan_id;

        match &sub.upstream_subscription_id {
            Some(upstream_id) => {
                let price_id = plan.upstream_price_id.as_deref().ok_or_else(|| {
                    BillingError::invalid_plan(plan.id, "no upstream price configured")
                })?;
                self.ctx
                    .gateway
                    .update_subscription_price(upstream_id, price_id, ProrationBehavior::default())
                    .await?;
            }
            None if !plan.is_free() && !principal.is_admin() => {
                return Err(BillingError::invalid_plan(
                    plan.id,
                    "paid plans must be purchased; this subscription has no upstream billing",
                ));
            }
            None => {}
        }

        sub.plan_id = plan.id;
        sub.updated_at = Utc::now();
        self.ctx.store.update_subscription(&sub).await?;

        self.ctx
            .audit
            .log_organization(
                AuditEventType::SubscriptionUpdated,
                &principal.user_id,
                organization_id,
                format!("Organization plan changed to {}", plan.name),
                json!({ "subscription_id": sub.id, "old_plan_id": old_plan_id, "new_plan_id": plan.id }),
            )
            .await;
        Ok(sub)
    }

    /// Cancel the organization's subscription now or at period end.
    pub async fn cancel_subscription(
        &self,
        principal: &Principal,
        organization_id: Uuid,
        at_period_end: bool,
    ) -> BillingResult<Subscription> {
        let result = self.cancel_current(principal, organization_id, at_period_end).await;
        self.ctx
            .audit_outcome(result, || {
                NewAuditEntry::new(AuditEventType::SubscriptionCanceled, "Organization cancellation failed")
                    .actor(&principal.user_id)
                    .organization(organization_id)
                    .target("organization", organization_id)
                    .metadata(json!({ "at_period_end": at_period_end }))
            })
            .await
    }

    async fn cancel_current(
        &self,
        principal: &Principal,
        organization_id: Uuid,
        at_period_end: bool,
    ) -> BillingResult<Subscription> {
        self.policy.require_manager(principal, organization_id).await?;
        let _lock = self
            .ctx
            .store
            .lock(LockKey::Organization(organization_id))
            .await?;
        let mut sub = self.require_current(organization_id).await?;

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

        tracing::info!(
            target: "tollgate::billing::organization",
            organization_id = %organization_id,
            subscription_id = %sub.id,
            at_period_end,
            "Organization subscription cancelled"
        );
        self.ctx
            .audit
            .log_organization(
                AuditEventType::SubscriptionCanceled,
                &principal.user_id,
                organization_id,
                "Organization subscription cancelled",
                json!({ "subscription_id": sub.id, "at_period_end": at_period_end }),
            )
            .await;
        Ok(sub)
    }

    async fn entitled(&self, organization_id: Uuid) -> BillingResult<Option<(Subscription, Plan)>> {
        let Some(sub) = self
            .ctx
            .store
            .list_organization_subscriptions(organization_id)
            .await?
            .into_iter()
            .find(Subscription::is_entitled)
        else {
            return Ok(None);
        };
        Ok(self
            .ctx
            .store
            .get_plan(sub.plan_id)
            .await?
            .map(|plan| (sub, plan)))
    }

    /// The plan an organization currently receives. Members and administrators only.
    pub async fn organization_features(
        &self,
        principal: &Principal,
        organization_id: Uuid,
    ) -> BillingResult<OrganizationFeatures> {
        self.policy.require_member(principal, organization_id).await?;
        let (subscription, plan) =
            self.entitled(organization_id)
                .await?
                .ok_or_else(|| BillingError::SubscriptionNotFound {
                    id: format!("organization {}", organization_id),
                })?;
        Ok(OrganizationFeatures {
            organization_id,
            subscription,
            plan,
        })
    }

    pub async fn can_organization_access_feature(&self, organization_id: Uuid, key: &str) -> BillingResult<bool> {
        Ok(self
            .entitled(organization_id)
            .await?
            .is_some_and(|(_, plan)| plan.has_feature(key)))
    }

    /// Combine the plans of every organization the user actively belongs to.
    ///
    /// Fails with `NoOrganizationSubscriptions` when none of them has an
    /// entitled subscription.
    pub async fn effective_features(&self, user_id: &str) -> BillingResult<EffectiveFeatures> {
        let mut contributions = Vec::new();
        for membership in self.ctx.memberships.list_user_memberships(user_id).await? {
            let active_org = self
                .ctx
                .memberships
                .get_organization(membership.organization_id)
                .await?
                .is_some_and(|o| o.is_active);
            if !active_org {
                continue;
            }
            let Some((sub, plan)) = self.entitled(membership.organization_id).await? else {
                continue;
            };
            contributions.push((
                OrganizationEntitlement {
                    organization_id: membership.organization_id,
                    subscription_id: sub.id,
                    plan_id: plan.id,
                    plan_name: plan.name.clone(),
                    priority: plan.priority,
                    role: membership.role,
                    is_owner: membership.role.is_owner(),
                    is_manager: membership.role.is_manager(),
                    subscribed_at: sub.created_at,
                },
                plan,
            ));
        }

        EffectiveFeatures::combine(user_id, contributions).ok_or_else(|| {
            BillingError::NoOrganizationSubscriptions {
                user_id: user_id.to_string(),
            }
        })
    }

    /// Whether any of the user's organization plans includes `key`.
    pub async fn can_user_access_feature(&self, user_id: &str, key: &str) -> BillingResult<bool> {
        match self.effective_features(user_id).await {
            Ok(features) => Ok(features.has_feature(key)),
            Err(BillingError::NoOrganizationSubscriptions { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// The organization whose highest-priority plan provides `key`.
    pub async fn user_organization_with_feature(
        &self,
        user_id: &str,
        key: &str,
    ) -> BillingResult<Option<OrganizationEntitlement>> {
        let features = match self.effective_features(user_id).await {
            Ok(features) => features,
            Err(BillingError::NoOrganizationSubscriptions { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        for entitlement in features.organizations {
            let provides = self
                .ctx
                .store
                .get_plan(entitlement.plan_id)
                .await?
                .is_some_and(|p| p.has_feature(key));
            if provides {
                return Ok(Some(entitlement));
            }
        }
        Ok(None)
    }
}

fn apply_upstream(sub: &mut Subscription, upstream: &GatewaySubscription) {
    sub.status = SubscriptionStatus::from_gateway(&upstream.status);
    sub.current_period_start = upstream.period_start();
    sub.current_period_end = upstream.period_end();
    sub.trial_end = upstream.trial_end.and_then(super::gateway::unix_to_datetime);
    sub.cancel_at_period_end = upstream.cancel_at_period_end;
    sub.upstream_subscription_id = Some(upstream.id.clone());
    sub.upstream_item_id = upstream.item_id.clone();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::context::test::TestBilling;
    use crate::billing::directory::ADMIN_ROLE;
    use crate::organizations::Organization;

    async fn setup() -> (TestBilling, OrganizationEngine) {
        let t = TestBilling::new().await;
        let engine = OrganizationEngine::new(t.ctx.clone());
        (t, engine)
    }

    async fn plan(engine: &OrganizationEngine, name: &str, priority: i32, features: &[&str]) -> Plan {
        engine
            .plans
            .create_plan(
                Plan::builder(name)
                    .priority(priority)
                    .features(features.iter().copied())
                    .max_concurrent_terminals(priority / 10)
                    .build(),
            )
            .await
            .unwrap()
    }

    fn request(organization: &Organization, plan: &Plan) -> OrganizationSubscriptionRequest {
        OrganizationSubscriptionRequest {
            organization_id: organization.id,
            plan_id: plan.id,
            quantity: 0,
            admin_assigned: false,
        }
    }

    #[tokio::test]
    async fn test_effective_features_aggregation() {
        let (t, engine) = setup().await;
        let p10 = plan(&engine, "Ten", 10, &["export", "api_access"]).await;
        let p20 = plan(&engine, "Twenty", 20, &["api_access", "analytics"]).await;
        let p30 = plan(&engine, "Thirty", 30, &["analytics", "custom_themes", "priority_support"]).await;

        for (name, p) in [("A", &p10), ("B", &p20), ("C", &p30)] {
            let org = t.memberships.seed_organization(name, "owner");
            t.memberships.seed_member(org.id, "u1", OrgRole::Member);
            engine
                .create_subscription(&Principal::new("owner"), request(&org, p))
                .await
                .unwrap();
        }

        let features = engine.effective_features("u1").await.unwrap();
        assert_eq!(features.highest_plan.priority, 30);
        assert_eq!(
            features.all_features,
            ["analytics", "api_access", "custom_themes", "export", "priority_support"]
                .into_iter()
                .map(String::from)
                .collect::<BTreeSet<_>>()
        );
        assert_eq!(features.max_concurrent_terminals, 3);
        assert_eq!(features.organizations.len(), 3);
        assert!(features.organizations.iter().all(|o| !o.is_owner));

        let owner_view = engine.effective_features("owner").await.unwrap();
        assert!(owner_view.organizations.iter().all(|o| o.is_owner && o.is_manager));
    }

    #[tokio::test]
    async fn test_unlimited_absorbs_finite_limits() {
        let (t, engine) = setup().await;
        let finite = plan(&engine, "Finite", 50, &[]).await;
        let unlimited = engine
            .plans
            .create_plan(
                Plan::builder("Unlimited")
                    .priority(5)
                    .max_concurrent_terminals(UNLIMITED)
                    .build(),
            )
            .await
            .unwrap();
        for (name, p) in [("A", &finite), ("B", &unlimited)] {
            let org = t.memberships.seed_organization(name, "owner");
            t.memberships.seed_member(org.id, "u1", OrgRole::Member);
            engine
                .create_subscription(&Principal::new("owner"), request(&org, p))
                .await
                .unwrap();
        }

        let features = engine.effective_features("u1").await.unwrap();
        assert_eq!(features.max_concurrent_terminals, UNLIMITED);
        assert_eq!(features.highest_plan.id, finite.id);
    }

    #[test]
    fn test_max_limit() {
        assert_eq!(max_limit(3, 5), 5);
        assert_eq!(max_limit(-1, 5), -1);
        assert_eq!(max_limit(100, -1), -1);
        assert_eq!(max_limit(0, 0), 0);
    }

    #[tokio::test]
    async fn test_no_organization_subscriptions() {
        let (t, engine) = setup().await;
        let org = t.memberships.seed_organization("A", "owner");
        t.memberships.seed_member(org.id, "u1", OrgRole::Member);

        let err = engine.effective_features("u1").await.unwrap_err();
        assert!(matches!(err, BillingError::NoOrganizationSubscriptions { .. }));
        assert!(!engine.can_user_access_feature("u1", "export").await.unwrap());
        assert!(engine
            .user_organization_with_feature("u1", "export")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_inactive_membership_excluded() {
        let (t, engine) = setup().await;
        let p = plan(&engine, "Ten", 10, &["export"]).await;
        let org = t.memberships.seed_organization("A", "owner");
        t.memberships.seed_member(org.id, "u1", OrgRole::Member);
        engine
            .create_subscription(&Principal::new("owner"), request(&org, &p))
            .await
            .unwrap();
        assert!(engine.can_user_access_feature("u1", "export").await.unwrap());

        t.memberships.deactivate_member(org.id, "u1");
        assert!(!engine.can_user_access_feature("u1", "export").await.unwrap());
    }

    #[tokio::test]
    async fn test_organization_with_feature_prefers_priority() {
        let (t, engine) = setup().await;
        let low = plan(&engine, "Low", 10, &["export"]).await;
        let high = plan(&engine, "High", 40, &["export", "analytics"]).await;
        let org_low = t.memberships.seed_organization("Low org", "owner");
        let org_high = t.memberships.seed_organization("High org", "owner");
        for (org, p) in [(&org_low, &low), (&org_high, &high)] {
            t.memberships.seed_member(org.id, "u1", OrgRole::Manager);
            engine
                .create_subscription(&Principal::new("owner"), request(org, p))
                .await
                .unwrap();
        }

        let found = engine
            .user_organization_with_feature("u1", "export")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.organization_id, org_high.id);
        assert!(found.is_manager);
        assert!(engine
            .user_organization_with_feature("u1", "api_access")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_create_requires_manager_or_admin() {
        let (t, engine) = setup().await;
        let p = plan(&engine, "Ten", 10, &[]).await;
        let org = t.memberships.seed_organization("A", "owner");
        t.memberships.seed_member(org.id, "member", OrgRole::Member);

        let err = engine
            .create_subscription(&Principal::new("member"), request(&org, &p))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::AccessDenied { .. }));

        let admin = Principal::new("root").with_roles([ADMIN_ROLE]);
        let sub = engine.create_subscription(&admin, request(&org, &p)).await.unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(
            sub.scope,
            SubscriptionScope::Organization {
                organization_id: org.id,
                quantity: 1
            }
        );
    }

    #[tokio::test]
    async fn test_admin_assigned_paid_plan_skips_gateway() {
        let (t, engine) = setup().await;
        let paid = engine
            .plans
            .create_plan(
                Plan::builder("Business")
                    .priority(50)
                    .price(9900, "eur")
                    .upstream_price("prod_biz", "price_biz")
                    .build(),
            )
            .await
            .unwrap();
        let org = t.memberships.seed_organization("A", "owner");

        let mut req = request(&org, &paid);
        req.admin_assigned = true;
        let err = engine
            .create_subscription(&Principal::new("owner"), req.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::AccessDenied { .. }));

        let admin = Principal::new("root").with_roles([ADMIN_ROLE]);
        let sub = engine.create_subscription(&admin, req).await.unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert!(sub.upstream_subscription_id.is_none());
        assert!(t.gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unpaid_purchase_keeps_current_plan() {
        let (t, engine) = setup().await;
        let free = plan(&engine, "Free", 0, &[]).await;
        let paid = engine
            .plans
            .create_plan(
                Plan::builder("Business")
                    .priority(50)
                    .price(9900, "eur")
                    .features(["analytics"])
                    .upstream_price("prod_biz", "price_biz")
                    .build(),
            )
            .await
            .unwrap();
        t.directory.add_user("owner", &[]);
        let org = t.memberships.seed_organization("A", "owner");
        t.memberships.seed_member(org.id, "u1", OrgRole::Member);
        let owner = Principal::new("owner");

        let first = engine.create_subscription(&owner, request(&org, &free)).await.unwrap();

        // A purchase the gateway reports active takes over at once
        t.gateway.set_created_status("active");
        let active = engine.create_subscription(&owner, request(&org, &paid)).await.unwrap();
        assert_eq!(active.status, SubscriptionStatus::Active);
        let history = engine.subscriptions(&owner, org.id).await.unwrap();
        let old = history.iter().find(|s| s.id == first.id).unwrap();
        assert_eq!(old.status, SubscriptionStatus::Replaced);

        // One still awaiting payment leaves the working plan alone
        t.gateway.set_created_status("incomplete");
        let mut req = request(&org, &paid);
        req.quantity = 12;
        let pending = engine.create_subscription(&owner, req).await.unwrap();
        assert_eq!(pending.status, SubscriptionStatus::Incomplete);

        let upstream = t
            .gateway
            .subscription(pending.upstream_subscription_id.as_deref().unwrap())
            .unwrap();
        assert_eq!(upstream.quantity, 12);
        assert_eq!(upstream.metadata().organization_id, Some(org.id));

        let history = engine.subscriptions(&owner, org.id).await.unwrap();
        let kept = history.iter().find(|s| s.id == active.id).unwrap();
        assert_eq!(kept.status, SubscriptionStatus::Active);
        let active_upstream = t
            .gateway
            .subscription(active.upstream_subscription_id.as_deref().unwrap())
            .unwrap();
        assert_eq!(active_upstream.status, "active");
        assert!(engine.can_user_access_feature("u1", "analytics").await.unwrap());
        assert_eq!(
            engine.current_subscription(org.id).await.unwrap().unwrap().id,
            active.id
        );

        // Superseding retires the old plan and cancels its billing
        let replaced = engine.supersede_previous(&pending, Utc::now()).await.unwrap();
        assert_eq!(replaced, vec![active.id]);
        let active_upstream = t
            .gateway
            .subscription(active.upstream_subscription_id.as_deref().unwrap())
            .unwrap();
        assert_eq!(active_upstream.status, "canceled");
    }

    #[tokio::test]
    async fn test_failed_purchase_is_audited() {
        let (t, engine) = setup().await;
        let paid = engine
            .plans
            .create_plan(
                Plan::builder("Business")
                    .priority(50)
                    .price(9900, "eur")
                    .upstream_price("prod_biz", "price_biz")
                    .build(),
            )
            .await
            .unwrap();
        t.directory.add_user("owner", &[]);
        let org = t.memberships.seed_organization("A", "owner");
        t.gateway.fail_next(BillingError::gateway("create_customer", "card network down", Some(502)));

        engine
            .create_subscription(&Principal::new("owner"), request(&org, &paid))
            .await
            .unwrap_err();

        let entries = t.audit_store.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event_type, AuditEventType::SubscriptionCreated);
        assert_eq!(entries[0].status, crate::audit::AuditStatus::Failed);
        assert_eq!(entries[0].organization_id, Some(org.id));
        assert_eq!(entries[0].actor.id.as_deref(), Some("owner"));
    }

    #[tokio::test]
    async fn test_update_and_cancel() {
        let (t, engine) = setup().await;
        let basic = plan(&engine, "Basic", 10, &["export"]).await;
        let better = plan(&engine, "Better", 20, &["export", "analytics"]).await;
        let org = t.memberships.seed_organization("A", "owner");
        let owner = Principal::new("owner");
        engine.create_subscription(&owner, request(&org, &basic)).await.unwrap();

        assert!(!engine
            .can_organization_access_feature(org.id, "analytics")
            .await
            .unwrap());
        engine
            .update_subscription(&owner, org.id, better.id)
            .await
            .unwrap();
        assert!(engine
            .can_organization_access_feature(org.id, "analytics")
            .await
            .unwrap());

        let view = engine.organization_features(&owner, org.id).await.unwrap();
        assert_eq!(view.plan.id, better.id);

        let cancelled = engine.cancel_subscription(&owner, org.id, false).await.unwrap();
        assert_eq!(cancelled.status, SubscriptionStatus::Cancelled);
        assert!(matches!(
            engine.organization_features(&owner, org.id).await.unwrap_err(),
            BillingError::SubscriptionNotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_features_require_membership() {
        let (t, engine) = setup().await;
        let org = t.memberships.seed_organization("A", "owner");
        let err = engine
            .organization_features(&Principal::new("stranger"), org.id)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::AccessDenied { .. }));
    }
}

//! Bulk license batches.
//!
//! A batch is one upstream subscription of quantity N backed by N local
//! license rows. The purchaser hands licenses out one at a time; an assignee
//! can optionally be enrolled into a group on assignment.

use chrono::{DateTime, Duration, Months, Utc};
use serde_json::json;
use uuid::Uuid;

use super::context::BillingContext;
use super::error::{BillingError, BillingResult};
use super::gateway::{CreateSubscriptionRequest, GatewayMetadata, GatewaySubscription};
use super::storage::LockKey;
use super::subscription::{SubscriptionEngine, compensate_cancel};
use super::types::{
    BatchStatus, LicenseBatch, Plan, Subscription, SubscriptionScope, SubscriptionStatus,
};
use crate::audit::{AuditEventType, NewAuditEntry};
use crate::auth::Principal;
use crate::organizations::GroupRole;

/// Largest batch that can be bought or resized to.
pub const MAX_BATCH_QUANTITY: i32 = 1000;

fn check_quantity(quantity: i32) -> BillingResult<()> {
    if !(1..=MAX_BATCH_QUANTITY).contains(&quantity) {
        return Err(BillingError::LimitOutOfRange {
            field: "quantity".to_string(),
            value: quantity as i64,
            max: MAX_BATCH_QUANTITY as i64,
        });
    }
    Ok(())
}

/// Build a batch and its license rows.
///
/// Licenses are `unassigned` when the batch is active and `pending_payment`
/// otherwise. They never carry the upstream subscription ID.
pub(crate) fn new_batch(
    purchaser_user_id: &str,
    plan_id: Uuid,
    quantity: i32,
    group_id: Option<Uuid>,
    status: BatchStatus,
    period: (DateTime<Utc>, DateTime<Utc>),
    now: DateTime<Utc>,
) -> (LicenseBatch, Vec<Subscription>) {
    let batch = LicenseBatch {
        id: Uuid::new_v4(),
        purchaser_user_id: purchaser_user_id.to_string(),
        plan_id,
        group_id,
        upstream_subscription_id: None,
        upstream_customer_id: None,
        total_quantity: quantity,
        assigned_quantity: 0,
        status,
        current_period_start: period.0,
        current_period_end: period.1,
        cancelled_at: None,
        last_event_at: None,
        created_at: now,
        updated_at: now,
    };
    let license_status = if status == BatchStatus::Active {
        SubscriptionStatus::Unassigned
    } else {
        SubscriptionStatus::PendingPayment
    };
    let licenses = (0..quantity)
        .map(|_| {
            let mut license = Subscription::new(
                plan_id,
                SubscriptionScope::License {
                    batch_id: batch.id,
                    purchaser_user_id: purchaser_user_id.to_string(),
                    user_id: None,
                },
                license_status,
                period.0,
                period.1,
            );
            license.created_at = now;
            license.updated_at = now;
            license
        })
        .collect();
    (batch, licenses)
}

/// Batch status matching an upstream subscription status.
pub(crate) fn batch_status_for(upstream_status: &str) -> BatchStatus {
    match SubscriptionStatus::from_gateway(upstream_status) {
        SubscriptionStatus::Active | SubscriptionStatus::Trialing => BatchStatus::Active,
        SubscriptionStatus::Cancelled | SubscriptionStatus::IncompleteExpired => BatchStatus::Cancelled,
        _ => BatchStatus::PendingPayment,
    }
}

/// Batch purchase, license assignment and quantity management.
#[derive(Clone)]
pub struct BulkLicenseEngine {
    ctx: BillingContext,
    subscriptions: SubscriptionEngine,
}

impl BulkLicenseEngine {
    #[must_use]
    pub fn new(ctx: BillingContext) -> Self {
        Self {
            subscriptions: SubscriptionEngine::new(ctx.clone()),
            ctx,
        }
    }

    async fn plan(&self, plan_id: Uuid) -> BillingResult<Plan> {
        self.subscriptions.plans().get_plan(plan_id).await
    }

    /// Load a batch the requester purchased.
    async fn owned_batch(&self, batch_id: Uuid, requester: &Principal) -> BillingResult<LicenseBatch> {
        let batch = self
            .ctx
            .store
            .get_batch(batch_id)
            .await?
            .ok_or_else(|| BillingError::BatchNotFound {
                id: batch_id.to_string(),
            })?;
        if batch.purchaser_user_id != requester.user_id {
            return Err(BillingError::access_denied(
                "Only the purchaser can manage this batch",
            ));
        }
        Ok(batch)
    }

    /// The purchaser must own the group or hold a managing role in it.
    async fn check_group_access(&self, group_id: Uuid, purchaser: &str) -> BillingResult<()> {
        let group = self
            .ctx
            .memberships
            .get_group(group_id)
            .await?
            .filter(|g| g.is_active)
            .ok_or_else(|| BillingError::access_denied("Group not found or inactive"))?;
        if group.owner_user_id == purchaser {
            return Ok(());
        }
        match self.ctx.memberships.get_group_member(group_id, purchaser).await? {
            Some(member) if member.is_active && member.role.can_manage() => Ok(()),
            _ => Err(BillingError::access_denied(
                "You must own or manage the group to link it to a batch",
            )),
        }
    }

    /// Buy `quantity` licenses of a plan.
    ///
    /// Paid plans open one upstream subscription; the batch stays
    /// `pending_payment` until the gateway reports payment. Free plans are
    /// active immediately. Either every license row exists or none does.
    pub async fn create_batch(
        &self,
        purchaser: &str,
        plan_id: Uuid,
        quantity: i32,
        group_id: Option<Uuid>,
    ) -> BillingResult<LicenseBatch> {
        let result = self.purchase(purchaser, plan_id, quantity, group_id).await;
        self.ctx
            .audit_outcome(result, || {
                NewAuditEntry::new(AuditEventType::BulkPurchase, "License batch purchase failed")
                    .actor(purchaser)
                    .target("plan", plan_id)
                    .metadata(json!({ "quantity": quantity, "group_id": group_id }))
            })
            .await
    }

    async fn purchase(
        &self,
        purchaser: &str,
        plan_id: Uuid,
        quantity: i32,
        group_id: Option<Uuid>,
    ) -> BillingResult<LicenseBatch> {
        check_quantity(quantity)?;
        let plan = self.subscriptions.plans().active_plan(plan_id).await?;
        if let Some(group_id) = group_id {
            self.check_group_access(group_id, purchaser).await?;
        }

        let now = Utc::now();
        let batch = if plan.is_free() {
            let end = now
                .checked_add_months(Months::new(1))
                .unwrap_or(now + Duration::days(30));
            let (batch, licenses) =
                new_batch(purchaser, plan.id, quantity, group_id, BatchStatus::Active, (now, end), now);
            self.ctx
                .store
                .insert_batch_with_licenses(&batch, &licenses)
                .await?;
            batch
        } else {
            self.create_paid_batch(purchaser, &plan, quantity, group_id, now)
                .await?
        };

        tracing::info!(
            target: "tollgate::billing::bulk",
            batch_id = %batch.id,
            purchaser = %purchaser,
            plan = %plan.name,
            quantity,
            status = %batch.status,
            "License batch created"
        );
        self.ctx
            .audit
            .log_billing(
                AuditEventType::BulkPurchase,
                Some(purchaser),
                "license_batch",
                batch.id,
                json!({
                    "plan_id": plan.id,
                    "quantity": quantity,
                    "group_id": group_id,
                    "upstream_subscription_id": batch.upstream_subscription_id,
                }),
            )
            .await;
        Ok(batch)
    }

    async fn create_paid_batch(
        &self,
        purchaser: &str,
        plan: &Plan,
        quantity: i32,
        group_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> BillingResult<LicenseBatch> {
        let price_id = plan
            .upstream_price_id
            .clone()
            .ok_or_else(|| BillingError::invalid_plan(plan.id, "no upstream price configured"))?;
        let user = self
            .ctx
            .directory
            .get_user(purchaser)
            .await?
            .ok_or_else(|| BillingError::UserNotFound {
                user_id: purchaser.to_string(),
            })?;
        if !user.email_verified {
            return Err(BillingError::EmailNotVerified {
                user_id: purchaser.to_string(),
            });
        }
        let customer_id = self
            .subscriptions
            .ensure_customer(purchaser, &user.email, &user.name)
            .await?;

        // The batch ID doubles as the idempotency key
        let batch_id = Uuid::new_v4();
        let upstream = self
            .ctx
            .gateway
            .create_subscription(CreateSubscriptionRequest {
                customer_id: customer_id.clone(),
                price_id,
                quantity,
                trial_days: plan.trial_days,
                metadata: GatewayMetadata {
                    user_id: Some(purchaser.to_string()),
                    plan_id: Some(plan.id),
                    bulk_purchase: true,
                    quantity: Some(quantity),
                    group_id,
                    ..Default::default()
                },
                idempotency_key: format!("batch:{}", batch_id),
            })
            .await?;

        let (mut batch, mut licenses) = new_batch(
            purchaser,
            plan.id,
            quantity,
            group_id,
            batch_status_for(&upstream.status),
            (upstream.period_start(), upstream.period_end()),
            now,
        );
        batch.id = batch_id;
        for license in &mut licenses {
            if let SubscriptionScope::License { batch_id: id, .. } = &mut license.scope {
                *id = batch_id;
            }
        }
        batch.upstream_subscription_id = Some(upstream.id.clone());
        batch.upstream_customer_id = Some(customer_id);

        if let Err(e) = self
            .ctx
            .store
            .insert_batch_with_licenses(&batch, &licenses)
            .await
        {
            compensate_cancel(&self.ctx, &upstream.id, &e).await;
            return Err(e);
        }
        Ok(batch)
    }

    /// Mirror a bulk upstream subscription that has no local batch yet.
    pub(crate) async fn create_from_upstream(
        &self,
        upstream: &GatewaySubscription,
        metadata: &GatewayMetadata,
        purchaser: &str,
        plan: &Plan,
        event_at: DateTime<Utc>,
    ) -> BillingResult<LicenseBatch> {
        let quantity = metadata.quantity.unwrap_or(upstream.quantity).max(1);
        let (mut batch, licenses) = new_batch(
            purchaser,
            plan.id,
            quantity,
            metadata.group_id,
            batch_status_for(&upstream.status),
            (upstream.period_start(), upstream.period_end()),
            Utc::now(),
        );
        batch.upstream_subscription_id = Some(upstream.id.clone());
        batch.upstream_customer_id = upstream.customer_id.clone();
        batch.last_event_at = Some(event_at);
        self.ctx
            .store
            .insert_batch_with_licenses(&batch, &licenses)
            .await?;

        tracing::info!(
            target: "tollgate::billing::bulk",
            batch_id = %batch.id,
            upstream_id = %upstream.id,
            quantity,
            status = %batch.status,
            "License batch created from gateway"
        );
        Ok(batch)
    }

    /// Release pending licenses once the batch has been paid for.
    pub(crate) async fn activate(&self, batch_id: Uuid) -> BillingResult<LicenseBatch> {
        let batch = self
            .ctx
            .store
            .set_batch_status(batch_id, BatchStatus::Active, Utc::now())
            .await?;
        tracing::info!(
            target: "tollgate::billing::bulk",
            batch_id = %batch_id,
            total = batch.total_quantity,
            "License batch activated"
        );
        Ok(batch)
    }

    /// Cancel a batch and every license in it, revoking plan roles from holders.
    pub(crate) async fn cancel_batch(&self, batch_id: Uuid, now: DateTime<Utc>) -> BillingResult<LicenseBatch> {
        let holders: Vec<Subscription> = self
            .ctx
            .store
            .list_batch_licenses(batch_id)
            .await?
            .into_iter()
            .filter(|l| l.user_id().is_some())
            .collect();
        let batch = self
            .ctx
            .store
            .set_batch_status(batch_id, BatchStatus::Cancelled, now)
            .await?;
        if let Ok(plan) = self.plan(batch.plan_id).await {
            for license in &holders {
                self.subscriptions.on_deactivated(license, &plan).await;
            }
        }
        tracing::info!(
            target: "tollgate::billing::bulk",
            batch_id = %batch_id,
            holders = holders.len(),
            "License batch cancelled"
        );
        Ok(batch)
    }

    /// Give one free license of the batch to `target_user_id`.
    ///
    /// An unreachable directory does not block the assignment. Group
    /// enrolment is idempotent and its failure is only logged.
    pub async fn assign_license(
        &self,
        batch_id: Uuid,
        requester: &Principal,
        target_user_id: &str,
    ) -> BillingResult<Subscription> {
        let result = self.assign(batch_id, requester, target_user_id).await;
        self.ctx
            .audit_outcome(result, || {
                NewAuditEntry::new(AuditEventType::LicenseAssigned, "License assignment failed")
                    .actor(&requester.user_id)
                    .target("license_batch", batch_id)
                    .metadata(json!({ "user_id": target_user_id }))
            })
            .await
    }

    async fn assign(
        &self,
        batch_id: Uuid,
        requester: &Principal,
        target_user_id: &str,
    ) -> BillingResult<Subscription> {
        let _lock = self.ctx.store.lock(LockKey::Batch(batch_id)).await?;
        let batch = self.owned_batch(batch_id, requester).await?;
        if batch.status != BatchStatus::Active {
            return Err(BillingError::invalid_transition(
                batch.status,
                SubscriptionStatus::Active,
            ));
        }

        match self.ctx.directory.get_user(target_user_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                return Err(BillingError::UserNotFound {
                    user_id: target_user_id.to_string(),
                });
            }
            Err(BillingError::DirectoryUnavailable { message }) => {
                tracing::warn!(
                    target: "tollgate::billing::bulk",
                    batch_id = %batch_id,
                    user_id = %target_user_id,
                    error = %message,
                    "Directory unavailable; assigning license without user validation"
                );
            }
            Err(e) => return Err(e),
        }

        let now = Utc::now();
        let license = self
            .ctx
            .store
            .claim_unassigned_license(batch_id, target_user_id, now)
            .await?;
        if let Ok(plan) = self.plan(batch.plan_id).await {
            self.subscriptions.on_activated(&license, &plan, now).await;
        }
        if let Some(group_id) = batch.group_id {
            self.enroll(group_id, target_user_id, &batch.purchaser_user_id, now)
                .await;
        }

        tracing::info!(
            target: "tollgate::billing::bulk",
            batch_id = %batch_id,
            license_id = %license.id,
            user_id = %target_user_id,
            "License assigned"
        );
        self.ctx
            .audit
            .log_billing(
                AuditEventType::LicenseAssigned,
                Some(&requester.user_id),
                "license",
                license.id,
                json!({
                    "batch_id": batch_id,
                    "user_id": target_user_id,
                    "group_id": batch.group_id,
                }),
            )
            .await;
        Ok(license)
    }

    async fn enroll(&self, group_id: Uuid, user_id: &str, invited_by: &str, now: DateTime<Utc>) {
        match self
            .ctx
            .memberships
            .add_group_member(group_id, user_id, GroupRole::Member, Some(invited_by), now)
            .await
        {
            Ok(true) => {
                tracing::info!(
                    target: "tollgate::billing::bulk",
                    group_id = %group_id,
                    user_id = %user_id,
                    "Assignee added to group"
                );
                self.ctx
                    .audit
                    .log_billing(
                        AuditEventType::GroupMemberAdded,
                        Some(invited_by),
                        "group",
                        group_id,
                        json!({ "user_id": user_id }),
                    )
                    .await;
            }
            Ok(false) => tracing::debug!(
                target: "tollgate::billing::bulk",
                group_id = %group_id,
                user_id = %user_id,
                "Assignee already in group"
            ),
            Err(e) => tracing::warn!(
                target: "tollgate::billing::bulk",
                group_id = %group_id,
                user_id = %user_id,
                error = %e,
                "Failed to add assignee to group"
            ),
        }
    }

    /// Return a license to the batch's pool. Group membership is kept.
    ///
    /// Only assigned licenses of an active batch can be revoked.
    pub async fn revoke_license(&self, license_id: Uuid, requester: &Principal) -> BillingResult<Subscription> {
        let result = self.revoke(license_id, requester).await;
        self.ctx
            .audit_outcome(result, || {
                NewAuditEntry::new(AuditEventType::LicenseRevoked, "License revocation failed")
                    .actor(&requester.user_id)
                    .target("license", license_id)
            })
            .await
    }

    async fn revoke(&self, license_id: Uuid, requester: &Principal) -> BillingResult<Subscription> {
        let license = self
            .ctx
            .store
            .get_subscription(license_id)
            .await?
            .filter(|s| s.batch_id().is_some())
            .ok_or_else(|| BillingError::LicenseNotFound {
                id: license_id.to_string(),
            })?;
        let batch_id = license.batch_id().unwrap_or_default();

        let _lock = self.ctx.store.lock(LockKey::Batch(batch_id)).await?;
        let batch = self.owned_batch(batch_id, requester).await?;
        if batch.status != BatchStatus::Active {
            return Err(BillingError::invalid_transition(
                batch.status,
                SubscriptionStatus::Unassigned,
            ));
        }
        // Re-read under the batch lock
        let held = self
            .ctx
            .store
            .get_subscription(license_id)
            .await?
            .ok_or_else(|| BillingError::LicenseNotFound {
                id: license_id.to_string(),
            })?;
        let revoked = self.ctx.store.release_license(license_id, Utc::now()).await?;
        if let Ok(plan) = self.plan(batch.plan_id).await {
            self.subscriptions.on_deactivated(&held, &plan).await;
        }

        tracing::info!(
            target: "tollgate::billing::bulk",
            batch_id = %batch_id,
            license_id = %license_id,
            user_id = ?held.user_id(),
            "License revoked"
        );
        self.ctx
            .audit
            .log_billing(
                AuditEventType::LicenseRevoked,
                Some(&requester.user_id),
                "license",
                license_id,
                json!({ "batch_id": batch_id, "user_id": held.user_id() }),
            )
            .await;
        Ok(revoked)
    }

    /// Change the number of licenses in a batch.
    ///
    /// Shrinking below the assigned count is refused before the gateway is
    /// contacted. Unassigned rows are added or removed to match.
    pub async fn update_quantity(
        &self,
        batch_id: Uuid,
        requester: &Principal,
        new_quantity: i32,
    ) -> BillingResult<LicenseBatch> {
        let result = self.resize(batch_id, requester, new_quantity).await;
        self.ctx
            .audit_outcome(result, || {
                NewAuditEntry::new(AuditEventType::SubscriptionUpdated, "License batch resize failed")
                    .actor(&requester.user_id)
                    .target("license_batch", batch_id)
                    .metadata(json!({ "new_quantity": new_quantity }))
            })
            .await
    }

    async fn resize(
        &self,
        batch_id: Uuid,
        requester: &Principal,
        new_quantity: i32,
    ) -> BillingResult<LicenseBatch> {
        check_quantity(new_quantity)?;
        let _lock = self.ctx.store.lock(LockKey::Batch(batch_id)).await?;
        let batch = self.owned_batch(batch_id, requester).await?;
        if new_quantity < batch.assigned_quantity {
            return Err(BillingError::QuantityBelowAssigned {
                requested: new_quantity,
                assigned: batch.assigned_quantity,
            });
        }
        if matches!(batch.status, BatchStatus::Cancelled | BatchStatus::Expired) {
            return Err(BillingError::invalid_transition(batch.status, "resized"));
        }
        if new_quantity == batch.total_quantity {
            return Ok(batch);
        }

        if let Some(upstream_id) = &batch.upstream_subscription_id {
            self.ctx
                .gateway
                .update_subscription_quantity(upstream_id, new_quantity)
                .await?;
        }
        let resized = match self
            .ctx
            .store
            .resize_batch(batch_id, new_quantity, Utc::now())
            .await
        {
            Ok(resized) => resized,
            Err(e) => {
                if let Some(upstream_id) = &batch.upstream_subscription_id {
                    self.restore_upstream_quantity(upstream_id, &batch, &e).await;
                }
                return Err(e);
            }
        };

        tracing::info!(
            target: "tollgate::billing::bulk",
            batch_id = %batch_id,
            from = batch.total_quantity,
            to = new_quantity,
            "License batch resized"
        );
        self.ctx
            .audit
            .log_billing(
                AuditEventType::SubscriptionUpdated,
                Some(&requester.user_id),
                "license_batch",
                batch_id,
                json!({ "old_quantity": batch.total_quantity, "new_quantity": new_quantity }),
            )
            .await;
        Ok(resized)
    }

    /// Put the upstream quantity back after the local resize failed.
    async fn restore_upstream_quantity(&self, upstream_id: &str, batch: &LicenseBatch, cause: &BillingError) {
        match self
            .ctx
            .gateway
            .update_subscription_quantity(upstream_id, batch.total_quantity)
            .await
        {
            Ok(_) => tracing::warn!(
                target: "tollgate::billing::bulk",
                batch_id = %batch.id,
                quantity = batch.total_quantity,
                cause = %cause,
                "Upstream quantity restored after local resize failed"
            ),
            Err(e) => tracing::error!(
                target: "tollgate::billing::bulk",
                batch_id = %batch.id,
                upstream_id = %upstream_id,
                cause = %cause,
                error = %e,
                "Failed to restore upstream quantity; batch and gateway disagree"
            ),
        }
    }

    pub async fn batches_by_purchaser(&self, purchaser: &str) -> BillingResult<Vec<LicenseBatch>> {
        self.ctx.store.list_batches_by_purchaser(purchaser).await
    }

    pub async fn get_batch(&self, batch_id: Uuid, requester: &Principal) -> BillingResult<LicenseBatch> {
        self.owned_batch(batch_id, requester).await
    }

    pub async fn batch_licenses(&self, batch_id: Uuid, requester: &Principal) -> BillingResult<Vec<Subscription>> {
        self.owned_batch(batch_id, requester).await?;
        self.ctx.store.list_batch_licenses(batch_id).await
    }

    /// Licenses of the batch still waiting for an assignee.
    pub async fn available_licenses(&self, batch_id: Uuid, requester: &Principal) -> BillingResult<Vec<Subscription>> {
        Ok(self
            .batch_licenses(batch_id, requester)
            .await?
            .into_iter()
            .filter(|l| l.status == SubscriptionStatus::Unassigned)
            .collect())
    }

    /// Cancel the batch upstream and delete it with all of its licenses.
    pub async fn permanently_delete(&self, batch_id: Uuid, requester: &Principal) -> BillingResult<()> {
        let result = self.delete(batch_id, requester).await;
        self.ctx
            .audit_outcome(result, || {
                NewAuditEntry::new(AuditEventType::SubscriptionCanceled, "License batch deletion failed")
                    .actor(&requester.user_id)
                    .target("license_batch", batch_id)
                    .metadata(json!({ "permanent": true }))
            })
            .await
    }

    async fn delete(&self, batch_id: Uuid, requester: &Principal) -> BillingResult<()> {
        let _lock = self.ctx.store.lock(LockKey::Batch(batch_id)).await?;
        let batch = self.owned_batch(batch_id, requester).await?;

        if let Some(upstream_id) = batch
            .upstream_subscription_id
            .as_deref()
            .filter(|_| batch.status != BatchStatus::Cancelled)
        {
            match self.ctx.gateway.cancel_subscription(upstream_id, false).await {
                Ok(_) => {}
                Err(BillingError::Gateway {
                    http_status: Some(404),
                    ..
                }) => tracing::warn!(
                    target: "tollgate::billing::bulk",
                    batch_id = %batch_id,
                    upstream_id = %upstream_id,
                    "Upstream subscription already gone"
                ),
                Err(e) => return Err(e),
            }
        }

        let holders: Vec<Subscription> = self
            .ctx
            .store
            .list_batch_licenses(batch_id)
            .await?
            .into_iter()
            .filter(|l| l.user_id().is_some() && l.is_entitled())
            .collect();
        self.ctx.store.delete_batch(batch_id).await?;
        if let Ok(plan) = self.plan(batch.plan_id).await {
            for license in &holders {
                self.subscriptions.on_deactivated(license, &plan).await;
            }
        }

        tracing::info!(
            target: "tollgate::billing::bulk",
            batch_id = %batch_id,
            licenses = batch.total_quantity,
            "License batch permanently deleted"
        );
        self.ctx
            .audit
            .log_billing(
                AuditEventType::SubscriptionCanceled,
                Some(&requester.user_id),
                "license_batch",
                batch_id,
                json!({ "permanent": true, "licenses": batch.total_quantity }),
            )
            .await;
        Ok(())
    }
}

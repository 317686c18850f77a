//! Plan management.
//!
//! Plans are validated against the feature catalog and the pricing rules
//! before they are written.

use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use super::catalog::FeatureCatalog;
use super::error::{BillingError, BillingResult};
use super::pricing::{PriceQuote, compute_price, validate_tiers};
use super::storage::BillingStore;
use super::types::Plan;

/// Creates, updates and looks up plans.
#[derive(Clone)]
pub struct PlanManager {
    store: Arc<dyn BillingStore>,
    catalog: FeatureCatalog,
}

impl PlanManager {
    #[must_use]
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self {
            catalog: FeatureCatalog::new(store.clone()),
            store,
        }
    }

    fn validate(plan: &Plan) -> BillingResult<()> {
        if plan.name.trim().is_empty() {
            return Err(BillingError::invalid_plan(plan.id, "name is required"));
        }
        if plan.unit_price < 0 {
            return Err(BillingError::invalid_plan(plan.id, "price cannot be negative"));
        }
        if plan.uses_tiered_pricing {
            validate_tiers(&plan.pricing_tiers)?;
        }
        Ok(())
    }

    pub async fn create_plan(&self, plan: Plan) -> BillingResult<Plan> {
        Self::validate(&plan)?;
        self.catalog.validate_plan(&plan).await?;
        self.store.insert_plan(&plan).await?;

        tracing::info!(
            target: "tollgate::billing::plans",
            plan_id = %plan.id,
            name = %plan.name,
            "Plan created"
        );
        Ok(plan)
    }

    /// Replace a plan's definition.
    ///
    /// Features consumed by entitled subscriptions cannot be removed.
    pub async fn update_plan(&self, mut plan: Plan) -> BillingResult<Plan> {
        let existing = self
            .store
            .get_plan(plan.id)
            .await?
            .ok_or_else(|| BillingError::PlanNotFound {
                id: plan.id.to_string(),
            })?;

        Self::validate(&plan)?;
        self.catalog.validate_plan(&plan).await?;

        let removed: Vec<&String> = existing
            .features
            .iter()
            .filter(|f| !plan.features.contains(*f))
            .collect();
        if !removed.is_empty() && self.in_use(plan.id).await? {
            return Err(BillingError::invalid_plan(
                plan.id,
                format!(
                    "features in use by active subscriptions cannot be removed: {}",
                    removed
                        .iter()
                        .map(|s| s.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            ));
        }

        plan.created_at = existing.created_at;
        plan.updated_at = Utc::now();
        self.store.update_plan(&plan).await?;
        Ok(plan)
    }

    async fn in_use(&self, plan_id: Uuid) -> BillingResult<bool> {
        Ok(self
            .store
            .list_subscriptions()
            .await?
            .iter()
            .any(|s| s.plan_id == plan_id && s.is_entitled()))
    }

    pub async fn get_plan(&self, plan_id: Uuid) -> BillingResult<Plan> {
        self.store
            .get_plan(plan_id)
            .await?
            .ok_or_else(|| BillingError::PlanNotFound {
                id: plan_id.to_string(),
            })
    }

    /// An existing, active plan, or `InvalidPlan`.
    pub async fn active_plan(&self, plan_id: Uuid) -> BillingResult<Plan> {
        match self.store.get_plan(plan_id).await? {
            Some(plan) if plan.is_active => Ok(plan),
            Some(_) => Err(BillingError::invalid_plan(plan_id, "plan is not active")),
            None => Err(BillingError::invalid_plan(plan_id, "plan does not exist")),
        }
    }

    pub async fn list_plans(&self, active_only: bool) -> BillingResult<Vec<Plan>> {
        let plans = self.store.list_plans().await?;
        Ok(plans
            .into_iter()
            .filter(|p| !active_only || p.is_active)
            .collect())
    }

    pub async fn find_by_upstream_price(&self, price_id: &str) -> BillingResult<Option<Plan>> {
        self.store.find_plan_by_upstream_price(price_id).await
    }

    /// Price preview for `quantity` units of a plan.
    pub async fn quote(&self, plan_id: Uuid, quantity: i32) -> BillingResult<PriceQuote> {
        let plan = self.get_plan(plan_id).await?;
        compute_price(&plan, quantity)
    }
}

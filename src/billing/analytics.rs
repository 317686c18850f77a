//! Subscription analytics for administrators.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

use super::error::BillingResult;
use super::storage::BillingStore;
use super::types::{BillingInterval, Plan, SubscriptionStatus};

/// Snapshot of subscription counts and revenue.
///
/// Amounts are in minor currency units. `monthly_recurring_revenue` counts
/// active and trialing subscriptions at their plan's unit price, with yearly
/// plans contributing a twelfth.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionAnalytics {
    pub total_subscriptions: usize,
    pub active_subscriptions: usize,
    pub trial_subscriptions: usize,
    pub cancelled_subscriptions: usize,
    pub by_status: BTreeMap<String, usize>,
    pub by_plan: BTreeMap<String, usize>,
    pub total_revenue: i64,
    pub monthly_recurring_revenue: i64,
    /// Cancelled over total, as a percentage.
    pub churn_rate: f64,
    pub generated_at: DateTime<Utc>,
}

fn monthly_price(plan: &Plan) -> i64 {
    match plan.interval {
        BillingInterval::Month => plan.unit_price,
        BillingInterval::Year => plan.unit_price / 12,
    }
}

/// Compute analytics over every subscription and paid invoice in `store`.
pub async fn subscription_analytics(store: &dyn BillingStore) -> BillingResult<SubscriptionAnalytics> {
    let plans: HashMap<Uuid, Plan> = store
        .list_plans()
        .await?
        .into_iter()
        .map(|p| (p.id, p))
        .collect();
    let subscriptions = store.list_subscriptions().await?;

    let mut by_status = BTreeMap::new();
    let mut by_plan = BTreeMap::new();
    let mut mrr = 0;
    for sub in &subscriptions {
        *by_status.entry(sub.status.as_str().to_string()).or_insert(0) += 1;

        if !matches!(sub.status, SubscriptionStatus::Active | SubscriptionStatus::Trialing) {
            continue;
        }
        if let Some(plan) = plans.get(&sub.plan_id) {
            *by_plan.entry(plan.name.clone()).or_insert(0) += 1;
            mrr += monthly_price(plan);
        }
    }

    let count = |status: SubscriptionStatus| by_status.get(status.as_str()).copied().unwrap_or(0);
    let trial = count(SubscriptionStatus::Trialing);
    let active = count(SubscriptionStatus::Active) + trial;
    let cancelled = count(SubscriptionStatus::Cancelled);
    let total = subscriptions.len();

    let total_revenue = store
        .list_invoices()
        .await?
        .iter()
        .filter(|i| i.status == "paid")
        .map(|i| i.amount_paid)
        .sum();

    let churn_rate = if total == 0 {
        0.0
    } else {
        cancelled as f64 / total as f64 * 100.0
    };

    Ok(SubscriptionAnalytics {
        total_subscriptions: total,
        active_subscriptions: active,
        trial_subscriptions: trial,
        cancelled_subscriptions: cancelled,
        by_status,
        by_plan,
        total_revenue,
        monthly_recurring_revenue: mrr,
        churn_rate,
        generated_at: Utc::now(),
    })
}

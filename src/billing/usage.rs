//! Usage metering.
//!
//! Counters live per (user, metric) in monthly UTC periods starting on the
//! first day of the month. A limit of `-1` means unlimited.

use chrono::{DateTime, Datelike, Duration, Months, Utc};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use super::error::{BillingError, BillingResult};
use super::storage::BillingStore;
use super::types::{MetricType, Plan, Subscription, UNLIMITED, UsageMetric};
use crate::config::UsageConfig;

/// Message returned when the user has nothing to meter against.
pub const NO_SUBSCRIPTION_MESSAGE: &str = "No active subscription - upgrade required";

/// The monthly period containing `now`: `[first day 00:00, +1 month)`.
#[must_use]
pub fn monthly_period(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = now
        .date_naive()
        .with_day(1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|d| d.and_utc())
        .unwrap_or(now);
    let end = start
        .checked_add_months(Months::new(1))
        .unwrap_or(start + Duration::days(31));
    (start, end)
}

/// Result of a usage limit check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageCheck {
    pub metric_type: MetricType,
    pub allowed: bool,
    pub current_usage: i64,
    pub limit: i64,
    /// `-1` when unlimited.
    pub remaining: i64,
    /// Empty when allowed.
    pub message: String,
}

impl UsageCheck {
    fn evaluate(metric_type: MetricType, current: i64, limit: i64, increment: i64) -> Self {
        let unlimited = limit == UNLIMITED as i64;
        let allowed = unlimited || current + increment <= limit;
        Self {
            metric_type,
            allowed,
            current_usage: current,
            limit,
            remaining: if unlimited { -1 } else { (limit - current).max(0) },
            message: if allowed {
                String::new()
            } else {
                format!("Usage limit exceeded. Current: {}, Limit: {}", current, limit)
            },
        }
    }

    fn no_subscription(metric_type: MetricType) -> Self {
        Self {
            metric_type,
            allowed: false,
            current_usage: 0,
            limit: 0,
            remaining: 0,
            message: NO_SUBSCRIPTION_MESSAGE.to_string(),
        }
    }
}

/// Reads and writes usage counters.
#[derive(Clone)]
pub struct UsageTracker {
    store: Arc<dyn BillingStore>,
    config: UsageConfig,
}

impl UsageTracker {
    #[must_use]
    pub fn new(store: Arc<dyn BillingStore>, config: UsageConfig) -> Self {
        Self { store, config }
    }

    /// Whether the metric is metered in this deployment.
    #[must_use]
    pub fn is_enabled(&self, metric: MetricType) -> bool {
        match metric {
            MetricType::ConcurrentTerminals => self.config.terminals_enabled,
            MetricType::CoursesCreated => self.config.courses_enabled,
            MetricType::LabSessions => self.config.labs_enabled,
            MetricType::ConcurrentUsers => true,
        }
    }

    /// Create or refresh the counters for a newly active subscription.
    ///
    /// Counters of the current period keep their value; only the limit and
    /// subscription link change.
    pub async fn initialize(
        &self,
        user_id: &str,
        subscription: &Subscription,
        plan: &Plan,
        now: DateTime<Utc>,
    ) -> BillingResult<Vec<UsageMetric>> {
        let mut metrics = Vec::new();
        for metric_type in MetricType::ALL.into_iter().filter(|m| self.is_enabled(*m)) {
            let metric = self
                .row_for(user_id, subscription.id, metric_type, plan.limit_for(metric_type) as i64, now)
                .await?;
            self.store.upsert_usage_metric(&metric).await?;
            metrics.push(metric);
        }
        Ok(metrics)
    }

    async fn row_for(
        &self,
        user_id: &str,
        subscription_id: Uuid,
        metric_type: MetricType,
        limit: i64,
        now: DateTime<Utc>,
    ) -> BillingResult<UsageMetric> {
        let (period_start, period_end) = monthly_period(now);
        let existing = self.store.get_usage_metric(user_id, metric_type).await?;
        let current_value = existing
            .as_ref()
            .filter(|m| m.period_end > now)
            .map(|m| m.current_value)
            .unwrap_or(0);

        Ok(UsageMetric {
            id: existing.as_ref().map(|m| m.id).unwrap_or_else(Uuid::new_v4),
            user_id: user_id.to_string(),
            subscription_id,
            metric_type,
            current_value,
            limit_value: limit,
            period_start: existing
                .as_ref()
                .filter(|m| m.period_end > now)
                .map(|m| m.period_start)
                .unwrap_or(period_start),
            period_end: existing
                .as_ref()
                .filter(|m| m.period_end > now)
                .map(|m| m.period_end)
                .unwrap_or(period_end),
            last_updated: now,
        })
    }

    /// Set every existing counter's limit to the plan's, preserving values.
    pub async fn update_limits(&self, user_id: &str, plan: &Plan) -> BillingResult<()> {
        for mut metric in self.store.list_usage_metrics(user_id).await? {
            metric.limit_value = plan.limit_for(metric.metric_type) as i64;
            metric.last_updated = Utc::now();
            self.store.upsert_usage_metric(&metric).await?;
        }
        Ok(())
    }

    /// Check whether `increment` more units fit under the limit.
    ///
    /// `active` is the user's entitled subscription and its plan, if any.
    pub async fn check_limit(
        &self,
        user_id: &str,
        metric_type: MetricType,
        increment: i64,
        active: Option<(&Subscription, &Plan)>,
        now: DateTime<Utc>,
    ) -> BillingResult<UsageCheck> {
        let Some((_, plan)) = active else {
            return Ok(UsageCheck::no_subscription(metric_type));
        };

        let row = self.store.get_usage_metric(user_id, metric_type).await?;
        let (current, limit) = match row {
            Some(m) if m.period_end > now => (m.current_value, m.limit_value),
            Some(m) => (0, m.limit_value),
            None => (0, plan.limit_for(metric_type) as i64),
        };
        Ok(UsageCheck::evaluate(metric_type, current, limit, increment))
    }

    /// Atomically add `delta` to the counter, creating it from the plan if needed.
    pub async fn record(
        &self,
        user_id: &str,
        metric_type: MetricType,
        delta: i64,
        active: Option<(&Subscription, &Plan)>,
        now: DateTime<Utc>,
    ) -> BillingResult<UsageMetric> {
        if delta < 0 {
            return Err(BillingError::InvalidQuantity { quantity: delta });
        }
        if let Some(metric) = self
            .store
            .increment_usage(user_id, metric_type, delta, now)
            .await?
        {
            return Ok(metric);
        }

        let (subscription, plan) = active.ok_or_else(|| BillingError::SubscriptionNotFound {
            id: format!("active subscription of user {}", user_id),
        })?;
        let seed = self
            .row_for(user_id, subscription.id, metric_type, plan.limit_for(metric_type) as i64, now)
            .await?;
        // A concurrent first record may have created the row meanwhile; keep it
        self.store.insert_usage_metric_if_absent(&seed).await?;
        self.store
            .increment_usage(user_id, metric_type, delta, now)
            .await?
            .ok_or_else(|| {
                BillingError::store(format!(
                    "usage counter {} of user {} missing after insert",
                    metric_type, user_id
                ))
            })
    }

    pub async fn list(&self, user_id: &str) -> BillingResult<Vec<UsageMetric>> {
        self.store.list_usage_metrics(user_id).await
    }
}

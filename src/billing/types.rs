//! Billing domain model.
//!
//! Plans, subscriptions (personal, license-in-batch, organization), license
//! batches, usage metrics and the records the webhook reconciler keeps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Limit value meaning "no limit".
pub const UNLIMITED: i32 = -1;

/// Billing interval of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingInterval {
    #[default]
    Month,
    Year,
}

impl BillingInterval {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Month => "month",
            Self::Year => "year",
        }
    }
}

/// One band of a tiered price list.
///
/// `max_quantity == 0` means the tier is unbounded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingTier {
    pub min_quantity: i32,
    pub max_quantity: i32,
    /// Unit price in minor currency units.
    pub unit_price: i64,
}

impl PricingTier {
    #[must_use]
    pub fn new(min_quantity: i32, max_quantity: i32, unit_price: i64) -> Self {
        Self {
            min_quantity,
            max_quantity,
            unit_price,
        }
    }

    #[must_use]
    pub fn is_unbounded(&self) -> bool {
        self.max_quantity == 0
    }

    /// Human readable range, e.g. `"1-5"` or `"16+"`.
    #[must_use]
    pub fn range_label(&self) -> String {
        if self.is_unbounded() {
            format!("{}+", self.min_quantity)
        } else {
            format!("{}-{}", self.min_quantity, self.max_quantity)
        }
    }
}

/// A priced bundle of capabilities and numeric limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    /// Higher means a higher tier.
    pub priority: i32,
    /// Price in minor currency units.
    pub unit_price: i64,
    pub currency: String,
    pub interval: BillingInterval,
    pub trial_days: u32,
    pub features: BTreeSet<String>,
    pub planned_features: BTreeSet<String>,
    pub max_concurrent_terminals: i32,
    pub max_session_duration_minutes: i32,
    pub max_courses: i32,
    pub max_concurrent_users: i32,
    pub max_lab_sessions: i32,
    pub storage_gb: i32,
    pub allowed_machine_sizes: Vec<String>,
    pub allowed_templates: Vec<String>,
    pub allowed_backends: Vec<String>,
    pub uses_tiered_pricing: bool,
    pub pricing_tiers: Vec<PricingTier>,
    pub upstream_product_id: Option<String>,
    pub upstream_price_id: Option<String>,
    /// Directory role granted while a subscription on this plan is active.
    pub required_role: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Plan {
    /// Start building a plan.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> PlanBuilder {
        PlanBuilder::new(name)
    }

    #[must_use]
    pub fn is_free(&self) -> bool {
        self.unit_price == 0
    }

    #[must_use]
    pub fn has_feature(&self, key: &str) -> bool {
        self.features.contains(key)
    }

    /// Limit applied to a usage metric.
    #[must_use]
    pub fn limit_for(&self, metric: MetricType) -> i32 {
        match metric {
            MetricType::ConcurrentTerminals => self.max_concurrent_terminals,
            MetricType::CoursesCreated => self.max_courses,
            MetricType::LabSessions => self.max_lab_sessions,
            MetricType::ConcurrentUsers => self.max_concurrent_users,
        }
    }

    /// Every key the plan references in the feature catalog.
    pub fn referenced_features(&self) -> impl Iterator<Item = &String> {
        self.features.iter().chain(self.planned_features.iter())
    }
}

/// Builder for [`Plan`].
#[derive(Debug, Clone)]
pub struct PlanBuilder {
    plan: Plan,
}

impl PlanBuilder {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            plan: Plan {
                id: Uuid::new_v4(),
                name: name.into(),
                description: String::new(),
                priority: 0,
                unit_price: 0,
                currency: "eur".to_string(),
                interval: BillingInterval::Month,
                trial_days: 0,
                features: BTreeSet::new(),
                planned_features: BTreeSet::new(),
                max_concurrent_terminals: 1,
                max_session_duration_minutes: 60,
                max_courses: UNLIMITED,
                max_concurrent_users: 1,
                max_lab_sessions: UNLIMITED,
                storage_gb: 0,
                allowed_machine_sizes: Vec::new(),
                allowed_templates: Vec::new(),
                allowed_backends: Vec::new(),
                uses_tiered_pricing: false,
                pricing_tiers: Vec::new(),
                upstream_product_id: None,
                upstream_price_id: None,
                required_role: None,
                is_active: true,
                created_at: now,
                updated_at: now,
            },
        }
    }

    #[must_use]
    pub fn id(mut self, id: Uuid) -> Self {
        self.plan.id = id;
        self
    }

    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.plan.description = description.into();
        self
    }

    #[must_use]
    pub fn priority(mut self, priority: i32) -> Self {
        self.plan.priority = priority;
        self
    }

    #[must_use]
    pub fn price(mut self, unit_price: i64, currency: &str) -> Self {
        self.plan.unit_price = unit_price;
        self.plan.currency = currency.to_lowercase();
        self
    }

    #[must_use]
    pub fn interval(mut self, interval: BillingInterval) -> Self {
        self.plan.interval = interval;
        self
    }

    #[must_use]
    pub fn trial_days(mut self, days: u32) -> Self {
        self.plan.trial_days = days;
        self
    }

    #[must_use]
    pub fn features<I, S>(mut self, features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.plan.features.extend(features.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn planned_features<I, S>(mut self, features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.plan
            .planned_features
            .extend(features.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn max_concurrent_terminals(mut self, max: i32) -> Self {
        self.plan.max_concurrent_terminals = max;
        self
    }

    #[must_use]
    pub fn max_session_duration_minutes(mut self, max: i32) -> Self {
        self.plan.max_session_duration_minutes = max;
        self
    }

    #[must_use]
    pub fn max_courses(mut self, max: i32) -> Self {
        self.plan.max_courses = max;
        self
    }

    #[must_use]
    pub fn max_concurrent_users(mut self, max: i32) -> Self {
        self.plan.max_concurrent_users = max;
        self
    }

    #[must_use]
    pub fn max_lab_sessions(mut self, max: i32) -> Self {
        self.plan.max_lab_sessions = max;
        self
    }

    #[must_use]
    pub fn storage_gb(mut self, gb: i32) -> Self {
        self.plan.storage_gb = gb;
        self
    }

    #[must_use]
    pub fn machine_sizes<I, S>(mut self, sizes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.plan.allowed_machine_sizes = sizes.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn tiers(mut self, tiers: Vec<PricingTier>) -> Self {
        self.plan.uses_tiered_pricing = !tiers.is_empty();
        self.plan.pricing_tiers = tiers;
        self
    }

    #[must_use]
    pub fn upstream_price(mut self, product_id: &str, price_id: &str) -> Self {
        self.plan.upstream_product_id = Some(product_id.to_string());
        self.plan.upstream_price_id = Some(price_id.to_string());
        self
    }

    #[must_use]
    pub fn required_role(mut self, role: &str) -> Self {
        self.plan.required_role = Some(role.to_string());
        self
    }

    #[must_use]
    pub fn inactive(mut self) -> Self {
        self.plan.is_active = false;
        self
    }

    #[must_use]
    pub fn build(self) -> Plan {
        self.plan
    }
}

/// Subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Incomplete,
    IncompleteExpired,
    Trialing,
    Active,
    PastDue,
    Unpaid,
    Cancelled,
    Paused,
    /// License waiting for payment of its batch.
    PendingPayment,
    /// License not yet given to anyone.
    Unassigned,
    Assigned,
    /// Superseded by an admin assignment or a newer purchase.
    Replaced,
}

impl SubscriptionStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Incomplete => "incomplete",
            Self::IncompleteExpired => "incomplete_expired",
            Self::Trialing => "trialing",
            Self::Active => "active",
            Self::PastDue => "past_due",
            Self::Unpaid => "unpaid",
            Self::Cancelled => "cancelled",
            Self::Paused => "paused",
            Self::PendingPayment => "pending_payment",
            Self::Unassigned => "unassigned",
            Self::Assigned => "assigned",
            Self::Replaced => "replaced",
        }
    }

    /// Map a status reported by the payment gateway.
    ///
    /// Unknown values are treated as cancelled.
    #[must_use]
    pub fn from_gateway(status: &str) -> Self {
        match status {
            "incomplete" => Self::Incomplete,
            "incomplete_expired" => Self::IncompleteExpired,
            "trialing" => Self::Trialing,
            "active" => Self::Active,
            "past_due" => Self::PastDue,
            "unpaid" => Self::Unpaid,
            "paused" => Self::Paused,
            _ => Self::Cancelled,
        }
    }

    /// Whether the status grants the plan's features.
    #[must_use]
    pub fn is_entitled(&self) -> bool {
        matches!(self, Self::Active | Self::Trialing | Self::Assigned)
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Cancelled | Self::Replaced | Self::IncompleteExpired
        )
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "incomplete" => Self::Incomplete,
            "incomplete_expired" => Self::IncompleteExpired,
            "trialing" => Self::Trialing,
            "active" => Self::Active,
            "past_due" => Self::PastDue,
            "unpaid" => Self::Unpaid,
            "cancelled" | "canceled" => Self::Cancelled,
            "paused" => Self::Paused,
            "pending_payment" => Self::PendingPayment,
            "unassigned" => Self::Unassigned,
            "assigned" => Self::Assigned,
            "replaced" => Self::Replaced,
            other => return Err(format!("unknown subscription status '{}'", other)),
        })
    }
}

/// How a user came to hold a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionType {
    Personal,
    Assigned,
}

impl SubscriptionType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Personal => "personal",
            Self::Assigned => "assigned",
        }
    }
}

/// Who a subscription belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum SubscriptionScope {
    /// Held directly by a user, purchased or admin-assigned.
    User {
        user_id: String,
        kind: SubscriptionType,
    },
    /// One license of a batch. `user_id` is empty while unassigned.
    License {
        batch_id: Uuid,
        purchaser_user_id: String,
        user_id: Option<String>,
    },
    /// Held by an organization for its members.
    Organization { organization_id: Uuid, quantity: i32 },
}

/// A grant of a plan to a user, a license slot or an organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub plan_id: Uuid,
    #[serde(flatten)]
    pub scope: SubscriptionScope,
    pub status: SubscriptionStatus,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub trial_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub upstream_subscription_id: Option<String>,
    pub upstream_customer_id: Option<String>,
    pub upstream_item_id: Option<String>,
    /// Admin or user who created the record outside a purchase flow.
    pub created_by: Option<String>,
    /// `created` timestamp of the last gateway event applied.
    pub last_event_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// A new record with a fresh ID and no upstream linkage.
    #[must_use]
    pub fn new(
        plan_id: Uuid,
        scope: SubscriptionScope,
        status: SubscriptionStatus,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            plan_id,
            scope,
            status,
            current_period_start: period_start,
            current_period_end: period_end,
            trial_end: None,
            cancel_at_period_end: false,
            cancelled_at: None,
            upstream_subscription_id: None,
            upstream_customer_id: None,
            upstream_item_id: None,
            created_by: None,
            last_event_at: None,
            created_at: period_start,
            updated_at: period_start,
        }
    }

    /// The user holding this subscription, if any.
    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        match &self.scope {
            SubscriptionScope::User { user_id, .. } => Some(user_id),
            SubscriptionScope::License { user_id, .. } => user_id.as_deref(),
            SubscriptionScope::Organization { .. } => None,
        }
    }

    #[must_use]
    pub fn organization_id(&self) -> Option<Uuid> {
        match &self.scope {
            SubscriptionScope::Organization {
                organization_id, ..
            } => Some(*organization_id),
            _ => None,
        }
    }

    #[must_use]
    pub fn batch_id(&self) -> Option<Uuid> {
        match &self.scope {
            SubscriptionScope::License { batch_id, .. } => Some(*batch_id),
            _ => None,
        }
    }

    /// Personal or assigned; `None` for organization and unassigned license rows.
    #[must_use]
    pub fn subscription_type(&self) -> Option<SubscriptionType> {
        match &self.scope {
            SubscriptionScope::User { kind, .. } => Some(*kind),
            SubscriptionScope::License {
                user_id: Some(_), ..
            } => Some(SubscriptionType::Assigned),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_entitled(&self) -> bool {
        self.status.is_entitled()
    }

    /// Mark as terminally replaced.
    pub fn mark_replaced(&mut self, now: DateTime<Utc>) {
        self.status = SubscriptionStatus::Replaced;
        self.cancelled_at = Some(now);
        self.updated_at = now;
    }

    /// Mark as cancelled, keeping the first cancellation time.
    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) {
        self.status = SubscriptionStatus::Cancelled;
        self.cancelled_at.get_or_insert(now);
        self.updated_at = now;
    }
}

/// Status of a license batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    PendingPayment,
    Active,
    Cancelled,
    Expired,
}

impl BatchStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingPayment => "pending_payment",
            Self::Active => "active",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A purchase of N licenses against one upstream subscription of quantity N.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseBatch {
    pub id: Uuid,
    pub purchaser_user_id: String,
    pub plan_id: Uuid,
    /// Assignees are enrolled into this group.
    pub group_id: Option<Uuid>,
    pub upstream_subscription_id: Option<String>,
    pub upstream_customer_id: Option<String>,
    pub total_quantity: i32,
    pub assigned_quantity: i32,
    pub status: BatchStatus,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LicenseBatch {
    #[must_use]
    pub fn available_quantity(&self) -> i32 {
        self.total_quantity - self.assigned_quantity
    }
}

/// Kind of metered usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    ConcurrentTerminals,
    CoursesCreated,
    LabSessions,
    ConcurrentUsers,
}

impl MetricType {
    pub const ALL: [MetricType; 4] = [
        Self::ConcurrentTerminals,
        Self::CoursesCreated,
        Self::LabSessions,
        Self::ConcurrentUsers,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConcurrentTerminals => "concurrent_terminals",
            Self::CoursesCreated => "courses_created",
            Self::LabSessions => "lab_sessions",
            Self::ConcurrentUsers => "concurrent_users",
        }
    }
}

impl FromStr for MetricType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| format!("unknown metric type '{}'", s))
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Usage counter for one user, metric and period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageMetric {
    pub id: Uuid,
    pub user_id: String,
    pub subscription_id: Uuid,
    pub metric_type: MetricType,
    pub current_value: i64,
    /// `-1` means unlimited.
    pub limit_value: i64,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

/// Progress of a claimed gateway event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEventStatus {
    /// Claimed by a delivery whose effects have not all been confirmed.
    Processing,
    Processed,
}

impl WebhookEventStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Processed => "processed",
        }
    }
}

impl FromStr for WebhookEventStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(Self::Processing),
            "processed" => Ok(Self::Processed),
            other => Err(format!("unknown webhook event status '{}'", other)),
        }
    }
}

/// Dedup marker for a gateway event.
///
/// The record is claimed before the event's effects are applied and marked
/// `processed` once they are. A record left in `processing` means the
/// delivery failed part way and the reconcile sweep owns the repair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookEventRecord {
    pub event_id: String,
    pub event_type: String,
    pub status: WebhookEventStatus,
    pub processed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub payload: Option<serde_json::Value>,
}

/// Upstream subscription that arrived without usable metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParkedSubscription {
    pub upstream_subscription_id: String,
    pub upstream_customer_id: Option<String>,
    pub upstream_price_id: Option<String>,
    pub status: String,
    pub quantity: i32,
    pub parked_at: DateTime<Utc>,
}

/// Payment recorded from `invoice.payment_succeeded`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: Uuid,
    pub upstream_invoice_id: String,
    pub upstream_subscription_id: Option<String>,
    pub upstream_customer_id: Option<String>,
    pub amount_paid: i64,
    pub currency: String,
    pub status: String,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Catalog category of a feature key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureCategory {
    Capabilities,
    MachineSizes,
    TerminalLimits,
    CourseLimits,
}

/// Value type of a feature key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureValueType {
    Boolean,
    Number,
    String,
}

/// Entry of the feature catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureDefinition {
    pub key: String,
    pub display_name_en: String,
    pub display_name_fr: String,
    pub description: String,
    pub category: FeatureCategory,
    pub value_type: FeatureValueType,
    pub unit: Option<String>,
    pub default_value: String,
    pub is_active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_status_mapping() {
        assert_eq!(
            SubscriptionStatus::from_gateway("past_due"),
            SubscriptionStatus::PastDue
        );
        assert_eq!(
            SubscriptionStatus::from_gateway("canceled"),
            SubscriptionStatus::Cancelled
        );
        assert_eq!(
            SubscriptionStatus::from_gateway("something_new"),
            SubscriptionStatus::Cancelled
        );
        assert_eq!(
            "canceled".parse::<SubscriptionStatus>().unwrap(),
            SubscriptionStatus::Cancelled
        );
    }

    #[test]
    fn test_entitled_statuses() {
        assert!(SubscriptionStatus::Active.is_entitled());
        assert!(SubscriptionStatus::Trialing.is_entitled());
        assert!(SubscriptionStatus::Assigned.is_entitled());
        assert!(!SubscriptionStatus::PastDue.is_entitled());
        assert!(!SubscriptionStatus::Unassigned.is_entitled());
        assert!(SubscriptionStatus::Replaced.is_terminal());
    }

    #[test]
    fn test_subscription_type_by_scope() {
        let now = Utc::now();
        let batch_id = Uuid::new_v4();
        let mut license = Subscription::new(
            Uuid::new_v4(),
            SubscriptionScope::License {
                batch_id,
                purchaser_user_id: "buyer".into(),
                user_id: None,
            },
            SubscriptionStatus::Unassigned,
            now,
            now,
        );
        assert_eq!(license.subscription_type(), None);
        assert_eq!(license.batch_id(), Some(batch_id));

        license.scope = SubscriptionScope::License {
            batch_id,
            purchaser_user_id: "buyer".into(),
            user_id: Some("alice".into()),
        };
        assert_eq!(license.subscription_type(), Some(SubscriptionType::Assigned));
        assert_eq!(license.user_id(), Some("alice"));
    }

    #[test]
    fn test_scope_serializes_with_tag() {
        let now = Utc::now();
        let sub = Subscription::new(
            Uuid::new_v4(),
            SubscriptionScope::User {
                user_id: "u1".into(),
                kind: SubscriptionType::Personal,
            },
            SubscriptionStatus::Active,
            now,
            now,
        );
        let json = serde_json::to_value(&sub).unwrap();
        assert_eq!(json["scope"], "user");
        assert_eq!(json["user_id"], "u1");
        assert_eq!(json["kind"], "personal");
        assert!(json["upstream_subscription_id"].is_null());
    }

    #[test]
    fn test_tier_labels() {
        assert_eq!(PricingTier::new(1, 5, 1000).range_label(), "1-5");
        assert_eq!(PricingTier::new(16, 0, 600).range_label(), "16+");
    }

    #[test]
    fn test_mark_cancelled_keeps_first_timestamp() {
        let start = Utc::now();
        let mut sub = Subscription::new(
            Uuid::new_v4(),
            SubscriptionScope::User {
                user_id: "u1".into(),
                kind: SubscriptionType::Personal,
            },
            SubscriptionStatus::Active,
            start,
            start,
        );
        sub.mark_cancelled(start);
        sub.mark_cancelled(start + chrono::Duration::hours(1));
        assert_eq!(sub.cancelled_at, Some(start));
    }
}

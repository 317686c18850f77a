//! Payment gateway port.
//!
//! The engines talk to the payment processor only through [`PaymentGateway`].
//! Implementations never retry internally: transport failures and 429/5xx
//! responses surface as retryable [`BillingError::Gateway`] errors, other
//! 4xx responses as fatal ones.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use super::error::{BillingError, BillingResult};

/// Metadata key for the user a subscription belongs to.
pub const META_USER_ID: &str = "user_id";
/// Metadata key for the local plan ID.
pub const META_PLAN_ID: &str = "subscription_plan_id";
/// Older integrations send the plan under this key.
pub const META_PLAN_ID_ALIAS: &str = "plan_id";
pub const META_ORGANIZATION_ID: &str = "organization_id";
pub const META_BULK_PURCHASE: &str = "bulk_purchase";
pub const META_QUANTITY: &str = "quantity";
pub const META_GROUP_ID: &str = "group_id";
pub const META_REPLACE_SUBSCRIPTION_ID: &str = "replace_subscription_id";

/// Signed event delivered to the webhook endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: WebhookEventData,
    /// Unix timestamp at which the gateway created the event.
    pub created: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEventData {
    pub object: Value,
}

impl WebhookEvent {
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        unix_to_datetime(self.created).unwrap_or_else(Utc::now)
    }
}

pub(crate) fn unix_to_datetime(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single()
}

/// Typed view of the metadata the engines attach to upstream objects.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatewayMetadata {
    pub user_id: Option<String>,
    pub plan_id: Option<Uuid>,
    pub organization_id: Option<Uuid>,
    pub bulk_purchase: bool,
    pub quantity: Option<i32>,
    pub group_id: Option<Uuid>,
    pub replace_subscription_id: Option<Uuid>,
}

impl GatewayMetadata {
    #[must_use]
    pub fn from_map(map: &BTreeMap<String, String>) -> Self {
        let non_empty = |key: &str| {
            map.get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        let uuid = |key: &str| non_empty(key).and_then(|v| Uuid::parse_str(&v).ok());

        Self {
            user_id: non_empty(META_USER_ID),
            plan_id: uuid(META_PLAN_ID).or_else(|| uuid(META_PLAN_ID_ALIAS)),
            organization_id: uuid(META_ORGANIZATION_ID),
            bulk_purchase: non_empty(META_BULK_PURCHASE).is_some_and(|v| v == "true"),
            quantity: non_empty(META_QUANTITY).and_then(|v| v.parse().ok()),
            group_id: uuid(META_GROUP_ID),
            replace_subscription_id: uuid(META_REPLACE_SUBSCRIPTION_ID),
        }
    }

    #[must_use]
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        if let Some(user_id) = &self.user_id {
            map.insert(META_USER_ID.to_string(), user_id.clone());
        }
        if let Some(plan_id) = self.plan_id {
            map.insert(META_PLAN_ID.to_string(), plan_id.to_string());
        }
        if let Some(org) = self.organization_id {
            map.insert(META_ORGANIZATION_ID.to_string(), org.to_string());
        }
        if self.bulk_purchase {
            map.insert(META_BULK_PURCHASE.to_string(), "true".to_string());
        }
        if let Some(quantity) = self.quantity {
            map.insert(META_QUANTITY.to_string(), quantity.to_string());
        }
        if let Some(group) = self.group_id {
            map.insert(META_GROUP_ID.to_string(), group.to_string());
        }
        if let Some(replace) = self.replace_subscription_id {
            map.insert(META_REPLACE_SUBSCRIPTION_ID.to_string(), replace.to_string());
        }
        map
    }

    /// Whether the metadata says who the subscription is for.
    #[must_use]
    pub fn identifies_owner(&self) -> bool {
        self.user_id.is_some() || self.organization_id.is_some()
    }
}

/// Request to open an upstream subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSubscriptionRequest {
    pub customer_id: String,
    pub price_id: String,
    pub quantity: i32,
    pub trial_days: u32,
    pub metadata: GatewayMetadata,
    /// Correlation key so a retried call never opens a second subscription.
    pub idempotency_key: String,
}

/// How the gateway bills a mid-period plan change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProrationBehavior {
    #[default]
    CreateProrations,
    AlwaysInvoice,
    None,
}

impl ProrationBehavior {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateProrations => "create_prorations",
            Self::AlwaysInvoice => "always_invoice",
            Self::None => "none",
        }
    }
}

/// Upstream subscription state as reported by the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewaySubscription {
    pub id: String,
    pub customer_id: Option<String>,
    pub status: String,
    pub price_id: Option<String>,
    pub item_id: Option<String>,
    pub quantity: i32,
    pub current_period_start: i64,
    pub current_period_end: i64,
    pub trial_end: Option<i64>,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<i64>,
    pub metadata: BTreeMap<String, String>,
}

impl GatewaySubscription {
    /// Parse a subscription object.
    pub fn from_json(object: &Value) -> BillingResult<Self> {
        let id = str_field(object, "id").ok_or_else(|| invalid("missing subscription id"))?;

        let item = object
            .get("items")
            .and_then(|v| v.get("data"))
            .and_then(Value::as_array)
            .and_then(|items| items.first());
        let price_id = item
            .and_then(|i| i.get("price"))
            .and_then(|p| p.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let item_id = item.and_then(|i| str_field(i, "id"));
        let quantity = item
            .and_then(|i| i.get("quantity"))
            .or_else(|| object.get("quantity"))
            .and_then(Value::as_i64)
            .unwrap_or(1) as i32;

        // Newer API versions report periods on the item
        let period = |key: &str| {
            object
                .get(key)
                .and_then(Value::as_i64)
                .or_else(|| item.and_then(|i| i.get(key)).and_then(Value::as_i64))
                .unwrap_or(0)
        };

        Ok(Self {
            id,
            customer_id: str_field(object, "customer"),
            status: str_field(object, "status").unwrap_or_else(|| "incomplete".to_string()),
            price_id,
            item_id,
            quantity,
            current_period_start: period("current_period_start"),
            current_period_end: period("current_period_end"),
            trial_end: object.get("trial_end").and_then(Value::as_i64),
            cancel_at_period_end: object
                .get("cancel_at_period_end")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            canceled_at: object.get("canceled_at").and_then(Value::as_i64),
            metadata: metadata_map(object),
        })
    }

    #[must_use]
    pub fn metadata(&self) -> GatewayMetadata {
        GatewayMetadata::from_map(&self.metadata)
    }

    #[must_use]
    pub fn period_start(&self) -> DateTime<Utc> {
        unix_to_datetime(self.current_period_start).unwrap_or_else(Utc::now)
    }

    #[must_use]
    pub fn period_end(&self) -> DateTime<Utc> {
        unix_to_datetime(self.current_period_end).unwrap_or_else(Utc::now)
    }
}

/// Hosted checkout session, used to recover metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSession {
    pub id: String,
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl CheckoutSession {
    pub fn from_json(object: &Value) -> BillingResult<Self> {
        Ok(Self {
            id: str_field(object, "id").ok_or_else(|| invalid("missing checkout session id"))?,
            customer_id: str_field(object, "customer"),
            subscription_id: str_field(object, "subscription"),
            metadata: metadata_map(object),
        })
    }
}

/// Invoice as reported by the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayInvoice {
    pub id: String,
    pub subscription_id: Option<String>,
    pub customer_id: Option<String>,
    pub amount_paid: i64,
    pub currency: String,
    pub status: String,
    pub paid_at: Option<i64>,
}

impl GatewayInvoice {
    pub fn from_json(object: &Value) -> BillingResult<Self> {
        Ok(Self {
            id: str_field(object, "id").ok_or_else(|| invalid("missing invoice id"))?,
            subscription_id: str_field(object, "subscription"),
            customer_id: str_field(object, "customer"),
            amount_paid: object.get("amount_paid").and_then(Value::as_i64).unwrap_or(0),
            currency: str_field(object, "currency").unwrap_or_default(),
            status: str_field(object, "status").unwrap_or_else(|| "paid".to_string()),
            paid_at: object
                .get("status_transitions")
                .and_then(|t| t.get("paid_at"))
                .and_then(Value::as_i64),
        })
    }
}

fn str_field(object: &Value, key: &str) -> Option<String> {
    object
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn metadata_map(object: &Value) -> BTreeMap<String, String> {
    object
        .get("metadata")
        .and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| {
                    let value = match v {
                        Value::String(s) => s.clone(),
                        Value::Bool(b) => b.to_string(),
                        Value::Number(n) => n.to_string(),
                        _ => return None,
                    };
                    Some((k.clone(), value))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn invalid(message: &str) -> BillingError {
    BillingError::InvalidWebhookPayload {
        message: message.to_string(),
    }
}

/// Operations the engines need from the payment processor.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Create a customer. Idempotent by `user_id`.
    async fn create_customer(&self, user_id: &str, email: &str, name: &str) -> BillingResult<String>;

    async fn create_subscription(
        &self,
        request: CreateSubscriptionRequest,
    ) -> BillingResult<GatewaySubscription>;

    async fn update_subscription_quantity(
        &self,
        subscription_id: &str,
        quantity: i32,
    ) -> BillingResult<GatewaySubscription>;

    /// Move the subscription to another price.
    async fn update_subscription_price(
        &self,
        subscription_id: &str,
        price_id: &str,
        proration: ProrationBehavior,
    ) -> BillingResult<GatewaySubscription>;

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        at_period_end: bool,
    ) -> BillingResult<GatewaySubscription>;

    async fn get_subscription(&self, subscription_id: &str) -> BillingResult<GatewaySubscription>;

    /// Every subscription, optionally restricted to one customer.
    async fn list_subscriptions(&self, customer_id: Option<&str>) -> BillingResult<Vec<GatewaySubscription>>;

    async fn fetch_checkout_session(&self, session_id: &str) -> BillingResult<CheckoutSession>;

    /// Checkout sessions that produced the given subscription.
    async fn list_checkout_sessions(&self, subscription_id: &str) -> BillingResult<Vec<CheckoutSession>>;

    async fn fetch_invoice(&self, invoice_id: &str) -> BillingResult<GatewayInvoice>;

    /// Verify a signed webhook payload and parse the event.
    fn verify_webhook_signature(&self, payload: &[u8], signature_header: &str) -> BillingResult<WebhookEvent>;
}

/// In-memory gateway for tests.
#[cfg(any(test, feature = "test-billing"))]
pub mod test {
    use super::*;
    use crate::billing::signature::WebhookSignature;
    use std::collections::{HashMap, VecDeque};
    use std::sync::{Arc, Mutex};

    /// Mock payment gateway.
    ///
    /// Keeps upstream subscriptions in memory, records every call and can be
    /// told to fail the next calls.
    #[derive(Clone)]
    pub struct MockGateway {
        inner: Arc<MockGatewayInner>,
    }

    struct MockGatewayInner {
        signature: WebhookSignature,
        state: Mutex<MockState>,
    }

    #[derive(Default)]
    struct MockState {
        customers: HashMap<String, String>,
        subscriptions: HashMap<String, GatewaySubscription>,
        idempotency: HashMap<String, String>,
        checkout_sessions: HashMap<String, CheckoutSession>,
        invoices: HashMap<String, GatewayInvoice>,
        failures: VecDeque<BillingError>,
        calls: Vec<String>,
        next_status: Option<String>,
    }

    pub const MOCK_WEBHOOK_SECRET: &str = "whsec_mock_gateway";

    impl Default for MockGateway {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MockGateway {
        #[must_use]
        pub fn new() -> Self {
            Self::with_webhook_secret(MOCK_WEBHOOK_SECRET)
        }

        #[must_use]
        pub fn with_webhook_secret(secret: &str) -> Self {
            Self {
                inner: Arc::new(MockGatewayInner {
                    signature: WebhookSignature::new(secret.to_string()),
                    state: Mutex::new(MockState::default()),
                }),
            }
        }

        fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
            self.inner.state.lock().unwrap()
        }

        fn begin(&self, call: &str) -> BillingResult<()> {
            let mut state = self.state();
            state.calls.push(call.to_string());
            match state.failures.pop_front() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }

        /// Fail the next call with `err`.
        pub fn fail_next(&self, err: BillingError) {
            self.state().failures.push_back(err);
        }

        /// Status reported for subscriptions created from now on.
        pub fn set_created_status(&self, status: &str) {
            self.state().next_status = Some(status.to_string());
        }

        /// Names of the calls made so far.
        pub fn calls(&self) -> Vec<String> {
            self.state().calls.clone()
        }

        pub fn subscription(&self, id: &str) -> Option<GatewaySubscription> {
            self.state().subscriptions.get(id).cloned()
        }

        /// Seed an upstream subscription.
        pub fn insert_subscription(&self, subscription: GatewaySubscription) {
            self.state()
                .subscriptions
                .insert(subscription.id.clone(), subscription);
        }

        pub fn insert_checkout_session(&self, session: CheckoutSession) {
            self.state()
                .checkout_sessions
                .insert(session.id.clone(), session);
        }

        pub fn insert_invoice(&self, invoice: GatewayInvoice) {
            self.state().invoices.insert(invoice.id.clone(), invoice);
        }

        /// Sign `payload` with the gateway's webhook secret at the current time.
        pub fn sign(&self, payload: &[u8]) -> String {
            self.inner
                .signature
                .sign(payload, Utc::now().timestamp())
                .unwrap()
        }
    }

    fn not_found(operation: &str, id: &str) -> BillingError {
        BillingError::gateway(operation, format!("No such object: '{}'", id), Some(404))
    }

    #[async_trait]
    impl PaymentGateway for MockGateway {
        async fn create_customer(&self, user_id: &str, _email: &str, _name: &str) -> BillingResult<String> {
            self.begin("create_customer")?;
            let mut state = self.state();
            let id = state
                .customers
                .entry(user_id.to_string())
                .or_insert_with(|| format!("cus_{}", Uuid::new_v4().simple()))
                .clone();
            Ok(id)
        }

        async fn create_subscription(
            &self,
            request: CreateSubscriptionRequest,
        ) -> BillingResult<GatewaySubscription> {
            self.begin("create_subscription")?;
            let mut state = self.state();
            if let Some(existing) = state
                .idempotency
                .get(&request.idempotency_key)
                .and_then(|id| state.subscriptions.get(id))
            {
                return Ok(existing.clone());
            }

            let now = Utc::now();
            let id = format!("sub_{}", Uuid::new_v4().simple());
            let subscription = GatewaySubscription {
                id: id.clone(),
                customer_id: Some(request.customer_id),
                status: state
                    .next_status
                    .clone()
                    .unwrap_or_else(|| "incomplete".to_string()),
                price_id: Some(request.price_id),
                item_id: Some(format!("si_{}", Uuid::new_v4().simple())),
                quantity: request.quantity,
                current_period_start: now.timestamp(),
                current_period_end: (now + chrono::Duration::days(30)).timestamp(),
                trial_end: (request.trial_days > 0)
                    .then(|| (now + chrono::Duration::days(request.trial_days as i64)).timestamp()),
                cancel_at_period_end: false,
                canceled_at: None,
                metadata: request.metadata.to_map(),
            };
            state.idempotency.insert(request.idempotency_key, id.clone());
            state.subscriptions.insert(id, subscription.clone());
            Ok(subscription)
        }

        async fn update_subscription_quantity(
            &self,
            subscription_id: &str,
            quantity: i32,
        ) -> BillingResult<GatewaySubscription> {
            self.begin("update_subscription_quantity")?;
            let mut state = self.state();
            let sub = state
                .subscriptions
                .get_mut(subscription_id)
                .ok_or_else(|| not_found("update_subscription_quantity", subscription_id))?;
            sub.quantity = quantity;
            Ok(sub.clone())
        }

        async fn update_subscription_price(
            &self,
            subscription_id: &str,
            price_id: &str,
            _proration: ProrationBehavior,
        ) -> BillingResult<GatewaySubscription> {
            self.begin("update_subscription_price")?;
            let mut state = self.state();
            let sub = state
                .subscriptions
                .get_mut(subscription_id)
                .ok_or_else(|| not_found("update_subscription_price", subscription_id))?;
            sub.price_id = Some(price_id.to_string());
            Ok(sub.clone())
        }

        async fn cancel_subscription(
            &self,
            subscription_id: &str,
            at_period_end: bool,
        ) -> BillingResult<GatewaySubscription> {
            self.begin("cancel_subscription")?;
            let mut state = self.state();
            let sub = state
                .subscriptions
                .get_mut(subscription_id)
                .ok_or_else(|| not_found("cancel_subscription", subscription_id))?;
            if at_period_end {
                sub.cancel_at_period_end = true;
            } else {
                sub.status = "canceled".to_string();
                sub.canceled_at = Some(Utc::now().timestamp());
            }
            Ok(sub.clone())
        }

        async fn get_subscription(&self, subscription_id: &str) -> BillingResult<GatewaySubscription> {
            self.begin("get_subscription")?;
            self.state()
                .subscriptions
                .get(subscription_id)
                .cloned()
                .ok_or_else(|| not_found("get_subscription", subscription_id))
        }

        async fn list_subscriptions(&self, customer_id: Option<&str>) -> BillingResult<Vec<GatewaySubscription>> {
            self.begin("list_subscriptions")?;
            let mut subs: Vec<GatewaySubscription> = self
                .state()
                .subscriptions
                .values()
                .filter(|s| customer_id.is_none() || s.customer_id.as_deref() == customer_id)
                .cloned()
                .collect();
            subs.sort_by(|a, b| a.id.cmp(&b.id));
            Ok(subs)
        }

        async fn fetch_checkout_session(&self, session_id: &str) -> BillingResult<CheckoutSession> {
            self.begin("fetch_checkout_session")?;
            self.state()
                .checkout_sessions
                .get(session_id)
                .cloned()
                .ok_or_else(|| not_found("fetch_checkout_session", session_id))
        }

        async fn list_checkout_sessions(&self, subscription_id: &str) -> BillingResult<Vec<CheckoutSession>> {
            self.begin("list_checkout_sessions")?;
            Ok(self
                .state()
                .checkout_sessions
                .values()
                .filter(|s| s.subscription_id.as_deref() == Some(subscription_id))
                .cloned()
                .collect())
        }

        async fn fetch_invoice(&self, invoice_id: &str) -> BillingResult<GatewayInvoice> {
            self.begin("fetch_invoice")?;
            self.state()
                .invoices
                .get(invoice_id)
                .cloned()
                .ok_or_else(|| not_found("fetch_invoice", invoice_id))
        }

        fn verify_webhook_signature(&self, payload: &[u8], signature_header: &str) -> BillingResult<WebhookEvent> {
            self.inner
                .signature
                .verify(payload, signature_header, Utc::now().timestamp())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test::MockGateway;
    use super::*;
    use serde_json::json;

    #[test]
    fn test_metadata_plan_alias() {
        let plan = Uuid::new_v4();
        let mut map = BTreeMap::new();
        map.insert("plan_id".to_string(), plan.to_string());
        map.insert("user_id".to_string(), "u1".to_string());
        map.insert("bulk_purchase".to_string(), "true".to_string());
        map.insert("quantity".to_string(), "5".to_string());

        let meta = GatewayMetadata::from_map(&map);
        assert_eq!(meta.plan_id, Some(plan));
        assert!(meta.bulk_purchase);
        assert_eq!(meta.quantity, Some(5));
        assert!(meta.identifies_owner());
    }

    #[test]
    fn test_metadata_ignores_empty_values() {
        let mut map = BTreeMap::new();
        map.insert("user_id".to_string(), "".to_string());
        map.insert("organization_id".to_string(), "not-a-uuid".to_string());
        let meta = GatewayMetadata::from_map(&map);
        assert!(!meta.identifies_owner());
    }

    #[test]
    fn test_parse_subscription_object() {
        let object = json!({
            "id": "sub_123",
            "customer": "cus_1",
            "status": "active",
            "current_period_start": 1700000000,
            "current_period_end": 1702592000,
            "cancel_at_period_end": false,
            "items": {"data": [{"id": "si_1", "quantity": 3, "price": {"id": "price_pro"}}]},
            "metadata": {"user_id": "u1", "bulk_purchase": true}
        });
        let sub = GatewaySubscription::from_json(&object).unwrap();
        assert_eq!(sub.id, "sub_123");
        assert_eq!(sub.price_id.as_deref(), Some("price_pro"));
        assert_eq!(sub.quantity, 3);
        assert!(sub.metadata().bulk_purchase);
        assert!(GatewaySubscription::from_json(&json!({})).is_err());
    }

    #[tokio::test]
    async fn test_mock_customer_is_idempotent_by_user() {
        let gateway = MockGateway::new();
        let a = gateway.create_customer("u1", "u1@example.com", "U1").await.unwrap();
        let b = gateway.create_customer("u1", "u1@example.com", "U1").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_mock_failure_injection() {
        let gateway = MockGateway::new();
        gateway.fail_next(BillingError::gateway("get_subscription", "boom", Some(503)));
        let err = gateway.get_subscription("sub_x").await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(gateway.calls(), vec!["get_subscription"]);
    }
}

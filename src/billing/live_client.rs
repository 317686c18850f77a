//! Live payment gateway client.
//!
//! Speaks the Stripe-compatible REST API with `reqwest`. Each operation is a
//! single attempt: the caller decides whether a retryable error is retried.
//! Mutating calls carry an idempotency key.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use std::time::Duration;

use super::error::{BillingError, BillingResult};
use super::gateway::{
    CheckoutSession, CreateSubscriptionRequest, GatewayInvoice, GatewaySubscription,
    PaymentGateway, ProrationBehavior, WebhookEvent,
};
use super::signature::WebhookSignature;
use crate::config::{GatewayConfig, WebhookConfig};

const USER_AGENT: &str = concat!("tollgate/", env!("CARGO_PKG_VERSION"));

/// Error returned when API key validation fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidApiKeyError {
    pub reason: String,
}

impl std::fmt::Display for InvalidApiKeyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Invalid gateway API key: {}", self.reason)
    }
}

impl std::error::Error for InvalidApiKeyError {}

/// Validate the API key format.
///
/// Accepted prefixes: `sk_test_`, `sk_live_`, `rk_test_`, `rk_live_`.
fn validate_api_key(key: &str) -> std::result::Result<(), InvalidApiKeyError> {
    const MIN_KEY_LENGTH: usize = 20;

    if key.is_empty() {
        return Err(InvalidApiKeyError {
            reason: "API key cannot be empty".to_string(),
        });
    }
    if key.len() < MIN_KEY_LENGTH {
        return Err(InvalidApiKeyError {
            reason: format!("API key too short (minimum {} characters)", MIN_KEY_LENGTH),
        });
    }
    let valid_prefixes = ["sk_test_", "sk_live_", "rk_test_", "rk_live_"];
    if !valid_prefixes.iter().any(|prefix| key.starts_with(prefix)) {
        return Err(InvalidApiKeyError {
            reason: "API key must start with sk_test_, sk_live_, rk_test_, or rk_live_".to_string(),
        });
    }
    Ok(())
}

/// Live gateway client.
#[derive(Clone)]
pub struct LiveGateway {
    http: reqwest::Client,
    base_url: String,
    api_key: SecretString,
    signature: WebhookSignature,
    timeout: Duration,
}

impl LiveGateway {
    /// Create a client.
    ///
    /// # Errors
    ///
    /// Returns an error if the API key format is invalid or the HTTP client
    /// cannot be built.
    pub fn new(
        api_key: impl Into<SecretString>,
        webhook_secret: impl Into<SecretString>,
        gateway: &GatewayConfig,
        webhook: &WebhookConfig,
    ) -> std::result::Result<Self, InvalidApiKeyError> {
        let api_key: SecretString = api_key.into();
        validate_api_key(api_key.expose_secret())?;

        let timeout = Duration::from_secs(gateway.timeout_seconds);
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| InvalidApiKeyError {
                reason: format!("failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            http,
            base_url: gateway.base_url.trim_end_matches('/').to_string(),
            api_key,
            signature: WebhookSignature::new(webhook_secret)
                .with_tolerance(webhook.tolerance_seconds),
            timeout,
        })
    }

    #[must_use]
    pub fn is_test_mode(&self) -> bool {
        let key = self.api_key.expose_secret();
        key.starts_with("sk_test_") || key.starts_with("rk_test_")
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.base_url, path)
    }

    fn idempotency_key(operation: &str) -> String {
        format!("{}_{}", operation, uuid::Uuid::new_v4())
    }

    async fn get(&self, operation: &str, path: &str, query: &[(&str, String)]) -> BillingResult<Value> {
        let response = self
            .http
            .get(self.url(path))
            .bearer_auth(self.api_key.expose_secret())
            .query(query)
            .send()
            .await
            .map_err(|e| transport_error(operation, e))?;
        read_response(operation, response).await
    }

    async fn post(
        &self,
        operation: &str,
        path: &str,
        form: &[(String, String)],
        idempotency_key: Option<String>,
    ) -> BillingResult<Value> {
        let key = idempotency_key.unwrap_or_else(|| Self::idempotency_key(operation));
        let response = self
            .http
            .post(self.url(path))
            .bearer_auth(self.api_key.expose_secret())
            .header("Idempotency-Key", key)
            .form(form)
            .send()
            .await
            .map_err(|e| transport_error(operation, e))?;
        read_response(operation, response).await
    }

    async fn delete(&self, operation: &str, path: &str) -> BillingResult<Value> {
        let response = self
            .http
            .delete(self.url(path))
            .bearer_auth(self.api_key.expose_secret())
            .send()
            .await
            .map_err(|e| transport_error(operation, e))?;
        read_response(operation, response).await
    }
}

impl std::fmt::Debug for LiveGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveGateway")
            .field("base_url", &self.base_url)
            .field("is_test_mode", &self.is_test_mode())
            .finish_non_exhaustive()
    }
}

fn transport_error(operation: &str, err: reqwest::Error) -> BillingError {
    tracing::warn!(
        target: "tollgate::billing::gateway",
        operation = %operation,
        error = %err,
        timeout = err.is_timeout(),
        "Gateway request failed"
    );
    BillingError::gateway(operation, err.to_string(), None)
}

async fn read_response(operation: &str, response: reqwest::Response) -> BillingResult<Value> {
    let status = response.status();
    let body: Value = response
        .json()
        .await
        .map_err(|e| BillingError::gateway(operation, format!("invalid response body: {}", e), Some(status.as_u16())))?;

    if status.is_success() {
        return Ok(body);
    }

    let message = body
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .unwrap_or("gateway request failed")
        .to_string();
    tracing::warn!(
        target: "tollgate::billing::gateway",
        operation = %operation,
        status = status.as_u16(),
        message = %message,
        "Gateway returned an error"
    );
    Err(BillingError::gateway(operation, message, Some(status.as_u16())))
}

fn data_array(body: &Value) -> &[Value] {
    body.get("data")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn subscription_form(request: &CreateSubscriptionRequest) -> Vec<(String, String)> {
    let mut form = vec![
        ("customer".to_string(), request.customer_id.clone()),
        ("items[0][price]".to_string(), request.price_id.clone()),
        ("items[0][quantity]".to_string(), request.quantity.to_string()),
        ("payment_behavior".to_string(), "default_incomplete".to_string()),
    ];
    if request.trial_days > 0 {
        form.push(("trial_period_days".to_string(), request.trial_days.to_string()));
    }
    for (key, value) in request.metadata.to_map() {
        form.push((format!("metadata[{}]", key), value));
    }
    form
}

#[async_trait]
impl PaymentGateway for LiveGateway {
    async fn create_customer(&self, user_id: &str, email: &str, name: &str) -> BillingResult<String> {
        let form = vec![
            ("email".to_string(), email.to_string()),
            ("name".to_string(), name.to_string()),
            ("metadata[user_id]".to_string(), user_id.to_string()),
        ];
        // Keyed by user so a repeated call returns the same customer
        let key = format!("customer_{}", urlencoding::encode(user_id));
        let body = self.post("create_customer", "customers", &form, Some(key)).await?;
        body.get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| BillingError::gateway("create_customer", "response has no id", None))
    }

    async fn create_subscription(
        &self,
        request: CreateSubscriptionRequest,
    ) -> BillingResult<GatewaySubscription> {
        let form = subscription_form(&request);
        let body = self
            .post(
                "create_subscription",
                "subscriptions",
                &form,
                Some(request.idempotency_key.clone()),
            )
            .await?;
        GatewaySubscription::from_json(&body)
    }

    async fn update_subscription_quantity(
        &self,
        subscription_id: &str,
        quantity: i32,
    ) -> BillingResult<GatewaySubscription> {
        let current = self.get_subscription(subscription_id).await?;
        let item_id = current.item_id.ok_or_else(|| {
            BillingError::gateway("update_subscription_quantity", "subscription has no items", None)
        })?;
        let form = vec![
            ("items[0][id]".to_string(), item_id),
            ("items[0][quantity]".to_string(), quantity.to_string()),
        ];
        let path = format!("subscriptions/{}", urlencoding::encode(subscription_id));
        let body = self
            .post("update_subscription_quantity", &path, &form, None)
            .await?;
        GatewaySubscription::from_json(&body)
    }

    async fn update_subscription_price(
        &self,
        subscription_id: &str,
        price_id: &str,
        proration: ProrationBehavior,
    ) -> BillingResult<GatewaySubscription> {
        let current = self.get_subscription(subscription_id).await?;
        let item_id = current.item_id.ok_or_else(|| {
            BillingError::gateway("update_subscription_price", "subscription has no items", None)
        })?;
        let form = vec![
            ("items[0][id]".to_string(), item_id),
            ("items[0][price]".to_string(), price_id.to_string()),
            ("proration_behavior".to_string(), proration.as_str().to_string()),
        ];
        let path = format!("subscriptions/{}", urlencoding::encode(subscription_id));
        let body = self.post("update_subscription_price", &path, &form, None).await?;
        GatewaySubscription::from_json(&body)
    }

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        at_period_end: bool,
    ) -> BillingResult<GatewaySubscription> {
        let path = format!("subscriptions/{}", urlencoding::encode(subscription_id));
        let body = if at_period_end {
            let form = vec![("cancel_at_period_end".to_string(), "true".to_string())];
            self.post("cancel_subscription", &path, &form, None).await?
        } else {
            self.delete("cancel_subscription", &path).await?
        };
        GatewaySubscription::from_json(&body)
    }

    async fn get_subscription(&self, subscription_id: &str) -> BillingResult<GatewaySubscription> {
        let path = format!("subscriptions/{}", urlencoding::encode(subscription_id));
        let body = self.get("get_subscription", &path, &[]).await?;
        GatewaySubscription::from_json(&body)
    }

    async fn list_subscriptions(&self, customer_id: Option<&str>) -> BillingResult<Vec<GatewaySubscription>> {
        let mut subscriptions = Vec::new();
        let mut starting_after: Option<String> = None;

        loop {
            let mut query = vec![
                ("status", "all".to_string()),
                ("limit", "100".to_string()),
            ];
            if let Some(customer) = customer_id {
                query.push(("customer", customer.to_string()));
            }
            if let Some(cursor) = &starting_after {
                query.push(("starting_after", cursor.clone()));
            }

            let body = self.get("list_subscriptions", "subscriptions", &query).await?;
            for object in data_array(&body) {
                subscriptions.push(GatewaySubscription::from_json(object)?);
            }

            let has_more = body.get("has_more").and_then(Value::as_bool).unwrap_or(false);
            match subscriptions.last() {
                Some(last) if has_more => starting_after = Some(last.id.clone()),
                _ => break,
            }
        }

        Ok(subscriptions)
    }

    async fn fetch_checkout_session(&self, session_id: &str) -> BillingResult<CheckoutSession> {
        let path = format!("checkout/sessions/{}", urlencoding::encode(session_id));
        let body = self.get("fetch_checkout_session", &path, &[]).await?;
        CheckoutSession::from_json(&body)
    }

    async fn list_checkout_sessions(&self, subscription_id: &str) -> BillingResult<Vec<CheckoutSession>> {
        let query = [("subscription", subscription_id.to_string())];
        let body = self
            .get("list_checkout_sessions", "checkout/sessions", &query)
            .await?;
        data_array(&body).iter().map(CheckoutSession::from_json).collect()
    }

    async fn fetch_invoice(&self, invoice_id: &str) -> BillingResult<GatewayInvoice> {
        let path = format!("invoices/{}", urlencoding::encode(invoice_id));
        let body = self.get("fetch_invoice", &path, &[]).await?;
        GatewayInvoice::from_json(&body)
    }

    fn verify_webhook_signature(&self, payload: &[u8], signature_header: &str) -> BillingResult<WebhookEvent> {
        self.signature
            .verify(payload, signature_header, chrono::Utc::now().timestamp())
    }
}

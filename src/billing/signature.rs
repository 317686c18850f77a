//! Webhook signature verification.
//!
//! Signatures use the `t=<unix>,v1=<hex hmac>` header format, where the HMAC
//! is SHA-256 over `"{t}.{payload}"` keyed with the endpoint secret.

use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use super::error::{BillingError, BillingResult};
use super::gateway::WebhookEvent;

/// Default tolerance between the signed timestamp and now.
pub const DEFAULT_TOLERANCE_SECONDS: i64 = 300;

/// Verifies signed webhook payloads.
///
/// The secret is held as a [`SecretString`] and never appears in debug output.
#[derive(Clone)]
pub struct WebhookSignature {
    secret: SecretString,
    tolerance_seconds: i64,
}

impl WebhookSignature {
    #[must_use]
    pub fn new(secret: impl Into<SecretString>) -> Self {
        Self {
            secret: secret.into(),
            tolerance_seconds: DEFAULT_TOLERANCE_SECONDS,
        }
    }

    #[must_use]
    pub fn with_tolerance(mut self, seconds: i64) -> Self {
        self.tolerance_seconds = seconds;
        self
    }

    /// Verify the header against the payload and parse the event.
    pub fn verify(&self, payload: &[u8], header: &str, now: i64) -> BillingResult<WebhookEvent> {
        if header.trim().is_empty() {
            return Err(BillingError::MissingSignature);
        }
        let parts = parse_signature_header(header)?;

        let age = (now - parts.timestamp).abs();
        if age > self.tolerance_seconds {
            return Err(BillingError::WebhookTooOld { age_seconds: age });
        }

        let expected = compute_signature(
            self.secret.expose_secret(),
            parts.timestamp,
            payload,
        )?;

        // Any of the provided v1 signatures may match (secret rotation)
        let matched = parts.signatures.iter().any(|candidate| {
            hex::decode(candidate)
                .map(|provided| expected.ct_eq(&provided).unwrap_u8() == 1)
                .unwrap_or(false)
        });
        if !matched {
            return Err(BillingError::InvalidSignature);
        }

        serde_json::from_slice(payload).map_err(|e| {
            tracing::warn!(
                target: "tollgate::billing::webhook",
                error = %e,
                "Failed to parse webhook payload"
            );
            BillingError::InvalidWebhookPayload {
                message: "malformed JSON payload".to_string(),
            }
        })
    }

    /// Produce a header for `payload` signed at `timestamp`.
    pub fn sign(&self, payload: &[u8], timestamp: i64) -> BillingResult<String> {
        let sig = compute_signature(self.secret.expose_secret(), timestamp, payload)?;
        Ok(format!("t={},v1={}", timestamp, hex::encode(sig)))
    }
}

impl std::fmt::Debug for WebhookSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookSignature")
            .field("tolerance_seconds", &self.tolerance_seconds)
            .finish_non_exhaustive()
    }
}

struct SignatureParts {
    timestamp: i64,
    signatures: Vec<String>,
}

fn parse_signature_header(header: &str) -> BillingResult<SignatureParts> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let (key, value) = part.split_once('=').ok_or(BillingError::InvalidSignature)?;
        match key.trim() {
            "t" => timestamp = value.trim().parse().ok(),
            "v1" => signatures.push(value.trim().to_string()),
            _ => {}
        }
    }

    match timestamp {
        Some(timestamp) if !signatures.is_empty() => Ok(SignatureParts {
            timestamp,
            signatures,
        }),
        _ => Err(BillingError::InvalidSignature),
    }
}

fn compute_signature(secret: &str, timestamp: i64, payload: &[u8]) -> BillingResult<Vec<u8>> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| BillingError::store(format!("HMAC key error: {}", e)))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(mac.finalize().into_bytes().to_vec())
}

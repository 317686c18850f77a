//! Billing-specific error types.
//!
//! Engines return [`BillingError`]; the HTTP layer converts it to
//! [`TollgateError`](crate::error::TollgateError) which picks the status code.

use std::fmt;

/// Result alias used across the billing engines.
pub type BillingResult<T> = std::result::Result<T, BillingError>;

/// Billing-specific errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingError {
    // Validation errors
    /// A path or query value is not a UUID.
    InvalidUuid { value: String },
    /// `start` lies after `end`.
    InvalidDateRange { message: String },
    /// A numeric argument is outside its accepted range.
    LimitOutOfRange { field: String, value: i64, max: i64 },
    /// The plan does not exist or is not usable for this operation.
    InvalidPlan { plan_id: String, reason: String },
    /// Quantity must be at least one.
    InvalidQuantity { quantity: i64 },
    /// Pricing tiers are not contiguous from 1 or overlap.
    InvalidPricingTiers { message: String },
    /// A plan references a feature key the catalog does not know or has disabled.
    UnknownFeature { key: String },
    /// Webhook event data is malformed.
    InvalidWebhookPayload { message: String },
    /// Webhook event is older than the replay window.
    WebhookTooOld { age_seconds: i64 },
    /// Webhook request has no signature header.
    MissingSignature,
    /// Webhook request is not `application/json`.
    UnsupportedContentType { content_type: String },

    // Transport errors
    /// Webhook signature does not match.
    InvalidSignature,
    /// Webhook user-agent does not identify the gateway.
    UntrustedUserAgent,
    /// Webhook body exceeds the configured cap.
    PayloadTooLarge { size: usize, max: usize },

    // Authorization errors
    /// The caller may not act on this resource.
    AccessDenied { message: String },
    /// Paid purchases require a verified e-mail address.
    EmailNotVerified { user_id: String },

    // Not-found errors
    SubscriptionNotFound { id: String },
    BatchNotFound { id: String },
    LicenseNotFound { id: String },
    PlanNotFound { id: String },
    OrganizationNotFound { id: String },
    UserNotFound { user_id: String },
    /// The user belongs to no organization with an active subscription.
    NoOrganizationSubscriptions { user_id: String },

    // Conflict errors
    /// Every license in the batch is already assigned.
    NoAvailableLicenses { batch_id: String },
    /// A batch cannot shrink below its assigned licenses.
    QuantityBelowAssigned { requested: i32, assigned: i32 },
    /// A non-null upstream identifier is already in use.
    DuplicateUpstreamId { field: String, value: String },
    /// The aggregate is in a state that does not allow this transition.
    InvalidStateTransition { from: String, to: String },

    // Upstream errors
    /// The payment gateway rejected or failed the call.
    Gateway {
        operation: String,
        message: String,
        http_status: Option<u16>,
    },
    /// The identity provider could not be reached.
    DirectoryUnavailable { message: String },

    // Internal errors
    /// Persistence failed.
    Store { message: String },
}

impl BillingError {
    pub fn invalid_plan(plan_id: impl ToString, reason: impl Into<String>) -> Self {
        Self::InvalidPlan {
            plan_id: plan_id.to_string(),
            reason: reason.into(),
        }
    }

    pub fn access_denied(message: impl Into<String>) -> Self {
        Self::AccessDenied {
            message: message.into(),
        }
    }

    pub fn store(message: impl fmt::Display) -> Self {
        Self::Store {
            message: message.to_string(),
        }
    }

    pub fn gateway(operation: impl Into<String>, message: impl Into<String>, http_status: Option<u16>) -> Self {
        Self::Gateway {
            operation: operation.into(),
            message: message.into(),
            http_status,
        }
    }

    pub fn invalid_transition(from: impl ToString, to: impl ToString) -> Self {
        Self::InvalidStateTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Parse a UUID, mapping failure to [`BillingError::InvalidUuid`].
    pub fn parse_uuid(value: &str) -> BillingResult<uuid::Uuid> {
        uuid::Uuid::parse_str(value.trim()).map_err(|_| Self::InvalidUuid {
            value: value.to_string(),
        })
    }
}

impl fmt::Display for BillingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidUuid { value } => write!(f, "Invalid UUID: '{}'", value),
            Self::InvalidDateRange { message } => write!(f, "Invalid date range: {}", message),
            Self::LimitOutOfRange { field, value, max } => {
                write!(f, "{} out of range: {} (max {})", field, value, max)
            }
            Self::InvalidPlan { plan_id, reason } => {
                write!(f, "Invalid plan '{}': {}", plan_id, reason)
            }
            Self::InvalidQuantity { quantity } => {
                write!(f, "Invalid quantity {}: must be at least 1", quantity)
            }
            Self::InvalidPricingTiers { message } => {
                write!(f, "Invalid pricing tiers: {}", message)
            }
            Self::UnknownFeature { key } => {
                write!(f, "Unknown or inactive feature key: '{}'", key)
            }
            Self::InvalidWebhookPayload { message } => {
                write!(f, "Invalid webhook payload: {}", message)
            }
            Self::WebhookTooOld { age_seconds } => {
                write!(f, "Webhook event too old ({} seconds)", age_seconds)
            }
            Self::MissingSignature => write!(f, "Missing webhook signature header"),
            Self::UnsupportedContentType { content_type } => {
                write!(f, "Unsupported content type '{}': expected application/json", content_type)
            }
            Self::InvalidSignature => write!(f, "Invalid webhook signature"),
            Self::UntrustedUserAgent => write!(f, "Webhook user agent is not trusted"),
            Self::PayloadTooLarge { size, max } => {
                write!(f, "Webhook payload of {} bytes exceeds limit of {} bytes", size, max)
            }
            Self::AccessDenied { message } => write!(f, "Access denied: {}", message),
            Self::EmailNotVerified { user_id } => {
                write!(f, "User '{}' must verify their e-mail before purchasing", user_id)
            }
            Self::SubscriptionNotFound { id } => write!(f, "Subscription not found: {}", id),
            Self::BatchNotFound { id } => write!(f, "License batch not found: {}", id),
            Self::LicenseNotFound { id } => write!(f, "License not found: {}", id),
            Self::PlanNotFound { id } => write!(f, "Plan not found: {}", id),
            Self::OrganizationNotFound { id } => write!(f, "Organization not found: {}", id),
            Self::UserNotFound { user_id } => write!(f, "User not found: {}", user_id),
            Self::NoOrganizationSubscriptions { user_id } => {
                write!(f, "User '{}' has no organization subscriptions", user_id)
            }
            Self::NoAvailableLicenses { batch_id } => {
                write!(f, "No available licenses in batch {}", batch_id)
            }
            Self::QuantityBelowAssigned { requested, assigned } => write!(
                f,
                "Cannot reduce quantity to {}: {} licenses are assigned",
                requested, assigned
            ),
            Self::DuplicateUpstreamId { field, value } => {
                write!(f, "Duplicate {}: '{}' is already in use", field, value)
            }
            Self::InvalidStateTransition { from, to } => {
                write!(f, "Invalid state transition from '{}' to '{}'", from, to)
            }
            Self::Gateway {
                operation,
                message,
                http_status,
            } => {
                write!(f, "Payment gateway error during '{}': {}", operation, message)?;
                if let Some(status) = http_status {
                    write!(f, " [HTTP {}]", status)?;
                }
                Ok(())
            }
            Self::DirectoryUnavailable { message } => {
                write!(f, "Directory unavailable: {}", message)
            }
            Self::Store { message } => write!(f, "Store error: {}", message),
        }
    }
}

impl std::error::Error for BillingError {}

impl From<BillingError> for crate::error::TollgateError {
    fn from(err: BillingError) -> Self {
        use crate::error::TollgateError;

        match &err {
            BillingError::InvalidUuid { .. }
            | BillingError::InvalidDateRange { .. }
            | BillingError::LimitOutOfRange { .. }
            | BillingError::InvalidPlan { .. }
            | BillingError::InvalidQuantity { .. }
            | BillingError::InvalidPricingTiers { .. }
            | BillingError::UnknownFeature { .. }
            | BillingError::InvalidWebhookPayload { .. }
            | BillingError::WebhookTooOld { .. }
            | BillingError::MissingSignature
            | BillingError::UnsupportedContentType { .. } => {
                TollgateError::BadRequest(err.to_string())
            }

            BillingError::InvalidSignature => TollgateError::Unauthorized(err.to_string()),

            BillingError::UntrustedUserAgent
            | BillingError::AccessDenied { .. }
            | BillingError::EmailNotVerified { .. } => TollgateError::Forbidden(err.to_string()),

            BillingError::PayloadTooLarge { .. } => TollgateError::PayloadTooLarge(err.to_string()),

            BillingError::SubscriptionNotFound { .. }
            | BillingError::BatchNotFound { .. }
            | BillingError::LicenseNotFound { .. }
            | BillingError::PlanNotFound { .. }
            | BillingError::OrganizationNotFound { .. }
            | BillingError::UserNotFound { .. }
            | BillingError::NoOrganizationSubscriptions { .. } => {
                TollgateError::NotFound(err.to_string())
            }

            BillingError::NoAvailableLicenses { .. }
            | BillingError::QuantityBelowAssigned { .. }
            | BillingError::DuplicateUpstreamId { .. }
            | BillingError::InvalidStateTransition { .. } => {
                TollgateError::Conflict(err.to_string())
            }

            BillingError::Gateway { .. } | BillingError::DirectoryUnavailable { .. } => {
                TollgateError::BadGateway(err.to_string())
            }

            BillingError::Store { .. } => TollgateError::Internal(err.to_string()),
        }
    }
}

/// Collaborator stores (memberships, audit) speak the crate error type.
impl From<crate::error::TollgateError> for BillingError {
    fn from(err: crate::error::TollgateError) -> Self {
        BillingError::Store {
            message: err.to_string(),
        }
    }
}

impl BillingError {
    /// Check if this is a client error (4xx).
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        !self.is_server_error()
    }

    /// Check if this is a server or upstream error (5xx).
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        matches!(
            self,
            Self::Gateway { .. } | Self::DirectoryUnavailable { .. } | Self::Store { .. }
        )
    }

    /// Check if this error is retryable by the caller.
    ///
    /// Gateway transport failures, rate limits and 5xx responses are
    /// retryable; gateway 4xx responses are fatal.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Gateway { http_status, .. } => {
                matches!(http_status, None | Some(429) | Some(500..=599))
            }
            Self::DirectoryUnavailable { .. } => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TollgateError;

    #[test]
    fn test_error_display() {
        let err = BillingError::QuantityBelowAssigned {
            requested: 2,
            assigned: 3,
        };
        assert_eq!(
            err.to_string(),
            "Cannot reduce quantity to 2: 3 licenses are assigned"
        );

        let err = BillingError::gateway("create_subscription", "card declined", Some(402));
        assert_eq!(
            err.to_string(),
            "Payment gateway error during 'create_subscription': card declined [HTTP 402]"
        );
    }

    #[test]
    fn test_error_classification() {
        let err = BillingError::BatchNotFound { id: "b".into() };
        assert!(err.is_client_error());
        assert!(!err.is_server_error());
        assert!(!err.is_retryable());

        let err = BillingError::gateway("get_subscription", "timeout", None);
        assert!(err.is_server_error());
        assert!(err.is_retryable());

        let err = BillingError::gateway("get_subscription", "rate limited", Some(429));
        assert!(err.is_retryable());

        let err = BillingError::gateway("get_subscription", "no such subscription", Some(404));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_convert_to_http_error() {
        let cases: Vec<(BillingError, axum::http::StatusCode)> = vec![
            (
                BillingError::InvalidUuid { value: "x".into() },
                axum::http::StatusCode::BAD_REQUEST,
            ),
            (BillingError::InvalidSignature, axum::http::StatusCode::UNAUTHORIZED),
            (
                BillingError::EmailNotVerified { user_id: "u".into() },
                axum::http::StatusCode::FORBIDDEN,
            ),
            (
                BillingError::LicenseNotFound { id: "l".into() },
                axum::http::StatusCode::NOT_FOUND,
            ),
            (
                BillingError::NoAvailableLicenses { batch_id: "b".into() },
                axum::http::StatusCode::CONFLICT,
            ),
            (
                BillingError::DirectoryUnavailable { message: "down".into() },
                axum::http::StatusCode::BAD_GATEWAY,
            ),
            (
                BillingError::PayloadTooLarge { size: 2, max: 1 },
                axum::http::StatusCode::PAYLOAD_TOO_LARGE,
            ),
            (
                BillingError::store("disk full"),
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, status) in cases {
            let http: TollgateError = err.into();
            assert_eq!(http.status_code(), status);
        }
    }

    #[test]
    fn test_parse_uuid() {
        assert!(BillingError::parse_uuid("not-a-uuid").is_err());
        let id = uuid::Uuid::new_v4();
        assert_eq!(BillingError::parse_uuid(&id.to_string()).unwrap(), id);
    }
}

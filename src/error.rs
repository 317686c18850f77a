use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

/// The main error type for Tollgate HTTP surfaces
#[derive(Debug, thiserror::Error)]
pub enum TollgateError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Bad gateway: {0}")]
    BadGateway(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Request timeout")]
    RequestTimeout,

    #[error("Too many requests: {0}")]
    TooManyRequests(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),

    #[cfg(feature = "database")]
    #[error("Database error: {0}")]
    Database(String),
}

/// Error body returned to clients.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl TollgateError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn bad_gateway(msg: impl Into<String>) -> Self {
        Self::BadGateway(msg.into())
    }

    pub fn service_unavailable(msg: impl Into<String>) -> Self {
        Self::ServiceUnavailable(msg.into())
    }

    /// Convert error to a response, optionally exposing details.
    ///
    /// # Security
    ///
    /// Server error details are only exposed when `dev_mode` is `true`.
    /// Otherwise 5xx errors carry a generic message and the full error is only
    /// written to the server log together with the generated `error_id`.
    pub fn into_response_with_details(self, details: Option<String>, dev_mode: bool) -> Response {
        let status = self.status_code();

        let error_msg = if dev_mode {
            self.to_string()
        } else {
            self.safe_message()
        };

        let error_id = uuid::Uuid::new_v4().to_string();

        tracing::error!(
            status = status.as_u16(),
            error_id = %error_id,
            error = %self,
            "Request failed"
        );

        let body = Json(ErrorResponse {
            error: error_msg,
            error_id: Some(error_id),
            details: if dev_mode || !status.is_server_error() {
                details
            } else {
                None
            },
        });

        (status, body).into_response()
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Internal(_) | Self::Anyhow(_) => StatusCode::INTERNAL_SERVER_ERROR,
            #[cfg(feature = "database")]
            Self::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::BadGateway(_) => StatusCode::BAD_GATEWAY,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::RequestTimeout => StatusCode::REQUEST_TIMEOUT,
            Self::TooManyRequests(_) => StatusCode::TOO_MANY_REQUESTS,
        }
    }

    /// Message suitable for clients in production.
    ///
    /// Client errors (4xx) are returned as-is. Server errors (5xx) are replaced
    /// by a generic message so store or upstream details never leak (CWE-209).
    fn safe_message(&self) -> String {
        match self {
            Self::NotFound(msg) => format!("Not found: {}", msg),
            Self::BadRequest(msg) => format!("Bad request: {}", msg),
            Self::Unauthorized(msg) => format!("Unauthorized: {}", msg),
            Self::Forbidden(msg) => format!("Forbidden: {}", msg),
            Self::Conflict(msg) => format!("Conflict: {}", msg),
            Self::PayloadTooLarge(msg) => format!("Payload too large: {}", msg),
            Self::TooManyRequests(msg) => format!("Too many requests: {}", msg),
            Self::RequestTimeout => "Request timeout".to_string(),

            Self::Internal(_) | Self::Anyhow(_) => "Internal server error".to_string(),
            Self::BadGateway(_) => "Upstream service error".to_string(),
            Self::ServiceUnavailable(_) => "Service unavailable".to_string(),

            #[cfg(feature = "database")]
            Self::Database(_) => "Database error".to_string(),
        }
    }
}

impl IntoResponse for TollgateError {
    fn into_response(self) -> Response {
        self.into_response_with_details(None, false)
    }
}

/// Result type alias for Tollgate handlers
pub type Result<T> = std::result::Result<T, TollgateError>;

impl From<serde_json::Error> for TollgateError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            TollgateError::BadRequest(format!("JSON error: {}", err))
        } else {
            TollgateError::Internal(format!("JSON serialization error: {}", err))
        }
    }
}

impl From<reqwest::Error> for TollgateError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TollgateError::RequestTimeout
        } else if err.is_connect() {
            TollgateError::ServiceUnavailable(format!("Connection error: {}", err))
        } else if let Some(status) = err.status() {
            match status.as_u16() {
                429 => TollgateError::TooManyRequests("Upstream rate limit exceeded".to_string()),
                503 => TollgateError::ServiceUnavailable("Upstream service unavailable".to_string()),
                _ => TollgateError::BadGateway(format!("Upstream error: {}", err)),
            }
        } else {
            TollgateError::Internal(format!("Request error: {}", err))
        }
    }
}

impl From<validator::ValidationErrors> for TollgateError {
    fn from(err: validator::ValidationErrors) -> Self {
        let field_errors: Vec<String> = err
            .field_errors()
            .iter()
            .map(|(field, errors)| {
                let messages: Vec<&str> = errors
                    .iter()
                    .filter_map(|e| e.message.as_ref().map(|m| m.as_ref()))
                    .collect();
                if messages.is_empty() {
                    format!("{}: invalid", field)
                } else {
                    format!("{}: {}", field, messages.join(", "))
                }
            })
            .collect();

        TollgateError::BadRequest(format!("Validation failed: {}", field_errors.join("; ")))
    }
}

#[cfg(feature = "database")]
impl From<sea_orm::DbErr> for TollgateError {
    fn from(err: sea_orm::DbErr) -> Self {
        match err {
            sea_orm::DbErr::RecordNotFound(msg) => TollgateError::NotFound(msg),
            other => TollgateError::Database(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(TollgateError::not_found("x").status_code(), StatusCode::NOT_FOUND);
        assert_eq!(TollgateError::conflict("x").status_code(), StatusCode::CONFLICT);
        assert_eq!(
            TollgateError::PayloadTooLarge("x".into()).status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(TollgateError::bad_gateway("x").status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(TollgateError::RequestTimeout.status_code(), StatusCode::REQUEST_TIMEOUT);
    }

    #[test]
    fn test_safe_message_hides_server_errors() {
        let err = TollgateError::internal("connection string postgres://secret");
        assert_eq!(err.safe_message(), "Internal server error");

        let err = TollgateError::bad_gateway("gateway returned 500 for sub_123");
        assert_eq!(err.safe_message(), "Upstream service error");

        let err = TollgateError::conflict("no available licenses");
        assert_eq!(err.safe_message(), "Conflict: no available licenses");
    }

    #[test]
    fn test_from_serde_json_syntax_error() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let converted: TollgateError = err.into();
        assert!(matches!(converted, TollgateError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_into_response_generates_error_id() {
        let response = TollgateError::not_found("Batch 42").into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = body_json(response).await;
        assert_eq!(body["error"], "Not found: Batch 42");
        assert!(body["error_id"].as_str().is_some_and(|id| !id.is_empty()));
    }

    #[tokio::test]
    async fn test_production_mode_hides_internal_details() {
        let response = TollgateError::internal("store exploded")
            .into_response_with_details(Some("row 7".to_string()), false);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = body_json(response).await;
        assert_eq!(body["error"], "Internal server error");
        assert!(body.get("details").is_none());
    }

    #[tokio::test]
    async fn test_dev_mode_shows_internal_details() {
        let response = TollgateError::internal("store exploded")
            .into_response_with_details(Some("row 7".to_string()), true);

        let body = body_json(response).await;
        assert_eq!(body["error"], "Internal server error: store exploded");
        assert_eq!(body["details"], "row 7");
    }
}

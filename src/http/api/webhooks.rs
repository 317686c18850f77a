//! Gateway webhook endpoint.

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, header},
    routing::post,
};
use serde::Serialize;

use crate::billing::{SIGNATURE_HEADER, WebhookHeaders, WebhookOutcome};
use crate::http::{AppState, RouteModule};

/// Extra room over the configured cap so oversized bodies reach the
/// reconciler and are reported as `PayloadTooLarge` there.
const BODY_LIMIT_SLACK: usize = 64 * 1024;

pub struct WebhooksModule {
    pub max_body_bytes: usize,
}

impl RouteModule for WebhooksModule {
    fn routes(&self) -> Router<AppState> {
        Router::new()
            .route("/webhooks/gateway", post(receive))
            .layer(DefaultBodyLimit::max(self.max_body_bytes + BODY_LIMIT_SLACK))
    }
}

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,
    pub outcome: WebhookOutcome,
}

fn header_value(headers: &HeaderMap, name: impl header::AsHeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Transport headers the reconciler checks.
pub fn webhook_headers(headers: &HeaderMap) -> WebhookHeaders {
    WebhookHeaders {
        content_type: header_value(headers, header::CONTENT_TYPE),
        user_agent: header_value(headers, header::USER_AGENT),
        signature: header_value(headers, SIGNATURE_HEADER),
    }
}

/// Duplicates are acknowledged with 200 so the gateway stops retrying.
async fn receive(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> crate::Result<Json<WebhookAck>> {
    let outcome = state.webhooks.ingest(&body, &webhook_headers(&headers)).await?;
    Ok(Json(WebhookAck {
        received: true,
        outcome,
    }))
}

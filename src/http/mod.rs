//! HTTP surface.
//!
//! Provides the shared [`AppState`], standardized response wrappers, the
//! [`RouteModule`] trait and the route modules for every billing endpoint.

pub mod api;
pub mod extract;
pub mod response;
pub mod routes;
mod state;

pub use extract::ValidatedJson;
pub use response::{ApiResponse, ApiResult, CreatedResponse, NoContentResponse};
pub use routes::RouteModule;
pub use state::AppState;

use axum::Router;
use std::time::Duration;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::billing::webhook::DEFAULT_MAX_BODY_BYTES;

/// Requests still running after this long are answered with 408 and their
/// pending gateway calls dropped.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// The full service router with the default webhook body cap.
pub fn router(state: AppState) -> Router {
    router_with_body_limit(state, DEFAULT_MAX_BODY_BYTES)
}

/// The full service router.
pub fn router_with_body_limit(state: AppState, webhook_max_body_bytes: usize) -> Router {
    let mut routes = Router::new();
    routes = api::PlansModule.register(routes);
    routes = api::SubscriptionsModule.register(routes);
    routes = api::LicensesModule.register(routes);
    routes = api::OrganizationsModule.register(routes);
    routes = api::AdminModule.register(routes);
    routes = api::WebhooksModule {
        max_body_bytes: webhook_max_body_bytes,
    }
    .register(routes);

    routes
        .layer(TimeoutLayer::new(DEFAULT_REQUEST_TIMEOUT))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

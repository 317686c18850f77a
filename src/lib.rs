//! Tollgate - multi-tenant billing and entitlement core
//!
//! Tollgate keeps a local, authoritative view of who may use what: plans and
//! their features, individual subscriptions, bulk license batches bought by
//! one user for others, and organization subscriptions that grant features to
//! every member. A payment gateway is the system of record for money; its
//! webhooks are reconciled into the local view idempotently.
//!
//! # Features
//!
//! - **Billing**: plans, tiered pricing, subscriptions, licenses and usage limits
//! - **Organizations**: org-scoped subscriptions and effective feature resolution
//! - **Webhooks**: signed, deduplicated, ordered event reconciliation
//! - **Audit**: append-only event trail with query and retention
//! - **Jobs**: leader-elected maintenance sweeps
//! - **HTTP**: Axum routes for all of the above
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tollgate::{AppState, ConfigBuilder, billing::BillingContext};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ConfigBuilder::new().from_env().build()?;
//!     tollgate::init_tracing_with_config(&config);
//!
//!     let billing = BillingContext::new(store, gateway, directory, memberships, audit_store);
//!     let state = AppState::from_config(billing, &config);
//!     let app = tollgate::router_with_body_limit(state, config.webhook.max_body_bytes);
//!
//!     let listener = tokio::net::TcpListener::bind(config.server.addr()?).await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```

pub mod audit;
pub mod auth;
pub mod billing;
pub mod config;
mod error;
pub mod http;
#[cfg(feature = "jobs")]
pub mod jobs;
pub mod organizations;
#[cfg(all(feature = "test-billing", feature = "test-auth-bypass"))]
pub mod testing;
mod utils;

pub use config::{Config, ConfigBuilder, Environment, LoggingConfig, ServerConfig};
pub use error::{ErrorResponse, Result, TollgateError};
pub use http::{
    ApiResponse, AppState, CreatedResponse, NoContentResponse, RouteModule, ValidatedJson, router,
    router_with_body_limit,
};

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing with defaults read from the environment.
///
/// # Environment Variables
///
/// - `RUST_LOG`: log filter (e.g. "info", "tollgate::billing=debug")
/// - `TOLLGATE_LOG_JSON`: set to "true" for JSON formatted logs
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_logs = std::env::var("TOLLGATE_LOG_JSON")
        .map(|v| v.parse::<bool>().unwrap_or(false))
        .unwrap_or(false);

    install(env_filter, json_logs);
}

/// Initialize tracing from a loaded [`Config`].
pub fn init_tracing_with_config(config: &Config) {
    install(EnvFilter::new(&config.logging.level), config.logging.json);
}

fn install(env_filter: EnvFilter, json: bool) {
    let registry = tracing_subscriber::registry().with(env_filter);
    // A subscriber may already be installed by the host application or a test harness.
    let result = if json {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    if let Err(e) = result {
        tracing::debug!(error = %e, "tracing subscriber already installed");
    }
}

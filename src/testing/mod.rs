//! Testing utilities for the billing service.
//!
//! - [`TestApp`]: the full router wired to in-memory ports
//! - [`Scenario`]: requests against a router without running a server
//! - [`fixtures`]: plans, gateway events and generated identifiers
//!
//! # Example
//!
//! ```rust,ignore
//! use tollgate::testing::{TestApp, fixtures::plans, post};
//! use serde_json::json;
//!
//! #[tokio::test]
//! async fn subscribes_to_free_plan() {
//!     let app = TestApp::new().await;
//!     let plan = app.create_plan(plans::free("Free")).await;
//!
//!     post(app.router(), "/subscriptions")
//!         .as_user("user-1")
//!         .json_body(&json!({ "plan_id": plan.id }))
//!         .execute()
//!         .await
//!         .assert_created();
//! }
//! ```

pub mod fixtures;
mod scenario;

pub use scenario::{GATEWAY_USER_AGENT, Scenario, ScenarioAssert, delete, get, patch, post, put};

use axum::Router;

use crate::billing::{Plan, TestBilling};
use crate::http::{AppState, router};

/// The service router over in-memory ports, with handles to each port.
pub struct TestApp {
    pub billing: TestBilling,
    pub state: AppState,
}

impl TestApp {
    pub async fn new() -> Self {
        let billing = TestBilling::new().await;
        let state = AppState::new(billing.ctx.clone());
        Self { billing, state }
    }

    /// A fresh router over the shared state.
    pub fn router(&self) -> Router {
        router(self.state.clone())
    }

    /// Store a plan through the plan manager.
    pub async fn create_plan(&self, plan: Plan) -> Plan {
        self.state.plans.create_plan(plan).await.unwrap()
    }

    /// Sign `payload` the way the mock gateway's webhooks are signed.
    pub fn sign(&self, payload: &[u8]) -> String {
        self.billing.gateway.sign(payload)
    }
}

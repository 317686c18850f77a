//! Plan catalog endpoints.

use axum::{
    Router,
    extract::{Path, Query, State},
    routing::get,
};
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

use crate::auth::Principal;
use crate::billing::{
    BillingInterval, FeatureDefinition, Plan, PriceQuote, PricingTier, UNLIMITED,
};
use crate::http::{ApiResponse, ApiResult, AppState, CreatedResponse, RouteModule, ValidatedJson};

pub struct PlansModule;

impl RouteModule for PlansModule {
    fn routes(&self) -> Router<AppState> {
        Router::new()
            .route("/plans", get(list_plans).post(create_plan))
            .route("/plans/{id}", get(get_plan).put(update_plan))
            .route("/plans/{id}/price", get(quote))
            .route("/features", get(list_features))
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct PlanRequest {
    #[validate(length(min = 1, max = 100))]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: i32,
    #[validate(range(min = 0))]
    pub unit_price: i64,
    #[validate(length(equal = 3))]
    pub currency: String,
    #[serde(default)]
    pub interval: BillingInterval,
    #[serde(default)]
    #[validate(range(max = 365))]
    pub trial_days: u32,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub planned_features: Vec<String>,
    #[validate(range(min = -1))]
    pub max_concurrent_terminals: Option<i32>,
    #[validate(range(min = -1))]
    pub max_session_duration_minutes: Option<i32>,
    #[validate(range(min = -1))]
    pub max_courses: Option<i32>,
    #[validate(range(min = -1))]
    pub max_concurrent_users: Option<i32>,
    #[validate(range(min = -1))]
    pub max_lab_sessions: Option<i32>,
    #[serde(default)]
    #[validate(range(min = 0))]
    pub storage_gb: i32,
    #[serde(default)]
    pub machine_sizes: Vec<String>,
    #[serde(default)]
    pub pricing_tiers: Vec<PricingTier>,
    pub upstream_product_id: Option<String>,
    pub upstream_price_id: Option<String>,
    pub required_role: Option<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

impl PlanRequest {
    fn into_plan(self, id: Option<Uuid>) -> Plan {
        let mut builder = Plan::builder(self.name)
            .description(self.description)
            .priority(self.priority)
            .price(self.unit_price, &self.currency)
            .interval(self.interval)
            .trial_days(self.trial_days)
            .features(self.features)
            .planned_features(self.planned_features)
            .max_concurrent_terminals(self.max_concurrent_terminals.unwrap_or(1))
            .max_session_duration_minutes(self.max_session_duration_minutes.unwrap_or(60))
            .max_courses(self.max_courses.unwrap_or(UNLIMITED))
            .max_concurrent_users(self.max_concurrent_users.unwrap_or(1))
            .max_lab_sessions(self.max_lab_sessions.unwrap_or(UNLIMITED))
            .storage_gb(self.storage_gb)
            .machine_sizes(self.machine_sizes)
            .tiers(self.pricing_tiers);
        if let Some(id) = id {
            builder = builder.id(id);
        }
        if let (Some(product), Some(price)) = (&self.upstream_product_id, &self.upstream_price_id) {
            builder = builder.upstream_price(product, price);
        }
        if let Some(role) = &self.required_role {
            builder = builder.required_role(role);
        }
        if !self.is_active {
            builder = builder.inactive();
        }
        builder.build()
    }
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default = "default_active")]
    active_only: bool,
}

#[derive(Debug, Deserialize)]
struct QuoteQuery {
    quantity: i32,
}

async fn list_plans(State(state): State<AppState>, Query(query): Query<ListQuery>) -> ApiResult<Vec<Plan>> {
    Ok(ApiResponse::success(state.plans.list_plans(query.active_only).await?))
}

async fn get_plan(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Plan> {
    Ok(ApiResponse::success(state.plans.get_plan(id).await?))
}

async fn create_plan(
    State(state): State<AppState>,
    principal: Principal,
    ValidatedJson(request): ValidatedJson<PlanRequest>,
) -> crate::Result<CreatedResponse<Plan>> {
    principal.require_admin()?;
    let plan = state.plans.create_plan(request.into_plan(None)).await?;
    let location = format!("/plans/{}", plan.id);
    Ok(ApiResponse::created(plan, location))
}

async fn update_plan(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<Uuid>,
    ValidatedJson(request): ValidatedJson<PlanRequest>,
) -> ApiResult<Plan> {
    principal.require_admin()?;
    Ok(ApiResponse::success(state.plans.update_plan(request.into_plan(Some(id))).await?))
}

async fn quote(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<QuoteQuery>,
) -> ApiResult<PriceQuote> {
    Ok(ApiResponse::success(state.plans.quote(id, query.quantity).await?))
}

async fn list_features(State(state): State<AppState>) -> ApiResult<Vec<FeatureDefinition>> {
    Ok(ApiResponse::success(state.catalog.list().await?))
}

//! Personal subscription and usage endpoints.

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

use crate::auth::Principal;
use crate::billing::{
    ActiveSubscription, AdminAssignment, MAX_ASSIGNMENT_DAYS, MetricType, ProrationBehavior,
    Subscription, UsageCheck, UsageMetric,
};
use crate::http::{ApiResponse, ApiResult, AppState, CreatedResponse, RouteModule, ValidatedJson};

pub struct SubscriptionsModule;

impl RouteModule for SubscriptionsModule {
    fn routes(&self) -> Router<AppState> {
        Router::new()
            .route("/subscriptions", post(create_subscription))
            .route("/subscriptions/admin-assign", post(admin_assign))
            .route("/subscriptions/me", get(current_subscription))
            .route("/subscriptions/upgrade", post(upgrade))
            .route("/subscriptions/{id}/cancel", post(cancel))
            .route("/usage", get(usage_metrics))
            .route("/usage/check", post(check_usage))
            .route("/usage/record", post(record_usage))
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateSubscriptionBody {
    pub plan_id: Uuid,
}

#[derive(Debug, Deserialize, Validate)]
pub struct AdminAssignBody {
    #[validate(length(min = 1))]
    pub user_id: String,
    pub plan_id: Uuid,
    /// `0` means one year; at most [`MAX_ASSIGNMENT_DAYS`].
    #[serde(default)]
    pub duration_days: u32,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpgradeBody {
    pub plan_id: Uuid,
    #[serde(default)]
    pub proration: ProrationBehavior,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelBody {
    #[serde(default)]
    pub at_period_end: bool,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CheckUsageBody {
    pub metric: MetricType,
    #[serde(default = "default_increment")]
    #[validate(range(min = 0))]
    pub increment: i64,
}

fn default_increment() -> i64 {
    1
}

#[derive(Debug, Deserialize, Validate)]
pub struct RecordUsageBody {
    pub metric: MetricType,
    #[validate(range(min = 0))]
    pub delta: i64,
}

async fn create_subscription(
    State(state): State<AppState>,
    principal: Principal,
    ValidatedJson(body): ValidatedJson<CreateSubscriptionBody>,
) -> crate::Result<CreatedResponse<Subscription>> {
    let subscription = state
        .subscriptions
        .create_subscription(&principal.user_id, body.plan_id)
        .await?;
    let location = format!("/subscriptions/{}", subscription.id);
    Ok(ApiResponse::created(subscription, location))
}

async fn admin_assign(
    State(state): State<AppState>,
    principal: Principal,
    ValidatedJson(body): ValidatedJson<AdminAssignBody>,
) -> ApiResult<AdminAssignment> {
    principal.require_admin()?;
    let assignment = state
        .subscriptions
        .admin_assign(&body.user_id, body.plan_id, body.duration_days, &principal.user_id)
        .await?;
    Ok(ApiResponse::success(assignment))
}

async fn current_subscription(
    State(state): State<AppState>,
    principal: Principal,
) -> ApiResult<Option<ActiveSubscription>> {
    let current = state.subscriptions.current_subscription(&principal.user_id).await?;
    Ok(ApiResponse::success(current))
}

async fn upgrade(
    State(state): State<AppState>,
    principal: Principal,
    ValidatedJson(body): ValidatedJson<UpgradeBody>,
) -> ApiResult<Subscription> {
    let subscription = state
        .subscriptions
        .upgrade(&principal.user_id, body.plan_id, body.proration)
        .await?;
    Ok(ApiResponse::success(subscription))
}

async fn cancel(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<Uuid>,
    body: Option<Json<CancelBody>>,
) -> ApiResult<Subscription> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let subscription = state
        .subscriptions
        .cancel(&principal, id, body.at_period_end)
        .await?;
    if body.at_period_end {
        return Ok(ApiResponse::success_with_message(
            subscription,
            "Subscription will be cancelled at the end of the current period",
        ));
    }
    Ok(ApiResponse::success(subscription))
}

async fn usage_metrics(State(state): State<AppState>, principal: Principal) -> ApiResult<Vec<UsageMetric>> {
    Ok(ApiResponse::success(
        state.subscriptions.usage_metrics(&principal.user_id).await?,
    ))
}

async fn check_usage(
    State(state): State<AppState>,
    principal: Principal,
    ValidatedJson(body): ValidatedJson<CheckUsageBody>,
) -> ApiResult<UsageCheck> {
    let check = state
        .subscriptions
        .check_usage(&principal.user_id, body.metric, body.increment)
        .await?;
    Ok(ApiResponse::success(check))
}

async fn record_usage(
    State(state): State<AppState>,
    principal: Principal,
    ValidatedJson(body): ValidatedJson<RecordUsageBody>,
) -> ApiResult<UsageMetric> {
    let metric = state
        .subscriptions
        .record_usage(&principal.user_id, body.metric, body.delta)
        .await?;
    Ok(ApiResponse::success(metric))
}

//! Organization subscription and entitlement endpoints.

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, patch, post},
};
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

use crate::auth::Principal;
use crate::billing::{
    EffectiveFeatures, OrganizationFeatures, OrganizationSubscriptionRequest, Subscription,
};
use crate::http::{ApiResponse, ApiResult, AppState, CreatedResponse, RouteModule, ValidatedJson};

pub struct OrganizationsModule;

impl RouteModule for OrganizationsModule {
    fn routes(&self) -> Router<AppState> {
        Router::new()
            .route("/organizations/{id}/subscribe", post(subscribe))
            .route("/organizations/{id}/subscriptions", get(list_subscriptions))
            .route("/organizations/{id}/subscription", patch(change_plan))
            .route("/organizations/{id}/subscription/cancel", post(cancel))
            .route("/organizations/{id}/features", get(features))
            .route("/users/me/effective-features", get(effective_features))
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct SubscribeBody {
    pub plan_id: Uuid,
    #[serde(default = "default_quantity")]
    pub quantity: i32,
    #[serde(default)]
    pub admin_assigned: bool,
}

fn default_quantity() -> i32 {
    1
}

#[derive(Debug, Deserialize, Validate)]
pub struct ChangePlanBody {
    pub plan_id: Uuid,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelBody {
    #[serde(default)]
    pub at_period_end: bool,
}

async fn subscribe(
    State(state): State<AppState>,
    principal: Principal,
    Path(organization_id): Path<Uuid>,
    ValidatedJson(body): ValidatedJson<SubscribeBody>,
) -> crate::Result<CreatedResponse<Subscription>> {
    let subscription = state
        .organizations
        .create_subscription(
            &principal,
            OrganizationSubscriptionRequest {
                organization_id,
                plan_id: body.plan_id,
                quantity: body.quantity,
                admin_assigned: body.admin_assigned,
            },
        )
        .await?;
    let location = format!("/organizations/{}/subscriptions", organization_id);
    Ok(ApiResponse::created(subscription, location))
}

async fn list_subscriptions(
    State(state): State<AppState>,
    principal: Principal,
    Path(organization_id): Path<Uuid>,
) -> ApiResult<Vec<Subscription>> {
    Ok(ApiResponse::success(
        state
            .organizations
            .subscriptions(&principal, organization_id)
            .await?,
    ))
}

async fn change_plan(
    State(state): State<AppState>,
    principal: Principal,
    Path(organization_id): Path<Uuid>,
    ValidatedJson(body): ValidatedJson<ChangePlanBody>,
) -> ApiResult<Subscription> {
    let subscription = state
        .organizations
        .update_subscription(&principal, organization_id, body.plan_id)
        .await?;
    Ok(ApiResponse::success(subscription))
}

async fn cancel(
    State(state): State<AppState>,
    principal: Principal,
    Path(organization_id): Path<Uuid>,
    body: Option<Json<CancelBody>>,
) -> ApiResult<Subscription> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let subscription = state
        .organizations
        .cancel_subscription(&principal, organization_id, body.at_period_end)
        .await?;
    Ok(ApiResponse::success(subscription))
}

async fn features(
    State(state): State<AppState>,
    principal: Principal,
    Path(organization_id): Path<Uuid>,
) -> ApiResult<OrganizationFeatures> {
    Ok(ApiResponse::success(
        state
            .organizations
            .organization_features(&principal, organization_id)
            .await?,
    ))
}

async fn effective_features(State(state): State<AppState>, principal: Principal) -> ApiResult<EffectiveFeatures> {
    Ok(ApiResponse::success(
        state
            .organizations
            .effective_features(&principal.user_id)
            .await?,
    ))
}

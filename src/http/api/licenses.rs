//! Bulk license endpoints.

use axum::{
    Router,
    extract::{Path, State},
    routing::{get, patch, post},
};
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

use crate::auth::Principal;
use crate::billing::{LicenseBatch, Subscription};
use crate::http::{
    ApiResponse, ApiResult, AppState, CreatedResponse, NoContentResponse, RouteModule, ValidatedJson,
};

pub struct LicensesModule;

impl RouteModule for LicensesModule {
    fn routes(&self) -> Router<AppState> {
        Router::new()
            .route("/batches", get(list_batches).post(create_batch))
            .route("/batches/{id}", get(get_batch).delete(delete_batch))
            .route("/batches/{id}/licenses", get(batch_licenses))
            .route("/batches/{id}/available", get(available_licenses))
            .route("/batches/{id}/assign", post(assign_license))
            .route("/batches/{id}/quantity", patch(update_quantity))
            .route("/licenses/{id}/revoke", post(revoke_license))
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateBatchBody {
    pub plan_id: Uuid,
    pub quantity: i32,
    pub group_id: Option<Uuid>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct AssignBody {
    #[validate(length(min = 1))]
    pub user_id: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct QuantityBody {
    pub quantity: i32,
}

async fn create_batch(
    State(state): State<AppState>,
    principal: Principal,
    ValidatedJson(body): ValidatedJson<CreateBatchBody>,
) -> crate::Result<CreatedResponse<LicenseBatch>> {
    let batch = state
        .bulk
        .create_batch(&principal.user_id, body.plan_id, body.quantity, body.group_id)
        .await?;
    let location = format!("/batches/{}", batch.id);
    Ok(ApiResponse::created(batch, location))
}

async fn list_batches(State(state): State<AppState>, principal: Principal) -> ApiResult<Vec<LicenseBatch>> {
    Ok(ApiResponse::success(
        state.bulk.batches_by_purchaser(&principal.user_id).await?,
    ))
}

async fn get_batch(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<Uuid>,
) -> ApiResult<LicenseBatch> {
    Ok(ApiResponse::success(state.bulk.get_batch(id, &principal).await?))
}

async fn batch_licenses(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<Uuid>,
) -> ApiResult<Vec<Subscription>> {
    Ok(ApiResponse::success(state.bulk.batch_licenses(id, &principal).await?))
}

async fn available_licenses(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<Uuid>,
) -> ApiResult<Vec<Subscription>> {
    Ok(ApiResponse::success(
        state.bulk.available_licenses(id, &principal).await?,
    ))
}

async fn assign_license(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<Uuid>,
    ValidatedJson(body): ValidatedJson<AssignBody>,
) -> ApiResult<Subscription> {
    let license = state
        .bulk
        .assign_license(id, &principal, &body.user_id)
        .await?;
    Ok(ApiResponse::success(license))
}

async fn update_quantity(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<Uuid>,
    ValidatedJson(body): ValidatedJson<QuantityBody>,
) -> ApiResult<LicenseBatch> {
    let batch = state
        .bulk
        .update_quantity(id, &principal, body.quantity)
        .await?;
    Ok(ApiResponse::success(batch))
}

async fn revoke_license(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<Uuid>,
) -> ApiResult<Subscription> {
    Ok(ApiResponse::success(state.bulk.revoke_license(id, &principal).await?))
}

async fn delete_batch(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<Uuid>,
) -> crate::Result<NoContentResponse> {
    state.bulk.permanently_delete(id, &principal).await?;
    Ok(NoContentResponse)
}

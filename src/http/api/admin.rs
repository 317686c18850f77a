//! Administrative endpoints: audit query, reconciliation and reports.

use axum::{
    Router,
    extract::{Path, Query, State},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::audit::{AuditEventType, AuditFilter, AuditPage, AuditSeverity, AuditStatus};
use crate::auth::Principal;
use crate::billing::{
    BatchReport, BillingError, BillingResult, ReconcileResult, SubscriptionAnalytics,
    inconsistent_batches, subscription_analytics,
};
use crate::error::TollgateError;
use crate::http::{ApiResponse, ApiResult, AppState, RouteModule};

pub struct AdminModule;

impl RouteModule for AdminModule {
    fn routes(&self) -> Router<AppState> {
        Router::new()
            .route("/audit/logs", get(audit_logs))
            .route("/reconcile/subscriptions", post(reconcile_all))
            .route("/reconcile/users/{user_id}", post(reconcile_user))
            .route("/reconcile/missing-metadata", post(reconcile_missing_metadata))
            .route("/analytics/subscriptions", get(analytics))
            .route("/batches/inconsistent", get(batch_reports))
    }
}

/// Raw audit query string. Every field is parsed and reported individually.
#[derive(Debug, Default, Deserialize)]
pub struct AuditQuery {
    pub actor_id: Option<String>,
    pub target_id: Option<String>,
    pub organization_id: Option<String>,
    pub event_type: Option<String>,
    pub severity: Option<String>,
    pub status: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

fn parse_time(field: &str, value: &str) -> BillingResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| BillingError::InvalidDateRange {
            message: format!("{} is not an RFC 3339 timestamp: '{}'", field, value),
        })
}

fn parse_enum<T: std::str::FromStr>(field: &str, value: &str) -> crate::Result<T> {
    value
        .parse()
        .map_err(|_| TollgateError::bad_request(format!("unknown {} '{}'", field, value)))
}

impl AuditQuery {
    /// Parse into a filter. Malformed UUIDs, timestamps and codes are
    /// validation errors.
    pub fn into_filter(self) -> crate::Result<AuditFilter> {
        Ok(AuditFilter {
            actor_id: self.actor_id.filter(|s| !s.is_empty()),
            target_id: self.target_id.filter(|s| !s.is_empty()),
            organization_id: self
                .organization_id
                .as_deref()
                .map(BillingError::parse_uuid)
                .transpose()?,
            event_type: self
                .event_type
                .as_deref()
                .map(|v| parse_enum::<AuditEventType>("event_type", v))
                .transpose()?,
            severity: self
                .severity
                .as_deref()
                .map(|v| parse_enum::<AuditSeverity>("severity", v))
                .transpose()?,
            status: self
                .status
                .as_deref()
                .map(|v| parse_enum::<AuditStatus>("status", v))
                .transpose()?,
            start_date: self
                .start_date
                .as_deref()
                .map(|v| parse_time("start_date", v))
                .transpose()?,
            end_date: self
                .end_date
                .as_deref()
                .map(|v| parse_time("end_date", v))
                .transpose()?,
            limit: self.limit,
            offset: self.offset,
        })
    }
}

async fn audit_logs(
    State(state): State<AppState>,
    principal: Principal,
    Query(query): Query<AuditQuery>,
) -> ApiResult<AuditPage> {
    principal.require_admin()?;
    let filter = query.into_filter()?;
    Ok(ApiResponse::success(state.billing.audit.query(&filter).await?))
}

async fn reconcile_all(State(state): State<AppState>, principal: Principal) -> ApiResult<ReconcileResult> {
    principal.require_admin()?;
    Ok(ApiResponse::success(state.reconciler.sync_existing().await?))
}

async fn reconcile_user(
    State(state): State<AppState>,
    principal: Principal,
    Path(user_id): Path<String>,
) -> ApiResult<ReconcileResult> {
    principal.require_admin()?;
    Ok(ApiResponse::success(state.reconciler.sync_user(&user_id).await?))
}

async fn reconcile_missing_metadata(
    State(state): State<AppState>,
    principal: Principal,
) -> ApiResult<ReconcileResult> {
    principal.require_admin()?;
    Ok(ApiResponse::success(
        state.reconciler.sync_missing_metadata().await?,
    ))
}

async fn analytics(State(state): State<AppState>, principal: Principal) -> ApiResult<SubscriptionAnalytics> {
    principal.require_admin()?;
    Ok(ApiResponse::success(
        subscription_analytics(state.billing.store.as_ref()).await?,
    ))
}

async fn batch_reports(State(state): State<AppState>, principal: Principal) -> ApiResult<Vec<BatchReport>> {
    principal.require_admin()?;
    Ok(ApiResponse::success(
        inconsistent_batches(state.billing.store.as_ref()).await?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_query_parsing() {
        let filter = AuditQuery {
            actor_id: Some("admin-1".to_string()),
            organization_id: Some("6f1c0b8e-3c1d-4a55-9d7e-0a3c5d4f2b11".to_string()),
            event_type: Some("billing.subscription.created".to_string()),
            start_date: Some("2025-01-01T00:00:00Z".to_string()),
            limit: Some(10),
            ..Default::default()
        }
        .into_filter()
        .unwrap();

        assert_eq!(filter.actor_id.as_deref(), Some("admin-1"));
        assert!(filter.organization_id.is_some());
        assert_eq!(filter.event_type, Some(AuditEventType::SubscriptionCreated));
        assert_eq!(filter.limit, Some(10));
    }

    #[test]
    fn test_audit_query_rejects_bad_uuid_and_time() {
        let bad_uuid = AuditQuery {
            organization_id: Some("not-a-uuid".to_string()),
            ..Default::default()
        }
        .into_filter();
        assert!(matches!(bad_uuid, Err(TollgateError::BadRequest(ref m)) if m.contains("Invalid UUID")));

        let bad_time = AuditQuery {
            end_date: Some("yesterday".to_string()),
            ..Default::default()
        }
        .into_filter();
        assert!(matches!(bad_time, Err(TollgateError::BadRequest(ref m)) if m.contains("end_date")));

        let bad_code = AuditQuery {
            event_type: Some("billing.nothing".to_string()),
            ..Default::default()
        }
        .into_filter();
        assert!(matches!(bad_code, Err(TollgateError::BadRequest(_))));
    }
}

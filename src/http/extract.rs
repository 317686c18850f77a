use crate::error::TollgateError;
use axum::{Json, extract::Request};
use serde::Deserialize;
use validator::Validate;

/// JSON body that has passed `validator` checks
///
/// # Example
///
/// ```rust,ignore
/// #[derive(Deserialize, Validate)]
/// struct AssignRequest {
///     #[validate(length(min = 1))]
///     user_id: String,
/// }
///
/// async fn assign(ValidatedJson(req): ValidatedJson<AssignRequest>) -> ApiResult<Subscription> {
///     // req.user_id is non-empty here
/// }
/// ```
pub struct ValidatedJson<T>(pub T);

impl<T, S> axum::extract::FromRequest<S> for ValidatedJson<T>
where
    T: for<'de> Deserialize<'de> + Validate + Send,
    S: Send + Sync,
{
    type Rejection = TollgateError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value): Json<T> = Json::from_request(req, state)
            .await
            .map_err(|e| TollgateError::bad_request(format!("Invalid JSON: {}", e)))?;

        value.validate()?;
        Ok(ValidatedJson(value))
    }
}

use crate::billing::directory::ADMIN_ROLE;
use crate::billing::error::{BillingError, BillingResult};
use crate::error::TollgateError;
use axum::{extract::FromRequestParts, http::request::Parts};
use serde::{Deserialize, Serialize};
use std::future::Future;

/// The authenticated caller.
///
/// Authentication happens upstream: a middleware verifies the session and
/// inserts a `Principal` into the request extensions. Handlers take it as an
/// extractor; requests without one are rejected with 401.
///
/// # Example
///
/// ```rust,ignore
/// async fn handler(principal: Principal) -> Json<Value> {
///     Json(json!({ "user_id": principal.user_id }))
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: String,
    pub email: Option<String>,
    pub roles: Vec<String>,
}

impl Principal {
    #[must_use]
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            email: None,
            roles: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    /// Holder of the global administrator role.
    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.has_role(ADMIN_ROLE)
    }

    pub fn require_admin(&self) -> BillingResult<()> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(BillingError::access_denied("Administrator role required"))
        }
    }
}

/// Header carrying the user ID when `test-auth-bypass` is enabled.
#[cfg(feature = "test-auth-bypass")]
pub const TEST_USER_HEADER: &str = "X-Test-User-Id";
/// Comma-separated roles when `test-auth-bypass` is enabled.
#[cfg(feature = "test-auth-bypass")]
pub const TEST_ROLES_HEADER: &str = "X-Test-Roles";

#[cfg(feature = "test-auth-bypass")]
fn principal_from_test_headers(parts: &Parts) -> Option<Principal> {
    let user_id = parts
        .headers
        .get(TEST_USER_HEADER)?
        .to_str()
        .ok()?
        .trim()
        .to_string();
    if user_id.is_empty() {
        return None;
    }
    let roles = parts
        .headers
        .get(TEST_ROLES_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    Some(Principal {
        user_id,
        email: None,
        roles,
    })
}

impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
{
    type Rejection = TollgateError;

    fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> impl Future<Output = Result<Self, Self::Rejection>> + Send {
        let principal = parts.extensions.get::<Principal>().cloned();

        #[cfg(feature = "test-auth-bypass")]
        let principal = principal.or_else(|| principal_from_test_headers(parts));

        async move { principal.ok_or_else(|| TollgateError::unauthorized("Authentication required")) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    #[test]
    fn test_admin_role() {
        let user = Principal::new("u1");
        assert!(!user.is_admin());
        assert!(user.require_admin().is_err());

        let admin = Principal::new("a1").with_roles(["member", ADMIN_ROLE]);
        assert!(admin.is_admin());
        assert!(admin.require_admin().is_ok());
    }

    #[tokio::test]
    async fn test_extracts_from_extensions() {
        let mut request = Request::builder().body(()).unwrap();
        request.extensions_mut().insert(Principal::new("u1"));
        let (mut parts, _) = request.into_parts();

        let principal = Principal::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(principal.user_id, "u1");
    }

    #[tokio::test]
    async fn test_missing_principal_is_unauthorized() {
        let (mut parts, _) = Request::builder().body(()).unwrap().into_parts();
        let err = Principal::from_request_parts(&mut parts, &()).await.unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::UNAUTHORIZED);
    }

    #[cfg(feature = "test-auth-bypass")]
    #[tokio::test]
    async fn test_bypass_headers() {
        let (mut parts, _) = Request::builder()
            .header(TEST_USER_HEADER, "u7")
            .header(TEST_ROLES_HEADER, "administrator, member")
            .body(())
            .unwrap()
            .into_parts();
        let principal = Principal::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(principal.user_id, "u7");
        assert!(principal.is_admin());
    }
}

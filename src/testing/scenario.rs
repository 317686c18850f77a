//! Request scenarios against the billing router without starting a server.
//!
//! # Example
//!
//! ```rust,ignore
//! use tollgate::testing::{TestApp, get};
//!
//! #[tokio::test]
//! async fn lists_plans() {
//!     let app = TestApp::new().await;
//!
//!     get(app.router(), "/plans")
//!         .as_user("user-1")
//!         .execute()
//!         .await
//!         .assert_ok()
//!         .assert_json_path("success", serde_json::json!(true))
//!         .await;
//! }
//! ```

use axum::{
    Router,
    body::Body,
    http::{HeaderName, HeaderValue, Method, Request, StatusCode, header},
};
use serde::{Deserialize, Serialize};
use tower::ServiceExt;

use crate::auth::{TEST_ROLES_HEADER, TEST_USER_HEADER};
use crate::billing::SIGNATURE_HEADER;
use crate::billing::directory::ADMIN_ROLE;

/// User agent the webhook endpoint accepts.
pub const GATEWAY_USER_AGENT: &str = "Stripe/1.0 (+https://stripe.com/docs/webhooks)";

/// A single request against an app.
pub struct Scenario {
    app: Router,
    request: Request<Body>,
}

impl Scenario {
    pub fn new(app: Router) -> Self {
        let mut request = Request::new(Body::empty());
        *request.method_mut() = Method::GET;
        Self { app, request }
    }

    pub fn method(mut self, method: Method) -> Self {
        *self.request.method_mut() = method;
        self
    }

    pub fn uri(mut self, uri: &str) -> Self {
        *self.request.uri_mut() = uri.parse().unwrap();
        self
    }

    pub fn header(mut self, key: &str, value: &str) -> Self {
        self.request.headers_mut().insert(
            HeaderName::from_bytes(key.as_bytes()).unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
        self
    }

    /// Authenticate as `user_id` with no roles.
    pub fn as_user(self, user_id: &str) -> Self {
        self.header(TEST_USER_HEADER, user_id)
    }

    /// Authenticate as `user_id` holding the administrator role.
    pub fn as_admin(self, user_id: &str) -> Self {
        self.as_user(user_id).with_roles(&[ADMIN_ROLE])
    }

    pub fn with_roles(self, roles: &[&str]) -> Self {
        let roles = roles.join(",");
        self.header(TEST_ROLES_HEADER, &roles)
    }

    /// Append query parameters to the request URI.
    pub fn with_query(mut self, params: &[(&str, &str)]) -> Self {
        let uri = self.request.uri().clone();
        let mut query_parts = vec![];
        if let Some(query) = uri.query() {
            query_parts.push(query.to_string());
        }
        for (key, value) in params {
            query_parts.push(format!(
                "{}={}",
                urlencoding::encode(key),
                urlencoding::encode(value)
            ));
        }

        let new_uri = format!("{}?{}", uri.path(), query_parts.join("&"));
        *self.request.uri_mut() = new_uri.parse().unwrap();
        self
    }

    pub fn json_body<T: Serialize>(mut self, body: &T) -> Self {
        let json = serde_json::to_vec(body).unwrap();
        *self.request.body_mut() = Body::from(json);
        self.request.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        self
    }

    pub fn raw_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        *self.request.body_mut() = Body::from(body.into());
        self
    }

    /// A gateway delivery: JSON content type, gateway user agent and the
    /// given signature header.
    pub fn webhook(self, payload: impl Into<Vec<u8>>, signature: &str) -> Self {
        self.method(Method::POST)
            .header(header::CONTENT_TYPE.as_str(), "application/json")
            .header(header::USER_AGENT.as_str(), GATEWAY_USER_AGENT)
            .header(SIGNATURE_HEADER, signature)
            .raw_body(payload)
    }

    pub async fn execute(self) -> ScenarioAssert {
        let response = self.app.oneshot(self.request).await.unwrap();
        ScenarioAssert { response }
    }
}

/// Assertions on a scenario's response.
pub struct ScenarioAssert {
    response: axum::response::Response,
}

impl ScenarioAssert {
    pub fn status(&self) -> StatusCode {
        self.response.status()
    }

    pub fn assert_status(self, expected: StatusCode) -> Self {
        assert_eq!(
            self.response.status(),
            expected,
            "Expected status {}, got {}",
            expected,
            self.response.status()
        );
        self
    }

    pub fn assert_ok(self) -> Self {
        self.assert_status(StatusCode::OK)
    }

    pub fn assert_created(self) -> Self {
        self.assert_status(StatusCode::CREATED)
    }

    pub fn assert_no_content(self) -> Self {
        self.assert_status(StatusCode::NO_CONTENT)
    }

    pub fn assert_bad_request(self) -> Self {
        self.assert_status(StatusCode::BAD_REQUEST)
    }

    pub fn assert_unauthorized(self) -> Self {
        self.assert_status(StatusCode::UNAUTHORIZED)
    }

    pub fn assert_forbidden(self) -> Self {
        self.assert_status(StatusCode::FORBIDDEN)
    }

    pub fn assert_not_found(self) -> Self {
        self.assert_status(StatusCode::NOT_FOUND)
    }

    pub fn assert_conflict(self) -> Self {
        self.assert_status(StatusCode::CONFLICT)
    }

    pub fn assert_header(self, key: &str, expected: &str) -> Self {
        let value = self
            .response
            .headers()
            .get(key)
            .unwrap_or_else(|| panic!("Header '{}' not found", key))
            .to_str()
            .unwrap();
        assert_eq!(value, expected, "Header '{}' value mismatch", key);
        self
    }

    pub async fn body_bytes(self) -> Vec<u8> {
        axum::body::to_bytes(self.response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    pub async fn body_string(self) -> String {
        String::from_utf8(self.body_bytes().await).unwrap()
    }

    pub async fn json<T: for<'de> Deserialize<'de>>(self) -> T {
        let bytes = self.body_bytes().await;
        serde_json::from_slice(&bytes).expect("Failed to parse JSON response")
    }

    /// The `data` member of an [`ApiResponse`](crate::ApiResponse) body.
    pub async fn data<T: for<'de> Deserialize<'de>>(self) -> T {
        let body: serde_json::Value = self.json().await;
        serde_json::from_value(body["data"].clone()).expect("Failed to parse response data")
    }

    /// Assert the value at a dotted path (`data.items.0.id`).
    pub async fn assert_json_path(self, path: &str, expected: serde_json::Value) -> Self {
        let status = self.response.status();
        let bytes = self.body_bytes().await;
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        let actual =
            json_path_get(&json, path).unwrap_or_else(|| panic!("Path '{}' not found in {}", path, json));
        assert_eq!(actual, &expected, "JSON path '{}' value mismatch", path);

        let mut response = axum::response::Response::new(Body::from(bytes));
        *response.status_mut() = status;
        Self { response }
    }

    pub async fn assert_contains(self, text: &str) -> Self {
        let status = self.response.status();
        let body = self.body_string().await;
        assert!(
            body.contains(text),
            "Response body does not contain '{}'. Body: {}",
            text,
            body
        );
        let mut response = axum::response::Response::new(Body::from(body));
        *response.status_mut() = status;
        Self { response }
    }

    pub fn response(self) -> axum::response::Response {
        self.response
    }
}

fn json_path_get<'a>(json: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let mut current = json;
    for part in path.split('.') {
        current = match part.parse::<usize>() {
            Ok(index) => current.get(index)?,
            Err(_) => current.get(part)?,
        };
    }
    Some(current)
}

pub fn get(app: Router, uri: &str) -> Scenario {
    Scenario::new(app).method(Method::GET).uri(uri)
}

pub fn post(app: Router, uri: &str) -> Scenario {
    Scenario::new(app).method(Method::POST).uri(uri)
}

pub fn put(app: Router, uri: &str) -> Scenario {
    Scenario::new(app).method(Method::PUT).uri(uri)
}

pub fn patch(app: Router, uri: &str) -> Scenario {
    Scenario::new(app).method(Method::PATCH).uri(uri)
}

pub fn delete(app: Router, uri: &str) -> Scenario {
    Scenario::new(app).method(Method::DELETE).uri(uri)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Principal;
    use axum::{Json, routing::get as axum_get};
    use serde_json::json;

    async fn whoami(principal: Principal) -> Json<serde_json::Value> {
        Json(json!({ "user_id": principal.user_id, "admin": principal.is_admin() }))
    }

    #[tokio::test]
    async fn test_as_admin_sets_principal() {
        let app = Router::new().route("/whoami", axum_get(whoami));

        get(app, "/whoami")
            .as_admin("admin-1")
            .execute()
            .await
            .assert_ok()
            .assert_json_path("user_id", json!("admin-1"))
            .await
            .assert_json_path("admin", json!(true))
            .await;
    }

    #[tokio::test]
    async fn test_missing_principal_is_unauthorized() {
        let app = Router::new().route("/whoami", axum_get(whoami));

        get(app, "/whoami").execute().await.assert_unauthorized();
    }

    #[test]
    fn test_json_path_get() {
        let value = json!({ "data": { "items": [{ "id": 7 }] } });
        assert_eq!(json_path_get(&value, "data.items.0.id"), Some(&json!(7)));
        assert_eq!(json_path_get(&value, "data.missing"), None);
    }
}

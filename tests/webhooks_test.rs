//! Gateway webhook endpoint driven through the router.

use serde_json::json;
use tollgate::billing::{BillingStore, SubscriptionStatus};
use tollgate::testing::{TestApp, fixtures::events, fixtures::plans, post};

#[tokio::test]
async fn duplicate_delivery_is_acknowledged_once_applied() {
    let app = TestApp::new().await;
    let plan = app.create_plan(plans::paid("Pro", 1500)).await;

    let payload = serde_json::to_vec(&events::subscription_created("evt_1", "sub_1", "u1", &plan)).unwrap();
    let signature = app.sign(&payload);

    post(app.router(), "/webhooks/gateway")
        .webhook(payload.clone(), &signature)
        .execute()
        .await
        .assert_ok()
        .assert_json_path("outcome", json!("processed"))
        .await;

    post(app.router(), "/webhooks/gateway")
        .webhook(payload, &signature)
        .execute()
        .await
        .assert_ok()
        .assert_json_path("received", json!(true))
        .await
        .assert_json_path("outcome", json!("duplicate"))
        .await;

    let subscriptions = app.billing.store.list_user_subscriptions("u1").await.unwrap();
    assert_eq!(subscriptions.len(), 1);
    assert_eq!(subscriptions[0].status, SubscriptionStatus::Active);
    assert_eq!(subscriptions[0].upstream_subscription_id.as_deref(), Some("sub_1"));
    assert!(app.billing.store.get_webhook_event("evt_1").await.unwrap().is_some());
}

#[tokio::test]
async fn tampered_payload_is_unauthorized() {
    let app = TestApp::new().await;
    let plan = app.create_plan(plans::paid("Pro", 1500)).await;

    let payload = serde_json::to_vec(&events::subscription_created("evt_2", "sub_2", "u1", &plan)).unwrap();
    let signature = app.sign(&payload);
    let tampered = serde_json::to_vec(&events::subscription_created("evt_2", "sub_2", "u2", &plan)).unwrap();

    post(app.router(), "/webhooks/gateway")
        .webhook(tampered, &signature)
        .execute()
        .await
        .assert_unauthorized();

    assert!(app.billing.store.list_subscriptions().await.unwrap().is_empty());
}

#[tokio::test]
async fn transport_checks() {
    let app = TestApp::new().await;
    let payload = br#"{"id":"evt_3"}"#.to_vec();

    // No signature
    post(app.router(), "/webhooks/gateway")
        .header("content-type", "application/json")
        .header("user-agent", tollgate::testing::GATEWAY_USER_AGENT)
        .raw_body(payload.clone())
        .execute()
        .await
        .assert_bad_request();

    // Untrusted user agent
    post(app.router(), "/webhooks/gateway")
        .webhook(payload.clone(), "t=1,v1=00")
        .header("user-agent", "curl/8.0")
        .execute()
        .await
        .assert_forbidden();

    // Oversized body
    let oversized = vec![b' '; 1024 * 1024 + 1];
    post(app.router(), "/webhooks/gateway")
        .webhook(oversized, "t=1,v1=00")
        .execute()
        .await
        .assert_status(axum::http::StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn unhandled_event_types_are_ignored() {
    let app = TestApp::new().await;
    let payload = serde_json::to_vec(&events::event("evt_4", "customer.created", json!({ "id": "cus_1" }))).unwrap();
    let signature = app.sign(&payload);

    post(app.router(), "/webhooks/gateway")
        .webhook(payload, &signature)
        .execute()
        .await
        .assert_ok()
        .assert_json_path("outcome", json!("ignored"))
        .await;
    assert!(app.billing.store.get_webhook_event("evt_4").await.unwrap().is_none());
}

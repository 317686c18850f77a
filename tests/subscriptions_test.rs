//! Subscription endpoints driven through the router.

use serde_json::{Value, json};
use tollgate::billing::{BillingStore, SubscriptionStatus};
use tollgate::testing::{TestApp, fixtures::plans, get, post};

#[tokio::test]
async fn free_plan_supports_many_subscribers() {
    let app = TestApp::new().await;
    let plan = app.create_plan(plans::free("Free")).await;

    for user in ["u1", "u2", "u3"] {
        post(app.router(), "/subscriptions")
            .as_user(user)
            .json_body(&json!({ "plan_id": plan.id }))
            .execute()
            .await
            .assert_created()
            .assert_json_path("data.status", json!("active"))
            .await;
    }

    let subscriptions = app.billing.store.list_subscriptions().await.unwrap();
    assert_eq!(subscriptions.len(), 3);
    assert!(subscriptions.iter().all(|s| s.status == SubscriptionStatus::Active));
    assert!(subscriptions.iter().all(|s| s.upstream_subscription_id.is_none()));
}

#[tokio::test]
async fn create_requires_principal() {
    let app = TestApp::new().await;
    let plan = app.create_plan(plans::free("Free")).await;

    post(app.router(), "/subscriptions")
        .json_body(&json!({ "plan_id": plan.id }))
        .execute()
        .await
        .assert_unauthorized();
}

#[tokio::test]
async fn unknown_plan_is_not_found() {
    let app = TestApp::new().await;

    post(app.router(), "/subscriptions")
        .as_user("u1")
        .json_body(&json!({ "plan_id": uuid::Uuid::new_v4() }))
        .execute()
        .await
        .assert_not_found();
}

#[tokio::test]
async fn admin_assign_replaces_current_subscription() {
    let app = TestApp::new().await;
    let free = app.create_plan(plans::free("Free")).await;
    let pro = app.create_plan(plans::paid("Pro", 1500)).await;

    let first: Value = post(app.router(), "/subscriptions")
        .as_user("u1")
        .json_body(&json!({ "plan_id": free.id }))
        .execute()
        .await
        .assert_created()
        .data()
        .await;

    post(app.router(), "/subscriptions/admin-assign")
        .as_user("u1")
        .json_body(&json!({ "user_id": "u1", "plan_id": pro.id, "duration_days": 30 }))
        .execute()
        .await
        .assert_forbidden();

    let assignment: Value = post(app.router(), "/subscriptions/admin-assign")
        .as_admin("a")
        .json_body(&json!({ "user_id": "u1", "plan_id": pro.id, "duration_days": 30 }))
        .execute()
        .await
        .assert_ok()
        .data()
        .await;
    assert_eq!(assignment["subscription"]["kind"], json!("assigned"));

    let first_id: uuid::Uuid = serde_json::from_value(first["id"].clone()).unwrap();
    let replaced = app
        .billing
        .store
        .get_subscription(first_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(replaced.status, SubscriptionStatus::Replaced);
    assert!(replaced.cancelled_at.is_some());

    let current = app.billing.store.list_user_subscriptions("u1").await.unwrap();
    let active: Vec<_> = current
        .iter()
        .filter(|s| s.status == SubscriptionStatus::Active)
        .collect();
    assert_eq!(active.len(), 1);
    let term = active[0].current_period_end - active[0].current_period_start;
    assert_eq!(term.num_days(), 30);
}

#[tokio::test]
async fn current_subscription_and_usage() {
    let app = TestApp::new().await;
    let plan = app.create_plan(plans::free("Free")).await;

    get(app.router(), "/subscriptions/me")
        .as_user("u1")
        .execute()
        .await
        .assert_ok()
        .assert_json_path("data", Value::Null)
        .await;

    post(app.router(), "/subscriptions")
        .as_user("u1")
        .json_body(&json!({ "plan_id": plan.id }))
        .execute()
        .await
        .assert_created();

    get(app.router(), "/subscriptions/me")
        .as_user("u1")
        .execute()
        .await
        .assert_ok()
        .assert_contains(&plan.id.to_string())
        .await;

    // The free plan allows one concurrent terminal
    post(app.router(), "/usage/check")
        .as_user("u1")
        .json_body(&json!({ "metric": "concurrent_terminals", "increment": 2 }))
        .execute()
        .await
        .assert_ok()
        .assert_json_path("data.allowed", json!(false))
        .await;
}

#[tokio::test]
async fn cancel_with_empty_body() {
    let app = TestApp::new().await;
    let plan = app.create_plan(plans::free("Free")).await;

    let created: Value = post(app.router(), "/subscriptions")
        .as_user("u1")
        .json_body(&json!({ "plan_id": plan.id }))
        .execute()
        .await
        .data()
        .await;
    let id = created["id"].as_str().unwrap().to_string();

    post(app.router(), &format!("/subscriptions/{}/cancel", id))
        .as_user("someone-else")
        .execute()
        .await
        .assert_forbidden();

    post(app.router(), &format!("/subscriptions/{}/cancel", id))
        .as_user("u1")
        .execute()
        .await
        .assert_ok()
        .assert_json_path("data.status", json!("cancelled"))
        .await;
}

//! Administrative endpoints driven through the router.

use serde_json::{Value, json};
use tollgate::billing::gateway::GatewaySubscription;
use tollgate::billing::BillingStore;
use tollgate::testing::{TestApp, fixtures::plans, get, post};

#[tokio::test]
async fn audit_query_validates_parameters() {
    let app = TestApp::new().await;

    get(app.router(), "/audit/logs")
        .as_user("u1")
        .execute()
        .await
        .assert_forbidden();

    for query in [
        "organization_id=not-a-uuid",
        "start_date=yesterday",
        "end_date=2025-13-40T00:00:00Z",
        "event_type=billing.nothing",
        "severity=catastrophic",
    ] {
        get(app.router(), &format!("/audit/logs?{}", query))
            .as_admin("admin")
            .execute()
            .await
            .assert_bad_request();
    }
}

#[tokio::test]
async fn audit_query_filters_billing_events() {
    let app = TestApp::new().await;
    let plan = app.create_plan(plans::free("Free")).await;
    for user in ["u1", "u2"] {
        post(app.router(), "/subscriptions")
            .as_user(user)
            .json_body(&json!({ "plan_id": plan.id }))
            .execute()
            .await
            .assert_created();
    }

    let page: Value = get(app.router(), "/audit/logs")
        .as_admin("admin")
        .with_query(&[
            ("actor_id", "u1"),
            ("event_type", "billing.subscription.created"),
            ("start_date", "2020-01-01T00:00:00Z"),
        ])
        .execute()
        .await
        .assert_ok()
        .data()
        .await;

    assert_eq!(page["total"], json!(1));
    assert_eq!(page["entries"].as_array().unwrap().len(), 1);
    assert_eq!(page["entries"][0]["actor"]["id"], json!("u1"));
}

#[tokio::test]
async fn reconcile_is_admin_only() {
    let app = TestApp::new().await;

    post(app.router(), "/reconcile/subscriptions")
        .as_user("u1")
        .execute()
        .await
        .assert_forbidden();

    post(app.router(), "/reconcile/subscriptions")
        .execute()
        .await
        .assert_unauthorized();
}

#[tokio::test]
async fn reconcile_backfills_missing_subscription() {
    let app = TestApp::new().await;
    let plan = app.create_plan(plans::paid("Pro", 1500)).await;
    let start = chrono::Utc::now().timestamp();

    app.billing.gateway.insert_subscription(GatewaySubscription {
        id: "sub_backfill".to_string(),
        customer_id: Some("cus_u1".to_string()),
        status: "active".to_string(),
        price_id: plan.upstream_price_id.clone(),
        item_id: Some("si_backfill".to_string()),
        quantity: 1,
        current_period_start: start,
        current_period_end: start + 30 * 86_400,
        trial_end: None,
        cancel_at_period_end: false,
        canceled_at: None,
        metadata: [
            ("user_id".to_string(), "u1".to_string()),
            ("subscription_plan_id".to_string(), plan.id.to_string()),
        ]
        .into_iter()
        .collect(),
    });

    post(app.router(), "/reconcile/subscriptions")
        .as_admin("admin")
        .execute()
        .await
        .assert_ok()
        .assert_json_path("data.created", json!(1))
        .await;

    let subscriptions = app.billing.store.list_user_subscriptions("u1").await.unwrap();
    assert_eq!(subscriptions.len(), 1);
    assert_eq!(subscriptions[0].upstream_subscription_id.as_deref(), Some("sub_backfill"));

    // A second pass finds nothing new
    post(app.router(), "/reconcile/subscriptions")
        .as_admin("admin")
        .execute()
        .await
        .assert_ok()
        .assert_json_path("data.created", json!(0))
        .await;
}

#[tokio::test]
async fn analytics_summarize_subscriptions() {
    let app = TestApp::new().await;
    let plan = app.create_plan(plans::free("Free")).await;
    post(app.router(), "/subscriptions")
        .as_user("u1")
        .json_body(&json!({ "plan_id": plan.id }))
        .execute()
        .await
        .assert_created();

    get(app.router(), "/analytics/subscriptions")
        .as_admin("admin")
        .execute()
        .await
        .assert_ok()
        .assert_json_path("data.total_subscriptions", json!(1))
        .await
        .assert_json_path("data.active_subscriptions", json!(1))
        .await;
}

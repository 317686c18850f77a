//! Bulk license endpoints driven through the router.

use serde_json::{Value, json};
use tollgate::billing::{BillingStore, check_batch};
use tollgate::organizations::MembershipStore;
use tollgate::testing::{TestApp, fixtures::plans, get, patch, post};
use uuid::Uuid;

async fn free_batch(app: &TestApp, purchaser: &str, quantity: i32, group_id: Option<Uuid>) -> Value {
    let plan = app.create_plan(plans::free("Classroom")).await;
    post(app.router(), "/batches")
        .as_user(purchaser)
        .json_body(&json!({ "plan_id": plan.id, "quantity": quantity, "group_id": group_id }))
        .execute()
        .await
        .assert_created()
        .data()
        .await
}

async fn assign(app: &TestApp, batch_id: &str, purchaser: &str, user_id: &str) -> Value {
    post(app.router(), &format!("/batches/{}/assign", batch_id))
        .as_user(purchaser)
        .json_body(&json!({ "user_id": user_id }))
        .execute()
        .await
        .assert_ok()
        .data()
        .await
}

async fn assert_consistent(app: &TestApp, batch_id: &str) {
    let report = check_batch(&app.billing.store, Uuid::parse_str(batch_id).unwrap())
        .await
        .unwrap();
    assert!(report.is_consistent(), "{:?}", report);
}

#[tokio::test]
async fn assign_enrolls_into_group_once() {
    let app = TestApp::new().await;
    let group = app.billing.memberships.seed_group("Cohort", "trainer");
    app.billing.directory.add_user("student", &[]);

    let batch = free_batch(&app, "trainer", 5, Some(group.id)).await;
    let batch_id = batch["id"].as_str().unwrap().to_string();
    assert_eq!(batch["status"], json!("active"));
    assert_eq!(batch["total_quantity"], json!(5));

    let license = assign(&app, &batch_id, "trainer", "student").await;
    assert_eq!(license["user_id"], json!("student"));

    get(app.router(), &format!("/batches/{}", batch_id))
        .as_user("trainer")
        .execute()
        .await
        .assert_ok()
        .assert_json_path("data.assigned_quantity", json!(1))
        .await;
    let member = app
        .billing
        .memberships
        .get_group_member(group.id, "student")
        .await
        .unwrap()
        .unwrap();
    assert!(member.is_active);
    assert_consistent(&app, &batch_id).await;

    post(app.router(), &format!("/licenses/{}/revoke", license["id"].as_str().unwrap()))
        .as_user("trainer")
        .execute()
        .await
        .assert_ok();
    assign(&app, &batch_id, "trainer", "student").await;

    let members = app.billing.memberships.list_group_members(group.id).await.unwrap();
    assert_eq!(members.iter().filter(|m| m.user_id == "student").count(), 1);
    assert_consistent(&app, &batch_id).await;
}

#[tokio::test]
async fn quantity_cannot_drop_below_assigned() {
    let app = TestApp::new().await;
    for user in ["s1", "s2", "s3"] {
        app.billing.directory.add_user(user, &[]);
    }
    let batch = free_batch(&app, "trainer", 5, None).await;
    let batch_id = batch["id"].as_str().unwrap().to_string();
    for user in ["s1", "s2", "s3"] {
        assign(&app, &batch_id, "trainer", user).await;
    }

    patch(app.router(), &format!("/batches/{}/quantity", batch_id))
        .as_user("trainer")
        .json_body(&json!({ "quantity": 2 }))
        .execute()
        .await
        .assert_conflict();

    let unchanged = app
        .billing
        .store
        .get_batch(Uuid::parse_str(&batch_id).unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(unchanged.total_quantity, 5);
    assert_eq!(unchanged.assigned_quantity, 3);

    patch(app.router(), &format!("/batches/{}/quantity", batch_id))
        .as_user("trainer")
        .json_body(&json!({ "quantity": 8 }))
        .execute()
        .await
        .assert_ok()
        .assert_json_path("data.total_quantity", json!(8))
        .await;
    assert_consistent(&app, &batch_id).await;
}

#[tokio::test]
async fn exhausted_batch_rejects_assignment() {
    let app = TestApp::new().await;
    app.billing.directory.add_user("s1", &[]);
    app.billing.directory.add_user("s2", &[]);
    let batch = free_batch(&app, "trainer", 1, None).await;
    let batch_id = batch["id"].as_str().unwrap().to_string();

    assign(&app, &batch_id, "trainer", "s1").await;
    post(app.router(), &format!("/batches/{}/assign", batch_id))
        .as_user("trainer")
        .json_body(&json!({ "user_id": "s2" }))
        .execute()
        .await
        .assert_conflict();
    assert_consistent(&app, &batch_id).await;
}

#[tokio::test]
async fn only_purchaser_manages_batch() {
    let app = TestApp::new().await;
    app.billing.directory.add_user("s1", &[]);
    let batch = free_batch(&app, "trainer", 2, None).await;
    let batch_id = batch["id"].as_str().unwrap().to_string();

    post(app.router(), &format!("/batches/{}/assign", batch_id))
        .as_user("intruder")
        .json_body(&json!({ "user_id": "s1" }))
        .execute()
        .await
        .assert_forbidden();

    get(app.router(), &format!("/batches/{}/licenses", batch_id))
        .as_user("intruder")
        .execute()
        .await
        .assert_forbidden();

    get(app.router(), &format!("/batches/{}/available", batch_id))
        .as_user("trainer")
        .execute()
        .await
        .assert_ok()
        .assert_json_path("data.1.status", json!("unassigned"))
        .await;
}

#[tokio::test]
async fn batch_invariants_hold_across_operations() {
    let app = TestApp::new().await;
    let users: Vec<String> = (0..6).map(|i| format!("s{}", i)).collect();
    for user in &users {
        app.billing.directory.add_user(user, &[]);
    }
    let batch = free_batch(&app, "trainer", 4, None).await;
    let batch_id = batch["id"].as_str().unwrap().to_string();

    let mut licenses = Vec::new();
    for user in &users[..4] {
        licenses.push(assign(&app, &batch_id, "trainer", user).await);
        assert_consistent(&app, &batch_id).await;
    }
    for license in licenses.iter().take(2) {
        post(app.router(), &format!("/licenses/{}/revoke", license["id"].as_str().unwrap()))
            .as_user("trainer")
            .execute()
            .await
            .assert_ok();
        assert_consistent(&app, &batch_id).await;
    }
    for quantity in [6, 2, 4] {
        patch(app.router(), &format!("/batches/{}/quantity", batch_id))
            .as_user("trainer")
            .json_body(&json!({ "quantity": quantity }))
            .execute()
            .await
            .assert_ok();
        assert_consistent(&app, &batch_id).await;
    }
    for user in &users[4..] {
        assign(&app, &batch_id, "trainer", user).await;
        assert_consistent(&app, &batch_id).await;
    }

    get(app.router(), "/batches/inconsistent")
        .as_admin("admin")
        .execute()
        .await
        .assert_ok()
        .assert_json_path("data", json!([]))
        .await;
}

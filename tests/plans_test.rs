//! Plan catalog and pricing endpoints driven through the router.

use serde_json::{Value, json};
use tollgate::billing::PriceQuote;
use tollgate::testing::{TestApp, get, post};

fn tiered_plan_body() -> Value {
    json!({
        "name": "Team",
        "priority": 20,
        "unit_price": 1000,
        "currency": "EUR",
        "features": ["bulk_purchase", "group_management"],
        "pricing_tiers": [
            { "min_quantity": 1, "max_quantity": 5, "unit_price": 1000 },
            { "min_quantity": 6, "max_quantity": 15, "unit_price": 800 },
            { "min_quantity": 16, "max_quantity": 0, "unit_price": 600 },
        ],
        "upstream_product_id": "prod_team",
        "upstream_price_id": "price_team",
    })
}

async fn create_tiered(app: &TestApp) -> String {
    let plan: Value = post(app.router(), "/plans")
        .as_admin("admin")
        .json_body(&tiered_plan_body())
        .execute()
        .await
        .assert_created()
        .data()
        .await;
    plan["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn only_admins_create_plans() {
    let app = TestApp::new().await;

    post(app.router(), "/plans")
        .as_user("u1")
        .json_body(&tiered_plan_body())
        .execute()
        .await
        .assert_forbidden();

    let mut unknown_feature = tiered_plan_body();
    unknown_feature["features"] = json!(["teleportation"]);
    post(app.router(), "/plans")
        .as_admin("admin")
        .json_body(&unknown_feature)
        .execute()
        .await
        .assert_bad_request();

    let mut bad_currency = tiered_plan_body();
    bad_currency["currency"] = json!("EURO");
    post(app.router(), "/plans")
        .as_admin("admin")
        .json_body(&bad_currency)
        .execute()
        .await
        .assert_bad_request();
}

#[tokio::test]
async fn tiered_quote_for_twenty_units() {
    let app = TestApp::new().await;
    let plan_id = create_tiered(&app).await;

    let quote: PriceQuote = get(app.router(), &format!("/plans/{}/price?quantity=20", plan_id))
        .execute()
        .await
        .assert_ok()
        .data()
        .await;

    assert_eq!(quote.total, 16000);
    assert_eq!(quote.savings, 4000);
    assert_eq!(quote.breakdown.len(), 3);
    assert_eq!(quote.currency, "eur");
}

#[tokio::test]
async fn quotes_are_monotonic() {
    let app = TestApp::new().await;
    let plan_id = create_tiered(&app).await;

    let mut previous = 0;
    for quantity in 1..=40 {
        let quote: PriceQuote = get(app.router(), &format!("/plans/{}/price?quantity={}", plan_id, quantity))
            .execute()
            .await
            .assert_ok()
            .data()
            .await;
        assert!(quote.total >= previous, "total dropped at quantity {}", quantity);
        assert!(quote.savings >= 0);
        assert_eq!(quote.breakdown.iter().map(|t| t.subtotal).sum::<i64>(), quote.total);
        assert_eq!(quote.breakdown.iter().map(|t| t.quantity).sum::<i32>(), quantity);
        previous = quote.total;
    }

    get(app.router(), &format!("/plans/{}/price?quantity=0", plan_id))
        .execute()
        .await
        .assert_bad_request();
}

#[tokio::test]
async fn lists_active_plans_and_features() {
    let app = TestApp::new().await;
    create_tiered(&app).await;

    get(app.router(), "/plans")
        .execute()
        .await
        .assert_ok()
        .assert_json_path("data.0.name", json!("Team"))
        .await;

    get(app.router(), "/features")
        .execute()
        .await
        .assert_ok()
        .assert_contains("group_management")
        .await;
}

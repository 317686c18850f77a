//! Plans, gateway events and identifiers for tests.

use chrono::{Duration, Utc};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::billing::gateway::{META_PLAN_ID, META_USER_ID};
use crate::billing::{Plan, PricingTier};

/// Generated identifiers.
pub mod fake {
    use super::*;

    pub fn user_id() -> String {
        format!("user-{}", &Uuid::new_v4().simple().to_string()[..12])
    }

    pub fn email() -> String {
        format!("test-{}@example.com", Uuid::new_v4().simple())
    }

    /// An upstream identifier with the gateway's prefix convention.
    pub fn upstream_id(prefix: &str) -> String {
        format!("{}_{}", prefix, Uuid::new_v4().simple())
    }
}

/// Plan shapes used across tests.
pub mod plans {
    use super::*;

    /// A free plan: no price, no upstream identifiers.
    pub fn free(name: &str) -> Plan {
        Plan::builder(name)
            .features(["export"])
            .max_concurrent_terminals(1)
            .build()
    }

    /// A monthly plan billed through the gateway.
    pub fn paid(name: &str, unit_price: i64) -> Plan {
        Plan::builder(name)
            .price(unit_price, "eur")
            .features(["export", "api_access"])
            .max_concurrent_terminals(2)
            .upstream_price(&fake::upstream_id("prod"), &fake::upstream_id("price"))
            .build()
    }

    /// `[1-5 @ 1000], [6-15 @ 800], [16+ @ 600]`.
    pub fn tiered(name: &str) -> Plan {
        Plan::builder(name)
            .price(1000, "eur")
            .features(["bulk_purchase", "group_management"])
            .tiers(vec![
                PricingTier::new(1, 5, 1000),
                PricingTier::new(6, 15, 800),
                PricingTier::new(16, 0, 600),
            ])
            .upstream_price(&fake::upstream_id("prod"), &fake::upstream_id("price"))
            .build()
    }
}

/// Gateway event envelopes.
pub mod events {
    use super::*;
    use crate::billing::webhook::EVENT_SUBSCRIPTION_CREATED;

    /// An upstream subscription object for `user_id` on `plan`.
    pub fn subscription_object(upstream_id: &str, user_id: &str, plan: &Plan, status: &str) -> Value {
        let start = Utc::now();
        let end = start + Duration::days(30);
        json!({
            "id": upstream_id,
            "object": "subscription",
            "customer": format!("cus_{}", user_id),
            "status": status,
            "current_period_start": start.timestamp(),
            "current_period_end": end.timestamp(),
            "cancel_at_period_end": false,
            "items": { "data": [{
                "id": format!("si_{}", upstream_id),
                "quantity": 1,
                "price": { "id": plan.upstream_price_id },
            }]},
            "metadata": {
                META_USER_ID: user_id,
                META_PLAN_ID: plan.id.to_string(),
            },
        })
    }

    /// A signed-envelope-ready event created now.
    pub fn event(event_id: &str, event_type: &str, object: Value) -> Value {
        json!({
            "id": event_id,
            "object": "event",
            "type": event_type,
            "created": Utc::now().timestamp(),
            "data": { "object": object },
        })
    }

    pub fn subscription_created(event_id: &str, upstream_id: &str, user_id: &str, plan: &Plan) -> Value {
        event(
            event_id,
            EVENT_SUBSCRIPTION_CREATED,
            subscription_object(upstream_id, user_id, plan, "active"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::gateway::{GatewaySubscription, WebhookEvent};

    #[test]
    fn test_plan_shapes() {
        assert!(plans::free("Free").is_free());
        assert!(plans::free("Free").upstream_price_id.is_none());

        let paid = plans::paid("Pro", 1500);
        assert!(!paid.is_free());
        assert!(paid.upstream_price_id.as_deref().unwrap().starts_with("price_"));

        assert_eq!(plans::tiered("Team").pricing_tiers.len(), 3);
    }

    #[test]
    fn test_subscription_created_event_parses() {
        let plan = plans::paid("Pro", 1500);
        let payload = events::subscription_created("evt_1", "sub_1", "user-1", &plan);

        let event: WebhookEvent = serde_json::from_value(payload).unwrap();
        let upstream = GatewaySubscription::from_json(&event.data.object).unwrap();
        let metadata = upstream.metadata();
        assert_eq!(upstream.id, "sub_1");
        assert_eq!(upstream.price_id, plan.upstream_price_id);
        assert_eq!(metadata.user_id.as_deref(), Some("user-1"));
        assert_eq!(metadata.plan_id, Some(plan.id));
    }
}

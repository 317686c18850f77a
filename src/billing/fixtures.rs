//! Sample plans for development and test deployments.

use super::error::BillingResult;
use super::plans::PlanManager;
use super::types::{Plan, PricingTier};
use crate::config::Environment;

const MEMBER_FEATURES: [&str; 10] = [
    "unlimited_courses",
    "advanced_labs",
    "export",
    "custom_themes",
    "machine_size_xs",
    "machine_size_s",
    "machine_size_m",
    "network_access",
    "data_persistence",
    "command_history",
];

/// The sample plan set: a free trial, a personal plan and a tiered trainer plan.
#[must_use]
pub fn sample_plans() -> Vec<Plan> {
    let trial = Plan::builder("Trial")
        .description("Free plan to try the platform")
        .features(["machine_size_xs"])
        .machine_sizes(["XS"])
        .max_concurrent_terminals(1)
        .max_session_duration_minutes(60)
        .required_role("member")
        .build();

    let member = Plan::builder("Member Pro")
        .description("Full access for individual learners")
        .priority(10)
        .price(1200, "eur")
        .trial_days(14)
        .features(MEMBER_FEATURES)
        .machine_sizes(["XS", "S", "M"])
        .max_concurrent_terminals(3)
        .max_session_duration_minutes(180)
        .storage_gb(5)
        .required_role("member")
        .build();

    let trainer = Plan::builder("Trainer Plan")
        .description("Volume licensing for trainers and their groups")
        .priority(20)
        .price(1200, "eur")
        .features(
            MEMBER_FEATURES
                .into_iter()
                .chain(["bulk_purchase", "group_management", "machine_size_l", "machine_size_xl"]),
        )
        .machine_sizes(["XS", "S", "M", "L", "XL"])
        .tiers(vec![
            PricingTier::new(1, 5, 1200),
            PricingTier::new(6, 15, 1000),
            PricingTier::new(16, 30, 800),
            PricingTier::new(31, 0, 600),
        ])
        .max_concurrent_terminals(10)
        .max_session_duration_minutes(480)
        .storage_gb(20)
        .required_role("trainer")
        .build();

    vec![trial, member, trainer]
}

/// Create any sample plan whose name is not taken yet.
///
/// Does nothing in production. Returns how many plans were created.
pub async fn seed_sample_plans(plans: &PlanManager, environment: Environment) -> BillingResult<usize> {
    if !environment.dev_fixtures_enabled() {
        return Ok(0);
    }

    let existing = plans.list_plans(false).await?;
    let mut created = 0;
    for plan in sample_plans() {
        if existing.iter().any(|p| p.name == plan.name) {
            continue;
        }
        plans.create_plan(plan).await?;
        created += 1;
    }

    tracing::info!(
        target: "tollgate::billing::plans",
        environment = environment.as_str(),
        created,
        "Sample plans seeded"
    );
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::context::test::TestBilling;
    use crate::billing::pricing::compute_price;

    #[tokio::test]
    async fn test_seed_is_idempotent() {
        let t = TestBilling::new().await;
        let plans = PlanManager::new(t.ctx.store.clone());

        assert_eq!(seed_sample_plans(&plans, Environment::Development).await.unwrap(), 3);
        assert_eq!(seed_sample_plans(&plans, Environment::Development).await.unwrap(), 0);
        assert_eq!(plans.list_plans(true).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_production_skips_fixtures() {
        let t = TestBilling::new().await;
        let plans = PlanManager::new(t.ctx.store.clone());

        assert_eq!(seed_sample_plans(&plans, Environment::Production).await.unwrap(), 0);
        assert!(plans.list_plans(false).await.unwrap().is_empty());
    }

    #[test]
    fn test_trainer_tiers_price_volume() {
        let trainer = sample_plans().remove(2);
        let quote = compute_price(&trainer, 20).unwrap();
        assert_eq!(quote.total, 5 * 1200 + 10 * 1000 + 5 * 800);
    }
}

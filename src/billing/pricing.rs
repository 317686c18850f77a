//! Tiered pricing.

use serde::{Deserialize, Serialize};

use super::error::{BillingError, BillingResult};
use super::types::{Plan, PricingTier};

/// Units billed at one tier's price.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierBreakdown {
    /// e.g. `"1-5"` or `"16+"`.
    pub range: String,
    pub quantity: i32,
    pub unit_price: i64,
    pub subtotal: i64,
}

/// Price of `quantity` units of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub quantity: i32,
    pub total: i64,
    pub currency: String,
    pub breakdown: Vec<TierBreakdown>,
    /// Unit price a non-tiered purchase would pay.
    pub flat_unit_price: i64,
    /// `quantity × flat_unit_price − total`, never negative.
    pub savings: i64,
    pub average_unit_price: f64,
}

/// Compute the price of `quantity` units.
///
/// Without tiers the total is `quantity × unit_price`. With tiers, units are
/// allocated tier by tier; a tier with `max_quantity == 0` absorbs the rest.
pub fn compute_price(plan: &Plan, quantity: i32) -> BillingResult<PriceQuote> {
    if quantity < 1 {
        return Err(BillingError::InvalidQuantity {
            quantity: quantity as i64,
        });
    }

    let flat_unit_price = flat_unit_price(plan);
    let breakdown = if plan.uses_tiered_pricing && !plan.pricing_tiers.is_empty() {
        allocate(&plan.pricing_tiers, quantity)
    } else {
        vec![TierBreakdown {
            range: format!("1-{}", quantity),
            quantity,
            unit_price: plan.unit_price,
            subtotal: plan.unit_price * quantity as i64,
        }]
    };

    let total: i64 = breakdown.iter().map(|t| t.subtotal).sum();
    let savings = (flat_unit_price * quantity as i64 - total).max(0);

    Ok(PriceQuote {
        quantity,
        total,
        currency: plan.currency.clone(),
        breakdown,
        flat_unit_price,
        savings,
        average_unit_price: total as f64 / quantity as f64,
    })
}

/// Price of a single unit: the first tier's price, or the plan price.
fn flat_unit_price(plan: &Plan) -> i64 {
    if plan.uses_tiered_pricing {
        if let Some(first) = sorted(&plan.pricing_tiers).first() {
            return first.unit_price;
        }
    }
    plan.unit_price
}

fn sorted(tiers: &[PricingTier]) -> Vec<&PricingTier> {
    let mut tiers: Vec<&PricingTier> = tiers.iter().collect();
    tiers.sort_by_key(|t| t.min_quantity);
    tiers
}

fn allocate(tiers: &[PricingTier], quantity: i32) -> Vec<TierBreakdown> {
    let mut remaining = quantity;
    let mut breakdown = Vec::new();

    for tier in sorted(tiers) {
        if remaining == 0 {
            break;
        }
        let units = if tier.is_unbounded() {
            remaining
        } else {
            remaining.min(tier.max_quantity - tier.min_quantity + 1)
        };
        if units <= 0 {
            continue;
        }
        breakdown.push(TierBreakdown {
            range: tier.range_label(),
            quantity: units,
            unit_price: tier.unit_price,
            subtotal: tier.unit_price * units as i64,
        });
        remaining -= units;
    }

    breakdown
}

/// Check that tiers start at 1, are contiguous and non-overlapping, and that
/// only the last tier is unbounded.
pub fn validate_tiers(tiers: &[PricingTier]) -> BillingResult<()> {
    let invalid = |message: String| Err(BillingError::InvalidPricingTiers { message });

    let tiers = sorted(tiers);
    let Some(first) = tiers.first() else {
        return invalid("at least one tier is required".to_string());
    };
    if first.min_quantity != 1 {
        return invalid(format!("first tier must start at 1, got {}", first.min_quantity));
    }

    let mut expected_min = 1;
    for (i, tier) in tiers.iter().enumerate() {
        let is_last = i == tiers.len() - 1;
        if tier.unit_price < 0 {
            return invalid(format!("tier {} has a negative price", tier.range_label()));
        }
        if tier.min_quantity != expected_min {
            return invalid(format!(
                "tier {} must start at {}",
                tier.range_label(),
                expected_min
            ));
        }
        if tier.is_unbounded() {
            if !is_last {
                return invalid(format!("only the last tier may be unbounded, not {}", tier.range_label()));
            }
        } else {
            if tier.max_quantity < tier.min_quantity {
                return invalid(format!("tier {} ends before it starts", tier.range_label()));
            }
            expected_min = tier.max_quantity + 1;
        }
    }

    if let Some(last) = tiers.last() {
        if !last.is_unbounded() {
            return invalid("the last tier must be unbounded (max 0)".to_string());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiered_plan() -> Plan {
        Plan::builder("Team")
            .price(1000, "eur")
            .tiers(vec![
                PricingTier::new(1, 5, 1000),
                PricingTier::new(6, 15, 800),
                PricingTier::new(16, 0, 600),
            ])
            .build()
    }

    #[test]
    fn test_tiered_quote_for_twenty() {
        let quote = compute_price(&tiered_plan(), 20).unwrap();
        assert_eq!(quote.total, 16000);
        assert_eq!(quote.savings, 4000);
        assert_eq!(quote.breakdown.len(), 3);
        assert_eq!(quote.breakdown[0].quantity, 5);
        assert_eq!(quote.breakdown[1].quantity, 10);
        assert_eq!(quote.breakdown[2].quantity, 5);
        assert_eq!(quote.breakdown[2].range, "16+");
        assert_eq!(quote.flat_unit_price, 1000);
    }

    #[test]
    fn test_flat_quote() {
        let plan = Plan::builder("Pro").price(1200, "eur").build();
        let quote = compute_price(&plan, 3).unwrap();
        assert_eq!(quote.total, 3600);
        assert_eq!(quote.savings, 0);
        assert_eq!(quote.breakdown.len(), 1);
    }

    #[test]
    fn test_quote_properties_hold_for_every_quantity() {
        let plan = tiered_plan();
        let mut previous = 0;
        for q in 1..=200 {
            let quote = compute_price(&plan, q).unwrap();
            let sum: i64 = quote.breakdown.iter().map(|t| t.subtotal).sum();
            let units: i32 = quote.breakdown.iter().map(|t| t.quantity).sum();
            assert_eq!(sum, quote.total, "breakdown must sum to total at q={}", q);
            assert_eq!(units, q);
            assert!(quote.total >= previous, "total must not decrease at q={}", q);
            assert!(quote.savings >= 0);
            previous = quote.total;
        }
    }

    #[test]
    fn test_zero_quantity_rejected() {
        assert!(compute_price(&tiered_plan(), 0).is_err());
    }

    #[test]
    fn test_validate_tiers() {
        assert!(validate_tiers(&tiered_plan().pricing_tiers).is_ok());

        let gap = vec![PricingTier::new(1, 5, 1000), PricingTier::new(7, 0, 800)];
        assert!(validate_tiers(&gap).is_err());

        let overlap = vec![PricingTier::new(1, 5, 1000), PricingTier::new(5, 0, 800)];
        assert!(validate_tiers(&overlap).is_err());

        let bounded_end = vec![PricingTier::new(1, 5, 1000), PricingTier::new(6, 10, 800)];
        assert!(validate_tiers(&bounded_end).is_err());

        let unbounded_middle = vec![PricingTier::new(1, 0, 1000), PricingTier::new(6, 0, 800)];
        assert!(validate_tiers(&unbounded_middle).is_err());

        assert!(validate_tiers(&[]).is_err());
    }
}

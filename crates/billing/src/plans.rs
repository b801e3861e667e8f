//! Plan configuration and tier schedules
//!
//! Plans and their pricing tiers are administrator-maintained configuration.
//! `TierSchedule` is the only way the pricing code sees tiers, and its
//! constructor rejects any tier set that is not a contiguous, non-overlapping
//! ladder ending in exactly one open-ended tier.

use condo_shared::types::{PlanId, PlanType, PricingMode, TierId};
use serde::{Deserialize, Serialize};

use crate::error::{BillingError, BillingResult};

/// Pricing/feature template a subscription is bound to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Plan {
    pub id: PlanId,
    pub name: String,
    pub plan_type: PlanType,
    /// Floor applied to consumption when the subscription charges the minimum
    pub license_minimum: i64,
    /// `None` = unlimited
    pub license_limit: Option<i64>,
    pub allow_multiple_properties: bool,
    /// Permits exceeding `license_limit`
    pub allow_overage: bool,
    pub pricing_mode: PricingMode,
    pub annual_discount_percentage: f64,
    pub is_active: bool,
}

impl Plan {
    /// Check the plan's own field ranges
    pub fn validate(&self) -> BillingResult<()> {
        if self.license_minimum < 0 {
            return Err(BillingError::InvalidInput(format!(
                "Plan {} has a negative license minimum",
                self.name
            )));
        }
        if matches!(self.license_limit, Some(limit) if limit < 0) {
            return Err(BillingError::InvalidInput(format!(
                "Plan {} has a negative license limit",
                self.name
            )));
        }
        if !(0.0..=100.0).contains(&self.annual_discount_percentage) {
            return Err(BillingError::InvalidInput(format!(
                "Plan {} annual discount must be between 0 and 100, got {}",
                self.name, self.annual_discount_percentage
            )));
        }
        if self.plan_type.is_single_property() && self.allow_multiple_properties {
            return Err(BillingError::InvalidInput(format!(
                "Plan {} is single-property but allows multiple properties",
                self.name
            )));
        }
        Ok(())
    }

    /// Whether this plan caps consumption at all
    pub fn is_unlimited(&self) -> bool {
        self.license_limit.is_none()
    }
}

/// One `[min_licenses, max_licenses]` bracket of a plan's price list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PricingTier {
    pub id: TierId,
    pub plan_id: PlanId,
    pub min_licenses: i64,
    /// `None` = unbounded
    pub max_licenses: Option<i64>,
    pub price_per_license_cents: i64,
    pub sort_order: i32,
}

impl PricingTier {
    pub fn new(
        plan_id: PlanId,
        min_licenses: i64,
        max_licenses: Option<i64>,
        price_per_license_cents: i64,
    ) -> Self {
        Self {
            id: TierId::new(),
            plan_id,
            min_licenses,
            max_licenses,
            price_per_license_cents,
            sort_order: 0,
        }
    }

    /// Whether `count` falls inside this tier (max `None` = +∞)
    pub fn contains(&self, count: i64) -> bool {
        count >= self.min_licenses && self.max_licenses.map_or(true, |max| count <= max)
    }
}

/// Validated, ascending tier ladder for a single plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierSchedule {
    plan_id: PlanId,
    tiers: Vec<PricingTier>,
}

impl TierSchedule {
    /// Build a schedule, enforcing:
    /// - at least one tier, all belonging to `plan_id`
    /// - `min >= 0`, `max >= min`, non-negative prices
    /// - contiguous and non-overlapping once sorted by `min_licenses`
    /// - exactly one open-ended tier, and it is the last one
    pub fn new(plan_id: PlanId, mut tiers: Vec<PricingTier>) -> BillingResult<Self> {
        if tiers.is_empty() {
            return Err(BillingError::InvalidTierSchedule(format!(
                "plan {} has no pricing tiers",
                plan_id
            )));
        }

        tiers.sort_by_key(|t| (t.min_licenses, t.sort_order));

        for tier in &tiers {
            if tier.plan_id != plan_id {
                return Err(BillingError::InvalidTierSchedule(format!(
                    "tier {} belongs to plan {}, not {}",
                    tier.id, tier.plan_id, plan_id
                )));
            }
            if tier.min_licenses < 0 {
                return Err(BillingError::InvalidTierSchedule(format!(
                    "tier starting at {} has a negative minimum",
                    tier.min_licenses
                )));
            }
            if matches!(tier.max_licenses, Some(max) if max < tier.min_licenses) {
                return Err(BillingError::InvalidTierSchedule(format!(
                    "tier starting at {} ends before it begins",
                    tier.min_licenses
                )));
            }
            if tier.price_per_license_cents < 0 {
                return Err(BillingError::InvalidTierSchedule(format!(
                    "tier starting at {} has a negative price",
                    tier.min_licenses
                )));
            }
        }

        let open_ended = tiers.iter().filter(|t| t.max_licenses.is_none()).count();
        if open_ended != 1 {
            return Err(BillingError::InvalidTierSchedule(format!(
                "expected exactly one open-ended tier, found {}",
                open_ended
            )));
        }

        for pair in tiers.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            let Some(prev_max) = prev.max_licenses else {
                return Err(BillingError::InvalidTierSchedule(format!(
                    "open-ended tier starting at {} must be the last tier",
                    prev.min_licenses
                )));
            };
            if next.min_licenses <= prev_max {
                return Err(BillingError::InvalidTierSchedule(format!(
                    "tiers [{}, {}] and [{}, ..] overlap",
                    prev.min_licenses, prev_max, next.min_licenses
                )));
            }
            if next.min_licenses != prev_max + 1 {
                return Err(BillingError::InvalidTierSchedule(format!(
                    "gap between tier ending at {} and tier starting at {}",
                    prev_max, next.min_licenses
                )));
            }
        }

        Ok(Self { plan_id, tiers })
    }

    pub fn plan_id(&self) -> PlanId {
        self.plan_id
    }

    /// Tiers in ascending `min_licenses` order
    pub fn tiers(&self) -> &[PricingTier] {
        &self.tiers
    }

    /// Tier whose range contains `count`; counts below the first minimum
    /// resolve to the lowest tier
    pub fn tier_for(&self, count: i64) -> &PricingTier {
        let lowest = &self.tiers[0];
        if count < lowest.min_licenses {
            return lowest;
        }
        // Contiguity plus the open-ended last tier guarantee a match
        self.tiers
            .iter()
            .find(|t| t.contains(count))
            .unwrap_or(lowest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tier(plan_id: PlanId, min: i64, max: Option<i64>, cents: i64) -> PricingTier {
        PricingTier::new(plan_id, min, max, cents)
    }

    #[test]
    fn test_schedule_sorts_tiers() {
        let plan_id = PlanId::new();
        let schedule = TierSchedule::new(
            plan_id,
            vec![
                tier(plan_id, 20, None, 90),
                tier(plan_id, 10, Some(19), 100),
            ],
        )
        .unwrap();
        let mins: Vec<i64> = schedule.tiers().iter().map(|t| t.min_licenses).collect();
        assert_eq!(mins, vec![10, 20]);
    }

    #[test]
    fn test_schedule_rejects_overlap() {
        let plan_id = PlanId::new();
        let err = TierSchedule::new(
            plan_id,
            vec![
                tier(plan_id, 10, Some(20), 100),
                tier(plan_id, 20, None, 90),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, BillingError::InvalidTierSchedule(_)));
    }

    #[test]
    fn test_schedule_rejects_gap() {
        let plan_id = PlanId::new();
        let err = TierSchedule::new(
            plan_id,
            vec![
                tier(plan_id, 10, Some(19), 100),
                tier(plan_id, 25, None, 90),
            ],
        )
        .unwrap_err();
        assert!(err.to_string().contains("gap"));
    }

    #[test]
    fn test_schedule_requires_single_trailing_open_tier() {
        let plan_id = PlanId::new();
        assert!(TierSchedule::new(plan_id, vec![tier(plan_id, 0, Some(9), 100)]).is_err());
        assert!(TierSchedule::new(
            plan_id,
            vec![tier(plan_id, 0, None, 100), tier(plan_id, 10, None, 90)],
        )
        .is_err());
        assert!(TierSchedule::new(plan_id, vec![]).is_err());
    }

    #[test]
    fn test_schedule_rejects_foreign_tier() {
        let plan_id = PlanId::new();
        let other = PlanId::new();
        assert!(TierSchedule::new(plan_id, vec![tier(other, 0, None, 100)]).is_err());
    }

    #[test]
    fn test_tier_for_below_floor_uses_lowest() {
        let plan_id = PlanId::new();
        let schedule = TierSchedule::new(
            plan_id,
            vec![
                tier(plan_id, 10, Some(19), 100),
                tier(plan_id, 20, None, 90),
            ],
        )
        .unwrap();
        assert_eq!(schedule.tier_for(3).min_licenses, 10);
        assert_eq!(schedule.tier_for(19).min_licenses, 10);
        assert_eq!(schedule.tier_for(20).min_licenses, 20);
        assert_eq!(schedule.tier_for(10_000).min_licenses, 20);
    }

    #[test]
    fn test_plan_validation() {
        let mut plan = Plan {
            id: PlanId::new(),
            name: "Condo Basic".to_string(),
            plan_type: PlanType::SingleProperty,
            license_minimum: 10,
            license_limit: Some(100),
            allow_multiple_properties: false,
            allow_overage: false,
            pricing_mode: PricingMode::Flat,
            annual_discount_percentage: 10.0,
            is_active: true,
        };
        assert!(plan.validate().is_ok());

        plan.annual_discount_percentage = 120.0;
        assert!(plan.validate().is_err());

        plan.annual_discount_percentage = 0.0;
        plan.allow_multiple_properties = true;
        assert!(plan.validate().is_err());
    }
}

//! Tiered pricing
//!
//! Prices are integer cents. A plan's `TierSchedule` is evaluated in one of
//! two modes:
//!
//! - **flat**: the tier containing the license count prices every license
//! - **progressive**: bracket-style, like a tax schedule; each tier bills
//!   only the licenses that fall inside it
//!
//! A count below the first tier's minimum is billed at the first tier's rate
//! for the licenses actually used. There is no charge for the unused
//! capacity under the floor; the plan minimum is enforced by accounting,
//! not here.

use std::sync::Arc;

use condo_shared::types::{PlanId, PricingMode, SubscriptionId};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::plans::{Plan, TierSchedule};
use crate::store::LicenseStore;

// =============================================================================
// Annual pricing and promotions
// =============================================================================

/// Twelve months less the annual discount, never negative
pub fn calculate_annual_price(monthly_cents: i64, discount_percentage: f64) -> i64 {
    let yearly = (monthly_cents as f64) * 12.0;
    let discounted = yearly * (1.0 - discount_percentage / 100.0);
    discounted.round().max(0.0) as i64
}

/// How a promotion reduces a price
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PromotionDiscount {
    /// Percent off, 0-100
    Percentage { percent: f64 },
    /// Fixed amount off, in cents
    Fixed { amount_cents: i64 },
}

/// A promotional discount code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Promotion {
    pub code: String,
    pub discount: PromotionDiscount,
    pub is_active: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub valid_from: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub valid_until: Option<OffsetDateTime>,
}

impl Promotion {
    /// Always-valid promotion
    pub fn new(code: impl Into<String>, discount: PromotionDiscount) -> Self {
        Self {
            code: code.into(),
            discount,
            is_active: true,
            valid_from: None,
            valid_until: None,
        }
    }

    /// Active flag set and `at` inside the validity window
    pub fn is_active_at(&self, at: OffsetDateTime) -> bool {
        self.is_active
            && self.valid_from.map_or(true, |from| at >= from)
            && self.valid_until.map_or(true, |until| at <= until)
    }
}

/// Apply a promotion as of now
pub fn apply_promotion(base_cents: i64, promotion: &Promotion) -> i64 {
    apply_promotion_at(base_cents, promotion, OffsetDateTime::now_utc())
}

/// Apply a promotion as of `at`. Inactive promotions leave the price
/// unchanged; the result is never negative.
pub fn apply_promotion_at(base_cents: i64, promotion: &Promotion, at: OffsetDateTime) -> i64 {
    if !promotion.is_active_at(at) {
        return base_cents;
    }

    let discounted = match promotion.discount {
        PromotionDiscount::Percentage { percent } => {
            let percent = percent.max(0.0);
            ((base_cents as f64) * (1.0 - percent / 100.0)).round() as i64
        }
        PromotionDiscount::Fixed { amount_cents } => {
            base_cents.saturating_sub(amount_cents.max(0))
        }
    };
    discounted.max(0)
}

// =============================================================================
// Tier breakdown
// =============================================================================

/// Licenses billed at one tier's rate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLine {
    pub min_licenses: i64,
    pub max_licenses: Option<i64>,
    pub licenses: i64,
    pub price_per_license_cents: i64,
    pub subtotal_cents: i64,
}

/// Monthly price of a license count under a plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceBreakdown {
    pub plan_id: PlanId,
    pub pricing_mode: PricingMode,
    pub license_count: i64,
    pub lines: Vec<TierLine>,
    pub monthly_total_cents: i64,
}

fn price_overflow(license_count: i64) -> BillingError {
    BillingError::InvalidInput(format!(
        "price of {} licenses exceeds the representable amount",
        license_count
    ))
}

fn tier_line(tier: &crate::plans::PricingTier, licenses: i64) -> BillingResult<TierLine> {
    let subtotal_cents = licenses
        .checked_mul(tier.price_per_license_cents)
        .ok_or_else(|| price_overflow(licenses))?;
    Ok(TierLine {
        min_licenses: tier.min_licenses,
        max_licenses: tier.max_licenses,
        licenses,
        price_per_license_cents: tier.price_per_license_cents,
        subtotal_cents,
    })
}

/// Price `license_count` licenses against `schedule` in the plan's mode
pub fn get_price_breakdown(
    plan: &Plan,
    schedule: &TierSchedule,
    license_count: i64,
) -> BillingResult<PriceBreakdown> {
    if license_count < 0 {
        return Err(BillingError::InvalidInput(format!(
            "license count must be non-negative, got {}",
            license_count
        )));
    }
    if schedule.plan_id() != plan.id {
        return Err(BillingError::InvalidInput(format!(
            "tier schedule belongs to plan {}, not {}",
            schedule.plan_id(),
            plan.id
        )));
    }

    let lines = match plan.pricing_mode {
        PricingMode::Flat => vec![tier_line(
            schedule.tier_for(license_count),
            license_count,
        )?],
        PricingMode::Progressive => progressive_lines(schedule, license_count)?,
    };
    let monthly_total_cents = lines
        .iter()
        .try_fold(0i64, |total, line| total.checked_add(line.subtotal_cents))
        .ok_or_else(|| price_overflow(license_count))?;

    Ok(PriceBreakdown {
        plan_id: plan.id,
        pricing_mode: plan.pricing_mode,
        license_count,
        lines,
        monthly_total_cents,
    })
}

fn progressive_lines(
    schedule: &TierSchedule,
    license_count: i64,
) -> BillingResult<Vec<TierLine>> {
    let mut lines = Vec::new();
    let mut allocated = 0;

    for tier in schedule.tiers() {
        if allocated >= license_count {
            break;
        }
        let ceiling = tier
            .max_licenses
            .map_or(license_count, |max| max.min(license_count));
        let licenses = ceiling - allocated;
        if licenses <= 0 {
            continue;
        }
        lines.push(tier_line(tier, licenses)?);
        allocated = ceiling;
    }

    Ok(lines)
}

// =============================================================================
// Pricing Service
// =============================================================================

/// Priced view of a subscription's current consumption
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePreview {
    pub subscription_id: SubscriptionId,
    pub breakdown: PriceBreakdown,
    pub promotion_code: Option<String>,
    /// Monthly total after the promotion
    pub monthly_cents: i64,
    /// Annual price derived from `monthly_cents` and the plan's annual discount
    pub annual_cents: i64,
}

/// Loads plans and tiers from the store and prices them
pub struct PricingService<S: LicenseStore> {
    store: Arc<S>,
}

impl<S: LicenseStore> Clone for PricingService<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: LicenseStore> PricingService<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    async fn load_plan(&self, plan_id: PlanId) -> BillingResult<(Plan, TierSchedule)> {
        let plan = self
            .store
            .get_plan(plan_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Plan not found: {}", plan_id)))?;
        plan.validate()?;
        let tiers = self.store.get_pricing_tiers(plan_id).await?;
        let schedule = TierSchedule::new(plan_id, tiers)?;
        Ok((plan, schedule))
    }

    /// Monthly breakdown for an arbitrary license count
    pub async fn quote(&self, plan_id: PlanId, license_count: i64) -> BillingResult<PriceBreakdown> {
        let (plan, schedule) = self.load_plan(plan_id).await?;
        get_price_breakdown(&plan, &schedule, license_count)
    }

    /// Price a subscription's `used_licenses`, optionally with a promotion
    pub async fn price_preview(
        &self,
        subscription_id: SubscriptionId,
        promotion: Option<&Promotion>,
    ) -> BillingResult<PricePreview> {
        let subscription = self
            .store
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!("Subscription not found: {}", subscription_id))
            })?;
        let (plan, schedule) = self.load_plan(subscription.plan_id).await?;

        let breakdown = get_price_breakdown(&plan, &schedule, subscription.used_licenses)?;
        let monthly_cents = match promotion {
            Some(promotion) => apply_promotion(breakdown.monthly_total_cents, promotion),
            None => breakdown.monthly_total_cents,
        };
        let annual_cents = calculate_annual_price(monthly_cents, plan.annual_discount_percentage);

        tracing::debug!(
            subscription_id = %subscription_id,
            license_count = breakdown.license_count,
            monthly_cents,
            annual_cents,
            "Built price preview"
        );

        Ok(PricePreview {
            subscription_id,
            breakdown,
            promotion_code: promotion.map(|p| p.code.clone()),
            monthly_cents,
            annual_cents,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plans::PricingTier;
    use condo_shared::types::PlanType;
    use time::Duration;

    fn plan(mode: PricingMode) -> Plan {
        Plan {
            id: PlanId::new(),
            name: "Condomínio Pro".to_string(),
            plan_type: PlanType::MultiPropertyStandard,
            license_minimum: 10,
            license_limit: None,
            allow_multiple_properties: true,
            allow_overage: false,
            pricing_mode: mode,
            annual_discount_percentage: 10.0,
            is_active: true,
        }
    }

    /// [10,19]@100, [20,39]@90, [40,∞)@75
    fn schedule(plan: &Plan) -> TierSchedule {
        TierSchedule::new(
            plan.id,
            vec![
                PricingTier::new(plan.id, 10, Some(19), 100),
                PricingTier::new(plan.id, 20, Some(39), 90),
                PricingTier::new(plan.id, 40, None, 75),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_price_overflow_is_rejected() {
        let flat = plan(PricingMode::Flat);
        let open = TierSchedule::new(flat.id, vec![PricingTier::new(flat.id, 0, None, 100)])
            .unwrap();
        let err = get_price_breakdown(&flat, &open, i64::MAX / 10).unwrap_err();
        assert!(matches!(err, BillingError::InvalidInput(_)));

        let progressive = plan(PricingMode::Progressive);
        let open = TierSchedule::new(
            progressive.id,
            vec![PricingTier::new(progressive.id, 0, None, 100)],
        )
        .unwrap();
        assert!(matches!(
            get_price_breakdown(&progressive, &open, i64::MAX / 10),
            Err(BillingError::InvalidInput(_))
        ));

        // Each line fits, their sum does not
        let steep = TierSchedule::new(
            progressive.id,
            vec![
                PricingTier::new(progressive.id, 0, Some(4), i64::MAX / 5),
                PricingTier::new(progressive.id, 5, None, i64::MAX / 5),
            ],
        )
        .unwrap();
        assert!(matches!(
            get_price_breakdown(&progressive, &steep, 6),
            Err(BillingError::InvalidInput(_))
        ));
        assert!(get_price_breakdown(&progressive, &steep, 5).is_ok());
    }

    #[test]
    fn test_flat_tier_boundary() {
        let plan = plan(PricingMode::Flat);
        let schedule = schedule(&plan);

        let at_19 = get_price_breakdown(&plan, &schedule, 19).unwrap();
        assert_eq!(at_19.lines.len(), 1);
        assert_eq!(at_19.lines[0].price_per_license_cents, 100);
        assert_eq!(at_19.monthly_total_cents, 1_900);

        let at_20 = get_price_breakdown(&plan, &schedule, 20).unwrap();
        assert_eq!(at_20.lines[0].price_per_license_cents, 90);
        assert_eq!(at_20.monthly_total_cents, 1_800);
    }

    #[test]
    fn test_flat_below_first_tier_uses_lowest_rate() {
        let plan = plan(PricingMode::Flat);
        let schedule = schedule(&plan);
        let breakdown = get_price_breakdown(&plan, &schedule, 4).unwrap();
        assert_eq!(breakdown.lines[0].licenses, 4);
        assert_eq!(breakdown.monthly_total_cents, 400);
    }

    #[test]
    fn test_progressive_sums_brackets() {
        let plan = plan(PricingMode::Progressive);
        let schedule = schedule(&plan);

        // 19 @100 + 20 @90 + 6 @75
        let breakdown = get_price_breakdown(&plan, &schedule, 45).unwrap();
        let licenses: Vec<i64> = breakdown.lines.iter().map(|l| l.licenses).collect();
        assert_eq!(licenses, vec![19, 20, 6]);
        assert_eq!(breakdown.monthly_total_cents, 1_900 + 1_800 + 450);
        assert_eq!(
            breakdown.monthly_total_cents,
            breakdown.lines.iter().map(|l| l.subtotal_cents).sum::<i64>()
        );
    }

    #[test]
    fn test_progressive_is_monotonic_and_piecewise_linear() {
        let plan = plan(PricingMode::Progressive);
        let schedule = schedule(&plan);

        let totals: Vec<i64> = (0..=120)
            .map(|n| get_price_breakdown(&plan, &schedule, n).unwrap().monthly_total_cents)
            .collect();

        for n in 1..totals.len() {
            let step = totals[n] - totals[n - 1];
            assert!(step >= 0, "total decreased at {}", n);
            // Each added license costs the rate of the bracket it lands in
            let expected = schedule.tier_for(n as i64).price_per_license_cents;
            assert_eq!(step, expected, "marginal price at {}", n);
        }
    }

    #[test]
    fn test_progressive_below_floor_bills_first_rate() {
        let plan = plan(PricingMode::Progressive);
        let schedule = schedule(&plan);
        let breakdown = get_price_breakdown(&plan, &schedule, 3).unwrap();
        assert_eq!(breakdown.lines.len(), 1);
        assert_eq!(breakdown.monthly_total_cents, 300);

        let empty = get_price_breakdown(&plan, &schedule, 0).unwrap();
        assert!(empty.lines.is_empty());
        assert_eq!(empty.monthly_total_cents, 0);
    }

    #[test]
    fn test_breakdown_rejects_foreign_schedule_and_negative_count() {
        let plan = plan(PricingMode::Flat);
        let other = self::plan(PricingMode::Flat);
        let schedule = schedule(&other);
        assert!(matches!(
            get_price_breakdown(&plan, &schedule, 10),
            Err(BillingError::InvalidInput(_))
        ));
        assert!(get_price_breakdown(&other, &schedule, -1).is_err());
    }

    #[test]
    fn test_annual_price() {
        assert_eq!(calculate_annual_price(10_000, 10.0), 108_000);
        assert_eq!(calculate_annual_price(10_000, 100.0), 0);
        assert_eq!(calculate_annual_price(10_000, 0.0), 120_000);
        assert_eq!(calculate_annual_price(10_000, 150.0), 0);
    }

    #[test]
    fn test_promotion_never_negative() {
        for discount in [
            PromotionDiscount::Percentage { percent: 250.0 },
            PromotionDiscount::Percentage { percent: 100.0 },
            PromotionDiscount::Fixed {
                amount_cents: 1_000_000,
            },
            PromotionDiscount::Fixed { amount_cents: i64::MAX },
        ] {
            let promotion = Promotion::new("BIGSALE", discount);
            for base in [0, 1, 999, 50_000] {
                assert!(apply_promotion(base, &promotion) >= 0);
            }
        }
    }

    #[test]
    fn test_promotion_amounts() {
        let pct = Promotion::new("TEN", PromotionDiscount::Percentage { percent: 10.0 });
        assert_eq!(apply_promotion(10_000, &pct), 9_000);

        let fixed = Promotion::new("MINUS25", PromotionDiscount::Fixed { amount_cents: 2_500 });
        assert_eq!(apply_promotion(10_000, &fixed), 7_500);

        let negative = Promotion::new("ODD", PromotionDiscount::Fixed { amount_cents: -500 });
        assert_eq!(apply_promotion(10_000, &negative), 10_000);
    }

    #[test]
    fn test_inactive_promotion_leaves_price() {
        let now = OffsetDateTime::now_utc();
        let mut promotion = Promotion::new("OFF", PromotionDiscount::Percentage { percent: 50.0 });

        promotion.is_active = false;
        assert_eq!(apply_promotion_at(10_000, &promotion, now), 10_000);

        promotion.is_active = true;
        promotion.valid_from = Some(now + Duration::days(1));
        assert_eq!(apply_promotion_at(10_000, &promotion, now), 10_000);

        promotion.valid_from = Some(now - Duration::days(10));
        promotion.valid_until = Some(now - Duration::days(1));
        assert_eq!(apply_promotion_at(10_000, &promotion, now), 10_000);

        promotion.valid_until = Some(now + Duration::days(1));
        assert_eq!(apply_promotion_at(10_000, &promotion, now), 5_000);
    }
}

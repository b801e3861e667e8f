//! License accounting
//!
//! `used_licenses` is always re-derived from current unit state and never
//! incremented or decremented in place. That makes `recalculate` idempotent
//! and self-healing: whatever drift a subscription row has accumulated is
//! overwritten by the next derivation.
//!
//! Derivation:
//! - single-property plans count the units of `subscription.property_id`
//! - multi-property plans sum the units of every active link
//! - the plan minimum is applied when the subscription charges it

use std::sync::Arc;

use condo_shared::types::SubscriptionId;
use serde::{Deserialize, Serialize};

use crate::error::{BillingError, BillingResult};
use crate::fraction_counter::{count_billable_units_in, FractionCounter};
use crate::models::Subscription;
use crate::plans::Plan;
use crate::store::{LicenseStore, LicenseTx};

/// Floor consumption at the plan minimum when the subscription charges it
pub fn apply_minimum_charge(raw: i64, license_minimum: i64, charge_minimum: bool) -> i64 {
    if charge_minimum {
        raw.max(license_minimum)
    } else {
        raw
    }
}

/// Result of a capacity check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseAvailability {
    pub available: bool,
    /// Human-readable explanation when unavailable
    pub reason: Option<String>,
    pub used: i64,
    /// Total consumption the operation would lead to
    pub requested: i64,
    /// Effective limit, `None` when the plan is unlimited
    pub limit: Option<i64>,
}

impl LicenseAvailability {
    /// Convert a refusal into `InsufficientLicenseCapacity`
    pub fn into_result(self) -> BillingResult<Self> {
        match (self.available, self.limit) {
            (false, Some(limit)) => Err(BillingError::InsufficientLicenseCapacity {
                limit,
                requested: self.requested,
            }),
            _ => Ok(self),
        }
    }
}

/// Limit that applies to a subscription: the per-subscription snapshot when
/// present, otherwise the plan's. `None` when the plan is unlimited.
pub fn effective_limit(plan: &Plan, subscription: &Subscription) -> Option<i64> {
    if plan.is_unlimited() {
        return None;
    }
    subscription.license_limit.or(plan.license_limit)
}

/// Check whether a subscription may reach `prospective` licenses
pub fn check_capacity(
    plan: &Plan,
    subscription: &Subscription,
    prospective: i64,
) -> LicenseAvailability {
    let limit = effective_limit(plan, subscription);
    let available = match limit {
        None => true,
        Some(_) if subscription.allow_overage => true,
        Some(limit) => prospective <= limit,
    };

    let reason = if available {
        None
    } else {
        limit.map(|limit| {
            format!(
                "License limit of {} would be exceeded: operation requires {} licenses",
                limit, prospective
            )
        })
    };

    LicenseAvailability {
        available,
        reason,
        used: subscription.used_licenses,
        requested: prospective,
        limit,
    }
}

/// Before/after values of one recalculation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recalculation {
    pub subscription_id: SubscriptionId,
    pub previous: i64,
    pub current: i64,
}

impl Recalculation {
    pub fn changed(&self) -> bool {
        self.previous != self.current
    }
}

/// Derives and persists `used_licenses`
pub struct LicenseAccountingEngine<S: LicenseStore> {
    store: Arc<S>,
    counter: FractionCounter<S>,
}

impl<S: LicenseStore> Clone for LicenseAccountingEngine<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            counter: self.counter.clone(),
        }
    }
}

impl<S: LicenseStore> LicenseAccountingEngine<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            counter: FractionCounter::new(store.clone()),
            store,
        }
    }

    /// Re-derive, persist and return `used_licenses` in its own transaction
    pub async fn recalculate(&self, subscription_id: SubscriptionId) -> BillingResult<i64> {
        Ok(self.recalculate_detailed(subscription_id).await?.current)
    }

    /// Like `recalculate`, also reporting the value it replaced
    pub async fn recalculate_detailed(
        &self,
        subscription_id: SubscriptionId,
    ) -> BillingResult<Recalculation> {
        let mut tx = self.store.begin().await?;
        let result = self.recalculate_in(&mut tx, subscription_id).await?;
        tx.commit().await?;
        Ok(result)
    }

    /// Re-derive and persist `used_licenses` inside a caller-owned
    /// transaction. Takes the subscription row lock if not already held.
    pub async fn recalculate_in(
        &self,
        tx: &mut S::Tx,
        subscription_id: SubscriptionId,
    ) -> BillingResult<Recalculation> {
        let subscription = tx.lock_subscription(subscription_id).await?;
        let plan = tx.get_plan(subscription.plan_id).await?.ok_or_else(|| {
            BillingError::NotFound(format!("Plan not found: {}", subscription.plan_id))
        })?;

        let raw = self.raw_count_in(tx, &subscription, &plan).await?;
        let effective =
            apply_minimum_charge(raw, plan.license_minimum, subscription.charge_minimum);

        tx.set_used_licenses(subscription_id, effective).await?;

        let recalculation = Recalculation {
            subscription_id,
            previous: subscription.used_licenses,
            current: effective,
        };

        if recalculation.changed() {
            tracing::info!(
                subscription_id = %subscription_id,
                previous = recalculation.previous,
                used_licenses = effective,
                raw_units = raw,
                "Recalculated used licenses"
            );
        } else {
            tracing::debug!(
                subscription_id = %subscription_id,
                used_licenses = effective,
                "Used licenses unchanged"
            );
        }

        Ok(recalculation)
    }

    /// Units consumed before the plan minimum is applied
    pub async fn raw_count_in(
        &self,
        tx: &mut S::Tx,
        subscription: &Subscription,
        plan: &Plan,
    ) -> BillingResult<i64> {
        if plan.plan_type.is_single_property() {
            return match subscription.property_id {
                Some(property_id) => count_billable_units_in(tx, property_id).await,
                None => Ok(0),
            };
        }

        let links = tx.active_links(subscription.id).await?;
        let mut total = 0;
        for link in &links {
            total += count_billable_units_in(tx, link.property_id).await?;
        }
        Ok(total)
    }

    /// What `recalculate` would persist right now, without writing it
    pub async fn derive_used_licenses(
        &self,
        subscription: &Subscription,
        plan: &Plan,
    ) -> BillingResult<i64> {
        let raw = if plan.plan_type.is_single_property() {
            match subscription.property_id {
                Some(property_id) => self.counter.count_billable_units(property_id).await?,
                None => 0,
            }
        } else {
            let property_ids: Vec<_> = self
                .store
                .active_links(subscription.id)
                .await?
                .into_iter()
                .map(|l| l.property_id)
                .collect();
            self.counter.count_for_properties(&property_ids).await?
        };
        Ok(apply_minimum_charge(
            raw,
            plan.license_minimum,
            subscription.charge_minimum,
        ))
    }

    /// Whether `additional` licenses fit under the subscription's limit
    pub async fn validate_availability(
        &self,
        subscription_id: SubscriptionId,
        additional: i64,
    ) -> BillingResult<LicenseAvailability> {
        if additional < 0 {
            return Err(BillingError::InvalidInput(format!(
                "additional licenses must be non-negative, got {}",
                additional
            )));
        }

        let subscription = self
            .store
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!("Subscription not found: {}", subscription_id))
            })?;
        let plan = self.store.get_plan(subscription.plan_id).await?.ok_or_else(|| {
            BillingError::NotFound(format!("Plan not found: {}", subscription.plan_id))
        })?;

        let availability =
            check_capacity(&plan, &subscription, subscription.used_licenses + additional);

        if !availability.available {
            tracing::debug!(
                subscription_id = %subscription_id,
                used = availability.used,
                requested = availability.requested,
                limit = ?availability.limit,
                "License capacity unavailable"
            );
        }

        Ok(availability)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use condo_shared::types::{PlanId, PlanType, PricingMode, SubscriptionStatus};

    fn plan(limit: Option<i64>) -> Plan {
        Plan {
            id: PlanId::new(),
            name: "Gestão Plus".to_string(),
            plan_type: PlanType::MultiPropertyStandard,
            license_minimum: 10,
            license_limit: limit,
            allow_multiple_properties: true,
            allow_overage: false,
            pricing_mode: PricingMode::Flat,
            annual_discount_percentage: 0.0,
            is_active: true,
        }
    }

    fn subscription(plan: &Plan, used: i64, overage: bool) -> Subscription {
        Subscription {
            id: SubscriptionId::new(),
            plan_id: plan.id,
            status: SubscriptionStatus::Active,
            used_licenses: used,
            license_limit: plan.license_limit,
            allow_overage: overage,
            charge_minimum: true,
            property_id: None,
        }
    }

    #[test]
    fn test_apply_minimum_charge() {
        for raw in [0, 5, 10, 11, 500] {
            for minimum in [0, 1, 10, 100] {
                assert_eq!(apply_minimum_charge(raw, minimum, true), raw.max(minimum));
                assert_eq!(apply_minimum_charge(raw, minimum, false), raw);
            }
        }
    }

    #[test]
    fn test_capacity_unlimited_plan() {
        let plan = plan(None);
        let sub = subscription(&plan, 1_000, false);
        let availability = check_capacity(&plan, &sub, 1_000_000);
        assert!(availability.available);
        assert!(availability.limit.is_none());
    }

    #[test]
    fn test_capacity_at_and_over_limit() {
        let plan = plan(Some(50));
        let sub = subscription(&plan, 40, false);
        assert!(check_capacity(&plan, &sub, 50).available);

        let refused = check_capacity(&plan, &sub, 51);
        assert!(!refused.available);
        let reason = refused.reason.clone().unwrap();
        assert!(reason.contains("50"));
        assert!(reason.contains("51"));
        assert!(matches!(
            refused.into_result(),
            Err(BillingError::InsufficientLicenseCapacity {
                limit: 50,
                requested: 51
            })
        ));
    }

    #[test]
    fn test_capacity_overage_allowed() {
        let plan = plan(Some(200));
        let sub = subscription(&plan, 200, true);
        assert!(check_capacity(&plan, &sub, 210).available);
    }

    #[test]
    fn test_subscription_override_wins() {
        let plan = plan(Some(50));
        let mut sub = subscription(&plan, 0, false);
        sub.license_limit = Some(80);
        assert_eq!(effective_limit(&plan, &sub), Some(80));
        assert!(check_capacity(&plan, &sub, 75).available);

        sub.license_limit = None;
        assert_eq!(effective_limit(&plan, &sub), Some(50));
    }
}

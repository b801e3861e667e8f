//! Property attach/detach
//!
//! Each operation runs in one store transaction:
//!
//! 1. lock the subscription row
//! 2. validate plan rules and license capacity (no writes yet)
//! 3. write the link and property changes
//! 4. re-derive `used_licenses` in the same transaction
//! 5. commit
//!
//! Any error before commit drops the transaction, which rolls every write
//! back. Audit events are emitted only after commit and never fail the
//! operation.
//!
//! Link states are `active -> detached`; a detached link is terminal and a
//! re-attach inserts a new row. Property state moves `active <-> locked`.

use std::sync::Arc;

use condo_shared::types::{LinkId, PropertyId, SubscriptionId, SubscriptionStatus, UserId};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::accounting::{
    apply_minimum_charge, check_capacity, LicenseAccountingEngine, LicenseAvailability,
};
use crate::config::LicensingConfig;
use crate::error::{BillingError, BillingResult};
use crate::events::{
    record_best_effort, ActorType, AuditSink, LicenseEventBuilder, LicenseEventType,
};
use crate::fraction_counter::count_billable_units_in;
use crate::models::{Property, PropertySubscriptionLink, Subscription};
use crate::plans::Plan;
use crate::pricing::{PricePreview, PricingService, Promotion};
use crate::store::{LicenseStore, LicenseTx};

/// Result of a successful attach
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachOutcome {
    pub subscription_id: SubscriptionId,
    pub property_id: PropertyId,
    /// New link row; `None` for single-property plans
    pub link_id: Option<LinkId>,
    /// Billable units the property brought in
    pub candidate_units: i64,
    pub previous_used_licenses: i64,
    pub used_licenses: i64,
}

/// Result of a successful detach
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetachOutcome {
    pub subscription_id: SubscriptionId,
    pub property_id: PropertyId,
    pub link_id: LinkId,
    pub locked_reason: String,
    pub previous_used_licenses: i64,
    pub used_licenses: i64,
}

fn actor_type(actor_id: Option<UserId>) -> ActorType {
    match actor_id {
        Some(_) => ActorType::User,
        None => ActorType::System,
    }
}

/// Owns property membership of subscriptions
pub struct SubscriptionLifecycleManager<S: LicenseStore> {
    store: Arc<S>,
    engine: LicenseAccountingEngine<S>,
    pricing: PricingService<S>,
    audit: Arc<dyn AuditSink>,
    default_lock_reason: String,
}

impl<S: LicenseStore> SubscriptionLifecycleManager<S> {
    pub fn new(store: Arc<S>, audit: Arc<dyn AuditSink>, config: &LicensingConfig) -> Self {
        Self {
            engine: LicenseAccountingEngine::new(store.clone()),
            pricing: PricingService::new(store.clone()),
            store,
            audit,
            default_lock_reason: config.default_lock_reason.clone(),
        }
    }

    /// Attach a property to a subscription
    pub async fn attach_property(
        &self,
        subscription_id: SubscriptionId,
        property_id: PropertyId,
        actor_id: Option<UserId>,
    ) -> BillingResult<AttachOutcome> {
        let mut tx = self.store.begin().await?;

        let subscription = tx.lock_subscription(subscription_id).await?;
        let plan = Self::plan_for(&mut tx, &subscription).await?;
        let property = tx
            .lock_property(property_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Property not found: {}", property_id)))?;

        if let Err(e) = self
            .validate_attach(&mut tx, &subscription, &plan, &property)
            .await
        {
            tracing::warn!(
                subscription_id = %subscription_id,
                property_id = %property_id,
                error = %e,
                "Attach rejected"
            );
            return Err(e);
        }

        // Capacity is checked against what the recount will produce
        let candidate_units = count_billable_units_in(&mut tx, property_id).await?;
        let raw = if plan.plan_type.is_single_property() {
            candidate_units
        } else {
            self.engine.raw_count_in(&mut tx, &subscription, &plan).await? + candidate_units
        };
        let prospective =
            apply_minimum_charge(raw, plan.license_minimum, subscription.charge_minimum);

        let availability = check_capacity(&plan, &subscription, prospective);
        if !availability.available {
            drop(tx);
            return Err(self
                .reject_capacity(subscription_id, property_id, actor_id, availability)
                .await);
        }

        let now = OffsetDateTime::now_utc();
        let link_id = if plan.plan_type.is_single_property() {
            tx.set_subscription_property(subscription_id, Some(property_id))
                .await?;
            None
        } else {
            let link = PropertySubscriptionLink::active(subscription_id, property_id, actor_id, now);
            tx.insert_link(&link).await?;
            Some(link.id)
        };
        tx.assign_property(property_id, subscription_id).await?;

        let recalculation = self.engine.recalculate_in(&mut tx, subscription_id).await?;
        tx.commit().await?;

        tracing::info!(
            subscription_id = %subscription_id,
            property_id = %property_id,
            candidate_units,
            used_licenses = recalculation.current,
            "Property attached"
        );

        record_best_effort(
            self.audit.as_ref(),
            LicenseEventBuilder::new(subscription_id, LicenseEventType::PropertyAttached)
                .property(property_id)
                .actor_opt(actor_id, actor_type(actor_id))
                .data(serde_json::json!({
                    "link_id": link_id,
                    "candidate_units": candidate_units,
                    "previous_used_licenses": recalculation.previous,
                    "used_licenses": recalculation.current,
                })),
        )
        .await;

        Ok(AttachOutcome {
            subscription_id,
            property_id,
            link_id,
            candidate_units,
            previous_used_licenses: recalculation.previous,
            used_licenses: recalculation.current,
        })
    }

    /// Plan rules and ownership checks for attach; performs no writes
    async fn validate_attach(
        &self,
        tx: &mut S::Tx,
        subscription: &Subscription,
        plan: &Plan,
        property: &Property,
    ) -> BillingResult<()> {
        if subscription.status == SubscriptionStatus::Cancelled {
            return Err(BillingError::PlanConstraintViolation(format!(
                "Subscription {} is cancelled",
                subscription.id
            )));
        }

        if plan.plan_type.is_single_property() {
            if let Some(existing) = subscription.property_id {
                if existing != property.id {
                    return Err(BillingError::PlanConstraintViolation(format!(
                        "Single-property plan allows only one property; {} is already attached",
                        existing
                    )));
                }
            }
        } else {
            if !plan.allow_multiple_properties {
                return Err(BillingError::PlanConstraintViolation(format!(
                    "Plan {} does not allow multiple properties",
                    plan.name
                )));
            }
            let links = tx.active_links(subscription.id).await?;
            if links.iter().any(|l| l.property_id == property.id) {
                return Err(BillingError::PlanConstraintViolation(format!(
                    "Property {} is already attached to subscription {}",
                    property.id, subscription.id
                )));
            }
        }

        // A locked property was released by its previous owner
        if let Some(owner_id) = property.subscription_id {
            if owner_id != subscription.id && !property.is_locked() {
                let owner = tx.get_subscription(owner_id).await?;
                if owner.is_some_and(|o| o.status != SubscriptionStatus::Cancelled) {
                    return Err(BillingError::PlanConstraintViolation(format!(
                        "Property {} belongs to another active subscription",
                        property.id
                    )));
                }
            }
        }

        Ok(())
    }

    async fn reject_capacity(
        &self,
        subscription_id: SubscriptionId,
        property_id: PropertyId,
        actor_id: Option<UserId>,
        availability: LicenseAvailability,
    ) -> BillingError {
        tracing::warn!(
            subscription_id = %subscription_id,
            property_id = %property_id,
            used = availability.used,
            requested = availability.requested,
            limit = ?availability.limit,
            "Attach rejected: insufficient license capacity"
        );

        record_best_effort(
            self.audit.as_ref(),
            LicenseEventBuilder::new(subscription_id, LicenseEventType::CapacityRejected)
                .property(property_id)
                .actor_opt(actor_id, actor_type(actor_id))
                .data(serde_json::json!({
                    "used_licenses": availability.used,
                    "requested": availability.requested,
                    "limit": availability.limit,
                })),
        )
        .await;

        BillingError::InsufficientLicenseCapacity {
            limit: availability.limit.unwrap_or_default(),
            requested: availability.requested,
        }
    }

    /// Detach a property and lock it. `reason` defaults to the configured
    /// lock reason when absent or blank.
    pub async fn detach_property(
        &self,
        subscription_id: SubscriptionId,
        property_id: PropertyId,
        actor_id: Option<UserId>,
        reason: Option<&str>,
    ) -> BillingResult<DetachOutcome> {
        let mut tx = self.store.begin().await?;

        let subscription = tx.lock_subscription(subscription_id).await?;
        let plan = Self::plan_for(&mut tx, &subscription).await?;

        if plan.plan_type.is_single_property() {
            let err = if subscription.property_id == Some(property_id) {
                BillingError::LastPropertyViolation(format!(
                    "Property {} is the only property of subscription {}; cancel the subscription instead",
                    property_id, subscription_id
                ))
            } else {
                BillingError::NotFound(format!(
                    "Property {} is not attached to subscription {}",
                    property_id, subscription_id
                ))
            };
            tracing::warn!(
                subscription_id = %subscription_id,
                property_id = %property_id,
                error = %err,
                "Detach rejected"
            );
            return Err(err);
        }

        let links = tx.active_links(subscription_id).await?;
        let Some(link) = links.iter().find(|l| l.property_id == property_id) else {
            return Err(BillingError::NotFound(format!(
                "Property {} is not attached to subscription {}",
                property_id, subscription_id
            )));
        };
        if links.len() == 1 {
            tracing::warn!(
                subscription_id = %subscription_id,
                property_id = %property_id,
                "Detach rejected: last property"
            );
            return Err(BillingError::LastPropertyViolation(format!(
                "Property {} is the only property of subscription {}; cancel the subscription instead",
                property_id, subscription_id
            )));
        }
        let link_id = link.id;

        let locked_reason = reason
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or(self.default_lock_reason.as_str())
            .to_string();
        let now = OffsetDateTime::now_utc();

        tx.detach_link(link_id, now, actor_id, &locked_reason).await?;
        tx.mark_property_locked(property_id, &locked_reason, now)
            .await?;

        let recalculation = self.engine.recalculate_in(&mut tx, subscription_id).await?;
        tx.commit().await?;

        tracing::info!(
            subscription_id = %subscription_id,
            property_id = %property_id,
            used_licenses = recalculation.current,
            reason = %locked_reason,
            "Property detached and locked"
        );

        record_best_effort(
            self.audit.as_ref(),
            LicenseEventBuilder::new(subscription_id, LicenseEventType::PropertyDetached)
                .property(property_id)
                .actor_opt(actor_id, actor_type(actor_id))
                .data(serde_json::json!({
                    "link_id": link_id,
                    "reason": locked_reason,
                    "previous_used_licenses": recalculation.previous,
                    "used_licenses": recalculation.current,
                })),
        )
        .await;

        Ok(DetachOutcome {
            subscription_id,
            property_id,
            link_id,
            locked_reason,
            previous_used_licenses: recalculation.previous,
            used_licenses: recalculation.current,
        })
    }

    /// Re-derive `used_licenses`, recording an event when it moved
    pub async fn recalculate(&self, subscription_id: SubscriptionId) -> BillingResult<i64> {
        let recalculation = self.engine.recalculate_detailed(subscription_id).await?;

        if recalculation.changed() {
            record_best_effort(
                self.audit.as_ref(),
                LicenseEventBuilder::new(subscription_id, LicenseEventType::LicensesRecalculated)
                    .data(serde_json::json!({
                        "previous_used_licenses": recalculation.previous,
                        "used_licenses": recalculation.current,
                    })),
            )
            .await;
        }

        Ok(recalculation.current)
    }

    pub async fn validate_availability(
        &self,
        subscription_id: SubscriptionId,
        additional: i64,
    ) -> BillingResult<LicenseAvailability> {
        self.engine
            .validate_availability(subscription_id, additional)
            .await
    }

    /// Price the subscription's current consumption
    pub async fn price_preview(
        &self,
        subscription_id: SubscriptionId,
        promotion: Option<&Promotion>,
    ) -> BillingResult<PricePreview> {
        self.pricing.price_preview(subscription_id, promotion).await
    }

    async fn plan_for(tx: &mut S::Tx, subscription: &Subscription) -> BillingResult<Plan> {
        let plan = tx.get_plan(subscription.plan_id).await?.ok_or_else(|| {
            BillingError::NotFound(format!("Plan not found: {}", subscription.plan_id))
        })?;
        plan.validate()?;
        Ok(plan)
    }
}

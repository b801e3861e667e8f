//! In-memory license store (for tests and development without Postgres)
//!
//! A transaction takes the store-wide mutex for its whole lifetime and works
//! on a private copy of the state; `commit` swaps the copy in, dropping the
//! transaction discards it. That gives the same guarantees the Postgres store
//! gets from row locks: concurrent operations serialize and partial writes
//! are never visible.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use condo_shared::types::{
    LinkId, LinkStatus, PlanId, PropertyId, PropertySubscriptionStatus, SubscriptionId, UnitId,
    UserId,
};
use time::OffsetDateTime;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{LicenseStore, LicenseTx};
use crate::error::{BillingError, BillingResult};
use crate::models::{Property, PropertySubscriptionLink, Subscription, Unit};
use crate::plans::{Plan, PricingTier};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    plans: HashMap<PlanId, Plan>,
    tiers: HashMap<PlanId, Vec<PricingTier>>,
    subscriptions: HashMap<SubscriptionId, Subscription>,
    properties: HashMap<PropertyId, Property>,
    units: HashMap<UnitId, Unit>,
    links: Vec<PropertySubscriptionLink>,
}

impl MemoryState {
    fn count_billable_units(&self, property_id: PropertyId) -> i64 {
        self.units
            .values()
            .filter(|u| u.property_id == property_id && u.is_billable())
            .count() as i64
    }

    fn active_links(&self, subscription_id: SubscriptionId) -> Vec<PropertySubscriptionLink> {
        self.links
            .iter()
            .filter(|l| l.subscription_id == subscription_id && l.is_active())
            .cloned()
            .collect()
    }
}

/// Switches used by tests to simulate store failures
#[derive(Debug, Default)]
struct Faults {
    unavailable: AtomicBool,
    fail_license_writes: AtomicBool,
}

impl Faults {
    fn check_available(&self) -> BillingResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BillingError::StoreUnavailable(
                "in-memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

/// In-memory `LicenseStore`
#[derive(Clone, Default)]
pub struct InMemoryLicenseStore {
    state: Arc<Mutex<MemoryState>>,
    faults: Arc<Faults>,
}

impl InMemoryLicenseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every read, write and `begin` fail with `StoreUnavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make `set_used_licenses` fail, simulating a crash after the link
    /// and property rows were already written inside the transaction
    pub fn fail_license_writes(&self, fail: bool) {
        self.faults.fail_license_writes.store(fail, Ordering::SeqCst);
    }

    // ---------------------------------------------------------------------
    // Seeding and inspection
    // ---------------------------------------------------------------------

    pub async fn insert_plan(&self, plan: Plan) {
        self.state.lock().await.plans.insert(plan.id, plan);
    }

    pub async fn insert_tiers(&self, plan_id: PlanId, tiers: Vec<PricingTier>) {
        self.state.lock().await.tiers.insert(plan_id, tiers);
    }

    pub async fn insert_subscription(&self, subscription: Subscription) {
        self.state
            .lock()
            .await
            .subscriptions
            .insert(subscription.id, subscription);
    }

    pub async fn insert_property(&self, property: Property) {
        self.state
            .lock()
            .await
            .properties
            .insert(property.id, property);
    }

    pub async fn insert_unit(&self, unit: Unit) {
        self.state.lock().await.units.insert(unit.id, unit);
    }

    /// Add `count` billable units to a property, returning their ids
    pub async fn add_billable_units(&self, property_id: PropertyId, count: usize) -> Vec<UnitId> {
        let mut state = self.state.lock().await;
        (0..count)
            .map(|_| {
                let unit = Unit::billable(property_id);
                let id = unit.id;
                state.units.insert(id, unit);
                id
            })
            .collect()
    }

    /// Archive a unit so it no longer counts
    pub async fn archive_unit(&self, unit_id: UnitId) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        let unit = state
            .units
            .get_mut(&unit_id)
            .ok_or_else(|| BillingError::NotFound(format!("Unit not found: {}", unit_id)))?;
        unit.archived_at = Some(OffsetDateTime::now_utc());
        Ok(())
    }

    /// Insert a link row directly, bypassing lifecycle checks
    pub async fn insert_link(&self, link: PropertySubscriptionLink) {
        self.state.lock().await.links.push(link);
    }

    /// Overwrite `used_licenses` directly, bypassing the engine
    pub async fn force_used_licenses(&self, subscription_id: SubscriptionId, used_licenses: i64) {
        if let Some(sub) = self.state.lock().await.subscriptions.get_mut(&subscription_id) {
            sub.used_licenses = used_licenses;
        }
    }

    /// Every link of a subscription, active and detached
    pub async fn links_for(&self, subscription_id: SubscriptionId) -> Vec<PropertySubscriptionLink> {
        self.state
            .lock()
            .await
            .links
            .iter()
            .filter(|l| l.subscription_id == subscription_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl LicenseStore for InMemoryLicenseStore {
    type Tx = InMemoryLicenseTx;

    async fn begin(&self) -> BillingResult<Self::Tx> {
        self.faults.check_available()?;
        let guard = self.state.clone().lock_owned().await;
        let working = (*guard).clone();
        Ok(InMemoryLicenseTx {
            guard,
            working,
            faults: self.faults.clone(),
        })
    }

    async fn count_billable_units(&self, property_id: PropertyId) -> BillingResult<i64> {
        self.faults.check_available()?;
        Ok(self.state.lock().await.count_billable_units(property_id))
    }

    async fn get_subscription(&self, id: SubscriptionId) -> BillingResult<Option<Subscription>> {
        self.faults.check_available()?;
        Ok(self.state.lock().await.subscriptions.get(&id).cloned())
    }

    async fn get_plan(&self, id: PlanId) -> BillingResult<Option<Plan>> {
        self.faults.check_available()?;
        Ok(self.state.lock().await.plans.get(&id).cloned())
    }

    async fn get_pricing_tiers(&self, plan_id: PlanId) -> BillingResult<Vec<PricingTier>> {
        self.faults.check_available()?;
        Ok(self
            .state
            .lock()
            .await
            .tiers
            .get(&plan_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_property(&self, id: PropertyId) -> BillingResult<Option<Property>> {
        self.faults.check_available()?;
        Ok(self.state.lock().await.properties.get(&id).cloned())
    }

    async fn active_links(
        &self,
        subscription_id: SubscriptionId,
    ) -> BillingResult<Vec<PropertySubscriptionLink>> {
        self.faults.check_available()?;
        Ok(self.state.lock().await.active_links(subscription_id))
    }

    async fn all_active_links(&self) -> BillingResult<Vec<PropertySubscriptionLink>> {
        self.faults.check_available()?;
        Ok(self
            .state
            .lock()
            .await
            .links
            .iter()
            .filter(|l| l.is_active())
            .cloned()
            .collect())
    }

    async fn list_subscription_ids(&self) -> BillingResult<Vec<SubscriptionId>> {
        self.faults.check_available()?;
        let mut ids: Vec<SubscriptionId> =
            self.state.lock().await.subscriptions.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }
}

/// Transaction over a private copy of the in-memory state
pub struct InMemoryLicenseTx {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
    faults: Arc<Faults>,
}

impl InMemoryLicenseTx {
    fn subscription_mut(&mut self, id: SubscriptionId) -> BillingResult<&mut Subscription> {
        self.working
            .subscriptions
            .get_mut(&id)
            .ok_or_else(|| BillingError::NotFound(format!("Subscription not found: {}", id)))
    }

    fn property_mut(&mut self, id: PropertyId) -> BillingResult<&mut Property> {
        self.working
            .properties
            .get_mut(&id)
            .ok_or_else(|| BillingError::NotFound(format!("Property not found: {}", id)))
    }
}

#[async_trait]
impl LicenseTx for InMemoryLicenseTx {
    async fn lock_subscription(&mut self, id: SubscriptionId) -> BillingResult<Subscription> {
        self.faults.check_available()?;
        // The store-wide guard is already held; this only resolves the row
        self.working
            .subscriptions
            .get(&id)
            .cloned()
            .ok_or_else(|| BillingError::NotFound(format!("Subscription not found: {}", id)))
    }

    async fn get_subscription(&mut self, id: SubscriptionId) -> BillingResult<Option<Subscription>> {
        self.faults.check_available()?;
        Ok(self.working.subscriptions.get(&id).cloned())
    }

    async fn get_plan(&mut self, id: PlanId) -> BillingResult<Option<Plan>> {
        self.faults.check_available()?;
        Ok(self.working.plans.get(&id).cloned())
    }

    async fn lock_property(&mut self, id: PropertyId) -> BillingResult<Option<Property>> {
        self.faults.check_available()?;
        Ok(self.working.properties.get(&id).cloned())
    }

    async fn count_billable_units(&mut self, property_id: PropertyId) -> BillingResult<i64> {
        self.faults.check_available()?;
        Ok(self.working.count_billable_units(property_id))
    }

    async fn active_links(
        &mut self,
        subscription_id: SubscriptionId,
    ) -> BillingResult<Vec<PropertySubscriptionLink>> {
        self.faults.check_available()?;
        Ok(self.working.active_links(subscription_id))
    }

    async fn insert_link(&mut self, link: &PropertySubscriptionLink) -> BillingResult<()> {
        self.faults.check_available()?;
        // Mirrors the partial unique index on active links
        let duplicate = self.working.links.iter().any(|l| {
            l.is_active()
                && l.subscription_id == link.subscription_id
                && l.property_id == link.property_id
        });
        if duplicate && link.is_active() {
            return Err(BillingError::PlanConstraintViolation(format!(
                "Property {} already has an active link to subscription {}",
                link.property_id, link.subscription_id
            )));
        }
        self.working.links.push(link.clone());
        Ok(())
    }

    async fn detach_link(
        &mut self,
        link_id: LinkId,
        detached_at: OffsetDateTime,
        detached_by: Option<UserId>,
        reason: &str,
    ) -> BillingResult<()> {
        self.faults.check_available()?;
        let link = self
            .working
            .links
            .iter_mut()
            .find(|l| l.id == link_id && l.is_active())
            .ok_or_else(|| BillingError::NotFound(format!("Active link not found: {}", link_id)))?;
        link.status = LinkStatus::Detached;
        link.detached_at = Some(detached_at);
        link.detached_by = detached_by;
        link.detach_reason = Some(reason.to_string());
        Ok(())
    }

    async fn set_subscription_property(
        &mut self,
        subscription_id: SubscriptionId,
        property_id: Option<PropertyId>,
    ) -> BillingResult<()> {
        self.faults.check_available()?;
        self.subscription_mut(subscription_id)?.property_id = property_id;
        Ok(())
    }

    async fn set_used_licenses(
        &mut self,
        subscription_id: SubscriptionId,
        used_licenses: i64,
    ) -> BillingResult<()> {
        self.faults.check_available()?;
        if self.faults.fail_license_writes.load(Ordering::SeqCst) {
            return Err(BillingError::StoreUnavailable(
                "simulated failure writing used_licenses".to_string(),
            ));
        }
        self.subscription_mut(subscription_id)?.used_licenses = used_licenses;
        Ok(())
    }

    async fn assign_property(
        &mut self,
        property_id: PropertyId,
        subscription_id: SubscriptionId,
    ) -> BillingResult<()> {
        self.faults.check_available()?;
        let property = self.property_mut(property_id)?;
        property.subscription_id = Some(subscription_id);
        property.subscription_status = PropertySubscriptionStatus::Active;
        property.locked_at = None;
        property.locked_reason = None;
        Ok(())
    }

    async fn mark_property_locked(
        &mut self,
        property_id: PropertyId,
        reason: &str,
        locked_at: OffsetDateTime,
    ) -> BillingResult<()> {
        self.faults.check_available()?;
        let property = self.property_mut(property_id)?;
        property.subscription_status = PropertySubscriptionStatus::Locked;
        property.locked_at = Some(locked_at);
        property.locked_reason = Some(reason.to_string());
        Ok(())
    }

    async fn commit(self) -> BillingResult<()> {
        self.faults.check_available()?;
        let InMemoryLicenseTx {
            mut guard, working, ..
        } = self;
        *guard = working;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use condo_shared::types::{PlanType, PricingMode, SubscriptionStatus};

    async fn seeded() -> (InMemoryLicenseStore, SubscriptionId, PropertyId) {
        let store = InMemoryLicenseStore::new();
        let plan = Plan {
            id: PlanId::new(),
            name: "Multi".to_string(),
            plan_type: PlanType::MultiPropertyStandard,
            license_minimum: 0,
            license_limit: None,
            allow_multiple_properties: true,
            allow_overage: false,
            pricing_mode: PricingMode::Flat,
            annual_discount_percentage: 0.0,
            is_active: true,
        };
        let sub = Subscription {
            id: SubscriptionId::new(),
            plan_id: plan.id,
            status: SubscriptionStatus::Active,
            used_licenses: 0,
            license_limit: None,
            allow_overage: false,
            charge_minimum: false,
            property_id: None,
        };
        let property = Property::new("Edifício Aurora");
        let (sub_id, property_id) = (sub.id, property.id);
        store.insert_plan(plan).await;
        store.insert_subscription(sub).await;
        store.insert_property(property).await;
        (store, sub_id, property_id)
    }

    #[tokio::test]
    async fn test_commit_publishes_changes() {
        let (store, sub_id, _) = seeded().await;
        let mut tx = store.begin().await.unwrap();
        tx.set_used_licenses(sub_id, 42).await.unwrap();
        tx.commit().await.unwrap();

        let sub = store.get_subscription(sub_id).await.unwrap().unwrap();
        assert_eq!(sub.used_licenses, 42);
    }

    #[tokio::test]
    async fn test_drop_rolls_back() {
        let (store, sub_id, property_id) = seeded().await;
        {
            let mut tx = store.begin().await.unwrap();
            tx.set_used_licenses(sub_id, 42).await.unwrap();
            tx.mark_property_locked(property_id, "test", OffsetDateTime::now_utc())
                .await
                .unwrap();
        }

        let sub = store.get_subscription(sub_id).await.unwrap().unwrap();
        assert_eq!(sub.used_licenses, 0);
        let property = store.get_property(property_id).await.unwrap().unwrap();
        assert!(!property.is_locked());
    }

    #[tokio::test]
    async fn test_duplicate_active_link_rejected() {
        let (store, sub_id, property_id) = seeded().await;
        let mut tx = store.begin().await.unwrap();
        let now = OffsetDateTime::now_utc();
        tx.insert_link(&PropertySubscriptionLink::active(sub_id, property_id, None, now))
            .await
            .unwrap();
        let err = tx
            .insert_link(&PropertySubscriptionLink::active(sub_id, property_id, None, now))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::PlanConstraintViolation(_)));
    }

    #[tokio::test]
    async fn test_unavailable_store_surfaces_error() {
        let (store, _, property_id) = seeded().await;
        store.add_billable_units(property_id, 3).await;
        store.set_unavailable(true);
        assert!(matches!(
            store.count_billable_units(property_id).await,
            Err(BillingError::StoreUnavailable(_))
        ));
        store.set_unavailable(false);
        assert_eq!(store.count_billable_units(property_id).await.unwrap(), 3);
    }
}

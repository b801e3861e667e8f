//! Persistence boundary for license accounting
//!
//! Components receive a `LicenseStore` at construction time instead of
//! reaching for a process-wide handle. Every mutating lifecycle operation runs
//! inside one `LicenseTx`, which holds an exclusive lock on the subscription
//! row from `lock_subscription` until `commit`. Dropping a transaction without
//! committing rolls it back.
//!
//! Two implementations ship with the crate:
//! - [`PgLicenseStore`]: sqlx/Postgres, `SELECT ... FOR UPDATE` row locks
//! - [`InMemoryLicenseStore`]: for tests and local development

use async_trait::async_trait;
use condo_shared::types::{LinkId, PlanId, PropertyId, SubscriptionId, UserId};
use time::OffsetDateTime;

use crate::error::BillingResult;
use crate::models::{Property, PropertySubscriptionLink, Subscription};
use crate::plans::{Plan, PricingTier};

pub mod memory;
pub mod postgres;

pub use memory::{InMemoryLicenseStore, InMemoryLicenseTx};
pub use postgres::{PgLicenseStore, PgLicenseTx};

/// Read access plus the transaction entry point
#[async_trait]
pub trait LicenseStore: Send + Sync + 'static {
    type Tx: LicenseTx;

    /// Begin a transaction scoped to one lifecycle operation
    async fn begin(&self) -> BillingResult<Self::Tx>;

    /// Billable units (active, not archived, license-consuming) of a property
    async fn count_billable_units(&self, property_id: PropertyId) -> BillingResult<i64>;

    async fn get_subscription(&self, id: SubscriptionId) -> BillingResult<Option<Subscription>>;

    async fn get_plan(&self, id: PlanId) -> BillingResult<Option<Plan>>;

    async fn get_pricing_tiers(&self, plan_id: PlanId) -> BillingResult<Vec<PricingTier>>;

    async fn get_property(&self, id: PropertyId) -> BillingResult<Option<Property>>;

    /// Active links of one subscription
    async fn active_links(
        &self,
        subscription_id: SubscriptionId,
    ) -> BillingResult<Vec<PropertySubscriptionLink>>;

    /// Active links across every subscription (consistency checks)
    async fn all_active_links(&self) -> BillingResult<Vec<PropertySubscriptionLink>>;

    /// Every subscription id, for reconciliation sweeps
    async fn list_subscription_ids(&self) -> BillingResult<Vec<SubscriptionId>>;
}

/// Unit of work holding the subscription row lock
#[async_trait]
pub trait LicenseTx: Send {
    /// Load the subscription and take an exclusive lock on it for the rest of
    /// the transaction. Fails with `NotFound` for unknown ids.
    async fn lock_subscription(&mut self, id: SubscriptionId) -> BillingResult<Subscription>;

    /// Plain read of another subscription (no lock)
    async fn get_subscription(&mut self, id: SubscriptionId) -> BillingResult<Option<Subscription>>;

    async fn get_plan(&mut self, id: PlanId) -> BillingResult<Option<Plan>>;

    /// Load a property and lock its row so two subscriptions cannot claim it at once
    async fn lock_property(&mut self, id: PropertyId) -> BillingResult<Option<Property>>;

    async fn count_billable_units(&mut self, property_id: PropertyId) -> BillingResult<i64>;

    async fn active_links(
        &mut self,
        subscription_id: SubscriptionId,
    ) -> BillingResult<Vec<PropertySubscriptionLink>>;

    async fn insert_link(&mut self, link: &PropertySubscriptionLink) -> BillingResult<()>;

    /// Retire an active link; a retired link is never reactivated
    async fn detach_link(
        &mut self,
        link_id: LinkId,
        detached_at: OffsetDateTime,
        detached_by: Option<UserId>,
        reason: &str,
    ) -> BillingResult<()>;

    /// Single-property plans: set or clear `subscriptions.property_id`
    async fn set_subscription_property(
        &mut self,
        subscription_id: SubscriptionId,
        property_id: Option<PropertyId>,
    ) -> BillingResult<()>;

    async fn set_used_licenses(
        &mut self,
        subscription_id: SubscriptionId,
        used_licenses: i64,
    ) -> BillingResult<()>;

    /// Point the property at its owner, mark it active and clear any lock
    async fn assign_property(
        &mut self,
        property_id: PropertyId,
        subscription_id: SubscriptionId,
    ) -> BillingResult<()>;

    /// Mark the property locked (read-only to the rest of the system)
    async fn mark_property_locked(
        &mut self,
        property_id: PropertyId,
        reason: &str,
        locked_at: OffsetDateTime,
    ) -> BillingResult<()>;

    async fn commit(self) -> BillingResult<()>;
}

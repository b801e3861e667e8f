//! Postgres-backed license store
//!
//! Lifecycle transactions lock the subscription row with `SELECT ... FOR UPDATE`
//! before validating limits, so two administrators attaching properties to the
//! same subscription at once are serialized instead of both passing the limit
//! check against a stale `used_licenses`.

use async_trait::async_trait;
use condo_shared::types::{LinkId, PlanId, PropertyId, SubscriptionId, UserId};
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;

use super::{LicenseStore, LicenseTx};
use crate::error::{BillingError, BillingResult};
use crate::fraction_counter::COUNT_BILLABLE_UNITS_SQL;
use crate::models::{Property, PropertySubscriptionLink, Subscription};
use crate::plans::{Plan, PricingTier};

const SUBSCRIPTION_COLUMNS: &str = "id, plan_id, status, used_licenses, license_limit, \
     allow_overage, charge_minimum, property_id";

const PLAN_COLUMNS: &str = "id, name, plan_type, license_minimum, license_limit, \
     allow_multiple_properties, allow_overage, pricing_mode, annual_discount_percentage, is_active";

const PROPERTY_COLUMNS: &str =
    "id, name, subscription_id, subscription_status, locked_at, locked_reason";

const LINK_COLUMNS: &str = "id, subscription_id, property_id, status, attached_at, attached_by, \
     detached_at, detached_by, detach_reason";

/// `LicenseStore` over a sqlx Postgres pool
#[derive(Clone)]
pub struct PgLicenseStore {
    pool: PgPool,
}

impl PgLicenseStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl LicenseStore for PgLicenseStore {
    type Tx = PgLicenseTx;

    async fn begin(&self) -> BillingResult<Self::Tx> {
        let tx = self.pool.begin().await?;
        Ok(PgLicenseTx { tx })
    }

    async fn count_billable_units(&self, property_id: PropertyId) -> BillingResult<i64> {
        let count: i64 = sqlx::query_scalar(COUNT_BILLABLE_UNITS_SQL)
            .bind(property_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn get_subscription(&self, id: SubscriptionId) -> BillingResult<Option<Subscription>> {
        let sub: Option<Subscription> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(sub)
    }

    async fn get_plan(&self, id: PlanId) -> BillingResult<Option<Plan>> {
        let plan: Option<Plan> =
            sqlx::query_as(&format!("SELECT {} FROM plans WHERE id = $1", PLAN_COLUMNS))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(plan)
    }

    async fn get_pricing_tiers(&self, plan_id: PlanId) -> BillingResult<Vec<PricingTier>> {
        let tiers: Vec<PricingTier> = sqlx::query_as(
            r#"
            SELECT id, plan_id, min_licenses, max_licenses, price_per_license_cents, sort_order
            FROM pricing_tiers
            WHERE plan_id = $1
            ORDER BY min_licenses ASC, sort_order ASC
            "#,
        )
        .bind(plan_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(tiers)
    }

    async fn get_property(&self, id: PropertyId) -> BillingResult<Option<Property>> {
        let property: Option<Property> = sqlx::query_as(&format!(
            "SELECT {} FROM properties WHERE id = $1",
            PROPERTY_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(property)
    }

    async fn active_links(
        &self,
        subscription_id: SubscriptionId,
    ) -> BillingResult<Vec<PropertySubscriptionLink>> {
        let links: Vec<PropertySubscriptionLink> = sqlx::query_as(&format!(
            "SELECT {} FROM property_subscription_links
             WHERE subscription_id = $1 AND status = 'active'
             ORDER BY attached_at ASC",
            LINK_COLUMNS
        ))
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(links)
    }

    async fn all_active_links(&self) -> BillingResult<Vec<PropertySubscriptionLink>> {
        let links: Vec<PropertySubscriptionLink> = sqlx::query_as(&format!(
            "SELECT {} FROM property_subscription_links
             WHERE status = 'active'
             ORDER BY subscription_id, attached_at ASC",
            LINK_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(links)
    }

    async fn list_subscription_ids(&self) -> BillingResult<Vec<SubscriptionId>> {
        let ids: Vec<SubscriptionId> =
            sqlx::query_scalar("SELECT id FROM subscriptions ORDER BY id")
                .fetch_all(&self.pool)
                .await?;
        Ok(ids)
    }
}

/// Open Postgres transaction; dropping it without `commit` rolls back
pub struct PgLicenseTx {
    tx: Transaction<'static, Postgres>,
}

impl PgLicenseTx {
    fn expect_one_row(rows_affected: u64, what: String) -> BillingResult<()> {
        if rows_affected == 0 {
            return Err(BillingError::NotFound(what));
        }
        Ok(())
    }
}

#[async_trait]
impl LicenseTx for PgLicenseTx {
    async fn lock_subscription(&mut self, id: SubscriptionId) -> BillingResult<Subscription> {
        let sub: Option<Subscription> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE id = $1 FOR UPDATE",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        sub.ok_or_else(|| BillingError::NotFound(format!("Subscription not found: {}", id)))
    }

    async fn get_subscription(&mut self, id: SubscriptionId) -> BillingResult<Option<Subscription>> {
        let sub: Option<Subscription> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(sub)
    }

    async fn get_plan(&mut self, id: PlanId) -> BillingResult<Option<Plan>> {
        let plan: Option<Plan> =
            sqlx::query_as(&format!("SELECT {} FROM plans WHERE id = $1", PLAN_COLUMNS))
                .bind(id)
                .fetch_optional(&mut *self.tx)
                .await?;
        Ok(plan)
    }

    async fn lock_property(&mut self, id: PropertyId) -> BillingResult<Option<Property>> {
        let property: Option<Property> = sqlx::query_as(&format!(
            "SELECT {} FROM properties WHERE id = $1 FOR UPDATE",
            PROPERTY_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(property)
    }

    async fn count_billable_units(&mut self, property_id: PropertyId) -> BillingResult<i64> {
        let count: i64 = sqlx::query_scalar(COUNT_BILLABLE_UNITS_SQL)
            .bind(property_id)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(count)
    }

    async fn active_links(
        &mut self,
        subscription_id: SubscriptionId,
    ) -> BillingResult<Vec<PropertySubscriptionLink>> {
        let links: Vec<PropertySubscriptionLink> = sqlx::query_as(&format!(
            "SELECT {} FROM property_subscription_links
             WHERE subscription_id = $1 AND status = 'active'
             ORDER BY attached_at ASC",
            LINK_COLUMNS
        ))
        .bind(subscription_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(links)
    }

    async fn insert_link(&mut self, link: &PropertySubscriptionLink) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO property_subscription_links (
                id, subscription_id, property_id, status, attached_at, attached_by,
                detached_at, detached_by, detach_reason
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(link.id)
        .bind(link.subscription_id)
        .bind(link.property_id)
        .bind(link.status)
        .bind(link.attached_at)
        .bind(link.attached_by)
        .bind(link.detached_at)
        .bind(link.detached_by)
        .bind(&link.detach_reason)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn detach_link(
        &mut self,
        link_id: LinkId,
        detached_at: OffsetDateTime,
        detached_by: Option<UserId>,
        reason: &str,
    ) -> BillingResult<()> {
        // Only an active link can be retired
        let result = sqlx::query(
            r#"
            UPDATE property_subscription_links SET
                status = 'detached',
                detached_at = $1,
                detached_by = $2,
                detach_reason = $3
            WHERE id = $4 AND status = 'active'
            "#,
        )
        .bind(detached_at)
        .bind(detached_by)
        .bind(reason)
        .bind(link_id)
        .execute(&mut *self.tx)
        .await?;
        Self::expect_one_row(
            result.rows_affected(),
            format!("Active link not found: {}", link_id),
        )
    }

    async fn set_subscription_property(
        &mut self,
        subscription_id: SubscriptionId,
        property_id: Option<PropertyId>,
    ) -> BillingResult<()> {
        let result = sqlx::query(
            "UPDATE subscriptions SET property_id = $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(property_id)
        .bind(subscription_id)
        .execute(&mut *self.tx)
        .await?;
        Self::expect_one_row(
            result.rows_affected(),
            format!("Subscription not found: {}", subscription_id),
        )
    }

    async fn set_used_licenses(
        &mut self,
        subscription_id: SubscriptionId,
        used_licenses: i64,
    ) -> BillingResult<()> {
        let result = sqlx::query(
            "UPDATE subscriptions SET used_licenses = $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(used_licenses)
        .bind(subscription_id)
        .execute(&mut *self.tx)
        .await?;
        Self::expect_one_row(
            result.rows_affected(),
            format!("Subscription not found: {}", subscription_id),
        )
    }

    async fn assign_property(
        &mut self,
        property_id: PropertyId,
        subscription_id: SubscriptionId,
    ) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE properties SET
                subscription_id = $1,
                subscription_status = 'active',
                locked_at = NULL,
                locked_reason = NULL,
                updated_at = NOW()
            WHERE id = $2
            "#,
        )
        .bind(subscription_id)
        .bind(property_id)
        .execute(&mut *self.tx)
        .await?;
        Self::expect_one_row(
            result.rows_affected(),
            format!("Property not found: {}", property_id),
        )
    }

    async fn mark_property_locked(
        &mut self,
        property_id: PropertyId,
        reason: &str,
        locked_at: OffsetDateTime,
    ) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE properties SET
                subscription_status = 'locked',
                locked_at = $1,
                locked_reason = $2,
                updated_at = NOW()
            WHERE id = $3
            "#,
        )
        .bind(locked_at)
        .bind(reason)
        .bind(property_id)
        .execute(&mut *self.tx)
        .await?;
        Self::expect_one_row(
            result.rows_affected(),
            format!("Property not found: {}", property_id),
        )
    }

    async fn commit(self) -> BillingResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

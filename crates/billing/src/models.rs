//! Persistent records the license engine reads and writes

use condo_shared::types::{
    LinkId, LinkStatus, PlanId, PropertyId, PropertySubscriptionStatus, SubscriptionId,
    SubscriptionStatus, UnitId, UserId,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// A paying customer's subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub plan_id: PlanId,
    pub status: SubscriptionStatus,
    /// Derived by `LicenseAccountingEngine::recalculate`; never edited by hand
    pub used_licenses: i64,
    /// Snapshot of the plan limit, may be overridden per customer
    pub license_limit: Option<i64>,
    /// Snapshot of the plan overage policy
    pub allow_overage: bool,
    pub charge_minimum: bool,
    /// Only used by single-property plans
    pub property_id: Option<PropertyId>,
}

/// Association row between a multi-property subscription and a property
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PropertySubscriptionLink {
    pub id: LinkId,
    pub subscription_id: SubscriptionId,
    pub property_id: PropertyId,
    pub status: LinkStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub attached_at: OffsetDateTime,
    pub attached_by: Option<UserId>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub detached_at: Option<OffsetDateTime>,
    pub detached_by: Option<UserId>,
    pub detach_reason: Option<String>,
}

impl PropertySubscriptionLink {
    /// New active link stamped at `attached_at`
    pub fn active(
        subscription_id: SubscriptionId,
        property_id: PropertyId,
        attached_by: Option<UserId>,
        attached_at: OffsetDateTime,
    ) -> Self {
        Self {
            id: LinkId::new(),
            subscription_id,
            property_id,
            status: LinkStatus::Active,
            attached_at,
            attached_by,
            detached_at: None,
            detached_by: None,
            detach_reason: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == LinkStatus::Active
    }
}

/// A managed condominium property
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Property {
    pub id: PropertyId,
    pub name: String,
    /// Denormalized pointer to the current owner subscription
    pub subscription_id: Option<SubscriptionId>,
    pub subscription_status: PropertySubscriptionStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub locked_at: Option<OffsetDateTime>,
    pub locked_reason: Option<String>,
}

impl Property {
    /// Unowned, writable property
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: PropertyId::new(),
            name: name.into(),
            subscription_id: None,
            subscription_status: PropertySubscriptionStatus::Active,
            locked_at: None,
            locked_reason: None,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.subscription_status == PropertySubscriptionStatus::Locked
    }
}

/// A unit ("fraction") of a property, e.g. an apartment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Unit {
    pub id: UnitId,
    pub property_id: PropertyId,
    pub is_active: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub archived_at: Option<OffsetDateTime>,
    pub license_consumed: bool,
}

impl Unit {
    /// Active, non-archived, license-consuming unit
    pub fn billable(property_id: PropertyId) -> Self {
        Self {
            id: UnitId::new(),
            property_id,
            is_active: true,
            archived_at: None,
            license_consumed: true,
        }
    }

    /// Only active, non-archived, license-consuming units count
    pub fn is_billable(&self) -> bool {
        self.is_active && self.archived_at.is_none() && self.license_consumed
    }
}

//! License Events Module
//!
//! Append-only audit trail of license lifecycle operations. Events answer
//! "why is this subscription billed for N licenses?" and let support
//! reconstruct when a property was attached, detached or locked.
//!
//! Recording is best-effort: lifecycle operations emit events only after
//! their transaction has committed, and a failing sink is logged and
//! otherwise ignored.
//!
//! ## Event Types
//!
//! - Membership: property attached, property detached
//! - Accounting: licenses recalculated (only when the value changed)
//! - Capacity: attach rejected for lack of licenses

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use condo_shared::types::{PropertyId, SubscriptionId, UserId};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Types of license events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LicenseEventType {
    PropertyAttached,
    PropertyDetached,
    LicensesRecalculated,
    CapacityRejected,
}

impl std::fmt::Display for LicenseEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LicenseEventType::PropertyAttached => "PROPERTY_ATTACHED",
            LicenseEventType::PropertyDetached => "PROPERTY_DETACHED",
            LicenseEventType::LicensesRecalculated => "LICENSES_RECALCULATED",
            LicenseEventType::CapacityRejected => "CAPACITY_REJECTED",
        };
        write!(f, "{}", s)
    }
}

/// Who triggered the event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActorType {
    /// Property manager acting through the application
    User,
    /// Platform administrator
    Admin,
    /// Reconciliation job or other automation
    System,
}

impl std::fmt::Display for ActorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorType::User => write!(f, "user"),
            ActorType::Admin => write!(f, "admin"),
            ActorType::System => write!(f, "system"),
        }
    }
}

/// A license event record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct LicenseEvent {
    pub id: Uuid,
    pub subscription_id: SubscriptionId,
    pub property_id: Option<PropertyId>,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub actor_id: Option<UserId>,
    pub actor_type: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Builder for creating license events
pub struct LicenseEventBuilder {
    subscription_id: SubscriptionId,
    event_type: LicenseEventType,
    property_id: Option<PropertyId>,
    event_data: serde_json::Value,
    actor_id: Option<UserId>,
    actor_type: ActorType,
}

impl LicenseEventBuilder {
    /// Create a new event builder
    pub fn new(subscription_id: SubscriptionId, event_type: LicenseEventType) -> Self {
        Self {
            subscription_id,
            event_type,
            property_id: None,
            event_data: serde_json::json!({}),
            actor_id: None,
            actor_type: ActorType::System,
        }
    }

    pub fn property(mut self, property_id: PropertyId) -> Self {
        self.property_id = Some(property_id);
        self
    }

    /// Set the event data
    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.event_data = data;
        self
    }

    /// Set the actor with an optional user ID
    pub fn actor_opt(mut self, actor_id: Option<UserId>, actor_type: ActorType) -> Self {
        self.actor_id = actor_id;
        self.actor_type = actor_type;
        self
    }

    pub fn event_type(&self) -> LicenseEventType {
        self.event_type
    }

    /// Stamp the event with an id and the current time
    pub fn build(self) -> LicenseEvent {
        LicenseEvent {
            id: Uuid::new_v4(),
            subscription_id: self.subscription_id,
            property_id: self.property_id,
            event_type: self.event_type.to_string(),
            event_data: self.event_data,
            actor_id: self.actor_id,
            actor_type: self.actor_type.to_string(),
            created_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Destination for license events
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: LicenseEvent) -> BillingResult<()>;
}

/// Record an event, logging instead of propagating any failure
pub async fn record_best_effort(sink: &dyn AuditSink, builder: LicenseEventBuilder) {
    let event_type = builder.event_type();
    let event = builder.build();
    let subscription_id = event.subscription_id;
    if let Err(e) = sink.record(event).await {
        tracing::warn!(
            subscription_id = %subscription_id,
            event_type = %event_type,
            error = %e,
            "Failed to record license event"
        );
    }
}

/// Writes events to the `license_events` table
pub struct PgLicenseEventLogger {
    pool: PgPool,
}

impl PgLicenseEventLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get recent events for a subscription
    pub async fn get_events_for_subscription(
        &self,
        subscription_id: SubscriptionId,
        limit: i64,
    ) -> BillingResult<Vec<LicenseEvent>> {
        let events: Vec<LicenseEvent> = sqlx::query_as(
            r#"
            SELECT
                id,
                subscription_id,
                property_id,
                event_type,
                event_data,
                actor_id,
                actor_type,
                created_at
            FROM license_events
            WHERE subscription_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(subscription_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }
}

#[async_trait]
impl AuditSink for PgLicenseEventLogger {
    async fn record(&self, event: LicenseEvent) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO license_events (
                id,
                subscription_id,
                property_id,
                event_type,
                event_data,
                actor_id,
                actor_type,
                created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(event.id)
        .bind(event.subscription_id)
        .bind(event.property_id)
        .bind(&event.event_type)
        .bind(&event.event_data)
        .bind(event.actor_id)
        .bind(&event.actor_type)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Emits events as tracing records only
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: LicenseEvent) -> BillingResult<()> {
        tracing::info!(
            subscription_id = %event.subscription_id,
            event_type = %event.event_type,
            actor_type = %event.actor_type,
            data = %event.event_data,
            "License event"
        );
        Ok(())
    }
}

/// Keeps events in memory; can be switched to fail for tests
#[derive(Clone, Default)]
pub struct InMemoryAuditSink {
    events: Arc<Mutex<Vec<LicenseEvent>>>,
    failing: Arc<AtomicBool>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `record` call fail
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn events(&self) -> Vec<LicenseEvent> {
        self.events.lock().await.clone()
    }

    /// Recorded events of one type, oldest first
    pub async fn events_of(&self, event_type: LicenseEventType) -> Vec<LicenseEvent> {
        let wanted = event_type.to_string();
        self.events
            .lock()
            .await
            .iter()
            .filter(|e| e.event_type == wanted)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn record(&self, event: LicenseEvent) -> BillingResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BillingError::StoreUnavailable(
                "audit sink unavailable".to_string(),
            ));
        }
        self.events.lock().await.push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_display() {
        assert_eq!(
            LicenseEventType::PropertyAttached.to_string(),
            "PROPERTY_ATTACHED"
        );
        assert_eq!(
            LicenseEventType::LicensesRecalculated.to_string(),
            "LICENSES_RECALCULATED"
        );
        assert_eq!(ActorType::Admin.to_string(), "admin");
    }

    #[test]
    fn test_builder_defaults_to_system_actor() {
        let sub_id = SubscriptionId::new();
        let event = LicenseEventBuilder::new(sub_id, LicenseEventType::CapacityRejected).build();
        assert_eq!(event.subscription_id, sub_id);
        assert_eq!(event.actor_type, "system");
        assert!(event.actor_id.is_none());
        assert_eq!(event.event_data, serde_json::json!({}));
    }

    #[tokio::test]
    async fn test_best_effort_swallows_sink_failure() {
        let sink = InMemoryAuditSink::new();
        sink.set_failing(true);
        record_best_effort(
            &sink,
            LicenseEventBuilder::new(SubscriptionId::new(), LicenseEventType::PropertyAttached),
        )
        .await;
        assert!(sink.events().await.is_empty());

        sink.set_failing(false);
        record_best_effort(
            &sink,
            LicenseEventBuilder::new(SubscriptionId::new(), LicenseEventType::PropertyAttached)
                .actor_opt(Some(UserId::new()), ActorType::User),
        )
        .await;
        let recorded = sink.events_of(LicenseEventType::PropertyAttached).await;
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].actor_type, "user");
    }
}

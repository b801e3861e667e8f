// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Condominium License Accounting & Pricing
//!
//! Decides how many billable licenses (occupied units) a subscription
//! consumes across its properties, enforces plan attachment rules, and
//! prices the result under flat or progressive tier schedules.
//!
//! ## Features
//!
//! - **Unit Counting**: active, non-archived, license-consuming units per property
//! - **License Accounting**: idempotent re-derivation of `used_licenses` with plan minimums
//! - **Property Lifecycle**: transactional attach/detach with row locking and property locks
//! - **Pricing**: flat and progressive tier breakdowns, promotions, annual discounts
//! - **Audit Events**: best-effort license event trail
//! - **Invariants & Reconciliation**: read-only consistency checks and drift repair

pub mod accounting;
pub mod config;
pub mod error;
pub mod events;
pub mod fraction_counter;
pub mod invariants;
pub mod lifecycle;
pub mod models;
pub mod plans;
pub mod pricing;
pub mod reconcile;
pub mod store;

// Accounting
pub use accounting::{
    apply_minimum_charge, check_capacity, effective_limit, LicenseAccountingEngine,
    LicenseAvailability, Recalculation,
};

// Config
pub use config::{ConfigError, LicensingConfig, DEFAULT_LOCK_REASON};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{
    ActorType, AuditSink, InMemoryAuditSink, LicenseEvent, LicenseEventBuilder,
    LicenseEventType, PgLicenseEventLogger, TracingAuditSink,
};

// Fraction Counter
pub use fraction_counter::FractionCounter;

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Lifecycle
pub use lifecycle::{AttachOutcome, DetachOutcome, SubscriptionLifecycleManager};

// Models
pub use models::{Property, PropertySubscriptionLink, Subscription, Unit};

// Plans
pub use plans::{Plan, PricingTier, TierSchedule};

// Pricing
pub use pricing::{
    apply_promotion, apply_promotion_at, calculate_annual_price, get_price_breakdown,
    PriceBreakdown, PricePreview, PricingService, Promotion, PromotionDiscount, TierLine,
};

// Reconcile
pub use reconcile::{ReconcileResult, ReconcileSummary, Reconciler};

// Store
pub use store::{InMemoryLicenseStore, LicenseStore, LicenseTx, PgLicenseStore};

use std::sync::Arc;

use sqlx::PgPool;

/// Main licensing service that combines all components over one store
pub struct LicensingService<S: LicenseStore> {
    pub store: Arc<S>,
    pub engine: LicenseAccountingEngine<S>,
    pub lifecycle: SubscriptionLifecycleManager<S>,
    pub pricing: PricingService<S>,
    pub invariants: InvariantChecker<S>,
    pub reconciler: Reconciler<S>,
}

impl<S: LicenseStore> LicensingService<S> {
    /// Create a licensing service with explicit store, audit sink and config
    pub fn new(store: Arc<S>, audit: Arc<dyn AuditSink>, config: &LicensingConfig) -> Self {
        Self {
            engine: LicenseAccountingEngine::new(store.clone()),
            lifecycle: SubscriptionLifecycleManager::new(store.clone(), audit.clone(), config),
            pricing: PricingService::new(store.clone()),
            invariants: InvariantChecker::new(store.clone()),
            reconciler: Reconciler::new(store.clone(), audit),
            store,
        }
    }
}

impl LicensingService<PgLicenseStore> {
    /// Postgres-backed service writing audit events to `license_events`
    pub fn postgres(pool: PgPool, config: &LicensingConfig) -> Self {
        let audit: Arc<dyn AuditSink> = Arc::new(PgLicenseEventLogger::new(pool.clone()));
        Self::new(Arc::new(PgLicenseStore::new(pool)), audit, config)
    }
}

impl LicensingService<InMemoryLicenseStore> {
    /// In-memory service for tests and local development
    pub fn in_memory(config: &LicensingConfig) -> Self {
        Self::new(
            Arc::new(InMemoryLicenseStore::new()),
            Arc::new(TracingAuditSink),
            config,
        )
    }
}

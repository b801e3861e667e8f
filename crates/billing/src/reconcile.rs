//! Periodic license reconciliation
//!
//! Recalculation is a pure re-derivation, so reconciling is just calling it
//! for every subscription. Each subscription runs in its own transaction; a
//! failure on one is reported and the sweep moves on.

use std::sync::Arc;

use condo_shared::types::SubscriptionId;
use serde::{Deserialize, Serialize};

use crate::accounting::LicenseAccountingEngine;
use crate::error::BillingResult;
use crate::events::{
    record_best_effort, ActorType, AuditSink, LicenseEventBuilder, LicenseEventType,
};
use crate::store::LicenseStore;

/// Outcome of reconciling one subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ReconcileResult {
    Unchanged {
        subscription_id: SubscriptionId,
        used_licenses: i64,
    },
    Corrected {
        subscription_id: SubscriptionId,
        previous: i64,
        current: i64,
    },
    Error {
        subscription_id: SubscriptionId,
        error: String,
    },
}

/// Counts per outcome of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileSummary {
    pub unchanged: usize,
    pub corrected: usize,
    pub errors: usize,
}

impl ReconcileSummary {
    pub fn from_results(results: &[ReconcileResult]) -> Self {
        results.iter().fold(Self::default(), |mut acc, r| {
            match r {
                ReconcileResult::Unchanged { .. } => acc.unchanged += 1,
                ReconcileResult::Corrected { .. } => acc.corrected += 1,
                ReconcileResult::Error { .. } => acc.errors += 1,
            }
            acc
        })
    }
}

/// Re-derives `used_licenses` across all subscriptions
pub struct Reconciler<S: LicenseStore> {
    store: Arc<S>,
    engine: LicenseAccountingEngine<S>,
    audit: Arc<dyn AuditSink>,
}

impl<S: LicenseStore> Reconciler<S> {
    pub fn new(store: Arc<S>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            engine: LicenseAccountingEngine::new(store.clone()),
            store,
            audit,
        }
    }

    pub async fn subscription_ids(&self) -> BillingResult<Vec<SubscriptionId>> {
        self.store.list_subscription_ids().await
    }

    /// Recalculate one subscription, recording a correction event when the
    /// stored value had drifted
    pub async fn reconcile_subscription(
        &self,
        subscription_id: SubscriptionId,
    ) -> BillingResult<ReconcileResult> {
        let recalculation = self.engine.recalculate_detailed(subscription_id).await?;

        if !recalculation.changed() {
            return Ok(ReconcileResult::Unchanged {
                subscription_id,
                used_licenses: recalculation.current,
            });
        }

        tracing::warn!(
            subscription_id = %subscription_id,
            previous = recalculation.previous,
            current = recalculation.current,
            "Corrected drifted used_licenses"
        );
        record_best_effort(
            self.audit.as_ref(),
            LicenseEventBuilder::new(subscription_id, LicenseEventType::LicensesRecalculated)
                .actor_opt(None, ActorType::System)
                .data(serde_json::json!({
                    "source": "reconciliation",
                    "previous_used_licenses": recalculation.previous,
                    "used_licenses": recalculation.current,
                })),
        )
        .await;

        Ok(ReconcileResult::Corrected {
            subscription_id,
            previous: recalculation.previous,
            current: recalculation.current,
        })
    }

    /// Reconcile every subscription. Only listing failures abort the sweep.
    pub async fn reconcile_all(&self) -> BillingResult<Vec<ReconcileResult>> {
        let ids = self.subscription_ids().await?;
        let mut results = Vec::with_capacity(ids.len());

        for subscription_id in ids {
            let result = match self.reconcile_subscription(subscription_id).await {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!(
                        subscription_id = %subscription_id,
                        error = %e,
                        "Failed to reconcile subscription"
                    );
                    ReconcileResult::Error {
                        subscription_id,
                        error: e.to_string(),
                    }
                }
            };
            results.push(result);
        }

        let summary = ReconcileSummary::from_results(&results);
        tracing::info!(
            unchanged = summary.unchanged,
            corrected = summary.corrected,
            errors = summary.errors,
            "License reconciliation complete"
        );

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::InMemoryAuditSink;
    use crate::models::{Property, Subscription};
    use crate::plans::Plan;
    use crate::store::InMemoryLicenseStore;
    use condo_shared::types::{PlanId, PlanType, PricingMode, SubscriptionStatus};

    async fn single_property_subscription(
        store: &InMemoryLicenseStore,
        units: usize,
        used: i64,
    ) -> SubscriptionId {
        let plan = Plan {
            id: PlanId::new(),
            name: "Essencial".to_string(),
            plan_type: PlanType::SingleProperty,
            license_minimum: 0,
            license_limit: None,
            allow_multiple_properties: false,
            allow_overage: false,
            pricing_mode: PricingMode::Flat,
            annual_discount_percentage: 0.0,
            is_active: true,
        };
        let property = Property::new("Edifício Sol");
        let sub = Subscription {
            id: SubscriptionId::new(),
            plan_id: plan.id,
            status: SubscriptionStatus::Active,
            used_licenses: used,
            license_limit: None,
            allow_overage: false,
            charge_minimum: false,
            property_id: Some(property.id),
        };
        let sub_id = sub.id;
        store.add_billable_units(property.id, units).await;
        store.insert_plan(plan).await;
        store.insert_property(property).await;
        store.insert_subscription(sub).await;
        sub_id
    }

    #[tokio::test]
    async fn test_reconcile_corrects_drift_once() {
        let store = Arc::new(InMemoryLicenseStore::new());
        let sink = InMemoryAuditSink::new();
        let drifted = single_property_subscription(&store, 8, 3).await;
        let healthy = single_property_subscription(&store, 4, 4).await;

        let reconciler = Reconciler::new(store.clone(), Arc::new(sink.clone()));
        let results = reconciler.reconcile_all().await.unwrap();

        assert!(results.contains(&ReconcileResult::Corrected {
            subscription_id: drifted,
            previous: 3,
            current: 8,
        }));
        assert!(results.contains(&ReconcileResult::Unchanged {
            subscription_id: healthy,
            used_licenses: 4,
        }));
        assert_eq!(
            sink.events_of(LicenseEventType::LicensesRecalculated)
                .await
                .len(),
            1
        );

        // Second sweep finds nothing to fix
        let again = reconciler.reconcile_all().await.unwrap();
        let summary = ReconcileSummary::from_results(&again);
        assert_eq!(summary.corrected, 0);
        assert_eq!(summary.unchanged, 2);
    }

    #[tokio::test]
    async fn test_listing_failure_aborts_sweep() {
        let store = Arc::new(InMemoryLicenseStore::new());
        single_property_subscription(&store, 1, 1).await;
        store.set_unavailable(true);

        let reconciler = Reconciler::new(store, Arc::new(InMemoryAuditSink::new()));
        assert!(reconciler.reconcile_all().await.is_err());
    }
}

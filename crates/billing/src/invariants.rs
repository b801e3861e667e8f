//! License Invariants Module
//!
//! Read-only consistency checks over the license tables. They can be run
//! after a bulk import, a manual correction or a reconciliation sweep to
//! confirm that accounting and membership state agree.
//!
//! Checks never write. A `used_licenses` drift is reported here and fixed by
//! `Reconciler`, which simply recalculates.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use condo_shared::types::{PropertyId, SubscriptionId};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::accounting::LicenseAccountingEngine;
use crate::error::BillingResult;
use crate::models::{PropertySubscriptionLink, Subscription};
use crate::plans::Plan;
use crate::store::LicenseStore;

const CHECKS_RUN: usize = 5;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    pub subscription_ids: Vec<SubscriptionId>,
    pub property_id: Option<PropertyId>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Customer is being billed for the wrong number of licenses
    Critical,
    /// Membership data contradicts itself
    High,
    /// Worth investigating, billing unaffected
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    /// Overall health status
    pub healthy: bool,
}

/// Store snapshot the checks run against
struct Snapshot {
    subscriptions: Vec<(Subscription, Plan)>,
    links: Vec<PropertySubscriptionLink>,
}

/// Service for running license invariant checks
pub struct InvariantChecker<S: LicenseStore> {
    store: Arc<S>,
    engine: LicenseAccountingEngine<S>,
}

impl<S: LicenseStore> InvariantChecker<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            engine: LicenseAccountingEngine::new(store.clone()),
            store,
        }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let snapshot = self.snapshot().await?;
        let mut violations = Vec::new();

        violations.extend(self.check_used_licenses_match(&snapshot).await?);
        violations.extend(Self::check_single_owner_per_property(&snapshot));
        violations.extend(Self::check_single_property_has_no_links(&snapshot));
        violations.extend(self.check_linked_properties_consistent(&snapshot).await?);
        violations.extend(Self::check_live_subscription_has_property(&snapshot));

        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<HashSet<_>>()
            .len();
        let checks_passed = CHECKS_RUN - checks_failed;

        if violations.is_empty() {
            tracing::info!(checks_run = CHECKS_RUN, "License invariants hold");
        } else {
            tracing::warn!(
                checks_failed,
                violations = violations.len(),
                "License invariant violations found"
            );
        }

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run: CHECKS_RUN,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    async fn snapshot(&self) -> BillingResult<Snapshot> {
        let mut plans: HashMap<_, Plan> = HashMap::new();
        let mut subscriptions = Vec::new();

        for id in self.store.list_subscription_ids().await? {
            let Some(subscription) = self.store.get_subscription(id).await? else {
                continue;
            };
            let plan = match plans.get(&subscription.plan_id) {
                Some(plan) => plan.clone(),
                None => match self.store.get_plan(subscription.plan_id).await? {
                    Some(plan) => {
                        plans.insert(plan.id, plan.clone());
                        plan
                    }
                    None => {
                        tracing::warn!(
                            subscription_id = %id,
                            plan_id = %subscription.plan_id,
                            "Subscription references a missing plan"
                        );
                        continue;
                    }
                },
            };
            subscriptions.push((subscription, plan));
        }

        Ok(Snapshot {
            subscriptions,
            links: self.store.all_active_links().await?,
        })
    }

    /// Invariant 1: stored `used_licenses` equals a fresh derivation
    async fn check_used_licenses_match(
        &self,
        snapshot: &Snapshot,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let mut violations = Vec::new();
        for (subscription, plan) in &snapshot.subscriptions {
            let expected = self.engine.derive_used_licenses(subscription, plan).await?;
            if expected != subscription.used_licenses {
                violations.push(InvariantViolation {
                    invariant: "used_licenses_match_units".to_string(),
                    subscription_ids: vec![subscription.id],
                    property_id: None,
                    description: format!(
                        "Subscription stores {} used licenses but units derive {}",
                        subscription.used_licenses, expected
                    ),
                    context: serde_json::json!({
                        "stored": subscription.used_licenses,
                        "derived": expected,
                    }),
                    severity: ViolationSeverity::Critical,
                });
            }
        }
        Ok(violations)
    }

    /// Invariant 2: a property is actively linked to at most one subscription
    fn check_single_owner_per_property(snapshot: &Snapshot) -> Vec<InvariantViolation> {
        let mut owners: HashMap<PropertyId, Vec<SubscriptionId>> = HashMap::new();
        for link in &snapshot.links {
            owners
                .entry(link.property_id)
                .or_default()
                .push(link.subscription_id);
        }

        let mut violations: Vec<InvariantViolation> = owners
            .into_iter()
            .filter(|(_, subs)| subs.len() > 1)
            .map(|(property_id, mut subs)| {
                subs.sort();
                InvariantViolation {
                    invariant: "single_owner_per_property".to_string(),
                    description: format!(
                        "Property has {} active links (expected at most 1)",
                        subs.len()
                    ),
                    context: serde_json::json!({ "active_links": subs.len() }),
                    subscription_ids: subs,
                    property_id: Some(property_id),
                    severity: ViolationSeverity::High,
                }
            })
            .collect();
        violations.sort_by_key(|v| v.property_id);
        violations
    }

    /// Invariant 3: single-property subscriptions do not use the link table
    fn check_single_property_has_no_links(snapshot: &Snapshot) -> Vec<InvariantViolation> {
        snapshot
            .subscriptions
            .iter()
            .filter(|(_, plan)| plan.plan_type.is_single_property())
            .filter_map(|(subscription, _)| {
                let count = snapshot
                    .links
                    .iter()
                    .filter(|l| l.subscription_id == subscription.id)
                    .count();
                (count > 0).then(|| InvariantViolation {
                    invariant: "single_property_has_no_links".to_string(),
                    subscription_ids: vec![subscription.id],
                    property_id: None,
                    description: format!(
                        "Single-property subscription has {} active links",
                        count
                    ),
                    context: serde_json::json!({ "active_links": count }),
                    severity: ViolationSeverity::Medium,
                })
            })
            .collect()
    }

    /// Invariant 4: an actively linked property points back at its
    /// subscription and is not locked
    async fn check_linked_properties_consistent(
        &self,
        snapshot: &Snapshot,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let mut violations = Vec::new();
        for link in &snapshot.links {
            let Some(property) = self.store.get_property(link.property_id).await? else {
                violations.push(InvariantViolation {
                    invariant: "linked_property_consistent".to_string(),
                    subscription_ids: vec![link.subscription_id],
                    property_id: Some(link.property_id),
                    description: "Active link references a missing property".to_string(),
                    context: serde_json::json!({ "link_id": link.id }),
                    severity: ViolationSeverity::High,
                });
                continue;
            };

            if !property.subscription_status.is_writable()
                || property.subscription_id != Some(link.subscription_id)
            {
                violations.push(InvariantViolation {
                    invariant: "linked_property_consistent".to_string(),
                    subscription_ids: vec![link.subscription_id],
                    property_id: Some(property.id),
                    description: format!(
                        "Linked property '{}' is {} and points at {:?}",
                        property.name,
                        property.subscription_status,
                        property.subscription_id.map(|id| id.to_string())
                    ),
                    context: serde_json::json!({
                        "link_id": link.id,
                        "property_status": property.subscription_status.to_string(),
                        "property_subscription_id": property.subscription_id,
                    }),
                    severity: ViolationSeverity::High,
                });
            }
        }
        Ok(violations)
    }

    /// Invariant 5: live multi-property subscriptions keep at least one property
    fn check_live_subscription_has_property(snapshot: &Snapshot) -> Vec<InvariantViolation> {
        let linked: HashSet<SubscriptionId> =
            snapshot.links.iter().map(|l| l.subscription_id).collect();

        snapshot
            .subscriptions
            .iter()
            .filter(|(sub, plan)| {
                !plan.plan_type.is_single_property()
                    && sub.status.is_live()
                    && !linked.contains(&sub.id)
            })
            .map(|(sub, _)| InvariantViolation {
                invariant: "live_subscription_has_property".to_string(),
                subscription_ids: vec![sub.id],
                property_id: None,
                description: format!("Live subscription ({}) has no attached property", sub.status),
                context: serde_json::json!({ "status": sub.status.to_string() }),
                severity: ViolationSeverity::Low,
            })
            .collect()
    }
}

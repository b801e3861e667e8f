//! Billable unit counting
//!
//! A unit ("fraction") consumes a license only while it is active, not
//! archived and flagged `license_consumed`. The counter is a pure read; a
//! store failure is reported as `StoreUnavailable`, never as zero units.

use std::sync::Arc;

use condo_shared::types::PropertyId;

use crate::error::BillingResult;
use crate::store::{LicenseStore, LicenseTx};

/// Billable-unit predicate shared by the Postgres store and the checks in
/// `invariants`
pub(crate) const COUNT_BILLABLE_UNITS_SQL: &str = r#"
    SELECT COUNT(*)
    FROM units
    WHERE property_id = $1
      AND is_active = true
      AND archived_at IS NULL
      AND license_consumed = true
"#;

/// Count billable units through an open transaction, so the count sees the
/// transaction's own writes and does not contend with the lock it holds
pub async fn count_billable_units_in<T: LicenseTx>(
    tx: &mut T,
    property_id: PropertyId,
) -> BillingResult<i64> {
    let count = tx.count_billable_units(property_id).await?;
    tracing::debug!(property_id = %property_id, count, "Counted billable units");
    Ok(count)
}

/// Counts license-consuming units per property
pub struct FractionCounter<S: LicenseStore> {
    store: Arc<S>,
}

impl<S: LicenseStore> Clone for FractionCounter<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: LicenseStore> FractionCounter<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Number of billable units of `property_id`; 0 when it has none
    pub async fn count_billable_units(&self, property_id: PropertyId) -> BillingResult<i64> {
        let count = self
            .store
            .count_billable_units(property_id)
            .await
            .inspect_err(|e| {
                tracing::warn!(
                    property_id = %property_id,
                    error = %e,
                    "Failed to count billable units"
                );
            })?;

        tracing::debug!(property_id = %property_id, count, "Counted billable units");
        Ok(count)
    }

    /// Sum of billable units over several properties
    pub async fn count_for_properties(&self, property_ids: &[PropertyId]) -> BillingResult<i64> {
        let mut total = 0;
        for property_id in property_ids {
            total += self.count_billable_units(*property_id).await?;
        }
        Ok(total)
    }
}

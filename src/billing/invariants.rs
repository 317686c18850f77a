//! Consistency checks for license batches.
//!
//! Used by tests and by the reconciliation report. A batch is consistent when
//! its counters match its license rows.

use serde::Serialize;
use uuid::Uuid;

use super::error::{BillingError, BillingResult};
use super::storage::BillingStore;
use super::types::{LicenseBatch, SubscriptionStatus};

/// Counters of a batch next to what its license rows say.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub batch_id: Uuid,
    pub total_quantity: i32,
    pub license_count: i32,
    pub assigned_quantity: i32,
    pub assigned_license_count: i32,
    /// Pooled licenses with a holder, or assigned ones without.
    pub mismatched_licenses: Vec<Uuid>,
}

impl BatchReport {
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.total_quantity == self.license_count
            && self.assigned_quantity == self.assigned_license_count
            && self.mismatched_licenses.is_empty()
    }
}

fn counts_as_assigned(status: SubscriptionStatus) -> bool {
    matches!(status, SubscriptionStatus::Active | SubscriptionStatus::Assigned)
}

fn is_pooled(status: SubscriptionStatus) -> bool {
    matches!(status, SubscriptionStatus::Unassigned | SubscriptionStatus::PendingPayment)
}

/// Compare one batch against its licenses.
pub async fn check_batch(store: &dyn BillingStore, batch_id: Uuid) -> BillingResult<BatchReport> {
    let batch = store
        .get_batch(batch_id)
        .await?
        .ok_or_else(|| BillingError::BatchNotFound {
            id: batch_id.to_string(),
        })?;
    report(store, &batch).await
}

async fn report(store: &dyn BillingStore, batch: &LicenseBatch) -> BillingResult<BatchReport> {
    let licenses = store.list_batch_licenses(batch.id).await?;
    let assigned = licenses.iter().filter(|l| counts_as_assigned(l.status)).count();
    let mismatched = licenses
        .iter()
        .filter(|l| {
            let held = l.user_id().is_some();
            (counts_as_assigned(l.status) && !held) || (is_pooled(l.status) && held)
        })
        .map(|l| l.id)
        .collect();

    Ok(BatchReport {
        batch_id: batch.id,
        total_quantity: batch.total_quantity,
        license_count: licenses.len() as i32,
        assigned_quantity: batch.assigned_quantity,
        assigned_license_count: assigned as i32,
        mismatched_licenses: mismatched,
    })
}

/// Reports for every batch that is not consistent.
pub async fn inconsistent_batches(store: &dyn BillingStore) -> BillingResult<Vec<BatchReport>> {
    let mut broken = Vec::new();
    for batch in store.list_batches().await? {
        let report = report(store, &batch).await?;
        if !report.is_consistent() {
            tracing::warn!(
                target: "tollgate::billing::invariants",
                batch_id = %batch.id,
                total = report.total_quantity,
                licenses = report.license_count,
                assigned = report.assigned_quantity,
                assigned_licenses = report.assigned_license_count,
                "License batch is inconsistent"
            );
            broken.push(report);
        }
    }
    Ok(broken)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::bulk::new_batch;
    use crate::billing::storage::test::InMemoryBillingStore;
    use crate::billing::types::BatchStatus;
    use chrono::Utc;

    #[tokio::test]
    async fn test_detects_counter_drift() {
        let store = InMemoryBillingStore::new();
        let now = Utc::now();
        let (mut batch, licenses) = new_batch(
            "buyer",
            Uuid::new_v4(),
            3,
            None,
            BatchStatus::Active,
            (now, now),
            now,
        );
        store.insert_batch_with_licenses(&batch, &licenses).await.unwrap();
        assert!(check_batch(&store, batch.id).await.unwrap().is_consistent());

        batch.assigned_quantity = 2;
        store.update_batch(&batch).await.unwrap();
        let report = check_batch(&store, batch.id).await.unwrap();
        assert!(!report.is_consistent());
        assert_eq!(report.assigned_license_count, 0);
        assert_eq!(inconsistent_batches(&store).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_claims_keep_batch_consistent() {
        let store = InMemoryBillingStore::new();
        let now = Utc::now();
        let (batch, licenses) = new_batch(
            "buyer",
            Uuid::new_v4(),
            10,
            None,
            BatchStatus::Active,
            (now, now),
            now,
        );
        store.insert_batch_with_licenses(&batch, &licenses).await.unwrap();

        // Interleave claims, releases and resizes and check after each step
        let mut claimed = Vec::new();
        for step in 0..30 {
            match step % 5 {
                0 | 1 | 2 => {
                    if let Ok(license) = store
                        .claim_unassigned_license(batch.id, &format!("u{}", step), now)
                        .await
                    {
                        claimed.push(license.id);
                    }
                }
                3 => {
                    if let Some(id) = claimed.pop() {
                        store.release_license(id, now).await.unwrap();
                    }
                }
                _ => {
                    let current = store.get_batch(batch.id).await.unwrap().unwrap();
                    let target = (current.assigned_quantity + (step % 3)).max(1);
                    store.resize_batch(batch.id, target, now).await.unwrap();
                }
            }
            let report = check_batch(&store, batch.id).await.unwrap();
            assert!(report.is_consistent(), "step {}: {:?}", step, report);
        }
    }
}

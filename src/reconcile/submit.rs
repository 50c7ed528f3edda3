use std::time::Instant;

use super::planner::{ReconcileMode, ReconciliationPlan};
use crate::storage::{CollectionStore, FolderId, StoreError};

/// Outcome of an applied plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitReceipt {
    pub mode: ReconcileMode,
    pub folder_id: FolderId,
    pub folder_name: String,
    pub created_folder: bool,
    pub features_put: usize,
    pub features_deleted: usize,
}

/// Applies `plan` to `store` as a single transaction.
///
/// The plan is consumed whether or not the transaction succeeds. Store errors
/// are returned as-is and never retried.
pub async fn submit(
    store: &dyn CollectionStore,
    plan: ReconciliationPlan,
) -> Result<SubmitReceipt, StoreError> {
    let receipt = SubmitReceipt {
        mode: plan.mode,
        folder_id: plan.folder_to_put.id,
        folder_name: plan.folder_to_put.name.clone(),
        created_folder: plan.creates_folder,
        features_put: plan.features_to_put.len(),
        features_deleted: plan.feature_ids_to_delete.len(),
    };

    let start = Instant::now();
    match store.transact(plan.into_transaction()).await {
        Ok(()) => {
            tracing::info!(
                mode = %receipt.mode,
                folder = %receipt.folder_name,
                put = receipt.features_put,
                deleted = receipt.features_deleted,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Applied reconciliation plan"
            );
            Ok(receipt)
        }
        Err(e) => {
            tracing::warn!(
                mode = %receipt.mode,
                folder = %receipt.folder_name,
                error = %e,
                "Store rejected reconciliation plan"
            );
            Err(e)
        }
    }
}

use std::collections::HashMap;

use super::schema::Database;
use super::types::{
    parse_id, ChangeRecord, ChangeRow, FeatureId, FeatureRow, Folder, FolderId, FolderRow,
    ManagedFeature, StoreError,
};

/// Maximum number of features returned by a single folder read (OOM protection)
const MAX_FEATURES: i64 = 50_000;

/// Maximum number of change log rows returned by one read
const MAX_CHANGE_LOG: i64 = 1_000;

impl Database {
    // ========================================================================
    // Folder Queries
    // ========================================================================

    /// All folders, siblings in display order.
    pub async fn get_folders(&self) -> Result<Vec<Folder>, StoreError> {
        let rows = sqlx::query_as::<_, FolderRow>(
            r#"
            SELECT id, name, order_key, parent_id, visible, locked, expanded, sync_key
            FROM folders
            ORDER BY parent_id IS NOT NULL, parent_id, order_key
        "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(FolderRow::into_folder).collect()
    }

    pub async fn get_folder(&self, folder_id: FolderId) -> Result<Option<Folder>, StoreError> {
        let row = sqlx::query_as::<_, FolderRow>(
            r#"
            SELECT id, name, order_key, parent_id, visible, locked, expanded, sync_key
            FROM folders
            WHERE id = ?
        "#,
        )
        .bind(folder_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(FolderRow::into_folder).transpose()
    }

    /// Number of features per folder, for listings.
    pub async fn get_feature_counts(&self) -> Result<HashMap<FolderId, i64>, StoreError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT folder_id, COUNT(*) FROM features GROUP BY folder_id")
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter()
            .map(|(id, count)| Ok((parse_id(&id)?, count)))
            .collect()
    }

    // ========================================================================
    // Feature Queries
    // ========================================================================

    pub async fn get_feature_ids_in_folder(
        &self,
        folder_id: FolderId,
    ) -> Result<Vec<FeatureId>, StoreError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT id FROM features WHERE folder_id = ? ORDER BY order_key")
                .bind(folder_id.to_string())
                .fetch_all(&self.pool)
                .await?;

        rows.iter().map(|(id,)| parse_id(id)).collect()
    }

    /// Features of a folder in display order.
    ///
    /// PERF-002: Hard cap at MAX_FEATURES (50 000) to prevent OOM. A folder
    /// larger than that is logged and truncated.
    pub async fn get_features_in_folder(
        &self,
        folder_id: FolderId,
    ) -> Result<Vec<ManagedFeature>, StoreError> {
        self.get_features_in_folder_capped(folder_id, MAX_FEATURES).await
    }

    async fn get_features_in_folder_capped(
        &self,
        folder_id: FolderId,
        cap: i64,
    ) -> Result<Vec<ManagedFeature>, StoreError> {
        // One extra row tells a folder of exactly `cap` features from a larger one.
        let mut rows = sqlx::query_as::<_, FeatureRow>(
            r#"
            SELECT id, folder_id, order_key, payload
            FROM features
            WHERE folder_id = ?
            ORDER BY order_key
            LIMIT ?
        "#,
        )
        .bind(folder_id.to_string())
        .bind(cap.saturating_add(1))
        .fetch_all(&self.pool)
        .await?;

        let cap = usize::try_from(cap).unwrap_or(0);
        if rows.len() > cap {
            tracing::warn!(
                folder = %folder_id,
                limit = cap,
                "PERF-002: Folder exceeds feature read cap, results truncated"
            );
            rows.truncate(cap);
        }

        rows.into_iter().map(FeatureRow::into_feature).collect()
    }

    // ========================================================================
    // Change Log
    // ========================================================================

    /// Most recent change log entries, newest first.
    ///
    /// `limit` is clamped to `1..=MAX_CHANGE_LOG`.
    pub async fn get_change_log(&self, limit: i64) -> Result<Vec<ChangeRecord>, StoreError> {
        let rows: Vec<ChangeRow> = sqlx::query_as(
            r#"
            SELECT id, note, applied_at, folders_put, features_put, features_deleted
            FROM change_log
            ORDER BY id DESC
            LIMIT ?
        "#,
        )
        .bind(limit.clamp(1, MAX_CHANGE_LOG))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(id, note, applied_at, folders_put, features_put, features_deleted)| ChangeRecord {
                    id,
                    note,
                    applied_at,
                    folders_put,
                    features_put,
                    features_deleted,
                },
            )
            .collect())
    }
}

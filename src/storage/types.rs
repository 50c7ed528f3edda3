use std::collections::BTreeSet;
use thiserror::Error;
use uuid::Uuid;

use crate::feed::PolygonFeature;
use crate::reconcile::OrderKey;

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised while opening or migrating the database
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process holds the database lock
    #[error("Another wxsync process appears to be using the database. Please close it and try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Maps SQLITE_BUSY / SQLITE_LOCKED / SQLITE_CANTOPEN to `InstanceLocked`.
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        if is_lock_error(&err.to_string()) {
            return DatabaseError::InstanceLocked;
        }
        DatabaseError::Other(err)
    }
}

pub(crate) fn is_lock_error(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("database is locked")
        || message.contains("database table is locked")
        || message.contains("sqlite_busy")
        || message.contains("sqlite_locked")
        || message.contains("unable to open database file")
}

/// Failure of a store read or transaction. A failed transaction leaves no
/// partial effects.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored row could not be decoded (bad id, order key or payload).
    #[error("Corrupt store row: {0}")]
    Corrupt(String),

    /// The transaction references something that does not exist.
    #[error("Rejected transaction: {0}")]
    InvalidTransaction(String),
}

// ============================================================================
// Data Structures
// ============================================================================

pub type FolderId = Uuid;
pub type FeatureId = Uuid;

/// A folder of the collection. Root folders have no parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Folder {
    pub id: FolderId,
    pub name: String,
    pub order_key: OrderKey,
    pub parent_id: Option<FolderId>,
    pub visible: bool,
    pub locked: bool,
    pub expanded: bool,
    /// Hidden tag naming the source whose REPLACE folder this is.
    pub sync_key: Option<String>,
}

/// A feature owned by the store. `payload` already carries provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagedFeature {
    pub id: FeatureId,
    pub order_key: OrderKey,
    pub folder_id: FolderId,
    pub payload: PolygonFeature,
}

/// One atomic unit of store mutation.
///
/// Deletes are applied before puts, so a put may reuse an order key freed by
/// a delete in the same transaction.
#[derive(Debug, Clone, Default)]
pub struct StoreTransaction {
    /// Human-readable description recorded in the change log.
    pub note: String,
    pub put_folders: Vec<Folder>,
    pub put_features: Vec<ManagedFeature>,
    pub delete_features: BTreeSet<FeatureId>,
}

/// Entry of the change log written by every transaction.
#[derive(Debug, Clone)]
pub struct ChangeRecord {
    pub id: i64,
    pub note: String,
    pub applied_at: i64,
    pub folders_put: i64,
    pub features_put: i64,
    pub features_deleted: i64,
}

// ============================================================================
// Row Types
// ============================================================================

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct FolderRow {
    pub id: String,
    pub name: String,
    pub order_key: String,
    pub parent_id: Option<String>,
    pub visible: bool,
    pub locked: bool,
    pub expanded: bool,
    pub sync_key: Option<String>,
}

impl FolderRow {
    pub(crate) fn into_folder(self) -> Result<Folder, StoreError> {
        Ok(Folder {
            id: parse_id(&self.id)?,
            order_key: parse_key(&self.order_key)?,
            parent_id: self.parent_id.as_deref().map(parse_id).transpose()?,
            name: self.name,
            visible: self.visible,
            locked: self.locked,
            expanded: self.expanded,
            sync_key: self.sync_key,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct FeatureRow {
    pub id: String,
    pub folder_id: String,
    pub order_key: String,
    pub payload: String,
}

impl FeatureRow {
    pub(crate) fn into_feature(self) -> Result<ManagedFeature, StoreError> {
        let value: serde_json::Value = serde_json::from_str(&self.payload)
            .map_err(|e| StoreError::Corrupt(format!("feature {}: {e}", self.id)))?;
        let payload = crate::feed::feature_from_value(value)
            .ok_or_else(|| StoreError::Corrupt(format!("feature {}: not a GeoJSON object", self.id)))?;
        Ok(ManagedFeature {
            id: parse_id(&self.id)?,
            folder_id: parse_id(&self.folder_id)?,
            order_key: parse_key(&self.order_key)?,
            payload,
        })
    }
}

pub(crate) type ChangeRow = (i64, String, i64, i64, i64, i64);

pub(crate) fn parse_id(raw: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(raw).map_err(|e| StoreError::Corrupt(format!("id '{raw}': {e}")))
}

fn parse_key(raw: &str) -> Result<OrderKey, StoreError> {
    OrderKey::parse(raw).map_err(|e| StoreError::Corrupt(e.to_string()))
}

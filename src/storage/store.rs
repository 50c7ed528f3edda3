use async_trait::async_trait;
use std::sync::Arc;

use super::schema::Database;
use super::types::{FeatureId, Folder, FolderId, StoreError, StoreTransaction};

/// The persistent, ordered, foldered collection that reconciliation writes to.
///
/// Implemented by [`Database`] (SQLite). Also implemented for `Arc<S>` so a
/// store can be shared between sessions and still inspected in tests.
#[async_trait]
pub trait CollectionStore: Send + Sync {
    /// Every folder, in no particular order.
    async fn list_folders(&self) -> Result<Vec<Folder>, StoreError>;

    /// Ids of the features directly inside `folder`.
    async fn feature_ids_in_folder(&self, folder: FolderId) -> Result<Vec<FeatureId>, StoreError>;

    /// Applies `tx` atomically: either every change is visible afterwards or none is.
    async fn transact(&self, tx: StoreTransaction) -> Result<(), StoreError>;
}

#[async_trait]
impl CollectionStore for Database {
    async fn list_folders(&self) -> Result<Vec<Folder>, StoreError> {
        self.get_folders().await
    }

    async fn feature_ids_in_folder(&self, folder: FolderId) -> Result<Vec<FeatureId>, StoreError> {
        self.get_feature_ids_in_folder(folder).await
    }

    async fn transact(&self, tx: StoreTransaction) -> Result<(), StoreError> {
        self.apply_transaction(tx).await.map(|_| ())
    }
}

#[async_trait]
impl<S: CollectionStore + ?Sized> CollectionStore for Arc<S> {
    async fn list_folders(&self) -> Result<Vec<Folder>, StoreError> {
        (**self).list_folders().await
    }

    async fn feature_ids_in_folder(&self, folder: FolderId) -> Result<Vec<FeatureId>, StoreError> {
        (**self).feature_ids_in_folder(folder).await
    }

    async fn transact(&self, tx: StoreTransaction) -> Result<(), StoreError> {
        (**self).transact(tx).await
    }
}

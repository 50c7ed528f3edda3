mod folders;
mod schema;
mod store;
mod transact;
mod types;

pub use schema::Database;
pub use store::CollectionStore;
pub use types::{
    ChangeRecord, DatabaseError, FeatureId, Folder, FolderId, ManagedFeature, StoreError,
    StoreTransaction,
};

//! Turning a fetched snapshot into store mutations.
//!
//! The pipeline is `validity::filter` → `planner::reconcile` (which allocates
//! order keys) → `submit::submit`. Everything up to `submit` is pure.

mod order_key;
mod planner;
mod submit;
mod validity;

pub use order_key::{allocate, allocate_one, AllocationError, OrderKey};
pub use planner::{
    canonical_folder_name, find_replace_folder, reconcile, run_folder_name, ReconcileMode,
    ReconciliationPlan, RunContext, StoreView,
};
pub use planner::{
    PROP_ANALYSIS_TIME, PROP_FOLDER_NAME, PROP_PROVIDER, PROP_RETRIEVED_AT, PROP_SELECTED_VALIDITY_TIME,
    PROP_SOURCE, PROP_TYPE,
};
pub use submit::{submit, SubmitReceipt};
pub use validity::{available_windows, filter, is_valid_at};

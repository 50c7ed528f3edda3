use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::order_key::{allocate, allocate_one, AllocationError};
use crate::feed::{FeedSource, PolygonFeature};
use crate::storage::{FeatureId, Folder, FolderId, ManagedFeature, StoreTransaction};
use crate::util::{format_display_time, format_wire_time, Timestamp};

// ============================================================================
// Mode
// ============================================================================

/// How a run lands in the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconcileMode {
    /// A new folder per run; earlier runs are left alone.
    #[default]
    Append,
    /// One folder per source whose contents are swapped on every run.
    Replace,
}

impl FromStr for ReconcileMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "append" => Ok(ReconcileMode::Append),
            "replace" => Ok(ReconcileMode::Replace),
            other => Err(format!("unknown reconcile mode '{other}' (expected append or replace)")),
        }
    }
}

impl fmt::Display for ReconcileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReconcileMode::Append => "append",
            ReconcileMode::Replace => "replace",
        })
    }
}

// ============================================================================
// Inputs / Outputs
// ============================================================================

/// What a single run is about.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub source: FeedSource,
    pub analysis_time: Timestamp,
    pub window: Option<Timestamp>,
    pub retrieved_at: Timestamp,
}

/// The slice of store state the reconciler consults.
#[derive(Debug, Clone, Default)]
pub struct StoreView {
    pub folders: Vec<Folder>,
    pub feature_ids_by_folder: HashMap<FolderId, Vec<FeatureId>>,
}

/// Everything one run writes. Consumed once by [`super::submit`].
#[derive(Debug)]
pub struct ReconciliationPlan {
    pub mode: ReconcileMode,
    pub note: String,
    pub folder_to_put: Folder,
    /// True when the folder did not exist before this run.
    pub creates_folder: bool,
    pub features_to_put: Vec<ManagedFeature>,
    pub feature_ids_to_delete: BTreeSet<FeatureId>,
}

impl ReconciliationPlan {
    pub(crate) fn into_transaction(self) -> StoreTransaction {
        StoreTransaction {
            note: self.note,
            put_folders: vec![self.folder_to_put],
            put_features: self.features_to_put,
            delete_features: self.feature_ids_to_delete,
        }
    }
}

// Provenance property names written on every managed feature.
pub const PROP_SOURCE: &str = "source";
pub const PROP_PROVIDER: &str = "provider";
pub const PROP_ANALYSIS_TIME: &str = "analysisTime";
pub const PROP_SELECTED_VALIDITY_TIME: &str = "selectedValidityTime";
pub const PROP_RETRIEVED_AT: &str = "retrievedAt";
pub const PROP_FOLDER_NAME: &str = "folderName";
pub const PROP_TYPE: &str = "type";

// ============================================================================
// Reconciliation
// ============================================================================

/// Plans how `features` (already filtered, in display order) land in the store.
///
/// # Errors
///
/// Only [`AllocationError`], when a stored root folder key cannot be extended.
pub fn reconcile(
    mode: ReconcileMode,
    ctx: &RunContext,
    features: Vec<PolygonFeature>,
    view: &StoreView,
) -> Result<ReconciliationPlan, AllocationError> {
    let (folder, creates_folder, feature_ids_to_delete) = match mode {
        ReconcileMode::Append => {
            let folder = new_root_folder(&view.folders, run_folder_name(ctx), None)?;
            (folder, true, BTreeSet::new())
        }
        ReconcileMode::Replace => match find_replace_folder(&view.folders, &ctx.source) {
            Some(existing) => {
                let mut folder = existing.clone();
                if folder.sync_key.is_none() {
                    tracing::info!(
                        source = %ctx.source,
                        folder = %folder.name,
                        "Adopting untagged folder for replace mode"
                    );
                }
                folder.sync_key = Some(ctx.source.id());
                let owned = view
                    .feature_ids_by_folder
                    .get(&folder.id)
                    .map(|ids| ids.iter().copied().collect())
                    .unwrap_or_default();
                (folder, false, owned)
            }
            None => {
                let folder = new_root_folder(
                    &view.folders,
                    canonical_folder_name(&ctx.source),
                    Some(ctx.source.id()),
                )?;
                (folder, true, BTreeSet::new())
            }
        },
    };

    let keys = allocate(None, None, features.len())?;
    let features_to_put: Vec<ManagedFeature> = features
        .into_iter()
        .zip(keys)
        .map(|(feature, order_key)| ManagedFeature {
            id: Uuid::new_v4(),
            order_key,
            folder_id: folder.id,
            payload: with_provenance(feature, ctx, &folder.name),
        })
        .collect();

    let note = match mode {
        ReconcileMode::Append => format!("Create {}", folder.name),
        ReconcileMode::Replace => format!(
            "Replace {} with {} features",
            folder.name,
            features_to_put.len()
        ),
    };

    Ok(ReconciliationPlan {
        mode,
        note,
        folder_to_put: folder,
        creates_folder,
        features_to_put,
        feature_ids_to_delete,
    })
}

/// Name of the single REPLACE-mode folder of a source.
pub fn canonical_folder_name(source: &FeedSource) -> String {
    format!("{} Live", source.display_label())
}

/// Name of an APPEND-mode folder: source, analysis time and window.
pub fn run_folder_name(ctx: &RunContext) -> String {
    let window = ctx
        .window
        .as_ref()
        .map(format_display_time)
        .unwrap_or_else(|| "unspecified".to_string());
    format!(
        "{} - Analysis: {} - Start: {}",
        ctx.source.display_label(),
        format_display_time(&ctx.analysis_time),
        window
    )
}

/// The folder REPLACE mode writes into for `source`.
///
/// A folder tagged with the source's sync key wins. Otherwise an untagged
/// folder carrying the canonical name is returned so it can be adopted.
pub fn find_replace_folder<'a>(folders: &'a [Folder], source: &FeedSource) -> Option<&'a Folder> {
    let sync_key = source.id();
    folders
        .iter()
        .find(|f| f.sync_key.as_deref() == Some(sync_key.as_str()))
        .or_else(|| {
            let name = canonical_folder_name(source);
            folders
                .iter()
                .filter(|f| f.sync_key.is_none() && f.name == name)
                .min_by(|a, b| a.order_key.cmp(&b.order_key))
        })
}

fn new_root_folder(
    existing: &[Folder],
    name: String,
    sync_key: Option<String>,
) -> Result<Folder, AllocationError> {
    let last_root = existing
        .iter()
        .filter(|f| f.parent_id.is_none())
        .map(|f| &f.order_key)
        .max();
    Ok(Folder {
        id: Uuid::new_v4(),
        name,
        order_key: allocate_one(last_root, None)?,
        parent_id: None,
        visible: true,
        locked: false,
        expanded: true,
        sync_key,
    })
}

fn with_provenance(mut feature: PolygonFeature, ctx: &RunContext, folder_name: &str) -> PolygonFeature {
    let props = &mut feature.properties;
    props.insert(PROP_SOURCE.into(), Value::String(ctx.source.id()));
    props.insert(PROP_PROVIDER.into(), Value::String(ctx.source.provider.clone()));
    props.insert(PROP_TYPE.into(), Value::String(ctx.source.product.kind().into()));
    props.insert(
        PROP_ANALYSIS_TIME.into(),
        Value::String(format_wire_time(&ctx.analysis_time)),
    );
    props.insert(
        PROP_SELECTED_VALIDITY_TIME.into(),
        ctx.window
            .as_ref()
            .map(|w| Value::String(format_wire_time(w)))
            .unwrap_or(Value::Null),
    );
    props.insert(
        PROP_RETRIEVED_AT.into(),
        Value::String(format_wire_time(&ctx.retrieved_at)),
    );
    props.insert(PROP_FOLDER_NAME.into(), Value::String(folder_name.to_string()));
    feature
}

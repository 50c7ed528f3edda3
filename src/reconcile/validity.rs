use std::collections::BTreeSet;

use crate::feed::{PolygonFeature, Snapshot};
use crate::util::Timestamp;

/// Whether `feature` is valid at instant `at`.
///
/// With an end time the interval is half-open, `[start, end)`. Without one the
/// feature only exists at `start`. A feature with no usable start is never
/// valid at any instant.
pub fn is_valid_at(feature: &PolygonFeature, at: Timestamp) -> bool {
    match (feature.validity_start, feature.validity_end) {
        (Some(start), Some(end)) => start <= at && at < end,
        (Some(start), None) => start == at,
        (None, _) => false,
    }
}

/// Features of `snapshot` valid at `window`, in snapshot order.
///
/// No window means no filtering.
pub fn filter(snapshot: &Snapshot, window: Option<Timestamp>) -> Vec<PolygonFeature> {
    match window {
        None => snapshot.features.clone(),
        Some(at) => snapshot
            .features
            .iter()
            .filter(|f| is_valid_at(f, at))
            .cloned()
            .collect(),
    }
}

/// Distinct validity start times of `snapshot`, earliest first.
pub fn available_windows(snapshot: &Snapshot) -> Vec<Timestamp> {
    snapshot
        .features
        .iter()
        .filter_map(|f| f.validity_start)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

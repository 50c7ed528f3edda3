use serde::Deserialize;
use serde_json::{Map, Value};

use super::fetcher::FetchError;
use super::types::{FeedSource, PolygonFeature, Snapshot};
use crate::util::{parse_timestamp, Timestamp};

pub(crate) const VALIDITY_START_KEY: &str = "validity_start_time";
pub(crate) const VALIDITY_END_KEY: &str = "validity_end_time";

#[derive(Debug, Deserialize)]
struct AnalysisTimesBody {
    #[serde(default)]
    analysis_times: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct FeatureCollectionBody {
    #[serde(default)]
    features: Option<Vec<Value>>,
}

/// Parses `{"analysis_times": [...]}`.
///
/// Entries that are not valid timestamps are skipped with a warning. Order is
/// preserved as returned by the API.
pub fn parse_analysis_times(bytes: &[u8]) -> Result<Vec<Timestamp>, FetchError> {
    let body: Option<AnalysisTimesBody> =
        serde_json::from_slice(bytes).map_err(|e| FetchError::Parse(e.to_string()))?;

    let raw = body.and_then(|b| b.analysis_times).unwrap_or_default();
    let times = raw
        .iter()
        .filter_map(|entry| {
            let parsed = parse_timestamp(entry);
            if parsed.is_none() {
                tracing::warn!(value = %entry, "Skipping unparseable analysis time");
            }
            parsed
        })
        .collect();
    Ok(times)
}

/// Parses a GeoJSON `FeatureCollection` into a [`Snapshot`].
///
/// A `null` body or a body without a `features` array counts as "no data" for
/// the requested analysis time. Individual entries that are not JSON objects
/// are dropped.
pub fn parse_snapshot(
    bytes: &[u8],
    source: &FeedSource,
    analysis_time: Timestamp,
    retrieved_at: Timestamp,
) -> Result<Snapshot, FetchError> {
    let body: Option<FeatureCollectionBody> =
        serde_json::from_slice(bytes).map_err(|e| FetchError::Parse(e.to_string()))?;

    let raw_features = body.and_then(|b| b.features).ok_or_else(|| {
        FetchError::NoData(format!(
            "{} has no feature collection for {}",
            source,
            crate::util::format_wire_time(&analysis_time)
        ))
    })?;

    let total = raw_features.len();
    let features: Vec<PolygonFeature> = raw_features
        .into_iter()
        .filter_map(feature_from_value)
        .collect();

    if features.len() < total {
        tracing::warn!(
            source = %source,
            dropped = total - features.len(),
            "Dropped malformed features from snapshot"
        );
    }

    Ok(Snapshot {
        source: source.clone(),
        analysis_time,
        retrieved_at,
        features,
    })
}

/// Converts one GeoJSON feature object into a [`PolygonFeature`].
///
/// Also used when reading payloads back from the store.
pub fn feature_from_value(value: Value) -> Option<PolygonFeature> {
    let Value::Object(mut obj) = value else {
        return None;
    };

    let properties = match obj.remove("properties") {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };
    let geometry = obj.remove("geometry").unwrap_or(Value::Null);
    let id = obj.remove("id");

    let validity_start = timestamp_property(&properties, VALIDITY_START_KEY);
    let validity_end = timestamp_property(&properties, VALIDITY_END_KEY);

    Some(PolygonFeature {
        id,
        geometry,
        properties,
        validity_start,
        validity_end,
    })
}

fn timestamp_property(properties: &Map<String, Value>, key: &str) -> Option<Timestamp> {
    match properties.get(key) {
        Some(Value::String(raw)) => {
            let parsed = parse_timestamp(raw);
            if parsed.is_none() {
                tracing::debug!(key = key, value = %raw, "Ignoring unparseable validity time");
            }
            parsed
        }
        _ => None,
    }
}

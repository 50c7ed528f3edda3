use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::util::{title_case, Timestamp};

// ============================================================================
// Sources
// ============================================================================

/// Weather product served by the API. Each product lives under its own path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Product {
    Convection,
    Icing,
}

impl Product {
    /// Path segment under `/v1/`.
    pub fn api_path(self) -> &'static str {
        match self {
            Product::Convection => "convections",
            Product::Icing => "icing",
        }
    }

    /// Value written to the `type` provenance property.
    pub fn kind(self) -> &'static str {
        match self {
            Product::Convection => "convection",
            Product::Icing => "icing",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Product::Convection => "Convection",
            Product::Icing => "Icing",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SourceParseError {
    #[error("Unknown product '{0}' (expected 'convection' or 'icing')")]
    UnknownProduct(String),
    #[error("Invalid source id '{0}': expected <product>:<provider>")]
    Malformed(String),
}

impl FromStr for Product {
    type Err = SourceParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "convection" | "convections" => Ok(Product::Convection),
            "icing" => Ok(Product::Icing),
            other => Err(SourceParseError::UnknownProduct(other.to_string())),
        }
    }
}

/// One logical feed: a product from one provider, e.g. `convection:meteofrance`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FeedSource {
    pub product: Product,
    pub provider: String,
}

impl FeedSource {
    pub fn new(product: Product, provider: impl Into<String>) -> Self {
        Self {
            product,
            provider: provider.into(),
        }
    }

    /// Stable identifier, also used as the hidden sync key of REPLACE folders.
    pub fn id(&self) -> String {
        format!("{}:{}", self.product.kind(), self.provider)
    }

    /// `Convection Meteofrance`
    pub fn display_label(&self) -> String {
        format!("{} {}", self.product.label(), title_case(&self.provider))
    }
}

impl fmt::Display for FeedSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.product.kind(), self.provider)
    }
}

impl FromStr for FeedSource {
    type Err = SourceParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (product, provider) = s
            .split_once(':')
            .ok_or_else(|| SourceParseError::Malformed(s.to_string()))?;
        let provider = provider.trim().to_ascii_lowercase();
        let valid_provider = !provider.is_empty()
            && provider
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid_provider {
            return Err(SourceParseError::Malformed(s.to_string()));
        }
        Ok(Self::new(product.parse()?, provider))
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// One polygon of a snapshot.
///
/// `validity_start` / `validity_end` are parsed from the
/// `validity_start_time` / `validity_end_time` properties at fetch time; the
/// raw properties are left untouched. A missing end means the polygon is valid
/// only at the exact start instant.
#[derive(Debug, Clone, PartialEq)]
pub struct PolygonFeature {
    /// Top-level GeoJSON `id`, when the producer sent one.
    pub id: Option<Value>,
    pub geometry: Value,
    pub properties: Map<String, Value>,
    pub validity_start: Option<Timestamp>,
    pub validity_end: Option<Timestamp>,
}

impl PolygonFeature {
    /// Renders the feature back to a GeoJSON `Feature` object.
    pub fn to_geojson(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("type".to_string(), Value::String("Feature".to_string()));
        if let Some(id) = &self.id {
            obj.insert("id".to_string(), id.clone());
        }
        obj.insert("geometry".to_string(), self.geometry.clone());
        obj.insert(
            "properties".to_string(),
            Value::Object(self.properties.clone()),
        );
        Value::Object(obj)
    }
}

/// A fetched feature collection for one source and analysis time.
///
/// Immutable once built; sessions share it behind an `Arc`.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub source: FeedSource,
    pub analysis_time: Timestamp,
    pub retrieved_at: Timestamp,
    pub features: Vec<PolygonFeature>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_round_trip() {
        let source: FeedSource = "convection:meteofrance".parse().unwrap();
        assert_eq!(source.product, Product::Convection);
        assert_eq!(source.provider, "meteofrance");
        assert_eq!(source.id(), "convection:meteofrance");
        assert_eq!(source.to_string(), source.id());
    }

    #[test]
    fn test_source_accepts_api_path_and_case() {
        let source: FeedSource = "Convections:MeandAir".parse().unwrap();
        assert_eq!(source.id(), "convection:meandair");
    }

    #[test]
    fn test_source_rejects_unknown_product() {
        let err = "turbulence:wsi".parse::<FeedSource>().unwrap_err();
        assert_eq!(err, SourceParseError::UnknownProduct("turbulence".into()));
    }

    #[test]
    fn test_source_rejects_bad_provider() {
        assert!("icing:".parse::<FeedSource>().is_err());
        assert!("icing:a/b".parse::<FeedSource>().is_err());
        assert!("icing".parse::<FeedSource>().is_err());
    }

    #[test]
    fn test_display_label() {
        let source = FeedSource::new(Product::Icing, "meteofrance");
        assert_eq!(source.display_label(), "Icing Meteofrance");
    }

    #[test]
    fn test_to_geojson_keeps_id_and_properties() {
        let mut properties = Map::new();
        properties.insert("severity".into(), Value::from(3));
        let feature = PolygonFeature {
            id: Some(Value::from("cell-7")),
            geometry: serde_json::json!({"type": "Polygon", "coordinates": []}),
            properties,
            validity_start: None,
            validity_end: None,
        };
        let json = feature.to_geojson();
        assert_eq!(json["type"], "Feature");
        assert_eq!(json["id"], "cell-7");
        assert_eq!(json["properties"]["severity"], 3);
    }
}

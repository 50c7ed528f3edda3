//! Weather API collaborator: sources, snapshots and the HTTP fetcher.
//!
//! - [`types`] - Sources, polygon features and snapshots
//! - [`parser`] - GeoJSON / analysis-time payload decoding
//! - [`fetcher`] - The [`Fetcher`] seam consumed by feed sessions
//! - [`client`] - [`ApiClient`], the authenticated HTTP implementation
//!
//! # Example
//!
//! ```ignore
//! use wxsync::feed::{ApiClient, Fetcher};
//!
//! let client = ApiClient::new(DEFAULT_BASE_URL, credentials, timeout)?;
//! let times = client.analysis_times(&"convection:meteofrance".parse()?).await?;
//! ```

mod auth;
mod client;
mod fetcher;
mod parser;
mod types;

pub use auth::Credentials;
pub use client::{ApiClient, DEFAULT_BASE_URL};
pub use fetcher::{FetchError, Fetcher};
pub use parser::{feature_from_value, parse_analysis_times, parse_snapshot};
pub use types::{FeedSource, PolygonFeature, Product, Snapshot, SourceParseError};

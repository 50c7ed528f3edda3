use async_trait::async_trait;
use thiserror::Error;

use super::types::{FeedSource, Snapshot};
use crate::util::Timestamp;

/// Errors that can occur while talking to the weather API.
///
/// These cover the whole request lifecycle: authentication, transport, HTTP
/// status and payload decoding.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Upstream rejected the credentials (login failed or 401 after re-login)
    #[error("Authentication rejected: {0}")]
    Auth(String),
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request exceeded the configured timeout
    #[error("Request timed out")]
    Timeout,
    /// Upstream answered but had nothing usable for the requested time
    #[error("No data: {0}")]
    NoData(String),
    /// Body was not the JSON shape we expect
    #[error("Malformed response: {0}")]
    Parse(String),
    /// Response body exceeded the size limit
    #[error("Response too large (exceeds {0} bytes)")]
    ResponseTooLarge(usize),
    /// Base URL or endpoint could not be built
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    /// Base URL is plain HTTP on a non-local host
    #[error("Insecure base URL: HTTPS required (except localhost for testing)")]
    InsecureBaseUrl,
}

/// Source of analysis times and snapshots.
///
/// Implemented by [`ApiClient`](super::ApiClient) for the real API; tests and
/// embedding applications can provide their own.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Analysis times the API currently offers for `source`, in API order.
    async fn analysis_times(&self, source: &FeedSource) -> Result<Vec<Timestamp>, FetchError>;

    /// Snapshot of `source` for one analysis time.
    async fn snapshot(
        &self,
        source: &FeedSource,
        analysis_time: Timestamp,
    ) -> Result<Snapshot, FetchError>;
}

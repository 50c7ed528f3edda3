use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;
use tokio::sync::Mutex;
use url::Url;

use super::auth::{AuthTokens, Credentials, LoginPayload, LoginResponse};
use super::fetcher::{FetchError, Fetcher};
use super::parser::{parse_analysis_times, parse_snapshot};
use super::types::{FeedSource, Snapshot};
use crate::util::{format_wire_time, Timestamp};

/// SEC-003: Snapshots of global convection cells run to a few MB; anything
/// beyond this is treated as a broken upstream.
const MAX_RESPONSE_SIZE: usize = 32 * 1024 * 1024; // 32MB

/// Default API host.
pub const DEFAULT_BASE_URL: &str = "https://api.guidor.fr";

/// HTTP client for the weather API.
///
/// Owns the credentials and the current access token. The token is acquired
/// lazily on the first request and re-acquired once when the API answers 401;
/// a second 401 is reported as [`FetchError::Auth`]. Logins are serialized by
/// the token mutex.
pub struct ApiClient {
    http: reqwest::Client,
    base_url: Url,
    credentials: Credentials,
    timeout: Duration,
    tokens: Mutex<Option<AuthTokens>>,
}

impl ApiClient {
    /// Creates a client for `base_url`.
    ///
    /// # Errors
    ///
    /// - [`FetchError::InvalidUrl`] if `base_url` does not parse
    /// - [`FetchError::InsecureBaseUrl`] for plain HTTP on anything but localhost
    pub fn new(
        base_url: &str,
        credentials: Credentials,
        timeout: Duration,
    ) -> Result<Self, FetchError> {
        let base_url =
            Url::parse(base_url).map_err(|e| FetchError::InvalidUrl(format!("{base_url}: {e}")))?;

        // SEC-002: Credentials only travel over TLS; plain HTTP is allowed for localhost.
        if base_url.scheme() != "https" {
            let is_localhost = matches!(base_url.host_str(), Some("127.0.0.1" | "localhost"));
            if base_url.scheme() != "http" || !is_localhost {
                tracing::error!(base_url = %base_url, "Rejecting non-HTTPS API base URL");
                return Err(FetchError::InsecureBaseUrl);
            }
            tracing::warn!(base_url = %base_url, "Using non-HTTPS API base URL (localhost only)");
        }

        let http = reqwest::Client::builder()
            .user_agent(concat!("wxsync/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            base_url,
            credentials,
            timeout,
            tokens: Mutex::new(None),
        })
    }

    fn endpoint(&self, path: &str, query: &[(&str, &str)]) -> Result<Url, FetchError> {
        let mut url = self
            .base_url
            .join(path)
            .map_err(|e| FetchError::InvalidUrl(format!("{path}: {e}")))?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    pub(crate) fn analysis_times_url(&self, source: &FeedSource) -> Result<Url, FetchError> {
        self.endpoint(
            &format!("/v1/{}/analysis_time", source.product.api_path()),
            &[("source", source.provider.as_str())],
        )
    }

    pub(crate) fn snapshot_url(
        &self,
        source: &FeedSource,
        analysis_time: &Timestamp,
    ) -> Result<Url, FetchError> {
        let analysis_time = format_wire_time(analysis_time);
        self.endpoint(
            &format!("/v1/{}/", source.product.api_path()),
            &[
                ("source", source.provider.as_str()),
                ("format", "geojson"),
                ("analysis_time", analysis_time.as_str()),
            ],
        )
    }

    async fn login(&self) -> Result<AuthTokens, FetchError> {
        let url = self.endpoint("/v1/auth/login", &[])?;
        let body = serde_json::to_vec(&LoginPayload::from_credentials(&self.credentials))
            .map_err(|e| FetchError::Parse(e.to_string()))?;

        let request = self
            .http
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);
        let response = tokio::time::timeout(self.timeout, request.send())
            .await
            .map_err(|_| FetchError::Timeout)??;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            tracing::warn!(status = status.as_u16(), "Weather API login rejected");
            return Err(FetchError::Auth(format!(
                "login rejected with status {}",
                status.as_u16()
            )));
        }
        if !status.is_success() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        let bytes = read_limited(response, MAX_RESPONSE_SIZE).await?;
        let parsed: LoginResponse =
            serde_json::from_slice(&bytes).map_err(|e| FetchError::Parse(e.to_string()))?;
        let tokens = AuthTokens::from_response(parsed)
            .ok_or_else(|| FetchError::Auth("login response carried no token".to_string()))?;

        tracing::info!("Authenticated against weather API");
        Ok(tokens)
    }

    /// GET `url` with the current token, re-authenticating once on 401.
    async fn get_authorized(&self, url: Url) -> Result<Vec<u8>, FetchError> {
        let mut relogged = false;
        loop {
            let token = {
                let mut guard = self.tokens.lock().await;
                if guard.is_none() {
                    *guard = Some(self.login().await?);
                }
                match guard.as_ref() {
                    Some(tokens) => SecretString::from(tokens.authorization.expose_secret().to_owned()),
                    None => return Err(FetchError::Auth("no access token".to_string())),
                }
            };

            let request = self
                .http
                .get(url.clone())
                .header(reqwest::header::AUTHORIZATION, token.expose_secret())
                .header(reqwest::header::CONTENT_TYPE, "application/json");
            let response = tokio::time::timeout(self.timeout, request.send())
                .await
                .map_err(|_| FetchError::Timeout)??;

            let status = response.status();
            if status == reqwest::StatusCode::UNAUTHORIZED {
                if relogged {
                    return Err(FetchError::Auth(
                        "token rejected after re-authentication".to_string(),
                    ));
                }
                let mut guard = self.tokens.lock().await;
                if let Some(stale) = guard.take() {
                    let age = Utc::now() - stale.acquired_at;
                    tracing::info!(
                        token_age_secs = age.num_seconds(),
                        "Access token expired, re-authenticating"
                    );
                }
                relogged = true;
                continue;
            }
            if status == reqwest::StatusCode::FORBIDDEN {
                return Err(FetchError::Auth(format!("access denied to {}", url.path())));
            }
            if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::NO_CONTENT
            {
                return Err(FetchError::NoData(format!(
                    "{} answered {}",
                    url.path(),
                    status.as_u16()
                )));
            }
            if !status.is_success() {
                return Err(FetchError::HttpStatus(status.as_u16()));
            }

            return read_limited(response, MAX_RESPONSE_SIZE).await;
        }
    }
}

#[async_trait]
impl Fetcher for ApiClient {
    async fn analysis_times(&self, source: &FeedSource) -> Result<Vec<Timestamp>, FetchError> {
        let url = self.analysis_times_url(source)?;
        let bytes = self.get_authorized(url).await?;
        let times = parse_analysis_times(&bytes)?;
        tracing::debug!(source = %source, count = times.len(), "Fetched analysis times");
        Ok(times)
    }

    async fn snapshot(
        &self,
        source: &FeedSource,
        analysis_time: Timestamp,
    ) -> Result<Snapshot, FetchError> {
        let url = self.snapshot_url(source, &analysis_time)?;
        let bytes = self.get_authorized(url).await?;
        let snapshot = parse_snapshot(&bytes, source, analysis_time, Utc::now())?;
        tracing::info!(
            source = %source,
            analysis_time = %format_wire_time(&analysis_time),
            features = snapshot.features.len(),
            "Fetched snapshot"
        );
        Ok(snapshot)
    }
}

async fn read_limited(response: reqwest::Response, limit: usize) -> Result<Vec<u8>, FetchError> {
    // SEC-003: Fast path: check Content-Length header
    if let Some(len) = response.content_length() {
        if len as usize > limit {
            return Err(FetchError::ResponseTooLarge(limit));
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge(limit));
        }
        bytes.extend_from_slice(&chunk);
    }

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::types::Product;
    use chrono::TimeZone;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn credentials() -> Credentials {
        Credentials {
            email: "ops@example.com".into(),
            password: SecretString::from("s3cret".to_string()),
            device_id: "000-000".into(),
            device_name: "wxsync tests".into(),
        }
    }

    fn client(server: &MockServer) -> ApiClient {
        ApiClient::new(&server.uri(), credentials(), Duration::from_secs(5)).unwrap()
    }

    fn source() -> FeedSource {
        FeedSource::new(Product::Convection, "meteofrance")
    }

    async fn mount_login(server: &MockServer, token: &str) {
        Mock::given(method("POST"))
            .and(path("/v1/auth/login"))
            .and(body_partial_json(serde_json::json!({
                "email": "ops@example.com",
                "device": {"device_id": "000-000"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "Authorization": token,
                "RefreshToken": "refresh"
            })))
            .mount(server)
            .await;
    }

    #[test]
    fn test_rejects_plain_http_remote() {
        let result = ApiClient::new(
            "http://api.example.com",
            credentials(),
            Duration::from_secs(5),
        );
        assert!(matches!(result, Err(FetchError::InsecureBaseUrl)));
    }

    #[test]
    fn test_rejects_unparseable_base() {
        let result = ApiClient::new("not a url", credentials(), Duration::from_secs(5));
        assert!(matches!(result, Err(FetchError::InvalidUrl(_))));
    }

    #[test]
    fn test_endpoint_urls() {
        let client =
            ApiClient::new(DEFAULT_BASE_URL, credentials(), Duration::from_secs(5)).unwrap();
        let icing = FeedSource::new(Product::Icing, "meteofrance");

        let times = client.analysis_times_url(&icing).unwrap();
        assert_eq!(times.path(), "/v1/icing/analysis_time");
        assert_eq!(times.query(), Some("source=meteofrance"));

        let t = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let snap = client.snapshot_url(&source(), &t).unwrap();
        assert_eq!(snap.path(), "/v1/convections/");
        let pairs: Vec<(String, String)> = snap
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert!(pairs.contains(&("format".into(), "geojson".into())));
        assert!(pairs.contains(&("analysis_time".into(), "2025-06-01T12:00:00Z".into())));
    }

    #[tokio::test]
    async fn test_analysis_times_logs_in_and_sends_token() {
        let server = MockServer::start().await;
        mount_login(&server, "tok-1").await;
        Mock::given(method("GET"))
            .and(path("/v1/convections/analysis_time"))
            .and(query_param("source", "meteofrance"))
            .and(header("Authorization", "tok-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "analysis_times": ["2025-06-01T12:00:00Z", "2025-06-01T11:00:00Z"]
            })))
            .mount(&server)
            .await;

        let times = client(&server).analysis_times(&source()).await.unwrap();
        assert_eq!(times.len(), 2);
        assert_eq!(
            times[0],
            Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn test_login_rejected_is_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/auth/login"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let result = client(&server).analysis_times(&source()).await;
        assert!(matches!(result, Err(FetchError::Auth(_))));
    }

    #[tokio::test]
    async fn test_persistent_401_is_auth_error() {
        let server = MockServer::start().await;
        mount_login(&server, "tok-1").await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let result = client(&server).analysis_times(&source()).await;
        assert!(matches!(result, Err(FetchError::Auth(_))));
    }

    #[tokio::test]
    async fn test_expired_token_triggers_single_relogin() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/auth/login"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"Authorization": "tok"})),
            )
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"analysis_times": []})),
            )
            .mount(&server)
            .await;

        let times = client(&server).analysis_times(&source()).await.unwrap();
        assert!(times.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_404_is_no_data() {
        let server = MockServer::start().await;
        mount_login(&server, "tok").await;
        Mock::given(method("GET"))
            .and(path("/v1/convections/"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let t = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let result = client(&server).snapshot(&source(), t).await;
        assert!(matches!(result, Err(FetchError::NoData(_))));
    }

    #[tokio::test]
    async fn test_snapshot_500_is_http_status() {
        let server = MockServer::start().await;
        mount_login(&server, "tok").await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let t = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let result = client(&server).snapshot(&source(), t).await;
        assert!(matches!(result, Err(FetchError::HttpStatus(503))));
    }

    #[tokio::test]
    async fn test_snapshot_parses_collection() {
        let server = MockServer::start().await;
        mount_login(&server, "tok").await;
        Mock::given(method("GET"))
            .and(path("/v1/convections/"))
            .and(query_param("format", "geojson"))
            .and(query_param("analysis_time", "2025-06-01T12:00:00Z"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "type": "FeatureCollection",
                "features": [{
                    "type": "Feature",
                    "geometry": {"type": "Polygon", "coordinates": []},
                    "properties": {"validity_start_time": "2025-06-01T12:00:00+00:00"}
                }]
            })))
            .mount(&server)
            .await;

        let t = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let snapshot = client(&server).snapshot(&source(), t).await.unwrap();
        assert_eq!(snapshot.analysis_time, t);
        assert_eq!(snapshot.features.len(), 1);
        assert_eq!(snapshot.features[0].validity_start, Some(t));
    }
}

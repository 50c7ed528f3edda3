//! Configuration file parser for ~/.config/wxsync/config.toml.
//!
//! The config file is optional. A missing or empty file yields
//! `Config::default()`; unknown keys are accepted but logged as warnings.
use secrecy::SecretString;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::feed::{Credentials, FeedSource, SourceParseError, DEFAULT_BASE_URL};
use crate::reconcile::ReconcileMode;

/// Environment variable that overrides `api_password`.
pub const PASSWORD_ENV: &str = "WXSYNC_API_PASSWORD";

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// SEC-005: Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("Missing '{0}' in config (required to log in to the weather API)")]
    MissingCredential(&'static str),

    #[error("Invalid entry in 'sources': {0}")]
    InvalidSource(#[from] SourceParseError),
}

// ============================================================================
// Configuration
// ============================================================================

/// Top-level configuration.
///
/// Every key is optional.
///
/// SEC-006: Custom Debug impl masks `api_password` to prevent secret leakage.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Weather API root, HTTPS unless pointing at localhost.
    pub api_base_url: String,

    pub api_email: Option<String>,

    /// Overridden by `WXSYNC_API_PASSWORD` when set.
    pub api_password: Option<String>,

    pub device_id: String,
    pub device_name: String,

    pub request_timeout_secs: u64,

    /// Mode used by `sync` and by auto-materialize.
    pub reconcile_mode: ReconcileMode,

    /// Reconcile immediately after every successful snapshot fetch.
    pub auto_materialize: bool,

    /// Source ids (`product:provider`) the CLI knows about.
    pub sources: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_BASE_URL.to_string(),
            api_email: None,
            api_password: None,
            device_id: "wxsync-cli".to_string(),
            device_name: "wxsync".to_string(),
            request_timeout_secs: 30,
            reconcile_mode: ReconcileMode::Append,
            auto_materialize: false,
            sources: vec![
                "convection:meteofrance".to_string(),
                "convection:meandair".to_string(),
                "icing:meteofrance".to_string(),
            ],
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("api_base_url", &self.api_base_url)
            .field("api_email", &self.api_email)
            .field(
                "api_password",
                &self.api_password.as_ref().map(|_| "[REDACTED]"),
            )
            .field("device_id", &self.device_id)
            .field("device_name", &self.device_name)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("reconcile_mode", &self.reconcile_mode)
            .field("auto_materialize", &self.auto_materialize)
            .field("sources", &self.sources)
            .finish()
    }
}

impl Config {
    /// SEC-005: Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 9] = [
        "api_base_url",
        "api_email",
        "api_password",
        "device_id",
        "device_name",
        "request_timeout_secs",
        "reconcile_mode",
        "auto_materialize",
        "sources",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // SEC-005: Check file size before reading to prevent memory exhaustion
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        let config = Self::parse(&content)?;
        tracing::info!(
            path = %path.display(),
            mode = %config.reconcile_mode,
            sources = config.sources.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Parses TOML text; blank input yields the defaults.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        Ok(toml::from_str(content)?)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    /// Parsed `sources`, in file order.
    pub fn feed_sources(&self) -> Result<Vec<FeedSource>, ConfigError> {
        self.sources
            .iter()
            .map(|s| s.parse::<FeedSource>().map_err(ConfigError::from))
            .collect()
    }

    /// API credentials, with the password taken from `WXSYNC_API_PASSWORD`
    /// when that variable is set.
    pub fn credentials(&self) -> Result<Credentials, ConfigError> {
        self.credentials_with(std::env::var(PASSWORD_ENV).ok())
    }

    fn credentials_with(&self, env_password: Option<String>) -> Result<Credentials, ConfigError> {
        let email = self
            .api_email
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .ok_or(ConfigError::MissingCredential("api_email"))?;
        let password = env_password
            .filter(|p| !p.is_empty())
            .or_else(|| self.api_password.clone())
            .filter(|p| !p.is_empty())
            .ok_or(ConfigError::MissingCredential("api_password"))?;

        Ok(Credentials {
            email: email.to_string(),
            password: SecretString::from(password),
            device_id: self.device_id.clone(),
            device_name: self.device_name.clone(),
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::Product;
    use secrecy::ExposeSecret;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.api_base_url, DEFAULT_BASE_URL);
        assert_eq!(config.reconcile_mode, ReconcileMode::Append);
        assert!(!config.auto_materialize);
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.feed_sources().unwrap().len(), 3);
    }

    #[test]
    fn test_missing_file_returns_default() {
        let path = Path::new("/tmp/wxsync_test_nonexistent_config.toml");
        let config = Config::load(path).unwrap();
        assert_eq!(config.device_id, "wxsync-cli");
    }

    #[test]
    fn test_whitespace_only_returns_default() {
        let config = Config::parse("   \n  \n  ").unwrap();
        assert_eq!(config.reconcile_mode, ReconcileMode::Append);
    }

    #[test]
    fn test_full_config() {
        let content = r#"
api_base_url = "http://localhost:8080"
api_email = "ops@example.com"
api_password = "hunter2"
device_id = "ops-laptop"
device_name = "Ops laptop"
request_timeout_secs = 5
reconcile_mode = "replace"
auto_materialize = true
sources = ["icing:meteofrance"]
"#;
        let config = Config::parse(content).unwrap();
        assert_eq!(config.api_base_url, "http://localhost:8080");
        assert_eq!(config.reconcile_mode, ReconcileMode::Replace);
        assert!(config.auto_materialize);
        assert_eq!(config.request_timeout(), Duration::from_secs(5));
        assert_eq!(
            config.feed_sources().unwrap(),
            vec![FeedSource::new(Product::Icing, "meteofrance")]
        );

        let creds = config.credentials_with(None).unwrap();
        assert_eq!(creds.email, "ops@example.com");
        assert_eq!(creds.password.expose_secret(), "hunter2");
        assert_eq!(creds.device_name, "Ops laptop");
    }

    #[test]
    fn test_load_from_file() {
        let dir = std::env::temp_dir().join("wxsync_config_test_load");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "reconcile_mode = \"replace\"\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.reconcile_mode, ReconcileMode::Replace);
        assert_eq!(config.request_timeout_secs, 30);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let err = Config::parse("this is not [valid toml").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.to_string().contains("Invalid TOML"));
    }

    #[test]
    fn test_unknown_mode_rejected() {
        assert!(Config::parse("reconcile_mode = \"merge\"\n").is_err());
    }

    #[test]
    fn test_unknown_keys_accepted() {
        let config = Config::parse("auto_materialize = true\ntheme = \"dark\"\n").unwrap();
        assert!(config.auto_materialize);
    }

    #[test]
    fn test_bad_source_reported() {
        let config = Config::parse("sources = [\"turbulence:wsi\"]\n").unwrap();
        assert!(matches!(
            config.feed_sources(),
            Err(ConfigError::InvalidSource(SourceParseError::UnknownProduct(_)))
        ));
    }

    #[test]
    fn test_env_password_wins() {
        let config = Config::parse("api_email = \"a@b.c\"\napi_password = \"file\"\n").unwrap();
        let creds = config.credentials_with(Some("env".into())).unwrap();
        assert_eq!(creds.password.expose_secret(), "env");
    }

    #[test]
    fn test_missing_credentials() {
        let config = Config::default();
        assert!(matches!(
            config.credentials_with(None),
            Err(ConfigError::MissingCredential("api_email"))
        ));
        let config = Config::parse("api_email = \"a@b.c\"\n").unwrap();
        assert!(matches!(
            config.credentials_with(None),
            Err(ConfigError::MissingCredential("api_password"))
        ));
    }

    // SEC-005: File size limit
    #[test]
    fn test_too_large_file_rejected() {
        let dir = std::env::temp_dir().join("wxsync_config_test_too_large");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "a".repeat(1_048_577)).unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::TooLarge(_)));

        std::fs::remove_dir_all(&dir).ok();
    }

    // SEC-006: Debug output masks the password
    #[test]
    fn test_debug_masks_password() {
        let mut config = Config::default();
        config.api_password = Some("super-secret-password".to_string());

        let debug_output = format!("{:?}", config);
        assert!(!debug_output.contains("super-secret-password"));
        assert!(debug_output.contains("[REDACTED]"));
    }
}

//! Census configuration.
//!
//! Read from an optional `geocensus.toml`:
//!
//! ```toml
//! [api]
//! base_url = "https://backoffice.example.com/api"
//! token_env = "GEOCENSUS_TOKEN"
//! request_timeout_secs = 30
//!
//! [geocoder]
//! service = "nominatim"
//! rate_limit_ms = 1500
//! ```
//!
//! Every key is optional. `GEOCENSUS_API_URL` and `GEOCENSUS_GEOCODER`
//! override the file; the session token is always read from the variable
//! named by `token_env`, never from the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use geocensus_api::Session;
use geocensus_geocoder::service_registry::{self, GeocodingService};
use serde::Deserialize;
use thiserror::Error;

/// Environment variable overriding [`ApiConfig::base_url`].
pub const API_URL_ENV: &str = "GEOCENSUS_API_URL";

/// Environment variable overriding [`GeocoderConfig::service`].
pub const GEOCODER_ENV: &str = "GEOCENSUS_GEOCODER";

/// Default variable holding the session token.
pub const DEFAULT_TOKEN_ENV: &str = "GEOCENSUS_TOKEN";

const DEFAULT_API_URL: &str = "http://localhost:8080/api";

/// Errors loading the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("Failed to read {}: {source}", path.display())]
    Io {
        /// File that was read.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML for [`CensusConfig`].
    #[error("Invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configured geocoding service does not exist.
    #[error("Unknown geocoding service '{id}'")]
    UnknownService {
        /// The configured identifier.
        id: String,
    },

    /// The HTTP client could not be built.
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CensusConfig {
    /// Back-office API settings.
    pub api: ApiConfig,
    /// Geocoding settings.
    pub geocoder: GeocoderConfig,
}

/// Back-office API settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ApiConfig {
    /// Root of the geolocation endpoints.
    pub base_url: String,
    /// Environment variable holding the session token.
    pub token_env: String,
    /// Transport timeout for every HTTP request. Unset means none.
    pub request_timeout_secs: Option<u64>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_URL.to_string(),
            token_env: DEFAULT_TOKEN_ENV.to_string(),
            request_timeout_secs: None,
        }
    }
}

/// Geocoding settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GeocoderConfig {
    /// Service id from the embedded registry.
    pub service: String,
    /// Replaces the service's own delay between requests.
    pub rate_limit_ms: Option<u64>,
}

impl Default for GeocoderConfig {
    fn default() -> Self {
        Self {
            service: service_registry::DEFAULT_SERVICE_ID.to_string(),
            rate_limit_ms: None,
        }
    }
}

impl CensusConfig {
    /// Loads the file at `path` (defaults when `None`) and applies the
    /// process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                log::debug!("Loaded configuration from {}", path.display());
                Self::from_toml_str(&text)?
            }
            None => Self::default(),
        };
        config.apply_overrides(|var| std::env::var(var).ok());
        Ok(config)
    }

    /// Parses a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] on malformed input or unknown keys.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Applies environment overrides through `lookup`. Blank values are
    /// ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        if let Some(url) = get(API_URL_ENV) {
            log::debug!("{API_URL_ENV} overrides the API base URL");
            self.api.base_url = url;
        }
        if let Some(service) = get(GEOCODER_ENV) {
            log::debug!("{GEOCODER_ENV} overrides the geocoding service");
            self.geocoder.service = service;
        }
    }

    /// Session built from the token variable.
    #[must_use]
    pub fn session(&self) -> Session {
        Session::from_env(&self.api.token_env)
    }

    /// The configured geocoding service.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownService`] if the id is not registered.
    pub fn service(&self) -> Result<GeocodingService, ConfigError> {
        service_registry::service_by_id(&self.geocoder.service).ok_or_else(|| {
            ConfigError::UnknownService {
                id: self.geocoder.service.clone(),
            }
        })
    }

    /// Delay replacing the service's own rate limit, if configured.
    #[must_use]
    pub fn rate_limit_override(&self) -> Option<Duration> {
        self.geocoder.rate_limit_ms.map(Duration::from_millis)
    }

    /// Shared HTTP client for the API and the geocoder.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Http`] if the client cannot be built.
    pub fn http_client(&self) -> Result<reqwest::Client, ConfigError> {
        let mut builder = reqwest::Client::builder();
        if let Some(secs) = self.api.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        Ok(builder.build()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = CensusConfig::from_toml_str("").unwrap();
        assert_eq!(config, CensusConfig::default());
        assert_eq!(config.api.token_env, "GEOCENSUS_TOKEN");
        assert_eq!(config.geocoder.service, "nominatim");
        assert_eq!(config.rate_limit_override(), None);
    }

    #[test]
    fn parses_full_file() {
        let config = CensusConfig::from_toml_str(
            r#"
            [api]
            base_url = "https://backoffice.example.com/api"
            token_env = "BO_TOKEN"
            request_timeout_secs = 30

            [geocoder]
            service = "google"
            rate_limit_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.api.base_url, "https://backoffice.example.com/api");
        assert_eq!(config.api.token_env, "BO_TOKEN");
        assert_eq!(config.api.request_timeout_secs, Some(30));
        assert_eq!(config.geocoder.service, "google");
        assert_eq!(config.rate_limit_override(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(matches!(
            CensusConfig::from_toml_str("[api]\nbase = \"x\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn environment_overrides_file() {
        let mut config = CensusConfig::default();
        config.apply_overrides(|var| match var {
            API_URL_ENV => Some("https://staging.example.com/api".to_string()),
            GEOCODER_ENV => Some("  ".to_string()),
            _ => None,
        });
        assert_eq!(config.api.base_url, "https://staging.example.com/api");
        assert_eq!(config.geocoder.service, "nominatim");
    }

    #[test]
    fn resolves_registered_service() {
        let config = CensusConfig::default();
        assert_eq!(config.service().unwrap().id, "nominatim");
    }

    #[test]
    fn unknown_service_is_an_error() {
        let mut config = CensusConfig::default();
        config.geocoder.service = "bing".to_string();
        assert!(matches!(
            config.service(),
            Err(ConfigError::UnknownService { id }) if id == "bing"
        ));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let result = CensusConfig::load(Some(Path::new("/nonexistent/geocensus.toml")));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn builds_http_client_with_timeout() {
        let mut config = CensusConfig::default();
        config.api.request_timeout_secs = Some(5);
        assert!(config.http_client().is_ok());
    }
}

#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Client side of the back-office geolocation API.
//!
//! Three endpoints back the census pipeline:
//!
//! - a batch *cache-status check* ("which of these codes already have
//!   fresh coordinates?"),
//! - a per-code *cached geolocation fetch*,
//! - a *batch save* that upserts newly computed results.
//!
//! The pipeline talks to them through the [`CacheStatusChecker`] and
//! [`PersistenceGateway`] traits so tests can substitute in-memory fakes;
//! [`client::GeolocationApiClient`] is the reqwest implementation.
//!
//! Every call takes an explicit [`Session`] carrying the bearer credential
//! issued by the session-management layer.

pub mod client;

use geocensus_api_models::{
    BatchSaveItem, BatchSaveResponse, CacheStatusResponse, CachedGeolocation,
};
use thiserror::Error;

/// Bearer credential for the back-office API.
#[derive(Clone, Default)]
pub struct Session {
    token: Option<String>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Session {
    /// Creates a session. Blank tokens count as no credential.
    #[must_use]
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: token
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty()),
        }
    }

    /// Creates a session from the environment variable `var`.
    #[must_use]
    pub fn from_env(var: &str) -> Self {
        Self::new(std::env::var(var).ok())
    }

    /// Whether a credential is present.
    #[must_use]
    pub const fn has_credential(&self) -> bool {
        self.token.is_some()
    }

    /// Returns the bearer token.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::MissingCredential`] if the session has none.
    pub fn bearer(&self) -> Result<&str, ApiError> {
        self.token.as_deref().ok_or(ApiError::MissingCredential)
    }
}

/// Errors from the geolocation API.
#[derive(Debug, Error)]
pub enum ApiError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The session carries no credential.
    #[error("No session credential available")]
    MissingCredential,

    /// The server rejected the credential (HTTP 401).
    #[error("Session credential rejected by the server")]
    Unauthorized,

    /// The server answered with a non-success status.
    #[error("Server returned status {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body preview.
        message: String,
    },

    /// The configured base URL cannot be used.
    #[error("Invalid API URL: {message}")]
    Url {
        /// Description of the problem.
        message: String,
    },
}

impl ApiError {
    /// Whether the error means the credential is missing or rejected.
    /// These abort a run instead of degrading it.
    #[must_use]
    pub const fn is_auth(&self) -> bool {
        matches!(self, Self::MissingCredential | Self::Unauthorized)
    }
}

/// Read side of the durable geolocation cache.
#[async_trait::async_trait]
pub trait CacheStatusChecker: Send + Sync {
    /// Reports the cache status of every code in one batch call.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] if the request fails or is rejected.
    async fn check(
        &self,
        session: &Session,
        codes: &[String],
    ) -> Result<CacheStatusResponse, ApiError>;

    /// Fetches the cached coordinates of one code.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] if the request fails or is rejected.
    async fn fetch_cached(
        &self,
        session: &Session,
        code: &str,
    ) -> Result<CachedGeolocation, ApiError>;
}

/// Write side of the durable geolocation cache.
#[async_trait::async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Upserts a batch of geocoding results.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] if the request fails or is rejected.
    async fn save_batch(
        &self,
        session: &Session,
        items: &[BatchSaveItem],
    ) -> Result<BatchSaveResponse, ApiError>;
}

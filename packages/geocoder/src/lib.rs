#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Geocoding providers for the geolocation census.
//!
//! Two interchangeable backends are supported, each described by a TOML
//! file in `services/`:
//!
//! 1. **Google Maps Geocoding API**: requires an API key, tolerates
//!    roughly 10 requests per second.
//! 2. **Nominatim / `OpenStreetMap`**: free, strict 1 request per second
//!    limit, needs a descriptive `User-Agent`.
//!
//! Exactly one backend is active per process; it is chosen from
//! configuration via [`create_provider`] and never renegotiated at
//! runtime. Providers do not sleep between calls: the caller applies
//! [`GeocodingProvider::rate_limit`] after every request.

pub mod address;
pub mod google;
pub mod nominatim;
pub mod service_registry;

use std::sync::Arc;
use std::time::Duration;

use geocensus_entity_models::{AddressFields, Coordinates};
use strum_macros::{AsRefStr, Display};
use thiserror::Error;

use crate::service_registry::{GeocodingService, ProviderConfig};

/// A geocoding hit with provider metadata.
#[derive(Debug, Clone)]
pub struct GeocodedAddress {
    /// Resolved coordinates (WGS84).
    pub coordinates: Coordinates,
    /// The matched/canonical address returned by the geocoder.
    pub matched_address: Option<String>,
    /// Which provider resolved this address.
    pub provider: ProviderKind,
}

/// Which backend family a provider belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ProviderKind {
    /// Google Maps Geocoding API.
    Google,
    /// Nominatim / `OpenStreetMap`.
    Nominatim,
}

/// Errors from geocoding operations.
#[derive(Debug, Error)]
pub enum GeocodeError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Response parsing failed.
    #[error("Parse error: {message}")]
    Parse {
        /// Description of the parsing failure.
        message: String,
    },

    /// Rate limit exceeded.
    #[error("Rate limit exceeded")]
    RateLimited,

    /// The provider answered with an error status.
    #[error("Provider error ({status}): {message}")]
    Api {
        /// Provider status code or label.
        status: String,
        /// Message returned by the provider, if any.
        message: String,
    },

    /// The provider could not be configured.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of what is missing or malformed.
        message: String,
    },
}

/// Reads the coordinate `field` of a provider response object.
///
/// Nominatim sends coordinates as decimal strings, Google as JSON numbers;
/// both are accepted. `context` names the object in error messages.
pub(crate) fn coordinate_field(
    object: &serde_json::Value,
    field: &str,
    context: &str,
) -> Result<f64, GeocodeError> {
    let value = &object[field];
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
        .filter(|v: &f64| v.is_finite())
        .ok_or_else(|| GeocodeError::Parse {
            message: format!("Missing {context}.{field} in response"),
        })
}

/// A geocoding backend.
///
/// [`try_geocode`](Self::try_geocode) reports every failure;
/// [`geocode`](Self::geocode) is what the census pipeline calls and never
/// fails: errors and empty result sets are logged and become a miss.
#[async_trait::async_trait]
pub trait GeocodingProvider: Send + Sync {
    /// Identifier of the service this provider was built from.
    fn id(&self) -> &str;

    /// Backend family.
    fn kind(&self) -> ProviderKind;

    /// Minimum delay the caller must leave after every request.
    fn rate_limit(&self) -> Duration;

    /// Builds the query string for an entity's address.
    fn build_address(&self, fields: &AddressFields<'_>) -> String {
        address::build_address(fields, None)
    }

    /// Geocodes a single free-form address.
    ///
    /// # Errors
    ///
    /// Returns [`GeocodeError`] if the HTTP request or response parsing
    /// fails, or the provider reports an error status.
    async fn try_geocode(&self, address: &str) -> Result<Option<GeocodedAddress>, GeocodeError>;

    /// Geocodes a single address, reporting any failure as `None`.
    async fn geocode(&self, address: &str) -> Option<Coordinates> {
        match self.try_geocode(address).await {
            Ok(Some(hit)) if hit.coordinates.is_valid() => Some(hit.coordinates),
            Ok(Some(hit)) => {
                log::warn!(
                    "{}: discarding out-of-range coordinates {:?} for '{address}'",
                    self.id(),
                    hit.coordinates
                );
                None
            }
            Ok(None) => {
                log::debug!("{}: no match for '{address}'", self.id());
                None
            }
            Err(e) => {
                log::warn!("{} error for '{address}': {e}", self.id());
                None
            }
        }
    }
}

/// Builds the active provider for a configured service.
///
/// `rate_limit_override` replaces the delay declared in the service TOML
/// when set.
///
/// # Errors
///
/// Returns [`GeocodeError::Config`] if the service needs an API key and the
/// environment variable it names is unset or empty.
pub fn create_provider(
    service: &GeocodingService,
    client: reqwest::Client,
    rate_limit_override: Option<Duration>,
) -> Result<Arc<dyn GeocodingProvider>, GeocodeError> {
    let rate_limit =
        rate_limit_override.unwrap_or_else(|| Duration::from_millis(service.rate_limit_ms()));

    log::info!(
        "Using geocoding service '{}' ({}), {}ms between requests",
        service.id,
        service.name,
        rate_limit.as_millis()
    );

    match &service.provider {
        ProviderConfig::Google {
            base_url,
            api_key_env,
            region,
            ..
        } => {
            let api_key = std::env::var(api_key_env)
                .ok()
                .filter(|key| !key.is_empty())
                .ok_or_else(|| GeocodeError::Config {
                    message: format!("{api_key_env} environment variable not set"),
                })?;
            Ok(Arc::new(google::GoogleGeocoder::new(
                client,
                service.id.clone(),
                base_url.clone(),
                api_key,
                region.clone(),
                rate_limit,
            )))
        }
        ProviderConfig::Nominatim {
            base_url,
            country_codes,
            country_qualifier,
            user_agent,
            ..
        } => Ok(Arc::new(nominatim::NominatimGeocoder::new(
            client,
            service.id.clone(),
            base_url.clone(),
            country_codes.clone(),
            country_qualifier.clone(),
            user_agent.clone(),
            rate_limit,
        ))),
    }
}

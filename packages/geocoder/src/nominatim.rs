//! Nominatim / `OpenStreetMap` geocoder client.
//!
//! The open-data fallback backend. Nominatim has strict rate limits:
//! **1 request per second** maximum on the public instance, and every
//! request must carry an identifying `User-Agent`.
//!
//! Queries get the configured country qualifier appended (e.g.
//! `", Italia"`), which markedly improves hit rates for small towns whose
//! names also exist abroad.
//!
//! See <https://nominatim.org/release-docs/develop/api/Search/>

use std::time::Duration;

use geocensus_entity_models::{AddressFields, Coordinates};

use crate::{
    GeocodeError, GeocodedAddress, GeocodingProvider, ProviderKind, address, coordinate_field,
};

/// Nominatim-backed [`GeocodingProvider`].
#[derive(Debug, Clone)]
pub struct NominatimGeocoder {
    client: reqwest::Client,
    id: String,
    base_url: String,
    country_codes: String,
    country_qualifier: Option<String>,
    user_agent: String,
    rate_limit: Duration,
}

impl NominatimGeocoder {
    /// Creates a client for the given Nominatim search endpoint.
    #[must_use]
    pub const fn new(
        client: reqwest::Client,
        id: String,
        base_url: String,
        country_codes: String,
        country_qualifier: Option<String>,
        user_agent: String,
        rate_limit: Duration,
    ) -> Self {
        Self {
            client,
            id,
            base_url,
            country_codes,
            country_qualifier,
            user_agent,
            rate_limit,
        }
    }
}

#[async_trait::async_trait]
impl GeocodingProvider for NominatimGeocoder {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Nominatim
    }

    fn rate_limit(&self) -> Duration {
        self.rate_limit
    }

    fn build_address(&self, fields: &AddressFields<'_>) -> String {
        address::build_address(fields, self.country_qualifier.as_deref())
    }

    async fn try_geocode(&self, address: &str) -> Result<Option<GeocodedAddress>, GeocodeError> {
        geocode_freeform(
            &self.client,
            &self.base_url,
            &self.country_codes,
            &self.user_agent,
            address,
        )
        .await
    }
}

/// Geocodes a free-form query using Nominatim.
///
/// The caller is responsible for rate limiting (see `rate_limit_ms` in the
/// service TOML configuration).
///
/// # Errors
///
/// Returns [`GeocodeError`] if the HTTP request or response parsing fails.
pub async fn geocode_freeform(
    client: &reqwest::Client,
    base_url: &str,
    country_codes: &str,
    user_agent: &str,
    query: &str,
) -> Result<Option<GeocodedAddress>, GeocodeError> {
    if query.trim().is_empty() {
        return Ok(None);
    }

    let resp = client
        .get(base_url)
        .header(reqwest::header::USER_AGENT, user_agent)
        .query(&[
            ("q", query),
            ("countrycodes", country_codes),
            ("format", "jsonv2"),
            ("limit", "1"),
        ])
        .send()
        .await?;

    if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Err(GeocodeError::RateLimited);
    }

    if !resp.status().is_success() {
        return Err(GeocodeError::Api {
            status: resp.status().to_string(),
            message: "Nominatim search failed".to_string(),
        });
    }

    let body: serde_json::Value = resp.json().await?;
    parse_response(&body)
}

/// Parses Nominatim JSON response.
fn parse_response(body: &serde_json::Value) -> Result<Option<GeocodedAddress>, GeocodeError> {
    let results = body.as_array().ok_or_else(|| GeocodeError::Parse {
        message: "Nominatim response is not an array".to_string(),
    })?;

    let Some(first) = results.first() else {
        return Ok(None);
    };

    Ok(Some(GeocodedAddress {
        coordinates: Coordinates::new(
            coordinate_field(first, "lat", "Nominatim result")?,
            coordinate_field(first, "lon", "Nominatim result")?,
        ),
        matched_address: first["display_name"].as_str().map(String::from),
        provider: ProviderKind::Nominatim,
    }))
}

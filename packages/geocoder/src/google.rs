//! Google Maps Geocoding API client.
//!
//! The map-SDK backend. Responses are a JSON envelope with a `status`
//! field; only `OK` carries results, `ZERO_RESULTS` is a plain miss and
//! `OVER_QUERY_LIMIT` signals throttling. The service TOML keeps a 100ms
//! gap between requests, well under the per-second quota.
//!
//! See <https://developers.google.com/maps/documentation/geocoding/requests-geocoding>

use std::time::Duration;

use geocensus_entity_models::Coordinates;

use crate::{GeocodeError, GeocodedAddress, GeocodingProvider, ProviderKind, coordinate_field};

/// Google-backed [`GeocodingProvider`].
#[derive(Clone)]
pub struct GoogleGeocoder {
    client: reqwest::Client,
    id: String,
    base_url: String,
    api_key: String,
    region: String,
    rate_limit: Duration,
}

impl std::fmt::Debug for GoogleGeocoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoogleGeocoder")
            .field("id", &self.id)
            .field("base_url", &self.base_url)
            .field("region", &self.region)
            .field("rate_limit", &self.rate_limit)
            .finish_non_exhaustive()
    }
}

impl GoogleGeocoder {
    /// Creates a client for the given geocoding endpoint.
    #[must_use]
    pub const fn new(
        client: reqwest::Client,
        id: String,
        base_url: String,
        api_key: String,
        region: String,
        rate_limit: Duration,
    ) -> Self {
        Self {
            client,
            id,
            base_url,
            api_key,
            region,
            rate_limit,
        }
    }
}

#[async_trait::async_trait]
impl GeocodingProvider for GoogleGeocoder {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Google
    }

    fn rate_limit(&self) -> Duration {
        self.rate_limit
    }

    async fn try_geocode(&self, address: &str) -> Result<Option<GeocodedAddress>, GeocodeError> {
        geocode_single(
            &self.client,
            &self.base_url,
            &self.api_key,
            &self.region,
            address,
        )
        .await
    }
}

/// Geocodes a single address with the Google Geocoding API.
///
/// The caller is responsible for rate limiting.
///
/// # Errors
///
/// Returns [`GeocodeError`] if the HTTP request fails, the body cannot be
/// parsed, or the API reports a non-`OK` status other than
/// `ZERO_RESULTS`.
pub async fn geocode_single(
    client: &reqwest::Client,
    base_url: &str,
    api_key: &str,
    region: &str,
    address: &str,
) -> Result<Option<GeocodedAddress>, GeocodeError> {
    if address.trim().is_empty() {
        return Ok(None);
    }

    let resp = client
        .get(base_url)
        .query(&[("address", address), ("key", api_key), ("region", region)])
        .send()
        .await?;

    if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Err(GeocodeError::RateLimited);
    }

    let body: serde_json::Value = resp.json().await?;
    parse_response(&body)
}

/// Parses a Google Geocoding API response envelope.
fn parse_response(body: &serde_json::Value) -> Result<Option<GeocodedAddress>, GeocodeError> {
    let status = body["status"].as_str().ok_or_else(|| GeocodeError::Parse {
        message: "Google response missing 'status'".to_string(),
    })?;

    match status {
        "OK" => {}
        "ZERO_RESULTS" => return Ok(None),
        "OVER_QUERY_LIMIT" | "OVER_DAILY_LIMIT" => return Err(GeocodeError::RateLimited),
        other => {
            return Err(GeocodeError::Api {
                status: other.to_string(),
                message: body["error_message"].as_str().unwrap_or_default().to_string(),
            });
        }
    }

    let Some(first) = body["results"].as_array().and_then(|r| r.first()) else {
        return Ok(None);
    };

    let location = &first["geometry"]["location"];
    let lat = coordinate_field(location, "lat", "geometry.location")?;
    let lng = coordinate_field(location, "lng", "geometry.location")?;

    Ok(Some(GeocodedAddress {
        coordinates: Coordinates::new(lat, lng),
        matched_address: first["formatted_address"].as_str().map(String::from),
        provider: ProviderKind::Google,
    }))
}

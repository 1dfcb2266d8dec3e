#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Entity and geolocation types shared by the census pipeline.
//!
//! Each tracking screen of the back-office manages its own kind of
//! business record. The pipeline only needs a stable code, a postal
//! address and a mutable geolocation slot, which the [`CensusEntity`]
//! trait captures. [`Entity`] is the stock record type used by the CLI
//! and by the JSON payloads of the back-office API.

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// A WGS84 coordinate pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
}

impl Coordinates {
    /// Creates a new coordinate pair.
    #[must_use]
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Whether both components are finite and inside the WGS84 ranges.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// Borrowed view over the postal address of an entity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddressFields<'a> {
    /// Street and house number.
    pub street: &'a str,
    /// Postal code (CAP).
    pub postal_code: &'a str,
    /// City or municipality (comune).
    pub city: &'a str,
    /// Province, either the two-letter code or the full name.
    pub province: &'a str,
    /// Free-text administrative region.
    pub region: &'a str,
}

/// Geolocation state carried by every entity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Geolocation {
    /// Latitude, `None` until geocoded.
    #[serde(default)]
    pub lat: Option<f64>,
    /// Longitude, `None` until geocoded.
    #[serde(default)]
    pub lng: Option<f64>,
    /// Whether the entity carries usable coordinates.
    #[serde(default)]
    pub geocoded: bool,
    /// Whether the coordinates came from the durable cache.
    #[serde(default)]
    pub from_cache: bool,
}

impl Geolocation {
    /// Returns the coordinates when both components are present.
    #[must_use]
    pub fn coordinates(&self) -> Option<Coordinates> {
        match (self.lat, self.lng) {
            (Some(lat), Some(lng)) => Some(Coordinates::new(lat, lng)),
            _ => None,
        }
    }
}

/// The capability the census pipeline needs from a business record.
///
/// Implemented once per tracking screen so a single orchestrator can serve
/// all of them.
pub trait CensusEntity: Clone + Send + Sync + 'static {
    /// Stable unique key.
    fn code(&self) -> &str;

    /// Postal address used to build geocoding queries and filter subsets.
    fn address(&self) -> AddressFields<'_>;

    /// Current geolocation state.
    fn geolocation(&self) -> &Geolocation;

    /// Mutable geolocation state, written by the result merger.
    fn geolocation_mut(&mut self) -> &mut Geolocation;

    /// Builds an otherwise empty record for a code that an update batch
    /// references but the collection does not contain yet.
    fn from_code(code: &str) -> Self;
}

/// A business record with a postal address, as served by the back-office.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    /// Unique entity code.
    #[serde(alias = "codice")]
    pub code: String,
    /// Display name, if any.
    #[serde(default, alias = "ragioneSociale", skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Street and house number.
    #[serde(default, alias = "indirizzo")]
    pub street: String,
    /// Postal code.
    #[serde(default, alias = "cap")]
    pub postal_code: String,
    /// City or municipality.
    #[serde(default, alias = "comune")]
    pub city: String,
    /// Province code or name.
    #[serde(default, alias = "provincia")]
    pub province: String,
    /// Free-text region.
    #[serde(default, alias = "regione")]
    pub region: String,
    /// Geolocation state.
    #[serde(flatten)]
    pub geolocation: Geolocation,
}

impl CensusEntity for Entity {
    fn code(&self) -> &str {
        &self.code
    }

    fn address(&self) -> AddressFields<'_> {
        AddressFields {
            street: &self.street,
            postal_code: &self.postal_code,
            city: &self.city,
            province: &self.province,
            region: &self.region,
        }
    }

    fn geolocation(&self) -> &Geolocation {
        &self.geolocation
    }

    fn geolocation_mut(&mut self) -> &mut Geolocation {
        &mut self.geolocation
    }

    fn from_code(code: &str) -> Self {
        Self {
            code: code.to_string(),
            ..Self::default()
        }
    }
}

/// A partial update to an entity's geolocation. Only fields that are
/// `Some` are written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityUpdate {
    /// Code of the entity to update.
    pub code: String,
    /// New latitude.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    /// New longitude.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lng: Option<f64>,
    /// New `geocoded` flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geocoded: Option<bool>,
    /// New `from_cache` flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_cache: Option<bool>,
}

impl EntityUpdate {
    /// Update for coordinates served by the durable cache.
    #[must_use]
    pub fn from_cache(
        code: &str,
        coordinates: Option<Coordinates>,
        has_valid_coordinates: bool,
    ) -> Self {
        Self {
            code: code.to_string(),
            lat: coordinates.map(|c| c.latitude),
            lng: coordinates.map(|c| c.longitude),
            geocoded: Some(has_valid_coordinates),
            from_cache: Some(true),
        }
    }

    /// Update for coordinates freshly obtained from a geocoding provider.
    #[must_use]
    pub fn geocoded(code: &str, coordinates: Coordinates) -> Self {
        Self {
            code: code.to_string(),
            lat: Some(coordinates.latitude),
            lng: Some(coordinates.longitude),
            geocoded: Some(true),
            from_cache: Some(false),
        }
    }

    /// Overlays the present fields onto `target`.
    pub fn apply_to(&self, target: &mut Geolocation) {
        if let Some(lat) = self.lat {
            target.lat = Some(lat);
        }
        if let Some(lng) = self.lng {
            target.lng = Some(lng);
        }
        if let Some(geocoded) = self.geocoded {
            target.geocoded = geocoded;
        }
        if let Some(from_cache) = self.from_cache {
            target.from_cache = from_cache;
        }
    }
}

/// Outcome classification of a geocoding attempt.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum GeocodeQuality {
    /// Coordinates were obtained.
    Exact,
    /// No coordinates could be obtained.
    Failed,
}

/// The result of geocoding one entity during a census run.
///
/// Coordinates are present exactly when the quality is
/// [`GeocodeQuality::Exact`]; the constructors are the only way to build
/// one.
#[derive(Debug, Clone, PartialEq)]
pub struct GeocodeResult {
    code: String,
    address: String,
    coordinates: Option<Coordinates>,
    notes: Option<String>,
}

impl GeocodeResult {
    /// A successful geocode.
    #[must_use]
    pub fn exact(code: &str, address: &str, coordinates: Coordinates) -> Self {
        Self {
            code: code.to_string(),
            address: address.to_string(),
            coordinates: Some(coordinates),
            notes: None,
        }
    }

    /// A geocode that produced no coordinates.
    #[must_use]
    pub fn failed(code: &str, address: &str, notes: Option<String>) -> Self {
        Self {
            code: code.to_string(),
            address: address.to_string(),
            coordinates: None,
            notes,
        }
    }

    /// Entity code.
    #[must_use]
    pub fn code(&self) -> &str {
        &self.code
    }

    /// The address string sent to the provider.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Coordinates, present only for exact results.
    #[must_use]
    pub const fn coordinates(&self) -> Option<Coordinates> {
        self.coordinates
    }

    /// Free-form notes (e.g. the reason of a failure).
    #[must_use]
    pub fn notes(&self) -> Option<&str> {
        self.notes.as_deref()
    }

    /// Quality derived from the presence of coordinates.
    #[must_use]
    pub const fn quality(&self) -> GeocodeQuality {
        if self.coordinates.is_some() {
            GeocodeQuality::Exact
        } else {
            GeocodeQuality::Failed
        }
    }
}

/// Per-code status reported by the durable geolocation cache.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CacheStatus {
    /// The cache already holds a geolocation for the code.
    pub is_geolocated: bool,
    /// The stored geolocation is stale (address changed, low quality).
    pub needs_update: bool,
    /// Quality label stored alongside the cached coordinates.
    pub quality: Option<String>,
}

impl CacheStatus {
    /// Whether the cached coordinates can be used as-is.
    #[must_use]
    pub const fn is_fresh(&self) -> bool {
        self.is_geolocated && !self.needs_update
    }
}

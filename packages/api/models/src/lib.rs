#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Request and response bodies of the back-office geolocation API.
//!
//! All payloads are camelCase JSON.

use std::collections::BTreeMap;

use geocensus_entity_models::{CacheStatus, Coordinates, GeocodeQuality, GeocodeResult};
use serde::{Deserialize, Serialize};

/// Body of the batch cache-status check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStatusRequest {
    /// Entity codes to check.
    pub codes: Vec<String>,
}

/// Cache status of one entity code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeStatus {
    /// Entity code.
    pub code: String,
    /// The cache holds coordinates for this code.
    #[serde(default)]
    pub is_geolocated: bool,
    /// Quality label of the cached coordinates.
    #[serde(default)]
    pub quality: Option<String>,
    /// The cached coordinates are stale and should be recomputed.
    #[serde(default)]
    pub needs_update: bool,
}

/// Response of the batch cache-status check.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatusResponse {
    /// One entry per checked code. Codes the server does not know may be
    /// missing.
    #[serde(default)]
    pub per_code_status: Vec<CodeStatus>,
    /// Number of codes the server looked at.
    #[serde(default)]
    pub total_checked: u64,
    /// Number of codes that already have coordinates.
    #[serde(default)]
    pub already_geolocated: u64,
    /// Number of codes that need geocoding.
    #[serde(default)]
    pub need_geolocation: u64,
}

impl CacheStatusResponse {
    /// Indexes the per-code entries by code.
    #[must_use]
    pub fn into_status_map(self) -> BTreeMap<String, CacheStatus> {
        self.per_code_status
            .into_iter()
            .map(|status| {
                (
                    status.code,
                    CacheStatus {
                        is_geolocated: status.is_geolocated,
                        needs_update: status.needs_update,
                        quality: status.quality,
                    },
                )
            })
            .collect()
    }
}

/// Cached geolocation of a single code.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedGeolocation {
    /// Cached latitude.
    #[serde(default)]
    pub latitude: Option<f64>,
    /// Cached longitude.
    #[serde(default)]
    pub longitude: Option<f64>,
    /// Quality label stored with the coordinates.
    #[serde(default)]
    pub quality: Option<String>,
    /// Server-side verdict on whether the coordinates are usable.
    #[serde(default)]
    pub has_valid_coordinates: bool,
}

impl CachedGeolocation {
    /// Returns the coordinates when both components are present.
    #[must_use]
    pub fn coordinates(&self) -> Option<Coordinates> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lng)) => Some(Coordinates::new(lat, lng)),
            _ => None,
        }
    }
}

/// One geocoding outcome to persist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSaveItem {
    /// Entity code.
    pub code: String,
    /// Latitude, absent for failed geocodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    /// Longitude, absent for failed geocodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    /// The address string that was geocoded.
    pub address: String,
    /// `EXACT` or `FAILED`.
    pub quality: GeocodeQuality,
    /// Optional notes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl From<&GeocodeResult> for BatchSaveItem {
    fn from(result: &GeocodeResult) -> Self {
        let coordinates = result.coordinates();
        Self {
            code: result.code().to_string(),
            latitude: coordinates.map(|c| c.latitude),
            longitude: coordinates.map(|c| c.longitude),
            address: result.address().to_string(),
            quality: result.quality(),
            notes: result.notes().map(String::from),
        }
    }
}

/// Body of the batch persistence call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSaveRequest {
    /// Results to upsert.
    pub items: Vec<BatchSaveItem>,
}

/// Response of the batch persistence call.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSaveResponse {
    /// Items stored successfully.
    #[serde(default)]
    pub success_count: u64,
    /// Items the server rejected.
    #[serde(default)]
    pub failed_count: u64,
    /// Items inserted for the first time.
    #[serde(default)]
    pub created_count: u64,
    /// Items that replaced an existing record.
    #[serde(default)]
    pub updated_count: u64,
    /// Per-item error messages.
    #[serde(default)]
    pub errors: Vec<String>,
}

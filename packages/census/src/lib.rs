#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Geolocation census for back-office entity collections.
//!
//! A census run takes the entities of one region (optionally one
//! province), and for each of them:
//!
//! 1. asks the durable cache which codes already have fresh coordinates,
//! 2. fetches those coordinates from the cache,
//! 3. geocodes the rest one at a time through the configured provider,
//!    sleeping the provider's rate limit after every call,
//! 4. saves all new results in a single batch,
//!
//! while publishing progress counters and honouring cooperative
//! cancellation. If the cache cannot be queried at all the run falls back
//! to geocoding every entity.
//!
//! The pipeline is split as follows:
//!
//! - [`selection`]: region/province filter that picks the run's subset.
//! - [`merge`]: overlays partial updates onto the entity collection.
//! - [`progress`]: counters polled by the UI, plus the
//!   [`progress::ProgressCallback`] rendering hook.
//! - [`orchestrator`]: the run state machine.
//! - [`config`]: file and environment configuration.

pub mod config;
pub mod merge;
pub mod orchestrator;
pub mod progress;
pub mod selection;

use serde::Serialize;
use strum_macros::{AsRefStr, Display};
use thiserror::Error;

pub use merge::EntityCollection;
pub use orchestrator::{CensusOrchestrator, CensusReport};
pub use progress::{ProgressState, ProgressTracker};
pub use selection::CensusSelection;

/// Lifecycle state of a [`CensusOrchestrator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, AsRefStr)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum CensusState {
    /// No run has started yet.
    Idle,
    /// A run is in flight.
    Running,
    /// The last run processed every entity.
    Completed,
    /// The last run stopped early because cancellation was requested.
    Cancelled,
    /// The last run could not query the cache and geocoded everything.
    FallbackCompleted,
    /// The last run was refused before doing any work.
    Rejected,
}

/// Reasons a census run is refused.
///
/// Only precondition failures surface as errors; cache, provider and
/// persistence failures degrade the run instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CensusError {
    /// No region was selected.
    #[error("Select a region before starting the census")]
    EmptyRegion,

    /// The selected region is not one of the 20 regions.
    #[error("'{input}' is not a recognised region")]
    UnknownRegion {
        /// The text that failed to resolve.
        input: String,
    },

    /// The selection matched no entity.
    #[error("No entities found in {region}{}", province_suffix(.province.as_deref()))]
    EmptySelection {
        /// Canonical region name.
        region: String,
        /// Province refinement, if any.
        province: Option<String>,
    },

    /// The session carries no credential.
    #[error("You are not signed in: no session credential available")]
    MissingCredential,

    /// The server rejected the session credential.
    #[error("Your session has expired or was rejected; sign in again")]
    Unauthorized,

    /// Another census is still running.
    #[error("A census is already running; wait for it to finish or cancel it")]
    AlreadyRunning,
}

fn province_suffix(province: Option<&str>) -> String {
    province.map(|p| format!(" ({p})")).unwrap_or_default()
}

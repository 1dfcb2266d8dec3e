//! Region/province selection of the entities a census run targets.

use geocensus_entity_models::CensusEntity;
use geocensus_region::{Region, matches_region, normalize_key, to_canonical_region};

use crate::CensusError;

/// The filter a user picks before starting a census.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CensusSelection {
    /// Region as typed or picked by the user. Mandatory.
    pub region: String,
    /// Optional province refinement (code such as `"RM"` or a name).
    pub province: Option<String>,
}

impl CensusSelection {
    /// Creates a selection for a region, optionally narrowed to a province.
    #[must_use]
    pub fn new(region: impl Into<String>, province: Option<String>) -> Self {
        Self {
            region: region.into(),
            province: province.filter(|p| !p.trim().is_empty()),
        }
    }

    /// Resolves the selected region.
    ///
    /// # Errors
    ///
    /// Returns [`CensusError::EmptyRegion`] if no region was given and
    /// [`CensusError::UnknownRegion`] if it does not name one of the 20
    /// regions.
    pub fn resolve_region(&self) -> Result<Region, CensusError> {
        if self.region.trim().is_empty() {
            return Err(CensusError::EmptyRegion);
        }
        to_canonical_region(&self.region).ok_or_else(|| CensusError::UnknownRegion {
            input: self.region.clone(),
        })
    }

    /// Returns the entities the selection covers, in input order.
    ///
    /// # Errors
    ///
    /// Returns the [`resolve_region`](Self::resolve_region) errors, or
    /// [`CensusError::EmptySelection`] if nothing matches.
    pub fn subset<E: CensusEntity>(&self, entities: &[E]) -> Result<Vec<E>, CensusError> {
        let region = self.resolve_region()?;
        let province_key = self.province.as_deref().map(normalize_key);

        let subset: Vec<E> = entities
            .iter()
            .filter(|e| matches_region(e.address().region, region))
            .filter(|e| {
                province_key
                    .as_ref()
                    .is_none_or(|key| normalize_key(e.address().province) == *key)
            })
            .cloned()
            .collect();

        if subset.is_empty() {
            return Err(CensusError::EmptySelection {
                region: region.name().to_string(),
                province: self.province.clone(),
            });
        }

        Ok(subset)
    }
}

/// Entities to show as map markers for a region, independent of any
/// census run.
#[must_use]
pub fn filter_markers<E: CensusEntity>(entities: &[E], region: Region) -> Vec<&E> {
    entities
        .iter()
        .filter(|e| matches_region(e.address().region, region))
        .collect()
}

//! Merging partial geolocation updates into the entity collection.
//!
//! Updates are keyed by entity code. An update only writes the fields it
//! carries, so cache hits and fresh geocodes can be applied in separate
//! batches without clobbering each other. Entries are never removed.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use geocensus_entity_models::{CensusEntity, EntityUpdate};

/// Overlays `updates` onto `previous`, keyed by code.
///
/// Codes unknown to `previous` get a fresh entry built with
/// [`CensusEntity::from_code`]. Duplicate codes in `previous` collapse to a
/// single entry. Applying the same batch twice yields the same collection
/// as applying it once, and an empty batch returns `previous` untouched.
///
/// Output order is not part of the contract (this implementation keeps
/// first-seen order).
#[must_use]
pub fn merge<E: CensusEntity>(previous: Vec<E>, updates: &[EntityUpdate]) -> Vec<E> {
    if updates.is_empty() {
        return previous;
    }

    let mut index: BTreeMap<String, usize> = BTreeMap::new();
    let mut merged: Vec<E> = Vec::with_capacity(previous.len());

    for entity in previous {
        if let Some(&slot) = index.get(entity.code()) {
            merged[slot] = entity;
        } else {
            index.insert(entity.code().to_string(), merged.len());
            merged.push(entity);
        }
    }

    for update in updates {
        let slot = match index.get(&update.code) {
            Some(&slot) => slot,
            None => {
                index.insert(update.code.clone(), merged.len());
                merged.push(E::from_code(&update.code));
                merged.len() - 1
            }
        };
        update.apply_to(merged[slot].geolocation_mut());
    }

    merged
}

/// The authoritative in-memory entity collection of one screen.
///
/// A running census is its only writer; readers (map, table, exports) take
/// snapshots at any time and see cache hits as soon as they are merged.
#[derive(Debug, Default)]
pub struct EntityCollection<E> {
    entities: RwLock<Vec<E>>,
}

impl<E: CensusEntity> EntityCollection<E> {
    /// Wraps a freshly loaded page of entities.
    #[must_use]
    pub const fn new(entities: Vec<E>) -> Self {
        Self {
            entities: RwLock::new(entities),
        }
    }

    /// Clones the current contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<E> {
        self.entities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the collection is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Looks up one entity by code.
    #[must_use]
    pub fn get(&self, code: &str) -> Option<E> {
        self.entities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|e| e.code() == code)
            .cloned()
    }

    /// Merges a batch of updates in place.
    pub fn apply(&self, updates: &[EntityUpdate]) {
        if updates.is_empty() {
            return;
        }
        let mut guard = self
            .entities
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let previous = std::mem::take(&mut *guard);
        *guard = merge(previous, updates);
    }

    /// Consumes the collection, returning its entities.
    #[must_use]
    pub fn into_inner(self) -> Vec<E> {
        self.entities
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

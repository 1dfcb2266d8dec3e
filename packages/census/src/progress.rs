//! Progress reporting for census runs.
//!
//! Two consumers exist. Polling UIs read a [`ProgressState`] snapshot
//! from a [`ProgressTracker`] whenever they redraw. Push-style renderers
//! (terminal progress bars, log-only reporting) implement
//! [`ProgressCallback`] and get driven by the tracker as the counters
//! move.
//!
//! Only the orchestrator mutates a tracker, between suspension points, so
//! relaxed atomics are enough; `current` is clamped to `total`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::Serialize;

/// Trait for reporting progress from long-running operations.
///
/// Implementations must be `Send + Sync` to support use across spawned
/// tokio tasks and `Arc`-based sharing.
pub trait ProgressCallback: Send + Sync {
    /// Set the total expected units of work (enables percentage/ETA).
    fn set_total(&self, total: u64);

    /// Advance progress by `delta` units.
    fn inc(&self, delta: u64);

    /// Update the message displayed alongside the progress indicator.
    fn set_message(&self, msg: String);

    /// Mark progress as complete with a final message.
    fn finish(&self, msg: String);
}

/// A no-op implementation of [`ProgressCallback`].
pub struct NullProgress;

impl ProgressCallback for NullProgress {
    fn set_total(&self, _total: u64) {}
    fn inc(&self, _delta: u64) {}
    fn set_message(&self, _msg: String) {}
    fn finish(&self, _msg: String) {}
}

/// Point-in-time view of a run's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressState {
    /// Entities processed so far.
    pub current: u64,
    /// Entities in the run.
    pub total: u64,
    /// Entities resolved from the cache.
    pub from_cache: u64,
    /// Entities newly geocoded by the provider.
    pub new_geocoded: u64,
    /// Whether a run is in flight.
    pub is_active: bool,
}

impl ProgressState {
    /// Entities processed without obtaining coordinates.
    #[must_use]
    pub const fn failed(&self) -> u64 {
        self.current
            .saturating_sub(self.from_cache)
            .saturating_sub(self.new_geocoded)
    }
}

#[derive(Default)]
struct Counters {
    current: AtomicU64,
    total: AtomicU64,
    from_cache: AtomicU64,
    new_geocoded: AtomicU64,
    is_active: AtomicBool,
}

/// Shared progress counters of a census orchestrator.
///
/// Cloning is cheap and every clone observes the same counters.
#[derive(Clone, Default)]
pub struct ProgressTracker {
    counters: Arc<Counters>,
    callback: Option<Arc<dyn ProgressCallback>>,
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("state", &self.snapshot())
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

impl ProgressTracker {
    /// Creates an idle tracker with no renderer attached.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an idle tracker that also drives `callback`.
    #[must_use]
    pub fn with_callback(callback: Arc<dyn ProgressCallback>) -> Self {
        Self {
            counters: Arc::default(),
            callback: Some(callback),
        }
    }

    /// Reads the counters.
    #[must_use]
    pub fn snapshot(&self) -> ProgressState {
        let c = &self.counters;
        let total = c.total.load(Ordering::Relaxed);
        ProgressState {
            current: c.current.load(Ordering::Relaxed).min(total),
            total,
            from_cache: c.from_cache.load(Ordering::Relaxed),
            new_geocoded: c.new_geocoded.load(Ordering::Relaxed),
            is_active: c.is_active.load(Ordering::Relaxed),
        }
    }

    /// Whether a run is in flight.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.counters.is_active.load(Ordering::Relaxed)
    }

    /// Resets every counter for a run over `total` entities.
    pub(crate) fn start(&self, total: u64) {
        let c = &self.counters;
        c.current.store(0, Ordering::Relaxed);
        c.from_cache.store(0, Ordering::Relaxed);
        c.new_geocoded.store(0, Ordering::Relaxed);
        c.total.store(total, Ordering::Relaxed);
        c.is_active.store(true, Ordering::Relaxed);

        if let Some(cb) = &self.callback {
            cb.set_total(total);
            cb.set_message("Checking geolocation cache".to_string());
        }
    }

    /// Advances `current`, never past `total`. Returns whether it moved.
    fn advance(&self) -> bool {
        let total = self.counters.total.load(Ordering::Relaxed);
        let moved = self
            .counters
            .current
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                (current < total).then_some(current + 1)
            })
            .is_ok();

        if moved && let Some(cb) = &self.callback {
            cb.inc(1);
        }
        moved
    }

    /// Records an entity resolved from the cache.
    pub(crate) fn record_cache_hit(&self) {
        if self.advance() {
            self.counters.from_cache.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records an entity geocoded by the provider.
    pub(crate) fn record_geocoded(&self) {
        if self.advance() {
            self.counters.new_geocoded.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records an entity the provider could not resolve.
    pub(crate) fn record_failed(&self) {
        self.advance();
    }

    /// Updates the renderer's message.
    pub(crate) fn set_message(&self, msg: impl Into<String>) {
        if let Some(cb) = &self.callback {
            cb.set_message(msg.into());
        }
    }

    /// Marks the run as finished. Only the first call after
    /// [`start`](Self::start) has an effect; returns whether this call
    /// flipped the flag.
    pub(crate) fn finish(&self, msg: impl Into<String>) -> bool {
        let was_active = self.counters.is_active.swap(false, Ordering::Relaxed);
        if was_active && let Some(cb) = &self.callback {
            cb.finish(msg.into());
        }
        was_active
    }
}

//! The census run state machine.
//!
//! A run walks `Idle -> Running -> {Completed, Cancelled,
//! FallbackCompleted, Rejected}`. Admission is checked synchronously before
//! any I/O; afterwards the only suspension points are the cache and
//! persistence calls, the provider calls and the rate-limit sleep.
//! Cancellation is polled:
//!
//! - before the cache status check,
//! - before each entity of the cache phase,
//! - before the geocoding phase,
//! - after each provider call (once the rate-limit delay has elapsed).
//!
//! Provider calls are strictly sequential.

use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use geocensus_api::{ApiError, CacheStatusChecker, PersistenceGateway, Session};
use geocensus_api_models::{BatchSaveItem, BatchSaveResponse};
use geocensus_entity_models::{CacheStatus, CensusEntity, EntityUpdate, GeocodeResult};
use geocensus_geocoder::GeocodingProvider;
use tokio_util::sync::CancellationToken;

use crate::merge::EntityCollection;
use crate::progress::{ProgressState, ProgressTracker};
use crate::selection::CensusSelection;
use crate::{CensusError, CensusState};

/// Summary of a finished (non-rejected) run.
#[derive(Debug, Clone)]
pub struct CensusReport {
    /// Terminal state of the run.
    pub state: CensusState,
    /// Counters at the end of the run.
    pub progress: ProgressState,
    /// One result per provider call, in call order.
    pub results: Vec<GeocodeResult>,
    /// Server answer to the batch save, if one was attempted and succeeded.
    pub saved: Option<BatchSaveResponse>,
    /// When the run was admitted.
    pub started_at: DateTime<Utc>,
    /// When the run reached its terminal state.
    pub finished_at: DateTime<Utc>,
}

impl CensusReport {
    /// Entities processed without obtaining coordinates.
    #[must_use]
    pub const fn failed(&self) -> u64 {
        self.progress.failed()
    }

    /// Wall-clock duration of the run.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }
}

struct Outcome {
    state: CensusState,
    results: Vec<GeocodeResult>,
    saved: Option<BatchSaveResponse>,
}

impl Outcome {
    const fn cancelled() -> Self {
        Self {
            state: CensusState::Cancelled,
            results: Vec::new(),
            saved: None,
        }
    }
}

#[derive(Default)]
struct GeocodePass {
    results: Vec<GeocodeResult>,
    updates: Vec<EntityUpdate>,
    cancelled: bool,
}

/// Marks the run as cancelled if its future is dropped mid-flight.
struct RunGuard<'a> {
    state: &'a Mutex<CensusState>,
    progress: &'a ProgressTracker,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == CensusState::Running {
            log::warn!("Census run abandoned before completion");
            *state = CensusState::Cancelled;
            self.progress.finish("Census abandoned");
        }
    }
}

/// Drives geolocation census runs over entities of type `E`.
///
/// One orchestrator serves one screen: runs never overlap, and the
/// progress tracker and cancellation handle are shared with the UI.
pub struct CensusOrchestrator<E> {
    session: Session,
    provider: Arc<dyn GeocodingProvider>,
    cache: Arc<dyn CacheStatusChecker>,
    persistence: Arc<dyn PersistenceGateway>,
    progress: ProgressTracker,
    state: Mutex<CensusState>,
    cancel: Mutex<CancellationToken>,
    _entity: PhantomData<fn() -> E>,
}

impl<E> std::fmt::Debug for CensusOrchestrator<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CensusOrchestrator")
            .field("session", &self.session)
            .field("provider", &self.provider.id())
            .field("progress", &self.progress)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl<E: CensusEntity> CensusOrchestrator<E> {
    /// Creates an idle orchestrator with its own progress tracker.
    #[must_use]
    pub fn new(
        session: Session,
        provider: Arc<dyn GeocodingProvider>,
        cache: Arc<dyn CacheStatusChecker>,
        persistence: Arc<dyn PersistenceGateway>,
    ) -> Self {
        Self {
            session,
            provider,
            cache,
            persistence,
            progress: ProgressTracker::new(),
            state: Mutex::new(CensusState::Idle),
            cancel: Mutex::new(CancellationToken::new()),
            _entity: PhantomData,
        }
    }

    /// Replaces the progress tracker (e.g. one driving a progress bar).
    #[must_use]
    pub fn with_progress(mut self, progress: ProgressTracker) -> Self {
        self.progress = progress;
        self
    }

    /// The tracker UIs poll for counters.
    #[must_use]
    pub const fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> CensusState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Requests cancellation of the run in flight. Has no effect on later
    /// runs.
    pub fn cancel(&self) {
        log::info!("Census cancellation requested");
        self.cancellation_token().cancel();
    }

    /// Token of the current (or last) run.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Runs a census over the entities of `selection`, merging results into
    /// `entities`.
    ///
    /// # Errors
    ///
    /// Returns [`CensusError`] if the run is refused: invalid selection,
    /// missing or rejected credential, or another run in flight. Cache,
    /// provider and persistence failures degrade the run instead.
    pub async fn run(
        &self,
        selection: &CensusSelection,
        entities: &EntityCollection<E>,
    ) -> Result<CensusReport, CensusError> {
        self.run_with_token(selection, entities, CancellationToken::new())
            .await
    }

    /// Like [`run`](Self::run), observing an externally owned token as well
    /// as [`cancel`](Self::cancel).
    ///
    /// # Errors
    ///
    /// See [`run`](Self::run).
    pub async fn run_with_token(
        &self,
        selection: &CensusSelection,
        entities: &EntityCollection<E>,
        token: CancellationToken,
    ) -> Result<CensusReport, CensusError> {
        let subset = self.admit(selection, entities, &token).inspect_err(|e| {
            log::warn!("Census not started: {e}");
        })?;

        let started_at = Utc::now();
        let _guard = RunGuard {
            state: &self.state,
            progress: &self.progress,
        };

        log::info!(
            "Starting census of {} entities in {} via {}",
            subset.len(),
            selection.region,
            self.provider.id()
        );
        self.progress.start(subset.len() as u64);

        let outcome = match self.execute(&subset, entities, &token).await {
            Ok(outcome) => outcome,
            Err(e) => {
                log::error!("Census aborted: {e}");
                self.transition(CensusState::Rejected, e.to_string());
                return Err(e);
            }
        };

        let progress = self.progress.snapshot();
        let summary = format!(
            "{}: {} from cache, {} geocoded, {} failed",
            outcome.state,
            progress.from_cache,
            progress.new_geocoded,
            progress.failed()
        );
        log::info!("Census finished ({summary})");
        self.transition(outcome.state, summary);

        Ok(CensusReport {
            state: outcome.state,
            progress: self.progress.snapshot(),
            results: outcome.results,
            saved: outcome.saved,
            started_at,
            finished_at: Utc::now(),
        })
    }

    /// Entry guard. Runs under the state lock so two concurrent callers
    /// cannot both be admitted.
    fn admit(
        &self,
        selection: &CensusSelection,
        entities: &EntityCollection<E>,
        token: &CancellationToken,
    ) -> Result<Vec<E>, CensusError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == CensusState::Running {
            return Err(CensusError::AlreadyRunning);
        }

        let admitted = selection.subset(&entities.snapshot()).and_then(|subset| {
            if self.session.has_credential() {
                Ok(subset)
            } else {
                Err(CensusError::MissingCredential)
            }
        });

        match admitted {
            Ok(subset) => {
                *state = CensusState::Running;
                *self.cancel.lock().unwrap_or_else(PoisonError::into_inner) = token.clone();
                Ok(subset)
            }
            Err(e) => {
                *state = CensusState::Rejected;
                Err(e)
            }
        }
    }

    fn transition(&self, next: CensusState, message: String) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
        self.progress.finish(message);
    }

    async fn execute(
        &self,
        subset: &[E],
        entities: &EntityCollection<E>,
        token: &CancellationToken,
    ) -> Result<Outcome, CensusError> {
        if token.is_cancelled() {
            return Ok(Outcome::cancelled());
        }

        let codes: Vec<String> = subset.iter().map(|e| e.code().to_string()).collect();
        let statuses = match self.cache.check(&self.session, &codes).await {
            Ok(response) => {
                log::info!(
                    "Cache status: {} checked, {} geolocated, {} to geocode",
                    response.total_checked,
                    response.already_geolocated,
                    response.need_geolocation
                );
                response.into_status_map()
            }
            Err(e) if e.is_auth() => {
                return Err(match e {
                    ApiError::MissingCredential => CensusError::MissingCredential,
                    _ => CensusError::Unauthorized,
                });
            }
            Err(e) => {
                if token.is_cancelled() {
                    return Ok(Outcome::cancelled());
                }
                log::warn!(
                    "Cache status check failed, geocoding all {} entities: {e}",
                    subset.len()
                );
                return Ok(self.fallback(subset, entities, token).await);
            }
        };

        let mut cache_updates = Vec::new();
        let mut pending: Vec<&E> = Vec::new();
        let mut cancelled = false;

        for entity in subset {
            if token.is_cancelled() {
                cancelled = true;
                break;
            }

            let code = entity.code();
            if statuses.get(code).is_some_and(CacheStatus::is_fresh) {
                match self.cache.fetch_cached(&self.session, code).await {
                    Ok(cached) => {
                        let coordinates = cached.coordinates();
                        let usable = cached.has_valid_coordinates && coordinates.is_some();
                        log::debug!("{code}: served from cache ({coordinates:?})");
                        cache_updates.push(EntityUpdate::from_cache(code, coordinates, usable));
                        self.progress.record_cache_hit();
                        continue;
                    }
                    Err(e) => log::warn!("{code}: cached fetch failed, geocoding instead: {e}"),
                }
            }
            pending.push(entity);
        }

        entities.apply(&cache_updates);

        if cancelled || token.is_cancelled() {
            return Ok(Outcome::cancelled());
        }

        log::info!(
            "{} entities served from cache, {} to geocode",
            cache_updates.len(),
            pending.len()
        );

        let pass = self.geocode_each(pending, token).await;
        let saved = if pass.results.is_empty() {
            None
        } else {
            self.save(&pass.results).await
        };
        entities.apply(&pass.updates);

        Ok(Outcome {
            state: if pass.cancelled {
                CensusState::Cancelled
            } else {
                CensusState::Completed
            },
            results: pass.results,
            saved,
        })
    }

    /// Geocodes the whole subset without the cache. Nothing is persisted.
    async fn fallback(
        &self,
        subset: &[E],
        entities: &EntityCollection<E>,
        token: &CancellationToken,
    ) -> Outcome {
        let pass = self.geocode_each(subset.iter().collect(), token).await;
        entities.apply(&pass.updates);

        Outcome {
            state: if pass.cancelled {
                CensusState::Cancelled
            } else {
                CensusState::FallbackCompleted
            },
            results: pass.results,
            saved: None,
        }
    }

    async fn geocode_each(&self, pending: Vec<&E>, token: &CancellationToken) -> GeocodePass {
        let mut pass = GeocodePass::default();
        if token.is_cancelled() {
            pass.cancelled = true;
            return pass;
        }

        let delay = self.provider.rate_limit();

        for entity in pending {
            let code = entity.code();
            let address = self.provider.build_address(&entity.address());
            self.progress.set_message(format!("Geocoding {code}"));

            if let Some(coordinates) = self.provider.geocode(&address).await {
                log::debug!("{code}: geocoded '{address}' to {coordinates:?}");
                pass.updates.push(EntityUpdate::geocoded(code, coordinates));
                pass.results
                    .push(GeocodeResult::exact(code, &address, coordinates));
                self.progress.record_geocoded();
            } else {
                log::debug!("{code}: no coordinates for '{address}'");
                pass.results.push(GeocodeResult::failed(
                    code,
                    &address,
                    Some(format!("No result from {}", self.provider.id())),
                ));
                self.progress.record_failed();
            }

            tokio::time::sleep(delay).await;

            if token.is_cancelled() {
                log::info!("Census cancelled after {} provider calls", pass.results.len());
                pass.cancelled = true;
                break;
            }
        }

        pass
    }

    /// Persists results in one batch. Failures are logged and not retried.
    async fn save(&self, results: &[GeocodeResult]) -> Option<BatchSaveResponse> {
        let items: Vec<BatchSaveItem> = results.iter().map(BatchSaveItem::from).collect();
        self.progress
            .set_message(format!("Saving {} results", items.len()));

        match self.persistence.save_batch(&self.session, &items).await {
            Ok(response) => {
                log::info!(
                    "Saved geocode results: {} ok, {} failed ({} created, {} updated)",
                    response.success_count,
                    response.failed_count,
                    response.created_count,
                    response.updated_count
                );
                for error in &response.errors {
                    log::warn!("Batch save: {error}");
                }
                Some(response)
            }
            Err(e) => {
                log::error!("Failed to save {} geocode results: {e}", items.len());
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use geocensus_api_models::{CacheStatusResponse, CachedGeolocation, CodeStatus};
    use geocensus_entity_models::{Coordinates, Entity, GeocodeQuality, Geolocation};
    use geocensus_geocoder::{GeocodeError, GeocodedAddress, ProviderKind};
    use tokio::time::Instant;

    type Hook = Box<dyn Fn(usize) + Send + Sync>;

    /// Resolves addresses from a fixed table and records call instants.
    struct MockProvider {
        hits: BTreeMap<String, Coordinates>,
        delay: Duration,
        calls: Mutex<Vec<(String, Instant)>>,
        on_call: Option<Hook>,
    }

    impl MockProvider {
        fn new(hits: &[(&str, Coordinates)], delay_ms: u64) -> Self {
            Self {
                hits: hits
                    .iter()
                    .map(|(city, c)| ((*city).to_string(), *c))
                    .collect(),
                delay: Duration::from_millis(delay_ms),
                calls: Mutex::new(Vec::new()),
                on_call: None,
            }
        }

        fn with_hook(mut self, hook: impl Fn(usize) + Send + Sync + 'static) -> Self {
            self.on_call = Some(Box::new(hook));
            self
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        fn instants(&self) -> Vec<Instant> {
            self.calls.lock().unwrap().iter().map(|(_, at)| *at).collect()
        }
    }

    #[async_trait::async_trait]
    impl GeocodingProvider for MockProvider {
        fn id(&self) -> &str {
            "mock"
        }

        fn kind(&self) -> ProviderKind {
            ProviderKind::Nominatim
        }

        fn rate_limit(&self) -> Duration {
            self.delay
        }

        async fn try_geocode(
            &self,
            address: &str,
        ) -> Result<Option<GeocodedAddress>, GeocodeError> {
            let count = {
                let mut calls = self.calls.lock().unwrap();
                calls.push((address.to_string(), Instant::now()));
                calls.len()
            };
            if let Some(hook) = &self.on_call {
                hook(count);
            }
            Ok(self
                .hits
                .iter()
                .find(|(city, _)| address.contains(city.as_str()))
                .map(|(_, c)| GeocodedAddress {
                    coordinates: *c,
                    matched_address: None,
                    provider: ProviderKind::Nominatim,
                }))
        }
    }

    #[derive(Clone, Copy)]
    enum CheckFailure {
        Unauthorized,
        MissingCredential,
        Server,
    }

    #[derive(Default)]
    struct MockCache {
        statuses: Vec<CodeStatus>,
        cached: BTreeMap<String, CachedGeolocation>,
        check_failure: Option<CheckFailure>,
        checked: Mutex<Vec<Vec<String>>>,
        fetches: Mutex<Vec<String>>,
        on_fetch: Option<Hook>,
    }

    impl MockCache {
        fn fresh(mut self, code: &str, lat: f64, lng: f64) -> Self {
            self.statuses.push(CodeStatus {
                code: code.to_string(),
                is_geolocated: true,
                quality: Some("EXACT".to_string()),
                needs_update: false,
            });
            self.cached.insert(
                code.to_string(),
                CachedGeolocation {
                    latitude: Some(lat),
                    longitude: Some(lng),
                    quality: Some("EXACT".to_string()),
                    has_valid_coordinates: true,
                },
            );
            self
        }

        fn stale(mut self, code: &str) -> Self {
            self.statuses.push(CodeStatus {
                code: code.to_string(),
                is_geolocated: true,
                quality: Some("APPROXIMATE".to_string()),
                needs_update: true,
            });
            self
        }

        /// Reported fresh by the check, but the fetch fails.
        fn unreachable(mut self, code: &str) -> Self {
            self.statuses.push(CodeStatus {
                code: code.to_string(),
                is_geolocated: true,
                quality: None,
                needs_update: false,
            });
            self
        }

        fn failing(failure: CheckFailure) -> Self {
            Self {
                check_failure: Some(failure),
                ..Self::default()
            }
        }

        fn with_hook(mut self, hook: impl Fn(usize) + Send + Sync + 'static) -> Self {
            self.on_fetch = Some(Box::new(hook));
            self
        }

        fn fetch_count(&self) -> usize {
            self.fetches.lock().unwrap().len()
        }
    }

    #[async_trait::async_trait]
    impl CacheStatusChecker for MockCache {
        async fn check(
            &self,
            _session: &Session,
            codes: &[String],
        ) -> Result<CacheStatusResponse, ApiError> {
            self.checked.lock().unwrap().push(codes.to_vec());
            match self.check_failure {
                Some(CheckFailure::Unauthorized) => Err(ApiError::Unauthorized),
                Some(CheckFailure::MissingCredential) => Err(ApiError::MissingCredential),
                Some(CheckFailure::Server) => Err(ApiError::Status {
                    status: 500,
                    message: "boom".to_string(),
                }),
                None => Ok(CacheStatusResponse {
                    per_code_status: self
                        .statuses
                        .iter()
                        .filter(|s| codes.contains(&s.code))
                        .cloned()
                        .collect(),
                    total_checked: codes.len() as u64,
                    ..CacheStatusResponse::default()
                }),
            }
        }

        async fn fetch_cached(
            &self,
            _session: &Session,
            code: &str,
        ) -> Result<CachedGeolocation, ApiError> {
            let count = {
                let mut fetches = self.fetches.lock().unwrap();
                fetches.push(code.to_string());
                fetches.len()
            };
            if let Some(hook) = &self.on_fetch {
                hook(count);
            }
            self.cached.get(code).cloned().ok_or(ApiError::Status {
                status: 404,
                message: "not found".to_string(),
            })
        }
    }

    #[derive(Default)]
    struct MockPersistence {
        fail: bool,
        batches: Mutex<Vec<Vec<BatchSaveItem>>>,
    }

    impl MockPersistence {
        fn batch_count(&self) -> usize {
            self.batches.lock().unwrap().len()
        }
    }

    #[async_trait::async_trait]
    impl PersistenceGateway for MockPersistence {
        async fn save_batch(
            &self,
            _session: &Session,
            items: &[BatchSaveItem],
        ) -> Result<BatchSaveResponse, ApiError> {
            self.batches.lock().unwrap().push(items.to_vec());
            if self.fail {
                return Err(ApiError::Status {
                    status: 503,
                    message: "unavailable".to_string(),
                });
            }
            Ok(BatchSaveResponse {
                success_count: items.len() as u64,
                created_count: items.len() as u64,
                ..BatchSaveResponse::default()
            })
        }
    }

    struct Harness {
        provider: Arc<MockProvider>,
        cache: Arc<MockCache>,
        persistence: Arc<MockPersistence>,
        orchestrator: Arc<CensusOrchestrator<Entity>>,
    }

    fn harness(provider: MockProvider, cache: MockCache, persistence: MockPersistence) -> Harness {
        harness_with_session(
            provider,
            cache,
            persistence,
            Session::new(Some("token".to_string())),
        )
    }

    fn harness_with_session(
        provider: MockProvider,
        cache: MockCache,
        persistence: MockPersistence,
        session: Session,
    ) -> Harness {
        let provider = Arc::new(provider);
        let cache = Arc::new(cache);
        let persistence = Arc::new(persistence);
        let orchestrator = Arc::new(CensusOrchestrator::new(
            session,
            provider.clone(),
            cache.clone(),
            persistence.clone(),
        ));
        Harness {
            provider,
            cache,
            persistence,
            orchestrator,
        }
    }

    fn entity(code: &str, region: &str, province: &str, city: &str) -> Entity {
        Entity {
            code: code.to_string(),
            street: format!("Via {code} 1"),
            city: city.to_string(),
            province: province.to_string(),
            region: region.to_string(),
            ..Entity::default()
        }
    }

    fn lazio(n: usize) -> EntityCollection<Entity> {
        EntityCollection::new(
            (1..=n)
                .map(|i| entity(&format!("L{i}"), "Lazio", "RM", "Roma"))
                .collect(),
        )
    }

    fn roma() -> Coordinates {
        Coordinates::new(41.9, 12.5)
    }

    fn assert_counters_balance(report: &CensusReport) {
        let p = report.progress;
        assert_eq!(p.current, p.total);
        assert_eq!(p.from_cache + p.new_geocoded + p.failed(), p.total);
    }

    #[tokio::test(start_paused = true)]
    async fn geocodes_only_the_selected_region() {
        let h = harness(
            MockProvider::new(&[("Roma", roma())], 100),
            MockCache::default(),
            MockPersistence::default(),
        );
        let entities = EntityCollection::new(vec![
            entity("A1", "Lazio", "RM", "Roma"),
            entity("A2", "Lombardia", "MI", "Milano"),
        ]);

        let report = h
            .orchestrator
            .run(&CensusSelection::new("Lazio", None), &entities)
            .await
            .unwrap();

        assert_eq!(report.state, CensusState::Completed);
        assert_eq!(*h.cache.checked.lock().unwrap(), vec![vec!["A1".to_string()]]);
        assert_eq!(h.provider.call_count(), 1);
        assert!(!h.provider.calls.lock().unwrap()[0].0.contains("Milano"));

        let a1 = entities.get("A1").unwrap();
        assert_eq!(a1.geolocation.coordinates(), Some(roma()));
        assert!(a1.geolocation.geocoded);
        assert!(!a1.geolocation.from_cache);
        assert_eq!(entities.get("A2").unwrap().geolocation, Geolocation::default());

        let batches = h.persistence.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 1);
        assert_eq!(batches[0][0].code, "A1");
        assert_eq!(batches[0][0].quality, GeocodeQuality::Exact);
        assert_counters_balance(&report);
        assert!(!report.progress.is_active);
        assert_eq!(h.orchestrator.state(), CensusState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn all_fresh_means_no_provider_calls() {
        let cache = MockCache::default()
            .fresh("L1", 41.9, 12.5)
            .fresh("L2", 41.8, 12.4)
            .fresh("L3", 41.7, 12.3);
        let h = harness(
            MockProvider::new(&[], 100),
            cache,
            MockPersistence::default(),
        );
        let entities = lazio(3);

        let report = h
            .orchestrator
            .run(&CensusSelection::new("Lazio", None), &entities)
            .await
            .unwrap();

        assert_eq!(report.state, CensusState::Completed);
        assert_eq!(h.cache.fetch_count(), 3);
        assert_eq!(h.provider.call_count(), 0);
        assert_eq!(h.persistence.batch_count(), 0);
        assert_eq!(report.progress.from_cache, 3);
        assert!(report.results.is_empty());
        assert_counters_balance(&report);

        let l2 = entities.get("L2").unwrap();
        assert!(l2.geolocation.from_cache);
        assert!(l2.geolocation.geocoded);
        assert_eq!(l2.geolocation.coordinates(), Some(Coordinates::new(41.8, 12.4)));
    }

    #[tokio::test(start_paused = true)]
    async fn mixes_cache_hits_stale_entries_and_misses() {
        // L1 fresh, L2 stale, L3 unknown to the cache, L4 provider miss.
        let cache = MockCache::default().fresh("L1", 41.9, 12.5).stale("L2");
        let h = harness(
            MockProvider::new(&[("Roma", roma())], 100),
            cache,
            MockPersistence::default(),
        );
        let mut all: Vec<Entity> = lazio(3).into_inner();
        all.push(entity("L4", "Lazio", "RM", "Nowhere"));
        let entities = EntityCollection::new(all);

        let report = h
            .orchestrator
            .run(&CensusSelection::new("Lazio", None), &entities)
            .await
            .unwrap();

        assert_eq!(h.cache.fetch_count(), 1);
        assert_eq!(h.provider.call_count(), 3);
        assert_eq!(report.progress.from_cache, 1);
        assert_eq!(report.progress.new_geocoded, 2);
        assert_eq!(report.failed(), 1);
        assert_counters_balance(&report);

        let qualities: Vec<GeocodeQuality> =
            report.results.iter().map(GeocodeResult::quality).collect();
        assert_eq!(
            qualities,
            vec![GeocodeQuality::Exact, GeocodeQuality::Exact, GeocodeQuality::Failed]
        );
        assert_eq!(report.saved.as_ref().unwrap().success_count, 3);

        let l4 = entities.get("L4").unwrap();
        assert!(!l4.geolocation.geocoded);
        assert_eq!(l4.geolocation.coordinates(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_cached_fetch_falls_through_to_geocoding() {
        let h = harness(
            MockProvider::new(&[("Roma", roma())], 100),
            MockCache::default().unreachable("L1"),
            MockPersistence::default(),
        );
        let entities = lazio(1);

        let report = h
            .orchestrator
            .run(&CensusSelection::new("Lazio", None), &entities)
            .await
            .unwrap();

        assert_eq!(h.cache.fetch_count(), 1);
        assert_eq!(h.provider.call_count(), 1);
        assert_eq!(report.progress.new_geocoded, 1);
        assert_eq!(report.progress.from_cache, 0);
        assert_counters_balance(&report);
    }

    #[tokio::test(start_paused = true)]
    async fn check_failure_geocodes_everything_without_saving() {
        let h = harness(
            MockProvider::new(&[("Roma", roma())], 100),
            MockCache::failing(CheckFailure::Server),
            MockPersistence::default(),
        );
        let entities = lazio(4);

        let report = h
            .orchestrator
            .run(&CensusSelection::new("Lazio", None), &entities)
            .await
            .unwrap();

        assert_eq!(report.state, CensusState::FallbackCompleted);
        assert_eq!(h.provider.call_count(), 4);
        assert_eq!(h.cache.fetch_count(), 0);
        assert_eq!(h.persistence.batch_count(), 0);
        assert!(report.saved.is_none());
        assert_eq!(report.results.len(), 4);
        assert_counters_balance(&report);
        assert!(entities.get("L3").unwrap().geolocation.geocoded);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_credential_aborts_before_processing() {
        let h = harness(
            MockProvider::new(&[("Roma", roma())], 100),
            MockCache::failing(CheckFailure::Unauthorized),
            MockPersistence::default(),
        );
        let entities = lazio(2);

        let result = h
            .orchestrator
            .run(&CensusSelection::new("Lazio", None), &entities)
            .await;

        assert_eq!(result.unwrap_err(), CensusError::Unauthorized);
        assert_eq!(h.orchestrator.state(), CensusState::Rejected);
        assert_eq!(h.provider.call_count(), 0);
        assert_eq!(h.persistence.batch_count(), 0);
        assert!(!h.orchestrator.progress().is_active());
        assert_eq!(h.orchestrator.progress().snapshot().current, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn credential_refused_by_the_cache_check_aborts() {
        let h = harness(
            MockProvider::new(&[("Roma", roma())], 100),
            MockCache::failing(CheckFailure::MissingCredential),
            MockPersistence::default(),
        );

        let result = h
            .orchestrator
            .run(&CensusSelection::new("Lazio", None), &lazio(2))
            .await;

        assert_eq!(result.unwrap_err(), CensusError::MissingCredential);
        assert_eq!(h.orchestrator.state(), CensusState::Rejected);
        assert_eq!(h.cache.checked.lock().unwrap().len(), 1);
        assert_eq!(h.provider.call_count(), 0);
    }

    #[tokio::test]
    async fn missing_credential_is_rejected_before_io() {
        let h = harness_with_session(
            MockProvider::new(&[], 100),
            MockCache::default(),
            MockPersistence::default(),
            Session::new(Some("   ".to_string())),
        );

        let result = h
            .orchestrator
            .run(&CensusSelection::new("Lazio", None), &lazio(1))
            .await;

        assert_eq!(result.unwrap_err(), CensusError::MissingCredential);
        assert_eq!(h.orchestrator.state(), CensusState::Rejected);
        assert!(h.cache.checked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_selections_are_rejected_before_io() {
        let h = harness(
            MockProvider::new(&[], 100),
            MockCache::default(),
            MockPersistence::default(),
        );
        let entities = lazio(2);

        for (selection, expected) in [
            (CensusSelection::new("", None), CensusError::EmptyRegion),
            (
                CensusSelection::new("Atlantide", None),
                CensusError::UnknownRegion {
                    input: "Atlantide".to_string(),
                },
            ),
            (
                CensusSelection::new("Lazio", Some("LT".to_string())),
                CensusError::EmptySelection {
                    region: "Lazio".to_string(),
                    province: Some("LT".to_string()),
                },
            ),
        ] {
            let err = h.orchestrator.run(&selection, &entities).await.unwrap_err();
            assert_eq!(err, expected);
            assert_eq!(h.orchestrator.state(), CensusState::Rejected);
        }

        assert!(h.cache.checked.lock().unwrap().is_empty());
        assert_eq!(h.provider.call_count(), 0);
    }

    #[tokio::test]
    async fn pre_cancelled_token_does_nothing() {
        let h = harness(
            MockProvider::new(&[("Roma", roma())], 100),
            MockCache::default(),
            MockPersistence::default(),
        );
        let token = CancellationToken::new();
        token.cancel();

        let report = h
            .orchestrator
            .run_with_token(&CensusSelection::new("Lazio", None), &lazio(3), token)
            .await
            .unwrap();

        assert_eq!(report.state, CensusState::Cancelled);
        assert!(h.cache.checked.lock().unwrap().is_empty());
        assert_eq!(h.provider.call_count(), 0);
        assert_eq!(report.progress.current, 0);
        assert!(!report.progress.is_active);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_provider_calls_and_keeps_partial_results() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        let provider = MockProvider::new(&[("Roma", roma())], 1000).with_hook(move |count| {
            if count == 2 {
                trigger.cancel();
            }
        });
        let h = harness(provider, MockCache::default(), MockPersistence::default());
        let entities = lazio(5);

        let report = h
            .orchestrator
            .run_with_token(&CensusSelection::new("Lazio", None), &entities, token)
            .await
            .unwrap();

        assert_eq!(report.state, CensusState::Cancelled);
        assert_eq!(h.provider.call_count(), 2);
        assert_eq!(report.progress.current, 2);
        assert!(report.progress.current <= report.progress.total);
        assert_eq!(report.results.len(), 2);
        assert_eq!(h.persistence.batch_count(), 1);
        assert!(entities.get("L2").unwrap().geolocation.geocoded);
        assert!(!entities.get("L3").unwrap().geolocation.geocoded);
        assert_eq!(h.orchestrator.state(), CensusState::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_cache_phase_skips_geocoding() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        let cache = MockCache::default()
            .fresh("L1", 41.9, 12.5)
            .fresh("L2", 41.8, 12.4)
            .with_hook(move |count| {
                if count == 1 {
                    trigger.cancel();
                }
            });
        let h = harness(
            MockProvider::new(&[("Roma", roma())], 100),
            cache,
            MockPersistence::default(),
        );
        let entities = lazio(3);

        let report = h
            .orchestrator
            .run_with_token(&CensusSelection::new("Lazio", None), &entities, token)
            .await
            .unwrap();

        assert_eq!(report.state, CensusState::Cancelled);
        assert_eq!(h.orchestrator.state(), CensusState::Cancelled);
        assert_eq!(h.cache.fetch_count(), 1);
        assert_eq!(h.provider.call_count(), 0);
        assert_eq!(h.persistence.batch_count(), 0);
        assert!(report.results.is_empty());
        assert_eq!(report.progress.from_cache, 1);
        assert_eq!(report.progress.current, 1);
        assert!(report.progress.current <= report.progress.total);
        assert!(!report.progress.is_active);

        let l1 = entities.get("L1").unwrap();
        assert!(l1.geolocation.from_cache);
        assert_eq!(l1.geolocation.coordinates(), Some(roma()));
        assert!(!entities.get("L2").unwrap().geolocation.from_cache);
        assert!(!entities.get("L3").unwrap().geolocation.geocoded);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_after_cache_phase_skips_geocoding() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        // The last entity is the only fresh one, so the cache loop runs to
        // completion and the poll before geocoding catches the cancel.
        let cache = MockCache::default()
            .fresh("L3", 41.7, 12.3)
            .with_hook(move |_| trigger.cancel());
        let h = harness(
            MockProvider::new(&[("Roma", roma())], 100),
            cache,
            MockPersistence::default(),
        );
        let entities = lazio(3);

        let report = h
            .orchestrator
            .run_with_token(&CensusSelection::new("Lazio", None), &entities, token)
            .await
            .unwrap();

        assert_eq!(report.state, CensusState::Cancelled);
        assert_eq!(h.cache.fetch_count(), 1);
        assert_eq!(h.provider.call_count(), 0);
        assert_eq!(h.persistence.batch_count(), 0);
        assert_eq!(report.progress.from_cache, 1);
        assert!(report.progress.current <= report.progress.total);
        assert!(entities.get("L3").unwrap().geolocation.from_cache);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_handle_stops_the_run_in_flight() {
        let h = harness(
            MockProvider::new(&[("Roma", roma())], 1000),
            MockCache::failing(CheckFailure::Server),
            MockPersistence::default(),
        );
        let entities = Arc::new(lazio(10));

        let orchestrator = h.orchestrator.clone();
        let collection = entities.clone();
        let run = tokio::spawn(async move {
            orchestrator
                .run(&CensusSelection::new("Lazio", None), &collection)
                .await
        });

        tokio::time::sleep(Duration::from_millis(2500)).await;
        h.orchestrator.cancel();

        let report = run.await.unwrap().unwrap();
        assert_eq!(report.state, CensusState::Cancelled);
        assert_eq!(h.provider.call_count(), 3);
        assert_eq!(report.progress.current, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn provider_calls_respect_the_rate_limit() {
        let h = harness(
            MockProvider::new(&[("Roma", roma())], 1000),
            MockCache::default(),
            MockPersistence::default(),
        );

        h.orchestrator
            .run(&CensusSelection::new("Lazio", None), &lazio(4))
            .await
            .unwrap();

        let instants = h.provider.instants();
        assert_eq!(instants.len(), 4);
        for pair in instants.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(1000));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn second_run_is_rejected_while_running() {
        let h = harness(
            MockProvider::new(&[("Roma", roma())], 1000),
            MockCache::default(),
            MockPersistence::default(),
        );
        let entities = Arc::new(lazio(2));

        let orchestrator = h.orchestrator.clone();
        let collection = entities.clone();
        let first = tokio::spawn(async move {
            orchestrator
                .run(&CensusSelection::new("Lazio", None), &collection)
                .await
        });
        tokio::task::yield_now().await;
        assert_eq!(h.orchestrator.state(), CensusState::Running);

        let second = h
            .orchestrator
            .run(&CensusSelection::new("Lazio", None), &entities)
            .await;
        assert_eq!(second.unwrap_err(), CensusError::AlreadyRunning);
        assert_eq!(h.orchestrator.state(), CensusState::Running);

        let report = first.await.unwrap().unwrap();
        assert_eq!(report.state, CensusState::Completed);
        assert_eq!(h.provider.call_count(), 2);
        assert_eq!(h.cache.checked.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn save_failure_keeps_results_in_memory() {
        let h = harness(
            MockProvider::new(&[("Roma", roma())], 100),
            MockCache::default(),
            MockPersistence {
                fail: true,
                ..MockPersistence::default()
            },
        );
        let entities = lazio(2);

        let report = h
            .orchestrator
            .run(&CensusSelection::new("Lazio", None), &entities)
            .await
            .unwrap();

        assert_eq!(report.state, CensusState::Completed);
        assert_eq!(h.persistence.batch_count(), 1);
        assert!(report.saved.is_none());
        assert_eq!(report.results.len(), 2);
        assert!(entities.get("L1").unwrap().geolocation.geocoded);
    }

    #[tokio::test(start_paused = true)]
    async fn runs_can_follow_each_other() {
        let h = harness(
            MockProvider::new(&[("Roma", roma())], 100),
            MockCache::default(),
            MockPersistence::default(),
        );
        let entities = lazio(2);
        let selection = CensusSelection::new("Lazio", None);

        h.orchestrator.cancel();
        let first = h.orchestrator.run(&selection, &entities).await.unwrap();
        let second = h.orchestrator.run(&selection, &entities).await.unwrap();

        assert_eq!(first.state, CensusState::Completed);
        assert_eq!(second.state, CensusState::Completed);
        assert_eq!(second.progress.total, 2);
        assert_eq!(h.provider.call_count(), 4);
        assert_eq!(entities.len(), 2);
    }
}

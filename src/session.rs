//! Per-source orchestration.
//!
//! A [`FeedSession`] owns everything known about one source: the analysis
//! times the API offers, the last fetched snapshot, its validity windows and
//! the current window selection. It sequences fetch → filter → reconcile →
//! submit, and is the only place errors are turned into user-visible state.
//!
//! Two independent busy flags guard the session. `fetch_snapshot` and
//! `materialize` share one; `list_analysis_times` has its own. A call that
//! finds its flag taken fails fast with [`FeedError::Busy`] instead of
//! queueing. Every network call carries a generation number, and a response
//! whose generation is no longer current (after [`FeedSession::cancel_pending`])
//! is discarded without touching state.
//!
//! Sessions of one [`SessionRegistry`] also share a store lock. `materialize`
//! holds it from reading the folder list until its transaction commits, so two
//! sources reconciling at once never plan against the same stale folder list.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;

use crate::feed::{FeedSource, FetchError, Fetcher, Snapshot};
use crate::reconcile::{
    available_windows, filter, find_replace_folder, reconcile, submit, AllocationError,
    ReconcileMode, RunContext, StoreView, SubmitReceipt,
};
use crate::storage::{CollectionStore, StoreError};
use crate::util::{nearest_time, truncate_to_hour, Timestamp};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum FeedError {
    /// Credentials rejected; re-invoking will not help until they change.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Network or HTTP failure; safe to re-invoke.
    #[error("Fetch failed: {0}")]
    Fetch(#[source] FetchError),

    /// Upstream had nothing usable for the requested time.
    #[error("No data: {0}")]
    NoData(String),

    #[error("Order key allocation failed: {0}")]
    Allocation(#[from] AllocationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("No snapshot has been fetched for {0}")]
    NoSnapshot(String),

    #[error("{0} is busy with another request")]
    Busy(String),
}

impl From<FetchError> for FeedError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Auth(msg) => FeedError::Auth(msg),
            FetchError::NoData(msg) => FeedError::NoData(msg),
            other => FeedError::Fetch(other),
        }
    }
}

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TimesPhase {
    #[default]
    Idle,
    FetchingTimes,
}

/// `Failed` accepts new work exactly like `Idle`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SnapshotPhase {
    #[default]
    Idle,
    FetchingSnapshot,
    Reconciling,
    Failed,
}

/// The user's validity window choice.
///
/// `Unset` is replaced by the earliest available window when a snapshot
/// arrives; `All` is an explicit "no filtering" and is left alone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WindowSelection {
    #[default]
    Unset,
    All,
    At(Timestamp),
}

impl WindowSelection {
    pub fn window(self) -> Option<Timestamp> {
        match self {
            WindowSelection::At(t) => Some(t),
            WindowSelection::Unset | WindowSelection::All => None,
        }
    }
}

#[derive(Debug, Default)]
struct SessionState {
    analysis_times: Vec<Timestamp>,
    snapshot: Option<Arc<Snapshot>>,
    available_windows: Vec<Timestamp>,
    selection: WindowSelection,
    times_phase: TimesPhase,
    snapshot_phase: SnapshotPhase,
    last_error: Option<String>,
    last_receipt: Option<SubmitReceipt>,
}

/// Read-only copy of a session's state.
#[derive(Debug, Clone)]
pub struct SessionView {
    pub source: FeedSource,
    pub analysis_times: Vec<Timestamp>,
    pub snapshot: Option<Arc<Snapshot>>,
    pub available_windows: Vec<Timestamp>,
    pub selection: WindowSelection,
    pub times_phase: TimesPhase,
    pub snapshot_phase: SnapshotPhase,
    pub last_error: Option<String>,
    pub last_receipt: Option<SubmitReceipt>,
}

impl SessionView {
    pub fn selected_window(&self) -> Option<Timestamp> {
        self.selection.window()
    }
}

/// Result of a snapshot fetch that did not fail.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Loaded {
        analysis_time: Timestamp,
        features: usize,
        available_windows: Vec<Timestamp>,
        selected_window: Option<Timestamp>,
        /// Present when auto-materialize ran.
        materialized: Option<SubmitReceipt>,
    },
    /// The response arrived after `cancel_pending` and was dropped.
    Superseded,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SessionOptions {
    /// When set, every successful fetch is reconciled right away in this mode.
    pub auto_materialize: Option<ReconcileMode>,
}

/// Clears a busy flag when dropped.
struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// ============================================================================
// Session
// ============================================================================

pub struct FeedSession {
    source: FeedSource,
    fetcher: Arc<dyn Fetcher>,
    store: Arc<dyn CollectionStore>,
    options: SessionOptions,
    state: Mutex<SessionState>,
    store_lock: Arc<AsyncMutex<()>>,
    work_busy: AtomicBool,
    times_busy: AtomicBool,
    snapshot_generation: AtomicU64,
    times_generation: AtomicU64,
}

impl FeedSession {
    pub fn new(
        source: FeedSource,
        fetcher: Arc<dyn Fetcher>,
        store: Arc<dyn CollectionStore>,
        options: SessionOptions,
    ) -> Self {
        Self {
            source,
            fetcher,
            store,
            options,
            state: Mutex::new(SessionState::default()),
            store_lock: Arc::new(AsyncMutex::new(())),
            work_busy: AtomicBool::new(false),
            times_busy: AtomicBool::new(false),
            snapshot_generation: AtomicU64::new(0),
            times_generation: AtomicU64::new(0),
        }
    }

    /// Serializes this session's store writes with every other session
    /// holding the same lock.
    pub fn with_store_lock(mut self, lock: Arc<AsyncMutex<()>>) -> Self {
        self.store_lock = lock;
        self
    }

    pub fn source(&self) -> &FeedSource {
        &self.source
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        // State is plain data; a panic elsewhere cannot leave it half-updated
        // in a way later calls would misread.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_error(&self, err: &FeedError) {
        tracing::warn!(source = %self.source, error = %err, "Feed session operation failed");
        self.state().last_error = Some(err.to_string());
    }

    fn busy(&self) -> FeedError {
        let err = FeedError::Busy(self.source.id());
        self.record_error(&err);
        err
    }

    /// Refreshes and returns the analysis times the API offers, oldest first.
    ///
    /// A response that arrives after [`cancel_pending`](Self::cancel_pending)
    /// is dropped and the previously known list is returned unchanged.
    pub async fn list_analysis_times(&self) -> Result<Vec<Timestamp>, FeedError> {
        let Some(_guard) = BusyGuard::try_acquire(&self.times_busy) else {
            return Err(self.busy());
        };
        let generation = self.times_generation.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        self.state().times_phase = TimesPhase::FetchingTimes;

        let result = self.fetcher.analysis_times(&self.source).await;

        let mut state = self.state();
        state.times_phase = TimesPhase::Idle;
        if self.times_generation.load(Ordering::Acquire) != generation {
            tracing::debug!(source = %self.source, generation, "Discarding stale analysis times");
            return Ok(state.analysis_times.clone());
        }
        match result {
            Ok(mut times) => {
                times.sort_unstable();
                times.dedup();
                tracing::info!(source = %self.source, count = times.len(), "Analysis times refreshed");
                state.analysis_times = times.clone();
                Ok(times)
            }
            Err(e) => {
                drop(state);
                let err = FeedError::from(e);
                self.record_error(&err);
                Err(err)
            }
        }
    }

    /// Fetches the snapshot for `analysis_time`, or for
    /// [`default_analysis_time`] when omitted.
    ///
    /// On success the available windows are recomputed and, if no window has
    /// been chosen by the time the response lands, the earliest is selected.
    pub async fn fetch_snapshot(
        &self,
        analysis_time: Option<Timestamp>,
    ) -> Result<FetchOutcome, FeedError> {
        let Some(_guard) = BusyGuard::try_acquire(&self.work_busy) else {
            return Err(self.busy());
        };
        let generation = self
            .snapshot_generation
            .fetch_add(1, Ordering::AcqRel)
            .wrapping_add(1);

        let analysis_time = {
            let mut state = self.state();
            state.snapshot_phase = SnapshotPhase::FetchingSnapshot;
            analysis_time.unwrap_or_else(|| default_analysis_time(&state.analysis_times, Utc::now()))
        };
        tracing::info!(source = %self.source, analysis_time = %analysis_time, generation, "Fetching snapshot");

        let result = self.fetcher.snapshot(&self.source, analysis_time).await;

        if self.snapshot_generation.load(Ordering::Acquire) != generation {
            tracing::debug!(source = %self.source, generation, "Discarding stale snapshot");
            self.state().snapshot_phase = SnapshotPhase::Idle;
            return Ok(FetchOutcome::Superseded);
        }

        let snapshot = match result {
            Ok(snapshot) => Arc::new(snapshot),
            Err(e) => {
                let err = FeedError::from(e);
                self.state().snapshot_phase = SnapshotPhase::Failed;
                self.record_error(&err);
                return Err(err);
            }
        };

        let windows = available_windows(&snapshot);
        let features = snapshot.features.len();
        let selected_window = {
            let mut state = self.state();
            if state.selection == WindowSelection::Unset {
                if let Some(earliest) = windows.first() {
                    state.selection = WindowSelection::At(*earliest);
                }
            }
            state.snapshot = Some(snapshot);
            state.available_windows = windows.clone();
            state.last_error = None;
            state.snapshot_phase = SnapshotPhase::Idle;
            state.selection.window()
        };
        tracing::info!(
            source = %self.source,
            features,
            windows = windows.len(),
            "Snapshot loaded"
        );

        let materialized = match self.options.auto_materialize {
            Some(mode) => Some(self.run_materialize(mode).await?),
            None => None,
        };

        Ok(FetchOutcome::Loaded {
            analysis_time,
            features,
            available_windows: windows,
            selected_window,
            materialized,
        })
    }

    /// Fetches the snapshot whose analysis time is closest to `target`,
    /// refreshing the analysis time list first if none is known yet.
    pub async fn fetch_snapshot_near(&self, target: Timestamp) -> Result<FetchOutcome, FeedError> {
        let known = self.state().analysis_times.clone();
        let known = if known.is_empty() {
            self.list_analysis_times().await?
        } else {
            known
        };

        let Some(nearest) = nearest_analysis_time(target, &known) else {
            let err = FeedError::NoData(format!("{} offers no analysis times", self.source));
            self.record_error(&err);
            return Err(err);
        };
        tracing::debug!(source = %self.source, target = %target, nearest = %nearest, "Resolved nearest analysis time");
        self.fetch_snapshot(Some(nearest)).await
    }

    /// Chooses the validity window used by the next `materialize`. `None`
    /// means no filtering. Never touches the store.
    pub fn select_validity_window(&self, window: Option<Timestamp>) {
        let selection = match window {
            Some(t) => WindowSelection::At(t),
            None => WindowSelection::All,
        };
        tracing::debug!(source = %self.source, selection = ?selection, "Validity window selected");
        self.state().selection = selection;
    }

    /// Writes the current snapshot, filtered to the selected window, to the store.
    pub async fn materialize(&self, mode: ReconcileMode) -> Result<SubmitReceipt, FeedError> {
        let Some(_guard) = BusyGuard::try_acquire(&self.work_busy) else {
            return Err(self.busy());
        };
        self.run_materialize(mode).await
    }

    /// Body of `materialize`; the caller holds the work flag.
    async fn run_materialize(&self, mode: ReconcileMode) -> Result<SubmitReceipt, FeedError> {
        let current = {
            let mut state = self.state();
            let window = state.selection.window();
            let snapshot = state.snapshot.clone();
            if snapshot.is_some() {
                state.snapshot_phase = SnapshotPhase::Reconciling;
            }
            snapshot.map(|s| (s, window))
        };
        let Some((snapshot, window)) = current else {
            let err = FeedError::NoSnapshot(self.source.id());
            self.record_error(&err);
            return Err(err);
        };

        match self.reconcile_snapshot(&snapshot, window, mode).await {
            Ok(receipt) => {
                let mut state = self.state();
                state.snapshot_phase = SnapshotPhase::Idle;
                state.last_error = None;
                state.last_receipt = Some(receipt.clone());
                Ok(receipt)
            }
            Err(err) => {
                self.state().snapshot_phase = SnapshotPhase::Failed;
                self.record_error(&err);
                Err(err)
            }
        }
    }

    async fn reconcile_snapshot(
        &self,
        snapshot: &Snapshot,
        window: Option<Timestamp>,
        mode: ReconcileMode,
    ) -> Result<SubmitReceipt, FeedError> {
        let features = filter(snapshot, window);
        tracing::debug!(
            source = %self.source,
            kept = features.len(),
            total = snapshot.features.len(),
            "Filtered snapshot"
        );

        // Held until the transaction commits: the plan's folder key is only
        // valid against the folder list it was computed from.
        let _store = self.store_lock.lock().await;
        let view = load_store_view(self.store.as_ref(), mode, &self.source).await?;
        let ctx = RunContext {
            source: self.source.clone(),
            analysis_time: snapshot.analysis_time,
            window,
            retrieved_at: snapshot.retrieved_at,
        };
        let plan = reconcile(mode, &ctx, features, &view)?;
        Ok(submit(self.store.as_ref(), plan).await?)
    }

    /// Makes every in-flight response stale. The calls still return, with
    /// [`FetchOutcome::Superseded`] or the unchanged time list.
    pub fn cancel_pending(&self) {
        self.snapshot_generation.fetch_add(1, Ordering::AcqRel);
        self.times_generation.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(source = %self.source, "Cancelled pending requests");
    }

    pub fn view(&self) -> SessionView {
        let state = self.state();
        SessionView {
            source: self.source.clone(),
            analysis_times: state.analysis_times.clone(),
            snapshot: state.snapshot.clone(),
            available_windows: state.available_windows.clone(),
            selection: state.selection,
            times_phase: state.times_phase,
            snapshot_phase: state.snapshot_phase,
            last_error: state.last_error.clone(),
            last_receipt: state.last_receipt.clone(),
        }
    }
}

/// Analysis time used when the caller does not name one: the most recent
/// known time, or the current hour when nothing is known.
pub fn default_analysis_time(known: &[Timestamp], now: Timestamp) -> Timestamp {
    known
        .iter()
        .max()
        .copied()
        .unwrap_or_else(|| truncate_to_hour(now))
}

/// Closest entry of `available` to `target`; ties go to the earlier time.
pub fn nearest_analysis_time(target: Timestamp, available: &[Timestamp]) -> Option<Timestamp> {
    nearest_time(target, available)
}

/// Reads the store state `reconcile` needs for `mode`.
async fn load_store_view(
    store: &dyn CollectionStore,
    mode: ReconcileMode,
    source: &FeedSource,
) -> Result<StoreView, StoreError> {
    let folders = store.list_folders().await?;
    let mut feature_ids_by_folder = HashMap::new();
    if mode == ReconcileMode::Replace {
        if let Some(folder) = find_replace_folder(&folders, source) {
            let ids = store.feature_ids_in_folder(folder.id).await?;
            feature_ids_by_folder.insert(folder.id, ids);
        }
    }
    Ok(StoreView {
        folders,
        feature_ids_by_folder,
    })
}

// ============================================================================
// Registry
// ============================================================================

/// One session per source, created on first use.
pub struct SessionRegistry {
    fetcher: Arc<dyn Fetcher>,
    store: Arc<dyn CollectionStore>,
    options: SessionOptions,
    store_lock: Arc<AsyncMutex<()>>,
    sessions: Mutex<HashMap<FeedSource, Arc<FeedSession>>>,
}

impl SessionRegistry {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        store: Arc<dyn CollectionStore>,
        options: SessionOptions,
    ) -> Self {
        Self {
            fetcher,
            store,
            options,
            store_lock: Arc::new(AsyncMutex::new(())),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn session(&self, source: &FeedSource) -> Arc<FeedSession> {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        sessions
            .entry(source.clone())
            .or_insert_with(|| {
                tracing::debug!(source = %source, "Creating feed session");
                Arc::new(
                    FeedSession::new(
                        source.clone(),
                        Arc::clone(&self.fetcher),
                        Arc::clone(&self.store),
                        self.options,
                    )
                    .with_store_lock(Arc::clone(&self.store_lock)),
                )
            })
            .clone()
    }

    pub fn sources(&self) -> Vec<FeedSource> {
        let sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        sessions.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{PolygonFeature, Product};
    use crate::storage::{Database, FeatureId, Folder, FolderId, StoreTransaction};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Map};
    use tokio::sync::Notify;

    fn t(h: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2025, 6, 1, h, 0, 0).unwrap()
    }

    fn source() -> FeedSource {
        FeedSource::new(Product::Convection, "meteofrance")
    }

    fn feature(start: Option<Timestamp>, end: Option<Timestamp>) -> PolygonFeature {
        PolygonFeature {
            id: None,
            geometry: json!({"type": "Polygon", "coordinates": []}),
            properties: Map::new(),
            validity_start: start,
            validity_end: end,
        }
    }

    /// Serves one fixed snapshot; optionally blocks until released.
    struct StubFetcher {
        times: Vec<Timestamp>,
        features: Vec<PolygonFeature>,
        gate: Option<Arc<Notify>>,
        entered: Arc<Notify>,
    }

    impl StubFetcher {
        fn new(features: Vec<PolygonFeature>) -> Self {
            Self {
                times: vec![t(6), t(0), t(3)],
                features,
                gate: None,
                entered: Arc::new(Notify::new()),
            }
        }
    }

    #[async_trait]
    impl Fetcher for StubFetcher {
        async fn analysis_times(&self, _source: &FeedSource) -> Result<Vec<Timestamp>, FetchError> {
            Ok(self.times.clone())
        }

        async fn snapshot(
            &self,
            source: &FeedSource,
            analysis_time: Timestamp,
        ) -> Result<Snapshot, FetchError> {
            self.entered.notify_one();
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if !self.times.contains(&analysis_time) {
                return Err(FetchError::NoData("unknown analysis time".into()));
            }
            Ok(Snapshot {
                source: source.clone(),
                analysis_time,
                retrieved_at: t(7),
                features: self.features.clone(),
            })
        }
    }

    struct FailingStore;

    #[async_trait]
    impl CollectionStore for FailingStore {
        async fn list_folders(&self) -> Result<Vec<Folder>, StoreError> {
            Ok(Vec::new())
        }

        async fn feature_ids_in_folder(&self, _folder: FolderId) -> Result<Vec<FeatureId>, StoreError> {
            Ok(Vec::new())
        }

        async fn transact(&self, _tx: StoreTransaction) -> Result<(), StoreError> {
            Err(StoreError::Database(sqlx::Error::PoolTimedOut))
        }
    }

    async fn session_with(fetcher: StubFetcher, options: SessionOptions) -> (FeedSession, Arc<Database>) {
        let db = Arc::new(Database::open(":memory:").await.unwrap());
        let session = FeedSession::new(source(), Arc::new(fetcher), db.clone(), options);
        (session, db)
    }

    #[test]
    fn test_default_analysis_time() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 9, 41, 7).unwrap();
        assert_eq!(default_analysis_time(&[t(3), t(6), t(0)], now), t(6));
        assert_eq!(default_analysis_time(&[], now), t(9));
    }

    #[test]
    fn test_nearest_analysis_time_prefers_earlier_on_tie() {
        let target = Utc.with_ymd_and_hms(2025, 6, 1, 4, 30, 0).unwrap();
        assert_eq!(nearest_analysis_time(target, &[t(6), t(3)]), Some(t(3)));
        assert_eq!(nearest_analysis_time(target, &[]), None);
    }

    #[tokio::test]
    async fn test_list_analysis_times_sorted() {
        let (session, _db) = session_with(StubFetcher::new(Vec::new()), SessionOptions::default()).await;
        let times = session.list_analysis_times().await.unwrap();
        assert_eq!(times, vec![t(0), t(3), t(6)]);
        assert_eq!(session.view().analysis_times, times);
        assert_eq!(session.view().times_phase, TimesPhase::Idle);
    }

    #[tokio::test]
    async fn test_fetch_defaults_to_latest_and_selects_earliest_window() {
        let fetcher = StubFetcher::new(vec![feature(Some(t(8)), None), feature(Some(t(7)), None)]);
        let (session, _db) = session_with(fetcher, SessionOptions::default()).await;
        session.list_analysis_times().await.unwrap();

        let outcome = session.fetch_snapshot(None).await.unwrap();
        match outcome {
            FetchOutcome::Loaded {
                analysis_time,
                features,
                available_windows,
                selected_window,
                materialized,
            } => {
                assert_eq!(analysis_time, t(6));
                assert_eq!(features, 2);
                assert_eq!(available_windows, vec![t(7), t(8)]);
                assert_eq!(selected_window, Some(t(7)));
                assert!(materialized.is_none());
            }
            FetchOutcome::Superseded => panic!("unexpected supersede"),
        }
        assert_eq!(session.view().snapshot_phase, SnapshotPhase::Idle);
    }

    #[tokio::test]
    async fn test_explicit_all_selection_survives_fetch() {
        let fetcher = StubFetcher::new(vec![feature(Some(t(8)), None)]);
        let (session, _db) = session_with(fetcher, SessionOptions::default()).await;
        session.select_validity_window(None);
        session.fetch_snapshot(Some(t(6))).await.unwrap();
        let view = session.view();
        assert_eq!(view.selection, WindowSelection::All);
        assert_eq!(view.selected_window(), None);
    }

    #[tokio::test]
    async fn test_materialize_without_snapshot() {
        let (session, _db) = session_with(StubFetcher::new(Vec::new()), SessionOptions::default()).await;
        let err = session.materialize(ReconcileMode::Append).await.unwrap_err();
        assert!(matches!(err, FeedError::NoSnapshot(_)));
        assert!(session.view().last_error.unwrap().contains("No snapshot"));
    }

    #[tokio::test]
    async fn test_no_data_recorded_and_session_reusable() {
        let (session, _db) = session_with(StubFetcher::new(Vec::new()), SessionOptions::default()).await;
        let err = session.fetch_snapshot(Some(t(1))).await.unwrap_err();
        assert!(matches!(err, FeedError::NoData(_)));
        let view = session.view();
        assert_eq!(view.snapshot_phase, SnapshotPhase::Failed);
        assert!(view.last_error.is_some());

        session.fetch_snapshot(Some(t(0))).await.unwrap();
        let view = session.view();
        assert_eq!(view.snapshot_phase, SnapshotPhase::Idle);
        assert!(view.last_error.is_none());
    }

    #[tokio::test]
    async fn test_materialize_uses_selected_window() {
        let fetcher = StubFetcher::new(vec![
            feature(Some(t(0)), None),
            feature(Some(t(0)), None),
            feature(Some(t(1)), Some(t(2))),
        ]);
        let (session, db) = session_with(fetcher, SessionOptions::default()).await;
        session.fetch_snapshot(Some(t(0))).await.unwrap();

        session.select_validity_window(Some(t(1)));
        let receipt = session.materialize(ReconcileMode::Replace).await.unwrap();
        assert_eq!(receipt.features_put, 1);
        assert!(receipt.created_folder);

        let stored = db.get_features_in_folder(receipt.folder_id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(session.view().last_receipt, Some(receipt));
    }

    #[tokio::test]
    async fn test_auto_materialize_after_fetch() {
        let fetcher = StubFetcher::new(vec![feature(Some(t(0)), None)]);
        let options = SessionOptions {
            auto_materialize: Some(ReconcileMode::Replace),
        };
        let (session, db) = session_with(fetcher, options).await;

        let outcome = session.fetch_snapshot(Some(t(0))).await.unwrap();
        let FetchOutcome::Loaded { materialized: Some(receipt), .. } = outcome else {
            panic!("expected auto-materialized outcome");
        };
        assert_eq!(receipt.mode, ReconcileMode::Replace);
        assert_eq!(db.get_folders().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_store_failure_recorded() {
        let fetcher = StubFetcher::new(vec![feature(Some(t(0)), None)]);
        let session = FeedSession::new(
            source(),
            Arc::new(fetcher),
            Arc::new(FailingStore),
            SessionOptions::default(),
        );
        session.fetch_snapshot(Some(t(0))).await.unwrap();

        let err = session.materialize(ReconcileMode::Append).await.unwrap_err();
        assert!(matches!(err, FeedError::Store(StoreError::Database(sqlx::Error::PoolTimedOut))));
        let view = session.view();
        assert_eq!(view.snapshot_phase, SnapshotPhase::Failed);
        assert!(view.last_error.unwrap().contains("disk on fire"));
        assert!(view.snapshot.is_some(), "snapshot kept for a retry");
    }

    #[tokio::test]
    async fn test_busy_and_cancel_pending() {
        let gate = Arc::new(Notify::new());
        let mut fetcher = StubFetcher::new(vec![feature(Some(t(0)), None)]);
        fetcher.gate = Some(gate.clone());
        let entered = fetcher.entered.clone();
        let (session, _db) = session_with(fetcher, SessionOptions::default()).await;
        let session = Arc::new(session);

        let in_flight = {
            let session = session.clone();
            tokio::spawn(async move { session.fetch_snapshot(Some(t(0))).await })
        };
        entered.notified().await;

        let busy = session.materialize(ReconcileMode::Append).await.unwrap_err();
        assert!(matches!(busy, FeedError::Busy(_)));
        assert!(matches!(
            session.fetch_snapshot(Some(t(0))).await,
            Err(FeedError::Busy(_))
        ));

        session.cancel_pending();
        gate.notify_one();
        let outcome = in_flight.await.unwrap().unwrap();
        assert!(matches!(outcome, FetchOutcome::Superseded));
        assert!(session.view().snapshot.is_none());

        // Flag released: new work is accepted.
        assert!(matches!(
            session.materialize(ReconcileMode::Append).await,
            Err(FeedError::NoSnapshot(_))
        ));
    }

    #[tokio::test]
    async fn test_fetch_snapshot_near_lists_times_first() {
        let fetcher = StubFetcher::new(vec![feature(Some(t(4)), None)]);
        let (session, _db) = session_with(fetcher, SessionOptions::default()).await;
        let target = Utc.with_ymd_and_hms(2025, 6, 1, 2, 10, 0).unwrap();

        let outcome = session.fetch_snapshot_near(target).await.unwrap();
        let FetchOutcome::Loaded { analysis_time, .. } = outcome else {
            panic!("expected loaded snapshot");
        };
        assert_eq!(analysis_time, t(3));
        assert_eq!(session.view().analysis_times.len(), 3);
    }

    #[tokio::test]
    async fn test_registry_reuses_sessions() {
        let db: Arc<dyn CollectionStore> = Arc::new(Database::open(":memory:").await.unwrap());
        let registry = SessionRegistry::new(
            Arc::new(StubFetcher::new(Vec::new())),
            db,
            SessionOptions::default(),
        );
        let a = registry.session(&source());
        let b = registry.session(&source());
        let c = registry.session(&FeedSource::new(Product::Icing, "meteofrance"));
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.sources().len(), 2);
    }
}

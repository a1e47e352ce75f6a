use anyhow::{Result, Context};
use futures::FutureExt;
use mongodb::bson::oid::ObjectId;
use std::any::Any;
use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::cli::config::{CrawlerConfig, CrawlerSettings, RotationPolicy, UnusableContentPolicy};
use crate::crawler::task::{FetchOutcome, PageFetcher, QueueItem, TaskError, TaskExecutor};
use crate::proxy::{IdentityRotator, ProxyManager, TorController};
use crate::storage::{ItemState, StoreBackend};
use crate::utils::metrics::RunMetrics;

/// Lifecycle of one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Initializing,
    Draining,
    ShuttingDown,
    Terminated,
}

/// Why a run stopped draining
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// No pending items left
    Drained,
    /// A termination signal arrived
    Interrupted,
    /// The store failed mid-run
    Fatal(String),
}

/// Status change applied to a queue item for a task outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    MarkFailed,
    MarkFetched,
    LeavePending,
}

impl Transition {
    pub fn for_outcome(outcome: &FetchOutcome, unusable: UnusableContentPolicy) -> Self {
        match (outcome.fetched, outcome.saved) {
            (false, _) => Transition::MarkFailed,
            (true, true) => Transition::MarkFetched,
            (true, false) => match unusable {
                UnusableContentPolicy::MarkFailed => Transition::MarkFailed,
                UnusableContentPolicy::KeepPending => Transition::LeavePending,
            },
        }
    }
}

/// Summary handed back when a run terminates
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub reason: StopReason,
    pub metrics: RunMetrics,
}

type TaskResult = (ObjectId, Result<FetchOutcome, TaskError>);

/// Drains the pending backlog in batches of concurrent fetch tasks
pub struct CrawlerController {
    run_id: Uuid,
    state: RunState,

    /// Batch size and concurrency limit
    workers: usize,
    rotation: RotationPolicy,
    unusable_content: UnusableContentPolicy,
    task_timeout: Duration,

    store: Arc<dyn StoreBackend>,
    executor: Arc<dyn TaskExecutor>,
    rotator: Option<Arc<dyn IdentityRotator>>,

    /// Caps the number of fetch tasks alive at once
    limiter: Arc<Semaphore>,
    in_flight: JoinSet<TaskResult>,

    /// Items left pending this run; never reselected until the next run
    deferred: HashSet<ObjectId>,

    metrics: RunMetrics,
}

impl CrawlerController {
    /// Wire up fetching and rotation around an opened store.
    ///
    /// The controller owns the store from here on; if it cannot be built the
    /// store is closed before the error is returned.
    pub async fn new(config: &CrawlerConfig, store: Arc<dyn StoreBackend>) -> Result<Self> {
        let rotator: Option<Arc<dyn IdentityRotator>> = match config.crawler.rotation {
            RotationPolicy::Off => None,
            RotationPolicy::PerTask | RotationPolicy::PerBatch => match TorController::from_settings(&config.proxy) {
                Some(controller) => Some(Arc::new(controller)),
                None => {
                    let e = anyhow::anyhow!("Identity rotation requires a control password");
                    return Err(abandon(&store, e).await);
                }
            },
        };

        let mut fetcher = PageFetcher::new(ProxyManager::new(&config.proxy, &config.crawler), store.clone());
        if config.crawler.rotation == RotationPolicy::PerTask {
            if let Some(rotator) = &rotator {
                fetcher = fetcher.with_rotation(rotator.clone());
            }
        }

        Self::with_parts(&config.crawler, store, Arc::new(fetcher), rotator).await
    }

    /// Assemble a controller from already-built collaborators.
    ///
    /// Takes ownership of the store: it is closed if assembly fails.
    pub async fn with_parts(
        settings: &CrawlerSettings,
        store: Arc<dyn StoreBackend>,
        executor: Arc<dyn TaskExecutor>,
        rotator: Option<Arc<dyn IdentityRotator>>,
    ) -> Result<Self> {
        if settings.rotation == RotationPolicy::PerBatch && rotator.is_none() {
            let e = anyhow::anyhow!("Per-batch rotation needs an identity rotator");
            return Err(abandon(&store, e).await);
        }

        let workers = settings.worker_count().max(1);
        let remaining = match store.count(ItemState::Pending).await {
            Ok(remaining) => remaining,
            Err(e) => return Err(abandon(&store, e.context("Failed to count pending items")).await),
        };

        Ok(Self {
            run_id: Uuid::new_v4(),
            state: RunState::Initializing,
            workers,
            rotation: settings.rotation,
            unusable_content: settings.unusable_content,
            task_timeout: settings.task_timeout(),
            store,
            executor,
            rotator,
            limiter: Arc::new(Semaphore::new(workers)),
            in_flight: JoinSet::new(),
            deferred: HashSet::new(),
            metrics: RunMetrics::new(remaining),
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    fn enter(&mut self, state: RunState) {
        debug!("{:?} -> {:?}", self.state, state);
        self.state = state;
    }

    /// Drain the queue until it is empty, a fatal fault occurs, or `shutdown` resolves.
    ///
    /// The store is closed exactly once before this returns.
    pub async fn run<S>(mut self, shutdown: S) -> RunReport
    where
        S: Future<Output = ()>,
    {
        let span = info_span!("run", id = %self.run_id);

        async move {
            info!("Using {} workers, {} unfetched pages found", self.workers, self.metrics.remaining);
            self.enter(RunState::Draining);

            tokio::pin!(shutdown);
            let reason = loop {
                tokio::select! {
                    biased;
                    _ = &mut shutdown => break StopReason::Interrupted,
                    step = self.drain_batch() => match step {
                        Ok(true) => continue,
                        Ok(false) => break StopReason::Drained,
                        Err(e) => {
                            error!("Run aborted: {:#}", e);
                            break StopReason::Fatal(format!("{:#}", e));
                        }
                    },
                }
            };

            self.shut_down(reason).await
        }
        .instrument(span)
        .await
    }

    /// Select, dispatch and settle one batch. `Ok(false)` when nothing is pending.
    async fn drain_batch(&mut self) -> Result<bool> {
        let exclude: Vec<ObjectId> = self.deferred.iter().copied().collect();
        let batch = self.store.select_pending(self.workers, &exclude).await
            .context("Failed to select pending items")?;

        if batch.is_empty() {
            return Ok(false);
        }

        self.metrics.batches += 1;
        debug!("Batch {} selected {} items", self.metrics.batches, batch.len());

        if self.rotation == RotationPolicy::PerBatch {
            if let Some(rotator) = &self.rotator {
                if let Err(e) = rotator.rotate().await {
                    error!("Identity rotation before batch failed, skipping {} items: {}", batch.len(), e);
                    for item in batch {
                        self.metrics.rejected += 1;
                        self.deferred.insert(item.id);
                    }
                    return Ok(true);
                }
            }
        }

        for item in batch {
            let permit = self.limiter.clone().acquire_owned().await
                .context("Concurrency limiter closed")?;
            let executor = Arc::clone(&self.executor);
            let timeout = self.task_timeout;
            let span = info_span!("task", item = %item.id);

            self.metrics.dispatched += 1;
            self.in_flight.spawn(
                async move {
                    let _permit = permit;
                    let id = item.id;
                    (id, run_isolated(executor, item, timeout).await)
                }
                .instrument(span),
            );
        }

        // Siblings settle independently, in completion order
        while let Some(joined) = self.in_flight.join_next().await {
            match joined {
                Ok((id, result)) => self.apply(id, result).await,
                Err(e) => warn!("Fetch task ended abnormally: {}", e),
            }
        }

        info!("Batch completed, {} pages remaining", self.metrics.remaining);

        Ok(true)
    }

    /// Apply the status transition for one settled task
    async fn apply(&mut self, id: ObjectId, result: Result<FetchOutcome, TaskError>) {
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("[{}] Task rejected: {}", id, e);
                self.metrics.rejected += 1;
                self.deferred.insert(id);
                return;
            }
        };

        if outcome.fetched {
            self.metrics.fetched += 1;
        }

        if !outcome.fetched {
            info!("[{}] Unable to fetch page content (blocked by website)", id);
            self.metrics.blocked += 1;
        } else if !outcome.saved {
            info!("[{}] Page fetched but nothing usable was extracted", id);
            self.metrics.unsaved += 1;
        }

        let transition = Transition::for_outcome(&outcome, self.unusable_content);
        let written = match transition {
            Transition::MarkFailed => self.store.mark_failed(&id).await,
            Transition::MarkFetched => self.store.mark_fetched(&id).await,
            Transition::LeavePending => {
                self.deferred.insert(id);
                return;
            }
        };

        match written {
            Ok(()) if transition == Transition::MarkFetched => {
                self.metrics.record_saved();
                info!("[{}] Completed. Remaining pages: {}", id, self.metrics.remaining);
            }
            Ok(()) => {}
            Err(e) => {
                error!("[{}] Failed to update item status: {:#}", id, e);
                self.deferred.insert(id);
            }
        }
    }

    /// Tear down whatever is still running and release the store
    async fn shut_down(mut self, reason: StopReason) -> RunReport {
        self.enter(RunState::ShuttingDown);

        if !self.in_flight.is_empty() {
            warn!("Tearing down {} in-flight fetch tasks", self.in_flight.len());
        }
        self.in_flight.abort_all();
        while self.in_flight.join_next().await.is_some() {}
        self.limiter.close();

        if let Err(e) = self.store.close().await {
            warn!("Failed to close store: {:#}", e);
        }

        self.enter(RunState::Terminated);

        let metrics = &self.metrics;
        info!(
            "Run finished ({:?}) in {}s: {} batches, {} saved, {} blocked, {} unsaved, {} rejected, {} remaining",
            reason, metrics.elapsed_secs(), metrics.batches, metrics.saved,
            metrics.blocked, metrics.unsaved, metrics.rejected, metrics.remaining
        );

        RunReport {
            run_id: self.run_id,
            reason,
            metrics: self.metrics,
        }
    }
}

/// Close a store whose controller never came up, passing the original error through
async fn abandon(store: &Arc<dyn StoreBackend>, e: anyhow::Error) -> anyhow::Error {
    if let Err(close_err) = store.close().await {
        warn!("Failed to close store: {:#}", close_err);
    }
    e
}

/// Run one task behind a wall-clock limit, turning a panic into an error
async fn run_isolated(
    executor: Arc<dyn TaskExecutor>,
    item: QueueItem,
    limit: Duration,
) -> Result<FetchOutcome, TaskError> {
    let work = AssertUnwindSafe(executor.execute(item)).catch_unwind();

    match tokio::time::timeout(limit, work).await {
        Ok(Ok(result)) => result,
        Ok(Err(panic)) => Err(TaskError::Panicked(panic_message(panic))),
        Err(_) => Err(TaskError::Timeout(limit)),
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::task::ExtractedDocument;
    use crate::proxy::identity::MockIdentityRotator;
    use crate::proxy::RotationError;
    use crate::storage::memory::MemoryStore;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Copy)]
    enum Behaviour {
        Save,
        Unsaved,
        Blocked,
        Reject,
        Panic,
    }

    /// Executor that acts per URL and tracks how many tasks overlap
    struct ScriptedExecutor {
        store: Arc<MemoryStore>,
        script: HashMap<String, Behaviour>,
        delay: Duration,
        calls: AtomicUsize,
        current: AtomicUsize,
        max: AtomicUsize,
    }

    impl ScriptedExecutor {
        fn new(store: Arc<MemoryStore>) -> Self {
            Self {
                store,
                script: HashMap::new(),
                delay: Duration::from_millis(0),
                calls: AtomicUsize::new(0),
                current: AtomicUsize::new(0),
                max: AtomicUsize::new(0),
            }
        }

        fn with(mut self, url: &str, behaviour: Behaviour) -> Self {
            self.script.insert(url.to_string(), behaviour);
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TaskExecutor for ScriptedExecutor {
        async fn execute(&self, item: QueueItem) -> Result<FetchOutcome, TaskError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.max.fetch_max(now, Ordering::SeqCst);

            tokio::time::sleep(self.delay).await;
            self.current.fetch_sub(1, Ordering::SeqCst);

            match self.script.get(&item.url).copied().unwrap_or(Behaviour::Save) {
                Behaviour::Save => {
                    let document = ExtractedDocument {
                        id: item.id,
                        url: item.url.clone(),
                        lang: "en".to_string(),
                        content: "text".to_string(),
                        fetched_at: Utc::now(),
                    };
                    let saved = self.store.insert_document(&document).await.unwrap();
                    Ok(FetchOutcome::stored(saved))
                }
                Behaviour::Unsaved => Ok(FetchOutcome::unsaved()),
                Behaviour::Blocked => Ok(FetchOutcome::blocked()),
                Behaviour::Reject => Err(TaskError::Setup("connection reset".to_string())),
                Behaviour::Panic => panic!("extractor blew up"),
            }
        }
    }

    fn settings(workers: usize) -> CrawlerSettings {
        CrawlerSettings {
            workers: Some(workers),
            ..Default::default()
        }
    }

    async fn controller(
        settings: &CrawlerSettings,
        store: &Arc<MemoryStore>,
        executor: &Arc<ScriptedExecutor>,
    ) -> CrawlerController {
        CrawlerController::with_parts(settings, store.clone(), executor.clone(), None)
            .await
            .unwrap()
    }

    fn assert_consistent(store: &MemoryStore) {
        for item in store.items() {
            assert!(!(item.fetched && item.failed), "item {} is both fetched and failed", item.id);
        }
    }

    #[test]
    fn test_transition_table() {
        let mark_failed = UnusableContentPolicy::MarkFailed;
        let keep_pending = UnusableContentPolicy::KeepPending;

        assert_eq!(Transition::for_outcome(&FetchOutcome::blocked(), mark_failed), Transition::MarkFailed);
        assert_eq!(Transition::for_outcome(&FetchOutcome::blocked(), keep_pending), Transition::MarkFailed);
        assert_eq!(Transition::for_outcome(&FetchOutcome::stored(true), mark_failed), Transition::MarkFetched);
        assert_eq!(Transition::for_outcome(&FetchOutcome::unsaved(), mark_failed), Transition::MarkFailed);
        assert_eq!(Transition::for_outcome(&FetchOutcome::unsaved(), keep_pending), Transition::LeavePending);
    }

    #[tokio::test]
    async fn test_run_settles_every_item() {
        let store = Arc::new(MemoryStore::with_pending(8));
        let executor = Arc::new(
            ScriptedExecutor::new(store.clone())
                .with("https://news.example/1", Behaviour::Blocked)
                .with("https://news.example/2", Behaviour::Unsaved)
                .with("https://news.example/3", Behaviour::Reject)
                .with("https://news.example/4", Behaviour::Panic),
        );

        let report = controller(&settings(3), &store, &executor).await
            .run(std::future::pending())
            .await;

        assert_eq!(report.reason, StopReason::Drained);
        assert_eq!(executor.calls(), 8);
        assert_eq!(store.closes.load(Ordering::SeqCst), 1);
        assert_consistent(&store);

        let state_of = |url: &str| {
            let item = store.items().into_iter().find(|item| item.url == url).unwrap();
            ItemState::of(&item)
        };
        assert_eq!(state_of("https://news.example/0"), ItemState::Fetched);
        assert_eq!(state_of("https://news.example/1"), ItemState::Failed);
        assert_eq!(state_of("https://news.example/2"), ItemState::Failed);
        assert_eq!(state_of("https://news.example/3"), ItemState::Pending);
        assert_eq!(state_of("https://news.example/4"), ItemState::Pending);

        assert_eq!(report.metrics.fetched, 5);
        assert_eq!(report.metrics.saved, 4);
        assert_eq!(report.metrics.blocked, 1);
        assert_eq!(report.metrics.unsaved, 1);
        assert_eq!(report.metrics.rejected, 2);
        assert_eq!(report.metrics.remaining, 4);
    }

    #[tokio::test]
    async fn test_second_run_does_no_work() {
        let store = Arc::new(MemoryStore::with_pending(5));
        let first = Arc::new(ScriptedExecutor::new(store.clone()));
        controller(&settings(2), &store, &first).await.run(std::future::pending()).await;
        assert_eq!(first.calls(), 5);

        let writes = store.writes();
        let second = Arc::new(ScriptedExecutor::new(store.clone()));
        let report = controller(&settings(2), &store, &second).await.run(std::future::pending()).await;

        assert_eq!(report.reason, StopReason::Drained);
        assert_eq!(second.calls(), 0);
        assert_eq!(store.writes(), writes);
        assert_eq!(report.metrics.batches, 0);
    }

    #[tokio::test]
    async fn test_keep_pending_still_terminates() {
        let store = Arc::new(MemoryStore::with_pending(3));
        let executor = Arc::new(
            ScriptedExecutor::new(store.clone()).with("https://news.example/1", Behaviour::Unsaved),
        );
        let settings = CrawlerSettings {
            unusable_content: UnusableContentPolicy::KeepPending,
            ..settings(2)
        };

        let report = controller(&settings, &store, &executor).await.run(std::future::pending()).await;

        assert_eq!(report.reason, StopReason::Drained);
        assert_eq!(executor.calls(), 3);
        assert_eq!(store.count(ItemState::Pending).await.unwrap(), 1);
        assert_eq!(store.count(ItemState::Fetched).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_in_flight_never_exceeds_workers() {
        for (queue, workers) in [(0, 3), (1, 3), (7, 3), (40, 4)] {
            let store = Arc::new(MemoryStore::with_pending(queue));
            let mut executor = ScriptedExecutor::new(store.clone());
            executor.delay = Duration::from_millis(5);
            let executor = Arc::new(executor);

            controller(&settings(workers), &store, &executor).await.run(std::future::pending()).await;

            assert_eq!(executor.calls(), queue);
            assert!(executor.max.load(Ordering::SeqCst) <= workers);
            assert_eq!(store.count(ItemState::Fetched).await.unwrap(), queue as u64);
        }
    }

    #[tokio::test]
    async fn test_document_written_at_most_once() {
        let store = Arc::new(MemoryStore::with_pending(1));
        let id = store.items()[0].id;
        let executor = Arc::new(ScriptedExecutor::new(store.clone()));
        controller(&settings(1), &store, &executor).await.run(std::future::pending()).await;

        // Simulate a crash between the document insert and the status update
        let reset = MemoryStore::with_items(vec![QueueItem { fetched: false, ..store.item(&id).unwrap() }]);
        let reset = Arc::new(reset);
        reset.insert_document(&store.document(&id).unwrap()).await.unwrap();

        let executor = Arc::new(ScriptedExecutor::new(reset.clone()));
        controller(&settings(1), &reset, &executor).await.run(std::future::pending()).await;

        assert_eq!(executor.calls(), 1);
        assert_eq!(reset.document_writes.load(Ordering::SeqCst), 1);
        assert_eq!(ItemState::of(&reset.item(&id).unwrap()), ItemState::Fetched);
    }

    /// Executor whose tasks never finish; counts how many were dropped
    struct HangingExecutor {
        started: AtomicUsize,
        torn_down: Arc<AtomicUsize>,
    }

    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl TaskExecutor for HangingExecutor {
        async fn execute(&self, _item: QueueItem) -> Result<FetchOutcome, TaskError> {
            let _guard = DropCounter(self.torn_down.clone());
            self.started.fetch_add(1, Ordering::SeqCst);
            std::future::pending::<()>().await;
            unreachable!()
        }
    }

    #[tokio::test]
    async fn test_shutdown_tears_down_in_flight_tasks() {
        let store = Arc::new(MemoryStore::with_pending(3));
        let executor = Arc::new(HangingExecutor {
            started: AtomicUsize::new(0),
            torn_down: Arc::new(AtomicUsize::new(0)),
        });

        let ctl = CrawlerController::with_parts(&settings(3), store.clone(), executor.clone(), None)
            .await
            .unwrap();

        let signal = {
            let executor = executor.clone();
            async move {
                while executor.started.load(Ordering::SeqCst) < 3 {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            }
        };

        let report = tokio::time::timeout(Duration::from_secs(5), ctl.run(signal))
            .await
            .expect("shutdown hung");

        assert_eq!(report.reason, StopReason::Interrupted);
        assert_eq!(executor.torn_down.load(Ordering::SeqCst), 3);
        assert_eq!(store.closes.load(Ordering::SeqCst), 1);
        assert_eq!(store.count(ItemState::Pending).await.unwrap(), 3);
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test]
    async fn test_task_timeout_is_a_rejection() {
        let store = Arc::new(MemoryStore::with_pending(1));
        let executor = Arc::new(HangingExecutor {
            started: AtomicUsize::new(0),
            torn_down: Arc::new(AtomicUsize::new(0)),
        });
        let settings = CrawlerSettings { task_timeout_secs: 1, ..settings(1) };

        let report = CrawlerController::with_parts(&settings, store.clone(), executor, None)
            .await
            .unwrap()
            .run(std::future::pending())
            .await;

        assert_eq!(report.reason, StopReason::Drained);
        assert_eq!(report.metrics.rejected, 1);
        assert_eq!(store.count(ItemState::Pending).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rotates_once_per_batch() {
        let store = Arc::new(MemoryStore::with_pending(5));
        let executor = Arc::new(ScriptedExecutor::new(store.clone()));
        let mut rotator = MockIdentityRotator::new();
        rotator.expect_rotate().times(3).returning(|| Ok(()));
        let settings = CrawlerSettings { rotation: RotationPolicy::PerBatch, ..settings(2) };

        let report = CrawlerController::with_parts(&settings, store.clone(), executor.clone(), Some(Arc::new(rotator)))
            .await
            .unwrap()
            .run(std::future::pending())
            .await;

        assert_eq!(report.reason, StopReason::Drained);
        assert_eq!(report.metrics.batches, 3);
        assert_eq!(executor.calls(), 5);
    }

    #[tokio::test]
    async fn test_batch_rotation_failure_skips_only_that_batch() {
        let store = Arc::new(MemoryStore::with_pending(4));
        let executor = Arc::new(ScriptedExecutor::new(store.clone()));
        let mut rotator = MockIdentityRotator::new();
        let mut attempts = 0;
        rotator.expect_rotate().times(2).returning(move || {
            attempts += 1;
            if attempts == 1 {
                Err(RotationError::Timeout("127.0.0.1:9051".to_string()))
            } else {
                Ok(())
            }
        });
        let settings = CrawlerSettings { rotation: RotationPolicy::PerBatch, ..settings(2) };

        let report = CrawlerController::with_parts(&settings, store.clone(), executor.clone(), Some(Arc::new(rotator)))
            .await
            .unwrap()
            .run(std::future::pending())
            .await;

        assert_eq!(report.reason, StopReason::Drained);
        assert_eq!(report.metrics.batches, 2);
        assert_eq!(report.metrics.rejected, 2);
        assert_eq!(executor.calls(), 2);
        assert_eq!(store.closes.load(Ordering::SeqCst), 1);
        assert_eq!(store.count(ItemState::Pending).await.unwrap(), 2);
        assert_eq!(store.count(ItemState::Fetched).await.unwrap(), 2);
        assert_consistent(&store);
    }

    #[tokio::test]
    async fn test_per_batch_rotation_requires_rotator() {
        let store = Arc::new(MemoryStore::default());
        let executor = Arc::new(ScriptedExecutor::new(store.clone()));
        let settings = CrawlerSettings { rotation: RotationPolicy::PerBatch, ..settings(1) };

        assert!(CrawlerController::with_parts(&settings, store.clone(), executor, None).await.is_err());
        assert_eq!(store.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_startup_count_closes_store() {
        let store = Arc::new(MemoryStore::with_pending(2));
        store.fail_counts.store(true, Ordering::SeqCst);
        let executor = Arc::new(ScriptedExecutor::new(store.clone()));

        assert!(CrawlerController::with_parts(&settings(1), store.clone(), executor.clone(), None).await.is_err());
        assert_eq!(store.closes.load(Ordering::SeqCst), 1);
        assert_eq!(executor.calls(), 0);
    }

    #[tokio::test]
    async fn test_rotation_without_password_closes_store() {
        let store = Arc::new(MemoryStore::with_pending(1));
        let mut config = CrawlerConfig::default();
        config.crawler.rotation = RotationPolicy::PerTask;

        assert!(CrawlerController::new(&config, store.clone()).await.is_err());
        assert_eq!(store.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_status_writes_do_not_stall_the_run() {
        let store = Arc::new(MemoryStore::with_pending(3));
        store.fail_status_writes.store(true, Ordering::SeqCst);
        let executor = Arc::new(
            ScriptedExecutor::new(store.clone()).with("https://news.example/1", Behaviour::Blocked),
        );

        let report = tokio::time::timeout(
            Duration::from_secs(5),
            controller(&settings(2), &store, &executor).await.run(std::future::pending()),
        )
        .await
        .expect("run did not terminate");

        assert_eq!(report.reason, StopReason::Drained);
        assert_eq!(executor.calls(), 3);
        assert_eq!(report.metrics.saved, 0);
        assert_eq!(report.metrics.remaining, 3);
        assert_eq!(store.count(ItemState::Pending).await.unwrap(), 3);
        assert_eq!(store.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_queue_failure_mid_run_is_fatal() {
        let store = Arc::new(MemoryStore::with_pending(3));
        let executor = Arc::new(ScriptedExecutor::new(store.clone()));
        let ctl = controller(&settings(2), &store, &executor).await;
        store.fail_selects.store(true, Ordering::SeqCst);

        let report = ctl.run(std::future::pending()).await;

        assert!(matches!(report.reason, StopReason::Fatal(_)));
        assert_eq!(executor.calls(), 0);
        assert_eq!(store.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_forbidden_page_marks_item_failed() {
        use crate::cli::config::ProxySettings;
        use wiremock::{MockServer, Mock, ResponseTemplate};
        use wiremock::matchers::method;

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let id = ObjectId::new();
        let store = Arc::new(MemoryStore::with_items(vec![QueueItem {
            id,
            url: server.uri(),
            fetched: false,
            failed: false,
        }]));

        let settings = settings(1);
        let proxy = ProxySettings { socks_url: None, ..Default::default() };
        let fetcher = PageFetcher::new(ProxyManager::new(&proxy, &settings), store.clone());

        let report = CrawlerController::with_parts(&settings, store.clone(), Arc::new(fetcher), None)
            .await
            .unwrap()
            .run(std::future::pending())
            .await;

        assert_eq!(report.metrics.blocked, 1);
        let item = store.item(&id).unwrap();
        assert!(item.failed);
        assert!(!item.fetched);
        assert!(store.document(&id).is_none());
    }
}

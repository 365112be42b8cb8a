//! Bounded-concurrency fetch scheduler.
//!
//! Bookkeeping lives on the engine worker; only the fetch I/O runs as
//! separate tasks on the worker's runtime handle. Every task reports back over
//! an unbounded channel with a [`FetchCompletion`] tagged by
//! `(generation, node, attempt)`, and the worker feeds it to
//! [`FetchScheduler::complete`].
//!
//! ```text
//!  submit ──► FetchQueue ──admit──► spawn(fetch + decode) ──► completion_tx
//!                ▲                                                 │
//!                └──── back-off (not-before) ◄── Retrying ◄─ complete
//! ```

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::policy::{Priority, RetryPolicy};
use super::queue::FetchQueue;
use crate::cache::CacheEntry;
use crate::coord::NodeId;
use crate::source::{SourceError, TextureSource, TilePayload};
use crate::telemetry::EngineMetrics;
use crate::tile::{TileBuildError, TileBuilder};

/// Default number of fetches in flight at once.
pub const DEFAULT_MAX_CONCURRENT: usize = 8;

/// Default per-attempt fetch timeout.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Scheduler settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub max_concurrent: usize,
    pub fetch_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Why a fetch attempt failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("Transient failure fetching {node}: {reason}")]
    Transient { node: NodeId, reason: String },

    #[error("Fetch of {node} timed out after {after:?}")]
    Timeout { node: NodeId, after: Duration },

    #[error("Texture for {0} not found")]
    NotFound(NodeId),

    #[error("Texture for {node} could not be decoded: {reason}")]
    Decode { node: NodeId, reason: String },

    #[error("Fetch of {0} was cancelled")]
    Cancelled(NodeId),
}

impl FetchError {
    pub fn node(&self) -> NodeId {
        match self {
            FetchError::Transient { node, .. }
            | FetchError::Timeout { node, .. }
            | FetchError::Decode { node, .. } => *node,
            FetchError::NotFound(node) | FetchError::Cancelled(node) => *node,
        }
    }

    /// Transient errors and timeouts are retried; everything else is final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transient { .. } | FetchError::Timeout { .. })
    }

    fn from_source(node: NodeId, err: SourceError) -> Self {
        match err {
            SourceError::NotFound(_) => FetchError::NotFound(node),
            SourceError::Transient(reason) => FetchError::Transient { node, reason },
        }
    }
}

impl From<TileBuildError> for FetchError {
    fn from(err: TileBuildError) -> Self {
        match err {
            TileBuildError::Decode { node, reason } => FetchError::Decode { node, reason },
            TileBuildError::EmptyImage(node) => FetchError::Decode {
                node,
                reason: "empty image".to_string(),
            },
        }
    }
}

/// Where a request is in its lifecycle.
#[derive(Debug, Clone)]
pub enum RequestState {
    /// Waiting for admission, optionally not before an instant (back-off).
    Queued { not_before: Option<Instant> },
    /// A fetch task is running.
    InFlight {
        token: CancellationToken,
        started_at: Instant,
    },
}

/// The single outstanding request for a node.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub node: NodeId,
    pub priority: Priority,
    /// Attempts started so far.
    pub attempt: u32,
    pub created_at: Instant,
    pub state: RequestState,
    /// Cancelled while in flight; the result is discarded on arrival.
    pub cancelled: bool,
}

impl FetchRequest {
    pub fn is_in_flight(&self) -> bool {
        matches!(self.state, RequestState::InFlight { .. })
    }

    pub fn not_before(&self) -> Option<Instant> {
        match self.state {
            RequestState::Queued { not_before } => not_before,
            RequestState::InFlight { .. } => None,
        }
    }
}

/// Result of one fetch attempt, sent from the task to the worker.
#[derive(Debug)]
pub struct FetchCompletion {
    pub node: NodeId,
    pub generation: u64,
    pub attempt: u32,
    pub result: Result<CacheEntry, FetchError>,
}

/// What [`FetchScheduler::submit`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// New request queued.
    Queued,
    /// Already outstanding; priority updated.
    Updated,
    /// A cancelled in-flight request was reinstated.
    Revived,
}

/// What [`FetchScheduler::complete`] decided.
#[derive(Debug)]
pub enum CompletionOutcome {
    /// Payload decoded; the request is finished.
    Loaded(CacheEntry),
    /// Transient failure; re-queued after `delay`.
    Retrying { attempt: u32, delay: Duration },
    /// Permanent failure or attempts exhausted.
    Failed(FetchError),
    /// The request had been cancelled; result dropped.
    Discarded,
    /// Attempt was interrupted but the node is wanted again; re-queued.
    Requeued,
    /// Unknown request, old attempt or previous generation.
    Stale,
}

/// Fetch bookkeeping: dedupe, admission, retry and cancellation.
pub struct FetchScheduler {
    config: SchedulerConfig,
    source: Arc<dyn TextureSource>,
    builder: TileBuilder,
    handle: Handle,
    requests: HashMap<NodeId, FetchRequest>,
    queue: FetchQueue,
    backoff: BTreeSet<(Instant, NodeId)>,
    in_flight: usize,
    generation: u64,
    completion_tx: mpsc::UnboundedSender<FetchCompletion>,
    metrics: Arc<EngineMetrics>,
}

impl FetchScheduler {
    /// Creates a scheduler and the receiver its completions arrive on.
    pub fn new(
        config: SchedulerConfig,
        source: Arc<dyn TextureSource>,
        builder: TileBuilder,
        handle: Handle,
        metrics: Arc<EngineMetrics>,
    ) -> (Self, mpsc::UnboundedReceiver<FetchCompletion>) {
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            config,
            source,
            builder,
            handle,
            requests: HashMap::new(),
            queue: FetchQueue::new(),
            backoff: BTreeSet::new(),
            in_flight: 0,
            generation: 0,
            completion_tx,
            metrics,
        };
        (scheduler, completion_rx)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Requests `node` at `priority`. At most one request per node exists.
    pub fn submit(&mut self, node: NodeId, priority: Priority, now: Instant) -> SubmitOutcome {
        if let Some(request) = self.requests.get_mut(&node) {
            request.priority = priority;
            return match &request.state {
                RequestState::Queued { not_before: None } => {
                    self.queue.push(node, priority);
                    SubmitOutcome::Updated
                }
                RequestState::Queued { .. } => SubmitOutcome::Updated,
                RequestState::InFlight { .. } if request.cancelled => {
                    request.cancelled = false;
                    tracing::debug!(node = %node, "Revived cancelled fetch");
                    SubmitOutcome::Revived
                }
                RequestState::InFlight { .. } => SubmitOutcome::Updated,
            };
        }

        self.requests.insert(
            node,
            FetchRequest {
                node,
                priority,
                attempt: 0,
                created_at: now,
                state: RequestState::Queued { not_before: None },
                cancelled: false,
            },
        );
        self.queue.push(node, priority);
        self.metrics.fetch_submitted();
        tracing::debug!(node = %node, priority = %priority, "Queued fetch");
        SubmitOutcome::Queued
    }

    /// Makes the outstanding set match `wanted`.
    ///
    /// Requests not in `wanted` are cancelled; the rest are submitted or
    /// re-prioritised. Returns the cancelled nodes, sorted.
    pub fn reconcile(&mut self, wanted: &[(NodeId, Priority)], now: Instant) -> Vec<NodeId> {
        let keep: BTreeSet<NodeId> = wanted.iter().map(|(n, _)| *n).collect();
        let mut dropped: Vec<NodeId> = self
            .requests
            .values()
            .filter(|r| !r.cancelled && !keep.contains(&r.node))
            .map(|r| r.node)
            .collect();
        dropped.sort();
        for node in &dropped {
            self.cancel(*node);
        }
        for (node, priority) in wanted {
            self.submit(*node, *priority, now);
        }
        dropped
    }

    /// Spawns queued fetches up to the concurrency limit, highest priority
    /// first. Returns how many were started.
    pub fn admit(&mut self, now: Instant) -> usize {
        while let Some((not_before, node)) = self.backoff.first().copied() {
            if not_before > now {
                break;
            }
            self.backoff.remove(&(not_before, node));
            if let Some(request) = self.requests.get_mut(&node) {
                request.state = RequestState::Queued { not_before: None };
                self.queue.push(node, request.priority);
            }
        }

        let mut started = 0;
        while self.in_flight < self.config.max_concurrent {
            let Some((node, _)) = self.queue.pop() else {
                break;
            };
            if self.spawn(node, now) {
                started += 1;
            }
        }
        started
    }

    fn spawn(&mut self, node: NodeId, now: Instant) -> bool {
        let Some(request) = self.requests.get_mut(&node) else {
            return false;
        };
        if request.is_in_flight() {
            return false;
        }

        let token = CancellationToken::new();
        request.attempt += 1;
        request.state = RequestState::InFlight {
            token: token.clone(),
            started_at: now,
        };
        self.in_flight += 1;
        self.metrics.fetch_started();

        let attempt = request.attempt;
        let generation = self.generation;
        let timeout = self.config.fetch_timeout;
        let source = Arc::clone(&self.source);
        let builder = self.builder.clone();
        let tx = self.completion_tx.clone();
        let metrics = Arc::clone(&self.metrics);

        tracing::debug!(node = %node, attempt, "Starting fetch");
        self.handle.spawn(async move {
            let started = Instant::now();
            let result = tokio::select! {
                biased;

                _ = token.cancelled() => Err(FetchError::Cancelled(node)),

                fetched = tokio::time::timeout(timeout, source.fetch(node)) => match fetched {
                    Err(_) => Err(FetchError::Timeout { node, after: timeout }),
                    Ok(Err(e)) => Err(FetchError::from_source(node, e)),
                    Ok(Ok(payload)) => build_blocking(builder, node, payload).await,
                },
            };
            metrics.fetch_finished(started.elapsed().as_micros() as u64);

            // The worker may already be gone after teardown.
            let _ = tx.send(FetchCompletion {
                node,
                generation,
                attempt,
                result,
            });
        });
        true
    }

    /// Applies a completion from a fetch task.
    pub fn complete(&mut self, completion: FetchCompletion, now: Instant) -> CompletionOutcome {
        let node = completion.node;
        if completion.generation != self.generation {
            self.metrics.stale_completion();
            return CompletionOutcome::Stale;
        }
        let current = match self.requests.get(&node) {
            Some(r) if r.is_in_flight() && r.attempt == completion.attempt => r,
            _ => {
                self.metrics.stale_completion();
                return CompletionOutcome::Stale;
            }
        };
        let cancelled = current.cancelled;
        self.in_flight = self.in_flight.saturating_sub(1);

        if cancelled {
            self.requests.remove(&node);
            self.metrics.stale_completion();
            tracing::debug!(node = %node, "Discarded result of cancelled fetch");
            return CompletionOutcome::Discarded;
        }

        match completion.result {
            Ok(entry) => {
                self.requests.remove(&node);
                self.metrics.fetch_completed();
                CompletionOutcome::Loaded(entry)
            }
            Err(FetchError::Cancelled(_)) => {
                // Revived after its token fired; the interrupted attempt is not counted.
                if let Some(request) = self.requests.get_mut(&node) {
                    request.attempt = request.attempt.saturating_sub(1);
                    request.state = RequestState::Queued { not_before: None };
                    self.queue.push(node, request.priority);
                }
                CompletionOutcome::Requeued
            }
            Err(err) => {
                if matches!(err, FetchError::Timeout { .. }) {
                    self.metrics.fetch_timed_out();
                }
                let retry_delay = if err.is_retryable() {
                    self.requests
                        .get(&node)
                        .and_then(|r| self.config.retry.delay_for_attempt(r.attempt))
                } else {
                    None
                };
                if let Some(delay) = retry_delay {
                    if let Some(request) = self.requests.get_mut(&node) {
                        let not_before = now + delay;
                        request.state = RequestState::Queued {
                            not_before: Some(not_before),
                        };
                        let attempt = request.attempt;
                        self.backoff.insert((not_before, node));
                        self.metrics.fetch_retried();
                        tracing::debug!(
                            node = %node,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "Fetch failed, retrying"
                        );
                        return CompletionOutcome::Retrying { attempt, delay };
                    }
                }
                let attempts = self.requests.remove(&node).map(|r| r.attempt).unwrap_or(0);
                self.metrics.fetch_failed();
                tracing::warn!(node = %node, attempts, error = %err, "Fetch failed");
                CompletionOutcome::Failed(err)
            }
        }
    }

    /// Cancels the request for `node`. Returns false if none was outstanding.
    ///
    /// Queued requests are dropped at once; an in-flight request stays
    /// outstanding until its result arrives and is discarded.
    pub fn cancel(&mut self, node: NodeId) -> bool {
        let Some(request) = self.requests.get_mut(&node) else {
            return false;
        };
        match &request.state {
            RequestState::InFlight { token, .. } => {
                if request.cancelled {
                    return false;
                }
                token.cancel();
                request.cancelled = true;
            }
            RequestState::Queued { not_before } => {
                if let Some(at) = not_before {
                    self.backoff.remove(&(*at, node));
                }
                self.queue.remove(node);
                self.requests.remove(&node);
            }
        }
        self.metrics.fetch_cancelled();
        tracing::debug!(node = %node, "Cancelled fetch");
        true
    }

    /// Cancels everything and starts a new generation.
    ///
    /// Returns the number of fetches that were in flight; their completions
    /// will arrive with the old generation and be reported as stale.
    pub fn cancel_all(&mut self) -> usize {
        let mut in_flight = 0;
        for request in self.requests.values() {
            if let RequestState::InFlight { token, .. } = &request.state {
                token.cancel();
                in_flight += 1;
            }
        }
        let total = self.requests.len();
        self.requests.clear();
        self.queue.clear();
        self.backoff.clear();
        self.in_flight = 0;
        self.generation += 1;
        self.metrics.reset_active();
        tracing::info!(
            cancelled = total,
            in_flight,
            generation = self.generation,
            "Cancelled all fetches"
        );
        in_flight
    }

    /// Earliest instant a backed-off request becomes eligible.
    pub fn next_retry_at(&self) -> Option<Instant> {
        self.backoff.first().map(|(at, _)| *at)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Requests waiting for admission, including those backing off.
    pub fn queued(&self) -> usize {
        self.queue.len() + self.backoff.len()
    }

    pub fn outstanding(&self) -> usize {
        self.requests.len()
    }

    pub fn is_outstanding(&self, node: NodeId) -> bool {
        self.requests.contains_key(&node)
    }

    pub fn request(&self, node: NodeId) -> Option<&FetchRequest> {
        self.requests.get(&node)
    }
}

/// Decodes and tessellates on the blocking pool so fetch tasks never stall
/// the runtime's async workers.
async fn build_blocking(
    builder: TileBuilder,
    node: NodeId,
    payload: TilePayload,
) -> Result<CacheEntry, FetchError> {
    tokio::task::spawn_blocking(move || builder.build(node, &payload))
        .await
        .map_err(|e| FetchError::Decode {
            node,
            reason: format!("decode task failed: {}", e),
        })?
        .map_err(FetchError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::TilingScheme;
    use crate::source::{DirectoryTextureGroup, SyntheticTextureGroup};
    use tokio::sync::Semaphore;

    fn scheduler_with(
        source: Arc<dyn TextureSource>,
        config: SchedulerConfig,
    ) -> (FetchScheduler, mpsc::UnboundedReceiver<FetchCompletion>) {
        let builder = TileBuilder::new(TilingScheme::default(), 1000.0, 2);
        FetchScheduler::new(
            config,
            source,
            builder,
            Handle::current(),
            Arc::new(EngineMetrics::new()),
        )
    }

    fn fast_retry(attempts: u32) -> SchedulerConfig {
        SchedulerConfig::default().with_retry(RetryPolicy::fixed(attempts, Duration::ZERO))
    }

    #[tokio::test]
    async fn test_submit_dedupes() {
        let source = Arc::new(SyntheticTextureGroup::new("t"));
        let (mut scheduler, _rx) = scheduler_with(source, SchedulerConfig::default());
        let node = NodeId::new(1, 0, 0);
        let now = Instant::now();

        assert_eq!(scheduler.submit(node, Priority(1), now), SubmitOutcome::Queued);
        assert_eq!(scheduler.submit(node, Priority(5), now), SubmitOutcome::Updated);
        assert_eq!(scheduler.outstanding(), 1);
        assert_eq!(scheduler.queued(), 1);
        assert_eq!(scheduler.request(node).map(|r| r.priority), Some(Priority(5)));
    }

    #[tokio::test]
    async fn test_admit_respects_concurrency_and_priority() {
        let gate = Arc::new(Semaphore::new(0));
        let source = Arc::new(SyntheticTextureGroup::new("t").with_gate(gate));
        let config = SchedulerConfig::default().with_max_concurrent(2);
        let (mut scheduler, _rx) = scheduler_with(source, config);
        let now = Instant::now();

        scheduler.submit(NodeId::new(1, 0, 0), Priority(1), now);
        scheduler.submit(NodeId::new(1, 1, 0), Priority(9), now);
        scheduler.submit(NodeId::new(1, 2, 0), Priority(5), now);

        assert_eq!(scheduler.admit(now), 2);
        assert_eq!(scheduler.in_flight(), 2);
        assert!(scheduler.request(NodeId::new(1, 1, 0)).unwrap().is_in_flight());
        assert!(scheduler.request(NodeId::new(1, 2, 0)).unwrap().is_in_flight());
        assert!(!scheduler.request(NodeId::new(1, 0, 0)).unwrap().is_in_flight());
        assert_eq!(scheduler.admit(now), 0);
    }

    #[tokio::test]
    async fn test_successful_fetch_completes() {
        let source = Arc::new(SyntheticTextureGroup::new("t"));
        let (mut scheduler, mut rx) = scheduler_with(source, SchedulerConfig::default());
        let node = NodeId::new(2, 1, 1);

        scheduler.submit(node, Priority(1), Instant::now());
        scheduler.admit(Instant::now());
        let completion = rx.recv().await.unwrap();
        assert_eq!(completion.node, node);
        assert!(matches!(
            scheduler.complete(completion, Instant::now()),
            CompletionOutcome::Loaded(_)
        ));
        assert_eq!(scheduler.outstanding(), 0);
        assert_eq!(scheduler.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_transient_failures_retry_then_fail() {
        let source = Arc::new(SyntheticTextureGroup::new("t"));
        let node = NodeId::new(3, 2, 5);
        source.fail_transiently(node, 10);
        let (mut scheduler, mut rx) = scheduler_with(source.clone(), fast_retry(3));

        scheduler.submit(node, Priority(1), Instant::now());
        let mut outcomes = Vec::new();
        for _ in 0..3 {
            assert_eq!(scheduler.admit(Instant::now()), 1);
            let completion = rx.recv().await.unwrap();
            outcomes.push(scheduler.complete(completion, Instant::now()));
        }

        assert!(matches!(outcomes[0], CompletionOutcome::Retrying { attempt: 1, .. }));
        assert!(matches!(outcomes[1], CompletionOutcome::Retrying { attempt: 2, .. }));
        assert!(matches!(
            outcomes[2],
            CompletionOutcome::Failed(FetchError::Transient { .. })
        ));
        assert_eq!(source.fetches_of(node), 3);
        assert!(!scheduler.is_outstanding(node));
    }

    #[tokio::test]
    async fn test_not_found_is_permanent() {
        let source = Arc::new(SyntheticTextureGroup::new("t"));
        let node = NodeId::new(1, 1, 1);
        source.mark_missing(node);
        let (mut scheduler, mut rx) = scheduler_with(source.clone(), fast_retry(5));

        scheduler.submit(node, Priority(1), Instant::now());
        scheduler.admit(Instant::now());
        let completion = rx.recv().await.unwrap();
        assert!(matches!(
            scheduler.complete(completion, Instant::now()),
            CompletionOutcome::Failed(FetchError::NotFound(_))
        ));
        assert_eq!(source.fetches_of(node), 1);
    }

    #[tokio::test]
    async fn test_undecodable_texture_is_permanent() {
        let dir = tempfile::TempDir::new().unwrap();
        let source = Arc::new(DirectoryTextureGroup::new(dir.path(), "t"));
        let node = NodeId::new(1, 0, 1);
        let path = source.tile_path(node);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"not an image").unwrap();
        let (mut scheduler, mut rx) = scheduler_with(source, fast_retry(5));

        scheduler.submit(node, Priority(1), Instant::now());
        scheduler.admit(Instant::now());
        let completion = rx.recv().await.unwrap();
        assert!(matches!(
            scheduler.complete(completion, Instant::now()),
            CompletionOutcome::Failed(FetchError::Decode { .. })
        ));
        assert!(!scheduler.is_outstanding(node));
        assert_eq!(scheduler.in_flight(), 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_decodes_complete_on_single_threaded_runtime() {
        let source = Arc::new(SyntheticTextureGroup::new("t").with_tile_size(512));
        let config = SchedulerConfig::default().with_max_concurrent(8);
        let (mut scheduler, mut rx) = scheduler_with(source, config);
        let now = Instant::now();
        for x in 0..8 {
            scheduler.submit(NodeId::new(3, x, 0), Priority(1), now);
        }
        assert_eq!(scheduler.admit(now), 8);

        for _ in 0..8 {
            let completion = rx.recv().await.unwrap();
            assert!(matches!(
                scheduler.complete(completion, Instant::now()),
                CompletionOutcome::Loaded(_)
            ));
        }
        assert_eq!(scheduler.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_repeated_reconcile_does_not_grow_queue() {
        let source = Arc::new(SyntheticTextureGroup::new("t"));
        let (mut scheduler, _rx) = scheduler_with(source, SchedulerConfig::default());
        let wanted: Vec<(NodeId, Priority)> =
            (0..100).map(|x| (NodeId::new(7, x, 0), Priority(x as i32))).collect();
        let now = Instant::now();
        for _ in 0..1000 {
            scheduler.reconcile(&wanted, now);
        }
        assert_eq!(scheduler.queued(), 100);
        assert_eq!(scheduler.queue.heap_len(), 100);
    }

    #[tokio::test]
    async fn test_backoff_delays_admission() {
        let source = Arc::new(SyntheticTextureGroup::new("t"));
        let node = NodeId::new(2, 0, 0);
        source.fail_transiently(node, 1);
        let config = SchedulerConfig::default()
            .with_retry(RetryPolicy::fixed(3, Duration::from_secs(5)));
        let (mut scheduler, mut rx) = scheduler_with(source, config);

        let start = Instant::now();
        scheduler.submit(node, Priority(1), start);
        scheduler.admit(start);
        let completion = rx.recv().await.unwrap();
        scheduler.complete(completion, start);

        assert_eq!(scheduler.next_retry_at(), Some(start + Duration::from_secs(5)));
        assert_eq!(scheduler.admit(start + Duration::from_secs(1)), 0);
        assert_eq!(scheduler.admit(start + Duration::from_secs(5)), 1);
        assert_eq!(scheduler.next_retry_at(), None);
    }

    #[tokio::test]
    async fn test_timeout_is_retryable() {
        let gate = Arc::new(Semaphore::new(0));
        let source = Arc::new(SyntheticTextureGroup::new("t").with_gate(gate));
        let config = fast_retry(2).with_fetch_timeout(Duration::from_millis(10));
        let (mut scheduler, mut rx) = scheduler_with(source, config);
        let node = NodeId::new(0, 0, 0);

        scheduler.submit(node, Priority(1), Instant::now());
        scheduler.admit(Instant::now());
        let completion = rx.recv().await.unwrap();
        assert!(matches!(completion.result, Err(FetchError::Timeout { .. })));
        assert!(matches!(
            scheduler.complete(completion, Instant::now()),
            CompletionOutcome::Retrying { .. }
        ));
    }

    #[tokio::test]
    async fn test_cancel_queued_and_in_flight() {
        let gate = Arc::new(Semaphore::new(0));
        let source = Arc::new(SyntheticTextureGroup::new("t").with_gate(gate));
        let config = SchedulerConfig::default().with_max_concurrent(1);
        let (mut scheduler, mut rx) = scheduler_with(source, config);
        let now = Instant::now();
        let flying = NodeId::new(1, 0, 0);
        let waiting = NodeId::new(1, 1, 0);

        scheduler.submit(flying, Priority(9), now);
        scheduler.submit(waiting, Priority(1), now);
        scheduler.admit(now);

        assert!(scheduler.cancel(waiting));
        assert!(!scheduler.is_outstanding(waiting));

        assert!(scheduler.cancel(flying));
        assert!(scheduler.is_outstanding(flying));
        assert!(!scheduler.cancel(flying));

        let completion = rx.recv().await.unwrap();
        assert!(matches!(
            scheduler.complete(completion, Instant::now()),
            CompletionOutcome::Discarded
        ));
        assert_eq!(scheduler.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_revived_request_is_requeued() {
        let gate = Arc::new(Semaphore::new(0));
        let source = Arc::new(SyntheticTextureGroup::new("t").with_gate(gate.clone()));
        let (mut scheduler, mut rx) = scheduler_with(source, SchedulerConfig::default());
        let node = NodeId::new(1, 0, 0);
        let now = Instant::now();

        scheduler.submit(node, Priority(1), now);
        scheduler.admit(now);
        scheduler.cancel(node);
        assert_eq!(scheduler.submit(node, Priority(1), now), SubmitOutcome::Revived);

        let completion = rx.recv().await.unwrap();
        assert!(matches!(
            scheduler.complete(completion, now),
            CompletionOutcome::Requeued
        ));
        assert_eq!(scheduler.request(node).map(|r| r.attempt), Some(0));

        gate.add_permits(1);
        scheduler.admit(now);
        let completion = rx.recv().await.unwrap();
        assert!(matches!(
            scheduler.complete(completion, now),
            CompletionOutcome::Loaded(_)
        ));
    }

    #[tokio::test]
    async fn test_cancel_all_makes_completions_stale() {
        let gate = Arc::new(Semaphore::new(0));
        let source = Arc::new(SyntheticTextureGroup::new("t").with_gate(gate));
        let (mut scheduler, mut rx) = scheduler_with(source, SchedulerConfig::default());
        let now = Instant::now();
        for x in 0..4 {
            scheduler.submit(NodeId::new(2, x, 0), Priority(1), now);
        }
        scheduler.admit(now);

        assert_eq!(scheduler.cancel_all(), 4);
        assert_eq!(scheduler.outstanding(), 0);
        assert_eq!(scheduler.generation(), 1);

        for _ in 0..4 {
            let completion = rx.recv().await.unwrap();
            assert!(matches!(
                scheduler.complete(completion, now),
                CompletionOutcome::Stale
            ));
        }
    }

    #[tokio::test]
    async fn test_reconcile_cancels_unwanted() {
        let source = Arc::new(SyntheticTextureGroup::new("t"));
        let (mut scheduler, _rx) = scheduler_with(source, SchedulerConfig::default());
        let now = Instant::now();
        let a = NodeId::new(1, 0, 0);
        let b = NodeId::new(1, 1, 0);
        let c = NodeId::new(1, 0, 1);
        scheduler.submit(a, Priority(1), now);
        scheduler.submit(b, Priority(1), now);

        let cancelled = scheduler.reconcile(&[(b, Priority(3)), (c, Priority(2))], now);
        assert_eq!(cancelled, vec![a]);
        assert!(!scheduler.is_outstanding(a));
        assert!(scheduler.is_outstanding(b));
        assert!(scheduler.is_outstanding(c));
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn test_at_most_one_request_per_node(
                ops in proptest::collection::vec((0u32..6, 0i32..100, any::<bool>()), 1..100)
            ) {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                    .unwrap();
                let _guard = runtime.enter();
                let gate = Arc::new(Semaphore::new(0));
                let source = Arc::new(SyntheticTextureGroup::new("t").with_gate(gate));
                let config = SchedulerConfig::default().with_max_concurrent(3);
                let (mut scheduler, _rx) = scheduler_with(source, config);
                let now = Instant::now();

                for (x, priority, cancel) in ops {
                    let node = NodeId::new(3, x, 0);
                    if cancel {
                        scheduler.cancel(node);
                    } else {
                        scheduler.submit(node, Priority(priority), now);
                    }
                    scheduler.admit(now);
                    prop_assert!(scheduler.outstanding() <= 6);
                    prop_assert!(scheduler.in_flight() <= 3);
                    prop_assert!(scheduler.queued() + scheduler.in_flight() >= scheduler.outstanding());
                }
            }
        }
    }
}

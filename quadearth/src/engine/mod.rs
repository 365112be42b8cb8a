//! The tile engine.
//!
//! [`TileEngine`] owns every component and runs one update per frame on a
//! single worker:
//!
//! 1. apply fetch completions that arrived since the last update
//! 2. retry cache insertions deferred by the memory budget
//! 3. evaluate LOD against the camera
//! 4. adopt cache hits, reconcile outstanding fetches, mark nodes pending
//! 5. admit queued fetches up to the concurrency limit
//! 6. build drawables for the render set, retire the rest
//! 7. publish one scene batch
//! 8. prune collapsed subtrees
//!
//! [`QuadEarthLayer`] runs an engine on a host runtime and hands back a
//! [`LayerHandle`].

mod worker;

pub use worker::{
    LayerHandle, QuadEarthLayer, DEFAULT_FRAME_INTERVAL, MAX_CONSECUTIVE_UPDATE_FAILURES,
};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::cache::{CacheEntry, CacheError, TileCache};
use crate::config::{ConfigError, EngineConfig};
use crate::coord::NodeId;
use crate::drawable::{AssemblyError, Drawable, DrawableAssembler, DrawableId};
use crate::loader::{CompletionOutcome, FetchCompletion, FetchScheduler};
use crate::lod::{CameraState, LodDecision, LodEvaluator};
use crate::node::{LoadState, NodeError, NodeStore};
use crate::scene::{Scene, SceneError, SceneSynchronizer, SceneVersion};
use crate::source::TextureSource;
use crate::telemetry::{EngineMetrics, TelemetrySnapshot};
use crate::tile::TileBuilder;

/// Top-level layer errors.
#[derive(Debug, Error)]
pub enum LayerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Node(#[from] NodeError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Assembly(#[from] AssemblyError),

    #[error(transparent)]
    Scene(#[from] SceneError),

    #[error("Layer has been torn down")]
    TornDown,
}

/// What one update did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameReport {
    /// Scene version after the update.
    pub version: SceneVersion,
    /// Whether this update published a batch.
    pub published: bool,
    pub split: BTreeSet<NodeId>,
    pub merged: BTreeSet<NodeId>,
    /// Nodes the evaluator wanted fetched.
    pub requested: usize,
    /// Fetches started this update.
    pub started: usize,
    pub completions: usize,
    pub cache_hits: usize,
    pub built: usize,
    pub retired: usize,
    pub pruned: usize,
    /// Drawables live after the update.
    pub drawn: usize,
}

/// What teardown did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub version: SceneVersion,
    /// Drawables removed by the final batch.
    pub removed: usize,
    /// Fetches that were running; their results will be ignored.
    pub cancelled_in_flight: usize,
    pub released_entries: usize,
}

/// Single-worker core of a quad-earth layer.
pub struct TileEngine {
    config: EngineConfig,
    store: NodeStore,
    evaluator: LodEvaluator,
    scheduler: FetchScheduler,
    completions: mpsc::UnboundedReceiver<FetchCompletion>,
    cache: TileCache,
    assembler: DrawableAssembler,
    synchronizer: SceneSynchronizer,
    /// Decoded payloads waiting for cache room. Their nodes stay pending.
    deferred: BTreeMap<NodeId, CacheEntry>,
    metrics: Arc<EngineMetrics>,
    torn_down: bool,
}

impl TileEngine {
    /// Creates an engine publishing into `scene`; fetches run on `handle`.
    pub fn new(
        config: EngineConfig,
        source: Arc<dyn TextureSource>,
        scene: Arc<Scene>,
        handle: Handle,
    ) -> Result<Self, LayerError> {
        config.validate()?;
        let metrics = Arc::new(EngineMetrics::new());
        let builder = TileBuilder::new(
            config.tiling,
            config.globe_radius,
            config.mesh.tessellation,
        );
        let (scheduler, completions) = FetchScheduler::new(
            config.scheduler.clone(),
            Arc::clone(&source),
            builder,
            handle,
            Arc::clone(&metrics),
        );

        tracing::info!(
            texture_group = %config.texture_group,
            source = source.name(),
            roots = config.tiling.roots().len(),
            max_level = config.lod.max_level,
            cache_budget = config.cache.budget_bytes,
            ordering = %config.ordering,
            "Tile engine created"
        );

        Ok(Self {
            store: NodeStore::new(config.tiling, config.globe_radius),
            evaluator: LodEvaluator::new(config.lod.clone()),
            scheduler,
            completions,
            cache: TileCache::new(config.cache.budget_bytes),
            assembler: DrawableAssembler::new(),
            synchronizer: SceneSynchronizer::new(scene, config.ordering),
            deferred: BTreeMap::new(),
            metrics,
            torn_down: false,
            config,
        })
    }

    /// Runs one frame against `camera`.
    pub fn update(
        &mut self,
        camera: &CameraState,
        now: Instant,
    ) -> Result<FrameReport, LayerError> {
        if self.torn_down {
            return Err(LayerError::TornDown);
        }
        let mut report = FrameReport {
            completions: self.drain_completions(now)?,
            ..FrameReport::default()
        };
        self.retry_deferred(now)?;

        let decision = self.evaluator.evaluate(&mut self.store, camera, now)?;
        report.requested = decision.to_fetch.len();
        report.cache_hits = self.handle_fetches(&decision, now)?;
        report.started = self.scheduler.admit(now);

        let (additions, retired) = self.assemble(&decision)?;
        report.built = additions.len();
        report.retired = retired.len();
        let previous = self.synchronizer.version();
        let version = self.publish(additions, retired)?;
        report.version = version;
        report.published = version != previous;

        report.pruned = self.prune(&decision.collapse)?;
        for node in &decision.render {
            self.cache.touch(*node);
        }

        report.split = decision.to_split;
        report.merged = decision.to_merge;
        report.drawn = self.assembler.live_count();

        self.metrics
            .update_completed(report.split.len(), report.merged.len());
        self.metrics.set_cache_size(self.cache.used_bytes());
        tracing::debug!(
            version = %report.version,
            requested = report.requested,
            started = report.started,
            built = report.built,
            retired = report.retired,
            pruned = report.pruned,
            in_flight = self.scheduler.in_flight(),
            "Frame updated"
        );
        Ok(report)
    }

    /// Applies every completion waiting on the channel.
    pub fn drain_completions(&mut self, now: Instant) -> Result<usize, LayerError> {
        let mut count = 0;
        while let Ok(completion) = self.completions.try_recv() {
            self.handle_completion(completion, now)?;
            count += 1;
        }
        Ok(count)
    }

    /// Consumes completions that arrive after teardown.
    ///
    /// They belong to the previous generation and change nothing. Returns
    /// how many were ignored.
    pub fn drain_late_completions(&mut self) -> usize {
        let mut ignored = 0;
        let now = Instant::now();
        while let Ok(completion) = self.completions.try_recv() {
            if let CompletionOutcome::Stale = self.scheduler.complete(completion, now) {
                ignored += 1;
            }
        }
        ignored
    }

    fn handle_completion(
        &mut self,
        completion: FetchCompletion,
        now: Instant,
    ) -> Result<(), LayerError> {
        let node = completion.node;
        match self.scheduler.complete(completion, now) {
            CompletionOutcome::Loaded(entry) => {
                if self.store.contains(node) {
                    self.insert_entry(node, entry, now)?;
                } else {
                    tracing::debug!(node = %node, "Dropped payload of pruned node");
                }
            }
            CompletionOutcome::Failed(err) => {
                if self.store.contains(node) {
                    self.store.mark_failed_at(node, now)?;
                }
                tracing::debug!(node = %node, error = %err, "Node marked failed");
            }
            CompletionOutcome::Discarded => {
                if self.state_of(node) == Some(LoadState::Pending) {
                    self.store.mark_state(node, LoadState::Unloaded)?;
                }
            }
            CompletionOutcome::Retrying { .. }
            | CompletionOutcome::Requeued
            | CompletionOutcome::Stale => {}
        }
        Ok(())
    }

    /// Caches a decoded tile, demoting whatever it evicted.
    fn insert_entry(
        &mut self,
        node: NodeId,
        entry: CacheEntry,
        now: Instant,
    ) -> Result<(), LayerError> {
        match self.cache.put(node, entry.clone()) {
            Ok(evicted) => {
                self.demote(&evicted)?;
                self.store.mark_state(node, LoadState::Loaded)?;
                Ok(())
            }
            Err(CacheError::OverBudget {
                needed, evictable, ..
            }) => {
                self.deferred.insert(node, entry);
                self.metrics.cache_deferred();
                tracing::warn!(
                    node = %node,
                    needed,
                    evictable,
                    budget = self.cache.budget_bytes(),
                    "Cache over budget, deferring insert"
                );
                Ok(())
            }
            Err(CacheError::EntryTooLarge { size, budget, .. }) => {
                tracing::warn!(node = %node, size, budget, "Tile larger than cache budget");
                self.store.mark_failed_at(node, now)?;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn retry_deferred(&mut self, now: Instant) -> Result<(), LayerError> {
        if self.deferred.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut self.deferred);
        for (node, entry) in pending {
            match self.cache.put(node, entry.clone()) {
                Ok(evicted) => {
                    self.demote(&evicted)?;
                    self.store.mark_state(node, LoadState::Loaded)?;
                    tracing::debug!(node = %node, "Deferred insert succeeded");
                }
                Err(CacheError::OverBudget { .. }) => {
                    self.deferred.insert(node, entry);
                }
                Err(CacheError::EntryTooLarge { .. }) => {
                    self.store.mark_failed_at(node, now)?;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn demote(&mut self, evicted: &[NodeId]) -> Result<(), LayerError> {
        self.metrics.cache_evicted(evicted.len());
        for node in evicted {
            if self.state_of(*node) == Some(LoadState::Loaded) {
                self.store.mark_state(*node, LoadState::Unloaded)?;
            }
        }
        Ok(())
    }

    /// Returns the number of cache hits adopted.
    fn handle_fetches(
        &mut self,
        decision: &LodDecision,
        now: Instant,
    ) -> Result<usize, LayerError> {
        let mut hits = 0;
        let mut wanted = Vec::with_capacity(decision.to_fetch.len());
        for (node, priority) in &decision.to_fetch {
            if self.deferred.contains_key(node) {
                continue;
            }
            if !self.scheduler.is_outstanding(*node) {
                if self.cache.get(*node).is_some() {
                    self.metrics.cache_hit();
                    self.store.mark_state(*node, LoadState::Loaded)?;
                    hits += 1;
                    continue;
                }
                self.metrics.cache_miss();
            }
            wanted.push((*node, *priority));
        }

        // Parked payloads nobody wants any more.
        let keep: BTreeSet<NodeId> = decision.to_fetch.iter().map(|(n, _)| *n).collect();
        let dropped: Vec<NodeId> = self
            .deferred
            .keys()
            .filter(|n| !keep.contains(n))
            .copied()
            .collect();
        for node in dropped {
            self.deferred.remove(&node);
            if self.state_of(node) == Some(LoadState::Pending) {
                self.store.mark_state(node, LoadState::Unloaded)?;
            }
        }

        for node in self.scheduler.reconcile(&wanted, now) {
            if self.state_of(node) == Some(LoadState::Pending) {
                self.store.mark_state(node, LoadState::Unloaded)?;
            }
        }
        for (node, _) in &wanted {
            if self.state_of(*node).is_some_and(|s| s != LoadState::Pending) {
                self.store.mark_state(*node, LoadState::Pending)?;
            }
        }
        Ok(hits)
    }

    /// Builds drawables for new render nodes and retires the rest.
    ///
    /// New entries are pinned here; retired ones are unpinned after publish.
    fn assemble(
        &mut self,
        decision: &LodDecision,
    ) -> Result<(Vec<Drawable>, Vec<Drawable>), LayerError> {
        let mut retired = Vec::new();
        for node in self.assembler.live_nodes() {
            if !decision.render.contains(&node) {
                retired.push(self.assembler.retire(node)?);
            }
        }

        let mut additions = Vec::new();
        for node in &decision.render {
            if self.assembler.live(*node).is_some() {
                continue;
            }
            let entry = self
                .cache
                .peek(*node)
                .cloned()
                .ok_or(CacheError::NotCached(*node))?;
            self.cache.pin(*node)?;
            additions.push(self.assembler.build(*node, &entry)?);
        }
        Ok((additions, retired))
    }

    fn publish(
        &mut self,
        additions: Vec<Drawable>,
        retired: Vec<Drawable>,
    ) -> Result<SceneVersion, LayerError> {
        let added: Vec<(NodeId, DrawableId)> = additions.iter().map(|d| (d.node, d.id)).collect();
        let removals: Vec<DrawableId> = retired.iter().map(|d| d.id).collect();

        let version = self.synchronizer.publish(additions, removals)?;

        for drawable in &retired {
            if self.store.contains(drawable.node) {
                self.store.set_drawable(drawable.node, None)?;
            }
            self.cache.unpin(drawable.node)?;
        }
        for (node, id) in &added {
            self.store.set_drawable(*node, Some(*id))?;
        }
        if !added.is_empty() || !retired.is_empty() {
            self.metrics.drawables_built(added.len());
            self.metrics.drawables_retired(retired.len());
            self.metrics.scene_published(version.0);
        }
        Ok(version)
    }

    /// Drops the descendants of collapsed nodes. Returns how many went.
    fn prune(&mut self, collapse: &[NodeId]) -> Result<usize, LayerError> {
        let mut pruned = 0;
        for id in collapse {
            let Some(node) = self.store.get(*id) else {
                continue;
            };
            for child in node.children().to_vec() {
                for member in self.store.subtree(child) {
                    let cancelled = self.scheduler.cancel(member);
                    let parked = self.deferred.remove(&member).is_some();
                    if (cancelled || parked) && self.state_of(member) == Some(LoadState::Pending) {
                        self.store.mark_state(member, LoadState::Unloaded)?;
                    }
                }
                match self.store.prune(child) {
                    Ok(removed) => pruned += removed.len(),
                    Err(NodeError::PruneBlocked {
                        node,
                        blocker,
                        reason,
                    }) => {
                        tracing::debug!(node = %node, blocker = %blocker, reason, "Prune deferred");
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }
        self.metrics.nodes_pruned(pruned);
        Ok(pruned)
    }

    /// Releases everything the engine holds.
    ///
    /// Cancels all fetches, publishes one removals-only batch for every live
    /// drawable, empties the cache and resets the node store. Later calls
    /// return the same version without doing anything.
    pub fn cleanup(&mut self) -> Result<TeardownReport, LayerError> {
        if self.torn_down {
            return Ok(TeardownReport {
                version: self.synchronizer.version(),
                ..TeardownReport::default()
            });
        }

        let cancelled_in_flight = self.scheduler.cancel_all();
        let retired = self.assembler.retire_all();
        let removals: Vec<DrawableId> = retired.iter().map(|d| d.id).collect();
        let removed = removals.len();
        let version = self.synchronizer.publish(Vec::new(), removals)?;
        if removed > 0 {
            self.metrics.drawables_retired(removed);
            self.metrics.scene_published(version.0);
        }

        for drawable in &retired {
            if let Err(e) = self.cache.unpin(drawable.node) {
                tracing::warn!(
                    node = %drawable.node,
                    error = %e,
                    "Failed to unpin retired drawable"
                );
            }
        }
        self.deferred.clear();
        let released_entries = self.cache.clear().len();
        self.store.reset();
        self.metrics.set_cache_size(0);
        self.torn_down = true;

        tracing::info!(
            version = %version,
            removed,
            cancelled_in_flight,
            released_entries,
            "Tile engine torn down"
        );
        Ok(TeardownReport {
            version,
            removed,
            cancelled_in_flight,
            released_entries,
        })
    }

    fn state_of(&self, node: NodeId) -> Option<LoadState> {
        self.store.get(node).map(|n| n.state())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &NodeStore {
        &self.store
    }

    pub fn cache(&self) -> &TileCache {
        &self.cache
    }

    pub fn scheduler(&self) -> &FetchScheduler {
        &self.scheduler
    }

    pub fn synchronizer(&self) -> &SceneSynchronizer {
        &self.synchronizer
    }

    pub fn in_flight(&self) -> usize {
        self.scheduler.in_flight()
    }

    pub fn deferred(&self) -> usize {
        self.deferred.len()
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.metrics.snapshot()
    }
}

//! Level-of-detail evaluation.
//!
//! Each update walks the quad-tree from the roots and decides, per node,
//! whether its area is drawn by the node itself or by its children, which
//! payloads must be fetched, and which subtrees can be collapsed.
//!
//! # Screen-space error
//!
//! ```text
//! sse = (2 · r_bounds / tile_texels) · viewport_height / (2 · d · tan(fov_y / 2))
//! ```
//!
//! `d` is the distance from the camera to the node's bounding sphere. A node
//! splits when `sse > max_pixel_error`; once split it stays split until
//! `sse <= max_pixel_error · merge_ratio`.
//!
//! # Refinement
//!
//! A node only hands its area to its children once every child is
//! renderable: culled, loaded, or itself covered by renderable children. Until
//! then it keeps drawing itself while the missing children are fetched, so
//! zooming in never skips a level and never leaves a hole.
//!
//! A node whose area its children already cover is not fetched while it is
//! split. It is wanted again only as a merge candidate, at
//! [`Priority::LOWEST`], so an ancestor evicted under memory pressure does not
//! cycle through the cache at a fixed camera.

mod camera;
mod horizon;

pub use camera::CameraState;
pub use horizon::HorizonCuller;

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use crate::coord::{NodeId, SphereBounds};
use crate::loader::Priority;
use crate::node::{LoadState, NodeError, NodeStore, QuadNode};

/// Default pixel error above which a node splits.
pub const DEFAULT_MAX_PIXEL_ERROR: f64 = 2.0;

/// Default merge threshold as a fraction of the split threshold.
pub const DEFAULT_MERGE_RATIO: f64 = 0.5;

/// Default texture edge length of a tile.
pub const DEFAULT_TILE_TEXELS: u32 = 256;

/// Default deepest level the evaluator will split to.
pub const DEFAULT_MAX_LEVEL: u8 = 18;

/// Default interval before failed nodes are requested again.
pub const DEFAULT_FAILED_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Lower bound on camera distance in the error formula.
const MIN_DISTANCE: f64 = 1e-3;

/// LOD thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct LodConfig {
    pub max_pixel_error: f64,
    /// In `(0, 1)`; the gap between split and merge thresholds.
    pub merge_ratio: f64,
    pub tile_texels: u32,
    pub max_level: u8,
    /// Low-frequency re-request of failed nodes; `None` disables it.
    pub failed_retry_after: Option<Duration>,
}

impl Default for LodConfig {
    fn default() -> Self {
        Self {
            max_pixel_error: DEFAULT_MAX_PIXEL_ERROR,
            merge_ratio: DEFAULT_MERGE_RATIO,
            tile_texels: DEFAULT_TILE_TEXELS,
            max_level: DEFAULT_MAX_LEVEL,
            failed_retry_after: Some(DEFAULT_FAILED_RETRY_AFTER),
        }
    }
}

impl LodConfig {
    pub fn with_max_pixel_error(mut self, error: f64) -> Self {
        self.max_pixel_error = error;
        self
    }

    pub fn with_merge_ratio(mut self, ratio: f64) -> Self {
        self.merge_ratio = ratio;
        self
    }

    pub fn with_tile_texels(mut self, texels: u32) -> Self {
        self.tile_texels = texels;
        self
    }

    pub fn with_max_level(mut self, level: u8) -> Self {
        self.max_level = level;
        self
    }

    pub fn with_failed_retry_after(mut self, after: Option<Duration>) -> Self {
        self.failed_retry_after = after;
        self
    }
}

/// Outcome of one evaluation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LodDecision {
    /// Nodes that handed their area to their children this update.
    pub to_split: BTreeSet<NodeId>,
    /// Refined nodes that took their area back this update.
    pub to_merge: BTreeSet<NodeId>,
    /// Wanted payloads, highest priority first, ties by node id.
    pub to_fetch: Vec<(NodeId, Priority)>,
    /// Nodes that should own a drawable after this update.
    pub render: BTreeSet<NodeId>,
    /// Nodes whose descendants are no longer needed.
    pub collapse: Vec<NodeId>,
    pub visited: usize,
    pub culled: usize,
}

impl LodDecision {
    pub fn wants(&self, node: NodeId) -> bool {
        self.to_fetch.iter().any(|(n, _)| *n == node)
    }
}

struct View<'a> {
    camera: &'a CameraState,
    horizon: HorizonCuller,
}

impl View<'_> {
    fn is_visible(&self, bounds: &SphereBounds) -> bool {
        self.horizon.is_above_horizon(bounds.center, bounds.radius) && self.camera.sees(bounds)
    }
}

#[derive(Default)]
struct Collector {
    decision: LodDecision,
    fetch: BTreeMap<NodeId, Priority>,
}

impl Collector {
    fn request(&mut self, node: NodeId, priority: Priority) {
        let slot = self.fetch.entry(node).or_insert(priority);
        if priority > *slot {
            *slot = priority;
        }
    }

    fn finish(mut self) -> LodDecision {
        let mut to_fetch: Vec<(NodeId, Priority)> = self.fetch.into_iter().collect();
        to_fetch.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        self.decision.to_fetch = to_fetch;
        self.decision
    }
}

/// Camera-driven split/merge/fetch decisions.
#[derive(Debug, Clone, Default)]
pub struct LodEvaluator {
    config: LodConfig,
}

impl LodEvaluator {
    pub fn new(config: LodConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LodConfig {
        &self.config
    }

    /// Projected error in pixels of drawing a node with these bounds.
    pub fn screen_space_error(&self, bounds: &SphereBounds, camera: &CameraState) -> f64 {
        let distance = bounds.distance_to(camera.position).max(MIN_DISTANCE);
        let geometric = 2.0 * bounds.radius / self.config.tile_texels.max(1) as f64;
        let projection = camera.viewport_height as f64 / (2.0 * (camera.fov_y * 0.5).tan());
        geometric * projection / distance
    }

    /// Walks the tree and returns this update's decisions.
    ///
    /// Expands nodes and updates `refined` flags in `store`; everything else
    /// is left to the caller.
    pub fn evaluate(
        &self,
        store: &mut NodeStore,
        camera: &CameraState,
        now: Instant,
    ) -> Result<LodDecision, NodeError> {
        let view = View {
            camera,
            horizon: HorizonCuller::new(camera.position, store.globe_radius()),
        };
        let mut out = Collector::default();
        let roots = store.roots().to_vec();
        for root in roots {
            self.visit(store, &view, root, now, &mut out)?;
        }
        Ok(out.finish())
    }

    fn merge_threshold(&self) -> f64 {
        self.config.max_pixel_error * self.config.merge_ratio
    }

    fn needs_fetch(&self, node: &QuadNode, now: Instant) -> bool {
        match node.state() {
            LoadState::Unloaded | LoadState::Pending => true,
            LoadState::Loaded => false,
            LoadState::Failed => match (self.config.failed_retry_after, node.failed_at()) {
                (Some(after), Some(at)) => now.saturating_duration_since(at) >= after,
                (Some(_), None) => true,
                (None, _) => false,
            },
        }
    }

    fn visit(
        &self,
        store: &mut NodeStore,
        view: &View<'_>,
        id: NodeId,
        now: Instant,
        out: &mut Collector,
    ) -> Result<(), NodeError> {
        out.decision.visited += 1;
        let node = store.node(id)?;
        let bounds = *node.bounds();
        let state = node.state();
        let refined = node.is_refined();
        let has_children = !node.children().is_empty();
        let wants_fetch = self.needs_fetch(node, now);

        if !view.is_visible(&bounds) {
            out.decision.culled += 1;
            if refined {
                self.unrefine(store, id)?;
            }
            if has_children {
                out.decision.collapse.push(id);
            }
            return Ok(());
        }

        let sse = self.screen_space_error(&bounds, view.camera);
        let below_max = id.level < self.config.max_level;
        let threshold = if refined {
            self.merge_threshold()
        } else {
            self.config.max_pixel_error
        };
        let want_split = below_max && sse > threshold;

        match state {
            LoadState::Loaded if want_split => {
                let children = store.expand(id)?;
                self.request_children(store, view, &children, now, out)?;
                if self.children_ready(store, view, &children) {
                    if !refined {
                        store.set_refined(id, true)?;
                        out.decision.to_split.insert(id);
                    }
                    for child in children {
                        self.visit(store, view, child, now, out)?;
                    }
                } else {
                    if refined {
                        self.unrefine(store, id)?;
                        out.decision.to_merge.insert(id);
                    }
                    out.decision.render.insert(id);
                    self.prefetch_failed(store, view, &children, now, out)?;
                }
            }
            LoadState::Loaded => {
                if refined {
                    self.unrefine(store, id)?;
                    out.decision.to_merge.insert(id);
                }
                out.decision.render.insert(id);
                if has_children {
                    out.decision.collapse.push(id);
                }
            }
            LoadState::Unloaded | LoadState::Pending | LoadState::Failed => {
                // Nothing of its own to draw: children cover the area once ready.
                if state == LoadState::Failed && below_max {
                    let children = store.expand(id)?;
                    self.request_children(store, view, &children, now, out)?;
                    self.prefetch_failed(store, view, &children, now, out)?;
                }
                let children = store.node(id)?.children().to_vec();
                let covered =
                    children.len() == 4 && self.children_ready(store, view, &children);
                if wants_fetch && !covered {
                    out.request(id, Priority::from_error(sse));
                } else if wants_fetch && sse <= self.merge_threshold() {
                    // Covered by its children; only needed to merge back into.
                    out.request(id, Priority::LOWEST);
                }
                if covered {
                    if !refined {
                        store.set_refined(id, true)?;
                        out.decision.to_split.insert(id);
                    }
                    for child in children {
                        self.visit(store, view, child, now, out)?;
                    }
                } else if refined {
                    self.unrefine(store, id)?;
                }
            }
        }
        Ok(())
    }

    fn request_children(
        &self,
        store: &NodeStore,
        view: &View<'_>,
        children: &[NodeId],
        now: Instant,
        out: &mut Collector,
    ) -> Result<(), NodeError> {
        for child in children {
            let node = store.node(*child)?;
            if view.is_visible(node.bounds()) && self.needs_fetch(node, now) {
                let sse = self.screen_space_error(node.bounds(), view.camera);
                out.request(*child, Priority::from_error(sse));
            }
        }
        Ok(())
    }

    /// Requests what failed children need to become renderable.
    fn prefetch_failed(
        &self,
        store: &mut NodeStore,
        view: &View<'_>,
        children: &[NodeId],
        now: Instant,
        out: &mut Collector,
    ) -> Result<(), NodeError> {
        for child in children {
            let node = store.node(*child)?;
            if node.state() != LoadState::Failed
                || child.level >= self.config.max_level
                || !view.is_visible(node.bounds())
            {
                continue;
            }
            let grandchildren = store.expand(*child)?;
            self.request_children(store, view, &grandchildren, now, out)?;
            self.prefetch_failed(store, view, &grandchildren, now, out)?;
        }
        Ok(())
    }

    fn children_ready(&self, store: &NodeStore, view: &View<'_>, children: &[NodeId]) -> bool {
        children.iter().all(|c| self.is_renderable(store, view, *c))
    }

    /// Culled, loaded, or fully covered by renderable children.
    fn is_renderable(&self, store: &NodeStore, view: &View<'_>, id: NodeId) -> bool {
        let Some(node) = store.get(id) else {
            return false;
        };
        if !view.is_visible(node.bounds()) {
            return true;
        }
        if node.state() == LoadState::Loaded {
            return true;
        }
        node.is_expanded() && self.children_ready(store, view, node.children())
    }

    fn unrefine(&self, store: &mut NodeStore, id: NodeId) -> Result<(), NodeError> {
        for member in store.subtree(id) {
            store.set_refined(member, false)?;
        }
        Ok(())
    }
}

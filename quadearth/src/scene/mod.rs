//! Scene synchronisation.
//!
//! The [`Scene`] is created by the host and shared with the renderer. The
//! engine never touches it directly; every change goes through the
//! [`SceneSynchronizer`], which applies one batch of additions and removals as
//! a single step and publishes an immutable [`SceneSnapshot`] with a new
//! [`SceneVersion`].
//!
//! Two hand-off paths exist:
//!
//! - **Snapshots** via a `watch` channel: the renderer reads
//!   [`SceneView::latest`] on its own cadence and only ever sees fully
//!   applied versions.
//! - **Batches** via a `broadcast` channel: delta consumers receive the
//!   ordered [`SceneOp`]s of each publish.
//!
//! # Example
//!
//! ```ignore
//! let scene = Scene::new();
//! let mut view = scene.subscribe();
//!
//! // render loop
//! loop {
//!     let snapshot = view.changed().await?;
//!     for drawable in snapshot.drawables() { /* draw */ }
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{broadcast, watch};

use crate::coord::NodeId;
use crate::drawable::{Drawable, DrawableId};

/// Default capacity of the batch broadcast channel.
pub const DEFAULT_BATCH_CAPACITY: usize = 64;

/// Monotonic scene version. Version 0 is the empty initial scene.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SceneVersion(pub u64);

impl SceneVersion {
    pub fn next(self) -> Self {
        SceneVersion(self.0 + 1)
    }
}

impl fmt::Display for SceneVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Errors from scene publication and observation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SceneError {
    #[error("Cannot remove unknown drawable {0}")]
    UnknownDrawable(DrawableId),

    #[error("Drawable {0} is already in the scene")]
    DuplicateDrawable(DrawableId),

    #[error("Node {node} would have two drawables ({existing} and {incoming})")]
    NodeAlreadyDrawn {
        node: NodeId,
        existing: DrawableId,
        incoming: DrawableId,
    },

    #[error("Scene publisher has been dropped")]
    Closed,
}

/// Relative order of additions and removals within one batch.
///
/// The snapshot swap itself is atomic; the ordering matters to delta
/// consumers applying [`SceneOp`]s one at a time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SwapOrdering {
    /// Additions first. Never leaves a hole, may briefly overlap.
    #[default]
    AddThenRemove,
    /// Removals first. Never overlaps, may briefly leave a hole.
    RemoveThenAdd,
}

impl SwapOrdering {
    pub fn as_str(&self) -> &'static str {
        match self {
            SwapOrdering::AddThenRemove => "add-then-remove",
            SwapOrdering::RemoveThenAdd => "remove-then-add",
        }
    }
}

impl fmt::Display for SwapOrdering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SwapOrdering {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "add-then-remove" | "add_then_remove" => Ok(SwapOrdering::AddThenRemove),
            "remove-then-add" | "remove_then_add" => Ok(SwapOrdering::RemoveThenAdd),
            other => Err(format!(
                "unknown swap ordering '{}' (expected add-then-remove or remove-then-add)",
                other
            )),
        }
    }
}

/// One scene mutation.
#[derive(Debug, Clone)]
pub enum SceneOp {
    Add(Drawable),
    Remove(DrawableId),
}

/// Ordered operations of one publish.
#[derive(Debug, Clone)]
pub struct PublishBatch {
    pub version: SceneVersion,
    pub ops: Vec<SceneOp>,
}

impl PublishBatch {
    pub fn additions(&self) -> impl Iterator<Item = &Drawable> {
        self.ops.iter().filter_map(|op| match op {
            SceneOp::Add(d) => Some(d),
            SceneOp::Remove(_) => None,
        })
    }

    pub fn removals(&self) -> impl Iterator<Item = DrawableId> + '_ {
        self.ops.iter().filter_map(|op| match op {
            SceneOp::Add(_) => None,
            SceneOp::Remove(id) => Some(*id),
        })
    }

    pub fn is_removals_only(&self) -> bool {
        self.ops.iter().all(|op| matches!(op, SceneOp::Remove(_)))
    }
}

/// Difference between two snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotDiff {
    pub added: Vec<DrawableId>,
    pub removed: Vec<DrawableId>,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Immutable, fully applied scene contents.
#[derive(Debug, Clone, Default)]
pub struct SceneSnapshot {
    version: SceneVersion,
    drawables: BTreeMap<DrawableId, Drawable>,
}

impl SceneSnapshot {
    pub fn version(&self) -> SceneVersion {
        self.version
    }

    pub fn len(&self) -> usize {
        self.drawables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drawables.is_empty()
    }

    pub fn get(&self, id: DrawableId) -> Option<&Drawable> {
        self.drawables.get(&id)
    }

    pub fn contains(&self, id: DrawableId) -> bool {
        self.drawables.contains_key(&id)
    }

    /// Drawables in handle order.
    pub fn drawables(&self) -> impl Iterator<Item = &Drawable> {
        self.drawables.values()
    }

    pub fn drawable_for(&self, node: NodeId) -> Option<&Drawable> {
        self.drawables.values().find(|d| d.node == node)
    }

    /// Nodes currently drawn.
    pub fn nodes(&self) -> BTreeSet<NodeId> {
        self.drawables.values().map(|d| d.node).collect()
    }

    /// What changed going from `older` to `self`.
    pub fn diff(&self, older: &SceneSnapshot) -> SnapshotDiff {
        SnapshotDiff {
            added: self
                .drawables
                .keys()
                .filter(|id| !older.drawables.contains_key(id))
                .copied()
                .collect(),
            removed: older
                .drawables
                .keys()
                .filter(|id| !self.drawables.contains_key(id))
                .copied()
                .collect(),
        }
    }
}

/// Host-owned render scene.
pub struct Scene {
    snapshot_tx: watch::Sender<Arc<SceneSnapshot>>,
    batch_tx: broadcast::Sender<Arc<PublishBatch>>,
}

impl Scene {
    pub fn new() -> Arc<Self> {
        Self::with_batch_capacity(DEFAULT_BATCH_CAPACITY)
    }

    pub fn with_batch_capacity(capacity: usize) -> Arc<Self> {
        let (snapshot_tx, _) = watch::channel(Arc::new(SceneSnapshot::default()));
        let (batch_tx, _) = broadcast::channel(capacity.max(1));
        Arc::new(Self {
            snapshot_tx,
            batch_tx,
        })
    }

    /// Latest published snapshot.
    pub fn latest(&self) -> Arc<SceneSnapshot> {
        self.snapshot_tx.borrow().clone()
    }

    pub fn version(&self) -> SceneVersion {
        self.snapshot_tx.borrow().version
    }

    /// Snapshot observer for a render consumer.
    pub fn subscribe(&self) -> SceneView {
        SceneView {
            rx: self.snapshot_tx.subscribe(),
        }
    }

    /// Receiver of every publish batch from now on.
    pub fn subscribe_batches(&self) -> broadcast::Receiver<Arc<PublishBatch>> {
        self.batch_tx.subscribe()
    }

    fn swap(&self, snapshot: Arc<SceneSnapshot>, batch: PublishBatch) {
        self.snapshot_tx.send_replace(snapshot);
        // No batch subscribers is fine.
        let _ = self.batch_tx.send(Arc::new(batch));
    }
}

/// Render-side view of a [`Scene`].
#[derive(Debug, Clone)]
pub struct SceneView {
    rx: watch::Receiver<Arc<SceneSnapshot>>,
}

impl SceneView {
    /// Latest snapshot, marking it seen.
    pub fn latest(&mut self) -> Arc<SceneSnapshot> {
        self.rx.borrow_and_update().clone()
    }

    pub fn version(&self) -> SceneVersion {
        self.rx.borrow().version
    }

    /// Waits for a version newer than the last one seen.
    pub async fn changed(&mut self) -> Result<Arc<SceneSnapshot>, SceneError> {
        self.rx.changed().await.map_err(|_| SceneError::Closed)?;
        Ok(self.latest())
    }
}

/// Sole mutator of a [`Scene`].
pub struct SceneSynchronizer {
    scene: Arc<Scene>,
    current: Arc<SceneSnapshot>,
    ordering: SwapOrdering,
}

impl SceneSynchronizer {
    pub fn new(scene: Arc<Scene>, ordering: SwapOrdering) -> Self {
        let current = scene.latest();
        Self {
            scene,
            current,
            ordering,
        }
    }

    pub fn scene(&self) -> &Arc<Scene> {
        &self.scene
    }

    pub fn ordering(&self) -> SwapOrdering {
        self.ordering
    }

    pub fn current(&self) -> &Arc<SceneSnapshot> {
        &self.current
    }

    pub fn version(&self) -> SceneVersion {
        self.current.version
    }

    /// Applies additions and removals as one step.
    ///
    /// The batch is validated before anything changes. An empty batch
    /// returns the current version unchanged.
    pub fn publish(
        &mut self,
        mut additions: Vec<Drawable>,
        mut removals: Vec<DrawableId>,
    ) -> Result<SceneVersion, SceneError> {
        if additions.is_empty() && removals.is_empty() {
            return Ok(self.current.version);
        }
        additions.sort_by_key(|d| d.node);
        removals.sort();
        removals.dedup();

        let mut drawables = self.current.drawables.clone();
        for id in &removals {
            if drawables.remove(id).is_none() {
                return Err(SceneError::UnknownDrawable(*id));
            }
        }

        let mut drawn: BTreeMap<NodeId, DrawableId> =
            drawables.values().map(|d| (d.node, d.id)).collect();
        let mut seen = HashSet::new();
        for drawable in &additions {
            if !seen.insert(drawable.id) || self.current.drawables.contains_key(&drawable.id) {
                return Err(SceneError::DuplicateDrawable(drawable.id));
            }
            if let Some(existing) = drawn.insert(drawable.node, drawable.id) {
                return Err(SceneError::NodeAlreadyDrawn {
                    node: drawable.node,
                    existing,
                    incoming: drawable.id,
                });
            }
        }

        let version = self.current.version.next();
        let added = additions.len();
        let removed = removals.len();
        let mut ops = Vec::with_capacity(added + removed);
        let add_ops = additions.iter().cloned().map(SceneOp::Add);
        let remove_ops = removals.iter().copied().map(SceneOp::Remove);
        match self.ordering {
            SwapOrdering::AddThenRemove => {
                ops.extend(add_ops);
                ops.extend(remove_ops);
            }
            SwapOrdering::RemoveThenAdd => {
                ops.extend(remove_ops);
                ops.extend(add_ops);
            }
        }

        for drawable in additions {
            drawables.insert(drawable.id, drawable);
        }
        let snapshot = Arc::new(SceneSnapshot { version, drawables });
        self.current = Arc::clone(&snapshot);
        self.scene.swap(snapshot, PublishBatch { version, ops });

        tracing::debug!(version = %version, added, removed, "Published scene batch");
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheEntry;
    use crate::drawable::DrawableAssembler;
    use crate::tile::{TileImage, TileMesh};

    fn entry() -> CacheEntry {
        let mesh = TileMesh {
            center: glam::DVec3::ZERO,
            positions: vec![[0.0; 3]],
            uvs: vec![[0.0; 2]],
            indices: Vec::new(),
        };
        let texture = TileImage {
            width: 1,
            height: 1,
            pixels: vec![0; 4],
        };
        CacheEntry::new(Arc::new(mesh), Arc::new(texture))
    }

    fn build(assembler: &mut DrawableAssembler, node: NodeId) -> Drawable {
        assembler.build(node, &entry()).unwrap()
    }

    /// Applies a batch op by op and returns the node set after every step.
    fn replay(start: &SceneSnapshot, batch: &PublishBatch) -> Vec<BTreeSet<NodeId>> {
        let mut live: BTreeMap<DrawableId, NodeId> =
            start.drawables().map(|d| (d.id, d.node)).collect();
        let mut steps = Vec::new();
        for op in &batch.ops {
            match op {
                SceneOp::Add(d) => {
                    live.insert(d.id, d.node);
                }
                SceneOp::Remove(id) => {
                    live.remove(id);
                }
            }
            steps.push(live.values().copied().collect());
        }
        steps
    }

    #[test]
    fn test_publish_bumps_version_and_swaps_snapshot() {
        let scene = Scene::new();
        let mut view = scene.subscribe();
        let mut sync = SceneSynchronizer::new(scene.clone(), SwapOrdering::default());
        let mut assembler = DrawableAssembler::new();

        let d = build(&mut assembler, NodeId::new(0, 0, 0));
        let version = sync.publish(vec![d.clone()], vec![]).unwrap();
        assert_eq!(version, SceneVersion(1));
        assert_eq!(scene.version(), SceneVersion(1));

        let snapshot = view.latest();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.drawable_for(NodeId::new(0, 0, 0)).map(|x| x.id), Some(d.id));
    }

    #[test]
    fn test_empty_publish_keeps_version() {
        let scene = Scene::new();
        let mut sync = SceneSynchronizer::new(scene.clone(), SwapOrdering::default());
        assert_eq!(sync.publish(vec![], vec![]).unwrap(), SceneVersion(0));
        assert_eq!(scene.version(), SceneVersion(0));
    }

    #[test]
    fn test_invalid_batch_changes_nothing() {
        let scene = Scene::new();
        let mut sync = SceneSynchronizer::new(scene.clone(), SwapOrdering::default());
        let mut assembler = DrawableAssembler::new();
        let d = build(&mut assembler, NodeId::new(1, 0, 0));

        let err = sync
            .publish(vec![d], vec![DrawableId::new(999)])
            .unwrap_err();
        assert_eq!(err, SceneError::UnknownDrawable(DrawableId::new(999)));
        assert_eq!(scene.version(), SceneVersion(0));
        assert!(scene.latest().is_empty());
    }

    #[test]
    fn test_two_drawables_for_one_node_rejected() {
        let scene = Scene::new();
        let mut sync = SceneSynchronizer::new(scene, SwapOrdering::default());
        let mut assembler = DrawableAssembler::new();
        let node = NodeId::new(1, 1, 1);
        let first = build(&mut assembler, node);
        sync.publish(vec![first.clone()], vec![]).unwrap();

        assembler.retire(node).unwrap();
        let second = build(&mut assembler, node);
        assert!(matches!(
            sync.publish(vec![second.clone()], vec![]),
            Err(SceneError::NodeAlreadyDrawn { .. })
        ));
        // Replacing in one batch is fine.
        assert!(sync.publish(vec![second], vec![first.id]).is_ok());
    }

    #[test]
    fn test_add_then_remove_never_leaves_a_hole() {
        let scene = Scene::new();
        let mut batches = scene.subscribe_batches();
        let mut sync = SceneSynchronizer::new(scene.clone(), SwapOrdering::AddThenRemove);
        let mut assembler = DrawableAssembler::new();

        let parent = NodeId::new(1, 0, 0);
        let p = build(&mut assembler, parent);
        sync.publish(vec![p.clone()], vec![]).unwrap();
        let before = scene.latest();
        let _ = batches.try_recv();

        let children: Vec<Drawable> = parent
            .children()
            .into_iter()
            .map(|c| build(&mut assembler, c))
            .collect();
        sync.publish(children, vec![p.id]).unwrap();
        let batch = batches.try_recv().unwrap();

        for step in replay(&before, &batch) {
            let parent_drawn = step.contains(&parent);
            let all_children = parent.children().iter().all(|c| step.contains(c));
            assert!(parent_drawn || all_children, "coverage gap during split");
        }
    }

    #[test]
    fn test_remove_then_add_never_overlaps() {
        let scene = Scene::new();
        let mut batches = scene.subscribe_batches();
        let mut sync = SceneSynchronizer::new(scene.clone(), SwapOrdering::RemoveThenAdd);
        let mut assembler = DrawableAssembler::new();

        let parent = NodeId::new(1, 0, 0);
        let p = build(&mut assembler, parent);
        sync.publish(vec![p.clone()], vec![]).unwrap();
        let before = scene.latest();
        let _ = batches.try_recv();

        let children: Vec<Drawable> = parent
            .children()
            .into_iter()
            .map(|c| build(&mut assembler, c))
            .collect();
        sync.publish(children, vec![p.id]).unwrap();
        let batch = batches.try_recv().unwrap();

        for step in replay(&before, &batch) {
            let parent_drawn = step.contains(&parent);
            let any_child = parent.children().iter().any(|c| step.contains(c));
            assert!(!(parent_drawn && any_child), "overlap during split");
        }
    }

    #[test]
    fn test_diff() {
        let scene = Scene::new();
        let mut sync = SceneSynchronizer::new(scene.clone(), SwapOrdering::default());
        let mut assembler = DrawableAssembler::new();
        let a = build(&mut assembler, NodeId::new(0, 0, 0));
        let b = build(&mut assembler, NodeId::new(0, 1, 0));

        sync.publish(vec![a.clone()], vec![]).unwrap();
        let v1 = scene.latest();
        sync.publish(vec![b.clone()], vec![a.id]).unwrap();
        let v2 = scene.latest();

        let diff = v2.diff(&v1);
        assert_eq!(diff.added, vec![b.id]);
        assert_eq!(diff.removed, vec![a.id]);
        assert!(v2.diff(&v2).is_empty());
    }

    #[tokio::test]
    async fn test_view_observes_changes() {
        let scene = Scene::new();
        let mut view = scene.subscribe();
        let mut sync = SceneSynchronizer::new(scene.clone(), SwapOrdering::default());
        let mut assembler = DrawableAssembler::new();

        let d = build(&mut assembler, NodeId::new(0, 0, 0));
        sync.publish(vec![d], vec![]).unwrap();
        let snapshot = view.changed().await.unwrap();
        assert_eq!(snapshot.version(), SceneVersion(1));
        assert_eq!(view.version(), SceneVersion(1));
    }

    #[test]
    fn test_swap_ordering_parse() {
        assert_eq!(
            "remove-then-add".parse::<SwapOrdering>().unwrap(),
            SwapOrdering::RemoveThenAdd
        );
        assert_eq!(
            "Add_Then_Remove".parse::<SwapOrdering>().unwrap(),
            SwapOrdering::AddThenRemove
        );
        assert!("sideways".parse::<SwapOrdering>().is_err());
    }
}

//! Quad-tree node store.
//!
//! An arena of [`QuadNode`]s keyed by [`NodeId`]. Roots are created up front
//! from the tiling scheme; every other node is created lazily when the LOD
//! evaluator first needs it and removed again by [`NodeStore::prune`].
//!
//! The store is owned by the engine worker and never shared across threads,
//! so it carries no locking of its own.

use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

use thiserror::Error;

use crate::coord::{GeoExtent, NodeId, Quadrant, SphereBounds, TilingScheme};
use crate::drawable::DrawableId;

/// Load state of a node's tile payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadState {
    /// No payload and no request outstanding.
    Unloaded,
    /// A fetch is outstanding or a fetched payload awaits cache admission.
    Pending,
    /// The payload is in the tile cache.
    Loaded,
    /// The last load attempt failed permanently.
    Failed,
}

impl LoadState {
    /// True once a load attempt has finished, successfully or not.
    pub fn is_resolved(&self) -> bool {
        matches!(self, LoadState::Loaded | LoadState::Failed)
    }
}

impl fmt::Display for LoadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoadState::Unloaded => "unloaded",
            LoadState::Pending => "pending",
            LoadState::Loaded => "loaded",
            LoadState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Errors from node store operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NodeError {
    /// The id is outside the tiling scheme or not present in the store.
    #[error("Invalid node request {node}: {reason}")]
    InvalidNodeRequest { node: NodeId, reason: String },

    /// Children requested before the parent's own load attempt resolved.
    #[error("Node {node} is {state}; children need a loaded or failed parent")]
    ParentUnresolved { node: NodeId, state: LoadState },

    /// A node in the subtree is still pending or drawn.
    #[error("Cannot prune {node}: {blocker} is {reason}")]
    PruneBlocked {
        node: NodeId,
        blocker: NodeId,
        reason: &'static str,
    },

    /// Roots are fixed for the lifetime of the store.
    #[error("Root node {0} cannot be pruned")]
    RootNotPrunable(NodeId),
}

impl NodeError {
    fn invalid(node: NodeId, reason: impl Into<String>) -> Self {
        NodeError::InvalidNodeRequest {
            node,
            reason: reason.into(),
        }
    }
}

/// A single quad-tree node.
#[derive(Debug, Clone)]
pub struct QuadNode {
    id: NodeId,
    extent: GeoExtent,
    bounds: SphereBounds,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    state: LoadState,
    failed_at: Option<Instant>,
    refined: bool,
    drawable: Option<DrawableId>,
}

impl QuadNode {
    fn new(id: NodeId, scheme: &TilingScheme, globe_radius: f64) -> Self {
        let extent = scheme.extent(id);
        Self {
            id,
            extent,
            bounds: SphereBounds::from_extent(&extent, globe_radius),
            parent: id.parent(),
            children: Vec::new(),
            state: LoadState::Unloaded,
            failed_at: None,
            refined: false,
            drawable: None,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn extent(&self) -> &GeoExtent {
        &self.extent
    }

    pub fn bounds(&self) -> &SphereBounds {
        &self.bounds
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Children created so far, sorted by id.
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    /// True once all four children exist.
    pub fn is_expanded(&self) -> bool {
        self.children.len() == 4
    }

    pub fn state(&self) -> LoadState {
        self.state
    }

    /// When the node last entered [`LoadState::Failed`].
    pub fn failed_at(&self) -> Option<Instant> {
        self.failed_at
    }

    /// True while the node's area is drawn by its descendants.
    pub fn is_refined(&self) -> bool {
        self.refined
    }

    /// Handle of the live drawable built from this node, if any.
    pub fn drawable(&self) -> Option<DrawableId> {
        self.drawable
    }

    /// True once the node's own load attempt has finished.
    pub fn is_resolvable(&self) -> bool {
        self.state.is_resolved()
    }
}

/// Arena of quad-tree nodes indexed by id.
pub struct NodeStore {
    scheme: TilingScheme,
    globe_radius: f64,
    roots: Vec<NodeId>,
    nodes: HashMap<NodeId, QuadNode>,
}

impl NodeStore {
    /// Creates a store holding the scheme's root nodes.
    pub fn new(scheme: TilingScheme, globe_radius: f64) -> Self {
        let roots = scheme.roots();
        let nodes = roots
            .iter()
            .map(|id| (*id, QuadNode::new(*id, &scheme, globe_radius)))
            .collect();
        Self {
            scheme,
            globe_radius,
            roots,
            nodes,
        }
    }

    pub fn scheme(&self) -> &TilingScheme {
        &self.scheme
    }

    pub fn globe_radius(&self) -> f64 {
        self.globe_radius
    }

    /// Root ids in id order.
    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    /// Returns the root at `index` (id order).
    pub fn root(&self, index: usize) -> Result<&QuadNode, NodeError> {
        let id = self.roots.get(index).ok_or_else(|| {
            NodeError::invalid(NodeId::new(0, 0, 0), format!("no root #{}", index))
        })?;
        self.node(*id)
    }

    pub fn get(&self, id: NodeId) -> Option<&QuadNode> {
        self.nodes.get(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Like [`get`](Self::get) but reports a missing node as an error.
    pub fn node(&self, id: NodeId) -> Result<&QuadNode, NodeError> {
        self.nodes
            .get(&id)
            .ok_or_else(|| NodeError::invalid(id, "not in store"))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut QuadNode, NodeError> {
        self.nodes
            .get_mut(&id)
            .ok_or_else(|| NodeError::invalid(id, "not in store"))
    }

    /// Number of nodes currently in the store.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QuadNode> {
        self.nodes.values()
    }

    /// Returns the child in `quadrant`, creating it on first use.
    ///
    /// Children are only created once the parent has resolved; until then
    /// nothing below it can be evaluated.
    pub fn get_or_create_child(
        &mut self,
        parent: NodeId,
        quadrant: Quadrant,
    ) -> Result<&QuadNode, NodeError> {
        let child = parent.child(quadrant);
        {
            let node = self.node(parent)?;
            if !node.is_resolvable() {
                return Err(NodeError::ParentUnresolved {
                    node: parent,
                    state: node.state,
                });
            }
        }
        self.scheme
            .validate(child)
            .map_err(|e| NodeError::invalid(child, e.to_string()))?;

        if !self.nodes.contains_key(&child) {
            let node = QuadNode::new(child, &self.scheme, self.globe_radius);
            self.nodes.insert(child, node);
            let parent_node = self.node_mut(parent)?;
            parent_node.children.push(child);
            parent_node.children.sort();
            tracing::trace!(node = %child, "Created quad node");
        }
        self.node(child)
    }

    /// Creates (if needed) and returns all four children of `parent`.
    pub fn expand(&mut self, parent: NodeId) -> Result<[NodeId; 4], NodeError> {
        for quadrant in Quadrant::ALL {
            self.get_or_create_child(parent, quadrant)?;
        }
        Ok(parent.children())
    }

    /// Sets a node's load state and returns the previous one.
    pub fn mark_state(&mut self, id: NodeId, state: LoadState) -> Result<LoadState, NodeError> {
        let node = self.node_mut(id)?;
        let previous = node.state;
        node.state = state;
        node.failed_at = match state {
            LoadState::Failed => Some(Instant::now()),
            _ => None,
        };
        Ok(previous)
    }

    /// Marks a node failed at an explicit instant.
    pub fn mark_failed_at(&mut self, id: NodeId, at: Instant) -> Result<(), NodeError> {
        let node = self.node_mut(id)?;
        node.state = LoadState::Failed;
        node.failed_at = Some(at);
        Ok(())
    }

    pub fn set_refined(&mut self, id: NodeId, refined: bool) -> Result<(), NodeError> {
        self.node_mut(id)?.refined = refined;
        Ok(())
    }

    pub fn set_drawable(
        &mut self,
        id: NodeId,
        drawable: Option<DrawableId>,
    ) -> Result<(), NodeError> {
        self.node_mut(id)?.drawable = drawable;
        Ok(())
    }

    /// Returns `id` and all of its descendants currently in the store.
    pub fn subtree(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.get(&current) {
                out.push(current);
                stack.extend(node.children.iter().copied());
            }
        }
        out
    }

    /// Removes a node and its subtree.
    ///
    /// Refused when any node in the subtree is [`LoadState::Pending`] or
    /// still holds a live drawable. Returns the removed ids.
    pub fn prune(&mut self, id: NodeId) -> Result<Vec<NodeId>, NodeError> {
        if id.is_root() {
            return Err(NodeError::RootNotPrunable(id));
        }
        self.node(id)?;

        let subtree = self.subtree(id);
        for member in &subtree {
            let node = &self.nodes[member];
            if node.state == LoadState::Pending {
                return Err(NodeError::PruneBlocked {
                    node: id,
                    blocker: *member,
                    reason: "pending",
                });
            }
            if node.drawable.is_some() {
                return Err(NodeError::PruneBlocked {
                    node: id,
                    blocker: *member,
                    reason: "drawn",
                });
            }
        }

        for member in &subtree {
            self.nodes.remove(member);
        }
        if let Some(parent) = id.parent().and_then(|p| self.nodes.get_mut(&p)) {
            parent.children.retain(|c| *c != id);
            if parent.children.is_empty() {
                parent.refined = false;
            }
        }
        tracing::trace!(node = %id, removed = subtree.len(), "Pruned quad subtree");
        Ok(subtree)
    }

    /// Drops every non-root node and returns roots to their initial state.
    pub fn reset(&mut self) {
        let roots = &self.roots;
        self.nodes.retain(|id, _| roots.contains(id));
        for node in self.nodes.values_mut() {
            node.children.clear();
            node.state = LoadState::Unloaded;
            node.failed_at = None;
            node.refined = false;
            node.drawable = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RADIUS: f64 = 6_378_137.0;

    fn store() -> NodeStore {
        NodeStore::new(TilingScheme::default(), RADIUS)
    }

    #[test]
    fn test_new_store_has_roots_only() {
        let store = store();
        assert_eq!(store.len(), 4);
        assert_eq!(store.roots().len(), 4);
        for root in store.roots() {
            let node = store.get(*root).unwrap();
            assert_eq!(node.state(), LoadState::Unloaded);
            assert!(node.parent().is_none());
        }
        assert_eq!(store.root(0).unwrap().id(), NodeId::new(0, 0, 0));
        assert!(store.root(9).is_err());
    }

    #[test]
    fn test_children_require_resolved_parent() {
        let mut store = store();
        let root = NodeId::new(0, 0, 0);

        let err = store.get_or_create_child(root, Quadrant::SouthWest).unwrap_err();
        assert!(matches!(err, NodeError::ParentUnresolved { .. }));

        store.mark_state(root, LoadState::Pending).unwrap();
        assert!(store.expand(root).is_err());

        store.mark_state(root, LoadState::Failed).unwrap();
        let children = store.expand(root).unwrap();
        assert_eq!(store.len(), 8);
        for child in children {
            assert_eq!(store.get(child).unwrap().parent(), Some(root));
        }
        assert!(store.get(root).unwrap().is_expanded());
    }

    #[test]
    fn test_get_or_create_child_is_idempotent() {
        let mut store = store();
        let root = NodeId::new(0, 1, 0);
        store.mark_state(root, LoadState::Loaded).unwrap();
        store.get_or_create_child(root, Quadrant::NorthEast).unwrap();
        store.get_or_create_child(root, Quadrant::NorthEast).unwrap();
        assert_eq!(store.get(root).unwrap().children().len(), 1);
    }

    #[test]
    fn test_unknown_node_is_invalid_request() {
        let mut store = store();
        let err = store
            .mark_state(NodeId::new(5, 1, 1), LoadState::Loaded)
            .unwrap_err();
        assert!(matches!(err, NodeError::InvalidNodeRequest { .. }));
    }

    #[test]
    fn test_failed_at_tracks_failure() {
        let mut store = store();
        let root = NodeId::new(0, 0, 1);
        store.mark_state(root, LoadState::Failed).unwrap();
        assert!(store.get(root).unwrap().failed_at().is_some());
        store.mark_state(root, LoadState::Pending).unwrap();
        assert!(store.get(root).unwrap().failed_at().is_none());
    }

    #[test]
    fn test_prune_removes_subtree() {
        let mut store = store();
        let root = NodeId::new(0, 0, 0);
        store.mark_state(root, LoadState::Loaded).unwrap();
        let children = store.expand(root).unwrap();
        store.mark_state(children[0], LoadState::Loaded).unwrap();
        store.expand(children[0]).unwrap();
        assert_eq!(store.len(), 12);

        let removed = store.prune(children[0]).unwrap();
        assert_eq!(removed.len(), 5);
        assert!(!store.contains(children[0]));
        assert_eq!(store.get(root).unwrap().children().len(), 3);
    }

    #[test]
    fn test_prune_blocked_by_pending_descendant() {
        let mut store = store();
        let root = NodeId::new(0, 0, 0);
        store.mark_state(root, LoadState::Loaded).unwrap();
        let children = store.expand(root).unwrap();
        store.mark_state(children[0], LoadState::Loaded).unwrap();
        let grandchildren = store.expand(children[0]).unwrap();
        store.mark_state(grandchildren[2], LoadState::Pending).unwrap();

        let err = store.prune(children[0]).unwrap_err();
        assert_eq!(
            err,
            NodeError::PruneBlocked {
                node: children[0],
                blocker: grandchildren[2],
                reason: "pending",
            }
        );
        assert!(store.contains(grandchildren[2]));
    }

    #[test]
    fn test_prune_blocked_by_drawable() {
        let mut store = store();
        let root = NodeId::new(0, 0, 0);
        store.mark_state(root, LoadState::Loaded).unwrap();
        let children = store.expand(root).unwrap();
        store.set_drawable(children[1], Some(DrawableId::new(7))).unwrap();
        assert!(matches!(
            store.prune(children[1]),
            Err(NodeError::PruneBlocked { reason: "drawn", .. })
        ));
    }

    #[test]
    fn test_roots_cannot_be_pruned() {
        let mut store = store();
        assert_eq!(
            store.prune(NodeId::new(0, 0, 0)),
            Err(NodeError::RootNotPrunable(NodeId::new(0, 0, 0)))
        );
    }

    #[test]
    fn test_reset_keeps_roots() {
        let mut store = store();
        let root = NodeId::new(0, 1, 1);
        store.mark_state(root, LoadState::Loaded).unwrap();
        store.expand(root).unwrap();
        store.set_refined(root, true).unwrap();

        store.reset();
        assert_eq!(store.len(), 4);
        let node = store.get(root).unwrap();
        assert_eq!(node.state(), LoadState::Unloaded);
        assert!(node.children().is_empty());
        assert!(!node.is_refined());
    }

    #[test]
    fn test_out_of_grid_child_rejected() {
        let scheme = TilingScheme::new(1, 1).unwrap();
        let mut store = NodeStore::new(scheme, RADIUS);
        let root = NodeId::new(0, 0, 0);
        store.mark_state(root, LoadState::Loaded).unwrap();
        let mut deepest = root;
        for _ in 0..crate::coord::MAX_LEVEL {
            store.mark_state(deepest, LoadState::Loaded).unwrap();
            deepest = store
                .get_or_create_child(deepest, Quadrant::SouthWest)
                .unwrap()
                .id();
        }
        store.mark_state(deepest, LoadState::Loaded).unwrap();
        assert!(matches!(
            store.get_or_create_child(deepest, Quadrant::SouthWest),
            Err(NodeError::InvalidNodeRequest { .. })
        ));
    }
}

//! Drawable assembly.
//!
//! Turns cached tile artefacts into renderer-facing [`Drawable`]s and tracks
//! which node currently owns a live one. Building is pure: it only shares the
//! cached mesh and texture, so building, retiring and building again from the
//! same entry yields an equivalent drawable.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::cache::CacheEntry;
use crate::coord::NodeId;
use crate::tile::{TileImage, TileMesh};

/// Opaque handle of a drawable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DrawableId(u64);

impl DrawableId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for DrawableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "d{}", self.0)
    }
}

/// Errors from the drawable assembler.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AssemblyError {
    #[error("Node {node} already has live drawable {drawable}")]
    AlreadyLive { node: NodeId, drawable: DrawableId },

    #[error("Node {0} has no live drawable")]
    NotLive(NodeId),
}

/// A renderable tile.
#[derive(Debug, Clone)]
pub struct Drawable {
    pub id: DrawableId,
    pub node: NodeId,
    pub mesh: Arc<TileMesh>,
    pub texture: Arc<TileImage>,
    pub visible: bool,
    /// Assembly sequence number; increases with every build.
    pub generation: u64,
}

impl Drawable {
    /// Same node and same content, ignoring handle and generation.
    pub fn is_equivalent(&self, other: &Drawable) -> bool {
        self.node == other.node
            && self.visible == other.visible
            && (Arc::ptr_eq(&self.mesh, &other.mesh) || self.mesh == other.mesh)
            && (Arc::ptr_eq(&self.texture, &other.texture) || self.texture == other.texture)
    }
}

/// Builds and retires drawables, at most one live per node.
#[derive(Debug, Default)]
pub struct DrawableAssembler {
    next_id: u64,
    generation: u64,
    live: HashMap<NodeId, Drawable>,
}

impl DrawableAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a drawable for `node` from its cache entry.
    pub fn build(&mut self, node: NodeId, entry: &CacheEntry) -> Result<Drawable, AssemblyError> {
        if let Some(existing) = self.live.get(&node) {
            return Err(AssemblyError::AlreadyLive {
                node,
                drawable: existing.id,
            });
        }
        self.next_id += 1;
        self.generation += 1;
        let drawable = Drawable {
            id: DrawableId(self.next_id),
            node,
            mesh: Arc::clone(entry.mesh()),
            texture: Arc::clone(entry.texture()),
            visible: true,
            generation: self.generation,
        };
        self.live.insert(node, drawable.clone());
        tracing::debug!(node = %node, drawable = %drawable.id, "Built drawable");
        Ok(drawable)
    }

    /// Retires the live drawable of `node` and returns it.
    pub fn retire(&mut self, node: NodeId) -> Result<Drawable, AssemblyError> {
        let drawable = self.live.remove(&node).ok_or(AssemblyError::NotLive(node))?;
        tracing::debug!(node = %node, drawable = %drawable.id, "Retired drawable");
        Ok(drawable)
    }

    pub fn live(&self, node: NodeId) -> Option<&Drawable> {
        self.live.get(&node)
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Nodes with a live drawable, sorted.
    pub fn live_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.live.keys().copied().collect();
        nodes.sort();
        nodes
    }

    /// Retires everything, sorted by node.
    pub fn retire_all(&mut self) -> Vec<Drawable> {
        let mut all: Vec<Drawable> = self.live.drain().map(|(_, d)| d).collect();
        all.sort_by_key(|d| d.node);
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::TilingScheme;

    fn entry(node: NodeId) -> CacheEntry {
        let extent = TilingScheme::default().extent(node);
        let mesh = TileMesh::sphere_patch(&extent, 1.0, 2);
        let texture = TileImage {
            width: 1,
            height: 1,
            pixels: vec![1, 2, 3, 4],
        };
        CacheEntry::new(Arc::new(mesh), Arc::new(texture))
    }

    #[test]
    fn test_build_registers_live_drawable() {
        let mut assembler = DrawableAssembler::new();
        let node = NodeId::new(1, 0, 1);
        let drawable = assembler.build(node, &entry(node)).unwrap();
        assert_eq!(drawable.node, node);
        assert!(drawable.visible);
        assert_eq!(assembler.live(node).map(|d| d.id), Some(drawable.id));
        assert_eq!(assembler.live_count(), 1);
    }

    #[test]
    fn test_second_build_rejected() {
        let mut assembler = DrawableAssembler::new();
        let node = NodeId::new(1, 0, 1);
        let first = assembler.build(node, &entry(node)).unwrap();
        assert_eq!(
            assembler.build(node, &entry(node)).unwrap_err(),
            AssemblyError::AlreadyLive {
                node,
                drawable: first.id
            }
        );
    }

    #[test]
    fn test_build_retire_build_is_equivalent() {
        let mut assembler = DrawableAssembler::new();
        let node = NodeId::new(2, 3, 1);
        let cached = entry(node);

        let first = assembler.build(node, &cached).unwrap();
        let retired = assembler.retire(node).unwrap();
        assert_eq!(retired.id, first.id);
        let second = assembler.build(node, &cached).unwrap();

        assert!(first.is_equivalent(&second));
        assert_ne!(first.id, second.id);
        assert!(second.generation > first.generation);
    }

    #[test]
    fn test_equivalence_compares_content() {
        let mut assembler = DrawableAssembler::new();
        let a = NodeId::new(2, 0, 0);
        let b = NodeId::new(2, 1, 0);
        let da = assembler.build(a, &entry(a)).unwrap();
        let db = assembler.build(b, &entry(b)).unwrap();
        assert!(!da.is_equivalent(&db));

        // Separate but identical entries are still equivalent.
        assembler.retire(a).unwrap();
        let again = assembler.build(a, &entry(a)).unwrap();
        assert!(da.is_equivalent(&again));
    }

    #[test]
    fn test_retire_missing() {
        let mut assembler = DrawableAssembler::new();
        let node = NodeId::new(0, 0, 0);
        assert_eq!(assembler.retire(node).unwrap_err(), AssemblyError::NotLive(node));
    }

    #[test]
    fn test_retire_all() {
        let mut assembler = DrawableAssembler::new();
        for x in [3, 1, 2] {
            let node = NodeId::new(2, x, 0);
            assembler.build(node, &entry(node)).unwrap();
        }
        let retired = assembler.retire_all();
        let nodes: Vec<u32> = retired.iter().map(|d| d.node.x).collect();
        assert_eq!(nodes, vec![1, 2, 3]);
        assert_eq!(assembler.live_count(), 0);
    }
}

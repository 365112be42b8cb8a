//! Tile coordinates on the globe.
//!
//! Tiles are addressed by `(level, x, y)` in a geographic (plate carrée)
//! tiling scheme. Level 0 is a fixed grid of root tiles covering the whole
//! sphere; every level below doubles the grid in both directions.
//!
//! - `x` increases eastward from the antimeridian (-180°)
//! - `y` increases northward from the south pole (-90°)

mod bounds;

pub use bounds::{geodetic_to_cartesian, SphereBounds};

use std::f64::consts::{FRAC_PI_2, PI};
use std::fmt;

use thiserror::Error;

/// Deepest level the tiling scheme will address.
///
/// Grid indices are `u32`, so the root grid shifted by this many levels
/// still fits for any reasonable root grid.
pub const MAX_LEVEL: u8 = 24;

/// Errors produced when addressing tiles.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoordError {
    /// Level exceeds [`MAX_LEVEL`].
    #[error("Invalid level {0} (max {MAX_LEVEL})")]
    InvalidLevel(u8),

    /// Grid position is outside the level's grid.
    #[error("Tile {node} is outside the {columns}x{rows} grid of its level")]
    OutOfGrid {
        node: NodeId,
        columns: u32,
        rows: u32,
    },

    /// The root grid has a zero dimension.
    #[error("Root grid must be at least 1x1, got {columns}x{rows}")]
    EmptyRootGrid { columns: u32, rows: u32 },

    /// The level's grid does not fit in `u32` indices.
    #[error("Root grid {columns}x{rows} overflows at level {level}")]
    GridOverflow { columns: u32, rows: u32, level: u8 },
}

/// Identity of a quad-tree node.
///
/// Ordering is `(level, x, y)` lexicographic, which is the deterministic
/// tie-break used wherever two nodes compare equal on priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    /// Level of detail (0 = roots).
    pub level: u8,
    /// Column within the level's grid.
    pub x: u32,
    /// Row within the level's grid.
    pub y: u32,
}

impl NodeId {
    /// Creates a node id.
    pub const fn new(level: u8, x: u32, y: u32) -> Self {
        Self { level, x, y }
    }

    /// Returns true for level-0 nodes.
    pub fn is_root(&self) -> bool {
        self.level == 0
    }

    /// Returns the parent id, or `None` for roots.
    pub fn parent(&self) -> Option<NodeId> {
        if self.level == 0 {
            None
        } else {
            Some(NodeId::new(self.level - 1, self.x / 2, self.y / 2))
        }
    }

    /// Returns the id of the child in the given quadrant.
    pub fn child(&self, quadrant: Quadrant) -> NodeId {
        let (dx, dy) = quadrant.offset();
        NodeId::new(self.level + 1, self.x * 2 + dx, self.y * 2 + dy)
    }

    /// Returns the four child ids in [`Quadrant::ALL`] order.
    pub fn children(&self) -> [NodeId; 4] {
        Quadrant::ALL.map(|q| self.child(q))
    }

    /// Returns which quadrant of its parent this node occupies.
    pub fn quadrant(&self) -> Option<Quadrant> {
        if self.level == 0 {
            return None;
        }
        Some(Quadrant::from_offset(self.x % 2, self.y % 2))
    }

    /// Returns true if `self` is `other` or one of its descendants.
    pub fn is_within(&self, other: &NodeId) -> bool {
        if self.level < other.level {
            return false;
        }
        let shift = self.level - other.level;
        (self.x >> shift) == other.x && (self.y >> shift) == other.y
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.level, self.x, self.y)
    }
}

/// One quarter of a node's area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Quadrant {
    SouthWest,
    SouthEast,
    NorthWest,
    NorthEast,
}

impl Quadrant {
    /// All quadrants in child-id order (lower `y` first, then lower `x`).
    pub const ALL: [Quadrant; 4] = [
        Quadrant::SouthWest,
        Quadrant::SouthEast,
        Quadrant::NorthWest,
        Quadrant::NorthEast,
    ];

    fn offset(self) -> (u32, u32) {
        match self {
            Quadrant::SouthWest => (0, 0),
            Quadrant::SouthEast => (1, 0),
            Quadrant::NorthWest => (0, 1),
            Quadrant::NorthEast => (1, 1),
        }
    }

    fn from_offset(dx: u32, dy: u32) -> Self {
        match (dx, dy) {
            (0, 0) => Quadrant::SouthWest,
            (1, 0) => Quadrant::SouthEast,
            (0, _) => Quadrant::NorthWest,
            _ => Quadrant::NorthEast,
        }
    }
}

/// Geographic extent of a tile, in radians.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoExtent {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl GeoExtent {
    /// Longitude span in radians.
    pub fn width(&self) -> f64 {
        self.east - self.west
    }

    /// Latitude span in radians.
    pub fn height(&self) -> f64 {
        self.north - self.south
    }

    /// Center as `(lon, lat)` in radians.
    pub fn center(&self) -> (f64, f64) {
        (
            (self.west + self.east) * 0.5,
            (self.south + self.north) * 0.5,
        )
    }

    /// Returns true if the point `(lon, lat)` lies inside the extent.
    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        lon >= self.west && lon <= self.east && lat >= self.south && lat <= self.north
    }
}

/// Geographic tiling scheme with a configurable root grid.
///
/// The default 2×2 grid gives four roots of 180°×90° each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TilingScheme {
    root_columns: u32,
    root_rows: u32,
}

impl Default for TilingScheme {
    fn default() -> Self {
        Self {
            root_columns: 2,
            root_rows: 2,
        }
    }
}

impl TilingScheme {
    /// Creates a scheme with the given root grid.
    pub fn new(root_columns: u32, root_rows: u32) -> Result<Self, CoordError> {
        if root_columns == 0 || root_rows == 0 {
            return Err(CoordError::EmptyRootGrid {
                columns: root_columns,
                rows: root_rows,
            });
        }
        Ok(Self {
            root_columns,
            root_rows,
        })
    }

    /// Number of root columns.
    pub fn root_columns(&self) -> u32 {
        self.root_columns
    }

    /// Number of root rows.
    pub fn root_rows(&self) -> u32 {
        self.root_rows
    }

    /// Grid size `(columns, rows)` at a level.
    ///
    /// Saturates at `u32::MAX` for levels whose grid overflows; see
    /// [`Self::checked_grid_size`].
    pub fn grid_size(&self, level: u8) -> (u32, u32) {
        self.checked_grid_size(level).unwrap_or((u32::MAX, u32::MAX))
    }

    /// Grid size at a level, or `None` if either dimension overflows `u32`.
    pub fn checked_grid_size(&self, level: u8) -> Option<(u32, u32)> {
        let shift = u32::from(level);
        let scale = |n: u32| {
            if n.leading_zeros() >= shift {
                n.checked_shl(shift)
            } else {
                None
            }
        };
        Some((scale(self.root_columns)?, scale(self.root_rows)?))
    }

    /// Checks that every level up to `max_level` has a representable grid.
    pub fn check_depth(&self, max_level: u8) -> Result<(), CoordError> {
        if max_level > MAX_LEVEL {
            return Err(CoordError::InvalidLevel(max_level));
        }
        match self.checked_grid_size(max_level) {
            Some(_) => Ok(()),
            None => Err(CoordError::GridOverflow {
                columns: self.root_columns,
                rows: self.root_rows,
                level: max_level,
            }),
        }
    }

    /// All root ids, ordered by id.
    pub fn roots(&self) -> Vec<NodeId> {
        let count = (self.root_columns as usize).saturating_mul(self.root_rows as usize);
        let mut roots = Vec::with_capacity(count);
        for x in 0..self.root_columns {
            for y in 0..self.root_rows {
                roots.push(NodeId::new(0, x, y));
            }
        }
        roots
    }

    /// Checks that a node id addresses a tile of this scheme.
    pub fn validate(&self, node: NodeId) -> Result<(), CoordError> {
        self.check_depth(node.level)?;
        let (columns, rows) = self.grid_size(node.level);
        if node.x >= columns || node.y >= rows {
            return Err(CoordError::OutOfGrid {
                node,
                columns,
                rows,
            });
        }
        Ok(())
    }

    /// Geographic extent of a tile.
    pub fn extent(&self, node: NodeId) -> GeoExtent {
        let (columns, rows) = self.grid_size(node.level);
        let tile_width = 2.0 * PI / columns as f64;
        let tile_height = PI / rows as f64;
        let west = -PI + node.x as f64 * tile_width;
        let south = -FRAC_PI_2 + node.y as f64 * tile_height;
        GeoExtent {
            west,
            south,
            east: west + tile_width,
            north: south + tile_height,
        }
    }

    /// Finds the tile containing `(lon, lat)` (radians) at a level.
    pub fn node_at(&self, lon: f64, lat: f64, level: u8) -> Result<NodeId, CoordError> {
        if level > MAX_LEVEL {
            return Err(CoordError::InvalidLevel(level));
        }
        let (columns, rows) = self.grid_size(level);
        let u = ((lon + PI) / (2.0 * PI)).clamp(0.0, 1.0);
        let v = ((lat + FRAC_PI_2) / PI).clamp(0.0, 1.0);
        let x = ((u * columns as f64) as u32).min(columns - 1);
        let y = ((v * rows as f64) as u32).min(rows - 1);
        Ok(NodeId::new(level, x, y))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_child_roundtrip() {
        let node = NodeId::new(3, 2, 5);
        for quadrant in Quadrant::ALL {
            let child = node.child(quadrant);
            assert_eq!(child.level, 4);
            assert_eq!(child.parent(), Some(node));
            assert_eq!(child.quadrant(), Some(quadrant));
        }
        assert_eq!(NodeId::new(0, 1, 0).parent(), None);
    }

    #[test]
    fn test_children_order_matches_quadrants() {
        let children = NodeId::new(1, 1, 1).children();
        assert_eq!(children[0], NodeId::new(2, 2, 2));
        assert_eq!(children[1], NodeId::new(2, 3, 2));
        assert_eq!(children[2], NodeId::new(2, 2, 3));
        assert_eq!(children[3], NodeId::new(2, 3, 3));
    }

    #[test]
    fn test_ordering_is_level_then_xy() {
        let mut ids = vec![
            NodeId::new(2, 0, 1),
            NodeId::new(1, 3, 3),
            NodeId::new(2, 0, 0),
            NodeId::new(2, 1, 0),
        ];
        ids.sort();
        assert_eq!(
            ids,
            vec![
                NodeId::new(1, 3, 3),
                NodeId::new(2, 0, 0),
                NodeId::new(2, 0, 1),
                NodeId::new(2, 1, 0),
            ]
        );
    }

    #[test]
    fn test_is_within() {
        let root = NodeId::new(0, 1, 0);
        assert!(NodeId::new(3, 9, 2).is_within(&root));
        assert!(!NodeId::new(3, 2, 2).is_within(&root));
        assert!(root.is_within(&root));
        assert!(!root.is_within(&NodeId::new(1, 2, 0)));
    }

    #[test]
    fn test_default_scheme_has_four_roots() {
        let scheme = TilingScheme::default();
        assert_eq!(scheme.roots().len(), 4);
        assert_eq!(scheme.grid_size(3), (16, 16));
    }

    #[test]
    fn test_validate_rejects_out_of_grid() {
        let scheme = TilingScheme::default();
        assert!(scheme.validate(NodeId::new(1, 3, 3)).is_ok());
        assert!(matches!(
            scheme.validate(NodeId::new(1, 4, 0)),
            Err(CoordError::OutOfGrid { .. })
        ));
        assert!(matches!(
            scheme.validate(NodeId::new(MAX_LEVEL + 1, 0, 0)),
            Err(CoordError::InvalidLevel(_))
        ));
    }

    #[test]
    fn test_wide_root_grid_overflows_deep_levels() {
        let scheme = TilingScheme::new(512, 256).unwrap();
        assert_eq!(scheme.checked_grid_size(22), Some((1 << 31, 1 << 30)));
        assert_eq!(scheme.checked_grid_size(23), None);
        assert!(scheme.check_depth(8).is_ok());
        assert!(matches!(
            scheme.check_depth(24),
            Err(CoordError::GridOverflow { level: 24, .. })
        ));
        assert!(matches!(
            scheme.validate(NodeId::new(24, 0, 0)),
            Err(CoordError::GridOverflow { .. })
        ));
        assert_eq!(scheme.grid_size(24), (u32::MAX, u32::MAX));
        assert_eq!(scheme.roots().len(), 512 * 256);
    }

    #[test]
    fn test_empty_root_grid_rejected() {
        assert!(TilingScheme::new(0, 2).is_err());
        assert!(TilingScheme::new(1, 1).is_ok());
    }

    #[test]
    fn test_extent_covers_globe_at_roots() {
        let scheme = TilingScheme::default();
        let sw = scheme.extent(NodeId::new(0, 0, 0));
        assert!((sw.west + PI).abs() < 1e-12);
        assert!((sw.south + FRAC_PI_2).abs() < 1e-12);
        assert!(sw.east.abs() < 1e-12);
        assert!(sw.north.abs() < 1e-12);

        let ne = scheme.extent(NodeId::new(0, 1, 1));
        assert!((ne.east - PI).abs() < 1e-12);
        assert!((ne.north - FRAC_PI_2).abs() < 1e-12);
    }

    #[test]
    fn test_node_at_finds_containing_tile() {
        let scheme = TilingScheme::default();
        let lon = 10.0_f64.to_radians();
        let lat = 45.0_f64.to_radians();
        for level in 0..8 {
            let node = scheme.node_at(lon, lat, level).unwrap();
            assert!(scheme.extent(node).contains(lon, lat), "level {}", level);
        }
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn test_child_extents_tile_parent(
                level in 0u8..10,
                fx in 0.0..1.0_f64,
                fy in 0.0..1.0_f64,
            ) {
                let scheme = TilingScheme::default();
                let (columns, rows) = scheme.grid_size(level);
                let x = ((fx * columns as f64) as u32).min(columns - 1);
                let y = ((fy * rows as f64) as u32).min(rows - 1);
                let parent = NodeId::new(level, x, y);
                let parent_extent = scheme.extent(parent);

                let area: f64 = parent
                    .children()
                    .iter()
                    .map(|c| {
                        let e = scheme.extent(*c);
                        prop_assert!(e.west >= parent_extent.west - 1e-12);
                        prop_assert!(e.east <= parent_extent.east + 1e-12);
                        Ok(e.width() * e.height())
                    })
                    .sum::<Result<f64, TestCaseError>>()?;
                prop_assert!((area - parent_extent.width() * parent_extent.height()).abs() < 1e-9);
            }
        }
    }
}

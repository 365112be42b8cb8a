//! Bounded-memory tile cache with pin-aware LRU eviction.
//!
//! Entries are weighted by their decoded footprint. When an insertion would
//! exceed the budget, least-recently-used entries are evicted, but never an
//! entry that is pinned by a live drawable. If not enough unpinned weight can
//! be freed the insertion is rejected as a whole and nothing is evicted.
//!
//! # Example
//!
//! ```ignore
//! use quadearth::cache::TileCache;
//!
//! let mut cache = TileCache::new(64 * 1024 * 1024);
//! let evicted = cache.put(node, entry)?;
//! cache.pin(node)?;   // a drawable now references it
//! cache.unpin(node)?; // drawable retired, entry evictable again
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::coord::NodeId;
use crate::tile::{TileImage, TileMesh};

/// Errors from tile cache operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    /// Not enough unpinned entries to make room; the insertion is deferred.
    #[error("Cache over budget inserting {node}: need {needed} bytes, {evictable} evictable of {budget} budget")]
    OverBudget {
        node: NodeId,
        needed: usize,
        evictable: usize,
        budget: usize,
    },

    /// The entry alone is larger than the whole budget.
    #[error("Entry for {node} is {size} bytes, larger than the {budget} byte budget")]
    EntryTooLarge {
        node: NodeId,
        size: usize,
        budget: usize,
    },

    /// No entry for the node.
    #[error("No cache entry for {0}")]
    NotCached(NodeId),

    /// The entry is referenced by a live drawable.
    #[error("Cache entry for {node} is pinned by {pins} drawable(s)")]
    Pinned { node: NodeId, pins: u32 },
}

/// Decoded artefacts of one tile.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    mesh: Arc<TileMesh>,
    texture: Arc<TileImage>,
    footprint: usize,
}

impl CacheEntry {
    pub fn new(mesh: Arc<TileMesh>, texture: Arc<TileImage>) -> Self {
        let footprint = mesh.footprint() + texture.footprint();
        Self {
            mesh,
            texture,
            footprint,
        }
    }

    pub fn mesh(&self) -> &Arc<TileMesh> {
        &self.mesh
    }

    pub fn texture(&self) -> &Arc<TileImage> {
        &self.texture
    }

    /// Approximate bytes held by the entry.
    pub fn footprint(&self) -> usize {
        self.footprint
    }
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub evictions: u64,
    pub rejected: u64,
    pub entry_count: usize,
    pub used_bytes: usize,
    pub budget_bytes: usize,
}

impl CacheStats {
    /// Hit rate in `0.0..=1.0`, zero before any lookup.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} entries, {}/{} bytes, {:.1}% hits, {} evictions, {} rejected",
            self.entry_count,
            self.used_bytes,
            self.budget_bytes,
            self.hit_rate() * 100.0,
            self.evictions,
            self.rejected
        )
    }
}

struct Slot {
    entry: CacheEntry,
    last_access: u64,
    pins: u32,
}

/// Memory-bounded tile cache.
///
/// Owned by the engine worker; not thread-safe.
pub struct TileCache {
    budget: usize,
    used: usize,
    slots: HashMap<NodeId, Slot>,
    /// Access tick -> node, oldest first.
    recency: BTreeMap<u64, NodeId>,
    tick: u64,
    stats: CacheStats,
}

impl TileCache {
    /// Creates an empty cache holding at most `budget` bytes.
    pub fn new(budget: usize) -> Self {
        Self {
            budget,
            used: 0,
            slots: HashMap::new(),
            recency: BTreeMap::new(),
            tick: 0,
            stats: CacheStats::default(),
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn bump(&mut self, node: NodeId) {
        let tick = self.next_tick();
        if let Some(slot) = self.slots.get_mut(&node) {
            self.recency.remove(&slot.last_access);
            slot.last_access = tick;
            self.recency.insert(tick, node);
        }
    }

    /// Looks up an entry, counting a hit or miss and refreshing recency.
    pub fn get(&mut self, node: NodeId) -> Option<&CacheEntry> {
        if self.slots.contains_key(&node) {
            self.stats.hits += 1;
            self.bump(node);
            self.slots.get(&node).map(|slot| &slot.entry)
        } else {
            self.stats.misses += 1;
            None
        }
    }

    /// Looks up an entry without touching stats or recency.
    pub fn peek(&self, node: NodeId) -> Option<&CacheEntry> {
        self.slots.get(&node).map(|slot| &slot.entry)
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.slots.contains_key(&node)
    }

    /// Marks an entry as recently used. Returns false if absent.
    pub fn touch(&mut self, node: NodeId) -> bool {
        if self.slots.contains_key(&node) {
            self.bump(node);
            true
        } else {
            false
        }
    }

    /// Inserts an entry, evicting unpinned LRU entries as needed.
    ///
    /// Returns the evicted node ids. On [`CacheError::OverBudget`] the cache is
    /// left unchanged so the caller can retry once drawables are retired.
    /// Replacing an existing entry keeps its pin count.
    pub fn put(&mut self, node: NodeId, entry: CacheEntry) -> Result<Vec<NodeId>, CacheError> {
        let size = entry.footprint();
        if size > self.budget {
            self.stats.rejected += 1;
            return Err(CacheError::EntryTooLarge {
                node,
                size,
                budget: self.budget,
            });
        }

        let replaced = self.slots.get(&node).map(|s| s.entry.footprint()).unwrap_or(0);
        let projected = self.used - replaced + size;
        let mut victims = Vec::new();

        if projected > self.budget {
            let mut to_free = projected - self.budget;
            let mut evictable = 0;
            for candidate in self.recency.values() {
                if *candidate == node {
                    continue;
                }
                let slot = &self.slots[candidate];
                if slot.pins > 0 {
                    continue;
                }
                if to_free > 0 {
                    victims.push(*candidate);
                    let freed = slot.entry.footprint();
                    to_free = to_free.saturating_sub(freed);
                }
                evictable += slot.entry.footprint();
            }
            if to_free > 0 {
                self.stats.rejected += 1;
                return Err(CacheError::OverBudget {
                    node,
                    needed: projected - self.budget,
                    evictable,
                    budget: self.budget,
                });
            }
        }

        for victim in &victims {
            if let Some(slot) = self.slots.remove(victim) {
                self.recency.remove(&slot.last_access);
                self.used -= slot.entry.footprint();
                self.stats.evictions += 1;
                tracing::debug!(node = %victim, bytes = slot.entry.footprint(), "Evicted tile");
            }
        }

        let tick = self.next_tick();
        let pins = match self.slots.remove(&node) {
            Some(old) => {
                self.recency.remove(&old.last_access);
                self.used -= old.entry.footprint();
                old.pins
            }
            None => 0,
        };
        self.used += size;
        self.recency.insert(tick, node);
        self.slots.insert(
            node,
            Slot {
                entry,
                last_access: tick,
                pins,
            },
        );
        self.stats.insertions += 1;
        Ok(victims)
    }

    /// Records a live drawable reference to an entry.
    pub fn pin(&mut self, node: NodeId) -> Result<u32, CacheError> {
        let slot = self
            .slots
            .get_mut(&node)
            .ok_or(CacheError::NotCached(node))?;
        slot.pins += 1;
        Ok(slot.pins)
    }

    /// Releases a drawable reference.
    pub fn unpin(&mut self, node: NodeId) -> Result<u32, CacheError> {
        let slot = self
            .slots
            .get_mut(&node)
            .ok_or(CacheError::NotCached(node))?;
        slot.pins = slot.pins.saturating_sub(1);
        Ok(slot.pins)
    }

    /// Current pin count, zero when absent.
    pub fn pins(&self, node: NodeId) -> u32 {
        self.slots.get(&node).map(|s| s.pins).unwrap_or(0)
    }

    pub fn is_pinned(&self, node: NodeId) -> bool {
        self.pins(node) > 0
    }

    /// Removes an unpinned entry.
    pub fn remove(&mut self, node: NodeId) -> Result<Option<CacheEntry>, CacheError> {
        match self.slots.get(&node) {
            None => return Ok(None),
            Some(slot) if slot.pins > 0 => {
                return Err(CacheError::Pinned {
                    node,
                    pins: slot.pins,
                })
            }
            Some(_) => {}
        }
        let slot = self.slots.remove(&node).ok_or(CacheError::NotCached(node))?;
        self.recency.remove(&slot.last_access);
        self.used -= slot.entry.footprint();
        Ok(Some(slot.entry))
    }

    /// Drops every entry regardless of pins and returns the removed ids.
    ///
    /// Only for teardown, after all drawables have been retired.
    pub fn clear(&mut self) -> Vec<NodeId> {
        let removed: Vec<NodeId> = self.slots.keys().copied().collect();
        self.slots.clear();
        self.recency.clear();
        self.used = 0;
        removed
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn used_bytes(&self) -> usize {
        self.used
    }

    pub fn budget_bytes(&self) -> usize {
        self.budget
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entry_count: self.slots.len(),
            used_bytes: self.used,
            budget_bytes: self.budget,
            ..self.stats
        }
    }
}

//! Priority queue of fetches waiting for admission.
//!
//! Entries are ordered by priority (higher first), then by node id
//! (ascending) so that admission order is deterministic. Re-queuing a node
//! replaces its earlier entry; stale heap entries are skipped on pop and
//! dropped whenever they outnumber live ones.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use super::policy::Priority;
use crate::coord::NodeId;

/// Stale heap entries tolerated before a rebuild, on top of one per live node.
const STALE_SLACK: usize = 64;

#[derive(Debug, Clone, Copy)]
struct QueuedFetch {
    priority: Priority,
    node: NodeId,
    stamp: u64,
}

// Max-heap: higher priority first, then lower node id first.
impl PartialEq for QueuedFetch {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedFetch {}

impl PartialOrd for QueuedFetch {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedFetch {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.node.cmp(&self.node))
            .then_with(|| other.stamp.cmp(&self.stamp))
    }
}

/// Admission queue keyed by node.
#[derive(Debug, Default)]
pub struct FetchQueue {
    heap: BinaryHeap<QueuedFetch>,
    /// Current stamp per queued node; heap entries with another stamp are stale.
    live: HashMap<NodeId, (u64, Priority)>,
    next_stamp: u64,
}

impl FetchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `node`, replacing any earlier entry for it.
    ///
    /// Re-queuing at an unchanged priority leaves the heap untouched.
    pub fn push(&mut self, node: NodeId, priority: Priority) {
        if self.priority_of(node) == Some(priority) {
            return;
        }
        self.next_stamp += 1;
        let stamp = self.next_stamp;
        self.live.insert(node, (stamp, priority));
        self.heap.push(QueuedFetch {
            priority,
            node,
            stamp,
        });
        self.compact();
    }

    /// Removes and returns the highest-priority node.
    pub fn pop(&mut self) -> Option<(NodeId, Priority)> {
        while let Some(entry) = self.heap.pop() {
            if let Some((stamp, _)) = self.live.get(&entry.node) {
                if *stamp == entry.stamp {
                    self.live.remove(&entry.node);
                    return Some((entry.node, entry.priority));
                }
            }
        }
        None
    }

    /// Drops `node` from the queue. Returns true if it was queued.
    pub fn remove(&mut self, node: NodeId) -> bool {
        let removed = self.live.remove(&node).is_some();
        self.compact();
        removed
    }

    /// Rebuilds the heap from live entries once stale ones dominate.
    fn compact(&mut self) {
        if self.live.is_empty() {
            self.heap.clear();
            return;
        }
        if self.heap.len() <= 2 * self.live.len() + STALE_SLACK {
            return;
        }
        self.heap = self
            .live
            .iter()
            .map(|(node, (stamp, priority))| QueuedFetch {
                priority: *priority,
                node: *node,
                stamp: *stamp,
            })
            .collect();
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.live.contains_key(&node)
    }

    pub fn priority_of(&self, node: NodeId) -> Option<Priority> {
        self.live.get(&node).map(|(_, p)| *p)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn heap_len(&self) -> usize {
        self.heap.len()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.live.clear();
    }
}

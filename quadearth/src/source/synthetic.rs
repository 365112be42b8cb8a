//! Generated texture group for demos and tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Semaphore;

use super::{encode_png, BoxFuture, SourceError, TextureSource, TilePayload};
use crate::coord::NodeId;

/// Produces a solid-colour PNG per tile, coloured by level.
///
/// Failures can be scripted per node: a number of transient failures before
/// success, or a permanent not-found. An optional gate holds every fetch
/// until permits are released, which lets tests keep requests in flight.
pub struct SyntheticTextureGroup {
    name: String,
    tile_size: u32,
    delay: Option<Duration>,
    transient_failures: Mutex<HashMap<NodeId, u32>>,
    missing: Mutex<HashSet<NodeId>>,
    gate: Option<Arc<Semaphore>>,
    fetches: AtomicU64,
    per_node: Mutex<HashMap<NodeId, u32>>,
}

impl SyntheticTextureGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tile_size: 16,
            delay: None,
            transient_failures: Mutex::new(HashMap::new()),
            missing: Mutex::new(HashSet::new()),
            gate: None,
            fetches: AtomicU64::new(0),
            per_node: Mutex::new(HashMap::new()),
        }
    }

    /// Edge length of generated tiles in pixels.
    pub fn with_tile_size(mut self, size: u32) -> Self {
        self.tile_size = size.max(1);
        self
    }

    /// Simulated latency per fetch.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Makes every fetch wait for a permit from `gate`.
    pub fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Fails the next `times` fetches of `node` with a transient error.
    pub fn fail_transiently(&self, node: NodeId, times: u32) {
        self.transient_failures.lock().insert(node, times);
    }

    /// Reports `node` as not found on every fetch.
    pub fn mark_missing(&self, node: NodeId) {
        self.missing.lock().insert(node);
    }

    /// Total fetches started.
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    /// Fetches started for one node.
    pub fn fetches_of(&self, node: NodeId) -> u32 {
        self.per_node.lock().get(&node).copied().unwrap_or(0)
    }

    fn colour_for(node: NodeId) -> [u8; 4] {
        let shade = 40u8.saturating_add(node.level.saturating_mul(9));
        [shade, (node.x % 256) as u8, (node.y % 256) as u8, 255]
    }

    fn scripted_failure(&self, node: NodeId) -> Option<SourceError> {
        if self.missing.lock().contains(&node) {
            return Some(SourceError::NotFound(node));
        }
        let mut failures = self.transient_failures.lock();
        match failures.get_mut(&node) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Some(SourceError::Transient(format!(
                    "synthetic failure for {}",
                    node
                )))
            }
            _ => None,
        }
    }
}

impl TextureSource for SyntheticTextureGroup {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch(&self, node: NodeId) -> BoxFuture<'_, Result<TilePayload, SourceError>> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        *self.per_node.lock().entry(node).or_insert(0) += 1;

        Box::pin(async move {
            if let Some(gate) = &self.gate {
                let permit = gate
                    .acquire()
                    .await
                    .map_err(|_| SourceError::Transient("gate closed".to_string()))?;
                permit.forget();
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(err) = self.scripted_failure(node) {
                return Err(err);
            }
            let png = encode_png(self.tile_size, self.tile_size, Self::colour_for(node));
            Ok(TilePayload::new(png))
        })
    }
}

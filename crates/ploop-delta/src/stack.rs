//! The delta stack: an ordered sequence of layers, base first.
//!
//! Lookup walks top-down and returns the first layer covering the logical
//! cluster. Stacks are immutable snapshots; control operations build a new
//! stack and publish it, so readers holding an `Arc` keep a consistent view.

use crate::{Delta, DeltaKind, PhysLoc};
use ploop_error::{PloopError, Result};
use ploop_types::{ClusterIndex, ClusterShift, DeltaId, Generation};
use std::sync::Arc;

/// A resolved mapping: which delta holds the cluster and where.
#[derive(Debug, Clone)]
pub struct Location {
    pub delta: Arc<Delta>,
    pub loc: PhysLoc,
}

/// Ordered layers `[base, d1, .., top]`. Only the top accepts writes.
#[derive(Debug)]
pub struct DeltaStack {
    layers: Vec<Arc<Delta>>,
    cluster_shift: ClusterShift,
    virtual_clusters: u64,
}

impl DeltaStack {
    /// Assemble a stack from opened layers, bottom first.
    ///
    /// All layers must share one cluster shift (opens enforce this); the
    /// top must be a writable image layer — a stack that is only a raw
    /// base has nothing to allocate into.
    pub fn new(layers: Vec<Arc<Delta>>) -> Result<Self> {
        let Some(top) = layers.last() else {
            return Err(PloopError::Format("empty delta stack".to_owned()));
        };
        if top.kind() == DeltaKind::RawBase {
            return Err(PloopError::Format(
                "stack top must be an image layer".to_owned(),
            ));
        }
        let cluster_shift = top.cluster_shift();
        for layer in &layers {
            if layer.cluster_shift() != cluster_shift {
                return Err(PloopError::IncompatibleClusterSize {
                    found: layer.cluster_shift().get(),
                    expected: cluster_shift.get(),
                });
            }
            if layer.kind() == DeltaKind::RawBase && !Arc::ptr_eq(layer, &layers[0]) {
                return Err(PloopError::Format(
                    "raw base must be the bottom layer".to_owned(),
                ));
            }
        }
        let virtual_clusters = top.virtual_clusters();
        Ok(Self {
            layers,
            cluster_shift,
            virtual_clusters,
        })
    }

    #[must_use]
    pub fn cluster_shift(&self) -> ClusterShift {
        self.cluster_shift
    }

    /// Virtual disk size in clusters (the top's).
    #[must_use]
    pub fn virtual_clusters(&self) -> u64 {
        self.virtual_clusters
    }

    /// Virtual disk size in sectors.
    #[must_use]
    pub fn virtual_sectors(&self) -> u64 {
        self.virtual_clusters * self.cluster_shift.sectors()
    }

    #[must_use]
    pub fn top(&self) -> &Arc<Delta> {
        self.layers.last().expect("stack is never empty")
    }

    #[must_use]
    pub fn layers(&self) -> &[Arc<Delta>] {
        &self.layers
    }

    #[must_use]
    pub fn delta_by_id(&self, id: DeltaId) -> Option<(usize, &Arc<Delta>)> {
        self.layers
            .iter()
            .enumerate()
            .find(|(_, layer)| layer.id() == id)
    }

    /// Highest committed generation across image layers; what a clean
    /// reopen observes.
    #[must_use]
    pub fn generation(&self) -> Generation {
        self.layers
            .iter()
            .filter_map(|layer| layer.header().map(|header| header.generation))
            .max()
            .unwrap_or_default()
    }

    /// Resolve `cluster` by walking top-down.
    pub fn lookup(&self, cluster: ClusterIndex) -> Result<Option<Location>> {
        for layer in self.layers.iter().rev() {
            if let Some(loc) = layer.lookup(cluster)? {
                return Ok(Some(Location {
                    delta: Arc::clone(layer),
                    loc,
                }));
            }
        }
        Ok(None)
    }

    /// Resolve `cluster` considering only layers strictly below the top —
    /// the copy-up pre-image source.
    pub fn lookup_below_top(&self, cluster: ClusterIndex) -> Result<Option<Location>> {
        let below = &self.layers[..self.layers.len() - 1];
        for layer in below.iter().rev() {
            if let Some(loc) = layer.lookup(cluster)? {
                return Ok(Some(Location {
                    delta: Arc::clone(layer),
                    loc,
                }));
            }
        }
        Ok(None)
    }

    /// New stack with `delta` pushed as top (snapshot publish).
    pub fn with_new_top(&self, delta: Arc<Delta>) -> Result<Self> {
        let mut layers = self.layers.clone();
        layers.push(delta);
        Self::new(layers)
    }

    /// New stack without the layer `id` (merge publish).
    pub fn without(&self, id: DeltaId) -> Result<Self> {
        let layers: Vec<Arc<Delta>> = self
            .layers
            .iter()
            .filter(|layer| layer.id() != id)
            .cloned()
            .collect();
        if layers.len() == self.layers.len() {
            return Err(PloopError::Format(format!("no delta with id {id}")));
        }
        Self::new(layers)
    }

    /// New stack snapshot with the (already grown) top re-measured.
    pub fn remeasured(&self) -> Result<Self> {
        Self::new(self.layers.clone())
    }

    /// Next unused delta id.
    #[must_use]
    pub fn next_delta_id(&self) -> DeltaId {
        DeltaId(
            self.layers
                .iter()
                .map(|layer| layer.id().0)
                .max()
                .map_or(0, |max| max + 1),
        )
    }

    /// Flush every layer, base to top.
    pub fn flush_all(&self) -> Result<()> {
        for layer in &self.layers {
            layer.flush()?;
        }
        Ok(())
    }
}

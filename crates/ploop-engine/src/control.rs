//! Control-plane operations: snapshot, merge, grow, relocate.
//!
//! Each takes the engine's control lock (contention is `StackBusy`),
//! mutates the delta stack or its top, and publishes a fresh stack
//! snapshot under quiescence. Cancellation is honoured at per-cluster
//! boundaries; work already committed stays committed.

use crate::PloopEngine;
use crate::request::CancelToken;
use crate::slot::SlotState;
use ploop_block::ByteDevice;
use ploop_delta::{Delta, DeltaKind, PhysLoc};
use ploop_error::{PloopError, Result};
use ploop_ondisk::BatGeometry;
use ploop_types::{ClusterIndex, DeltaId, PhysCluster};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{info, warn};

impl PloopEngine {
    /// Freeze the current top read-only and stack a fresh, empty image
    /// delta on `new_top` above it. Returns the new top's id.
    pub fn snapshot(&self, new_top: Arc<dyn ByteDevice>) -> Result<DeltaId> {
        let _control = self
            .shared
            .control
            .try_lock()
            .ok_or(PloopError::StackBusy)?;

        let stack = self.current_stack();
        let id = stack.next_delta_id();
        let delta = Delta::format(
            id,
            new_top,
            DeltaKind::ImageDelta,
            stack.cluster_shift(),
            stack.virtual_clusters(),
            self.shared.pipeline.durable_generation(),
            self.shared.config.delta,
        )?;

        let guard = self.shared.slots.quiesce();
        let stack = self.current_stack();
        stack.top().freeze();
        let new_stack = stack.with_new_top(Arc::new(delta))?;
        *self.shared.stack.write() = Arc::new(new_stack);
        drop(guard);

        self.shared
            .counters
            .snapshots
            .fetch_add(1, Ordering::Relaxed);
        info!(
            target: "ploop::control",
            event = "snapshot_taken",
            new_top = id.0
        );
        Ok(id)
    }

    /// Fold `upper` into the adjacent `lower` layer directly beneath it,
    /// then drop `upper` from the stack.
    pub fn merge(&self, lower: DeltaId, upper: DeltaId) -> Result<()> {
        self.merge_with_cancel(lower, upper, None)
    }

    /// Merge, aborting at the next per-cluster boundary once `cancel`
    /// trips. Clusters already folded stay folded — the result is correct
    /// on disk either way because `upper` still overrides until the final
    /// publish.
    pub fn merge_with_cancel(
        &self,
        lower_id: DeltaId,
        upper_id: DeltaId,
        cancel: Option<&CancelToken>,
    ) -> Result<()> {
        let _control = self
            .shared
            .control
            .try_lock()
            .ok_or(PloopError::StackBusy)?;

        let stack = self.current_stack();
        let (lower_idx, lower) = stack
            .delta_by_id(lower_id)
            .ok_or_else(|| PloopError::Format(format!("no delta with id {lower_id}")))?;
        let (upper_idx, upper) = stack
            .delta_by_id(upper_id)
            .ok_or_else(|| PloopError::Format(format!("no delta with id {upper_id}")))?;
        if upper_idx != lower_idx + 1 {
            return Err(PloopError::Format(format!(
                "merge requires adjacent layers with {upper_id} directly above {lower_id}"
            )));
        }
        if lower.bat().is_none() {
            return Err(PloopError::Format(
                "cannot merge into a raw base".to_owned(),
            ));
        }
        let lower = Arc::clone(lower);
        let upper = Arc::clone(upper);
        let upper_is_top = upper_idx == stack.layers().len() - 1;

        // Folding the top away must stop new writes into it; writers see
        // a transient StackBusy until the merge publishes. Drain once so a
        // write that raced the freeze cannot map entries behind the scan.
        if upper_is_top {
            upper.freeze();
            drop(self.shared.slots.quiesce());
        }
        lower.make_writable();

        let result = self.fold_clusters(&lower, &upper, cancel).and_then(|()| {
            lower.flush()?;
            self.shared.pipeline.flush_barrier()?;
            Ok(())
        });

        if let Err(err) = result {
            lower.freeze();
            if upper_is_top {
                upper.make_writable();
            }
            warn!(
                target: "ploop::control",
                event = "merge_aborted",
                lower = lower_id.0,
                upper = upper_id.0,
                error = %err
            );
            return Err(err);
        }

        let guard = self.shared.slots.quiesce();
        let new_stack = self.current_stack().without(upper_id)?;
        if !upper_is_top {
            lower.freeze();
        }
        *self.shared.stack.write() = Arc::new(new_stack);
        drop(guard);

        self.shared.counters.merges.fetch_add(1, Ordering::Relaxed);
        info!(
            target: "ploop::control",
            event = "merge_complete",
            lower = lower_id.0,
            upper = upper_id.0
        );
        Ok(())
    }

    fn fold_clusters(
        &self,
        lower: &Arc<Delta>,
        upper: &Arc<Delta>,
        cancel: Option<&CancelToken>,
    ) -> Result<()> {
        let cluster_bytes = usize::try_from(upper.cluster_shift().bytes())
            .expect("cluster size fits usize");
        let mapped = upper
            .bat()
            .expect("merge source is an image layer")
            .scan_mapped()?;

        let mut buf = vec![0_u8; cluster_bytes];
        for (entry, upper_phys) in mapped {
            if let Some(token) = cancel {
                token.checkpoint()?;
            }
            let cluster = ClusterIndex(u64::from(entry));
            let ticket = self.shared.slots.acquire(cluster);
            ticket.wait_turn(cancel)?;
            // Per-cluster quiescence: the fold owns this cluster as a
            // control operation, not as a relocate of the top.
            ticket.set_state(SlotState::Quiesced);

            upper.read_at(PhysLoc::Cluster(PhysCluster(upper_phys)), 0, &mut buf)?;
            match lower.lookup(cluster)? {
                Some(PhysLoc::Cluster(dest)) => {
                    // Lower already holds the cluster: overwrite in place.
                    lower.write_at(dest, 0, &buf)?;
                }
                _ => {
                    let dest = lower.allocate_tail()?;
                    lower.write_at(dest, 0, &buf)?;
                    let update = lower
                        .bat()
                        .expect("merge target is an image layer")
                        .set_entry(entry, dest.0)?;
                    self.shared.pipeline.mark_dirty(lower, update.page)?;
                }
            }
        }
        Ok(())
    }

    /// Extend the virtual size of the top delta. All new clusters read as
    /// zero until written. Data occupying the positions a grown BAT region
    /// needs is relocated out first, with its own durable commit.
    pub fn grow(&self, new_virtual_clusters: u64) -> Result<()> {
        let _control = self
            .shared
            .control
            .try_lock()
            .ok_or(PloopError::StackBusy)?;

        let stack = self.current_stack();
        let old_virtual = stack.virtual_clusters();
        if new_virtual_clusters == old_virtual {
            return Ok(());
        }
        if new_virtual_clusters < old_virtual {
            return Err(PloopError::Format(
                "shrinking the virtual size is not supported".to_owned(),
            ));
        }
        let new_entries = u32::try_from(new_virtual_clusters)
            .map_err(|_| PloopError::Format("virtual size exceeds BAT entry space".to_owned()))?;

        let top = Arc::clone(stack.top());
        let bat = top.bat().ok_or_else(|| {
            PloopError::Format("stack top must be an image layer".to_owned())
        })?;
        let shift = stack.cluster_shift();

        let guard = self.shared.slots.quiesce();

        let old_geometry = bat.geometry();
        let new_geometry = BatGeometry::new(shift, new_entries);
        if new_geometry.data_start.0 > old_geometry.data_start.0 {
            // The BAT region expands over what is data space today; move
            // any occupants to the tail and commit the new mappings before
            // the region is allowed to overwrite them.
            top.exclude_allocations_below(new_geometry.data_start);
            let mut evacuated = 0_u64;
            let cluster_bytes =
                usize::try_from(shift.bytes()).expect("cluster size fits usize");
            let mut buf = vec![0_u8; cluster_bytes];
            for (entry, phys) in bat.scan_mapped()? {
                if phys >= new_geometry.data_start.0 {
                    continue;
                }
                top.read_at(PhysLoc::Cluster(PhysCluster(phys)), 0, &mut buf)?;
                let dest = top.allocate_tail()?;
                top.write_at(dest, 0, &buf)?;
                let update = bat.set_entry(entry, dest.0)?;
                self.shared.pipeline.mark_dirty(&top, update.page)?;
                evacuated += 1;
            }
            if evacuated > 0 {
                top.flush()?;
                self.shared.pipeline.flush_barrier()?;
                info!(
                    target: "ploop::control",
                    event = "bat_region_evacuated",
                    clusters = evacuated
                );
            }
        }

        let added = top.grow_virtual(new_virtual_clusters)?;
        for page in added {
            self.shared.pipeline.mark_dirty(&top, page)?;
        }
        self.shared.pipeline.flush_barrier()?;
        // The header must reflect the new size even when no page was dirty
        // (a grow that fits the existing last BAT page).
        top.write_header_generation(self.shared.pipeline.durable_generation())?;
        top.flush()?;

        let new_stack = self.current_stack().remeasured()?;
        *self.shared.stack.write() = Arc::new(new_stack);
        drop(guard);

        self.shared.counters.grows.fetch_add(1, Ordering::Relaxed);
        info!(
            target: "ploop::control",
            event = "virtual_size_grown",
            old_clusters = old_virtual,
            new_clusters = new_virtual_clusters
        );
        Ok(())
    }

    /// Move the physical home of `cluster` within the top delta.
    ///
    /// The vacated slot becomes allocatable only after the new mapping is
    /// durably committed. A cluster the top does not map is a no-op.
    pub fn relocate(&self, cluster: ClusterIndex) -> Result<()> {
        let _control = self
            .shared
            .control
            .try_lock()
            .ok_or(PloopError::StackBusy)?;

        let stack = self.current_stack();
        if cluster.0 >= stack.virtual_clusters() {
            return Err(PloopError::OutOfRange {
                sector: cluster.0 * stack.cluster_shift().sectors(),
                virtual_sectors: stack.virtual_sectors(),
            });
        }
        let top = Arc::clone(stack.top());

        let ticket = self.shared.slots.acquire(cluster);
        ticket.wait_turn(None)?;
        ticket.set_state(SlotState::Relocating);

        let Some(PhysLoc::Cluster(old)) = top.lookup(cluster)? else {
            return Ok(());
        };

        let cluster_bytes = usize::try_from(stack.cluster_shift().bytes())
            .expect("cluster size fits usize");
        let mut buf = vec![0_u8; cluster_bytes];
        top.read_at(PhysLoc::Cluster(old), 0, &mut buf)?;
        let dest = top.allocate_tail()?;
        top.write_at(dest, 0, &buf)?;
        top.flush()?;

        let entry = u32::try_from(cluster.0).expect("cluster fits BAT index");
        let bat = top.bat().expect("top is an image layer");
        let update = bat.set_entry(entry, dest.0)?;
        let target = self.shared.pipeline.mark_dirty(&top, update.page)?;
        self.shared.pipeline.await_generation(target)?;
        top.release_cluster(old);

        self.shared
            .counters
            .relocates
            .fetch_add(1, Ordering::Relaxed);
        info!(
            target: "ploop::control",
            event = "cluster_relocated",
            cluster = cluster.0,
            from = old.0,
            to = dest.0,
            generation = target.0
        );
        Ok(())
    }
}

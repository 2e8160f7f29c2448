#![forbid(unsafe_code)]
//! Delta files and the delta stack.
//!
//! A delta is one backing file: a raw base (flat file, no metadata), an
//! image base, or an image delta. Image layers carry the on-disk header and
//! a BAT mapping logical clusters to physical clusters within the file.
//! The stack composes layers; only the top accepts writes.

pub mod bat;
mod stack;

pub use bat::{BatCache, BatCacheStats, BatUpdate, PageState, write_empty_bat};
pub use stack::{DeltaStack, Location};

use parking_lot::{Condvar, Mutex};
use ploop_block::ByteDevice;
use ploop_error::{PloopError, Result};
use ploop_ondisk::{DeltaHeader, HEADER_ENCODED_SIZE};
use ploop_types::{
    ByteOffset, ClusterIndex, ClusterShift, DeltaId, FORMAT_VERSION, Generation, PhysCluster,
    SECTOR_SIZE,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Role of a delta within a stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaKind {
    RawBase,
    ImageBase,
    ImageDelta,
}

/// Where a logical cluster's bytes live inside one delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhysLoc {
    /// BAT-mapped physical cluster of an image layer.
    Cluster(PhysCluster),
    /// Identity placement in a raw base (logical offset == file offset).
    Raw(ClusterIndex),
}

/// Tuning knobs applied to every delta at open/format time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaOptions {
    /// Resident BAT page limit per delta.
    pub bat_resident_pages: usize,
    /// Concurrent backing I/O bound per delta.
    pub io_inflight_limit: usize,
}

impl Default for DeltaOptions {
    fn default() -> Self {
        Self {
            bat_resident_pages: 1024,
            io_inflight_limit: 64,
        }
    }
}

/// Counting gate bounding concurrent backing I/O on one delta.
///
/// Prevents a slow lower layer from absorbing every submitting thread.
#[derive(Debug)]
struct IoGate {
    limit: usize,
    in_flight: Mutex<usize>,
    cv: Condvar,
}

struct IoPermit<'a> {
    gate: &'a IoGate,
}

impl IoGate {
    fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            in_flight: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    fn acquire(&self) -> IoPermit<'_> {
        let mut count = self.in_flight.lock();
        while *count >= self.limit {
            self.cv.wait(&mut count);
        }
        *count += 1;
        IoPermit { gate: self }
    }
}

impl Drop for IoPermit<'_> {
    fn drop(&mut self) {
        let mut count = self.gate.in_flight.lock();
        *count = count.saturating_sub(1);
        self.gate.cv.notify_one();
    }
}

#[derive(Debug)]
struct AllocState {
    /// Next never-used physical cluster (file tail).
    next_tail: u32,
    /// Slots freed by committed relocates, ascending.
    free: Vec<u32>,
}

#[derive(Debug)]
enum Body {
    Raw,
    Image {
        header: Mutex<DeltaHeader>,
        bat: BatCache,
        alloc: Mutex<AllocState>,
        /// Set after ENOSPC; cleared by grow.
        full: AtomicBool,
    },
}

/// One backing file in a stack.
#[derive(Debug)]
pub struct Delta {
    id: DeltaId,
    kind: DeltaKind,
    cluster_shift: ClusterShift,
    device: Arc<dyn ByteDevice>,
    writable: AtomicBool,
    io_gate: IoGate,
    body: Body,
}

impl Delta {
    /// Open a raw base. Raw bases have no metadata; the stack's cluster
    /// size is imposed on them and they are never writable.
    pub fn open_raw(
        id: DeltaId,
        device: Arc<dyn ByteDevice>,
        cluster_shift: ClusterShift,
        opts: DeltaOptions,
    ) -> Result<Self> {
        info!(
            target: "ploop::delta",
            event = "delta_opened",
            id = id.0,
            kind = "raw_base",
            len_bytes = device.len_bytes()
        );
        Ok(Self {
            id,
            kind: DeltaKind::RawBase,
            cluster_shift,
            device,
            writable: AtomicBool::new(false),
            io_gate: IoGate::new(opts.io_inflight_limit),
            body: Body::Raw,
        })
    }

    /// Open an image layer, validating header magic, CRC, version and
    /// cluster-size compatibility with the stack.
    pub fn open_image(
        id: DeltaId,
        device: Arc<dyn ByteDevice>,
        kind: DeltaKind,
        writable: bool,
        expected_shift: Option<ClusterShift>,
        opts: DeltaOptions,
    ) -> Result<Self> {
        if kind == DeltaKind::RawBase {
            return Err(PloopError::Format(
                "open_image called with raw kind".to_owned(),
            ));
        }
        let mut raw = vec![0_u8; HEADER_ENCODED_SIZE];
        device.read_exact_at(ByteOffset::ZERO, &mut raw)?;
        let header = DeltaHeader::parse(&raw)?;

        if header.version != FORMAT_VERSION {
            return Err(PloopError::UnsupportedVersion {
                found: header.version,
                supported: FORMAT_VERSION,
            });
        }
        if let Some(expected) = expected_shift {
            if header.cluster_shift != expected {
                return Err(PloopError::IncompatibleClusterSize {
                    found: header.cluster_shift.get(),
                    expected: expected.get(),
                });
            }
        }

        let geometry = header.geometry();
        let cluster_bytes = header.cluster_shift.bytes();
        let file_clusters =
            u32::try_from(device.len_bytes().div_ceil(cluster_bytes)).unwrap_or(u32::MAX);
        let next_tail = file_clusters.max(geometry.data_start.0);

        let bat = BatCache::new(
            Arc::clone(&device),
            geometry,
            header.generation,
            opts.bat_resident_pages,
        );
        info!(
            target: "ploop::delta",
            event = "delta_opened",
            id = id.0,
            kind = ?kind,
            generation = header.generation.0,
            virtual_clusters = header.virtual_size_clusters,
            allocated_clusters = next_tail.saturating_sub(geometry.data_start.0)
        );
        Ok(Self {
            id,
            kind,
            cluster_shift: header.cluster_shift,
            device,
            writable: AtomicBool::new(writable),
            io_gate: IoGate::new(opts.io_inflight_limit),
            body: Body::Image {
                header: Mutex::new(header),
                bat,
                alloc: Mutex::new(AllocState {
                    next_tail,
                    free: Vec::new(),
                }),
                full: AtomicBool::new(false),
            },
        })
    }

    /// Format a fresh, empty image layer onto `device` and open it
    /// writable. The header carries `generation` so a snapshot's new top
    /// continues the stack's counter.
    pub fn format(
        id: DeltaId,
        device: Arc<dyn ByteDevice>,
        kind: DeltaKind,
        cluster_shift: ClusterShift,
        virtual_size_clusters: u64,
        generation: Generation,
        opts: DeltaOptions,
    ) -> Result<Self> {
        if kind == DeltaKind::RawBase {
            return Err(PloopError::Format("cannot format a raw base".to_owned()));
        }
        u32::try_from(virtual_size_clusters)
            .map_err(|_| PloopError::Format("virtual size exceeds BAT entry space".to_owned()))?;

        let mut header = DeltaHeader::new(cluster_shift, virtual_size_clusters);
        header.generation = generation;
        let geometry = header.geometry();
        device.resize(u64::from(geometry.data_start.0) * cluster_shift.bytes())?;
        device.write_all_at(ByteOffset::ZERO, &header.encode_cluster())?;
        bat::write_empty_bat(&device, cluster_shift, header.bat_entries, generation)?;
        device.sync()?;
        debug!(
            target: "ploop::delta",
            event = "delta_formatted",
            id = id.0,
            virtual_clusters = virtual_size_clusters,
            bat_pages = geometry.bat_pages
        );
        Self::open_image(id, device, kind, true, Some(cluster_shift), opts)
    }

    #[must_use]
    pub fn id(&self) -> DeltaId {
        self.id
    }

    #[must_use]
    pub fn kind(&self) -> DeltaKind {
        self.kind
    }

    #[must_use]
    pub fn cluster_shift(&self) -> ClusterShift {
        self.cluster_shift
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable.load(Ordering::Acquire)
    }

    /// Demote to read-only (snapshot freezes the old top).
    pub fn freeze(&self) {
        self.writable.store(false, Ordering::Release);
    }

    /// Promote to writable. Control-plane only: merge writes into its
    /// surviving layer and a merge survivor may become the new top.
    pub fn make_writable(&self) {
        self.writable.store(true, Ordering::Release);
    }

    /// Virtual disk size this delta represents, in clusters.
    #[must_use]
    pub fn virtual_clusters(&self) -> u64 {
        match &self.body {
            Body::Raw => self
                .device
                .len_bytes()
                .div_ceil(self.cluster_shift.bytes()),
            Body::Image { header, .. } => header.lock().virtual_size_clusters,
        }
    }

    /// Physical clusters currently allocated after the BAT region.
    #[must_use]
    pub fn allocated_clusters(&self) -> u64 {
        match &self.body {
            Body::Raw => self.virtual_clusters(),
            Body::Image { alloc, bat, .. } => {
                let alloc = alloc.lock();
                u64::from(alloc.next_tail)
                    .saturating_sub(u64::from(bat.geometry().data_start.0))
            }
        }
    }

    /// Header snapshot (image layers only).
    #[must_use]
    pub fn header(&self) -> Option<DeltaHeader> {
        match &self.body {
            Body::Raw => None,
            Body::Image { header, .. } => Some(*header.lock()),
        }
    }

    #[must_use]
    pub fn bat(&self) -> Option<&BatCache> {
        match &self.body {
            Body::Raw => None,
            Body::Image { bat, .. } => Some(bat),
        }
    }

    /// Resolve a logical cluster within this delta alone.
    ///
    /// A raw base covers every logical cluster; an image layer covers the
    /// clusters its BAT maps non-hole.
    pub fn lookup(&self, cluster: ClusterIndex) -> Result<Option<PhysLoc>> {
        match &self.body {
            Body::Raw => Ok(Some(PhysLoc::Raw(cluster))),
            Body::Image { bat, .. } => {
                let Ok(entry_idx) = u32::try_from(cluster.0) else {
                    return Ok(None);
                };
                if entry_idx >= bat.geometry().bat_entries {
                    return Ok(None);
                }
                let value = bat.entry(entry_idx)?;
                if value == 0 {
                    Ok(None)
                } else {
                    Ok(Some(PhysLoc::Cluster(PhysCluster(value))))
                }
            }
        }
    }

    /// Read `buf.len()` bytes starting `sector_offset` sectors into the
    /// mapped cluster. Raw bases pad reads past end-of-file with zeros.
    pub fn read_at(&self, loc: PhysLoc, sector_offset: u64, buf: &mut [u8]) -> Result<()> {
        let byte_offset = match loc {
            PhysLoc::Cluster(phys) => {
                if phys.is_hole() {
                    return Err(PloopError::Format(
                        "read from hole sentinel cluster".to_owned(),
                    ));
                }
                self.cluster_shift.phys_byte_offset(phys).0 + sector_offset * SECTOR_SIZE
            }
            PhysLoc::Raw(cluster) => {
                cluster.0 * self.cluster_shift.bytes() + sector_offset * SECTOR_SIZE
            }
        };

        let _permit = self.io_gate.acquire();
        let device_len = self.device.len_bytes();
        let end = byte_offset + buf.len() as u64;
        if matches!(loc, PhysLoc::Raw(_)) && end > device_len {
            // Grown virtual disks extend past a fixed-size raw base; the
            // overhang reads as zero.
            let available = device_len.saturating_sub(byte_offset);
            let available = usize::try_from(available).unwrap_or(0).min(buf.len());
            if available > 0 {
                self.device
                    .read_exact_at(ByteOffset(byte_offset), &mut buf[..available])
                    .map_err(|err| self.io_error(err))?;
            }
            buf[available..].fill(0);
            return Ok(());
        }
        self.device
            .read_exact_at(ByteOffset(byte_offset), buf)
            .map_err(|err| self.io_error(err))
    }

    /// Write `data` starting `sector_offset` sectors into physical cluster
    /// `phys` of this (writable, image) delta.
    pub fn write_at(&self, phys: PhysCluster, sector_offset: u64, data: &[u8]) -> Result<()> {
        if !self.is_writable() {
            return Err(PloopError::Format(format!(
                "delta {} is read-only",
                self.id
            )));
        }
        if phys.is_hole() {
            return Err(PloopError::Format(
                "write to hole sentinel cluster".to_owned(),
            ));
        }
        let byte_offset = self.cluster_shift.phys_byte_offset(phys).0 + sector_offset * SECTOR_SIZE;
        let _permit = self.io_gate.acquire();
        self.device
            .write_all_at(ByteOffset(byte_offset), data)
            .map_err(|err| self.io_error(err))
    }

    /// Reserve a fresh physical cluster.
    ///
    /// Slots freed by committed relocates are reused lowest-first;
    /// otherwise allocation extends the file tail.
    pub fn allocate_tail(&self) -> Result<PhysCluster> {
        let Body::Image { alloc, full, .. } = &self.body else {
            return Err(PloopError::Format(
                "raw base does not allocate clusters".to_owned(),
            ));
        };
        if full.load(Ordering::Acquire) {
            return Err(PloopError::OutOfSpace { delta: self.id });
        }

        let (phys, from_free) = {
            let mut alloc = alloc.lock();
            if let Some(&lowest) = alloc.free.first() {
                alloc.free.remove(0);
                (lowest, true)
            } else {
                let phys = alloc.next_tail;
                if phys == u32::MAX {
                    full.store(true, Ordering::Release);
                    return Err(PloopError::OutOfSpace { delta: self.id });
                }
                alloc.next_tail += 1;
                (phys, false)
            }
        };

        let needed = (u64::from(phys) + 1) * self.cluster_shift.bytes();
        if self.device.len_bytes() < needed {
            if let Err(err) = self.device.resize(needed) {
                // Undo the reservation before surfacing the failure.
                let mut state = alloc.lock();
                if from_free {
                    state.free.push(phys);
                    state.free.sort_unstable();
                } else if state.next_tail == phys + 1 {
                    state.next_tail = phys;
                }
                drop(state);
                if is_enospc(&err) {
                    warn!(
                        target: "ploop::delta",
                        event = "delta_full",
                        id = self.id.0,
                        phys
                    );
                    full.store(true, Ordering::Release);
                    return Err(PloopError::OutOfSpace { delta: self.id });
                }
                return Err(err);
            }
        }
        Ok(PhysCluster(phys))
    }

    /// Return a physical slot to the allocator. Callers only release after
    /// the relocate that vacated it is durably committed.
    pub fn release_cluster(&self, phys: PhysCluster) {
        if let Body::Image { alloc, bat, .. } = &self.body {
            if phys.0 < bat.geometry().data_start.0 {
                return;
            }
            let mut alloc = alloc.lock();
            alloc.free.push(phys.0);
            alloc.free.sort_unstable();
        }
    }

    /// Forbid allocation below `limit`.
    ///
    /// A growing BAT region claims those positions: freed slots under the
    /// limit are dropped and the tail pointer moves past it, so evacuation
    /// copies land outside the region being claimed.
    pub fn exclude_allocations_below(&self, limit: PhysCluster) {
        if let Body::Image { alloc, .. } = &self.body {
            let mut alloc = alloc.lock();
            alloc.free.retain(|&slot| slot >= limit.0);
            alloc.next_tail = alloc.next_tail.max(limit.0);
        }
    }

    /// Clear the full marker once capacity has been added.
    pub fn clear_full(&self) {
        if let Body::Image { full, .. } = &self.body {
            full.store(false, Ordering::Release);
        }
    }

    /// Extend the virtual size (and the BAT region) of this delta.
    ///
    /// Returns the newly created all-hole dirty BAT pages. The caller owns
    /// relocating any data out of the grown BAT region *before* calling
    /// this, and committing the returned pages together with the header.
    pub fn grow_virtual(&self, new_virtual_clusters: u64) -> Result<Vec<u32>> {
        let Body::Image {
            header, bat, alloc, ..
        } = &self.body
        else {
            return Err(PloopError::Format("cannot grow a raw base".to_owned()));
        };
        let new_entries = u32::try_from(new_virtual_clusters)
            .map_err(|_| PloopError::Format("virtual size exceeds BAT entry space".to_owned()))?;

        let added = bat.grow(new_entries)?;
        let geometry = bat.geometry();

        {
            let mut header = header.lock();
            header.virtual_size_clusters = new_virtual_clusters;
            header.bat_entries = new_entries;
        }
        {
            let mut alloc = alloc.lock();
            alloc.next_tail = alloc.next_tail.max(geometry.data_start.0);
            alloc.free.retain(|&slot| slot >= geometry.data_start.0);
        }

        let needed = u64::from(geometry.data_start.0) * self.cluster_shift.bytes();
        if self.device.len_bytes() < needed {
            self.device.resize(needed)?;
        }
        self.clear_full();
        info!(
            target: "ploop::delta",
            event = "delta_grown",
            id = self.id.0,
            virtual_clusters = new_virtual_clusters,
            new_pages = added.len()
        );
        Ok(added)
    }

    /// Write an encoded BAT page image to its on-disk position.
    pub fn write_bat_page(&self, page: u32, encoded: &[u8]) -> Result<()> {
        let Body::Image { bat, .. } = &self.body else {
            return Err(PloopError::Format("raw base has no BAT".to_owned()));
        };
        let offset = bat.geometry().page_byte_offset(page);
        let _permit = self.io_gate.acquire();
        self.device
            .write_all_at(offset, encoded)
            .map_err(|err| self.io_error(err))
    }

    /// Persist the header with `generation`. The caller orders this after
    /// the page writes of the same transaction are durable.
    pub fn write_header_generation(&self, generation: Generation) -> Result<()> {
        let Body::Image { header, .. } = &self.body else {
            return Err(PloopError::Format("raw base has no header".to_owned()));
        };
        let encoded = {
            let mut header = header.lock();
            header.generation = generation;
            let mut buf = vec![0_u8; HEADER_ENCODED_SIZE];
            header.encode(&mut buf)?;
            buf
        };
        let _permit = self.io_gate.acquire();
        self.device
            .write_all_at(ByteOffset::ZERO, &encoded)
            .map_err(|err| self.io_error(err))
    }

    /// Record that `generation` is durable; page loads accept its stamps.
    pub fn mark_generation_durable(&self, generation: Generation) {
        if let Body::Image { bat, .. } = &self.body {
            bat.set_durable_generation(generation);
        }
    }

    /// Durable flush of the backing device.
    pub fn flush(&self) -> Result<()> {
        self.device.sync().map_err(|err| self.io_error(err))
    }

    fn io_error(&self, err: PloopError) -> PloopError {
        match err {
            PloopError::Io(source) => PloopError::BackingIo {
                delta: self.id,
                source,
            },
            other => other,
        }
    }
}

fn is_enospc(err: &PloopError) -> bool {
    match err {
        PloopError::Io(source) => source.raw_os_error() == Some(libc::ENOSPC),
        _ => false,
    }
}

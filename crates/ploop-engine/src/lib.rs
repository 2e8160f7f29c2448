#![forbid(unsafe_code)]
//! The ploop I/O translation engine.
//!
//! Sits between a stream of logical block requests and a stack of delta
//! files: splits requests at cluster boundaries, routes each piece through
//! its cluster slot, performs copy-on-write against lower layers, and
//! completes writes only once their data and any new BAT mapping are on
//! stable storage.
//!
//! There is no process-wide state; everything hangs off a [`PloopEngine`]
//! handle.

mod control;
mod pipeline;
mod request;
mod slot;

pub use pipeline::{CommitPipelineConfig, GenerationNotifier, PipelineMetrics};
pub use request::CancelToken;
pub use slot::SlotState;

use parking_lot::{Mutex, RwLock};
use ploop_block::{ByteDevice, FileByteDevice};
use ploop_delta::{Delta, DeltaKind, DeltaOptions, DeltaStack, PhysLoc};
use ploop_error::{PloopError, Result};
use ploop_ondisk::DeltaHeader;
use ploop_types::{ByteOffset, ClusterIndex, DeltaId, SECTOR_SIZE};
use request::RequestArena;
use serde::Serialize;
use slot::SlotTable;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

use crate::pipeline::CommitPipeline;

/// When data writes reach stable storage relative to request completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataSyncPolicy {
    /// Sync before completing each write (the contract the scenario tests
    /// assume). Writes that allocate always get this ordering from the
    /// commit transaction itself.
    #[default]
    PerRequest,
    /// Defer data sync to the next barrier; throughput-oriented callers
    /// accept the widened crash window for in-place writes.
    OnBarrier,
}

/// Engine-wide configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineConfig {
    pub delta: DeltaOptions,
    pub pipeline: CommitPipelineConfig,
    pub data_sync: DataSyncPolicy,
}

impl EngineConfig {
    pub fn validate(self) -> Result<Self> {
        self.pipeline.validate()?;
        Ok(self)
    }
}

/// Whether a layer carries the image format or is a flat raw file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    Raw,
    Image,
}

/// Backing source for one layer of the stack.
#[derive(Clone)]
pub enum LayerSource {
    Path(PathBuf),
    Device(Arc<dyn ByteDevice>),
}

impl std::fmt::Debug for LayerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Path(path) => f.debug_tuple("Path").field(path).finish(),
            Self::Device(_) => f.debug_tuple("Device").finish(),
        }
    }
}

/// One layer of a stack descriptor, bottom first.
#[derive(Debug, Clone)]
pub struct LayerSpec {
    pub source: LayerSource,
    pub kind: LayerKind,
}

impl LayerSpec {
    #[must_use]
    pub fn image_path(path: impl Into<PathBuf>) -> Self {
        Self {
            source: LayerSource::Path(path.into()),
            kind: LayerKind::Image,
        }
    }

    #[must_use]
    pub fn raw_path(path: impl Into<PathBuf>) -> Self {
        Self {
            source: LayerSource::Path(path.into()),
            kind: LayerKind::Raw,
        }
    }

    #[must_use]
    pub fn image_device(device: Arc<dyn ByteDevice>) -> Self {
        Self {
            source: LayerSource::Device(device),
            kind: LayerKind::Image,
        }
    }

    #[must_use]
    pub fn raw_device(device: Arc<dyn ByteDevice>) -> Self {
        Self {
            source: LayerSource::Device(device),
            kind: LayerKind::Raw,
        }
    }
}

/// Ordered layer list describing a stack to open.
#[derive(Debug, Clone, Default)]
pub struct StackDescriptor {
    pub layers: Vec<LayerSpec>,
}

/// An incoming logical request. Offsets and lengths are in 512-byte
/// sectors; buffers must be whole sectors.
#[derive(Debug)]
pub struct Request<'buf> {
    pub offset_sectors: u64,
    pub op: RequestOp<'buf>,
}

#[derive(Debug)]
pub enum RequestOp<'buf> {
    Read(&'buf mut [u8]),
    Write(&'buf [u8]),
    /// Barrier: drain the metadata pipeline, then flush every delta, base
    /// to top. Carries no payload and bypasses cluster slots.
    Flush,
}

#[derive(Debug, Default)]
struct Counters {
    requests: AtomicU64,
    pieces: AtomicU64,
    reads: AtomicU64,
    writes_in_place: AtomicU64,
    allocations: AtomicU64,
    copy_ups: AtomicU64,
    relocates: AtomicU64,
    barriers: AtomicU64,
    backpressure_rejections: AtomicU64,
    snapshots: AtomicU64,
    merges: AtomicU64,
    grows: AtomicU64,
}

/// Monotonic engine counters plus a pipeline snapshot.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct EngineMetrics {
    pub requests: u64,
    pub pieces: u64,
    pub reads: u64,
    pub writes_in_place: u64,
    pub allocations: u64,
    pub copy_ups: u64,
    pub relocates: u64,
    pub barriers: u64,
    pub backpressure_rejections: u64,
    pub snapshots: u64,
    pub merges: u64,
    pub grows: u64,
    pub commits: u64,
    pub pages_committed: u64,
    pub commit_failures: u64,
    pub dirty_backlog: usize,
    pub durable_generation: u64,
}

/// Summary of one layer for inspection output.
#[derive(Debug, Clone, Serialize)]
pub struct DeltaInfo {
    pub id: u32,
    pub kind: DeltaKind,
    pub writable: bool,
    pub virtual_clusters: u64,
    pub allocated_clusters: u64,
    pub generation: Option<u64>,
}

/// Summary of the open stack.
#[derive(Debug, Clone, Serialize)]
pub struct StackInfo {
    pub cluster_shift: u32,
    pub cluster_bytes: u64,
    pub virtual_clusters: u64,
    pub virtual_sectors: u64,
    pub generation: u64,
    pub deltas: Vec<DeltaInfo>,
}

struct EngineShared {
    config: EngineConfig,
    stack: RwLock<Arc<DeltaStack>>,
    slots: SlotTable,
    arena: RequestArena,
    pipeline: CommitPipeline,
    /// One control operation at a time; contention is `StackBusy`.
    control: Mutex<()>,
    counters: Counters,
}

/// The engine handle. Cheap to share: all entry points take `&self`.
pub struct PloopEngine {
    shared: Arc<EngineShared>,
}

impl PloopEngine {
    /// Open a stack described bottom-to-top and start the commit worker.
    pub fn open(descriptor: StackDescriptor, config: EngineConfig) -> Result<Self> {
        let config = config.validate()?;
        if descriptor.layers.is_empty() {
            return Err(PloopError::Format("stack descriptor is empty".to_owned()));
        }

        let devices: Vec<(Arc<dyn ByteDevice>, LayerKind)> = descriptor
            .layers
            .into_iter()
            .map(|spec| {
                let device: Arc<dyn ByteDevice> = match spec.source {
                    LayerSource::Path(path) => Arc::new(FileByteDevice::open(path)?),
                    LayerSource::Device(device) => device,
                };
                Ok((device, spec.kind))
            })
            .collect::<Result<_>>()?;

        let (top_device, top_kind) = devices.last().expect("descriptor checked non-empty");
        if *top_kind != LayerKind::Image {
            return Err(PloopError::Format(
                "stack top must be an image layer".to_owned(),
            ));
        }
        for (index, (_, kind)) in devices.iter().enumerate() {
            if *kind == LayerKind::Raw && index != 0 {
                return Err(PloopError::Format(
                    "raw base must be the bottom layer".to_owned(),
                ));
            }
        }

        // The stack's cluster size comes from the top image; every image
        // layer must agree and a raw base adopts it.
        let mut header_probe = vec![0_u8; ploop_ondisk::HEADER_ENCODED_SIZE];
        top_device.read_exact_at(ByteOffset::ZERO, &mut header_probe)?;
        let cluster_shift = DeltaHeader::parse(&header_probe)?.cluster_shift;

        let last = devices.len() - 1;
        let mut layers = Vec::with_capacity(devices.len());
        for (index, (device, kind)) in devices.into_iter().enumerate() {
            let id = DeltaId(u32::try_from(index).expect("layer count fits u32"));
            let delta = match kind {
                LayerKind::Raw => Delta::open_raw(id, device, cluster_shift, config.delta)?,
                LayerKind::Image => Delta::open_image(
                    id,
                    device,
                    if index == 0 {
                        DeltaKind::ImageBase
                    } else {
                        DeltaKind::ImageDelta
                    },
                    index == last,
                    Some(cluster_shift),
                    config.delta,
                )?,
            };
            layers.push(Arc::new(delta));
        }

        let stack = DeltaStack::new(layers)?;
        let durable = stack.generation();
        let pipeline = CommitPipeline::start(config.pipeline, durable)?;
        info!(
            target: "ploop::engine",
            event = "engine_opened",
            layers = stack.layers().len(),
            cluster_shift = cluster_shift.get(),
            virtual_clusters = stack.virtual_clusters(),
            generation = durable.0
        );

        Ok(Self {
            shared: Arc::new(EngineShared {
                config,
                stack: RwLock::new(Arc::new(stack)),
                slots: SlotTable::new(),
                arena: RequestArena::default(),
                pipeline,
                control: Mutex::new(()),
                counters: Counters::default(),
            }),
        })
    }

    /// Execute one request to completion (all-or-nothing).
    pub fn submit(&self, request: Request<'_>) -> Result<()> {
        self.submit_with_cancel(request, None)
    }

    /// Like [`submit`](Self::submit) but pieces still queued honour the
    /// token; a piece that owns its slot runs to completion.
    pub fn submit_with_cancel(
        &self,
        request: Request<'_>,
        cancel: Option<&CancelToken>,
    ) -> Result<()> {
        match request.op {
            RequestOp::Flush => self.barrier(),
            RequestOp::Read(buf) => self.run_io(request.offset_sectors, Piece::Read(buf), cancel),
            RequestOp::Write(data) => {
                self.run_io(request.offset_sectors, Piece::Write(data), cancel)
            }
        }
    }

    /// Read `buf.len()` bytes at sector `offset_sectors`.
    pub fn read_at(&self, offset_sectors: u64, buf: &mut [u8]) -> Result<()> {
        self.submit(Request {
            offset_sectors,
            op: RequestOp::Read(buf),
        })
    }

    /// Write `data` at sector `offset_sectors`.
    pub fn write_at(&self, offset_sectors: u64, data: &[u8]) -> Result<()> {
        self.submit(Request {
            offset_sectors,
            op: RequestOp::Write(data),
        })
    }

    /// Barrier: everything submitted before this call is durable — data and
    /// BAT mappings — once it returns.
    pub fn flush(&self) -> Result<()> {
        self.barrier()
    }

    #[must_use]
    pub fn metrics(&self) -> EngineMetrics {
        let counters = &self.shared.counters;
        let pipeline = self.shared.pipeline.metrics();
        EngineMetrics {
            requests: counters.requests.load(Ordering::Relaxed),
            pieces: counters.pieces.load(Ordering::Relaxed),
            reads: counters.reads.load(Ordering::Relaxed),
            writes_in_place: counters.writes_in_place.load(Ordering::Relaxed),
            allocations: counters.allocations.load(Ordering::Relaxed),
            copy_ups: counters.copy_ups.load(Ordering::Relaxed),
            relocates: counters.relocates.load(Ordering::Relaxed),
            barriers: counters.barriers.load(Ordering::Relaxed),
            backpressure_rejections: counters.backpressure_rejections.load(Ordering::Relaxed),
            snapshots: counters.snapshots.load(Ordering::Relaxed),
            merges: counters.merges.load(Ordering::Relaxed),
            grows: counters.grows.load(Ordering::Relaxed),
            commits: pipeline.commits,
            pages_committed: pipeline.pages_committed,
            commit_failures: pipeline.commit_failures,
            dirty_backlog: pipeline.dirty_backlog,
            durable_generation: pipeline.durable_generation,
        }
    }

    /// Point-in-time summary of the open stack.
    #[must_use]
    pub fn stack_info(&self) -> StackInfo {
        let stack = self.current_stack();
        StackInfo {
            cluster_shift: stack.cluster_shift().get(),
            cluster_bytes: stack.cluster_shift().bytes(),
            virtual_clusters: stack.virtual_clusters(),
            virtual_sectors: stack.virtual_sectors(),
            generation: stack.generation().0,
            deltas: stack
                .layers()
                .iter()
                .map(|layer| DeltaInfo {
                    id: layer.id().0,
                    kind: layer.kind(),
                    writable: layer.is_writable(),
                    virtual_clusters: layer.virtual_clusters(),
                    allocated_clusters: layer.allocated_clusters(),
                    generation: layer.header().map(|header| header.generation.0),
                })
                .collect(),
        }
    }

    /// Flush everything and stop the commit worker.
    pub fn close(self) -> Result<()> {
        let _control = self.shared.control.lock();
        let guard = self.shared.slots.quiesce();
        self.shared.pipeline.flush_barrier()?;
        self.shared.pipeline.shutdown();
        self.current_stack().flush_all()?;
        drop(guard);
        info!(target: "ploop::engine", event = "engine_closed");
        Ok(())
    }

    fn current_stack(&self) -> Arc<DeltaStack> {
        Arc::clone(&self.shared.stack.read())
    }

    fn barrier(&self) -> Result<()> {
        self.shared
            .counters
            .barriers
            .fetch_add(1, Ordering::Relaxed);
        self.shared.pipeline.flush_barrier()?;
        self.current_stack().flush_all()
    }

    fn run_io(&self, offset_sectors: u64, piece: Piece<'_>, cancel: Option<&CancelToken>) -> Result<()> {
        self.shared
            .counters
            .requests
            .fetch_add(1, Ordering::Relaxed);

        let len_bytes = piece.len() as u64;
        if len_bytes % SECTOR_SIZE != 0 {
            return Err(PloopError::InvalidAlignment {
                offset_bytes: offset_sectors * SECTOR_SIZE,
                len_bytes,
            });
        }
        if len_bytes == 0 {
            return Ok(());
        }
        let len_sectors = len_bytes / SECTOR_SIZE;

        let stack = self.current_stack();
        let end_sector = offset_sectors
            .checked_add(len_sectors)
            .ok_or(PloopError::OutOfRange {
                sector: offset_sectors,
                virtual_sectors: stack.virtual_sectors(),
            })?;
        if end_sector > stack.virtual_sectors() {
            return Err(PloopError::OutOfRange {
                sector: offset_sectors,
                virtual_sectors: stack.virtual_sectors(),
            });
        }
        if piece.is_write() && self.shared.pipeline.write_backpressure() {
            self.shared
                .counters
                .backpressure_rejections
                .fetch_add(1, Ordering::Relaxed);
            return Err(PloopError::MetadataBackpressure);
        }

        let shift = stack.cluster_shift();
        let first_cluster = shift.cluster_of_sector(offset_sectors).0;
        let last_cluster = shift.cluster_of_sector(end_sector - 1).0;
        let piece_count =
            u32::try_from(last_cluster - first_cluster + 1).expect("piece count fits u32");
        let parent = self.shared.arena.begin(piece_count);

        let mut final_result = None;
        let mut issued = 0_u32;
        let mut piece = piece;
        let mut sector = offset_sectors;
        for cluster in first_cluster..=last_cluster {
            let cluster_end = (cluster + 1) * shift.sectors();
            let span_sectors = cluster_end.min(end_sector) - sector;
            let span_bytes = usize::try_from(span_sectors * SECTOR_SIZE)
                .expect("span bounded by cluster size");
            let (head, rest) = piece.split(span_bytes);
            piece = rest;

            let result = self.cluster_op(
                ClusterIndex(cluster),
                shift.sector_within_cluster(sector),
                head,
                cancel,
            );
            let errored = result.is_err();
            issued += 1;
            final_result = self.shared.arena.complete_piece(parent, result);
            if errored {
                // All-or-nothing: the remaining pieces are never issued.
                if issued < piece_count {
                    final_result = self.shared.arena.abandon(parent, piece_count - issued);
                }
                break;
            }
            sector = cluster_end;
        }
        final_result.expect("every piece accounted for")
    }

    /// One piece, one cluster: acquire the slot, take the turn, run the
    /// state machine.
    fn cluster_op(
        &self,
        cluster: ClusterIndex,
        sector_in_cluster: u64,
        piece: Piece<'_>,
        cancel: Option<&CancelToken>,
    ) -> Result<()> {
        self.shared.counters.pieces.fetch_add(1, Ordering::Relaxed);
        let ticket = self.shared.slots.acquire(cluster);
        ticket.wait_turn(cancel)?;

        // Re-resolve after winning the turn: a control operation may have
        // published a new stack while this piece was queued.
        let stack = self.current_stack();

        match piece {
            Piece::Read(buf) => {
                ticket.set_state(SlotState::Reading);
                self.shared.counters.reads.fetch_add(1, Ordering::Relaxed);
                match stack.lookup(cluster)? {
                    Some(location) => {
                        location.delta.read_at(location.loc, sector_in_cluster, buf)
                    }
                    None => {
                        buf.fill(0);
                        Ok(())
                    }
                }
            }
            Piece::Write(data) => self.write_cluster_piece(
                &stack,
                &ticket,
                cluster,
                sector_in_cluster,
                data,
            ),
        }
    }

    fn write_cluster_piece(
        &self,
        stack: &DeltaStack,
        ticket: &slot::SlotTicket<'_>,
        cluster: ClusterIndex,
        sector_in_cluster: u64,
        data: &[u8],
    ) -> Result<()> {
        let top = stack.top();
        if !top.is_writable() {
            // Only a merge folding the top away freezes it mid-flight.
            return Err(PloopError::StackBusy);
        }

        if let Some(PhysLoc::Cluster(phys)) = top.lookup(cluster)? {
            ticket.set_state(SlotState::Writing);
            self.shared
                .counters
                .writes_in_place
                .fetch_add(1, Ordering::Relaxed);
            top.write_at(phys, sector_in_cluster, data)?;
            if self.shared.config.data_sync == DataSyncPolicy::PerRequest {
                top.flush()?;
            }
            return Ok(());
        }

        let below = stack.lookup_below_top(cluster)?;
        let cluster_bytes = usize::try_from(stack.cluster_shift().bytes())
            .expect("cluster size fits usize");
        let full_cover = sector_in_cluster == 0 && data.len() == cluster_bytes;

        ticket.set_state(if below.is_some() {
            SlotState::CopyingUp
        } else {
            SlotState::Allocating
        });
        if below.is_some() {
            self.shared
                .counters
                .copy_ups
                .fetch_add(1, Ordering::Relaxed);
        } else {
            self.shared
                .counters
                .allocations
                .fetch_add(1, Ordering::Relaxed);
        }

        let new_phys = top.allocate_tail()?;
        if full_cover {
            // Bulk writeback: the payload covers the whole cluster, the
            // pre-image read is elided.
            top.write_at(new_phys, 0, data)?;
        } else {
            let mut image = vec![0_u8; cluster_bytes];
            if let Some(location) = &below {
                location.delta.read_at(location.loc, 0, &mut image)?;
            }
            let at = usize::try_from(sector_in_cluster * SECTOR_SIZE)
                .expect("offset bounded by cluster size");
            image[at..at + data.len()].copy_from_slice(data);
            top.write_at(new_phys, 0, &image)?;
        }

        // Data durability is ordered by the commit transaction's first
        // flush; completion below implies both data and mapping are stable.
        let bat = top.bat().expect("top is an image layer");
        let entry = u32::try_from(cluster.0).expect("cluster fits BAT index");
        let update = bat.set_entry(entry, new_phys.0)?;
        let target = self.shared.pipeline.mark_dirty(top, update.page)?;
        self.shared.pipeline.await_generation(target)?;
        debug!(
            target: "ploop::engine",
            event = "cluster_mapped",
            cluster = cluster.0,
            phys = new_phys.0,
            generation = target.0
        );
        Ok(())
    }
}

/// A borrowed request payload, sliceable at cluster boundaries.
#[derive(Debug)]
enum Piece<'buf> {
    Read(&'buf mut [u8]),
    Write(&'buf [u8]),
}

impl<'buf> Piece<'buf> {
    fn len(&self) -> usize {
        match self {
            Piece::Read(buf) => buf.len(),
            Piece::Write(data) => data.len(),
        }
    }

    fn is_write(&self) -> bool {
        matches!(self, Piece::Write(_))
    }

    fn split(self, at: usize) -> (Piece<'buf>, Piece<'buf>) {
        match self {
            Piece::Read(buf) => {
                let (head, rest) = buf.split_at_mut(at);
                (Piece::Read(head), Piece::Read(rest))
            }
            Piece::Write(data) => {
                let (head, rest) = data.split_at(at);
                (Piece::Write(head), Piece::Write(rest))
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    use parking_lot::Mutex;
    use ploop_block::ByteDevice;
    use ploop_error::{PloopError, Result};
    use ploop_types::ByteOffset;
    use std::sync::Arc;

    /// Growable in-memory byte device.
    #[derive(Debug)]
    pub struct MemDevice {
        bytes: Mutex<Vec<u8>>,
    }

    impl MemDevice {
        pub fn new(len: usize) -> Arc<Self> {
            Arc::new(Self {
                bytes: Mutex::new(vec![0_u8; len]),
            })
        }
    }

    impl ByteDevice for MemDevice {
        fn len_bytes(&self) -> u64 {
            u64::try_from(self.bytes.lock().len()).unwrap_or(0)
        }

        fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
            let offset = usize::try_from(offset.0)
                .map_err(|_| PloopError::Format("offset overflow".into()))?;
            let bytes = self.bytes.lock();
            let end = offset + buf.len();
            if end > bytes.len() {
                return Err(PloopError::Format("oob read".into()));
            }
            buf.copy_from_slice(&bytes[offset..end]);
            Ok(())
        }

        fn write_all_at(&self, offset: ByteOffset, buf: &[u8]) -> Result<()> {
            let offset = usize::try_from(offset.0)
                .map_err(|_| PloopError::Format("offset overflow".into()))?;
            let mut bytes = self.bytes.lock();
            let end = offset + buf.len();
            if end > bytes.len() {
                bytes.resize(end, 0);
            }
            bytes[offset..end].copy_from_slice(buf);
            Ok(())
        }

        fn resize(&self, len: u64) -> Result<()> {
            let len = usize::try_from(len).map_err(|_| PloopError::Format("len".into()))?;
            self.bytes.lock().resize(len, 0);
            Ok(())
        }

        fn sync(&self) -> Result<()> {
            Ok(())
        }
    }
}

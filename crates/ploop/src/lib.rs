#![forbid(unsafe_code)]
//! ploop public API facade.
//!
//! Re-exports the engine surface through a stable external interface. This
//! is the crate downstream consumers (CLI, harness, device shells) depend
//! on.

pub use ploop_block::{ByteDevice, FileByteDevice};
pub use ploop_delta::{Delta, DeltaKind, DeltaOptions, DeltaStack, PhysLoc};
pub use ploop_engine::{
    CancelToken, CommitPipelineConfig, DataSyncPolicy, DeltaInfo, EngineConfig, EngineMetrics,
    LayerKind, LayerSource, LayerSpec, PloopEngine, Request, RequestOp, StackDescriptor,
    StackInfo,
};
pub use ploop_error::{PloopError, Result};
pub use ploop_ondisk::{BatGeometry, DeltaHeader};
pub use ploop_types::{
    ByteOffset, ClusterIndex, ClusterShift, DeltaId, Generation, PhysCluster, SECTOR_SIZE,
};

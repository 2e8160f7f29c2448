#![forbid(unsafe_code)]
//! Test harness for the ploop engine.
//!
//! Provides in-memory byte devices, a crash-recording device that can
//! replay the write stream truncated at any point, a deterministic RNG for
//! randomized workloads, and stack fixtures. Everything here is
//! deterministic; no wall-clock or OS randomness.

use parking_lot::Mutex;
use ploop::{
    ByteDevice, ByteOffset, ClusterShift, Delta, DeltaId, DeltaKind, DeltaOptions, EngineConfig,
    Generation, LayerSpec, PloopEngine, PloopError, Result, StackDescriptor,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Growable in-memory byte device.
#[derive(Debug, Default)]
pub struct MemByteDevice {
    bytes: Mutex<Vec<u8>>,
}

impl MemByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Arc<Self> {
        Arc::new(Self {
            bytes: Mutex::new(vec![0_u8; len]),
        })
    }

    #[must_use]
    pub fn from_vec(bytes: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            bytes: Mutex::new(bytes),
        })
    }

    /// Fill the whole device with one byte (raw-base fixtures).
    pub fn fill(&self, value: u8) {
        self.bytes.lock().fill(value);
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

impl ByteDevice for MemByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.lock().len()).unwrap_or(0)
    }

    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        let offset = usize::try_from(offset.0)
            .map_err(|_| PloopError::Format("offset overflow".into()))?;
        let bytes = self.bytes.lock();
        let end = offset + buf.len();
        if end > bytes.len() {
            return Err(PloopError::Format(format!(
                "read out of bounds: offset={offset} len={} device_len={}",
                buf.len(),
                bytes.len()
            )));
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
        let len = usize::try_from(len).map_err(|_| PloopError::Format("len overflow".into()))?;
        self.bytes.lock().resize(len, 0);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// One recorded device event, sector-fragment granular.
///
/// Writes are split into 512-byte fragments so a truncation point can land
/// inside a multi-sector write — a torn BAT page or a half-delivered data
/// cluster. Sub-sector writes (the 52-byte header) stay whole: sector
/// atomicity is the baseline assumption.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CrashOp {
    Fragment { offset: u64, bytes: Vec<u8> },
    Resize { len: u64 },
    Sync,
}

#[derive(Debug, Default)]
struct CrashLog {
    initial: Vec<u8>,
    current: Vec<u8>,
    ops: Vec<CrashOp>,
}

/// Byte device that records its write stream for crash replay.
///
/// `materialize(cut)` rebuilds the image as if power failed after the first
/// `cut` recorded events were delivered to stable storage and everything
/// later was lost.
#[derive(Debug, Default)]
pub struct CrashDevice {
    state: Mutex<CrashLog>,
}

impl CrashDevice {
    #[must_use]
    pub fn new(len: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(CrashLog {
                initial: vec![0_u8; len],
                current: vec![0_u8; len],
                ops: Vec::new(),
            }),
        })
    }

    /// Number of recorded events; also the cut point meaning "no loss".
    #[must_use]
    pub fn op_count(&self) -> usize {
        self.state.lock().ops.len()
    }

    /// Event indices right after each recorded sync.
    #[must_use]
    pub fn sync_points(&self) -> Vec<usize> {
        let state = self.state.lock();
        state
            .ops
            .iter()
            .enumerate()
            .filter(|(_, op)| matches!(op, CrashOp::Sync))
            .map(|(index, _)| index + 1)
            .collect()
    }

    /// Image bytes with only the first `cut` events applied.
    #[must_use]
    pub fn materialize(&self, cut: usize) -> Vec<u8> {
        let state = self.state.lock();
        let mut image = state.initial.clone();
        for op in state.ops.iter().take(cut) {
            match op {
                CrashOp::Fragment { offset, bytes } => {
                    let offset = usize::try_from(*offset).unwrap_or(usize::MAX);
                    let end = offset + bytes.len();
                    if end > image.len() {
                        image.resize(end, 0);
                    }
                    image[offset..end].copy_from_slice(bytes);
                }
                CrashOp::Resize { len } => {
                    image.resize(usize::try_from(*len).unwrap_or(0), 0);
                }
                CrashOp::Sync => {}
            }
        }
        image
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.state.lock().current.clone()
    }
}

impl ByteDevice for CrashDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.state.lock().current.len()).unwrap_or(0)
    }

    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        let offset = usize::try_from(offset.0)
            .map_err(|_| PloopError::Format("offset overflow".into()))?;
        let state = self.state.lock();
        let end = offset + buf.len();
        if end > state.current.len() {
            return Err(PloopError::Format("oob read".into()));
        }
        buf.copy_from_slice(&state.current[offset..end]);
        Ok(())
    }

    fn write_all_at(&self, offset: ByteOffset, buf: &[u8]) -> Result<()> {
        let offset_usize = usize::try_from(offset.0)
            .map_err(|_| PloopError::Format("offset overflow".into()))?;
        let mut state = self.state.lock();
        let end = offset_usize + buf.len();
        if end > state.current.len() {
            state.current.resize(end, 0);
        }
        state.current[offset_usize..end].copy_from_slice(buf);

        let mut at = 0_usize;
        while at < buf.len() {
            let take = (buf.len() - at).min(512);
            state.ops.push(CrashOp::Fragment {
                offset: offset.0 + at as u64,
                bytes: buf[at..at + take].to_vec(),
            });
            at += take;
        }
        Ok(())
    }

    fn resize(&self, len: u64) -> Result<()> {
        let len_usize =
            usize::try_from(len).map_err(|_| PloopError::Format("len overflow".into()))?;
        let mut state = self.state.lock();
        state.current.resize(len_usize, 0);
        state.ops.push(CrashOp::Resize { len });
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.state.lock().ops.push(CrashOp::Sync);
        Ok(())
    }
}

/// Teacher-style xorshift; deterministic across platforms.
#[derive(Debug, Clone)]
pub struct DeterministicRng {
    state: u64,
}

impl DeterministicRng {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            state: seed ^ 0x9E37_79B9_7F4A_7C15,
        }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    pub fn next_usize(&mut self, upper_exclusive: usize) -> usize {
        if upper_exclusive <= 1 {
            return 0;
        }
        let upper = u64::try_from(upper_exclusive).unwrap_or(u64::MAX);
        usize::try_from(self.next_u64() % upper).unwrap_or(0)
    }

    pub fn fill_byte(&mut self) -> u8 {
        (self.next_u64() & 0xFF) as u8
    }
}

/// Format a fresh image-base onto an in-memory device.
pub fn format_image(shift: ClusterShift, virtual_clusters: u64) -> Result<Arc<MemByteDevice>> {
    let device = MemByteDevice::new(0);
    Delta::format(
        DeltaId(0),
        device.clone(),
        DeltaKind::ImageBase,
        shift,
        virtual_clusters,
        Generation(0),
        DeltaOptions::default(),
    )?;
    Ok(device)
}

/// Format a fresh image-base onto an arbitrary device (crash fixtures).
pub fn format_image_on(
    device: Arc<dyn ByteDevice>,
    shift: ClusterShift,
    virtual_clusters: u64,
) -> Result<()> {
    Delta::format(
        DeltaId(0),
        device,
        DeltaKind::ImageBase,
        shift,
        virtual_clusters,
        Generation(0),
        DeltaOptions::default(),
    )?;
    Ok(())
}

/// Open an engine over in-memory image layers, bottom first.
pub fn engine_over(layers: Vec<LayerSpec>) -> Result<PloopEngine> {
    PloopEngine::open(StackDescriptor { layers }, EngineConfig::default())
}

/// Result of one crash-sweep cut point, for JSON artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrashCutResult {
    pub cut: usize,
    pub opened: bool,
    pub errors: Vec<String>,
}

/// Aggregate crash-sweep report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrashSweepReport {
    pub total_cuts: usize,
    pub failed_cuts: usize,
    pub results: Vec<CrashCutResult>,
}

impl CrashSweepReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.failed_cuts == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crash_device_materializes_prefixes() {
        let device = CrashDevice::new(1024);
        device
            .write_all_at(ByteOffset(0), &[0xAA_u8; 1024])
            .expect("write");
        device.sync().expect("sync");
        device
            .write_all_at(ByteOffset(0), &[0xBB_u8; 512])
            .expect("write");

        // 2 fragments + sync + 1 fragment.
        assert_eq!(device.op_count(), 4);
        assert_eq!(device.sync_points(), vec![3]);

        let before_second = device.materialize(3);
        assert!(before_second[..1024].iter().all(|&b| b == 0xAA));
        let after_all = device.materialize(device.op_count());
        assert!(after_all[..512].iter().all(|&b| b == 0xBB));
        assert!(after_all[512..1024].iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn crash_device_cuts_inside_a_write() {
        let device = CrashDevice::new(0);
        device
            .write_all_at(ByteOffset(0), &[0x11_u8; 2048])
            .expect("write");
        let torn = device.materialize(2);
        assert_eq!(torn.len(), 1024);
        assert!(torn.iter().all(|&b| b == 0x11));
    }

    #[test]
    fn deterministic_rng_is_reproducible() {
        let mut a = DeterministicRng::new(42);
        let mut b = DeterministicRng::new(42);
        for _ in 0..100 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
    }

    #[test]
    fn format_image_produces_openable_stack() {
        let shift = ClusterShift::new(3).expect("shift");
        let device = format_image(shift, 32).expect("format");
        let engine = engine_over(vec![LayerSpec::image_device(device)]).expect("open");
        assert_eq!(engine.stack_info().virtual_clusters, 32);
    }
}

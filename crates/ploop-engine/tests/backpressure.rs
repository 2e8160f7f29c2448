//! Pipeline load behaviour against a device whose flush can be stalled:
//! write refusal once the dirty backlog passes the watermark, reads
//! passing while a commit is stuck, and barrier completion gated on the
//! device flush.

use parking_lot::{Condvar, Mutex};
use ploop_block::ByteDevice;
use ploop_delta::{Delta, DeltaKind, DeltaOptions};
use ploop_engine::{
    CommitPipelineConfig, EngineConfig, LayerSpec, PloopEngine, StackDescriptor,
};
use ploop_error::{PloopError, Result};
use ploop_types::{ByteOffset, ClusterShift, DeltaId, Generation};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const CLUSTER: usize = 4096;
const SPC: u64 = 8; // sectors per 4 KiB cluster

/// In-memory device whose `sync` blocks while the gate is closed.
///
/// Writes always land; only durability stalls — the shape of a backing
/// store that accepts I/O but cannot complete a flush.
#[derive(Debug)]
struct GatedDevice {
    bytes: Mutex<Vec<u8>>,
    gate: Mutex<GateState>,
    gate_cv: Condvar,
}

#[derive(Debug)]
struct GateState {
    closed: bool,
    waiting_syncs: usize,
}

impl GatedDevice {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            bytes: Mutex::new(Vec::new()),
            gate: Mutex::new(GateState {
                closed: false,
                waiting_syncs: 0,
            }),
            gate_cv: Condvar::new(),
        })
    }

    fn close_gate(&self) {
        self.gate.lock().closed = true;
    }

    fn open_gate(&self) {
        self.gate.lock().closed = false;
        self.gate_cv.notify_all();
    }

    fn waiting_syncs(&self) -> usize {
        self.gate.lock().waiting_syncs
    }
}

impl ByteDevice for GatedDevice {
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
        let len = usize::try_from(len).map_err(|_| PloopError::Format("len overflow".into()))?;
        self.bytes.lock().resize(len, 0);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        let mut gate = self.gate.lock();
        gate.waiting_syncs += 1;
        while gate.closed {
            self.gate_cv.wait(&mut gate);
        }
        gate.waiting_syncs -= 1;
        Ok(())
    }
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

/// Image with enough virtual clusters that clusters 0, 1020, 2040 and 3060
/// land on four distinct BAT pages.
fn gated_engine(config: EngineConfig) -> (Arc<GatedDevice>, Arc<PloopEngine>) {
    let device = GatedDevice::new();
    Delta::format(
        DeltaId(0),
        device.clone(),
        DeltaKind::ImageBase,
        ClusterShift::new(3).expect("4 KiB clusters"),
        4096,
        Generation(0),
        DeltaOptions::default(),
    )
    .expect("format");
    let engine = PloopEngine::open(
        StackDescriptor {
            layers: vec![LayerSpec::image_device(device.clone())],
        },
        config,
    )
    .expect("open");
    (device, Arc::new(engine))
}

#[test]
fn writes_are_refused_once_the_backlog_passes_the_watermark() {
    let config = EngineConfig {
        pipeline: CommitPipelineConfig {
            dirty_page_budget: 2,
            backpressure_watermark: 1,
            ..CommitPipelineConfig::default()
        },
        ..EngineConfig::default()
    };
    let (device, engine) = gated_engine(config);
    device.close_gate();

    // First writer's transaction drains and then sticks in the flush.
    let first = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || engine.write_at(0, &vec![0x11_u8; CLUSTER]).expect("write"))
    };
    wait_until("the commit to reach the stalled flush", || {
        device.waiting_syncs() > 0
    });

    // Two more writers dirty two further BAT pages; their pages pile up
    // behind the stuck transaction.
    let second = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || {
            engine
                .write_at(1020 * SPC, &vec![0x22_u8; CLUSTER])
                .expect("write")
        })
    };
    let third = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || {
            engine
                .write_at(2040 * SPC, &vec![0x33_u8; CLUSTER])
                .expect("write")
        })
    };
    wait_until("the dirty backlog to pass the watermark", || {
        engine.metrics().dirty_backlog >= 2
    });

    // New writes are refused with the transient error...
    let refused = engine.write_at(3060 * SPC, &vec![0x44_u8; CLUSTER]);
    assert!(matches!(refused, Err(PloopError::MetadataBackpressure)));
    assert!(engine.metrics().backpressure_rejections >= 1);

    // ...while reads are unaffected.
    let mut buf = vec![0xFF_u8; CLUSTER];
    engine.read_at(5 * SPC, &mut buf).expect("read during stall");
    assert!(buf.iter().all(|&b| b == 0));

    device.open_gate();
    first.join().expect("first writer");
    second.join().expect("second writer");
    third.join().expect("third writer");

    // Drained backlog admits the write that was refused.
    engine
        .write_at(3060 * SPC, &vec![0x44_u8; CLUSTER])
        .expect("write after drain");
    let mut back = vec![0_u8; CLUSTER];
    engine.read_at(1020 * SPC, &mut back).expect("read");
    assert!(back.iter().all(|&b| b == 0x22));
}

#[test]
fn barrier_completes_only_after_the_device_flush_unblocks() {
    let (device, engine) = gated_engine(EngineConfig::default());
    engine.write_at(0, &vec![0xA1_u8; CLUSTER]).expect("write");

    device.close_gate();
    let barrier = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || engine.flush().expect("barrier"))
    };
    wait_until("the barrier to reach the stalled flush", || {
        device.waiting_syncs() > 0
    });
    thread::sleep(Duration::from_millis(50));
    assert!(!barrier.is_finished(), "barrier completed without durability");

    device.open_gate();
    barrier.join().expect("barrier");
}

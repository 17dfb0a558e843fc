#![allow(dead_code)]

use std::{
    collections::HashSet,
    io::Write,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use accel_2d::{AccelError, Accelerator, BufferHandle, Source, Target};
use ml_core::{
    DecodeParams, Detection, InferenceRuntime, IoLayout, NpuCore, PostProcess, RawOutput,
    RuntimeContext, RuntimeError, SdkVersion, TensorAttr, TensorFormat, TensorType,
};
use tempfile::NamedTempFile;
use video_ingest::{Frame, FrameFormat};
use vision::{DetectorConfig, ReplicaShared, TransformService};

#[derive(Default)]
pub struct RuntimeStats {
    pub loads: AtomicUsize,
    pub duplicates: AtomicUsize,
    pub alive: AtomicUsize,
    pub runs: AtomicUsize,
}

/// In-memory stand-in for the NPU runtime.
pub struct FakeRuntime {
    pub stats: Arc<RuntimeStats>,
    input: (u32, u32),
    core_delays: [Duration; 3],
}

impl FakeRuntime {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            stats: Arc::new(RuntimeStats::default()),
            input: (width, height),
            core_delays: [Duration::ZERO; 3],
        }
    }

    pub fn with_core_delays(mut self, delays: [Duration; 3]) -> Self {
        self.core_delays = delays;
        self
    }

    fn layout(&self) -> IoLayout {
        let (w, h) = self.input;
        let input = TensorAttr {
            index: 0,
            name: "images".into(),
            dims: vec![1, h, w, 3],
            n_elems: w * h * 3,
            size: w * h * 3,
            format: TensorFormat::Nhwc,
            dtype: TensorType::Uint8,
            zero_point: 0,
            scale: 1.0,
        };
        let outputs = [8u32, 4, 2]
            .into_iter()
            .enumerate()
            .map(|(i, grid)| TensorAttr {
                index: i as u32,
                name: format!("output{i}"),
                dims: vec![1, 255, grid, grid],
                n_elems: 255 * grid * grid,
                size: 255 * grid * grid,
                format: TensorFormat::Nchw,
                dtype: TensorType::Int8,
                zero_point: -128,
                scale: 0.003_9,
            })
            .collect();
        IoLayout {
            inputs: vec![input],
            outputs,
        }
    }
}

impl InferenceRuntime for FakeRuntime {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn load_weights(&self, model: &[u8]) -> Result<Box<dyn RuntimeContext>, RuntimeError> {
        if model.is_empty() {
            return Err(RuntimeError::Status {
                op: "load",
                code: -1,
            });
        }
        self.stats.loads.fetch_add(1, Ordering::SeqCst);
        self.stats.alive.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeContext {
            stats: self.stats.clone(),
            layout: self.layout(),
            core_delays: self.core_delays,
            core: None,
        }))
    }
}

struct FakeContext {
    stats: Arc<RuntimeStats>,
    layout: IoLayout,
    core_delays: [Duration; 3],
    core: Option<NpuCore>,
}

impl RuntimeContext for FakeContext {
    fn duplicate(&self) -> Result<Box<dyn RuntimeContext>, RuntimeError> {
        self.stats.duplicates.fetch_add(1, Ordering::SeqCst);
        self.stats.alive.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeContext {
            stats: self.stats.clone(),
            layout: self.layout.clone(),
            core_delays: self.core_delays,
            core: None,
        }))
    }

    fn set_core_affinity(&mut self, core: NpuCore) -> Result<(), RuntimeError> {
        self.core = Some(core);
        Ok(())
    }

    fn sdk_version(&self) -> Result<SdkVersion, RuntimeError> {
        Ok(SdkVersion {
            api: "fake-1.0".into(),
            driver: "fake".into(),
        })
    }

    fn io_layout(&self) -> Result<IoLayout, RuntimeError> {
        Ok(self.layout.clone())
    }

    fn run_sync(&mut self, input: &[u8]) -> Result<Vec<RawOutput>, RuntimeError> {
        let expected = self.layout.input_shape()?.len();
        if input.len() != expected {
            return Err(RuntimeError::InputSize {
                expected,
                actual: input.len(),
            });
        }
        let delay = self.core.map(|c| self.core_delays[c.index()]).unwrap_or_default();
        thread::sleep(delay);
        self.stats.runs.fetch_add(1, Ordering::SeqCst);
        Ok(Vec::new())
    }
}

impl Drop for FakeContext {
    fn drop(&mut self) {
        self.stats.alive.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct NoDetections;

impl PostProcess for NoDetections {
    fn decode(&self, _outputs: &[RawOutput], _params: &DecodeParams) -> Vec<Detection> {
        Vec::new()
    }
}

#[derive(Default)]
pub struct Ledger {
    pub next: u32,
    pub live: HashSet<u32>,
    pub released: Vec<u32>,
    pub ops: usize,
}

/// 2D engine double that tracks handle lifetimes.
#[derive(Default)]
pub struct FakeAccelerator {
    pub ledger: Mutex<Ledger>,
    pub fail_ops: AtomicBool,
}

impl FakeAccelerator {
    fn op(&self, mut dst: Target<'_>) -> accel_2d::Result<()> {
        self.ledger.lock().unwrap().ops += 1;
        if self.fail_ops.load(Ordering::SeqCst) {
            return Err(AccelError::Status {
                op: "fake",
                status: -1,
                message: "injected failure".into(),
            });
        }
        if let Target::Mapped { data, .. } = &mut dst {
            data.fill(7);
        }
        Ok(())
    }
}

impl Accelerator for FakeAccelerator {
    fn name(&self) -> &'static str {
        "fake-2d"
    }

    fn resize(&self, _src: Source<'_>, dst: Target<'_>) -> accel_2d::Result<()> {
        self.op(dst)
    }

    fn convert_color(&self, _src: Source<'_>, dst: Target<'_>) -> accel_2d::Result<()> {
        self.op(dst)
    }

    unsafe fn import_virtual(&self, _addr: *mut u8, _len: usize) -> accel_2d::Result<BufferHandle> {
        let mut ledger = self.ledger.lock().unwrap();
        ledger.next += 1;
        let raw = ledger.next;
        ledger.live.insert(raw);
        Ok(BufferHandle::new(raw).unwrap())
    }

    fn release(&self, handle: BufferHandle) -> accel_2d::Result<()> {
        let mut ledger = self.ledger.lock().unwrap();
        assert!(ledger.live.remove(&handle.raw()), "handle {handle:?} released twice");
        ledger.released.push(handle.raw());
        Ok(())
    }
}

pub fn model_file() -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(b"fake-rknn-model").unwrap();
    file
}

pub fn shared(runtime: Arc<FakeRuntime>, config: DetectorConfig) -> Arc<ReplicaShared> {
    Arc::new(ReplicaShared::new(
        config,
        runtime,
        Arc::new(TransformService::software()),
        Arc::new(NoDetections),
    ))
}

/// Uniform BGR frame tagged with `seq` in its timestamp.
pub fn bgr_frame(width: u32, height: u32, seq: i64) -> Frame {
    Frame::zeroed(width, height, FrameFormat::Bgr8).with_timestamp(seq)
}

//! Producer loop: decode, submit, retrieve in order, publish.
//!
//! At most one frame per replica is in flight; once the pool is full every
//! submission is followed by one ordered `retrieve`. On end of stream or
//! Ctrl+C the remaining results are drained before shutdown.

use std::{
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};

use accel_2d::{Accelerator, RgaAccelerator};
use anyhow::{Context, Result, bail};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use image::Rgb;
use metrics::{counter, gauge};
use ml_core::{RknnRuntime, Yolov5PostProcess};
use tracing::{debug, info, info_span, warn};
use video_ingest::{CaptureError, Frame, FrameFormat, ReaderOptions, spawn_reader};
use vision::{
    Accel2d, AnnotatedFrame, DetectionPool, DetectorConfig, PoolError, ReplicaShared,
    TransformService, annotation, spawn_detection_pool, telemetry,
};

use super::{
    data::PreviewStore,
    encoding::{EncodeJob, spawn_encode_worker},
    fps::FpsMeter,
    server::spawn_preview_server,
};
use crate::cli::{AppConfig, DisplayOptions, IngestOptions};

/// Finished frames waiting for JPEG encoding; extra frames skip the preview.
const ENCODE_QUEUE_SIZE: usize = 4;
const FPS_COLOR: Rgb<u8> = Rgb([0, 255, 0]);

type FrameSource = Receiver<Result<Frame, CaptureError>>;

pub fn run(config: AppConfig) -> Result<()> {
    let _telemetry = telemetry::enter_runtime(&config.telemetry);
    telemetry::init_metrics_recorder();
    let run_span = info_span!(
        "npu_detect",
        input = %config.ingest.reader.uri,
        replicas = config.detector.replicas,
        accel = ?config.detector.accel,
        mapping = ?config.detector.mapping,
    );
    let _run_guard = run_span.enter();

    let shutdown = install_interrupt_handler();
    let (pool, transform) = build_pool(&config.detector)?;

    let store = Arc::new(PreviewStore::default());
    let preview = match config.display.preview_port {
        Some(port) => Some(spawn_preview_server(port, Arc::clone(&store))?),
        None => None,
    };
    let (encode_tx, encode_rx) = bounded(ENCODE_QUEUE_SIZE);
    let encoder = spawn_encode_worker(store, encode_rx, config.display.jpeg_quality)
        .context("failed to spawn preview encoder")?;

    let mut sink = Sink::new(config.display.clone(), encode_tx);
    let outcome = drive(&pool, &transform, &config.ingest, &shutdown, &mut sink);

    // Whatever happened above, every submitted frame is still delivered.
    loop {
        match pool.retrieve() {
            Err(PoolError::Empty) => break,
            result => sink.deliver(result),
        }
    }
    info!(
        delivered = sink.frame_number,
        dropped = sink.dropped,
        fps = sink.fps.current(),
        "detection finished"
    );

    drop(pool);
    drop(sink);
    if encoder.join().is_err() {
        warn!("preview encoder exited with a panic");
    }
    if let Some(preview) = preview {
        preview.stop();
    }
    outcome
}

fn drive(
    pool: &DetectionPool,
    transform: &TransformService,
    ingest: &IngestOptions,
    shutdown: &AtomicBool,
    sink: &mut Sink,
) -> Result<()> {
    let (frames, first) = open_source(ingest)?;
    let in_flight = pool.replica_count();

    for frame in std::iter::once(Ok(first)).chain(frames.iter()) {
        if shutdown.load(Ordering::SeqCst) {
            info!("interrupted; draining in-flight frames");
            break;
        }
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                warn!("capture error: {err}");
                counter!("capture_errors_total").increment(1);
                continue;
            }
        };
        let Some(frame) = drawable(transform, frame) else {
            continue;
        };

        pool.submit(frame)?;
        while pool.pending() >= in_flight {
            sink.deliver(pool.retrieve());
        }
    }
    Ok(())
}

/// Load the runtime and 2D engine, then build every replica.
fn build_pool(detector: &DetectorConfig) -> Result<(DetectionPool, Arc<TransformService>)> {
    let runtime = RknnRuntime::load().context("failed to load the NPU runtime")?;
    let accel: Option<Arc<dyn Accelerator>> = match detector.accel {
        Accel2d::Rga => match RgaAccelerator::load() {
            Ok(rga) => Some(Arc::new(rga)),
            Err(err) => {
                warn!("RGA unavailable: {err}");
                None
            }
        },
        Accel2d::Software => None,
    };
    let transform = Arc::new(TransformService::from_config(detector, accel));
    info!(backend = transform.backend_name(), "transform backend selected");

    let shared = ReplicaShared::new(
        detector.clone(),
        Arc::new(runtime),
        Arc::clone(&transform),
        Arc::new(Yolov5PostProcess::default()),
    );
    let pool = spawn_detection_pool(Arc::new(shared)).context("failed to initialise model replicas")?;
    Ok((pool, transform))
}

/// Start the reader and wait for its first frame, retrying once with the
/// fallback decoder when the configured one yields nothing.
fn open_source(ingest: &IngestOptions) -> Result<(FrameSource, Frame)> {
    match first_frame(&ingest.reader) {
        Ok(opened) => Ok(opened),
        Err(err) => {
            let Some(fallback) = ingest.fallback_decoder.as_ref() else {
                return Err(err);
            };
            warn!(
                decoder = ingest.reader.decoder.as_deref().unwrap_or("auto"),
                fallback = fallback.as_str(),
                "decoder produced no frames ({err:#}); retrying"
            );
            let retry = ingest.reader.clone().with_decoder(Some(fallback.clone()));
            first_frame(&retry)
        }
    }
}

fn first_frame(options: &ReaderOptions) -> Result<(FrameSource, Frame)> {
    let frames = spawn_reader(options)
        .with_context(|| format!("failed to open {}", options.uri))?;
    match frames.recv() {
        Ok(Ok(frame)) => {
            info!(width = frame.width, height = frame.height, format = ?frame.format, "stream opened");
            Ok((frames, frame))
        }
        Ok(Err(err)) => Err(err).context("failed to read the first frame"),
        Err(_) => bail!("stream ended before the first frame"),
    }
}

/// Decoder-native layouts are converted to BGR so results can be annotated.
fn drawable(transform: &TransformService, frame: Frame) -> Option<Frame> {
    if frame.format.is_packed_rgb() {
        return Some(frame);
    }
    match transform.convert_color(&frame, FrameFormat::Bgr8) {
        Ok(converted) => Some(converted),
        Err(err) => {
            warn!(format = ?frame.format, "skipping frame: {err}");
            counter!("capture_errors_total").increment(1);
            None
        }
    }
}

fn install_interrupt_handler() -> Arc<AtomicBool> {
    static SHUTDOWN: OnceLock<Arc<AtomicBool>> = OnceLock::new();

    let shutdown = SHUTDOWN.get_or_init(|| {
        let shutdown = Arc::new(AtomicBool::new(false));
        let handler_shutdown = shutdown.clone();
        if let Err(err) = ctrlc::set_handler(move || handler_shutdown.store(true, Ordering::SeqCst)) {
            warn!("failed to install Ctrl+C handler: {err}");
        }
        shutdown
    });
    Arc::clone(shutdown)
}

/// Consumer side of the loop: FPS bookkeeping and preview hand-off.
struct Sink {
    display: DisplayOptions,
    encode_tx: Sender<EncodeJob>,
    fps: FpsMeter,
    frame_number: u64,
    dropped: u64,
}

impl Sink {
    fn new(display: DisplayOptions, encode_tx: Sender<EncodeJob>) -> Self {
        Self {
            display,
            encode_tx,
            fps: FpsMeter::new(Instant::now()),
            frame_number: 0,
            dropped: 0,
        }
    }

    fn deliver(&mut self, result: Result<Option<AnnotatedFrame>, PoolError>) {
        match result {
            Ok(Some(annotated)) => self.publish(annotated),
            Ok(None) => {
                self.dropped += 1;
                debug!(dropped = self.dropped, "frame dropped by replica");
            }
            Err(err) => {
                self.dropped += 1;
                warn!("result lost: {err}");
            }
        }
    }

    fn publish(&mut self, mut annotated: AnnotatedFrame) {
        self.frame_number += 1;
        if let Some(rate) = self.fps.tick(Instant::now()) {
            gauge!("output_fps").set(rate as f64);
            if self.display.print_fps {
                info!(fps = rate, frames = self.frame_number, "throughput");
            }
        }
        if self.display.screen_fps {
            let label = format!("FPS: {:.1}", self.fps.current());
            annotation::draw_text(&mut annotated.frame, 10, 10, &label, FPS_COLOR);
        }
        debug!(
            frame = self.frame_number,
            replica = annotated.replica,
            detections = annotated.detections.len(),
            inference_ms = annotated.inference.as_secs_f64() * 1_000.0,
            "frame delivered"
        );

        if self.display.preview_port.is_none() {
            return;
        }
        let job = EncodeJob {
            annotated,
            frame_number: self.frame_number,
            fps: self.fps.current(),
            span: tracing::Span::current(),
        };
        match self.encode_tx.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => counter!("preview_frames_skipped_total").increment(1),
            Err(TrySendError::Disconnected(_)) => debug!("preview encoder gone"),
        }
    }
}

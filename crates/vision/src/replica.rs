//! One inference context bound to one NPU core.

use std::{
    fs,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use metrics::{counter, histogram};
use ml_core::{
    DecodeParams, Detection, InferenceRuntime, InputShape, NpuCore, PostProcess, RuntimeContext,
    TensorAttr,
};
use tracing::{debug, info, warn};
use video_ingest::{Frame, FrameFormat};

use crate::{
    annotation,
    config::DetectorConfig,
    error::{InferError, InitError},
    rotation::CoreTable,
    transform::TransformService,
};

/// Collaborators every replica of one pool shares.
pub struct ReplicaShared {
    pub config: DetectorConfig,
    pub runtime: Arc<dyn InferenceRuntime>,
    pub transform: Arc<TransformService>,
    pub post: Arc<dyn PostProcess>,
    pub cores: CoreTable,
}

impl ReplicaShared {
    pub fn new(
        config: DetectorConfig,
        runtime: Arc<dyn InferenceRuntime>,
        transform: Arc<TransformService>,
        post: Arc<dyn PostProcess>,
    ) -> Self {
        Self {
            config,
            runtime,
            transform,
            post,
            cores: CoreTable::new(),
        }
    }

    pub fn with_cores(mut self, cores: CoreTable) -> Self {
        self.cores = cores;
        self
    }
}

/// A frame with detections drawn on it.
#[derive(Clone, Debug)]
pub struct AnnotatedFrame {
    pub frame: Frame,
    pub detections: Vec<Detection>,
    pub replica: usize,
    pub core: NpuCore,
    pub inference: Duration,
}

pub struct ModelReplica {
    index: usize,
    core: NpuCore,
    input: InputShape,
    outputs: Vec<TensorAttr>,
    shared: Arc<ReplicaShared>,
    context: Mutex<Box<dyn RuntimeContext>>,
}

impl ModelReplica {
    /// Build replica `index`. Without `source` the model file is read and
    /// loaded; with one, its context is duplicated so the weights are shared.
    pub fn init(
        index: usize,
        shared: Arc<ReplicaShared>,
        source: Option<&ModelReplica>,
    ) -> Result<Self, InitError> {
        let mut context = match source {
            None => {
                let path = &shared.config.model_path;
                let model = fs::read(path).map_err(|source| InitError::ModelRead {
                    path: path.clone(),
                    source,
                })?;
                if model.is_empty() {
                    return Err(InitError::EmptyModel(path.clone()));
                }
                debug!(replica = index, bytes = model.len(), path = %path.display(), "loading model");
                shared.runtime.load_weights(&model).map_err(InitError::Runtime)?
            }
            Some(src) => src.lock_context().duplicate().map_err(InitError::Runtime)?,
        };

        let core = shared.cores.next();
        context
            .set_core_affinity(core)
            .map_err(|source| InitError::CoreBinding { core, source })?;

        if index == 0 {
            match context.sdk_version() {
                Ok(version) => info!(runtime = shared.runtime.name(), "NPU sdk {version}"),
                Err(err) => warn!("failed to query sdk version: {err}"),
            }
        }

        let layout = context.io_layout().map_err(InitError::Runtime)?;
        let input = layout
            .input_shape()
            .map_err(|err| InitError::Layout(err.to_string()))?;
        if input.channels != 3 {
            return Err(InitError::Layout(format!(
                "model expects {} input channels, only 3-channel RGB is supported",
                input.channels
            )));
        }
        info!(
            replica = index,
            %core,
            width = input.width,
            height = input.height,
            outputs = layout.outputs.len(),
            "replica ready"
        );

        Ok(Self {
            index,
            core,
            input,
            outputs: layout.outputs,
            shared,
            context: Mutex::new(context),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn core(&self) -> NpuCore {
        self.core
    }

    pub fn input_shape(&self) -> InputShape {
        self.input
    }

    pub fn output_attrs(&self) -> &[TensorAttr] {
        &self.outputs
    }

    /// Detect objects in `frame` and draw them on it. `None` when any stage
    /// fails; the failure is logged and counted.
    pub fn infer(&self, frame: Frame) -> Option<AnnotatedFrame> {
        match self.try_infer(frame) {
            Ok(annotated) => Some(annotated),
            Err(err) => {
                counter!("frames_dropped_total", "replica" => self.index.to_string()).increment(1);
                warn!(replica = self.index, "dropping frame: {err}");
                None
            }
        }
    }

    pub fn try_infer(&self, mut frame: Frame) -> Result<AnnotatedFrame, InferError> {
        let _span = tracing::debug_span!("infer", replica = self.index, core = %self.core).entered();
        let mut context = self.lock_context();
        let started = Instant::now();

        let target = (self.input.width, self.input.height);
        let prepared = self
            .shared
            .transform
            .transform(&frame, target, FrameFormat::Rgb8)?;
        let preprocess = started.elapsed();

        let outputs = context.run_sync(&prepared.frame.data)?;
        let inference = started.elapsed() - preprocess;

        let letterbox = prepared.letterbox;
        let params = DecodeParams {
            model_width: self.input.width,
            model_height: self.input.height,
            padding: letterbox.padding,
            scale_w: letterbox.scale,
            scale_h: letterbox.scale,
            conf_threshold: self.shared.config.conf_threshold,
            nms_threshold: self.shared.config.nms_threshold,
        };
        let detections = self.shared.post.decode(&outputs, &params);
        if !annotation::annotate(&mut frame, &detections) {
            debug!(format = ?frame.format, "frame not drawable; detections returned unannotated");
        }

        let replica = self.index.to_string();
        histogram!("stage_latency_ms", "stage" => "preprocess").record(ms(preprocess));
        histogram!("npu_inference_ms", "replica" => replica).record(ms(inference));
        histogram!("stage_latency_ms", "stage" => "replica_total").record(ms(started.elapsed()));

        Ok(AnnotatedFrame {
            frame,
            detections,
            replica: self.index,
            core: self.core,
            inference,
        })
    }

    fn lock_context(&self) -> std::sync::MutexGuard<'_, Box<dyn RuntimeContext>> {
        self.context.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1_000.0
}

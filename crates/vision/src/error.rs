use std::{io, path::PathBuf};

use accel_2d::AccelError;
use ml_core::{NpuCore, RuntimeError};
use thiserror::Error;
use video_ingest::FrameFormat;

/// Failure while building a replica or the pool around it. Fatal for the run.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("failed to read model {path}: {source}")]
    ModelRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("model file {0} is empty")]
    EmptyModel(PathBuf),
    #[error("runtime rejected the model: {0}")]
    Runtime(#[source] RuntimeError),
    #[error("failed to bind context to {core}: {source}")]
    CoreBinding {
        core: NpuCore,
        #[source]
        source: RuntimeError,
    },
    #[error("unsupported model layout: {0}")]
    Layout(String),
    #[error("at least one replica is required")]
    NoReplicas,
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),
}

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("{backend} path cannot handle {format:?}")]
    UnsupportedFormat {
        format: FrameFormat,
        backend: &'static str,
    },
    #[error(transparent)]
    Accelerator(#[from] AccelError),
    #[error("buffer holds {actual} bytes, layout needs {expected}")]
    BufferSize { expected: usize, actual: usize },
    #[error("image operation failed: {0}")]
    Image(String),
}

/// Per-frame failure inside a replica; the frame is dropped.
#[derive(Debug, Error)]
pub enum InferError {
    #[error("transform failed: {0}")]
    Transform(#[from] TransformError),
    #[error("inference failed: {0}")]
    Runtime(#[from] RuntimeError),
}

#[derive(Debug, Error)]
pub enum PoolError {
    /// Nothing is pending; a normal condition, not a failure.
    #[error("no pending results")]
    Empty,
    #[error("worker pool is shut down")]
    Closed,
    #[error("task {seq} was lost before producing a result")]
    TaskLost { seq: u64 },
    #[error(transparent)]
    Init(#[from] InitError),
}

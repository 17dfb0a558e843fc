//! Ordered NPU detection pool.
//!
//! Frames are spread round-robin over a fixed set of model replicas, each
//! bound to one NPU core, and come back in the order they were submitted.
//! Per-frame colour conversion and letterboxing run on the CPU or on a
//! hardware 2D engine.

pub mod annotation;
pub mod config;
mod error;
pub mod pool;
pub mod replica;
pub mod rotation;
pub mod telemetry;
pub mod transform;

pub use config::{Accel2d, ConfigError, DetectorConfig, MemoryMapping, TelemetryOptions};
pub use error::{InferError, InitError, PoolError, TransformError};
pub use pool::{DetectionPool, Replica, TaskState, WorkerPool, spawn_detection_pool};
pub use replica::{AnnotatedFrame, ModelReplica, ReplicaShared};
pub use rotation::{CoreTable, RoundRobin, Rotation};
pub use transform::{Letterbox, TransformService, Transformed};

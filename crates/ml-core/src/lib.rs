//! Inference runtime contract, the RKNN backend and YOLOv5 output decoding.
//!
//! A runtime turns model bytes into a [`RuntimeContext`]; contexts can be
//! duplicated so several NPU cores share one set of decoded weights.

mod postprocess;
mod rknn;
mod runtime;

pub use postprocess::{
    COCO_LABELS, DecodeParams, Detection, MAX_DETECTIONS, Padding, PostProcess, Yolov5PostProcess,
};
pub use rknn::RknnRuntime;
pub use runtime::{
    InferenceRuntime, InputShape, IoLayout, NpuCore, RawOutput, RuntimeContext, RuntimeError,
    SdkVersion, TensorAttr, TensorFormat, TensorType,
};

//! Frame producers feeding the detection pool.
//!
//! Decoding is delegated to an `ffmpeg` subprocess so that hardware decoders
//! (`h264_rkmpp`) and software decoders share one code path.

mod ffmpeg;
mod types;

pub use ffmpeg::{ReaderOptions, probe_geometry, spawn_reader};
pub use types::{CaptureError, Frame, FrameFormat};

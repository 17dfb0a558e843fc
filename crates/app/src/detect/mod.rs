//! End-to-end detection run: ffmpeg reader, ordered NPU pool, preview sink.

mod data;
mod encoding;
mod fps;
mod pipeline;
mod server;

pub use pipeline::run;

//! JPEG stage feeding the preview server.
//!
//! The producer hands finished frames to a dedicated encoder thread so that
//! JPEG compression never delays `retrieve`. Encoded packets land in the
//! [`PreviewStore`] read by the HTTP handlers.

use std::{borrow::Cow, sync::Arc, thread, time::Instant};

use anyhow::{Result, bail};
use crossbeam_channel::Receiver;
use image::{ExtendedColorType, codecs::jpeg::JpegEncoder};
use tracing::{Span, error};
use video_ingest::{Frame, FrameFormat};
use vision::{AnnotatedFrame, telemetry};

use super::data::{DetectionSummary, PreviewPacket, PreviewStore};

pub(crate) struct EncodeJob {
    pub(crate) annotated: AnnotatedFrame,
    pub(crate) frame_number: u64,
    pub(crate) fps: f32,
    pub(crate) span: Span,
}

/// Compress a packed BGR or RGB frame.
pub(crate) fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>> {
    let rgb: Cow<'_, [u8]> = match frame.format {
        FrameFormat::Rgb8 => Cow::Borrowed(&frame.data),
        FrameFormat::Bgr8 => Cow::Owned(
            frame
                .data
                .chunks_exact(3)
                .flat_map(|px| [px[2], px[1], px[0]])
                .collect(),
        ),
        other => bail!("cannot encode {other:?} frames as JPEG"),
    };

    let mut jpeg = Vec::with_capacity(frame.data.len() / 8);
    JpegEncoder::new_with_quality(&mut jpeg, quality.clamp(1, 100)).encode(
        &rgb,
        frame.width,
        frame.height,
        ExtendedColorType::Rgb8,
    )?;
    Ok(jpeg)
}

/// Spawn the encoder thread. It exits when every sender is dropped.
pub(crate) fn spawn_encode_worker(
    store: Arc<PreviewStore>,
    jobs: Receiver<EncodeJob>,
    quality: u8,
) -> Result<thread::JoinHandle<()>> {
    let handle = telemetry::spawn_thread("preview-encoder", move || {
        let depth_probe = jobs.clone();
        for job in jobs {
            metrics::gauge!("preview_queue_depth").set(depth_probe.len() as f64);
            let _frame_guard = job.span.enter();
            let started = Instant::now();

            let jpeg = match encode_jpeg(&job.annotated.frame, quality) {
                Ok(jpeg) => jpeg,
                Err(err) => {
                    error!(frame = job.frame_number, "encode failed: {err}");
                    metrics::counter!("preview_encode_errors_total").increment(1);
                    continue;
                }
            };
            let packet = PreviewPacket {
                jpeg,
                detections: job
                    .annotated
                    .detections
                    .iter()
                    .map(DetectionSummary::from)
                    .collect(),
                timestamp_ms: job.annotated.frame.timestamp_ms,
                frame_number: job.frame_number,
                fps: job.fps,
                replica: job.annotated.replica,
            };

            store.publish(packet);
            metrics::histogram!("stage_latency_ms", "stage" => "encode")
                .record(started.elapsed().as_secs_f64() * 1_000.0);
        }
    })?;
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_bgr_frames() {
        let frame = Frame::zeroed(16, 8, FrameFormat::Bgr8);
        let jpeg = encode_jpeg(&frame, 85).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn rejects_planar_frames() {
        let frame = Frame::zeroed(16, 8, FrameFormat::Nv12);
        assert!(encode_jpeg(&frame, 85).is_err());
    }
}

//! Per-frame colour conversion and letterbox resizing.
//!
//! The service runs either on the CPU or on a hardware 2D engine. When the
//! engine rejects a pixel layout the call is retried in software (unless
//! disabled); engine failures are returned as-is.

mod hardware;
mod letterbox;
#[cfg(feature = "opencl")]
mod opencl;
mod software;

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use accel_2d::Accelerator;
use metrics::counter;
use tracing::{debug, warn};
use video_ingest::{Frame, FrameFormat};

pub use letterbox::{Letterbox, PAD_COLOR};

use crate::{
    config::{Accel2d, DetectorConfig, MemoryMapping},
    error::TransformError,
};
use hardware::HardwareTransform;

/// A frame ready for the model together with how it was fitted.
#[derive(Clone, Debug)]
pub struct Transformed {
    pub frame: Frame,
    pub letterbox: Letterbox,
}

enum Backend {
    Software,
    Hardware(HardwareTransform),
}

pub struct TransformService {
    backend: Backend,
    opencl: bool,
    fallback: bool,
    fallback_reported: AtomicBool,
}

impl TransformService {
    pub fn software() -> Self {
        Self {
            backend: Backend::Software,
            opencl: false,
            fallback: true,
            fallback_reported: AtomicBool::new(false),
        }
    }

    pub fn hardware(accel: Arc<dyn Accelerator>, mapping: MemoryMapping) -> Self {
        Self {
            backend: Backend::Hardware(HardwareTransform::new(accel, mapping)),
            ..Self::software()
        }
    }

    /// Pick the backend named by `config`. A missing engine degrades to the
    /// software path.
    pub fn from_config(config: &DetectorConfig, accel: Option<Arc<dyn Accelerator>>) -> Self {
        let service = match (config.accel, accel) {
            (Accel2d::Rga, Some(accel)) => Self::hardware(accel, config.mapping),
            (Accel2d::Rga, None) => {
                warn!("2D engine unavailable; using software transforms");
                Self::software()
            }
            (Accel2d::Software, _) => Self::software(),
        };
        service
            .with_opencl(config.opencl)
            .with_fallback(config.software_fallback)
    }

    pub fn with_opencl(mut self, enabled: bool) -> Self {
        self.opencl = enabled;
        self
    }

    pub fn with_fallback(mut self, enabled: bool) -> Self {
        self.fallback = enabled;
        self
    }

    pub fn backend_name(&self) -> &'static str {
        match &self.backend {
            Backend::Software if self.opencl => "opencl",
            Backend::Software => software::BACKEND,
            Backend::Hardware(hw) => hw.name(),
        }
    }

    pub fn convert_color(&self, frame: &Frame, to: FrameFormat) -> Result<Frame, TransformError> {
        check_len(frame)?;
        if frame.format == to {
            return Ok(frame.clone());
        }
        self.dispatch(
            "convert_color",
            |hw| hw.convert_color(frame, to),
            || software::convert_color(frame, to),
        )
    }

    /// Stretch `frame` to exactly `width`x`height`.
    pub fn resize(&self, frame: &Frame, width: u32, height: u32) -> Result<Frame, TransformError> {
        check_len(frame)?;
        if frame.size() == (width, height) {
            return Ok(frame.clone());
        }
        self.dispatch(
            "resize",
            |hw| hw.resize(frame, width, height),
            || self.software_resize(frame, width, height),
        )
    }

    /// Fit `frame` into `target` preserving aspect ratio, padding with grey.
    pub fn letterbox(&self, frame: &Frame, target: (u32, u32)) -> Result<Transformed, TransformError> {
        let letterbox = Letterbox::fit(frame.size(), target);
        if letterbox.is_identity() {
            check_len(frame)?;
            return Ok(Transformed {
                frame: frame.clone(),
                letterbox,
            });
        }
        let resized = self.resize(frame, letterbox.resized.0, letterbox.resized.1)?;
        let data = if letterbox.has_padding() {
            letterbox.compose(&resized.data)?
        } else {
            resized.data
        };
        Ok(Transformed {
            frame: Frame {
                data,
                width: target.0,
                height: target.1,
                timestamp_ms: frame.timestamp_ms,
                format: resized.format,
            },
            letterbox,
        })
    }

    /// Convert to `format`, then letterbox into `target` when sizes differ.
    pub fn transform(
        &self,
        frame: &Frame,
        target: (u32, u32),
        format: FrameFormat,
    ) -> Result<Transformed, TransformError> {
        let converted = self.convert_color(frame, format)?;
        self.letterbox(&converted, target)
    }

    fn dispatch<T>(
        &self,
        op: &'static str,
        hardware: impl FnOnce(&HardwareTransform) -> Result<T, TransformError>,
        software: impl FnOnce() -> Result<T, TransformError>,
    ) -> Result<T, TransformError> {
        let Backend::Hardware(hw) = &self.backend else {
            return software();
        };
        match hardware(hw) {
            Err(TransformError::UnsupportedFormat { format, backend }) if self.fallback => {
                counter!("transform_fallbacks_total", "op" => op).increment(1);
                if !self.fallback_reported.swap(true, Ordering::Relaxed) {
                    warn!(?format, op, backend, "2D engine cannot handle frame; using software");
                } else {
                    debug!(?format, op, "software fallback");
                }
                software()
            }
            other => other,
        }
    }

    fn software_resize(&self, frame: &Frame, width: u32, height: u32) -> Result<Frame, TransformError> {
        #[cfg(feature = "opencl")]
        if self.opencl {
            return opencl::resize(frame, width, height);
        }
        software::resize(frame, width, height)
    }
}

fn check_len(frame: &Frame) -> Result<(), TransformError> {
    let expected = frame.format.frame_len(frame.width, frame.height);
    if frame.data.len() != expected || expected == 0 {
        return Err(TransformError::BufferSize {
            expected,
            actual: frame.data.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grey_bgr(w: u32, h: u32) -> Frame {
        Frame::from_vec(vec![200; (w * h * 3) as usize], w, h, FrameFormat::Bgr8).unwrap()
    }

    #[test]
    fn transform_converts_then_letterboxes() {
        let service = TransformService::software();
        let out = service
            .transform(&grey_bgr(8, 4), (8, 8), FrameFormat::Rgb8)
            .unwrap();
        assert_eq!(out.frame.size(), (8, 8));
        assert_eq!(out.frame.format, FrameFormat::Rgb8);
        assert_eq!(out.letterbox.padding.top, 2);
        // Padding rows are grey, content rows keep the source value.
        assert_eq!(&out.frame.data[..3], &PAD_COLOR);
        assert_eq!(out.frame.data[(2 * 8) * 3], 200);
    }

    #[test]
    fn matching_size_is_passed_through() {
        let service = TransformService::software();
        let frame = grey_bgr(4, 4);
        let out = service.letterbox(&frame, (4, 4)).unwrap();
        assert!(out.letterbox.is_identity());
        assert_eq!(out.frame.data, frame.data);
    }

    #[test]
    fn same_aspect_frames_are_scaled_down() {
        let service = TransformService::software();
        let out = service.letterbox(&grey_bgr(64, 48), (32, 24)).unwrap();
        assert_eq!(out.frame.size(), (32, 24));
        assert_eq!(out.frame.data.len(), 32 * 24 * 3);
        assert_eq!(out.letterbox.scale, 0.5);
        assert_eq!(out.frame.data[0], 200);
    }

    #[test]
    fn short_buffers_are_rejected() {
        let service = TransformService::software();
        let mut frame = grey_bgr(4, 4);
        frame.data.truncate(10);
        assert!(matches!(
            service.resize(&frame, 2, 2),
            Err(TransformError::BufferSize { .. })
        ));
    }

    #[test]
    fn config_without_engine_uses_software() {
        let config = DetectorConfig::new("m.rknn");
        let service = TransformService::from_config(&config, None);
        assert_eq!(service.backend_name(), "software");
    }
}

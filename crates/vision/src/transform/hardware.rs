//! 2D-engine path: colour conversion and resize through an [`Accelerator`].

use std::sync::Arc;

use accel_2d::{Accelerator, ImportedSource, ImportedTarget, PixelFormat, Source, Surface, Target};
use tracing::trace;
use video_ingest::{Frame, FrameFormat};

use crate::{config::MemoryMapping, error::TransformError};

#[derive(Clone, Copy, Debug)]
enum Op {
    Resize,
    ConvertColor,
}

impl Op {
    fn apply(self, accel: &dyn Accelerator, src: Source<'_>, dst: Target<'_>) -> accel_2d::Result<()> {
        match self {
            Op::Resize => accel.resize(src, dst),
            Op::ConvertColor => accel.convert_color(src, dst),
        }
    }
}

pub(crate) struct HardwareTransform {
    accel: Arc<dyn Accelerator>,
    mapping: MemoryMapping,
}

impl HardwareTransform {
    pub(crate) fn new(accel: Arc<dyn Accelerator>, mapping: MemoryMapping) -> Self {
        Self { accel, mapping }
    }

    pub(crate) fn name(&self) -> &'static str {
        self.accel.name()
    }

    pub(crate) fn convert_color(&self, frame: &Frame, to: FrameFormat) -> Result<Frame, TransformError> {
        let src_format = self.pixel_format(frame.format)?;
        if !to.is_packed_rgb() {
            return Err(self.unsupported(to));
        }
        let dst_format = self.pixel_format(to)?;

        let mut out = Frame::zeroed(frame.width, frame.height, to).with_timestamp(frame.timestamp_ms);
        self.run(
            Op::ConvertColor,
            Surface::new(frame.width, frame.height, src_format),
            &frame.data,
            Surface::new(frame.width, frame.height, dst_format),
            &mut out.data,
        )?;
        Ok(out)
    }

    pub(crate) fn resize(&self, frame: &Frame, width: u32, height: u32) -> Result<Frame, TransformError> {
        if !frame.format.is_packed_rgb() {
            return Err(self.unsupported(frame.format));
        }
        let format = self.pixel_format(frame.format)?;

        let mut out = Frame::zeroed(width, height, frame.format).with_timestamp(frame.timestamp_ms);
        self.run(
            Op::Resize,
            Surface::new(frame.width, frame.height, format),
            &frame.data,
            Surface::new(width, height, format),
            &mut out.data,
        )?;
        Ok(out)
    }

    fn run(
        &self,
        op: Op,
        src_surface: Surface,
        src: &[u8],
        dst_surface: Surface,
        dst: &mut [u8],
    ) -> Result<(), TransformError> {
        if src.len() < src_surface.len() {
            return Err(TransformError::BufferSize {
                expected: src_surface.len(),
                actual: src.len(),
            });
        }
        let accel = self.accel.as_ref();
        trace!(?op, mapping = ?self.mapping, ?src_surface, ?dst_surface, "2d op");
        match self.mapping {
            MemoryMapping::Direct => op.apply(
                accel,
                Source::Mapped {
                    surface: src_surface,
                    data: src,
                },
                Target::Mapped {
                    surface: dst_surface,
                    data: dst,
                },
            )?,
            MemoryMapping::Imported => {
                // Both guards release their handle on every return path below.
                let src = ImportedSource::new(accel, src_surface, src)?;
                let dst = ImportedTarget::new(accel, dst_surface, dst)?;
                op.apply(accel, src.as_source(), dst.as_target())?;
            }
        }
        Ok(())
    }

    fn pixel_format(&self, format: FrameFormat) -> Result<PixelFormat, TransformError> {
        match format {
            FrameFormat::Bgr8 => Ok(PixelFormat::Bgr888),
            FrameFormat::Rgb8 => Ok(PixelFormat::Rgb888),
            FrameFormat::Nv12 => Ok(PixelFormat::Yuv420Sp),
            FrameFormat::Nv21 => Ok(PixelFormat::Yuv420SpVu),
            FrameFormat::Rgba8 | FrameFormat::Gray8 => Err(self.unsupported(format)),
        }
    }

    fn unsupported(&self, format: FrameFormat) -> TransformError {
        TransformError::UnsupportedFormat {
            format,
            backend: self.accel.name(),
        }
    }
}

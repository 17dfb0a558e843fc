use thiserror::Error;

/// Raw frame produced by a video source.
#[derive(Clone, Debug)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp_ms: i64,
    pub format: FrameFormat,
}

impl Frame {
    /// Allocate a zeroed frame sized for `format`.
    pub fn zeroed(width: u32, height: u32, format: FrameFormat) -> Self {
        Self {
            data: vec![0; format.frame_len(width, height)],
            width,
            height,
            timestamp_ms: 0,
            format,
        }
    }

    /// Wrap an existing buffer, checking that its length matches the layout.
    pub fn from_vec(
        data: Vec<u8>,
        width: u32,
        height: u32,
        format: FrameFormat,
    ) -> Result<Self, CaptureError> {
        let expected = format.frame_len(width, height);
        if data.len() != expected {
            return Err(CaptureError::FrameSize {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            timestamp_ms: 0,
            format,
        })
    }

    pub fn with_timestamp(mut self, timestamp_ms: i64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty() || self.width == 0 || self.height == 0
    }
}

/// Pixel layout of a [`Frame`] buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrameFormat {
    /// Packed 8-bit BGR, the native order of most decoders.
    Bgr8,
    /// Packed 8-bit RGB.
    Rgb8,
    /// Semi-planar YUV 4:2:0, interleaved UV plane.
    Nv12,
    /// Semi-planar YUV 4:2:0, interleaved VU plane.
    Nv21,
    /// Packed 8-bit RGBA.
    Rgba8,
    /// Single 8-bit luma channel.
    Gray8,
}

impl FrameFormat {
    /// Byte length of a `width`×`height` image in this layout.
    pub fn frame_len(self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            FrameFormat::Bgr8 | FrameFormat::Rgb8 => pixels * 3,
            FrameFormat::Nv12 | FrameFormat::Nv21 => {
                let chroma = (width as usize).div_ceil(2) * (height as usize).div_ceil(2);
                pixels + 2 * chroma
            }
            FrameFormat::Rgba8 => pixels * 4,
            FrameFormat::Gray8 => pixels,
        }
    }

    /// Packed three-channel layouts that can be drawn on and resized directly.
    pub fn is_packed_rgb(self) -> bool {
        matches!(self, FrameFormat::Bgr8 | FrameFormat::Rgb8)
    }

    /// The `-pix_fmt` name understood by ffmpeg.
    pub fn ffmpeg_pix_fmt(self) -> &'static str {
        match self {
            FrameFormat::Bgr8 => "bgr24",
            FrameFormat::Rgb8 => "rgb24",
            FrameFormat::Nv12 => "nv12",
            FrameFormat::Nv21 => "nv21",
            FrameFormat::Rgba8 => "rgba",
            FrameFormat::Gray8 => "gray",
        }
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?}")]
    Open { uri: String },
    #[error("could not determine stream geometry for {uri:?}: {reason}")]
    Probe { uri: String, reason: String },
    #[error("frame buffer holds {actual} bytes, layout needs {expected}")]
    FrameSize { expected: usize, actual: usize },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_len_matches_layouts() {
        assert_eq!(FrameFormat::Bgr8.frame_len(640, 480), 640 * 480 * 3);
        assert_eq!(FrameFormat::Nv12.frame_len(640, 480), 640 * 480 * 3 / 2);
        assert_eq!(FrameFormat::Nv12.frame_len(3, 3), 9 + 2 * 2 * 2);
        assert_eq!(FrameFormat::Rgba8.frame_len(2, 2), 16);
        assert_eq!(FrameFormat::Gray8.frame_len(5, 4), 20);
    }

    #[test]
    fn from_vec_rejects_short_buffers() {
        let err = Frame::from_vec(vec![0; 10], 2, 2, FrameFormat::Bgr8).unwrap_err();
        assert!(matches!(
            err,
            CaptureError::FrameSize {
                expected: 12,
                actual: 10
            }
        ));
    }
}

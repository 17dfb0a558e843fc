use ml_core::Padding;

use crate::error::TransformError;

/// Fill colour for letterbox borders.
pub const PAD_COLOR: [u8; 3] = [128, 128, 128];

/// Aspect-preserving fit of a source image into a model input.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Letterbox {
    /// Model pixels per source pixel, on both axes.
    pub scale: f32,
    pub source: (u32, u32),
    pub resized: (u32, u32),
    pub target: (u32, u32),
    pub padding: Padding,
}

impl Letterbox {
    pub fn fit(src: (u32, u32), target: (u32, u32)) -> Self {
        if src == target {
            return Self::identity(target);
        }
        let scale = if src.0 == 0 || src.1 == 0 {
            0.0
        } else {
            (target.0 as f32 / src.0 as f32).min(target.1 as f32 / src.1 as f32)
        };
        let fit_axis = |len: u32, bound: u32| ((len as f32 * scale).round() as u32).clamp(1, bound.max(1));
        let resized = (fit_axis(src.0, target.0), fit_axis(src.1, target.1));

        let pad_w = target.0.saturating_sub(resized.0);
        let pad_h = target.1.saturating_sub(resized.1);
        Self {
            scale,
            source: src,
            resized,
            target,
            padding: Padding {
                left: pad_w / 2,
                right: pad_w - pad_w / 2,
                top: pad_h / 2,
                bottom: pad_h - pad_h / 2,
            },
        }
    }

    pub fn identity(size: (u32, u32)) -> Self {
        Self {
            scale: 1.0,
            source: size,
            resized: size,
            target: size,
            padding: Padding::default(),
        }
    }

    /// True only when the source already has the target size; a matching
    /// aspect ratio alone still needs a resize.
    pub fn is_identity(&self) -> bool {
        self.source == self.target
    }

    pub fn has_padding(&self) -> bool {
        self.resized != self.target
    }

    /// Place a packed 3-channel image of size `resized` onto a grey canvas of
    /// size `target`.
    pub fn compose(&self, resized: &[u8]) -> Result<Vec<u8>, TransformError> {
        let (rw, rh) = (self.resized.0 as usize, self.resized.1 as usize);
        let (tw, th) = (self.target.0 as usize, self.target.1 as usize);
        let expected = rw * rh * 3;
        if resized.len() != expected {
            return Err(TransformError::BufferSize {
                expected,
                actual: resized.len(),
            });
        }

        let mut canvas = PAD_COLOR.repeat(tw * th);
        let (left, top) = (self.padding.left as usize, self.padding.top as usize);
        for (row, line) in resized.chunks_exact(rw * 3).enumerate() {
            let start = ((top + row) * tw + left) * 3;
            canvas[start..start + line.len()].copy_from_slice(line);
        }
        Ok(canvas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wide_frame_pads_top_and_bottom() {
        let lb = Letterbox::fit((1920, 1080), (640, 640));
        assert_eq!(lb.resized, (640, 360));
        assert_eq!(
            lb.padding,
            Padding {
                left: 0,
                right: 0,
                top: 140,
                bottom: 140
            }
        );
        assert!((lb.scale - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn same_aspect_ratio_still_resizes() {
        let lb = Letterbox::fit((1280, 1280), (640, 640));
        assert!(!lb.is_identity());
        assert!(!lb.has_padding());
        assert_eq!(lb.resized, (640, 640));
        assert_eq!(lb.scale, 0.5);
        assert!(Letterbox::fit((640, 640), (640, 640)).is_identity());
    }

    #[test]
    fn odd_padding_puts_the_extra_pixel_on_the_far_side() {
        let lb = Letterbox::fit((10, 7), (10, 10));
        assert_eq!(lb.resized, (10, 7));
        assert_eq!((lb.padding.top, lb.padding.bottom), (1, 2));
    }

    #[test]
    fn compose_places_pixels_inside_grey_border() {
        let lb = Letterbox::fit((2, 1), (2, 2));
        assert_eq!(lb.padding.top, 0);
        assert_eq!(lb.padding.bottom, 1);
        let canvas = lb.compose(&[1, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(&canvas[..6], &[1, 2, 3, 4, 5, 6]);
        assert_eq!(&canvas[6..], &[128; 6]);
    }

    #[test]
    fn compose_rejects_mis_sized_input() {
        let lb = Letterbox::fit((4, 2), (4, 4));
        assert!(matches!(
            lb.compose(&[0; 5]),
            Err(TransformError::BufferSize { expected: 24, .. })
        ));
    }
}

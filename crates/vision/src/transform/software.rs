//! CPU colour conversion and resizing.

use image::{ImageBuffer, Rgb, imageops};
use video_ingest::{Frame, FrameFormat};

use crate::error::TransformError;

pub(crate) const BACKEND: &str = "software";

pub(crate) fn convert_color(frame: &Frame, to: FrameFormat) -> Result<Frame, TransformError> {
    let (w, h) = (frame.width as usize, frame.height as usize);
    let data = match (frame.format, to) {
        (from, to) if from == to => frame.data.clone(),
        (FrameFormat::Bgr8, FrameFormat::Rgb8) | (FrameFormat::Rgb8, FrameFormat::Bgr8) => {
            swap_red_blue(&frame.data)
        }
        (FrameFormat::Nv12 | FrameFormat::Nv21, FrameFormat::Bgr8 | FrameFormat::Rgb8) => {
            semi_planar_to_packed(&frame.data, w, h, frame.format == FrameFormat::Nv21, to == FrameFormat::Bgr8)
        }
        (FrameFormat::Rgba8, FrameFormat::Rgb8 | FrameFormat::Bgr8) => frame
            .data
            .chunks_exact(4)
            .flat_map(|px| match to {
                FrameFormat::Bgr8 => [px[2], px[1], px[0]],
                _ => [px[0], px[1], px[2]],
            })
            .collect(),
        (FrameFormat::Gray8, FrameFormat::Rgb8 | FrameFormat::Bgr8) => {
            frame.data.iter().flat_map(|&y| [y, y, y]).collect()
        }
        _ => {
            return Err(TransformError::UnsupportedFormat {
                format: to,
                backend: BACKEND,
            });
        }
    };
    Ok(Frame {
        data,
        width: frame.width,
        height: frame.height,
        timestamp_ms: frame.timestamp_ms,
        format: to,
    })
}

/// Bilinear resize of a packed 3-channel frame. Channel order is preserved.
pub(crate) fn resize(frame: &Frame, width: u32, height: u32) -> Result<Frame, TransformError> {
    if !frame.format.is_packed_rgb() {
        return Err(TransformError::UnsupportedFormat {
            format: frame.format,
            backend: BACKEND,
        });
    }
    let view = ImageBuffer::<Rgb<u8>, &[u8]>::from_raw(frame.width, frame.height, &frame.data[..])
        .ok_or(TransformError::BufferSize {
            expected: frame.format.frame_len(frame.width, frame.height),
            actual: frame.data.len(),
        })?;
    let resized = imageops::resize(&view, width, height, imageops::FilterType::Triangle);
    Ok(Frame {
        data: resized.into_raw(),
        width,
        height,
        timestamp_ms: frame.timestamp_ms,
        format: frame.format,
    })
}

fn swap_red_blue(data: &[u8]) -> Vec<u8> {
    let mut out = data.to_vec();
    for px in out.chunks_exact_mut(3) {
        px.swap(0, 2);
    }
    out
}

/// BT.601 limited-range YUV 4:2:0 semi-planar to packed RGB/BGR.
fn semi_planar_to_packed(data: &[u8], w: usize, h: usize, vu_order: bool, bgr: bool) -> Vec<u8> {
    let (luma, chroma) = data.split_at(w * h);
    let chroma_stride = w.div_ceil(2) * 2;
    let mut out = Vec::with_capacity(w * h * 3);
    for y in 0..h {
        for x in 0..w {
            let c = luma[y * w + x] as i32 - 16;
            let pair = (y / 2) * chroma_stride + (x / 2) * 2;
            let (first, second) = (chroma[pair] as i32 - 128, chroma[pair + 1] as i32 - 128);
            let (d, e) = if vu_order { (second, first) } else { (first, second) };

            let r = clamp_u8((298 * c + 409 * e + 128) >> 8);
            let g = clamp_u8((298 * c - 100 * d - 208 * e + 128) >> 8);
            let b = clamp_u8((298 * c + 516 * d + 128) >> 8);
            if bgr {
                out.extend_from_slice(&[b, g, r]);
            } else {
                out.extend_from_slice(&[r, g, b]);
            }
        }
    }
    out
}

fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(data: Vec<u8>, w: u32, h: u32, format: FrameFormat) -> Frame {
        Frame::from_vec(data, w, h, format).unwrap()
    }

    #[test]
    fn bgr_and_rgb_swap_channels() {
        let bgr = frame(vec![1, 2, 3, 4, 5, 6], 2, 1, FrameFormat::Bgr8);
        let rgb = convert_color(&bgr, FrameFormat::Rgb8).unwrap();
        assert_eq!(rgb.data, vec![3, 2, 1, 6, 5, 4]);
        assert_eq!(rgb.format, FrameFormat::Rgb8);
    }

    #[test]
    fn nv12_black_white_and_blue() {
        // 2x2 luma, one chroma pair.
        let black = frame(vec![16, 16, 16, 16, 128, 128], 2, 2, FrameFormat::Nv12);
        let out = convert_color(&black, FrameFormat::Bgr8).unwrap();
        assert!(out.data.iter().all(|&v| v == 0));

        let white = frame(vec![235, 235, 235, 235, 128, 128], 2, 2, FrameFormat::Nv12);
        let out = convert_color(&white, FrameFormat::Rgb8).unwrap();
        assert!(out.data.iter().all(|&v| v == 255));

        let blue = frame(vec![41, 41, 41, 41, 240, 110], 2, 2, FrameFormat::Nv12);
        let out = convert_color(&blue, FrameFormat::Bgr8).unwrap();
        assert!(out.data[0] > 200 && out.data[2] < 30, "{:?}", &out.data[..3]);

        // Same chroma bytes read as NV21 swap the roles of U and V.
        let red = frame(vec![41, 41, 41, 41, 240, 110], 2, 2, FrameFormat::Nv21);
        let out = convert_color(&red, FrameFormat::Rgb8).unwrap();
        assert!(out.data[0] > 150 && out.data[2] < 30, "{:?}", &out.data[..3]);
    }

    #[test]
    fn odd_sized_nv12_uses_rounded_chroma() {
        let len = FrameFormat::Nv12.frame_len(3, 3);
        let mut data = vec![16; 9];
        data.resize(len, 128);
        let out = convert_color(&frame(data, 3, 3, FrameFormat::Nv12), FrameFormat::Bgr8).unwrap();
        assert_eq!(out.data.len(), 27);
    }

    #[test]
    fn cannot_convert_into_semi_planar() {
        let bgr = frame(vec![0; 12], 2, 2, FrameFormat::Bgr8);
        assert!(matches!(
            convert_color(&bgr, FrameFormat::Nv12),
            Err(TransformError::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn resize_keeps_uniform_colour_and_order() {
        let src = frame([10u8, 20, 30].repeat(16), 4, 4, FrameFormat::Bgr8);
        let out = resize(&src, 2, 3).unwrap();
        assert_eq!((out.width, out.height, out.format), (2, 3, FrameFormat::Bgr8));
        assert_eq!(out.data, [10u8, 20, 30].repeat(6));
    }
}

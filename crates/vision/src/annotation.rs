//! Box and label drawing on packed 3-channel frames, in the frame's own
//! channel order.

use image::{ImageBuffer, Rgb};
use ml_core::Detection;
use video_ingest::{Frame, FrameFormat};

pub const BOX_COLOR: Rgb<u8> = Rgb([0, 0, 255]);
pub const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const LABEL_BACKGROUND: Rgb<u8> = Rgb([0, 0, 0]);

const GLYPH_ADVANCE: i32 = 6;
const GLYPH_HEIGHT: i32 = 7;
const BOX_THICKNESS: i32 = 2;

type Canvas<'a> = ImageBuffer<Rgb<u8>, &'a mut [u8]>;

/// Draw every detection onto `frame`. Returns `false` (and leaves the frame
/// untouched) when the frame is not packed RGB/BGR.
pub fn annotate(frame: &mut Frame, detections: &[Detection]) -> bool {
    let format = frame.format;
    let Some(mut canvas) = canvas(frame) else {
        return false;
    };
    let (width, height) = canvas.dimensions();
    let max_x = width.saturating_sub(1) as f32;
    let max_y = height.saturating_sub(1) as f32;

    for det in detections {
        let [l, t, r, b] = det.bbox_xyxy;
        let (left, top) = (l.clamp(0.0, max_x) as i32, t.clamp(0.0, max_y) as i32);
        let (right, bottom) = (r.clamp(0.0, max_x) as i32, b.clamp(0.0, max_y) as i32);
        for inset in 0..BOX_THICKNESS {
            draw_rectangle(
                &mut canvas,
                left + inset,
                top + inset,
                right - inset,
                bottom - inset,
                native(BOX_COLOR, format),
            );
        }

        let text = format!("{} {:.0}%", det.label, det.score * 100.0);
        let label_y = (top - GLYPH_HEIGHT - 3).max(0);
        fill_rect(
            &mut canvas,
            left,
            label_y,
            left + text_width(&text),
            label_y + GLYPH_HEIGHT + 1,
            LABEL_BACKGROUND,
        );
        draw_label(&mut canvas, left + 1, label_y + 1, &text, native(TEXT_COLOR, format));
    }
    true
}

/// Write `text` at (`x`, `y`) with the built-in 5x7 font.
pub fn draw_text(frame: &mut Frame, x: i32, y: i32, text: &str, color: Rgb<u8>) -> bool {
    let format = frame.format;
    let Some(mut canvas) = canvas(frame) else {
        return false;
    };
    draw_label(&mut canvas, x, y, text, native(color, format));
    true
}

pub fn text_width(text: &str) -> i32 {
    text.chars().count() as i32 * GLYPH_ADVANCE
}

fn canvas(frame: &mut Frame) -> Option<Canvas<'_>> {
    if !frame.format.is_packed_rgb() {
        return None;
    }
    ImageBuffer::from_raw(frame.width, frame.height, frame.data.as_mut_slice())
}

fn native(color: Rgb<u8>, format: FrameFormat) -> Rgb<u8> {
    match format {
        FrameFormat::Bgr8 => Rgb([color[2], color[1], color[0]]),
        _ => color,
    }
}

fn put(canvas: &mut Canvas<'_>, x: i32, y: i32, color: Rgb<u8>) {
    if x >= 0 && y >= 0 && (x as u32) < canvas.width() && (y as u32) < canvas.height() {
        canvas.put_pixel(x as u32, y as u32, color);
    }
}

fn draw_rectangle(canvas: &mut Canvas<'_>, left: i32, top: i32, right: i32, bottom: i32, color: Rgb<u8>) {
    if left > right || top > bottom {
        return;
    }
    for x in left..=right {
        put(canvas, x, top, color);
        put(canvas, x, bottom, color);
    }
    for y in top..=bottom {
        put(canvas, left, y, color);
        put(canvas, right, y, color);
    }
}

fn fill_rect(canvas: &mut Canvas<'_>, left: i32, top: i32, right: i32, bottom: i32, color: Rgb<u8>) {
    for y in top..=bottom {
        for x in left..=right {
            put(canvas, x, y, color);
        }
    }
}

fn draw_label(canvas: &mut Canvas<'_>, mut x: i32, y: i32, text: &str, color: Rgb<u8>) {
    for ch in text.chars().flat_map(char::to_uppercase) {
        if let Some(glyph) = glyph_bits(ch) {
            for (row, pattern) in glyph.iter().enumerate() {
                for col in 0..5 {
                    if (pattern >> (4 - col)) & 1 == 1 {
                        put(canvas, x + col, y + row as i32, color);
                    }
                }
            }
        }
        x += GLYPH_ADVANCE;
    }
}

#[rustfmt::skip]
fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    Some(match ch {
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'B' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110],
        'C' => [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110],
        'D' => [0b11100, 0b10010, 0b10001, 0b10001, 0b10001, 0b10010, 0b11100],
        'E' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b11111],
        'F' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000],
        'G' => [0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111],
        'H' => [0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'I' => [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        'J' => [0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100],
        'K' => [0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001],
        'L' => [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111],
        'M' => [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001],
        'N' => [0b10001, 0b10001, 0b11001, 0b10101, 0b10011, 0b10001, 0b10001],
        'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'P' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000],
        'Q' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10101, 0b10010, 0b01101],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        'S' => [0b01111, 0b10000, 0b10000, 0b01110, 0b00001, 0b00001, 0b11110],
        'T' => [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100],
        'U' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'V' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100],
        'W' => [0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b10101, 0b01010],
        'X' => [0b10001, 0b10001, 0b01010, 0b00100, 0b01010, 0b10001, 0b10001],
        'Y' => [0b10001, 0b10001, 0b01010, 0b00100, 0b00100, 0b00100, 0b00100],
        'Z' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b11111],
        '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
        '1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
        '3' => [0b11110, 0b00001, 0b00001, 0b01110, 0b00001, 0b00001, 0b11110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
        '%' => [0b11001, 0b11010, 0b00010, 0b00100, 0b01000, 0b01011, 0b10011],
        '.' => [0, 0, 0, 0, 0, 0b01100, 0b01100],
        ':' => [0, 0b01100, 0b01100, 0, 0b01100, 0b01100, 0],
        '-' => [0, 0, 0, 0b11111, 0, 0, 0],
        ' ' => [0; 7],
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(bbox: [f32; 4]) -> Detection {
        Detection {
            bbox_xyxy: bbox,
            score: 0.9,
            class_id: 0,
            label: "person".into(),
        }
    }

    fn pixel(frame: &Frame, x: u32, y: u32) -> [u8; 3] {
        let i = ((y * frame.width + x) * 3) as usize;
        [frame.data[i], frame.data[i + 1], frame.data[i + 2]]
    }

    #[test]
    fn boxes_use_native_channel_order() {
        let mut bgr = Frame::zeroed(32, 32, FrameFormat::Bgr8);
        assert!(annotate(&mut bgr, &[detection([10.0, 12.0, 20.0, 25.0])]));
        assert_eq!(pixel(&bgr, 15, 25), [255, 0, 0]);

        let mut rgb = Frame::zeroed(32, 32, FrameFormat::Rgb8);
        annotate(&mut rgb, &[detection([10.0, 12.0, 20.0, 25.0])]);
        assert_eq!(pixel(&rgb, 15, 25), [0, 0, 255]);
        // Interior stays untouched.
        assert_eq!(pixel(&rgb, 15, 18), [0, 0, 0]);
    }

    #[test]
    fn out_of_frame_boxes_are_clamped() {
        let mut frame = Frame::zeroed(16, 16, FrameFormat::Rgb8);
        assert!(annotate(&mut frame, &[detection([-40.0, -3.0, 400.0, 90.0])]));
        assert_eq!(pixel(&frame, 15, 15), [0, 0, 255]);
    }

    #[test]
    fn semi_planar_frames_are_left_alone() {
        let mut frame = Frame::zeroed(4, 4, FrameFormat::Nv12);
        let before = frame.data.clone();
        assert!(!annotate(&mut frame, &[detection([0.0, 0.0, 3.0, 3.0])]));
        assert_eq!(frame.data, before);
    }

    #[test]
    fn text_draws_known_glyphs() {
        let mut frame = Frame::zeroed(40, 10, FrameFormat::Rgb8);
        assert!(draw_text(&mut frame, 0, 0, "fps 30", TEXT_COLOR));
        // Top bar of 'F'.
        assert_eq!(pixel(&frame, 0, 0), [255, 255, 255]);
        assert_eq!(text_width("fps 30"), 36);
    }
}

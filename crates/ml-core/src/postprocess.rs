use std::cmp::Ordering;

use tracing::debug;

use crate::runtime::RawOutput;

/// Upper bound on boxes reported for one frame.
pub const MAX_DETECTIONS: usize = 64;

pub const COCO_LABELS: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich", "orange",
    "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch", "potted plant",
    "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote", "keyboard", "cell phone",
    "microwave", "oven", "toaster", "sink", "refrigerator", "book", "clock", "vase", "scissors",
    "teddy bear", "hair drier", "toothbrush",
];

/// Single detection in source-frame pixel coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    /// `[left, top, right, bottom]`.
    pub bbox_xyxy: [f32; 4],
    pub score: f32,
    pub class_id: usize,
    pub label: String,
}

/// Letterbox padding applied in front of the model, in model pixels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Padding {
    pub left: u32,
    pub right: u32,
    pub top: u32,
    pub bottom: u32,
}

/// Everything needed to map model-space boxes back onto the source frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DecodeParams {
    pub model_width: u32,
    pub model_height: u32,
    pub padding: Padding,
    /// Model pixels per source pixel, horizontally.
    pub scale_w: f32,
    pub scale_h: f32,
    pub conf_threshold: f32,
    pub nms_threshold: f32,
}

pub trait PostProcess: Send + Sync {
    fn decode(&self, outputs: &[RawOutput], params: &DecodeParams) -> Vec<Detection>;
}

/// Three-head anchor-based YOLOv5 decoder over quantised NCHW outputs.
#[derive(Clone, Debug)]
pub struct Yolov5PostProcess {
    anchors: [[f32; 6]; 3],
    labels: Vec<String>,
}

impl Default for Yolov5PostProcess {
    fn default() -> Self {
        Self::with_labels(COCO_LABELS.iter().map(|s| s.to_string()).collect())
    }
}

#[derive(Clone, Copy, Debug)]
struct Candidate {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    score: f32,
    class_id: usize,
}

impl Yolov5PostProcess {
    pub fn with_labels(labels: Vec<String>) -> Self {
        Self {
            anchors: [
                [10.0, 13.0, 16.0, 30.0, 33.0, 23.0],
                [30.0, 61.0, 62.0, 45.0, 59.0, 119.0],
                [116.0, 90.0, 156.0, 198.0, 373.0, 326.0],
            ],
            labels,
        }
    }

    pub fn class_count(&self) -> usize {
        self.labels.len()
    }

    fn decode_head(
        &self,
        output: &RawOutput,
        anchors: &[f32; 6],
        params: &DecodeParams,
        candidates: &mut Vec<Candidate>,
    ) {
        let (grid_h, grid_w) = match output.dims.as_slice() {
            [_, _, h, w] => (*h as usize, *w as usize),
            other => {
                debug!(dims = ?other, "skipping output head with unexpected rank");
                return;
            }
        };
        if grid_h == 0 || grid_w == 0 {
            return;
        }
        let classes = self.class_count();
        let prop = 5 + classes;
        let grid_len = grid_h * grid_w;
        if output.data.len() < 3 * prop * grid_len {
            debug!(
                len = output.data.len(),
                needed = 3 * prop * grid_len,
                "skipping truncated output head"
            );
            return;
        }
        let stride = params.model_height as f32 / grid_h as f32;
        let threshold = output.quantize(params.conf_threshold);
        let data = &output.data;
        let deq = |q: i8| output.dequantize(q);

        for a in 0..3 {
            for i in 0..grid_h {
                for j in 0..grid_w {
                    let base = a * prop * grid_len + i * grid_w + j;
                    let objectness = data[base + 4 * grid_len];
                    if objectness < threshold {
                        continue;
                    }

                    let (class_id, class_q) = (0..classes)
                        .map(|k| (k, data[base + (5 + k) * grid_len]))
                        .max_by_key(|(_, q)| *q)
                        .unwrap_or((0, i8::MIN));
                    if class_q <= threshold {
                        continue;
                    }

                    let cx = (deq(data[base]) * 2.0 - 0.5 + j as f32) * stride;
                    let cy = (deq(data[base + grid_len]) * 2.0 - 0.5 + i as f32) * stride;
                    let w = (deq(data[base + 2 * grid_len]) * 2.0).powi(2) * anchors[a * 2];
                    let h = (deq(data[base + 3 * grid_len]) * 2.0).powi(2) * anchors[a * 2 + 1];
                    candidates.push(Candidate {
                        x1: cx - w / 2.0,
                        y1: cy - h / 2.0,
                        x2: cx + w / 2.0,
                        y2: cy + h / 2.0,
                        score: deq(class_q) * deq(objectness),
                        class_id,
                    });
                }
            }
        }
    }

    fn to_frame(&self, c: &Candidate, params: &DecodeParams) -> Detection {
        let (mw, mh) = (params.model_width as f32, params.model_height as f32);
        let pad = params.padding;
        let map_x = |x: f32| (x.clamp(0.0, mw) - pad.left as f32) / params.scale_w;
        let map_y = |y: f32| (y.clamp(0.0, mh) - pad.top as f32) / params.scale_h;
        Detection {
            bbox_xyxy: [map_x(c.x1), map_y(c.y1), map_x(c.x2), map_y(c.y2)],
            score: c.score,
            class_id: c.class_id,
            label: self
                .labels
                .get(c.class_id)
                .cloned()
                .unwrap_or_else(|| format!("class{}", c.class_id)),
        }
    }
}

impl PostProcess for Yolov5PostProcess {
    fn decode(&self, outputs: &[RawOutput], params: &DecodeParams) -> Vec<Detection> {
        let mut candidates = Vec::new();
        for (output, anchors) in outputs.iter().zip(self.anchors.iter()) {
            self.decode_head(output, anchors, params, &mut candidates);
        }
        if candidates.is_empty() {
            return Vec::new();
        }

        candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        let kept = nms(&candidates, params.nms_threshold);
        kept.into_iter()
            .take(MAX_DETECTIONS)
            .map(|idx| self.to_frame(&candidates[idx], params))
            .collect()
    }
}

/// Per-class greedy suppression over score-sorted candidates.
fn nms(sorted: &[Candidate], threshold: f32) -> Vec<usize> {
    let mut suppressed = vec![false; sorted.len()];
    let mut kept = Vec::new();
    for i in 0..sorted.len() {
        if suppressed[i] {
            continue;
        }
        kept.push(i);
        for j in (i + 1)..sorted.len() {
            if !suppressed[j]
                && sorted[j].class_id == sorted[i].class_id
                && iou(&sorted[i], &sorted[j]) > threshold
            {
                suppressed[j] = true;
            }
        }
    }
    kept
}

fn iou(a: &Candidate, b: &Candidate) -> f32 {
    let w = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0.0);
    let h = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0.0);
    let inter = w * h;
    let union = (a.x2 - a.x1) * (a.y2 - a.y1) + (b.x2 - b.x1) * (b.y2 - b.y1) - inter;
    if union <= 0.0 { 0.0 } else { inter / union }
}

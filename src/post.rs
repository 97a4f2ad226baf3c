use crate::packets::{BBox, Detection};

/// Decode/NMS parameters for the YOLO head.
#[derive(Debug, Clone, Copy)]
pub struct YoloPostConfig {
    pub num_classes: usize,
    pub confidence_threshold: f32,
    pub nms_threshold: f32,
    pub max_detections: usize,
    pub letterbox_scale: f32,
    pub letterbox_pad: (f32, f32),
    pub original_size: (u32, u32),
}

/// Decodes raw YOLO predictions (cx cy w h obj cls...) into detections in the
/// original pixel frame, then applies class-wise NMS. Confidence is post-NMS
/// objectness * class score.
pub fn postprocess_yolo(predictions: &[f32], cfg: &YoloPostConfig) -> Vec<Detection> {
    let decoded = decode_predictions(predictions, cfg);
    apply_nms(decoded, cfg)
}

fn decode_predictions(predictions: &[f32], cfg: &YoloPostConfig) -> Vec<Detection> {
    let stride = 5 + cfg.num_classes;
    let inv_scale = if cfg.letterbox_scale > 0.0 {
        1.0 / cfg.letterbox_scale
    } else {
        1.0
    };
    let (pad_x, pad_y) = cfg.letterbox_pad;
    let (orig_w, orig_h) = (cfg.original_size.0 as f32, cfg.original_size.1 as f32);

    predictions
        .chunks(stride)
        .filter_map(|chunk| {
            if chunk.len() < stride {
                return None;
            }

            let objectness = sigmoid(chunk[4]);
            let (best_class, class_conf) = best_class(chunk[5..].iter().copied());
            let score = objectness * class_conf;
            if score < cfg.confidence_threshold {
                return None;
            }

            let cx = chunk[0];
            let cy = chunk[1];
            let w = chunk[2].abs();
            let h = chunk[3].abs();

            let mut left = cx - w * 0.5 - pad_x;
            let mut top = cy - h * 0.5 - pad_y;
            let mut right = cx + w * 0.5 - pad_x;
            let mut bottom = cy + h * 0.5 - pad_y;

            left = (left * inv_scale).clamp(0.0, orig_w);
            top = (top * inv_scale).clamp(0.0, orig_h);
            right = (right * inv_scale).clamp(0.0, orig_w);
            bottom = (bottom * inv_scale).clamp(0.0, orig_h);

            if right - left <= 0.0 || bottom - top <= 0.0 {
                return None;
            }

            Some(Detection {
                class_id: best_class as i32,
                bbox: BBox {
                    x1: left,
                    y1: top,
                    x2: right,
                    y2: bottom,
                },
                confidence: score,
            })
        })
        .collect()
}

fn apply_nms(mut candidates: Vec<Detection>, cfg: &YoloPostConfig) -> Vec<Detection> {
    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut retained: Vec<Detection> = Vec::new();
    for cand in candidates {
        let suppressed = retained.iter().any(|kept| {
            kept.class_id == cand.class_id && iou(&kept.bbox, &cand.bbox) > cfg.nms_threshold
        });
        if !suppressed {
            retained.push(cand);
            if retained.len() >= cfg.max_detections.max(1) {
                break;
            }
        }
    }
    retained
}

fn iou(a: &BBox, b: &BBox) -> f32 {
    let ix = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0.0);
    let iy = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0.0);
    let inter = ix * iy;
    let union = a.width() * a.height() + b.width() * b.height() - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

fn best_class(scores: impl Iterator<Item = f32>) -> (usize, f32) {
    scores
        .enumerate()
        .map(|(idx, score)| (idx, sigmoid(score)))
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        .unwrap_or((0, 0.0))
}

#[inline]
fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

// YOLO-seg output decode: confidence filter, greedy NMS, prototype mask
// assembly. Pure tensor math; session handling lives in `segmenter`.

use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::{ArrayView2, ArrayView3};

/// Class channels in the detection head (COCO export).
pub const NUM_CLASSES: usize = 80;
/// Leading channels holding cx, cy, w, h.
pub const BBOX_CHANNELS: usize = 4;

/// Axis-aligned box in model input coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }
}

/// One detection candidate with its mask coefficients.
#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: BBox,
    pub confidence: f32,
    pub class_id: usize,
    pub mask_coeffs: Vec<f32>,
}

/// Intersection over union of two boxes, 0.0 for degenerate boxes.
pub fn iou(a: &BBox, b: &BBox) -> f32 {
    let area_a = a.area();
    let area_b = b.area();
    if area_a <= 0.0 || area_b <= 0.0 {
        return 0.0;
    }

    let ix1 = a.x1.max(b.x1);
    let iy1 = a.y1.max(b.y1);
    let ix2 = a.x2.min(b.x2);
    let iy2 = a.y2.min(b.y2);

    let iw = (ix2 - ix1).max(0.0);
    let ih = (iy2 - iy1).max(0.0);
    let intersection = iw * ih;
    if intersection <= 0.0 {
        return 0.0;
    }
    intersection / (area_a + area_b - intersection)
}

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Decode the `[channels, anchors]` detection head into candidates above
/// the confidence threshold. Channel layout: 4 box values (cx, cy, w, h in
/// input pixels), `NUM_CLASSES` class scores, then mask coefficients. Box
/// corners are clamped to the input square.
pub fn decode_candidates(
    pred: &ArrayView2<f32>,
    confidence_threshold: f32,
    input_size: f32,
) -> Vec<Detection> {
    let channels = pred.shape()[0];
    let anchors = pred.shape()[1];
    if channels < BBOX_CHANNELS + NUM_CLASSES {
        return Vec::new();
    }
    let num_coeffs = channels - BBOX_CHANNELS - NUM_CLASSES;

    let mut candidates = Vec::new();
    for anchor in 0..anchors {
        let mut best_score = 0.0f32;
        let mut best_class = 0usize;
        for class in 0..NUM_CLASSES {
            let score = pred[[BBOX_CHANNELS + class, anchor]];
            if score > best_score {
                best_score = score;
                best_class = class;
            }
        }
        if best_score <= confidence_threshold {
            continue;
        }

        let cx = pred[[0, anchor]];
        let cy = pred[[1, anchor]];
        let w = pred[[2, anchor]];
        let h = pred[[3, anchor]];
        let bbox = BBox {
            x1: (cx - w / 2.0).clamp(0.0, input_size),
            y1: (cy - h / 2.0).clamp(0.0, input_size),
            x2: (cx + w / 2.0).clamp(0.0, input_size),
            y2: (cy + h / 2.0).clamp(0.0, input_size),
        };

        let mask_coeffs = (0..num_coeffs)
            .map(|k| pred[[BBOX_CHANNELS + NUM_CLASSES + k, anchor]])
            .collect();

        candidates.push(Detection {
            bbox,
            confidence: best_score,
            class_id: best_class,
            mask_coeffs,
        });
    }
    candidates
}

/// Greedy non-maximum suppression, highest confidence first, capped at
/// `max_detections` survivors.
pub fn non_max_suppression(
    mut candidates: Vec<Detection>,
    iou_threshold: f32,
    max_detections: usize,
) -> Vec<Detection> {
    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut suppressed = vec![false; candidates.len()];
    let mut kept = Vec::new();
    for i in 0..candidates.len() {
        if suppressed[i] {
            continue;
        }
        if kept.len() >= max_detections {
            break;
        }
        for j in (i + 1)..candidates.len() {
            if !suppressed[j] && iou(&candidates[i].bbox, &candidates[j].bbox) > iou_threshold {
                suppressed[j] = true;
            }
        }
        kept.push(candidates[i].clone());
    }
    kept
}

/// Assemble one combined binary mask from the prototype tensor
/// `[num_protos, proto_h, proto_w]`.
///
/// Per detection: mask = sigmoid(coeffs · protos), evaluated only inside the
/// detection box (mapped into prototype coordinates), binarized at 0.5.
/// Instances are OR-combined at prototype resolution, then the result is
/// resized to the frame with nearest-neighbor so values stay in {0, 255}.
pub fn combine_masks(
    detections: &[Detection],
    protos: &ArrayView3<f32>,
    input_size: f32,
    frame_width: u32,
    frame_height: u32,
) -> GrayImage {
    let num_protos = protos.shape()[0];
    let proto_h = protos.shape()[1];
    let proto_w = protos.shape()[2];

    let mut combined = GrayImage::new(proto_w as u32, proto_h as u32);
    let sx = proto_w as f32 / input_size;
    let sy = proto_h as f32 / input_size;

    for det in detections {
        let coeffs = &det.mask_coeffs[..det.mask_coeffs.len().min(num_protos)];

        let x1 = (det.bbox.x1 * sx).floor().max(0.0) as usize;
        let y1 = (det.bbox.y1 * sy).floor().max(0.0) as usize;
        let x2 = ((det.bbox.x2 * sx).ceil() as usize).min(proto_w);
        let y2 = ((det.bbox.y2 * sy).ceil() as usize).min(proto_h);

        for y in y1..y2 {
            for x in x1..x2 {
                let mut logit = 0.0f32;
                for (k, &c) in coeffs.iter().enumerate() {
                    logit += c * protos[[k, y, x]];
                }
                if sigmoid(logit) > 0.5 {
                    combined.put_pixel(x as u32, y as u32, image::Luma([255]));
                }
            }
        }
    }

    if combined.dimensions() != (frame_width, frame_height) {
        combined = imageops::resize(&combined, frame_width, frame_height, FilterType::Nearest);
    }
    combined
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, Array3};

    fn boxed(x1: f32, y1: f32, x2: f32, y2: f32) -> BBox {
        BBox { x1, y1, x2, y2 }
    }

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let a = boxed(10.0, 10.0, 50.0, 50.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = boxed(0.0, 0.0, 10.0, 10.0);
        let b = boxed(20.0, 20.0, 30.0, 30.0);
        assert_eq!(iou(&a, &b), 0.0);
    }

    #[test]
    fn iou_guards_zero_area_boxes() {
        let a = boxed(10.0, 10.0, 10.0, 50.0);
        let b = boxed(0.0, 0.0, 100.0, 100.0);
        assert_eq!(iou(&a, &b), 0.0);
    }

    #[test]
    fn iou_of_half_overlapping_boxes() {
        let a = boxed(0.0, 0.0, 10.0, 10.0);
        let b = boxed(5.0, 0.0, 15.0, 10.0);
        // intersection 50, union 150.
        assert!((iou(&a, &b) - 1.0 / 3.0).abs() < 1e-6);
    }

    /// Build a prediction array with the given anchors as
    /// (cx, cy, w, h, class0_score, coeff0).
    fn pred_with(anchors: &[(f32, f32, f32, f32, f32, f32)]) -> Array2<f32> {
        let channels = BBOX_CHANNELS + NUM_CLASSES + 1;
        let mut pred = Array2::zeros((channels, anchors.len()));
        for (i, &(cx, cy, w, h, score, coeff)) in anchors.iter().enumerate() {
            pred[[0, i]] = cx;
            pred[[1, i]] = cy;
            pred[[2, i]] = w;
            pred[[3, i]] = h;
            pred[[BBOX_CHANNELS, i]] = score;
            pred[[BBOX_CHANNELS + NUM_CLASSES, i]] = coeff;
        }
        pred
    }

    #[test]
    fn decode_keeps_only_confident_anchors() {
        let pred = pred_with(&[
            (100.0, 100.0, 40.0, 20.0, 0.9, 1.5),
            (200.0, 200.0, 40.0, 20.0, 0.1, 0.5),
        ]);
        let candidates = decode_candidates(&pred.view(), 0.35, 640.0);
        assert_eq!(candidates.len(), 1);
        let det = &candidates[0];
        assert_eq!(det.class_id, 0);
        assert_eq!(det.confidence, 0.9);
        assert_eq!(det.bbox, boxed(80.0, 90.0, 120.0, 110.0));
        assert_eq!(det.mask_coeffs, vec![1.5]);
    }

    #[test]
    fn decode_clamps_boxes_to_the_input_square() {
        let pred = pred_with(&[(630.0, 5.0, 40.0, 40.0, 0.8, 0.0)]);
        let candidates = decode_candidates(&pred.view(), 0.35, 640.0);
        let bbox = candidates[0].bbox;
        assert_eq!(bbox.y1, 0.0);
        assert_eq!(bbox.x2, 640.0);
    }

    #[test]
    fn nms_suppresses_overlapping_lower_confidence_boxes() {
        let pred = pred_with(&[
            (100.0, 100.0, 40.0, 40.0, 0.9, 0.0),
            (102.0, 101.0, 40.0, 40.0, 0.6, 0.0),
            (400.0, 400.0, 40.0, 40.0, 0.7, 0.0),
        ]);
        let candidates = decode_candidates(&pred.view(), 0.35, 640.0);
        let kept = non_max_suppression(candidates, 0.5, 300);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.9);
        assert_eq!(kept[1].confidence, 0.7);
    }

    #[test]
    fn nms_honors_the_detection_cap() {
        let pred = pred_with(&[
            (100.0, 100.0, 20.0, 20.0, 0.9, 0.0),
            (300.0, 300.0, 20.0, 20.0, 0.8, 0.0),
            (500.0, 500.0, 20.0, 20.0, 0.7, 0.0),
        ]);
        let candidates = decode_candidates(&pred.view(), 0.35, 640.0);
        let kept = non_max_suppression(candidates, 0.5, 2);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn combine_masks_binarizes_inside_the_box_and_resizes_nearest() {
        // One prototype channel, uniformly positive; a detection covering
        // the left half of the input square should light up the left half
        // of the mask.
        let protos = Array3::from_elem((1, 4, 4), 1.0f32);
        let det = Detection {
            bbox: boxed(0.0, 0.0, 320.0, 640.0),
            confidence: 0.9,
            class_id: 0,
            mask_coeffs: vec![2.0],
        };
        let mask = combine_masks(&[det], &protos.view(), 640.0, 8, 8);
        assert_eq!(mask.dimensions(), (8, 8));
        for y in 0..8 {
            for x in 0..8 {
                let expected = if x < 4 { 255 } else { 0 };
                assert_eq!(mask.get_pixel(x, y).0[0], expected, "at ({x},{y})");
            }
        }
    }

    #[test]
    fn combine_masks_with_no_detections_is_all_zero() {
        let protos = Array3::from_elem((1, 4, 4), 1.0f32);
        let mask = combine_masks(&[], &protos.view(), 640.0, 16, 12);
        assert_eq!(mask.dimensions(), (16, 12));
        assert!(mask.pixels().all(|p| p.0[0] == 0));
    }

    #[test]
    fn negative_coefficients_keep_pixels_off() {
        let protos = Array3::from_elem((1, 4, 4), 1.0f32);
        let det = Detection {
            bbox: boxed(0.0, 0.0, 640.0, 640.0),
            confidence: 0.9,
            class_id: 0,
            mask_coeffs: vec![-3.0],
        };
        let mask = combine_masks(&[det], &protos.view(), 640.0, 4, 4);
        assert!(mask.pixels().all(|p| p.0[0] == 0));
    }
}

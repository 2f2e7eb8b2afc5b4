//! SCRFD face detector via ONNX Runtime.
//!
//! Runs the 3-stride anchor-free SCRFD model on a letterboxed RGB image
//! and returns face boxes with five-point landmarks in source coordinates.

use std::path::Path;

use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;

use crate::onnx::{self, ModelError};
use crate::types::BoundingBox;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

/// Scale and padding applied when fitting the source into the model input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: u32, height: u32, target: u32) -> Self {
        let scale = (target as f32 / width as f32).min(target as f32 / height as f32);
        let new_w = (width as f32 * scale).round();
        let new_h = (height as f32 * scale).round();
        Self {
            scale,
            pad_x: ((target as f32 - new_w) / 2.0).floor(),
            pad_y: ((target as f32 - new_h) / 2.0).floor(),
        }
    }

    /// Map a point from model-input space back to source image space.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// (score, bbox, kps) output positions for one stride.
type StrideOutputIndices = (usize, usize, usize);

pub struct FaceDetector {
    session: Session,
    stride_indices: [StrideOutputIndices; 3],
}

impl FaceDetector {
    pub fn load(model_path: &Path) -> Result<Self, ModelError> {
        let session = onnx::open_session(model_path)?;

        let names = onnx::output_names(&session);
        if names.len() < SCRFD_STRIDES.len() * 3 {
            return Err(ModelError::BadOutput(format!(
                "SCRFD needs score/bbox/kps outputs for 3 strides, model has {}",
                names.len()
            )));
        }
        let stride_indices = discover_output_indices(&names);
        tracing::info!(path = %model_path.display(), ?stride_indices, "SCRFD model ready");

        Ok(Self { session, stride_indices })
    }

    /// Faces in `image`, strongest first.
    ///
    /// Equal-confidence detections keep scan order (stride, then row-major
    /// anchor position).
    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, ModelError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }

        let (input, letterbox) = preprocess(image);
        let stride_indices = self.stride_indices;
        let candidates = onnx::infer(&mut self.session, &input, |outputs| {
            let mut found = Vec::new();
            for (&stride, &(score_idx, bbox_idx, kps_idx)) in SCRFD_STRIDES.iter().zip(&stride_indices) {
                let scores = onnx::f32_output(outputs, score_idx, "scores")?;
                let bboxes = onnx::f32_output(outputs, bbox_idx, "bboxes")?;
                let kps = onnx::f32_output(outputs, kps_idx, "kps")?;
                found.extend(decode_stride(
                    scores,
                    bboxes,
                    kps,
                    stride,
                    &letterbox,
                    SCRFD_CONFIDENCE_THRESHOLD,
                ));
            }
            Ok(found)
        })?;

        let faces = nms(candidates, SCRFD_NMS_THRESHOLD);
        tracing::debug!(count = faces.len(), "SCRFD detections");
        Ok(faces)
    }
}

/// Letterbox an RGB image into a normalized 1×3×640×640 NCHW tensor.
///
/// Padding is filled with the mean, which normalizes to 0.0.
fn preprocess(image: &RgbImage) -> (Array4<f32>, Letterbox) {
    let size = SCRFD_INPUT_SIZE as usize;
    let letterbox = Letterbox::fit(image.width(), image.height(), SCRFD_INPUT_SIZE);

    let new_w = ((image.width() as f32 * letterbox.scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
    let new_h = ((image.height() as f32 * letterbox.scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

    let (off_x, off_y) = (letterbox.pad_x as usize, letterbox.pad_y as usize);
    let tensor = Array4::from_shape_fn((1, 3, size, size), |(_, c, y, x)| {
        let source = x
            .checked_sub(off_x)
            .zip(y.checked_sub(off_y))
            .and_then(|(sx, sy)| resized.get_pixel_checked(sx as u32, sy as u32));
        source.map_or(0.0, |p| (p[c] as f32 - SCRFD_MEAN) / SCRFD_STD)
    });

    (tensor, letterbox)
}

/// Discover output tensor ordering by name.
///
/// SCRFD exports either name their outputs `score_8`, `bbox_16`, `kps_32`, …
/// or use generic numeric names. Unrecognized names fall back to the standard
/// positional layout: [0-2] scores, [3-5] bboxes, [6-8] kps.
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let named: Option<Vec<StrideOutputIndices>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| Some((find("score", stride)?, find("bbox", stride)?, find("kps", stride)?)))
        .collect();

    match named {
        Some(v) => [v[0], v[1], v[2]],
        None => {
            tracing::debug!(?names, "SCRFD output names not recognized, using positional mapping");
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        }
    }
}

/// Decode detections for a single stride level.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    kps: &[f32],
    stride: usize,
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<BoundingBox> {
    let grid_w = SCRFD_INPUT_SIZE as usize / stride;
    let grid_h = SCRFD_INPUT_SIZE as usize / stride;
    let num_anchors = grid_h * grid_w * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;

    let mut detections = Vec::new();

    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }

        let cell = idx / SCRFD_ANCHORS_PER_CELL;
        let anchor_x = (cell % grid_w) as f32 * s;
        let anchor_y = (cell / grid_w) as f32 * s;

        let Some(offsets) = bboxes.get(idx * 4..idx * 4 + 4) else {
            continue;
        };
        let (x1, y1) = letterbox.unmap(anchor_x - offsets[0] * s, anchor_y - offsets[1] * s);
        let (x2, y2) = letterbox.unmap(anchor_x + offsets[2] * s, anchor_y + offsets[3] * s);

        let landmarks = kps.get(idx * 10..idx * 10 + 10).map(|points| {
            std::array::from_fn(|i| {
                letterbox.unmap(anchor_x + points[i * 2] * s, anchor_y + points[i * 2 + 1] * s)
            })
        });

        detections.push(BoundingBox {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence: score,
            landmarks,
        });
    }

    detections
}

/// Stable descending sort on confidence.
fn sort_by_confidence(faces: &mut [BoundingBox]) {
    faces.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
}

/// Greedy suppression: walk strongest first, drop anything overlapping a
/// kept box by more than `max_overlap`. Output stays strongest first.
fn nms(mut candidates: Vec<BoundingBox>, max_overlap: f32) -> Vec<BoundingBox> {
    sort_by_confidence(&mut candidates);
    candidates.into_iter().fold(Vec::new(), |mut kept, face| {
        if !kept.iter().any(|k: &BoundingBox| k.iou(&face) > max_overlap) {
            kept.push(face);
        }
        kept
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn make_bbox(x: f32, y: f32, w: f32, h: f32, conf: f32) -> BoundingBox {
        BoundingBox {
            x, y, width: w, height: h, confidence: conf, landmarks: None,
        }
    }

    #[test]
    fn test_nms_keeps_strongest_of_overlap() {
        let detections = vec![
            make_bbox(5.0, 5.0, 100.0, 100.0, 0.8),
            make_bbox(0.0, 0.0, 100.0, 100.0, 0.9),
            make_bbox(200.0, 200.0, 50.0, 50.0, 0.7),
        ];
        let result = nms(detections, 0.4);
        assert_eq!(result.len(), 2);
        assert!((result[0].confidence - 0.9).abs() < 1e-6);
        assert!((result[1].confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_confidence_sort_is_stable_for_ties() {
        let mut faces = vec![
            make_bbox(0.0, 0.0, 10.0, 10.0, 0.8),
            make_bbox(50.0, 0.0, 10.0, 10.0, 0.9),
            make_bbox(100.0, 0.0, 10.0, 10.0, 0.8),
        ];
        sort_by_confidence(&mut faces);
        assert_eq!(faces[0].x, 50.0);
        assert_eq!(faces[1].x, 0.0);
        assert_eq!(faces[2].x, 100.0);
    }

    #[test]
    fn test_letterbox_unmap_recovers_source_point() {
        let lb = Letterbox::fit(320, 240, SCRFD_INPUT_SIZE);
        let (sx, sy) = (100.0f32, 50.0f32);
        let (mx, my) = (sx * lb.scale + lb.pad_x, sy * lb.scale + lb.pad_y);
        let (rx, ry) = lb.unmap(mx, my);
        assert!((rx - sx).abs() < 0.1, "x: {rx} vs {sx}");
        assert!((ry - sy).abs() < 0.1, "y: {ry} vs {sy}");
    }

    #[test]
    fn test_preprocess_pads_with_zero_and_fills_content() {
        let image = RgbImage::from_pixel(320, 160, Rgb([255, 0, 128]));
        let (tensor, lb) = preprocess(&image);
        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        // 320×160 scales by 2 to 640×320, padded 160 rows top and bottom.
        assert!((lb.scale - 2.0).abs() < 1e-6);
        assert_eq!(lb.pad_y, 160.0);
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
        let red = tensor[[0, 0, 320, 320]];
        assert!((red - (255.0 - SCRFD_MEAN) / SCRFD_STD).abs() < 0.01);
        let green = tensor[[0, 1, 320, 320]];
        assert!((green - (0.0 - SCRFD_MEAN) / SCRFD_STD).abs() < 0.01);
    }

    #[test]
    fn test_decode_stride_maps_to_source_space() {
        let stride = 32;
        let cells = (640 / stride) * (640 / stride) * SCRFD_ANCHORS_PER_CELL;
        let mut scores = vec![0.0f32; cells];
        let bboxes = vec![1.0f32; cells * 4];
        let kps = vec![0.0f32; cells * 10];
        // Anchor index 2 → cell 1 → grid (x=1, y=0) → anchor at (32, 0).
        scores[2] = 0.95;

        let lb = Letterbox { scale: 1.0, pad_x: 0.0, pad_y: 0.0 };
        let dets = decode_stride(&scores, &bboxes, &kps, stride, &lb, 0.5);
        assert_eq!(dets.len(), 1);
        let d = &dets[0];
        assert_eq!(d.x, 0.0);
        assert_eq!(d.width, 64.0);
        assert_eq!(d.landmarks.unwrap()[0], (32.0, 0.0));
    }

    #[test]
    fn test_discover_output_indices_named() {
        let names: Vec<String> = [
            "bbox_8", "kps_8", "score_8",
            "bbox_16", "kps_16", "score_16",
            "bbox_32", "kps_32", "score_32",
        ].iter().map(|s| s.to_string()).collect();

        let indices = discover_output_indices(&names);
        assert_eq!(indices, [(2, 0, 1), (5, 3, 4), (8, 6, 7)]);
    }

    #[test]
    fn test_discover_output_indices_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i: usize| (400 + i).to_string()).collect();
        assert_eq!(discover_output_indices(&names), [(0, 3, 6), (1, 4, 7), (2, 5, 8)]);
    }
}

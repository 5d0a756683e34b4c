//! Deep-network face localization via ONNX Runtime.
//!
//! Runs an anchor-free multi-stride face detection model (SCRFD-family
//! export with score/bbox heads per stride). The accelerated variant is the
//! same graph committed with the CUDA execution provider.

use super::{DetectorError, FaceDetector};
use crate::imaging;
use crate::types::BoundingBox;
use ndarray::Array4;
use ort::execution_providers::CUDAExecutionProvider;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const DETECT_INPUT_SIZE: usize = 640;
const DETECT_MEAN: f32 = 127.5;
const DETECT_STD: f32 = 128.0;
const DETECT_CONFIDENCE_THRESHOLD: f32 = 0.5;
const DETECT_NMS_THRESHOLD: f32 = 0.4;
const DETECT_STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;

/// Output tensor indices for one stride: (score_idx, bbox_idx).
type StrideOutputs = (usize, usize);

pub struct DeepDetector {
    session: Session,
    input_size: usize,
    /// Per-stride (score, bbox) output indices for strides [8, 16, 32].
    stride_outputs: [StrideOutputs; 3],
}

impl DeepDetector {
    /// Load the detection model for CPU inference.
    pub fn load(model_path: &str, intra_threads: usize) -> Result<Self, DetectorError> {
        Self::load_inner(model_path, intra_threads, None)
    }

    /// Load the detection model with the CUDA execution provider registered.
    ///
    /// Provider registration failures surface as `DetectorError::Ort` so the
    /// caller can fall closed to another backend.
    pub fn load_accelerated(
        model_path: &str,
        intra_threads: usize,
        device_id: i32,
    ) -> Result<Self, DetectorError> {
        Self::load_inner(model_path, intra_threads, Some(device_id))
    }

    fn load_inner(
        model_path: &str,
        intra_threads: usize,
        cuda_device: Option<i32>,
    ) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let mut builder = Session::builder()?.with_intra_threads(intra_threads)?;
        if let Some(device_id) = cuda_device {
            builder = builder.with_execution_providers([CUDAExecutionProvider::default()
                .with_device_id(device_id)
                .build()])?;
        }
        let session = builder.commit_from_file(model_path)?;

        let output_names: Vec<String> =
            session.outputs().iter().map(|o| o.name().to_string()).collect();

        tracing::info!(
            path = model_path,
            cuda = cuda_device.is_some(),
            outputs = ?output_names,
            "loaded face detection model"
        );

        if output_names.len() < 6 {
            return Err(DetectorError::InferenceFailed(format!(
                "detection model needs 6 outputs (3 strides × score/bbox), got {}",
                output_names.len()
            )));
        }

        Ok(Self {
            session,
            input_size: DETECT_INPUT_SIZE,
            stride_outputs: map_stride_outputs(&output_names),
        })
    }

    /// Scale the frame to fit the square model input, anchored top-left, and
    /// build the normalized NCHW tensor. Returns the applied scale factor.
    fn preprocess(&self, rgb: &[u8], width: usize, height: usize) -> (Array4<f32>, f32) {
        let scale = (self.input_size as f32 / width as f32)
            .min(self.input_size as f32 / height as f32)
            .min(1.0);

        let new_w = ((width as f32 * scale).round() as usize).max(1);
        let new_h = ((height as f32 * scale).round() as usize).max(1);
        let resized = imaging::resize_rgb(rgb, width as u32, height as u32, new_w as u32, new_h as u32);

        let mut tensor = Array4::<f32>::zeros((1, 3, self.input_size, self.input_size));
        for y in 0..self.input_size {
            for x in 0..self.input_size {
                for c in 0..3 {
                    // Padding uses the mean so it normalizes to zero.
                    let pixel = if y < new_h && x < new_w {
                        resized[(y * new_w + x) * 3 + c] as f32
                    } else {
                        DETECT_MEAN
                    };
                    tensor[[0, c, y, x]] = (pixel - DETECT_MEAN) / DETECT_STD;
                }
            }
        }

        (tensor, scale)
    }
}

impl FaceDetector for DeepDetector {
    fn detect(
        &mut self,
        rgb: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<BoundingBox>, DetectorError> {
        if width == 0 || height == 0 || rgb.len() < (width * height * 3) as usize {
            return Ok(Vec::new());
        }

        let (input, scale) = self.preprocess(rgb, width as usize, height as usize);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut raw: Vec<Candidate> = Vec::new();
        for (pos, &stride) in DETECT_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = self.stride_outputs[pos];

            let (_, scores) = outputs[score_idx].try_extract_tensor::<f32>().map_err(|e| {
                DetectorError::InferenceFailed(format!("scores stride {stride}: {e}"))
            })?;
            let (_, bboxes) = outputs[bbox_idx].try_extract_tensor::<f32>().map_err(|e| {
                DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}"))
            })?;

            decode_stride(scores, bboxes, stride, self.input_size, scale, &mut raw);
        }

        let kept = nms(raw, DETECT_NMS_THRESHOLD);

        Ok(kept
            .into_iter()
            .map(|c| {
                BoundingBox::new(
                    c.y1.round() as i64,
                    c.x2.round() as i64,
                    c.y2.round() as i64,
                    c.x1.round() as i64,
                )
                .clamp_to(width, height)
            })
            .filter(BoundingBox::is_valid)
            .collect())
    }
}

/// Float candidate box in original-frame coordinates.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    score: f32,
}

impl Candidate {
    fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }
}

/// Map output tensors to (score, bbox) pairs per stride.
///
/// Exports either carry descriptive names ("score_8", "bbox_16", ...) or
/// generic numeric ones; the latter fall back to the conventional layout
/// [scores 8/16/32, bboxes 8/16/32].
fn map_stride_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let find = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let all_named = DETECT_STRIDES
        .iter()
        .all(|&s| find("score", s).is_some() && find("bbox", s).is_some());

    if all_named {
        std::array::from_fn(|i| {
            let stride = DETECT_STRIDES[i];
            // Both lookups were verified above.
            (find("score", stride).unwrap(), find("bbox", stride).unwrap())
        })
    } else {
        tracing::debug!(?names, "output names not recognized, using positional layout");
        [(0, 3), (1, 4), (2, 5)]
    }
}

/// Decode one stride level into frame-space candidates.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    stride: usize,
    input_size: usize,
    scale: f32,
    out: &mut Vec<Candidate>,
) {
    let grid = input_size / stride;
    let num_anchors = grid * grid * ANCHORS_PER_CELL;

    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= DETECT_CONFIDENCE_THRESHOLD {
            continue;
        }

        let cell = idx / ANCHORS_PER_CELL;
        let anchor_cx = (cell % grid) as f32 * stride as f32;
        let anchor_cy = (cell / grid) as f32 * stride as f32;

        let off = idx * 4;
        if off + 3 >= bboxes.len() {
            continue;
        }

        // Offsets are distances from the anchor center, in stride units.
        out.push(Candidate {
            x1: (anchor_cx - bboxes[off] * stride as f32) / scale,
            y1: (anchor_cy - bboxes[off + 1] * stride as f32) / scale,
            x2: (anchor_cx + bboxes[off + 2] * stride as f32) / scale,
            y2: (anchor_cy + bboxes[off + 3] * stride as f32) / scale,
            score,
        });
    }
}

fn iou(a: &Candidate, b: &Candidate) -> f32 {
    let inter_w = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0.0);
    let inter_h = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0.0);
    let inter = inter_w * inter_h;
    let union = a.area() + b.area() - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

/// Non-maximum suppression over score-sorted candidates.
fn nms(mut candidates: Vec<Candidate>, threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    let mut keep: Vec<Candidate> = Vec::new();
    for c in candidates {
        if keep.iter().all(|k| iou(k, &c) <= threshold) {
            keep.push(c);
        }
    }
    keep
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(x1: f32, y1: f32, x2: f32, y2: f32, score: f32) -> Candidate {
        Candidate { x1, y1, x2, y2, score }
    }

    #[test]
    fn test_iou_identical() {
        let c = candidate(0.0, 0.0, 100.0, 100.0, 1.0);
        assert!((iou(&c, &c) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_disjoint() {
        let a = candidate(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = candidate(20.0, 20.0, 30.0, 30.0, 1.0);
        assert!(iou(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_nms_drops_heavy_overlap() {
        let cands = vec![
            candidate(0.0, 0.0, 100.0, 100.0, 0.9),
            candidate(5.0, 5.0, 105.0, 105.0, 0.8),
            candidate(200.0, 200.0, 250.0, 250.0, 0.7),
        ];
        let kept = nms(cands, 0.4);
        assert_eq!(kept.len(), 2);
        assert!((kept[0].score - 0.9).abs() < 1e-6);
        assert!((kept[1].score - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_nms_empty() {
        assert!(nms(vec![], 0.4).is_empty());
    }

    #[test]
    fn test_map_stride_outputs_named() {
        let names: Vec<String> = ["score_8", "score_16", "score_32", "bbox_8", "bbox_16", "bbox_32"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(map_stride_outputs(&names), [(0, 3), (1, 4), (2, 5)]);
    }

    #[test]
    fn test_map_stride_outputs_shuffled_named() {
        let names: Vec<String> = ["bbox_8", "score_8", "bbox_16", "score_16", "bbox_32", "score_32"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(map_stride_outputs(&names), [(1, 0), (3, 2), (5, 4)]);
    }

    #[test]
    fn test_map_stride_outputs_positional_fallback() {
        let names: Vec<String> = (0..6).map(|i: usize| i.to_string()).collect();
        assert_eq!(map_stride_outputs(&names), [(0, 3), (1, 4), (2, 5)]);
    }

    #[test]
    fn test_decode_stride_respects_threshold_and_scale() {
        // One anchor above threshold at cell (1, 0) of a stride-8 grid,
        // offsets of one stride unit in every direction, 0.5 scale.
        let grid = DETECT_INPUT_SIZE / 8;
        let mut scores = vec![0.0f32; grid * grid * ANCHORS_PER_CELL];
        let mut bboxes = vec![0.0f32; grid * grid * ANCHORS_PER_CELL * 4];
        let idx = 1 * ANCHORS_PER_CELL; // cell x=1, y=0, first anchor
        scores[idx] = 0.9;
        bboxes[idx * 4..idx * 4 + 4].copy_from_slice(&[1.0, 1.0, 1.0, 1.0]);

        let mut out = Vec::new();
        decode_stride(&scores, &bboxes, 8, DETECT_INPUT_SIZE, 0.5, &mut out);

        assert_eq!(out.len(), 1);
        let c = &out[0];
        // Anchor center (8, 0); ±8 offsets; divided by scale 0.5.
        assert!((c.x1 - 0.0).abs() < 1e-4);
        assert!((c.y1 - -16.0).abs() < 1e-4);
        assert!((c.x2 - 32.0).abs() < 1e-4);
        assert!((c.y2 - 16.0).abs() < 1e-4);
    }
}

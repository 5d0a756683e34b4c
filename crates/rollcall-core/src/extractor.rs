//! Descriptor extraction: fixed-dimension face embeddings via ONNX Runtime.
//!
//! Runtime identification uses a single extraction pass per face crop.
//! Enrollment biases toward accuracy instead: several randomly perturbed
//! crops are extracted and averaged (see [`extract_jittered`]).

use crate::imaging;
use crate::types::{BoundingBox, Descriptor};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use rand::Rng;
use std::path::Path;
use thiserror::Error;

const EMBED_INPUT_SIZE: usize = 112;
const EMBED_MEAN: f32 = 127.5;
const EMBED_STD: f32 = 127.5;
const EMBED_DIM: usize = 512;
/// Extra context around the detector box, as a fraction of its span.
const CROP_MARGIN: f32 = 0.25;
/// Maximum jitter displacement/scale change, as a fraction of the box span.
const JITTER_EXTENT: f32 = 0.04;

#[derive(Error, Debug)]
pub enum ExtractorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("degenerate face box: {0:?}")]
    DegenerateBox(BoundingBox),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Turns one face crop of a full-resolution frame into a descriptor.
pub trait DescriptorExtractor: Send {
    fn extract(
        &mut self,
        rgb: &[u8],
        width: u32,
        height: u32,
        face: &BoundingBox,
    ) -> Result<Descriptor, ExtractorError>;
}

/// ONNX embedding extractor (ArcFace-family models, 512-d output).
pub struct OnnxExtractor {
    session: Session,
}

impl OnnxExtractor {
    pub fn load(model_path: &str, intra_threads: usize) -> Result<Self, ExtractorError> {
        if !Path::new(model_path).exists() {
            return Err(ExtractorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(intra_threads)?
            .commit_from_file(model_path)?;

        tracing::info!(path = model_path, "loaded descriptor model");

        Ok(Self { session })
    }

    /// Cut the face (with margin) out of the frame and build the normalized
    /// NCHW input tensor.
    fn preprocess(rgb: &[u8], width: u32, height: u32, face: &BoundingBox) -> Array4<f32> {
        let margin_w = (face.width() as f32 * CROP_MARGIN).round() as i64;
        let margin_h = (face.height() as f32 * CROP_MARGIN).round() as i64;
        let crop_w = (face.width() + 2 * margin_w).max(1) as u32;
        let crop_h = (face.height() + 2 * margin_h).max(1) as u32;

        let crop = imaging::crop_rgb(
            rgb,
            width,
            height,
            face.left - margin_w,
            face.top - margin_h,
            crop_w,
            crop_h,
        );
        let resized = imaging::resize_rgb(
            &crop,
            crop_w,
            crop_h,
            EMBED_INPUT_SIZE as u32,
            EMBED_INPUT_SIZE as u32,
        );

        let mut tensor = Array4::<f32>::zeros((1, 3, EMBED_INPUT_SIZE, EMBED_INPUT_SIZE));
        for y in 0..EMBED_INPUT_SIZE {
            for x in 0..EMBED_INPUT_SIZE {
                for c in 0..3 {
                    let pixel = resized[(y * EMBED_INPUT_SIZE + x) * 3 + c] as f32;
                    tensor[[0, c, y, x]] = (pixel - EMBED_MEAN) / EMBED_STD;
                }
            }
        }

        tensor
    }
}

impl DescriptorExtractor for OnnxExtractor {
    fn extract(
        &mut self,
        rgb: &[u8],
        width: u32,
        height: u32,
        face: &BoundingBox,
    ) -> Result<Descriptor, ExtractorError> {
        if !face.is_valid() {
            return Err(ExtractorError::DegenerateBox(*face));
        }

        let input = Self::preprocess(rgb, width, height, face);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ExtractorError::InferenceFailed(format!("descriptor head: {e}")))?;

        if raw.len() != EMBED_DIM {
            return Err(ExtractorError::InferenceFailed(format!(
                "expected {EMBED_DIM}-dim descriptor, got {}",
                raw.len()
            )));
        }

        let mut descriptor = Descriptor::new(raw.to_vec());
        descriptor.l2_normalize();
        Ok(descriptor)
    }
}

/// Enrollment-grade extraction: run `samples` passes over randomly perturbed
/// variants of the face box and average the results.
///
/// The first sample always uses the unperturbed box. Individual sample
/// failures are tolerated as long as at least one pass succeeds.
pub fn extract_jittered(
    extractor: &mut dyn DescriptorExtractor,
    rgb: &[u8],
    width: u32,
    height: u32,
    face: &BoundingBox,
    samples: usize,
) -> Result<Descriptor, ExtractorError> {
    let mut rng = rand::thread_rng();
    let mut collected = Vec::with_capacity(samples.max(1));
    let mut last_err = None;

    for i in 0..samples.max(1) {
        let candidate = if i == 0 { *face } else { jitter_box(face, &mut rng) };
        match extractor.extract(rgb, width, height, &candidate.clamp_to(width, height)) {
            Ok(d) => collected.push(d),
            Err(err) => {
                tracing::debug!(error = %err, sample = i, "jitter sample failed");
                last_err = Some(err);
            }
        }
    }

    match Descriptor::mean_of(&collected) {
        Some(mean) => Ok(mean),
        None => Err(last_err.unwrap_or_else(|| {
            ExtractorError::InferenceFailed("no jitter sample produced a descriptor".into())
        })),
    }
}

/// Randomly translate and rescale a box by up to ±`JITTER_EXTENT` of its span.
fn jitter_box<R: Rng>(face: &BoundingBox, rng: &mut R) -> BoundingBox {
    let w = face.width() as f32;
    let h = face.height() as f32;
    let cx = (face.left + face.right) as f32 / 2.0 + w * rng.gen_range(-JITTER_EXTENT..=JITTER_EXTENT);
    let cy = (face.top + face.bottom) as f32 / 2.0 + h * rng.gen_range(-JITTER_EXTENT..=JITTER_EXTENT);
    let half_w = w / 2.0 * (1.0 + rng.gen_range(-JITTER_EXTENT..=JITTER_EXTENT));
    let half_h = h / 2.0 * (1.0 + rng.gen_range(-JITTER_EXTENT..=JITTER_EXTENT));

    BoundingBox::new(
        (cy - half_h).round() as i64,
        (cx + half_w).round() as i64,
        (cy + half_h).round() as i64,
        (cx - half_w).round() as i64,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preprocess_output_shape() {
        let rgb = vec![128u8; 200 * 200 * 3];
        let face = BoundingBox::new(50, 150, 150, 50);
        let tensor = OnnxExtractor::preprocess(&rgb, 200, 200, &face);
        assert_eq!(tensor.shape(), &[1, 3, EMBED_INPUT_SIZE, EMBED_INPUT_SIZE]);
    }

    #[test]
    fn test_preprocess_normalization() {
        let rgb = vec![128u8; 200 * 200 * 3];
        let face = BoundingBox::new(50, 150, 150, 50);
        let tensor = OnnxExtractor::preprocess(&rgb, 200, 200, &face);
        let expected = (128.0 - EMBED_MEAN) / EMBED_STD;
        assert!((tensor[[0, 0, 56, 56]] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_jitter_box_stays_near_original() {
        let face = BoundingBox::new(100, 300, 300, 100);
        let mut rng = rand::thread_rng();
        for _ in 0..100 {
            let j = jitter_box(&face, &mut rng);
            assert!(j.is_valid());
            // Within ±10% of the original span on every edge.
            assert!((j.top - face.top).abs() <= 20);
            assert!((j.left - face.left).abs() <= 20);
            assert!((j.right - face.right).abs() <= 20);
            assert!((j.bottom - face.bottom).abs() <= 20);
        }
    }

    /// Extractor used by jitter tests: records calls, returns a constant.
    struct CountingExtractor {
        calls: usize,
        fail_first: bool,
    }

    impl DescriptorExtractor for CountingExtractor {
        fn extract(
            &mut self,
            _rgb: &[u8],
            _w: u32,
            _h: u32,
            _face: &BoundingBox,
        ) -> Result<Descriptor, ExtractorError> {
            self.calls += 1;
            if self.fail_first && self.calls == 1 {
                return Err(ExtractorError::InferenceFailed("warmup".into()));
            }
            Ok(Descriptor::new(vec![3.0, 4.0]))
        }
    }

    #[test]
    fn test_extract_jittered_averages_samples() {
        let mut ext = CountingExtractor { calls: 0, fail_first: false };
        let face = BoundingBox::new(10, 90, 90, 10);
        let rgb = vec![0u8; 100 * 100 * 3];
        let d = extract_jittered(&mut ext, &rgb, 100, 100, &face, 5).unwrap();
        assert_eq!(ext.calls, 5);
        // Constant samples average to themselves, normalized.
        assert!((d.values[0] - 0.6).abs() < 1e-6);
        assert!((d.values[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_extract_jittered_tolerates_partial_failure() {
        let mut ext = CountingExtractor { calls: 0, fail_first: true };
        let face = BoundingBox::new(10, 90, 90, 10);
        let rgb = vec![0u8; 100 * 100 * 3];
        let d = extract_jittered(&mut ext, &rgb, 100, 100, &face, 3).unwrap();
        assert_eq!(d.dimension(), 2);
    }

    #[test]
    fn test_extract_jittered_surfaces_total_failure() {
        struct AlwaysFails;
        impl DescriptorExtractor for AlwaysFails {
            fn extract(
                &mut self,
                _rgb: &[u8],
                _w: u32,
                _h: u32,
                _face: &BoundingBox,
            ) -> Result<Descriptor, ExtractorError> {
                Err(ExtractorError::InferenceFailed("down".into()))
            }
        }
        let face = BoundingBox::new(10, 90, 90, 10);
        let rgb = vec![0u8; 100 * 100 * 3];
        assert!(extract_jittered(&mut AlwaysFails, &rgb, 100, 100, &face, 3).is_err());
    }
}

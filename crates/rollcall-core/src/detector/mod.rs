//! Face localization backends.
//!
//! All backends share one contract: RGB image in, bounding boxes in that
//! image's coordinate space out. Selection happens once at startup; a deep
//! backend that cannot initialize falls closed to the classical detector
//! instead of aborting the pipeline.

mod classical;
mod deep;

pub use classical::{ClassicalDetector, ClassicalParams};
pub use deep::DeepDetector;

use crate::types::BoundingBox;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// A face localization strategy. Implementations take `&mut self` because
/// inference sessions are stateful; callers serialize access.
pub trait FaceDetector: Send {
    /// Return zero or more face boxes for a packed RGB24 image.
    fn detect(
        &mut self,
        rgb: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<BoundingBox>, DetectorError>;
}

/// Which localization backend to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Integral-image contrast tests; no model file needed.
    Classical,
    /// ONNX multi-stride detector on CPU.
    Deep,
    /// Same ONNX graph with the CUDA execution provider.
    DeepAccelerated,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "classical" | "hog" => Ok(Self::Classical),
            "deep" | "cnn" => Ok(Self::Deep),
            "deep-accel" | "deep-accelerated" | "cuda" => Ok(Self::DeepAccelerated),
            other => Err(format!("unknown detector backend: {other}")),
        }
    }
}

/// Everything a deep backend needs to come up.
#[derive(Debug, Clone)]
pub struct DeepBackendConfig {
    pub model_path: String,
    pub intra_threads: usize,
    pub cuda_device_id: i32,
}

/// Build the configured backend, falling closed to the classical detector
/// when a deep variant cannot initialize. Never fails.
pub fn build_detector(kind: BackendKind, deep: &DeepBackendConfig) -> Box<dyn FaceDetector> {
    match kind {
        BackendKind::Classical => Box::new(ClassicalDetector::default()),
        BackendKind::Deep => match DeepDetector::load(&deep.model_path, deep.intra_threads) {
            Ok(det) => Box::new(det),
            Err(err) => {
                tracing::warn!(error = %err, "deep backend unavailable, falling back to classical");
                Box::new(ClassicalDetector::default())
            }
        },
        BackendKind::DeepAccelerated => {
            match DeepDetector::load_accelerated(
                &deep.model_path,
                deep.intra_threads,
                deep.cuda_device_id,
            ) {
                Ok(det) => Box::new(det),
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        "accelerated backend unavailable, falling back to classical"
                    );
                    Box::new(ClassicalDetector::default())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_parsing() {
        assert_eq!("classical".parse::<BackendKind>().unwrap(), BackendKind::Classical);
        assert_eq!("Deep".parse::<BackendKind>().unwrap(), BackendKind::Deep);
        assert_eq!(
            "deep-accel".parse::<BackendKind>().unwrap(),
            BackendKind::DeepAccelerated
        );
        assert!("yolo9000".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_build_detector_fails_closed_on_missing_model() {
        let deep = DeepBackendConfig {
            model_path: "/nonexistent/model.onnx".into(),
            intra_threads: 1,
            cuda_device_id: 0,
        };
        // Both deep variants must come up as the classical fallback rather
        // than erroring out.
        let mut det = build_detector(BackendKind::Deep, &deep);
        assert!(det.detect(&[128u8; 48], 4, 4).unwrap().is_empty());
        let mut det = build_detector(BackendKind::DeepAccelerated, &deep);
        assert!(det.detect(&[128u8; 48], 4, 4).unwrap().is_empty());
    }
}

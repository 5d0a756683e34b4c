//! Per-frame identification and enrollment pipeline.
//!
//! Identification runs detection on a downscaled copy of the frame for
//! speed, maps the boxes back to full resolution, then extracts and
//! classifies each face against the roster. Enrollment runs detection at
//! full resolution and produces a jitter-averaged descriptor for one face.

use crate::detector::{DetectorError, FaceDetector};
use crate::extractor::{extract_jittered, DescriptorExtractor, ExtractorError};
use crate::matcher;
use crate::types::{BoundingBox, Descriptor, Identification, RosterEntry};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("detection failed: {0}")]
    Detection(#[from] DetectorError),
    #[error("frame buffer is {actual} bytes, expected {expected} for {width}x{height} RGB24")]
    BadFrameSize {
        expected: usize,
        actual: usize,
        width: u32,
        height: u32,
    },
}

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("no face detected in enrollment image")]
    NoFaceDetected,
    #[error("{0} faces detected, enrollment needs exactly one")]
    AmbiguousFace(usize),
    #[error("detection failed: {0}")]
    Detection(#[from] DetectorError),
    #[error("extraction failed: {0}")]
    Extraction(#[from] ExtractorError),
    #[error("frame buffer is {actual} bytes, expected {expected} for {width}x{height} RGB24")]
    BadFrameSize {
        expected: usize,
        actual: usize,
        width: u32,
        height: u32,
    },
}

/// What to do when an enrollment image contains several faces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MultiFacePolicy {
    /// Enroll the face with the largest box area; earliest detection wins
    /// an exact area tie.
    #[default]
    LargestFace,
    /// Refuse the image outright.
    Reject,
}

/// Knobs for one pipeline instance. Constructed once from configuration.
#[derive(Debug, Clone)]
pub struct PipelineTuning {
    /// Uniform factor applied to the frame before detection, in (0, 1].
    pub detect_scale: f32,
    /// Faces narrower or shorter than this (in full-resolution pixels) are
    /// discarded before extraction.
    pub min_face_px: u32,
    /// Maximum descriptor distance accepted as a match.
    pub tolerance: f32,
    /// Number of jitter samples averaged during enrollment.
    pub enroll_jitter: usize,
    pub multi_face: MultiFacePolicy,
}

impl Default for PipelineTuning {
    fn default() -> Self {
        Self {
            detect_scale: 0.5,
            min_face_px: 80,
            tolerance: matcher::DEFAULT_TOLERANCE,
            enroll_jitter: 5,
            multi_face: MultiFacePolicy::default(),
        }
    }
}

pub struct IdentificationPipeline {
    detector: Box<dyn FaceDetector>,
    extractor: Box<dyn DescriptorExtractor>,
    tuning: PipelineTuning,
}

impl IdentificationPipeline {
    pub fn new(
        detector: Box<dyn FaceDetector>,
        extractor: Box<dyn DescriptorExtractor>,
        tuning: PipelineTuning,
    ) -> Self {
        Self { detector, extractor, tuning }
    }

    pub fn tuning(&self) -> &PipelineTuning {
        &self.tuning
    }

    /// Identify every sufficiently large face in a full-resolution RGB24
    /// frame against the roster.
    ///
    /// Detection runs on a copy downscaled by `detect_scale`; boxes come
    /// back mapped to frame coordinates. A face whose extraction or
    /// classification fails is skipped; the remaining faces still report.
    pub fn identify(
        &mut self,
        rgb: &[u8],
        width: u32,
        height: u32,
        roster: &[RosterEntry],
    ) -> Result<Vec<Identification>, PipelineError> {
        check_frame_size(rgb, width, height).map_err(|(expected, actual)| {
            PipelineError::BadFrameSize { expected, actual, width, height }
        })?;

        let faces = self.detect_full_res(rgb, width, height)?;
        let mut results = Vec::with_capacity(faces.len());

        for face in &faces {
            if face.width() < self.tuning.min_face_px as i64
                || face.height() < self.tuning.min_face_px as i64
            {
                tracing::debug!(
                    w = face.width(),
                    h = face.height(),
                    min = self.tuning.min_face_px,
                    "face below minimum size, skipped"
                );
                continue;
            }

            let descriptor = match self.extractor.extract(rgb, width, height, face) {
                Ok(d) => d,
                Err(err) => {
                    tracing::warn!(error = %err, bbox = ?face, "face extraction failed, skipped");
                    continue;
                }
            };

            let m = matcher::classify(&descriptor, roster, self.tuning.tolerance);
            results.push(Identification {
                student_id: m.student_id,
                name: m.name,
                confidence: m.confidence,
                bbox: *face,
            });
        }

        Ok(results)
    }

    /// Produce an enrollment descriptor from a full-resolution RGB24 image.
    ///
    /// Detection runs at full resolution here; enrollment favors accuracy
    /// over latency. Exactly one face must remain after applying the
    /// multi-face policy.
    pub fn enroll_descriptor(
        &mut self,
        rgb: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Descriptor, EnrollError> {
        check_frame_size(rgb, width, height).map_err(|(expected, actual)| {
            EnrollError::BadFrameSize { expected, actual, width, height }
        })?;

        let faces = self.detector.detect(rgb, width, height)?;

        let face = match (faces.len(), self.tuning.multi_face) {
            (0, _) => return Err(EnrollError::NoFaceDetected),
            (1, _) => faces[0],
            (n, MultiFacePolicy::Reject) => return Err(EnrollError::AmbiguousFace(n)),
            (n, MultiFacePolicy::LargestFace) => {
                // max_by_key on equal keys returns the last element, so
                // iterate with an explicit strict comparison instead.
                let mut best = faces[0];
                for f in &faces[1..] {
                    if f.area() > best.area() {
                        best = *f;
                    }
                }
                tracing::info!(count = n, chosen = ?best, "multiple faces, enrolling largest");
                best
            }
        };

        let descriptor = extract_jittered(
            self.extractor.as_mut(),
            rgb,
            width,
            height,
            &face,
            self.tuning.enroll_jitter,
        )?;
        Ok(descriptor)
    }

    /// Detect on a downscaled copy and return boxes in full-resolution
    /// coordinates, clamped to the frame.
    fn detect_full_res(
        &mut self,
        rgb: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<BoundingBox>, PipelineError> {
        let scale = self.tuning.detect_scale;
        if scale >= 1.0 {
            return Ok(self.detector.detect(rgb, width, height)?);
        }

        let dw = ((width as f32 * scale).round() as u32).max(1);
        let dh = ((height as f32 * scale).round() as u32).max(1);
        let small = crate::imaging::resize_rgb(rgb, width, height, dw, dh);

        let inverse = 1.0 / scale;
        let boxes = self
            .detector
            .detect(&small, dw, dh)?
            .into_iter()
            .map(|b| b.scale(inverse).clamp_to(width, height))
            .filter(|b| b.is_valid())
            .collect();
        Ok(boxes)
    }
}

fn check_frame_size(rgb: &[u8], width: u32, height: u32) -> Result<(), (usize, usize)> {
    let expected = width as usize * height as usize * 3;
    if rgb.len() != expected {
        return Err((expected, rgb.len()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::DetectorError;
    use crate::extractor::ExtractorError;
    use crate::types::Descriptor;

    /// Returns a fixed set of boxes regardless of input, scaled down by the
    /// ratio between the configured frame and the image it is handed. This
    /// mimics a real detector seeing the downscaled copy.
    struct ScriptedDetector {
        full_res_boxes: Vec<BoundingBox>,
        full_width: u32,
    }

    impl FaceDetector for ScriptedDetector {
        fn detect(
            &mut self,
            _rgb: &[u8],
            width: u32,
            _height: u32,
        ) -> Result<Vec<BoundingBox>, DetectorError> {
            let ratio = width as f32 / self.full_width as f32;
            Ok(self
                .full_res_boxes
                .iter()
                .map(|b| b.scale(ratio))
                .collect())
        }
    }

    /// Maps each face box to a descriptor keyed by its left edge so tests
    /// can steer which roster entry matches.
    struct KeyedExtractor {
        fail_left_edges: Vec<i64>,
    }

    impl DescriptorExtractor for KeyedExtractor {
        fn extract(
            &mut self,
            _rgb: &[u8],
            _w: u32,
            _h: u32,
            face: &BoundingBox,
        ) -> Result<Descriptor, ExtractorError> {
            if self.fail_left_edges.contains(&face.left) {
                return Err(ExtractorError::InferenceFailed("scripted".into()));
            }
            // Left edge below 500 maps near (1, 0), otherwise near (0, 1).
            if face.left < 500 {
                Ok(Descriptor::new(vec![1.0, 0.0]))
            } else {
                Ok(Descriptor::new(vec![0.0, 1.0]))
            }
        }
    }

    fn frame(width: u32, height: u32) -> Vec<u8> {
        vec![128u8; width as usize * height as usize * 3]
    }

    fn roster() -> Vec<RosterEntry> {
        vec![
            RosterEntry {
                student_id: "S1".into(),
                name: "Aliya".into(),
                descriptor: Descriptor::new(vec![1.0, 0.0]),
            },
            RosterEntry {
                student_id: "S2".into(),
                name: "Bekzod".into(),
                descriptor: Descriptor::new(vec![0.0, 1.0]),
            },
        ]
    }

    fn pipeline(boxes: Vec<BoundingBox>, fail_left_edges: Vec<i64>) -> IdentificationPipeline {
        IdentificationPipeline::new(
            Box::new(ScriptedDetector { full_res_boxes: boxes, full_width: 1920 }),
            Box::new(KeyedExtractor { fail_left_edges }),
            PipelineTuning::default(),
        )
    }

    #[test]
    fn test_identify_maps_boxes_back_to_full_resolution() {
        let face = BoundingBox::new(200, 400, 400, 200);
        let mut p = pipeline(vec![face], vec![]);
        let out = p.identify(&frame(1920, 1080), 1920, 1080, &roster()).unwrap();

        assert_eq!(out.len(), 1);
        // Downscale by 0.5 then inverse-scale by 2 restores the box.
        assert_eq!(out[0].bbox, face);
        assert_eq!(out[0].student_id.as_deref(), Some("S1"));
        assert_eq!(out[0].name, "Aliya");
    }

    #[test]
    fn test_identify_multiple_faces() {
        let near = BoundingBox::new(200, 400, 400, 200);
        let far = BoundingBox::new(200, 800, 400, 600);
        let mut p = pipeline(vec![near, far], vec![]);
        let out = p.identify(&frame(1920, 1080), 1920, 1080, &roster()).unwrap();

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].student_id.as_deref(), Some("S1"));
        assert_eq!(out[1].student_id.as_deref(), Some("S2"));
    }

    #[test]
    fn test_identify_discards_small_faces() {
        // 60px face sits below the 80px default minimum.
        let small = BoundingBox::new(200, 260, 260, 200);
        let big = BoundingBox::new(200, 400, 400, 200);
        let mut p = pipeline(vec![small, big], vec![]);
        let out = p.identify(&frame(1920, 1080), 1920, 1080, &roster()).unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].bbox, big);
    }

    #[test]
    fn test_identify_skips_failed_extraction_keeps_rest() {
        let bad = BoundingBox::new(200, 400, 400, 200);
        let good = BoundingBox::new(200, 800, 400, 600);
        let mut p = pipeline(vec![bad, good], vec![bad.left]);
        let out = p.identify(&frame(1920, 1080), 1920, 1080, &roster()).unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].student_id.as_deref(), Some("S2"));
    }

    #[test]
    fn test_identify_empty_roster_reports_unknown() {
        let face = BoundingBox::new(200, 400, 400, 200);
        let mut p = pipeline(vec![face], vec![]);
        let out = p.identify(&frame(1920, 1080), 1920, 1080, &[]).unwrap();

        assert_eq!(out.len(), 1);
        assert!(out[0].student_id.is_none());
        assert_eq!(out[0].name, "Unknown");
        assert_eq!(out[0].confidence, 0.0);
    }

    #[test]
    fn test_identify_no_faces_is_empty_ok() {
        let mut p = pipeline(vec![], vec![]);
        let out = p.identify(&frame(1920, 1080), 1920, 1080, &roster()).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_identify_rejects_wrong_buffer_size() {
        let mut p = pipeline(vec![], vec![]);
        let err = p.identify(&[0u8; 10], 1920, 1080, &roster());
        assert!(matches!(err, Err(PipelineError::BadFrameSize { .. })));
    }

    #[test]
    fn test_enroll_single_face() {
        let face = BoundingBox::new(200, 400, 400, 200);
        let mut p = pipeline(vec![face], vec![]);
        let d = p.enroll_descriptor(&frame(1920, 1080), 1920, 1080).unwrap();
        assert_eq!(d.dimension(), 2);
    }

    #[test]
    fn test_enroll_no_face_errors() {
        let mut p = pipeline(vec![], vec![]);
        let err = p.enroll_descriptor(&frame(1920, 1080), 1920, 1080);
        assert!(matches!(err, Err(EnrollError::NoFaceDetected)));
    }

    #[test]
    fn test_enroll_largest_face_policy_picks_biggest() {
        let small = BoundingBox::new(200, 300, 300, 200);
        let big = BoundingBox::new(200, 900, 500, 600);
        // Extractor fails on the small face's left edge; success proves the
        // big one was chosen.
        let mut p = pipeline(vec![small, big], vec![small.left]);
        assert!(p.enroll_descriptor(&frame(1920, 1080), 1920, 1080).is_ok());
    }

    #[test]
    fn test_enroll_largest_face_tie_prefers_earliest() {
        let first = BoundingBox::new(200, 300, 300, 200);
        let second = BoundingBox::new(200, 900, 300, 800);
        // Equal areas; failing on the second proves the first was chosen.
        let mut p = pipeline(vec![first, second], vec![second.left]);
        assert!(p.enroll_descriptor(&frame(1920, 1080), 1920, 1080).is_ok());
    }

    #[test]
    fn test_enroll_reject_policy_refuses_multiple() {
        let a = BoundingBox::new(200, 300, 300, 200);
        let b = BoundingBox::new(200, 900, 500, 600);
        let mut p = pipeline(vec![a, b], vec![]);
        p.tuning.multi_face = MultiFacePolicy::Reject;
        let err = p.enroll_descriptor(&frame(1920, 1080), 1920, 1080);
        assert!(matches!(err, Err(EnrollError::AmbiguousFace(2))));
    }

    #[test]
    fn test_detect_scale_one_skips_downscale() {
        let face = BoundingBox::new(200, 400, 400, 200);
        let mut p = pipeline(vec![face], vec![]);
        p.tuning.detect_scale = 1.0;
        let out = p.identify(&frame(1920, 1080), 1920, 1080, &roster()).unwrap();
        assert_eq!(out[0].bbox, face);
    }
}

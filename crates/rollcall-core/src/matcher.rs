//! Nearest-neighbor roster matching.
//!
//! A probe descriptor is compared against every enrolled descriptor by
//! Euclidean distance; the closest entry wins if it sits within the single
//! tolerance threshold. That threshold is the only acceptance criterion;
//! confidence (`1 - distance`) is derived from it, never filtered again.

use crate::types::{Descriptor, RosterEntry, UNKNOWN_NAME};
use serde::Serialize;
use thiserror::Error;

/// Default maximum accepted distance between probe and enrolled descriptor.
pub const DEFAULT_TOLERANCE: f32 = 0.6;

#[derive(Error, Debug)]
pub enum MatchError {
    #[error("descriptor dimension mismatch: {probe} vs {gallery}")]
    DimensionMismatch { probe: usize, gallery: usize },
}

/// Outcome of classifying one probe against the roster.
#[derive(Debug, Clone)]
pub struct RosterMatch {
    /// `None` when nothing matched within tolerance.
    pub student_id: Option<String>,
    /// Display name, `"Unknown"` when unmatched.
    pub name: String,
    /// `1 - distance` to the nearest entry, clamped to [0, 1]; 0 for an
    /// empty roster.
    pub confidence: f32,
    /// Distance to the nearest same-dimension entry, if any.
    pub distance: Option<f32>,
}

impl RosterMatch {
    fn unknown(distance: Option<f32>) -> Self {
        Self {
            student_id: None,
            name: UNKNOWN_NAME.to_string(),
            confidence: distance.map(|d| (1.0 - d).clamp(0.0, 1.0)).unwrap_or(0.0),
            distance,
        }
    }
}

/// Classify `probe` against the roster with the given tolerance.
///
/// Every entry is visited, with no early exit. Entries whose descriptor
/// dimension differs from the probe are skipped (fatal to that comparison
/// only). Ties at the minimum distance resolve to the earliest-inserted
/// entry.
pub fn classify(probe: &Descriptor, roster: &[RosterEntry], tolerance: f32) -> RosterMatch {
    let mut best: Option<(usize, f32)> = None;

    for (idx, entry) in roster.iter().enumerate() {
        let Some(dist) = probe.euclidean_distance(&entry.descriptor) else {
            tracing::warn!(
                student_id = %entry.student_id,
                stored_dim = entry.descriptor.dimension(),
                probe_dim = probe.dimension(),
                "skipping roster entry with mismatched descriptor dimension"
            );
            continue;
        };
        // Strict inequality keeps the earliest entry on exact ties.
        if best.map(|(_, d)| dist < d).unwrap_or(true) {
            best = Some((idx, dist));
        }
    }

    match best {
        Some((idx, dist)) if dist <= tolerance => {
            let entry = &roster[idx];
            RosterMatch {
                student_id: Some(entry.student_id.clone()),
                name: entry.name.clone(),
                confidence: (1.0 - dist).clamp(0.0, 1.0),
                distance: Some(dist),
            }
        }
        Some((_, dist)) => RosterMatch::unknown(Some(dist)),
        None => RosterMatch::unknown(None),
    }
}

/// Stateless descriptor comparison, independent of the store.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CompareOutcome {
    pub matched: bool,
    pub distance: f32,
    pub confidence: f32,
}

/// Compare two descriptors under `tolerance`.
pub fn compare(
    a: &Descriptor,
    b: &Descriptor,
    tolerance: f32,
) -> Result<CompareOutcome, MatchError> {
    let distance = a
        .euclidean_distance(b)
        .ok_or(MatchError::DimensionMismatch {
            probe: a.dimension(),
            gallery: b.dimension(),
        })?;

    Ok(CompareOutcome {
        matched: distance <= tolerance,
        distance,
        confidence: (1.0 - distance).clamp(0.0, 1.0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, name: &str, values: Vec<f32>) -> RosterEntry {
        RosterEntry {
            student_id: id.to_string(),
            name: name.to_string(),
            descriptor: Descriptor::new(values),
        }
    }

    #[test]
    fn test_empty_roster_is_unknown_with_zero_confidence() {
        let probe = Descriptor::new(vec![1.0, 0.0]);
        let m = classify(&probe, &[], DEFAULT_TOLERANCE);
        assert!(m.student_id.is_none());
        assert_eq!(m.name, "Unknown");
        assert_eq!(m.confidence, 0.0);
        assert!(m.distance.is_none());
    }

    #[test]
    fn test_exact_match_full_confidence() {
        let roster = vec![entry("S1", "Aliya", vec![0.2, 0.4, 0.1])];
        let probe = Descriptor::new(vec![0.2, 0.4, 0.1]);
        let m = classify(&probe, &roster, DEFAULT_TOLERANCE);
        assert_eq!(m.student_id.as_deref(), Some("S1"));
        assert_eq!(m.name, "Aliya");
        assert_eq!(m.distance, Some(0.0));
        assert!((m.confidence - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_beyond_tolerance_is_unknown_but_keeps_confidence() {
        let roster = vec![entry("S1", "Aliya", vec![0.0, 0.0])];
        let probe = Descriptor::new(vec![0.9, 0.0]);
        let m = classify(&probe, &roster, 0.6);
        assert!(m.student_id.is_none());
        assert_eq!(m.name, "Unknown");
        assert!((m.distance.unwrap() - 0.9).abs() < 1e-6);
        assert!((m.confidence - 0.1).abs() < 1e-5);
    }

    #[test]
    fn test_at_tolerance_boundary_matches() {
        let roster = vec![entry("S1", "Aliya", vec![0.0, 0.0])];
        let probe = Descriptor::new(vec![0.6, 0.0]);
        let m = classify(&probe, &roster, 0.6);
        assert_eq!(m.student_id.as_deref(), Some("S1"));
    }

    #[test]
    fn test_nearest_of_several_wins() {
        let roster = vec![
            entry("S1", "Aliya", vec![1.0, 0.0]),
            entry("S2", "Bekzod", vec![0.1, 0.0]),
            entry("S3", "Carla", vec![0.5, 0.0]),
        ];
        let probe = Descriptor::new(vec![0.0, 0.0]);
        let m = classify(&probe, &roster, DEFAULT_TOLERANCE);
        assert_eq!(m.student_id.as_deref(), Some("S2"));
    }

    #[test]
    fn test_tie_breaks_to_earliest_inserted() {
        let roster = vec![
            entry("S1", "Aliya", vec![0.3, 0.0]),
            entry("S2", "Bekzod", vec![0.3, 0.0]),
        ];
        let probe = Descriptor::new(vec![0.0, 0.0]);
        let m = classify(&probe, &roster, DEFAULT_TOLERANCE);
        assert_eq!(m.student_id.as_deref(), Some("S1"));
    }

    #[test]
    fn test_mismatched_dimension_entry_is_skipped() {
        let roster = vec![
            entry("S1", "Aliya", vec![0.0, 0.0, 0.0]), // wrong dimension
            entry("S2", "Bekzod", vec![0.1, 0.0]),
        ];
        let probe = Descriptor::new(vec![0.0, 0.0]);
        let m = classify(&probe, &roster, DEFAULT_TOLERANCE);
        assert_eq!(m.student_id.as_deref(), Some("S2"));
    }

    #[test]
    fn test_all_entries_mismatched_is_unknown() {
        let roster = vec![entry("S1", "Aliya", vec![0.0; 3])];
        let probe = Descriptor::new(vec![0.0, 0.0]);
        let m = classify(&probe, &roster, DEFAULT_TOLERANCE);
        assert!(m.student_id.is_none());
        assert_eq!(m.confidence, 0.0);
    }

    #[test]
    fn test_compare_identical() {
        let d = Descriptor::new(vec![0.5, 0.5, 0.1]);
        let out = compare(&d, &d, DEFAULT_TOLERANCE).unwrap();
        assert!(out.matched);
        assert_eq!(out.distance, 0.0);
        assert!((out.confidence - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_compare_beyond_tolerance() {
        let a = Descriptor::new(vec![0.0, 0.0]);
        let b = Descriptor::new(vec![1.0, 0.0]);
        let out = compare(&a, &b, 0.6).unwrap();
        assert!(!out.matched);
        assert!((out.distance - 1.0).abs() < 1e-6);
        assert_eq!(out.confidence, 0.0);
    }

    #[test]
    fn test_compare_dimension_mismatch_errors() {
        let a = Descriptor::new(vec![0.0, 0.0]);
        let b = Descriptor::new(vec![0.0; 3]);
        assert!(compare(&a, &b, 0.6).is_err());
    }
}

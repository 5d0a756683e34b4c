use serde::{Deserialize, Serialize};

/// Face bounding box as integer pixel offsets in css order (top, right,
/// bottom, left), tied to the resolution of the frame it was detected in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub top: i64,
    pub right: i64,
    pub bottom: i64,
    pub left: i64,
}

impl BoundingBox {
    pub fn new(top: i64, right: i64, bottom: i64, left: i64) -> Self {
        Self { top, right, bottom, left }
    }

    pub fn width(&self) -> i64 {
        self.right - self.left
    }

    pub fn height(&self) -> i64 {
        self.bottom - self.top
    }

    pub fn area(&self) -> i64 {
        self.width().max(0) * self.height().max(0)
    }

    /// True when the spans are positive, i.e. `right > left` and `bottom > top`.
    pub fn is_valid(&self) -> bool {
        self.right > self.left && self.bottom > self.top
    }

    /// Multiply every coordinate by `factor`, rounding to the nearest pixel.
    ///
    /// Used to map boxes found on a downscaled detection copy back into the
    /// full-resolution frame's coordinate space.
    pub fn scale(&self, factor: f32) -> Self {
        let s = |v: i64| (v as f32 * factor).round() as i64;
        Self {
            top: s(self.top),
            right: s(self.right),
            bottom: s(self.bottom),
            left: s(self.left),
        }
    }

    /// Clamp the box to a `width` × `height` frame.
    pub fn clamp_to(&self, width: u32, height: u32) -> Self {
        Self {
            top: self.top.clamp(0, height as i64),
            right: self.right.clamp(0, width as i64),
            bottom: self.bottom.clamp(0, height as i64),
            left: self.left.clamp(0, width as i64),
        }
    }
}

/// Fixed-dimension face descriptor.
///
/// Every descriptor produced by one extraction configuration has the same
/// dimension; descriptors are only ever compared against others of the same
/// dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    pub values: Vec<f32>,
}

impl Descriptor {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Euclidean distance to another descriptor, or `None` on a dimension
    /// mismatch. A mismatch is fatal to this single comparison only; callers
    /// log and move on to the remaining entries.
    pub fn euclidean_distance(&self, other: &Descriptor) -> Option<f32> {
        if self.dimension() != other.dimension() {
            return None;
        }
        let sum: f32 = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum();
        Some(sum.sqrt())
    }

    /// Scale the descriptor to unit L2 norm. A zero vector is left untouched.
    pub fn l2_normalize(&mut self) {
        let norm: f32 = self.values.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in self.values.iter_mut() {
                *v /= norm;
            }
        }
    }

    /// Element-wise mean of several same-dimension descriptors, re-normalized.
    ///
    /// Used at enrollment time to average jittered extraction samples.
    /// Returns `None` for an empty slice or mixed dimensions.
    pub fn mean_of(descriptors: &[Descriptor]) -> Option<Descriptor> {
        let first = descriptors.first()?;
        let dim = first.dimension();
        if descriptors.iter().any(|d| d.dimension() != dim) {
            return None;
        }
        let mut acc = vec![0.0f32; dim];
        for d in descriptors {
            for (a, v) in acc.iter_mut().zip(d.values.iter()) {
                *a += v;
            }
        }
        let n = descriptors.len() as f32;
        for a in acc.iter_mut() {
            *a /= n;
        }
        let mut mean = Descriptor::new(acc);
        mean.l2_normalize();
        Some(mean)
    }
}

/// One enrolled identity: primary key, display name, and descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RosterEntry {
    pub student_id: String,
    pub name: String,
    pub descriptor: Descriptor,
}

/// Per-face output of one identification pass: where the face is, who it is
/// (if anyone), and how close the match was.
#[derive(Debug, Clone, Serialize)]
pub struct Identification {
    /// `None` when the face matched nobody within tolerance.
    pub student_id: Option<String>,
    /// Display name, or `"Unknown"` for an unmatched face.
    pub name: String,
    /// `1 - distance`, clamped to [0, 1]. Not a calibrated probability.
    pub confidence: f32,
    pub bbox: BoundingBox,
}

pub const UNKNOWN_NAME: &str = "Unknown";

impl Identification {
    pub fn unknown(bbox: BoundingBox) -> Self {
        Self {
            student_id: None,
            name: UNKNOWN_NAME.to_string(),
            confidence: 0.0,
            bbox,
        }
    }
}

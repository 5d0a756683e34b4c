//! Classical feature-based face localization.
//!
//! A sliding-window detector built on integral-image contrast tests: a face
//! window shows a dark eye band between a brighter forehead and brighter
//! cheeks, with a brighter nose bridge between the eyes. No model file is
//! required, which makes this the fail-closed fallback backend.

use super::{DetectorError, FaceDetector};
use crate::imaging;
use crate::types::BoundingBox;

#[derive(Debug, Clone)]
pub struct ClassicalParams {
    /// Smallest square window evaluated, in pixels.
    pub min_window: u32,
    /// Multiplicative growth between pyramid levels.
    pub scale_step: f32,
    /// Minimum brightness margin (0–255) each contrast test must clear.
    pub contrast_margin: f32,
    /// Minimum per-window standard deviation; rejects flat regions.
    pub min_stddev: f32,
    /// Overlap ratio above which the weaker of two candidates is dropped.
    pub overlap_threshold: f32,
}

impl Default for ClassicalParams {
    fn default() -> Self {
        Self {
            min_window: 48,
            scale_step: 1.25,
            contrast_margin: 18.0,
            min_stddev: 24.0,
            overlap_threshold: 0.3,
        }
    }
}

/// Window-relative region, as fractions of the window size.
struct Region {
    top: f32,
    bottom: f32,
    left: f32,
    right: f32,
}

const FOREHEAD: Region = Region { top: 0.05, bottom: 0.25, left: 0.15, right: 0.85 };
const EYE_BAND: Region = Region { top: 0.25, bottom: 0.45, left: 0.15, right: 0.85 };
const CHEEKS: Region = Region { top: 0.50, bottom: 0.75, left: 0.15, right: 0.85 };
const LEFT_EYE: Region = Region { top: 0.25, bottom: 0.45, left: 0.15, right: 0.45 };
const RIGHT_EYE: Region = Region { top: 0.25, bottom: 0.45, left: 0.55, right: 0.85 };
const NOSE: Region = Region { top: 0.45, bottom: 0.75, left: 0.40, right: 0.60 };

pub struct ClassicalDetector {
    params: ClassicalParams,
}

impl ClassicalDetector {
    pub fn new(params: ClassicalParams) -> Self {
        Self { params }
    }
}

impl Default for ClassicalDetector {
    fn default() -> Self {
        Self::new(ClassicalParams::default())
    }
}

impl FaceDetector for ClassicalDetector {
    fn detect(
        &mut self,
        rgb: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<BoundingBox>, DetectorError> {
        let (w, h) = (width as usize, height as usize);
        if w == 0 || h == 0 || rgb.len() < w * h * 3 {
            return Ok(Vec::new());
        }

        let gray = imaging::rgb_to_grayscale(rgb, width, height);
        let integral = IntegralImage::build(&gray, w, h);

        let mut candidates: Vec<(BoundingBox, f32)> = Vec::new();
        let mut window = self.params.min_window as usize;
        let max_window = w.min(h);

        while window <= max_window {
            let step = (window / 16).max(2);
            let mut y0 = 0;
            while y0 + window <= h {
                let mut x0 = 0;
                while x0 + window <= w {
                    if let Some(score) = self.evaluate_window(&integral, x0, y0, window) {
                        candidates.push((
                            BoundingBox::new(
                                y0 as i64,
                                (x0 + window) as i64,
                                (y0 + window) as i64,
                                x0 as i64,
                            ),
                            score,
                        ));
                    }
                    x0 += step;
                }
                y0 += step;
            }

            let next = (window as f32 * self.params.scale_step).round() as usize;
            if next == window {
                break;
            }
            window = next;
        }

        Ok(suppress_overlapping(candidates, self.params.overlap_threshold))
    }
}

impl ClassicalDetector {
    /// Score one window, or `None` if any gate fails.
    fn evaluate_window(
        &self,
        integral: &IntegralImage,
        x0: usize,
        y0: usize,
        window: usize,
    ) -> Option<f32> {
        if integral.stddev(x0, y0, window, window) < self.params.min_stddev {
            return None;
        }

        let mean = |r: &Region| integral.region_mean(x0, y0, window, r);

        let forehead = mean(&FOREHEAD);
        let eyes = mean(&EYE_BAND);
        let cheeks = mean(&CHEEKS);
        let nose = mean(&NOSE);
        let eye_pair = (mean(&LEFT_EYE) + mean(&RIGHT_EYE)) / 2.0;

        let margin = self.params.contrast_margin;
        let t1 = forehead - eyes;
        let t2 = cheeks - eyes;
        let t3 = nose - eye_pair;

        if t1 >= margin && t2 >= margin && t3 >= margin {
            Some((t1 + t2 + t3) / (3.0 * 255.0))
        } else {
            None
        }
    }
}

/// Summed-area tables over an 8-bit grayscale image, plus squared sums for
/// variance queries. Both tables carry a zero row/column of padding.
struct IntegralImage {
    sums: Vec<u64>,
    sq_sums: Vec<u64>,
    width: usize,
}

impl IntegralImage {
    fn build(gray: &[u8], width: usize, height: usize) -> Self {
        let stride = width + 1;
        let mut sums = vec![0u64; stride * (height + 1)];
        let mut sq_sums = vec![0u64; stride * (height + 1)];

        for y in 0..height {
            let mut row_sum = 0u64;
            let mut row_sq = 0u64;
            for x in 0..width {
                let v = gray[y * width + x] as u64;
                row_sum += v;
                row_sq += v * v;
                let idx = (y + 1) * stride + x + 1;
                sums[idx] = sums[y * stride + x + 1] + row_sum;
                sq_sums[idx] = sq_sums[y * stride + x + 1] + row_sq;
            }
        }

        Self { sums, sq_sums, width }
    }

    fn rect_sum(table: &[u64], stride: usize, x: usize, y: usize, w: usize, h: usize) -> u64 {
        let (x1, y1) = (x + w, y + h);
        table[y1 * stride + x1] + table[y * stride + x]
            - table[y * stride + x1]
            - table[y1 * stride + x]
    }

    fn mean(&self, x: usize, y: usize, w: usize, h: usize) -> f32 {
        if w == 0 || h == 0 {
            return 0.0;
        }
        let stride = self.width + 1;
        Self::rect_sum(&self.sums, stride, x, y, w, h) as f32 / (w * h) as f32
    }

    fn stddev(&self, x: usize, y: usize, w: usize, h: usize) -> f32 {
        if w == 0 || h == 0 {
            return 0.0;
        }
        let stride = self.width + 1;
        let n = (w * h) as f32;
        let sum = Self::rect_sum(&self.sums, stride, x, y, w, h) as f32;
        let sq = Self::rect_sum(&self.sq_sums, stride, x, y, w, h) as f32;
        let variance = (sq / n) - (sum / n).powi(2);
        variance.max(0.0).sqrt()
    }

    /// Mean brightness of a window-relative region.
    fn region_mean(&self, x0: usize, y0: usize, window: usize, r: &Region) -> f32 {
        let px = |f: f32| (f * window as f32).round() as usize;
        let (rx, ry) = (x0 + px(r.left), y0 + px(r.top));
        let (rw, rh) = (px(r.right) - px(r.left), px(r.bottom) - px(r.top));
        self.mean(rx, ry, rw, rh)
    }
}

/// Greedy suppression: keep the strongest candidate, drop anything that
/// overlaps it beyond `threshold`, repeat.
fn suppress_overlapping(
    mut candidates: Vec<(BoundingBox, f32)>,
    threshold: f32,
) -> Vec<BoundingBox> {
    candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut keep: Vec<BoundingBox> = Vec::new();
    for (bbox, _) in candidates {
        if keep.iter().all(|k| overlap_ratio(k, &bbox) <= threshold) {
            keep.push(bbox);
        }
    }
    keep
}

/// Intersection-over-union of two boxes.
fn overlap_ratio(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let inter_w = (a.right.min(b.right) - a.left.max(b.left)).max(0);
    let inter_h = (a.bottom.min(b.bottom) - a.top.max(b.top)).max(0);
    let inter = (inter_w * inter_h) as f32;
    let union = (a.area() + b.area()) as f32 - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

// THEORY:
// The `moment` module turns the subject's silhouette into numbers. For each
// cleaned frame it segments the foreground, keeps the largest 8-connected
// component and summarizes it by its binary image moments: centroid,
// orientation of the principal axis, major/minor axis lengths and area.
//
// Key architectural principles:
// 1.  **Missing Is NaN**: A frame without foreground yields NaN features rather
//     than an error. Downstream stages (smoothing, crop, scalars) are NaN-aware.
// 2.  **Orientation Convention**: `-0.5 * atan2(2*mu11, mu20 - mu02)` with image
//     rows pointing down. It is defined modulo pi; `unwrap_orientation` makes a
//     series continuous.
// 3.  **Mask Gating**: With the tracking model enabled, a pixel is foreground only
//     if its log-likelihood also clears `tracking_model_mask_threshold`.

use crate::core_modules::blob::Blob;
use crate::core_modules::blob_detector::blob_detector::{self, Connectivity};
use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis, Zip};
use std::f64::consts::PI;

/// Shape features of the subject in one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameFeatures {
    /// (x, y) in pixels.
    pub centroid: (f64, f64),
    /// Radians.
    pub orientation: f64,
    /// (major, minor) in pixels.
    pub axis_length: (f64, f64),
    /// Pixels.
    pub area: f64,
}

impl FrameFeatures {
    pub fn missing() -> Self {
        Self {
            centroid: (f64::NAN, f64::NAN),
            orientation: f64::NAN,
            axis_length: (f64::NAN, f64::NAN),
            area: f64::NAN,
        }
    }

    pub fn is_missing(&self) -> bool {
        !(self.centroid.0.is_finite() && self.centroid.1.is_finite() && self.orientation.is_finite())
    }
}

/// Binary image moments of a blob.
pub fn blob_features(blob: &Blob) -> FrameFeatures {
    let m00 = blob.area() as f64;
    if m00 == 0.0 {
        return FrameFeatures::missing();
    }
    let (m10, m01) = blob
        .pixels
        .iter()
        .fold((0.0, 0.0), |(sx, sy), p| (sx + p.x as f64, sy + p.y as f64));
    let (cx, cy) = (m10 / m00, m01 / m00);

    let (mut mu20, mut mu02, mut mu11) = (0.0, 0.0, 0.0);
    for p in &blob.pixels {
        let dx = p.x as f64 - cx;
        let dy = p.y as f64 - cy;
        mu20 += dx * dx;
        mu02 += dy * dy;
        mu11 += dx * dy;
    }

    let num = 2.0 * mu11;
    let den = mu20 - mu02;
    let common = (num * num + den * den).sqrt();
    let axis = |sign: f64| 2.0 * 2f64.sqrt() * ((mu20 + mu02 + sign * common) / m00).max(0.0).sqrt();

    FrameFeatures {
        centroid: (cx, cy),
        orientation: -0.5 * num.atan2(den),
        axis_length: (axis(1.0), axis(-1.0)),
        area: m00,
    }
}

/// Foreground of one frame: `depth > min_height`, optionally gated by the likelihood mask.
pub fn foreground(frame: ArrayView2<u16>, likelihood: Option<ArrayView2<f32>>, min_height: f32, mask_threshold: f32) -> Array2<bool> {
    let mut fg = frame.mapv(|v| f32::from(v) > min_height);
    if let Some(ll) = likelihood {
        Zip::from(&mut fg).and(&ll).for_each(|keep, &l| *keep = *keep && l > mask_threshold);
    }
    fg
}

/// Features and the largest-component mask for one frame.
pub fn frame_features(
    frame: ArrayView2<u16>,
    likelihood: Option<ArrayView2<f32>>,
    min_height: f32,
    mask_threshold: f32,
) -> (FrameFeatures, Array2<bool>) {
    let fg = foreground(frame, likelihood, min_height, mask_threshold);
    match blob_detector::largest_blob(fg.view(), Connectivity::Eight) {
        Some(blob) => (blob_features(&blob), blob.to_mask(fg.dim())),
        None => (FrameFeatures::missing(), Array2::from_elem(fg.dim(), false)),
    }
}

/// Per-frame features of a whole batch.
pub struct BatchFeatures {
    pub features: Vec<FrameFeatures>,
    /// Largest-component masks, `(n, rows, cols)`.
    pub masks: Array3<bool>,
}

pub fn batch_features(
    frames: ArrayView3<u16>,
    likelihood: Option<ArrayView3<f32>>,
    min_height: f32,
    mask_threshold: f32,
) -> BatchFeatures {
    let mut masks = Array3::from_elem(frames.dim(), false);
    let mut features = Vec::with_capacity(frames.len_of(Axis(0)));
    for (i, frame) in frames.axis_iter(Axis(0)).enumerate() {
        let ll = likelihood.as_ref().map(|ll| ll.index_axis(Axis(0), i));
        let (f, mask) = frame_features(frame, ll, min_height, mask_threshold);
        masks.index_axis_mut(Axis(0), i).assign(&mask);
        features.push(f);
    }
    BatchFeatures { features, masks }
}

/// Makes an orientation series continuous: `unwrap(2 * theta) / 2`. NaN samples
/// are passed through and do not break the unwrapping.
pub fn unwrap_orientation(angles: &mut [f64]) {
    let mut previous: Option<f64> = None;
    let mut correction = 0.0;
    for angle in angles.iter_mut() {
        if !angle.is_finite() {
            continue;
        }
        let doubled = 2.0 * *angle;
        if let Some(prev) = previous {
            let delta = doubled + correction - prev;
            correction -= 2.0 * PI * ((delta + PI) / (2.0 * PI)).floor();
        }
        let unwrapped = doubled + correction;
        previous = Some(unwrapped);
        *angle = unwrapped / 2.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rectangle(rows: usize, cols: usize, y0: usize, x0: usize, h: usize, w: usize) -> Array2<u16> {
        Array2::from_shape_fn((rows, cols), |(y, x)| {
            if (y0..y0 + h).contains(&y) && (x0..x0 + w).contains(&x) { 50 } else { 0 }
        })
    }

    #[test]
    fn horizontal_bar_has_zero_orientation() {
        let frame = rectangle(20, 40, 8, 5, 4, 20);
        let (f, mask) = frame_features(frame.view(), None, 10.0, 0.0);
        assert!((f.centroid.0 - 14.5).abs() < 1e-9);
        assert!((f.centroid.1 - 9.5).abs() < 1e-9);
        assert!(f.orientation.abs() < 1e-9);
        assert!(f.axis_length.0 > f.axis_length.1);
        assert_eq!(f.area, 80.0);
        assert_eq!(mask.iter().filter(|&&m| m).count(), 80);
    }

    #[test]
    fn vertical_bar_is_a_quarter_turn() {
        let frame = rectangle(40, 20, 5, 8, 20, 4);
        let (f, _) = frame_features(frame.view(), None, 10.0, 0.0);
        assert!((f.orientation.abs() - PI / 2.0).abs() < 1e-9);
    }

    #[test]
    fn empty_frame_is_missing() {
        let frame = Array2::<u16>::zeros((10, 10));
        let (f, mask) = frame_features(frame.view(), None, 10.0, 0.0);
        assert!(f.is_missing());
        assert!(f.area.is_nan());
        assert!(mask.iter().all(|&m| !m));
    }

    #[test]
    fn likelihood_gates_the_foreground() {
        let frame = rectangle(10, 10, 0, 0, 10, 10);
        let ll = Array2::from_shape_fn((10, 10), |(_, x)| if x < 5 { 0.0f32 } else { -50.0 });
        let (f, _) = frame_features(frame.view(), Some(ll.view()), 10.0, -16.0);
        assert_eq!(f.area, 50.0);
        assert!((f.centroid.0 - 2.0).abs() < 1e-9);
    }

    #[test]
    fn unwrap_removes_half_turn_jumps() {
        let mut angles = vec![1.5, -1.55, -1.5, f64::NAN, 1.45];
        unwrap_orientation(&mut angles);
        assert!((angles[1] - (PI - 1.55)).abs() < 1e-9);
        assert!((angles[2] - (PI - 1.5)).abs() < 1e-9);
        assert!(angles[3].is_nan());
        assert!((angles[4] - 1.45).abs() < 1e-9);
    }
}

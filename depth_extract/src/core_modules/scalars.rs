// THEORY:
// Scalars are the per-frame kinematic time series written next to the frames:
// position, heading, size, height and speed. They are derived from the smoothed
// (and flip-corrected) features of one batch plus the cleaned frames and masks.
//
// Speed and heading compare each frame with the one before it. For the first
// frame of a batch that is the last frame before the batch, handed over by the
// orchestrator; only the very first frame of an extraction has speed 0.
//
// Pixel coordinates are converted to millimetres on the floor plane with a
// pinhole model: the camera looks straight down from `true_depth` millimetres
// with the configured field of view.

use crate::config::ExtractConfig;
use crate::core_modules::moment::FrameFeatures;
use ndarray::{ArrayView3, Axis, Zip};

/// Every scalar series written per frame, in output order.
pub const SCALAR_NAMES: [&str; 12] = [
    "centroid_x_px",
    "centroid_y_px",
    "centroid_x_mm",
    "centroid_y_mm",
    "angle",
    "length_px",
    "width_px",
    "area_px",
    "height_ave_mm",
    "velocity_2d_px",
    "velocity_2d_mm",
    "velocity_theta",
];

/// Pinhole camera looking straight down at the floor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraModel {
    /// (width, height) in pixels.
    pub resolution: (usize, usize),
    /// Focal lengths (horizontal, vertical) in pixels.
    focal: (f64, f64),
    pub true_depth: f64,
}

impl CameraModel {
    pub fn new(resolution: (usize, usize), fov_deg: [f64; 2], true_depth: f64) -> Self {
        let focal = |px: usize, fov: f64| px as f64 / (2.0 * (fov / 2.0).to_radians());
        Self {
            resolution,
            focal: (focal(resolution.0, fov_deg[0]), focal(resolution.1, fov_deg[1])),
            true_depth,
        }
    }

    pub fn from_config(config: &ExtractConfig) -> Self {
        let [width, height] = config.frame_size;
        Self::new((width, height), config.camera_fov_deg, config.true_depth)
    }

    /// Pixel coordinates to floor-plane millimetres relative to the optical centre.
    pub fn px_to_mm(&self, x: f64, y: f64) -> (f64, f64) {
        let cx = (self.resolution.0 / 2) as f64;
        let cy = (self.resolution.1 / 2) as f64;
        (
            self.true_depth * (x - cx) / self.focal.0,
            self.true_depth * (y - cy) / self.focal.1,
        )
    }
}

/// Scalar series of one batch, in `SCALAR_NAMES` order.
#[derive(Debug, Clone, PartialEq)]
pub struct Scalars {
    pub series: Vec<(&'static str, Vec<f32>)>,
}

impl Scalars {
    pub fn get(&self, name: &str) -> Option<&[f32]> {
        self.series
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, values)| values.as_slice())
    }

    pub fn len(&self) -> usize {
        self.series.first().map_or(0, |(_, v)| v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Mean height of the masked pixels of each frame; NaN for an empty mask.
fn masked_mean_heights(frames: ArrayView3<u16>, masks: ArrayView3<bool>) -> Vec<f64> {
    frames
        .axis_iter(Axis(0))
        .zip(masks.axis_iter(Axis(0)))
        .map(|(frame, mask)| {
            let (mut sum, mut count) = (0.0, 0usize);
            Zip::from(&frame).and(&mask).for_each(|&v, &m| {
                if m {
                    sum += f64::from(v);
                    count += 1;
                }
            });
            if count == 0 { f64::NAN } else { sum / count as f64 }
        })
        .collect()
}

/// Frame-to-frame speed, starting from `previous` (speed 0 without one).
fn speeds(previous: Option<(f64, f64)>, points: &[(f64, f64)]) -> Vec<f64> {
    steps(previous, points, |a, b| (b.0 - a.0).hypot(b.1 - a.1))
}

/// Direction of travel, starting from `previous` (0 without one).
fn headings(previous: Option<(f64, f64)>, points: &[(f64, f64)]) -> Vec<f64> {
    steps(previous, points, |a, b| (b.1 - a.1).atan2(b.0 - a.0))
}

fn steps(previous: Option<(f64, f64)>, points: &[(f64, f64)], step: impl Fn((f64, f64), (f64, f64)) -> f64) -> Vec<f64> {
    let first = match (previous, points.first()) {
        (Some(a), Some(&b)) => step(a, b),
        _ => 0.0,
    };
    std::iter::once(first)
        .chain(points.windows(2).map(|w| step(w[0], w[1])))
        .take(points.len())
        .collect()
}

/// Scalars of one batch. `previous` holds the features of the frame just
/// before the batch, when there is one.
pub fn compute_scalars(
    frames: ArrayView3<u16>,
    masks: ArrayView3<bool>,
    features: &[FrameFeatures],
    previous: Option<&FrameFeatures>,
    camera: &CameraModel,
) -> Scalars {
    let px: Vec<(f64, f64)> = features.iter().map(|f| f.centroid).collect();
    let mm: Vec<(f64, f64)> = px.iter().map(|&(x, y)| camera.px_to_mm(x, y)).collect();
    let previous_px = previous.map(|f| f.centroid);
    let previous_mm = previous_px.map(|(x, y)| camera.px_to_mm(x, y));

    let columns: [Vec<f64>; 12] = [
        px.iter().map(|p| p.0).collect(),
        px.iter().map(|p| p.1).collect(),
        mm.iter().map(|p| p.0).collect(),
        mm.iter().map(|p| p.1).collect(),
        features.iter().map(|f| f.orientation).collect(),
        features.iter().map(|f| f.axis_length.0).collect(),
        features.iter().map(|f| f.axis_length.1).collect(),
        features.iter().map(|f| f.area).collect(),
        masked_mean_heights(frames, masks),
        speeds(previous_px, &px),
        speeds(previous_mm, &mm),
        headings(previous_px, &px),
    ];

    Scalars {
        series: SCALAR_NAMES
            .iter()
            .zip(columns)
            .map(|(&name, values)| (name, values.into_iter().map(|v| v as f32).collect()))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn feature(x: f64, y: f64) -> FrameFeatures {
        FrameFeatures {
            centroid: (x, y),
            orientation: 0.25,
            axis_length: (30.0, 12.0),
            area: 280.0,
        }
    }

    #[test]
    fn optical_centre_maps_to_origin() {
        let camera = CameraModel::new((512, 424), [70.6, 60.0], 673.1);
        assert_eq!(camera.px_to_mm(256.0, 212.0), (0.0, 0.0));
        let (x_mm, _) = camera.px_to_mm(257.0, 212.0);
        // 673.1 / (512 / (2 * 35.3°)) ≈ 1.62 mm per pixel.
        assert!((x_mm - 1.622).abs() < 0.01, "{x_mm}");
    }

    #[test]
    fn velocities_and_heading() {
        let frames = Array3::from_elem((3, 4, 4), 30u16);
        let masks = Array3::from_elem((3, 4, 4), true);
        let features = vec![feature(0.0, 0.0), feature(3.0, 4.0), feature(3.0, 4.0)];
        let camera = CameraModel::new((4, 4), [70.6, 60.0], 673.1);
        let scalars = compute_scalars(frames.view(), masks.view(), &features, None, &camera);

        assert_eq!(scalars.len(), 3);
        assert_eq!(scalars.series.len(), SCALAR_NAMES.len());
        assert_eq!(scalars.get("velocity_2d_px").unwrap(), &[0.0, 5.0, 0.0]);
        assert_eq!(scalars.get("height_ave_mm").unwrap(), &[30.0, 30.0, 30.0]);
        assert_eq!(scalars.get("length_px").unwrap()[0], 30.0);
        let heading = scalars.get("velocity_theta").unwrap()[1];
        assert!((heading - (4.0f32).atan2(3.0)).abs() < 1e-6);
    }

    #[test]
    fn first_frame_moves_from_the_previous_batch() {
        let frames = Array3::from_elem((2, 4, 4), 30u16);
        let masks = Array3::from_elem((2, 4, 4), true);
        let features = vec![feature(3.0, 4.0), feature(3.0, 5.0)];
        let camera = CameraModel::new((4, 4), [70.6, 60.0], 673.1);
        let previous = feature(0.0, 0.0);
        let scalars = compute_scalars(frames.view(), masks.view(), &features, Some(&previous), &camera);
        assert_eq!(scalars.get("velocity_2d_px").unwrap(), &[5.0, 1.0]);
        let heading = scalars.get("velocity_theta").unwrap()[0];
        assert!((heading - (4.0f32).atan2(3.0)).abs() < 1e-6);

        let missing = FrameFeatures::missing();
        let scalars = compute_scalars(frames.view(), masks.view(), &features, Some(&missing), &camera);
        assert!(scalars.get("velocity_2d_mm").unwrap()[0].is_nan());
    }

    #[test]
    fn missing_frames_stay_nan() {
        let frames = Array3::zeros((2, 2, 2));
        let masks = Array3::from_elem((2, 2, 2), false);
        let features = vec![FrameFeatures::missing(), feature(1.0, 1.0)];
        let camera = CameraModel::new((2, 2), [70.6, 60.0], 673.1);
        let scalars = compute_scalars(frames.view(), masks.view(), &features, None, &camera);
        assert!(scalars.get("centroid_x_mm").unwrap()[0].is_nan());
        assert!(scalars.get("height_ave_mm").unwrap()[1].is_nan());
        assert!(scalars.get("velocity_2d_px").unwrap()[1].is_nan());
    }
}

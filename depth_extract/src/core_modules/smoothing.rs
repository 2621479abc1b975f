// THEORY:
// The `smoothing` module cleans the per-frame feature series of one batch before
// they are used to crop frames and compute scalars.
//
// Key architectural principles:
// 1.  **Order**: orientation unwrap, then Hampel on the centroid coordinates and
//     on the angle, then (tracking model only) likelihood-weighted smoothing.
// 2.  **Circular Angles**: The angle Hampel works modulo 2π. Its replacements come
//     back wrapped, so the series is unwrapped once more before anything blends
//     angles linearly.
// 3.  **Likelihood Weighting**: A frame the tracking model finds unlikely leans on
//     the previous smoothed value; a confident frame keeps its own measurement.

use crate::config::ExtractConfig;
use crate::core_modules::hampel::{self, HampelConfig, HampelError};
use crate::core_modules::moment::{FrameFeatures, unwrap_orientation};

pub struct TrajectorySmoother {
    centroid: Option<HampelConfig>,
    angle: Option<HampelConfig>,
    model_band: Option<(f32, f32)>,
}

impl TrajectorySmoother {
    pub fn from_config(config: &ExtractConfig) -> Result<Self, HampelError> {
        Ok(Self {
            centroid: HampelConfig::from_span(config.centroid_hampel_span, config.centroid_hampel_sig)?,
            angle: HampelConfig::from_span(config.angle_hampel_span, config.angle_hampel_sig)?,
            model_band: config.model_smoothing_band(),
        })
    }

    /// Smooths `features` in place. `mean_log_likelihood` holds one value per
    /// frame when the tracking model ran.
    pub fn smooth(&self, features: &mut [FrameFeatures], mean_log_likelihood: Option<&[f64]>) {
        let mut xs: Vec<f64> = features.iter().map(|f| f.centroid.0).collect();
        let mut ys: Vec<f64> = features.iter().map(|f| f.centroid.1).collect();
        let mut angles: Vec<f64> = features.iter().map(|f| f.orientation).collect();
        unwrap_orientation(&mut angles);

        if let Some(cfg) = &self.centroid {
            xs = hampel::hampel_filter(&xs, cfg).filtered;
            ys = hampel::hampel_filter(&ys, cfg).filtered;
        }
        if let Some(cfg) = &self.angle {
            angles = hampel::circular_hampel_filter(&angles, cfg).filtered;
            unwrap_orientation(&mut angles);
        }

        for (i, f) in features.iter_mut().enumerate() {
            f.centroid = (xs[i], ys[i]);
            f.orientation = angles[i];
        }

        if let (Some((lo, hi)), Some(ll)) = (self.model_band, mean_log_likelihood) {
            let weights = likelihood_weights(ll, lo as f64, hi as f64);
            model_smooth(features, &weights);
        }
    }
}

/// Clamps each mean log-likelihood into `[lo, hi]` and rescales it to `[0, 1]`.
pub fn likelihood_weights(mean_log_likelihood: &[f64], lo: f64, hi: f64) -> Vec<f64> {
    mean_log_likelihood
        .iter()
        .map(|&ll| if ll.is_nan() { 0.0 } else { (ll.clamp(lo, hi) - lo) / (hi - lo) })
        .collect()
}

/// `s[i] = w[i] * x[i] + (1 - w[i]) * s[i - 1]` on every feature. A missing
/// measurement carries the previous smoothed value forward.
pub fn model_smooth(features: &mut [FrameFeatures], weights: &[f64]) {
    fn step(previous: f64, current: f64, w: f64) -> f64 {
        match (previous.is_nan(), current.is_nan()) {
            (true, _) => current,
            (false, true) => previous,
            (false, false) => w * current + (1.0 - w) * previous,
        }
    }

    for i in 1..features.len().min(weights.len()) {
        let previous = features[i - 1];
        let w = weights[i];
        let f = &mut features[i];
        f.centroid.0 = step(previous.centroid.0, f.centroid.0, w);
        f.centroid.1 = step(previous.centroid.1, f.centroid.1, w);
        f.orientation = step(previous.orientation, f.orientation, w);
        f.axis_length.0 = step(previous.axis_length.0, f.axis_length.0, w);
        f.axis_length.1 = step(previous.axis_length.1, f.axis_length.1, w);
        f.area = step(previous.area, f.area, w);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feature(x: f64, angle: f64) -> FrameFeatures {
        FrameFeatures {
            centroid: (x, 10.0),
            orientation: angle,
            axis_length: (20.0, 8.0),
            area: 120.0,
        }
    }

    #[test]
    fn centroid_spike_is_replaced() {
        let mut features: Vec<_> = (0..9).map(|i| feature(i as f64, 0.1)).collect();
        features[4].centroid.0 = 80.0;
        let smoother = TrajectorySmoother::from_config(&ExtractConfig::default()).unwrap();
        smoother.smooth(&mut features, None);
        assert_eq!(features[4].centroid.0, 5.0);
    }

    #[test]
    fn orientation_flip_by_pi_is_unwrapped() {
        let mut features = vec![feature(1.0, 1.5), feature(1.0, -1.6), feature(1.0, 1.52)];
        let config = ExtractConfig {
            angle_hampel_span: 0,
            ..ExtractConfig::default()
        };
        TrajectorySmoother::from_config(&config).unwrap().smooth(&mut features, None);
        assert!((features[1].orientation - (std::f64::consts::PI - 1.6)).abs() < 1e-9);
        assert!((features[2].orientation - 1.52).abs() < 1e-9);
    }

    #[test]
    fn weights_clamp_into_unit_range() {
        let w = likelihood_weights(&[-500.0, -225.0, -10.0, f64::NAN], -300.0, -150.0);
        assert_eq!(w, vec![0.0, 0.5, 1.0, 0.0]);
    }

    #[test]
    fn low_likelihood_frames_lean_on_history() {
        let mut features = vec![feature(0.0, 0.0), feature(10.0, 0.0), feature(20.0, 0.0)];
        model_smooth(&mut features, &[1.0, 0.5, 0.0]);
        assert_eq!(features[1].centroid.0, 5.0);
        assert_eq!(features[2].centroid.0, 5.0);
    }

    #[test]
    fn missing_measurements_carry_forward() {
        let mut features = vec![feature(3.0, 0.2), FrameFeatures::missing(), feature(7.0, 0.2)];
        model_smooth(&mut features, &[1.0, 1.0, 1.0]);
        assert_eq!(features[1].centroid.0, 3.0);
        assert_eq!(features[2].centroid.0, 7.0);
    }
}

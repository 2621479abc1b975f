// THEORY:
// The `tracker` module adds memory to the extraction engine. It models the
// subject as a single 3-D Gaussian over (x, y, depth) and refines that belief
// frame by frame, so that a bright distractor (a cable, a hand) far from where
// the subject was a moment ago is scored as unlikely and ignored.
//
// Key architectural principles:
// 1.  **State As A Value**: A `TrackingState` is a plain `(mean, cov)` pair. It is
//     passed into `track_batch` and the per-frame states come back out. Nothing is
//     kept between calls, so the orchestrator decides what seeds the next batch.
// 2.  **Score, Gate, Refine**: For each frame the previous belief scores every
//     pixel (the log-likelihood mask), pixels below `ll_threshold` are excluded,
//     and a bounded EM refinement over the surviving pixels produces the new
//     belief.
// 3.  **Degeneracy Is Not Fatal**: Too few gated pixels, a covariance that is not
//     positive definite, or non-finite values keep the previous belief and log a
//     warning. A recording never fails because the subject briefly vanished.
// 4.  **Cold Start**: Only the very first batch of a recording has no seed. Its
//     initial belief is the sample mean and covariance of the largest in-band
//     component of an init frame built from the first frames of the batch.

use crate::config::{ExtractConfig, InitMethod};
use crate::core_modules::blob_detector::blob_detector::{self, Connectivity};
use nalgebra::{Matrix3, Vector3};
use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis, Zip};
use std::f64::consts::PI;
use tracing::{debug, warn};

/// Ridge added to every refined covariance.
const COV_RIDGE: f64 = 0.1;
const EM_MAX_ITERATIONS: usize = 25;
/// Relative change of the EM objective below which refinement stops.
const EM_TOLERANCE: f64 = 0.1;
/// Fewer gated pixels than this keeps the previous belief.
const MIN_GATED_PIXELS: usize = 5;

/// The tracking model's belief about the subject: a Gaussian over (x, y, depth).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackingState {
    pub mean: Vector3<f64>,
    pub cov: Matrix3<f64>,
}

/// Precomputed terms for evaluating the Gaussian log-density.
struct LogDensity {
    mean: Vector3<f64>,
    precision: Matrix3<f64>,
    log_norm: f64,
}

impl TrackingState {
    fn log_density(&self) -> Option<LogDensity> {
        if !self.is_finite() {
            return None;
        }
        let chol = self.cov.cholesky()?;
        let log_det = 2.0 * chol.l().diagonal().iter().map(|d| d.ln()).sum::<f64>();
        Some(LogDensity {
            mean: self.mean,
            precision: chol.inverse(),
            log_norm: -0.5 * (3.0 * (2.0 * PI).ln() + log_det),
        })
    }

    pub fn is_finite(&self) -> bool {
        self.mean.iter().all(|v| v.is_finite()) && self.cov.iter().all(|v| v.is_finite())
    }

    /// Blends `self` (the fresh estimate) with `previous`: `rho` is the weight of the previous value.
    fn blend(self, previous: &TrackingState, rho_mean: f64, rho_cov: f64) -> TrackingState {
        TrackingState {
            mean: self.mean * (1.0 - rho_mean) + previous.mean * rho_mean,
            cov: self.cov * (1.0 - rho_cov) + previous.cov * rho_cov,
        }
    }
}

impl LogDensity {
    fn eval(&self, point: &Vector3<f64>) -> f64 {
        let d = point - self.mean;
        self.log_norm - 0.5 * d.dot(&(self.precision * d))
    }
}

/// The tracking options the model consults.
#[derive(Debug, Clone)]
pub struct TrackingParams {
    pub min_height: f32,
    pub max_height: f32,
    pub ll_threshold: f32,
    pub ll_clip: f32,
    pub segment: bool,
    pub init_frames: usize,
    pub init_method: InitMethod,
    pub rho_mean: f64,
    pub rho_cov: f64,
}

impl TrackingParams {
    pub fn from_config(config: &ExtractConfig) -> Self {
        Self {
            min_height: config.min_height,
            max_height: config.max_height,
            ll_threshold: config.tracking_model_ll_threshold,
            ll_clip: config.tracking_model_ll_clip,
            segment: config.tracking_model_segment,
            init_frames: config.tracking_model_init,
            init_method: config.tracking_model_init_method,
            rho_mean: config.tracking_model_rho_mean,
            rho_cov: config.tracking_model_rho_cov,
        }
    }
}

/// Result of tracking one batch.
#[derive(Debug, Clone)]
pub struct TrackingOutput {
    /// Belief after each frame.
    pub states: Vec<TrackingState>,
    /// Per-pixel log-likelihood under the belief before each frame, clipped.
    pub log_likelihood: Array3<f32>,
}

/// Log-likelihood of every pixel `(x, y, depth)` of `frame` under `state`.
/// `None` when the state's covariance is unusable.
pub fn log_likelihood_map(frame: ArrayView2<u16>, state: &TrackingState) -> Option<Array2<f64>> {
    let density = state.log_density()?;
    let (rows, cols) = frame.dim();
    Some(Array2::from_shape_fn((rows, cols), |(y, x)| {
        density.eval(&Vector3::new(x as f64, y as f64, f64::from(frame[[y, x]])))
    }))
}

/// Responsibility-weighted EM refinement of a single Gaussian.
fn em_refine(data: &[Vector3<f64>], start: &TrackingState) -> Option<TrackingState> {
    let mut state = *start;
    let mut previous_objective: Option<f64> = None;

    for _ in 0..EM_MAX_ITERATIONS {
        let density = state.log_density()?;
        let log_p: Vec<f64> = data.iter().map(|p| density.eval(p)).collect();
        let max_log = log_p.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if !max_log.is_finite() {
            return None;
        }
        let weights: Vec<f64> = log_p.iter().map(|l| (l - max_log).exp()).collect();
        let total: f64 = weights.iter().sum();

        let mean = data
            .iter()
            .zip(&weights)
            .fold(Vector3::zeros(), |acc, (p, w)| acc + p * (w / total));
        let cov = data.iter().zip(&weights).fold(Matrix3::zeros(), |acc, (p, w)| {
            let d = p - mean;
            acc + d * d.transpose() * (w / total)
        }) + Matrix3::identity() * COV_RIDGE;
        state = TrackingState { mean, cov };

        let objective: f64 = log_p.iter().sum();
        if let Some(prev) = previous_objective {
            if (objective - prev).abs() < EM_TOLERANCE * prev.abs() {
                break;
            }
        }
        previous_objective = Some(objective);
    }
    state.log_density().map(|_| state)
}

/// Sample mean and covariance of the given points.
fn sample_gaussian(points: &[Vector3<f64>]) -> Option<TrackingState> {
    if points.len() < MIN_GATED_PIXELS {
        return None;
    }
    let n = points.len() as f64;
    let mean = points.iter().fold(Vector3::zeros(), |acc, p| acc + p) / n;
    let cov = points.iter().fold(Matrix3::zeros(), |acc, p| {
        let d = p - mean;
        acc + d * d.transpose()
    }) / (n - 1.0)
        + Matrix3::identity() * COV_RIDGE;
    let state = TrackingState { mean, cov };
    state.log_density().map(|_| state)
}

fn in_band(value: f32, params: &TrackingParams) -> bool {
    value > params.min_height && value < params.max_height
}

/// Builds the cold-start frame from the first frames of a batch.
pub fn init_frame(filtered: ArrayView3<u16>, raw: ArrayView3<u16>, params: &TrackingParams) -> Array2<u16> {
    let n = params.init_frames.clamp(1, filtered.len_of(Axis(0)).max(1));
    let head = filtered.slice(ndarray::s![..n, .., ..]);
    match params.init_method {
        InitMethod::Raw => raw.index_axis(Axis(0), 0).to_owned(),
        InitMethod::Min => head.fold_axis(Axis(0), u16::MAX, |acc, &v| (*acc).min(v)),
        InitMethod::Med => head.map_axis(Axis(0), |series| {
            let mut values = series.to_vec();
            let mid = values.len() / 2;
            *values.select_nth_unstable(mid).1
        }),
    }
}

/// Initial belief from the largest in-band component of `frame`. When the
/// frame has no usable component, a broad belief centred on the frame is used.
pub fn initial_state(frame: ArrayView2<u16>, params: &TrackingParams) -> TrackingState {
    let band = frame.mapv(|v| in_band(f32::from(v), params));
    let points: Vec<Vector3<f64>> = blob_detector::largest_blob(band.view(), Connectivity::Eight)
        .map(|blob| {
            blob.pixels
                .iter()
                .map(|p| Vector3::new(p.x as f64, p.y as f64, f64::from(frame[[p.y, p.x]])))
                .collect()
        })
        .unwrap_or_default();

    sample_gaussian(&points).unwrap_or_else(|| {
        let (rows, cols) = frame.dim();
        warn!(pixels = points.len(), "no usable subject in the init frame; starting from a broad prior");
        let depth = f64::from((params.min_height + params.max_height) / 2.0);
        let spread = f64::from(params.max_height - params.min_height).max(1.0) / 2.0;
        TrackingState {
            mean: Vector3::new(cols as f64 / 2.0, rows as f64 / 2.0, depth),
            cov: Matrix3::from_diagonal(&Vector3::new(
                (cols as f64 / 4.0).powi(2).max(1.0),
                (rows as f64 / 4.0).powi(2).max(1.0),
                spread * spread,
            )),
        }
    })
}

/// Tracks one batch. `filtered` are the cleaned frames used for gating and the
/// mask; `raw` are the preprocessed frames whose depths feed the refinement.
/// Without a `seed` the cold-start belief is built from this batch.
pub fn track_batch(
    filtered: ArrayView3<u16>,
    raw: ArrayView3<u16>,
    seed: Option<TrackingState>,
    params: &TrackingParams,
) -> TrackingOutput {
    let (n, rows, cols) = filtered.dim();
    let mut state = seed.unwrap_or_else(|| {
        let frame = init_frame(filtered, raw, params);
        let state = initial_state(frame.view(), params);
        debug!(mean = ?state.mean.as_slice(), "tracking model cold start");
        state
    });

    let clip = params.ll_clip;
    let mut log_likelihood = Array3::from_elem((n, rows, cols), clip);
    let mut states = Vec::with_capacity(n);

    for i in 0..n {
        let frame = filtered.index_axis(Axis(0), i);
        let depth = raw.index_axis(Axis(0), i);

        let Some(ll) = log_likelihood_map(depth, &state) else {
            warn!(frame = i, "tracking covariance is not positive definite; keeping previous belief");
            states.push(state);
            continue;
        };

        let mut gated = Array2::from_elem((rows, cols), false);
        Zip::from(&mut gated)
            .and(&ll)
            .and(&frame)
            .for_each(|g, &l, &v| *g = l as f32 >= params.ll_threshold && in_band(f32::from(v), params));
        if params.segment {
            gated = blob_detector::largest_component_mask(gated.view(), Connectivity::Four);
        }

        let data: Vec<Vector3<f64>> = gated
            .indexed_iter()
            .filter(|(_, g)| **g)
            .map(|((y, x), _)| Vector3::new(x as f64, y as f64, f64::from(depth[[y, x]])))
            .collect();

        let updated = if data.len() < MIN_GATED_PIXELS {
            None
        } else {
            em_refine(&data, &state)
        };
        match updated {
            Some(fresh) => {
                let blended = fresh.blend(&state, params.rho_mean, params.rho_cov);
                if blended.log_density().is_some() {
                    state = blended;
                } else {
                    warn!(frame = i, "blended tracking state is degenerate; keeping previous belief");
                }
            }
            None => warn!(frame = i, pixels = data.len(), "tracking update degenerate; keeping previous belief"),
        }
        states.push(state);

        let mut out = log_likelihood.index_axis_mut(Axis(0), i);
        Zip::from(&mut out).and(&ll).and(&frame).for_each(|o, &l, &v| {
            let l = l as f32;
            *o = if f32::from(v) < params.min_height || l.is_nan() || l < clip { clip } else { l };
        });
    }

    TrackingOutput { states, log_likelihood }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> TrackingParams {
        TrackingParams::from_config(&ExtractConfig {
            use_tracking_model: true,
            ..ExtractConfig::default()
        })
    }

    /// A square subject of height 40 at (x0, y0).
    fn subject_frame(rows: usize, cols: usize, x0: usize, y0: usize, size: usize) -> Array2<u16> {
        Array2::from_shape_fn((rows, cols), |(y, x)| {
            if (x0..x0 + size).contains(&x) && (y0..y0 + size).contains(&y) { 40 } else { 0 }
        })
    }

    fn stack(frames: &[Array2<u16>]) -> Array3<u16> {
        let views: Vec<_> = frames.iter().map(|f| f.view()).collect();
        ndarray::stack(Axis(0), &views).unwrap()
    }

    #[test]
    fn cold_start_centres_on_the_subject() {
        let frame = subject_frame(40, 40, 10, 20, 8);
        let state = initial_state(frame.view(), &params());
        assert!((state.mean[0] - 13.5).abs() < 1e-9);
        assert!((state.mean[1] - 23.5).abs() < 1e-9);
        assert!((state.mean[2] - 40.0).abs() < 1e-9);
    }

    #[test]
    fn belief_follows_a_moving_subject() {
        let frames: Vec<_> = (0..6).map(|i| subject_frame(40, 60, 10 + 2 * i, 15, 8)).collect();
        let frames = stack(&frames);
        let out = track_batch(frames.view(), frames.view(), None, &params());
        assert_eq!(out.states.len(), 6);
        // The refined mean is a weighted average of subject pixels, so it stays on the subject.
        let last = out.states.last().unwrap();
        assert!((20.0..=27.0).contains(&last.mean[0]), "x = {}", last.mean[0]);
        assert!((last.mean[1] - 18.5).abs() < 0.5);
    }

    #[test]
    fn empty_frames_keep_the_previous_belief() {
        let seed = initial_state(subject_frame(30, 30, 5, 5, 8).view(), &params());
        let frames = Array3::<u16>::zeros((3, 30, 30));
        let out = track_batch(frames.view(), frames.view(), Some(seed), &params());
        assert!(out.states.iter().all(|s| *s == seed));
    }

    #[test]
    fn mask_is_clipped_outside_the_subject() {
        let frames = stack(&[subject_frame(30, 30, 5, 5, 8)]);
        let p = params();
        let out = track_batch(frames.view(), frames.view(), None, &p);
        assert_eq!(out.log_likelihood[[0, 0, 29]], p.ll_clip);
        assert!(out.log_likelihood[[0, 8, 8]] > p.ll_clip);
        assert!(out.log_likelihood.iter().all(|&v| v >= p.ll_clip));
    }

    #[test]
    fn median_init_frame_ignores_a_single_outlier_frame() {
        let mut frames = vec![subject_frame(20, 20, 2, 2, 6); 3];
        frames[1] = subject_frame(20, 20, 12, 12, 6);
        let frames = stack(&frames);
        let p = TrackingParams {
            init_frames: 3,
            init_method: InitMethod::Med,
            ..params()
        };
        let init = init_frame(frames.view(), frames.view(), &p);
        assert_eq!(init, subject_frame(20, 20, 2, 2, 6));
    }

    #[test]
    fn singular_covariance_has_no_density() {
        let state = TrackingState {
            mean: Vector3::zeros(),
            cov: Matrix3::zeros(),
        };
        assert!(log_likelihood_map(Array2::zeros((2, 2)).view(), &state).is_none());
    }
}

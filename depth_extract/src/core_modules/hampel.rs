//! Hampel filter for robust outlier replacement in feature time series.
//!
//! Each sample is compared with the median of a centred window; a sample whose
//! absolute deviation exceeds `threshold` scaled MADs is replaced by that median.
//! NaN samples are skipped by the statistics and never replaced. The circular
//! variant treats values as angles with period 2π.

use std::f64::consts::PI;

/// Scale factor converting MAD to σ for Gaussian data.
const MAD_SCALE: f64 = 1.4826;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HampelConfig {
    /// Samples on each side of the centre (window = 2 * half_window + 1).
    pub half_window: usize,
    /// Threshold in units of scaled MAD.
    pub threshold: f64,
}

impl HampelConfig {
    /// A window of `span` samples centred on each point. `span = 0` disables the filter.
    pub fn from_span(span: usize, threshold: f64) -> Result<Option<Self>, HampelError> {
        if !threshold.is_finite() || threshold <= 0.0 {
            return Err(HampelError::InvalidThreshold(threshold));
        }
        Ok((span > 0).then_some(Self {
            half_window: span / 2,
            threshold,
        }))
    }
}

#[derive(Debug, Clone)]
pub struct HampelResult {
    /// Input with outliers replaced by their window median.
    pub filtered: Vec<f64>,
    pub outlier_indices: Vec<usize>,
}

#[derive(Debug, thiserror::Error)]
pub enum HampelError {
    #[error("hampel threshold must be positive and finite (got {0})")]
    InvalidThreshold(f64),
}

/// Wraps an angle into (-π, π].
pub fn wrap_angle(angle: f64) -> f64 {
    let wrapped = (angle + PI).rem_euclid(2.0 * PI) - PI;
    if wrapped == -PI { PI } else { wrapped }
}

pub fn hampel_filter(signal: &[f64], config: &HampelConfig) -> HampelResult {
    filter_with(signal, config, |window, _| window.to_vec(), |replacement| replacement)
}

/// Hampel filter for angles: each window is unwrapped around its centre sample
/// before the statistics, and replacements are wrapped back into (-π, π].
pub fn circular_hampel_filter(signal: &[f64], config: &HampelConfig) -> HampelResult {
    filter_with(
        signal,
        config,
        |window, centre| window.iter().map(|v| centre + wrap_angle(v - centre)).collect(),
        wrap_angle,
    )
}

fn filter_with(
    signal: &[f64],
    config: &HampelConfig,
    prepare: impl Fn(&[f64], f64) -> Vec<f64>,
    finish: impl Fn(f64) -> f64,
) -> HampelResult {
    let n = signal.len();
    let mut filtered = signal.to_vec();
    let mut outlier_indices = Vec::new();

    for i in 0..n {
        let centre = signal[i];
        if !centre.is_finite() {
            continue;
        }
        let start = i.saturating_sub(config.half_window);
        let end = (i + config.half_window + 1).min(n);
        let window: Vec<f64> = prepare(&signal[start..end], centre)
            .into_iter()
            .filter(|v| v.is_finite())
            .collect();

        let Some(med) = median(&window) else { continue };
        let deviations: Vec<f64> = window.iter().map(|v| (v - med).abs()).collect();
        let sigma = MAD_SCALE * median(&deviations).unwrap_or(0.0);

        let deviation = (centre - med).abs();
        let is_outlier = if sigma > 1e-15 {
            deviation > config.threshold * sigma
        } else {
            // Zero MAD: any departure from the median is an outlier.
            deviation > 1e-15
        };
        if is_outlier {
            filtered[i] = finish(med);
            outlier_indices.push(i);
        }
    }

    HampelResult {
        filtered,
        outlier_indices,
    }
}

/// Median of finite values; `None` when empty.
fn median(data: &[f64]) -> Option<f64> {
    if data.is_empty() {
        return None;
    }
    let mut sorted = data.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    Some(if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(span: usize) -> HampelConfig {
        HampelConfig::from_span(span, 3.0).unwrap().unwrap()
    }

    #[test]
    fn single_outlier_becomes_window_median() {
        let mut signal: Vec<f64> = (0..20).map(|i| i as f64 * 0.5).collect();
        signal[10] = 100.0;
        let result = hampel_filter(&signal, &config(5));
        assert_eq!(result.outlier_indices, vec![10]);
        // window 8..=12 without the spike: 4.0, 4.5, 100, 5.5, 6.0 -> median 5.5
        assert_eq!(result.filtered[10], 5.5);
    }

    #[test]
    fn clean_trajectory_is_unchanged() {
        let signal: Vec<f64> = (0..100).map(|i| 40.0 + 10.0 * (i as f64 * 0.1).sin()).collect();
        let result = hampel_filter(&signal, &config(5));
        assert!(result.outlier_indices.is_empty());
        assert_eq!(result.filtered, signal);
    }

    #[test]
    fn nan_samples_pass_through() {
        let signal = vec![1.0, 1.0, f64::NAN, 1.0, 9.0, 1.0, 1.0];
        let result = hampel_filter(&signal, &config(5));
        assert!(result.filtered[2].is_nan());
        assert_eq!(result.filtered[4], 1.0);
    }

    #[test]
    fn zero_span_disables_and_bad_threshold_errors() {
        assert!(HampelConfig::from_span(0, 3.0).unwrap().is_none());
        assert!(matches!(
            HampelConfig::from_span(5, 0.0),
            Err(HampelError::InvalidThreshold(_))
        ));
    }

    #[test]
    fn angles_straddling_pi_are_not_outliers() {
        let signal = vec![3.10, 3.13, -3.13, 3.12, -3.11, 3.11, -3.14];
        let result = circular_hampel_filter(&signal, &config(5));
        assert!(result.outlier_indices.is_empty(), "{:?}", result.outlier_indices);
        assert_eq!(result.filtered, signal);
    }

    #[test]
    fn circular_replacement_is_wrapped() {
        let signal = vec![-3.1, -3.12, 1.0, 3.13, -3.11];
        let result = circular_hampel_filter(&signal, &config(5));
        assert_eq!(result.outlier_indices, vec![2]);
        // Unwrapped around 1.0, the window median is -3.12 + 2π, just above π.
        assert!((result.filtered[2] + 3.12).abs() < 1e-9, "{}", result.filtered[2]);
    }

    #[test]
    fn wrap_angle_range() {
        assert_eq!(wrap_angle(PI), PI);
        assert_eq!(wrap_angle(-PI), PI);
        assert!((wrap_angle(3.0 * PI / 2.0) + PI / 2.0).abs() < 1e-12);
    }
}

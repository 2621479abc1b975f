// THEORY:
// The aligned crop puts the subject's principal axis along the columns, but the
// moment orientation cannot tell head from tail. An external classifier decides,
// per frame, whether the crop is facing the wrong way. This module consumes
// those decisions; it never trains or runs the classifier itself.
//
// Key architectural principles:
// 1.  **Decisions Are A Seam**: Anything implementing `FlipDecisions` can supply
//     per-frame decisions by absolute recording index.
// 2.  **Runs, Not Flags**: A single positive decision is usually classifier noise.
//     With smoothing `n > 1` a flip only commits inside a run of at least `n`
//     consecutive positives.
// 3.  **Runs Span Batches**: A run is judged on the decisions around a batch, not
//     just inside it, so the committed flips do not depend on the chunking.
// 4.  **Apply Consistently**: A committed flip rotates the crop 180 degrees and
//     adds π to the angle, so the crop and the scalars keep agreeing.

use crate::core_modules::crop::rot180;
use crate::core_modules::hampel::wrap_angle;
use ndarray::{Array3, Axis};
use std::f64::consts::PI;
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};

/// A source of raw per-frame flip decisions.
pub trait FlipDecisions: Send + Sync {
    /// Raw decisions for the absolute frame indices in `frames`.
    fn decisions(&self, frames: Range<usize>) -> Result<Vec<bool>, FlipError>;
}

#[derive(Debug, thiserror::Error)]
pub enum FlipError {
    #[error("could not read flip decisions {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse flip decisions {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("flip decisions cover {available} frames, frame {requested} was requested")]
    OutOfRange { requested: usize, available: usize },
}

/// Decisions precomputed by an external classifier, one 0/1 per recording frame.
#[derive(Debug, Clone)]
pub struct PrecomputedFlips {
    flags: Vec<bool>,
}

impl PrecomputedFlips {
    pub fn new(flags: Vec<bool>) -> Self {
        Self { flags }
    }

    /// Loads a JSON array of 0/1 values.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, FlipError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| FlipError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let values: Vec<u8> = serde_json::from_str(&content).map_err(|source| FlipError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::new(values.into_iter().map(|v| v != 0).collect()))
    }

    pub fn len(&self) -> usize {
        self.flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }
}

impl FlipDecisions for PrecomputedFlips {
    fn decisions(&self, frames: Range<usize>) -> Result<Vec<bool>, FlipError> {
        if frames.end > self.flags.len() {
            return Err(FlipError::OutOfRange {
                requested: frames.end.saturating_sub(1),
                available: self.flags.len(),
            });
        }
        Ok(self.flags[frames].to_vec())
    }
}

/// Commits only positives that belong to a run of at least `min_run` consecutive
/// positives. `min_run <= 1` keeps every positive.
pub fn smooth_flips(raw: &[bool], min_run: usize) -> Vec<bool> {
    if min_run <= 1 {
        return raw.to_vec();
    }
    let mut smoothed = vec![false; raw.len()];
    let mut i = 0;
    while i < raw.len() {
        if !raw[i] {
            i += 1;
            continue;
        }
        let start = i;
        while i < raw.len() && raw[i] {
            i += 1;
        }
        if i - start >= min_run {
            smoothed[start..i].fill(true);
        }
    }
    smoothed
}

/// Committed flips for the absolute frames in `frames`. Runs are judged over
/// up to `min_run - 1` decisions on either side, clipped to `bounds` (the
/// extracted range of the recording).
pub fn committed_flips(
    source: &dyn FlipDecisions,
    frames: Range<usize>,
    bounds: Range<usize>,
    min_run: usize,
) -> Result<Vec<bool>, FlipError> {
    let reach = min_run.saturating_sub(1);
    let start = frames.start.saturating_sub(reach).max(bounds.start).min(frames.start);
    let end = (frames.end + reach).min(bounds.end).max(frames.end);
    let smoothed = smooth_flips(&source.decisions(start..end)?, min_run);
    Ok(smoothed[frames.start - start..frames.end - start].to_vec())
}

/// Rotates flagged crops by 180 degrees and turns their angles by π.
pub fn apply_flips(crops: &mut Array3<u16>, angles: &mut [f64], flips: &[bool]) {
    for (i, mut crop) in crops.axis_iter_mut(Axis(0)).enumerate() {
        if !flips.get(i).copied().unwrap_or(false) {
            continue;
        }
        let rotated = rot180(crop.view());
        crop.assign(&rotated);
        if let Some(angle) = angles.get_mut(i) {
            if angle.is_finite() {
                *angle = wrap_angle(*angle + PI);
            }
        }
    }
}

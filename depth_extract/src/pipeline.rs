// THEORY:
// The `pipeline` module is the top-level API of the extraction engine. It turns a
// recording into batches and runs every batch through the full stack:
//
//   preprocess -> clean -> track -> features -> smooth -> crop -> flip -> scalars
//
// and hands the retained part of each batch to every sink.
//
// Key architectural principles:
// 1.  **Sequential Batches**: Batches of one recording run strictly in order. What
//     crosses a batch boundary is passed explicitly as a `BatchCarry`: the
//     tracking belief and the features at `len - (chunk_overlap + 1)`, the frame
//     just before the next batch's first frame.
// 2.  **Warm-Up Frames**: Every batch after the first re-reads `chunk_overlap`
//     frames so the temporal filters and the smoother start warm. Those frames
//     are processed but never written.
// 3.  **Fail Loud, Close Always**: Any failure stops the extraction and names the
//     batch and frame range. Every sink is closed exactly once on every path,
//     so the frames already written stay intact and the encoder is reaped.

use crate::config::ExtractConfig;
use crate::core_modules::batch::FrameBatch;
use crate::core_modules::crop::crop_and_rotate;
use crate::core_modules::flip::{FlipDecisions, apply_flips, committed_flips};
use crate::core_modules::frame_source::FrameSource;
use crate::core_modules::hampel::wrap_angle;
use crate::core_modules::moment::{FrameFeatures, batch_features};
use crate::core_modules::morphology::FrameCleaner;
use crate::core_modules::preprocess::preprocess_frames;
use crate::core_modules::scalars::{CameraModel, Scalars, compute_scalars};
use crate::core_modules::smoothing::TrajectorySmoother;
use crate::core_modules::tracker::{TrackingParams, TrackingState, track_batch};
use crate::error::ExtractError;
use crate::sinks::{ExtractionSink, RetainedBatch};
use ndarray::{Array2, Array3, ArrayView3, Axis, Zip, s};
use std::ops::Range;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Everything one batch produced, warm-up frames included.
#[derive(Debug, Clone)]
pub struct BatchResult {
    pub batch: FrameBatch,
    /// Absolute recording index of the first frame read for this batch.
    pub recording_start: usize,
    /// Background-subtracted frames.
    pub frames: Array3<u16>,
    pub cleaned: Array3<u16>,
    /// Clipped log-likelihood with the tracking model, otherwise the 0/1 subject mask.
    pub masks: Array3<f32>,
    pub crops: Array3<u16>,
    pub features: Vec<FrameFeatures>,
    pub scalars: Scalars,
    pub flips: Option<Vec<bool>>,
    /// Tracking belief after each frame; empty without the tracking model.
    pub states: Vec<TrackingState>,
}

/// State handed from one batch to the next.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BatchCarry {
    /// Tracking belief that seeds the batch; `None` for a cold start.
    pub seed: Option<TrackingState>,
    /// Features of the frame just before the batch, for speed and heading.
    pub previous: Option<FrameFeatures>,
}

impl BatchResult {
    /// The belief that seeds the batch starting `chunk_overlap` frames before this one ends.
    pub fn seed_for_next(&self, chunk_overlap: usize) -> Option<TrackingState> {
        let index = self.states.len().checked_sub(chunk_overlap + 1)?;
        self.states.get(index).copied()
    }

    /// Everything the batch starting `chunk_overlap` frames before this one ends needs.
    pub fn carry_for_next(&self, chunk_overlap: usize) -> BatchCarry {
        let previous = self
            .features
            .len()
            .checked_sub(chunk_overlap + 1)
            .and_then(|index| self.features.get(index).copied());
        BatchCarry {
            seed: self.seed_for_next(chunk_overlap),
            previous,
        }
    }

    /// The part of this batch that is written.
    pub fn retained(&self) -> RetainedBatch<'_> {
        let offset = self.batch.offset;
        RetainedBatch {
            batch: &self.batch,
            output_range: self.batch.retained(),
            recording_start: self.recording_start + offset,
            frames: self.frames.slice(s![offset.., .., ..]),
            cleaned: self.cleaned.slice(s![offset.., .., ..]),
            masks: self.masks.slice(s![offset.., .., ..]),
            crops: self.crops.slice(s![offset.., .., ..]),
            scalars: self
                .scalars
                .series
                .iter()
                .map(|(name, values)| (*name, &values[offset..]))
                .collect(),
            flips: self.flips.as_deref().map(|flips| &flips[offset..]),
        }
    }
}

/// What happened to one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchReport {
    pub index: usize,
    /// Absolute recording frames read.
    pub frames: Range<usize>,
    pub offset: usize,
    /// Belief the tracking model started from; `None` for a cold start.
    pub seed: Option<TrackingState>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionSummary {
    pub frames_written: usize,
    pub batches: Vec<BatchReport>,
}

/// The full extraction engine for one recording.
pub struct ExtractionPipeline {
    config: ExtractConfig,
    background: Arc<Array2<f32>>,
    roi: Arc<Array2<bool>>,
    cleaner: FrameCleaner,
    smoother: TrajectorySmoother,
    tracking: Option<TrackingParams>,
    camera: CameraModel,
    flips: Option<Arc<dyn FlipDecisions>>,
}

impl ExtractionPipeline {
    /// Validates `config` and checks the background and ROI against its frame size.
    pub fn new(config: ExtractConfig, background: Arc<Array2<f32>>, roi: Arc<Array2<bool>>) -> Result<Self, ExtractError> {
        config.validate()?;
        let expected = config.frame_shape();
        for (what, got) in [("background", background.dim()), ("roi", roi.dim())] {
            if got != expected {
                return Err(ExtractError::ShapeMismatch { what, expected, got });
            }
        }
        Ok(Self {
            cleaner: FrameCleaner::new(&config)?,
            smoother: TrajectorySmoother::from_config(&config)?,
            tracking: config.use_tracking_model.then(|| TrackingParams::from_config(&config)),
            camera: CameraModel::from_config(&config),
            flips: None,
            config,
            background,
            roi,
        })
    }

    /// Enables flip correction with the given decision source.
    pub fn with_flip_decisions(mut self, flips: Arc<dyn FlipDecisions>) -> Self {
        self.flips = Some(flips);
        self
    }

    pub fn config(&self) -> &ExtractConfig {
        &self.config
    }

    pub fn flip_correction(&self) -> bool {
        self.flips.is_some()
    }

    /// Number of frames extracted from a recording of `frame_count` frames.
    pub fn extraction_len(&self, frame_count: usize) -> usize {
        let available = frame_count.saturating_sub(self.config.first_frame);
        self.config.num_frames.map_or(available, |n| n.min(available))
    }

    /// Runs one batch through every stage. `raw` holds the batch's frames and
    /// `extracted` is the absolute range of recording frames being extracted.
    pub fn process_batch(
        &self,
        batch: &FrameBatch,
        raw: ArrayView3<u16>,
        extracted: Range<usize>,
        carry: BatchCarry,
    ) -> Result<BatchResult, ExtractError> {
        let recording_start = extracted.start + batch.start;
        let config = &self.config;
        let n = raw.len_of(Axis(0));

        // Stage 1: Background subtraction, height band and ROI
        let frames = preprocess_frames(raw, self.background.view(), self.roi.view(), config);

        // Stage 2: Morphological cleanup
        let cleaned = self.cleaner.clean_batch(&frames)?;

        // Stage 3: Tracking model (optional)
        let tracking = self
            .tracking
            .as_ref()
            .map(|params| track_batch(cleaned.view(), frames.view(), carry.seed, params));
        let likelihood = tracking.as_ref().map(|t| t.log_likelihood.view());

        // Stage 4: Per-frame features
        let mut measured = batch_features(
            cleaned.view(),
            likelihood,
            config.min_height,
            config.tracking_model_mask_threshold,
        );
        let missing = measured.features.iter().filter(|f| f.is_missing()).count();
        if missing > 0 {
            debug!(batch = batch.index, missing, "frames without a detectable subject");
        }

        // Stage 5: Trajectory smoothing
        let mean_ll = tracking
            .as_ref()
            .map(|t| masked_mean(&t.log_likelihood, &measured.masks));
        self.smoother.smooth(&mut measured.features, mean_ll.as_deref());

        // Stage 6: Aligned crops
        let crop_shape = config.crop_shape();
        let mut crops = Array3::zeros((n, crop_shape.0, crop_shape.1));
        for (i, mut crop) in crops.axis_iter_mut(Axis(0)).enumerate() {
            crop.assign(&crop_and_rotate(cleaned.index_axis(Axis(0), i), &measured.features[i], crop_shape)?);
        }

        // Stage 7: Flip correction (optional)
        let flips = match &self.flips {
            Some(source) => {
                let committed = committed_flips(
                    source.as_ref(),
                    recording_start..recording_start + n,
                    extracted.clone(),
                    config.flip_classifier_smoothing,
                )?;
                let mut angles: Vec<f64> = measured.features.iter().map(|f| f.orientation).collect();
                apply_flips(&mut crops, &mut angles, &committed);
                for (f, angle) in measured.features.iter_mut().zip(angles) {
                    f.orientation = angle;
                }
                Some(committed)
            }
            None => None,
        };

        // Stage 8: Scalars
        for f in measured.features.iter_mut().filter(|f| f.orientation.is_finite()) {
            f.orientation = wrap_angle(f.orientation);
        }
        let scalars = compute_scalars(
            cleaned.view(),
            measured.masks.view(),
            &measured.features,
            carry.previous.as_ref(),
            &self.camera,
        );

        let (masks, states) = match tracking {
            Some(t) => (t.log_likelihood, t.states),
            None => (measured.masks.mapv(|m| if m { 1.0 } else { 0.0 }), Vec::new()),
        };

        Ok(BatchResult {
            batch: batch.clone(),
            recording_start,
            frames,
            cleaned,
            masks,
            crops,
            features: measured.features,
            scalars,
            flips,
            states,
        })
    }

    /// Extracts the configured range of `source` into every sink, batch by batch.
    /// Every sink is closed before this returns, whatever the outcome.
    pub fn run(
        &self,
        source: &mut dyn FrameSource,
        sinks: &mut [&mut dyn ExtractionSink],
    ) -> Result<ExtractionSummary, ExtractError> {
        let outcome = self.run_batches(source, sinks);
        let closed = close_all(sinks);
        let summary = outcome?;
        closed?;
        Ok(summary)
    }

    fn run_batches(
        &self,
        source: &mut dyn FrameSource,
        sinks: &mut [&mut dyn ExtractionSink],
    ) -> Result<ExtractionSummary, ExtractError> {
        // `expected` is always the recording's frame shape, as for the background and ROI.
        let recording = source.frame_shape();
        let configured = self.config.frame_shape();
        if configured != recording {
            return Err(ExtractError::ShapeMismatch {
                what: "configured frame_size",
                expected: recording,
                got: configured,
            });
        }

        let total = self.extraction_len(source.frame_count());
        if total == 0 {
            return Err(ExtractError::EmptyRecording);
        }
        let first = self.config.first_frame;
        let overlap = self.config.chunk_overlap;
        let batches = FrameBatch::partition(total, self.config.chunk_size, overlap);
        info!(frames = total, batches = batches.len(), first_frame = first, "starting extraction");

        let extracted = first..first + total;
        let mut carry = BatchCarry::default();
        let mut reports = Vec::with_capacity(batches.len());
        let mut frames_written = 0;
        for batch in &batches {
            let frames = first + batch.start..first + batch.end;
            let result = self
                .run_batch(batch, extracted.clone(), carry, source, sinks)
                .map_err(|e| e.in_batch(batch.index, frames.clone()))?;
            frames_written += batch.retained().len();
            info!(batch = batch.index, frames = ?frames, written = frames_written, "batch complete");

            reports.push(BatchReport {
                index: batch.index,
                frames,
                offset: batch.offset,
                seed: carry.seed,
            });
            carry = result.carry_for_next(overlap);
        }

        Ok(ExtractionSummary {
            frames_written,
            batches: reports,
        })
    }

    fn run_batch(
        &self,
        batch: &FrameBatch,
        extracted: Range<usize>,
        carry: BatchCarry,
        source: &mut dyn FrameSource,
        sinks: &mut [&mut dyn ExtractionSink],
    ) -> Result<BatchResult, ExtractError> {
        let indices: Vec<usize> = (extracted.start + batch.start..extracted.start + batch.end).collect();
        let raw = source.read(&indices)?;
        let result = self.process_batch(batch, raw.view(), extracted, carry)?;
        let retained = result.retained();
        for sink in sinks.iter_mut() {
            sink.write_batch(&retained).map_err(|source| ExtractError::Sink {
                sink: sink.name().to_string(),
                source,
            })?;
        }
        Ok(result)
    }
}

/// Closes every sink, even after one fails, and reports the first failure.
fn close_all(sinks: &mut [&mut dyn ExtractionSink]) -> Result<(), ExtractError> {
    let mut first_error = None;
    for sink in sinks.iter_mut() {
        if let Err(source) = sink.close() {
            warn!(sink = sink.name(), error = %source, "failed to close sink");
            first_error.get_or_insert(ExtractError::Sink {
                sink: sink.name().to_string(),
                source,
            });
        }
    }
    first_error.map_or(Ok(()), Err)
}

/// Mean log-likelihood over each frame's mask; NaN where the mask is empty.
fn masked_mean(likelihood: &Array3<f32>, masks: &Array3<bool>) -> Vec<f64> {
    likelihood
        .axis_iter(Axis(0))
        .zip(masks.axis_iter(Axis(0)))
        .map(|(ll, mask)| {
            let (mut sum, mut count) = (0.0, 0usize);
            Zip::from(&ll).and(&mask).for_each(|&l, &m| {
                if m {
                    sum += f64::from(l);
                    count += 1;
                }
            });
            if count == 0 { f64::NAN } else { sum / count as f64 }
        })
        .collect()
}

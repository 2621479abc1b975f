// THEORY:
// Sinks are where extraction results leave the engine. The orchestrator does
// not know what a sink does with a batch; it hands every sink the same
// `RetainedBatch` (already trimmed of its warm-up frames) through the
// `ExtractionSink` trait and closes each one exactly once at the end.
//
// Key architectural principles:
// 1.  **One Interface**: The structured store and the preview encoder are
//     consumed polymorphically as `&mut dyn ExtractionSink`.
// 2.  **Views, Not Copies**: A `RetainedBatch` borrows slices of the batch result.
// 3.  **Explicit Close**: `close` reports the outcome of finishing the sink.
//     Dropping a sink that was never closed still releases its resources.

pub mod preview;
pub mod store;

use crate::core_modules::batch::FrameBatch;
use ndarray::ArrayView3;
use std::ops::Range;

pub use preview::{EncoderError, PreviewEncoder, PreviewSettings};
pub use store::{FrameStore, Manifest, MemoryStore, StoreError, StoreLayout, StoredRecording};

/// The retained part of one processed batch, as handed to every sink.
#[derive(Debug, Clone)]
pub struct RetainedBatch<'a> {
    pub batch: &'a FrameBatch,
    /// Output indices covered, relative to the first extracted frame.
    pub output_range: Range<usize>,
    /// Absolute recording index of the first retained frame.
    pub recording_start: usize,
    /// Background-subtracted frames, `(n, rows, cols)`.
    pub frames: ArrayView3<'a, u16>,
    /// Frames after morphological cleanup.
    pub cleaned: ArrayView3<'a, u16>,
    pub masks: ArrayView3<'a, f32>,
    pub crops: ArrayView3<'a, u16>,
    /// Scalar series in output order.
    pub scalars: Vec<(&'static str, &'a [f32])>,
    /// Committed flip decisions, when flip correction is enabled.
    pub flips: Option<&'a [bool]>,
}

impl RetainedBatch<'_> {
    pub fn len(&self) -> usize {
        self.output_range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.output_range.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Encoder(#[from] EncoderError),
}

/// Anything that consumes extraction results batch by batch.
pub trait ExtractionSink: Send {
    fn name(&self) -> &str;
    fn write_batch(&mut self, batch: &RetainedBatch<'_>) -> Result<(), SinkError>;
    fn close(&mut self) -> Result<(), SinkError>;
}

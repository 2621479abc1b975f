use crate::config::ConfigError;
use crate::core_modules::containers::ContainerError;
use crate::core_modules::flip::FlipError;
use crate::core_modules::frame_source::SourceError;
use crate::core_modules::hampel::HampelError;
use crate::sinks::SinkError;
use std::ops::Range;

/// Everything that can stop an extraction.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Container(#[from] ContainerError),
    #[error(transparent)]
    Flip(#[from] FlipError),
    #[error(transparent)]
    Hampel(#[from] HampelError),
    #[error("image processing failed: {0}")]
    Imgproc(#[from] opencv::Error),
    #[error("{sink}: {source}")]
    Sink {
        sink: String,
        #[source]
        source: SinkError,
    },
    #[error("{what} is {got:?} but the recording frames are {expected:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: (usize, usize),
        got: (usize, usize),
    },
    #[error("recording has no frames to extract")]
    EmptyRecording,
    #[error("batch {index} (frames {}..{}) failed: {source}", range.start, range.end)]
    Batch {
        index: usize,
        range: Range<usize>,
        #[source]
        source: Box<ExtractError>,
    },
    #[error("could not prepare output {path}: {source}")]
    Output {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("extraction worker failed: {0}")]
    Worker(String),
}

impl ExtractError {
    pub(crate) fn in_batch(self, index: usize, range: Range<usize>) -> Self {
        ExtractError::Batch {
            index,
            range,
            source: Box::new(self),
        }
    }
}

// THEORY:
// This file is the main entry point for the `depth_extract` library crate.
// It defines the public API exposed to consumers such as the `extract_runner`
// binary.
//
// The primary interface is the `ExtractionPipeline` (one recording, batch by
// batch) and the `ExtractionPool` (many recordings in parallel), together with
// `ExtractConfig` and the sinks results are written to. The stage-level
// `core_modules` are public as well so individual stages can be reused and
// tested on their own.

pub mod config;
pub mod core_modules;
pub mod error;
pub mod parallel_pipeline;
pub mod pipeline;
pub mod session;
pub mod sinks;

pub use config::ExtractConfig;
pub use error::ExtractError;
pub use parallel_pipeline::ExtractionPool;
pub use pipeline::{BatchCarry, BatchReport, BatchResult, ExtractionPipeline, ExtractionSummary};
pub use session::{ExtractionJob, RecordingSummary, extract_recording};

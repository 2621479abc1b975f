// THEORY:
// A session is one recording extracted end to end: open the raw depth stream,
// build the pipeline, open the store and the preview encoder under the output
// directory, run, and report where everything went. It is the unit of work the
// `ExtractionPool` schedules.

use crate::config::ExtractConfig;
use crate::core_modules::flip::{FlipDecisions, PrecomputedFlips};
use crate::core_modules::frame_source::{FrameSource, RawDepthFile};
use crate::error::ExtractError;
use crate::pipeline::ExtractionPipeline;
use crate::sinks::{ExtractionSink, FrameStore, PreviewEncoder, PreviewSettings, StoreLayout};
use ndarray::Array2;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// One recording to extract.
#[derive(Clone)]
pub struct ExtractionJob {
    /// Output file stem: `<output_dir>/<name>.manifest.json`, `<output_dir>/<name>.mp4`.
    pub name: String,
    /// Raw depth file, or a tar archive holding it.
    pub input: PathBuf,
    pub output_dir: PathBuf,
    pub background: Arc<Array2<f32>>,
    pub roi: Arc<Array2<bool>>,
    /// Overrides `flip_classifier` from the config.
    pub flips: Option<Arc<dyn FlipDecisions>>,
    pub preview: bool,
}

impl std::fmt::Debug for ExtractionJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractionJob")
            .field("name", &self.name)
            .field("input", &self.input)
            .field("output_dir", &self.output_dir)
            .field("flips", &self.flips.is_some())
            .field("preview", &self.preview)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordingSummary {
    pub name: String,
    pub frames_written: usize,
    pub batches: usize,
    pub manifest: PathBuf,
    pub preview: Option<PathBuf>,
}

/// Extracts one recording into its store (and preview, when enabled).
pub fn extract_recording(job: &ExtractionJob, config: &ExtractConfig) -> Result<RecordingSummary, ExtractError> {
    info!(recording = %job.name, input = %job.input.display(), "extracting recording");
    fs::create_dir_all(&job.output_dir).map_err(|source| ExtractError::Output {
        path: job.output_dir.clone(),
        source,
    })?;

    let mut source = RawDepthFile::open_recording(&job.input, &config.archive_member, config.frame_size)?;
    let mut pipeline = ExtractionPipeline::new(config.clone(), Arc::clone(&job.background), Arc::clone(&job.roi))?;
    let flips: Option<Arc<dyn FlipDecisions>> = match (&job.flips, &config.flip_classifier) {
        (Some(flips), _) => Some(Arc::clone(flips)),
        (None, Some(path)) => Some(Arc::new(PrecomputedFlips::load(path)?)),
        (None, None) => None,
    };
    if let Some(flips) = flips {
        pipeline = pipeline.with_flip_decisions(flips);
    }

    let total = pipeline.extraction_len(source.frame_count());
    if total == 0 {
        return Err(ExtractError::EmptyRecording);
    }
    let layout = StoreLayout {
        total_frames: total,
        frame_shape: config.frame_shape(),
        crop_shape: config.crop_shape(),
        frame_dtype: config.frame_dtype,
        with_flips: pipeline.flip_correction(),
    };
    let parameters = serde_json::to_value(config).unwrap_or_else(|e| {
        warn!(error = %e, "could not record extraction parameters");
        serde_json::Value::Null
    });
    let mut store = FrameStore::create(&job.output_dir, &job.name, layout, parameters).map_err(|e| ExtractError::Sink {
        sink: "frame store".to_string(),
        source: e.into(),
    })?;

    let mut preview = job
        .preview
        .then(|| PreviewEncoder::new(job.output_dir.join(format!("{}.mp4", job.name)), preview_settings(config)));

    let summary = {
        let mut sinks: Vec<&mut dyn ExtractionSink> = Vec::with_capacity(2);
        sinks.push(&mut store);
        if let Some(preview) = preview.as_mut() {
            sinks.push(preview);
        }
        pipeline.run(&mut source, &mut sinks)?
    };

    info!(
        recording = %job.name,
        frames = summary.frames_written,
        batches = summary.batches.len(),
        "recording extracted"
    );
    Ok(RecordingSummary {
        name: job.name.clone(),
        frames_written: summary.frames_written,
        batches: summary.batches.len(),
        manifest: store.manifest_path().to_path_buf(),
        preview: preview.as_ref().map(|p| p.output().to_path_buf()),
    })
}

/// Preview colours span the extracted height band.
fn preview_settings(config: &ExtractConfig) -> PreviewSettings {
    PreviewSettings {
        encoder: config.encoder.clone(),
        fps: config.fps,
        depth_range: (config.min_height, config.max_height),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EncoderConfig, FrameDtype};
    use crate::sinks::StoredRecording;
    use byteorder::{LittleEndian, WriteBytesExt};
    use std::io::Write;

    fn write_recording(path: &std::path::Path, frames: usize) {
        let mut file = std::fs::File::create(path).unwrap();
        for _ in 0..frames {
            for y in 0..6 {
                for x in 0..8 {
                    let depth = if (2..4).contains(&y) && (2..6).contains(&x) { 50 } else { 80 };
                    file.write_u16::<LittleEndian>(depth).unwrap();
                }
            }
        }
        file.flush().unwrap();
    }

    fn job(dir: &std::path::Path, preview: bool) -> ExtractionJob {
        ExtractionJob {
            name: "session".to_string(),
            input: dir.join("depth.dat"),
            output_dir: dir.join("proc"),
            background: Arc::new(Array2::from_elem((6, 8), 80.0)),
            roi: Arc::new(Array2::from_elem((6, 8), true)),
            flips: None,
            preview,
        }
    }

    fn config() -> ExtractConfig {
        ExtractConfig {
            frame_size: [8, 6],
            crop_size: [4, 4],
            chunk_size: 4,
            chunk_overlap: 1,
            tail_filter_iters: 0,
            frame_dtype: FrameDtype::U16,
            spatial_filter_size: Vec::new(),
            ..ExtractConfig::default()
        }
    }

    #[test]
    fn writes_store_and_preview() {
        let dir = tempfile::tempdir().unwrap();
        write_recording(&dir.path().join("depth.dat"), 10);
        let config = ExtractConfig {
            encoder: EncoderConfig {
                program: "sh".to_string(),
                args: Some(vec!["-c".to_string(), "cat > {output}".to_string()]),
                ..EncoderConfig::default()
            },
            ..config()
        };

        let summary = extract_recording(&job(dir.path(), true), &config).unwrap();
        assert_eq!(summary.frames_written, 10);
        assert_eq!(summary.batches, 3);

        let stored = StoredRecording::open(&summary.manifest).unwrap();
        assert!(stored.manifest.complete);
        let frames = stored.frames().unwrap();
        assert_eq!(frames.dim(), (10, 6, 8));
        assert_eq!(frames[[9, 2, 2]], 30);
        assert_eq!(frames[[9, 0, 0]], 0);

        // Canvas is (2 * 8 + 4) x 6 rgb24 per frame.
        let preview = std::fs::read(summary.preview.unwrap()).unwrap();
        assert_eq!(preview.len(), 10 * 20 * 6 * 3);
    }

    #[test]
    fn preview_colours_span_the_height_band() {
        let config = ExtractConfig {
            min_height: 15.0,
            max_height: 90.0,
            ..config()
        };
        let settings = preview_settings(&config);
        assert_eq!(settings.depth_range, (15.0, 90.0));
        assert_eq!(settings.fps, config.fps);
    }

    #[test]
    fn mismatched_roi_is_rejected_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        write_recording(&dir.path().join("depth.dat"), 4);
        let mut job = job(dir.path(), false);
        job.roi = Arc::new(Array2::from_elem((5, 8), true));
        let err = extract_recording(&job, &config()).unwrap_err();
        assert!(matches!(err, ExtractError::ShapeMismatch { what: "roi", .. }));
        assert!(!dir.path().join("proc/session.manifest.json").exists());
    }
}

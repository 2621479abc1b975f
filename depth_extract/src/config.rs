// THEORY:
// The `config` module is the single tunable surface of the extraction engine.
// Every threshold, window and switch the pipeline consults lives on
// `ExtractConfig`, which is deserialized from TOML with per-field defaults so a
// config file only has to mention what it changes.
//
// Validation happens once, before any frame is read. A bad option is a fatal
// configuration error at orchestration start, never a surprise halfway through
// a recording.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Numeric precision of the stored depth frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameDtype {
    U8,
    U16,
}

/// How the tracking model builds its cold-start frame from the first frames of a recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitMethod {
    /// Per-pixel minimum over the init frames.
    Min,
    /// Per-pixel median over the init frames.
    Med,
    /// The first preprocessed (unfiltered) frame.
    Raw,
}

/// Settings for the external preview encoder process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Executable to spawn.
    #[serde(default = "default_encoder_program")]
    pub program: String,
    #[serde(default = "default_encoder_codec")]
    pub codec: String,
    /// Pixel format of the encoded stream (input is always rgb24).
    #[serde(default = "default_encoder_pixel_format")]
    pub pixel_format: String,
    #[serde(default = "default_encoder_threads")]
    pub threads: usize,
    /// Frames buffered between the pipeline and the encoder's stdin.
    #[serde(default = "default_encoder_queue_depth")]
    pub queue_depth: usize,
    /// Replaces the generated ffmpeg argument list. `{width}`, `{height}`,
    /// `{fps}` and `{output}` are substituted.
    #[serde(default)]
    pub args: Option<Vec<String>>,
}

fn default_encoder_program() -> String { "ffmpeg".to_string() }
fn default_encoder_codec() -> String { "h264".to_string() }
fn default_encoder_pixel_format() -> String { "yuv420p".to_string() }
fn default_encoder_threads() -> usize { 2 }
fn default_encoder_queue_depth() -> usize { 32 }

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            program: default_encoder_program(),
            codec: default_encoder_codec(),
            pixel_format: default_encoder_pixel_format(),
            threads: default_encoder_threads(),
            queue_depth: default_encoder_queue_depth(),
            args: None,
        }
    }
}

/// Every option the extraction core consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractConfig {
    // --- Recording ---
    /// Frame dimensions of the raw recording as (width, height).
    #[serde(default = "default_frame_size")]
    pub frame_size: [usize; 2],
    /// Member name of the depth stream when the recording is a tar archive.
    #[serde(default = "default_archive_member")]
    pub archive_member: String,
    /// First recording frame to extract.
    #[serde(default)]
    pub first_frame: usize,
    /// Number of frames to extract; everything after `first_frame` when unset.
    #[serde(default)]
    pub num_frames: Option<usize>,

    // --- Batching ---
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default)]
    pub chunk_overlap: usize,

    // --- Depth band ---
    #[serde(default = "default_min_height")]
    pub min_height: f32,
    #[serde(default = "default_max_height")]
    pub max_height: f32,
    /// When exactly 1, heights above `max_height` are clamped instead of zeroed.
    #[serde(default)]
    pub dilate_iterations: usize,
    #[serde(default = "default_frame_dtype")]
    pub frame_dtype: FrameDtype,

    // --- Morphological cleanup ---
    #[serde(default = "default_tail_filter_iters")]
    pub tail_filter_iters: usize,
    /// Elliptical structuring element (width, height) for tail removal.
    #[serde(default = "default_tail_filter_size")]
    pub tail_filter_size: [usize; 2],
    #[serde(default)]
    pub cable_filter_iters: usize,
    /// Rectangular structuring element (width, height) for the minimum-size pass.
    #[serde(default = "default_cable_filter_size")]
    pub cable_filter_size: [usize; 2],
    /// Spatial median kernel sizes, applied in order. Zero entries are skipped.
    #[serde(default = "default_spatial_filter_size")]
    pub spatial_filter_size: Vec<usize>,
    /// Temporal median kernel sizes, applied in order. Zero entries are skipped.
    #[serde(default)]
    pub temporal_filter_size: Vec<usize>,

    // --- Tracking model ---
    #[serde(default)]
    pub use_tracking_model: bool,
    #[serde(default = "default_mask_threshold")]
    pub tracking_model_mask_threshold: f32,
    #[serde(default = "default_ll_threshold")]
    pub tracking_model_ll_threshold: f32,
    #[serde(default = "default_ll_clip")]
    pub tracking_model_ll_clip: f32,
    #[serde(default = "default_true")]
    pub tracking_model_segment: bool,
    /// Number of leading frames used to build the cold-start frame.
    #[serde(default = "default_tracking_model_init")]
    pub tracking_model_init: usize,
    #[serde(default = "default_init_method")]
    pub tracking_model_init_method: InitMethod,
    #[serde(default)]
    pub tracking_model_rho_mean: f64,
    #[serde(default)]
    pub tracking_model_rho_cov: f64,

    // --- Trajectory smoothing ---
    #[serde(default = "default_hampel_span")]
    pub centroid_hampel_span: usize,
    #[serde(default = "default_hampel_sig")]
    pub centroid_hampel_sig: f64,
    #[serde(default = "default_hampel_span")]
    pub angle_hampel_span: usize,
    #[serde(default = "default_hampel_sig")]
    pub angle_hampel_sig: f64,
    /// Mean log-likelihood band (low, high) driving model smoothing; disabled when low >= high.
    #[serde(default = "default_model_smoothing_clips")]
    pub model_smoothing_clips: (f32, f32),

    // --- Flip correction ---
    /// File of precomputed per-frame flip decisions; enables flip correction.
    #[serde(default)]
    pub flip_classifier: Option<PathBuf>,
    /// Minimum run of consecutive positive decisions before a flip commits.
    #[serde(default = "default_flip_smoothing")]
    pub flip_classifier_smoothing: usize,

    // --- Output ---
    /// Aligned crop dimensions (width, height); also pads the preview canvas.
    #[serde(default = "default_crop_size")]
    pub crop_size: [usize; 2],
    #[serde(default = "default_fps")]
    pub fps: f64,
    /// Camera-to-floor distance in millimetres, for pixel to millimetre conversion.
    #[serde(default = "default_true_depth")]
    pub true_depth: f64,
    /// Camera field of view in degrees (horizontal, vertical).
    #[serde(default = "default_camera_fov")]
    pub camera_fov_deg: [f64; 2],
    #[serde(default)]
    pub encoder: EncoderConfig,
}

fn default_frame_size() -> [usize; 2] { [512, 424] }
fn default_archive_member() -> String { "depth.dat".to_string() }
fn default_chunk_size() -> usize { 1000 }
fn default_min_height() -> f32 { 10.0 }
fn default_max_height() -> f32 { 100.0 }
fn default_frame_dtype() -> FrameDtype { FrameDtype::U8 }
fn default_tail_filter_iters() -> usize { 1 }
fn default_tail_filter_size() -> [usize; 2] { [9, 9] }
fn default_cable_filter_size() -> [usize; 2] { [5, 5] }
fn default_spatial_filter_size() -> Vec<usize> { vec![3] }
fn default_mask_threshold() -> f32 { -16.0 }
fn default_ll_threshold() -> f32 { -100.0 }
fn default_ll_clip() -> f32 { -100.0 }
fn default_true() -> bool { true }
fn default_tracking_model_init() -> usize { 10 }
fn default_init_method() -> InitMethod { InitMethod::Raw }
fn default_hampel_span() -> usize { 5 }
fn default_hampel_sig() -> f64 { 3.0 }
fn default_model_smoothing_clips() -> (f32, f32) { (-300.0, -150.0) }
fn default_flip_smoothing() -> usize { 51 }
fn default_crop_size() -> [usize; 2] { [80, 80] }
fn default_fps() -> f64 { 30.0 }
fn default_true_depth() -> f64 { 673.1 }
fn default_camera_fov() -> [f64; 2] { [70.6, 60.0] }

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            frame_size: default_frame_size(),
            archive_member: default_archive_member(),
            first_frame: 0,
            num_frames: None,
            chunk_size: default_chunk_size(),
            chunk_overlap: 0,
            min_height: default_min_height(),
            max_height: default_max_height(),
            dilate_iterations: 0,
            frame_dtype: default_frame_dtype(),
            tail_filter_iters: default_tail_filter_iters(),
            tail_filter_size: default_tail_filter_size(),
            cable_filter_iters: 0,
            cable_filter_size: default_cable_filter_size(),
            spatial_filter_size: default_spatial_filter_size(),
            temporal_filter_size: Vec::new(),
            use_tracking_model: false,
            tracking_model_mask_threshold: default_mask_threshold(),
            tracking_model_ll_threshold: default_ll_threshold(),
            tracking_model_ll_clip: default_ll_clip(),
            tracking_model_segment: true,
            tracking_model_init: default_tracking_model_init(),
            tracking_model_init_method: default_init_method(),
            tracking_model_rho_mean: 0.0,
            tracking_model_rho_cov: 0.0,
            centroid_hampel_span: default_hampel_span(),
            centroid_hampel_sig: default_hampel_sig(),
            angle_hampel_span: default_hampel_span(),
            angle_hampel_sig: default_hampel_sig(),
            model_smoothing_clips: default_model_smoothing_clips(),
            flip_classifier: None,
            flip_classifier_smoothing: default_flip_smoothing(),
            crop_size: default_crop_size(),
            fps: default_fps(),
            true_depth: default_true_depth(),
            camera_fov_deg: default_camera_fov(),
            encoder: EncoderConfig::default(),
        }
    }
}

/// A configuration that cannot drive an extraction.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("min_height ({min}) must be below max_height ({max})")]
    HeightBand { min: f32, max: f32 },
    #[error("chunk_size must be positive and larger than chunk_overlap (got {chunk_size} / {chunk_overlap})")]
    Chunking { chunk_size: usize, chunk_overlap: usize },
    #[error("{name} must be positive (got {value:?})")]
    NonPositive { name: &'static str, value: String },
    #[error("{name} must be finite")]
    NonFinite { name: &'static str },
    #[error("{name} kernel sizes must be odd (got {size})")]
    EvenKernel { name: &'static str, size: usize },
    #[error("spatial_filter_size entries above {max} are not supported on 16-bit frames (got {size})")]
    SpatialKernel { size: usize, max: usize },
    #[error("{name} must lie in [0, 1] (got {value})")]
    OutOfUnitRange { name: &'static str, value: f64 },
}

impl ExtractConfig {
    /// Loads a TOML config file; missing keys take their defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Checks every option the core consumes. Called before the first batch.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frame_size.contains(&0) {
            return Err(non_positive("frame_size", self.frame_size));
        }
        if self.chunk_size == 0 || self.chunk_overlap >= self.chunk_size {
            return Err(ConfigError::Chunking {
                chunk_size: self.chunk_size,
                chunk_overlap: self.chunk_overlap,
            });
        }

        finite("min_height", self.min_height as f64)?;
        finite("max_height", self.max_height as f64)?;
        if self.min_height >= self.max_height {
            return Err(ConfigError::HeightBand {
                min: self.min_height,
                max: self.max_height,
            });
        }

        if self.tail_filter_size.contains(&0) {
            return Err(non_positive("tail_filter_size", self.tail_filter_size));
        }
        if self.cable_filter_size.contains(&0) {
            return Err(non_positive("cable_filter_size", self.cable_filter_size));
        }
        odd_kernels("spatial_filter_size", &self.spatial_filter_size)?;
        odd_kernels("temporal_filter_size", &self.temporal_filter_size)?;
        if let Some(&size) = self.spatial_filter_size.iter().find(|&&k| k > MAX_SPATIAL_KERNEL) {
            return Err(ConfigError::SpatialKernel {
                size,
                max: MAX_SPATIAL_KERNEL,
            });
        }

        finite("tracking_model_mask_threshold", self.tracking_model_mask_threshold as f64)?;
        finite("tracking_model_ll_threshold", self.tracking_model_ll_threshold as f64)?;
        finite("tracking_model_ll_clip", self.tracking_model_ll_clip as f64)?;
        if self.tracking_model_init == 0 {
            return Err(non_positive("tracking_model_init", self.tracking_model_init));
        }
        unit_range("tracking_model_rho_mean", self.tracking_model_rho_mean)?;
        unit_range("tracking_model_rho_cov", self.tracking_model_rho_cov)?;

        for (name, sig) in [
            ("centroid_hampel_sig", self.centroid_hampel_sig),
            ("angle_hampel_sig", self.angle_hampel_sig),
        ] {
            finite(name, sig)?;
            if sig <= 0.0 {
                return Err(non_positive(name, sig));
            }
        }
        finite("model_smoothing_clips", self.model_smoothing_clips.0 as f64)?;
        finite("model_smoothing_clips", self.model_smoothing_clips.1 as f64)?;

        if self.crop_size.contains(&0) {
            return Err(non_positive("crop_size", self.crop_size));
        }
        finite("fps", self.fps)?;
        if self.fps <= 0.0 {
            return Err(non_positive("fps", self.fps));
        }
        finite("true_depth", self.true_depth)?;
        if self.camera_fov_deg.iter().any(|fov| !fov.is_finite() || *fov <= 0.0) {
            return Err(non_positive("camera_fov_deg", self.camera_fov_deg));
        }
        if self.encoder.queue_depth == 0 {
            return Err(non_positive("encoder.queue_depth", self.encoder.queue_depth));
        }
        Ok(())
    }

    /// Frame shape as (rows, cols).
    pub fn frame_shape(&self) -> (usize, usize) {
        (self.frame_size[1], self.frame_size[0])
    }

    /// Crop shape as (rows, cols).
    pub fn crop_shape(&self) -> (usize, usize) {
        (self.crop_size[1], self.crop_size[0])
    }

    /// Heights above `max_height` are clamped (single-pass mode) rather than zeroed.
    pub fn clamps_high_values(&self) -> bool {
        self.dilate_iterations == 1
    }

    /// The model smoothing band, when it is a usable interval.
    pub fn model_smoothing_band(&self) -> Option<(f32, f32)> {
        let (lo, hi) = self.model_smoothing_clips;
        (self.use_tracking_model && lo < hi).then_some((lo, hi))
    }
}

fn non_positive(name: &'static str, value: impl std::fmt::Debug) -> ConfigError {
    ConfigError::NonPositive {
        name,
        value: format!("{value:?}"),
    }
}

fn finite(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ConfigError::NonFinite { name })
    }
}

fn unit_range(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfUnitRange { name, value })
    }
}

/// Largest median kernel `imgproc::median_blur` accepts for 16-bit input.
const MAX_SPATIAL_KERNEL: usize = 5;

fn odd_kernels(name: &'static str, sizes: &[usize]) -> Result<(), ConfigError> {
    match sizes.iter().find(|&&size| size != 0 && size % 2 == 0) {
        Some(&size) => Err(ConfigError::EvenKernel { name, size }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        ExtractConfig::default().validate().expect("defaults should be valid");
    }

    #[test]
    fn partial_toml_takes_defaults() {
        let config: ExtractConfig = toml::from_str(
            r#"
            chunk_size = 250
            chunk_overlap = 10
            use_tracking_model = true
            frame_dtype = "u16"
            spatial_filter_size = [3, 5]
            model_smoothing_clips = [-200.0, -100.0]
            "#,
        )
        .expect("parse");

        assert_eq!(config.chunk_size, 250);
        assert_eq!(config.chunk_overlap, 10);
        assert_eq!(config.frame_dtype, FrameDtype::U16);
        assert_eq!(config.spatial_filter_size, vec![3, 5]);
        assert_eq!(config.min_height, 10.0);
        assert_eq!(config.frame_shape(), (424, 512));
        assert_eq!(config.model_smoothing_band(), Some((-200.0, -100.0)));
        config.validate().expect("valid");
    }

    #[test]
    fn rejects_overlap_not_below_chunk_size() {
        let config = ExtractConfig {
            chunk_size: 10,
            chunk_overlap: 10,
            ..ExtractConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Chunking { .. })));
    }

    #[test]
    fn rejects_inverted_height_band() {
        let config = ExtractConfig {
            min_height: 50.0,
            max_height: 20.0,
            ..ExtractConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::HeightBand { .. })));
    }

    #[test]
    fn rejects_even_median_kernel() {
        let config = ExtractConfig {
            temporal_filter_size: vec![0, 4],
            ..ExtractConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::EvenKernel { size: 4, .. })
        ));
    }

    #[test]
    fn rejects_spatial_kernel_too_large_for_16_bit() {
        let config = ExtractConfig {
            spatial_filter_size: vec![3, 7],
            ..ExtractConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::SpatialKernel { size: 7, max: 5 })
        ));
    }

    #[test]
    fn clamp_policy_follows_dilate_iterations() {
        let mut config = ExtractConfig::default();
        assert!(!config.clamps_high_values());
        config.dilate_iterations = 1;
        assert!(config.clamps_high_values());
        config.dilate_iterations = 2;
        assert!(!config.clamps_high_values());
    }

    #[test]
    fn model_smoothing_requires_tracking_and_ordered_band() {
        let mut config = ExtractConfig::default();
        assert_eq!(config.model_smoothing_band(), None);
        config.use_tracking_model = true;
        assert_eq!(config.model_smoothing_band(), Some((-300.0, -150.0)));
        config.model_smoothing_clips = (0.0, 0.0);
        assert_eq!(config.model_smoothing_band(), None);
    }
}

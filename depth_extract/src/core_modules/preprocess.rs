// THEORY:
// The preprocessor turns raw camera depth into height above the floor and
// throws away everything that cannot be the subject: pixels below the height
// band (floor noise), pixels above it (hands, cables, the camera mount), and
// pixels outside the region of interest. It is a pure function of its inputs.
//
// The treatment of too-tall pixels depends on `dilate_iterations`: in the
// single-pass mode they are clamped to `max_height`, otherwise they are zeroed.

use crate::config::{ExtractConfig, FrameDtype};
use ndarray::{Array3, ArrayView2, ArrayView3, Axis, Zip};

/// Height band applied to background-subtracted frames.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthBand {
    pub min_height: f32,
    pub max_height: f32,
    /// Clamp values above `max_height` instead of zeroing them.
    pub clamp_high: bool,
}

impl DepthBand {
    pub fn from_config(config: &ExtractConfig) -> Self {
        Self {
            min_height: config.min_height,
            max_height: config.max_height,
            clamp_high: config.clamps_high_values(),
        }
    }

    /// Maps a single height through the band.
    pub fn apply(&self, height: f32) -> f32 {
        if height < self.min_height {
            0.0
        } else if height > self.max_height {
            if self.clamp_high { self.max_height } else { 0.0 }
        } else {
            height
        }
    }
}

/// Height above background for every pixel: `background - raw`.
pub fn subtract_background(raw: ArrayView3<u16>, background: ArrayView2<f32>) -> Array3<f32> {
    let mut heights = raw.mapv(f32::from);
    for mut frame in heights.axis_iter_mut(Axis(0)) {
        Zip::from(&mut frame)
            .and(&background)
            .for_each(|value, &bg| *value = bg - *value);
    }
    heights
}

/// Applies the height band and the ROI in place.
pub fn apply_band_and_roi(heights: &mut Array3<f32>, band: &DepthBand, roi: ArrayView2<bool>) {
    for mut frame in heights.axis_iter_mut(Axis(0)) {
        Zip::from(&mut frame).and(&roi).for_each(|value, &inside| {
            *value = if inside { band.apply(*value) } else { 0.0 };
        });
    }
}

/// Casts heights to the configured frame dtype: fractions truncate toward zero,
/// out-of-range values saturate. Values are held in `u16` storage either way.
pub fn cast_to_dtype(heights: &Array3<f32>, dtype: FrameDtype) -> Array3<u16> {
    match dtype {
        FrameDtype::U8 => heights.mapv(|v| (v as u8) as u16),
        FrameDtype::U16 => heights.mapv(|v| v as u16),
    }
}

/// The full preprocessing step: background subtraction, height band, dtype cast and ROI.
pub fn preprocess_frames(
    raw: ArrayView3<u16>,
    background: ArrayView2<f32>,
    roi: ArrayView2<bool>,
    config: &ExtractConfig,
) -> Array3<u16> {
    let mut heights = subtract_background(raw, background);
    apply_band_and_roi(&mut heights, &DepthBand::from_config(config), roi);
    cast_to_dtype(&heights, config.frame_dtype)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, array};

    fn band(clamp_high: bool) -> DepthBand {
        DepthBand {
            min_height: 10.0,
            max_height: 100.0,
            clamp_high,
        }
    }

    #[test]
    fn band_zeroes_low_and_handles_high_by_mode() {
        assert_eq!(band(false).apply(5.0), 0.0);
        assert_eq!(band(false).apply(50.0), 50.0);
        assert_eq!(band(false).apply(150.0), 0.0);
        assert_eq!(band(true).apply(150.0), 100.0);
        assert_eq!(band(true).apply(-20.0), 0.0);
    }

    #[test]
    fn subtracts_background_per_pixel() {
        let raw = Array3::from_shape_vec((1, 2, 2), vec![600u16, 650, 700, 690]).unwrap();
        let background = array![[700.0f32, 700.0], [700.0, 700.0]];
        let heights = subtract_background(raw.view(), background.view());
        assert_eq!(heights.index_axis(Axis(0), 0), array![[100.0, 50.0], [0.0, 10.0]]);
    }

    #[test]
    fn roi_zeroes_outside_pixels() {
        let mut heights = Array3::from_elem((2, 2, 2), 40.0f32);
        let roi = array![[true, false], [false, true]];
        apply_band_and_roi(&mut heights, &band(false), roi.view());
        for frame in heights.axis_iter(Axis(0)) {
            assert_eq!(frame, array![[40.0, 0.0], [0.0, 40.0]]);
        }
    }

    #[test]
    fn band_and_roi_are_idempotent_on_clean_input() {
        let mut once = Array3::from_shape_fn((3, 4, 4), |(f, r, c)| 10.0 + (f * 16 + r * 4 + c) as f32 * 1.5);
        let roi = Array2::from_shape_fn((4, 4), |(r, c)| r + c < 6);
        apply_band_and_roi(&mut once, &band(true), roi.view());
        let mut twice = once.clone();
        apply_band_and_roi(&mut twice, &band(true), roi.view());
        assert_eq!(once, twice);
    }

    #[test]
    fn u8_cast_truncates_and_saturates() {
        let heights = Array3::from_shape_vec((1, 1, 3), vec![12.9f32, 300.0, 0.4]).unwrap();
        let cast = cast_to_dtype(&heights, FrameDtype::U8);
        assert_eq!(cast.as_slice().unwrap(), &[12, 255, 0]);
        let cast = cast_to_dtype(&heights, FrameDtype::U16);
        assert_eq!(cast.as_slice().unwrap(), &[12, 300, 0]);
    }

    #[test]
    fn clamp_mode_follows_dilate_iterations() {
        let config = ExtractConfig {
            dilate_iterations: 1,
            frame_size: [2, 1],
            ..ExtractConfig::default()
        };
        let raw = Array3::from_shape_vec((1, 1, 2), vec![500u16, 690]).unwrap();
        let background = Array2::from_elem((1, 2), 700.0f32);
        let roi = Array2::from_elem((1, 2), true);

        let clamped = preprocess_frames(raw.view(), background.view(), roi.view(), &config);
        assert_eq!(clamped.as_slice().unwrap(), &[100, 10]);

        let config = ExtractConfig { dilate_iterations: 3, ..config };
        let zeroed = preprocess_frames(raw.view(), background.view(), roi.view(), &config);
        assert_eq!(zeroed.as_slice().unwrap(), &[0, 10]);
    }
}

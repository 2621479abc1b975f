// THEORY:
// The `morphology` module removes the thin, bright structures that are not the
// subject: tails, tethers and cables, plus isolated speckle from the sensor.
// Everything here is grayscale morphology on `u16` frames.
//
// Key architectural principles:
// 1.  **Fixed Order**: Each frame goes through an opening with an elliptical
//     element (tail removal), an erosion with a rectangular element (minimum
//     size), then the spatial medians. The temporal medians run last, across the
//     whole batch stack.
// 2.  **imgproc For Space**: The per-frame steps are OpenCV `imgproc` calls on
//     16-bit mats. Erosion and dilation use the default morphology border, so
//     pixels outside the frame never win. Spatial medians replicate the border.
// 3.  **Zero-Padded Time**: Temporal medians pad the stack with zeros, so the
//     first and last frames of a batch are pulled toward empty. This is what
//     the batch overlap absorbs.
// 4.  **Stateless Utility**: Like the blob detector, the cleaner has no memory
//     between calls.

use crate::config::ExtractConfig;
use crate::core_modules::mat::{from_mat, to_mat};
use ndarray::{Array2, Array3, ArrayView2, Axis};
use opencv::core::{self, Mat, Point, Size};
use opencv::imgproc;
use opencv::prelude::*;

/// A binary structuring element anchored at its centre.
#[derive(Debug)]
pub struct StructuringElement {
    kernel: Mat,
}

impl StructuringElement {
    /// A filled rectangle of `width` x `height`.
    pub fn rect(width: usize, height: usize) -> opencv::Result<Self> {
        Self::build(imgproc::MORPH_RECT, width, height)
    }

    /// A filled ellipse inscribed in a `width` x `height` box.
    pub fn ellipse(width: usize, height: usize) -> opencv::Result<Self> {
        Self::build(imgproc::MORPH_ELLIPSE, width, height)
    }

    fn build(shape: i32, width: usize, height: usize) -> opencv::Result<Self> {
        let size = Size::new(width.max(1) as i32, height.max(1) as i32);
        Ok(Self {
            kernel: imgproc::get_structuring_element(shape, size, Point::new(-1, -1))?,
        })
    }

    /// The element as a boolean mask of (rows, cols).
    pub fn mask(&self) -> opencv::Result<Array2<bool>> {
        let shape = (self.kernel.rows() as usize, self.kernel.cols() as usize);
        let set = self.kernel.data_typed::<u8>()?.iter().map(|&v| v != 0).collect();
        Array2::from_shape_vec(shape, set).map_err(|e| opencv::Error::new(core::StsUnmatchedSizes, e.to_string()))
    }
}

fn morph(frame: ArrayView2<u16>, op: i32, element: &StructuringElement, iterations: usize) -> opencv::Result<Array2<u16>> {
    let src = to_mat(frame)?;
    let mut dst = Mat::default();
    imgproc::morphology_ex(
        &src,
        &mut dst,
        op,
        &element.kernel,
        Point::new(-1, -1),
        iterations as i32,
        core::BORDER_CONSTANT,
        imgproc::morphology_default_border_value()?,
    )?;
    from_mat(&dst)
}

/// Grayscale erosion (neighbourhood minimum).
pub fn erode(frame: ArrayView2<u16>, element: &StructuringElement, iterations: usize) -> opencv::Result<Array2<u16>> {
    morph(frame, imgproc::MORPH_ERODE, element, iterations)
}

/// Grayscale dilation (neighbourhood maximum).
pub fn dilate(frame: ArrayView2<u16>, element: &StructuringElement, iterations: usize) -> opencv::Result<Array2<u16>> {
    morph(frame, imgproc::MORPH_DILATE, element, iterations)
}

/// Grayscale opening: `iterations` erosions followed by `iterations` dilations.
pub fn open(frame: ArrayView2<u16>, element: &StructuringElement, iterations: usize) -> opencv::Result<Array2<u16>> {
    morph(frame, imgproc::MORPH_OPEN, element, iterations)
}

/// Square median filter of odd size `ksize` (3 or 5 for 16-bit frames).
pub fn median_blur(frame: ArrayView2<u16>, ksize: usize) -> opencv::Result<Array2<u16>> {
    if ksize <= 1 {
        return Ok(frame.to_owned());
    }
    let src = to_mat(frame)?;
    let mut dst = Mat::default();
    imgproc::median_blur(&src, &mut dst, ksize as i32)?;
    from_mat(&dst)
}

/// Median filter of odd size `ksize` along the frame axis, zero-padded at the stack edges.
pub fn temporal_median(frames: &Array3<u16>, ksize: usize) -> Array3<u16> {
    if ksize <= 1 {
        return frames.clone();
    }
    let (n, rows, cols) = frames.dim();
    let half = (ksize / 2) as isize;
    let mut window = Vec::with_capacity(ksize);
    let mut out = Array3::zeros((n, rows, cols));
    for y in 0..rows {
        for x in 0..cols {
            let series = frames.slice(ndarray::s![.., y, x]);
            for t in 0..n {
                window.clear();
                for dt in -half..=half {
                    let nt = t as isize + dt;
                    window.push(if nt >= 0 && nt < n as isize { series[nt as usize] } else { 0 });
                }
                out[[t, y, x]] = *window.select_nth_unstable(half as usize).1;
            }
        }
    }
    out
}

/// The configured cleanup chain for one batch.
pub struct FrameCleaner {
    tail_element: StructuringElement,
    tail_iterations: usize,
    cable_element: StructuringElement,
    cable_iterations: usize,
    spatial_sizes: Vec<usize>,
    temporal_sizes: Vec<usize>,
}

impl FrameCleaner {
    pub fn new(config: &ExtractConfig) -> opencv::Result<Self> {
        let [tail_w, tail_h] = config.tail_filter_size;
        let [cable_w, cable_h] = config.cable_filter_size;
        Ok(Self {
            tail_element: StructuringElement::ellipse(tail_w, tail_h)?,
            tail_iterations: config.tail_filter_iters,
            cable_element: StructuringElement::rect(cable_w, cable_h)?,
            cable_iterations: config.cable_filter_iters,
            spatial_sizes: config.spatial_filter_size.iter().copied().filter(|&k| k > 0).collect(),
            temporal_sizes: config.temporal_filter_size.iter().copied().filter(|&k| k > 0).collect(),
        })
    }

    /// Cleans a single frame with the per-frame steps.
    pub fn clean_frame(&self, frame: ArrayView2<u16>) -> opencv::Result<Array2<u16>> {
        let mut out = frame.to_owned();
        if self.tail_iterations > 0 {
            out = open(out.view(), &self.tail_element, self.tail_iterations)?;
        }
        if self.cable_iterations > 0 {
            out = erode(out.view(), &self.cable_element, self.cable_iterations)?;
        }
        for &ksize in &self.spatial_sizes {
            out = median_blur(out.view(), ksize)?;
        }
        Ok(out)
    }

    /// Cleans a whole batch: per-frame steps, then the temporal medians.
    pub fn clean_batch(&self, frames: &Array3<u16>) -> opencv::Result<Array3<u16>> {
        let mut out = frames.clone();
        for mut frame in out.axis_iter_mut(Axis(0)) {
            let cleaned = self.clean_frame(frame.view())?;
            frame.assign(&cleaned);
        }
        for &ksize in &self.temporal_sizes {
            out = temporal_median(&out, ksize);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, array};

    #[test]
    fn ellipse_matches_reference_5x5() {
        let element = StructuringElement::ellipse(5, 5).unwrap();
        let expected = array![
            [false, false, true, false, false],
            [true, true, true, true, true],
            [true, true, true, true, true],
            [true, true, true, true, true],
            [false, false, true, false, false],
        ];
        assert_eq!(element.mask().unwrap(), expected);
    }

    #[test]
    fn opening_removes_a_thin_tail() {
        let mut frame = Array2::<u16>::zeros((15, 25));
        // 9x9 body
        for y in 3..12 {
            for x in 3..12 {
                frame[[y, x]] = 50;
            }
        }
        // one pixel wide tail
        for x in 12..24 {
            frame[[7, x]] = 40;
        }
        let opened = open(frame.view(), &StructuringElement::ellipse(5, 5).unwrap(), 1).unwrap();
        assert!((14..24).all(|x| opened[[7, x]] == 0));
        assert_eq!(opened[[7, 7]], 50);
    }

    #[test]
    fn erosion_ignores_out_of_bounds_neighbours() {
        let frame = Array2::from_elem((3, 3), 7u16);
        let eroded = erode(frame.view(), &StructuringElement::rect(3, 3).unwrap(), 1).unwrap();
        assert!(eroded.iter().all(|&v| v == 7));
    }

    #[test]
    fn dilation_grows_a_point_into_the_element() {
        let mut frame = Array2::<u16>::zeros((5, 5));
        frame[[2, 2]] = 9;
        let grown = dilate(frame.view(), &StructuringElement::rect(3, 3).unwrap(), 1).unwrap();
        assert_eq!(grown.iter().filter(|&&v| v == 9).count(), 9);
        assert_eq!(grown[[0, 0]], 0);
    }

    #[test]
    fn median_blur_removes_speckle() {
        let mut frame = Array2::from_elem((5, 5), 20u16);
        frame[[2, 2]] = 900;
        frame[[0, 0]] = 0;
        let blurred = median_blur(frame.view(), 3).unwrap();
        assert!(blurred.iter().all(|&v| v == 20));
    }

    #[test]
    fn temporal_median_pads_with_zeros() {
        let frames = Array3::from_elem((4, 1, 1), 10u16);
        let filtered = temporal_median(&frames, 3);
        assert_eq!(filtered.as_slice().unwrap(), &[10, 10, 10, 10]);

        let filtered = temporal_median(&frames, 5);
        // Each edge sees two zeros of padding out of five samples.
        assert_eq!(filtered.as_slice().unwrap(), &[10, 10, 10, 10]);

        let frames = Array3::from_elem((2, 1, 1), 10u16);
        let filtered = temporal_median(&frames, 5);
        assert_eq!(filtered.as_slice().unwrap(), &[0, 0]);
    }

    #[test]
    fn disabled_steps_leave_frames_untouched() {
        let config = ExtractConfig {
            tail_filter_iters: 0,
            cable_filter_iters: 0,
            spatial_filter_size: vec![],
            temporal_filter_size: vec![0],
            ..ExtractConfig::default()
        };
        let frames = Array3::from_shape_fn((3, 4, 4), |(f, y, x)| (f * 16 + y * 4 + x) as u16);
        let cleaner = FrameCleaner::new(&config).unwrap();
        assert_eq!(cleaner.clean_batch(&frames).unwrap(), frames);
    }
}

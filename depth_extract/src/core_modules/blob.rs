// THEORY:
// A `Blob` is one spatially connected region of foreground pixels in a single
// depth frame. It is the hand-off between segmentation and measurement: the
// detector finds blobs, the feature extractor measures the largest one, and the
// tracking model restricts its update to one.
//
// Key architectural principles:
// 1.  **Stateless Data Container**: A blob is a snapshot of one frame. It has no
//     memory of where the subject was before.
// 2.  **Pixel Exact**: It keeps every member pixel, not just a summary, so that
//     masks can be rebuilt from it without another pass over the frame.

use ndarray::Array2;

/// A pixel coordinate in a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Point {
    pub x: usize,
    pub y: usize,
}

/// A connected region of foreground pixels.
#[derive(Debug, Clone)]
pub struct Blob {
    /// Sequential label within the frame. Not persistent.
    pub id: usize,
    /// Top-left and bottom-right corners, inclusive.
    pub bounding_box: (Point, Point),
    pub pixels: Vec<Point>,
}

impl Blob {
    pub fn area(&self) -> usize {
        self.pixels.len()
    }

    /// Rasterizes the blob into a boolean mask of the given (rows, cols).
    pub fn to_mask(&self, shape: (usize, usize)) -> Array2<bool> {
        let mut mask = Array2::from_elem(shape, false);
        for p in &self.pixels {
            mask[[p.y, p.x]] = true;
        }
        mask
    }
}

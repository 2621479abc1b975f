// THEORY:
// The aligned crop is an egocentric view of the subject: a fixed-size window
// centred on the centroid and rotated so the subject's principal axis runs
// along the crop's columns. Downstream consumers (and the flip corrector) see
// the subject in a canonical pose regardless of where it is in the arena.
//
// Orientation follows the moment convention with image rows pointing down: an
// output offset (u, v) from the crop centre samples the frame at
// `centroid + (u cosθ + v sinθ, -u sinθ + v cosθ)`.

use crate::core_modules::mat::{from_mat, to_mat};
use crate::core_modules::moment::FrameFeatures;
use ndarray::{Array2, ArrayView2, s};
use opencv::core::{self, Mat, Point2f, Scalar, Size};
use opencv::imgproc;
use opencv::prelude::*;

/// Crops a `(rows, cols)` window centred on the subject and aligned to its
/// orientation, with bilinear sampling and zeros outside the frame. Missing
/// features give an all-zero crop.
pub fn crop_and_rotate(frame: ArrayView2<u16>, features: &FrameFeatures, shape: (usize, usize)) -> opencv::Result<Array2<u16>> {
    if features.is_missing() {
        return Ok(Array2::zeros(shape));
    }
    let (cx, cy) = features.centroid;
    let (rows, cols) = shape;
    let (half_w, half_h) = ((cols as f64 - 1.0) / 2.0, (rows as f64 - 1.0) / 2.0);

    // Rotation about the crop centre, shifted onto the centroid. Applied as the
    // inverse map: crop pixel (c, r) reads the frame at `transform * (c, r, 1)`.
    let centre = Point2f::new(half_w as f32, half_h as f32);
    let mut transform = imgproc::get_rotation_matrix_2d(centre, features.orientation.to_degrees(), 1.0)?;
    *transform.at_2d_mut::<f64>(0, 2)? += cx - half_w;
    *transform.at_2d_mut::<f64>(1, 2)? += cy - half_h;

    let src = to_mat(frame)?;
    let mut dst = Mat::default();
    imgproc::warp_affine(
        &src,
        &mut dst,
        &transform,
        Size::new(cols as i32, rows as i32),
        imgproc::INTER_LINEAR | imgproc::WARP_INVERSE_MAP,
        core::BORDER_CONSTANT,
        Scalar::all(0.0),
    )?;
    from_mat(&dst)
}

/// Rotates a crop by 180 degrees.
pub fn rot180(crop: ArrayView2<u16>) -> Array2<u16> {
    crop.slice(s![..;-1, ..;-1]).to_owned()
}

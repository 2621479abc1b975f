//! Conversions between `ndarray` depth frames and OpenCV `Mat`s, so frames can
//! go through `imgproc` and come back.

use ndarray::{Array2, ArrayView2};
use opencv::core::{self, Mat, Scalar};
use opencv::prelude::*;

/// Copies a depth frame into a single-channel `CV_16U` mat.
pub fn to_mat(frame: ArrayView2<u16>) -> opencv::Result<Mat> {
    let (rows, cols) = frame.dim();
    let mut mat = Mat::new_rows_cols_with_default(rows as i32, cols as i32, core::CV_16UC1, Scalar::all(0.0))?;
    for (dst, &src) in mat.data_typed_mut::<u16>()?.iter_mut().zip(frame.iter()) {
        *dst = src;
    }
    Ok(mat)
}

/// Copies a single-channel `CV_16U` mat back into a depth frame.
pub fn from_mat(mat: &Mat) -> opencv::Result<Array2<u16>> {
    let shape = (mat.rows().max(0) as usize, mat.cols().max(0) as usize);
    let values = mat.data_typed::<u16>()?.to_vec();
    Array2::from_shape_vec(shape, values).map_err(|e| opencv::Error::new(core::StsUnmatchedSizes, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::s;

    #[test]
    fn frames_survive_the_trip_through_a_mat() {
        let frame = Array2::from_shape_fn((3, 5), |(y, x)| (y * 1000 + x) as u16);
        let mat = to_mat(frame.view()).unwrap();
        assert_eq!((mat.rows(), mat.cols()), (3, 5));
        assert_eq!(*mat.at_2d::<u16>(2, 4).unwrap(), 2004);
        assert_eq!(from_mat(&mat).unwrap(), frame);
    }

    #[test]
    fn strided_views_are_copied_in_row_order() {
        let frame = Array2::from_shape_fn((4, 4), |(y, x)| (y * 4 + x) as u16);
        let view = frame.slice(s![..;2, 1..3]);
        let back = from_mat(&to_mat(view).unwrap()).unwrap();
        assert_eq!(back, view);
    }
}

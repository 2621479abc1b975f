// THEORY:
// The background image and the ROI mask are computed elsewhere and handed to the
// engine as ordinary image files. This module only reads them: 16-bit or float
// grayscale for the background (heights in the recording's depth units), any
// grayscale for the ROI (non-zero means inside).

use ndarray::Array2;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("could not load image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

fn open(path: &Path) -> Result<image::DynamicImage, ContainerError> {
    image::open(path).map_err(|source| ContainerError::Image {
        path: path.to_path_buf(),
        source,
    })
}

/// Converts a decoded image into a `(rows, cols)` grid of depth values.
pub fn background_from_image(img: &image::DynamicImage) -> Array2<f32> {
    let (width, height) = (img.width() as usize, img.height() as usize);
    match img {
        image::DynamicImage::ImageRgb32F(buffer) => {
            Array2::from_shape_fn((height, width), |(y, x)| buffer.get_pixel(x as u32, y as u32)[0])
        }
        image::DynamicImage::ImageRgba32F(buffer) => {
            Array2::from_shape_fn((height, width), |(y, x)| buffer.get_pixel(x as u32, y as u32)[0])
        }
        other => {
            let luma = other.to_luma16();
            Array2::from_shape_fn((height, width), |(y, x)| f32::from(luma.get_pixel(x as u32, y as u32)[0]))
        }
    }
}

/// Converts a decoded image into a `(rows, cols)` ROI mask.
pub fn roi_from_image(img: &image::DynamicImage) -> Array2<bool> {
    let luma = img.to_luma16();
    let (width, height) = luma.dimensions();
    Array2::from_shape_fn((height as usize, width as usize), |(y, x)| {
        luma.get_pixel(x as u32, y as u32)[0] > 0
    })
}

pub fn load_background<P: AsRef<Path>>(path: P) -> Result<Array2<f32>, ContainerError> {
    Ok(background_from_image(&open(path.as_ref())?))
}

pub fn load_roi<P: AsRef<Path>>(path: P) -> Result<Array2<bool>, ContainerError> {
    Ok(roi_from_image(&open(path.as_ref())?))
}

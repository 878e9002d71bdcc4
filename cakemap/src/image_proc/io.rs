//! Raw frame decoding via the `image` crate.
//!
//! Frames are returned as `Array2<f64>` indexed `[row, col]`, so the first
//! array axis is the detector's slow (PONI "1") axis and the second is the
//! fast ("2") axis.

use image::{DynamicImage, ImageBuffer, Luma};
use ndarray::Array2;
use std::path::Path;

use crate::error::{CakeError, Result};

/// Decode a grayscale frame into floating point counts.
///
/// 8- and 16-bit grayscale images keep their raw integer values. Float
/// images use their first channel. Anything else is converted to 16-bit
/// luminance first.
pub fn load_frame<P: AsRef<Path>>(path: P) -> Result<Array2<f64>> {
    let path = path.as_ref();
    let img = image::open(path).map_err(|source| CakeError::Image {
        path: path.to_path_buf(),
        source,
    })?;

    let (width, height) = (img.width() as usize, img.height() as usize);
    let values: Vec<f64> = match img {
        DynamicImage::ImageLuma8(buf) => buf.into_raw().into_iter().map(f64::from).collect(),
        DynamicImage::ImageLuma16(buf) => buf.into_raw().into_iter().map(f64::from).collect(),
        DynamicImage::ImageRgb32F(buf) => buf.pixels().map(|p| f64::from(p.0[0])).collect(),
        DynamicImage::ImageRgba32F(buf) => buf.pixels().map(|p| f64::from(p.0[0])).collect(),
        other => other
            .into_luma16()
            .into_raw()
            .into_iter()
            .map(f64::from)
            .collect(),
    };

    let found = values.len();
    Array2::from_shape_vec((height, width), values).map_err(|_| CakeError::ShapeMismatch {
        expected: (height, width),
        found: (found, 1),
    })
}

/// Decode a mask image; any nonzero pixel is masked.
pub fn load_mask<P: AsRef<Path>>(path: P) -> Result<Array2<bool>> {
    Ok(load_frame(path)?.mapv(|v| v != 0.0))
}

/// Write a 16-bit grayscale frame. Format follows the file extension.
pub fn save_u16_image<P: AsRef<Path>>(frame: &Array2<u16>, path: P) -> Result<()> {
    let path = path.as_ref();
    let (height, width) = frame.dim();

    let mut buffer: ImageBuffer<Luma<u16>, Vec<u16>> =
        ImageBuffer::new(width as u32, height as u32);
    for (x, y, pixel) in buffer.enumerate_pixels_mut() {
        *pixel = Luma([frame[[y as usize, x as usize]]]);
    }

    buffer.save(path).map_err(|source| CakeError::Image {
        path: path.to_path_buf(),
        source,
    })
}

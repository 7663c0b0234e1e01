use image::{Rgb, RgbImage};
use ndarray::{ArrayView3, ArrayView4, Axis};

use crate::error::{Result, WatermarkError};

/// Maps a generator output value in `[-1, 1]` to an 8-bit intensity.
///
/// Values outside the range are clamped first, so `+1` lands on 255 and `-1`
/// on 0. NaN falls through the cast as 0.
pub fn unit_to_pixel(value: f32) -> u8 {
    let clamped = value.clamp(-1.0, 1.0);
    ((clamped + 1.0) / 2.0 * 255.0).round() as u8
}

pub fn tensor_to_rgb(tensor: &ArrayView3<f32>) -> Result<RgbImage> {
    let (channels, height, width) = tensor.dim();

    if channels != 3 {
        return Err(WatermarkError::MalformedTensor(format!(
            "expected 3 channels, got {channels}"
        )));
    }
    if height == 0 || width == 0 {
        return Err(WatermarkError::MalformedTensor(format!(
            "empty spatial extent {height}x{width}"
        )));
    }

    let mut image = RgbImage::new(width as u32, height as u32);

    for y in 0..height {
        for x in 0..width {
            let pixel = Rgb([
                unit_to_pixel(tensor[[0, y, x]]),
                unit_to_pixel(tensor[[1, y, x]]),
                unit_to_pixel(tensor[[2, y, x]]),
            ]);
            image.put_pixel(x as u32, y as u32, pixel);
        }
    }

    Ok(image)
}

pub fn batch_to_images(batch: &ArrayView4<f32>) -> Result<Vec<RgbImage>> {
    batch
        .axis_iter(Axis(0))
        .map(|tensor| tensor_to_rgb(&tensor))
        .collect()
}

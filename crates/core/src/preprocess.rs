use anyhow::{ensure, Result};
use candle_core::{Device, Tensor};
use image::{imageops::FilterType, DynamicImage};
use tracing::debug;

use crate::prompt::PATCH_SIZE;

/// Smallest side length accepted for an input image after resizing.
pub const MIN_INPUT_IMAGE_SIZE: u32 = 128;

/// Resizes an input image so both sides are multiples of 16 within
/// `[MIN_INPUT_IMAGE_SIZE, max_size]` and converts it to a channel-first f32
/// tensor in `[-1, 1]`, the layout the VAE encoder expects.
pub fn prepare_input_image(
    image: &DynamicImage,
    max_size: u32,
    device: &Device,
) -> Result<Tensor> {
    let patch = PATCH_SIZE as u32;
    ensure!(
        max_size >= MIN_INPUT_IMAGE_SIZE && max_size % patch == 0,
        "max input image size must be a multiple of {patch} and at least {MIN_INPUT_IMAGE_SIZE}, got {max_size}"
    );
    let (width, height) = (image.width(), image.height());
    ensure!(width > 0 && height > 0, "input image has a zero dimension");

    // Fit the longer side under max_size without letting the shorter side
    // drop below the minimum.
    let mut scale = f64::min(f64::from(max_size) / f64::from(width.max(height)), 1.0);
    let short_side = f64::from(width.min(height)) * scale;
    if short_side < f64::from(MIN_INPUT_IMAGE_SIZE) {
        scale = f64::from(MIN_INPUT_IMAGE_SIZE) / f64::from(width.min(height));
    }
    let target_width = snap_dimension(f64::from(width) * scale, max_size);
    let target_height = snap_dimension(f64::from(height) * scale, max_size);

    let resized = if (target_width, target_height) != (width, height) {
        debug!(
            from_width = width,
            from_height = height,
            to_width = target_width,
            to_height = target_height,
            "resizing input image"
        );
        image.resize_exact(target_width, target_height, FilterType::Lanczos3)
    } else {
        image.clone()
    };

    let rgb = resized.to_rgb8();
    let (target_width, target_height) = (target_width as usize, target_height as usize);
    let plane = target_height * target_width;
    let mut data = vec![0f32; 3 * plane];
    for (x, y, pixel) in rgb.enumerate_pixels() {
        let offset = y as usize * target_width + x as usize;
        for channel in 0..3 {
            data[channel * plane + offset] = f32::from(pixel[channel]) / 255.0 * 2.0 - 1.0;
        }
    }

    Ok(Tensor::from_vec(
        data,
        (3, target_height, target_width),
        device,
    )?)
}

fn snap_dimension(size: f64, max_size: u32) -> u32 {
    let patch = PATCH_SIZE as u32;
    let snapped = (size as u32 / patch) * patch;
    snapped.clamp(MIN_INPUT_IMAGE_SIZE, max_size)
}

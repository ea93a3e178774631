use anyhow::{ensure, Result};
use candle_core::{DType, Device, Tensor};
use omnigen_core::tensor::to_device_if_needed;
use omnigen_core::PATCH_SIZE;
use tracing::debug;

/// Compresses `[1, 3, H, W]` pixel tensors into `[1, 4, H/8, W/8]` latents.
///
/// Implementations are expected to fold the distribution sampling and any
/// model-specific scaling into `encode`.
pub trait LatentEncoder: Send {
    fn device(&self) -> &Device;

    fn encode(&self, image: &Tensor) -> Result<Tensor>;
}

/// Checks the shape contract an encoder input must satisfy.
pub fn validate_encoder_input(image: &Tensor) -> Result<()> {
    let (batch, channels, height, width) = image.shape().dims4()?;
    ensure!(
        batch == 1,
        "encoder inputs carry one image each, got a batch of {batch}"
    );
    ensure!(channels == 3, "encoder inputs must be RGB, got {channels} channels");
    ensure!(
        height % PATCH_SIZE == 0 && width % PATCH_SIZE == 0,
        "image size {height}x{width} is not a multiple of {PATCH_SIZE}"
    );
    Ok(())
}

/// Encodes every input image and casts the latents to the model dtype.
pub fn encode_input_images(
    encoder: &dyn LatentEncoder,
    pixel_values: &[Tensor],
    dtype: DType,
) -> Result<Vec<Tensor>> {
    let mut latents = Vec::with_capacity(pixel_values.len());
    for image in pixel_values {
        validate_encoder_input(image)?;
        let staged = to_device_if_needed(image, encoder.device())?;
        let latent = encoder.encode(&staged)?;
        latents.push(latent.to_dtype(dtype)?);
    }
    debug!(count = latents.len(), "encoded input images");
    Ok(latents)
}

use anyhow::Result;
use candle_core::{Device, Tensor};

/// Returns `tensor` moved to `device` only when needed.
pub fn to_device_if_needed(tensor: &Tensor, device: &Device) -> Result<Tensor> {
    if tensor.device().same_device(device) {
        Ok(tensor.clone())
    } else {
        Ok(tensor.to_device(device)?)
    }
}

/// Returns owned `tensor` moved to `device` only when needed.
pub fn into_device_if_needed(tensor: Tensor, device: &Device) -> Result<Tensor> {
    if tensor.device().same_device(device) {
        Ok(tensor)
    } else {
        Ok(tensor.to_device(device)?)
    }
}

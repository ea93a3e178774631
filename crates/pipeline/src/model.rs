use std::collections::BTreeMap;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use omnigen_core::ImageSpan;
use serde::Serialize;
use tracing::info;

use crate::cache::PromptKvCache;
use crate::error::PipelineError;

/// Everything the diffusion transformer consumes besides the noisy latents
/// and the timestep.
///
/// `input_ids` becomes `None` once the prompt prefix lives in the KV cache;
/// `position_ids` and `attention_mask` are then cropped to the positions
/// still being recomputed.
#[derive(Debug, Clone)]
pub struct ModelKwargs {
    pub input_ids: Option<Tensor>,
    pub position_ids: Tensor,
    pub attention_mask: Tensor,
    pub input_img_latents: Vec<Tensor>,
    pub input_image_sizes: BTreeMap<usize, Vec<ImageSpan>>,
    pub padding_images: Vec<Option<Tensor>>,
    pub cfg_scale: f64,
    pub img_cfg_scale: f64,
    pub use_img_cfg: bool,
    pub use_kv_cache: bool,
    pub offload_model: bool,
}

/// The rectified-flow transformer as the sampler sees it: a velocity
/// predictor plus placement controls.
pub trait DiffusionModel: Send + std::fmt::Debug {
    fn device(&self) -> &Device;

    fn dtype(&self) -> DType;

    /// Predicts the velocity field for `latents` at `timestep`. `cache` is
    /// empty on the first call of a cached run and filled by it.
    fn forward(
        &mut self,
        latents: &Tensor,
        timestep: f64,
        kwargs: &ModelKwargs,
        cache: &mut PromptKvCache,
    ) -> Result<Tensor>;

    /// Moves every weight to `device`.
    fn move_to(&mut self, device: &Device) -> Result<()>;

    /// Parks the transformer blocks in host memory while keeping the
    /// embedding and head on the device, for layer-streamed execution.
    fn offload_layers_to_host(&mut self) -> Result<()>;
}

/// Where the model's weights currently live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelPlacement {
    Unloaded,
    OnHost,
    OnDevice,
    PartiallyOffloaded,
}

impl std::fmt::Display for ModelPlacement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ModelPlacement::Unloaded => "unloaded",
            ModelPlacement::OnHost => "on_host",
            ModelPlacement::OnDevice => "on_device",
            ModelPlacement::PartiallyOffloaded => "partially_offloaded",
        };
        f.write_str(label)
    }
}

/// Owns the model together with its placement state so every move goes
/// through one place. A handle can exist before weights do; using it then
/// fails with [`PipelineError::ModelUnavailable`].
pub struct ModelHandle {
    model: Option<Box<dyn DiffusionModel>>,
    placement: ModelPlacement,
}

impl ModelHandle {
    pub fn new(model: Box<dyn DiffusionModel>) -> Self {
        let placement = if model.device().is_cpu() {
            ModelPlacement::OnHost
        } else {
            ModelPlacement::OnDevice
        };
        Self {
            model: Some(model),
            placement,
        }
    }

    pub fn unloaded() -> Self {
        Self {
            model: None,
            placement: ModelPlacement::Unloaded,
        }
    }

    /// Installs freshly loaded weights, replacing whatever was held before.
    pub fn install(&mut self, model: Box<dyn DiffusionModel>) {
        self.placement = if model.device().is_cpu() {
            ModelPlacement::OnHost
        } else {
            ModelPlacement::OnDevice
        };
        self.model = Some(model);
    }

    pub fn placement(&self) -> ModelPlacement {
        self.placement
    }

    pub fn is_loaded(&self) -> bool {
        self.model.is_some()
    }

    pub fn model(&self) -> Result<&dyn DiffusionModel> {
        self.model
            .as_deref()
            .ok_or_else(|| PipelineError::ModelUnavailable.into())
    }

    pub fn model_mut(&mut self) -> Result<&mut (dyn DiffusionModel + 'static)> {
        self.model
            .as_deref_mut()
            .ok_or_else(|| PipelineError::ModelUnavailable.into())
    }

    pub fn move_to(&mut self, device: &Device) -> Result<()> {
        let target = if device.is_cpu() {
            ModelPlacement::OnHost
        } else {
            ModelPlacement::OnDevice
        };
        if self.placement == target {
            return Ok(());
        }
        self.model_mut()?
            .move_to(device)
            .with_context(|| format!("moving model weights to {target}"))?;
        info!(placement = %target, "model relocated");
        self.placement = target;
        Ok(())
    }

    pub fn partially_offload(&mut self) -> Result<()> {
        if self.placement == ModelPlacement::PartiallyOffloaded {
            return Ok(());
        }
        self.model_mut()?
            .offload_layers_to_host()
            .context("offloading transformer layers to host")?;
        info!("model layers parked in host memory");
        self.placement = ModelPlacement::PartiallyOffloaded;
        Ok(())
    }
}

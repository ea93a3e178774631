use omnigen_core::{PrepareOptions, PATCH_SIZE};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Knobs controlling a single generation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerateOptions {
    pub height: usize,
    pub width: usize,
    pub num_inference_steps: usize,
    pub guidance_scale: f64,
    pub img_guidance_scale: f64,
    pub negative_prompt: Option<String>,
    pub use_img_guidance: bool,
    pub separate_cfg_infer: bool,
    pub use_input_image_size_as_output: bool,
    pub use_kv_cache: bool,
    pub offload_kv_cache: bool,
    pub offload_model: bool,
    pub move_to_ram: bool,
    pub max_input_image_size: u32,
    pub seed: Option<u64>,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            height: 1024,
            width: 1024,
            num_inference_steps: 50,
            guidance_scale: 3.0,
            img_guidance_scale: 1.6,
            negative_prompt: None,
            use_img_guidance: true,
            separate_cfg_infer: false,
            use_input_image_size_as_output: false,
            use_kv_cache: true,
            offload_kv_cache: true,
            offload_model: false,
            move_to_ram: false,
            max_input_image_size: 1024,
            seed: None,
        }
    }
}

/// Sparse overlay for [`GenerateOptions`]; unset fields keep the base value.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerateOptionsPatch {
    pub height: Option<usize>,
    pub width: Option<usize>,
    pub num_inference_steps: Option<usize>,
    pub guidance_scale: Option<f64>,
    pub img_guidance_scale: Option<f64>,
    pub negative_prompt: Option<String>,
    pub use_img_guidance: Option<bool>,
    pub separate_cfg_infer: Option<bool>,
    pub use_input_image_size_as_output: Option<bool>,
    pub use_kv_cache: Option<bool>,
    pub offload_kv_cache: Option<bool>,
    pub offload_model: Option<bool>,
    pub move_to_ram: Option<bool>,
    pub max_input_image_size: Option<u32>,
    pub seed: Option<u64>,
}

impl std::ops::AddAssign<&GenerateOptionsPatch> for GenerateOptions {
    fn add_assign(&mut self, rhs: &GenerateOptionsPatch) {
        if let Some(height) = rhs.height {
            self.height = height;
        }
        if let Some(width) = rhs.width {
            self.width = width;
        }
        if let Some(steps) = rhs.num_inference_steps {
            self.num_inference_steps = steps;
        }
        if let Some(scale) = rhs.guidance_scale {
            self.guidance_scale = scale;
        }
        if let Some(scale) = rhs.img_guidance_scale {
            self.img_guidance_scale = scale;
        }
        if let Some(prompt) = &rhs.negative_prompt {
            self.negative_prompt = Some(prompt.clone());
        }
        if let Some(flag) = rhs.use_img_guidance {
            self.use_img_guidance = flag;
        }
        if let Some(flag) = rhs.separate_cfg_infer {
            self.separate_cfg_infer = flag;
        }
        if let Some(flag) = rhs.use_input_image_size_as_output {
            self.use_input_image_size_as_output = flag;
        }
        if let Some(flag) = rhs.use_kv_cache {
            self.use_kv_cache = flag;
        }
        if let Some(flag) = rhs.offload_kv_cache {
            self.offload_kv_cache = flag;
        }
        if let Some(flag) = rhs.offload_model {
            self.offload_model = flag;
        }
        if let Some(flag) = rhs.move_to_ram {
            self.move_to_ram = flag;
        }
        if let Some(size) = rhs.max_input_image_size {
            self.max_input_image_size = size;
        }
        if let Some(seed) = rhs.seed {
            self.seed = Some(seed);
        }
    }
}

impl std::ops::Add<&GenerateOptionsPatch> for GenerateOptions {
    type Output = GenerateOptions;

    fn add(mut self, rhs: &GenerateOptionsPatch) -> Self::Output {
        self += rhs;
        self
    }
}

impl GenerateOptions {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.height == 0
            || self.width == 0
            || self.height % PATCH_SIZE != 0
            || self.width % PATCH_SIZE != 0
        {
            return Err(PipelineError::InvalidOutputSize {
                height: self.height,
                width: self.width,
            });
        }
        if self.num_inference_steps == 0 {
            return Err(PipelineError::NoInferenceSteps);
        }
        for scale in [self.guidance_scale, self.img_guidance_scale] {
            if !scale.is_finite() || scale <= 0.0 {
                return Err(PipelineError::InvalidGuidanceScale(scale));
            }
        }
        Ok(())
    }

    /// Projects the request onto the prompt-preparation knobs.
    pub fn prepare_options(&self) -> PrepareOptions {
        PrepareOptions {
            height: self.height,
            width: self.width,
            negative_prompt: self.negative_prompt.clone(),
            use_img_cfg: self.use_img_guidance,
            separate_cfg: self.separate_cfg_infer,
            use_input_image_size_as_output: self.use_input_image_size_as_output,
        }
    }
}

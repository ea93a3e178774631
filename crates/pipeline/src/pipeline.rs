use std::sync::Arc;
use std::time::Instant;

use anyhow::{ensure, Result};
use candle_core::{DType, Device, Tensor};
use image::DynamicImage;
use omnigen_core::{
    prepare_input_image, BatchTensors, Collator, PreparedBatch, Processor, PromptEncoder,
};
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::model::{ModelHandle, ModelKwargs};
use crate::observer::{NoopObserver, PipelineEvent, PipelineObserver};
use crate::options::GenerateOptions;
use crate::sampler::{
    replicate_branches, ForwardStrategy, GuidanceScales, GuidedSampler, SamplerOptions,
};
use crate::schedule::FlowMatchSchedule;
use crate::vae::{encode_input_images, LatentEncoder};

/// Constant the VAE training baked into the latent distribution; generated
/// latents are divided by it before decoding.
pub const VAE_SCALING_FACTOR: f64 = 0.13025;

pub const LATENT_CHANNELS: usize = 4;

/// Spatial compression of the VAE: eight pixels per latent cell.
pub const LATENT_DOWNSAMPLE: usize = 8;

/// One batch of generation work: `input_images[i]` holds the images prompt
/// `i` references by `<|image_N|>` tags, in tag-number order.
#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    pub instructions: Vec<String>,
    pub input_images: Vec<Vec<DynamicImage>>,
}

impl GenerateRequest {
    pub fn new(instructions: Vec<String>, input_images: Vec<Vec<DynamicImage>>) -> Self {
        Self {
            instructions,
            input_images,
        }
    }

    pub fn text_only(instructions: Vec<String>) -> Self {
        let input_images = vec![Vec::new(); instructions.len()];
        Self {
            instructions,
            input_images,
        }
    }
}

/// End-to-end text/image-conditioned latent generation: prompt preparation,
/// input-image encoding, guided sampling, and model placement.
///
/// The output is the positive-branch latent batch rescaled for VAE decoding;
/// decoding itself stays behind the caller's [`LatentEncoder`] counterpart.
pub struct GenerationPipeline {
    processor: Processor,
    model: ModelHandle,
    vae: Box<dyn LatentEncoder>,
    device: Device,
    observer: Arc<dyn PipelineObserver>,
}

impl GenerationPipeline {
    pub fn new(
        encoder: PromptEncoder,
        model: ModelHandle,
        vae: Box<dyn LatentEncoder>,
        device: Device,
    ) -> Self {
        let processor =
            Processor::new(encoder).with_collator(Collator::new().with_device(device.clone()));
        Self {
            processor,
            model,
            vae,
            device,
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn PipelineObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    fn emit(&self, event: PipelineEvent) {
        self.observer.on_event(&event);
    }

    /// Generates latents for every prompt in `request`, returned as one
    /// `[num_prompts, 4, height/8, width/8]` f32 tensor already divided by
    /// [`VAE_SCALING_FACTOR`].
    pub fn generate(
        &mut self,
        request: &GenerateRequest,
        options: &GenerateOptions,
    ) -> Result<Tensor> {
        options.validate()?;
        ensure!(
            request.input_images.len() == request.instructions.len(),
            "{} instructions but {} image lists",
            request.instructions.len(),
            request.input_images.len()
        );

        let mut pixel_lists = Vec::with_capacity(request.instructions.len());
        for images in &request.input_images {
            let mut prepared = Vec::with_capacity(images.len());
            for image in images {
                prepared.push(prepare_input_image(
                    image,
                    options.max_input_image_size,
                    &self.device,
                )?);
            }
            pixel_lists.push(prepared);
        }

        let prepared =
            self.processor
                .prepare(&request.instructions, pixel_lists, &options.prepare_options())?;
        self.emit(PipelineEvent::BatchPrepared {
            prompts: prepared.num_prompts,
            branches: prepared.layout.branch_count(),
            separate: options.separate_cfg_infer,
        });

        let (height, width) = prepared.target_sizes[0];
        if prepared
            .target_sizes
            .iter()
            .any(|&size| size != (height, width))
        {
            return Err(PipelineError::MixedOutputSizes(prepared.target_sizes).into());
        }

        if options.offload_model {
            self.model.partially_offload()?;
        } else {
            let device = self.device.clone();
            self.model.move_to(&device)?;
        }
        self.emit(PipelineEvent::ModelMoved {
            placement: self.model.placement(),
        });

        let dtype = self.model.model()?.dtype();
        let use_img_cfg = prepared.layout.has_image_branch();
        let encode_started = Instant::now();
        let (strategy, image_count) = match prepared.batch {
            PreparedBatch::Combined(tensors) => {
                let (kwargs, count) = self.build_kwargs(tensors, dtype, options, use_img_cfg)?;
                (ForwardStrategy::Combined { kwargs }, count)
            }
            PreparedBatch::Separate(batches) => {
                let mut kwargs = Vec::with_capacity(batches.len());
                let mut count = 0;
                for tensors in batches {
                    let (branch_kwargs, branch_count) =
                        self.build_kwargs(tensors, dtype, options, use_img_cfg)?;
                    kwargs.push(branch_kwargs);
                    count += branch_count;
                }
                (ForwardStrategy::Separate { kwargs }, count)
            }
        };
        if image_count > 0 {
            self.emit(PipelineEvent::ImagesEncoded {
                count: image_count,
                duration: encode_started.elapsed(),
            });
        }

        if let Some(seed) = options.seed {
            // The CPU backend draws from the thread rng and rejects seeding.
            if !self.device.is_cpu() {
                self.device.set_seed(seed)?;
            }
        }
        let latents = Tensor::randn(
            0f32,
            1f32,
            (
                prepared.num_prompts,
                LATENT_CHANNELS,
                height / LATENT_DOWNSAMPLE,
                width / LATENT_DOWNSAMPLE,
            ),
            &self.device,
        )?
        .to_dtype(dtype)?;
        let latents = replicate_branches(&latents, prepared.layout.branch_count())?;

        let sampler = GuidedSampler::new(
            FlowMatchSchedule::new(options.num_inference_steps)?,
            SamplerOptions {
                use_kv_cache: options.use_kv_cache,
                offload_kv_cache: options.offload_kv_cache,
            },
        );
        self.emit(PipelineEvent::SamplingStarted {
            steps: options.num_inference_steps,
            guidance_scale: options.guidance_scale,
            img_guidance_scale: use_img_cfg.then_some(options.img_guidance_scale),
        });
        info!(
            prompts = prepared.num_prompts,
            steps = options.num_inference_steps,
            height,
            width,
            "generation started"
        );
        let sampling_started = Instant::now();
        let sampled = sampler.sample(
            self.model.model_mut()?,
            latents,
            prepared.layout,
            prepared.num_prompts,
            GuidanceScales {
                cfg: options.guidance_scale,
                img_cfg: options.img_guidance_scale,
            },
            strategy,
        );
        if sampled.is_ok() {
            self.emit(PipelineEvent::SamplingFinished {
                steps: options.num_inference_steps,
                duration: sampling_started.elapsed(),
            });
        }

        // Device state stays well defined even when sampling failed; losing
        // the park only costs memory, not the result.
        if options.offload_model || options.move_to_ram {
            if let Err(err) = self.model.move_to(&Device::Cpu) {
                warn!(error = %err, "could not return model weights to host after sampling");
            }
            self.emit(PipelineEvent::ModelMoved {
                placement: self.model.placement(),
            });
        }

        let samples = sampled?;
        Ok(samples
            .to_dtype(DType::F32)?
            .affine(1.0 / VAE_SCALING_FACTOR, 0.0)?)
    }

    fn build_kwargs(
        &self,
        tensors: BatchTensors,
        dtype: DType,
        options: &GenerateOptions,
        use_img_cfg: bool,
    ) -> Result<(ModelKwargs, usize)> {
        let image_count = tensors.pixel_values.len();
        let input_img_latents = encode_input_images(self.vae.as_ref(), &tensors.pixel_values, dtype)?;
        let kwargs = ModelKwargs {
            input_ids: Some(tensors.input_ids),
            position_ids: tensors.position_ids,
            attention_mask: tensors.attention_mask,
            input_img_latents,
            input_image_sizes: tensors.image_sizes,
            padding_images: tensors.padding_images,
            cfg_scale: options.guidance_scale,
            img_cfg_scale: options.img_guidance_scale,
            use_img_cfg,
            use_kv_cache: options.use_kv_cache,
            offload_model: options.offload_model,
        };
        Ok((kwargs, image_count))
    }
}

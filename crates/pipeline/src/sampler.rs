use anyhow::{ensure, Result};
use candle_core::Tensor;
use omnigen_core::BranchLayout;
use tracing::debug;

use crate::cache::PromptKvCache;
use crate::model::{DiffusionModel, ModelKwargs};
use crate::schedule::FlowMatchSchedule;

#[derive(Debug, Clone, Copy)]
pub struct GuidanceScales {
    pub cfg: f64,
    pub img_cfg: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct SamplerOptions {
    pub use_kv_cache: bool,
    pub offload_kv_cache: bool,
}

impl Default for SamplerOptions {
    fn default() -> Self {
        Self {
            use_kv_cache: true,
            offload_kv_cache: true,
        }
    }
}

/// How the conditioning branches reach the model each step.
pub enum ForwardStrategy {
    /// All branches share one forward over the stacked batch.
    Combined { kwargs: ModelKwargs },
    /// One forward per branch, in layout order, each over its own batch.
    Separate { kwargs: Vec<ModelKwargs> },
}

/// Euler sampler that folds classifier-free guidance into every step.
///
/// The latent batch keeps one row group per branch so cached prompt
/// projections stay row-aligned; after merging, the guided update is written
/// back to every group identically.
pub struct GuidedSampler {
    schedule: FlowMatchSchedule,
    options: SamplerOptions,
}

impl GuidedSampler {
    pub fn new(schedule: FlowMatchSchedule, options: SamplerOptions) -> Self {
        Self { schedule, options }
    }

    pub fn schedule(&self) -> &FlowMatchSchedule {
        &self.schedule
    }

    /// Runs the full denoising loop and returns the positive-branch latents,
    /// shape `[num_prompts, channels, lat_h, lat_w]`.
    pub fn sample(
        &self,
        model: &mut dyn DiffusionModel,
        mut latents: Tensor,
        layout: BranchLayout,
        num_prompts: usize,
        scales: GuidanceScales,
        mut strategy: ForwardStrategy,
    ) -> Result<Tensor> {
        let branches = layout.branch_count();
        let (batch, _channels, lat_h, lat_w) = latents.shape().dims4()?;
        ensure!(
            batch == branches * num_prompts,
            "latent batch {batch} does not cover {branches} branches of {num_prompts} prompts"
        );
        if let ForwardStrategy::Separate { kwargs } = &strategy {
            ensure!(
                kwargs.len() == branches,
                "separate inference got {} kwarg sets for {branches} branches",
                kwargs.len()
            );
        }
        // Two latent rows merge into one output patch token per axis.
        let num_img_tokens = (lat_h / 2) * (lat_w / 2);

        let device = model.device().clone();
        let mut caches: Vec<PromptKvCache> = match &strategy {
            ForwardStrategy::Combined { .. } => vec![PromptKvCache::new()],
            ForwardStrategy::Separate { kwargs } => {
                kwargs.iter().map(|_| PromptKvCache::new()).collect()
            }
        };

        for step in 0..self.schedule.num_steps() {
            let timestep = self.schedule.sigma(step);
            if self.options.use_kv_cache && self.options.offload_kv_cache && step > 0 {
                for cache in &mut caches {
                    cache.restage(&device)?;
                }
            }

            let velocity = match &strategy {
                ForwardStrategy::Combined { kwargs } => {
                    model.forward(&latents, timestep, kwargs, &mut caches[0])?
                }
                ForwardStrategy::Separate { kwargs } => {
                    let mut parts = Vec::with_capacity(branches);
                    for (branch, branch_kwargs) in kwargs.iter().enumerate() {
                        let rows = latents.narrow(0, branch * num_prompts, num_prompts)?;
                        parts.push(model.forward(
                            &rows,
                            timestep,
                            branch_kwargs,
                            &mut caches[branch],
                        )?);
                    }
                    let refs: Vec<&Tensor> = parts.iter().collect();
                    Tensor::cat(&refs, 0)?
                }
            };

            let chunks = velocity.chunk(branches, 0)?;
            let guided = merge_guided(&chunks, layout, scales)?;
            let update = replicate_branches(&guided, branches)?;
            latents = self.schedule.step(&latents, &update, step)?;
            debug!(step, timestep, "denoising step complete");

            if self.options.use_kv_cache {
                if step == 0 {
                    match &mut strategy {
                        ForwardStrategy::Combined { kwargs } => {
                            crop_for_cached_prompt(kwargs, num_img_tokens)?;
                        }
                        ForwardStrategy::Separate { kwargs } => {
                            for branch_kwargs in kwargs.iter_mut() {
                                crop_for_cached_prompt(branch_kwargs, num_img_tokens)?;
                            }
                        }
                    }
                }
                if self.options.offload_kv_cache && step + 1 < self.schedule.num_steps() {
                    for cache in &mut caches {
                        cache.offload_to_host()?;
                    }
                }
            }
        }

        Ok(latents.narrow(0, 0, num_prompts)?)
    }
}

/// Folds the per-branch velocity predictions into one guided prediction.
///
/// Two branches: `uncond + cfg * (cond - uncond)`. Three branches chain the
/// image-conditioned prediction in between: `uncond + img_cfg * (img_cond -
/// uncond) + cfg * (cond - img_cond)`.
pub fn merge_guided(
    chunks: &[Tensor],
    layout: BranchLayout,
    scales: GuidanceScales,
) -> Result<Tensor> {
    ensure!(
        chunks.len() == layout.branch_count(),
        "{} prediction chunks for a {}-branch layout",
        chunks.len(),
        layout.branch_count()
    );
    match layout {
        BranchLayout::Two => {
            let (cond, uncond) = (&chunks[0], &chunks[1]);
            Ok(uncond.add(&cond.sub(uncond)?.affine(scales.cfg, 0.0)?)?)
        }
        BranchLayout::Three => {
            let (cond, uncond, img_cond) = (&chunks[0], &chunks[1], &chunks[2]);
            let guided = uncond.add(&img_cond.sub(uncond)?.affine(scales.img_cfg, 0.0)?)?;
            Ok(guided.add(&cond.sub(img_cond)?.affine(scales.cfg, 0.0)?)?)
        }
    }
}

/// Stacks `branches` copies of the guided prediction so the replicated latent
/// rows all receive the same update.
pub fn replicate_branches(guided: &Tensor, branches: usize) -> Result<Tensor> {
    if branches == 1 {
        return Ok(guided.clone());
    }
    let copies: Vec<&Tensor> = std::iter::repeat_n(guided, branches).collect();
    Ok(Tensor::cat(&copies, 0)?)
}

/// Shrinks `kwargs` to the suffix still recomputed once the prompt prefix is
/// cached: the time token plus the output-image block.
pub fn crop_for_cached_prompt(kwargs: &mut ModelKwargs, num_img_tokens: usize) -> Result<()> {
    let keep = num_img_tokens + 1;
    let (_batch, rows, _cols) = kwargs.attention_mask.shape().dims3()?;
    ensure!(
        keep <= rows,
        "cannot keep {keep} of {rows} attention rows after caching the prompt"
    );
    kwargs.input_ids = None;
    kwargs.position_ids = kwargs.position_ids.narrow(1, rows - keep, keep)?;
    kwargs.attention_mask = kwargs.attention_mask.narrow(1, rows - keep, keep)?;
    Ok(())
}

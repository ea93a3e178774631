use anyhow::{ensure, Context, Result};
use candle_core::Tensor;
use tracing::{debug, info};

use crate::cfg::{compose_combined, compose_separate, BranchLayout, CfgBranches};
use crate::collate::{BatchTensors, Collator};
use crate::error::PromptError;
use crate::prompt::PromptEncoder;
use crate::template::{canonicalize_image_tags, DEFAULT_NEGATIVE_PROMPT};

/// Per-request knobs for prompt preparation.
#[derive(Debug, Clone)]
pub struct PrepareOptions {
    pub height: usize,
    pub width: usize,
    pub negative_prompt: Option<String>,
    pub use_img_cfg: bool,
    pub separate_cfg: bool,
    pub use_input_image_size_as_output: bool,
}

impl Default for PrepareOptions {
    fn default() -> Self {
        Self {
            height: 1024,
            width: 1024,
            negative_prompt: None,
            use_img_cfg: true,
            separate_cfg: false,
            use_input_image_size_as_output: false,
        }
    }
}

/// Collated tensors grouped the way the forward pass will consume them.
#[derive(Debug)]
pub enum PreparedBatch {
    /// All branches stacked into one batch; a single forward services them.
    Combined(BatchTensors),
    /// One batch per branch, in layout order.
    Separate(Vec<BatchTensors>),
}

#[derive(Debug)]
pub struct PreparedPrompts {
    pub batch: PreparedBatch,
    pub layout: BranchLayout,
    pub target_sizes: Vec<(usize, usize)>,
    pub num_prompts: usize,
}

/// Builds the full conditioning batch for a generation request: tokenizes the
/// positive, negative, and image-cfg variants of every prompt and collates
/// them for either combined or separate CFG inference.
pub struct Processor {
    encoder: PromptEncoder,
    collator: Collator,
}

impl Processor {
    pub fn new(encoder: PromptEncoder) -> Self {
        Self {
            encoder,
            collator: Collator::new(),
        }
    }

    pub fn with_collator(mut self, collator: Collator) -> Self {
        self.collator = collator;
        self
    }

    pub fn encoder(&self) -> &PromptEncoder {
        &self.encoder
    }

    /// Prepares one batch of instructions. `input_images[i]` holds prompt
    /// `i`'s images as channel-first `[-1, 1]` tensors; an empty inner vec
    /// means a text-only prompt.
    pub fn prepare(
        &self,
        instructions: &[String],
        input_images: Vec<Vec<Tensor>>,
        options: &PrepareOptions,
    ) -> Result<PreparedPrompts> {
        ensure!(!instructions.is_empty(), "no instructions to prepare");
        ensure!(
            input_images.len() == instructions.len(),
            "{} instructions but {} image lists",
            instructions.len(),
            input_images.len()
        );

        let any_images = input_images.iter().any(|images| !images.is_empty());
        // Without any input image there is nothing for the image branch to
        // condition on; fall back to plain two-branch guidance.
        let use_img_cfg = options.use_img_cfg && any_images;

        let negative_text = options
            .negative_prompt
            .as_deref()
            .unwrap_or(DEFAULT_NEGATIVE_PROMPT);

        let mut branch_sets = Vec::with_capacity(instructions.len());
        let mut target_sizes = Vec::with_capacity(instructions.len());
        for (instruction, images) in instructions.iter().zip(input_images) {
            let instruction = canonicalize_image_tags(instruction);
            let positive = self.encoder.encode_multimodal(&instruction, images.clone())?;
            let negative = self.encoder.encode_multimodal(negative_text, Vec::new())?;

            let image_cfg = if !use_img_cfg {
                None
            } else if images.is_empty() {
                // A prompt without images inside an image-guided batch reuses
                // its negative branch so the layout stays uniform.
                Some(negative.clone())
            } else {
                let tags: Vec<String> = (1..=images.len())
                    .map(|n| format!("<img><|image_{n}|></img>"))
                    .collect();
                Some(self.encoder.encode_multimodal(&tags.join(" "), images)?)
            };

            let size = if options.use_input_image_size_as_output {
                let first = positive.pixel_values.first().context(
                    "use_input_image_size_as_output requires at least one input image",
                )?;
                let (_channels, height, width) = first.shape().dims3()?;
                (height, width)
            } else {
                (options.height, options.width)
            };
            debug!(
                tokens = positive.seq_len(),
                images = positive.pixel_values.len(),
                height = size.0,
                width = size.1,
                "encoded prompt"
            );
            target_sizes.push(size);
            branch_sets.push(CfgBranches {
                positive,
                negative,
                image_cfg,
            });
        }

        info!(
            prompts = instructions.len(),
            use_img_cfg,
            separate = options.separate_cfg,
            "prepared conditioning branches"
        );

        let num_prompts = branch_sets.len();
        let (batch, layout) = if options.separate_cfg {
            let (batches, layout) = compose_separate(&self.collator, branch_sets, &target_sizes)?;
            (PreparedBatch::Separate(batches), layout)
        } else {
            let (tensors, layout) = compose_combined(&self.collator, branch_sets, &target_sizes)?;
            (PreparedBatch::Combined(tensors), layout)
        };

        Ok(PreparedPrompts {
            batch,
            layout,
            target_sizes,
            num_prompts,
        })
    }
}

/// Collapses host-style numbered image slots into a dense image list.
///
/// Slots must be filled front to back: a populated slot after an empty one
/// fails, since the prompt's `<|image_N|>` numbering could no longer line up
/// with the images actually supplied.
pub fn collect_image_slots(slots: Vec<Option<Tensor>>) -> Result<Vec<Tensor>> {
    let mut images = Vec::new();
    let mut first_empty = None;
    for (index, slot) in slots.into_iter().enumerate() {
        match slot {
            Some(image) => {
                if let Some(missing) = first_empty {
                    return Err(PromptError::ImageConstraint {
                        slot: index + 1,
                        missing: missing + 1,
                    }
                    .into());
                }
                images.push(image);
            }
            None => {
                first_empty.get_or_insert(index);
            }
        }
    }
    Ok(images)
}

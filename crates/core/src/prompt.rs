use std::sync::LazyLock;

use anyhow::{anyhow, Context, Result};
use candle_core::Tensor;
use regex::Regex;
use tokenizers::Tokenizer;

use crate::error::PromptError;
use crate::template::apply_instruction_template;

/// Spatial downsampling of the patch grid: one token per 16x16 pixel patch.
pub const PATCH_SIZE: usize = 16;

/// Token id spliced into the sequence for every reserved image-patch slot.
pub const IMAGE_PLACEHOLDER_TOKEN_ID: i64 = 0;

/// Token id the tokenizer re-introduces at split boundaries.
pub const DEFAULT_BOS_TOKEN_ID: i64 = 1;

static IMAGE_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<\|image_(\d+)\|>").expect("image tag pattern is valid"));

/// Half-open `[start, end)` run of placeholder tokens reserved for one image's
/// patch embeddings. Shifted right when left padding is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSpan {
    pub start: usize,
    pub end: usize,
}

impl ImageSpan {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    pub fn shifted(self, pad: usize) -> Self {
        Self {
            start: self.start + pad,
            end: self.end + pad,
        }
    }
}

/// Number of patch tokens an image of `height` x `width` pixels occupies.
pub fn patch_token_count(height: usize, width: usize) -> usize {
    (height / PATCH_SIZE) * (width / PATCH_SIZE)
}

/// One tokenized multimodal example: token ids with placeholder runs spliced
/// in, the span of each run, and the pixel tensors in span order.
#[derive(Debug, Clone)]
pub struct MultimodalPrompt {
    pub input_ids: Vec<i64>,
    pub image_spans: Vec<ImageSpan>,
    pub pixel_values: Vec<Tensor>,
}

impl MultimodalPrompt {
    pub fn text_only(input_ids: Vec<i64>) -> Self {
        Self {
            input_ids,
            image_spans: Vec::new(),
            pixel_values: Vec::new(),
        }
    }

    pub fn seq_len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn has_images(&self) -> bool {
        !self.pixel_values.is_empty()
    }
}

/// Turns templated text plus channel-first pixel tensors into a
/// [`MultimodalPrompt`], splicing one placeholder run per `<|image_N|>` tag.
#[derive(Clone)]
pub struct PromptEncoder {
    tokenizer: Tokenizer,
    bos_token_id: i64,
}

impl PromptEncoder {
    pub fn new(tokenizer: Tokenizer) -> Self {
        Self {
            tokenizer,
            bos_token_id: DEFAULT_BOS_TOKEN_ID,
        }
    }

    pub fn with_bos_token_id(mut self, bos_token_id: i64) -> Self {
        self.bos_token_id = bos_token_id;
        self
    }

    fn encode_chunk(&self, text: &str) -> Result<Vec<i64>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|err| anyhow!("tokenization failed: {err}"))?;
        Ok(encoding.get_ids().iter().map(|&id| i64::from(id)).collect())
    }

    /// Tokenizes an instruction and splices in placeholder runs for its images.
    ///
    /// Image tags are matched by appearance order; the distinct tag indices
    /// must be exactly `{1..K}` for `K` supplied images. A tag may repeat, in
    /// which case the referenced image is spanned (and paid for) again.
    pub fn encode_multimodal(&self, text: &str, images: Vec<Tensor>) -> Result<MultimodalPrompt> {
        let text = apply_instruction_template(text);
        if images.is_empty() {
            return Ok(MultimodalPrompt::text_only(self.encode_chunk(&text)?));
        }

        let mut chunks = Vec::new();
        let mut tag_indices = Vec::new();
        let mut cursor = 0usize;
        for caps in IMAGE_TAG.captures_iter(&text) {
            let tag = caps.get(0).expect("whole-match group is always present");
            chunks.push(self.encode_chunk(&text[cursor..tag.start()])?);
            cursor = tag.end();
            let index: usize = caps[1]
                .parse()
                .with_context(|| format!("image tag index `{}` does not fit usize", &caps[1]))?;
            tag_indices.push(index);
        }
        chunks.push(self.encode_chunk(&text[cursor..])?);

        // Splitting re-runs the tokenizer per chunk, so every chunk after the
        // first may re-introduce the BOS token. Keep only the first.
        for chunk in chunks.iter_mut().skip(1) {
            if chunk.first() == Some(&self.bos_token_id) {
                chunk.remove(0);
            }
        }

        let mut distinct = tag_indices.clone();
        distinct.sort_unstable();
        distinct.dedup();
        if !distinct.iter().copied().eq(1..=distinct.len()) {
            return Err(PromptError::MalformedPrompt { found: distinct }.into());
        }
        if distinct.len() != images.len() {
            return Err(PromptError::ImageCountMismatch {
                tags: distinct.len(),
                supplied: images.len(),
            }
            .into());
        }

        // Pixel tensors follow tag appearance order, not argument order.
        let ordered: Vec<Tensor> = tag_indices.iter().map(|&n| images[n - 1].clone()).collect();

        let mut input_ids = Vec::new();
        let mut image_spans = Vec::with_capacity(ordered.len());
        for (i, chunk) in chunks.iter().enumerate() {
            input_ids.extend_from_slice(chunk);
            if i < ordered.len() {
                let (_channels, height, width) = ordered[i]
                    .shape()
                    .dims3()
                    .context("input image tensors must be channel-first [C, H, W]")?;
                let size = patch_token_count(height, width);
                let start = input_ids.len();
                image_spans.push(ImageSpan::new(start, start + size));
                input_ids.extend(std::iter::repeat_n(IMAGE_PLACEHOLDER_TOKEN_ID, size));
            }
        }

        Ok(MultimodalPrompt {
            input_ids,
            image_spans,
            pixel_values: ordered,
        })
    }
}

use std::collections::BTreeMap;

use anyhow::{ensure, Result};
use candle_core::{DType, Device, Tensor};

use crate::prompt::{patch_token_count, ImageSpan, MultimodalPrompt};

pub const DEFAULT_PAD_TOKEN_ID: i64 = 2;
pub const DEFAULT_HIDDEN_SIZE: usize = 3072;

/// Collated model inputs for one batch of prompts.
///
/// With `B` rows, `L` the padded text length and `S = L + img_length + 1`
/// (the `+1` is the time-embedding slot): `input_ids` is `[B, L]` i64,
/// `attention_mask` is `[B, S, S]` f32, `position_ids` is `[B, S]` i64.
/// `image_sizes` maps a batch row to the pad-shifted spans of its input
/// images, `pixel_values` flattens every row's input images in order, and
/// `padding_images` holds one zero filler per row whose output-image block is
/// shorter than the batch maximum.
#[derive(Debug)]
pub struct BatchTensors {
    pub input_ids: Tensor,
    pub attention_mask: Tensor,
    pub position_ids: Tensor,
    pub image_sizes: BTreeMap<usize, Vec<ImageSpan>>,
    pub pixel_values: Vec<Tensor>,
    pub padding_images: Vec<Option<Tensor>>,
}

/// Left-pads tokenized prompts to a common length and builds the attention
/// mask and position ids around the trailing output-image block.
#[derive(Debug, Clone)]
pub struct Collator {
    pad_token_id: i64,
    hidden_size: usize,
    device: Device,
}

impl Default for Collator {
    fn default() -> Self {
        Self::new()
    }
}

impl Collator {
    pub fn new() -> Self {
        Self {
            pad_token_id: DEFAULT_PAD_TOKEN_ID,
            hidden_size: DEFAULT_HIDDEN_SIZE,
            device: Device::Cpu,
        }
    }

    pub fn with_pad_token_id(mut self, pad_token_id: i64) -> Self {
        self.pad_token_id = pad_token_id;
        self
    }

    pub fn with_hidden_size(mut self, hidden_size: usize) -> Self {
        self.hidden_size = hidden_size;
        self
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Collates `units` into batch tensors sized for the `target_sizes`
    /// output images (one `(height, width)` pixel size per unit).
    pub fn assemble(
        &self,
        units: &[MultimodalPrompt],
        target_sizes: &[(usize, usize)],
    ) -> Result<BatchTensors> {
        ensure!(!units.is_empty(), "cannot collate an empty batch");
        ensure!(
            units.len() == target_sizes.len(),
            "batch has {} units but {} target sizes",
            units.len(),
            target_sizes.len()
        );

        let output_tokens: Vec<usize> = target_sizes
            .iter()
            .map(|&(height, width)| patch_token_count(height, width))
            .collect();
        let img_length = *output_tokens.iter().max().expect("batch is non-empty");
        ensure!(img_length > 0, "target sizes produce an empty image block");
        let max_len = units
            .iter()
            .map(|unit| unit.input_ids.len())
            .max()
            .expect("batch is non-empty");
        let seq_len = max_len + img_length + 1;

        let batch = units.len();
        let mut padded_ids = Vec::with_capacity(batch * max_len);
        let mut position_ids = Vec::with_capacity(batch * seq_len);
        let mut mask = Vec::with_capacity(batch * seq_len * seq_len);
        let mut image_sizes = BTreeMap::new();
        let mut pixel_values = Vec::new();
        let mut padding_images = Vec::with_capacity(batch);

        for (row, unit) in units.iter().enumerate() {
            let real_len = unit.input_ids.len();
            let pad_len = max_len - real_len;

            padded_ids.extend(std::iter::repeat_n(self.pad_token_id, pad_len));
            padded_ids.extend_from_slice(&unit.input_ids);

            // Pad slots all carry position 0; real positions count from 0
            // through the image block and the trailing time slot.
            position_ids.extend(std::iter::repeat_n(0i64, pad_len));
            position_ids.extend(0..=(real_len + img_length) as i64);

            let mut row_mask = causal_image_mask(real_len, pad_len, img_length)?;

            let true_img_length = output_tokens[row];
            let filler = img_length - true_img_length;
            if filler > 0 {
                zero_trailing_columns(&mut row_mask, seq_len, filler)?;
                padding_images.push(Some(Tensor::zeros(
                    (1, filler, self.hidden_size),
                    DType::F32,
                    &self.device,
                )?));
            } else {
                padding_images.push(None);
            }

            let shifted: Vec<ImageSpan> = unit
                .image_spans
                .iter()
                .map(|span| span.shifted(pad_len))
                .collect();
            for span in &shifted {
                open_full_visibility_window(&mut row_mask, seq_len, *span)?;
            }
            if !shifted.is_empty() {
                image_sizes.insert(row, shifted);
            }

            for pixel in &unit.pixel_values {
                pixel_values.push(pixel.unsqueeze(0)?);
            }

            mask.extend(row_mask);
        }

        Ok(BatchTensors {
            input_ids: Tensor::from_vec(padded_ids, (batch, max_len), &self.device)?,
            attention_mask: Tensor::from_vec(mask, (batch, seq_len, seq_len), &self.device)?,
            position_ids: Tensor::from_vec(position_ids, (batch, seq_len), &self.device)?,
            image_sizes,
            pixel_values,
            padding_images,
        })
    }
}

/// Builds one row's `seq_len x seq_len` mask: causal over the `real_len + 1`
/// text+time prefix, fully dense rows for the trailing output-image block,
/// zeroed pad columns.
///
/// Pad query rows are written as ones, not zeros: an all-masked row softmaxes
/// to NaN and the NaN would reach real rows through the value matmul. Zeroing
/// the pad columns is what keeps padding invisible to every real query.
fn causal_image_mask(real_len: usize, pad_len: usize, img_length: usize) -> Result<Vec<f32>> {
    let causal_len = real_len + 1;
    let seq_len = pad_len + causal_len + img_length;
    let mut mask = vec![0f32; seq_len * seq_len];

    for row in 0..pad_len {
        mask[row * seq_len..(row + 1) * seq_len].fill(1.0);
    }
    for offset in 0..causal_len {
        let row = pad_len + offset;
        for col in 0..=offset {
            mask[row * seq_len + pad_len + col] = 1.0;
        }
    }
    for offset in 0..img_length {
        let row = pad_len + causal_len + offset;
        mask[row * seq_len + pad_len..(row + 1) * seq_len].fill(1.0);
    }

    Ok(mask)
}

/// Zeroes the trailing `count` key columns of every row; used when a unit's
/// own output-image block is shorter than the batch maximum.
fn zero_trailing_columns(mask: &mut [f32], seq_len: usize, count: usize) -> Result<()> {
    ensure!(
        mask.len() == seq_len * seq_len,
        "mask buffer holds {} values, expected {seq_len}x{seq_len}",
        mask.len()
    );
    ensure!(
        count <= seq_len,
        "cannot zero {count} trailing columns of a {seq_len}-wide mask"
    );
    for row in 0..seq_len {
        mask[row * seq_len + seq_len - count..(row + 1) * seq_len].fill(0.0);
    }
    Ok(())
}

/// Opens the `span x span` submatrix: input-image patch tokens are mutually
/// and self visible regardless of their causal position.
fn open_full_visibility_window(mask: &mut [f32], seq_len: usize, span: ImageSpan) -> Result<()> {
    ensure!(
        mask.len() == seq_len * seq_len,
        "mask buffer holds {} values, expected {seq_len}x{seq_len}",
        mask.len()
    );
    ensure!(
        span.end <= seq_len && span.start <= span.end,
        "image span {}..{} exceeds sequence length {seq_len}",
        span.start,
        span.end
    );
    for row in span.start..span.end {
        mask[row * seq_len + span.start..row * seq_len + span.end].fill(1.0);
    }
    Ok(())
}

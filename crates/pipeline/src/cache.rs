use anyhow::{ensure, Result};
use candle_core::{Device, Tensor};
use omnigen_core::tensor::into_device_if_needed;

/// Key/value projections of the prompt prefix for one transformer layer,
/// both `[batch, heads, prompt_len, head_dim]`.
#[derive(Debug, Clone)]
pub struct KvEntry {
    key: Tensor,
    value: Tensor,
}

impl KvEntry {
    pub fn new(key: Tensor, value: Tensor) -> Result<Self> {
        ensure!(
            key.rank() == 4 && value.rank() == 4,
            "cache entries must be rank-4 [batch, heads, tokens, head_dim], got ranks {} and {}",
            key.rank(),
            value.rank()
        );
        ensure!(
            key.shape() == value.shape(),
            "key shape {:?} differs from value shape {:?}",
            key.shape(),
            value.shape()
        );
        Ok(Self { key, value })
    }

    pub fn key(&self) -> &Tensor {
        &self.key
    }

    pub fn value(&self) -> &Tensor {
        &self.value
    }

    pub fn prompt_len(&self) -> usize {
        self.key.dims()[2]
    }

    fn relocate(self, device: &Device) -> Result<Self> {
        Ok(Self {
            key: into_device_if_needed(self.key, device)?,
            value: into_device_if_needed(self.value, device)?,
        })
    }
}

/// Prompt-prefix KV cache filled once during the first denoising step and
/// read back by every later step.
///
/// Layers record in order and exactly once; the forward pass owns the layer
/// numbering, the cache only enforces it.
#[derive(Debug, Default)]
pub struct PromptKvCache {
    layers: Vec<KvEntry>,
}

impl PromptKvCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Records layer `layer`'s prompt projections. Layers must arrive in
    /// order starting at zero and cannot be overwritten.
    pub fn record(&mut self, layer: usize, entry: KvEntry) -> Result<()> {
        ensure!(
            layer == self.layers.len(),
            "layer {layer} recorded out of order; expected layer {}",
            self.layers.len()
        );
        if let Some(first) = self.layers.first() {
            ensure!(
                first.prompt_len() == entry.prompt_len(),
                "layer {layer} caches {} prompt tokens but earlier layers cache {}",
                entry.prompt_len(),
                first.prompt_len()
            );
        }
        self.layers.push(entry);
        Ok(())
    }

    pub fn layer(&self, layer: usize) -> Option<&KvEntry> {
        self.layers.get(layer)
    }

    /// Number of prompt tokens the cache covers, zero when unfilled.
    pub fn prompt_len(&self) -> usize {
        self.layers.first().map_or(0, KvEntry::prompt_len)
    }

    /// Parks every cached tensor in host memory.
    pub fn offload_to_host(&mut self) -> Result<()> {
        self.relocate(&Device::Cpu)
    }

    /// Brings every cached tensor back onto `device`.
    pub fn restage(&mut self, device: &Device) -> Result<()> {
        self.relocate(device)
    }

    fn relocate(&mut self, device: &Device) -> Result<()> {
        self.layers = std::mem::take(&mut self.layers)
            .into_iter()
            .map(|entry| entry.relocate(device))
            .collect::<Result<Vec<_>>>()?;
        Ok(())
    }

    pub fn clear(&mut self) {
        self.layers.clear();
    }
}

pub mod cache;
pub mod error;
pub mod model;
pub mod observer;
pub mod options;
pub mod pipeline;
pub mod sampler;
pub mod schedule;
pub mod vae;

pub use cache::{KvEntry, PromptKvCache};
pub use error::PipelineError;
pub use model::{DiffusionModel, ModelHandle, ModelKwargs, ModelPlacement};
pub use observer::{NoopObserver, PipelineEvent, PipelineObserver};
pub use options::{GenerateOptions, GenerateOptionsPatch};
pub use pipeline::{
    GenerateRequest, GenerationPipeline, LATENT_CHANNELS, LATENT_DOWNSAMPLE, VAE_SCALING_FACTOR,
};
pub use sampler::{
    crop_for_cached_prompt, merge_guided, replicate_branches, ForwardStrategy, GuidanceScales,
    GuidedSampler, SamplerOptions,
};
pub use schedule::FlowMatchSchedule;
pub use vae::{encode_input_images, validate_encoder_input, LatentEncoder};

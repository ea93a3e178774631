use omnigen_core::PATCH_SIZE;

/// Request-level failures the caller can act on.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("no model weights are loaded")]
    ModelUnavailable,

    #[error("output size {height}x{width} is invalid; both sides must be positive multiples of {PATCH_SIZE}")]
    InvalidOutputSize { height: usize, width: usize },

    #[error("prompts in one batch resolved to different output sizes ({0:?}); split them into separate requests")]
    MixedOutputSizes(Vec<(usize, usize)>),

    #[error("guidance scale {0} is not finite and positive")]
    InvalidGuidanceScale(f64),

    #[error("inference steps must be at least 1")]
    NoInferenceSteps,
}

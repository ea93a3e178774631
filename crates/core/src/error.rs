use thiserror::Error;

/// Prompt/image validation failures.
///
/// All of these are raised while token sequences are still plain `Vec`s, before
/// any tensor is allocated, so a bad request fails fast and never touches the
/// compute device. Callers that need to classify a failure can
/// `anyhow::Error::downcast_ref::<PromptError>()`.
#[derive(Debug, Error)]
pub enum PromptError {
    /// Image tag indices must form the contiguous set `{1..K}`.
    #[error("image tags must be numbered contiguously from 1, got {found:?}")]
    MalformedPrompt { found: Vec<usize> },

    /// The number of distinct image tags disagrees with the supplied images.
    #[error("prompt references {tags} distinct images but {supplied} were supplied")]
    ImageCountMismatch { tags: usize, supplied: usize },

    /// A later image slot is populated while an earlier one is empty.
    #[error("image slot {slot} is used but slot {missing} has no image")]
    ImageConstraint { slot: usize, missing: usize },
}

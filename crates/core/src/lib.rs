pub mod cfg;
pub mod collate;
pub mod error;
pub mod preprocess;
pub mod processor;
pub mod prompt;
pub mod template;
pub mod tensor;

pub use cfg::{compose_combined, compose_separate, layout_of, BranchLayout, CfgBranches};
pub use collate::{BatchTensors, Collator, DEFAULT_HIDDEN_SIZE, DEFAULT_PAD_TOKEN_ID};
pub use error::PromptError;
pub use preprocess::{prepare_input_image, MIN_INPUT_IMAGE_SIZE};
pub use processor::{
    collect_image_slots, PrepareOptions, PreparedBatch, PreparedPrompts, Processor,
};
pub use prompt::{
    patch_token_count, ImageSpan, MultimodalPrompt, PromptEncoder, DEFAULT_BOS_TOKEN_ID,
    IMAGE_PLACEHOLDER_TOKEN_ID, PATCH_SIZE,
};
pub use template::{
    apply_instruction_template, canonicalize_image_tags, DEFAULT_NEGATIVE_PROMPT,
};

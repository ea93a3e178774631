use std::sync::LazyLock;

use regex::Regex;

pub const USER_TURN: &str = "<|user|>\n";
pub const GENERATION_DIRECTIVE: &str =
    "Generate an image according to the following instructions\n";
pub const PROMPT_SUFFIX: &str = "<|end|>\n";
pub const ASSISTANT_TURN: &str = "<|assistant|>\n<|diffusion|>";

/// Negative prompt applied when the caller does not provide one.
pub const DEFAULT_NEGATIVE_PROMPT: &str =
    "low quality, jpeg artifacts, ugly, poorly drawn face, blurry";

static SHORTHAND_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{image_(\d+)\}").expect("shorthand tag pattern is valid"));

/// Wraps a raw instruction in the fixed chat/diffusion control tokens the
/// model was trained with.
pub fn apply_instruction_template(prompt: &str) -> String {
    format!("{USER_TURN}{GENERATION_DIRECTIVE}{prompt}{PROMPT_SUFFIX}{ASSISTANT_TURN}")
}

/// Rewrites the user-facing `{image_N}` shorthand to the canonical
/// `<img><|image_N|></img>` marker understood by the tokenizer splitter.
pub fn canonicalize_image_tags(prompt: &str) -> String {
    SHORTHAND_TAG
        .replace_all(prompt, "<img><|image_$1|></img>")
        .into_owned()
}

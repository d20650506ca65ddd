//! Prompt formatting for Canary2 speech-to-text/translation training data.
//!
//! This crate provides the `PromptFormatter` which turns a two-turn dialog
//! (user prompt, assistant answer) into token ids, plus the manifest tooling
//! around it: lhotse cut parsing, language-code rewriting of manifests, and a
//! parallel encoding pipeline.

use std::collections::HashMap;

/// Trait for tokenization operations.
///
/// Implementors tokenize text under a named language context. Canary
/// tokenizers are aggregates: each language owns a slice of the id space and
/// control tags live in their own `spl_tokens` vocabulary.
pub trait PromptTokenizer {
    /// Tokenize `text` under the language context `lang`.
    /// `None` selects the tokenizer's generic multilingual context.
    fn text_to_ids(&self, text: &str, lang: Option<&str>) -> Result<Vec<u32>, PromptError>;

    /// Look up the id of a single literal token.
    fn token_to_id(&self, token: &str) -> Option<u32>;

    /// Id of the end-of-sequence token.
    fn eos_id(&self) -> Option<u32> {
        self.token_to_id(CANARY_EOS)
    }
}

// Blanket implementation for references to tokenizers
impl<T: PromptTokenizer + ?Sized> PromptTokenizer for &T {
    fn text_to_ids(&self, text: &str, lang: Option<&str>) -> Result<Vec<u32>, PromptError> {
        (*self).text_to_ids(text, lang)
    }

    fn token_to_id(&self, token: &str) -> Option<u32> {
        (*self).token_to_id(token)
    }

    fn eos_id(&self) -> Option<u32> {
        (*self).eos_id()
    }
}

mod canary2;
mod cut;
mod error;
mod formatter;
pub mod manifest;
pub mod pipeline;
mod slots;
mod template;

#[cfg(test)]
mod testing;

pub use canary2::{canary2_prompt, resolve_sample, FormatterConfig, PromptSample, ResolvedSample};
pub use cut::{Cut, MixedCut, MonoCut, MultiCut, PaddingCut, Supervision, Track};
pub use error::{ManifestError, PromptError};
pub use formatter::{
    Dialog, EncodedDialog, PromptFormatter, Role, Turn, PROMPT_LANGUAGE_SLOT, TEXT_LANG_SLOT,
};
pub use manifest::{
    discover_manifests, language_code, process_manifest_file, update_cut_language,
    update_manifests, ManifestStats, SkipReason, UpdateReport, DEFAULT_MANIFEST_PATTERN,
};
pub use pipeline::{
    encode_manifest, read_manifest_parallel, write_jsonl_output, EncodeResult, EncodedRecord,
    ManifestReadout, PipelineConfig,
};
pub use slots::{
    bool_slot_value, emotion_tag, lang_tag, mangled, BoolSlot, SlotKind, EMOTION_TAGS,
};
pub use template::{PromptTemplate, ProtocolVersion, TurnTemplate, TEXT_SLOT};

/// Begin-of-context control token (precedes the decoder context).
pub const CANARY2_BOCTX: &str = "<|startofcontext|>";

/// Begin-of-transcript control token.
pub const CANARY_BOS: &str = "<|startoftranscript|>";

/// End-of-sequence control token. Every assistant turn ends with it.
pub const CANARY_EOS: &str = "<|endoftext|>";

/// Language context name of the control-tag vocabulary.
pub const CANARY_SPECIAL_TOKENIZER: &str = "spl_tokens";

/// Default target language of the translation branch.
pub const TRANSLATION_TARGET_LANG: &str = "en";

/// Slot values of a single turn, keyed by slot name.
pub type SlotValues = HashMap<String, String>;

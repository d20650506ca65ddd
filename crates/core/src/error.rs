//! Error types for prompt encoding and manifest processing.

use std::path::PathBuf;

use thiserror::Error;

/// Failures of template construction, sample resolution and encoding.
///
/// None of these are retried. Input contract violations are meant to be
/// caught upstream; template/tokenizer mismatches are configuration bugs.
#[derive(Debug, Error)]
pub enum PromptError {
    #[error("malformed {role} template {template:?}: {reason}")]
    MalformedTemplate {
        role: &'static str,
        template: String,
        reason: String,
    },

    #[error("missing value for slot '{0}'")]
    MissingSlot(String),

    #[error("invalid value {value:?} for slot '{slot}' (allowed: {allowed:?})")]
    InvalidSlotValue {
        slot: String,
        value: String,
        allowed: Vec<String>,
    },

    #[error("control tag {tag} of slot '{slot}' is missing from the tokenizer vocabulary")]
    UnknownControlTag { slot: String, tag: String },

    #[error("cut {cut_id} is missing required metadata keys: {keys:?}")]
    MissingMetadata { cut_id: String, keys: Vec<String> },

    #[error("expected a single-channel cut (MonoCut or MixedCut), got {kind} with id {cut_id}")]
    UnsupportedCut { kind: &'static str, cut_id: String },

    #[error("invalid tokenizer: no id for end-of-sequence token '{0}'")]
    InvalidTokenizer(String),

    #[error("expected the last answer token to be EOS ({eos}), got {found:?}")]
    MissingEos { eos: u32, found: Option<u32> },

    #[error("tokenizer error: {0}")]
    Tokenizer(String),
}

/// Failures of manifest reading, rewriting and output writing.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid file pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },

    #[error("failed to build worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),

    #[error("no manifest files matching {pattern:?} under {dir:?}")]
    NoManifests { dir: PathBuf, pattern: String },
}

impl ManifestError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

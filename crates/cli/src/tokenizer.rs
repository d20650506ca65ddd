//! Aggregate tokenizer backed by HuggingFace `tokenizers` models.
//!
//! Canary tokenizers keep one subword model per language plus a model for the
//! control tags (`spl_tokens`). Ids of each model are shifted by the total
//! vocabulary size of the models before it, so all languages share one id
//! space.

use std::error::Error;
use std::path::{Path, PathBuf};

use canary_prompt_core::{PromptError, PromptTokenizer, CANARY_SPECIAL_TOKENIZER};
use log::{debug, info};
use serde::Deserialize;
use tokenizers::Tokenizer as HfTokenizer;

/// On-disk description of an aggregate tokenizer.
///
/// ```json
/// {
///   "default_lang": "en",
///   "tokenizers": [
///     {"lang": "spl_tokens", "path": "spl_tokens/tokenizer.json"},
///     {"lang": "en", "path": "en/tokenizer.json"}
///   ]
/// }
/// ```
///
/// Relative paths are resolved against the config file's directory.
#[derive(Debug, Deserialize)]
pub struct AggregateConfig {
    /// Language used when a caller asks for the multilingual context.
    #[serde(default)]
    pub default_lang: Option<String>,
    pub tokenizers: Vec<LangEntry>,
}

#[derive(Debug, Deserialize)]
pub struct LangEntry {
    pub lang: String,
    pub path: PathBuf,
}

struct LangTokenizer {
    lang: String,
    inner: HfTokenizer,
    offset: u32,
}

/// Per-language HuggingFace tokenizers sharing one offset id space.
///
/// The Rust-native tokenizers are `Send + Sync`, so one instance can be shared
/// by all pipeline workers.
pub struct AggregateTokenizer {
    langs: Vec<LangTokenizer>,
    default_lang: Option<String>,
}

impl AggregateTokenizer {
    /// Load every tokenizer listed in an aggregate config file.
    pub fn load(config_path: &Path) -> Result<Self, Box<dyn Error>> {
        let raw = std::fs::read_to_string(config_path)?;
        let config: AggregateConfig = serde_json::from_str(&raw)?;
        let base = config_path.parent().unwrap_or_else(|| Path::new("."));

        let mut langs = Vec::with_capacity(config.tokenizers.len());
        let mut offset = 0u32;
        for entry in config.tokenizers {
            let path = if entry.path.is_absolute() {
                entry.path
            } else {
                base.join(entry.path)
            };
            let inner = HfTokenizer::from_file(&path)
                .map_err(|e| format!("failed to load tokenizer {:?}: {}", path, e))?;
            let vocab_size = inner
                .get_vocab(true)
                .values()
                .copied()
                .max()
                .map_or(0, |max| max + 1);
            debug!(
                "Loaded '{}' tokenizer from {:?} (vocab {}, offset {})",
                entry.lang, path, vocab_size, offset
            );
            langs.push(LangTokenizer {
                lang: entry.lang,
                inner,
                offset,
            });
            offset += vocab_size;
        }

        if !langs.iter().any(|l| l.lang == CANARY_SPECIAL_TOKENIZER) {
            return Err(format!(
                "aggregate tokenizer config {:?} has no '{}' entry",
                config_path, CANARY_SPECIAL_TOKENIZER
            )
            .into());
        }
        info!(
            "Aggregate tokenizer ready: {} languages, {} ids",
            langs.len(),
            offset
        );

        Ok(Self {
            langs,
            default_lang: config.default_lang,
        })
    }

    fn find(&self, lang: &str) -> Option<&LangTokenizer> {
        self.langs.iter().find(|l| l.lang == lang)
    }
}

impl PromptTokenizer for AggregateTokenizer {
    fn text_to_ids(&self, text: &str, lang: Option<&str>) -> Result<Vec<u32>, PromptError> {
        let lang = lang.or(self.default_lang.as_deref()).ok_or_else(|| {
            PromptError::Tokenizer("no language given and no default_lang configured".to_string())
        })?;
        let tokenizer = self
            .find(lang)
            .ok_or_else(|| PromptError::Tokenizer(format!("unknown language '{}'", lang)))?;
        let encoding = tokenizer
            .inner
            .encode(text, false)
            .map_err(|e| PromptError::Tokenizer(e.to_string()))?;
        Ok(encoding
            .get_ids()
            .iter()
            .map(|id| id + tokenizer.offset)
            .collect())
    }

    fn token_to_id(&self, token: &str) -> Option<u32> {
        let special = self.find(CANARY_SPECIAL_TOKENIZER)?;
        special
            .inner
            .token_to_id(token)
            .map(|id| id + special.offset)
    }
}

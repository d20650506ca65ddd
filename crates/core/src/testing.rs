//! Deterministic toy tokenizer shared by the unit tests.

use std::sync::LazyLock;

use regex::Regex;

use crate::{PromptError, PromptTokenizer, CANARY_SPECIAL_TOKENIZER};

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<\|[^|<>\s]+\|>").unwrap());

pub(crate) const CONTROL_VOCAB: &[&str] = &[
    "<|startofcontext|>",
    "<|startoftranscript|>",
    "<|endoftext|>",
    "<|pnc|>",
    "<|nopnc|>",
    "<|itn|>",
    "<|noitn|>",
    "<|timestamp|>",
    "<|notimestamp|>",
    "<|diarize|>",
    "<|nodiarize|>",
    "<|emo:undefined|>",
    "<|emo:neutral|>",
    "<|emo:angry|>",
    "<|emo:happy|>",
    "<|emo:sad|>",
    "<|en|>",
    "<|hi|>",
    "<|de|>",
    "<|fr|>",
    "<|mr|>",
];

/// Byte offset of raw (non-tag) characters in the control context.
pub(crate) const CONTROL_BYTE_BASE: u32 = 100;
/// Byte offset of the multilingual context.
pub(crate) const MULTILINGUAL_BASE: u32 = 9000;

/// Control tags map to dedicated ids; natural-language text maps each byte
/// into a per-language id range so tests can see which context was used.
#[derive(Debug, Default, Clone)]
pub(crate) struct ToyTokenizer {
    pub eos_override: Option<Option<u32>>,
}

impl ToyTokenizer {
    pub fn lang_base(lang: Option<&str>) -> Result<u32, PromptError> {
        match lang {
            None => Ok(MULTILINGUAL_BASE),
            Some("en") => Ok(1000),
            Some("hi") => Ok(2000),
            Some("de") => Ok(3000),
            Some("fr") => Ok(4000),
            Some("mr") => Ok(5000),
            Some(other) => Err(PromptError::Tokenizer(format!("unknown language '{}'", other))),
        }
    }

    pub fn tag_id(tag: &str) -> u32 {
        CONTROL_VOCAB.iter().position(|t| *t == tag).unwrap() as u32
    }

    fn control_ids(text: &str) -> Vec<u32> {
        let mut ids = Vec::new();
        let mut last = 0;
        let raw = |s: &str, ids: &mut Vec<u32>| {
            ids.extend(s.bytes().map(|b| CONTROL_BYTE_BASE + b as u32));
        };
        for m in TAG_RE.find_iter(text) {
            raw(&text[last..m.start()], &mut ids);
            match CONTROL_VOCAB.iter().position(|t| *t == m.as_str()) {
                Some(id) => ids.push(id as u32),
                None => raw(m.as_str(), &mut ids),
            }
            last = m.end();
        }
        raw(&text[last..], &mut ids);
        ids
    }
}

impl PromptTokenizer for ToyTokenizer {
    fn text_to_ids(&self, text: &str, lang: Option<&str>) -> Result<Vec<u32>, PromptError> {
        if lang == Some(CANARY_SPECIAL_TOKENIZER) {
            return Ok(Self::control_ids(text));
        }
        let base = Self::lang_base(lang)?;
        Ok(text.bytes().map(|b| base + b as u32).collect())
    }

    fn token_to_id(&self, token: &str) -> Option<u32> {
        CONTROL_VOCAB
            .iter()
            .position(|t| *t == token)
            .map(|id| id as u32)
    }

    fn eos_id(&self) -> Option<u32> {
        match self.eos_override {
            Some(eos) => eos,
            None => self.token_to_id(crate::CANARY_EOS),
        }
    }
}

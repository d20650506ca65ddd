//! Slot kinds, control-tag vocabulary and slot value resolution.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::PromptError;

// A control tag is a reserved vocabulary entry of the form <|...|>
static CONTROL_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<\|[^|<>\s]+\|>").unwrap());

/// Spellings accepted as "true" for every boolean-like control slot.
const BOOL_TRUE: &[&str] = &["yes", "1", "True", "true"];

/// Closed vocabulary of the emotion slot.
pub const EMOTION_TAGS: &[&str] = &[
    "<|emo:undefined|>",
    "<|emo:neutral|>",
    "<|emo:angry|>",
    "<|emo:happy|>",
    "<|emo:sad|>",
];

const PNC_TAGS: &[&str] = &["<|pnc|>", "<|nopnc|>"];
const ITN_TAGS: &[&str] = &["<|itn|>", "<|noitn|>"];
const TIMESTAMP_TAGS: &[&str] = &["<|timestamp|>", "<|notimestamp|>"];
const DIARIZE_TAGS: &[&str] = &["<|diarize|>", "<|nodiarize|>"];

/// The kind of value a slot accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    /// Free text, substituted verbatim.
    Text,
    /// One of a closed set of literal control tags.
    Literal(&'static [&'static str]),
    /// A single control tag from the tokenizer's open vocabulary, such as a
    /// language tag. Membership is checked against the tokenizer.
    Tag,
}

impl SlotKind {
    /// Check `value` against the slot's vocabulary.
    pub fn validate(&self, slot: &str, value: &str) -> Result<(), PromptError> {
        match self {
            SlotKind::Text => Ok(()),
            SlotKind::Literal(allowed) if allowed.contains(&value) => Ok(()),
            SlotKind::Literal(allowed) => Err(PromptError::InvalidSlotValue {
                slot: slot.to_string(),
                value: value.to_string(),
                allowed: allowed.iter().map(|s| s.to_string()).collect(),
            }),
            SlotKind::Tag if is_control_tag(value) => Ok(()),
            SlotKind::Tag => Err(PromptError::InvalidSlotValue {
                slot: slot.to_string(),
                value: value.to_string(),
                allowed: vec!["<|...|>".to_string()],
            }),
        }
    }
}

/// Boolean-like control slots. Each resolves to one of two literal tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolSlot {
    Pnc,
    Itn,
    Timestamp,
    Diarize,
}

impl BoolSlot {
    pub fn name(self) -> &'static str {
        match self {
            BoolSlot::Pnc => "pnc",
            BoolSlot::Itn => "itn",
            BoolSlot::Timestamp => "timestamp",
            BoolSlot::Diarize => "diarize",
        }
    }

    /// `[affirmative, negative]` tags.
    pub fn tags(self) -> &'static [&'static str] {
        match self {
            BoolSlot::Pnc => PNC_TAGS,
            BoolSlot::Itn => ITN_TAGS,
            BoolSlot::Timestamp => TIMESTAMP_TAGS,
            BoolSlot::Diarize => DIARIZE_TAGS,
        }
    }

    pub fn true_tag(self) -> &'static str {
        self.tags()[0]
    }

    pub fn false_tag(self) -> &'static str {
        self.tags()[1]
    }

    /// Value used when the sample leaves the slot unset.
    /// Punctuation is on by default (consistent with Canary 1).
    pub fn default_value(self) -> bool {
        matches!(self, BoolSlot::Pnc)
    }

    pub fn kind(self) -> SlotKind {
        SlotKind::Literal(self.tags())
    }

    fn is_truthy(self, raw: &str) -> bool {
        BOOL_TRUE.contains(&raw) || raw == self.name() || raw == self.true_tag()
    }
}

/// Resolve a raw manifest value of a boolean-like slot into its control tag.
pub fn bool_slot_value(slot: BoolSlot, raw: Option<&str>) -> &'static str {
    let on = match raw {
        Some(v) => slot.is_truthy(v),
        None => slot.default_value(),
    };
    if on {
        slot.true_tag()
    } else {
        slot.false_tag()
    }
}

/// Resolve an emotion value into its tag. Bare names are wrapped as `<|emo:NAME|>`.
pub fn emotion_tag(raw: Option<&str>) -> String {
    match raw {
        None => EMOTION_TAGS[0].to_string(),
        Some(v) if v.starts_with("<|") => v.to_string(),
        Some(v) => format!("<|emo:{}|>", v.strip_prefix("emo:").unwrap_or(v)),
    }
}

/// Wrap a language code as a control tag, e.g. `en` -> `<|en|>`.
pub fn lang_tag(lang: &str) -> String {
    if lang.starts_with("<|") && lang.ends_with("|>") {
        lang.to_string()
    } else {
        format!("<|{}|>", lang)
    }
}

/// Placeholder form of a slot name inside a template.
pub fn mangled(slot: &str) -> String {
    format!("|{}|", slot)
}

/// Whether `value` is exactly one control tag.
pub(crate) fn is_control_tag(value: &str) -> bool {
    CONTROL_TAG_RE
        .find(value)
        .map_or(false, |m| m.start() == 0 && m.end() == value.len())
}

/// Control tags appearing literally in `text`, in order.
pub(crate) fn control_tags(text: &str) -> Vec<&str> {
    CONTROL_TAG_RE.find_iter(text).map(|m| m.as_str()).collect()
}

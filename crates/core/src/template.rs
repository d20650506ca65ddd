//! Turn templates and the two Canary2 protocol versions.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::PromptError;
use crate::formatter::Role;
use crate::slots::{mangled, BoolSlot, SlotKind, EMOTION_TAGS};
use crate::{SlotValues, CANARY2_BOCTX, CANARY_BOS, CANARY_EOS};

// Control tags are matched first so their pipes never pair up with a placeholder.
static SEGMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?P<tag><\|[^|<>\s]+\|>)|\|(?P<slot>[A-Za-z_][A-Za-z0-9_]*)\|").unwrap()
});

/// Slot holding the transcript in assistant turns.
pub const TEXT_SLOT: &str = "text";

/// A validated template for one role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnTemplate {
    pub role: Role,
    pub template: String,
    pub slots: Vec<(&'static str, SlotKind)>,
}

impl TurnTemplate {
    /// Validate and build a template.
    ///
    /// Every declared slot must appear in the template and every placeholder
    /// must be declared. Assistant templates must contain exactly one `|text|`
    /// and terminate with the end-of-sequence token.
    pub fn new(
        role: Role,
        template: impl Into<String>,
        slots: Vec<(&'static str, SlotKind)>,
    ) -> Result<Self, PromptError> {
        let template = template.into();
        let malformed = |reason: String| PromptError::MalformedTemplate {
            role: role.as_str(),
            template: template.clone(),
            reason,
        };

        let placeholders: Vec<&str> = SEGMENT_RE
            .captures_iter(&template)
            .filter_map(|c| c.name("slot").map(|m| m.as_str()))
            .collect();

        for name in &placeholders {
            if !slots.iter().any(|(s, _)| s == name) {
                return Err(malformed(format!("placeholder '{}' is not a declared slot", name)));
            }
        }
        for (slot, _) in &slots {
            if !placeholders.contains(slot) {
                return Err(malformed(format!("declared slot '{}' has no placeholder", slot)));
            }
        }

        if role == Role::Assistant {
            let count = template.matches(&mangled(TEXT_SLOT)).count();
            if count != 1 {
                return Err(malformed(format!(
                    "expected exactly one '{}' placeholder, found {}",
                    mangled(TEXT_SLOT),
                    count
                )));
            }
            if !template.ends_with(CANARY_EOS) {
                return Err(malformed(format!("must terminate with {}", CANARY_EOS)));
            }
        }

        Ok(Self {
            role,
            template,
            slots,
        })
    }

    pub fn slot_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.slots.iter().map(|(name, _)| *name)
    }

    /// Substitute every placeholder of `segment` with its slot value.
    ///
    /// Substitution is a single left-to-right pass, so slot values that happen
    /// to contain `|name|` are never substituted again.
    pub(crate) fn fill(&self, segment: &str, values: &SlotValues) -> Result<String, PromptError> {
        let mut out = String::with_capacity(segment.len());
        let mut last = 0;
        for caps in SEGMENT_RE.captures_iter(segment) {
            let Some(slot) = caps.name("slot") else {
                continue;
            };
            let name = slot.as_str();
            let kind = self
                .slots
                .iter()
                .find(|(s, _)| *s == name)
                .map(|(_, kind)| *kind)
                .unwrap_or(SlotKind::Text);
            let value = values
                .get(name)
                .ok_or_else(|| PromptError::MissingSlot(name.to_string()))?;
            kind.validate(name, value)?;

            let whole = caps.get(0).map(|m| m.range()).unwrap_or(slot.range());
            out.push_str(&segment[last..whole.start]);
            out.push_str(value);
            last = whole.end;
        }
        out.push_str(&segment[last..]);
        Ok(out)
    }

    /// Split an assistant template around its text placeholder.
    pub(crate) fn split_at_text(&self) -> (&str, &str) {
        // Validated at construction: exactly one placeholder.
        self.template
            .split_once(&mangled(TEXT_SLOT))
            .unwrap_or((self.template.as_str(), ""))
    }
}

/// Named layout of the Canary2 dialog.
///
/// The two layouts differ in which turn carries the control slots; they are
/// not interchangeable for a trained model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProtocolVersion {
    /// Control slots and the target language in the user turn; the model
    /// answers with the source language and the transcript.
    #[default]
    UserControls,
    /// Only the decoder context in the user turn; every control slot,
    /// including timestamps, is part of the answer.
    AnswerControls,
}

impl ProtocolVersion {
    pub fn name(self) -> &'static str {
        match self {
            ProtocolVersion::UserControls => "user-controls",
            ProtocolVersion::AnswerControls => "answer-controls",
        }
    }

    /// Build the templates of this version.
    pub fn template(self) -> Result<PromptTemplate, PromptError> {
        let emotion = ("emotion", SlotKind::Literal(EMOTION_TAGS));
        let pnc = (BoolSlot::Pnc.name(), BoolSlot::Pnc.kind());
        let itn = (BoolSlot::Itn.name(), BoolSlot::Itn.kind());
        let timestamp = (BoolSlot::Timestamp.name(), BoolSlot::Timestamp.kind());
        let diarize = (BoolSlot::Diarize.name(), BoolSlot::Diarize.kind());

        let (user, assistant) = match self {
            ProtocolVersion::UserControls => (
                TurnTemplate::new(
                    Role::User,
                    format!(
                        "{}|decodercontext|{}|emotion||target_lang||pnc||itn||diarize|",
                        CANARY2_BOCTX, CANARY_BOS
                    ),
                    vec![
                        ("decodercontext", SlotKind::Text),
                        emotion,
                        ("target_lang", SlotKind::Tag),
                        pnc,
                        itn,
                        diarize,
                    ],
                )?,
                TurnTemplate::new(
                    Role::Assistant,
                    format!("|source_lang||text|{}", CANARY_EOS),
                    vec![("source_lang", SlotKind::Tag), (TEXT_SLOT, SlotKind::Text)],
                )?,
            ),
            ProtocolVersion::AnswerControls => (
                TurnTemplate::new(
                    Role::User,
                    format!("{}|decodercontext|{}", CANARY2_BOCTX, CANARY_BOS),
                    vec![("decodercontext", SlotKind::Text)],
                )?,
                TurnTemplate::new(
                    Role::Assistant,
                    format!(
                        "|emotion||source_lang||target_lang||pnc||itn||timestamp||diarize||text|{}",
                        CANARY_EOS
                    ),
                    vec![
                        emotion,
                        ("source_lang", SlotKind::Tag),
                        ("target_lang", SlotKind::Tag),
                        pnc,
                        itn,
                        timestamp,
                        diarize,
                        (TEXT_SLOT, SlotKind::Text),
                    ],
                )?,
            ),
        };

        Ok(PromptTemplate {
            version: self,
            user,
            assistant,
        })
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ProtocolVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user-controls" => Ok(ProtocolVersion::UserControls),
            "answer-controls" => Ok(ProtocolVersion::AnswerControls),
            other => Err(format!(
                "unknown protocol version '{}' (expected user-controls or answer-controls)",
                other
            )),
        }
    }
}

/// The user and assistant templates of one protocol version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    pub version: ProtocolVersion,
    pub user: TurnTemplate,
    pub assistant: TurnTemplate,
}

impl PromptTemplate {
    pub fn for_role(&self, role: Role) -> &TurnTemplate {
        match role {
            Role::User => &self.user,
            Role::Assistant => &self.assistant,
        }
    }
}

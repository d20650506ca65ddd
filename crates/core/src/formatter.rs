//! Prompt formatter turning a user/assistant dialog into token ids.

use log::debug;

use crate::error::PromptError;
use crate::slots::{control_tags, SlotKind};
use crate::template::{PromptTemplate, TurnTemplate, TEXT_SLOT};
use crate::{PromptTokenizer, SlotValues, CANARY_SPECIAL_TOKENIZER};

/// Slot overriding the language context of a generically encoded turn.
pub const PROMPT_LANGUAGE_SLOT: &str = "prompt_language";

/// Slot carrying the language context of the transcript in assistant turns.
pub const TEXT_LANG_SLOT: &str = "text_lang";

/// Speaker of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One role's resolved slot values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub role: Role,
    pub slots: SlotValues,
}

impl Turn {
    pub fn user(slots: SlotValues) -> Self {
        Self {
            role: Role::User,
            slots,
        }
    }

    pub fn assistant(slots: SlotValues) -> Self {
        Self {
            role: Role::Assistant,
            slots,
        }
    }
}

/// A user turn followed by an assistant turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dialog {
    pub user: Turn,
    pub assistant: Turn,
}

impl Dialog {
    pub fn new(user_slots: SlotValues, assistant_slots: SlotValues) -> Self {
        Self {
            user: Turn::user(user_slots),
            assistant: Turn::assistant(assistant_slots),
        }
    }
}

/// Token ids of an encoded dialog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedDialog {
    /// Prompt and answer, answer still terminated by EOS.
    pub input_ids: Vec<u32>,
    /// The user turn.
    pub context_ids: Vec<u32>,
    /// The assistant turn without its trailing EOS.
    pub answer_ids: Vec<u32>,
    /// `true` for every position of `input_ids` that belongs to the answer.
    pub mask: Vec<bool>,
}

/// Encodes dialogs with a fixed template and tokenizer.
///
/// The tokenizer and template are read-only; encoding holds no state between
/// calls.
pub struct PromptFormatter<T>
where
    T: PromptTokenizer,
{
    tokenizer: T,
    template: PromptTemplate,
    eos_id: u32,
    default_lang: Option<String>,
}

impl<T> PromptFormatter<T>
where
    T: PromptTokenizer,
{
    /// Create a formatter, checking that the tokenizer knows EOS and every
    /// control tag the template can emit.
    pub fn new(tokenizer: T, template: PromptTemplate) -> Result<Self, PromptError> {
        let eos_id = tokenizer
            .eos_id()
            .ok_or_else(|| PromptError::InvalidTokenizer(crate::CANARY_EOS.to_string()))?;

        for turn in [&template.user, &template.assistant] {
            let mut tags: Vec<&str> = control_tags(&turn.template);
            for (_, kind) in &turn.slots {
                if let SlotKind::Literal(values) = kind {
                    tags.extend(values.iter().copied());
                }
            }
            if let Some(missing) = tags.iter().find(|t| tokenizer.token_to_id(t).is_none()) {
                return Err(PromptError::Tokenizer(format!(
                    "control tag {} is missing from the tokenizer vocabulary",
                    missing
                )));
            }
        }

        debug!(
            "Prompt formatter ready (protocol {}, eos id {})",
            template.version, eos_id
        );
        Ok(Self {
            tokenizer,
            template,
            eos_id,
            default_lang: None,
        })
    }

    /// Language context for generically encoded turns without a
    /// `prompt_language` slot. `None` keeps the multilingual context.
    pub fn with_default_lang(mut self, lang: Option<String>) -> Self {
        self.default_lang = lang;
        self
    }

    pub fn template(&self) -> &PromptTemplate {
        &self.template
    }

    pub fn tokenizer(&self) -> &T {
        &self.tokenizer
    }

    pub fn eos_id(&self) -> u32 {
        self.eos_id
    }

    /// Encode a single turn.
    pub fn encode_turn(&self, turn: &Turn) -> Result<Vec<u32>, PromptError> {
        let template = self.template.for_role(turn.role);
        self.check_tags(template, &turn.slots)?;
        match turn.role {
            Role::User => self.encode_generic(template, &turn.slots),
            Role::Assistant => self.encode_answer(template, &turn.slots),
        }
    }

    /// Every value of a `Tag` slot must be a single token of the control
    /// vocabulary; otherwise it would be spelled out as raw bytes.
    fn check_tags(&self, template: &TurnTemplate, values: &SlotValues) -> Result<(), PromptError> {
        for (name, kind) in &template.slots {
            if *kind != SlotKind::Tag {
                continue;
            }
            let Some(tag) = values.get(*name) else {
                continue;
            };
            if self.tokenizer.token_to_id(tag).is_none() {
                return Err(PromptError::UnknownControlTag {
                    slot: name.to_string(),
                    tag: tag.clone(),
                });
            }
        }
        Ok(())
    }

    /// Substitute the whole template and tokenize it as one span.
    fn encode_generic(
        &self,
        template: &TurnTemplate,
        values: &SlotValues,
    ) -> Result<Vec<u32>, PromptError> {
        let prompt = template.fill(&template.template, values)?;
        let lang = values
            .get(PROMPT_LANGUAGE_SLOT)
            .map(String::as_str)
            .or(self.default_lang.as_deref());
        self.tokenizer.text_to_ids(&prompt, lang)
    }

    /// Tokenize the control prefix, the transcript and the control suffix
    /// separately. Transcript tokens never share a tokenizer call with control
    /// tags: the two use different subword vocabularies.
    fn encode_answer(
        &self,
        template: &TurnTemplate,
        values: &SlotValues,
    ) -> Result<Vec<u32>, PromptError> {
        let (before, after) = template.split_at_text();
        let text = values
            .get(TEXT_SLOT)
            .ok_or_else(|| PromptError::MissingSlot(TEXT_SLOT.to_string()))?;
        let text_lang = values.get(TEXT_LANG_SLOT).map(String::as_str);

        let prefix = template.fill(before, values)?;
        let mut tokens = self
            .tokenizer
            .text_to_ids(&prefix, Some(CANARY_SPECIAL_TOKENIZER))?;
        tokens.extend(self.tokenizer.text_to_ids(text, text_lang)?);
        tokens.extend(
            self.tokenizer
                .text_to_ids(after, Some(CANARY_SPECIAL_TOKENIZER))?,
        );
        Ok(tokens)
    }

    /// Encode both turns, check the answer ends with EOS and strip it.
    pub fn encode_dialog(&self, dialog: &Dialog) -> Result<EncodedDialog, PromptError> {
        let context_ids = self.encode_turn(&dialog.user)?;
        let mut answer_ids = self.encode_turn(&dialog.assistant)?;

        let last = answer_ids.last().copied();
        if last != Some(self.eos_id) {
            return Err(PromptError::MissingEos {
                eos: self.eos_id,
                found: last,
            });
        }

        let mut input_ids = Vec::with_capacity(context_ids.len() + answer_ids.len());
        input_ids.extend_from_slice(&context_ids);
        input_ids.extend_from_slice(&answer_ids);
        let mut mask = vec![false; context_ids.len()];
        mask.resize(input_ids.len(), true);

        answer_ids.pop();
        Ok(EncodedDialog {
            input_ids,
            context_ids,
            answer_ids,
            mask,
        })
    }
}

//! Canary2 dialog protocol: resolve a cut's metadata into slot values and
//! encode the user/assistant dialog.

use log::{debug, warn};
use rand::Rng;

use crate::cut::{custom_str, Cut};
use crate::error::PromptError;
use crate::formatter::{Dialog, EncodedDialog, PromptFormatter, PROMPT_LANGUAGE_SLOT, TEXT_LANG_SLOT};
use crate::slots::{bool_slot_value, emotion_tag, lang_tag, BoolSlot};
use crate::template::{PromptTemplate, ProtocolVersion, TurnTemplate, TEXT_SLOT};
use crate::{PromptTokenizer, SlotValues, CANARY_SPECIAL_TOKENIZER, TRANSLATION_TARGET_LANG};

/// Configuration for Canary2 prompt construction.
#[derive(Debug, Clone)]
pub struct FormatterConfig {
    pub version: ProtocolVersion,
    /// Probability of replacing the transcript with the supervision's
    /// `translation` field. 0.0 disables the translation task.
    pub translation_task_prob: f64,
    /// Target language forced when the translation branch is taken.
    pub translation_target_lang: String,
    /// Take missing `source_lang`/`target_lang` from the first supervision's
    /// custom fields instead of failing.
    pub supervision_lang_fallback: bool,
}

impl Default for FormatterConfig {
    fn default() -> Self {
        Self {
            version: ProtocolVersion::default(),
            translation_task_prob: 0.0,
            translation_target_lang: TRANSLATION_TARGET_LANG.to_string(),
            supervision_lang_fallback: false,
        }
    }
}

/// Metadata of one cut, resolved for prompting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSample {
    pub cut_id: String,
    pub source_lang: String,
    pub target_lang: String,
    pub text: String,
    /// Language context of the transcript; `None` selects the multilingual one.
    pub text_lang: Option<String>,
    pub decoder_context: String,
    pub emotion: Option<String>,
    pub pnc: Option<String>,
    pub itn: Option<String>,
    pub timestamp: Option<String>,
    pub diarize: Option<String>,
    /// Whether the translation branch replaced the transcript.
    pub translated: bool,
}

impl ResolvedSample {
    /// Slot values of both turns, keyed by slot name.
    fn slot_values(&self) -> SlotValues {
        let mut values = SlotValues::new();
        values.insert("decodercontext".to_string(), self.decoder_context.clone());
        values.insert("emotion".to_string(), emotion_tag(self.emotion.as_deref()));
        values.insert("source_lang".to_string(), lang_tag(&self.source_lang));
        values.insert("target_lang".to_string(), lang_tag(&self.target_lang));
        for (slot, raw) in [
            (BoolSlot::Pnc, &self.pnc),
            (BoolSlot::Itn, &self.itn),
            (BoolSlot::Timestamp, &self.timestamp),
            (BoolSlot::Diarize, &self.diarize),
        ] {
            values.insert(
                slot.name().to_string(),
                bool_slot_value(slot, raw.as_deref()).to_string(),
            );
        }
        values.insert(TEXT_SLOT.to_string(), self.text.clone());
        values
    }

    /// Build the dialog for `template`. Each turn receives the slots its
    /// template declares; the user turn is tokenized in the control context.
    pub fn dialog(&self, template: &PromptTemplate) -> Dialog {
        let values = self.slot_values();
        let pick = |turn: &TurnTemplate| -> SlotValues {
            turn.slot_names()
                .filter_map(|name| values.get(name).map(|v| (name.to_string(), v.clone())))
                .collect()
        };

        let mut user = pick(&template.user);
        user.insert(
            PROMPT_LANGUAGE_SLOT.to_string(),
            CANARY_SPECIAL_TOKENIZER.to_string(),
        );
        let mut assistant = pick(&template.assistant);
        if let Some(lang) = &self.text_lang {
            assistant.insert(TEXT_LANG_SLOT.to_string(), lang.clone());
        }
        Dialog::new(user, assistant)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

/// Resolve languages, transcript and control values of a cut.
///
/// The translation branch is drawn from `rng`, so a seeded generator makes the
/// result reproducible.
pub fn resolve_sample<R: Rng + ?Sized>(
    cut: &Cut,
    config: &FormatterConfig,
    rng: &mut R,
) -> Result<ResolvedSample, PromptError> {
    let mono = cut.as_mono()?;
    let custom = mono.custom.as_ref();
    let first = mono.supervisions.first();

    let mut source_lang = non_empty(custom_str(custom, "source_lang"));
    let mut target_lang = non_empty(custom_str(custom, "target_lang"));

    if (source_lang.is_none() || target_lang.is_none()) && config.supervision_lang_fallback {
        let sup_custom = first.and_then(|s| s.custom.as_ref());
        warn!(
            "Cut {} has no source_lang/target_lang, falling back to supervision metadata",
            mono.id
        );
        source_lang = source_lang.or_else(|| non_empty(custom_str(sup_custom, "source_lang")));
        target_lang = target_lang.or_else(|| non_empty(custom_str(sup_custom, "target_lang")));
    }

    let (source_lang, mut target_lang) = match (source_lang, target_lang) {
        (Some(s), Some(t)) => (s, t),
        (s, t) => {
            let keys = [("source_lang", s.is_none()), ("target_lang", t.is_none())]
                .iter()
                .filter(|(_, missing)| *missing)
                .map(|(k, _)| k.to_string())
                .collect();
            return Err(PromptError::MissingMetadata {
                cut_id: mono.id.clone(),
                keys,
            });
        }
    };

    let translation = first
        .and_then(|s| custom_str(s.custom.as_ref(), "translation"))
        .filter(|t| !t.is_empty());
    let translated = translation.is_some()
        && config.translation_task_prob > 0.0
        && rng.gen::<f64>() < config.translation_task_prob;

    let (text, text_lang) = match translation {
        Some(translation) if translated => {
            target_lang = config.translation_target_lang.clone();
            debug!("Cut {} uses the translation task ({})", mono.id, target_lang);
            (translation, Some(target_lang.clone()))
        }
        _ => {
            let text = mono
                .supervisions
                .iter()
                .filter_map(|s| s.text.as_deref())
                .collect::<Vec<_>>()
                .join(" ");
            let text_lang = non_empty(first.and_then(|s| s.language.clone()))
                .or_else(|| Some(target_lang.clone()));
            (text, text_lang)
        }
    };

    Ok(ResolvedSample {
        cut_id: mono.id.clone(),
        source_lang,
        target_lang,
        text,
        text_lang,
        decoder_context: custom_str(custom, "decodercontext").unwrap_or_default(),
        emotion: custom_str(custom, "emotion"),
        pnc: custom_str(custom, "pnc"),
        itn: custom_str(custom, "itn"),
        timestamp: custom_str(custom, "timestamp"),
        diarize: custom_str(custom, "diarize"),
        translated,
    })
}

/// A cut's resolved metadata and its encoding.
#[derive(Debug, Clone)]
pub struct PromptSample {
    pub sample: ResolvedSample,
    pub encoded: EncodedDialog,
}

/// Build and encode the Canary2 dialog of a cut.
///
/// `answer_ids` of the result exclude the trailing end-of-sequence token.
pub fn canary2_prompt<T, R>(
    cut: &Cut,
    formatter: &PromptFormatter<T>,
    config: &FormatterConfig,
    rng: &mut R,
) -> Result<PromptSample, PromptError>
where
    T: PromptTokenizer,
    R: Rng + ?Sized,
{
    let sample = resolve_sample(cut, config, rng)?;
    let dialog = sample.dialog(formatter.template());
    let encoded = formatter.encode_dialog(&dialog)?;
    Ok(PromptSample { sample, encoded })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ToyTokenizer, MULTILINGUAL_BASE};
    use crate::CANARY_EOS;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;

    fn cut(custom: serde_json::Value, supervisions: serde_json::Value) -> Cut {
        serde_json::from_value(json!({
            "id": "cut-1",
            "type": "MonoCut",
            "duration": 1.0,
            "supervisions": supervisions,
            "custom": custom,
        }))
        .unwrap()
    }

    fn formatter(version: ProtocolVersion) -> PromptFormatter<ToyTokenizer> {
        PromptFormatter::new(ToyTokenizer::default(), version.template().unwrap()).unwrap()
    }

    fn tag(t: &str) -> u32 {
        ToyTokenizer::tag_id(t)
    }

    fn decode_text(ids: &[u32], base: u32) -> String {
        ids.iter()
            .filter(|id| **id >= base && **id < base + 256)
            .map(|id| (id - base) as u8 as char)
            .collect()
    }

    #[test]
    fn test_user_controls_layout() {
        let cut = cut(
            json!({"source_lang": "hi", "target_lang": "en", "itn": "yes"}),
            json!([{"text": "ab", "language": "hi"}]),
        );
        let formatter = formatter(ProtocolVersion::UserControls);
        let mut rng = StdRng::seed_from_u64(0);
        let out = canary2_prompt(&cut, &formatter, &FormatterConfig::default(), &mut rng).unwrap();

        let expected_context: Vec<u32> = [
            "<|startofcontext|>",
            "<|startoftranscript|>",
            "<|emo:undefined|>",
            "<|en|>",
            "<|pnc|>",
            "<|itn|>",
            "<|nodiarize|>",
        ]
        .iter()
        .map(|t| tag(t))
        .collect();
        assert_eq!(out.encoded.context_ids, expected_context);
        assert_eq!(
            out.encoded.answer_ids,
            vec![tag("<|hi|>"), 2000 + b'a' as u32, 2000 + b'b' as u32]
        );
        assert_eq!(out.encoded.input_ids.last(), Some(&tag(CANARY_EOS)));
    }

    #[test]
    fn test_answer_controls_layout() {
        let cut = cut(
            json!({"source_lang": "de", "target_lang": "de", "timestamp": "timestamp", "emotion": "happy"}),
            json!([{"text": "x", "language": "de"}]),
        );
        let config = FormatterConfig {
            version: ProtocolVersion::AnswerControls,
            ..Default::default()
        };
        let formatter = formatter(ProtocolVersion::AnswerControls);
        let mut rng = StdRng::seed_from_u64(0);
        let out = canary2_prompt(&cut, &formatter, &config, &mut rng).unwrap();

        assert_eq!(
            out.encoded.context_ids,
            vec![tag("<|startofcontext|>"), tag("<|startoftranscript|>")]
        );
        let expected_answer: Vec<u32> = [
            "<|emo:happy|>",
            "<|de|>",
            "<|de|>",
            "<|pnc|>",
            "<|noitn|>",
            "<|timestamp|>",
            "<|nodiarize|>",
        ]
        .iter()
        .map(|t| tag(t))
        .chain([3000 + b'x' as u32])
        .collect();
        assert_eq!(out.encoded.answer_ids, expected_answer);
    }

    #[test]
    fn test_empty_text_still_has_control_tokens() {
        for version in [ProtocolVersion::UserControls, ProtocolVersion::AnswerControls] {
            let cut = cut(
                json!({"source_lang": "en", "target_lang": "en"}),
                json!([{"text": null, "language": "en"}]),
            );
            let formatter = formatter(version);
            let mut rng = StdRng::seed_from_u64(1);
            let out = canary2_prompt(&cut, &formatter, &FormatterConfig::default(), &mut rng).unwrap();
            assert!(out.encoded.context_ids.len() >= 2);
            assert!(!out.encoded.answer_ids.is_empty());
            assert!(out.encoded.input_ids.len() > out.encoded.answer_ids.len());
        }
    }

    #[test]
    fn test_transcript_joins_supervisions() {
        let cut = cut(
            json!({"source_lang": "en", "target_lang": "en"}),
            json!([{"text": "a"}, {"text": null}, {"text": "b"}]),
        );
        let mut rng = StdRng::seed_from_u64(0);
        let sample = resolve_sample(&cut, &FormatterConfig::default(), &mut rng).unwrap();
        assert_eq!(sample.text, "a b");
        // No supervision language: the target language is used
        assert_eq!(sample.text_lang.as_deref(), Some("en"));
    }

    #[test]
    fn test_missing_language_metadata() {
        let cut = cut(json!({"source_lang": "en"}), json!([{"text": "a"}]));
        let mut rng = StdRng::seed_from_u64(0);
        let err = resolve_sample(&cut, &FormatterConfig::default(), &mut rng).unwrap_err();
        match err {
            PromptError::MissingMetadata { cut_id, keys } => {
                assert_eq!(cut_id, "cut-1");
                assert_eq!(keys, vec!["target_lang".to_string()]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_language_outside_control_vocabulary() {
        let cut = cut(
            json!({"source_lang": "kn", "target_lang": "en"}),
            json!([{"text": "a", "language": "en"}]),
        );
        for version in [ProtocolVersion::UserControls, ProtocolVersion::AnswerControls] {
            let formatter = formatter(version);
            let mut rng = StdRng::seed_from_u64(0);
            let err = canary2_prompt(&cut, &formatter, &FormatterConfig::default(), &mut rng)
                .unwrap_err();
            assert!(
                matches!(err, PromptError::UnknownControlTag { ref slot, ref tag } if slot == "source_lang" && tag == "<|kn|>"),
                "{version}: {err:?}"
            );
        }
    }

    #[test]
    fn test_supervision_language_fallback_is_opt_in() {
        let cut = cut(
            json!({}),
            json!([{"text": "a", "custom": {"source_lang": "mr", "target_lang": "mr"}}]),
        );
        let mut rng = StdRng::seed_from_u64(0);
        assert!(resolve_sample(&cut, &FormatterConfig::default(), &mut rng).is_err());

        let config = FormatterConfig {
            supervision_lang_fallback: true,
            ..Default::default()
        };
        let sample = resolve_sample(&cut, &config, &mut rng).unwrap();
        assert_eq!(sample.source_lang, "mr");
        assert_eq!(sample.target_lang, "mr");
    }

    #[test]
    fn test_translation_always_taken_with_prob_one() {
        let cut = cut(
            json!({"source_lang": "hi", "target_lang": "hi"}),
            json!([{"text": "nmst", "language": "hi", "custom": {"translation": "hello"}}]),
        );
        let config = FormatterConfig {
            translation_task_prob: 1.0,
            ..Default::default()
        };
        let formatter = formatter(ProtocolVersion::UserControls);
        for seed in 0..20 {
            let mut rng = StdRng::seed_from_u64(seed);
            let out = canary2_prompt(&cut, &formatter, &config, &mut rng).unwrap();
            assert!(out.sample.translated);
            assert_eq!(out.sample.target_lang, "en");
            assert_eq!(out.sample.text, "hello");
            assert!(out.encoded.context_ids.contains(&tag("<|en|>")));
            assert_eq!(decode_text(&out.encoded.answer_ids, 1000), "hello");
        }
    }

    #[test]
    fn test_translation_never_taken_with_prob_zero() {
        let cut = cut(
            json!({"source_lang": "hi", "target_lang": "hi"}),
            json!([{"text": "nmst", "language": "hi", "custom": {"translation": "hello"}}]),
        );
        let config = FormatterConfig::default();
        for seed in 0..20 {
            let mut rng = StdRng::seed_from_u64(seed);
            let sample = resolve_sample(&cut, &config, &mut rng).unwrap();
            assert!(!sample.translated);
            assert_eq!(sample.target_lang, "hi");
            assert_eq!(sample.text, "nmst");
        }
    }

    #[test]
    fn test_translation_branch_is_seed_deterministic() {
        let cut = cut(
            json!({"source_lang": "hi", "target_lang": "hi"}),
            json!([{"text": "nmst", "custom": {"translation": "hello"}}]),
        );
        let config = FormatterConfig {
            translation_task_prob: 0.5,
            ..Default::default()
        };
        let draws = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            (0..32)
                .map(|_| resolve_sample(&cut, &config, &mut rng).unwrap().translated)
                .collect::<Vec<_>>()
        };
        let first = draws(7);
        assert_eq!(first, draws(7));
        // Both branches occur
        assert!(first.contains(&true) && first.contains(&false));
    }

    #[test]
    fn test_empty_translation_is_ignored() {
        let cut = cut(
            json!({"source_lang": "hi", "target_lang": "hi"}),
            json!([{"text": "nmst", "custom": {"translation": ""}}]),
        );
        let config = FormatterConfig {
            translation_task_prob: 1.0,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(0);
        let sample = resolve_sample(&cut, &config, &mut rng).unwrap();
        assert!(!sample.translated);
        assert_eq!(sample.text, "nmst");
    }

    #[test]
    fn test_empty_target_lang_text_uses_multilingual_context() {
        let formatter = formatter(ProtocolVersion::UserControls);
        let sample = ResolvedSample {
            cut_id: "c".into(),
            source_lang: "en".into(),
            target_lang: "en".into(),
            text: "z".into(),
            text_lang: None,
            decoder_context: String::new(),
            emotion: None,
            pnc: Some("no".into()),
            itn: None,
            timestamp: None,
            diarize: Some("diarize".into()),
            translated: false,
        };
        let encoded = formatter.encode_dialog(&sample.dialog(formatter.template())).unwrap();
        assert_eq!(encoded.answer_ids[1], MULTILINGUAL_BASE + b'z' as u32);
        assert!(encoded.context_ids.contains(&tag("<|nopnc|>")));
        assert!(encoded.context_ids.contains(&tag("<|diarize|>")));
    }
}

//! Minimal serde model of lhotse cut manifests.
//!
//! Only the fields the prompt formatter reads are typed; everything else is
//! kept in `extra` so a cut survives a parse/serialize cycle.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::PromptError;

/// A single-channel cut with its supervisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonoCut {
    pub id: String,
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub supervisions: Vec<Supervision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<Map<String, Value>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A multi-channel cut. Not supported by the prompt formatter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiCut {
    pub id: String,
    #[serde(default)]
    pub duration: f64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Silence used to pad mixed cuts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaddingCut {
    pub id: String,
    #[serde(default)]
    pub duration: f64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One track of a mixed cut.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub cut: Cut,
    #[serde(default)]
    pub offset: f64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Several cuts overlaid on each other.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixedCut {
    pub id: String,
    pub tracks: Vec<Track>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A cut as stored in a lhotse JSONL manifest, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Cut {
    MonoCut(MonoCut),
    MultiCut(MultiCut),
    MixedCut(MixedCut),
    PaddingCut(PaddingCut),
}

/// A transcribed segment of a cut.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Supervision {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<Map<String, Value>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Cut {
    pub fn id(&self) -> &str {
        match self {
            Cut::MonoCut(c) => &c.id,
            Cut::MultiCut(c) => &c.id,
            Cut::MixedCut(c) => &c.id,
            Cut::PaddingCut(c) => &c.id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Cut::MonoCut(_) => "MonoCut",
            Cut::MultiCut(_) => "MultiCut",
            Cut::MixedCut(_) => "MixedCut",
            Cut::PaddingCut(_) => "PaddingCut",
        }
    }

    /// Duration in seconds. A mixed cut spans to the end of its longest track.
    pub fn duration(&self) -> f64 {
        match self {
            Cut::MonoCut(c) => c.duration,
            Cut::MultiCut(c) => c.duration,
            Cut::PaddingCut(c) => c.duration,
            Cut::MixedCut(c) => c
                .tracks
                .iter()
                .map(|t| t.offset + t.cut.duration())
                .fold(0.0, f64::max),
        }
    }

    /// Resolve the single-channel cut carrying the supervisions.
    ///
    /// Mixed cuts resolve to their first non-padding track.
    pub fn as_mono(&self) -> Result<&MonoCut, PromptError> {
        match self {
            Cut::MonoCut(c) => Ok(c),
            Cut::MixedCut(mixed) => mixed
                .tracks
                .iter()
                .find(|t| !matches!(t.cut, Cut::PaddingCut(_)))
                .ok_or_else(|| PromptError::UnsupportedCut {
                    kind: "MixedCut without non-padding tracks",
                    cut_id: mixed.id.clone(),
                })
                .and_then(|t| t.cut.as_mono()),
            other => Err(PromptError::UnsupportedCut {
                kind: other.kind(),
                cut_id: other.id().to_string(),
            }),
        }
    }
}

/// Read a custom field as a string.
///
/// Booleans render as `True`/`False` and numbers in decimal form, which is how
/// manifests written by Python tooling spell them.
pub(crate) fn custom_str(custom: Option<&Map<String, Value>>, key: &str) -> Option<String> {
    match custom?.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Bool(true) => Some("True".to_string()),
        Value::Bool(false) => Some("False".to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

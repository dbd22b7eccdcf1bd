//! Witness-verse observations and the committed working text.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::alignment::{CharStats, ReplaceDetail, TokenDiffOp};

use super::verse::VerseId;
use super::witness::RegionStatus;

/// One witness's observed text for one verse
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WitnessVerse {
    pub verse_id: VerseId,
    pub witness_id: String,
    pub raw_text: String,
    pub normalized_text: String,
    pub clarity: f64,
    pub match_score: f64,
    pub completeness: f64,
    pub confidence: f64,
    pub status: RegionStatus,
    pub artifacts: WitnessVerseArtifacts,
    pub updated_at: DateTime<Utc>,
}

/// Typed artifact bag stored alongside a witness-verse row.
///
/// Unknown keys written by other tools are kept in `extra` and survive
/// every merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WitnessVerseArtifacts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_ops: Option<Vec<TokenDiffOp>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub char_stats: Option<CharStats>,

    /// Keyed by token index (as a string, so the bag stays a JSON object)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replace_details: Option<BTreeMap<String, ReplaceDetail>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_inputs: Option<ConfidenceInputs>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split: Option<SplitInfo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_region_id: Option<String>,

    #[serde(flatten)]
    pub extra: JsonMap<String, JsonValue>,
}

impl WitnessVerseArtifacts {
    /// Additive update: fields set in `update` win, everything else is kept
    pub fn merge(&mut self, update: WitnessVerseArtifacts) {
        if update.diff_ops.is_some() {
            self.diff_ops = update.diff_ops;
        }
        if update.char_stats.is_some() {
            self.char_stats = update.char_stats;
        }
        if update.replace_details.is_some() {
            self.replace_details = update.replace_details;
        }
        if update.confidence_inputs.is_some() {
            self.confidence_inputs = update.confidence_inputs;
        }
        if update.split.is_some() {
            self.split = update.split;
        }
        if update.source_region_id.is_some() {
            self.source_region_id = update.source_region_id;
        }
        self.extra.extend(update.extra);
    }
}

/// Inputs that produced the stored confidence
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInputs {
    pub authority: f64,
    pub clarity: f64,
    pub match_score: f64,
    pub completeness: f64,
}

/// How a region's OCR text was divided over its verses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitInfo {
    pub token_start: usize,
    pub token_end: usize,
    pub region_tokens: usize,
    pub baseline_tokens: usize,
}

/// Where the committed text came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "witness_id")]
pub enum SelectedSource {
    Witness(String),
    Baseline,
}

impl SelectedSource {
    pub fn witness_id(&self) -> Option<&str> {
        match self {
            Self::Witness(id) => Some(id),
            Self::Baseline => None,
        }
    }
}

impl std::fmt::Display for SelectedSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Witness(id) => f.write_str(id),
            Self::Baseline => f.write_str("baseline"),
        }
    }
}

/// Committed reconciliation result for one verse (one row per verse)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkingVerseText {
    pub verse_id: VerseId,
    pub selected_source: SelectedSource,
    pub surface_text: String,
    pub normalized_text: String,

    /// Hash of the normalized text; keys downstream taam work
    pub text_hash: String,

    pub ensemble_confidence: f64,
    pub flags: Vec<String>,
    pub reason_codes: Vec<String>,
    pub computed_at: DateTime<Utc>,
}

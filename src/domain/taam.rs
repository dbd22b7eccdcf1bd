//! Cantillation mark alignments and consensus records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::verse::VerseId;

/// A mark anchored to a letter of the target text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MarkPlacement {
    pub token_index: usize,
    pub letter_index: usize,
    pub mark: char,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlignmentStatus {
    /// Marks were recovered and placed
    Aligned,
    /// The witness text carries no marks
    NoMarks,
    /// Target or witness has no letters to anchor to
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AlignmentMetrics {
    pub witness_letters: usize,
    pub target_letters: usize,
    pub marks_extracted: usize,
    pub marks_placed: usize,
}

/// One witness's mark placements mapped onto a target text version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaamAlignment {
    pub verse_id: VerseId,
    pub witness_id: String,
    pub target_layer: String,

    /// Hash of the target text these placements were computed against
    pub target_text_hash: String,

    pub marks: Vec<MarkPlacement>,
    pub metrics: AlignmentMetrics,
    pub status: AlignmentStatus,
    pub computed_at: DateTime<Utc>,
}

/// A ranked consensus mark
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusMark {
    pub placement: MarkPlacement,
    pub weight: f64,
    pub confidence: f64,
    pub supporting_witnesses: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ConsensusMetrics {
    pub alignments_used: usize,
    pub stale_alignments: usize,
    pub candidate_count: usize,
    pub consensus_count: usize,
    pub total_weight: f64,
}

/// Weighted vote across witnesses for one verse and layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaamConsensus {
    pub verse_id: VerseId,
    pub target_layer: String,
    pub target_text_hash: String,
    pub marks: Vec<ConsensusMark>,
    pub ensemble_confidence: f64,
    pub flags: Vec<String>,
    pub metrics: ConsensusMetrics,
    pub computed_at: DateTime<Utc>,
}

impl TaamConsensus {
    pub fn consensus_count(&self) -> usize {
        self.marks.len()
    }
}

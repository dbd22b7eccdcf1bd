//! Taam (cantillation) consensus.
//!
//! Each witness's marks are projected onto the current working text and
//! stored keyed by that text's hash. Consensus then votes only the
//! alignments whose hash still matches, weighting each witness by its
//! current confidence.

pub mod consensus;
pub mod extract;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::core::PipelineError;
use crate::domain::{TaamAlignment, TaamConsensus, VerseId, WorkingVerseText};
use crate::store::Store;

pub use consensus::{vote, LOW_TAAM_CONFIDENCE, MISSING_TAAM_SIGNAL, TAAM_DISAGREEMENT};
pub use extract::{align_marks, extract_marks, letter_slots, project_ordinal, ExtractedMark};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaamPolicy {
    /// Name of the text layer marks are projected onto
    #[serde(default = "default_target_layer")]
    pub target_layer: String,

    #[serde(default = "default_max_consensus")]
    pub max_consensus: usize,
}

fn default_target_layer() -> String {
    "working".to_string()
}

fn default_max_consensus() -> usize {
    128
}

impl Default for TaamPolicy {
    fn default() -> Self {
        Self {
            target_layer: default_target_layer(),
            max_consensus: default_max_consensus(),
        }
    }
}

/// Store-backed alignment and consensus
#[derive(Clone)]
pub struct TaamEngine {
    store: Store,
    policy: TaamPolicy,
}

impl TaamEngine {
    pub fn new(store: Store, policy: TaamPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &TaamPolicy {
        &self.policy
    }

    fn target(&self, verse_id: &VerseId) -> Result<WorkingVerseText, PipelineError> {
        self.store
            .get_working_text(verse_id)?
            .ok_or_else(|| PipelineError::NotFound {
                kind: "working text",
                id: verse_id.to_string(),
            })
    }

    /// Align every witness with text for this verse against the working text
    #[instrument(skip(self), fields(verse_id = %verse_id))]
    pub fn align_verse(&self, verse_id: &VerseId) -> Result<Vec<TaamAlignment>, PipelineError> {
        let target = self.target(verse_id)?;
        let mut alignments = Vec::new();

        for row in self.store.witness_verses_for_verse(verse_id)? {
            if !row.status.is_usable() || row.raw_text.trim().is_empty() {
                continue;
            }
            let alignment = align_marks(
                verse_id,
                &row.witness_id,
                &row.raw_text,
                &target.surface_text,
                &target.text_hash,
                &self.policy.target_layer,
            );
            self.store.upsert_taam_alignment(&alignment)?;
            alignments.push(alignment);
        }

        info!(alignments = alignments.len(), "Taam alignments stored");
        Ok(alignments)
    }

    /// Vote stored alignments against the current working text hash
    #[instrument(skip(self), fields(verse_id = %verse_id))]
    pub fn consensus_verse(&self, verse_id: &VerseId) -> Result<TaamConsensus, PipelineError> {
        let target = self.target(verse_id)?;
        let alignments = self
            .store
            .taam_alignments(verse_id, &self.policy.target_layer)?;
        let weights: HashMap<String, f64> = self
            .store
            .witness_verses_for_verse(verse_id)?
            .into_iter()
            .map(|row| (row.witness_id, row.confidence))
            .collect();

        let consensus = vote(
            verse_id,
            &self.policy.target_layer,
            &target.text_hash,
            &alignments,
            &weights,
            self.policy.max_consensus,
        );
        self.store.upsert_taam_consensus(&consensus)?;

        info!(
            consensus_count = consensus.consensus_count(),
            stale_alignments = consensus.metrics.stale_alignments,
            confidence = consensus.ensemble_confidence,
            "Taam consensus stored"
        );
        Ok(consensus)
    }

    /// Verses that have a working text to align against
    pub fn verses_with_working_text(&self) -> Result<Vec<VerseId>, PipelineError> {
        let mut verses: Vec<VerseId> = self
            .store
            .list_working_texts()?
            .into_iter()
            .map(|w| w.verse_id)
            .collect();
        verses.sort();
        Ok(verses)
    }
}

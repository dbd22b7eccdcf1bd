//! Weighted vote over taam alignments.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use tracing::debug;

use crate::domain::{
    ConsensusMark, ConsensusMetrics, MarkPlacement, TaamAlignment, TaamConsensus, VerseId,
};

pub const MISSING_TAAM_SIGNAL: &str = "MISSING_TAAM_SIGNAL";
pub const TAAM_DISAGREEMENT: &str = "TAAM_DISAGREEMENT";
pub const LOW_TAAM_CONFIDENCE: &str = "LOW_TAAM_CONFIDENCE";

const SHARE_BOOST: f64 = 0.35;
const MAX_ENSEMBLE: f64 = 0.99;
const NO_SIGNAL_CONFIDENCE: f64 = 0.2;
const LOW_CONFIDENCE_BELOW: f64 = 0.65;
const DISAGREEMENT_SPREAD: usize = 20;

#[derive(Default)]
struct Bucket {
    weight: f64,
    witnesses: Vec<String>,
}

/// Vote the alignments computed against `current_hash`.
///
/// Alignments carrying any other hash are stale: they are counted in the
/// metrics and otherwise ignored. `weights` maps witness id to its current
/// confidence; unknown witnesses vote with zero weight.
pub fn vote(
    verse_id: &VerseId,
    target_layer: &str,
    current_hash: &str,
    alignments: &[TaamAlignment],
    weights: &HashMap<String, f64>,
    max_consensus: usize,
) -> TaamConsensus {
    let (fresh, stale): (Vec<&TaamAlignment>, Vec<&TaamAlignment>) = alignments
        .iter()
        .partition(|a| a.target_text_hash == current_hash);
    if !stale.is_empty() {
        debug!(
            verse_id = %verse_id,
            stale_alignments = stale.len(),
            "Skipping stale taam alignments"
        );
    }

    let mut buckets: BTreeMap<MarkPlacement, Bucket> = BTreeMap::new();
    for alignment in &fresh {
        let weight = weights
            .get(&alignment.witness_id)
            .copied()
            .filter(|w| w.is_finite() && *w > 0.0)
            .unwrap_or(0.0);
        for placement in &alignment.marks {
            let bucket = buckets.entry(*placement).or_default();
            bucket.weight += weight;
            bucket.witnesses.push(alignment.witness_id.clone());
        }
    }

    let candidate_count = buckets.len();
    let total_weight: f64 = buckets.values().map(|b| b.weight).sum();
    let share = |weight: f64| if total_weight > 0.0 { weight / total_weight } else { 0.0 };

    let mut ranked: Vec<(MarkPlacement, Bucket)> = buckets.into_iter().collect();
    // Stable sort keeps placement order among equal weights
    ranked.sort_by(|a, b| b.1.weight.partial_cmp(&a.1.weight).unwrap_or(Ordering::Equal));
    ranked.truncate(max_consensus);

    let marks: Vec<ConsensusMark> = ranked
        .into_iter()
        .map(|(placement, bucket)| ConsensusMark {
            placement,
            confidence: share(bucket.weight),
            weight: bucket.weight,
            supporting_witnesses: bucket.witnesses,
        })
        .collect();

    let ensemble_confidence = match marks.first() {
        Some(top) => (share(top.weight) + SHARE_BOOST).min(MAX_ENSEMBLE),
        None => NO_SIGNAL_CONFIDENCE,
    };

    let mut flags = Vec::new();
    if marks.is_empty() {
        flags.push(MISSING_TAAM_SIGNAL.to_string());
    }
    if candidate_count.saturating_sub(marks.len()) > DISAGREEMENT_SPREAD {
        flags.push(TAAM_DISAGREEMENT.to_string());
    }
    if ensemble_confidence < LOW_CONFIDENCE_BELOW {
        flags.push(LOW_TAAM_CONFIDENCE.to_string());
    }

    TaamConsensus {
        verse_id: verse_id.clone(),
        target_layer: target_layer.to_string(),
        target_text_hash: current_hash.to_string(),
        metrics: ConsensusMetrics {
            alignments_used: fresh.len(),
            stale_alignments: stale.len(),
            candidate_count,
            consensus_count: marks.len(),
            total_weight,
        },
        marks,
        ensemble_confidence,
        flags,
        computed_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AlignmentMetrics, AlignmentStatus};

    fn placement(token_index: usize, letter_index: usize, mark: char) -> MarkPlacement {
        MarkPlacement {
            token_index,
            letter_index,
            mark,
        }
    }

    fn alignment(witness: &str, hash: &str, marks: Vec<MarkPlacement>) -> TaamAlignment {
        TaamAlignment {
            verse_id: "Genesis 1:1".parse().unwrap(),
            witness_id: witness.to_string(),
            target_layer: "working".to_string(),
            target_text_hash: hash.to_string(),
            metrics: AlignmentMetrics::default(),
            status: AlignmentStatus::Aligned,
            marks,
            computed_at: Utc::now(),
        }
    }

    fn weights(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
        pairs.iter().map(|(w, c)| (w.to_string(), *c)).collect()
    }

    #[test]
    fn test_agreeing_witnesses_share_bucket() {
        let verse: VerseId = "Genesis 1:1".parse().unwrap();
        let mark = placement(0, 1, '\u{0591}');
        let consensus = vote(
            &verse,
            "working",
            "h1",
            &[
                alignment("a", "h1", vec![mark]),
                alignment("b", "h1", vec![mark]),
            ],
            &weights(&[("a", 0.9), ("b", 0.6)]),
            128,
        );
        assert_eq!(consensus.consensus_count(), 1);
        assert_eq!(consensus.marks[0].supporting_witnesses, vec!["a", "b"]);
        assert!((consensus.marks[0].confidence - 1.0).abs() < 1e-12);
        assert!((consensus.ensemble_confidence - 0.99).abs() < 1e-12);
        assert!(consensus.flags.is_empty());
    }

    #[test]
    fn test_stale_alignments_excluded() {
        let verse: VerseId = "Genesis 1:1".parse().unwrap();
        let consensus = vote(
            &verse,
            "working",
            "current",
            &[alignment("a", "old", vec![placement(0, 0, '\u{0591}')])],
            &weights(&[("a", 0.9)]),
            128,
        );
        assert_eq!(consensus.consensus_count(), 0);
        assert_eq!(consensus.metrics.stale_alignments, 1);
        assert_eq!(consensus.ensemble_confidence, 0.2);
        assert!(consensus.flags.contains(&MISSING_TAAM_SIGNAL.to_string()));
        assert!(consensus.flags.contains(&LOW_TAAM_CONFIDENCE.to_string()));
    }

    #[test]
    fn test_split_vote_flags_disagreement() {
        let verse: VerseId = "Genesis 1:1".parse().unwrap();
        let scattered: Vec<MarkPlacement> = (0..30).map(|i| placement(i, 0, '\u{0596}')).collect();
        let consensus = vote(
            &verse,
            "working",
            "h",
            &[alignment("a", "h", scattered)],
            &weights(&[("a", 0.5)]),
            5,
        );
        assert_eq!(consensus.metrics.candidate_count, 30);
        assert_eq!(consensus.consensus_count(), 5);
        assert!(consensus.flags.contains(&TAAM_DISAGREEMENT.to_string()));
        assert!(consensus.flags.contains(&LOW_TAAM_CONFIDENCE.to_string()));
    }
}

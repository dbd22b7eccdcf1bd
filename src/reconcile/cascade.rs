//! Cascade selector: one working text per verse.
//!
//! The best tier-A candidate wins if it clears its threshold, then the best
//! tier-B candidate, then the digital baseline at a fixed low confidence.
//! When qualifying A and B candidates disagree the ensemble confidence is
//! capped; when they agree it gets a small boost.

use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::alignment::{normalize_text, similarity, text_hash};
use crate::core::{PatchLog, PipelineError};
use crate::domain::{
    CascadeGroup, SelectedSource, VerseId, Witness, WitnessType, WitnessVerse, WorkingVerseText,
};
use crate::store::Store;

pub const TIER_A_UNAVAILABLE: &str = "TIER_A_UNAVAILABLE";
pub const TIER_B_UNAVAILABLE: &str = "TIER_B_UNAVAILABLE";
pub const TIER_A_SELECTED: &str = "TIER_A_SELECTED";
pub const TIER_B_SELECTED: &str = "TIER_B_SELECTED";
pub const TIER_A_LOW_CLARITY: &str = "TIER_A_LOW_CLARITY";
pub const CANDIDATES_BELOW_THRESHOLD: &str = "CANDIDATES_BELOW_THRESHOLD";
pub const HIGH_CONFIDENCE_DISAGREEMENT: &str = "HIGH_CONFIDENCE_DISAGREEMENT";
pub const TIER_A_B_AGREE: &str = "TIER_A_B_AGREE";

pub const DISAGREEMENT_FLAG: &str = "DISAGREEMENT_FLAG";
pub const NO_TEXT_AVAILABLE: &str = "NO_TEXT_AVAILABLE";

/// Cascade policy constants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CascadeThresholds {
    #[serde(default = "default_tier_a_threshold")]
    pub tier_a_threshold: f64,

    #[serde(default = "default_tier_b_threshold")]
    pub tier_b_threshold: f64,

    /// Qualifying A and B texts matching below this disagree
    #[serde(default = "default_disagreement_match")]
    pub disagreement_match: f64,

    #[serde(default = "default_disagreement_cap")]
    pub disagreement_cap: f64,

    #[serde(default = "default_agreement_boost")]
    pub agreement_boost: f64,

    #[serde(default = "default_fallback_confidence")]
    pub fallback_confidence: f64,
}

fn default_tier_a_threshold() -> f64 {
    0.80
}
fn default_tier_b_threshold() -> f64 {
    0.75
}
fn default_disagreement_match() -> f64 {
    0.80
}
fn default_disagreement_cap() -> f64 {
    0.70
}
fn default_agreement_boost() -> f64 {
    0.08
}
fn default_fallback_confidence() -> f64 {
    0.45
}

impl Default for CascadeThresholds {
    fn default() -> Self {
        Self {
            tier_a_threshold: default_tier_a_threshold(),
            tier_b_threshold: default_tier_b_threshold(),
            disagreement_match: default_disagreement_match(),
            disagreement_cap: default_disagreement_cap(),
            agreement_boost: default_agreement_boost(),
            fallback_confidence: default_fallback_confidence(),
        }
    }
}

/// A scored row with the witness it came from
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub witness: &'a Witness,
    pub row: &'a WitnessVerse,
}

/// Outcome of a cascade over one verse's candidates
#[derive(Debug, Clone, PartialEq)]
pub struct CascadeDecision {
    pub selected_source: SelectedSource,
    pub surface_text: String,
    pub normalized_text: String,
    pub ensemble_confidence: f64,
    pub flags: Vec<String>,
    pub reason_codes: Vec<String>,
}

/// Highest confidence usable row in `group`; ties go to the higher-authority witness
fn top_of_group<'a>(candidates: &[Candidate<'a>], group: CascadeGroup) -> Option<Candidate<'a>> {
    candidates
        .iter()
        .copied()
        .filter(|c| c.witness.cascade_group == Some(group) && c.row.status.is_usable())
        .max_by(|a, b| {
            a.row
                .confidence
                .partial_cmp(&b.row.confidence)
                .unwrap_or(Ordering::Equal)
                .then_with(|| {
                    let ta = a.witness.priority_tier.unwrap_or(u32::MAX);
                    let tb = b.witness.priority_tier.unwrap_or(u32::MAX);
                    tb.cmp(&ta)
                })
                .then_with(|| b.witness.id.cmp(&a.witness.id))
        })
}

/// Pick the working text for one verse. Pure.
///
/// `baseline_text` is the digital baseline used as the last resort.
pub fn select(
    candidates: &[Candidate<'_>],
    baseline_text: &str,
    thresholds: &CascadeThresholds,
) -> CascadeDecision {
    let top_a = top_of_group(candidates, CascadeGroup::A);
    let top_b = top_of_group(candidates, CascadeGroup::B);

    let mut reasons: Vec<String> = Vec::new();
    let mut flags: Vec<String> = Vec::new();

    if top_a.is_none() {
        reasons.push(TIER_A_UNAVAILABLE.into());
    }
    if top_b.is_none() {
        reasons.push(TIER_B_UNAVAILABLE.into());
    }

    let qualifying_a = top_a.filter(|c| c.row.confidence >= thresholds.tier_a_threshold);
    let qualifying_b = top_b.filter(|c| c.row.confidence >= thresholds.tier_b_threshold);

    let from_row = |c: Candidate<'_>| {
        (
            SelectedSource::Witness(c.witness.id.clone()),
            c.row.raw_text.clone(),
            c.row.normalized_text.clone(),
            c.row.confidence,
        )
    };

    let (selected_source, surface_text, normalized_text, mut ensemble) =
        if let Some(a) = qualifying_a {
            reasons.push(TIER_A_SELECTED.into());
            from_row(a)
        } else if let Some(b) = qualifying_b {
            if top_a.is_some() {
                reasons.push(TIER_A_LOW_CLARITY.into());
            }
            reasons.push(TIER_B_SELECTED.into());
            from_row(b)
        } else {
            reasons.push(CANDIDATES_BELOW_THRESHOLD.into());
            if normalize_text(baseline_text).is_empty() {
                flags.push(NO_TEXT_AVAILABLE.into());
            }
            (
                SelectedSource::Baseline,
                baseline_text.to_string(),
                normalize_text(baseline_text),
                thresholds.fallback_confidence,
            )
        };

    if let (Some(a), Some(b)) = (qualifying_a, qualifying_b) {
        let agreement = similarity(&a.row.normalized_text, &b.row.normalized_text);
        if agreement < thresholds.disagreement_match {
            flags.push(DISAGREEMENT_FLAG.into());
            reasons.push(HIGH_CONFIDENCE_DISAGREEMENT.into());
            ensemble = ensemble.min(thresholds.disagreement_cap);
        } else {
            reasons.push(TIER_A_B_AGREE.into());
            ensemble = (ensemble + thresholds.agreement_boost).min(1.0);
        }
    }

    CascadeDecision {
        selected_source,
        surface_text,
        normalized_text,
        ensemble_confidence: ensemble.clamp(0.0, 1.0),
        flags,
        reason_codes: reasons,
    }
}

/// Run the cascade for one verse and commit the result.
///
/// The commit is appended to the patch log, then the working text row is
/// overwritten. A failed append leaves the previous row in place.
#[instrument(skip(store, patch_log, thresholds), fields(verse_id = %verse_id))]
pub fn run_cascade(
    store: &Store,
    patch_log: &dyn PatchLog,
    verse_id: &VerseId,
    thresholds: &CascadeThresholds,
) -> Result<WorkingVerseText, PipelineError> {
    let verse = store
        .get_verse(verse_id)?
        .ok_or_else(|| PipelineError::NotFound {
            kind: "verse",
            id: verse_id.to_string(),
        })?;

    let witnesses: HashMap<String, Witness> = store
        .list_witnesses()?
        .into_iter()
        .map(|w| (w.id.clone(), w))
        .collect();
    let rows = store.witness_verses_for_verse(verse_id)?;

    let candidates: Vec<Candidate<'_>> = rows
        .iter()
        .filter_map(|row| {
            witnesses
                .get(&row.witness_id)
                .map(|witness| Candidate { witness, row })
        })
        .collect();

    // Digital baseline witnesses stand in when the verse has no baseline text
    let baseline_text = if normalize_text(&verse.baseline_text).is_empty() {
        candidates
            .iter()
            .find(|c| c.witness.witness_type == WitnessType::DigitalBaseline && c.row.status.is_usable())
            .map(|c| c.row.raw_text.clone())
            .unwrap_or_default()
    } else {
        verse.baseline_text.clone()
    };

    let decision = select(&candidates, &baseline_text, thresholds);

    let working = WorkingVerseText {
        verse_id: verse_id.clone(),
        selected_source: decision.selected_source,
        text_hash: text_hash(&decision.normalized_text),
        surface_text: decision.surface_text,
        normalized_text: decision.normalized_text,
        ensemble_confidence: decision.ensemble_confidence,
        flags: decision.flags,
        reason_codes: decision.reason_codes,
        computed_at: Utc::now(),
    };

    // Logged before the row is replaced, so the store never holds an unlogged commit
    let patch_id = patch_log
        .commit_working_text(verse_id, &working)
        .map_err(|e| PipelineError::Execution(format!("patch log commit failed: {:#}", e)))?;
    store.upsert_working_text(&working)?;

    if working.flags.iter().any(|f| f == DISAGREEMENT_FLAG) {
        warn!(source = %working.selected_source, "Authoritative witnesses disagree");
    }
    info!(
        source = %working.selected_source,
        confidence = working.ensemble_confidence,
        %patch_id,
        "Working text committed"
    );

    Ok(working)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RegionStatus, Verse, WitnessVerseArtifacts};

    struct AcceptingLog;

    impl PatchLog for AcceptingLog {
        fn commit_working_text(&self, _: &VerseId, _: &WorkingVerseText) -> anyhow::Result<uuid::Uuid> {
            Ok(uuid::Uuid::new_v4())
        }
    }

    struct FailingLog;

    impl PatchLog for FailingLog {
        fn commit_working_text(&self, _: &VerseId, _: &WorkingVerseText) -> anyhow::Result<uuid::Uuid> {
            anyhow::bail!("disk full")
        }
    }

    fn witness(id: &str, tier: u32, group: CascadeGroup) -> Witness {
        Witness {
            id: id.into(),
            name: id.into(),
            witness_type: WitnessType::Manuscript,
            priority_tier: Some(tier),
            authority_weight: 1.0,
            cascade_group: Some(group),
        }
    }

    fn row(witness_id: &str, text: &str, confidence: f64) -> WitnessVerse {
        WitnessVerse {
            verse_id: "Genesis 1:1".parse().unwrap(),
            witness_id: witness_id.into(),
            raw_text: text.into(),
            normalized_text: normalize_text(text),
            clarity: 1.0,
            match_score: 1.0,
            completeness: 1.0,
            confidence,
            status: RegionStatus::Ok,
            artifacts: WitnessVerseArtifacts::default(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_tier_a_selected_and_agreement_boosts() {
        let a = witness("a", 1, CascadeGroup::A);
        let b = witness("b", 2, CascadeGroup::B);
        let ra = row("a", "בראשית ברא אלהים", 0.85);
        let rb = row("b", "בראשית ברא אלהים", 0.80);
        let decision = select(
            &[Candidate { witness: &a, row: &ra }, Candidate { witness: &b, row: &rb }],
            "",
            &CascadeThresholds::default(),
        );
        assert_eq!(decision.selected_source, SelectedSource::Witness("a".into()));
        assert!((decision.ensemble_confidence - 0.93).abs() < 1e-9);
        assert!(decision.reason_codes.contains(&TIER_A_B_AGREE.to_string()));
        assert!(decision.flags.is_empty());
    }

    #[test]
    fn test_falls_to_tier_b_with_low_clarity_reason() {
        let a = witness("a", 1, CascadeGroup::A);
        let b = witness("b", 2, CascadeGroup::B);
        let ra = row("a", "x", 0.5);
        let rb = row("b", "y", 0.8);
        let decision = select(
            &[Candidate { witness: &a, row: &ra }, Candidate { witness: &b, row: &rb }],
            "",
            &CascadeThresholds::default(),
        );
        assert_eq!(decision.selected_source, SelectedSource::Witness("b".into()));
        assert!(decision.reason_codes.contains(&TIER_A_LOW_CLARITY.to_string()));
        assert_eq!(decision.ensemble_confidence, 0.8);
    }

    #[test]
    fn test_baseline_fallback() {
        let b = witness("b", 2, CascadeGroup::B);
        let rb = row("b", "y", 0.3);
        let decision = select(
            &[Candidate { witness: &b, row: &rb }],
            "בראשית",
            &CascadeThresholds::default(),
        );
        assert_eq!(decision.selected_source, SelectedSource::Baseline);
        assert_eq!(decision.ensemble_confidence, 0.45);
        assert!(decision.reason_codes.contains(&TIER_A_UNAVAILABLE.to_string()));
        assert!(decision
            .reason_codes
            .contains(&CANDIDATES_BELOW_THRESHOLD.to_string()));
        assert!(!decision.reason_codes.contains(&TIER_A_LOW_CLARITY.to_string()));
    }

    #[test]
    fn test_unusable_rows_are_ignored() {
        let a = witness("a", 1, CascadeGroup::A);
        let mut ra = row("a", "x", 0.99);
        ra.status = RegionStatus::Unavailable;
        let decision = select(&[Candidate { witness: &a, row: &ra }], "", &CascadeThresholds::default());
        assert_eq!(decision.selected_source, SelectedSource::Baseline);
        assert!(decision.flags.contains(&NO_TEXT_AVAILABLE.to_string()));
    }

    #[test]
    fn test_failed_log_append_keeps_previous_working_text() {
        let store = Store::open_in_memory().unwrap();
        let verse_id: VerseId = "Genesis 1:1".parse().unwrap();
        store
            .upsert_verse(&Verse {
                id: verse_id.clone(),
                baseline_text: "בראשית ברא אלהים".into(),
            })
            .unwrap();
        store.upsert_witness(&witness("a", 1, CascadeGroup::A)).unwrap();
        store
            .upsert_witness_verse(&row("a", "בראשית ברא אלהים", 0.9))
            .unwrap();

        let first = run_cascade(&store, &AcceptingLog, &verse_id, &CascadeThresholds::default()).unwrap();

        store
            .upsert_witness_verse(&row("a", "בראשית ברא", 0.9))
            .unwrap();
        let err = run_cascade(&store, &FailingLog, &verse_id, &CascadeThresholds::default()).unwrap_err();
        assert!(matches!(err, PipelineError::Execution(ref m) if m.contains("disk full")));

        let stored = store.get_working_text(&verse_id).unwrap().unwrap();
        assert_eq!(stored.text_hash, first.text_hash);
        assert_eq!(stored.surface_text, "בראשית ברא אלהים");
    }
}

//! Per-witness confidence scoring.

use tracing::debug;

use crate::core::PipelineError;
use crate::domain::{ConfidenceInputs, VerseId, WitnessVerse, WitnessVerseArtifacts};
use crate::store::Store;

pub const AUTHORITY_WEIGHT: f64 = 0.35;
pub const CLARITY_WEIGHT: f64 = 0.30;
pub const MATCH_WEIGHT: f64 = 0.25;
pub const COMPLETENESS_WEIGHT: f64 = 0.10;

/// Clamp to [0, 1]; NaN becomes 0
pub fn clamp01(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Weighted confidence, always in [0, 1]
pub fn score(inputs: &ConfidenceInputs) -> f64 {
    // Non-finite inputs carry no evidence
    let term = |weight: f64, value: f64| if value.is_finite() { weight * value } else { 0.0 };
    clamp01(
        term(AUTHORITY_WEIGHT, inputs.authority)
            + term(CLARITY_WEIGHT, inputs.clarity)
            + term(MATCH_WEIGHT, inputs.match_score)
            + term(COMPLETENESS_WEIGHT, inputs.completeness),
    )
}

/// Inputs for a stored row given its witness's authority weight
pub fn inputs_for(row: &WitnessVerse, authority: f64) -> ConfidenceInputs {
    ConfidenceInputs {
        authority,
        clarity: row.clarity,
        match_score: row.match_score,
        completeness: row.completeness,
    }
}

/// Recompute confidence for a witness's rows (all of them, or only `verses`).
///
/// Only the confidence and the `confidence_inputs` artifact change; every
/// other artifact key is kept. Returns the verses that were touched.
pub fn recompute_witness(
    store: &Store,
    witness_id: &str,
    verses: Option<&[VerseId]>,
) -> Result<Vec<VerseId>, PipelineError> {
    let witness = store.require_witness(witness_id)?;
    let mut touched = Vec::new();

    for row in store.witness_verses_for_witness(witness_id)? {
        if let Some(filter) = verses {
            if !filter.contains(&row.verse_id) {
                continue;
            }
        }

        let inputs = inputs_for(&row, witness.authority_weight);
        let confidence = score(&inputs);
        store.update_witness_verse_confidence(
            &row.verse_id,
            witness_id,
            confidence,
            WitnessVerseArtifacts {
                confidence_inputs: Some(inputs),
                ..Default::default()
            },
        )?;
        debug!(verse_id = %row.verse_id, witness_id, confidence, "Confidence recomputed");
        touched.push(row.verse_id);
    }

    Ok(touched)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(authority: f64, clarity: f64, match_score: f64, completeness: f64) -> ConfidenceInputs {
        ConfidenceInputs {
            authority,
            clarity,
            match_score,
            completeness,
        }
    }

    #[test]
    fn test_weights_sum_to_one() {
        assert!((score(&inputs(1.0, 1.0, 1.0, 1.0)) - 1.0).abs() < 1e-12);
        assert_eq!(score(&inputs(0.0, 0.0, 0.0, 0.0)), 0.0);
    }

    #[test]
    fn test_weighted_value() {
        let s = score(&inputs(1.0, 0.5, 0.8, 1.0));
        assert!((s - (0.35 + 0.15 + 0.2 + 0.1)).abs() < 1e-12);
    }

    #[test]
    fn test_out_of_range_inputs_are_clamped() {
        assert_eq!(score(&inputs(5.0, 5.0, 5.0, 5.0)), 1.0);
        assert_eq!(score(&inputs(-3.0, -1.0, 0.0, 0.0)), 0.0);
        let s = score(&inputs(f64::NAN, 1.0, f64::INFINITY, 0.0));
        assert!((s - 0.30).abs() < 1e-12);
        assert_eq!(score(&inputs(f64::INFINITY, 0.0, 0.0, f64::NEG_INFINITY)), 0.0);
    }
}

//! Split stage: divide a region's OCR text over its verse range.
//!
//! OCR tokens are allocated to verses in proportion to each verse's baseline
//! token count. Each verse then gets a witness-verse row carrying clarity,
//! match, completeness and the alignment artifacts.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::alignment::{align, letter_count, normalize_text, tokens, Alignment};
use crate::core::PipelineError;
use crate::domain::{
    Region, RegionStatus, SplitInfo, Verse, VerseId, Witness, WitnessVerse, WitnessVerseArtifacts,
};
use crate::store::Store;

use super::confidence;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitPolicy {
    /// Allowed relative deviation between OCR and baseline token counts
    #[serde(default = "default_token_tolerance")]
    pub token_tolerance: f64,
}

fn default_token_tolerance() -> f64 {
    0.25
}

impl Default for SplitPolicy {
    fn default() -> Self {
        Self {
            token_tolerance: default_token_tolerance(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitOutcome {
    Success,
    Partial,
}

/// Result of splitting one region
#[derive(Debug, Clone, PartialEq)]
pub struct RegionSplit {
    pub region_id: String,
    pub outcome: SplitOutcome,
    pub verses: Vec<VerseId>,
    pub deviation: f64,
}

/// Split-stage totals for one witness
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SplitSummary {
    pub success: u64,
    pub partial: u64,
    /// Regions without OCR text or verse tagging
    pub skipped: u64,
    pub touched: Vec<VerseId>,
}

/// Token index ranges `[start, end)` per verse, proportional to `weights`.
///
/// With all-zero weights the tokens are shared evenly.
pub fn allocate(token_count: usize, weights: &[usize]) -> Vec<(usize, usize)> {
    if weights.is_empty() {
        return Vec::new();
    }

    let total: usize = weights.iter().sum();
    let weights: Vec<usize> = if total == 0 {
        vec![1; weights.len()]
    } else {
        weights.to_vec()
    };
    let total = weights.iter().sum::<usize>() as f64;

    let mut ranges = Vec::with_capacity(weights.len());
    let mut cumulative = 0usize;
    let mut start = 0usize;
    for weight in &weights {
        cumulative += weight;
        let end = ((token_count as f64) * (cumulative as f64) / total).round() as usize;
        let end = end.clamp(start, token_count);
        ranges.push((start, end));
        start = end;
    }
    if let Some(last) = ranges.last_mut() {
        last.1 = token_count;
    }
    ranges
}

/// Relative deviation of the OCR token count from the baseline token count
pub fn token_deviation(ocr_tokens: usize, baseline_tokens: usize) -> f64 {
    (ocr_tokens as f64 - baseline_tokens as f64).abs() / baseline_tokens.max(1) as f64
}

/// Letter coverage of `text` against `baseline`, capped at 1
pub fn completeness(text: &str, baseline: &str) -> f64 {
    let have = letter_count(text);
    let want = letter_count(baseline);
    if want == 0 {
        return if have > 0 { 1.0 } else { 0.0 };
    }
    (have as f64 / want as f64).min(1.0)
}

fn alignment_artifacts(alignment: Alignment) -> WitnessVerseArtifacts {
    WitnessVerseArtifacts {
        diff_ops: Some(alignment.token_ops),
        char_stats: Some(alignment.char_stats),
        replace_details: Some(
            alignment
                .replace_details
                .into_iter()
                .map(|(index, detail)| (index.to_string(), detail))
                .collect(),
        ),
        ..Default::default()
    }
}

/// Build a scored witness-verse row for `text` against a verse baseline
pub fn observe(
    witness: &Witness,
    verse: &Verse,
    raw_text: &str,
    clarity: f64,
    status: RegionStatus,
) -> WitnessVerse {
    let normalized = normalize_text(raw_text);
    let alignment = align(&normalized, &verse.baseline_text);

    let (match_score, completeness, status) = if normalized.is_empty() {
        (0.0, 0.0, RegionStatus::Unavailable)
    } else {
        (
            alignment.match_score,
            completeness(&normalized, &verse.baseline_text),
            status,
        )
    };
    let clarity = confidence::clamp01(clarity);

    let mut row = WitnessVerse {
        verse_id: verse.id.clone(),
        witness_id: witness.id.clone(),
        raw_text: raw_text.to_string(),
        normalized_text: normalized,
        clarity,
        match_score,
        completeness,
        confidence: 0.0,
        status,
        artifacts: alignment_artifacts(alignment),
        updated_at: Utc::now(),
    };
    let inputs = confidence::inputs_for(&row, witness.authority_weight);
    row.confidence = confidence::score(&inputs);
    row.artifacts.confidence_inputs = Some(inputs);
    row
}

/// Split one OCR'd region into witness-verse rows
#[instrument(skip(store, region, policy), fields(region_id = %region.id))]
pub fn split_region(
    store: &Store,
    region: &Region,
    policy: &SplitPolicy,
) -> Result<RegionSplit, PipelineError> {
    let range = region.verse_range().ok_or_else(|| {
        PipelineError::Validation(format!("region {} has no verse range", region.id))
    })?;
    let ocr_text = region
        .ocr_text
        .as_deref()
        .ok_or_else(|| PipelineError::Validation(format!("region {} has no OCR text", region.id)))?;

    let witness = store.require_witness(&region.witness_id)?;
    let verses = store.verses_in_range(&range)?;
    if verses.is_empty() {
        return Err(PipelineError::Validation(format!(
            "no verses loaded for range {}",
            range
        )));
    }

    let normalized = normalize_text(ocr_text);
    let ocr_tokens = tokens(&normalized);
    let baseline_counts: Vec<usize> = verses
        .iter()
        .map(|v| tokens(&normalize_text(&v.baseline_text)).len())
        .collect();
    let baseline_total: usize = baseline_counts.iter().sum();

    let ranges = allocate(ocr_tokens.len(), &baseline_counts);
    let deviation = token_deviation(ocr_tokens.len(), baseline_total);
    let every_verse_covered = ranges.iter().all(|(start, end)| end > start);
    let outcome = if every_verse_covered && deviation <= policy.token_tolerance {
        SplitOutcome::Success
    } else {
        SplitOutcome::Partial
    };
    let row_status = match outcome {
        SplitOutcome::Success => RegionStatus::Ok,
        SplitOutcome::Partial => RegionStatus::Partial,
    };
    let clarity = region.ocr_confidence.unwrap_or(0.0);

    let mut touched = Vec::with_capacity(verses.len());
    for ((verse, (start, end)), baseline_tokens) in
        verses.iter().zip(ranges.iter().copied()).zip(baseline_counts.iter().copied())
    {
        let text = ocr_tokens[start..end].join(" ");
        let mut row = observe(&witness, verse, &text, clarity, row_status);
        row.artifacts.split = Some(SplitInfo {
            token_start: start,
            token_end: end,
            region_tokens: ocr_tokens.len(),
            baseline_tokens,
        });
        row.artifacts.source_region_id = Some(region.id.clone());
        store.upsert_witness_verse(&row)?;
        debug!(verse_id = %verse.id, tokens = end - start, "Verse split");
        touched.push(verse.id.clone());
    }

    store.set_region_status(&region.id, row_status)?;
    info!(
        outcome = ?outcome,
        deviation,
        verses = touched.len(),
        "Region split"
    );

    Ok(RegionSplit {
        region_id: region.id.clone(),
        outcome,
        verses: touched,
        deviation,
    })
}

/// Run the split stage for one witness.
///
/// Region-backed witnesses split every OCR'd region; witnesses without
/// regions refresh metrics over their existing rows.
pub fn split_witness(
    store: &Store,
    witness_id: &str,
    policy: &SplitPolicy,
) -> Result<SplitSummary, PipelineError> {
    let witness = store.require_witness(witness_id)?;
    let regions = store.list_regions_for_witness(witness_id)?;
    let mut summary = SplitSummary::default();

    if regions.is_empty() {
        for existing in store.witness_verses_for_witness(witness_id)? {
            let Some(verse) = store.get_verse(&existing.verse_id)? else {
                continue;
            };
            let row = observe(
                &witness,
                &verse,
                &existing.raw_text,
                existing.clarity,
                existing.status,
            );
            store.upsert_witness_verse(&row)?;
            summary.touched.push(verse.id);
        }
        return Ok(summary);
    }

    for region in regions {
        let splittable = region.ocr_text.is_some()
            && region.verse_range().is_some()
            && region.status != RegionStatus::Failed
            && region.status != RegionStatus::Unavailable;
        if !splittable {
            summary.skipped += 1;
            continue;
        }

        let split = split_region(store, &region, policy)?;
        match split.outcome {
            SplitOutcome::Success => summary.success += 1,
            SplitOutcome::Partial => summary.partial += 1,
        }
        for verse in split.verses {
            if !summary.touched.contains(&verse) {
                summary.touched.push(verse);
            }
        }
    }

    Ok(summary)
}

//! Remap engine: re-anchor mis-tagged regions to the verse window their OCR
//! text actually matches.
//!
//! Every window of 1..=max_window consecutive verses in the region's book is
//! scored against the OCR text. A region is only reassigned when the best
//! window is both good enough and clearly ahead of the runner-up; anything
//! else goes to human review with the top candidates kept on the region.

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::alignment::{normalize_text, similarity};
use crate::core::{PatchLog, PipelineError};
use crate::domain::{Region, RegionStatus, RemapCandidate, RemapState, Verse, VerseId, VerseRange};
use crate::store::Store;

use super::cascade::{run_cascade, CascadeThresholds};
use super::confidence;
use super::split::{split_region, SplitPolicy};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemapPolicy {
    #[serde(default = "default_min_score")]
    pub min_score: f64,

    /// Required lead of the best window over the second best
    #[serde(default = "default_min_margin")]
    pub min_margin: f64,

    #[serde(default = "default_max_window")]
    pub max_window: usize,

    /// Candidates kept on the region for review
    #[serde(default = "default_review_candidates")]
    pub review_candidates: usize,
}

fn default_min_score() -> f64 {
    0.78
}

fn default_min_margin() -> f64 {
    0.08
}

fn default_max_window() -> usize {
    4
}

fn default_review_candidates() -> usize {
    3
}

impl Default for RemapPolicy {
    fn default() -> Self {
        Self {
            min_score: default_min_score(),
            min_margin: default_min_margin(),
            max_window: default_max_window(),
            review_candidates: default_review_candidates(),
        }
    }
}

/// What the scores say about a region, before anything is written
#[derive(Debug, Clone, PartialEq)]
pub enum RemapDecision {
    Reassign { best: RemapCandidate, margin: f64 },
    Review { candidates: Vec<RemapCandidate>, margin: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemapOutcome {
    /// Tagging changed and the region was backfilled
    Reassigned,
    /// Best window is the current tagging
    Unchanged,
    ReviewRequired,
    /// No OCR text or no verses to score against
    NoText,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemapReport {
    pub region_id: String,
    pub outcome: RemapOutcome,
    pub previous_range: Option<VerseRange>,
    pub new_range: Option<VerseRange>,
    pub best_score: Option<f64>,
    pub margin: Option<f64>,

    /// Verses whose working text was recomputed
    pub backfilled: Vec<VerseId>,
}

impl RemapReport {
    fn no_text(region: &Region) -> Self {
        Self {
            region_id: region.id.clone(),
            outcome: RemapOutcome::NoText,
            previous_range: region.verse_range(),
            new_range: None,
            best_score: None,
            margin: None,
            backfilled: Vec::new(),
        }
    }
}

/// Score every window of up to `max_window` consecutive verses.
///
/// `verses` must be in canonical order; windows never cross a book. The
/// result is sorted best first.
pub fn score_windows(ocr_text: &str, verses: &[Verse], max_window: usize) -> Vec<RemapCandidate> {
    let text = normalize_text(ocr_text);
    let mut scored = Vec::new();
    if text.is_empty() {
        return scored;
    }

    for start in 0..verses.len() {
        let mut joined = String::new();
        for width in 1..=max_window.max(1) {
            let Some(verse) = verses.get(start + width - 1) else {
                break;
            };
            if verse.id.book != verses[start].id.book {
                break;
            }
            if !joined.is_empty() {
                joined.push(' ');
            }
            joined.push_str(&verse.baseline_text);

            scored.push(RemapCandidate {
                range: VerseRange::new(verses[start].id.clone(), verse.id.clone()),
                score: similarity(&text, &joined),
            });
        }
    }

    sort_candidates(&mut scored);
    scored
}

fn sort_candidates(candidates: &mut [RemapCandidate]) {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.range.start.cmp(&b.range.start))
            .then_with(|| a.range.end.cmp(&b.range.end))
    });
}

/// Apply the score and margin thresholds to candidates sorted best first.
///
/// Returns `None` when there is nothing to decide on.
pub fn decide(candidates: &[RemapCandidate], policy: &RemapPolicy) -> Option<RemapDecision> {
    let best = candidates.first()?;
    let second = candidates.get(1).map(|c| c.score).unwrap_or(0.0);
    let margin = best.score - second;

    if best.score >= policy.min_score && margin >= policy.min_margin {
        Some(RemapDecision::Reassign {
            best: best.clone(),
            margin,
        })
    } else {
        Some(RemapDecision::Review {
            candidates: candidates
                .iter()
                .take(policy.review_candidates)
                .cloned()
                .collect(),
            margin,
        })
    }
}

/// Remaps regions and backfills the verses they touch
#[derive(Clone)]
pub struct Remapper {
    store: Store,
    patch_log: Arc<dyn PatchLog>,
    policy: RemapPolicy,
    split: SplitPolicy,
    cascade: CascadeThresholds,
}

impl Remapper {
    pub fn new(
        store: Store,
        patch_log: Arc<dyn PatchLog>,
        policy: RemapPolicy,
        split: SplitPolicy,
        cascade: CascadeThresholds,
    ) -> Self {
        Self {
            store,
            patch_log,
            policy,
            split,
            cascade,
        }
    }

    pub fn policy(&self) -> &RemapPolicy {
        &self.policy
    }

    /// Verses the region may be re-anchored into
    fn universe(&self, region: &Region) -> Result<Vec<Verse>, PipelineError> {
        match &region.start_verse {
            Some(start) => Ok(self.store.verses_in_book(&start.book)?),
            None => Ok(self.store.list_verses()?),
        }
    }

    #[instrument(skip(self))]
    pub fn remap_region(&self, region_id: &str) -> Result<RemapReport, PipelineError> {
        let region = self.store.require_region(region_id)?;
        let Some(ocr_text) = region.ocr_text.as_deref() else {
            return Ok(RemapReport::no_text(&region));
        };

        let verses = self.universe(&region)?;
        let candidates = score_windows(ocr_text, &verses, self.policy.max_window);
        let Some(decision) = decide(&candidates, &self.policy) else {
            return Ok(RemapReport::no_text(&region));
        };

        let previous_range = region.verse_range();
        match decision {
            RemapDecision::Review { candidates, margin } => {
                let best_score = candidates.first().map(|c| c.score);
                warn!(
                    best_score = ?best_score,
                    margin,
                    "Remap ambiguous, review required"
                );
                let state = RemapState {
                    review_required: true,
                    candidates,
                    previous_range: region.remap.previous_range.clone(),
                    score: best_score,
                    margin: Some(margin),
                    remapped_at: region.remap.remapped_at,
                };
                self.store
                    .set_region_tagging(&region.id, previous_range.as_ref(), &state)?;

                Ok(RemapReport {
                    region_id: region.id.clone(),
                    outcome: RemapOutcome::ReviewRequired,
                    previous_range,
                    new_range: None,
                    best_score,
                    margin: Some(margin),
                    backfilled: Vec::new(),
                })
            }
            RemapDecision::Reassign { best, margin } => {
                if previous_range.as_ref() == Some(&best.range) {
                    let state = RemapState {
                        review_required: false,
                        candidates: Vec::new(),
                        score: Some(best.score),
                        margin: Some(margin),
                        ..region.remap.clone()
                    };
                    self.store
                        .set_region_tagging(&region.id, previous_range.as_ref(), &state)?;
                    return Ok(RemapReport {
                        region_id: region.id.clone(),
                        outcome: RemapOutcome::Unchanged,
                        new_range: previous_range.clone(),
                        previous_range,
                        best_score: Some(best.score),
                        margin: Some(margin),
                        backfilled: Vec::new(),
                    });
                }

                let backfilled = self.reassign(&region, &best, margin)?;
                info!(
                    from = ?previous_range.as_ref().map(|r| r.to_string()),
                    to = %best.range,
                    score = best.score,
                    margin,
                    "Region reassigned"
                );

                Ok(RemapReport {
                    region_id: region.id.clone(),
                    outcome: RemapOutcome::Reassigned,
                    previous_range,
                    new_range: Some(best.range),
                    best_score: Some(best.score),
                    margin: Some(margin),
                    backfilled,
                })
            }
        }
    }

    /// Retag, re-split and recompute every verse on either side of the move
    fn reassign(
        &self,
        region: &Region,
        best: &RemapCandidate,
        margin: f64,
    ) -> Result<Vec<VerseId>, PipelineError> {
        let previous_range = region.verse_range();
        let mut affected: Vec<VerseId> = Vec::new();

        // Rows this region produced under the old tagging no longer hold
        if let Some(old) = &previous_range {
            for verse in self.store.verses_in_range(old)? {
                if let Some(row) = self.store.get_witness_verse(&verse.id, &region.witness_id)? {
                    if row.artifacts.source_region_id.as_deref() == Some(region.id.as_str()) {
                        self.store.set_witness_verse_status(
                            &verse.id,
                            &region.witness_id,
                            RegionStatus::Unavailable,
                        )?;
                    }
                }
                affected.push(verse.id);
            }
        }

        let state = RemapState {
            review_required: false,
            candidates: Vec::new(),
            previous_range,
            score: Some(best.score),
            margin: Some(margin),
            remapped_at: Some(Utc::now()),
        };
        self.store
            .set_region_tagging(&region.id, Some(&best.range), &state)?;

        let retagged = self.store.require_region(&region.id)?;
        let split = split_region(&self.store, &retagged, &self.split)?;
        confidence::recompute_witness(&self.store, &region.witness_id, Some(&split.verses))?;

        for verse in split.verses {
            if !affected.contains(&verse) {
                affected.push(verse);
            }
        }
        affected.sort();

        for verse_id in &affected {
            run_cascade(&self.store, self.patch_log.as_ref(), verse_id, &self.cascade)?;
        }
        Ok(affected)
    }

    /// Remap every OCR'd region of a witness
    pub fn remap_witness(&self, witness_id: &str) -> Result<Vec<RemapReport>, PipelineError> {
        self.store.require_witness(witness_id)?;
        let mut reports = Vec::new();
        for region in self.store.list_regions_for_witness(witness_id)? {
            if region.ocr_text.is_none() {
                continue;
            }
            reports.push(self.remap_region(&region.id)?);
        }
        Ok(reports)
    }
}

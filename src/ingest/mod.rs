//! Manifest ingestion.
//!
//! Loading a manifest is the `ingest` stage of every witness it names:
//!
//! 1. **Baselines**: verses without text are fetched from the baseline source
//! 2. **Plan**: the whole manifest is validated against the store
//! 3. **Apply**: verses, witnesses, pages, regions and texts are upserted
//! 4. **Gate**: each witness runs its `ingest` stage in tier order

pub mod manifest;

use std::collections::HashMap;

use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::adapters::BaselineSource;
use crate::core::{BatchSkip, Orchestrator, PipelineError, StageReport};
use crate::domain::{Stage, VerseId};

pub use manifest::{IngestPlan, Manifest, PageEntry, RegionEntry, TextEntry, VerseEntry, WitnessEntry};

/// What one manifest ingest wrote and which witnesses cleared the gate
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub verses: usize,
    pub witnesses: usize,
    pub pages: usize,
    pub regions: usize,
    pub texts: usize,
    pub baselines_fetched: usize,
    pub stages: Vec<StageReport>,
    pub skipped: Vec<BatchSkip>,
}

/// Validate, write and gate one manifest
#[instrument(skip_all, fields(witnesses = manifest.witnesses.len()))]
pub async fn ingest_manifest(
    orchestrator: &Orchestrator,
    manifest: &Manifest,
    baseline: Option<&dyn BaselineSource>,
    admin_override: bool,
) -> Result<IngestReport, PipelineError> {
    let fetched = fetch_baselines(manifest, baseline).await?;

    let store = orchestrator.store();
    let plan = manifest.plan(store, &fetched)?;
    plan.apply(store)?;
    info!(
        verses = plan.verses.len(),
        regions = plan.regions.len(),
        texts = plan.texts.len(),
        "Manifest written"
    );

    let mut report = IngestReport {
        verses: plan.verses.len(),
        witnesses: plan.witnesses.len(),
        pages: plan.pages.len(),
        regions: plan.regions.len(),
        texts: plan.texts.len(),
        baselines_fetched: fetched.len(),
        ..IngestReport::default()
    };

    for witness_id in plan.witness_order() {
        match orchestrator
            .run_stage(&witness_id, Stage::Ingest, admin_override)
            .await
        {
            Ok(stage) => report.stages.push(stage),
            Err(e) => {
                warn!(witness_id = %witness_id, error = %e, "Ingest stage not completed");
                let blockers = match &e {
                    PipelineError::Blocked { blockers, .. } => blockers.clone(),
                    _ => Vec::new(),
                };
                report.skipped.push(BatchSkip {
                    witness_id,
                    stage: Stage::Ingest,
                    reason: e.to_string(),
                    blockers,
                });
            }
        }
    }

    Ok(report)
}

async fn fetch_baselines(
    manifest: &Manifest,
    baseline: Option<&dyn BaselineSource>,
) -> Result<HashMap<VerseId, String>, PipelineError> {
    let missing = manifest.missing_baselines();
    let mut fetched = HashMap::new();
    let Some(source) = baseline else {
        return Ok(fetched);
    };

    for verse_id in missing {
        let text = source.fetch(&verse_id).await?;
        fetched.insert(verse_id, text);
    }
    if !fetched.is_empty() {
        info!(count = fetched.len(), "Fetched baseline texts");
    }
    Ok(fetched)
}

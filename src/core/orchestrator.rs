//! Main orchestrator for stage execution.
//!
//! Coordinates stage sequencing, priority gating, the worker pool and the
//! batch stop rule. Every stage run goes through the same path: self-blocker
//! check, gate evaluation, execution, then a terminal run-state write.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::adapters::{ImageCropper, OcrExecutor};
use crate::domain::{Blocker, Stage, TaamAlignment, TaamConsensus, VerseId, WorkingVerseText};
use crate::reconcile::{
    confidence, run_cascade, split_witness, CascadeThresholds, RemapPolicy, RemapReport, Remapper,
    SplitPolicy,
};
use crate::store::{EnqueueResult, Store};
use crate::taam::{TaamEngine, TaamPolicy};
use crate::telemetry::ThrottleController;

use super::error::PipelineError;
use super::gate::{GateDecision, PriorityGate};
use super::patch_log::PatchLog;
use super::pool::{PoolReport, WorkerPool, WorkersConfig};
use super::retry::RetryPolicy;
use super::safety::{BatchCounters, StopDecision, StopRule};
use super::workers::{
    OcrJobOutcome, OcrWorker, RemapWorker, TaamAlignWorker, TaamConsensusWorker,
};

/// Tunable policy for every stage
#[derive(Debug, Clone)]
pub struct PipelinePolicies {
    pub cascade: CascadeThresholds,
    pub split: SplitPolicy,
    pub remap: RemapPolicy,
    pub stop_rule: StopRule,
    pub taam: TaamPolicy,
    pub ocr_retry: RetryPolicy,
    pub workers: WorkersConfig,
    pub crop_dir: PathBuf,
}

impl Default for PipelinePolicies {
    fn default() -> Self {
        Self {
            cascade: CascadeThresholds::default(),
            split: SplitPolicy::default(),
            remap: RemapPolicy::default(),
            stop_rule: StopRule::default(),
            taam: TaamPolicy::default(),
            ocr_retry: RetryPolicy::default(),
            workers: WorkersConfig::default(),
            crop_dir: std::env::temp_dir().join("mesorah-crops"),
        }
    }
}

/// Result of one stage run for one witness
#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub witness_id: String,
    pub stage: Stage,
    pub gate: GateDecision,
    pub counters: BatchCounters,
    pub verses_touched: usize,

    /// Set when the stop rule halted the stage
    pub stop: Option<StopDecision>,
}

impl StageReport {
    pub fn stopped(&self) -> bool {
        self.stop.as_ref().is_some_and(|s| s.stop)
    }
}

#[derive(Debug, Default)]
struct StageWork {
    counters: BatchCounters,
    verses_touched: usize,
    stop: Option<StopDecision>,
}

/// A witness the batch could not advance
#[derive(Debug, Clone, Serialize)]
pub struct BatchSkip {
    pub witness_id: String,
    pub stage: Stage,
    pub reason: String,
    pub blockers: Vec<Blocker>,
}

/// Result of a batch run
#[derive(Debug, Clone, Serialize, Default)]
pub struct BatchReport {
    pub stages: Vec<StageReport>,
    pub skipped: Vec<BatchSkip>,
    pub counters: BatchCounters,

    /// Set when the stop rule halted the batch
    pub stop: Option<StopDecision>,
}

impl BatchReport {
    pub fn stopped(&self) -> bool {
        self.stop.as_ref().is_some_and(|s| s.stop)
    }
}

/// Main pipeline orchestrator
pub struct Orchestrator {
    store: Store,
    gate: PriorityGate,
    patch_log: Arc<dyn PatchLog>,
    cropper: Arc<dyn ImageCropper>,
    ocr: Arc<dyn OcrExecutor>,
    pool: WorkerPool,
    policies: PipelinePolicies,
}

impl Orchestrator {
    pub fn new(
        store: Store,
        patch_log: Arc<dyn PatchLog>,
        cropper: Arc<dyn ImageCropper>,
        ocr: Arc<dyn OcrExecutor>,
        throttle: Arc<ThrottleController>,
        policies: PipelinePolicies,
    ) -> Self {
        let pool = WorkerPool::new(policies.workers.clone(), throttle);
        Self {
            gate: PriorityGate::new(store.clone()),
            store,
            patch_log,
            cropper,
            ocr,
            pool,
            policies,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn gate(&self) -> &PriorityGate {
        &self.gate
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn policies(&self) -> &PipelinePolicies {
        &self.policies
    }

    pub fn remapper(&self) -> Remapper {
        Remapper::new(
            self.store.clone(),
            Arc::clone(&self.patch_log),
            self.policies.remap.clone(),
            self.policies.split.clone(),
            self.policies.cascade.clone(),
        )
    }

    pub fn taam_engine(&self) -> TaamEngine {
        TaamEngine::new(self.store.clone(), self.policies.taam.clone())
    }

    fn ocr_worker(&self) -> OcrWorker {
        OcrWorker::new(
            self.store.clone(),
            Arc::clone(&self.cropper),
            Arc::clone(&self.ocr),
            self.policies.ocr_retry.clone(),
            self.policies.crop_dir.clone(),
        )
    }

    /// A witness may not start stage N before its own stage N-1 completed
    fn check_sequence(&self, witness_id: &str, stage: Stage) -> Result<(), PipelineError> {
        let Some(previous) = stage.previous() else {
            return Ok(());
        };
        let run = self.store.get_run_state(witness_id)?;
        let status = run.status(previous);
        if run.is_completed(previous) {
            return Ok(());
        }
        Err(PipelineError::Blocked {
            witness_id: witness_id.to_string(),
            stage,
            blockers: vec![Blocker::sequence(stage, witness_id, previous, status)],
        })
    }

    /// Run one stage for one witness
    #[instrument(skip(self))]
    pub async fn run_stage(
        &self,
        witness_id: &str,
        stage: Stage,
        admin_override: bool,
    ) -> Result<StageReport, PipelineError> {
        self.store.require_witness(witness_id)?;
        self.check_sequence(witness_id, stage)?;

        let gate = self.gate.evaluate(witness_id, stage, admin_override).await?;
        if !gate.allowed {
            return Err(PipelineError::Blocked {
                witness_id: witness_id.to_string(),
                stage,
                blockers: gate.blockers,
            });
        }

        let result = match stage {
            Stage::Ingest => Ok(StageWork::default()),
            Stage::Ocr => self.run_ocr_stage(witness_id).await,
            Stage::Split => self.run_split_stage(witness_id),
            Stage::Confidence => self.run_confidence_stage(witness_id),
        };

        match result {
            Ok(work) => {
                match work.stop.as_ref().filter(|s| s.stop) {
                    Some(stop) => {
                        let message = format!("stop rule: {}", stop.reasons.join("; "));
                        warn!(reasons = ?stop.reasons, "Stage halted by stop rule");
                        self.gate
                            .mark_stage_failed(witness_id, stage, &message)
                            .await?;
                    }
                    None => {
                        self.gate.mark_stage_completed(witness_id, stage).await?;
                        info!(verses = work.verses_touched, "Stage completed");
                    }
                }
                Ok(StageReport {
                    witness_id: witness_id.to_string(),
                    stage,
                    gate,
                    counters: work.counters,
                    verses_touched: work.verses_touched,
                    stop: work.stop,
                })
            }
            Err(e) => {
                error!(error = %e, "Stage failed");
                self.gate
                    .mark_stage_failed(witness_id, stage, &e.to_string())
                    .await?;
                Err(e)
            }
        }
    }

    /// Enqueue OCR for every tagged region of a witness.
    ///
    /// All regions are validated before anything is queued.
    pub fn enqueue_witness(&self, witness_id: &str) -> Result<Vec<EnqueueResult>, PipelineError> {
        self.store.require_witness(witness_id)?;
        let regions = self.store.list_regions_for_witness(witness_id)?;

        if let Some(untagged) = regions.iter().find(|r| r.verse_range().is_none()) {
            return Err(PipelineError::Validation(format!(
                "region {} has no verse range tagging",
                untagged.id
            )));
        }

        let mut results = Vec::new();
        for region in regions.iter().filter(|r| r.ocr_text.is_none()) {
            results.push(self.store.enqueue_region(&region.id)?);
        }
        Ok(results)
    }

    /// Drain queued OCR jobs of any witness, at most `budget` of them
    pub async fn work_ocr(&self, budget: usize) -> Result<PoolReport<OcrJobOutcome>, PipelineError> {
        self.pool.run(Arc::new(self.ocr_worker()), budget).await
    }

    async fn run_ocr_stage(&self, witness_id: &str) -> Result<StageWork, PipelineError> {
        let enqueued = self.enqueue_witness(witness_id)?;
        info!(jobs = enqueued.len(), "OCR jobs enqueued");

        // Other witnesses' queued jobs wait for their own gated stage
        let worker = Arc::new(self.ocr_worker().scoped_to(witness_id));
        let batch_size = self.policies.workers.batch_size.max(1);
        let mut work = StageWork::default();

        loop {
            let report = self.pool.run(Arc::clone(&worker), batch_size).await?;
            if let Some(first) = report.errors.first() {
                return Err(PipelineError::Execution(first.clone()));
            }

            for outcome in &report.outputs {
                if outcome.succeeded() {
                    work.counters.ocr_completed += 1;
                } else {
                    work.counters.ocr_failed += 1;
                }
            }

            let decision = self.policies.stop_rule.evaluate(&work.counters);
            if decision.stop {
                work.stop = Some(decision);
                return Ok(work);
            }
            if report.processed() == 0 {
                work.stop = Some(decision);
                return Ok(work);
            }
        }
    }

    fn run_split_stage(&self, witness_id: &str) -> Result<StageWork, PipelineError> {
        let summary = split_witness(&self.store, witness_id, &self.policies.split)?;
        let counters = BatchCounters {
            split_success: summary.success,
            split_partial: summary.partial,
            ..Default::default()
        };
        Ok(StageWork {
            stop: Some(self.policies.stop_rule.evaluate(&counters)),
            counters,
            verses_touched: summary.touched.len(),
        })
    }

    fn run_confidence_stage(&self, witness_id: &str) -> Result<StageWork, PipelineError> {
        let touched = confidence::recompute_witness(&self.store, witness_id, None)?;
        for verse_id in &touched {
            self.cascade_verse(verse_id)?;
        }
        Ok(StageWork {
            verses_touched: touched.len(),
            ..Default::default()
        })
    }

    /// Recompute and commit the working text of one verse
    pub fn cascade_verse(&self, verse_id: &VerseId) -> Result<WorkingVerseText, PipelineError> {
        run_cascade(
            &self.store,
            self.patch_log.as_ref(),
            verse_id,
            &self.policies.cascade,
        )
    }

    /// Run every witness through every stage in priority order.
    ///
    /// Blocked or failed witnesses are skipped; the stop rule is checked
    /// after every stage on the batch totals.
    #[instrument(skip(self))]
    pub async fn run_batch(&self, admin_override: bool) -> Result<BatchReport, PipelineError> {
        let mut report = BatchReport::default();

        for witness in self.store.list_witnesses()? {
            let run = self.store.get_run_state(&witness.id)?;
            for stage in Stage::ALL {
                if run.is_completed(stage) {
                    continue;
                }

                match self.run_stage(&witness.id, stage, admin_override).await {
                    Ok(stage_report) => {
                        report.counters.absorb(&stage_report.counters);
                        let stage_stop = stage_report.stop.clone().filter(|s| s.stop);
                        report.stages.push(stage_report);

                        let batch_stop = Some(self.policies.stop_rule.evaluate(&report.counters))
                            .filter(|d| d.stop);
                        if let Some(decision) = batch_stop.or(stage_stop) {
                            warn!(reasons = ?decision.reasons, "Batch halted by stop rule");
                            report.stop = Some(decision);
                            return Ok(report);
                        }
                    }
                    Err(PipelineError::Blocked {
                        witness_id,
                        stage,
                        blockers,
                    }) => {
                        info!(witness_id = %witness_id, stage = %stage, "Witness blocked, skipping");
                        report.skipped.push(BatchSkip {
                            witness_id,
                            stage,
                            reason: "blocked".to_string(),
                            blockers,
                        });
                        break;
                    }
                    Err(e) => {
                        report.skipped.push(BatchSkip {
                            witness_id: witness.id.clone(),
                            stage,
                            reason: e.to_string(),
                            blockers: Vec::new(),
                        });
                        break;
                    }
                }
            }
        }

        report.stop = Some(self.policies.stop_rule.evaluate(&report.counters));
        info!(
            stages = report.stages.len(),
            skipped = report.skipped.len(),
            "Batch finished"
        );
        Ok(report)
    }

    /// Remap every OCR'd region of a witness through the pool
    pub async fn remap_witness(&self, witness_id: &str) -> Result<Vec<RemapReport>, PipelineError> {
        self.store.require_witness(witness_id)?;
        let regions: Vec<String> = self
            .store
            .list_regions_for_witness(witness_id)?
            .into_iter()
            .filter(|r| r.ocr_text.is_some())
            .map(|r| r.id)
            .collect();
        let budget = regions.len();
        let worker = Arc::new(RemapWorker::new(self.remapper(), regions));
        let report = self.pool.run(worker, budget).await?;
        if let Some(first) = report.errors.first() {
            return Err(PipelineError::Execution(first.clone()));
        }
        let mut outputs = report.outputs;
        outputs.sort_by(|a, b| a.region_id.cmp(&b.region_id));
        Ok(outputs)
    }

    /// Align taam for `verses` (all verses with a working text when empty)
    pub async fn taam_align(
        &self,
        verses: Vec<VerseId>,
    ) -> Result<PoolReport<Vec<TaamAlignment>>, PipelineError> {
        let engine = self.taam_engine();
        let verses = if verses.is_empty() {
            engine.verses_with_working_text()?
        } else {
            verses
        };
        let budget = verses.len();
        let worker = Arc::new(TaamAlignWorker::new(engine, verses));
        self.pool.run(worker, budget).await
    }

    /// Vote taam consensus for `verses` (all verses with a working text when empty)
    pub async fn taam_consensus(
        &self,
        verses: Vec<VerseId>,
    ) -> Result<PoolReport<TaamConsensus>, PipelineError> {
        let engine = self.taam_engine();
        let verses = if verses.is_empty() {
            engine.verses_with_working_text()?
        } else {
            verses
        };
        let budget = verses.len();
        let worker = Arc::new(TaamConsensusWorker::new(engine, verses));
        self.pool.run(worker, budget).await
    }
}

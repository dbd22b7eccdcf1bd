//! Concrete stage workers run by the pool.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::adapters::{ImageCropper, OcrError, OcrExecutor};
use crate::domain::{JobStatus, OcrJob, RegionStatus, TaamAlignment, TaamConsensus, VerseId};
use crate::reconcile::{RemapReport, Remapper};
use crate::store::Store;
use crate::taam::TaamEngine;

use super::error::PipelineError;
use super::pool::{ClaimQueue, StageKind, StageWorker};
use super::retry::RetryPolicy;

/// Final state of one OCR job
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OcrJobOutcome {
    pub job_id: String,
    pub region_id: String,
    pub status: JobStatus,
    pub error: Option<String>,
}

impl OcrJobOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == JobStatus::Completed
    }
}

/// Crop → OCR → region upsert, claiming from the sqlite job table.
///
/// A worker scoped to a witness only claims jobs for that witness's regions.
pub struct OcrWorker {
    store: Store,
    cropper: Arc<dyn ImageCropper>,
    ocr: Arc<dyn OcrExecutor>,
    retry: RetryPolicy,
    crop_dir: PathBuf,
    witness_id: Option<String>,
}

impl OcrWorker {
    pub fn new(
        store: Store,
        cropper: Arc<dyn ImageCropper>,
        ocr: Arc<dyn OcrExecutor>,
        retry: RetryPolicy,
        crop_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            cropper,
            ocr,
            retry,
            crop_dir: crop_dir.into(),
            witness_id: None,
        }
    }

    pub fn scoped_to(mut self, witness_id: impl Into<String>) -> Self {
        self.witness_id = Some(witness_id.into());
        self
    }

    async fn process(&self, job: &OcrJob) -> Result<(), PipelineError> {
        let region = self.store.require_region(&job.region_id)?;
        let page = self
            .store
            .get_page(&region.page_id)?
            .ok_or_else(|| PipelineError::NotFound {
                kind: "page",
                id: region.page_id.clone(),
            })?;

        let out_dir = self.crop_dir.join(&region.witness_id);
        let crop = match self.cropper.crop(&page.path, &region.bbox, &out_dir).await {
            Ok(crop) => crop,
            Err(e) => {
                if e.is_invalid_box() {
                    self.store.set_region_status(&region.id, RegionStatus::Failed)?;
                }
                return Err(e.into());
            }
        };

        let ocr = self.ocr.as_ref();
        let image = crop.crop_path.as_path();
        let output = self
            .retry
            .run("ocr", OcrError::is_transient, move |_| ocr.run(image))
            .await?;

        let status = if output.text_raw.trim().is_empty() {
            RegionStatus::Unavailable
        } else {
            RegionStatus::Ok
        };
        self.store
            .set_region_ocr(&region.id, &output.text_raw, output.mean_confidence, status)?;

        info!(
            region_id = %region.id,
            engine = %output.engine,
            confidence = output.mean_confidence,
            coverage = output.coverage_estimate,
            chars = output.char_count,
            crop_hash = %crop.content_hash,
            "Region recognized"
        );
        Ok(())
    }
}

#[async_trait]
impl StageWorker for OcrWorker {
    type Item = OcrJob;
    type Output = OcrJobOutcome;

    fn kind(&self) -> StageKind {
        StageKind::Ocr
    }

    async fn recover(&self, stale_after: Duration) -> Result<usize, PipelineError> {
        let requeued = self.store.requeue_stale_jobs(stale_after)?;
        if !requeued.is_empty() {
            warn!(count = requeued.len(), "Requeued stale OCR jobs");
        }
        Ok(requeued.len())
    }

    async fn claim(&self, worker_id: &str) -> Result<Option<OcrJob>, PipelineError> {
        let job = match &self.witness_id {
            Some(witness_id) => self.store.claim_next_job_for_witness(worker_id, witness_id)?,
            None => self.store.claim_next_job(worker_id)?,
        };
        Ok(job)
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, region_id = %job.region_id))]
    async fn execute(&self, worker_id: &str, job: OcrJob) -> Result<OcrJobOutcome, PipelineError> {
        match self.process(&job).await {
            Ok(()) => {
                self.store
                    .update_job_status(&job.id, JobStatus::Completed, None)?;
                Ok(OcrJobOutcome {
                    job_id: job.id,
                    region_id: job.region_id,
                    status: JobStatus::Completed,
                    error: None,
                })
            }
            Err(e) => {
                let message = e.to_string();
                warn!(error = %message, "OCR job failed");
                self.store
                    .update_job_status(&job.id, JobStatus::Failed, Some(&message))?;
                Ok(OcrJobOutcome {
                    job_id: job.id,
                    region_id: job.region_id,
                    status: JobStatus::Failed,
                    error: Some(message),
                })
            }
        }
    }
}

/// Remaps queued region ids
pub struct RemapWorker {
    remapper: Remapper,
    queue: ClaimQueue<String>,
}

impl RemapWorker {
    pub fn new(remapper: Remapper, region_ids: impl IntoIterator<Item = String>) -> Self {
        Self {
            remapper,
            queue: ClaimQueue::new(region_ids),
        }
    }
}

#[async_trait]
impl StageWorker for RemapWorker {
    type Item = String;
    type Output = RemapReport;

    fn kind(&self) -> StageKind {
        StageKind::Remap
    }

    async fn claim(&self, _worker_id: &str) -> Result<Option<String>, PipelineError> {
        self.queue.claim()
    }

    async fn execute(&self, _worker_id: &str, region_id: String) -> Result<RemapReport, PipelineError> {
        self.remapper.remap_region(&region_id)
    }
}

/// Aligns taam for queued verses
pub struct TaamAlignWorker {
    engine: TaamEngine,
    queue: ClaimQueue<VerseId>,
}

impl TaamAlignWorker {
    pub fn new(engine: TaamEngine, verses: impl IntoIterator<Item = VerseId>) -> Self {
        Self {
            engine,
            queue: ClaimQueue::new(verses),
        }
    }
}

#[async_trait]
impl StageWorker for TaamAlignWorker {
    type Item = VerseId;
    type Output = Vec<TaamAlignment>;

    fn kind(&self) -> StageKind {
        StageKind::TaamAlign
    }

    async fn claim(&self, _worker_id: &str) -> Result<Option<VerseId>, PipelineError> {
        self.queue.claim()
    }

    async fn execute(&self, _worker_id: &str, verse_id: VerseId) -> Result<Vec<TaamAlignment>, PipelineError> {
        self.engine.align_verse(&verse_id)
    }
}

/// Votes taam consensus for queued verses
pub struct TaamConsensusWorker {
    engine: TaamEngine,
    queue: ClaimQueue<VerseId>,
}

impl TaamConsensusWorker {
    pub fn new(engine: TaamEngine, verses: impl IntoIterator<Item = VerseId>) -> Self {
        Self {
            engine,
            queue: ClaimQueue::new(verses),
        }
    }
}

#[async_trait]
impl StageWorker for TaamConsensusWorker {
    type Item = VerseId;
    type Output = TaamConsensus;

    fn kind(&self) -> StageKind {
        StageKind::TaamConsensus
    }

    async fn claim(&self, _worker_id: &str) -> Result<Option<VerseId>, PipelineError> {
        self.queue.claim()
    }

    async fn execute(&self, _worker_id: &str, verse_id: VerseId) -> Result<TaamConsensus, PipelineError> {
        self.engine.consensus_verse(&verse_id)
    }
}

//! Stage-parameterised worker pool.
//!
//! Every stage that fans out work (OCR, remap, taam alignment, taam
//! consensus) runs through the same pool: N tokio tasks, each claiming one
//! item, executing it to completion and looping until the queue is drained
//! or the batch budget is spent. N comes from the throttle controller.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument};

use crate::telemetry::{ThrottleController, ThrottleState, WorkerLimits};

use super::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Ocr,
    Remap,
    TaamAlign,
    TaamConsensus,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ocr => "ocr",
            Self::Remap => "remap",
            Self::TaamAlign => "taam_align",
            Self::TaamConsensus => "taam_consensus",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Worker settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkersConfig {
    /// Running OCR jobs older than this are requeued (default: 900)
    #[serde(default = "default_stale_after_seconds")]
    pub stale_after_seconds: u64,

    /// Items claimed per pool run before the stop rule is checked (default: 50)
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default)]
    pub ocr: WorkerLimits,

    #[serde(default)]
    pub remap: WorkerLimits,

    #[serde(default)]
    pub taam_align: WorkerLimits,

    #[serde(default)]
    pub taam_consensus: WorkerLimits,
}

fn default_stale_after_seconds() -> u64 {
    900
}

fn default_batch_size() -> usize {
    50
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            stale_after_seconds: default_stale_after_seconds(),
            batch_size: default_batch_size(),
            ocr: WorkerLimits::default(),
            remap: WorkerLimits::default(),
            taam_align: WorkerLimits::default(),
            taam_consensus: WorkerLimits::default(),
        }
    }
}

impl WorkersConfig {
    pub fn limits(&self, kind: StageKind) -> &WorkerLimits {
        match kind {
            StageKind::Ocr => &self.ocr,
            StageKind::Remap => &self.remap,
            StageKind::TaamAlign => &self.taam_align,
            StageKind::TaamConsensus => &self.taam_consensus,
        }
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_seconds)
    }
}

/// One kind of claimable, executable work
#[async_trait]
pub trait StageWorker: Send + Sync + 'static {
    type Item: Send + 'static;
    type Output: Send + 'static;

    fn kind(&self) -> StageKind;

    /// Crash recovery run once before each pool run
    async fn recover(&self, _stale_after: Duration) -> Result<usize, PipelineError> {
        Ok(0)
    }

    /// Claim the next item; `None` when nothing is left
    async fn claim(&self, worker_id: &str) -> Result<Option<Self::Item>, PipelineError>;

    async fn execute(&self, worker_id: &str, item: Self::Item) -> Result<Self::Output, PipelineError>;
}

/// In-memory claim queue for stages without a persistent job table
#[derive(Debug)]
pub struct ClaimQueue<T> {
    items: Mutex<VecDeque<T>>,
}

impl<T> Default for ClaimQueue<T> {
    fn default() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
        }
    }
}

impl<T> ClaimQueue<T> {
    pub fn new(items: impl IntoIterator<Item = T>) -> Self {
        Self {
            items: Mutex::new(items.into_iter().collect()),
        }
    }

    pub fn push(&self, item: T) -> Result<(), PipelineError> {
        self.guard()?.push_back(item);
        Ok(())
    }

    /// Pop the oldest item; each item is handed to exactly one caller
    pub fn claim(&self) -> Result<Option<T>, PipelineError> {
        Ok(self.guard()?.pop_front())
    }

    pub fn len(&self) -> usize {
        self.items.lock().map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, VecDeque<T>>, PipelineError> {
        self.items
            .lock()
            .map_err(|_| PipelineError::Execution("claim queue lock poisoned".into()))
    }
}

/// Outcome of one pool run
#[derive(Debug, Serialize)]
pub struct PoolReport<O> {
    pub kind: StageKind,
    pub workers: usize,
    pub throttle: ThrottleState,
    pub recovered: usize,
    pub outputs: Vec<O>,

    /// Infrastructure errors from claim/execute, one per failed item
    pub errors: Vec<String>,
}

impl<O> PoolReport<O> {
    /// Number of items claimed in this run
    pub fn processed(&self) -> usize {
        self.outputs.len() + self.errors.len()
    }
}

/// Shared pool settings and throttle
#[derive(Clone)]
pub struct WorkerPool {
    config: WorkersConfig,
    throttle: Arc<ThrottleController>,
}

impl WorkerPool {
    pub fn new(config: WorkersConfig, throttle: Arc<ThrottleController>) -> Self {
        Self { config, throttle }
    }

    pub fn config(&self) -> &WorkersConfig {
        &self.config
    }

    pub fn throttle(&self) -> &ThrottleController {
        &self.throttle
    }

    /// Claim and execute up to `budget` items with a throttled number of tasks
    #[instrument(skip(self, worker), fields(stage = %worker.kind()))]
    pub async fn run<W: StageWorker>(
        &self,
        worker: Arc<W>,
        budget: usize,
    ) -> Result<PoolReport<W::Output>, PipelineError> {
        let kind = worker.kind();
        let recovered = worker.recover(self.config.stale_after()).await?;

        let (throttle, _) = self.throttle.refresh();
        let workers = self.config.limits(kind).for_state(throttle);
        let remaining = Arc::new(AtomicUsize::new(budget));

        let mut tasks = JoinSet::new();
        for index in 0..workers {
            let worker = Arc::clone(&worker);
            let remaining = Arc::clone(&remaining);
            let worker_id = format!("{}-{}", kind, index);
            tasks.spawn(async move { work_loop(worker, worker_id, remaining).await });
        }

        let mut outputs = Vec::new();
        let mut errors = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((done, failed)) => {
                    outputs.extend(done);
                    errors.extend(failed);
                }
                Err(e) => {
                    error!(error = %e, "Worker task panicked");
                    errors.push(format!("worker task failed: {}", e));
                }
            }
        }

        info!(
            workers,
            throttle = %throttle,
            recovered,
            completed = outputs.len(),
            errors = errors.len(),
            "Pool run finished"
        );
        Ok(PoolReport {
            kind,
            workers,
            throttle,
            recovered,
            outputs,
            errors,
        })
    }
}

async fn work_loop<W: StageWorker>(
    worker: Arc<W>,
    worker_id: String,
    remaining: Arc<AtomicUsize>,
) -> (Vec<W::Output>, Vec<String>) {
    let mut outputs = Vec::new();
    let mut errors = Vec::new();

    loop {
        let reserved = remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !reserved {
            break;
        }

        let item = match worker.claim(&worker_id).await {
            Ok(Some(item)) => item,
            Ok(None) => {
                debug!(worker_id = %worker_id, "Queue drained");
                break;
            }
            Err(e) => {
                error!(worker_id = %worker_id, error = %e, "Claim failed");
                errors.push(e.to_string());
                break;
            }
        };

        match worker.execute(&worker_id, item).await {
            Ok(output) => outputs.push(output),
            Err(e) => {
                error!(worker_id = %worker_id, error = %e, "Work item failed");
                errors.push(e.to_string());
            }
        }
    }

    (outputs, errors)
}

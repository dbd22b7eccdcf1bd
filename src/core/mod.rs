//! Core orchestration logic.
//!
//! This module contains:
//! - PriorityGate: strict per-stage authority ordering across witnesses
//! - WorkerPool: one throttled pool for every fan-out stage
//! - StopRule: batch quality circuit breaker
//! - Orchestrator: stage sequencing and batch mode

pub mod error;
pub mod gate;
pub mod orchestrator;
pub mod patch_log;
pub mod pool;
pub mod retry;
pub mod safety;
pub mod workers;

// Re-export commonly used types
pub use error::PipelineError;
pub use gate::{GateDecision, PriorityGate};
pub use orchestrator::{BatchReport, BatchSkip, Orchestrator, PipelinePolicies, StageReport};
pub use patch_log::{JsonlPatchLog, PatchEntry, PatchLog};
pub use pool::{ClaimQueue, PoolReport, StageKind, StageWorker, WorkerPool, WorkersConfig};
pub use retry::RetryPolicy;
pub use safety::{BatchCounters, StopDecision, StopRule};
pub use workers::{OcrJobOutcome, OcrWorker, RemapWorker, TaamAlignWorker, TaamConsensusWorker};

//! Priority Gate: admission control over (witness, stage) pairs.
//!
//! A witness may not start stage S while any witness with a strictly lower
//! priority tier number has not completed S. Denials persist the blocker
//! list on the witness's run state; overrides are allowed but always logged.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, instrument, warn};

use crate::domain::{Blocker, RunState, Stage, StageState, StageStatus};
use crate::store::Store;

use super::error::PipelineError;

/// Result of a gate evaluation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateDecision {
    pub allowed: bool,

    /// Every unfinished higher-priority witness (kept even when overridden)
    pub blockers: Vec<Blocker>,

    pub override_used: bool,
}

type PairLock = Arc<AsyncMutex<()>>;

/// Gate over the shared store. Evaluations for the same (witness, stage)
/// pair are serialized; different pairs run concurrently.
pub struct PriorityGate {
    store: Store,
    locks: Mutex<HashMap<(String, Stage), PairLock>>,
}

impl PriorityGate {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn pair_lock(&self, witness_id: &str, stage: Stage) -> Result<PairLock, PipelineError> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| PipelineError::Execution("gate lock table poisoned".into()))?;
        Ok(locks
            .entry((witness_id.to_string(), stage))
            .or_default()
            .clone())
    }

    /// Decide whether `witness_id` may start `stage`, persisting the result.
    #[instrument(skip(self), fields(witness_id = %witness_id, stage = %stage))]
    pub async fn evaluate(
        &self,
        witness_id: &str,
        stage: Stage,
        admin_override: bool,
    ) -> Result<GateDecision, PipelineError> {
        let lock = self.pair_lock(witness_id, stage)?;
        let _guard = lock.lock().await;

        let witness = self.store.require_witness(witness_id)?;
        let blockers = match witness.priority_tier {
            // Untiered witnesses are unconstrained
            None => Vec::new(),
            Some(tier) => self.collect_blockers(tier, stage)?,
        };

        let mut run = self.store.get_run_state(witness_id)?;
        let decision = if blockers.is_empty() {
            GateDecision {
                allowed: true,
                blockers,
                override_used: false,
            }
        } else if admin_override {
            warn!(
                blockers = ?blockers.iter().map(|b| b.reason_code.as_str()).collect::<Vec<_>>(),
                "Priority gate overridden"
            );
            GateDecision {
                allowed: true,
                blockers,
                override_used: true,
            }
        } else {
            info!(blockers = blockers.len(), "Stage blocked by higher-priority witnesses");
            GateDecision {
                allowed: false,
                blockers,
                override_used: false,
            }
        };

        let state = if decision.allowed {
            StageState {
                status: StageStatus::Running,
                override_used: decision.override_used,
                ..Default::default()
            }
        } else {
            StageState {
                status: StageStatus::Blocked,
                blockers: decision.blockers.clone(),
                ..Default::default()
            }
        };
        run.set_stage(stage, state);
        self.store.upsert_run_state(&run)?;

        Ok(decision)
    }

    fn collect_blockers(&self, tier: u32, stage: Stage) -> Result<Vec<Blocker>, PipelineError> {
        let mut blockers = Vec::new();
        for other in self.store.list_witnesses()? {
            let Some(other_tier) = other.priority_tier else {
                continue;
            };
            if other_tier >= tier {
                continue;
            }
            let status = self.store.get_run_state(&other.id)?.status(stage);
            if status != StageStatus::Completed {
                blockers.push(Blocker::priority(stage, &other.id, other_tier, status));
            }
        }
        Ok(blockers)
    }

    /// Mark a stage completed. Repeating the call is a no-op.
    pub async fn mark_stage_completed(
        &self,
        witness_id: &str,
        stage: Stage,
    ) -> Result<RunState, PipelineError> {
        self.finish(witness_id, stage, StageStatus::Completed, None)
            .await
    }

    /// Mark a stage failed with the causing message. Repeating the call is a no-op.
    pub async fn mark_stage_failed(
        &self,
        witness_id: &str,
        stage: Stage,
        error: &str,
    ) -> Result<RunState, PipelineError> {
        self.finish(witness_id, stage, StageStatus::Failed, Some(error))
            .await
    }

    async fn finish(
        &self,
        witness_id: &str,
        stage: Stage,
        status: StageStatus,
        error: Option<&str>,
    ) -> Result<RunState, PipelineError> {
        let lock = self.pair_lock(witness_id, stage)?;
        let _guard = lock.lock().await;

        self.store.require_witness(witness_id)?;
        let mut run = self.store.get_run_state(witness_id)?;
        let current = run.stage(stage);
        if current.status == status && current.error.as_deref() == error {
            return Ok(run);
        }

        run.set_stage(
            stage,
            StageState {
                status,
                override_used: current.override_used,
                error: error.map(str::to_string),
                ..Default::default()
            },
        );
        self.store.upsert_run_state(&run)?;
        info!(witness_id, stage = %stage, status = %status, "Stage finished");
        Ok(run)
    }
}

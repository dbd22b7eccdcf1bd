//! Per-witness, per-stage run state.
//!
//! A witness advances through the pipeline stages in order. The Priority Gate
//! reads and writes these records; stage owners mark them completed or failed.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Pipeline stages, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Ingest,
    Ocr,
    Split,
    Confidence,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Ingest, Stage::Ocr, Stage::Split, Stage::Confidence];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ingest => "ingest",
            Self::Ocr => "ocr",
            Self::Split => "split",
            Self::Confidence => "confidence",
        }
    }

    /// The stage that must complete before this one may start
    pub fn previous(&self) -> Option<Stage> {
        match self {
            Self::Ingest => None,
            Self::Ocr => Some(Self::Ingest),
            Self::Split => Some(Self::Ocr),
            Self::Confidence => Some(Self::Split),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ingest" => Ok(Self::Ingest),
            "ocr" => Ok(Self::Ocr),
            "split" => Ok(Self::Split),
            "confidence" => Ok(Self::Confidence),
            other => Err(format!("unknown stage '{}'", other)),
        }
    }
}

/// Status of one stage for one witness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Blocked,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "blocked" => Ok(Self::Blocked),
            other => Err(format!("unknown stage status '{}'", other)),
        }
    }
}

/// Why a witness may not start a stage yet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blocker {
    pub stage: Stage,
    pub blocker_witness_id: String,
    pub blocker_priority: Option<u32>,
    pub reason_code: String,
}

impl Blocker {
    /// Blocker raised by a higher-priority witness that has not finished `stage`
    pub fn priority(stage: Stage, witness_id: &str, tier: u32, status: StageStatus) -> Self {
        Self {
            stage,
            blocker_witness_id: witness_id.to_string(),
            blocker_priority: Some(tier),
            reason_code: format!(
                "P{}_{}_{}",
                tier,
                stage.as_str().to_ascii_uppercase(),
                status.as_str().to_ascii_uppercase()
            ),
        }
    }

    /// Blocker raised by the witness's own unfinished previous stage
    pub fn sequence(stage: Stage, witness_id: &str, previous: Stage, status: StageStatus) -> Self {
        Self {
            stage,
            blocker_witness_id: witness_id.to_string(),
            blocker_priority: None,
            reason_code: format!(
                "SELF_{}_{}",
                previous.as_str().to_ascii_uppercase(),
                status.as_str().to_ascii_uppercase()
            ),
        }
    }
}

impl fmt::Display for Blocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (witness {})", self.reason_code, self.blocker_witness_id)
    }
}

/// State of a single stage for a witness
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StageState {
    pub status: StageStatus,

    /// Populated only while `status == Blocked`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blockers: Vec<Blocker>,

    #[serde(default)]
    pub override_used: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub updated_at: Option<DateTime<Utc>>,
}

/// Progress of one witness across all stages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub witness_id: String,
    pub stages: BTreeMap<Stage, StageState>,
    pub updated_at: DateTime<Utc>,
}

impl RunState {
    pub fn new(witness_id: impl Into<String>) -> Self {
        Self {
            witness_id: witness_id.into(),
            stages: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn status(&self, stage: Stage) -> StageStatus {
        self.stages
            .get(&stage)
            .map(|s| s.status)
            .unwrap_or_default()
    }

    pub fn stage(&self, stage: Stage) -> StageState {
        self.stages.get(&stage).cloned().unwrap_or_default()
    }

    /// Replace one stage's state, keeping the blocker invariant
    pub fn set_stage(&mut self, stage: Stage, mut state: StageState) {
        if state.status != StageStatus::Blocked {
            state.blockers.clear();
        }
        let now = Utc::now();
        state.updated_at = Some(now);
        self.updated_at = now;
        self.stages.insert(stage, state);
    }

    pub fn is_completed(&self, stage: Stage) -> bool {
        self.status(stage) == StageStatus::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_code_format() {
        let blocker = Blocker::priority(Stage::Ocr, "aleppo", 1, StageStatus::Running);
        assert_eq!(blocker.reason_code, "P1_OCR_RUNNING");
        assert_eq!(blocker.blocker_priority, Some(1));

        let seq = Blocker::sequence(Stage::Split, "w", Stage::Ocr, StageStatus::Pending);
        assert_eq!(seq.reason_code, "SELF_OCR_PENDING");
    }

    #[test]
    fn test_stage_order() {
        assert_eq!(Stage::Ingest.previous(), None);
        assert_eq!(Stage::Confidence.previous(), Some(Stage::Split));
        assert!(Stage::Ocr < Stage::Split);
    }

    #[test]
    fn test_set_stage_clears_blockers_unless_blocked() {
        let mut run = RunState::new("w2");
        run.set_stage(
            Stage::Ocr,
            StageState {
                status: StageStatus::Blocked,
                blockers: vec![Blocker::priority(Stage::Ocr, "w1", 1, StageStatus::Pending)],
                ..Default::default()
            },
        );
        assert_eq!(run.stage(Stage::Ocr).blockers.len(), 1);

        let mut next = run.stage(Stage::Ocr);
        next.status = StageStatus::Running;
        run.set_stage(Stage::Ocr, next);
        assert!(run.stage(Stage::Ocr).blockers.is_empty());
        assert_eq!(run.status(Stage::Split), StageStatus::Pending);
    }
}

//! Batch stop rule.
//!
//! A quality circuit breaker checked at batch boundaries: when too many OCR
//! jobs fail, or too many regions split only partially, automated work halts
//! with an explained stop condition instead of an error.

use serde::{Deserialize, Serialize};

/// Stop-rule thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopRule {
    /// Halt when failed / (failed + completed) exceeds this (default: 0.15)
    #[serde(default = "default_max_ocr_failure_rate")]
    pub max_ocr_failure_rate: f64,

    /// Halt when partial / (success + partial) exceeds this (default: 0.30)
    #[serde(default = "default_max_split_partial_rate")]
    pub max_split_partial_rate: f64,
}

fn default_max_ocr_failure_rate() -> f64 {
    0.15
}
fn default_max_split_partial_rate() -> f64 {
    0.30
}

impl Default for StopRule {
    fn default() -> Self {
        Self {
            max_ocr_failure_rate: default_max_ocr_failure_rate(),
            max_split_partial_rate: default_max_split_partial_rate(),
        }
    }
}

/// Rolling counts for one batch run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCounters {
    pub ocr_completed: u64,
    pub ocr_failed: u64,
    pub split_success: u64,
    pub split_partial: u64,
}

impl BatchCounters {
    pub fn ocr_failure_rate(&self) -> f64 {
        rate(self.ocr_failed, self.ocr_failed + self.ocr_completed)
    }

    pub fn split_partial_rate(&self) -> f64 {
        rate(self.split_partial, self.split_success + self.split_partial)
    }

    pub fn absorb(&mut self, other: &BatchCounters) {
        self.ocr_completed += other.ocr_completed;
        self.ocr_failed += other.ocr_failed;
        self.split_success += other.split_success;
        self.split_partial += other.split_partial;
    }
}

fn rate(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Outcome of a stop-rule check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopDecision {
    pub stop: bool,
    pub reasons: Vec<String>,
    pub ocr_failure_rate: f64,
    pub split_partial_rate: f64,
}

impl StopRule {
    pub fn evaluate(&self, counters: &BatchCounters) -> StopDecision {
        let ocr_failure_rate = counters.ocr_failure_rate();
        let split_partial_rate = counters.split_partial_rate();
        let mut reasons = Vec::new();

        if ocr_failure_rate > self.max_ocr_failure_rate {
            reasons.push(format!(
                "OCR failure rate {:.2} exceeds {:.2} ({} failed of {})",
                ocr_failure_rate,
                self.max_ocr_failure_rate,
                counters.ocr_failed,
                counters.ocr_failed + counters.ocr_completed
            ));
        }

        if split_partial_rate > self.max_split_partial_rate {
            reasons.push(format!(
                "split partial rate {:.2} exceeds {:.2} ({} partial of {})",
                split_partial_rate,
                self.max_split_partial_rate,
                counters.split_partial,
                counters.split_partial + counters.split_success
            ));
        }

        StopDecision {
            stop: !reasons.is_empty(),
            reasons,
            ocr_failure_rate,
            split_partial_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_rule() {
        let rule = StopRule::default();
        assert_eq!(rule.max_ocr_failure_rate, 0.15);
        assert_eq!(rule.max_split_partial_rate, 0.30);
    }

    #[test]
    fn test_ocr_failure_rate_stops() {
        let counters = BatchCounters {
            ocr_completed: 80,
            ocr_failed: 20,
            ..Default::default()
        };
        let decision = StopRule::default().evaluate(&counters);
        assert!(decision.stop);
        assert!((decision.ocr_failure_rate - 0.20).abs() < 1e-9);
        assert_eq!(decision.reasons.len(), 1);
        assert!(decision.reasons[0].contains("rate"));
    }

    #[test]
    fn test_both_reasons_surface() {
        let counters = BatchCounters {
            ocr_completed: 1,
            ocr_failed: 1,
            split_success: 1,
            split_partial: 1,
        };
        let decision = StopRule::default().evaluate(&counters);
        assert!(decision.stop);
        assert_eq!(decision.reasons.len(), 2);
    }

    #[test]
    fn test_empty_counters_do_not_stop() {
        let decision = StopRule::default().evaluate(&BatchCounters::default());
        assert!(!decision.stop);
        assert_eq!(decision.ocr_failure_rate, 0.0);
    }

    #[test]
    fn test_at_threshold_does_not_stop() {
        let counters = BatchCounters {
            split_success: 7,
            split_partial: 3,
            ..Default::default()
        };
        assert!(!StopRule::default().evaluate(&counters).stop);
    }
}

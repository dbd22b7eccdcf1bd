//! Resource telemetry and worker throttling.
//!
//! Process memory and global CPU are sampled with `sysinfo` and classified
//! into a discrete throttle state that caps worker pool sizes. Throttling is
//! advisory: a failed sample keeps the last known state.

use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleState {
    #[default]
    Normal,
    Reduced,
    Single,
}

impl ThrottleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Reduced => "reduced",
            Self::Single => "single",
        }
    }
}

impl fmt::Display for ThrottleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Memory budget for the process; 0 means total system memory
    #[serde(default)]
    pub memory_budget_bytes: u64,

    #[serde(default = "default_reduced_memory_fraction")]
    pub reduced_memory_fraction: f64,

    #[serde(default = "default_single_memory_fraction")]
    pub single_memory_fraction: f64,

    #[serde(default = "default_reduced_cpu_percent")]
    pub reduced_cpu_percent: f64,

    #[serde(default = "default_single_cpu_percent")]
    pub single_cpu_percent: f64,
}

fn default_reduced_memory_fraction() -> f64 {
    0.70
}

fn default_single_memory_fraction() -> f64 {
    0.90
}

fn default_reduced_cpu_percent() -> f64 {
    85.0
}

fn default_single_cpu_percent() -> f64 {
    97.0
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            memory_budget_bytes: 0,
            reduced_memory_fraction: default_reduced_memory_fraction(),
            single_memory_fraction: default_single_memory_fraction(),
            reduced_cpu_percent: default_reduced_cpu_percent(),
            single_cpu_percent: default_single_cpu_percent(),
        }
    }
}

/// One reading of process and host load
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResourceSample {
    pub rss_bytes: u64,
    pub memory_budget_bytes: u64,
    pub cpu_percent: f64,
}

impl ResourceSample {
    pub fn memory_fraction(&self) -> f64 {
        if self.memory_budget_bytes == 0 {
            return 0.0;
        }
        self.rss_bytes as f64 / self.memory_budget_bytes as f64
    }
}

/// Map a sample to a throttle state. Non-finite readings count as idle.
pub fn classify(sample: &ResourceSample, config: &TelemetryConfig) -> ThrottleState {
    let finite = |v: f64| if v.is_finite() { v } else { 0.0 };
    let memory = finite(sample.memory_fraction());
    let cpu = finite(sample.cpu_percent);

    if memory >= config.single_memory_fraction || cpu >= config.single_cpu_percent {
        ThrottleState::Single
    } else if memory >= config.reduced_memory_fraction || cpu >= config.reduced_cpu_percent {
        ThrottleState::Reduced
    } else {
        ThrottleState::Normal
    }
}

/// Source of resource samples
pub trait ResourceSampler: Send {
    /// `None` when the reading could not be taken
    fn sample(&mut self) -> Option<ResourceSample>;
}

/// `sysinfo`-backed sampler for the current process
pub struct HostSampler {
    system: System,
    memory_budget_bytes: u64,
}

impl fmt::Debug for HostSampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostSampler")
            .field("memory_budget_bytes", &self.memory_budget_bytes)
            .finish_non_exhaustive()
    }
}

impl HostSampler {
    pub fn new(memory_budget_bytes: u64) -> Self {
        let mut system = System::new();
        system.refresh_cpu_all();
        system.refresh_memory();
        let memory_budget_bytes = if memory_budget_bytes == 0 {
            system.total_memory()
        } else {
            memory_budget_bytes
        };
        Self {
            system,
            memory_budget_bytes,
        }
    }
}

impl ResourceSampler for HostSampler {
    fn sample(&mut self) -> Option<ResourceSample> {
        self.system.refresh_cpu_all();
        self.system.refresh_memory();

        let pid = sysinfo::get_current_pid().ok()?;
        self.system
            .refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
        let rss_bytes = self.system.process(pid).map(sysinfo::Process::memory)?;

        Some(ResourceSample {
            rss_bytes,
            memory_budget_bytes: self.memory_budget_bytes,
            cpu_percent: f64::from(self.system.global_cpu_usage()),
        })
    }
}

/// Per-state worker caps for one stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerLimits {
    #[serde(default = "default_workers")]
    pub normal: usize,

    #[serde(default = "default_workers")]
    pub reduced: usize,

    #[serde(default = "default_single_workers")]
    pub single: usize,
}

fn default_workers() -> usize {
    2
}

fn default_single_workers() -> usize {
    1
}

impl Default for WorkerLimits {
    fn default() -> Self {
        Self {
            normal: default_workers(),
            reduced: default_workers(),
            single: default_single_workers(),
        }
    }
}

impl WorkerLimits {
    /// Cap for `state`, never below one worker
    pub fn for_state(&self, state: ThrottleState) -> usize {
        let cap = match state {
            ThrottleState::Normal => self.normal,
            ThrottleState::Reduced => self.reduced,
            ThrottleState::Single => self.single,
        };
        cap.max(1)
    }
}

/// Shared throttle controller
pub struct ThrottleController {
    config: TelemetryConfig,
    sampler: Mutex<Box<dyn ResourceSampler>>,
    state: Mutex<ThrottleState>,
}

impl ThrottleController {
    pub fn new(config: TelemetryConfig, sampler: Box<dyn ResourceSampler>) -> Self {
        Self {
            config,
            sampler: Mutex::new(sampler),
            state: Mutex::new(ThrottleState::Normal),
        }
    }

    /// Controller over the current process
    pub fn host(config: TelemetryConfig) -> Self {
        let sampler = HostSampler::new(config.memory_budget_bytes);
        Self::new(config, Box::new(sampler))
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }

    /// Last classified state
    pub fn current(&self) -> ThrottleState {
        self.state.lock().map(|s| *s).unwrap_or_default()
    }

    /// Take a fresh sample and reclassify; a failed sample keeps the last state
    pub fn refresh(&self) -> (ThrottleState, Option<ResourceSample>) {
        let sample = match self.sampler.lock() {
            Ok(mut sampler) => sampler.sample(),
            Err(_) => None,
        };

        let Ok(mut state) = self.state.lock() else {
            return (ThrottleState::Normal, sample);
        };
        let previous = *state;
        match sample {
            Some(reading) => {
                let next = classify(&reading, &self.config);
                if next != previous {
                    info!(from = %previous, to = %next, "Throttle state changed");
                }
                *state = next;
                debug!(
                    rss_bytes = reading.rss_bytes,
                    cpu_percent = reading.cpu_percent,
                    state = %next,
                    "Resource sample"
                );
            }
            None => warn!(state = %previous, "Resource sample failed, keeping last throttle state"),
        }
        (*state, sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct Scripted(VecDeque<Option<ResourceSample>>);

    impl ResourceSampler for Scripted {
        fn sample(&mut self) -> Option<ResourceSample> {
            self.0.pop_front().flatten()
        }
    }

    fn reading(rss: u64, cpu: f64) -> ResourceSample {
        ResourceSample {
            rss_bytes: rss,
            memory_budget_bytes: 100,
            cpu_percent: cpu,
        }
    }

    #[test]
    fn test_classify_thresholds() {
        let config = TelemetryConfig::default();
        assert_eq!(classify(&reading(10, 5.0), &config), ThrottleState::Normal);
        assert_eq!(classify(&reading(70, 5.0), &config), ThrottleState::Reduced);
        assert_eq!(classify(&reading(10, 90.0), &config), ThrottleState::Reduced);
        assert_eq!(classify(&reading(95, 5.0), &config), ThrottleState::Single);
        assert_eq!(classify(&reading(10, 99.0), &config), ThrottleState::Single);
        assert_eq!(classify(&reading(10, f64::NAN), &config), ThrottleState::Normal);
    }

    #[test]
    fn test_failed_sample_keeps_last_state() {
        let controller = ThrottleController::new(
            TelemetryConfig::default(),
            Box::new(Scripted(VecDeque::from(vec![Some(reading(95, 0.0)), None]))),
        );
        assert_eq!(controller.refresh().0, ThrottleState::Single);
        let (state, sample) = controller.refresh();
        assert_eq!(state, ThrottleState::Single);
        assert!(sample.is_none());
        assert_eq!(controller.current(), ThrottleState::Single);
    }

    #[test]
    fn test_worker_limits_never_zero() {
        let limits = WorkerLimits::default();
        assert_eq!(limits.for_state(ThrottleState::Normal), 2);
        assert_eq!(limits.for_state(ThrottleState::Reduced), 2);
        assert_eq!(limits.for_state(ThrottleState::Single), 1);
        let zero = WorkerLimits {
            normal: 0,
            reduced: 0,
            single: 0,
        };
        assert_eq!(zero.for_state(ThrottleState::Single), 1);
    }
}

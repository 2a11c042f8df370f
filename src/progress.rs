//! Run progress and time-remaining estimates.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Point-in-time view of run progress.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// Steps finished so far
    pub completed_steps: usize,
    /// Steps in the plan
    pub total_steps: usize,
    /// Completion in percent, `0.0..=100.0`
    pub percentage: f64,
    /// Time since the run started
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
    /// Estimated time remaining; `None` until the first step completes
    #[serde(with = "humantime_serde")]
    pub eta: Option<Duration>,
}

impl Default for ProgressSnapshot {
    fn default() -> Self {
        Self {
            completed_steps: 0,
            total_steps: 0,
            percentage: 0.0,
            elapsed: Duration::ZERO,
            eta: None,
        }
    }
}

/// Derives percentage and ETA from step completions.
///
/// Uses the tokio clock so estimates follow virtual time in tests.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    total_steps: usize,
    completed_steps: usize,
    started: Instant,
}

impl ProgressTracker {
    /// Start tracking a run of `total_steps`, starting now.
    pub fn new(total_steps: usize) -> Self {
        Self::starting_at(total_steps, Instant::now())
    }

    /// Start tracking with an explicit start instant.
    pub fn starting_at(total_steps: usize, started: Instant) -> Self {
        Self {
            total_steps,
            completed_steps: 0,
            started,
        }
    }

    /// Record one finished step. Never exceeds the total.
    pub fn step_completed(&mut self) {
        self.completed_steps = (self.completed_steps + 1).min(self.total_steps);
    }

    /// Steps finished so far.
    pub fn completed_steps(&self) -> usize {
        self.completed_steps
    }

    /// Steps in the plan.
    pub fn total_steps(&self) -> usize {
        self.total_steps
    }

    /// Completion in percent.
    pub fn percentage(&self) -> f64 {
        if self.total_steps == 0 {
            return 0.0;
        }
        self.completed_steps as f64 * 100.0 / self.total_steps as f64
    }

    /// Time since the run started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// `elapsed * remaining / completed`.
    ///
    /// Indeterminate before the first step, and when the estimate does not
    /// fit in a `Duration`.
    pub fn eta(&self) -> Option<Duration> {
        if self.completed_steps == 0 {
            return None;
        }
        let remaining = (self.total_steps - self.completed_steps) as f64;
        let ratio = remaining / self.completed_steps as f64;
        Duration::try_from_secs_f64(self.elapsed().as_secs_f64() * ratio).ok()
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            completed_steps: self.completed_steps,
            total_steps: self.total_steps,
            percentage: self.percentage(),
            elapsed: self.elapsed(),
            eta: self.eta(),
        }
    }
}

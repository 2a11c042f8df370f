//! Fault classification and recording.
//!
//! Every error raised while a run is executing passes through [`FaultHandler`],
//! which assigns it a [`FaultKind`], stamps it with the plan step and the axis or
//! device it came from, and decides from the configured policy whether the run
//! continues.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::error::ScanError;

/// Broad category of a runtime fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// A target or speed outside the axis envelope
    Bounds,
    /// A command reached an axis in the wrong power state
    PowerState,
    /// The motor controller reported a failure or did not acknowledge
    HardwareCommunication,
    /// A bounded wait expired
    Timeout,
    /// The capture device reported a failure
    CaptureDevice,
}

impl FaultKind {
    /// Classify an error, or `None` for errors that are not runtime faults
    /// (plan validation, ownership, lifecycle misuse).
    pub fn classify(err: &ScanError) -> Option<Self> {
        match err {
            ScanError::OutOfBounds { .. } | ScanError::InvalidSpeed { .. } => Some(Self::Bounds),
            ScanError::NotEnergized { .. } => Some(Self::PowerState),
            ScanError::HardwareFault { .. } | ScanError::Unsupported { .. } => {
                Some(Self::HardwareCommunication)
            }
            ScanError::SettleTimeout { .. } | ScanError::CaptureTimeout { .. } => {
                Some(Self::Timeout)
            }
            ScanError::CaptureDevice { .. } => Some(Self::CaptureDevice),
            ScanError::AxisBusy { .. }
            | ScanError::InvalidPlan(_)
            | ScanError::InvalidState { .. }
            | ScanError::Configuration(_) => None,
        }
    }
}

/// Where a fault came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "name", rename_all = "snake_case")]
pub enum FaultSource {
    /// A motor axis, by name
    Axis(String),
    /// The capture device, by name
    Device(String),
}

impl std::fmt::Display for FaultSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FaultSource::Axis(name) => write!(f, "axis '{name}'"),
            FaultSource::Device(name) => write!(f, "device '{name}'"),
        }
    }
}

/// One classified fault, kept in the run for post-run diagnosis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultRecord {
    /// Plan step the fault occurred in
    pub step_index: usize,
    /// Axis or device that raised it
    pub source: FaultSource,
    /// Classification
    pub kind: FaultKind,
    /// Human-readable description
    pub message: String,
    /// When the fault was recorded
    pub timestamp: DateTime<Utc>,
}

/// Run reaction to a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultAction {
    /// Stop the run and fail it
    Abort,
    /// Record the fault and move on to the next step
    Continue,
}

/// Which policy applies to a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOrigin {
    /// Raised by a move or settle wait
    Motion,
    /// Raised by a capture request
    Capture,
}

/// Classifies errors and applies the run's fault policies.
#[derive(Debug, Clone)]
pub struct FaultHandler {
    motion_policy: FaultAction,
    capture_policy: FaultAction,
}

impl FaultHandler {
    /// Create a handler with the given motion and capture policies.
    pub fn new(motion_policy: FaultAction, capture_policy: FaultAction) -> Self {
        Self {
            motion_policy,
            capture_policy,
        }
    }

    /// Classify `err` raised at `step_index` and decide how the run reacts.
    pub fn handle(
        &self,
        err: &ScanError,
        step_index: usize,
        origin: FaultOrigin,
    ) -> (FaultRecord, FaultAction) {
        let kind = FaultKind::classify(err).unwrap_or(match origin {
            FaultOrigin::Motion => FaultKind::HardwareCommunication,
            FaultOrigin::Capture => FaultKind::CaptureDevice,
        });
        let name = err.origin().unwrap_or("unknown").to_string();
        let source = match origin {
            FaultOrigin::Motion => FaultSource::Axis(name),
            FaultOrigin::Capture => FaultSource::Device(name),
        };
        let action = match origin {
            FaultOrigin::Motion => self.motion_policy,
            FaultOrigin::Capture => self.capture_policy,
        };

        match action {
            FaultAction::Abort => error!(step = step_index, %source, ?kind, "{err}"),
            FaultAction::Continue => warn!(step = step_index, %source, ?kind, "{err}"),
        }

        let record = FaultRecord {
            step_index,
            source,
            kind,
            message: err.to_string(),
            timestamp: Utc::now(),
        };
        (record, action)
    }
}

impl Default for FaultHandler {
    fn default() -> Self {
        Self::new(FaultAction::Abort, FaultAction::Continue)
    }
}

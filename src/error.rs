//! Custom error types for the scan engine.
//!
//! This module defines the primary error type, `ScanError`, shared by every layer of
//! the crate. Using the `thiserror` crate, it provides a centralized and consistent
//! way to report problems, from rejected motion commands to capture device failures.
//!
//! ## Error Hierarchy
//!
//! `ScanError` is an enum that consolidates the following sources:
//!
//! - **Validation**: `OutOfBounds`, `InvalidSpeed`, `InvalidPlan`. These are surfaced
//!   synchronously to the caller and never partially apply.
//! - **Power state**: `NotEnergized` when a motion command reaches an unpowered axis.
//! - **Hardware**: `HardwareFault` wraps any failure reported by a motor controller
//!   driver, including energize acknowledgment timeouts.
//! - **Timing**: `SettleTimeout` and `CaptureTimeout` for bounded waits that expired.
//! - **Capture**: `CaptureDevice` for failures reported by the camera driver.
//! - **Ownership and lifecycle**: `AxisBusy`, `InvalidState`, `Unsupported`.
//!
//! Driver implementations return `anyhow::Result`; the axis and capture layers
//! convert those into the variants above so that callers can match on them and
//! the fault handler can classify them.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Convenience alias for results using the crate error type.
pub type ScanResult<T> = std::result::Result<T, ScanError>;

/// Errors raised by axes, plans, capture sessions and the orchestrator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScanError {
    /// A move target lies outside the axis bounds
    #[error("Axis '{axis}': position {position} outside bounds [{min}, {max}]")]
    OutOfBounds {
        /// Axis name
        axis: String,
        /// Rejected target
        position: i32,
        /// Lower bound
        min: i32,
        /// Upper bound
        max: i32,
    },

    /// A motion command reached a deenergized axis
    #[error("Axis '{axis}' is not energized")]
    NotEnergized {
        /// Axis name
        axis: String,
    },

    /// The motor controller failed or did not acknowledge
    #[error("Hardware fault on '{axis}': {message}")]
    HardwareFault {
        /// Axis name
        axis: String,
        /// Driver message
        message: String,
    },

    /// Motion was still in progress when the settle wait expired
    #[error("Axis '{axis}' did not settle within {timeout:?}")]
    SettleTimeout {
        /// Axis name
        axis: String,
        /// Wait limit
        timeout: Duration,
    },

    /// Another run owns the axis
    #[error("Axis '{axis}' is owned by run {owner}")]
    AxisBusy {
        /// Axis name
        axis: String,
        /// Owning run
        owner: Uuid,
    },

    /// Plan validation failed
    #[error("Invalid scan plan: {}", PlanViolations(.0))]
    InvalidPlan(Vec<PlanViolation>),

    /// The capture device reported a failure
    #[error("Capture device '{device}' error: {message}")]
    CaptureDevice {
        /// Device name
        device: String,
        /// Driver message
        message: String,
    },

    /// The capture device did not answer in time
    #[error("Capture device '{device}' did not respond within {timeout:?}")]
    CaptureTimeout {
        /// Device name
        device: String,
        /// Wait limit
        timeout: Duration,
    },

    /// The axis lacks the requested capability
    #[error("Axis '{axis}' does not support {operation}")]
    Unsupported {
        /// Axis name
        axis: String,
        /// Requested operation
        operation: String,
    },

    /// Speed is zero or above the axis maximum
    #[error("Axis '{axis}': invalid speed {speed} (max {max_speed})")]
    InvalidSpeed {
        /// Axis name
        axis: String,
        /// Rejected speed (steps/s)
        speed: u32,
        /// Configured maximum
        max_speed: u32,
    },

    /// The operation is not legal in the current run status
    #[error("Cannot {operation} while run is {status}")]
    InvalidState {
        /// Rejected operation
        operation: String,
        /// Status at the time
        status: String,
    },

    /// Configuration or plan input could not be used
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl ScanError {
    /// Name of the axis or device this error originated from, if any.
    pub fn origin(&self) -> Option<&str> {
        match self {
            ScanError::OutOfBounds { axis, .. }
            | ScanError::NotEnergized { axis }
            | ScanError::HardwareFault { axis, .. }
            | ScanError::SettleTimeout { axis, .. }
            | ScanError::AxisBusy { axis, .. }
            | ScanError::Unsupported { axis, .. }
            | ScanError::InvalidSpeed { axis, .. } => Some(axis),
            ScanError::CaptureDevice { device, .. } | ScanError::CaptureTimeout { device, .. } => {
                Some(device)
            }
            ScanError::InvalidPlan(_)
            | ScanError::InvalidState { .. }
            | ScanError::Configuration(_) => None,
        }
    }
}

/// A single problem found while validating a [`crate::plan::ScanPlan`].
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlanViolation {
    /// No sweeps
    #[error("plan contains no axes")]
    Empty,

    /// Sweep names an unregistered axis
    #[error("unknown axis '{axis}'")]
    UnknownAxis {
        /// Axis name
        axis: String,
    },

    /// Two sweeps name the same axis
    #[error("axis '{axis}' appears more than once")]
    DuplicateAxis {
        /// Axis name
        axis: String,
    },

    /// Sweep yields no positions
    #[error("axis '{axis}' has no positions")]
    NoPositions {
        /// Axis name
        axis: String,
    },

    /// Stepped rule with a zero step
    #[error("axis '{axis}': step must be non-zero")]
    ZeroStep {
        /// Axis name
        axis: String,
    },

    /// A target lies outside the axis bounds
    #[error("axis '{axis}': target {position} outside bounds [{min}, {max}]")]
    OutOfBounds {
        /// Axis name
        axis: String,
        /// Offending target
        position: i32,
        /// Lower bound
        min: i32,
        /// Upper bound
        max: i32,
    },
}

struct PlanViolations<'a>(&'a [PlanViolation]);

impl fmt::Display for PlanViolations<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, violation) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{violation}")?;
        }
        Ok(())
    }
}

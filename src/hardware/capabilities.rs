//! Capability traits for scan hardware.
//!
//! The scan engine depends only on these two narrow interfaces. Concrete driver
//! bindings (USB stepper controllers, tethered cameras) implement them outside the
//! core; [`crate::hardware::mock`] provides simulated implementations.
//!
//! Drivers report failures as `anyhow::Error`. The axis and capture layers turn
//! those into [`crate::error::ScanError`] values, so drivers never need to know
//! about the engine's error taxonomy.

use anyhow::Result;
use async_trait::async_trait;
use std::fmt;

/// One physical stepper axis as seen through its motor controller.
///
/// Positions are absolute microstep counts; speeds are microsteps per second.
///
/// # Contract
///
/// - `move_to` starts motion and returns without waiting for it to finish.
/// - `is_moving` reports whether the last commanded motion is still in progress.
/// - `deenergize` removes holding current and cancels any in-flight motion.
/// - `zero` halts and redefines the current physical position as `position`.
#[async_trait]
pub trait MotorController: Send + Sync {
    /// Apply holding current.
    async fn energize(&self) -> Result<()>;

    /// Remove holding current, cancelling any motion.
    async fn deenergize(&self) -> Result<()>;

    /// Begin moving to an absolute position.
    async fn move_to(&self, position: i32, speed: u32) -> Result<()>;

    /// Current position reported by the controller.
    async fn read_position(&self) -> Result<i32>;

    /// Whether commanded motion is still in progress.
    async fn is_moving(&self) -> Result<bool>;

    /// Halt and declare the current physical position to be `position`.
    async fn zero(&self, position: i32) -> Result<()>;

    /// Set the holding current limit (in milliamps) used on the next energize.
    ///
    /// Controllers without adjustable current keep the default no-op.
    async fn set_current_limit(&self, _milliamps: u32) -> Result<()> {
        Ok(())
    }
}

/// Opaque reference to a capture result (e.g. an image file path).
///
/// The engine never interprets the contents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Artifact(pub String);

impl Artifact {
    /// Wrap a handle string.
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    /// The underlying handle.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A camera that produces one artifact per capture request.
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    /// Take one capture and return a handle to the result.
    async fn capture(&self) -> Result<Artifact>;
}

//! Hardware capability interfaces and simulated devices.

pub mod capabilities;
pub mod mock;

pub use capabilities::{Artifact, CaptureDevice, MotorController};

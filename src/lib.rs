//! Core library for the scant photogrammetry scanner.
//!
//! scant drives independent stepper-motor axes (tilt, yaw, forward travel)
//! through a grid of positions and triggers a camera capture at every stop.
//!
//! # Layers
//!
//! - [`hardware`]: the two capability traits the engine depends on
//!   ([`hardware::MotorController`], [`hardware::CaptureDevice`]) plus mocks
//! - [`axis`]: per-axis state machine and safety envelope
//! - [`registry`]: connected axes and run-scoped ownership
//! - [`plan`]: declarative scan plans and their step iterator
//! - [`capture`]: one-at-a-time capture sessions
//! - [`orchestrator`]: the run/pause/abort state machine
//! - [`progress`], [`fault`], [`events`]: what observers see
//!
//! # Example
//!
//! ```rust,ignore
//! let registry = Arc::new(AxisRegistry::from_config(&config.axes, factory).await?);
//! let camera = Arc::new(CaptureStation::new("camera", device, config.orchestrator.capture_timeout));
//! let orchestrator = ScanOrchestrator::new(registry, camera, config.orchestrator.clone());
//!
//! let mut events = orchestrator.subscribe();
//! orchestrator.start(ScanPlan::load_from("plan.toml")?).await?;
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! ```

pub mod axis;
pub mod capture;
pub mod config;
pub mod error;
pub mod events;
pub mod fault;
pub mod hardware;
pub mod logging;
pub mod orchestrator;
pub mod plan;
pub mod progress;
pub mod registry;

pub use axis::{AxisState, MotorAxis, PowerState};
pub use capture::{CaptureRecord, CaptureSession, CaptureStation};
pub use config::{AxisDefinition, OrchestratorConfig, ScanConfig};
pub use error::{PlanViolation, ScanError, ScanResult};
pub use events::ScanEvent;
pub use fault::{FaultAction, FaultKind, FaultRecord, FaultSource};
pub use orchestrator::{RunStatus, ScanOrchestrator, ScanRun};
pub use plan::{PlanStep, PositionRule, ScanPlan};
pub use progress::ProgressSnapshot;
pub use registry::{AxisLease, AxisRegistry};

//! Motor axis state machine and safety envelope.
//!
//! A [`MotorAxis`] wraps one [`MotorController`] and enforces the invariants the
//! rest of the engine relies on:
//!
//! - a move is only issued to an energized axis, towards a target inside
//!   `[min_position, max_position]`;
//! - `is_moving` is only ever true while the axis is energized;
//! - a rejected command issues nothing to the controller and mutates nothing.
//!
//! Axis state is published through a `tokio::sync::watch` channel so that any
//! number of observers (front ends, loggers) can follow positions without
//! touching the controller.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::AxisDefinition;
use crate::error::{ScanError, ScanResult};
use crate::hardware::MotorController;

/// Holding-current state of an axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    /// No holding current; the motor can be turned by hand and cannot move
    Deenergized,
    /// Holding current applied
    Energized,
}

/// Snapshot of an axis' mutable state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisState {
    /// Holding-current state
    pub power: PowerState,
    /// Last position reported by the controller
    pub current_position: i32,
    /// Target of the most recent accepted move
    pub target_position: i32,
    /// Whether a commanded move is in progress
    pub is_moving: bool,
}

/// One physical stepper axis.
pub struct MotorAxis {
    definition: AxisDefinition,
    controller: Arc<dyn MotorController>,
    state: watch::Sender<AxisState>,
    owner: Mutex<Option<Uuid>>,
}

impl std::fmt::Debug for MotorAxis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MotorAxis")
            .field("name", &self.definition.name)
            .field("state", &*self.state.borrow())
            .field("owner", &*self.owner.lock())
            .finish()
    }
}

impl MotorAxis {
    /// Connect an axis to its controller, reading the initial position.
    ///
    /// The axis starts deenergized. A controller that reports a position
    /// outside the configured bounds is treated as a hardware fault.
    ///
    /// # Errors
    /// - `HardwareFault` if the position cannot be read or is out of bounds
    pub async fn connect(
        definition: AxisDefinition,
        controller: Arc<dyn MotorController>,
    ) -> ScanResult<Self> {
        let position = controller
            .read_position()
            .await
            .map_err(|e| hardware_fault(&definition.name, e))?;

        if !(definition.min_position..=definition.max_position).contains(&position) {
            return Err(ScanError::HardwareFault {
                axis: definition.name.clone(),
                message: format!(
                    "controller reports position {} outside bounds [{}, {}]",
                    position, definition.min_position, definition.max_position
                ),
            });
        }

        let (state, _) = watch::channel(AxisState {
            power: PowerState::Deenergized,
            current_position: position,
            target_position: position,
            is_moving: false,
        });

        debug!(axis = %definition.name, position, "Axis connected");
        Ok(Self {
            definition,
            controller,
            state,
            owner: Mutex::new(None),
        })
    }

    /// Unique axis name.
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    /// Configuration this axis was created from.
    pub fn definition(&self) -> &AxisDefinition {
        &self.definition
    }

    /// Whether `position` lies within the axis bounds.
    pub fn contains(&self, position: i32) -> bool {
        (self.definition.min_position..=self.definition.max_position).contains(&position)
    }

    /// Current state snapshot.
    pub fn state(&self) -> AxisState {
        *self.state.borrow()
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<AxisState> {
        self.state.subscribe()
    }

    /// Whether holding current is applied.
    pub fn is_energized(&self) -> bool {
        self.state.borrow().power == PowerState::Energized
    }

    /// Last known position.
    pub fn current_position(&self) -> i32 {
        self.state.borrow().current_position
    }

    /// Run currently owning this axis, if any.
    pub fn owner(&self) -> Option<Uuid> {
        *self.owner.lock()
    }

    /// Apply holding current.
    ///
    /// Applies the configured current limit first. Energizing an energized
    /// axis is a no-op.
    ///
    /// # Errors
    /// - `HardwareFault` if the controller fails or does not acknowledge within
    ///   the configured `energize_timeout`
    pub async fn energize(&self) -> ScanResult<()> {
        if self.is_energized() {
            return Ok(());
        }
        let name = self.name();

        if let Some(ma) = self.definition.current_limit_ma {
            self.controller
                .set_current_limit(ma)
                .await
                .map_err(|e| hardware_fault(name, e))?;
            debug!(axis = %name, milliamps = ma, "Current limit applied");
        }

        let limit = self.definition.energize_timeout;
        match timeout(limit, self.controller.energize()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(hardware_fault(name, e)),
            Err(_) => {
                return Err(ScanError::HardwareFault {
                    axis: name.to_string(),
                    message: format!("energize not acknowledged within {limit:?}"),
                })
            }
        }

        self.state.send_modify(|s| {
            s.power = PowerState::Energized;
            s.is_moving = false;
            s.target_position = s.current_position;
        });
        info!(axis = %name, "Axis energized");
        Ok(())
    }

    /// Remove holding current, cancelling any in-flight move.
    ///
    /// # Errors
    /// - `HardwareFault` if the controller rejects the request; the axis state
    ///   is left unchanged in that case
    pub async fn deenergize(&self) -> ScanResult<()> {
        self.controller
            .deenergize()
            .await
            .map_err(|e| hardware_fault(self.name(), e))?;
        let position = self.controller.read_position().await.ok();
        self.mark_deenergized(position);
        info!(axis = %self.name(), "Axis deenergized");
        Ok(())
    }

    /// Begin moving to `position`.
    ///
    /// Returns as soon as the controller accepts the command; use
    /// [`MotorAxis::wait_until_settled`] to observe completion. `speed` defaults
    /// to the axis' `default_speed`.
    ///
    /// # Errors
    /// - `OutOfBounds` if `position` lies outside the axis bounds
    /// - `NotEnergized` if the axis is deenergized
    /// - `InvalidSpeed` if `speed` is zero or above `max_speed`
    /// - `HardwareFault` if the controller rejects the command
    pub async fn move_to(&self, position: i32, speed: Option<u32>) -> ScanResult<()> {
        let name = self.name();
        if !self.contains(position) {
            return Err(ScanError::OutOfBounds {
                axis: name.to_string(),
                position,
                min: self.definition.min_position,
                max: self.definition.max_position,
            });
        }
        if !self.is_energized() {
            return Err(ScanError::NotEnergized {
                axis: name.to_string(),
            });
        }
        let speed = speed.unwrap_or(self.definition.default_speed);
        if speed == 0 || speed > self.definition.max_speed {
            return Err(ScanError::InvalidSpeed {
                axis: name.to_string(),
                speed,
                max_speed: self.definition.max_speed,
            });
        }

        self.controller
            .move_to(position, speed)
            .await
            .map_err(|e| hardware_fault(name, e))?;

        self.state.send_modify(|s| {
            s.target_position = position;
            s.is_moving = s.power == PowerState::Energized;
        });
        debug!(axis = %name, target = position, speed, "Move issued");
        Ok(())
    }

    /// Wait until the last move has finished, or `limit` elapses.
    ///
    /// Polls the controller every `poll_interval`, publishing intermediate
    /// positions. Only the calling task is suspended.
    ///
    /// # Errors
    /// - `SettleTimeout` if motion is still in progress after `limit`; the axis
    ///   stays energized
    /// - `NotEnergized` if the axis was deenergized while waiting
    /// - `HardwareFault` if the controller cannot be polled, or the axis stopped
    ///   further than `position_tolerance` from its target
    pub async fn wait_until_settled(&self, limit: Duration) -> ScanResult<()> {
        let poll = self.definition.poll_interval;
        let wait = async {
            loop {
                if !self.is_energized() {
                    return Err(ScanError::NotEnergized {
                        axis: self.name().to_string(),
                    });
                }
                let moving = self
                    .controller
                    .is_moving()
                    .await
                    .map_err(|e| hardware_fault(self.name(), e))?;
                let position = self
                    .controller
                    .read_position()
                    .await
                    .map_err(|e| hardware_fault(self.name(), e))?;
                if !self.contains(position) {
                    return Err(ScanError::HardwareFault {
                        axis: self.name().to_string(),
                        message: format!("controller reports position {position} outside bounds"),
                    });
                }

                self.state.send_modify(|s| {
                    s.current_position = position;
                    s.is_moving = moving && s.power == PowerState::Energized;
                });

                if !moving {
                    return self.check_arrival(position);
                }
                sleep(poll).await;
            }
        };

        match timeout(limit, wait).await {
            Ok(result) => result,
            Err(_) => {
                warn!(axis = %self.name(), ?limit, "Axis did not settle");
                Err(ScanError::SettleTimeout {
                    axis: self.name().to_string(),
                    timeout: limit,
                })
            }
        }
    }

    fn check_arrival(&self, position: i32) -> ScanResult<()> {
        let target = self.state.borrow().target_position;
        let deviation = position.abs_diff(target);
        if deviation > self.definition.position_tolerance {
            return Err(ScanError::HardwareFault {
                axis: self.name().to_string(),
                message: format!(
                    "stopped at {position}, {deviation} steps from target {target}"
                ),
            });
        }
        Ok(())
    }

    /// Define the current physical position as the configured zero position.
    ///
    /// Halts any motion first.
    ///
    /// # Errors
    /// - `Unsupported` if the axis is not configured as zeroable
    /// - `HardwareFault` if the controller rejects the request
    pub async fn zero(&self) -> ScanResult<()> {
        if !self.definition.zeroable {
            return Err(ScanError::Unsupported {
                axis: self.name().to_string(),
                operation: "zero".to_string(),
            });
        }
        let reference = self.definition.zero_position;
        self.controller
            .zero(reference)
            .await
            .map_err(|e| hardware_fault(self.name(), e))?;
        self.state.send_modify(|s| {
            s.current_position = reference;
            s.target_position = reference;
            s.is_moving = false;
        });
        info!(axis = %self.name(), reference, "Axis zeroed");
        Ok(())
    }

    /// Deenergize immediately, regardless of in-flight state.
    ///
    /// Best-effort: controller errors are logged and the axis is reported as
    /// deenergized either way.
    pub async fn emergency_stop(&self) {
        let limit = self.definition.energize_timeout;
        match timeout(limit, self.controller.deenergize()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(axis = %self.name(), "Emergency stop failed: {e:#}"),
            Err(_) => error!(axis = %self.name(), ?limit, "Emergency stop not acknowledged"),
        }
        let position = match timeout(limit, self.controller.read_position()).await {
            Ok(Ok(position)) => Some(position),
            _ => None,
        };
        self.mark_deenergized(position);
        warn!(axis = %self.name(), "Emergency stop");
    }

    fn mark_deenergized(&self, position: Option<i32>) {
        let in_bounds = position.filter(|p| self.contains(*p));
        self.state.send_modify(|s| {
            if let Some(p) = in_bounds {
                s.current_position = p;
            }
            s.power = PowerState::Deenergized;
            s.is_moving = false;
            s.target_position = s.current_position;
        });
    }

    /// Re-read position and motion from the controller.
    ///
    /// # Errors
    /// - `HardwareFault` if the controller cannot be read
    pub async fn refresh(&self) -> ScanResult<AxisState> {
        let position = self
            .controller
            .read_position()
            .await
            .map_err(|e| hardware_fault(self.name(), e))?;
        let moving = self
            .controller
            .is_moving()
            .await
            .map_err(|e| hardware_fault(self.name(), e))?;
        let in_bounds = self.contains(position);
        self.state.send_modify(|s| {
            if in_bounds {
                s.current_position = position;
            }
            s.is_moving = moving && s.power == PowerState::Energized;
        });
        if !in_bounds {
            return Err(ScanError::HardwareFault {
                axis: self.name().to_string(),
                message: format!("controller reports position {position} outside bounds"),
            });
        }
        Ok(self.state())
    }

    pub(crate) fn try_claim(&self, run: Uuid) -> ScanResult<()> {
        let mut owner = self.owner.lock();
        match *owner {
            Some(current) if current != run => Err(ScanError::AxisBusy {
                axis: self.name().to_string(),
                owner: current,
            }),
            _ => {
                *owner = Some(run);
                Ok(())
            }
        }
    }

    pub(crate) fn release(&self, run: Uuid) {
        let mut owner = self.owner.lock();
        if *owner == Some(run) {
            *owner = None;
        }
    }
}

fn hardware_fault(axis: &str, err: anyhow::Error) -> ScanError {
    ScanError::HardwareFault {
        axis: axis.to_string(),
        message: format!("{err:#}"),
    }
}

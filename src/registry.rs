//! Registry of connected axes and run-scoped axis ownership.
//!
//! Axes are created once per session from configuration and shared as
//! `Arc<MotorAxis>`. A run takes exclusive ownership of the axes its plan
//! references through an [`AxisLease`], which hands them back on drop.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use crate::axis::MotorAxis;
use crate::config::AxisDefinition;
use crate::error::{ScanError, ScanResult};
use crate::hardware::MotorController;

/// Builds a motor controller for one axis definition.
pub type ControllerFactory =
    Box<dyn Fn(&AxisDefinition) -> anyhow::Result<Arc<dyn MotorController>> + Send + Sync>;

/// Named collection of axes available to scan runs.
#[derive(Debug, Default)]
pub struct AxisRegistry {
    axes: BTreeMap<String, Arc<MotorAxis>>,
}

impl AxisRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect every configured axis through `factory`.
    ///
    /// # Errors
    /// - `Configuration` if a name is repeated or the factory fails
    /// - `HardwareFault` if a controller cannot be read
    pub async fn from_config(
        definitions: &[AxisDefinition],
        factory: ControllerFactory,
    ) -> ScanResult<Self> {
        let mut registry = Self::new();
        for definition in definitions {
            let controller = factory(definition).map_err(|e| {
                ScanError::Configuration(format!("axis '{}': {e:#}", definition.name))
            })?;
            let axis = MotorAxis::connect(definition.clone(), controller).await?;
            registry.register(axis)?;
        }
        info!(axes = ?registry.names(), "Axis registry ready");
        Ok(registry)
    }

    /// Add an axis.
    ///
    /// # Errors
    /// - `Configuration` if an axis with the same name is already registered
    pub fn register(&mut self, axis: MotorAxis) -> ScanResult<Arc<MotorAxis>> {
        let name = axis.name().to_string();
        if self.axes.contains_key(&name) {
            return Err(ScanError::Configuration(format!(
                "axis '{name}' registered twice"
            )));
        }
        let axis = Arc::new(axis);
        self.axes.insert(name, axis.clone());
        Ok(axis)
    }

    /// Look up an axis by name.
    pub fn get(&self, name: &str) -> Option<Arc<MotorAxis>> {
        self.axes.get(name).cloned()
    }

    /// Whether an axis named `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.axes.contains_key(name)
    }

    /// Registered axis names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.axes.keys().cloned().collect()
    }

    /// Number of registered axes.
    pub fn len(&self) -> usize {
        self.axes.len()
    }

    /// Whether no axes are registered.
    pub fn is_empty(&self) -> bool {
        self.axes.is_empty()
    }

    /// Iterate over axes in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<MotorAxis>> {
        self.axes.values()
    }

    /// Take ownership of `names` for run `run_id`.
    ///
    /// All-or-nothing: if any axis is owned by another run, nothing is claimed.
    ///
    /// # Errors
    /// - `AxisBusy` naming the first conflicting axis and its owner
    /// - `Configuration` if a name is not registered
    pub fn claim(&self, names: &[String], run_id: Uuid) -> ScanResult<AxisLease> {
        let mut lease = AxisLease {
            run_id,
            axes: Vec::with_capacity(names.len()),
        };
        for name in names {
            let axis = self
                .get(name)
                .ok_or_else(|| ScanError::Configuration(format!("unknown axis '{name}'")))?;
            // Dropping the partial lease releases anything claimed so far.
            axis.try_claim(run_id)?;
            lease.axes.push(axis);
        }
        debug!(%run_id, axes = ?names, "Axes claimed");
        Ok(lease)
    }
}

/// Exclusive ownership of a set of axes for one run.
#[derive(Debug)]
pub struct AxisLease {
    run_id: Uuid,
    axes: Vec<Arc<MotorAxis>>,
}

impl AxisLease {
    /// Run holding the lease.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Leased axes in the order they were claimed.
    pub fn axes(&self) -> &[Arc<MotorAxis>] {
        &self.axes
    }

    /// Leased axis by name.
    pub fn get(&self, name: &str) -> Option<&Arc<MotorAxis>> {
        self.axes.iter().find(|a| a.name() == name)
    }
}

impl Drop for AxisLease {
    fn drop(&mut self) {
        for axis in &self.axes {
            axis.release(self.run_id);
        }
        debug!(run_id = %self.run_id, "Axes released");
    }
}

//! Declarative scan plans.
//!
//! A [`ScanPlan`] is an ordered list of axis sweeps. Each sweep names an axis,
//! the positions to visit on it and the settle delay applied after that axis
//! moves. Sweeps nest in the order given: the first sweep is the outermost loop
//! and changes least often, the last sweep is the innermost and changes on every
//! step (raster order).
//!
//! Plans are immutable once built. [`ScanPlan::iter`] produces a fresh, lazy,
//! finite sequence of [`PlanStep`]s on every call, so a plan can be replayed or
//! resumed at any index with [`ScanPlan::iter_from`].
//!
//! # Example
//!
//! ```toml
//! serpentine = false
//!
//! [[sweeps]]
//! axis = "tilt"
//! settle = "500ms"
//! positions = { min = -300, max = 300, divisions = 3 }
//!
//! [[sweeps]]
//! axis = "yaw"
//! settle = "250ms"
//! positions = { start = 0, end = 1700, step = 100 }
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PlanViolation, ScanError, ScanResult};
use crate::registry::AxisRegistry;

/// How the stop positions of one axis are produced.
///
/// Deserializes from either a plain list of positions or a table describing a
/// generator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PositionRule {
    /// Visit exactly these positions, in order
    Explicit(Vec<i32>),
    /// `start, start + step, ...` up to and including `end` when it is reachable
    ///
    /// A step pointing away from `end` yields `start` alone.
    Stepped {
        /// First position
        start: i32,
        /// Last position (inclusive when reachable)
        end: i32,
        /// Signed increment; must be non-zero
        step: i32,
    },
    /// `divisions` evenly spaced stops from `min`, truncating the spacing
    ///
    /// Fewer than two divisions visits `min` and `max` only.
    Divisions {
        /// First position
        min: i32,
        /// Upper end of the range
        max: i32,
        /// Number of stops
        divisions: u32,
    },
}

impl PositionRule {
    /// Number of positions this rule produces.
    pub fn len(&self) -> usize {
        match self {
            PositionRule::Explicit(positions) => positions.len(),
            PositionRule::Stepped { start, end, step } => {
                if *step == 0 {
                    return 0;
                }
                let span = i64::from(*end) - i64::from(*start);
                let step = i64::from(*step);
                if span != 0 && span.signum() != step.signum() {
                    return 1;
                }
                usize::try_from(span / step).map_or(usize::MAX, |n| n.saturating_add(1))
            }
            PositionRule::Divisions { divisions, .. } => {
                if *divisions < 2 {
                    2
                } else {
                    *divisions as usize
                }
            }
        }
    }

    /// Whether the rule produces no positions.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Position `index`, or `None` past the end.
    pub fn position(&self, index: usize) -> Option<i32> {
        if index >= self.len() {
            return None;
        }
        let value = match self {
            PositionRule::Explicit(positions) => return positions.get(index).copied(),
            PositionRule::Stepped { start, step, .. } => {
                i64::from(*start) + i64::from(*step) * index as i64
            }
            PositionRule::Divisions {
                min,
                max,
                divisions,
            } => {
                if *divisions < 2 {
                    return Some(if index == 0 { *min } else { *max });
                }
                let spacing = (i64::from(*max) - i64::from(*min)) / (i64::from(*divisions) - 1);
                i64::from(*min) + spacing * index as i64
            }
        };
        i32::try_from(value).ok()
    }

    /// All positions, materialized.
    pub fn positions(&self) -> Vec<i32> {
        (0..self.len()).filter_map(|i| self.position(i)).collect()
    }

    /// Positions that must be bounds-checked.
    ///
    /// Generated rules are monotonic, so their first and last stops bound every
    /// other stop.
    fn extremes(&self) -> Vec<i32> {
        match self {
            PositionRule::Explicit(positions) => positions.clone(),
            _ => {
                let last = self.len().saturating_sub(1);
                let mut extremes: Vec<i32> = [0, last]
                    .iter()
                    .filter_map(|i| self.position(*i))
                    .collect();
                extremes.dedup();
                extremes
            }
        }
    }
}

/// One axis of a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisSweep {
    /// Registered axis name
    pub axis: String,
    /// Stop positions
    pub positions: PositionRule,
    /// Delay after this axis finishes a move, before capture
    #[serde(default, with = "humantime_serde")]
    pub settle: Duration,
}

/// Grid of positions to visit across several axes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanPlan {
    /// Sweeps from outermost to innermost
    #[serde(default)]
    pub sweeps: Vec<AxisSweep>,
    /// Reverse nested axes on alternating passes of their parent
    #[serde(default)]
    pub serpentine: bool,
}

/// Target for one axis within a plan step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AxisTarget {
    /// Axis name
    pub axis: String,
    /// Position to reach before capture
    pub position: i32,
    /// Settle delay to apply if the axis moves
    #[serde(with = "humantime_serde")]
    pub settle: Duration,
    /// Whether the target differs from the previous step's
    ///
    /// Informational: the orchestrator decides whether to move by comparing
    /// the axis' live position with `position`, since a faulted step can leave
    /// an axis away from an unchanged target.
    pub changed: bool,
}

/// One tuple of targets in a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanStep {
    /// Zero-based step index
    pub index: usize,
    /// One target per sweep, outermost first
    pub targets: Vec<AxisTarget>,
}

impl PlanStep {
    /// Target for `axis`, if it is part of the plan.
    pub fn target(&self, axis: &str) -> Option<&AxisTarget> {
        self.targets.iter().find(|t| t.axis == axis)
    }
}

impl ScanPlan {
    /// Empty plan.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sweep as the new innermost axis.
    pub fn sweep(mut self, axis: impl Into<String>, positions: PositionRule, settle: Duration) -> Self {
        self.sweeps.push(AxisSweep {
            axis: axis.into(),
            positions,
            settle,
        });
        self
    }

    /// Enable or disable serpentine ordering.
    pub fn with_serpentine(mut self, serpentine: bool) -> Self {
        self.serpentine = serpentine;
        self
    }

    /// Parse a plan from TOML.
    pub fn from_toml_str(text: &str) -> ScanResult<Self> {
        toml::from_str(text).map_err(|e| ScanError::Configuration(format!("scan plan: {e}")))
    }

    /// Read a plan from a TOML file.
    pub fn load_from<P: AsRef<Path>>(path: P) -> ScanResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ScanError::Configuration(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Names of the axes this plan moves, outermost first.
    pub fn axis_names(&self) -> Vec<String> {
        self.sweeps.iter().map(|s| s.axis.clone()).collect()
    }

    /// Check the plan against the registered axes.
    ///
    /// Returns every problem found; an empty list means the plan is valid.
    pub fn validate(&self, registry: &AxisRegistry) -> Vec<PlanViolation> {
        let mut violations = Vec::new();
        if self.sweeps.is_empty() {
            violations.push(PlanViolation::Empty);
        }

        let mut seen = HashSet::new();
        for sweep in &self.sweeps {
            let axis = sweep.axis.clone();
            if !seen.insert(sweep.axis.as_str()) {
                violations.push(PlanViolation::DuplicateAxis { axis: axis.clone() });
            }

            if let PositionRule::Stepped { step: 0, .. } = sweep.positions {
                violations.push(PlanViolation::ZeroStep { axis });
                continue;
            }
            if sweep.positions.is_empty() {
                violations.push(PlanViolation::NoPositions { axis });
                continue;
            }

            let Some(registered) = registry.get(&sweep.axis) else {
                violations.push(PlanViolation::UnknownAxis { axis });
                continue;
            };
            let definition = registered.definition();
            for position in sweep.positions.extremes() {
                if !registered.contains(position) {
                    violations.push(PlanViolation::OutOfBounds {
                        axis: axis.clone(),
                        position,
                        min: definition.min_position,
                        max: definition.max_position,
                    });
                }
            }
        }
        violations
    }

    /// Number of steps: the product of the per-axis position counts.
    pub fn total_steps(&self) -> usize {
        if self.sweeps.is_empty() {
            return 0;
        }
        self.sweeps
            .iter()
            .fold(1usize, |acc, s| acc.saturating_mul(s.positions.len()))
    }

    /// Iterate over every step from the beginning.
    pub fn iter(&self) -> PlanIter<'_> {
        self.iter_from(0)
    }

    /// Iterate starting at step `index`.
    ///
    /// The first step's `changed` flags compare against step `index - 1`, so a
    /// resumed iteration reports the same flags as an uninterrupted one.
    pub fn iter_from(&self, index: usize) -> PlanIter<'_> {
        let previous = index
            .checked_sub(1)
            .and_then(|i| self.positions_at(i));
        PlanIter {
            plan: self,
            next: index,
            total: self.total_steps(),
            previous,
        }
    }

    /// Step `index`, or `None` past the end.
    pub fn step(&self, index: usize) -> Option<PlanStep> {
        self.iter_from(index).next()
    }

    fn positions_at(&self, index: usize) -> Option<Vec<i32>> {
        if index >= self.total_steps() {
            return None;
        }
        let mut positions = vec![0; self.sweeps.len()];
        // Mixed-radix decomposition, innermost sweep is the fastest digit.
        let mut stride = 1usize;
        for (slot, sweep) in self.sweeps.iter().enumerate().rev() {
            let len = sweep.positions.len();
            let quotient = index / stride;
            let mut digit = quotient % len;
            let pass = quotient / len;
            if self.serpentine && pass % 2 == 1 {
                digit = len - 1 - digit;
            }
            positions[slot] = sweep.positions.position(digit)?;
            stride = stride.saturating_mul(len);
        }
        Some(positions)
    }
}

/// Lazy iterator over the steps of a [`ScanPlan`].
#[derive(Debug, Clone)]
pub struct PlanIter<'a> {
    plan: &'a ScanPlan,
    next: usize,
    total: usize,
    previous: Option<Vec<i32>>,
}

impl Iterator for PlanIter<'_> {
    type Item = PlanStep;

    fn next(&mut self) -> Option<PlanStep> {
        let index = self.next;
        let positions = self.plan.positions_at(index)?;
        let targets = self
            .plan
            .sweeps
            .iter()
            .zip(&positions)
            .enumerate()
            .map(|(slot, (sweep, position))| AxisTarget {
                axis: sweep.axis.clone(),
                position: *position,
                settle: sweep.settle,
                changed: self
                    .previous
                    .as_ref()
                    .map_or(true, |prev| prev[slot] != *position),
            })
            .collect();
        self.previous = Some(positions);
        self.next += 1;
        Some(PlanStep { index, targets })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.total.saturating_sub(self.next);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for PlanIter<'_> {}

//! Scan orchestrator: drives axes and the capture device through a plan.
//!
//! # Lifecycle
//!
//! ```text
//! Idle ──start──▶ Running ──▶ Completed | Failed
//!                  │   ▲
//!            pause │   │ resume
//!                  ▼   │
//!                 Paused
//!
//! Running | Paused ──abort──▶ Aborting ──▶ Aborted
//! ```
//!
//! `start` validates the plan, claims and energizes every axis it references
//! (all-or-nothing) and spawns the run loop on the tokio runtime. The loop owns
//! all mutable run state; callers observe it through a `watch` channel holding
//! a [`ScanRun`] and through the ordered [`ScanEvent`] stream.
//!
//! Control requests (pause, resume, abort) travel to the loop through a second
//! `watch` channel. Pause is honoured at the next step boundary. Abort is
//! honoured immediately: settle waits and captures race against it in
//! `select!`, and `abort()` itself emergency-stops the run's axes before
//! waiting for the loop to acknowledge.
//!
//! Terminal runs stay inspectable until [`ScanOrchestrator::reset`].

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::axis::MotorAxis;
use crate::capture::{CaptureRecord, CaptureStation};
use crate::config::OrchestratorConfig;
use crate::error::{ScanError, ScanResult};
use crate::events::{EventBus, ScanEvent};
use crate::fault::{FaultAction, FaultHandler, FaultKind, FaultOrigin, FaultRecord, FaultSource};
use crate::plan::{PlanStep, ScanPlan};
use crate::progress::{ProgressSnapshot, ProgressTracker};
use crate::registry::{AxisLease, AxisRegistry};

/// Status of the orchestrator's current run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// No run; `start` is legal
    Idle,
    /// Stepping through the plan
    Running,
    /// Halted at a step boundary
    Paused,
    /// Abort requested, axes being stopped
    Aborting,
    /// Stopped by `abort`
    Aborted,
    /// Every step finished
    Completed,
    /// Stopped by a fatal fault
    Failed,
}

impl RunStatus {
    /// `Completed`, `Failed` or `Aborted`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Aborted
        )
    }

    /// A run exists and has not finished.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            RunStatus::Running | RunStatus::Paused | RunStatus::Aborting
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunStatus::Idle => "idle",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Aborting => "aborting",
            RunStatus::Aborted => "aborted",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Read-only view of one execution of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRun {
    /// Run identifier, `None` while idle
    pub run_id: Option<Uuid>,
    /// Lifecycle status
    pub status: RunStatus,
    /// Index of the step most recently started
    pub current_step: usize,
    /// Successful captures so far
    pub captures_taken: usize,
    /// Captures a fault-free run would take
    pub captures_expected: usize,
    /// Axes the run owns, outermost first
    pub axes: Vec<String>,
    /// When `start` accepted the plan
    pub started_at: Option<DateTime<Utc>>,
    /// When the run reached a terminal status
    pub finished_at: Option<DateTime<Utc>>,
    /// Every fault recorded during the run
    pub fault_records: Vec<FaultRecord>,
    /// Every successful capture
    pub captures: Vec<CaptureRecord>,
    /// Progress at the last step boundary
    pub progress: ProgressSnapshot,
}

impl Default for ScanRun {
    fn default() -> Self {
        Self {
            run_id: None,
            status: RunStatus::Idle,
            current_step: 0,
            captures_taken: 0,
            captures_expected: 0,
            axes: Vec::new(),
            started_at: None,
            finished_at: None,
            fault_records: Vec::new(),
            captures: Vec::new(),
            progress: ProgressSnapshot::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Run,
    Pause,
    Abort,
}

struct Shared {
    registry: Arc<AxisRegistry>,
    camera: Arc<CaptureStation>,
    config: OrchestratorConfig,
    faults: FaultHandler,
    run: watch::Sender<ScanRun>,
    control: watch::Sender<Control>,
    events: EventBus,
    lifecycle: tokio::sync::Mutex<()>,
    active_axes: parking_lot::Mutex<Vec<Arc<MotorAxis>>>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn status(&self) -> RunStatus {
        self.run.borrow().status
    }

    /// Move from `from` to `to` if the run is still in `from`.
    fn transition(&self, from: RunStatus, to: RunStatus) -> bool {
        self.run.send_if_modified(|run| {
            if run.status == from {
                run.status = to;
                true
            } else {
                false
            }
        })
    }
}

/// Runs scan plans against a set of axes and one capture device.
///
/// Cheap to clone; clones share the same run.
#[derive(Clone)]
pub struct ScanOrchestrator {
    shared: Arc<Shared>,
}

impl fmt::Debug for ScanOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanOrchestrator")
            .field("status", &self.shared.status())
            .field("camera", &self.shared.camera)
            .finish()
    }
}

impl ScanOrchestrator {
    /// Create an idle orchestrator.
    pub fn new(
        registry: Arc<AxisRegistry>,
        camera: Arc<CaptureStation>,
        config: OrchestratorConfig,
    ) -> Self {
        let (run, _) = watch::channel(ScanRun::default());
        let (control, _) = watch::channel(Control::Run);
        let faults = FaultHandler::new(config.motion_fault_policy, config.capture_fault_policy);
        let events = EventBus::new(config.event_channel_capacity);
        Self {
            shared: Arc::new(Shared {
                registry,
                camera,
                config,
                faults,
                run,
                control,
                events,
                lifecycle: tokio::sync::Mutex::new(()),
                active_axes: parking_lot::Mutex::new(Vec::new()),
                task: parking_lot::Mutex::new(None),
            }),
        }
    }

    /// Registry the orchestrator draws axes from.
    pub fn registry(&self) -> &Arc<AxisRegistry> {
        &self.shared.registry
    }

    /// Current run status.
    pub fn status(&self) -> RunStatus {
        self.shared.status()
    }

    /// Snapshot of the current (or last) run.
    pub fn report(&self) -> ScanRun {
        self.shared.run.borrow().clone()
    }

    /// Progress at the last step boundary.
    pub fn progress(&self) -> ProgressSnapshot {
        self.shared.run.borrow().progress
    }

    /// Follow the run view as it changes.
    pub fn watch(&self) -> watch::Receiver<ScanRun> {
        self.shared.run.subscribe()
    }

    /// Subscribe to the event stream.
    ///
    /// Events are never dropped: a subscriber that stops reading while its
    /// channel is full stalls the run. Drop the receiver to unsubscribe.
    pub fn subscribe(&self) -> mpsc::Receiver<ScanEvent> {
        self.shared.events.subscribe()
    }

    /// Start executing `plan`.
    ///
    /// On error nothing is left energized or claimed and the orchestrator
    /// stays `Idle`.
    ///
    /// # Errors
    /// - `InvalidState` unless the orchestrator is `Idle`
    /// - `InvalidPlan` listing every violation
    /// - `AxisBusy` if another run owns a referenced axis
    /// - `HardwareFault` if an axis fails to energize
    pub async fn start(&self, plan: ScanPlan) -> ScanResult<Uuid> {
        let shared = &self.shared;
        let _lifecycle = shared.lifecycle.lock().await;

        let status = shared.status();
        if status != RunStatus::Idle {
            return Err(invalid_state("start", status));
        }

        let violations = plan.validate(&shared.registry);
        if !violations.is_empty() {
            warn!(count = violations.len(), "Scan plan rejected");
            return Err(ScanError::InvalidPlan(violations));
        }

        let run_id = Uuid::new_v4();
        let axes = plan.axis_names();
        let lease = shared.registry.claim(&axes, run_id)?;

        let mut energized_by_run: Vec<Arc<MotorAxis>> = Vec::new();
        for axis in lease.axes() {
            if axis.is_energized() {
                debug!(axis = %axis.name(), "Axis already energized");
                continue;
            }
            if let Err(e) = axis.energize().await {
                error!(axis = %axis.name(), "Energize failed, start abandoned: {e}");
                join_all(energized_by_run.iter().map(|a| a.emergency_stop())).await;
                return Err(e);
            }
            energized_by_run.push(axis.clone());
        }

        let total = plan.total_steps();
        *shared.active_axes.lock() = lease.axes().to_vec();
        shared.control.send_replace(Control::Run);
        shared.run.send_replace(ScanRun {
            run_id: Some(run_id),
            status: RunStatus::Running,
            captures_expected: total,
            axes: axes.clone(),
            started_at: Some(Utc::now()),
            progress: ProgressSnapshot {
                total_steps: total,
                ..ProgressSnapshot::default()
            },
            ..ScanRun::default()
        });
        info!(%run_id, steps = total, ?axes, "Scan run started");
        shared
            .events
            .emit(ScanEvent::RunStatusChanged {
                status: RunStatus::Running,
            })
            .await;

        let context = RunContext {
            shared: shared.clone(),
            plan: Arc::new(plan),
            lease,
            energized_by_run,
            tracker: ProgressTracker::new(total),
            control: shared.control.subscribe(),
            pending: None,
        };
        let task = tokio::spawn(
            context
                .execute()
                .instrument(info_span!("scan_run", %run_id)),
        );
        *shared.task.lock() = Some(task);
        Ok(run_id)
    }

    /// Pause at the next step boundary. A move in progress always finishes.
    ///
    /// # Errors
    /// - `InvalidState` unless `Running` or `Paused`
    pub fn pause(&self) -> ScanResult<()> {
        let status = self.status();
        if !matches!(status, RunStatus::Running | RunStatus::Paused) {
            return Err(invalid_state("pause", status));
        }
        self.shared.control.send_if_modified(|control| {
            if *control == Control::Run {
                *control = Control::Pause;
                true
            } else {
                false
            }
        });
        Ok(())
    }

    /// Continue from the step where the run paused, or cancel a pause that
    /// has not taken effect yet.
    ///
    /// # Errors
    /// - `InvalidState` unless `Running` or `Paused`
    pub fn resume(&self) -> ScanResult<()> {
        let status = self.status();
        if !matches!(status, RunStatus::Running | RunStatus::Paused) {
            return Err(invalid_state("resume", status));
        }
        self.shared.control.send_if_modified(|control| {
            if *control == Control::Pause {
                *control = Control::Run;
                true
            } else {
                false
            }
        });
        Ok(())
    }

    /// Abort the run: stop every axis it owns and end in `Aborted`.
    ///
    /// Waits up to the configured acknowledgment timeout for the run loop to
    /// finish and returns the run view at that point.
    ///
    /// # Errors
    /// - `InvalidState` unless `Running` or `Paused`
    pub async fn abort(&self) -> ScanResult<ScanRun> {
        let shared = &self.shared;
        let mut accepted = false;
        let mut previous = RunStatus::Idle;
        shared.run.send_if_modified(|run| {
            previous = run.status;
            if matches!(run.status, RunStatus::Running | RunStatus::Paused) {
                run.status = RunStatus::Aborting;
                accepted = true;
            }
            accepted
        });
        if !accepted {
            return Err(invalid_state("abort", previous));
        }

        warn!("Abort requested");
        shared.control.send_replace(Control::Abort);
        let axes = shared.active_axes.lock().clone();
        join_all(axes.iter().map(|axis| axis.emergency_stop())).await;

        let limit = shared.config.abort_ack_timeout;
        let mut rx = shared.run.subscribe();
        let finished = timeout(limit, async {
            rx.wait_for(|run| run.status.is_terminal())
                .await
                .map(|run| run.clone())
        })
        .await;
        match finished {
            Ok(Ok(run)) => Ok(run),
            _ => {
                warn!(?limit, "Run loop did not acknowledge abort in time");
                Ok(self.report())
            }
        }
    }

    /// Wait until the run reaches a terminal status and return its view.
    ///
    /// # Errors
    /// - `InvalidState` if no run was started
    pub async fn wait_for_completion(&self) -> ScanResult<ScanRun> {
        let mut rx = self.shared.run.subscribe();
        let status = rx.borrow().status;
        if status == RunStatus::Idle {
            return Err(invalid_state("wait for completion", status));
        }
        let result = rx
            .wait_for(|run| run.status.is_terminal() || run.status == RunStatus::Idle)
            .await
            .map(|run| run.clone());
        result.map_err(|_| invalid_state("wait for completion", self.status()))
    }

    /// Return a terminal orchestrator to `Idle`, yielding the finished run.
    ///
    /// # Errors
    /// - `InvalidState` while a run is active
    pub async fn reset(&self) -> ScanResult<ScanRun> {
        let shared = &self.shared;
        let _lifecycle = shared.lifecycle.lock().await;
        let status = shared.status();
        if status.is_active() {
            return Err(invalid_state("reset", status));
        }

        let task = shared.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Run task ended abnormally: {e}");
            }
        }
        let report = shared.run.send_replace(ScanRun::default());
        shared.control.send_replace(Control::Run);
        debug!(status = %report.status, "Orchestrator reset");
        Ok(report)
    }
}

fn invalid_state(operation: &str, status: RunStatus) -> ScanError {
    ScanError::InvalidState {
        operation: operation.to_string(),
        status: status.to_string(),
    }
}

// ============================================================================
// Run loop
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Fail,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    Failed,
    Aborted,
}

struct PendingCapture {
    index: usize,
    handle: JoinHandle<ScanResult<CaptureRecord>>,
}

struct RunContext {
    shared: Arc<Shared>,
    plan: Arc<ScanPlan>,
    lease: AxisLease,
    energized_by_run: Vec<Arc<MotorAxis>>,
    tracker: ProgressTracker,
    control: watch::Receiver<Control>,
    pending: Option<PendingCapture>,
}

impl RunContext {
    async fn execute(mut self) {
        let result = AssertUnwindSafe(self.drive()).catch_unwind().await;
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(panic) => {
                self.record_panic(panic_message(panic.as_ref())).await;
                Outcome::Failed
            }
        };
        self.finish(outcome).await;
    }

    /// Record a panic in the run loop as a fault of the current step.
    async fn record_panic(&mut self, message: String) {
        let index = self.shared.run.borrow().current_step;
        error!(step = index, "Run loop panicked: {message}");
        let fault = FaultRecord {
            step_index: index,
            source: FaultSource::Device("run loop".to_string()),
            kind: FaultKind::HardwareCommunication,
            message: format!("run loop panicked: {message}"),
            timestamp: Utc::now(),
        };
        self.shared
            .run
            .send_modify(|run| run.fault_records.push(fault.clone()));
        self.shared
            .events
            .emit(ScanEvent::StepFaulted { index, fault })
            .await;
    }

    async fn drive(&mut self) -> Outcome {
        let plan = self.plan.clone();
        let settle_timeout = self.shared.config.settle_timeout;
        let pipelined = self.shared.config.pipelined_capture;

        for step in plan.iter() {
            if self.at_boundary().await == Flow::Abort {
                return Outcome::Aborted;
            }
            self.shared.run.send_modify(|run| run.current_step = step.index);
            debug!(step = step.index, "Step started");
            self.shared
                .events
                .emit(ScanEvent::StepStarted { index: step.index })
                .await;

            // Motion for this step runs alongside the previous step's capture
            // when pipelining; otherwise there is nothing pending.
            let joined = {
                let lease = &self.lease;
                let pending = &mut self.pending;
                let control = &mut self.control;
                let previous = async {
                    match pending.as_mut() {
                        Some(p) => Some((&mut p.handle).await),
                        None => None,
                    }
                };
                tokio::select! {
                    biased;
                    () = abort_requested(control) => None,
                    joined = async {
                        tokio::join!(move_step(lease, &step, settle_timeout), previous)
                    } => Some(joined),
                }
            };
            let Some((motion_errors, previous)) = joined else {
                return Outcome::Aborted;
            };

            if let Some(joined) = previous {
                if let Some(pending) = self.pending.take() {
                    let result = joined.unwrap_or_else(|e| {
                        Err(ScanError::CaptureDevice {
                            device: self.shared.camera.name().to_string(),
                            message: format!("capture task failed: {e}"),
                        })
                    });
                    if self.record_capture(pending.index, result).await == Flow::Fail {
                        return Outcome::Failed;
                    }
                }
            }

            if *self.control.borrow() == Control::Abort {
                return Outcome::Aborted;
            }

            if !motion_errors.is_empty() {
                match self.record_motion_faults(step.index, motion_errors).await {
                    Flow::Continue => continue,
                    Flow::Fail => return Outcome::Failed,
                    Flow::Abort => return Outcome::Aborted,
                }
            }

            let positions = self.positions(&step);
            if pipelined {
                let station = self.shared.camera.clone();
                let index = step.index;
                let handle = tokio::spawn(
                    async move { station.capture(index, positions).await }.in_current_span(),
                );
                self.pending = Some(PendingCapture { index, handle });
                continue;
            }

            let result = {
                let station = &self.shared.camera;
                tokio::select! {
                    biased;
                    () = abort_requested(&mut self.control) => None,
                    result = station.capture(step.index, positions) => Some(result),
                }
            };
            let Some(result) = result else {
                return Outcome::Aborted;
            };
            if self.record_capture(step.index, result).await == Flow::Fail {
                return Outcome::Failed;
            }
        }

        if let Some(pending) = self.pending.as_mut() {
            let index = pending.index;
            let joined = tokio::select! {
                biased;
                () = abort_requested(&mut self.control) => None,
                joined = &mut pending.handle => Some(joined),
            };
            let Some(joined) = joined else {
                return Outcome::Aborted;
            };
            self.pending = None;
            let result = joined.unwrap_or_else(|e| {
                Err(ScanError::CaptureDevice {
                    device: self.shared.camera.name().to_string(),
                    message: format!("capture task failed: {e}"),
                })
            });
            if self.record_capture(index, result).await == Flow::Fail {
                return Outcome::Failed;
            }
        }

        Outcome::Completed
    }

    /// Honour pause and abort requests between steps.
    async fn at_boundary(&mut self) -> Flow {
        loop {
            let control = *self.control.borrow_and_update();
            match control {
                Control::Abort => return Flow::Abort,
                Control::Run => {
                    if self.shared.transition(RunStatus::Paused, RunStatus::Running) {
                        info!("Run resumed");
                        self.emit_status(RunStatus::Running).await;
                    }
                    return Flow::Continue;
                }
                Control::Pause => {
                    if self.shared.transition(RunStatus::Running, RunStatus::Paused) {
                        info!(
                            step = self.tracker.completed_steps(),
                            "Run paused at step boundary"
                        );
                        self.emit_status(RunStatus::Paused).await;
                    }
                    if self.control.changed().await.is_err() {
                        return Flow::Abort;
                    }
                }
            }
        }
    }

    fn positions(&self, step: &PlanStep) -> BTreeMap<String, i32> {
        step.targets
            .iter()
            .filter_map(|t| {
                self.lease
                    .get(&t.axis)
                    .map(|axis| (t.axis.clone(), axis.current_position()))
            })
            .collect()
    }

    async fn record_capture(&mut self, index: usize, result: ScanResult<CaptureRecord>) -> Flow {
        match result {
            Ok(record) => {
                let artifact = record.artifact.clone();
                self.shared.run.send_modify(|run| {
                    run.captures_taken += 1;
                    run.captures.push(record);
                });
                self.step_done();
                self.shared
                    .events
                    .emit(ScanEvent::StepCaptured { index, artifact })
                    .await;
                Flow::Continue
            }
            Err(err) => {
                let (fault, action) = self.shared.faults.handle(&err, index, FaultOrigin::Capture);
                self.shared
                    .run
                    .send_modify(|run| run.fault_records.push(fault.clone()));
                if action == FaultAction::Continue {
                    self.step_done();
                }
                self.shared
                    .events
                    .emit(ScanEvent::StepFaulted { index, fault })
                    .await;
                match action {
                    FaultAction::Continue => Flow::Continue,
                    FaultAction::Abort => Flow::Fail,
                }
            }
        }
    }

    /// Record every motion fault of a step; the step emits one event.
    async fn record_motion_faults(&mut self, index: usize, errors: Vec<ScanError>) -> Flow {
        let mut records = Vec::with_capacity(errors.len());
        let mut action = FaultAction::Continue;
        for err in &errors {
            let (record, step_action) = self.shared.faults.handle(err, index, FaultOrigin::Motion);
            if step_action == FaultAction::Abort {
                action = FaultAction::Abort;
            }
            records.push(record);
        }
        let Some(first) = records.first().cloned() else {
            return Flow::Continue;
        };
        self.shared
            .run
            .send_modify(|run| run.fault_records.extend(records));
        if action == FaultAction::Continue {
            self.step_done();
        }
        self.shared
            .events
            .emit(ScanEvent::StepFaulted {
                index,
                fault: first,
            })
            .await;

        if *self.control.borrow() == Control::Abort {
            return Flow::Abort;
        }
        match action {
            FaultAction::Continue => Flow::Continue,
            FaultAction::Abort => Flow::Fail,
        }
    }

    /// Count a finished step. The final step's progress is published together
    /// with the terminal status.
    fn step_done(&mut self) {
        self.tracker.step_completed();
        if self.tracker.completed_steps() < self.tracker.total_steps() {
            let snapshot = self.tracker.snapshot();
            self.shared.run.send_modify(|run| run.progress = snapshot);
        }
    }

    async fn emit_status(&self, status: RunStatus) {
        self.shared
            .events
            .emit(ScanEvent::RunStatusChanged { status })
            .await;
    }

    async fn finish(self, outcome: Outcome) {
        let RunContext {
            shared,
            lease,
            energized_by_run,
            tracker,
            pending,
            ..
        } = self;

        if let Some(pending) = pending {
            pending.handle.abort();
        }

        let aborting = shared.status() == RunStatus::Aborting;
        let status = match outcome {
            _ if aborting => RunStatus::Aborted,
            Outcome::Aborted => RunStatus::Aborted,
            Outcome::Completed => RunStatus::Completed,
            Outcome::Failed => RunStatus::Failed,
        };
        if status == RunStatus::Aborted {
            shared
                .events
                .emit(ScanEvent::RunStatusChanged {
                    status: RunStatus::Aborting,
                })
                .await;
        }

        match status {
            RunStatus::Completed => {
                for axis in &energized_by_run {
                    if let Err(e) = axis.deenergize().await {
                        error!(axis = %axis.name(), "Deenergize failed: {e}");
                        axis.emergency_stop().await;
                    }
                }
            }
            // Operator-energized axes keep their holding current after a fault.
            RunStatus::Failed => {
                join_all(energized_by_run.iter().map(|axis| axis.emergency_stop())).await;
            }
            _ => {
                join_all(lease.axes().iter().map(|axis| axis.emergency_stop())).await;
            }
        }

        shared.active_axes.lock().clear();
        drop(lease);

        let snapshot = tracker.snapshot();
        let mut final_status = status;
        let mut progress = snapshot;
        shared.run.send_modify(|run| {
            // An abort accepted while shutting down still wins.
            if run.status == RunStatus::Aborting {
                final_status = RunStatus::Aborted;
            }
            run.status = final_status;
            run.finished_at = Some(Utc::now());
            // Full progress is only ever published together with `Completed`.
            if final_status == RunStatus::Completed
                || snapshot.completed_steps < snapshot.total_steps
            {
                run.progress = snapshot;
            }
            progress = run.progress;
        });

        match final_status {
            RunStatus::Completed => info!(steps = progress.completed_steps, "Scan run completed"),
            other => warn!(status = %other, steps = progress.completed_steps, "Scan run ended"),
        }
        shared
            .events
            .emit(ScanEvent::RunStatusChanged {
                status: final_status,
            })
            .await;
    }
}

/// Move every axis whose target changed, concurrently, and wait for each to
/// settle and serve its settle delay. Returns the errors of the axes that
/// failed.
async fn move_step(lease: &AxisLease, step: &PlanStep, settle_timeout: Duration) -> Vec<ScanError> {
    let moves = step.targets.iter().filter_map(|target| {
        let axis = lease.get(&target.axis)?.clone();
        let state = axis.state();
        if state.current_position == target.position && !state.is_moving {
            return None;
        }
        if !target.changed {
            debug!(
                axis = %target.axis,
                target = target.position,
                "Axis off an unchanged target, moving back"
            );
        }
        Some(async move {
            axis.move_to(target.position, None).await?;
            axis.wait_until_settled(settle_timeout).await?;
            if !target.settle.is_zero() {
                sleep(target.settle).await;
            }
            Ok::<(), ScanError>(())
        })
    });
    join_all(moves)
        .await
        .into_iter()
        .filter_map(Result::err)
        .collect()
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Resolves once abort has been requested.
async fn abort_requested(control: &mut watch::Receiver<Control>) {
    let closed = control
        .wait_for(|control| *control == Control::Abort)
        .await
        .is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

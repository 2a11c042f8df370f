//! End-to-end scan runs against mock steppers and a mock camera.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use scant::fault::{FaultAction, FaultKind, FaultSource};
use scant::hardware::mock::{MockCamera, MockStepper};
use scant::{
    AxisDefinition, AxisRegistry, CaptureStation, MotorAxis, OrchestratorConfig, PlanViolation,
    PositionRule, PowerState, RunStatus, ScanError, ScanEvent, ScanOrchestrator, ScanPlan,
};
use tokio::sync::mpsc;
use tokio::time::Instant;

struct Rig {
    orchestrator: ScanOrchestrator,
    registry: Arc<AxisRegistry>,
    steppers: HashMap<String, Arc<MockStepper>>,
    camera: Arc<MockCamera>,
    station: Arc<CaptureStation>,
}

impl Rig {
    fn power(&self, axis: &str) -> PowerState {
        self.registry.get(axis).unwrap().state().power
    }
}

async fn rig(
    axes: Vec<(AxisDefinition, MockStepper)>,
    camera: MockCamera,
    config: OrchestratorConfig,
) -> Rig {
    let mut registry = AxisRegistry::new();
    let mut steppers = HashMap::new();
    for (definition, stepper) in axes {
        let stepper = Arc::new(stepper);
        steppers.insert(definition.name.clone(), stepper.clone());
        let axis = MotorAxis::connect(definition, stepper).await.unwrap();
        registry.register(axis).unwrap();
    }
    let registry = Arc::new(registry);
    let camera = Arc::new(camera);
    let station = Arc::new(CaptureStation::new(
        "camera",
        camera.clone(),
        config.capture_timeout,
    ));
    let orchestrator = ScanOrchestrator::new(registry.clone(), station.clone(), config);
    Rig {
        orchestrator,
        registry,
        steppers,
        camera,
        station,
    }
}

async fn yaw_rig(stepper: MockStepper, config: OrchestratorConfig) -> Rig {
    rig(
        vec![(AxisDefinition::new("yaw", 0, 1800), stepper)],
        MockCamera::new("/scan"),
        config,
    )
    .await
}

/// yaw 0, 100, ..., 1700
fn yaw_plan() -> ScanPlan {
    ScanPlan::new().sweep(
        "yaw",
        PositionRule::Stepped {
            start: 0,
            end: 1700,
            step: 100,
        },
        Duration::from_millis(100),
    )
}

async fn until_terminal(rx: &mut mpsc::Receiver<ScanEvent>) -> Vec<ScanEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        let done = matches!(event, ScanEvent::RunStatusChanged { status } if status.is_terminal());
        events.push(event);
        if done {
            break;
        }
    }
    events
}

fn outcome_indices(events: &[ScanEvent]) -> Vec<usize> {
    events
        .iter()
        .filter(|e| e.is_step_outcome())
        .filter_map(ScanEvent::step_index)
        .collect()
}

fn step_events(events: &[ScanEvent]) -> Vec<ScanEvent> {
    events
        .iter()
        .filter(|e| e.step_index().is_some())
        .cloned()
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_eighteen_step_yaw_scan_completes() {
    let rig = yaw_rig(MockStepper::new("yaw"), OrchestratorConfig::default()).await;
    let mut rx = rig.orchestrator.subscribe();

    rig.orchestrator.start(yaw_plan()).await.unwrap();
    let events = until_terminal(&mut rx).await;

    let captured: Vec<usize> = events
        .iter()
        .filter_map(|e| match e {
            ScanEvent::StepCaptured { index, .. } => Some(*index),
            _ => None,
        })
        .collect();
    assert_eq!(captured, (0..18).collect::<Vec<_>>());
    assert_eq!(outcome_indices(&events).len(), 18);
    assert_eq!(
        events.first(),
        Some(&ScanEvent::RunStatusChanged {
            status: RunStatus::Running
        })
    );
    assert_eq!(
        events.last(),
        Some(&ScanEvent::RunStatusChanged {
            status: RunStatus::Completed
        })
    );

    let report = rig.orchestrator.wait_for_completion().await.unwrap();
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.captures_taken, 18);
    assert_eq!(report.captures_expected, 18);
    assert!(report.fault_records.is_empty());
    assert_eq!(report.captures[17].positions["yaw"], 1700);
    assert_eq!(report.progress.percentage, 100.0);

    let yaw = rig.registry.get("yaw").unwrap();
    assert_eq!(yaw.current_position(), 1700);
    assert_eq!(yaw.state().power, PowerState::Deenergized);
    assert_eq!(yaw.owner(), None);
    assert_eq!(rig.camera.capture_requests(), 18);
}

#[tokio::test(start_paused = true)]
async fn test_out_of_bounds_plan_is_rejected_before_energizing() {
    let rig = yaw_rig(MockStepper::new("yaw"), OrchestratorConfig::default()).await;
    let plan = ScanPlan::new().sweep(
        "yaw",
        PositionRule::Explicit(vec![0, 900, 2000]),
        Duration::ZERO,
    );

    let err = rig.orchestrator.start(plan).await.unwrap_err();
    assert_eq!(
        err,
        ScanError::InvalidPlan(vec![PlanViolation::OutOfBounds {
            axis: "yaw".into(),
            position: 2000,
            min: 0,
            max: 1800,
        }])
    );
    assert_eq!(rig.orchestrator.status(), RunStatus::Idle);
    assert_eq!(rig.power("yaw"), PowerState::Deenergized);
    assert_eq!(rig.steppers["yaw"].energize_count().await, 0);
    assert_eq!(rig.registry.get("yaw").unwrap().owner(), None);
}

#[tokio::test(start_paused = true)]
async fn test_controller_fault_at_step_five_fails_the_run() {
    // Step 0 is already at position 0, so step 5 issues the fifth move.
    let rig = yaw_rig(
        MockStepper::new("yaw").failing_move(5),
        OrchestratorConfig::default(),
    )
    .await;
    let mut rx = rig.orchestrator.subscribe();

    rig.orchestrator.start(yaw_plan()).await.unwrap();
    let events = until_terminal(&mut rx).await;
    let report = rig.orchestrator.wait_for_completion().await.unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.fault_records.len(), 1);
    let fault = &report.fault_records[0];
    assert_eq!(fault.step_index, 5);
    assert_eq!(fault.source, FaultSource::Axis("yaw".into()));
    assert_eq!(fault.kind, FaultKind::HardwareCommunication);

    assert_eq!(report.captures_taken, 5);
    assert_eq!(outcome_indices(&events), vec![0, 1, 2, 3, 4, 5]);
    assert!(matches!(
        events[events.len() - 2],
        ScanEvent::StepFaulted { index: 5, .. }
    ));
    assert_eq!(rig.power("yaw"), PowerState::Deenergized);
    assert!(!rig.steppers["yaw"].is_energized().await);
    assert!(report.progress.percentage < 100.0);
}

#[tokio::test(start_paused = true)]
async fn test_abort_deenergizes_promptly() {
    let rig = rig(
        vec![
            (
                AxisDefinition::new("yaw", 0, 1800).with_speeds(100, 4000),
                MockStepper::new("yaw"),
            ),
            (
                AxisDefinition::new("tilt", -900, 900),
                MockStepper::new("tilt"),
            ),
        ],
        MockCamera::new("/scan"),
        OrchestratorConfig::default(),
    )
    .await;
    let plan = ScanPlan::new()
        .sweep("tilt", PositionRule::Explicit(vec![-300, 300]), Duration::ZERO)
        .sweep(
            "yaw",
            PositionRule::Stepped {
                start: 0,
                end: 1700,
                step: 100,
            },
            Duration::ZERO,
        );
    let mut rx = rig.orchestrator.subscribe();
    rig.orchestrator.start(plan).await.unwrap();

    // Step 2 moves yaw 100 steps at 100 steps/s.
    loop {
        if rx.recv().await.unwrap() == (ScanEvent::StepStarted { index: 2 }) {
            break;
        }
    }
    let asked = Instant::now();
    let run = rig.orchestrator.abort().await.unwrap();

    assert_eq!(run.status, RunStatus::Aborted);
    assert!(asked.elapsed() < OrchestratorConfig::default().abort_ack_timeout);
    for axis in ["yaw", "tilt"] {
        assert_eq!(rig.power(axis), PowerState::Deenergized, "{axis}");
        assert!(!rig.steppers[axis].is_energized().await, "{axis}");
        assert_eq!(rig.registry.get(axis).unwrap().owner(), None);
    }

    let rest = until_terminal(&mut rx).await;
    assert!(!rest
        .iter()
        .any(|e| matches!(e, ScanEvent::StepCaptured { index: 2, .. })));
    let statuses: Vec<RunStatus> = rest
        .iter()
        .filter_map(|e| match e {
            ScanEvent::RunStatusChanged { status } => Some(*status),
            _ => None,
        })
        .collect();
    assert_eq!(statuses, vec![RunStatus::Aborting, RunStatus::Aborted]);

    // Abort is final.
    assert!(matches!(
        rig.orchestrator.abort().await,
        Err(ScanError::InvalidState { .. })
    ));
    assert!(rig.orchestrator.resume().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_abort_while_paused() {
    let rig = yaw_rig(MockStepper::new("yaw"), OrchestratorConfig::default()).await;
    let mut watch = rig.orchestrator.watch();
    rig.orchestrator.start(yaw_plan()).await.unwrap();
    rig.orchestrator.pause().unwrap();
    watch
        .wait_for(|run| run.status == RunStatus::Paused)
        .await
        .unwrap();

    let run = rig.orchestrator.abort().await.unwrap();
    assert_eq!(run.status, RunStatus::Aborted);
    assert_eq!(rig.power("yaw"), PowerState::Deenergized);
}

#[tokio::test(start_paused = true)]
async fn test_pause_and_resume_replay_the_same_sequence() {
    let baseline = {
        let rig = yaw_rig(MockStepper::new("yaw"), OrchestratorConfig::default()).await;
        let mut rx = rig.orchestrator.subscribe();
        rig.orchestrator.start(yaw_plan()).await.unwrap();
        step_events(&until_terminal(&mut rx).await)
    };

    let rig = yaw_rig(MockStepper::new("yaw"), OrchestratorConfig::default()).await;
    let mut rx = rig.orchestrator.subscribe();
    rig.orchestrator.start(yaw_plan()).await.unwrap();

    let mut seen = Vec::new();
    loop {
        let event = rx.recv().await.unwrap();
        let trigger = matches!(event, ScanEvent::StepCaptured { index: 3, .. });
        seen.push(event);
        if trigger {
            break;
        }
    }
    rig.orchestrator.pause().unwrap();
    loop {
        let event = rx.recv().await.unwrap();
        let paused = event
            == ScanEvent::RunStatusChanged {
                status: RunStatus::Paused,
            };
        seen.push(event);
        if paused {
            break;
        }
    }
    assert_eq!(rig.orchestrator.status(), RunStatus::Paused);

    // Nothing moves or captures while paused.
    let requests = rig.camera.capture_requests();
    let moves = rig.steppers["yaw"].move_commands().await;
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(rig.camera.capture_requests(), requests);
    assert_eq!(rig.steppers["yaw"].move_commands().await, moves);
    assert_eq!(rig.power("yaw"), PowerState::Energized);

    let paused_after = *outcome_indices(&seen).last().unwrap();
    rig.orchestrator.resume().unwrap();
    let rest = until_terminal(&mut rx).await;
    assert_eq!(
        rest[0],
        ScanEvent::RunStatusChanged {
            status: RunStatus::Running
        }
    );
    assert_eq!(
        rest[1],
        ScanEvent::StepStarted {
            index: paused_after + 1
        }
    );

    seen.extend(rest);
    assert_eq!(step_events(&seen), baseline);
    assert_eq!(rig.orchestrator.status(), RunStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_progress_is_monotonic_and_full_only_when_completed() {
    let rig = yaw_rig(MockStepper::new("yaw"), OrchestratorConfig::default()).await;
    let mut watch = rig.orchestrator.watch();
    rig.orchestrator.start(yaw_plan()).await.unwrap();

    let mut observed = Vec::new();
    loop {
        let run = watch.borrow_and_update().clone();
        observed.push((run.progress.percentage, run.status));
        if run.status.is_terminal() {
            break;
        }
        watch.changed().await.unwrap();
    }

    for pair in observed.windows(2) {
        assert!(pair[1].0 >= pair[0].0, "progress went backwards: {pair:?}");
    }
    for (percentage, status) in &observed {
        assert_eq!(
            *percentage == 100.0,
            *status == RunStatus::Completed,
            "{percentage} while {status}"
        );
    }
    assert_eq!(observed.last().unwrap().1, RunStatus::Completed);

    let progress = rig.orchestrator.progress();
    assert_eq!(progress.completed_steps, 18);
    assert_eq!(progress.eta, Some(Duration::ZERO));
}

#[tokio::test(start_paused = true)]
async fn test_second_run_on_owned_axis_is_busy() {
    let first = yaw_rig(MockStepper::new("yaw"), OrchestratorConfig::default()).await;
    let second = ScanOrchestrator::new(
        first.registry.clone(),
        Arc::new(CaptureStation::new(
            "second camera",
            Arc::new(MockCamera::new("/other")),
            Duration::from_secs(5),
        )),
        OrchestratorConfig::default(),
    );

    let run_id = first.orchestrator.start(yaw_plan()).await.unwrap();
    let err = second.start(yaw_plan()).await.unwrap_err();
    assert_eq!(
        err,
        ScanError::AxisBusy {
            axis: "yaw".into(),
            owner: run_id
        }
    );
    assert_eq!(second.status(), RunStatus::Idle);

    first.orchestrator.wait_for_completion().await.unwrap();
    second.start(yaw_plan()).await.unwrap();
    assert_eq!(
        second.wait_for_completion().await.unwrap().status,
        RunStatus::Completed
    );
}

#[tokio::test(start_paused = true)]
async fn test_pre_energized_axes_stay_energized() {
    let rig = rig(
        vec![
            (
                AxisDefinition::new("tilt", -900, 900),
                MockStepper::new("tilt"),
            ),
            (AxisDefinition::new("yaw", 0, 1800), MockStepper::new("yaw")),
        ],
        MockCamera::new("/scan"),
        OrchestratorConfig::default(),
    )
    .await;
    rig.registry.get("tilt").unwrap().energize().await.unwrap();

    let plan = ScanPlan::new()
        .sweep("tilt", PositionRule::Explicit(vec![-300, 0, 300]), Duration::ZERO)
        .sweep("yaw", PositionRule::Explicit(vec![0, 900]), Duration::ZERO);
    rig.orchestrator.start(plan).await.unwrap();
    let report = rig.orchestrator.wait_for_completion().await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.captures_taken, 6);
    assert_eq!(rig.power("tilt"), PowerState::Energized);
    assert_eq!(rig.power("yaw"), PowerState::Deenergized);
    assert_eq!(rig.steppers["tilt"].energize_count().await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_run_leaves_pre_energized_axes_alone() {
    let rig = rig(
        vec![
            (
                AxisDefinition::new("tilt", -900, 900),
                MockStepper::new("tilt"),
            ),
            (
                AxisDefinition::new("yaw", 0, 1800),
                MockStepper::new("yaw").failing_move(2),
            ),
        ],
        MockCamera::new("/scan"),
        OrchestratorConfig::default(),
    )
    .await;
    rig.registry.get("tilt").unwrap().energize().await.unwrap();

    let plan = ScanPlan::new()
        .sweep("tilt", PositionRule::Explicit(vec![0]), Duration::ZERO)
        .sweep("yaw", PositionRule::Explicit(vec![100, 200, 300]), Duration::ZERO);
    rig.orchestrator.start(plan).await.unwrap();
    let report = rig.orchestrator.wait_for_completion().await.unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.fault_records[0].step_index, 1);
    assert_eq!(rig.power("tilt"), PowerState::Energized);
    assert_eq!(rig.power("yaw"), PowerState::Deenergized);
}

#[tokio::test(start_paused = true)]
async fn test_energize_failure_rolls_back_start() {
    let rig = rig(
        vec![
            (
                AxisDefinition::new("tilt", -900, 900),
                MockStepper::new("tilt"),
            ),
            (
                AxisDefinition::new("yaw", 0, 1800),
                MockStepper::new("yaw").failing_energize(),
            ),
        ],
        MockCamera::new("/scan"),
        OrchestratorConfig::default(),
    )
    .await;
    let plan = ScanPlan::new()
        .sweep("tilt", PositionRule::Explicit(vec![0]), Duration::ZERO)
        .sweep("yaw", PositionRule::Explicit(vec![0, 100]), Duration::ZERO);

    let err = rig.orchestrator.start(plan).await.unwrap_err();
    assert!(matches!(err, ScanError::HardwareFault { ref axis, .. } if axis == "yaw"));
    assert_eq!(rig.orchestrator.status(), RunStatus::Idle);
    assert_eq!(rig.power("tilt"), PowerState::Deenergized);
    assert!(!rig.steppers["tilt"].is_energized().await);
    assert_eq!(rig.registry.get("tilt").unwrap().owner(), None);
}

#[tokio::test(start_paused = true)]
async fn test_capture_failure_continues_by_default() {
    let rig = rig(
        vec![(AxisDefinition::new("yaw", 0, 1800), MockStepper::new("yaw"))],
        MockCamera::new("/scan").failing_capture(3),
        OrchestratorConfig::default(),
    )
    .await;
    let mut rx = rig.orchestrator.subscribe();
    rig.orchestrator.start(yaw_plan()).await.unwrap();
    let events = until_terminal(&mut rx).await;
    let report = rig.orchestrator.wait_for_completion().await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.captures_taken, 17);
    assert_eq!(report.fault_records.len(), 1);
    assert_eq!(report.fault_records[0].step_index, 2);
    assert_eq!(report.fault_records[0].kind, FaultKind::CaptureDevice);
    assert_eq!(
        report.fault_records[0].source,
        FaultSource::Device("camera".into())
    );
    assert_eq!(outcome_indices(&events), (0..18).collect::<Vec<_>>());
    assert!(matches!(events.iter().find(|e| e.step_index() == Some(2) && e.is_step_outcome()), Some(ScanEvent::StepFaulted { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_capture_failure_can_be_fatal() {
    let config = OrchestratorConfig {
        capture_fault_policy: FaultAction::Abort,
        ..OrchestratorConfig::default()
    };
    let rig = rig(
        vec![(AxisDefinition::new("yaw", 0, 1800), MockStepper::new("yaw"))],
        MockCamera::new("/scan").hanging_capture(2),
        OrchestratorConfig {
            capture_timeout: Duration::from_secs(1),
            ..config
        },
    )
    .await;
    rig.orchestrator.start(yaw_plan()).await.unwrap();
    let report = rig.orchestrator.wait_for_completion().await.unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.fault_records.len(), 1);
    assert_eq!(report.fault_records[0].kind, FaultKind::Timeout);
    assert_eq!(report.fault_records[0].step_index, 1);
    assert_eq!(rig.power("yaw"), PowerState::Deenergized);
}

#[tokio::test(start_paused = true)]
async fn test_motion_faults_can_be_skipped() {
    let config = OrchestratorConfig {
        motion_fault_policy: FaultAction::Continue,
        ..OrchestratorConfig::default()
    };
    let rig = yaw_rig(MockStepper::new("yaw").failing_move(2), config).await;
    let mut rx = rig.orchestrator.subscribe();
    rig.orchestrator.start(yaw_plan()).await.unwrap();
    let events = until_terminal(&mut rx).await;
    let report = rig.orchestrator.wait_for_completion().await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.captures_taken, 17);
    assert_eq!(report.fault_records[0].step_index, 2);
    assert_eq!(outcome_indices(&events).len(), 18);
    assert_eq!(report.progress.percentage, 100.0);
}

#[tokio::test(start_paused = true)]
async fn test_settle_timeout_fails_the_run() {
    let config = OrchestratorConfig {
        settle_timeout: Duration::from_secs(1),
        ..OrchestratorConfig::default()
    };
    let rig = yaw_rig(MockStepper::new("yaw").stalling_move(3), config).await;
    rig.orchestrator.start(yaw_plan()).await.unwrap();
    let report = rig.orchestrator.wait_for_completion().await.unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.fault_records[0].kind, FaultKind::Timeout);
    assert_eq!(report.fault_records[0].step_index, 3);
    assert_eq!(rig.power("yaw"), PowerState::Deenergized);
}

#[tokio::test(start_paused = true)]
async fn test_pipelined_capture_keeps_one_request_outstanding() {
    let config = OrchestratorConfig {
        pipelined_capture: true,
        ..OrchestratorConfig::default()
    };
    let rig = rig(
        vec![(AxisDefinition::new("yaw", 0, 1800), MockStepper::new("yaw"))],
        MockCamera::new("/scan").with_exposure(Duration::from_millis(400)),
        config,
    )
    .await;
    let mut rx = rig.orchestrator.subscribe();
    rig.orchestrator.start(yaw_plan()).await.unwrap();
    let events = until_terminal(&mut rx).await;
    let report = rig.orchestrator.wait_for_completion().await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.captures_taken, 18);
    assert_eq!(rig.camera.max_outstanding(), 1);
    assert_eq!(outcome_indices(&events), (0..18).collect::<Vec<_>>());
    let steps: Vec<usize> = report.captures.iter().map(|c| c.step_index).collect();
    assert_eq!(steps, (0..18).collect::<Vec<_>>());
}

#[tokio::test(start_paused = true)]
async fn test_lifecycle_rules() {
    let rig = yaw_rig(MockStepper::new("yaw"), OrchestratorConfig::default()).await;
    assert!(matches!(
        rig.orchestrator.pause(),
        Err(ScanError::InvalidState { .. })
    ));
    assert!(rig.orchestrator.wait_for_completion().await.is_err());

    let first = rig.orchestrator.start(yaw_plan()).await.unwrap();
    assert!(matches!(
        rig.orchestrator.start(yaw_plan()).await,
        Err(ScanError::InvalidState { .. })
    ));
    assert!(rig.orchestrator.reset().await.is_err());

    rig.orchestrator.wait_for_completion().await.unwrap();
    // Terminal runs stay inspectable until reset.
    assert!(rig.orchestrator.start(yaw_plan()).await.is_err());
    let report = rig.orchestrator.reset().await.unwrap();
    assert_eq!(report.run_id, Some(first));
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(rig.orchestrator.status(), RunStatus::Idle);

    // The axis is back at 1700; the second run moves it back down.
    let second = rig.orchestrator.start(yaw_plan()).await.unwrap();
    assert_ne!(first, second);
    let report = rig.orchestrator.wait_for_completion().await.unwrap();
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.captures[0].positions["yaw"], 0);
}

#[tokio::test(start_paused = true)]
async fn test_abort_after_last_capture_never_reports_full_progress() {
    let config = OrchestratorConfig {
        event_channel_capacity: 1,
        ..OrchestratorConfig::default()
    };
    let rig = yaw_rig(MockStepper::new("yaw"), config).await;
    let mut rx = rig.orchestrator.subscribe();
    rig.orchestrator.start(yaw_plan()).await.unwrap();

    // Stop reading so the run blocks emitting the final StepCaptured.
    loop {
        if let ScanEvent::StepCaptured { index: 16, .. } = rx.recv().await.unwrap() {
            break;
        }
    }
    tokio::time::sleep(Duration::from_secs(5)).await;
    let view = rig.orchestrator.abort().await.unwrap();
    assert_eq!(view.status, RunStatus::Aborting);

    let events = until_terminal(&mut rx).await;
    let report = rig.orchestrator.wait_for_completion().await.unwrap();

    assert_eq!(report.status, RunStatus::Aborted);
    assert_eq!(report.captures_taken, 18);
    assert!(report.progress.percentage < 100.0);
    assert!(matches!(
        events.last(),
        Some(ScanEvent::RunStatusChanged {
            status: RunStatus::Aborted
        })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_driver_panic_fails_the_run_and_powers_down() {
    let rig = yaw_rig(
        MockStepper::new("yaw").panicking_move(3),
        OrchestratorConfig::default(),
    )
    .await;
    let mut rx = rig.orchestrator.subscribe();
    rig.orchestrator.start(yaw_plan()).await.unwrap();
    let events = until_terminal(&mut rx).await;
    let report = rig.orchestrator.wait_for_completion().await.unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.captures_taken, 3);
    assert_eq!(report.fault_records.len(), 1);
    assert_eq!(report.fault_records[0].step_index, 3);
    assert!(report.fault_records[0].message.contains("driver bug"));
    assert_eq!(outcome_indices(&events), vec![0, 1, 2, 3]);
    assert_eq!(rig.power("yaw"), PowerState::Deenergized);
    assert!(!rig.steppers["yaw"].is_energized().await);
    assert_eq!(rig.registry.get("yaw").unwrap().owner(), None);
}

#[tokio::test(start_paused = true)]
async fn test_abort_with_pipelined_capture_outstanding() {
    let config = OrchestratorConfig {
        pipelined_capture: true,
        ..OrchestratorConfig::default()
    };
    let rig = rig(
        vec![(AxisDefinition::new("yaw", 0, 1800), MockStepper::new("yaw"))],
        MockCamera::new("/scan").with_exposure(Duration::from_secs(5)),
        config,
    )
    .await;
    let mut rx = rig.orchestrator.subscribe();
    rig.orchestrator.start(yaw_plan()).await.unwrap();

    // Step 0 needs no motion, so its capture is in flight when step 1 starts.
    loop {
        if rx.recv().await.unwrap() == (ScanEvent::StepStarted { index: 1 }) {
            break;
        }
    }
    while rig.camera.outstanding() == 0 {
        tokio::task::yield_now().await;
    }
    let run = rig.orchestrator.abort().await.unwrap();

    assert_eq!(run.status, RunStatus::Aborted);
    assert_eq!(run.captures_taken, 0);
    assert_eq!(rig.camera.capture_requests(), 1);
    assert_eq!(rig.power("yaw"), PowerState::Deenergized);

    let session = tokio::time::timeout(Duration::from_millis(100), rig.station.open(1))
        .await
        .expect("capture gate released after abort");
    assert_eq!(session.step_index(), 1);
    assert_eq!(rig.camera.outstanding(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_resumed_step_moves_axis_back_to_unchanged_target() {
    let config = OrchestratorConfig {
        motion_fault_policy: FaultAction::Continue,
        ..OrchestratorConfig::default()
    };
    let rig = rig(
        vec![
            (
                AxisDefinition::new("tilt", -900, 900),
                MockStepper::new("tilt").failing_move(1),
            ),
            (AxisDefinition::new("yaw", 0, 1800), MockStepper::new("yaw")),
        ],
        MockCamera::new("/scan"),
        config,
    )
    .await;
    let plan = ScanPlan::new()
        .sweep("tilt", PositionRule::Explicit(vec![-300, 300]), Duration::ZERO)
        .sweep("yaw", PositionRule::Explicit(vec![0, 100]), Duration::ZERO);
    rig.orchestrator.start(plan).await.unwrap();
    let report = rig.orchestrator.wait_for_completion().await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.fault_records.len(), 1);
    assert_eq!(report.fault_records[0].step_index, 0);
    // Step 1 keeps tilt at -300, but tilt never got there in step 0.
    let step_one = &report.captures[0];
    assert_eq!(step_one.step_index, 1);
    assert_eq!(step_one.positions["tilt"], -300);
    assert_eq!(rig.steppers["tilt"].move_commands().await, 3);
}

//! Headless scan runner.
//!
//! ```bash
//! scant validate --config scant.toml --plan plan.toml
//! scant run --config scant.toml --plan plan.toml --simulate
//! ```
//!
//! `run` prints every scan event as a JSON line on stdout and the final run
//! report once the run ends. Ctrl-C aborts the run.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use scant::config::{AxisDefinition, ScanConfig};
use scant::hardware::mock::{MockCamera, MockStepper};
use scant::hardware::MotorController;
use scant::registry::ControllerFactory;
use scant::{AxisRegistry, CaptureStation, RunStatus, ScanEvent, ScanOrchestrator, ScanPlan};

#[derive(Debug, Parser)]
#[command(author, version, about = "Multi-axis photogrammetry scan runner")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check a plan against the configured axes and list every problem.
    Validate {
        /// Scanner configuration (TOML)
        #[arg(long)]
        config: PathBuf,
        /// Scan plan (TOML)
        #[arg(long)]
        plan: PathBuf,
    },
    /// Execute a plan.
    Run {
        /// Scanner configuration (TOML)
        #[arg(long)]
        config: PathBuf,
        /// Scan plan (TOML)
        #[arg(long)]
        plan: PathBuf,
        /// Drive simulated axes and camera instead of real hardware
        #[arg(long)]
        simulate: bool,
        /// Directory simulated captures are named under
        #[arg(long, default_value = "captures")]
        output: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Validate { config, plan } => validate(&config, &plan).await,
        Command::Run {
            config,
            plan,
            simulate,
            output,
        } => run(&config, &plan, simulate, output).await,
    }
}

fn load(config: &Path, plan: &Path) -> Result<(ScanConfig, ScanPlan)> {
    let config = ScanConfig::load_from(config)
        .with_context(|| format!("loading configuration {}", config.display()))?;
    let plan = ScanPlan::load_from(plan)?;
    Ok((config, plan))
}

/// Simulated steppers start inside their bounds, as close to 0 as allowed.
fn simulated_steppers() -> ControllerFactory {
    Box::new(|definition: &AxisDefinition| {
        let start = 0.clamp(definition.min_position, definition.max_position);
        let stepper = MockStepper::new(definition.name.clone()).at_position(start);
        Ok(Arc::new(stepper) as Arc<dyn MotorController>)
    })
}

async fn validate(config: &Path, plan: &Path) -> Result<()> {
    let (config, plan) = load(config, plan)?;
    let registry = AxisRegistry::from_config(&config.axes, simulated_steppers()).await?;

    let violations = plan.validate(&registry);
    if violations.is_empty() {
        println!(
            "plan ok: {} steps over {}",
            plan.total_steps(),
            plan.axis_names().join(", ")
        );
        return Ok(());
    }
    for violation in &violations {
        println!("{violation}");
    }
    bail!("plan has {} violation(s)", violations.len())
}

async fn run(config: &Path, plan: &Path, simulate: bool, output: String) -> Result<()> {
    let (config, plan) = load(config, plan)?;
    scant::logging::init_from_config(&config)?;

    if !simulate {
        bail!("no motor controller driver is linked into this build; rerun with --simulate");
    }

    let registry = Arc::new(AxisRegistry::from_config(&config.axes, simulated_steppers()).await?);
    let camera = Arc::new(CaptureStation::new(
        "camera",
        Arc::new(MockCamera::new(output)),
        config.orchestrator.capture_timeout,
    ));
    let orchestrator = ScanOrchestrator::new(registry, camera, config.orchestrator.clone());

    let mut events = orchestrator.subscribe();
    let run_id = orchestrator.start(plan).await?;
    info!(%run_id, "Running {}", config.application.name);

    let mut abort_sent = false;
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                println!("{}", serde_json::to_string(&event)?);
                if let ScanEvent::RunStatusChanged { status } = event {
                    if status.is_terminal() {
                        break;
                    }
                }
            }
            signal = tokio::signal::ctrl_c(), if !abort_sent => {
                signal.context("listening for Ctrl-C")?;
                warn!("Interrupted, aborting run");
                abort_sent = true;
                let orchestrator = orchestrator.clone();
                // Events must keep draining while the abort is acknowledged.
                tokio::spawn(async move {
                    if let Err(e) = orchestrator.abort().await {
                        warn!("Abort rejected: {e}");
                    }
                });
            }
        }
    }

    let report = orchestrator.wait_for_completion().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.status != RunStatus::Completed {
        bail!(
            "run {} ended {} with {} fault(s)",
            run_id,
            report.status,
            report.fault_records.len()
        );
    }
    Ok(())
}

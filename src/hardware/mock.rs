//! Mock Hardware Implementations
//!
//! Provides simulated hardware devices for testing without physical hardware.
//! All mock devices use async-safe operations (tokio::time, not std::thread::sleep),
//! so tests can run them under a paused clock.
//!
//! # Available Mocks
//!
//! - `MockStepper` - Simulated stepper controller with speed-accurate motion timing
//! - `MockCamera` - Simulated camera producing numbered artifact paths
//!
//! Both mocks support fault injection so the orchestrator's failure paths can be
//! exercised deterministically.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, trace};

use crate::hardware::capabilities::{Artifact, CaptureDevice, MotorController};

// =============================================================================
// MockStepper - Simulated Stepper Controller
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct Motion {
    from: i32,
    to: i32,
    started: Instant,
    duration: Duration,
    stalled: bool,
}

impl Motion {
    fn position_at(&self, now: Instant) -> i32 {
        if self.stalled {
            return self.from;
        }
        let elapsed = now.saturating_duration_since(self.started);
        if elapsed >= self.duration || self.duration.is_zero() {
            return self.to;
        }
        let fraction = elapsed.as_secs_f64() / self.duration.as_secs_f64();
        let delta = f64::from(self.to - self.from) * fraction;
        self.from + delta as i32
    }

    fn finished(&self, now: Instant) -> bool {
        !self.stalled && now.saturating_duration_since(self.started) >= self.duration
    }
}

#[derive(Debug, Default)]
struct StepperState {
    energized: bool,
    position: i32,
    motion: Option<Motion>,
    current_limit_ma: Option<u32>,
    move_commands: u32,
    energize_count: u32,
}

impl StepperState {
    /// Resolve any finished motion into the resting position.
    fn settle(&mut self, now: Instant) {
        if let Some(motion) = self.motion {
            if motion.finished(now) {
                self.position = motion.to;
                self.motion = None;
            }
        }
    }
}

#[derive(Debug, Default)]
struct StepperFaults {
    fail_energize: bool,
    energize_delay: Duration,
    fail_move_at: Option<u32>,
    stall_move_at: Option<u32>,
    panic_move_at: Option<u32>,
    miss_steps_at: Option<(u32, i32)>,
}

/// Mock stepper controller with realistic timing
///
/// Motion takes `|target - position| / speed` seconds and is evaluated lazily
/// against the tokio clock, so `read_position` reports intermediate positions
/// while a move is in flight.
///
/// # Example
///
/// ```rust,ignore
/// let stepper = MockStepper::new("yaw");
/// stepper.energize().await?;
/// stepper.move_to(1000, 2000).await?; // takes 500ms
/// ```
pub struct MockStepper {
    name: String,
    state: Arc<Mutex<StepperState>>,
    faults: StepperFaults,
}

impl MockStepper {
    /// Create a new deenergized mock stepper at position 0
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(StepperState::default())),
            faults: StepperFaults::default(),
        }
    }

    /// Start at the given position instead of 0.
    pub fn at_position(mut self, position: i32) -> Self {
        self.state = Arc::new(Mutex::new(StepperState {
            position,
            ..StepperState::default()
        }));
        self
    }

    /// Make every energize request fail.
    pub fn failing_energize(mut self) -> Self {
        self.faults.fail_energize = true;
        self
    }

    /// Delay the energize acknowledgment.
    pub fn with_energize_delay(mut self, delay: Duration) -> Self {
        self.faults.energize_delay = delay;
        self
    }

    /// Report a communication fault on the `nth` move command (1-based).
    pub fn failing_move(mut self, nth: u32) -> Self {
        self.faults.fail_move_at = Some(nth);
        self
    }

    /// Accept the `nth` move command but never complete it.
    pub fn stalling_move(mut self, nth: u32) -> Self {
        self.faults.stall_move_at = Some(nth);
        self
    }

    /// Panic inside the `nth` move command, like a buggy driver.
    pub fn panicking_move(mut self, nth: u32) -> Self {
        self.faults.panic_move_at = Some(nth);
        self
    }

    /// Stop the `nth` move `steps` short of its target.
    pub fn missing_steps(mut self, nth: u32, steps: i32) -> Self {
        self.faults.miss_steps_at = Some((nth, steps));
        self
    }

    /// Whether holding current is applied.
    pub async fn is_energized(&self) -> bool {
        self.state.lock().await.energized
    }

    /// Number of move commands the controller accepted or rejected.
    pub async fn move_commands(&self) -> u32 {
        self.state.lock().await.move_commands
    }

    /// Number of successful energize requests.
    pub async fn energize_count(&self) -> u32 {
        self.state.lock().await.energize_count
    }

    /// Current limit most recently applied.
    pub async fn current_limit(&self) -> Option<u32> {
        self.state.lock().await.current_limit_ma
    }

    /// Position right now, including in-flight motion.
    pub async fn position_now(&self) -> i32 {
        let state = self.state.lock().await;
        match state.motion {
            Some(motion) => motion.position_at(Instant::now()),
            None => state.position,
        }
    }
}

#[allow(clippy::panic)]
fn driver_bug(name: &str, nth: u32) -> ! {
    panic!("MockStepper {name}: driver bug on move #{nth}");
}

#[async_trait]
impl MotorController for MockStepper {
    async fn energize(&self) -> Result<()> {
        if !self.faults.energize_delay.is_zero() {
            sleep(self.faults.energize_delay).await;
        }
        if self.faults.fail_energize {
            bail!("MockStepper {}: controller did not acknowledge energize", self.name);
        }
        let mut state = self.state.lock().await;
        state.energized = true;
        state.energize_count += 1;
        debug!(axis = %self.name, "MockStepper energized");
        Ok(())
    }

    async fn deenergize(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        if let Some(motion) = state.motion.take() {
            state.position = motion.position_at(now);
        }
        state.energized = false;
        debug!(axis = %self.name, position = state.position, "MockStepper deenergized");
        Ok(())
    }

    async fn move_to(&self, position: i32, speed: u32) -> Result<()> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.settle(now);
        state.move_commands += 1;
        let nth = state.move_commands;

        if self.faults.panic_move_at == Some(nth) {
            drop(state);
            driver_bug(&self.name, nth);
        }
        if self.faults.fail_move_at == Some(nth) {
            return Err(anyhow!(
                "MockStepper {}: USB communication fault on move #{}",
                self.name,
                nth
            ));
        }
        if !state.energized {
            bail!("MockStepper {}: move rejected, motor deenergized", self.name);
        }
        if speed == 0 {
            bail!("MockStepper {}: speed must be non-zero", self.name);
        }

        let from = match state.motion.take() {
            Some(motion) => motion.position_at(now),
            None => state.position,
        };
        let to = match self.faults.miss_steps_at {
            Some((at, short)) if at == nth => position - short * (position - from).signum(),
            _ => position,
        };
        let distance = f64::from((to - from).abs());
        let duration = Duration::from_secs_f64(distance / f64::from(speed));

        trace!(axis = %self.name, from, to, ?duration, "MockStepper moving");
        state.position = from;
        state.motion = Some(Motion {
            from,
            to,
            started: now,
            duration,
            stalled: self.faults.stall_move_at == Some(nth),
        });
        Ok(())
    }

    async fn read_position(&self) -> Result<i32> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.settle(now);
        Ok(match state.motion {
            Some(motion) => motion.position_at(now),
            None => state.position,
        })
    }

    async fn is_moving(&self) -> Result<bool> {
        let mut state = self.state.lock().await;
        state.settle(Instant::now());
        Ok(state.motion.is_some())
    }

    async fn zero(&self, position: i32) -> Result<()> {
        let mut state = self.state.lock().await;
        state.motion = None;
        state.position = position;
        Ok(())
    }

    async fn set_current_limit(&self, milliamps: u32) -> Result<()> {
        self.state.lock().await.current_limit_ma = Some(milliamps);
        Ok(())
    }
}

// =============================================================================
// MockCamera - Simulated Camera
// =============================================================================

/// Mock camera that returns numbered artifact paths
///
/// Simulates a tethered camera with:
/// - Configurable exposure/transfer time (default 50ms)
/// - Sequential artifact names `{output_dir}/capture_0001.jpg`, ...
/// - Injected failures or hangs on specific capture numbers
/// - Tracking of concurrent outstanding requests
pub struct MockCamera {
    output_dir: String,
    exposure: Duration,
    failing: HashSet<usize>,
    hanging: HashSet<usize>,
    requests: AtomicUsize,
    outstanding: AtomicUsize,
    max_outstanding: AtomicUsize,
}

impl MockCamera {
    /// Create a camera writing artifacts under `output_dir`.
    pub fn new(output_dir: impl Into<String>) -> Self {
        Self {
            output_dir: output_dir.into(),
            exposure: Duration::from_millis(50),
            failing: HashSet::new(),
            hanging: HashSet::new(),
            requests: AtomicUsize::new(0),
            outstanding: AtomicUsize::new(0),
            max_outstanding: AtomicUsize::new(0),
        }
    }

    /// Set the simulated exposure plus transfer time.
    pub fn with_exposure(mut self, exposure: Duration) -> Self {
        self.exposure = exposure;
        self
    }

    /// Fail the `nth` capture request (1-based).
    pub fn failing_capture(mut self, nth: usize) -> Self {
        self.failing.insert(nth);
        self
    }

    /// Never answer the `nth` capture request (1-based).
    pub fn hanging_capture(mut self, nth: usize) -> Self {
        self.hanging.insert(nth);
        self
    }

    /// Total capture requests received.
    pub fn capture_requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Requests in flight right now.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Largest number of requests that were in flight at once.
    pub fn max_outstanding(&self) -> usize {
        self.max_outstanding.load(Ordering::SeqCst)
    }
}

struct OutstandingGuard<'a>(&'a AtomicUsize);

impl Drop for OutstandingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl CaptureDevice for MockCamera {
    async fn capture(&self) -> Result<Artifact> {
        let nth = self.requests.fetch_add(1, Ordering::SeqCst) + 1;
        let in_flight = self.outstanding.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = OutstandingGuard(&self.outstanding);
        self.max_outstanding.fetch_max(in_flight, Ordering::SeqCst);

        if self.hanging.contains(&nth) {
            std::future::pending::<()>().await;
        }
        sleep(self.exposure).await;

        if self.failing.contains(&nth) {
            bail!("MockCamera: capture #{} failed (card write error)", nth);
        }
        let artifact = Artifact::new(format!("{}/capture_{:04}.jpg", self.output_dir, nth));
        debug!(%artifact, "MockCamera captured");
        Ok(artifact)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

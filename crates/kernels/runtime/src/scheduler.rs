//! The simulation scheduler: a state machine around a stepping thread.
//!
//! ```text
//!            start(false)                    pause()
//!  STOPPED ───────────────▶ RUNNING ◀──────────────▶ PAUSED
//!     ▲     start(true)        │        start(false)     │
//!     │   (one step, PAUSED)   │ stop()                  │ stop()
//!     └────────────────────────┴─────────────────────────┘
//! ```
//!
//! Starting from `STOPPED` resolves the memory model, validates and prepares
//! the simulation; a validation failure leaves the state untouched. Steps run
//! on a background thread while `RUNNING`. `pause` and `stop` take effect at
//! a step boundary: the call returns once the current step has finished.
//!
//! Observers get a [`StepReport`] at most every `report_interval_ms` while
//! running, and after every single step.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::node::NodeLogic;
use crate::resolve::{MAX_BLOCKS_UPDATE_ATTEMPTS, MemoryModelResolver};
use crate::simulation::Simulation;

/// Scheduler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SimulationState {
    Stopped,
    Running,
    Paused,
}

impl fmt::Display for SimulationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SimulationState::Stopped => "STOPPED",
            SimulationState::Running => "RUNNING",
            SimulationState::Paused => "PAUSED",
        })
    }
}

/// Scheduler timing and resolution limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Sleep between steps while running.
    pub step_delay_ms: u64,
    /// Minimum time between progress reports.
    pub report_interval_ms: u64,
    /// Resolution passes before sizes are declared unstable.
    pub max_resolution_attempts: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            step_delay_ms: 0,
            report_interval_ms: 20,
            max_resolution_attempts: MAX_BLOCKS_UPDATE_ATTEMPTS,
        }
    }
}

/// Progress notification.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepReport {
    /// Steps completed so far.
    pub step: u64,
    /// Measured over the interval since the previous report.
    pub steps_per_second: f64,
}

/// Receives progress and state changes. Called from the stepping thread.
pub trait StepObserver: Send + Sync {
    fn on_step(&self, _report: &StepReport) {}

    fn on_state_changed(&self, _old: SimulationState, _new: SimulationState) {}
}

struct ReportClock {
    since: Instant,
    last_step: u64,
}

impl ReportClock {
    fn new(step: u64) -> Self {
        Self {
            since: Instant::now(),
            last_step: step,
        }
    }

    fn observe(&mut self, step: u64, interval: Duration, force: bool) -> Option<StepReport> {
        let elapsed = self.since.elapsed();
        if !force && elapsed < interval {
            return None;
        }
        let seconds = elapsed.as_secs_f64();
        let steps = step.saturating_sub(self.last_step);
        let steps_per_second = if seconds > 0.0 { steps as f64 / seconds } else { 0.0 };
        *self = Self::new(step);
        Some(StepReport {
            step,
            steps_per_second,
        })
    }
}

struct Shared<N> {
    simulation: Mutex<Simulation<N>>,
    state: Mutex<SimulationState>,
    stop_requested: AtomicBool,
    observers: Mutex<Vec<Arc<dyn StepObserver>>>,
    last_error: Mutex<Option<String>>,
    clock: Mutex<ReportClock>,
    config: SchedulerConfig,
}

impl<N: NodeLogic> Shared<N> {
    fn state(&self) -> SimulationState {
        *self.state.lock()
    }

    fn set_state(&self, new: SimulationState) {
        let old = std::mem::replace(&mut *self.state.lock(), new);
        if old == new {
            return;
        }
        info!(%old, %new, "simulation state changed");
        for observer in self.observers.lock().iter() {
            observer.on_state_changed(old, new);
        }
    }

    fn record_step(&self, step: u64, force: bool) {
        let interval = Duration::from_millis(self.config.report_interval_ms);
        let Some(report) = self.clock.lock().observe(step, interval, force) else {
            return;
        };
        debug!(step = report.step, speed = report.steps_per_second, "simulation progress");
        for observer in self.observers.lock().iter() {
            observer.on_step(&report);
        }
    }

    /// A step failed: keep the memory for inspection and stop.
    fn fail(&self, err: &Error) {
        error!(error = %err, "simulation step failed");
        *self.last_error.lock() = Some(err.to_string());
        self.set_state(SimulationState::Stopped);
    }
}

fn run_loop<N: NodeLogic>(shared: Arc<Shared<N>>) {
    let delay = Duration::from_millis(shared.config.step_delay_ms);
    debug!("stepping thread started");
    while !shared.stop_requested.load(Ordering::Acquire) {
        let result = shared.simulation.lock().step();
        match result {
            Ok(step) => shared.record_step(step, false),
            Err(err) => {
                shared.fail(&err);
                return;
            }
        }
        if !delay.is_zero() {
            thread::sleep(delay);
        }
    }
    debug!("stepping thread finished");
}

/// Owns a simulation and runs it according to the scheduler state machine.
pub struct SimulationHandler<N: NodeLogic> {
    shared: Arc<Shared<N>>,
    worker: Option<JoinHandle<()>>,
}

impl<N: NodeLogic> SimulationHandler<N> {
    pub fn new(simulation: Simulation<N>, config: SchedulerConfig) -> Self {
        let simulation =
            simulation.with_resolver(MemoryModelResolver::new(config.max_resolution_attempts));
        Self {
            shared: Arc::new(Shared {
                simulation: Mutex::new(simulation),
                state: Mutex::new(SimulationState::Stopped),
                stop_requested: AtomicBool::new(false),
                observers: Mutex::new(Vec::new()),
                last_error: Mutex::new(None),
                clock: Mutex::new(ReportClock::new(0)),
                config,
            }),
            worker: None,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    pub fn add_observer(&self, observer: Arc<dyn StepObserver>) {
        self.shared.observers.lock().push(observer);
    }

    pub fn state(&self) -> SimulationState {
        self.shared.state()
    }

    /// Steps completed in the current run.
    pub fn current_step(&self) -> u64 {
        self.shared.simulation.lock().current_step()
    }

    /// The failure that last stopped the simulation, if any.
    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().clone()
    }

    /// Run `f` with exclusive access to the simulation, between steps.
    pub fn with_simulation<R>(&self, f: impl FnOnce(&mut Simulation<N>) -> R) -> R {
        f(&mut self.shared.simulation.lock())
    }

    /// Start or resume.
    ///
    /// With `one_step_only`, exactly one step runs on the calling thread and
    /// the scheduler ends up `PAUSED`; from `STOPPED` it passes through
    /// `RUNNING` for that step. While `RUNNING`, a one-step request pauses at
    /// the next step boundary instead.
    pub fn start(&mut self, one_step_only: bool) -> Result<()> {
        self.reap_worker();
        let from_stopped = self.state() == SimulationState::Stopped;
        match self.state() {
            SimulationState::Running => {
                if one_step_only {
                    self.pause();
                }
                return Ok(());
            }
            SimulationState::Stopped => {
                *self.shared.last_error.lock() = None;
                self.shared.simulation.lock().check_and_prepare()?;
                info!("simulation prepared, starting");
            }
            SimulationState::Paused => {}
        }

        let step = self.current_step();
        *self.shared.clock.lock() = ReportClock::new(step);

        if one_step_only {
            if from_stopped {
                self.shared.set_state(SimulationState::Running);
            }
            let result = self.shared.simulation.lock().step();
            return match result {
                Ok(step) => {
                    self.shared.record_step(step, true);
                    self.shared.set_state(SimulationState::Paused);
                    Ok(())
                }
                Err(err) => {
                    self.shared.fail(&err);
                    Err(err)
                }
            };
        }

        self.shared.stop_requested.store(false, Ordering::Release);
        self.shared.set_state(SimulationState::Running);
        let shared = Arc::clone(&self.shared);
        let worker = thread::Builder::new()
            .name("simulation".to_string())
            .spawn(move || run_loop(shared));
        match worker {
            Ok(handle) => {
                self.worker = Some(handle);
                Ok(())
            }
            Err(err) => {
                self.shared.set_state(SimulationState::Paused);
                Err(Error::WorkerSpawn(err))
            }
        }
    }

    /// Run `steps` single steps on the calling thread, starting if needed.
    ///
    /// Returns the completed step count. Ends `PAUSED`.
    pub fn run_steps(&mut self, steps: u64) -> Result<u64> {
        if self.state() == SimulationState::Running {
            return Err(Error::InvalidState {
                operation: "run_steps",
                state: SimulationState::Running,
            });
        }
        for _ in 0..steps {
            self.start(true)?;
        }
        Ok(self.current_step())
    }

    /// Pause at the next step boundary. No-op unless running.
    pub fn pause(&mut self) {
        if self.state() != SimulationState::Running {
            return;
        }
        self.halt_worker();
        // The worker may have stopped on an error while we waited
        if self.state() == SimulationState::Running {
            self.shared.set_state(SimulationState::Paused);
        }
    }

    /// Stop at the next step boundary. Always safe to call.
    ///
    /// Blocks keep the values of the last completed step and the step counter
    /// stays readable until the next start.
    pub fn stop(&mut self) {
        self.halt_worker();
        self.shared.set_state(SimulationState::Stopped);
    }

    /// Release simulation memory and rewind the step counter.
    pub fn reset(&mut self) -> Result<()> {
        let state = self.state();
        if state != SimulationState::Stopped {
            return Err(Error::InvalidState {
                operation: "reset",
                state,
            });
        }
        self.shared.simulation.lock().reset()?;
        info!("simulation reset");
        Ok(())
    }

    /// Block until at least `step` steps are done or `timeout` passes.
    ///
    /// Returns whether the step was reached.
    pub fn wait_for_step(&self, step: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.current_step() >= step {
                return true;
            }
            if Instant::now() >= deadline || self.state() != SimulationState::Running {
                return self.current_step() >= step;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn halt_worker(&mut self) {
        self.shared.stop_requested.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            error!("stepping thread panicked");
            *self.shared.last_error.lock() = Some("stepping thread panicked".to_string());
            self.shared.set_state(SimulationState::Stopped);
        }
        self.shared.stop_requested.store(false, Ordering::Release);
    }

    /// Join a worker that already exited on its own.
    fn reap_worker(&mut self) {
        if self.worker.as_ref().is_some_and(JoinHandle::is_finished) {
            self.halt_worker();
        }
    }
}

impl<N: NodeLogic> Drop for SimulationHandler<N> {
    fn drop(&mut self) {
        self.halt_worker();
    }
}

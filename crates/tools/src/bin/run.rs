//! Brainflow Run
//!
//! Builds a demo network and drives it through the scheduler.
//!
//! Usage: `brainflow-run [CONFIG] [--demo NAME] [--steps N] [--one-step]
//! [--step-delay-ms MS] [--devices N] [--dump]`

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use brainflow_runtime::{SimulationHandler, SimulationState, StepObserver, StepReport};
use brainflow_tools::{Demo, RunConfig, dump};

#[derive(Parser, Debug)]
#[command(name = "brainflow-run")]
#[command(about = "Run a Brainflow demo network")]
struct Args {
    /// YAML run configuration
    config: Option<PathBuf>,

    /// Demo network (transforms, sdr, groups)
    #[arg(long)]
    demo: Option<String>,

    /// Steps to run; 0 runs until interrupted
    #[arg(long)]
    steps: Option<u64>,

    /// Run exactly one step and stay paused
    #[arg(long)]
    one_step: bool,

    /// Sleep between steps
    #[arg(long)]
    step_delay_ms: Option<u64>,

    /// Number of simulated devices
    #[arg(long)]
    devices: Option<usize>,

    /// Print every output block as JSON when done
    #[arg(long)]
    dump: bool,
}

struct LogObserver;

impl StepObserver for LogObserver {
    fn on_step(&self, report: &StepReport) {
        info!(step = report.step, steps_per_second = report.steps_per_second, "progress");
    }

    fn on_state_changed(&self, old: SimulationState, new: SimulationState) {
        info!("{} -> {}", old, new);
    }
}

fn main() {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match RunConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                brainflow_tools::init_logging(None);
                error!("{}", e);
                process::exit(1);
            }
        },
        None => RunConfig::default(),
    };
    brainflow_tools::init_logging(config.log_filter.as_deref());

    // Command line overrides the file
    if let Some(demo) = args.demo {
        config.demo = demo;
    }
    if let Some(steps) = args.steps {
        config.steps = steps;
    }
    if let Some(delay) = args.step_delay_ms {
        config.scheduler.step_delay_ms = delay;
    }
    if let Some(devices) = args.devices {
        config.devices.device_count = devices;
    }

    let demo: Demo = match config.demo.parse() {
        Ok(demo) => demo,
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    };
    let simulation = match demo.simulation(&config.devices) {
        Ok(simulation) => simulation,
        Err(e) => {
            error!("Failed to build demo '{}': {}", demo, e);
            process::exit(1);
        }
    };

    let mut handler = SimulationHandler::new(simulation, config.scheduler.clone());
    handler.add_observer(Arc::new(LogObserver));

    let result = if args.one_step {
        handler.start(true)
    } else if config.steps == 0 {
        info!("Running {} until interrupted", demo);
        handler.start(false).map(|()| {
            while handler.state() == SimulationState::Running {
                std::thread::sleep(Duration::from_millis(100));
            }
        })
    } else {
        info!("Running {} for {} steps", demo, config.steps);
        handler.run_steps(config.steps).map(|_| ())
    };

    if let Err(e) = result {
        error!("Simulation failed: {}", e);
        process::exit(1);
    }
    if let Some(e) = handler.last_error() {
        error!("Simulation stopped: {}", e);
        process::exit(1);
    }
    info!("Completed {} steps", handler.current_step());

    if args.dump {
        let json = handler
            .with_simulation(|simulation| dump::dump_blocks(simulation))
            .and_then(|dumps| dump::to_json(&dumps));
        match json {
            Ok(json) => println!("{}", json),
            Err(e) => {
                error!("Failed to dump blocks: {}", e);
                process::exit(1);
            }
        }
    }

    handler.stop();
}

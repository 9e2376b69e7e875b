//! Integration test harness for Brainflow.
//!
//! This crate provides utilities for end-to-end testing of the full
//! pipeline: Build graph → Resolve → Validate → Prepare → Step → Verify.

use std::time::Duration;

use brainflow_nodes::{BuiltinNode, kernel_registry};
use brainflow_runtime::{
    ExecutionContext, Graph, NodeId, NodeLogic, Result, SchedulerConfig, Simulation,
    SimulationHandler, SimulationState,
};
use brainflow_tools::Demo;

/// Test harness driving a network through the scheduler.
pub struct TestHarness<N: NodeLogic = BuiltinNode> {
    handler: SimulationHandler<N>,
}

impl<N: NodeLogic> TestHarness<N> {
    /// Wrap `graph` in a context with `devices` devices and the built-in kernels.
    pub fn new(graph: Graph<N>, devices: usize) -> Self {
        let simulation = Simulation::new(
            graph,
            ExecutionContext::with_devices(devices),
            kernel_registry(),
        );
        Self {
            handler: SimulationHandler::new(simulation, SchedulerConfig::default()),
        }
    }

    /// Build the graph with `build` and wrap it.
    pub fn build(devices: usize, build: impl FnOnce(&mut Graph<N>)) -> Self {
        let mut graph = Graph::new();
        build(&mut graph);
        Self::new(graph, devices)
    }

    pub fn handler(&mut self) -> &mut SimulationHandler<N> {
        &mut self.handler
    }

    pub fn state(&self) -> SimulationState {
        self.handler.state()
    }

    pub fn current_step(&self) -> u64 {
        self.handler.current_step()
    }

    /// Start (or resume) for exactly one step.
    pub fn try_step(&mut self) -> Result<()> {
        self.handler.start(true)
    }

    /// Execute a single step.
    ///
    /// # Panics
    ///
    /// Panics if the step fails.
    pub fn step(&mut self) {
        if let Err(e) = self.try_step() {
            panic!("Step failed: {e}");
        }
    }

    /// Execute multiple steps.
    pub fn run_steps(&mut self, count: u64) {
        for _ in 0..count {
            self.step();
        }
    }

    /// Run on the worker thread until at least `step` steps are done.
    ///
    /// # Panics
    ///
    /// Panics if the run cannot start or does not get there within a few seconds.
    pub fn run_until(&mut self, step: u64) {
        if let Err(e) = self.handler.start(false) {
            panic!("Start failed: {e}");
        }
        assert!(
            self.handler.wait_for_step(step, Duration::from_secs(5)),
            "step {step} not reached, state {}",
            self.handler.state()
        );
    }

    pub fn stop(&mut self) {
        self.handler.stop();
    }

    /// Run `f` against the simulation between steps.
    pub fn with_simulation<R>(&self, f: impl FnOnce(&mut Simulation<N>) -> R) -> R {
        self.handler.with_simulation(f)
    }

    /// Node with the given name.
    ///
    /// # Panics
    ///
    /// Panics if no node has that name.
    pub fn node(&self, name: &str) -> NodeId {
        self.with_simulation(|sim| sim.graph().find_by_name(name))
            .unwrap_or_else(|| panic!("no node named '{name}'"))
    }

    /// Element count of block `index` of the named node.
    pub fn count(&self, name: &str, index: usize) -> usize {
        let node = self.node(name);
        self.with_simulation(|sim| {
            let graph = sim.graph();
            graph
                .output_block(node, index)
                .and_then(|id| graph.block(id).map(|b| b.count()))
                .unwrap_or_default()
        })
    }

    /// Values of output block 0 of the named node, widened to `f64`.
    pub fn values(&self, name: &str) -> Vec<f64> {
        let node = self.node(name);
        self.with_simulation(|sim| {
            let graph = sim.graph();
            let Ok(block) = graph.output_block(node, 0).and_then(|id| graph.block(id)) else {
                return Vec::new();
            };
            (0..block.count())
                .filter_map(|i| block.value_at_f64(sim.exec(), i).ok())
                .collect()
        })
    }
}

impl TestHarness<BuiltinNode> {
    /// Harness around one of the demo networks.
    ///
    /// # Panics
    ///
    /// Panics if the demo fails to build.
    pub fn demo(demo: Demo, devices: usize) -> Self {
        match demo.build(devices) {
            Ok(graph) => Self::new(graph, devices),
            Err(e) => panic!("Demo {demo} failed to build: {e}"),
        }
    }
}

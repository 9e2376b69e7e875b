//! The simulation: a graph bound to an execution context.
//!
//! [`Simulation`] drives one network through its lifecycle:
//!
//! 1. [`Simulation::update_memory_model`] resolves block sizes.
//! 2. [`Simulation::validate`] checks the graph; errors block the start.
//! 3. [`Simulation::prepare`] allocates memory and initializes tasks.
//! 4. [`Simulation::step`] runs the world node and then every node in
//!    execution order, each node's enabled tasks in declaration order.
//!
//! Editing the graph between steps is allowed. The next step notices the
//! new revision, re-resolves sizes, reallocates what changed and initializes
//! new tasks before running.

use brainflow_foundation::NodeId;
use indexmap::IndexMap;
use tracing::{debug, info, instrument, trace, warn};

use crate::device::ExecutionContext;
use crate::error::{Error, Result};
use crate::graph::Graph;
use crate::kernel::KernelRegistry;
use crate::node::NodeLogic;
use crate::ordering::{ExecutionOrder, HierarchicalOrdering, OrderingAlgorithm};
use crate::resolve::{MemoryModelResolver, ResolutionReport};
use crate::scheduler::SimulationState;
use crate::validation::{ValidationReport, Validator};

/// Message recorded when resolution does not settle.
pub const UNSTABLE_SIZES_MESSAGE: &str = "Possible infinite loop in memory block sizes.";

/// A network ready to be resolved, validated and stepped.
#[derive(Debug)]
pub struct Simulation<N> {
    graph: Graph<N>,
    exec: ExecutionContext,
    kernels: KernelRegistry,
    resolver: MemoryModelResolver,
    order: Option<ExecutionOrder>,
    resolution: Option<ResolutionReport>,
    step: u64,
    prepared: bool,
    prepared_revision: u64,
}

impl<N: NodeLogic> Simulation<N> {
    pub fn new(graph: Graph<N>, exec: ExecutionContext, kernels: KernelRegistry) -> Self {
        Self {
            graph,
            exec,
            kernels,
            resolver: MemoryModelResolver::default(),
            order: None,
            resolution: None,
            step: 0,
            prepared: false,
            prepared_revision: 0,
        }
    }

    pub fn with_resolver(mut self, resolver: MemoryModelResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn graph(&self) -> &Graph<N> {
        &self.graph
    }

    /// Mutable graph access. Structural edits are picked up by the next step.
    pub fn graph_mut(&mut self) -> &mut Graph<N> {
        &mut self.graph
    }

    pub fn exec(&self) -> &ExecutionContext {
        &self.exec
    }

    pub fn exec_mut(&mut self) -> &mut ExecutionContext {
        &mut self.exec
    }

    /// Graph and execution context together, for edits that free memory.
    pub fn parts_mut(&mut self) -> (&mut Graph<N>, &mut ExecutionContext) {
        (&mut self.graph, &mut self.exec)
    }

    pub fn kernels(&self) -> &KernelRegistry {
        &self.kernels
    }

    /// Steps completed since the last prepare.
    pub fn current_step(&self) -> u64 {
        self.step
    }

    /// Memory is allocated and tasks are initialized.
    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    pub fn last_resolution(&self) -> Option<ResolutionReport> {
        self.resolution
    }

    /// The execution order for the current graph revision.
    pub fn execution_order(&mut self) -> Result<&ExecutionOrder> {
        let order = match self.order.take() {
            Some(order) if order.is_current(&self.graph) => order,
            _ => HierarchicalOrdering::expanded().evaluate_order(&self.graph)?,
        };
        Ok(self.order.insert(order))
    }

    /// World node first, then the execution order.
    fn schedule(&mut self) -> Result<Vec<NodeId>> {
        let world = self.graph.world();
        let order = self.execution_order()?;
        Ok(world.into_iter().chain(order.iter()).collect())
    }

    /// Resolve block sizes to a fixed point.
    pub fn update_memory_model(&mut self) -> Result<ResolutionReport> {
        let order = self.execution_order()?.clone();
        let report = self.resolver.resolve(&mut self.graph, &order)?;
        self.resolution = Some(report);
        Ok(report)
    }

    /// Check the graph for errors that prevent a run.
    pub fn validate(&mut self) -> ValidationReport {
        self.validate_with(Validator::new())
    }

    fn validate_with(&mut self, mut validator: Validator) -> ValidationReport {
        let schedule = match self.schedule() {
            Ok(schedule) => schedule,
            Err(Error::CycleDetected { nodes }) => {
                for node in nodes {
                    validator.add_error(Some(node), "Node is part of a dependency cycle.");
                }
                return validator.into_report();
            }
            Err(other) => {
                validator.add_error(None, other.to_string());
                return validator.into_report();
            }
        };

        if self.resolution.is_some_and(|r| !r.stable) {
            validator.add_error(None, UNSTABLE_SIZES_MESSAGE);
        }
        for id in schedule {
            self.validate_node(&mut validator, id);
        }

        let report = validator.into_report();
        debug!(
            errors = report.error_count(),
            warnings = report.warnings().count(),
            "validation finished"
        );
        report
    }

    fn validate_node(&self, validator: &mut Validator, id: NodeId) {
        let (Ok(node), Ok(view)) = (self.graph.node(id), self.graph.view(id)) else {
            validator.add_error(Some(id), "Node vanished during validation.");
            return;
        };

        validator.assert_error(
            self.exec.device(node.device()).is_ok(),
            id,
            format!(
                "Node is placed on {} but only {} device(s) exist.",
                node.device(),
                self.exec.device_count()
            ),
        );

        let mut groups: IndexMap<&str, Vec<&str>> = IndexMap::new();
        for task in node.tasks().iter().filter(|t| t.is_enabled()) {
            if let Some(group) = task.group() {
                groups.entry(group).or_default().push(task.name());
            }
        }
        for (group, enabled) in groups {
            validator.assert_error(
                enabled.len() <= 1,
                id,
                format!(
                    "Tasks {} of group '{group}' are enabled at the same time.",
                    enabled.join(", ")
                ),
            );
        }

        for (index, decl) in view.input_decls().iter().enumerate() {
            if !decl.optional {
                validator.assert_error(
                    view.input(index).is_some(),
                    id,
                    format!("Input '{}' of {} is not connected.", decl.name, node.name()),
                );
            }
        }

        if let Some(logic) = node.logic() {
            logic.validate(validator, &view);
        }
    }

    /// Resolve, validate and, when valid, prepare. The start sequence of a
    /// stopped simulation.
    ///
    /// A failed memory model update discards the previous resolution. Cycles
    /// are reported per node by validation; any other failure becomes a
    /// report error.
    pub fn check_and_prepare(&mut self) -> Result<ValidationReport> {
        let mut validator = Validator::new();
        if let Err(err) = self.update_memory_model() {
            debug!(error = %err, "memory model update failed");
            self.resolution = None;
            if !matches!(err, Error::CycleDetected { .. }) {
                validator.add_error(None, format!("Memory model update failed: {err}"));
            }
        }
        let report = self.validate_with(validator);
        if !report.is_successful() {
            warn!(errors = report.error_count(), "simulation cannot be started, validation failed");
            return Err(Error::ValidationFailed(report));
        }
        self.prepare()?;
        Ok(report)
    }

    /// Allocate every block and initialize every enabled task.
    ///
    /// Memory left over from a previous run is released first.
    #[instrument(skip(self), name = "prepare")]
    pub fn prepare(&mut self) -> Result<()> {
        if self.prepared {
            self.free_memory()?;
        }
        let schedule = self.schedule()?;
        for id in &schedule {
            self.graph.allocate_node(*id, &mut self.exec)?;
        }
        for id in &schedule {
            self.graph.init_node(*id, &mut self.exec, &self.kernels, 0)?;
        }
        self.step = 0;
        self.prepared = true;
        self.prepared_revision = self.graph.revision();
        info!(nodes = schedule.len(), devices = self.exec.device_count(), "simulation prepared");
        Ok(())
    }

    /// Catch up with graph edits made since the last prepare.
    fn refresh_topology(&mut self) -> Result<()> {
        let report = self.update_memory_model()?;
        if !report.stable {
            let mut validator = Validator::new();
            validator.add_error(None, UNSTABLE_SIZES_MESSAGE);
            return Err(Error::ValidationFailed(validator.into_report()));
        }
        let schedule = self.schedule()?;
        for id in &schedule {
            self.graph.allocate_node(*id, &mut self.exec)?;
        }
        for id in &schedule {
            self.graph.init_node(*id, &mut self.exec, &self.kernels, self.step)?;
        }
        self.prepared_revision = self.graph.revision();
        debug!(revision = self.prepared_revision, "topology change applied");
        Ok(())
    }

    /// Run one simulation step. Returns the number of completed steps.
    pub fn step(&mut self) -> Result<u64> {
        if !self.prepared {
            return Err(Error::InvalidState {
                operation: "step",
                state: SimulationState::Stopped,
            });
        }
        if self.graph.revision() != self.prepared_revision {
            self.refresh_topology()?;
        }

        let schedule = self.schedule()?;
        let first_step = self.step == 0;
        for id in schedule {
            self.graph
                .execute_node(id, &mut self.exec, &self.kernels, self.step, first_step)?;
        }
        self.graph.blocks().synchronize_all(&mut self.exec)?;
        self.exec.synchronize_all()?;

        self.step += 1;
        trace!(step = self.step, "step completed");
        Ok(self.step)
    }

    /// Release all memory. Tasks will be initialized again on the next prepare.
    pub fn free_memory(&mut self) -> Result<()> {
        self.graph.free_all(&mut self.exec)?;
        self.prepared = false;
        debug!("simulation memory freed");
        Ok(())
    }

    /// Free memory and rewind the step counter.
    pub fn reset(&mut self) -> Result<()> {
        self.free_memory()?;
        self.step = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use brainflow_foundation::DeviceId;
    use parking_lot::Mutex;

    use super::*;
    use crate::testing::{self, TestGraph};

    fn output_value(sim: &Simulation<testing::Boxed>, node: NodeId) -> f32 {
        let block = sim.graph().output_block(node, 0).unwrap();
        sim.graph()
            .block(block)
            .unwrap()
            .value_at::<f32>(sim.exec(), 0)
            .unwrap()
    }

    #[test]
    fn test_step_requires_prepare() {
        let (graph, _) = testing::chain();
        let mut sim = testing::simulation(graph, 1);
        assert!(matches!(sim.step(), Err(Error::InvalidState { .. })));
    }

    #[test]
    fn test_chain_propagates_within_a_step() {
        let (graph, [a, _, c]) = testing::chain();
        let mut sim = testing::simulation(graph, 1);
        sim.check_and_prepare().unwrap();

        assert_eq!(sim.step().unwrap(), 1);
        assert_eq!(sim.step().unwrap(), 2);

        assert_eq!(output_value(&sim, a), 2.0);
        assert_eq!(output_value(&sim, c), 2.0);
        let resolution = sim.last_resolution().unwrap();
        assert_eq!(resolution.changing_rounds, 1);
    }

    #[test]
    fn test_world_runs_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut graph = TestGraph::new();
        let root = graph.root();
        let first = graph.add_node(root, "First", testing::logged("node", &log)).unwrap();
        let world = graph.set_world("World", testing::logged("world", &log)).unwrap();
        graph.connect(world, 0, first, 0).unwrap();

        let mut sim = testing::simulation(graph, 1);
        sim.check_and_prepare().unwrap();
        log.lock().clear();
        sim.step().unwrap();

        assert_eq!(
            *log.lock(),
            vec!["world.Setup@0", "world.Run@0", "node.Setup@0", "node.Run@0"]
        );
    }

    #[test]
    fn test_one_shot_task_runs_on_first_step_only() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut graph = TestGraph::new();
        let root = graph.root();
        let a = graph.add_node(root, "A", testing::logged("a", &log)).unwrap();
        let b = graph.add_node(root, "B", testing::logged("b", &log)).unwrap();
        graph.connect(a, 0, b, 0).unwrap();

        let mut sim = testing::simulation(graph, 1);
        let report = sim.check_and_prepare().unwrap();
        assert_eq!(report.warnings().count(), 1);
        sim.step().unwrap();
        sim.step().unwrap();

        assert_eq!(
            *log.lock(),
            vec![
                "a.init.Setup",
                "a.init.Run",
                "b.init.Setup",
                "b.init.Run",
                "a.Setup@0",
                "a.Run@0",
                "b.Setup@0",
                "b.Run@0",
                "a.Run@1",
                "b.Run@1",
            ]
        );
    }

    #[test]
    fn test_tasks_initialize_again_after_free() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut graph = TestGraph::new();
        let root = graph.root();
        graph.add_node(root, "A", testing::logged("a", &log)).unwrap();

        let mut sim = testing::simulation(graph, 1);
        sim.check_and_prepare().unwrap();
        sim.reset().unwrap();
        assert!(!sim.is_prepared());
        log.lock().clear();

        sim.check_and_prepare().unwrap();
        assert_eq!(*log.lock(), vec!["a.init.Setup", "a.init.Run"]);
    }

    #[test]
    fn test_exclusive_group_blocks_start() {
        let mut graph = TestGraph::new();
        let root = graph.root();
        let id = graph.add_node(root, "X", testing::exclusive()).unwrap();
        let mut sim = testing::simulation(graph, 1);

        match sim.check_and_prepare() {
            Err(Error::ValidationFailed(report)) => {
                assert!(report.has_error_containing("Tasks Forward, Backward of group 'Mode'"));
            }
            other => panic!("expected validation failure, got {other:?}"),
        }
        assert!(!sim.is_prepared());

        sim.graph_mut().select_task(id, "Forward").unwrap();
        sim.check_and_prepare().unwrap();
    }

    #[test]
    fn test_cycle_reported_per_node() {
        let mut graph = TestGraph::new();
        let root = graph.root();
        let a = graph.add_node(root, "A", testing::mirror()).unwrap();
        let b = graph.add_node(root, "B", testing::mirror()).unwrap();
        graph.connect(a, 0, b, 0).unwrap();
        graph.connect(b, 0, a, 0).unwrap();
        let mut sim = testing::simulation(graph, 1);

        let Err(Error::ValidationFailed(report)) = sim.check_and_prepare() else {
            panic!("cycle must fail validation");
        };
        let nodes: Vec<_> = report.errors().map(|m| m.node).collect();
        assert_eq!(nodes, vec![Some(a), Some(b)]);
    }

    #[test]
    fn test_write_past_block_end_fails_the_step() {
        let mut graph = TestGraph::new();
        let root = graph.root();
        let id = graph.add_node(root, "Writer", testing::overflowing()).unwrap();
        let mut sim = testing::simulation(graph, 1);
        sim.check_and_prepare().unwrap();

        let err = sim.step().unwrap_err();
        assert!(err.to_string().contains("index 2 out of range"), "{err}");
        // The shorter write went through and left the tail alone
        assert_eq!(output_value(&sim, id), 9.0);
        let block = sim.graph().output_block(id, 0).unwrap();
        let tail = sim.graph().block(block).unwrap().value_at::<f32>(sim.exec(), 1);
        assert_eq!(tail.unwrap(), 0.0);
    }

    #[test]
    fn test_failed_resolution_discards_previous_one() {
        let (graph, _) = testing::chain();
        let mut sim = testing::simulation(graph, 1);
        sim.check_and_prepare().unwrap();
        assert!(sim.last_resolution().is_some());

        let root = sim.graph().root();
        let d = sim.graph_mut().add_node(root, "D", testing::mirror()).unwrap();
        let e = sim.graph_mut().add_node(root, "E", testing::mirror()).unwrap();
        sim.graph_mut().connect(d, 0, e, 0).unwrap();
        sim.graph_mut().connect(e, 0, d, 0).unwrap();

        let Err(Error::ValidationFailed(report)) = sim.check_and_prepare() else {
            panic!("cycle must fail validation");
        };
        assert!(sim.last_resolution().is_none());
        assert_eq!(report.error_count(), 2);
        assert!(report.errors().all(|m| m.message.contains("cycle")));
    }

    #[test]
    fn test_node_on_missing_device_fails_validation() {
        let (mut graph, [a, _, _]) = testing::chain();
        graph.set_node_device(a, DeviceId(3)).unwrap();
        let mut sim = testing::simulation(graph, 2);

        let report = sim.validate();
        assert!(report.has_error_containing("only 2 device(s) exist"));
    }

    #[test]
    fn test_nodes_added_between_steps_join_the_run() {
        let (graph, [_, _, c]) = testing::chain();
        let mut sim = testing::simulation(graph, 1);
        sim.check_and_prepare().unwrap();
        sim.step().unwrap();

        let root = sim.graph().root();
        let d = sim.graph_mut().add_node(root, "D", testing::mirror()).unwrap();
        sim.graph_mut().connect(c, 0, d, 0).unwrap();
        sim.step().unwrap();

        assert_eq!(output_value(&sim, d), 2.0);
        assert_eq!(sim.current_step(), 2);
    }

    #[test]
    fn test_removed_nodes_release_memory_between_steps() {
        let (graph, [_, _, c]) = testing::chain();
        let mut sim = testing::simulation(graph, 1);
        sim.check_and_prepare().unwrap();
        sim.step().unwrap();
        let before = sim.exec().device(DeviceId(0)).unwrap().allocation_count();

        let (graph, exec) = sim.parts_mut();
        graph.remove_node(c, exec).unwrap();
        sim.step().unwrap();

        let after = sim.exec().device(DeviceId(0)).unwrap().allocation_count();
        assert_eq!(after, before - 1);
    }

    #[test]
    fn test_peer_replicas_lag_until_synchronized() {
        let (mut graph, [a, b, _]) = testing::chain();
        graph.set_node_device(b, DeviceId(1)).unwrap();
        let mut sim = testing::simulation(graph, 2);
        sim.check_and_prepare().unwrap();

        sim.step().unwrap();
        assert_eq!(output_value(&sim, b), 1.0);

        // B reads A's replica on device 1, refreshed at the end of each step
        sim.step().unwrap();
        assert_eq!(output_value(&sim, a), 2.0);
        assert_eq!(output_value(&sim, b), 1.0);

        let block = sim.graph().output_block(a, 0).unwrap();
        let block = sim.graph().block(block).unwrap();
        assert!(block.is_shared());
        assert!(block.replicas().peer(DeviceId(1)).is_some());
    }

    #[test]
    fn test_unstable_sizes_stop_a_running_graph() {
        let (graph, [_, _, c]) = testing::chain();
        let mut sim = testing::simulation(graph, 1);
        sim.check_and_prepare().unwrap();

        let root = sim.graph().root();
        sim.graph_mut().add_node(root, "Osc", testing::oscillator()).unwrap();
        let Err(Error::ValidationFailed(report)) = sim.step() else {
            panic!("unsettled sizes must fail the step");
        };
        assert!(report.has_error_containing(UNSTABLE_SIZES_MESSAGE));
        assert!(sim.graph().contains(c));
    }
}

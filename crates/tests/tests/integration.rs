//! Integration tests for end-to-end Brainflow execution.
//!
//! These tests verify the full pipeline:
//! Build graph → Resolve → Validate → Prepare → Step → Verify

use std::thread;
use std::time::Duration;

use brainflow_nodes::{
    AbsoluteValue, BuiltinNode, GenerateType, GeneratedInput, Reduction, ScalarToSdr, UserInput,
    UserInputConfig,
};
use brainflow_runtime::{
    DeviceId, ElementType, Error, NodeDecl, NodeLogic, Result, SimulationState, SizingContext,
    Task, TaskContext, UNSTABLE_SIZES_MESSAGE,
};
use brainflow_tests::TestHarness;
use brainflow_tools::Demo;

type Harness = TestHarness<BuiltinNode>;

fn user_data(values: &str) -> BuiltinNode {
    GeneratedInput::user_data(values).unwrap().into()
}

fn step_counter() -> BuiltinNode {
    GeneratedInput::new(GenerateType::SimulationStep, 1).into()
}

/// Output size flips between 1 and 2 on every resolution pass.
struct Oscillator {
    high: bool,
}

impl NodeLogic for Oscillator {
    fn kind(&self) -> &'static str {
        "Oscillator"
    }

    fn declare(&self) -> NodeDecl {
        NodeDecl::new().output("Output", ElementType::F32)
    }

    fn update_memory_blocks(&mut self, sizing: &mut SizingContext<'_>) {
        self.high = !self.high;
        sizing.set_count(0, if self.high { 2 } else { 1 });
    }

    fn execute_task(&mut self, _task: &Task, _ctx: &mut TaskContext<'_>) -> Result<()> {
        Ok(())
    }
}

/// Test that a chain of mirroring nodes settles in one changing round.
///
/// Chain: A (4 fixed) → B (mirrors A) → C (mirrors B)
#[test]
fn test_chain_resolves_in_one_round() {
    let harness = Harness::build(1, |graph| {
        let root = graph.root();
        let a = graph
            .add_node(root, "A", GeneratedInput::new(GenerateType::Linear, 4).into())
            .unwrap();
        let b = graph.add_node(root, "B", AbsoluteValue::new().into()).unwrap();
        let c = graph.add_node(root, "C", AbsoluteValue::new().into()).unwrap();
        graph.connect(a, 0, b, 0).unwrap();
        graph.connect(b, 0, c, 0).unwrap();
    });

    let (report, order) = harness.with_simulation(|sim| {
        let report = sim.update_memory_model().unwrap();
        let order = sim.execution_order().unwrap().nodes().to_vec();
        (report, order)
    });

    assert!(report.stable);
    assert_eq!(report.changing_rounds, 1);
    assert_eq!(order, vec![harness.node("A"), harness.node("B"), harness.node("C")]);
    assert_eq!(harness.count("B", 0), 4);
    assert_eq!(harness.count("C", 0), 4);
}

/// Test that the execution order contains every node once and respects
/// every connection, whatever the declaration order.
#[test]
fn test_ordering_respects_every_edge() {
    let harness = Harness::build(1, |graph| {
        let root = graph.root();
        // Consumers declared before their producers
        let sum = graph.add_node(root, "Sum", Reduction::default().into()).unwrap();
        let second = graph.add_node(root, "Second", AbsoluteValue::new().into()).unwrap();
        let first = graph.add_node(root, "First", AbsoluteValue::new().into()).unwrap();
        let extra = graph.add_node(root, "Extra", Reduction::default().into()).unwrap();
        let source = graph.add_node(root, "Source", user_data("1 -2")).unwrap();
        graph.connect(source, 0, first, 0).unwrap();
        graph.connect(first, 0, second, 0).unwrap();
        graph.connect(second, 0, sum, 0).unwrap();
        graph.connect(source, 0, extra, 0).unwrap();
    });

    harness.with_simulation(|sim| {
        let order = sim.execution_order().unwrap().clone();
        let working: Vec<_> = sim.graph().working_nodes().collect();
        assert_eq!(order.len(), working.len());
        for id in &working {
            assert_eq!(order.iter().filter(|n| n == id).count(), 1);
        }
        for connection in sim.graph().connections() {
            assert!(order.position(connection.from) < order.position(connection.to));
        }
    });
}

/// Test that a dependency cycle is rejected before anything runs.
#[test]
fn test_cycle_blocks_start() {
    let mut harness = Harness::build(1, |graph| {
        let root = graph.root();
        let a = graph.add_node(root, "A", AbsoluteValue::new().into()).unwrap();
        let b = graph.add_node(root, "B", AbsoluteValue::new().into()).unwrap();
        graph.connect(a, 0, b, 0).unwrap();
        graph.connect(b, 0, a, 0).unwrap();
    });

    let Err(Error::ValidationFailed(report)) = harness.try_step() else {
        panic!("cycle was not rejected");
    };
    assert_eq!(report.error_count(), 2);
    assert!(report.has_error_containing("dependency cycle"));
    assert_eq!(harness.state(), SimulationState::Stopped);
    assert_eq!(harness.current_step(), 0);
}

/// Test that oscillating sizes are reported instead of looping forever.
#[test]
fn test_oscillating_sizes_are_unstable() {
    let mut harness = TestHarness::<Box<dyn NodeLogic>>::build(1, |graph| {
        let root = graph.root();
        graph
            .add_node(root, "Osc", Box::new(Oscillator { high: false }))
            .unwrap();
    });

    let Err(Error::ValidationFailed(report)) = harness.try_step() else {
        panic!("unstable sizes were not rejected");
    };
    assert!(report.has_error_containing(UNSTABLE_SIZES_MESSAGE));

    let resolution = harness.with_simulation(|sim| sim.last_resolution()).unwrap();
    assert!(!resolution.stable);
    assert_eq!(resolution.passes, 20);
}

/// Test that bytes written into a block read back unchanged.
#[test]
fn test_fill_bytes_round_trip() {
    let mut harness = Harness::build(1, |graph| {
        let root = graph.root();
        graph.add_node(root, "Data", user_data("1 2 3")).unwrap();
    });
    harness.step();
    let node = harness.node("Data");

    let bytes: Vec<u8> = (0..12u8).map(|b| b.wrapping_mul(37)).collect();
    let read = harness.with_simulation(|sim| {
        let (graph, exec) = sim.parts_mut();
        let id = graph.output_block(node, 0).unwrap();
        let block = graph.blocks_mut().get_mut(id).unwrap();
        block.fill_bytes(exec, &bytes).unwrap();
        let mut read = vec![0u8; bytes.len()];
        block.get_bytes(exec, &mut read).unwrap();
        read
    });
    assert_eq!(read, bytes);
}

/// Test that a peer replica equals the owner when acquired and follows
/// the owner after synchronize.
#[test]
fn test_peer_replica_follows_owner() {
    let mut harness = Harness::build(2, |graph| {
        let root = graph.root();
        graph.add_node(root, "Data", user_data("1 2 3")).unwrap();
    });
    harness.step();
    let node = harness.node("Data");

    harness.with_simulation(|sim| {
        let (graph, exec) = sim.parts_mut();
        let id = graph.output_block(node, 0).unwrap();
        let block = graph.blocks_mut().get_mut(id).unwrap();

        let peer = block.get_device(exec, DeviceId(1)).unwrap().unwrap();
        assert_eq!(peer.device(), DeviceId(1));
        assert_eq!(exec.view::<f32>(peer, 3).unwrap(), &[1.0, 2.0, 3.0]);

        block.fill(exec, 7.0f32).unwrap();
        assert_eq!(exec.view::<f32>(peer, 3).unwrap(), &[1.0, 2.0, 3.0]);

        block.synchronize(exec).unwrap();
        assert_eq!(exec.view::<f32>(peer, 3).unwrap(), &[7.0, 7.0, 7.0]);
    });
}

/// Test that a one-step start from STOPPED runs exactly one step and pauses.
#[test]
fn test_one_step_from_stopped() {
    let mut harness = Harness::build(1, |graph| {
        let root = graph.root();
        graph.add_node(root, "Counter", step_counter()).unwrap();
    });
    assert_eq!(harness.state(), SimulationState::Stopped);

    harness.step();
    assert_eq!(harness.state(), SimulationState::Paused);
    assert_eq!(harness.current_step(), 1);
    assert_eq!(harness.values("Counter"), vec![0.0]);
}

/// Test that two enabled tasks of one group block the start.
#[test]
fn test_exclusive_task_group_blocks_start() {
    let mut harness = Harness::build(1, |graph| {
        let root = graph.root();
        let data = graph.add_node(root, "Data", user_data("0.5")).unwrap();
        let sdr = graph.add_node(root, "SDR", ScalarToSdr::default().into()).unwrap();
        graph.connect(data, 0, sdr, 0).unwrap();
        graph.set_task_enabled(sdr, "Decode", true).unwrap();
    });

    let Err(Error::ValidationFailed(report)) = harness.try_step() else {
        panic!("task group violation was not rejected");
    };
    assert!(report.has_error_containing("group 'Mode'"));
    assert_eq!(harness.state(), SimulationState::Stopped);

    // Selecting one task resolves it
    let sdr = harness.node("SDR");
    harness.with_simulation(|sim| sim.graph_mut().select_task(sdr, "Encode").unwrap());
    harness.step();
    assert_eq!(harness.count("SDR", 0), 1024);
}

/// Test that stop halts stepping and keeps the last completed step's values.
#[test]
fn test_stop_keeps_last_completed_step() {
    let mut harness = Harness::build(1, |graph| {
        let root = graph.root();
        graph.add_node(root, "Counter", step_counter()).unwrap();
    });

    harness.run_until(5);
    harness.stop();
    assert_eq!(harness.state(), SimulationState::Stopped);

    let steps = harness.current_step();
    assert!(steps >= 5);
    // The counter writes the zero-based index of the step it ran in
    assert_eq!(harness.values("Counter"), vec![(steps - 1) as f64]);

    thread::sleep(Duration::from_millis(20));
    assert_eq!(harness.current_step(), steps);
}

/// Test that reset rewinds the run and the next start begins at step 0.
#[test]
fn test_reset_rewinds_run() {
    let mut harness = Harness::build(1, |graph| {
        let root = graph.root();
        graph.add_node(root, "Counter", step_counter()).unwrap();
    });
    harness.run_steps(3);
    assert!(harness.handler().reset().is_err());

    harness.stop();
    harness.handler().reset().unwrap();
    assert_eq!(harness.current_step(), 0);
    assert!(!harness.with_simulation(|sim| sim.is_prepared()));

    harness.step();
    assert_eq!(harness.values("Counter"), vec![0.0]);
}

/// Test that nodes added while paused join the run at the next step.
#[test]
fn test_node_added_while_paused() {
    let mut harness = Harness::build(1, |graph| {
        let root = graph.root();
        graph.add_node(root, "Data", user_data("-1 -2")).unwrap();
    });
    harness.run_steps(2);

    let data = harness.node("Data");
    harness.with_simulation(|sim| {
        let graph = sim.graph_mut();
        let abs = graph
            .add_node(graph.root(), "Abs", AbsoluteValue::new().into())
            .unwrap();
        graph.connect(data, 0, abs, 0).unwrap();
    });

    harness.step();
    assert_eq!(harness.current_step(), 3);
    assert_eq!(harness.values("Abs"), vec![1.0, 2.0]);
}

/// Test that a user input handle steers a paused simulation.
#[test]
fn test_user_input_between_steps() {
    let node = UserInput::new(UserInputConfig {
        output_size: 2,
        min_value: 0.0,
        max_value: 10.0,
        convert_to_binary: false,
    });
    let handle = node.handle();
    let mut harness = Harness::build(1, |graph| {
        let root = graph.root();
        graph.add_node(root, "Sliders", node.into()).unwrap();
    });

    harness.step();
    assert_eq!(harness.values("Sliders"), vec![0.0, 0.0]);

    handle.set(0, 0.5);
    handle.set(1, 1.0);
    harness.step();
    assert_eq!(harness.values("Sliders"), vec![5.0, 10.0]);
}

/// Test that every demo network runs through the scheduler on two devices.
#[test]
fn test_demo_networks_run() {
    for demo in Demo::ALL {
        let mut harness = Harness::demo(demo, 2);
        harness.run_steps(5);
        assert_eq!(harness.current_step(), 5, "demo {demo}");
        assert!(harness.handler().last_error().is_none());
    }
}

//! Small simulations around built-in nodes.

use brainflow_runtime::{ExecutionContext, Graph, NodeId, Simulation};

use crate::BuiltinNode;
use crate::kernels::kernel_registry;

pub(crate) type TestSimulation = Simulation<BuiltinNode>;

fn simulation(graph: Graph<BuiltinNode>) -> TestSimulation {
    Simulation::new(graph, ExecutionContext::with_devices(2), kernel_registry())
}

/// One node under the root on device 0.
pub(crate) fn single(node: impl Into<BuiltinNode>) -> (TestSimulation, NodeId) {
    let mut graph = Graph::new();
    let id = graph.add_node(graph.root(), "Node", node.into()).unwrap();
    (simulation(graph), id)
}

/// `source -> sink`, both under the root.
pub(crate) fn pipeline(
    source: impl Into<BuiltinNode>,
    sink: impl Into<BuiltinNode>,
) -> (TestSimulation, NodeId, NodeId) {
    let mut graph = Graph::new();
    let root = graph.root();
    let source = graph.add_node(root, "Source", source.into()).unwrap();
    let sink = graph.add_node(root, "Sink", sink.into()).unwrap();
    graph.connect(source, 0, sink, 0).unwrap();
    (simulation(graph), source, sink)
}

pub(crate) fn prepared(sim: &mut TestSimulation) {
    let report = sim.check_and_prepare().unwrap();
    assert!(report.is_successful(), "{report}");
}

/// Elements of `node`'s block `index`, read from its device.
pub(crate) fn output(sim: &TestSimulation, node: NodeId, index: usize) -> Vec<f32> {
    let graph = sim.graph();
    let block = graph.block(graph.output_block(node, index).unwrap()).unwrap();
    (0..block.count())
        .map(|i| block.value_at::<f32>(sim.exec(), i).unwrap())
        .collect()
}

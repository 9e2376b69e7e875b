//! Small node types shared by the unit tests.

use std::sync::Arc;

use brainflow_foundation::{ElementType, NodeId};
use parking_lot::Mutex;

use crate::device::ExecutionContext;
use crate::error::{Error, Result};
use crate::graph::Graph;
use crate::kernel::KernelRegistry;
use crate::node::{NodeDecl, NodeLogic, NodeView, SizingContext, TaskContext};
use crate::simulation::Simulation;
use crate::task::{Task, TaskDecl};
use crate::validation::Validator;

pub(crate) type Boxed = Box<dyn NodeLogic>;
pub(crate) type TestGraph = Graph<Boxed>;

/// Fixed-size output filled with `step + 1` every step.
pub(crate) struct Source {
    pub count: usize,
    pub column_hint: usize,
}

impl NodeLogic for Source {
    fn kind(&self) -> &'static str {
        "Source"
    }

    fn declare(&self) -> NodeDecl {
        NodeDecl::new()
            .output("Output", ElementType::F32)
            .task(TaskDecl::new("Generate"))
    }

    fn update_memory_blocks(&mut self, sizing: &mut SizingContext<'_>) {
        sizing.set_count(0, self.count);
        sizing.set_column_hint(0, self.column_hint);
    }

    fn execute_task(&mut self, _task: &Task, ctx: &mut TaskContext<'_>) -> Result<()> {
        let values = vec![ctx.step() as f32 + 1.0; ctx.block(0)?.count()];
        ctx.write_block(0, &values)
    }
}

/// Output mirrors the input's size and contents.
pub(crate) struct Mirror;

impl NodeLogic for Mirror {
    fn kind(&self) -> &'static str {
        "Mirror"
    }

    fn declare(&self) -> NodeDecl {
        NodeDecl::new()
            .input("Input")
            .output("Output", ElementType::F32)
            .task(TaskDecl::new("Copy"))
    }

    fn update_memory_blocks(&mut self, sizing: &mut SizingContext<'_>) {
        let (count, column_hint) = (sizing.input_count(0), sizing.input_column_hint(0));
        sizing.set_count(0, count);
        sizing.set_column_hint(0, column_hint);
    }

    fn execute_task(&mut self, _task: &Task, ctx: &mut TaskContext<'_>) -> Result<()> {
        let count = ctx.input_count(0);
        ctx.copy_input_to_block(0, 0, count)
    }
}

/// Flips its output size on every resolution pass.
pub(crate) struct Oscillator {
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

/// Every execution fails.
pub(crate) struct Failing;

impl NodeLogic for Failing {
    fn kind(&self) -> &'static str {
        "Failing"
    }

    fn declare(&self) -> NodeDecl {
        NodeDecl::new().task(TaskDecl::new("Explode"))
    }

    fn update_memory_blocks(&mut self, _sizing: &mut SizingContext<'_>) {}

    fn execute_task(&mut self, _task: &Task, _ctx: &mut TaskContext<'_>) -> Result<()> {
        Err(Error::KernelArgument {
            kernel: "Test/Explode".to_string(),
            message: "boom".to_string(),
        })
    }
}

/// Writes one value more than its two-element output holds.
pub(crate) struct Overflowing;

impl NodeLogic for Overflowing {
    fn kind(&self) -> &'static str {
        "Overflowing"
    }

    fn declare(&self) -> NodeDecl {
        NodeDecl::new()
            .output("Output", ElementType::F32)
            .task(TaskDecl::new("Write"))
    }

    fn update_memory_blocks(&mut self, sizing: &mut SizingContext<'_>) {
        sizing.set_count(0, 2);
    }

    fn execute_task(&mut self, _task: &Task, ctx: &mut TaskContext<'_>) -> Result<()> {
        ctx.write_block(0, &[9.0f32])?;
        ctx.write_block(0, &[1.0f32, 2.0, 3.0])
    }
}

/// Two tasks of one group, both enabled by default.
pub(crate) struct Exclusive;

impl NodeLogic for Exclusive {
    fn kind(&self) -> &'static str {
        "Exclusive"
    }

    fn declare(&self) -> NodeDecl {
        NodeDecl::new()
            .output("Output", ElementType::F32)
            .task(TaskDecl::new("Forward").in_group("Mode"))
            .task(TaskDecl::new("Backward").in_group("Mode"))
    }

    fn update_memory_blocks(&mut self, sizing: &mut SizingContext<'_>) {
        sizing.set_count(0, 1);
    }

    fn execute_task(&mut self, _task: &Task, _ctx: &mut TaskContext<'_>) -> Result<()> {
        Ok(())
    }
}

/// Records init and execute calls into a shared log.
pub(crate) struct Logged {
    pub label: &'static str,
    pub log: Arc<Mutex<Vec<String>>>,
}

impl NodeLogic for Logged {
    fn kind(&self) -> &'static str {
        "Logged"
    }

    fn declare(&self) -> NodeDecl {
        NodeDecl::new()
            .optional_input("Input")
            .output("Output", ElementType::F32)
            .task(TaskDecl::new("Setup").one_shot())
            .task(TaskDecl::new("Run"))
    }

    fn update_memory_blocks(&mut self, sizing: &mut SizingContext<'_>) {
        sizing.set_count(0, 1);
    }

    fn validate(&self, validator: &mut Validator, view: &NodeView<'_>) {
        validator.assert_warning(view.input(0).is_some(), view.id(), "Input is not connected.");
    }

    fn init_task(&mut self, task: &Task, _ctx: &mut TaskContext<'_>) -> Result<()> {
        self.log.lock().push(format!("{}.init.{}", self.label, task.name()));
        Ok(())
    }

    fn execute_task(&mut self, task: &Task, ctx: &mut TaskContext<'_>) -> Result<()> {
        self.log
            .lock()
            .push(format!("{}.{}@{}", self.label, task.name(), ctx.step()));
        Ok(())
    }
}

pub(crate) fn source(count: usize) -> Boxed {
    Box::new(Source {
        count,
        column_hint: 1,
    })
}

pub(crate) fn mirror() -> Boxed {
    Box::new(Mirror)
}

pub(crate) fn oscillator() -> Boxed {
    Box::new(Oscillator { high: false })
}

pub(crate) fn failing() -> Boxed {
    Box::new(Failing)
}

pub(crate) fn overflowing() -> Boxed {
    Box::new(Overflowing)
}

pub(crate) fn exclusive() -> Boxed {
    Box::new(Exclusive)
}

pub(crate) fn logged(label: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Boxed {
    Box::new(Logged {
        label,
        log: Arc::clone(log),
    })
}

/// `A -> B -> C` with A producing four elements.
pub(crate) fn chain() -> (TestGraph, [NodeId; 3]) {
    let mut graph = TestGraph::new();
    let root = graph.root();
    let a = graph.add_node(root, "A", source(4)).unwrap();
    let b = graph.add_node(root, "B", mirror()).unwrap();
    let c = graph.add_node(root, "C", mirror()).unwrap();
    graph.connect(a, 0, b, 0).unwrap();
    graph.connect(b, 0, c, 0).unwrap();
    (graph, [a, b, c])
}

pub(crate) fn simulation(graph: TestGraph, devices: usize) -> Simulation<Boxed> {
    Simulation::new(graph, ExecutionContext::with_devices(devices), KernelRegistry::new())
}

//! World nodes run before every other node in a step.

use brainflow_runtime::{
    ElementType, NodeDecl, NodeLogic, Result, SizingContext, Task, TaskContext, TaskDecl,
};

/// Publishes the current step number.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClockWorld;

impl NodeLogic for ClockWorld {
    fn kind(&self) -> &'static str {
        "ClockWorld"
    }

    fn declare(&self) -> NodeDecl {
        NodeDecl::new()
            .output("Step", ElementType::F32)
            .task(TaskDecl::new("Tick"))
    }

    fn update_memory_blocks(&mut self, sizing: &mut SizingContext<'_>) {
        sizing.set_count(0, 1);
    }

    fn execute_task(&mut self, _task: &Task, ctx: &mut TaskContext<'_>) -> Result<()> {
        let step = ctx.step() as f32;
        ctx.write_block(0, &[step])
    }
}

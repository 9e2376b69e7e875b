//! The node capability contract and the contexts handed to node code.
//!
//! A working node is anything implementing [`NodeLogic`]. The runtime calls
//! it in four situations:
//!
//! 1. **Creation**: [`NodeLogic::declare`] lists inputs, memory blocks and tasks.
//! 2. **Resolution**: [`NodeLogic::update_memory_blocks`] recomputes block
//!    sizes from the input sizes, repeatedly, until nothing changes.
//! 3. **Validation**: [`NodeLogic::validate`] adds node-specific checks on
//!    top of the required-input and task-group checks every node gets.
//! 4. **Execution**: [`NodeLogic::init_task`] once per device context, then
//!    [`NodeLogic::execute_task`] every step, for each enabled task in
//!    declaration order.
//!
//! Node code never sees the graph. It reaches its own blocks and the blocks
//! feeding its inputs through the context it is handed.

use brainflow_foundation::{BlockId, DeviceId, Element, ElementType, NodeId};

use crate::device::{DevicePtr, ExecutionContext};
use crate::error::{Error, Result};
use crate::kernel::{Kernel, KernelArg, KernelRegistry};
use crate::memory::{BlockSpec, BlockStore, MemoryBlock};
use crate::task::{Task, TaskDecl};
use crate::validation::Validator;

/// Declaration of one input slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputDecl {
    pub name: String,
    /// Validation does not require a connection.
    pub optional: bool,
}

/// Everything a node type exposes to the graph.
#[derive(Debug, Clone, Default)]
pub struct NodeDecl {
    pub inputs: Vec<InputDecl>,
    pub blocks: Vec<BlockSpec>,
    pub tasks: Vec<TaskDecl>,
}

impl NodeDecl {
    pub fn new() -> Self {
        Self::default()
    }

    /// A required input.
    pub fn input(mut self, name: impl Into<String>) -> Self {
        self.inputs.push(InputDecl {
            name: name.into(),
            optional: false,
        });
        self
    }

    pub fn optional_input(mut self, name: impl Into<String>) -> Self {
        self.inputs.push(InputDecl {
            name: name.into(),
            optional: true,
        });
        self
    }

    /// An output block other nodes can connect to.
    pub fn output(mut self, name: impl Into<String>, element: ElementType) -> Self {
        self.blocks.push(BlockSpec::new(name, element));
        self
    }

    /// A working block private to the node.
    pub fn hidden(mut self, name: impl Into<String>, element: ElementType) -> Self {
        let mut spec = BlockSpec::new(name, element);
        spec.is_output = false;
        self.blocks.push(spec);
        self
    }

    pub fn block(mut self, spec: BlockSpec) -> Self {
        self.blocks.push(spec);
        self
    }

    pub fn task(mut self, task: TaskDecl) -> Self {
        self.tasks.push(task);
        self
    }
}

/// Behaviour of a working node.
pub trait NodeLogic: Send + 'static {
    /// Type name shown in logs and validation messages.
    fn kind(&self) -> &'static str;

    /// Inputs, blocks and tasks of this node. Called once, at creation.
    fn declare(&self) -> NodeDecl;

    /// Recompute the sizes of the node's blocks.
    ///
    /// Must be a pure function of input sizes and node configuration; the
    /// resolver calls it until no size changes.
    fn update_memory_blocks(&mut self, sizing: &mut SizingContext<'_>);

    /// Node-specific validation.
    fn validate(&self, _validator: &mut Validator, _view: &NodeView<'_>) {}

    /// Prepare `task` for the node's current device.
    fn init_task(&mut self, _task: &Task, _ctx: &mut TaskContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Run `task` for one simulation step.
    fn execute_task(&mut self, task: &Task, ctx: &mut TaskContext<'_>) -> Result<()>;
}

impl<T: NodeLogic + ?Sized> NodeLogic for Box<T> {
    fn kind(&self) -> &'static str {
        (**self).kind()
    }

    fn declare(&self) -> NodeDecl {
        (**self).declare()
    }

    fn update_memory_blocks(&mut self, sizing: &mut SizingContext<'_>) {
        (**self).update_memory_blocks(sizing)
    }

    fn validate(&self, validator: &mut Validator, view: &NodeView<'_>) {
        (**self).validate(validator, view)
    }

    fn init_task(&mut self, task: &Task, ctx: &mut TaskContext<'_>) -> Result<()> {
        (**self).init_task(task, ctx)
    }

    fn execute_task(&mut self, task: &Task, ctx: &mut TaskContext<'_>) -> Result<()> {
        (**self).execute_task(task, ctx)
    }
}

// ============================================================================
// Sizing
// ============================================================================

/// Block access during memory-model resolution.
pub struct SizingContext<'a> {
    pub(crate) node: NodeId,
    pub(crate) blocks: &'a mut BlockStore,
    pub(crate) inputs: &'a [Option<BlockId>],
    pub(crate) own: &'a [BlockId],
    pub(crate) tasks: &'a [Task],
}

impl SizingContext<'_> {
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// The block feeding input `index`, if connected.
    pub fn input(&self, index: usize) -> Option<&MemoryBlock> {
        let id = (*self.inputs.get(index)?)?;
        self.blocks.get(id).ok()
    }

    /// Element count of input `index`, zero when unconnected.
    pub fn input_count(&self, index: usize) -> usize {
        self.input(index).map_or(0, MemoryBlock::count)
    }

    /// Column hint of input `index`, one when unconnected.
    pub fn input_column_hint(&self, index: usize) -> usize {
        self.input(index).map_or(1, MemoryBlock::column_hint)
    }

    pub fn block(&self, index: usize) -> Option<&MemoryBlock> {
        self.blocks.get(*self.own.get(index)?).ok()
    }

    pub fn block_mut(&mut self, index: usize) -> Option<&mut MemoryBlock> {
        self.blocks.get_mut(*self.own.get(index)?).ok()
    }

    /// Set the element count of the node's block `index`.
    pub fn set_count(&mut self, index: usize, count: usize) {
        if let Some(block) = self.block_mut(index) {
            block.set_count(count);
        }
    }

    pub fn set_column_hint(&mut self, index: usize, column_hint: usize) {
        if let Some(block) = self.block_mut(index) {
            block.set_column_hint(column_hint);
        }
    }

    /// Whether the task named `name` is enabled.
    pub fn task_enabled(&self, name: &str) -> bool {
        self.tasks
            .iter()
            .any(|task| task.name() == name && task.is_enabled())
    }
}

// ============================================================================
// Validation view
// ============================================================================

/// Read-only view of a node for validation.
pub struct NodeView<'a> {
    pub(crate) id: NodeId,
    pub(crate) name: &'a str,
    pub(crate) device: DeviceId,
    pub(crate) input_decls: &'a [InputDecl],
    pub(crate) inputs: Vec<Option<&'a MemoryBlock>>,
    pub(crate) blocks: Vec<&'a MemoryBlock>,
    pub(crate) tasks: &'a [Task],
}

impl<'a> NodeView<'a> {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        self.name
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn input_decls(&self) -> &[InputDecl] {
        self.input_decls
    }

    pub fn input(&self, index: usize) -> Option<&'a MemoryBlock> {
        self.inputs.get(index).copied().flatten()
    }

    pub fn block(&self, index: usize) -> Option<&'a MemoryBlock> {
        self.blocks.get(index).copied()
    }

    pub fn tasks(&self) -> &[Task] {
        self.tasks
    }

    pub fn task(&self, name: &str) -> Option<&Task> {
        self.tasks.iter().find(|task| task.name() == name)
    }
}

// ============================================================================
// Execution
// ============================================================================

/// Device, block and kernel access while a task runs.
pub struct TaskContext<'a> {
    pub(crate) node: NodeId,
    pub(crate) device: DeviceId,
    pub(crate) step: u64,
    pub(crate) blocks: &'a mut BlockStore,
    pub(crate) exec: &'a mut ExecutionContext,
    pub(crate) kernels: &'a KernelRegistry,
    pub(crate) inputs: &'a [Option<BlockId>],
    pub(crate) own: &'a [BlockId],
}

impl TaskContext<'_> {
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Device the node runs on.
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Zero-based index of the step being executed.
    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn exec(&mut self) -> &mut ExecutionContext {
        &mut *self.exec
    }

    /// Acquire a kernel bound to the node's device.
    pub fn kernel(&self, module: &str, name: &str) -> Result<Kernel> {
        self.kernels.acquire(self.device, module, name)
    }

    /// Launch `kernel` with `args`.
    pub fn run(&mut self, kernel: &Kernel, args: &[KernelArg]) -> Result<()> {
        kernel.run(self.exec, args)
    }

    pub fn input_id(&self, index: usize) -> Option<BlockId> {
        self.inputs.get(index).copied().flatten()
    }

    pub fn block_id(&self, index: usize) -> Result<BlockId> {
        self.own.get(index).copied().ok_or_else(|| Error::TaskFailed {
            node: self.node,
            task: String::new(),
            message: format!("node has no block {index}"),
        })
    }

    pub fn input(&self, index: usize) -> Option<&MemoryBlock> {
        self.blocks.get(self.input_id(index)?).ok()
    }

    pub fn input_count(&self, index: usize) -> usize {
        self.input(index).map_or(0, MemoryBlock::count)
    }

    pub fn block(&self, index: usize) -> Result<&MemoryBlock> {
        self.blocks.get(self.block_id(index)?)
    }

    pub fn block_mut(&mut self, index: usize) -> Result<&mut MemoryBlock> {
        let id = self.block_id(index)?;
        self.blocks.get_mut(id)
    }

    fn connected_input(&self, index: usize) -> Result<BlockId> {
        self.input_id(index).ok_or_else(|| Error::TaskFailed {
            node: self.node,
            task: String::new(),
            message: format!("input {index} is not connected"),
        })
    }

    /// Pointer to input `index` on this node's device, creating a peer
    /// replica when the producer lives elsewhere.
    pub fn input_ptr(&mut self, index: usize) -> Result<DevicePtr> {
        let id = self.connected_input(index)?;
        let block = self.blocks.get_mut(id)?;
        block
            .get_device(self.exec, self.device)?
            .ok_or_else(|| Error::NotAllocated {
                block: block.name().to_string(),
                location: self.device.to_string(),
            })
    }

    /// Owner-replica pointer of the node's block `index`.
    pub fn block_ptr(&mut self, index: usize) -> Result<DevicePtr> {
        let device = self.device;
        let block = self.block_mut(index)?;
        block.device_ptr().ok_or_else(|| Error::NotAllocated {
            block: block.name().to_string(),
            location: device.to_string(),
        })
    }

    /// Copy input `index` to the host and return its elements.
    pub fn read_input<T: Element>(&mut self, index: usize) -> Result<Vec<T>> {
        let id = self.connected_input(index)?;
        let block = self.blocks.get_mut(id)?;
        block.safe_copy_to_host(&*self.exec)?;
        Ok(block.host::<T>()?.to_vec())
    }

    /// Copy the node's block `index` to the host and return its elements.
    pub fn read_block<T: Element>(&mut self, index: usize) -> Result<Vec<T>> {
        let id = self.block_id(index)?;
        let block = self.blocks.get_mut(id)?;
        block.safe_copy_to_host(&*self.exec)?;
        Ok(block.host::<T>()?.to_vec())
    }

    /// Mutable host copy of the node's block `index`.
    pub fn host_mut<T: Element>(&mut self, index: usize) -> Result<&mut [T]> {
        self.block_mut(index)?.host_mut::<T>()
    }

    /// Push the host copy of block `index` to its device replica.
    pub fn copy_to_device(&mut self, index: usize) -> Result<bool> {
        let id = self.block_id(index)?;
        self.blocks.get_mut(id)?.safe_copy_to_device(self.exec)
    }

    /// Overwrite the first `values.len()` elements of block `index` and push
    /// the block to the device.
    ///
    /// Elements past the end of `values` keep their previous contents. More
    /// values than the block holds is an error.
    pub fn write_block<T: Element>(&mut self, index: usize, values: &[T]) -> Result<()> {
        let block = self.block(index)?;
        if values.len() > block.count() {
            return Err(Error::IndexOutOfRange {
                block: block.name().to_string(),
                index: values.len() - 1,
                count: block.count(),
            });
        }
        self.host_mut::<T>(index)?[..values.len()].copy_from_slice(values);
        self.copy_to_device(index)?;
        Ok(())
    }

    pub fn fill<T: Element>(&mut self, index: usize, value: T) -> Result<()> {
        let id = self.block_id(index)?;
        self.blocks.get_mut(id)?.fill(self.exec, value)
    }

    /// Element `i` of the node's block `index`, read from the device.
    pub fn value_at<T: Element>(&self, index: usize, i: usize) -> Result<T> {
        self.block(index)?.value_at(&*self.exec, i)
    }

    /// Copy `count` elements of input `input` into the node's block `index`.
    pub fn copy_input_to_block(&mut self, input: usize, index: usize, count: usize) -> Result<()> {
        let src = self.connected_input(input)?;
        let dst = self.block_id(index)?;
        if count == 0 {
            return Ok(());
        }
        let (source, target) = self.blocks.pair_mut(src, dst)?;
        target.copy_from_block(self.exec, source, 0, 0, count)
    }
}

//! Runtime errors for graph editing, memory management and execution.
//!
//! # Error Categories
//!
//! - **Lookup errors**: [`Error::NodeNotFound`], [`Error::BlockNotFound`], [`Error::KernelNotFound`]
//! - **Graph errors**: [`Error::InvalidConnection`], [`Error::InputAlreadyConnected`], [`Error::CycleDetected`]
//! - **Memory errors**: [`Error::ExternalPointerMissing`], [`Error::BufferTooSmall`], [`Error::NotAllocated`]
//! - **Device errors**: [`Error::DeviceUnavailable`], [`Error::OutOfDeviceMemory`]
//! - **Execution errors**: [`Error::TaskFailed`], [`Error::ValidationFailed`], [`Error::InvalidState`]
//!
//! Failures are surfaced to the caller immediately. Nothing in the runtime
//! retries or substitutes defaults for an invalid memory model.

use brainflow_foundation::{BlockId, DeviceId, ElementType, NodeId};
use thiserror::Error;

use crate::scheduler::SimulationState;
use crate::validation::ValidationReport;

/// Runtime result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the execution engine.
#[derive(Debug, Error)]
pub enum Error {
    /// A node id was referenced that is not part of the graph.
    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    /// A block id was referenced that is not in the block store.
    #[error("memory block not found: {0}")]
    BlockNotFound(BlockId),

    /// An operation that needs a group node was given something else.
    #[error("node {0} is not a group")]
    NotAGroup(NodeId),

    /// The root group and group boundary nodes cannot be removed on their own.
    #[error("node {0} cannot be removed directly")]
    ProtectedNode(NodeId),

    /// A node has no task with the given name.
    #[error("node {node} has no task '{task}'")]
    TaskNotFound {
        /// Node searched.
        node: NodeId,
        /// Requested task name.
        task: String,
    },

    /// A connection request violates the graph's structural rules.
    #[error("invalid connection {from}[{from_output}] -> {to}[{to_input}]: {reason}")]
    InvalidConnection {
        /// Producing node.
        from: NodeId,
        /// Output slot on the producer.
        from_output: usize,
        /// Consuming node.
        to: NodeId,
        /// Input slot on the consumer.
        to_input: usize,
        /// What rule was broken.
        reason: String,
    },

    /// An input slot holds at most one connection.
    #[error("input {input} of {node} is already connected")]
    InputAlreadyConnected {
        /// Consuming node.
        node: NodeId,
        /// The occupied input slot.
        input: usize,
    },

    /// The dependency graph contains a cycle.
    ///
    /// The `nodes` field lists every node that could not be ordered.
    #[error("cycle detected in graph: {nodes:?}")]
    CycleDetected {
        /// Nodes involved in (or downstream of) the cycle.
        nodes: Vec<NodeId>,
    },

    /// An unmanaged block was asked to allocate without a bound external buffer.
    #[error("external pointer not set for unmanaged memory block '{block}'")]
    ExternalPointerMissing {
        /// Block name.
        block: String,
    },

    /// A host transfer buffer is smaller than the block.
    #[error("buffer too small for '{block}': {required} bytes required, {provided} provided")]
    BufferTooSmall {
        /// Block name.
        block: String,
        /// Bytes the block holds.
        required: usize,
        /// Bytes the caller supplied.
        provided: usize,
    },

    /// A replica the operation needs does not exist.
    #[error("memory block '{block}' is not allocated on {location}")]
    NotAllocated {
        /// Block name.
        block: String,
        /// `"host"` or a device label.
        location: String,
    },

    /// A typed access used a different element type than the block holds.
    #[error("memory block '{block}' holds {actual}, requested {expected}")]
    TypeMismatch {
        /// Block name.
        block: String,
        /// Requested element type.
        expected: ElementType,
        /// Element type of the block.
        actual: ElementType,
    },

    /// An element index or range exceeds the block.
    #[error("index {index} out of range for '{block}' ({count} elements)")]
    IndexOutOfRange {
        /// Block name.
        block: String,
        /// First offending index.
        index: usize,
        /// Block element count.
        count: usize,
    },

    /// A block's device placement cannot change while it holds device memory.
    #[error("memory block '{block}' is already allocated on a device")]
    AlreadyAllocated {
        /// Block name.
        block: String,
    },

    /// The device context is gone (reset or lost).
    #[error("device {0} is not available")]
    DeviceUnavailable(DeviceId),

    /// The device index exceeds the number of devices in the context.
    #[error("device {device} out of range ({count} devices)")]
    DeviceOutOfRange {
        /// Requested device.
        device: DeviceId,
        /// Devices in the execution context.
        count: usize,
    },

    /// The device memory budget would be exceeded.
    #[error("out of memory on {device}: {requested} bytes requested, {available} available")]
    OutOfDeviceMemory {
        /// Target device.
        device: DeviceId,
        /// Requested size.
        requested: usize,
        /// Bytes still available.
        available: usize,
    },

    /// A device pointer does not address a live allocation.
    #[error("invalid device pointer on {device}: {reason}")]
    InvalidDevicePointer {
        /// Device the pointer claims to belong to.
        device: DeviceId,
        /// What was wrong with it.
        reason: String,
    },

    /// No kernel is registered under the requested path.
    #[error("kernel not found: {0}")]
    KernelNotFound(String),

    /// A kernel was launched with unusable arguments.
    #[error("kernel {kernel}: {message}")]
    KernelArgument {
        /// Kernel path.
        kernel: String,
        /// What was wrong.
        message: String,
    },

    /// A task's init or execute step failed.
    #[error("task '{task}' of {node} failed: {message}")]
    TaskFailed {
        /// Owning node.
        node: NodeId,
        /// Task name.
        task: String,
        /// Underlying failure.
        message: String,
    },

    /// The graph failed validation and cannot be started.
    #[error("validation failed with {} error(s)", .0.error_count())]
    ValidationFailed(ValidationReport),

    /// The background stepping thread could not be started.
    #[error("failed to spawn simulation worker: {0}")]
    WorkerSpawn(#[from] std::io::Error),

    /// A scheduler operation is not allowed in the current state.
    #[error("{operation} not allowed while {state}")]
    InvalidState {
        /// Requested operation.
        operation: &'static str,
        /// State the scheduler was in.
        state: SimulationState,
    },
}

//! Brainflow Runtime.
//!
//! This crate provides the dataflow execution engine behind Brainflow
//! networks. A network is a hierarchy of nodes connected output-to-input;
//! every working node owns typed memory blocks and a list of tasks.
//!
//! # Architecture
//!
//! - [`graph`] - The node hierarchy, connections and group boundaries
//! - [`ordering`] - Flat and hierarchical execution orders
//! - [`resolve`] - Fixed-point resolution of memory block sizes
//! - [`memory`] - Memory blocks with host and per-device replicas
//! - [`device`] - Simulated compute devices and device pointers
//! - [`kernel`] - Named compute kernels and their launch arguments
//! - [`task`] / [`node`] - The task contract nodes implement
//! - [`validation`] - Pre-run checks
//! - [`simulation`] - One network bound to an execution context
//! - [`scheduler`] - The STOPPED/RUNNING/PAUSED state machine
//! - [`error`] - Error types for runtime failures
//!
//! # Execution Model
//!
//! Starting a stopped simulation runs four stages:
//!
//! 1. **Resolve** - Block sizes propagate until a pass changes nothing
//! 2. **Validate** - Cycles, unsettled sizes and node checks are reported
//! 3. **Allocate** - Blocks get host buffers and device memory
//! 4. **Init** - Every enabled task initializes on its node's device
//!
//! Each step then runs the world node followed by every node in execution
//! order, and synchronizes block replicas across devices.
//!
//! # Example
//!
//! ```ignore
//! use brainflow_runtime::{Graph, SimulationHandler, Simulation};
//!
//! let mut graph = Graph::new();
//! let source = graph.add_node(graph.root(), "Source", my_source)?;
//! let sink = graph.add_node(graph.root(), "Sink", my_sink)?;
//! graph.connect(source, 0, sink, 0)?;
//!
//! let handler = SimulationHandler::new(Simulation::new(graph, exec, kernels), config);
//! handler.start(false)?;
//! ```

pub mod device;
pub mod error;
pub mod graph;
pub mod kernel;
pub mod memory;
pub mod node;
pub mod ordering;
pub mod resolve;
pub mod scheduler;
pub mod simulation;
pub mod task;
pub mod validation;

#[cfg(test)]
mod testing;

pub use device::{DeviceConfig, DeviceContext, DevicePtr, ExecutionContext, ExternalPointer};
pub use error::{Error, Result};
pub use graph::{Connection, Graph, GroupBody, Node, NodeBody};
pub use kernel::{
    Kernel, KernelArg, KernelDescriptor, KernelFn, KernelInvocation, KernelRegistry, LaunchConfig,
    MAX_BLOCK_DIM,
};
pub use memory::{BlockSpec, BlockStore, MemoryBlock};
pub use node::{InputDecl, NodeDecl, NodeLogic, NodeView, SizingContext, TaskContext};
pub use ordering::{ExecutionOrder, FlatOrdering, HierarchicalOrdering, OrderingAlgorithm};
pub use resolve::{MAX_BLOCKS_UPDATE_ATTEMPTS, MemoryModelResolver, ResolutionReport};
pub use scheduler::{
    SchedulerConfig, SimulationHandler, SimulationState, StepObserver, StepReport,
};
pub use simulation::{Simulation, UNSTABLE_SIZES_MESSAGE};
pub use task::{Task, TaskDecl, TaskState};
pub use validation::{Severity, ValidationMessage, ValidationReport, Validator};

pub use brainflow_foundation::{BlockId, DeviceId, Element, ElementType, NodeId, TaskId};

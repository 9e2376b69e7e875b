//! Brainflow Nodes.
//!
//! Built-in node types and the CPU kernels they launch.
//!
//! # Node Types
//!
//! - [`GeneratedInput`] - Ramps, waves, user data and step counters
//! - [`UserInput`] - Values steered from outside through a [`UserInputHandle`]
//! - [`AbsoluteValue`] - `|x|` or a normalized copy of the input
//! - [`Reduction`] - Sum, min/max and arg-min/arg-max of the input
//! - [`ScalarToSdr`] - Scalar to sparse distributed representation and back
//! - [`ClockWorld`] - World node publishing the step number
//!
//! [`BuiltinNode`] wraps all of them so a whole network can live in one
//! `Graph<BuiltinNode>`.

pub mod error;
pub mod generate;
pub mod kernels;
pub mod sdr;
pub mod transform;
pub mod user_input;
pub mod world;

#[cfg(test)]
mod testing;

use brainflow_runtime::{
    NodeDecl, NodeLogic, NodeView, SizingContext, Task, TaskContext, Validator,
};

pub use error::{Error, Result};
pub use generate::{GenerateParams, GenerateType, GeneratedInput};
pub use kernels::{
    REDUCTION_KERNELS, ReductionMode, TRANSFORM_KERNELS, kernel_registry, register_kernels,
};
pub use sdr::{ScalarToSdr, SdrParams};
pub use transform::{AbsoluteValue, Reduction};
pub use user_input::{UserInput, UserInputConfig, UserInputHandle};
pub use world::ClockWorld;

/// Error for a task executed without its kernel.
pub(crate) fn not_initialized(kernel: &str) -> brainflow_runtime::Error {
    brainflow_runtime::Error::KernelArgument {
        kernel: kernel.to_string(),
        message: "task executed before init".to_string(),
    }
}

/// Any built-in node.
#[derive(Debug, Clone)]
pub enum BuiltinNode {
    GeneratedInput(GeneratedInput),
    UserInput(UserInput),
    AbsoluteValue(AbsoluteValue),
    Reduction(Reduction),
    ScalarToSdr(ScalarToSdr),
    ClockWorld(ClockWorld),
}

macro_rules! dispatch {
    ($self:expr, $node:ident => $body:expr) => {
        match $self {
            BuiltinNode::GeneratedInput($node) => $body,
            BuiltinNode::UserInput($node) => $body,
            BuiltinNode::AbsoluteValue($node) => $body,
            BuiltinNode::Reduction($node) => $body,
            BuiltinNode::ScalarToSdr($node) => $body,
            BuiltinNode::ClockWorld($node) => $body,
        }
    };
}

macro_rules! impl_from {
    ($($variant:ident),*) => {
        $(
            impl From<$variant> for BuiltinNode {
                fn from(node: $variant) -> Self {
                    BuiltinNode::$variant(node)
                }
            }
        )*
    };
}

impl_from!(GeneratedInput, UserInput, AbsoluteValue, Reduction, ScalarToSdr, ClockWorld);

impl BuiltinNode {
    /// Default-configured node of the given kind.
    pub fn from_kind(kind: &str) -> Result<Self> {
        Ok(match kind {
            "GeneratedInput" => GeneratedInput::default().into(),
            "UserInput" => UserInput::default().into(),
            "AbsoluteValue" => AbsoluteValue::new().into(),
            "Reduction" => Reduction::default().into(),
            "ScalarToSDR" => ScalarToSdr::default().into(),
            "ClockWorld" => ClockWorld.into(),
            other => return Err(Error::UnknownKind(other.to_string())),
        })
    }

    /// Short label shown next to the node's name.
    pub fn description(&self) -> String {
        match self {
            BuiltinNode::GeneratedInput(node) => node.description(),
            BuiltinNode::AbsoluteValue(node) => node.description().to_string(),
            BuiltinNode::Reduction(node) => node.mode.description().to_string(),
            other => other.kind().to_string(),
        }
    }
}

impl NodeLogic for BuiltinNode {
    fn kind(&self) -> &'static str {
        dispatch!(self, node => node.kind())
    }

    fn declare(&self) -> NodeDecl {
        dispatch!(self, node => node.declare())
    }

    fn update_memory_blocks(&mut self, sizing: &mut SizingContext<'_>) {
        dispatch!(self, node => node.update_memory_blocks(sizing))
    }

    fn validate(&self, validator: &mut Validator, view: &NodeView<'_>) {
        dispatch!(self, node => node.validate(validator, view))
    }

    fn init_task(
        &mut self,
        task: &Task,
        ctx: &mut TaskContext<'_>,
    ) -> brainflow_runtime::Result<()> {
        dispatch!(self, node => node.init_task(task, ctx))
    }

    fn execute_task(
        &mut self,
        task: &Task,
        ctx: &mut TaskContext<'_>,
    ) -> brainflow_runtime::Result<()> {
        dispatch!(self, node => node.execute_task(task, ctx))
    }
}

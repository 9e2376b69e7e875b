//! Brainflow Foundation.
//!
//! Identifier newtypes and the buffer element model shared by the runtime,
//! the built-in nodes and the tools.

pub mod element;
pub mod ids;

pub use element::{Element, ElementType, decode_f64};
pub use ids::{BlockId, DeviceId, NodeId, TaskId};

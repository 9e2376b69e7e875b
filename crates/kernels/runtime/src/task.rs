//! Tasks: the units of per-step work a node declares.
//!
//! A task is declared once by its node and keeps its place in the node's task
//! list for the node's lifetime. Tasks in the same named group are mutually
//! exclusive: validation rejects a node with more than one enabled task per
//! group.

use brainflow_foundation::{DeviceId, TaskId};
use serde::{Deserialize, Serialize};

/// Declaration of a task, as returned by a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDecl {
    pub name: String,
    /// Mutually exclusive group, if any.
    pub group: Option<String>,
    pub enabled: bool,
    /// Runs only on the first step after the simulation starts.
    pub one_shot: bool,
}

impl TaskDecl {
    /// An enabled, repeating task outside any group.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: None,
            enabled: true,
            one_shot: false,
        }
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn one_shot(mut self) -> Self {
        self.one_shot = true;
        self
    }
}

/// Lifecycle of a task within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    /// Init has not run for the current device context.
    Uninitialized,
    Ready,
    Executing,
}

/// A declared task attached to a node.
#[derive(Debug, Clone)]
pub struct Task {
    id: TaskId,
    decl: TaskDecl,
    state: TaskState,
    initialized_on: Option<DeviceId>,
}

impl Task {
    pub(crate) fn new(id: TaskId, decl: TaskDecl) -> Self {
        Self {
            id,
            decl,
            state: TaskState::Uninitialized,
            initialized_on: None,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.decl.name
    }

    pub fn group(&self) -> Option<&str> {
        self.decl.group.as_deref()
    }

    pub fn is_enabled(&self) -> bool {
        self.decl.enabled
    }

    pub fn is_one_shot(&self) -> bool {
        self.decl.one_shot
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub(crate) fn set_enabled(&mut self, enabled: bool) {
        self.decl.enabled = enabled;
    }

    pub(crate) fn set_state(&mut self, state: TaskState) {
        self.state = state;
    }

    /// Init must run before the next execution on `device`.
    pub(crate) fn needs_init(&self, device: DeviceId) -> bool {
        self.state == TaskState::Uninitialized || self.initialized_on != Some(device)
    }

    pub(crate) fn mark_initialized(&mut self, device: DeviceId) {
        self.initialized_on = Some(device);
        self.state = TaskState::Ready;
    }

    pub(crate) fn reset(&mut self) {
        self.initialized_on = None;
        self.state = TaskState::Uninitialized;
    }

    /// Whether the task takes part in a step.
    pub(crate) fn should_run(&self, first_step: bool) -> bool {
        self.decl.enabled && (!self.decl.one_shot || first_step)
    }
}

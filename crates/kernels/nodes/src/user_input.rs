//! Values set from outside the simulation while it runs.

use std::sync::Arc;

use brainflow_runtime::{
    ElementType, NodeDecl, NodeLogic, NodeView, Result, SizingContext, Task, TaskContext, TaskDecl,
    Validator,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{self, Error};

/// Shared slider positions, each normalized to `[0, 1]`.
///
/// Clones share state, so a handle taken before the node is moved into a
/// graph still steers it.
#[derive(Debug, Clone, Default)]
pub struct UserInputHandle {
    values: Arc<Mutex<Vec<f32>>>,
}

impl UserInputHandle {
    /// Set slider `index`, clamped to `[0, 1]`.
    pub fn set(&self, index: usize, normalized: f32) {
        let mut values = self.values.lock();
        if values.len() <= index {
            values.resize(index + 1, 0.0);
        }
        values[index] = normalized.clamp(0.0, 1.0);
    }

    /// Normalized position of slider `index`; unset sliders sit at 0.
    pub fn get(&self, index: usize) -> f32 {
        self.values.lock().get(index).copied().unwrap_or_default()
    }

    fn snapshot(&self, len: usize) -> Vec<f32> {
        let values = self.values.lock();
        (0..len).map(|i| values.get(i).copied().unwrap_or_default()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserInputConfig {
    pub output_size: usize,
    pub min_value: f32,
    pub max_value: f32,
    /// Drive all outputs from one slider as the bits of an integer.
    pub convert_to_binary: bool,
}

impl Default for UserInputConfig {
    fn default() -> Self {
        Self {
            output_size: 1,
            min_value: 0.0,
            max_value: 1.0,
            convert_to_binary: false,
        }
    }
}

/// Writes user-controlled values every step.
///
/// In plain mode output `i` is `min + s_i * (max - min)` for slider `s_i`.
/// In binary mode slider 0 selects an integer in `0..2^output_size` whose
/// bits, least significant first, become the outputs.
#[derive(Debug, Clone, Default)]
pub struct UserInput {
    pub config: UserInputConfig,
    handle: UserInputHandle,
}

impl UserInput {
    pub fn new(config: UserInputConfig) -> Self {
        Self {
            config,
            handle: UserInputHandle::default(),
        }
    }

    pub fn handle(&self) -> UserInputHandle {
        self.handle.clone()
    }

    pub fn slider_count(&self) -> usize {
        if self.config.convert_to_binary {
            1
        } else {
            self.config.output_size
        }
    }

    pub fn set_user_input(&self, index: usize, normalized: f32) -> error::Result<()> {
        let count = self.slider_count();
        if index >= count {
            return Err(Error::InputIndexOutOfRange { index, count });
        }
        self.handle.set(index, normalized);
        Ok(())
    }

    /// Value slider `index` maps to, in `[min_value, max_value]`.
    pub fn user_input(&self, index: usize) -> f32 {
        let UserInputConfig {
            min_value,
            max_value,
            ..
        } = self.config;
        min_value + self.handle.get(index) * (max_value - min_value)
    }

    fn output_values(&self) -> Vec<f32> {
        let size = self.config.output_size;
        if self.config.convert_to_binary {
            let max = if size >= 64 { u64::MAX } else { (1u64 << size) - 1 };
            let integer = (f64::from(self.handle.get(0)) * max as f64).round() as u64;
            (0..size)
                .map(|bit| if bit < 64 && (integer >> bit) & 1 == 1 { 1.0 } else { 0.0 })
                .collect()
        } else {
            let UserInputConfig {
                min_value,
                max_value,
                ..
            } = self.config;
            self.handle
                .snapshot(size)
                .into_iter()
                .map(|s| min_value + s * (max_value - min_value))
                .collect()
        }
    }
}

impl NodeLogic for UserInput {
    fn kind(&self) -> &'static str {
        "UserInput"
    }

    fn declare(&self) -> NodeDecl {
        NodeDecl::new()
            .output("Output", ElementType::F32)
            .task(TaskDecl::new("ShowValues"))
    }

    fn update_memory_blocks(&mut self, sizing: &mut SizingContext<'_>) {
        sizing.set_count(0, self.config.output_size);
    }

    fn validate(&self, validator: &mut Validator, view: &NodeView<'_>) {
        validator.assert_error(
            self.config.output_size > 0,
            view.id(),
            "Invalid OutputSize, must be at least 1",
        );
        validator.assert_error(
            self.config.max_value >= self.config.min_value,
            view.id(),
            "MaxValue must not be smaller than MinValue",
        );
    }

    fn execute_task(&mut self, _task: &Task, ctx: &mut TaskContext<'_>) -> Result<()> {
        let values = self.output_values();
        ctx.write_block(0, &values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{output, prepared, single};

    fn config(output_size: usize, convert_to_binary: bool) -> UserInputConfig {
        UserInputConfig {
            output_size,
            min_value: -1.0,
            max_value: 1.0,
            convert_to_binary,
        }
    }

    #[test]
    fn test_sliders_map_to_range() {
        let node = UserInput::new(config(3, false));
        node.set_user_input(0, 1.0).unwrap();
        node.set_user_input(2, 0.5).unwrap();
        assert_eq!(node.user_input(0), 1.0);
        assert_eq!(node.user_input(1), -1.0);
        assert_eq!(node.user_input(2), 0.0);
        assert!(matches!(
            node.set_user_input(3, 0.0),
            Err(Error::InputIndexOutOfRange { index: 3, count: 3 })
        ));
    }

    #[test]
    fn test_handle_steers_running_node() {
        let node = UserInput::new(config(2, false));
        let handle = node.handle();
        let (mut sim, id) = single(node);
        prepared(&mut sim);

        sim.step().unwrap();
        assert_eq!(output(&sim, id, 0), vec![-1.0, -1.0]);

        handle.set(1, 2.0);
        sim.step().unwrap();
        assert_eq!(output(&sim, id, 0), vec![-1.0, 1.0]);
    }

    #[test]
    fn test_binary_output() {
        let node = UserInput::new(config(3, true));
        assert_eq!(node.slider_count(), 1);
        // 5/7 of the range selects 0b101
        node.set_user_input(0, 5.0 / 7.0).unwrap();
        let (mut sim, id) = single(node);
        prepared(&mut sim);
        sim.step().unwrap();
        assert_eq!(output(&sim, id, 0), vec![1.0, 0.0, 1.0]);
    }

    #[test]
    fn test_zero_size_is_invalid() {
        let (mut sim, _) = single(UserInput::new(config(0, false)));
        sim.update_memory_model().unwrap();
        assert!(sim.validate().has_error_containing("Invalid OutputSize"));
    }
}

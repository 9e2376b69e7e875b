//! Generated input signals.

use std::f64::consts::PI;

use brainflow_runtime::{
    ElementType, Kernel, KernelArg, NodeDecl, NodeLogic, NodeView, Result, SizingContext, Task,
    TaskContext, TaskDecl, Validator,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{self, Error};
use crate::kernels::TRANSFORM_KERNELS;

const LINEAR_VALUES: &str = "LinearValuesKernel";

/// What the generator writes to its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GenerateType {
    /// Evenly spaced values between the task's min and max, shifted every step.
    #[default]
    Linear,
    /// `sin(2π · f · step)` with `f` the first user value.
    Sine,
    /// `cos(2π · f · step)` with `f` the first user value.
    Cosine,
    /// The user values, verbatim.
    UserData,
    /// The current step number.
    SimulationStep,
    /// The user value at `step % len`, one per step.
    SimulationStepFce,
}

/// Parameters of the `GenerateInput` task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerateParams {
    pub min_value: f32,
    pub max_value: f32,
    /// Elements the linear ramp rotates by per step.
    pub shift_speed: i32,
}

impl Default for GenerateParams {
    fn default() -> Self {
        Self {
            min_value: 0.0,
            max_value: 1.0,
            shift_speed: 0,
        }
    }
}

/// Writes a generated signal into its single output every step.
#[derive(Debug, Clone)]
pub struct GeneratedInput {
    pub generate_type: GenerateType,
    pub output_size: usize,
    pub column_hint: usize,
    pub params: GenerateParams,
    user_input: String,
    user_values: Vec<f32>,
    kernel: Option<Kernel>,
}

impl Default for GeneratedInput {
    fn default() -> Self {
        Self {
            generate_type: GenerateType::Linear,
            output_size: 1,
            column_hint: 1,
            params: GenerateParams::default(),
            user_input: String::new(),
            user_values: Vec::new(),
            kernel: None,
        }
    }
}

impl GeneratedInput {
    pub fn new(generate_type: GenerateType, output_size: usize) -> Self {
        Self {
            generate_type,
            output_size,
            ..Self::default()
        }
    }

    /// Generator of the given user values.
    pub fn user_data(values: &str) -> error::Result<Self> {
        let mut node = Self::new(GenerateType::UserData, 1);
        node.set_user_input(values)?;
        Ok(node)
    }

    pub fn with_params(mut self, params: GenerateParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_column_hint(mut self, column_hint: usize) -> Self {
        self.column_hint = column_hint;
        self
    }

    pub fn user_input(&self) -> &str {
        &self.user_input
    }

    pub fn user_values(&self) -> &[f32] {
        &self.user_values
    }

    /// Set the user values from a comma or space separated list.
    ///
    /// An empty string keeps the previously parsed values.
    pub fn set_user_input(&mut self, input: &str) -> error::Result<()> {
        if !input.trim().is_empty() {
            self.user_values = parse_values(input)?;
        }
        self.user_input = input.to_string();
        Ok(())
    }

    /// Short label for the node.
    pub fn description(&self) -> String {
        match self.generate_type {
            GenerateType::Linear => "Linear".to_string(),
            GenerateType::Sine => "Sine".to_string(),
            GenerateType::Cosine => "Cosine".to_string(),
            GenerateType::UserData if self.user_input.chars().count() > 10 => {
                let head: String = self.user_input.chars().take(10).collect();
                format!("{head} ...")
            }
            GenerateType::UserData => self.user_input.clone(),
            GenerateType::SimulationStep => "SimulStep".to_string(),
            GenerateType::SimulationStepFce => "SimulStepFce".to_string(),
        }
    }

    fn needs_user_values(&self) -> bool {
        matches!(
            self.generate_type,
            GenerateType::Sine | GenerateType::Cosine | GenerateType::SimulationStepFce
        )
    }

    fn first_value(&self) -> f64 {
        self.user_values.first().copied().unwrap_or_default() as f64
    }
}

fn parse_values(input: &str) -> error::Result<Vec<f32>> {
    input
        .split([',', ' '])
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(|token| {
            token.parse::<f32>().map_err(|e| Error::InvalidUserData {
                input: token.to_string(),
                reason: e.to_string(),
            })
        })
        .collect()
}

impl NodeLogic for GeneratedInput {
    fn kind(&self) -> &'static str {
        "GeneratedInput"
    }

    fn declare(&self) -> NodeDecl {
        NodeDecl::new()
            .output("Output", ElementType::F32)
            .task(TaskDecl::new("GenerateInput"))
    }

    fn update_memory_blocks(&mut self, sizing: &mut SizingContext<'_>) {
        sizing.set_column_hint(0, self.column_hint.max(1));
        let count = match self.generate_type {
            GenerateType::SimulationStepFce => 1,
            GenerateType::UserData if !self.user_values.is_empty() => self.user_values.len(),
            _ => self.output_size,
        };
        sizing.set_count(0, count);
    }

    fn validate(&self, validator: &mut Validator, view: &NodeView<'_>) {
        validator.assert_error(
            self.output_size > 0,
            view.id(),
            "Invalid OutputSize, must be at least 1",
        );
        validator.assert_error(
            !(self.generate_type == GenerateType::UserData && self.user_input.trim().is_empty()),
            view.id(),
            "You need to enter some values to UserData",
        );
        validator.assert_error(
            !(self.needs_user_values() && self.user_values.is_empty()),
            view.id(),
            format!("{:?} needs at least one value in UserInput", self.generate_type),
        );
    }

    fn init_task(&mut self, _task: &Task, ctx: &mut TaskContext<'_>) -> Result<()> {
        if self.generate_type == GenerateType::Linear {
            self.kernel = Some(ctx.kernel(TRANSFORM_KERNELS, LINEAR_VALUES)?);
            debug!(node = %ctx.node(), device = %ctx.device(), "linear generator ready");
        }
        Ok(())
    }

    fn execute_task(&mut self, _task: &Task, ctx: &mut TaskContext<'_>) -> Result<()> {
        let step = ctx.step();
        match self.generate_type {
            GenerateType::Linear => {
                let Some(kernel) = self.kernel.as_mut() else {
                    return Err(crate::not_initialized(LINEAR_VALUES));
                };
                let count = ctx.block(0)?.count();
                kernel.setup_execution(count);
                let output = ctx.block_ptr(0)?;
                let shift = i64::from(self.params.shift_speed) * step as i64;
                ctx.run(
                    kernel,
                    &[
                        self.params.min_value.into(),
                        self.params.max_value.into(),
                        output.into(),
                        count.into(),
                        KernelArg::Int(shift),
                    ],
                )
            }
            GenerateType::Sine => {
                let value = (step as f64 * 2.0 * PI * self.first_value()).sin();
                ctx.write_block(0, &[value as f32])
            }
            GenerateType::Cosine => {
                let value = (step as f64 * 2.0 * PI * self.first_value()).cos();
                ctx.write_block(0, &[value as f32])
            }
            GenerateType::UserData => ctx.write_block(0, &self.user_values),
            GenerateType::SimulationStep => ctx.write_block(0, &[step as f32]),
            GenerateType::SimulationStepFce => {
                let len = self.user_values.len().max(1) as u64;
                let value = self
                    .user_values
                    .get((step % len) as usize)
                    .copied()
                    .unwrap_or_default();
                ctx.write_block(0, &[value])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{output, prepared, single};

    #[test]
    fn test_parse_user_values() {
        assert_eq!(parse_values("1, 2.5 -3").unwrap(), vec![1.0, 2.5, -3.0]);
        assert!(matches!(
            parse_values("1,x"),
            Err(Error::InvalidUserData { input, .. }) if input == "x"
        ));
    }

    #[test]
    fn test_user_data_sizes_output() {
        let node = GeneratedInput::user_data("4 5 6").unwrap();
        let (mut sim, id) = single(node);
        prepared(&mut sim);
        sim.step().unwrap();
        assert_eq!(output(&sim, id, 0), vec![4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_linear_ramp_shifts_each_step() {
        let node = GeneratedInput::new(GenerateType::Linear, 3).with_params(GenerateParams {
            min_value: 0.0,
            max_value: 2.0,
            shift_speed: 1,
        });
        let (mut sim, id) = single(node);
        prepared(&mut sim);

        sim.step().unwrap();
        assert_eq!(output(&sim, id, 0), vec![0.0, 1.0, 2.0]);
        sim.step().unwrap();
        assert_eq!(output(&sim, id, 0), vec![1.0, 2.0, 0.0]);
    }

    #[test]
    fn test_step_function_cycles_values() {
        let mut node = GeneratedInput::new(GenerateType::SimulationStepFce, 8);
        node.set_user_input("7,8").unwrap();
        let (mut sim, id) = single(node);
        prepared(&mut sim);

        let mut seen = Vec::new();
        for _ in 0..3 {
            sim.step().unwrap();
            seen.extend(output(&sim, id, 0));
        }
        assert_eq!(seen, vec![7.0, 8.0, 7.0]);
    }

    #[test]
    fn test_sine_starts_at_zero() {
        let mut node = GeneratedInput::new(GenerateType::Sine, 1);
        node.set_user_input("0.25").unwrap();
        let (mut sim, id) = single(node);
        prepared(&mut sim);

        sim.step().unwrap();
        assert_eq!(output(&sim, id, 0), vec![0.0]);
        sim.step().unwrap();
        assert!((output(&sim, id, 0)[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_validation_rules() {
        let (mut sim, _) = single(GeneratedInput::new(GenerateType::UserData, 0));
        sim.update_memory_model().unwrap();
        let report = sim.validate();
        assert!(report.has_error_containing("Invalid OutputSize"));
        assert!(report.has_error_containing("You need to enter some values"));

        let (mut sim, _) = single(GeneratedInput::new(GenerateType::Cosine, 1));
        sim.update_memory_model().unwrap();
        assert!(sim.validate().has_error_containing("Cosine needs at least one value"));
    }

    #[test]
    fn test_description_truncates_user_data() {
        let node = GeneratedInput::user_data("1,2,3,4,5,6,7").unwrap();
        assert_eq!(node.description(), "1,2,3,4,5, ...");
        assert_eq!(GeneratedInput::default().description(), "Linear");
    }
}

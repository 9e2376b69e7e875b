//! Transforms: one input, one output of the same shape.

use brainflow_runtime::{
    ElementType, Kernel, KernelArg, NodeDecl, NodeLogic, NodeView, Result, SizingContext, Task,
    TaskContext, TaskDecl, Validator,
};
use serde::{Deserialize, Serialize};

use crate::kernels::{REDUCTION_KERNELS, ReductionMode, TRANSFORM_KERNELS};

/// Output mirrors the input's count and column hint.
fn mirror_input(sizing: &mut SizingContext<'_>) {
    let count = sizing.input_count(0);
    sizing.set_count(0, count);
    if sizing.input(0).is_some() {
        let column_hint = sizing.input_column_hint(0);
        sizing.set_column_hint(0, column_hint);
    }
}

fn transform_decl(task: &str) -> NodeDecl {
    NodeDecl::new()
        .input("Input")
        .output("Output", ElementType::F32)
        .task(TaskDecl::new(task))
}

// ============================================================================
// Absolute value
// ============================================================================

#[derive(Debug, Clone)]
struct AbsoluteKernels {
    absolute: Kernel,
    polynomial: Kernel,
    dot: Kernel,
    sum: Kernel,
}

/// Element-wise `|x|`, or a normalization of the input vector.
///
/// With `vector_normalization` the output is `x / ‖x‖`; with
/// `scalar_normalization` it is `x / Σx`. A zero norm yields zeros.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AbsoluteValue {
    pub vector_normalization: bool,
    pub scalar_normalization: bool,
    #[serde(skip)]
    kernels: Option<AbsoluteKernels>,
}

impl AbsoluteValue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn vector_normalized() -> Self {
        Self {
            vector_normalization: true,
            ..Self::default()
        }
    }

    pub fn scalar_normalized() -> Self {
        Self {
            scalar_normalization: true,
            ..Self::default()
        }
    }

    pub fn description(&self) -> &'static str {
        if self.vector_normalization {
            "f(x) = x / |x|"
        } else {
            "f(x) = |x|"
        }
    }

    /// Divide the input by `norm` into the output, or zero the output.
    fn scale(
        kernels: &mut AbsoluteKernels,
        ctx: &mut TaskContext<'_>,
        norm: f32,
        count: usize,
    ) -> Result<()> {
        if norm == 0.0 {
            return ctx.fill(0, 0.0f32);
        }
        let input = ctx.input_ptr(0)?;
        let output = ctx.block_ptr(0)?;
        kernels.polynomial.setup_execution(count);
        ctx.run(
            &kernels.polynomial,
            &[
                0.0f32.into(),
                0.0f32.into(),
                (1.0 / norm).into(),
                0.0f32.into(),
                input.into(),
                output.into(),
                count.into(),
            ],
        )
    }
}

impl NodeLogic for AbsoluteValue {
    fn kind(&self) -> &'static str {
        "AbsoluteValue"
    }

    fn declare(&self) -> NodeDecl {
        transform_decl("AbsoluteValue").hidden("Temp", ElementType::F32)
    }

    fn update_memory_blocks(&mut self, sizing: &mut SizingContext<'_>) {
        mirror_input(sizing);
        sizing.set_count(1, 1);
    }

    fn init_task(&mut self, _task: &Task, ctx: &mut TaskContext<'_>) -> Result<()> {
        self.kernels = Some(AbsoluteKernels {
            absolute: ctx.kernel(TRANSFORM_KERNELS, "AbsoluteValueKernel")?,
            polynomial: ctx.kernel(TRANSFORM_KERNELS, "PolynomialFunctionKernel")?,
            dot: ctx.kernel(REDUCTION_KERNELS, ReductionMode::f_DotProduct_f.name())?,
            sum: ctx.kernel(REDUCTION_KERNELS, ReductionMode::f_Sum_f.name())?,
        });
        Ok(())
    }

    fn execute_task(&mut self, _task: &Task, ctx: &mut TaskContext<'_>) -> Result<()> {
        let Some(kernels) = self.kernels.as_mut() else {
            return Err(crate::not_initialized("AbsoluteValueKernel"));
        };
        let count = ctx.input_count(0);
        if count == 0 {
            return Ok(());
        }
        let input = ctx.input_ptr(0)?;
        let output = ctx.block_ptr(0)?;
        let temp = ctx.block_ptr(1)?;

        if self.vector_normalization {
            ctx.run(
                &kernels.dot,
                &[temp.into(), 0usize.into(), input.into(), input.into(), count.into()],
            )?;
            let length = ctx.value_at::<f32>(1, 0)?.sqrt();
            Self::scale(kernels, ctx, length, count)
        } else if self.scalar_normalization {
            ctx.run(
                &kernels.sum,
                &[
                    temp.into(),
                    input.into(),
                    count.into(),
                    0usize.into(),
                    0usize.into(),
                    1usize.into(),
                ],
            )?;
            let sum = ctx.value_at::<f32>(1, 0)?;
            Self::scale(kernels, ctx, sum, count)
        } else {
            kernels.absolute.setup_execution(count);
            ctx.run(&kernels.absolute, &[input.into(), output.into(), count.into()])
        }
    }
}

// ============================================================================
// Reduction
// ============================================================================

/// Reduces the input to 1, 2 or 4 values depending on the mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reduction {
    pub mode: ReductionMode,
    #[serde(skip)]
    kernel: Option<Kernel>,
}

impl Default for Reduction {
    fn default() -> Self {
        Self::new(ReductionMode::f_Sum_f)
    }
}

impl Reduction {
    pub fn new(mode: ReductionMode) -> Self {
        Self { mode, kernel: None }
    }
}

impl NodeLogic for Reduction {
    fn kind(&self) -> &'static str {
        "Reduction"
    }

    fn declare(&self) -> NodeDecl {
        transform_decl("Reduction")
    }

    fn update_memory_blocks(&mut self, sizing: &mut SizingContext<'_>) {
        sizing.set_count(0, self.mode.output_size());
    }

    fn validate(&self, validator: &mut Validator, view: &NodeView<'_>) {
        validator.assert_error(
            self.mode != ReductionMode::f_DotProduct_f,
            view.id(),
            "f_DotProduct_f needs two inputs and cannot be used as a reduction mode",
        );
    }

    fn init_task(&mut self, _task: &Task, ctx: &mut TaskContext<'_>) -> Result<()> {
        self.kernel = Some(ctx.kernel(REDUCTION_KERNELS, self.mode.name())?);
        Ok(())
    }

    fn execute_task(&mut self, _task: &Task, ctx: &mut TaskContext<'_>) -> Result<()> {
        let Some(kernel) = self.kernel.as_ref() else {
            return Err(crate::not_initialized(self.mode.name()));
        };
        let count = ctx.input_count(0);
        let input = ctx.input_ptr(0)?;
        let output = ctx.block_ptr(0)?;
        // No offsets, stride 1
        ctx.run(
            kernel,
            &[
                output.into(),
                input.into(),
                count.into(),
                KernelArg::Int(0),
                KernelArg::Int(0),
                KernelArg::Int(1),
            ],
        )
    }
}

#[cfg(test)]
mod tests {
    use brainflow_runtime::DeviceId;

    use super::*;
    use crate::generate::GeneratedInput;
    use crate::testing::{output, pipeline, prepared};

    fn source(values: &str) -> GeneratedInput {
        GeneratedInput::user_data(values).unwrap()
    }

    #[test]
    fn test_absolute_value() {
        let (mut sim, _, abs) = pipeline(source("-1 2 -3"), AbsoluteValue::new());
        prepared(&mut sim);
        sim.step().unwrap();
        assert_eq!(output(&sim, abs, 0), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_vector_normalization() {
        let (mut sim, _, abs) = pipeline(source("3 -4"), AbsoluteValue::vector_normalized());
        prepared(&mut sim);
        sim.step().unwrap();
        let values = output(&sim, abs, 0);
        assert!((values[0] - 0.6).abs() < 1e-6);
        assert!((values[1] + 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_scalar_normalization_of_zero_sum() {
        let (mut sim, _, abs) = pipeline(source("1 -1"), AbsoluteValue::scalar_normalized());
        prepared(&mut sim);
        sim.step().unwrap();
        assert_eq!(output(&sim, abs, 0), vec![0.0, 0.0]);
    }

    #[test]
    fn test_transform_mirrors_input_shape() {
        let (mut sim, _, abs) = pipeline(
            source("1 2 3 4 5 6").with_column_hint(3),
            AbsoluteValue::new(),
        );
        sim.update_memory_model().unwrap();
        let graph = sim.graph();
        let out = graph.block(graph.output_block(abs, 0).unwrap()).unwrap();
        let temp = graph.block(graph.output_block(abs, 1).unwrap()).unwrap();
        assert_eq!((out.count(), out.column_hint()), (6, 3));
        assert_eq!(temp.count(), 1);
        assert!(!temp.is_output());
    }

    #[test]
    fn test_reduction_modes() {
        let (mut sim, _, reduce) = pipeline(
            source("3 -1 4"),
            Reduction::new(ReductionMode::f_MinIdxMaxIdx_4f),
        );
        prepared(&mut sim);
        sim.step().unwrap();
        assert_eq!(output(&sim, reduce, 0), vec![-1.0, 1.0, 4.0, 2.0]);
    }

    #[test]
    fn test_reduction_reads_peer_replica() {
        let (mut sim, _, reduce) = pipeline(source("1 2 3"), Reduction::default());
        sim.graph_mut().set_node_device(reduce, DeviceId(1)).unwrap();
        prepared(&mut sim);
        sim.step().unwrap();
        assert_eq!(output(&sim, reduce, 0), vec![6.0]);
    }

    #[test]
    fn test_dot_product_mode_is_rejected() {
        let (mut sim, _, _) = pipeline(source("1"), Reduction::new(ReductionMode::f_DotProduct_f));
        sim.update_memory_model().unwrap();
        assert!(sim.validate().has_error_containing("f_DotProduct_f"));
    }
}

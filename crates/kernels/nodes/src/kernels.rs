//! CPU reference kernels.
//!
//! Element-wise transform kernels live in [`TRANSFORM_KERNELS`]; reductions
//! live in [`REDUCTION_KERNELS`] under the names of their [`ReductionMode`].
//!
//! # Signatures
//!
//! | Kernel | Arguments |
//! |---|---|
//! | `AbsoluteValueKernel` | `input, output, count` |
//! | `PolynomialFunctionKernel` | `a3, a2, a1, a0, input, output, count` |
//! | `LinearValuesKernel` | `min, max, output, count, shift` |
//! | `f_DotProduct_f` | `output, out_offset, a, b, count` |
//! | other reductions | `output, input, count, in_offset, out_offset, stride` |

use std::fmt;
use std::str::FromStr;

use brainflow_runtime::{KernelInvocation, KernelRegistry, Result};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Module of the element-wise transform kernels.
pub const TRANSFORM_KERNELS: &str = "Transforms/TransformKernels";

/// Module of the reduction kernels.
pub const REDUCTION_KERNELS: &str = "Reduction";

/// Register every built-in kernel.
pub fn register_kernels(registry: &mut KernelRegistry) {
    registry.register(
        TRANSFORM_KERNELS,
        "AbsoluteValueKernel",
        "output[i] = |input[i]|",
        absolute_value,
    );
    registry.register(
        TRANSFORM_KERNELS,
        "PolynomialFunctionKernel",
        "output[i] = a3*x^3 + a2*x^2 + a1*x + a0",
        polynomial_function,
    );
    registry.register(
        TRANSFORM_KERNELS,
        "LinearValuesKernel",
        "evenly spaced values from min to max, rotated by shift",
        linear_values,
    );
    for mode in ReductionMode::ALL {
        registry.register(REDUCTION_KERNELS, mode.name(), mode.doc(), move |inv| reduce(mode, inv));
    }
}

/// A registry holding the built-in kernels.
pub fn kernel_registry() -> KernelRegistry {
    let mut registry = KernelRegistry::new();
    register_kernels(&mut registry);
    registry
}

fn absolute_value(inv: &mut KernelInvocation<'_>) -> Result<()> {
    let count = inv.count(2)?;
    let input = inv.read::<f32>(0, count)?;
    let output = inv.view_mut::<f32>(1, count)?;
    for (out, x) in output.iter_mut().zip(input) {
        *out = x.abs();
    }
    Ok(())
}

fn polynomial_function(inv: &mut KernelInvocation<'_>) -> Result<()> {
    let (a3, a2, a1, a0) = (inv.float(0)?, inv.float(1)?, inv.float(2)?, inv.float(3)?);
    let count = inv.count(6)?;
    let input = inv.read::<f32>(4, count)?;
    let output = inv.view_mut::<f32>(5, count)?;
    for (out, x) in output.iter_mut().zip(input) {
        *out = ((a3 * x + a2) * x + a1) * x + a0;
    }
    Ok(())
}

fn linear_values(inv: &mut KernelInvocation<'_>) -> Result<()> {
    let (min, max) = (inv.float(0)?, inv.float(1)?);
    let count = inv.count(3)?;
    if count == 0 {
        return Ok(());
    }
    let shift = inv.int(4)?.rem_euclid(count as i64) as usize;
    let step = if count > 1 {
        (max - min) / (count - 1) as f32
    } else {
        0.0
    };
    let output = inv.view_mut::<f32>(2, count)?;
    for (i, out) in output.iter_mut().enumerate() {
        *out = min + step * ((i + shift) % count) as f32;
    }
    Ok(())
}

// ============================================================================
// Reductions
// ============================================================================

/// Reduction kernels, named `<input>_<operation>_<output>`.
///
/// `f_MinIdx_fi` produces the minimum and its index; indices are stored as
/// floats in the float output block.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReductionMode {
    f_Sum_f,
    f_DotProduct_f,
    f_MinIdx_fi,
    f_MaxIdx_fi,
    f_MinMax_2f,
    f_MinIdxMaxIdx_4f,
}

impl ReductionMode {
    pub const ALL: [ReductionMode; 6] = [
        ReductionMode::f_Sum_f,
        ReductionMode::f_DotProduct_f,
        ReductionMode::f_MinIdx_fi,
        ReductionMode::f_MaxIdx_fi,
        ReductionMode::f_MinMax_2f,
        ReductionMode::f_MinIdxMaxIdx_4f,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ReductionMode::f_Sum_f => "f_Sum_f",
            ReductionMode::f_DotProduct_f => "f_DotProduct_f",
            ReductionMode::f_MinIdx_fi => "f_MinIdx_fi",
            ReductionMode::f_MaxIdx_fi => "f_MaxIdx_fi",
            ReductionMode::f_MinMax_2f => "f_MinMax_2f",
            ReductionMode::f_MinIdxMaxIdx_4f => "f_MinIdxMaxIdx_4f",
        }
    }

    fn doc(self) -> &'static str {
        match self {
            ReductionMode::f_Sum_f => "sum of the input",
            ReductionMode::f_DotProduct_f => "dot product of two inputs",
            ReductionMode::f_MinIdx_fi => "minimum and its index",
            ReductionMode::f_MaxIdx_fi => "maximum and its index",
            ReductionMode::f_MinMax_2f => "minimum and maximum",
            ReductionMode::f_MinIdxMaxIdx_4f => "minimum, its index, maximum, its index",
        }
    }

    /// Number of output elements, read off the output signature.
    pub fn output_size(self) -> usize {
        let signature = self.name().rsplit('_').next().unwrap_or_default();
        if signature.len() == 1 {
            1
        } else if signature.len() == 4 || signature.starts_with('4') {
            4
        } else {
            2
        }
    }

    /// Short formula for display.
    pub fn description(self) -> &'static str {
        match self {
            ReductionMode::f_Sum_f => "f(x)=\u{2211}x",
            ReductionMode::f_DotProduct_f => "f(x)=x\u{00b7}y",
            ReductionMode::f_MinIdx_fi => "[min(x),idx]",
            ReductionMode::f_MaxIdx_fi => "[max(x),idx]",
            ReductionMode::f_MinMax_2f => "[min(x),max(x)]",
            ReductionMode::f_MinIdxMaxIdx_4f => "[min(x),idx,max(x),idx]",
        }
    }
}

impl fmt::Display for ReductionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ReductionMode {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        ReductionMode::ALL
            .into_iter()
            .find(|mode| mode.name() == s)
            .ok_or_else(|| Error::UnknownReduction(s.to_string()))
    }
}

fn reduce(mode: ReductionMode, inv: &mut KernelInvocation<'_>) -> Result<()> {
    if mode == ReductionMode::f_DotProduct_f {
        let offset = inv.count(1)?;
        let count = inv.count(4)?;
        let a = inv.read::<f32>(2, count)?;
        let b = inv.read::<f32>(3, count)?;
        let dot = a.iter().zip(&b).map(|(x, y)| x * y).sum::<f32>();
        inv.view_mut::<f32>(0, offset + 1)?[offset] = dot;
        return Ok(());
    }

    let count = inv.count(2)?;
    let in_offset = inv.count(3)?;
    let out_offset = inv.count(4)?;
    let stride = inv.count(5)?.max(1);
    let span = if count == 0 {
        0
    } else {
        in_offset + (count - 1) * stride + 1
    };
    let raw = inv.read::<f32>(1, span)?;
    let values: Vec<f32> = (0..count).map(|i| raw[in_offset + i * stride]).collect();

    let result = match mode {
        ReductionMode::f_Sum_f | ReductionMode::f_DotProduct_f => vec![values.iter().sum()],
        ReductionMode::f_MinIdx_fi => {
            let (idx, min) = arg_extreme(&values, |a, b| a < b);
            vec![min, idx]
        }
        ReductionMode::f_MaxIdx_fi => {
            let (idx, max) = arg_extreme(&values, |a, b| a > b);
            vec![max, idx]
        }
        ReductionMode::f_MinMax_2f => {
            let (_, min) = arg_extreme(&values, |a, b| a < b);
            let (_, max) = arg_extreme(&values, |a, b| a > b);
            vec![min, max]
        }
        ReductionMode::f_MinIdxMaxIdx_4f => {
            let (min_idx, min) = arg_extreme(&values, |a, b| a < b);
            let (max_idx, max) = arg_extreme(&values, |a, b| a > b);
            vec![min, min_idx, max, max_idx]
        }
    };
    let output = inv.view_mut::<f32>(0, out_offset + result.len())?;
    output[out_offset..].copy_from_slice(&result);
    Ok(())
}

/// First index whose value beats every other under `better`, as floats.
/// An empty input yields `(0, 0)`.
fn arg_extreme(values: &[f32], better: impl Fn(f32, f32) -> bool) -> (f32, f32) {
    let mut best = match values.first() {
        Some(first) => (0, *first),
        None => return (0.0, 0.0),
    };
    for (i, value) in values.iter().copied().enumerate().skip(1) {
        if better(value, best.1) {
            best = (i, value);
        }
    }
    (best.0 as f32, best.1)
}

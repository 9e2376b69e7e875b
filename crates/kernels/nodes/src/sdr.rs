//! Scalar to sparse distributed representation.
//!
//! A scalar in `[min, max]` is encoded as a run of `on_bits` ones inside a
//! vector of `length` zeros. The run starts at
//! `round((x - min) / resolution)` where
//! `resolution = (max - min) / (length - on_bits)`, so neighbouring scalars
//! share bits. Decoding finds the window of `on_bits` with the most ones.

use brainflow_runtime::{
    ElementType, NodeDecl, NodeLogic, NodeView, Result, SizingContext, Task, TaskContext, TaskDecl,
    Validator,
};
use serde::{Deserialize, Serialize};

const ENCODE: &str = "Encode";
const DECODE: &str = "Decode";

/// Encoder parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SdrParams {
    pub min: f32,
    pub max: f32,
    /// Bits per encoded scalar.
    pub length: usize,
    /// Ones per encoded scalar.
    pub on_bits: usize,
}

impl Default for SdrParams {
    fn default() -> Self {
        Self {
            min: -1.0,
            max: 1.0,
            length: 1024,
            on_bits: 20,
        }
    }
}

impl SdrParams {
    /// Scalar distance between two adjacent run positions.
    pub fn resolution(&self) -> f32 {
        if self.length > self.on_bits {
            (self.max - self.min) / (self.length - self.on_bits) as f32
        } else {
            0.0
        }
    }

    fn start_of(&self, value: f32) -> usize {
        let resolution = self.resolution();
        if resolution <= 0.0 {
            return 0;
        }
        let value = value.clamp(self.min, self.max);
        let start = ((value - self.min) / resolution).round() as usize;
        start.min(self.length - self.on_bits)
    }

    /// Encode `values` into `values.len() * length` bits.
    pub fn encode(&self, values: &[f32]) -> Vec<f32> {
        let mut bits = vec![0.0; values.len() * self.length];
        if self.length == 0 || self.on_bits >= self.length {
            return bits;
        }
        for (row, value) in bits.chunks_exact_mut(self.length).zip(values) {
            let start = self.start_of(*value);
            row[start..start + self.on_bits].fill(1.0);
        }
        bits
    }

    /// Decode every full row of `length` bits back into a scalar.
    pub fn decode(&self, bits: &[f32]) -> Vec<f32> {
        if self.length == 0 || self.on_bits >= self.length {
            return vec![self.min; bits.len() / self.length.max(1)];
        }
        let resolution = self.resolution();
        bits.chunks_exact(self.length)
            .map(|row| self.min + best_window(row, self.on_bits) as f32 * resolution)
            .collect()
    }
}

/// Start of the first `width`-wide window holding the most set bits.
fn best_window(row: &[f32], width: usize) -> usize {
    let is_set = |bit: f32| usize::from(bit > 0.5);
    let mut count: usize = row[..width].iter().copied().map(is_set).sum();
    let (mut best, mut best_count) = (0, count);
    for start in 1..=row.len() - width {
        count = count + is_set(row[start + width - 1]) - is_set(row[start - 1]);
        if count > best_count {
            best = start;
            best_count = count;
        }
    }
    best
}

/// Encodes scalars to SDR bit vectors, or decodes them back.
///
/// The `Encode` and `Decode` tasks are exclusive; `Encode` is the default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalarToSdr {
    pub params: SdrParams,
}

impl ScalarToSdr {
    pub fn new(params: SdrParams) -> Self {
        Self { params }
    }
}

impl NodeLogic for ScalarToSdr {
    fn kind(&self) -> &'static str {
        "ScalarToSDR"
    }

    fn declare(&self) -> NodeDecl {
        NodeDecl::new()
            .input("Input")
            .output("Output", ElementType::F32)
            .task(TaskDecl::new(ENCODE).in_group("Mode"))
            .task(TaskDecl::new(DECODE).in_group("Mode").disabled())
    }

    fn update_memory_blocks(&mut self, sizing: &mut SizingContext<'_>) {
        if sizing.input(0).is_none() {
            return;
        }
        let input = sizing.input_count(0);
        let length = self.params.length;
        if sizing.task_enabled(ENCODE) {
            sizing.set_count(0, input * length);
            sizing.set_column_hint(0, length.max(1));
        } else if sizing.task_enabled(DECODE) {
            sizing.set_count(0, input / length.max(1));
            sizing.set_column_hint(0, 1);
        }
    }

    fn validate(&self, validator: &mut Validator, view: &NodeView<'_>) {
        let length = self.params.length;
        validator.assert_error(
            length > 0,
            view.id(),
            "The length of encoded output has to be larger than 0",
        );
        validator.assert_error(
            self.params.on_bits < length,
            view.id(),
            "ON_BITS should be smaller than LENGTH (around 2% of LENGTH is recommended)",
        );
        validator.assert_error(
            self.params.max > self.params.min,
            view.id(),
            "MAX has to be larger than MIN",
        );
        if view.task(DECODE).is_some_and(Task::is_enabled)
            && let Some(input) = view.input(0)
            && length > 0
        {
            validator.assert_warning(
                input.count() % length == 0,
                view.id(),
                "Input size is not a multiple of LENGTH, trailing bits are ignored",
            );
        }
    }

    fn execute_task(&mut self, task: &Task, ctx: &mut TaskContext<'_>) -> Result<()> {
        let input = ctx.read_input::<f32>(0)?;
        let output = match task.name() {
            DECODE => self.params.decode(&input),
            _ => self.params.encode(&input),
        };
        ctx.write_block(0, &output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generate::GeneratedInput;
    use crate::testing::{output, pipeline, prepared};

    fn small() -> SdrParams {
        SdrParams {
            min: 0.0,
            max: 1.0,
            length: 10,
            on_bits: 2,
        }
    }

    #[test]
    fn test_defaults() {
        let params = SdrParams::default();
        assert_eq!((params.length, params.on_bits), (1024, 20));
        assert_eq!(params.resolution(), 2.0 / 1004.0);
    }

    #[test]
    fn test_encode_places_run() {
        let bits = small().encode(&[0.5, 2.0]);
        assert_eq!(bits.len(), 20);
        let ones: Vec<usize> = bits
            .iter()
            .enumerate()
            .filter(|(_, b)| **b == 1.0)
            .map(|(i, _)| i)
            .collect();
        // 0.5 / 0.125 = 4; 2.0 is clamped to the last position (8)
        assert_eq!(ones, vec![4, 5, 18, 19]);
    }

    #[test]
    fn test_decode_picks_first_best_window() {
        let params = small();
        let mut row = vec![0.0; 10];
        row[4] = 1.0;
        row[5] = 1.0;
        assert_eq!(params.decode(&row), vec![0.5]);

        // Several windows tie: the first wins
        let mut row = vec![0.0; 10];
        row[2] = 1.0;
        row[7] = 1.0;
        assert_eq!(params.decode(&row), vec![0.125]);
    }

    #[test]
    fn test_encode_decode_network() {
        let (mut sim, _, encoder) = pipeline(
            GeneratedInput::user_data("0.5 -2").unwrap(),
            ScalarToSdr::new(small()),
        );
        let root = sim.graph().root();
        let decoder = sim
            .graph_mut()
            .add_node(root, "Decoder", ScalarToSdr::new(small()).into())
            .unwrap();
        sim.graph_mut().connect(encoder, 0, decoder, 0).unwrap();
        sim.graph_mut().select_task(decoder, DECODE).unwrap();
        prepared(&mut sim);
        sim.step().unwrap();

        let graph = sim.graph();
        let encoded = graph.block(graph.output_block(encoder, 0).unwrap()).unwrap();
        assert_eq!((encoded.count(), encoded.column_hint()), (20, 10));
        assert_eq!(output(&sim, decoder, 0), vec![0.5, 0.0]);
    }

    #[test]
    fn test_invalid_lengths() {
        let params = SdrParams {
            length: 4,
            on_bits: 4,
            ..SdrParams::default()
        };
        let source = GeneratedInput::user_data("1").unwrap();
        let (mut sim, _, _) = pipeline(source, ScalarToSdr::new(params));
        sim.update_memory_model().unwrap();
        assert!(sim.validate().has_error_containing("ON_BITS should be smaller"));
    }
}

//! Demo networks for the CLI and the end-to-end tests.

use std::fmt;
use std::str::FromStr;

use brainflow_nodes::{
    AbsoluteValue, BuiltinNode, ClockWorld, GenerateParams, GenerateType, GeneratedInput,
    Reduction, ReductionMode, ScalarToSdr, kernel_registry,
};
use brainflow_runtime::{DeviceConfig, DeviceId, ExecutionContext, Graph, Simulation};
use tracing::info;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Demo {
    /// Shifting ramp through `|x|` into a min/max reduction, plus a clock.
    Transforms,
    /// Sine wave encoded to an SDR and decoded on the last device.
    Sdr,
    /// User data normalized inside a group, then arg-max reduced.
    Groups,
}

impl Demo {
    pub const ALL: [Demo; 3] = [Demo::Transforms, Demo::Sdr, Demo::Groups];

    pub fn name(self) -> &'static str {
        match self {
            Demo::Transforms => "transforms",
            Demo::Sdr => "sdr",
            Demo::Groups => "groups",
        }
    }

    /// Build the network for a context with `device_count` devices.
    pub fn build(self, device_count: usize) -> Result<Graph<BuiltinNode>> {
        let mut graph = Graph::new();
        match self {
            Demo::Transforms => transforms(&mut graph)?,
            Demo::Sdr => sdr(&mut graph, device_count)?,
            Demo::Groups => groups(&mut graph)?,
        }
        info!(demo = %self, nodes = graph.node_count(), "demo network built");
        Ok(graph)
    }

    /// The network bound to a fresh execution context with the built-in kernels.
    pub fn simulation(self, devices: &DeviceConfig) -> Result<Simulation<BuiltinNode>> {
        let exec = ExecutionContext::new(devices);
        let graph = self.build(exec.device_count())?;
        Ok(Simulation::new(graph, exec, kernel_registry()))
    }
}

impl fmt::Display for Demo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Demo {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Demo::ALL
            .into_iter()
            .find(|demo| demo.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::UnknownDemo {
                name: s.to_string(),
                available: Demo::ALL.map(Demo::name).join(", "),
            })
    }
}

fn transforms(graph: &mut Graph<BuiltinNode>) -> Result<()> {
    let root = graph.root();
    let world = graph.set_world("World", ClockWorld.into())?;

    let ramp = GeneratedInput::new(GenerateType::Linear, 8).with_params(GenerateParams {
        min_value: -1.0,
        max_value: 1.0,
        shift_speed: 1,
    });
    let ramp = graph.add_node(root, "Ramp", ramp.into())?;
    let abs = graph.add_node(root, "Abs", AbsoluteValue::new().into())?;
    let range = Reduction::new(ReductionMode::f_MinMax_2f);
    let range = graph.add_node(root, "Range", range.into())?;
    let clock = graph.add_node(root, "Clock", Reduction::default().into())?;

    graph.connect(ramp, 0, abs, 0)?;
    graph.connect(abs, 0, range, 0)?;
    graph.connect(world, 0, clock, 0)?;
    Ok(())
}

fn sdr(graph: &mut Graph<BuiltinNode>, device_count: usize) -> Result<()> {
    let root = graph.root();
    let mut wave = GeneratedInput::new(GenerateType::Sine, 1);
    wave.set_user_input("0.05")?;
    let wave = graph.add_node(root, "Wave", wave.into())?;
    let encoder = graph.add_node(root, "Encoder", ScalarToSdr::default().into())?;
    let decoder = graph.add_node(root, "Decoder", ScalarToSdr::default().into())?;

    graph.select_task(decoder, "Decode")?;
    graph.set_node_device(decoder, DeviceId(device_count.saturating_sub(1)))?;
    graph.connect(wave, 0, encoder, 0)?;
    graph.connect(encoder, 0, decoder, 0)?;
    Ok(())
}

fn groups(graph: &mut Graph<BuiltinNode>) -> Result<()> {
    let root = graph.root();
    let data = GeneratedInput::user_data("-3 1 -2 4")?;
    let data = graph.add_node(root, "Data", data.into())?;
    let normalize = graph.add_group(root, "Normalize", 1, 1)?;
    let inner = graph.add_node(normalize, "Unit", AbsoluteValue::vector_normalized().into())?;
    let peak = Reduction::new(ReductionMode::f_MaxIdx_fi);
    let peak = graph.add_node(root, "Peak", peak.into())?;

    graph.connect(data, 0, normalize, 0)?;
    let group_in = graph.group_input(normalize, 0)?;
    let group_out = graph.group_output(normalize, 0)?;
    graph.connect(group_in, 0, inner, 0)?;
    graph.connect(inner, 0, group_out, 0)?;
    graph.connect(normalize, 0, peak, 0)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use brainflow_runtime::NodeId;

    use super::*;

    fn values(sim: &Simulation<BuiltinNode>, name: &str) -> Vec<f32> {
        let graph = sim.graph();
        let node: NodeId = graph.find_by_name(name).unwrap();
        let block = graph.block(graph.output_block(node, 0).unwrap()).unwrap();
        (0..block.count())
            .map(|i| block.value_at::<f32>(sim.exec(), i).unwrap())
            .collect()
    }

    #[test]
    fn test_names_round_trip() {
        for demo in Demo::ALL {
            assert_eq!(demo.name().parse::<Demo>().unwrap(), demo);
        }
        assert_eq!("SDR".parse::<Demo>().unwrap(), Demo::Sdr);
        let err = "mnist".parse::<Demo>().unwrap_err();
        assert_eq!(
            err.to_string(),
            "unknown demo 'mnist' (available: transforms, sdr, groups)"
        );
    }

    #[test]
    fn test_every_demo_runs() {
        for demo in Demo::ALL {
            let mut sim = demo.simulation(&DeviceConfig::default()).unwrap();
            sim.check_and_prepare().unwrap();
            for _ in 0..3 {
                sim.step().unwrap();
            }
            assert_eq!(sim.current_step(), 3);
        }
    }

    #[test]
    fn test_transforms_values() {
        let mut sim = Demo::Transforms.simulation(&DeviceConfig::default()).unwrap();
        sim.check_and_prepare().unwrap();
        sim.step().unwrap();
        sim.step().unwrap();

        assert_eq!(values(&sim, "Clock"), vec![1.0]);
        let range = values(&sim, "Range");
        assert!(range[0] >= 0.0);
        assert!((range[1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_groups_peak() {
        let mut sim = Demo::Groups.simulation(&DeviceConfig::default()).unwrap();
        sim.check_and_prepare().unwrap();
        sim.step().unwrap();

        let peak = values(&sim, "Peak");
        assert!((peak[0] - 4.0 / 30f32.sqrt()).abs() < 1e-6);
        assert_eq!(peak[1], 3.0);
    }

    #[test]
    fn test_sdr_decoder_on_last_device() {
        let devices = DeviceConfig {
            device_count: 2,
            memory_limit_bytes: None,
        };
        let mut sim = Demo::Sdr.simulation(&devices).unwrap();
        let decoder = sim.graph().find_by_name("Decoder").unwrap();
        assert_eq!(sim.graph().node(decoder).unwrap().device(), DeviceId(1));

        sim.check_and_prepare().unwrap();
        let resolution = 2.0 / 1004.0;
        for step in 0..3 {
            sim.step().unwrap();
            let expected = (2.0 * std::f32::consts::PI * 0.05 * step as f32).sin();
            assert!((values(&sim, "Decoder")[0] - expected).abs() <= resolution);
        }
    }
}

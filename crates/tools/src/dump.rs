//! JSON dump of block contents.

use brainflow_runtime::{ElementType, NodeLogic, Simulation};
use serde::Serialize;

use crate::error::Result;

/// One output block as read from its owning device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockDump {
    pub node: String,
    pub block: String,
    pub element: ElementType,
    pub count: usize,
    pub column_hint: usize,
    pub values: Vec<f64>,
}

/// Every output block of every working node, world included, in graph order.
pub fn dump_blocks<N: NodeLogic>(simulation: &Simulation<N>) -> Result<Vec<BlockDump>> {
    let graph = simulation.graph();
    let mut dumps = Vec::new();
    for node in graph.nodes().filter(|node| node.is_working()) {
        for id in node.blocks() {
            let block = graph.block(*id)?;
            if !block.is_output() {
                continue;
            }
            let values = (0..block.count())
                .map(|i| block.value_at_f64(simulation.exec(), i))
                .collect::<brainflow_runtime::Result<Vec<_>>>()?;
            dumps.push(BlockDump {
                node: node.name().to_string(),
                block: block.name().to_string(),
                element: block.element(),
                count: block.count(),
                column_hint: block.column_hint(),
                values,
            });
        }
    }
    Ok(dumps)
}

pub fn to_json(dumps: &[BlockDump]) -> Result<String> {
    Ok(serde_json::to_string_pretty(dumps)?)
}

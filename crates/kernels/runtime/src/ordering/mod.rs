//! Execution ordering of working nodes.
//!
//! Two strategies produce an [`ExecutionOrder`]:
//!
//! - [`FlatOrdering`] ignores groups and sorts every working node in the
//!   network by its resolved producers.
//! - [`HierarchicalOrdering`] sorts the children of each group on their own
//!   and expands sub-groups in place, so a group's contents run together.
//!
//! Both are stable: nodes without a dependency between them keep their
//! declaration order. A cycle is reported as [`Error::CycleDetected`](crate::Error::CycleDetected). The
//! world node is never part of an order; the scheduler runs it first.

mod topology;

pub use topology::CycleError;

use brainflow_foundation::NodeId;
use tracing::debug;

use crate::error::Result;
use crate::graph::{Graph, NodeBody};
use crate::node::NodeLogic;

/// A linear schedule of nodes, tagged with the graph revision it was built for.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecutionOrder {
    nodes: Vec<NodeId>,
    revision: u64,
}

impl ExecutionOrder {
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.iter().copied()
    }

    /// Position of `id` in the schedule.
    pub fn position(&self, id: NodeId) -> Option<usize> {
        self.nodes.iter().position(|n| *n == id)
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Still matches the graph it was computed for.
    pub fn is_current<N: NodeLogic>(&self, graph: &Graph<N>) -> bool {
        self.revision == graph.revision()
    }
}

/// A strategy for ordering the nodes of a graph.
pub trait OrderingAlgorithm<N: NodeLogic> {
    fn evaluate_order(&self, graph: &Graph<N>) -> Result<ExecutionOrder>;
}

/// Order every working node in the network as one flat set.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlatOrdering;

impl<N: NodeLogic> OrderingAlgorithm<N> for FlatOrdering {
    fn evaluate_order(&self, graph: &Graph<N>) -> Result<ExecutionOrder> {
        let items: Vec<NodeId> = graph.working_nodes().collect();
        let mut edges = Vec::new();
        for id in &items {
            let inputs = graph.node(*id)?.inputs().len();
            for input in 0..inputs {
                if let Some(producer) = graph.producer_of(*id, input) {
                    edges.push((producer, *id));
                }
            }
        }
        let nodes = topology::stable_topological_order(&items, &edges)?;
        debug!(nodes = nodes.len(), "flat ordering evaluated");
        Ok(ExecutionOrder {
            nodes,
            revision: graph.revision(),
        })
    }
}

/// Order group by group, starting from the root.
#[derive(Debug, Clone, Copy)]
pub struct HierarchicalOrdering {
    expand_groups: bool,
}

impl HierarchicalOrdering {
    /// Sub-groups are replaced by their own ordered contents.
    pub fn expanded() -> Self {
        Self { expand_groups: true }
    }

    /// Sub-groups stay in the order as opaque entries.
    pub fn opaque() -> Self {
        Self {
            expand_groups: false,
        }
    }

    /// Order the children of `group`.
    pub fn evaluate_group_order<N: NodeLogic>(&self, graph: &Graph<N>, group: NodeId) -> Result<ExecutionOrder> {
        let mut nodes = Vec::new();
        self.order_group(graph, group, &mut nodes)?;
        Ok(ExecutionOrder {
            nodes,
            revision: graph.revision(),
        })
    }

    fn order_group<N: NodeLogic>(&self, graph: &Graph<N>, group: NodeId, out: &mut Vec<NodeId>) -> Result<()> {
        let children = graph.children(group)?;
        let mut edges = Vec::new();
        for child in children {
            for connection in graph.node(*child)?.inputs().iter().flatten() {
                edges.push((connection.from, *child));
            }
        }
        let sorted = topology::stable_topological_order(children, &edges)?;

        for id in sorted {
            match graph.node(id)?.body() {
                NodeBody::Working(_) => out.push(id),
                NodeBody::Group(_) if self.expand_groups => self.order_group(graph, id, out)?,
                NodeBody::Group(_) => out.push(id),
                NodeBody::GroupInput { .. } | NodeBody::GroupOutput { .. } => {}
            }
        }
        Ok(())
    }
}

impl Default for HierarchicalOrdering {
    fn default() -> Self {
        Self::expanded()
    }
}

impl<N: NodeLogic> OrderingAlgorithm<N> for HierarchicalOrdering {
    fn evaluate_order(&self, graph: &Graph<N>) -> Result<ExecutionOrder> {
        let order = self.evaluate_group_order(graph, graph.root())?;
        debug!(nodes = order.len(), "hierarchical ordering evaluated");
        Ok(order)
    }
}

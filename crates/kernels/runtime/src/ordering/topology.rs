//! Stable topological sorting and cycle detection.

use std::collections::BTreeSet;

use brainflow_foundation::NodeId;

use crate::error::Error;

/// Error returned when the dependency edges contain a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleError {
    /// Nodes that could not be ordered: the cycle members and anything
    /// waiting on them.
    pub involved_nodes: Vec<NodeId>,
}

impl From<CycleError> for Error {
    fn from(err: CycleError) -> Self {
        Error::CycleDetected {
            nodes: err.involved_nodes,
        }
    }
}

/// Order `items` so every edge `(before, after)` is respected.
///
/// Kahn's algorithm. Among the nodes ready at any point, the one declared
/// first (lowest position in `items`) goes next, so unrelated nodes keep
/// their declaration order. Edges naming nodes outside `items` are ignored.
pub(super) fn stable_topological_order(
    items: &[NodeId],
    edges: &[(NodeId, NodeId)],
) -> Result<Vec<NodeId>, CycleError> {
    let position = |id: NodeId| items.iter().position(|item| *item == id);

    let mut in_degree = vec![0usize; items.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); items.len()];
    let mut seen = BTreeSet::new();
    for (before, after) in edges {
        let (Some(b), Some(a)) = (position(*before), position(*after)) else {
            continue;
        };
        // Two connections between the same pair count as one dependency
        if seen.insert((b, a)) {
            in_degree[a] += 1;
            dependents[b].push(a);
        }
    }

    let mut ready: BTreeSet<usize> = (0..items.len()).filter(|i| in_degree[*i] == 0).collect();
    let mut order = Vec::with_capacity(items.len());
    while let Some(next) = ready.pop_first() {
        order.push(items[next]);
        for dependent in &dependents[next] {
            in_degree[*dependent] -= 1;
            if in_degree[*dependent] == 0 {
                ready.insert(*dependent);
            }
        }
    }

    if order.len() != items.len() {
        let involved_nodes = (0..items.len())
            .filter(|i| in_degree[*i] > 0)
            .map(|i| items[i])
            .collect();
        return Err(CycleError { involved_nodes });
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[u32]) -> Vec<NodeId> {
        raw.iter().copied().map(NodeId).collect()
    }

    #[test]
    fn test_declaration_order_breaks_ties() {
        let items = ids(&[5, 3, 9]);
        assert_eq!(stable_topological_order(&items, &[]).unwrap(), items);
    }

    #[test]
    fn test_edges_override_declaration_order() {
        let items = ids(&[1, 2, 3]);
        let edges = [(NodeId(3), NodeId(1)), (NodeId(2), NodeId(3))];
        assert_eq!(
            stable_topological_order(&items, &edges).unwrap(),
            ids(&[2, 3, 1])
        );
    }

    #[test]
    fn test_cycle_reports_involved_nodes() {
        let items = ids(&[1, 2, 3, 4]);
        let edges = [
            (NodeId(1), NodeId(2)),
            (NodeId(2), NodeId(3)),
            (NodeId(3), NodeId(2)),
            (NodeId(3), NodeId(4)),
        ];
        let err = stable_topological_order(&items, &edges).unwrap_err();
        assert_eq!(err.involved_nodes, ids(&[2, 3, 4]));
    }

    #[test]
    fn test_self_loop_is_a_cycle() {
        let items = ids(&[1]);
        let err = stable_topological_order(&items, &[(NodeId(1), NodeId(1))]).unwrap_err();
        assert_eq!(err.involved_nodes, ids(&[1]));
    }
}

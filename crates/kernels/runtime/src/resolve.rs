//! Memory-model resolution.
//!
//! Block sizes propagate along connections: a node sizes its outputs from the
//! sizes of its inputs. The resolver visits the world node and then every
//! node of an [`ExecutionOrder`], letting each recompute its sizes, and
//! repeats the pass until a full pass changes nothing. With a topological
//! order an acyclic size dependency settles after one changing pass plus one
//! confirming pass. Nodes whose sizes depend on something other than their
//! inputs may need more.
//!
//! A graph that has not settled after the attempt limit is reported as
//! unstable; validation turns that into an error.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, trace, warn};

use crate::error::Result;
use crate::graph::Graph;
use crate::node::NodeLogic;
use crate::ordering::ExecutionOrder;

/// Default limit on resolution passes.
pub const MAX_BLOCKS_UPDATE_ATTEMPTS: u32 = 20;

/// Outcome of a resolution run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionReport {
    /// Passes executed, the final confirming pass included.
    pub passes: u32,
    /// Passes in which at least one size changed.
    pub changing_rounds: u32,
    /// The last pass changed nothing.
    pub stable: bool,
}

/// Fixed-point iteration over block sizes.
#[derive(Debug, Clone, Copy)]
pub struct MemoryModelResolver {
    max_attempts: u32,
}

impl Default for MemoryModelResolver {
    fn default() -> Self {
        Self::new(MAX_BLOCKS_UPDATE_ATTEMPTS)
    }
}

impl MemoryModelResolver {
    /// A resolver giving up after `max_attempts` passes (at least one).
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Run passes over `graph` in `order` until sizes stop changing.
    #[instrument(skip_all, name = "memory_model", fields(nodes = order.len()))]
    pub fn resolve<N: NodeLogic>(&self, graph: &mut Graph<N>, order: &ExecutionOrder) -> Result<ResolutionReport> {
        if order.is_empty() && graph.world().is_none() {
            debug!("nothing to resolve");
            return Ok(ResolutionReport {
                passes: 0,
                changing_rounds: 0,
                stable: true,
            });
        }

        let mut changing_rounds = 0;
        for pass in 1..=self.max_attempts {
            let mut changed = false;
            if let Some(world) = graph.world() {
                changed |= graph.update_memory_blocks(world)?;
            }
            for id in order.iter() {
                changed |= graph.update_memory_blocks(id)?;
            }
            trace!(pass, changed, "resolution pass");

            if !changed {
                info!("Successful update after {pass} cycle(s).");
                return Ok(ResolutionReport {
                    passes: pass,
                    changing_rounds,
                    stable: true,
                });
            }
            changing_rounds += 1;
        }

        warn!(attempts = self.max_attempts, "memory block sizes did not settle");
        Ok(ResolutionReport {
            passes: self.max_attempts,
            changing_rounds,
            stable: false,
        })
    }
}

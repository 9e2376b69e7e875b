//! The node graph: working nodes, groups and the connections between them.
//!
//! Every graph has a root group (the network) and optionally a world node.
//! Groups own child nodes and expose their own input and output slots; inside
//! the group those slots appear as boundary nodes ([`NodeBody::GroupInput`]
//! and [`NodeBody::GroupOutput`]). Connections only join nodes in the same
//! group, except that the world node may feed any node.
//!
//! A consumer never reads a group boundary. [`Graph::resolve_input_block`]
//! follows boundaries through any depth of nesting to the memory block of the
//! working node that actually produces the data.
//!
//! Every structural edit bumps [`Graph::revision`], which invalidates cached
//! execution orders.


use brainflow_foundation::{BlockId, DeviceId, NodeId, TaskId};
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::device::ExecutionContext;
use crate::error::{Error, Result};
use crate::kernel::KernelRegistry;
use crate::memory::{BlockStore, MemoryBlock};
use crate::node::{InputDecl, NodeLogic, NodeView, SizingContext, TaskContext};
use crate::task::{Task, TaskState};

/// A directed edge from an output slot to an input slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Connection {
    pub from: NodeId,
    pub from_output: usize,
    pub to: NodeId,
    pub to_input: usize,
}

/// Child lists and boundary nodes of a group.
#[derive(Debug, Clone, Default)]
pub struct GroupBody {
    children: Vec<NodeId>,
    input_nodes: Vec<NodeId>,
    output_nodes: Vec<NodeId>,
}

impl GroupBody {
    /// Children in declaration order, boundary nodes excluded.
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn input_nodes(&self) -> &[NodeId] {
        &self.input_nodes
    }

    pub fn output_nodes(&self) -> &[NodeId] {
        &self.output_nodes
    }
}

/// What a node is.
#[derive(Debug)]
pub enum NodeBody<N> {
    /// A node with blocks and tasks.
    Working(N),
    /// A container of other nodes.
    Group(GroupBody),
    /// Inside view of the group's input slot `index`.
    GroupInput { index: usize },
    /// Inside view of the group's output slot `index`.
    GroupOutput { index: usize },
}

/// A node and its wiring.
#[derive(Debug)]
pub struct Node<N> {
    id: NodeId,
    name: String,
    body: NodeBody<N>,
    parent: Option<NodeId>,
    device: DeviceId,
    input_decls: Vec<InputDecl>,
    inputs: Vec<Option<Connection>>,
    blocks: Vec<BlockId>,
    tasks: Vec<Task>,
}

impl<N> Node<N> {
    fn structural(id: NodeId, name: String, body: NodeBody<N>, parent: Option<NodeId>, inputs: usize) -> Self {
        Self {
            id,
            name,
            body,
            parent,
            device: DeviceId::PRIMARY,
            input_decls: (0..inputs)
                .map(|i| InputDecl {
                    name: format!("Input {}", i + 1),
                    optional: true,
                })
                .collect(),
            inputs: vec![None; inputs],
            blocks: Vec::new(),
            tasks: Vec::new(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn body(&self) -> &NodeBody<N> {
        &self.body
    }

    /// Node logic of a working node.
    pub fn logic(&self) -> Option<&N> {
        match &self.body {
            NodeBody::Working(logic) => Some(logic),
            _ => None,
        }
    }

    pub fn is_working(&self) -> bool {
        matches!(self.body, NodeBody::Working(_))
    }

    pub fn is_group(&self) -> bool {
        matches!(self.body, NodeBody::Group(_))
    }

    /// Enclosing group. `None` for the root group and the world node.
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn input_decls(&self) -> &[InputDecl] {
        &self.input_decls
    }

    pub fn inputs(&self) -> &[Option<Connection>] {
        &self.inputs
    }

    pub fn input(&self, index: usize) -> Option<Connection> {
        self.inputs.get(index).copied().flatten()
    }

    /// Memory blocks in declaration order.
    pub fn blocks(&self) -> &[BlockId] {
        &self.blocks
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn task(&self, name: &str) -> Option<&Task> {
        self.tasks.iter().find(|task| task.name() == name)
    }

    /// Number of output slots.
    pub fn output_count(&self) -> usize {
        match &self.body {
            NodeBody::Working(_) => self.blocks.len(),
            NodeBody::Group(group) => group.output_nodes.len(),
            NodeBody::GroupInput { .. } => 1,
            NodeBody::GroupOutput { .. } => 0,
        }
    }
}

/// The node graph and the memory blocks its nodes own.
#[derive(Debug)]
pub struct Graph<N> {
    nodes: IndexMap<NodeId, Node<N>>,
    blocks: BlockStore,
    root: NodeId,
    world: Option<NodeId>,
    next_id: u32,
    revision: u64,
}

impl<N: NodeLogic> Default for Graph<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<N: NodeLogic> Graph<N> {
    /// An empty network: a root group and no world.
    pub fn new() -> Self {
        let root = NodeId(0);
        let mut nodes = IndexMap::new();
        nodes.insert(
            root,
            Node::structural(root, "Network".to_string(), NodeBody::Group(GroupBody::default()), None, 0),
        );
        Self {
            nodes,
            blocks: BlockStore::new(),
            root,
            world: None,
            next_id: 1,
            revision: 0,
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn world(&self) -> Option<NodeId> {
        self.world
    }

    /// Structural revision, bumped on every edit.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Mark the graph as changed, e.g. after editing node parameters that
    /// affect block sizes.
    pub fn touch(&mut self) {
        self.revision += 1;
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node<N>> {
        self.nodes.values()
    }

    pub fn node(&self, id: NodeId) -> Result<&Node<N>> {
        self.nodes.get(&id).ok_or(Error::NodeNotFound(id))
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// First node named `name`, in creation order.
    pub fn find_by_name(&self, name: &str) -> Option<NodeId> {
        self.nodes.values().find(|n| n.name == name).map(|n| n.id)
    }

    pub fn logic(&self, id: NodeId) -> Result<&N> {
        self.node(id)?.logic().ok_or(Error::NodeNotFound(id))
    }

    /// Mutable node logic. Counts as an edit, since parameters may change sizes.
    pub fn logic_mut(&mut self, id: NodeId) -> Result<&mut N> {
        let node = self.nodes.get_mut(&id).ok_or(Error::NodeNotFound(id))?;
        match &mut node.body {
            NodeBody::Working(logic) => {
                self.revision += 1;
                Ok(logic)
            }
            _ => Err(Error::NodeNotFound(id)),
        }
    }

    pub fn blocks(&self) -> &BlockStore {
        &self.blocks
    }

    pub fn blocks_mut(&mut self) -> &mut BlockStore {
        &mut self.blocks
    }

    pub fn block(&self, id: BlockId) -> Result<&MemoryBlock> {
        self.blocks.get(id)
    }

    /// Block `index` of node `id`.
    pub fn output_block(&self, id: NodeId, index: usize) -> Result<BlockId> {
        self.node(id)?
            .blocks
            .get(index)
            .copied()
            .ok_or_else(|| Error::InvalidConnection {
                from: id,
                from_output: index,
                to: id,
                to_input: 0,
                reason: "no such block".to_string(),
            })
    }

    fn group(&self, id: NodeId) -> Result<&GroupBody> {
        match &self.node(id)?.body {
            NodeBody::Group(group) => Ok(group),
            _ => Err(Error::NotAGroup(id)),
        }
    }

    fn group_mut(&mut self, id: NodeId) -> Result<&mut GroupBody> {
        match &mut self.nodes.get_mut(&id).ok_or(Error::NodeNotFound(id))?.body {
            NodeBody::Group(group) => Ok(group),
            _ => Err(Error::NotAGroup(id)),
        }
    }

    /// Children of a group in declaration order.
    pub fn children(&self, group: NodeId) -> Result<&[NodeId]> {
        Ok(self.group(group)?.children())
    }

    fn next_node_id(&mut self) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        id
    }

    // ========================================================================
    // Editing
    // ========================================================================

    fn build_working(&mut self, id: NodeId, name: String, logic: N, parent: Option<NodeId>) -> Node<N> {
        let decl = logic.declare();
        let blocks = decl
            .blocks
            .into_iter()
            .map(|spec| self.blocks.insert(spec, id, DeviceId::PRIMARY))
            .collect();
        let tasks = decl
            .tasks
            .into_iter()
            .enumerate()
            .map(|(index, task)| Task::new(TaskId { node: id, index }, task))
            .collect();
        Node {
            id,
            name,
            body: NodeBody::Working(logic),
            parent,
            device: DeviceId::PRIMARY,
            inputs: vec![None; decl.inputs.len()],
            input_decls: decl.inputs,
            blocks,
            tasks,
        }
    }

    /// Add a working node to `parent`.
    pub fn add_node(&mut self, parent: NodeId, name: impl Into<String>, logic: N) -> Result<NodeId> {
        self.group(parent)?;
        let id = self.next_node_id();
        let node = self.build_working(id, name.into(), logic, Some(parent));
        debug!(node = %id, name = %node.name, kind = node.logic().map(N::kind).unwrap_or_default(), "node added");
        self.nodes.insert(id, node);
        self.group_mut(parent)?.children.push(id);
        self.revision += 1;
        Ok(id)
    }

    /// Install the world node, replacing any previous one.
    ///
    /// The world has no parent, runs first in every resolution round and
    /// step, and may feed nodes in any group.
    pub fn set_world(&mut self, name: impl Into<String>, logic: N) -> Result<NodeId> {
        if let Some(old) = self.world {
            let node = self.node(old)?;
            for block in &node.blocks {
                if self.blocks.get(*block)?.on_device() {
                    return Err(Error::AlreadyAllocated {
                        block: self.blocks.get(*block)?.name().to_string(),
                    });
                }
            }
            self.detach(old);
        }
        let id = self.next_node_id();
        let node = self.build_working(id, name.into(), logic, None);
        self.nodes.insert(id, node);
        self.world = Some(id);
        self.revision += 1;
        debug!(node = %id, "world node set");
        Ok(id)
    }

    /// Add a group with `inputs` input slots and `outputs` output slots.
    pub fn add_group(
        &mut self,
        parent: NodeId,
        name: impl Into<String>,
        inputs: usize,
        outputs: usize,
    ) -> Result<NodeId> {
        self.group(parent)?;
        let id = self.next_node_id();
        let mut body = GroupBody::default();
        for index in 0..inputs {
            let boundary = self.next_node_id();
            let node = Node::structural(boundary, format!("Input {}", index + 1), NodeBody::GroupInput { index }, Some(id), 0);
            self.nodes.insert(boundary, node);
            body.input_nodes.push(boundary);
        }
        for index in 0..outputs {
            let boundary = self.next_node_id();
            let node = Node::structural(boundary, format!("Output {}", index + 1), NodeBody::GroupOutput { index }, Some(id), 1);
            self.nodes.insert(boundary, node);
            body.output_nodes.push(boundary);
        }
        self.nodes.insert(
            id,
            Node::structural(id, name.into(), NodeBody::Group(body), Some(parent), inputs),
        );
        self.group_mut(parent)?.children.push(id);
        self.revision += 1;
        debug!(group = %id, inputs, outputs, "group added");
        Ok(id)
    }

    /// Boundary node standing for the group's input slot `index`.
    pub fn group_input(&self, group: NodeId, index: usize) -> Result<NodeId> {
        self.group(group)?
            .input_nodes
            .get(index)
            .copied()
            .ok_or(Error::NodeNotFound(group))
    }

    /// Boundary node standing for the group's output slot `index`.
    pub fn group_output(&self, group: NodeId, index: usize) -> Result<NodeId> {
        self.group(group)?
            .output_nodes
            .get(index)
            .copied()
            .ok_or(Error::NodeNotFound(group))
    }

    /// Connect `from`'s output slot to `to`'s input slot.
    pub fn connect(&mut self, from: NodeId, from_output: usize, to: NodeId, to_input: usize) -> Result<()> {
        let invalid = |reason: &str| Error::InvalidConnection {
            from,
            from_output,
            to,
            to_input,
            reason: reason.to_string(),
        };
        let source = self.node(from)?;
        let target = self.node(to)?;

        if source.parent != target.parent && Some(from) != self.world {
            return Err(invalid("nodes are in different groups"));
        }
        if from_output >= source.output_count() {
            return Err(invalid("no such output"));
        }
        if let NodeBody::Working(_) = source.body
            && !self.blocks.get(source.blocks[from_output])?.is_output()
        {
            return Err(invalid("block is not an output"));
        }
        match target.inputs.get(to_input) {
            None => return Err(invalid("no such input")),
            Some(Some(_)) => {
                return Err(Error::InputAlreadyConnected {
                    node: to,
                    input: to_input,
                });
            }
            Some(None) => {}
        }

        let connection = Connection {
            from,
            from_output,
            to,
            to_input,
        };
        if let Some(node) = self.nodes.get_mut(&to) {
            node.inputs[to_input] = Some(connection);
        }
        self.revision += 1;
        trace!(%from, from_output, %to, to_input, "connected");
        Ok(())
    }

    /// Remove the connection into `to`'s input slot, returning it.
    pub fn disconnect(&mut self, to: NodeId, to_input: usize) -> Result<Option<Connection>> {
        let node = self.nodes.get_mut(&to).ok_or(Error::NodeNotFound(to))?;
        let removed = node.inputs.get_mut(to_input).and_then(Option::take);
        if removed.is_some() {
            self.revision += 1;
        }
        Ok(removed)
    }

    /// Every connection in the graph.
    pub fn connections(&self) -> impl Iterator<Item = Connection> + '_ {
        self.nodes
            .values()
            .flat_map(|node| node.inputs.iter().flatten().copied())
    }

    /// Connections that removing `id` unbinds: every connection between
    /// `id` (or a node nested in it) and the rest of the graph.
    pub fn connections_affected_by(&self, id: NodeId) -> Vec<Connection> {
        let doomed: IndexSet<NodeId> = self.subtree(id).into_iter().collect();
        self.connections()
            .filter(|c| doomed.contains(&c.from) != doomed.contains(&c.to))
            .collect()
    }

    /// `id` and, for groups, every node nested in it.
    fn subtree(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            out.push(next);
            if let Some(Node {
                body: NodeBody::Group(group),
                ..
            }) = self.nodes.get(&next)
            {
                stack.extend(group.children.iter().rev());
                stack.extend(&group.input_nodes);
                stack.extend(&group.output_nodes);
            }
        }
        out
    }

    /// Remove a node (and everything nested in it) with its connections.
    ///
    /// Device memory of the removed blocks is released. Returns the removed
    /// connections that crossed into the rest of the graph.
    pub fn remove_node(&mut self, id: NodeId, exec: &mut ExecutionContext) -> Result<Vec<Connection>> {
        let node = self.node(id)?;
        let boundary = matches!(node.body, NodeBody::GroupInput { .. } | NodeBody::GroupOutput { .. });
        if id == self.root || boundary {
            return Err(Error::ProtectedNode(id));
        }

        let doomed: IndexSet<NodeId> = self.subtree(id).into_iter().collect();
        let crossing = self.connections_affected_by(id);
        let stale = self
            .downstream_of(id)
            .into_iter()
            .filter(|n| !doomed.contains(n))
            .count();
        for connection in &crossing {
            if let Some(node) = self.nodes.get_mut(&connection.to)
                && !doomed.contains(&connection.to)
            {
                node.inputs[connection.to_input] = None;
            }
        }

        for node_id in &doomed {
            if let Some(node) = self.nodes.get(node_id) {
                for block in node.blocks.clone() {
                    if let Some(mut removed) = self.blocks.remove(block) {
                        removed.free_device(exec)?;
                    }
                }
            }
        }
        self.detach(id);
        for node_id in doomed {
            self.nodes.shift_remove(&node_id);
        }
        self.revision += 1;
        debug!(node = %id, removed_connections = crossing.len(), stale_consumers = stale, "node removed");
        Ok(crossing)
    }

    /// Unlink `id` from its parent or the world slot.
    fn detach(&mut self, id: NodeId) {
        if self.world == Some(id) {
            self.world = None;
            for block in self.nodes.get(&id).map(|n| n.blocks.clone()).unwrap_or_default() {
                self.blocks.remove(block);
            }
            for node in self.nodes.values_mut() {
                for input in node.inputs.iter_mut() {
                    if input.is_some_and(|c| c.from == id) {
                        *input = None;
                    }
                }
            }
            self.nodes.shift_remove(&id);
            return;
        }
        let parent = self.nodes.get(&id).and_then(|n| n.parent);
        if let Some(parent) = parent
            && let Ok(group) = self.group_mut(parent)
        {
            group.children.retain(|child| *child != id);
        }
    }

    /// Place a node on `device`. Fails while any of its blocks is allocated.
    pub fn set_node_device(&mut self, id: NodeId, device: DeviceId) -> Result<()> {
        let node = self.nodes.get_mut(&id).ok_or(Error::NodeNotFound(id))?;
        for block in &node.blocks {
            self.blocks.get_mut(*block)?.set_owner_device(device)?;
        }
        node.device = device;
        self.revision += 1;
        Ok(())
    }

    /// Enable or disable the task named `task`.
    pub fn set_task_enabled(&mut self, id: NodeId, task: &str, enabled: bool) -> Result<()> {
        let node = self.nodes.get_mut(&id).ok_or(Error::NodeNotFound(id))?;
        let entry = node
            .tasks
            .iter_mut()
            .find(|t| t.name() == task)
            .ok_or_else(|| Error::TaskNotFound {
                node: id,
                task: task.to_string(),
            })?;
        entry.set_enabled(enabled);
        self.revision += 1;
        Ok(())
    }

    /// Enable `task` and disable the other tasks of its group.
    pub fn select_task(&mut self, id: NodeId, task: &str) -> Result<()> {
        let node = self.nodes.get_mut(&id).ok_or(Error::NodeNotFound(id))?;
        let group = node
            .tasks
            .iter()
            .find(|t| t.name() == task)
            .ok_or_else(|| Error::TaskNotFound {
                node: id,
                task: task.to_string(),
            })?
            .group()
            .map(str::to_string);
        for entry in node.tasks.iter_mut() {
            if entry.name() == task {
                entry.set_enabled(true);
            } else if group.is_some() && entry.group() == group.as_deref() {
                entry.set_enabled(false);
            }
        }
        self.revision += 1;
        Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Working node and block index that ultimately feed `node`'s input slot.
    pub fn resolve_source(&self, node: NodeId, input: usize) -> Option<(NodeId, usize)> {
        let mut connection = self.nodes.get(&node)?.input(input)?;
        // Each hop crosses one boundary, so more hops than nodes means a loop
        for _ in 0..=self.nodes.len() {
            let source = self.nodes.get(&connection.from)?;
            match &source.body {
                NodeBody::Working(_) => return Some((connection.from, connection.from_output)),
                NodeBody::Group(group) => {
                    let boundary = *group.output_nodes.get(connection.from_output)?;
                    connection = self.nodes.get(&boundary)?.input(0)?;
                }
                NodeBody::GroupInput { index } => {
                    let group = source.parent?;
                    connection = self.nodes.get(&group)?.input(*index)?;
                }
                NodeBody::GroupOutput { .. } => return None,
            }
        }
        None
    }

    /// The block read through `node`'s input slot, following group boundaries.
    pub fn resolve_input_block(&self, node: NodeId, input: usize) -> Option<BlockId> {
        let (producer, output) = self.resolve_source(node, input)?;
        self.nodes.get(&producer)?.blocks.get(output).copied()
    }

    /// Resolved blocks for every input slot of `node`.
    pub fn resolved_inputs(&self, node: NodeId) -> Vec<Option<BlockId>> {
        let count = self.nodes.get(&node).map_or(0, |n| n.inputs.len());
        (0..count)
            .map(|input| self.resolve_input_block(node, input))
            .collect()
    }

    /// Working node that produces `node`'s input slot.
    pub fn producer_of(&self, node: NodeId, input: usize) -> Option<NodeId> {
        self.resolve_source(node, input).map(|(producer, _)| producer)
    }

    /// Working nodes other than the world, in creation order.
    pub fn working_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .values()
            .filter(|n| n.is_working() && Some(n.id) != self.world)
            .map(|n| n.id)
    }

    /// Working nodes that transitively consume data produced by `id`.
    ///
    /// For a group, the data produced anywhere inside it.
    pub fn downstream_of(&self, id: NodeId) -> IndexSet<NodeId> {
        let mut consumers: IndexMap<NodeId, Vec<NodeId>> = IndexMap::new();
        for node in self.nodes.values().filter(|n| n.is_working()) {
            for input in 0..node.inputs.len() {
                if let Some(producer) = self.producer_of(node.id, input) {
                    consumers.entry(producer).or_default().push(node.id);
                }
            }
        }

        let mut reached = IndexSet::new();
        let mut frontier = self.subtree(id);
        while let Some(next) = frontier.pop() {
            for consumer in consumers.get(&next).into_iter().flatten() {
                if reached.insert(*consumer) {
                    frontier.push(*consumer);
                }
            }
        }
        reached
    }

    /// Read-only view of a working node for validation.
    pub fn view(&self, id: NodeId) -> Result<NodeView<'_>> {
        let node = self.node(id)?;
        let inputs = (0..node.inputs.len())
            .map(|input| {
                self.resolve_input_block(id, input)
                    .and_then(|block| self.blocks.get(block).ok())
            })
            .collect();
        let blocks = node
            .blocks
            .iter()
            .filter_map(|block| self.blocks.get(*block).ok())
            .collect();
        Ok(NodeView {
            id,
            name: &node.name,
            device: node.device,
            input_decls: &node.input_decls,
            inputs,
            blocks,
            tasks: &node.tasks,
        })
    }

    // ========================================================================
    // Runtime operations
    // ========================================================================

    /// Let node `id` recompute its block sizes. Returns whether any changed.
    pub(crate) fn update_memory_blocks(&mut self, id: NodeId) -> Result<bool> {
        let inputs = self.resolved_inputs(id);
        let node = self.nodes.get_mut(&id).ok_or(Error::NodeNotFound(id))?;
        let Node {
            body, blocks, tasks, ..
        } = node;
        let NodeBody::Working(logic) = body else {
            return Ok(false);
        };

        for block in blocks.iter() {
            self.blocks.get_mut(*block)?.push_sizes();
        }
        let mut sizing = SizingContext {
            node: id,
            blocks: &mut self.blocks,
            inputs: &inputs,
            own: blocks.as_slice(),
            tasks: tasks.as_slice(),
        };
        logic.update_memory_blocks(&mut sizing);

        let mut changed = false;
        for block in blocks.iter() {
            let block = self.blocks.get(*block)?;
            if block.size_changed() {
                trace!(node = %id, block = block.name(), count = block.count(), "size changed");
                changed = true;
            }
        }
        Ok(changed)
    }

    /// Bring the blocks of node `id` to their resolved sizes on host and device.
    pub(crate) fn allocate_node(&mut self, id: NodeId, exec: &mut ExecutionContext) -> Result<()> {
        let blocks = self.node(id)?.blocks.clone();
        for block in blocks {
            let block = self.blocks.get_mut(block)?;
            block.reallocate_if_resized(exec)?;
            block.allocate_host();
            block.allocate_device(exec)?;
        }
        Ok(())
    }

    /// Run init for every enabled task of node `id` that needs it.
    pub(crate) fn init_node(
        &mut self,
        id: NodeId,
        exec: &mut ExecutionContext,
        kernels: &KernelRegistry,
        step: u64,
    ) -> Result<()> {
        self.run_tasks(id, exec, kernels, step, None)
    }

    /// Execute the enabled tasks of node `id` for one step.
    pub(crate) fn execute_node(
        &mut self,
        id: NodeId,
        exec: &mut ExecutionContext,
        kernels: &KernelRegistry,
        step: u64,
        first_step: bool,
    ) -> Result<()> {
        self.run_tasks(id, exec, kernels, step, Some(first_step))
    }

    /// Shared task loop. `first_step` is `None` for an init-only pass.
    fn run_tasks(
        &mut self,
        id: NodeId,
        exec: &mut ExecutionContext,
        kernels: &KernelRegistry,
        step: u64,
        first_step: Option<bool>,
    ) -> Result<()> {
        let inputs = self.resolved_inputs(id);
        let node = self.nodes.get_mut(&id).ok_or(Error::NodeNotFound(id))?;
        let Node {
            body,
            blocks,
            tasks,
            device,
            ..
        } = node;
        let NodeBody::Working(logic) = body else {
            return Ok(());
        };
        let device = *device;
        let mut ctx = TaskContext {
            node: id,
            device,
            step,
            blocks: &mut self.blocks,
            exec,
            kernels,
            inputs: &inputs,
            own: blocks.as_slice(),
        };

        for task in tasks.iter_mut() {
            if !task.is_enabled() {
                continue;
            }
            if task.needs_init(device) {
                logic
                    .init_task(task, &mut ctx)
                    .map_err(|e| task_failure(id, task, e))?;
                task.mark_initialized(device);
                trace!(task = %task.id(), name = task.name(), %device, "task initialized");
            }
            let Some(first_step) = first_step else {
                continue;
            };
            if !task.should_run(first_step) {
                continue;
            }
            task.set_state(TaskState::Executing);
            let result = logic.execute_task(task, &mut ctx);
            task.set_state(TaskState::Ready);
            result.map_err(|e| task_failure(id, task, e))?;
        }
        Ok(())
    }

    /// Release all memory and return every task to uninitialized.
    pub(crate) fn free_all(&mut self, exec: &mut ExecutionContext) -> Result<()> {
        for block in self.blocks.iter_mut() {
            block.free_device(exec)?;
            block.free_host();
        }
        for node in self.nodes.values_mut() {
            for task in node.tasks.iter_mut() {
                task.reset();
            }
        }
        Ok(())
    }
}

fn task_failure(node: NodeId, task: &Task, error: Error) -> Error {
    let message = match error {
        Error::TaskFailed { message, .. } => message,
        other => other.to_string(),
    };
    Error::TaskFailed {
        node,
        task: task.name().to_string(),
        message,
    }
}

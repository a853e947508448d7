//! Arena-backed computation graph.

use std::collections::HashMap;
use std::fmt;

use super::node::{Arg, Node, NodeId, OpKind, Target};

/// Name given to a graph's output node
pub const OUTPUT_NAME: &str = "output";

/// An ordered collection of operation nodes forming one callable.
///
/// Nodes live in an arena addressed by [`NodeId`]; erased nodes leave a
/// tombstone so ids stay stable while the graph is rewritten. Execution
/// order is kept separately and always has producers before consumers.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: Vec<Option<Node>>,
    order: Vec<NodeId>,
    names: HashMap<String, NodeId>,
    output: Option<NodeId>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a placeholder (positional input) to the graph
    pub fn placeholder(&mut self, name: impl Into<String>) -> crate::Result<NodeId> {
        let position = self.output_position();
        self.insert(name.into(), OpKind::Placeholder, position)
    }

    /// Append a call node
    pub fn call(
        &mut self,
        name: impl Into<String>,
        target: Target,
        args: Vec<Arg>,
    ) -> crate::Result<NodeId> {
        let position = self.output_position();
        self.insert(name.into(), OpKind::Call { target, args }, position)
    }

    /// Insert a placeholder immediately before `anchor` in execution order
    pub fn insert_placeholder_before(
        &mut self,
        anchor: NodeId,
        name: impl Into<String>,
    ) -> crate::Result<NodeId> {
        let position = self.position(anchor)?;
        self.insert(name.into(), OpKind::Placeholder, position)
    }

    /// Set the graph's result, replacing any previous output node.
    pub fn set_output(&mut self, values: Vec<NodeId>) -> crate::Result<NodeId> {
        if let Some(old) = self.output.take() {
            self.remove(old);
        }
        let position = self.order.len();
        let id = self.insert(OUTPUT_NAME.to_string(), OpKind::Output { values }, position)?;
        self.output = Some(id);
        Ok(id)
    }

    fn insert(&mut self, name: String, op: OpKind, position: usize) -> crate::Result<NodeId> {
        if self.names.contains_key(&name) {
            return Err(crate::LayerwiseError::GraphError(format!(
                "duplicate node name `{}`",
                name
            )));
        }

        let node = Node { name, op };
        for input in node.inputs() {
            if !self.contains(input) {
                return Err(crate::LayerwiseError::GraphError(format!(
                    "node `{}` references unknown node {:?}",
                    node.name, input
                )));
            }
        }

        let id = NodeId(self.nodes.len() as u32);
        self.names.insert(node.name.clone(), id);
        self.nodes.push(Some(node));
        self.order.insert(position, id);
        Ok(id)
    }

    /// New nodes go before the output node so it stays last
    fn output_position(&self) -> usize {
        match self.output {
            Some(out) => self.order.iter().position(|&id| id == out).unwrap_or(self.order.len()),
            None => self.order.len(),
        }
    }

    fn position(&self, id: NodeId) -> crate::Result<usize> {
        self.order
            .iter()
            .position(|&n| n == id)
            .ok_or_else(|| crate::LayerwiseError::GraphError(format!("unknown node {:?}", id)))
    }

    fn remove(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.get_mut(id.index()).and_then(Option::take) {
            self.names.remove(&node.name);
        }
        self.order.retain(|&n| n != id);
        if self.output == Some(id) {
            self.output = None;
        }
    }

    pub fn contains(&self, id: NodeId) -> bool {
        matches!(self.nodes.get(id.index()), Some(Some(_)))
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index()).and_then(Option::as_ref)
    }

    pub fn node(&self, id: NodeId) -> crate::Result<&Node> {
        self.get(id)
            .ok_or_else(|| crate::LayerwiseError::GraphError(format!("unknown node {:?}", id)))
    }

    /// Look a node up by name
    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.names.get(name).copied()
    }

    /// Live nodes in execution order
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Node)> + '_ {
        self.order
            .iter()
            .filter_map(move |&id| self.get(id).map(|node| (id, node)))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Placeholders in positional order
    pub fn placeholders(&self) -> Vec<NodeId> {
        self.iter()
            .filter(|(_, node)| node.is_placeholder())
            .map(|(id, _)| id)
            .collect()
    }

    pub fn output(&self) -> Option<NodeId> {
        self.output
    }

    /// Values returned by the output node
    pub fn output_values(&self) -> &[NodeId] {
        match self.output.and_then(|id| self.get(id)).map(Node::op) {
            Some(OpKind::Output { values }) => values,
            _ => &[],
        }
    }

    /// Nodes reading `id`, in execution order
    pub fn users(&self, id: NodeId) -> Vec<NodeId> {
        self.iter()
            .filter(|(_, node)| node.inputs().contains(&id))
            .map(|(user, _)| user)
            .collect()
    }

    /// Redirect every reference to `from` onto `to`, returning the number of
    /// rewritten references.
    pub fn replace_all_uses(&mut self, from: NodeId, to: NodeId) -> usize {
        let mut replaced = 0;
        for node in self.nodes.iter_mut().flatten() {
            for input in node.inputs_mut() {
                if *input == from {
                    *input = to;
                    replaced += 1;
                }
            }
        }
        replaced
    }

    /// Remove a node nobody reads.
    pub fn erase(&mut self, id: NodeId) -> crate::Result<()> {
        let name = self.node(id)?.name.clone();
        let users = self.users(id);
        if !users.is_empty() {
            return Err(crate::LayerwiseError::GraphError(format!(
                "cannot erase `{}`: still used by {} node(s)",
                name,
                users.len()
            )));
        }
        self.remove(id);
        Ok(())
    }

    /// A name not yet taken in this graph, derived from `base`
    pub fn fresh_name(&self, base: &str) -> String {
        let base: String = base
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
            .collect();
        if !self.names.contains_key(&base) {
            return base;
        }
        let mut suffix = 1;
        loop {
            let candidate = format!("{}_{}", base, suffix);
            if !self.names.contains_key(&candidate) {
                return candidate;
            }
            suffix += 1;
        }
    }

    fn arg_text(&self, arg: &Arg) -> String {
        match arg {
            Arg::Node(id) => self
                .get(*id)
                .map(|n| n.name.clone())
                .unwrap_or_else(|| format!("{:?}", id)),
            Arg::Literal(literal) => literal.to_string(),
        }
    }
}

/// Renders the graph as pseudo code, one statement per node.
impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inputs: Vec<&str> = self
            .placeholders()
            .into_iter()
            .filter_map(|id| self.get(id).map(Node::name))
            .collect();
        writeln!(f, "def forward({}):", inputs.join(", "))?;

        for (_, node) in self.iter() {
            match &node.op {
                OpKind::Placeholder => {}
                OpKind::Call { target, args } => {
                    let args: Vec<String> = args.iter().map(|a| self.arg_text(a)).collect();
                    writeln!(f, "    {} = {}({})", node.name, target, args.join(", "))?;
                }
                OpKind::Output { values } => {
                    let names: Vec<String> =
                        values.iter().map(|&v| self.arg_text(&Arg::Node(v))).collect();
                    if names.len() == 1 {
                        writeln!(f, "    return {}", names[0])?;
                    } else {
                        writeln!(f, "    return ({})", names.join(", "))?;
                    }
                }
            }
        }
        Ok(())
    }
}

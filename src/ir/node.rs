//! Operation nodes of a traced computation.

use std::fmt;

use super::value::Literal;

/// Index of a node inside its graph's arena.
///
/// Ids are only meaningful for the graph that issued them; crossing graphs
/// goes through node names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Built-in operations the layer interpreter evaluates itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Builtin {
    /// `blocks[i]`: select layer `i`'s local subgraph from the graph input.
    /// Marks the per-layer boundary; rewritten away before splitting.
    GetBlock,
    /// `tuple[i]`
    GetItem,
    Add,
    Sub,
    Mul,
    Relu,
    /// `flatten(x, start_dim)`
    Flatten,
    /// `mean(x, dim)`
    Mean,
    /// `sum(x, dim)`
    Sum,
    /// `cat(x0, x1, ..., dim)`
    Cat,
}

impl Builtin {
    pub fn name(&self) -> &'static str {
        match self {
            Builtin::GetBlock => "get_block",
            Builtin::GetItem => "getitem",
            Builtin::Add => "add",
            Builtin::Sub => "sub",
            Builtin::Mul => "mul",
            Builtin::Relu => "relu",
            Builtin::Flatten => "flatten",
            Builtin::Mean => "mean",
            Builtin::Sum => "sum",
            Builtin::Cat => "cat",
        }
    }
}

/// What a call node invokes.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    /// A sub-component of the module, looked up by its registered name
    Module(String),
    Builtin(Builtin),
}

impl Target {
    pub fn is_builtin(&self, builtin: Builtin) -> bool {
        matches!(self, Target::Builtin(b) if *b == builtin)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Module(name) => write!(f, "self.{}", name),
            Target::Builtin(b) => write!(f, "{}", b.name()),
        }
    }
}

/// A call argument: either another node's result or a constant.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Node(NodeId),
    Literal(Literal),
}

impl Arg {
    pub fn node(&self) -> Option<NodeId> {
        match self {
            Arg::Node(id) => Some(*id),
            Arg::Literal(_) => None,
        }
    }
}

impl From<NodeId> for Arg {
    fn from(id: NodeId) -> Self {
        Arg::Node(id)
    }
}

impl From<Literal> for Arg {
    fn from(literal: Literal) -> Self {
        Arg::Literal(literal)
    }
}

impl From<i64> for Arg {
    fn from(i: i64) -> Self {
        Arg::Literal(Literal::Int(i))
    }
}

impl From<f64> for Arg {
    fn from(x: f64) -> Self {
        Arg::Literal(Literal::Float(x))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    Placeholder,
    Call { target: Target, args: Vec<Arg> },
    /// Graph result; one value is returned bare, several as a tuple
    Output { values: Vec<NodeId> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub(crate) name: String,
    pub(crate) op: OpKind,
}

impl Node {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn op(&self) -> &OpKind {
        &self.op
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self.op, OpKind::Placeholder)
    }

    pub fn is_output(&self) -> bool {
        matches!(self.op, OpKind::Output { .. })
    }

    /// Nodes this node reads, in argument order (duplicates kept)
    pub fn inputs(&self) -> Vec<NodeId> {
        match &self.op {
            OpKind::Placeholder => Vec::new(),
            OpKind::Call { args, .. } => args.iter().filter_map(Arg::node).collect(),
            OpKind::Output { values } => values.clone(),
        }
    }

    pub(crate) fn inputs_mut(&mut self) -> Vec<&mut NodeId> {
        match &mut self.op {
            OpKind::Placeholder => Vec::new(),
            OpKind::Call { args, .. } => args
                .iter_mut()
                .filter_map(|arg| match arg {
                    Arg::Node(id) => Some(id),
                    Arg::Literal(_) => None,
                })
                .collect(),
            OpKind::Output { values } => values.iter_mut().collect(),
        }
    }
}

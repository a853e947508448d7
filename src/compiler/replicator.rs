//! Builds a new graph from selected nodes of an existing one.

use std::collections::HashMap;

use crate::ir::{Arg, Graph, NodeId, OpKind};

/// Copies nodes across graphs, remapping references by name.
///
/// Inputs are declared up front; every copied node must only reference
/// nodes already declared or copied.
#[derive(Debug, Default)]
pub struct GraphReplicator {
    graph: Graph,
    remap: HashMap<String, NodeId>,
}

impl GraphReplicator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare_input(&mut self, name: &str) -> crate::Result<NodeId> {
        let id = self.graph.placeholder(name)?;
        self.remap.insert(name.to_string(), id);
        Ok(id)
    }

    pub fn declare_inputs<I, S>(&mut self, names: I) -> crate::Result<Vec<NodeId>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        names
            .into_iter()
            .map(|name| self.declare_input(name.as_ref()))
            .collect()
    }

    /// Copy node `id` of `source`, keeping its name
    pub fn copy_node(&mut self, source: &Graph, id: NodeId) -> crate::Result<NodeId> {
        let node = source.node(id)?;
        let new_id = match node.op() {
            OpKind::Placeholder => return self.declare_input(node.name()),
            OpKind::Call { target, args } => {
                let args = args
                    .iter()
                    .map(|arg| self.remap_arg(source, node.name(), arg))
                    .collect::<crate::Result<Vec<_>>>()?;
                self.graph.call(node.name(), target.clone(), args)?
            }
            OpKind::Output { .. } => {
                return Err(crate::LayerwiseError::GraphError(
                    "output nodes are not copied; use finalize_outputs".to_string(),
                ))
            }
        };
        self.remap.insert(node.name().to_string(), new_id);
        Ok(new_id)
    }

    fn remap_arg(&self, source: &Graph, user: &str, arg: &Arg) -> crate::Result<Arg> {
        match arg {
            Arg::Literal(literal) => Ok(Arg::Literal(literal.clone())),
            Arg::Node(id) => {
                let name = source.node(*id)?.name();
                self.remap.get(name).map(|&new| Arg::Node(new)).ok_or_else(|| {
                    crate::LayerwiseError::ConfigError(format!(
                        "`{}` reads `{}`, which is neither copied nor declared as an input",
                        user, name
                    ))
                })
            }
        }
    }

    /// Return the named values: bare for one, a tuple otherwise
    pub fn finalize_outputs<I, S>(&mut self, names: I) -> crate::Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let values = names
            .into_iter()
            .map(|name| {
                let name = name.as_ref();
                self.remap.get(name).copied().ok_or_else(|| {
                    crate::LayerwiseError::ConfigError(format!("unknown output `{}`", name))
                })
            })
            .collect::<crate::Result<Vec<_>>>()?;
        self.graph.set_output(values)?;
        Ok(())
    }

    pub fn finish(self) -> Graph {
        self.graph
    }
}

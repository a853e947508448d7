//! Cuts a normalized graph into one graph per layer.

use std::collections::{BTreeSet, HashMap};

use super::replicator::GraphReplicator;
use super::rewriter::is_block_name;
use crate::ir::{Graph, NodeId, OpKind};

/// Splits a graph at its block placeholders.
///
/// Each call node belongs to the layer of the latest block it transitively
/// reads; nodes that read no block at all are hoisted into layer 0.
pub struct GraphRearranger<'a> {
    graph: &'a Graph,
}

impl<'a> GraphRearranger<'a> {
    pub fn new(graph: &'a Graph) -> Self {
        Self { graph }
    }

    /// Block placeholders in order of first appearance
    pub fn boundaries(&self) -> Vec<NodeId> {
        self.graph
            .iter()
            .filter(|(_, node)| node.is_placeholder() && is_block_name(node.name()))
            .map(|(id, _)| id)
            .collect()
    }

    /// Layer owning each call node and block placeholder
    fn assign(&self, boundaries: &[NodeId]) -> HashMap<NodeId, usize> {
        let boundary_layer: HashMap<NodeId, usize> =
            boundaries.iter().enumerate().map(|(l, &id)| (id, l)).collect();

        // Latest boundary reached, None when a node depends on none
        let mut depends: HashMap<NodeId, Option<usize>> = HashMap::new();
        let mut owner = HashMap::new();
        for (id, node) in self.graph.iter() {
            match node.op() {
                OpKind::Placeholder => {
                    let layer = boundary_layer.get(&id).copied();
                    if let Some(l) = layer {
                        owner.insert(id, l);
                    }
                    depends.insert(id, layer);
                }
                OpKind::Call { .. } => {
                    let layer = node
                        .inputs()
                        .iter()
                        .filter_map(|input| depends.get(input).copied().flatten())
                        .max();
                    depends.insert(id, layer);
                    owner.insert(id, layer.unwrap_or(0));
                }
                OpKind::Output { .. } => {}
            }
        }
        owner
    }

    pub fn split(&self) -> crate::Result<Vec<Graph>> {
        let boundaries = self.boundaries();
        if boundaries.is_empty() {
            return Err(crate::LayerwiseError::NoLayerBoundaries);
        }

        let position: HashMap<NodeId, usize> = self
            .graph
            .iter()
            .enumerate()
            .map(|(pos, (id, _))| (id, pos))
            .collect();
        let owner = self.assign(&boundaries);
        let is_member = |id: NodeId, layer: usize| {
            owner.get(&id) == Some(&layer)
                && self.graph.get(id).is_some_and(|n| !n.is_placeholder())
        };

        // Readers of each value: layers, plus the graph output as `usize::MAX`
        let mut readers: HashMap<NodeId, BTreeSet<usize>> = HashMap::new();
        for (id, node) in self.graph.iter() {
            let reader = if node.is_output() {
                usize::MAX
            } else {
                match owner.get(&id) {
                    Some(&l) if !node.is_placeholder() => l,
                    _ => continue,
                }
            };
            for input in node.inputs() {
                readers.entry(input).or_default().insert(reader);
            }
        }

        let mut layers = Vec::with_capacity(boundaries.len());
        for layer in 0..boundaries.len() {
            let members: Vec<NodeId> = self
                .graph
                .iter()
                .map(|(id, _)| id)
                .filter(|&id| is_member(id, layer))
                .collect();

            let mut inputs: Vec<NodeId> = members
                .iter()
                .flat_map(|&id| self.graph.get(id).map(|n| n.inputs()).unwrap_or_default())
                .filter(|&input| !is_member(input, layer))
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            inputs.sort_by_key(|id| position.get(id).copied().unwrap_or(usize::MAX));

            let outputs: Vec<NodeId> = members
                .iter()
                .copied()
                .filter(|id| {
                    readers
                        .get(id)
                        .is_some_and(|r| r.iter().any(|&reader| reader > layer))
                })
                .collect();

            let mut replicator = GraphReplicator::new();
            for &input in &inputs {
                replicator.declare_input(self.graph.node(input)?.name())?;
            }
            for &member in &members {
                replicator.copy_node(self.graph, member)?;
            }
            let output_names = outputs
                .iter()
                .map(|&id| self.graph.node(id).map(|n| n.name().to_string()))
                .collect::<crate::Result<Vec<_>>>()?;
            replicator.finalize_outputs(&output_names)?;

            tracing::trace!(
                "Layer {}: {} nodes, {} inputs, {} outputs",
                layer,
                members.len(),
                inputs.len(),
                outputs.len()
            );
            layers.push(replicator.finish());
        }

        Ok(layers)
    }
}

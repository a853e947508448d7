//! In-place rewrites run on a traced graph before it is split.

use std::collections::HashSet;

use crate::ir::{Arg, Builtin, Graph, Literal, NodeId, OpKind};

/// Name prefix of the placeholders standing in for per-layer blocks
pub const BLOCK_PREFIX: &str = "__block_";

/// Placeholder name for layer `index`'s block
pub fn block_name(index: usize) -> String {
    format!("{}{}", BLOCK_PREFIX, index)
}

/// Whether `name` is a block placeholder created by [`normalize`]
pub fn is_block_name(name: &str) -> bool {
    name.strip_prefix(BLOCK_PREFIX)
        .is_some_and(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
}

/// Replace every `GetBlock(graph, i)` call with a `__block_{i}` placeholder.
///
/// Calls selecting the same index share one placeholder. Returns the number
/// of calls replaced; a second run finds nothing to do.
pub fn normalize(graph: &mut Graph) -> crate::Result<usize> {
    let selections: Vec<(NodeId, usize)> = graph
        .iter()
        .filter_map(|(id, node)| match node.op() {
            OpKind::Call { target, args } if target.is_builtin(Builtin::GetBlock) => {
                Some(block_index(node.name(), args).map(|i| (id, i)))
            }
            _ => None,
        })
        .collect::<crate::Result<_>>()?;

    for &(call, index) in &selections {
        let name = block_name(index);
        let placeholder = match graph.find(&name) {
            Some(existing) if graph.node(existing)?.is_placeholder() => existing,
            Some(_) => {
                return Err(crate::LayerwiseError::ConfigError(format!(
                    "node `{}` clashes with the block placeholder name",
                    name
                )))
            }
            None => graph.insert_placeholder_before(call, name)?,
        };
        graph.replace_all_uses(call, placeholder);
        graph.erase(call)?;
    }

    if !selections.is_empty() {
        tracing::debug!("Replaced {} block selections with placeholders", selections.len());
    }
    Ok(selections.len())
}

fn block_index(name: &str, args: &[Arg]) -> crate::Result<usize> {
    match args.get(1) {
        Some(Arg::Literal(Literal::Int(i))) if *i >= 0 => Ok(*i as usize),
        other => Err(crate::LayerwiseError::ConfigError(format!(
            "block selection `{}` needs a non-negative integer literal index, got {:?}",
            name, other
        ))),
    }
}

/// Erase call nodes whose results nobody reads, to a fixed point.
///
/// Placeholders and the output node always survive. Returns the number of
/// erased nodes.
pub fn prune(graph: &mut Graph) -> usize {
    let mut erased = 0usize;
    loop {
        let used: HashSet<NodeId> = graph.iter().flat_map(|(_, node)| node.inputs()).collect();
        let dead: Vec<NodeId> = graph
            .iter()
            .filter(|(id, node)| {
                !node.is_placeholder() && !node.is_output() && !used.contains(id)
            })
            .map(|(id, _)| id)
            .collect();
        if dead.is_empty() {
            break;
        }
        for id in dead {
            if graph.erase(id).is_ok() {
                erased += 1;
            }
        }
    }
    erased
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Target;

    fn two_layer() -> Graph {
        let mut g = Graph::new();
        let graph_in = g.placeholder("graph").unwrap();
        let x = g.placeholder("x").unwrap();
        let b0 = g
            .call("get_block", Target::Builtin(Builtin::GetBlock), vec![graph_in.into(), 0i64.into()])
            .unwrap();
        let h = g
            .call("conv", Target::Module("conv".into()), vec![b0.into(), x.into()])
            .unwrap();
        let b1 = g
            .call("get_block_1", Target::Builtin(Builtin::GetBlock), vec![graph_in.into(), 1i64.into()])
            .unwrap();
        let again = g
            .call("get_block_2", Target::Builtin(Builtin::GetBlock), vec![graph_in.into(), 1i64.into()])
            .unwrap();
        let h2 = g
            .call("conv_1", Target::Module("conv".into()), vec![b1.into(), again.into(), h.into()])
            .unwrap();
        g.set_output(vec![h2]).unwrap();
        g
    }

    #[test]
    fn test_normalize_replaces_selections() {
        let mut g = two_layer();
        assert_eq!(normalize(&mut g).unwrap(), 3);
        let names: Vec<String> = g
            .placeholders()
            .into_iter()
            .map(|id| g.node(id).unwrap().name().to_string())
            .collect();
        assert_eq!(names, vec!["graph", "x", "__block_0", "__block_1"]);

        let conv_1 = g.find("conv_1").unwrap();
        let b1 = g.find("__block_1").unwrap();
        assert_eq!(g.node(conv_1).unwrap().inputs()[..2], [b1, b1]);

        // Idempotent
        assert_eq!(normalize(&mut g).unwrap(), 0);
    }

    #[test]
    fn test_normalize_rejects_dynamic_index() {
        let mut g = Graph::new();
        let graph_in = g.placeholder("graph").unwrap();
        let i = g.placeholder("i").unwrap();
        let b = g
            .call("get_block", Target::Builtin(Builtin::GetBlock), vec![graph_in.into(), i.into()])
            .unwrap();
        g.set_output(vec![b]).unwrap();
        let err = normalize(&mut g).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_prune_fixed_point() {
        let mut g = Graph::new();
        let x = g.placeholder("x").unwrap();
        let unused_in = g.placeholder("unused").unwrap();
        let a = g.call("a", Target::Builtin(Builtin::Relu), vec![x.into()]).unwrap();
        let dead1 = g.call("dead1", Target::Builtin(Builtin::Relu), vec![unused_in.into()]).unwrap();
        g.call("dead2", Target::Builtin(Builtin::Relu), vec![dead1.into()]).unwrap();
        g.set_output(vec![a]).unwrap();

        assert_eq!(prune(&mut g), 2);
        assert!(g.find("dead1").is_none());
        assert!(g.find("unused").is_some());
        assert_eq!(prune(&mut g), 0);
    }

    #[test]
    fn test_block_names() {
        assert!(is_block_name("__block_12"));
        assert!(!is_block_name("__block_"));
        assert!(!is_block_name("block_1"));
    }
}

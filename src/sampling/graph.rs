//! Compressed in-edge storage for the input graph.

use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Directed graph stored as in-edge CSR: for every destination node, the
/// list of source nodes with an edge into it.
#[derive(Debug, Clone)]
pub struct CsrGraph {
    num_nodes: usize,
    /// `indptr[v]..indptr[v + 1]` indexes `indices` for node `v`
    indptr: Vec<usize>,
    indices: Vec<u32>,
}

impl CsrGraph {
    /// Build from `(src, dst)` edge pairs
    pub fn from_edges(num_nodes: usize, edges: &[(u32, u32)]) -> crate::Result<Self> {
        let mut degree = vec![0usize; num_nodes];
        for &(src, dst) in edges {
            if src as usize >= num_nodes || dst as usize >= num_nodes {
                return Err(crate::LayerwiseError::ConfigError(format!(
                    "edge ({}, {}) out of range for {} nodes",
                    src, dst, num_nodes
                )));
            }
            degree[dst as usize] += 1;
        }

        let mut indptr = Vec::with_capacity(num_nodes + 1);
        indptr.push(0);
        for d in &degree {
            indptr.push(indptr[indptr.len() - 1] + d);
        }

        let mut cursor = indptr.clone();
        let mut indices = vec![0u32; edges.len()];
        for &(src, dst) in edges {
            let slot = &mut cursor[dst as usize];
            indices[*slot] = src;
            *slot += 1;
        }

        Ok(Self {
            num_nodes,
            indptr,
            indices,
        })
    }

    /// Random graph where each node receives about `avg_in_degree` edges
    pub fn random(num_nodes: usize, avg_in_degree: usize, seed: u64) -> crate::Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut edges = Vec::with_capacity(num_nodes * avg_in_degree);
        if num_nodes > 0 {
            for dst in 0..num_nodes as u32 {
                let degree = rng.random_range(0..=avg_in_degree * 2);
                for _ in 0..degree {
                    edges.push((rng.random_range(0..num_nodes as u32), dst));
                }
            }
        }
        Self::from_edges(num_nodes, &edges)
    }

    /// Load a whitespace separated `src dst` edge list.
    ///
    /// Lines starting with `#` are skipped. The node count is one past the
    /// largest id seen.
    pub fn from_edge_list(path: impl AsRef<Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut edges = Vec::new();
        let mut max_id = None;

        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_whitespace();
            let parse = |part: Option<&str>| -> crate::Result<u32> {
                part.and_then(|p| p.parse().ok()).ok_or_else(|| {
                    crate::LayerwiseError::ConfigError(format!(
                        "malformed edge on line {}: {:?}",
                        lineno + 1,
                        line
                    ))
                })
            };
            let src = parse(parts.next())?;
            let dst = parse(parts.next())?;
            max_id = max_id.max(Some(src.max(dst)));
            edges.push((src, dst));
        }

        let num_nodes = max_id.map_or(0, |m| m as usize + 1);
        Self::from_edges(num_nodes, &edges)
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    pub fn num_edges(&self) -> usize {
        self.indices.len()
    }

    pub fn in_degree(&self, node: u32) -> usize {
        let v = node as usize;
        self.indptr[v + 1] - self.indptr[v]
    }

    pub fn in_neighbors(&self, node: u32) -> &[u32] {
        let v = node as usize;
        &self.indices[self.indptr[v]..self.indptr[v + 1]]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_edges() {
        let g = CsrGraph::from_edges(4, &[(0, 1), (2, 1), (1, 3)]).unwrap();
        assert_eq!(g.num_nodes(), 4);
        assert_eq!(g.num_edges(), 3);
        assert_eq!(g.in_neighbors(1), &[0, 2]);
        assert_eq!(g.in_degree(0), 0);
        assert_eq!(g.in_neighbors(3), &[1]);
    }

    #[test]
    fn test_out_of_range_edge() {
        assert!(CsrGraph::from_edges(2, &[(0, 2)]).is_err());
    }

    #[test]
    fn test_random_is_deterministic() {
        let a = CsrGraph::random(50, 3, 7).unwrap();
        let b = CsrGraph::random(50, 3, 7).unwrap();
        assert_eq!(a.num_edges(), b.num_edges());
        assert_eq!(a.in_neighbors(10), b.in_neighbors(10));
    }

    #[test]
    fn test_from_edge_list() {
        let path = std::env::temp_dir().join("rs_layerwise_edges_test.txt");
        std::fs::write(&path, "# comment\n0 1\n1 2\n\n2 4\n").unwrap();
        let g = CsrGraph::from_edge_list(&path).unwrap();
        assert_eq!(g.num_nodes(), 5);
        assert_eq!(g.num_edges(), 3);
        assert_eq!(g.in_neighbors(4), &[2]);

        std::fs::write(&path, "0 x\n").unwrap();
        assert!(CsrGraph::from_edge_list(&path).is_err());
        let _ = std::fs::remove_file(&path);
    }
}

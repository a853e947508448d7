//! Intermediate representation for traced model computations.
//!
//! This module provides:
//! - `Graph`: arena of operation nodes addressed by `NodeId`
//! - `Node` / `OpKind`: placeholder, call, and output operations
//! - `Value`: runtime values that flow between nodes and across layers

mod graph;
mod node;
mod value;

pub use graph::{Graph, OUTPUT_NAME};
pub use node::{Arg, Builtin, Node, NodeId, OpKind, Target};
pub use value::{Literal, Value};

//! Symbolic tracing of model forward passes.

mod tracer;

pub use tracer::{Proxy, SymbolicTracer, Tracer};

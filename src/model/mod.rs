//! Model surface: traceable modules, their components, and the GraphSAGE
//! reference model.

mod base;
mod sage;

pub use base::{Component, ComponentRegistry, Traceable};
pub use sage::{GraphSage, SageConv};

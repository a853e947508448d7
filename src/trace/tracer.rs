//! Records a module's forward pass as a [`Graph`].

use crate::ir::{Arg, Builtin, Graph, Literal, NodeId, Target};
use crate::model::Traceable;

/// Handle to a value recorded by the tracer.
///
/// Models manipulate proxies exactly where they would manipulate tensors;
/// every operation on them appends a node instead of computing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Proxy(pub(crate) NodeId);

impl Proxy {
    pub fn id(self) -> NodeId {
        self.0
    }
}

impl From<Proxy> for Arg {
    fn from(proxy: Proxy) -> Self {
        Arg::Node(proxy.0)
    }
}

/// Graph under construction during a trace
#[derive(Debug, Default)]
pub struct Tracer {
    graph: Graph,
}

impl Tracer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the next positional input
    pub fn input(&mut self, name: &str) -> crate::Result<Proxy> {
        let name = self.graph.fresh_name(name);
        Ok(Proxy(self.graph.placeholder(name)?))
    }

    /// Call the sub-component registered as `name`
    pub fn call_module(&mut self, name: &str, args: Vec<Arg>) -> crate::Result<Proxy> {
        let node_name = self.graph.fresh_name(name);
        let id = self
            .graph
            .call(node_name, Target::Module(name.to_string()), args)?;
        Ok(Proxy(id))
    }

    pub fn call_builtin(&mut self, builtin: Builtin, args: Vec<Arg>) -> crate::Result<Proxy> {
        let node_name = self.graph.fresh_name(builtin.name());
        Ok(Proxy(self.graph.call(node_name, Target::Builtin(builtin), args)?))
    }

    /// Select layer `index`'s block from the graph input. Each layer must
    /// route its computation through one of these.
    pub fn get_block(&mut self, graph: Proxy, index: usize) -> crate::Result<Proxy> {
        self.call_builtin(
            Builtin::GetBlock,
            vec![graph.into(), Literal::Int(index as i64).into()],
        )
    }

    pub fn get_item(&mut self, tuple: Proxy, index: usize) -> crate::Result<Proxy> {
        self.call_builtin(
            Builtin::GetItem,
            vec![tuple.into(), Literal::Int(index as i64).into()],
        )
    }

    pub fn add(&mut self, lhs: Proxy, rhs: impl Into<Arg>) -> crate::Result<Proxy> {
        self.call_builtin(Builtin::Add, vec![lhs.into(), rhs.into()])
    }

    pub fn sub(&mut self, lhs: Proxy, rhs: impl Into<Arg>) -> crate::Result<Proxy> {
        self.call_builtin(Builtin::Sub, vec![lhs.into(), rhs.into()])
    }

    pub fn mul(&mut self, lhs: Proxy, rhs: impl Into<Arg>) -> crate::Result<Proxy> {
        self.call_builtin(Builtin::Mul, vec![lhs.into(), rhs.into()])
    }

    pub fn relu(&mut self, x: Proxy) -> crate::Result<Proxy> {
        self.call_builtin(Builtin::Relu, vec![x.into()])
    }

    pub fn flatten(&mut self, x: Proxy, start_dim: usize) -> crate::Result<Proxy> {
        self.call_builtin(Builtin::Flatten, vec![x.into(), (start_dim as i64).into()])
    }

    pub fn mean(&mut self, x: Proxy, dim: usize) -> crate::Result<Proxy> {
        self.call_builtin(Builtin::Mean, vec![x.into(), (dim as i64).into()])
    }

    pub fn sum(&mut self, x: Proxy, dim: usize) -> crate::Result<Proxy> {
        self.call_builtin(Builtin::Sum, vec![x.into(), (dim as i64).into()])
    }

    pub fn cat(&mut self, xs: &[Proxy], dim: usize) -> crate::Result<Proxy> {
        let mut args: Vec<Arg> = xs.iter().map(|&x| x.into()).collect();
        args.push((dim as i64).into());
        self.call_builtin(Builtin::Cat, args)
    }

    /// Close the trace with the returned values
    pub fn finish(mut self, outputs: &[Proxy]) -> crate::Result<Graph> {
        self.graph
            .set_output(outputs.iter().map(|p| p.0).collect())?;
        Ok(self.graph)
    }
}

/// Entry point for turning a module into its computation graph
pub struct SymbolicTracer;

impl SymbolicTracer {
    pub fn trace(module: &dyn Traceable) -> crate::Result<Graph> {
        let mut tracer = Tracer::new();
        let inputs = module
            .input_names()
            .iter()
            .map(|name| tracer.input(name))
            .collect::<crate::Result<Vec<_>>>()?;

        let outputs = module.forward(&mut tracer, &inputs)?;
        if outputs.is_empty() {
            return Err(crate::LayerwiseError::GraphError(
                "traced forward returned no values".to_string(),
            ));
        }
        tracer.finish(&outputs)
    }
}

//! Executable per-layer functions.

use std::collections::HashMap;
use std::sync::Arc;

use candle_core::Tensor;

use crate::ir::{Arg, Builtin, Graph, NodeId, OpKind, Target, Value};
use crate::model::{Component, ComponentRegistry};

/// A compiled layer: positional arguments in, a value or tuple out.
pub trait LayerFn: Send + Sync {
    fn call(&self, args: &[Value]) -> crate::Result<Value>;
}

impl<F> LayerFn for F
where
    F: Fn(&[Value]) -> crate::Result<Value> + Send + Sync,
{
    fn call(&self, args: &[Value]) -> crate::Result<Value> {
        self(args)
    }
}

/// Evaluates a layer graph node by node.
///
/// Module targets are bound to their components when the function is
/// built, so a missing component fails compilation instead of the first
/// batch.
pub struct LayerFunction {
    graph: Graph,
    inputs: Vec<NodeId>,
    components: HashMap<String, Arc<dyn Component>>,
    /// Position in execution order after which a value can be dropped
    last_use: HashMap<NodeId, usize>,
}

impl LayerFunction {
    pub fn new(graph: Graph, registry: &ComponentRegistry) -> crate::Result<Self> {
        let mut components = HashMap::new();
        let mut last_use = HashMap::new();
        for (pos, (_, node)) in graph.iter().enumerate() {
            if let OpKind::Call {
                target: Target::Module(name),
                ..
            } = node.op()
            {
                if !components.contains_key(name) {
                    components.insert(name.clone(), registry.resolve(name)?);
                }
            }
            for input in node.inputs() {
                last_use.insert(input, pos);
            }
        }

        Ok(Self {
            inputs: graph.placeholders(),
            graph,
            components,
            last_use,
        })
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    fn eval_node(&self, target: &Target, args: Vec<Value>) -> crate::Result<Value> {
        match target {
            Target::Module(name) => {
                let component = self.components.get(name).ok_or_else(|| {
                    crate::LayerwiseError::UnresolvedComponent(name.clone())
                })?;
                component.forward(&args)
            }
            Target::Builtin(builtin) => eval_builtin(*builtin, args),
        }
    }
}

impl LayerFn for LayerFunction {
    fn call(&self, args: &[Value]) -> crate::Result<Value> {
        if args.len() != self.inputs.len() {
            return Err(crate::LayerwiseError::ArityMismatch {
                expected: self.inputs.len(),
                actual: args.len(),
            });
        }

        let mut env: HashMap<NodeId, Value> = self
            .inputs
            .iter()
            .copied()
            .zip(args.iter().cloned())
            .collect();

        for (pos, (id, node)) in self.graph.iter().enumerate() {
            let fetch = |id: &NodeId| {
                env.get(id).cloned().ok_or_else(|| {
                    crate::LayerwiseError::EvalError(format!("value {:?} not computed", id))
                })
            };
            match node.op() {
                OpKind::Placeholder => continue,
                OpKind::Output { values } => {
                    let outputs = values.iter().map(fetch).collect::<crate::Result<Vec<_>>>()?;
                    return Ok(Value::from_outputs(outputs));
                }
                OpKind::Call { target, args } => {
                    let values = args
                        .iter()
                        .map(|arg| match arg {
                            Arg::Node(id) => fetch(id),
                            Arg::Literal(literal) => Ok(Value::from(literal.clone())),
                        })
                        .collect::<crate::Result<Vec<_>>>()?;
                    let result = self.eval_node(target, values).map_err(|e| match e {
                        crate::LayerwiseError::EvalError(msg) => {
                            crate::LayerwiseError::EvalError(format!("{}: {}", node.name(), msg))
                        }
                        other => other,
                    })?;
                    env.insert(id, result);
                }
            }
            env.retain(|value, _| self.last_use.get(value).is_some_and(|&last| last > pos));
        }

        Err(crate::LayerwiseError::GraphError(
            "layer graph has no output node".to_string(),
        ))
    }
}

fn eval_error(msg: impl Into<String>) -> crate::LayerwiseError {
    crate::LayerwiseError::EvalError(msg.into())
}

/// Resolve a possibly negative dimension against `rank`
fn dim_arg(value: &Value, rank: usize) -> crate::Result<usize> {
    let dim = value.as_int()?;
    let resolved = if dim < 0 { rank as i64 + dim } else { dim };
    if resolved < 0 || resolved as usize >= rank {
        return Err(eval_error(format!("dimension {} out of range for rank {}", dim, rank)));
    }
    Ok(resolved as usize)
}

fn arith(builtin: Builtin, lhs: &Value, rhs: &Value) -> crate::Result<Value> {
    let out = match (lhs, rhs) {
        (Value::Tensor(a), Value::Tensor(b)) => match builtin {
            Builtin::Add => a.broadcast_add(b)?,
            Builtin::Sub => a.broadcast_sub(b)?,
            _ => a.broadcast_mul(b)?,
        },
        (Value::Tensor(t), scalar) => {
            let s = scalar_of(scalar)?;
            match builtin {
                Builtin::Add => t.affine(1.0, s)?,
                Builtin::Sub => t.affine(1.0, -s)?,
                _ => t.affine(s, 0.0)?,
            }
        }
        (scalar, Value::Tensor(t)) => {
            let s = scalar_of(scalar)?;
            match builtin {
                Builtin::Add => t.affine(1.0, s)?,
                Builtin::Sub => t.affine(-1.0, s)?,
                _ => t.affine(s, 0.0)?,
            }
        }
        (Value::Int(a), Value::Int(b)) => {
            let result = match builtin {
                Builtin::Add => a.checked_add(*b),
                Builtin::Sub => a.checked_sub(*b),
                _ => a.checked_mul(*b),
            };
            return result
                .map(Value::Int)
                .ok_or_else(|| eval_error(format!("{:?} of {} and {} overflows", builtin, a, b)));
        }
        (a, b) => {
            let (a, b) = (scalar_of(a)?, scalar_of(b)?);
            return Ok(Value::Float(match builtin {
                Builtin::Add => a + b,
                Builtin::Sub => a - b,
                _ => a * b,
            }));
        }
    };
    Ok(Value::Tensor(out))
}

fn scalar_of(value: &Value) -> crate::Result<f64> {
    value
        .as_f64()
        .ok_or_else(|| eval_error(format!("expected number, got {}", value.kind())))
}

fn unary_tensor<'a>(builtin: Builtin, args: &'a [Value]) -> crate::Result<&'a Tensor> {
    args.first()
        .ok_or_else(|| eval_error(format!("{} takes a tensor argument", builtin.name())))?
        .as_tensor()
}

fn eval_builtin(builtin: Builtin, args: Vec<Value>) -> crate::Result<Value> {
    let arity = |n: usize| -> crate::Result<()> {
        if args.len() == n {
            Ok(())
        } else {
            Err(eval_error(format!(
                "{} takes {} arguments, got {}",
                builtin.name(),
                n,
                args.len()
            )))
        }
    };

    match builtin {
        Builtin::GetBlock => Err(eval_error(
            "block selection reached evaluation; the graph was not normalized",
        )),
        Builtin::GetItem => {
            arity(2)?;
            let index = args[1].as_int()?;
            match &args[0] {
                Value::Tuple(items) => usize::try_from(index)
                    .ok()
                    .and_then(|i| items.get(i))
                    .cloned()
                    .ok_or_else(|| eval_error(format!("index {} out of range", index))),
                other => Err(eval_error(format!("cannot index into {}", other.kind()))),
            }
        }
        Builtin::Add | Builtin::Sub | Builtin::Mul => {
            arity(2)?;
            arith(builtin, &args[0], &args[1])
        }
        Builtin::Relu => {
            arity(1)?;
            Ok(Value::Tensor(unary_tensor(builtin, &args)?.relu()?))
        }
        Builtin::Flatten => {
            arity(2)?;
            let t = unary_tensor(builtin, &args)?;
            let start = dim_arg(&args[1], t.rank())?;
            Ok(Value::Tensor(t.flatten_from(start)?))
        }
        Builtin::Mean | Builtin::Sum => {
            arity(2)?;
            let t = unary_tensor(builtin, &args)?;
            let dim = dim_arg(&args[1], t.rank())?;
            let out = if builtin == Builtin::Mean {
                t.mean(dim)?
            } else {
                t.sum(dim)?
            };
            Ok(Value::Tensor(out))
        }
        Builtin::Cat => {
            let (dim, tensors) = args
                .split_last()
                .ok_or_else(|| eval_error("cat takes tensors and a dimension"))?;
            let tensors = tensors
                .iter()
                .map(Value::as_tensor)
                .collect::<crate::Result<Vec<_>>>()?;
            let rank = tensors
                .first()
                .map(|t| t.rank())
                .ok_or_else(|| eval_error("cat of no tensors"))?;
            let dim = dim_arg(dim, rank)?;
            Ok(Value::Tensor(Tensor::cat(&tensors, dim)?))
        }
    }
}

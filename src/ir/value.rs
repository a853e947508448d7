//! Runtime values flowing through traced graphs and across layers.

use std::fmt;
use std::sync::Arc;

use candle_core::Tensor;

use crate::sampling::{Block, CsrGraph};

/// Constant argument embedded in a graph node.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::None => write!(f, "None"),
            Literal::Bool(b) => write!(f, "{}", b),
            Literal::Int(i) => write!(f, "{}", i),
            Literal::Float(x) => write!(f, "{:?}", x),
            Literal::Str(s) => write!(f, "{:?}", s),
        }
    }
}

/// A materialized value: a tensor, a graph structure, or anything else a
/// layer function passes along.
#[derive(Debug, Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Tensor(Tensor),
    /// The full input graph
    Graph(Arc<CsrGraph>),
    /// A batch's local subgraph
    Block(Arc<Block>),
    Tuple(Vec<Value>),
}

impl Value {
    /// Short name of the value's kind, for error messages
    pub fn kind(&self) -> &'static str {
        match self {
            Value::None => "none",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Tensor(_) => "tensor",
            Value::Graph(_) => "graph",
            Value::Block(_) => "block",
            Value::Tuple(_) => "tuple",
        }
    }

    pub fn as_tensor(&self) -> crate::Result<&Tensor> {
        match self {
            Value::Tensor(t) => Ok(t),
            other => Err(crate::LayerwiseError::EvalError(format!(
                "expected tensor, got {}",
                other.kind()
            ))),
        }
    }

    pub fn as_block(&self) -> crate::Result<&Arc<Block>> {
        match self {
            Value::Block(b) => Ok(b),
            other => Err(crate::LayerwiseError::EvalError(format!(
                "expected block, got {}",
                other.kind()
            ))),
        }
    }

    pub fn as_int(&self) -> crate::Result<i64> {
        match self {
            Value::Int(i) => Ok(*i),
            other => Err(crate::LayerwiseError::EvalError(format!(
                "expected int, got {}",
                other.kind()
            ))),
        }
    }

    /// Scalar view of numeric values, used by mixed tensor/scalar arithmetic
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(x) => Some(*x),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn is_tensor(&self) -> bool {
        matches!(self, Value::Tensor(_))
    }

    /// Flatten a function result into its positional outputs.
    ///
    /// A tuple yields its elements; anything else is a single output.
    pub fn into_outputs(self) -> Vec<Value> {
        match self {
            Value::Tuple(values) => values,
            other => vec![other],
        }
    }

    /// Inverse of [`Value::into_outputs`]: one value stays bare, several
    /// become a tuple.
    pub fn from_outputs(mut values: Vec<Value>) -> Value {
        if values.len() == 1 {
            values.pop().unwrap_or(Value::None)
        } else {
            Value::Tuple(values)
        }
    }

    /// Bytes held by tensor payloads, counting tuple members
    pub fn tensor_bytes(&self) -> usize {
        match self {
            Value::Tensor(t) => t.elem_count() * t.dtype().size_in_bytes(),
            Value::Tuple(values) => values.iter().map(Value::tensor_bytes).sum(),
            _ => 0,
        }
    }
}

impl From<Literal> for Value {
    fn from(literal: Literal) -> Self {
        match literal {
            Literal::None => Value::None,
            Literal::Bool(b) => Value::Bool(b),
            Literal::Int(i) => Value::Int(i),
            Literal::Float(x) => Value::Float(x),
            Literal::Str(s) => Value::Str(s),
        }
    }
}

impl From<Tensor> for Value {
    fn from(tensor: Tensor) -> Self {
        Value::Tensor(tensor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_outputs_round_trip_arity() {
        let single = Value::from_outputs(vec![Value::Int(3)]);
        assert!(matches!(single, Value::Int(3)));
        assert_eq!(single.into_outputs().len(), 1);

        let pair = Value::from_outputs(vec![Value::Int(1), Value::None]);
        assert_eq!(pair.kind(), "tuple");
        assert_eq!(pair.into_outputs().len(), 2);
    }

    #[test]
    fn test_tensor_bytes() {
        let t = Tensor::zeros((4, 3), candle_core::DType::F32, &Device::Cpu).unwrap();
        let v = Value::Tuple(vec![Value::Tensor(t.clone()), Value::Tensor(t), Value::Int(1)]);
        assert_eq!(v.tensor_bytes(), 2 * 4 * 3 * 4);
    }

    #[test]
    fn test_accessor_errors_name_kind() {
        let err = Value::Int(1).as_tensor().unwrap_err();
        assert!(err.to_string().contains("expected tensor, got int"));
    }
}

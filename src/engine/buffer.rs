//! Whole-graph output buffers for one layer pass.

use candle_core::{DType, Device, Tensor};

use crate::ir::Value;

/// What a layer output looks like, as observed by the shape probe
#[derive(Debug, Clone, PartialEq)]
pub enum OutputSpec {
    /// One row per node with this trailing shape
    Tensor { row_shape: Vec<usize>, dtype: DType },
    /// Not row-indexed; nothing is gathered for it
    Opaque,
}

impl OutputSpec {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Tensor(t) if t.rank() >= 1 => OutputSpec::Tensor {
                row_shape: t.dims()[1..].to_vec(),
                dtype: t.dtype(),
            },
            _ => OutputSpec::Opaque,
        }
    }
}

enum Slot {
    /// Host tensor of shape `(num_rows, row_shape..)` in the probed dtype
    Tensor { buffer: Tensor, row_shape: Vec<usize> },
    Opaque,
}

/// Host buffers receiving every batch's rows for one layer.
///
/// Rows are indexed by global node id and each may be written once per
/// pass; [`LayerOutputs::finish`] refuses to hand out partially covered
/// results. Rows are copied into place unchanged, in the dtype the shape
/// probe observed.
pub struct LayerOutputs {
    layer: usize,
    num_rows: usize,
    slots: Vec<Slot>,
    written: Vec<bool>,
    rows_written: usize,
}

impl LayerOutputs {
    /// Zeroed buffers of `num_rows` rows for each output in `specs`
    pub fn allocate(layer: usize, specs: &[OutputSpec], num_rows: usize) -> crate::Result<Self> {
        let slots = specs
            .iter()
            .map(|spec| match spec {
                OutputSpec::Tensor { row_shape, dtype } => {
                    let mut shape = Vec::with_capacity(row_shape.len() + 1);
                    shape.push(num_rows);
                    shape.extend_from_slice(row_shape);
                    Ok(Slot::Tensor {
                        buffer: Tensor::zeros(shape, *dtype, &Device::Cpu)?,
                        row_shape: row_shape.clone(),
                    })
                }
                OutputSpec::Opaque => Ok(Slot::Opaque),
            })
            .collect::<crate::Result<Vec<_>>>()?;

        Ok(Self {
            layer,
            num_rows,
            slots,
            written: vec![false; num_rows],
            rows_written: 0,
        })
    }

    pub fn layer(&self) -> usize {
        self.layer
    }

    /// Number of outputs
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn rows_written(&self) -> usize {
        self.rows_written
    }

    pub fn is_complete(&self) -> bool {
        self.rows_written == self.num_rows
    }

    /// Bytes held by the host buffers
    pub fn host_bytes(&self) -> usize {
        self.slots
            .iter()
            .map(|slot| match slot {
                Slot::Tensor { buffer, .. } => buffer.elem_count() * buffer.dtype().size_in_bytes(),
                Slot::Opaque => 0,
            })
            .sum()
    }

    /// Scatter one batch's results into the buffers.
    ///
    /// `values` holds the layer's outputs for the batch, with either one row
    /// per output node or one row per source node of the batch's block, in
    /// which case the leading destination rows are taken. Everything is
    /// checked before any row is written, so a rejected batch leaves the
    /// buffers untouched.
    pub fn write(
        &mut self,
        output_nodes: &[u32],
        num_src: usize,
        values: Vec<Value>,
    ) -> crate::Result<()> {
        if values.len() != self.slots.len() {
            return Err(crate::LayerwiseError::OutputArityMismatch {
                layer: self.layer,
                expected: self.slots.len(),
                actual: values.len(),
            });
        }
        self.check_rows(output_nodes)?;

        let num_dst = output_nodes.len();
        // Rows in ascending node order, so runs of consecutive ids are
        // copied with one slice each
        let mut order: Vec<usize> = (0..num_dst).collect();
        order.sort_unstable_by_key(|&r| output_nodes[r]);
        let sorted_nodes: Vec<u32> = order.iter().map(|&r| output_nodes[r]).collect();
        let reorder = order.iter().enumerate().any(|(i, &r)| i != r);

        let mut staged = Vec::with_capacity(values.len());
        for (i, (slot, value)) in self.slots.iter().zip(values).enumerate() {
            let Slot::Tensor { buffer, row_shape } = slot else {
                staged.push(None);
                continue;
            };
            let tensor = value.as_tensor().map_err(|_| {
                crate::LayerwiseError::EvalError(format!(
                    "layer {} output {} was a tensor in the probe but is now {}",
                    self.layer,
                    i,
                    value.kind()
                ))
            })?;
            let rows = tensor.dims().first().copied().unwrap_or(0);
            let tensor = if rows == num_dst {
                tensor.clone()
            } else if rows == num_src {
                tensor.narrow(0, 0, num_dst)?
            } else {
                return Err(crate::LayerwiseError::EvalError(format!(
                    "layer {} output {} has {} rows for a batch of {} nodes",
                    self.layer, i, rows, num_dst
                )));
            };
            if tensor.dims()[1..] != row_shape[..] {
                return Err(crate::LayerwiseError::EvalError(format!(
                    "layer {} output {} rows have shape {:?}, expected {:?}",
                    self.layer,
                    i,
                    &tensor.dims()[1..],
                    row_shape
                )));
            }
            if tensor.dtype() != buffer.dtype() {
                return Err(crate::LayerwiseError::EvalError(format!(
                    "layer {} output {} has dtype {:?}, the probe saw {:?}",
                    self.layer,
                    i,
                    tensor.dtype(),
                    buffer.dtype()
                )));
            }
            let mut host = tensor.to_device(&Device::Cpu)?;
            if reorder {
                let index: Vec<u32> = order.iter().map(|&r| r as u32).collect();
                let index = Tensor::from_vec(index, num_dst, &Device::Cpu)?;
                host = host.index_select(&index, 0)?;
            }
            staged.push(Some(host.contiguous()?));
        }

        for (slot, host) in self.slots.iter().zip(staged) {
            if let (Slot::Tensor { buffer, .. }, Some(host)) = (slot, host) {
                let mut start = 0;
                while start < num_dst {
                    let mut end = start + 1;
                    while end < num_dst && sorted_nodes[end] == sorted_nodes[end - 1] + 1 {
                        end += 1;
                    }
                    let run = host.narrow(0, start, end - start)?;
                    buffer.slice_set(&run, 0, sorted_nodes[start] as usize)?;
                    start = end;
                }
            }
        }
        for &node in output_nodes {
            self.written[node as usize] = true;
        }
        self.rows_written += output_nodes.len();
        Ok(())
    }

    fn check_rows(&self, output_nodes: &[u32]) -> crate::Result<()> {
        let mut sorted = output_nodes.to_vec();
        sorted.sort_unstable();
        if let Some(pair) = sorted.windows(2).find(|w| w[0] == w[1]) {
            return Err(crate::LayerwiseError::CoverageError(format!(
                "node {} appears twice in one batch",
                pair[0]
            )));
        }
        for &node in &sorted {
            match self.written.get(node as usize) {
                None => {
                    return Err(crate::LayerwiseError::CoverageError(format!(
                        "node {} out of range for {} rows",
                        node, self.num_rows
                    )))
                }
                Some(true) => {
                    return Err(crate::LayerwiseError::CoverageError(format!(
                        "row {} of layer {} written twice",
                        node, self.layer
                    )))
                }
                Some(false) => {}
            }
        }
        Ok(())
    }

    /// Check every row was written and hand out the layer's values.
    ///
    /// Tensor outputs become host tensors of shape `(num_rows, row_shape..)`;
    /// opaque outputs become [`Value::None`].
    pub fn finish(self) -> crate::Result<Vec<Value>> {
        if !self.is_complete() {
            let first_missing = self.written.iter().position(|&w| !w).unwrap_or(0);
            return Err(crate::LayerwiseError::CoverageError(format!(
                "layer {} wrote {} of {} rows (first missing: {})",
                self.layer, self.rows_written, self.num_rows, first_missing
            )));
        }

        Ok(self
            .slots
            .into_iter()
            .map(|slot| match slot {
                Slot::Tensor { buffer, .. } => Value::Tensor(buffer),
                Slot::Opaque => Value::None,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(cols: usize) -> OutputSpec {
        OutputSpec::Tensor {
            row_shape: vec![cols],
            dtype: DType::F32,
        }
    }

    fn rows(data: &[f32], cols: usize) -> Value {
        let n = data.len() / cols;
        Value::Tensor(Tensor::from_vec(data.to_vec(), (n, cols), &Device::Cpu).unwrap())
    }

    #[test]
    fn test_scatter_and_finish() {
        let mut out = LayerOutputs::allocate(0, &[spec(2), OutputSpec::Opaque], 3).unwrap();
        out.write(&[2, 0], 2, vec![rows(&[5.0, 6.0, 1.0, 2.0], 2), Value::Int(1)])
            .unwrap();
        assert!(!out.is_complete());
        out.write(&[1], 1, vec![rows(&[3.0, 4.0], 2), Value::Int(2)]).unwrap();

        let values = out.finish().unwrap();
        let t: Vec<Vec<f32>> = values[0].as_tensor().unwrap().to_vec2().unwrap();
        assert_eq!(t, vec![vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0, 6.0]]);
        assert!(matches!(values[1], Value::None));
    }

    #[test]
    fn test_src_rows_narrowed() {
        let mut out = LayerOutputs::allocate(0, &[spec(1)], 2).unwrap();
        // Batch of one destination with two source rows
        out.write(&[1], 2, vec![rows(&[9.0, 7.0], 1)]).unwrap();
        out.write(&[0], 1, vec![rows(&[4.0], 1)]).unwrap();
        let t: Vec<Vec<f32>> = out.finish().unwrap()[0].as_tensor().unwrap().to_vec2().unwrap();
        assert_eq!(t, vec![vec![4.0], vec![9.0]]);
    }

    #[test]
    fn test_double_write_rejected() {
        let mut out = LayerOutputs::allocate(0, &[spec(1)], 2).unwrap();
        out.write(&[0], 1, vec![rows(&[1.0], 1)]).unwrap();
        let err = out.write(&[1, 0], 2, vec![rows(&[2.0, 3.0], 1)]).unwrap_err();
        assert!(matches!(err, crate::LayerwiseError::CoverageError(_)));
        // Rejected batch left row 1 untouched
        assert_eq!(out.rows_written(), 1);
    }

    #[test]
    fn test_incomplete_coverage() {
        let mut out = LayerOutputs::allocate(3, &[spec(1)], 2).unwrap();
        out.write(&[0], 1, vec![rows(&[1.0], 1)]).unwrap();
        let err = out.finish().err().unwrap();
        assert!(err.to_string().contains("first missing: 1"));
    }

    #[test]
    fn test_arity_and_shape_checks() {
        let mut out = LayerOutputs::allocate(1, &[spec(2)], 2).unwrap();
        let err = out.write(&[0], 1, vec![]).unwrap_err();
        assert!(matches!(
            err,
            crate::LayerwiseError::OutputArityMismatch { layer: 1, expected: 1, actual: 0 }
        ));
        assert!(out.write(&[0], 1, vec![rows(&[1.0, 2.0, 3.0], 3)]).is_err());
    }

    #[test]
    fn test_spec_of_value() {
        let t = Tensor::zeros((1, 4, 2), DType::F16, &Device::Cpu).unwrap();
        assert_eq!(
            OutputSpec::of(&Value::Tensor(t)),
            OutputSpec::Tensor {
                row_shape: vec![4, 2],
                dtype: DType::F16
            }
        );
        assert_eq!(OutputSpec::of(&Value::Int(3)), OutputSpec::Opaque);
    }

    #[test]
    fn test_rows_keep_probed_dtype() {
        let wide = OutputSpec::Tensor {
            row_shape: vec![1],
            dtype: DType::F64,
        };
        let ints = OutputSpec::Tensor {
            row_shape: vec![1],
            dtype: DType::I64,
        };
        let mut out = LayerOutputs::allocate(0, &[wide, ints], 3).unwrap();
        assert_eq!(out.host_bytes(), 2 * 3 * 8);

        let f = Tensor::new(&[[0.1f64], [16777217.0]], &Device::Cpu).unwrap();
        let i = Tensor::new(&[[-5i64], [9007199254740993]], &Device::Cpu).unwrap();
        out.write(&[2, 0], 2, vec![Value::Tensor(f), Value::Tensor(i)]).unwrap();
        let f = Tensor::new(&[[-0.25f64]], &Device::Cpu).unwrap();
        let i = Tensor::new(&[[3i64]], &Device::Cpu).unwrap();
        out.write(&[1], 1, vec![Value::Tensor(f), Value::Tensor(i)]).unwrap();

        let values = out.finish().unwrap();
        let f = values[0].as_tensor().unwrap();
        assert_eq!(f.dtype(), DType::F64);
        assert_eq!(
            f.to_vec2::<f64>().unwrap(),
            vec![vec![16777217.0], vec![-0.25], vec![0.1]]
        );
        let i = values[1].as_tensor().unwrap();
        assert_eq!(
            i.to_vec2::<i64>().unwrap(),
            vec![vec![9007199254740993], vec![3], vec![-5]]
        );
    }

    #[test]
    fn test_dtype_change_rejected() {
        let mut out = LayerOutputs::allocate(0, &[spec(1)], 1).unwrap();
        let t = Tensor::new(&[[1f64]], &Device::Cpu).unwrap();
        assert!(out.write(&[0], 1, vec![Value::Tensor(t)]).is_err());
        assert_eq!(out.rows_written(), 0);
    }
}

//! Linear layers that are either dense or GPTQ-packed.
//!
//! [`Weights`] wraps the `VarBuilder` of one placed module together with the
//! packed layers converted for the same device, and hands out a
//! [`MossLinear`] of the right kind for every projection.

use std::collections::HashMap;
use std::sync::Arc;

use candle_core::quantized::{QMatMul, QTensor};
use candle_core::{DType, Module, Result, Tensor};
use candle_nn::{Linear, VarBuilder};

/// Weight source for one module and everything below it.
#[derive(Clone)]
pub struct Weights<'a> {
    vb: VarBuilder<'a>,
    packed: Arc<HashMap<String, Arc<QTensor>>>,
    path: Vec<String>,
}

impl<'a> Weights<'a> {
    pub fn new(vb: VarBuilder<'a>, packed: HashMap<String, Arc<QTensor>>) -> Self {
        Self {
            vb,
            packed: Arc::new(packed),
            path: Vec::new(),
        }
    }

    /// Plain `VarBuilder`, no packed layers.
    pub fn dense(vb: VarBuilder<'a>) -> Self {
        Self::new(vb, HashMap::new())
    }

    pub fn pp(&self, name: impl ToString) -> Self {
        let name = name.to_string();
        let mut path = self.path.clone();
        path.push(name.clone());
        Self {
            vb: self.vb.pp(name),
            packed: self.packed.clone(),
            path,
        }
    }

    pub fn vb(&self) -> VarBuilder<'a> {
        self.vb.clone()
    }

    /// Projection `in_dim -> out_dim` at the current path. The bias is loaded
    /// when `bias` is set or the checkpoint carries one.
    pub fn linear(&self, in_dim: usize, out_dim: usize, bias: bool) -> Result<MossLinear> {
        let bias = if bias || self.vb.contains_tensor("bias") {
            Some(self.vb.get(out_dim, "bias")?)
        } else {
            None
        };
        match self.packed.get(&self.path.join(".")) {
            Some(qtensor) => {
                let (rows, cols) = qtensor.shape().dims2()?;
                if (rows, cols) != (out_dim, in_dim) {
                    return Err(candle_core::Error::Msg(format!(
                        "{}: packed weight is ({rows}, {cols}), expected ({out_dim}, {in_dim})",
                        self.path.join(".")
                    )));
                }
                Ok(MossLinear::Packed {
                    weight: QMatMul::from_arc(qtensor.clone())?,
                    bias,
                })
            }
            None => {
                let weight = self.vb.get((out_dim, in_dim), "weight")?;
                Ok(MossLinear::Dense(Linear::new(weight, bias)))
            }
        }
    }
}

/// `y = x W^T + b`, with `W` dense or kept in `Q4_1` blocks.
pub enum MossLinear {
    Dense(Linear),
    Packed { weight: QMatMul, bias: Option<Tensor> },
}

impl Module for MossLinear {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::Dense(linear) => linear.forward(x),
            Self::Packed { weight, bias } => {
                // Quantized matmul takes F32 activations.
                let y = weight
                    .forward(&x.to_dtype(DType::F32)?.contiguous()?)?
                    .to_dtype(x.dtype())?;
                match bias {
                    Some(bias) => y.broadcast_add(bias),
                    None => Ok(y),
                }
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

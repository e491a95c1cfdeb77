//! Feed-forward network of the MOSS block.
//!
//! ```text
//! out = fc_out( activation( fc_in(x) ) )
//! ```
//!
//! The activation comes from `activation_function` in `config.json`; MOSS
//! checkpoints use `gelu_new`, the tanh approximation.

use candle_core::{Result, Tensor};
use candle_nn::Module;

use moss_common::{FfnActivation, MossConfig};

use crate::linear::{MossLinear, Weights};

/// Apply the configured pointwise activation.
#[inline]
pub fn activate(x: &Tensor, activation: FfnActivation) -> Result<Tensor> {
    match activation {
        FfnActivation::GeluNew => x.gelu(),
        FfnActivation::Gelu => x.gelu_erf(),
        FfnActivation::Relu => x.relu(),
    }
}

/// Two-projection MLP with biases.
pub struct MossMlp {
    fc_in: MossLinear,
    fc_out: MossLinear,
    activation: FfnActivation,
}

impl MossMlp {
    pub fn new(config: &MossConfig, w: Weights) -> Result<Self> {
        let inner = config.inner_dim();
        let fc_in = w.pp("fc_in").linear(config.n_embd, inner, true)?;
        let fc_out = w.pp("fc_out").linear(inner, config.n_embd, true)?;
        Ok(Self {
            fc_in,
            fc_out,
            activation: config.activation_function,
        })
    }
}

impl Module for MossMlp {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.fc_in.forward(x)?;
        let h = activate(&h, self.activation)?;
        self.fc_out.forward(&h)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

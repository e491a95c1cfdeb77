//! Causal self-attention of the MOSS block.
//!
//! Features:
//! * Fused Q/V/K projection (`qkv_proj`, no bias) laid out in `MP_NUM`
//!   model-parallel groups; inside each group the order is query, value, key.
//! * **Partial RoPE**: interleaved rotary embedding on the first
//!   `rotary_dim` channels of every head, the rest passes through.
//! * Scores computed in F32 regardless of the weight dtype.
//! * **KV-Cache**: per-layer cache for O(1) per-token decoding.

use candle_core::{DType, Device, Result, Tensor, D};
use candle_nn::Module;

use moss_common::MossConfig;

use crate::linear::{MossLinear, Weights};

/// Number of groups the fused projection was trained with.
pub const MP_NUM: usize = 4;

/// Per-layer KV cache for incremental decoding.
///
/// Stores key and value tensors of shape `(batch, num_heads, seq_len, head_dim)`.
/// Empty until the first prefill, then extended along the sequence axis.
#[derive(Default)]
pub struct LayerKVCache {
    kv: Option<(Tensor, Tensor)>,
}

impl LayerKVCache {
    /// Number of positions currently in the cache (0 if empty).
    pub fn len(&self) -> usize {
        self.kv
            .as_ref()
            .map(|(k, _)| k.dim(2).unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append new positions and return the full key and value tensors.
    pub fn append(&mut self, k: Tensor, v: Tensor) -> Result<(Tensor, Tensor)> {
        let (k, v) = match self.kv.take() {
            None => (k, v),
            Some((key, value)) => (Tensor::cat(&[&key, &k], 2)?, Tensor::cat(&[&value, &v], 2)?),
        };
        self.kv = Some((k.clone(), v.clone()));
        Ok((k, v))
    }

    /// Clear the cache (e.g. for a new sequence).
    pub fn clear(&mut self) {
        self.kv = None;
    }
}

/// Build RoPE cos/sin for positions [start, start + length). Output shape
/// `(length, rotary_dim / 2)`, F32.
///
/// θ_i = 10000^{-2i/rotary_dim}.
pub(crate) fn rope_cos_sin_range(
    device: &Device,
    start: usize,
    length: usize,
    rotary_dim: usize,
) -> Result<(Tensor, Tensor)> {
    let d2 = rotary_dim / 2;
    let inv_freq: Vec<f32> = (0..d2)
        .map(|i| 1.0 / 10000f32.powf(2.0 * i as f32 / rotary_dim as f32))
        .collect();
    let inv_freq = Tensor::from_vec(inv_freq, (1, d2), device)?;
    let positions = Tensor::arange(start as u32, (start + length) as u32, device)?
        .to_dtype(DType::F32)?
        .reshape((length, 1))?;
    let freqs = positions.broadcast_mul(&inv_freq)?;
    Ok((freqs.cos()?, freqs.sin()?))
}

/// Additive causal mask of shape `(t, offset + t)`: query `i` sees keys up to
/// `offset + i`.
fn causal_mask(t: usize, offset: usize, device: &Device) -> Result<Tensor> {
    let kv = offset + t;
    let mask: Vec<f32> = (0..t)
        .flat_map(|i| {
            (0..kv).map(move |j| {
                if j > offset + i {
                    f32::NEG_INFINITY
                } else {
                    0.0
                }
            })
        })
        .collect();
    Tensor::from_vec(mask, (t, kv), device)
}

/// Multi-head causal self-attention.
pub struct MossAttention {
    qkv_proj: MossLinear,
    out_proj: MossLinear,
    num_heads: usize,
    head_dim: usize,
    rotary_dim: usize,
    embed_dim: usize,
    scale: f64,
}

impl MossAttention {
    pub fn new(config: &MossConfig, w: Weights) -> Result<Self> {
        let embed_dim = config.n_embd;
        if config.n_head % MP_NUM != 0 {
            return Err(candle_core::Error::Msg(format!(
                "n_head ({}) must be a multiple of {MP_NUM}",
                config.n_head
            )));
        }
        let qkv_proj = w.pp("qkv_proj").linear(embed_dim, 3 * embed_dim, false)?;
        let out_proj = w.pp("out_proj").linear(embed_dim, embed_dim, false)?;
        let head_dim = config.head_dim();

        Ok(Self {
            qkv_proj,
            out_proj,
            num_heads: config.n_head,
            head_dim,
            rotary_dim: config.rotary_dim(),
            embed_dim,
            scale: 1.0 / (head_dim as f64).sqrt(),
        })
    }

    /// `(b, t, MP_NUM, local)` → `(b, heads, t, head_dim)`.
    fn split_heads(&self, x: &Tensor) -> Result<Tensor> {
        let (b, t, _, _) = x.dims4()?;
        x.contiguous()?
            .reshape((b, t, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    fn apply_rotary(&self, x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
        if self.rotary_dim == self.head_dim {
            return candle_nn::rotary_emb::rope_i(x, cos, sin);
        }
        let x_rot = x.narrow(D::Minus1, 0, self.rotary_dim)?.contiguous()?;
        let x_pass = x.narrow(D::Minus1, self.rotary_dim, self.head_dim - self.rotary_dim)?;
        let x_rot = candle_nn::rotary_emb::rope_i(&x_rot, cos, sin)?;
        Tensor::cat(&[&x_rot, &x_pass], D::Minus1)
    }

    /// Forward with KV cache. The cache offset is the position of the first
    /// token in `x`; an empty cache means prefill.
    pub fn forward(&self, x: &Tensor, cache: &mut LayerKVCache) -> Result<Tensor> {
        let (b, t, _c) = x.dims3()?;
        let offset = cache.len();
        let device = x.device();

        let qkv = self.qkv_proj.forward(x)?;
        let qkv = qkv.reshape((b, t, MP_NUM, ()))?;
        let local = self.embed_dim / MP_NUM;
        let q = self.split_heads(&qkv.narrow(3, 0, local)?)?;
        let v = self.split_heads(&qkv.narrow(3, local, local)?)?;
        let k = self.split_heads(&qkv.narrow(3, 2 * local, local)?)?;

        let (cos, sin) = rope_cos_sin_range(device, offset, t, self.rotary_dim)?;
        let cos = cos.to_dtype(x.dtype())?;
        let sin = sin.to_dtype(x.dtype())?;
        let q = self.apply_rotary(&q, &cos, &sin)?;
        let k = self.apply_rotary(&k, &cos, &sin)?;

        let (k, v) = cache.append(k, v)?;

        let q = q.to_dtype(DType::F32)?;
        let k = k.to_dtype(DType::F32)?;
        let mut scores = q.matmul(&k.t()?)?;
        if t > 1 {
            scores = scores.broadcast_add(&causal_mask(t, offset, device)?)?;
        }
        let scores = (scores * self.scale)?;
        let att = candle_nn::ops::softmax_last_dim(&scores)?.to_dtype(v.dtype())?;
        let y = att.matmul(&v.contiguous()?)?;
        let y = y.transpose(1, 2)?; // (b, t, heads, head_dim)
        let y = y.reshape((b, t, self.embed_dim))?;
        self.out_proj.forward(&y)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

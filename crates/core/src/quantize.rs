//! GPTQ weight expansion.
//!
//! The `-int4` / `-int8` checkpoints store every linear layer of the decoder
//! blocks as packed integers:
//!
//! | Tensor    | Shape                         | Packing                         |
//! |-----------|-------------------------------|---------------------------------|
//! | `qweight` | `(in · bits / 32, out)`       | `32 / bits` rows per word       |
//! | `qzeros`  | `(groups, out · bits / 32)`   | `32 / bits` columns per word    |
//! | `scales`  | `(groups, out)`               | float                           |
//! | `g_idx`   | `(in,)` (optional)            | group of every input row        |
//!
//! Values are packed low bits first. Zero points are stored minus one, so
//! `w[i, j] = scales[g, j] · (q[i, j] − (z[g, j] + 1))` with `g` the group of
//! input row `i`.
//!
//! Layers are converted one module at a time, while the module is placed.
//! 4-bit layers whose groups line up with 32-wide blocks stay packed as
//! candle `Q4_1` tensors (`d = scale`, `m = -scale * (z + 1)`) and run through
//! `QMatMul`. Everything else is expanded to a dense `weight` of shape
//! `(out, in)`, which is what `candle_nn::Linear` expects.

use std::collections::HashMap;
use std::sync::Arc;

use candle_core::quantized::{ggml_file::qtensor_from_ggml, GgmlDType, QTensor};
use candle_core::{DType, Device, Error, Result, Tensor};
use half::f16;

/// Tensor name suffixes that make up one GPTQ layer.
const PACKED_SUFFIXES: [&str; 4] = ["qweight", "qzeros", "scales", "g_idx"];

/// Shape of one packed layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedLayout {
    pub in_features: usize,
    pub out_features: usize,
    pub bits: usize,
    pub groupsize: usize,
}

impl PackedLayout {
    fn per_word(&self) -> usize {
        32 / self.bits
    }

    fn mask(&self) -> u32 {
        (1u32 << self.bits) - 1
    }
}

/// Expand packed words into a dense row-major `(out, in)` matrix.
pub fn dequantize(
    layout: PackedLayout,
    qweight: &[u32],
    qzeros: &[u32],
    scales: &[f32],
    g_idx: Option<&[u32]>,
) -> Result<Vec<f32>> {
    let PackedLayout {
        in_features,
        out_features,
        bits,
        groupsize,
    } = layout;
    if !matches!(bits, 2 | 4 | 8) {
        return Err(Error::Msg(format!("unsupported GPTQ bit-width {bits}")));
    }
    let per_word = layout.per_word();
    let mask = layout.mask();
    let zero_cols = out_features / per_word;
    if qweight.len() != in_features / per_word * out_features {
        return Err(Error::Msg(format!(
            "qweight has {} words, expected {}",
            qweight.len(),
            in_features / per_word * out_features
        )));
    }

    let mut dense = vec![0f32; out_features * in_features];
    for i in 0..in_features {
        let group = match g_idx {
            Some(g) => g[i] as usize,
            None => i / groupsize,
        };
        let q_row = (i / per_word) * out_features;
        let q_shift = (i % per_word) * bits;
        for j in 0..out_features {
            let q = (qweight[q_row + j] >> q_shift) & mask;
            let z_word = qzeros
                .get(group * zero_cols + j / per_word)
                .ok_or_else(|| Error::Msg(format!("qzeros too small for group {group}")))?;
            let z = (z_word >> ((j % per_word) * bits)) & mask;
            let scale = scales
                .get(group * out_features + j)
                .ok_or_else(|| Error::Msg(format!("scales too small for group {group}")))?;
            dense[j * in_features + i] = scale * (q as f32 - (z as f32 + 1.0));
        }
    }
    Ok(dense)
}

/// Read an integer tensor as raw 32-bit words, whatever dtype the loader chose.
fn packed_words(t: &Tensor) -> Result<Vec<u32>> {
    let t = t.flatten_all()?;
    match t.dtype() {
        DType::U32 => t.to_vec1::<u32>(),
        DType::I64 => Ok(t.to_vec1::<i64>()?.into_iter().map(|v| v as u32).collect()),
        _ => Ok(t
            .to_dtype(DType::I64)?
            .to_vec1::<i64>()?
            .into_iter()
            .map(|v| v as u32)
            .collect()),
    }
}

fn take(tensors: &mut HashMap<String, Tensor>, name: &str) -> Result<Tensor> {
    tensors
        .remove(name)
        .ok_or_else(|| Error::Msg(format!("missing GPTQ tensor {name}")))
}

/// Elements per `Q4_1` block.
const Q4_1_BLOCK: usize = 32;

/// One packed layer pulled out of the staged tensors.
pub struct PackedLayer {
    pub layout: PackedLayout,
    qweight: Vec<u32>,
    qzeros: Vec<u32>,
    scales: Vec<f32>,
    g_idx: Option<Vec<u32>>,
}

impl PackedLayer {
    /// Remove the packed tensors of `prefix` from `tensors`. Bit-width is
    /// derived from the shapes; `groupsize` is only used when the layer has
    /// no `g_idx`.
    pub fn take(
        tensors: &mut HashMap<String, Tensor>,
        prefix: &str,
        groupsize: usize,
    ) -> Result<Self> {
        let qweight = take(tensors, &format!("{prefix}.qweight"))?;
        let qzeros = take(tensors, &format!("{prefix}.qzeros"))?;
        let scales = take(tensors, &format!("{prefix}.scales"))?;
        let g_idx = tensors.remove(&format!("{prefix}.g_idx"));

        let (packed_rows, out_features) = qweight.dims2()?;
        let (_, zero_cols) = qzeros.dims2()?;
        if zero_cols == 0 || (32 * zero_cols) % out_features != 0 {
            return Err(Error::Msg(format!(
                "{prefix}: qzeros width {zero_cols} does not match {out_features} outputs"
            )));
        }
        let bits = 32 * zero_cols / out_features;
        let layout = PackedLayout {
            in_features: packed_rows * 32 / bits,
            out_features,
            bits,
            groupsize,
        };

        Ok(Self {
            layout,
            qweight: packed_words(&qweight)?,
            qzeros: packed_words(&qzeros)?,
            scales: scales.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?,
            g_idx: g_idx.as_ref().map(packed_words).transpose()?,
        })
    }

    /// Dense row-major `(out, in)` weights.
    pub fn dequantize(&self) -> Result<Vec<f32>> {
        dequantize(
            self.layout,
            &self.qweight,
            &self.qzeros,
            &self.scales,
            self.g_idx.as_deref(),
        )
    }

    /// Whether input row `i` belongs to group `i / groupsize` for every row.
    fn has_sequential_groups(&self) -> bool {
        let groupsize = self.layout.groupsize;
        match &self.g_idx {
            None => true,
            Some(g) => g.iter().enumerate().all(|(i, &g)| g as usize == i / groupsize),
        }
    }

    /// Raw `Q4_1` blocks of shape `(out, in)`, or `None` when the layer has no
    /// exact `Q4_1` form.
    pub fn to_q4_1(&self) -> Option<Vec<u8>> {
        let PackedLayout {
            in_features,
            out_features,
            bits,
            groupsize,
        } = self.layout;
        if bits != 4
            || in_features % Q4_1_BLOCK != 0
            || groupsize % Q4_1_BLOCK != 0
            || !self.has_sequential_groups()
        {
            return None;
        }
        let per_word = self.layout.per_word();
        let mask = self.layout.mask();
        let zero_cols = out_features / per_word;
        let q = |i: usize, j: usize| -> Option<u8> {
            let word = self.qweight.get((i / per_word) * out_features + j)?;
            Some(((word >> ((i % per_word) * bits)) & mask) as u8)
        };

        let blocks_per_row = in_features / Q4_1_BLOCK;
        let mut raw = Vec::with_capacity(out_features * blocks_per_row * 20);
        for j in 0..out_features {
            for b in 0..blocks_per_row {
                let i0 = b * Q4_1_BLOCK;
                let group = i0 / groupsize;
                let scale = *self.scales.get(group * out_features + j)?;
                let z_word = self.qzeros.get(group * zero_cols + j / per_word)?;
                let zero = ((z_word >> ((j % per_word) * bits)) & mask) as f32 + 1.0;

                raw.extend_from_slice(&f16::from_f32(scale).to_le_bytes());
                raw.extend_from_slice(&f16::from_f32(-scale * zero).to_le_bytes());
                for k in 0..Q4_1_BLOCK / 2 {
                    raw.push(q(i0 + k, j)? | (q(i0 + k + Q4_1_BLOCK / 2, j)? << 4));
                }
            }
        }
        Some(raw)
    }
}

/// Convert every packed layer in `tensors` for placement on `device`.
///
/// Layers with a `Q4_1` form are returned keyed by their prefix, already on
/// `device`. The rest are replaced in `tensors` by a dense host-side
/// `<prefix>.weight`; biases stay where they are.
pub fn take_gptq_layers(
    tensors: &mut HashMap<String, Tensor>,
    groupsize: usize,
    device: &Device,
) -> Result<HashMap<String, Arc<QTensor>>> {
    let mut prefixes: Vec<String> = tensors
        .keys()
        .filter_map(|k| k.strip_suffix(".qweight").map(str::to_string))
        .collect();
    prefixes.sort();

    let mut packed = HashMap::new();
    for prefix in prefixes {
        let layer = PackedLayer::take(tensors, &prefix, groupsize)?;
        let PackedLayout {
            in_features,
            out_features,
            bits,
            ..
        } = layer.layout;
        match layer.to_q4_1() {
            Some(raw) => {
                let qtensor = qtensor_from_ggml(
                    GgmlDType::Q4_1,
                    &raw,
                    vec![out_features, in_features],
                    device,
                )?;
                tracing::debug!(layer = %prefix, bits, "kept GPTQ layer packed");
                packed.insert(prefix, Arc::new(qtensor));
            }
            None => {
                let weight = Tensor::from_vec(
                    layer.dequantize()?,
                    (out_features, in_features),
                    &Device::Cpu,
                )?;
                tracing::debug!(layer = %prefix, bits, "expanded GPTQ layer");
                tensors.insert(format!("{prefix}.weight"), weight);
            }
        }
    }

    // Stray packed tensors without a qweight are useless to the model.
    tensors.retain(|k, _| {
        !PACKED_SUFFIXES
            .iter()
            .any(|s| k.ends_with(&format!(".{s}")))
    });
    Ok(packed)
}

// ── Tests ───────────────────────────────────────────────────────────────────

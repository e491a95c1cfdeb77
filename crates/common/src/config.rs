//! Model configuration for MOSS checkpoints.
//!
//! Deserialised from the `config.json` shipped with every checkpoint. Fields
//! that older exports omit fall back to their `#[serde(default)]` values, so a
//! dense checkpoint and a GPTQ checkpoint share one type.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Hyper-parameters of the MOSS decoder (CodeGen family).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MossConfig {
    // ── Core dimensions ─────────────────────────────────────────────────────
    /// Vocabulary size (must match tokeniser).
    pub vocab_size: usize,
    /// Maximum number of positions the rotary tables cover.
    pub n_positions: usize,
    /// Context length used at training time.
    #[serde(default = "default_n_ctx")]
    pub n_ctx: usize,
    /// Hidden size (model dimension d_model).
    pub n_embd: usize,
    /// Number of decoder blocks.
    pub n_layer: usize,
    /// Number of attention heads.
    pub n_head: usize,
    /// Channels per head that receive rotary embedding. `None` = whole head.
    #[serde(default)]
    pub rotary_dim: Option<usize>,
    /// MLP inner dimension. `None` = `4 * n_embd`.
    #[serde(default)]
    pub n_inner: Option<usize>,
    /// LayerNorm epsilon.
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_epsilon: f64,

    // ── Architecture switches ───────────────────────────────────────────────
    /// MLP activation.
    #[serde(default)]
    pub activation_function: FfnActivation,
    /// Share the token embedding with the output projection.
    #[serde(default)]
    pub tie_word_embeddings: bool,

    // ── Special tokens ──────────────────────────────────────────────────────
    #[serde(default = "default_bos_token_id")]
    pub bos_token_id: u32,
    #[serde(default = "default_eos_token_id")]
    pub eos_token_id: u32,

    // ── GPTQ quantisation ───────────────────────────────────────────────────
    /// Weight bit-width: 32 for dense checkpoints, 4 or 8 for GPTQ.
    #[serde(default = "default_wbits")]
    pub wbits: u32,
    /// Rows of the input axis sharing one scale / zero point.
    #[serde(default = "default_groupsize")]
    pub groupsize: usize,
}

// ── Default value functions ─────────────────────────────────────────────────

fn default_n_ctx() -> usize {
    2048
}
fn default_layer_norm_eps() -> f64 {
    1e-5
}
fn default_bos_token_id() -> u32 {
    106028
}
fn default_eos_token_id() -> u32 {
    106068
}
fn default_wbits() -> u32 {
    32
}
fn default_groupsize() -> usize {
    128
}

// ── Impl ────────────────────────────────────────────────────────────────────

impl Default for MossConfig {
    /// `fnlp/moss-moon-003-sft` (16B, dense).
    fn default() -> Self {
        Self {
            vocab_size: 107008,
            n_positions: 2048,
            n_ctx: 2048,
            n_embd: 6144,
            n_layer: 34,
            n_head: 24,
            rotary_dim: Some(64),
            n_inner: None,
            layer_norm_epsilon: 1e-5,
            activation_function: FfnActivation::GeluNew,
            tie_word_embeddings: false,
            bos_token_id: 106028,
            eos_token_id: 106068,
            wbits: 32,
            groupsize: 128,
        }
    }
}

impl MossConfig {
    /// Head dimension (`n_embd / n_head`). Panics if not divisible.
    pub fn head_dim(&self) -> usize {
        assert!(
            self.n_embd % self.n_head == 0,
            "n_embd ({}) must be divisible by n_head ({})",
            self.n_embd,
            self.n_head,
        );
        self.n_embd / self.n_head
    }

    /// Rotary channels per head, clamped to the head dimension.
    pub fn rotary_dim(&self) -> usize {
        self.rotary_dim
            .unwrap_or_else(|| self.head_dim())
            .min(self.head_dim())
    }

    /// MLP inner dimension.
    pub fn inner_dim(&self) -> usize {
        self.n_inner.unwrap_or(4 * self.n_embd)
    }

    /// True for GPTQ checkpoints (4- or 8-bit packed weights).
    pub fn is_quantized(&self) -> bool {
        matches!(self.wbits, 4 | 8)
    }

    /// Parameter count of one decoder block (weights + biases).
    pub fn block_params(&self) -> usize {
        let h = self.n_embd;
        let inner = self.inner_dim();
        let ln = 2 * h;
        let attn = h * 3 * h + h * h;
        let mlp = h * inner + inner + inner * h + h;
        ln + attn + mlp
    }

    /// Parameter count of the token embedding.
    pub fn embedding_params(&self) -> usize {
        self.vocab_size * self.n_embd
    }

    /// Parameter count of the final norm plus the LM head.
    pub fn head_params(&self) -> usize {
        2 * self.n_embd + self.vocab_size * self.n_embd + self.vocab_size
    }

    /// Load config from a JSON file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&json)?;
        Ok(config)
    }
}

/// MLP activation named by `activation_function` in `config.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FfnActivation {
    /// Tanh approximation of GELU.
    #[default]
    #[serde(rename = "gelu_new")]
    GeluNew,
    /// Exact (erf) GELU.
    #[serde(rename = "gelu")]
    Gelu,
    #[serde(rename = "relu")]
    Relu,
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const MOSS_SFT_JSON: &str = r#"{
        "activation_function": "gelu_new",
        "architectures": ["MossForCausalLM"],
        "attn_pdrop": 0.0,
        "bos_token_id": 106028,
        "embd_pdrop": 0.0,
        "eos_token_id": 106068,
        "initializer_range": 0.02,
        "layer_norm_epsilon": 1e-05,
        "model_type": "moss",
        "n_ctx": 2048,
        "n_embd": 6144,
        "n_head": 24,
        "n_inner": null,
        "n_layer": 34,
        "n_positions": 2048,
        "resid_pdrop": 0.0,
        "rotary_dim": 64,
        "scale_attn_weights": true,
        "tie_word_embeddings": false,
        "torch_dtype": "float16",
        "use_cache": true,
        "vocab_size": 107008
    }"#;

    #[test]
    fn parses_checkpoint_config() {
        let config: MossConfig = serde_json::from_str(MOSS_SFT_JSON).unwrap();
        assert_eq!(config.n_layer, 34);
        assert_eq!(config.head_dim(), 256);
        assert_eq!(config.rotary_dim(), 64);
        assert_eq!(config.inner_dim(), 4 * 6144);
        assert_eq!(config.activation_function, FfnActivation::GeluNew);
        assert_eq!(config.eos_token_id, 106068);
        assert!(!config.is_quantized());
    }

    #[test]
    fn gptq_fields_mark_quantized() {
        let json = MOSS_SFT_JSON.replace(
            "\"vocab_size\": 107008",
            "\"vocab_size\": 107008, \"wbits\": 4, \"groupsize\": 128",
        );
        let config: MossConfig = serde_json::from_str(&json).unwrap();
        assert!(config.is_quantized());
        assert_eq!(config.groupsize, 128);
    }

    #[test]
    fn rotary_dim_defaults_to_head_dim() {
        let config = MossConfig {
            n_embd: 64,
            n_head: 4,
            rotary_dim: None,
            ..Default::default()
        };
        assert_eq!(config.rotary_dim(), 16);
    }

    #[test]
    fn parameter_counts_add_up() {
        let config = MossConfig {
            vocab_size: 10,
            n_embd: 4,
            n_inner: Some(8),
            ..Default::default()
        };
        // ln_1 (8) + qkv (48) + out (16) + fc_in (32 + 8) + fc_out (32 + 4)
        assert_eq!(config.block_params(), 148);
        assert_eq!(config.embedding_params(), 40);
        assert_eq!(config.head_params(), 8 + 40 + 10);
    }

    #[test]
    fn unknown_activation_is_rejected() {
        let json = MOSS_SFT_JSON.replace("\"gelu_new\"", "\"swish\"");
        assert!(serde_json::from_str::<MossConfig>(&json).is_err());
    }
}

//! # moss-core: The Model
//!
//! Everything needed to turn a MOSS checkpoint directory into a runnable
//! model lives in this crate:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`checkpoint`] | weight file discovery, host-side staging |
//! | [`quantize`] | GPTQ (4/8-bit) unpacking, `Q4_1` repacking |
//! | [`linear`] | `Weights` and `MossLinear`: dense or quantized projections |
//! | [`device_map`] | `DeviceMap` / `Placement`: block-granular sharding |
//! | [`attention`] | `MossAttention` with partial RoPE and `LayerKVCache` |
//! | [`mlp`] | `MossMlp` and the pointwise activations |
//! | [`model`] | `MossBlock`, `MossForCausalLM` |
//!
//! All tensor work goes through `candle-core`/`candle-nn`, so the same code
//! runs on CPU and CUDA.

pub mod attention;
pub mod checkpoint;
pub mod device_map;
pub mod linear;
pub mod mlp;
pub mod model;
pub mod quantize;

// ── Public re-exports ───────────────────────────────────────────────────────

pub use attention::LayerKVCache;
pub use checkpoint::{discover_weight_files, load_tensors, HostWeights};
pub use device_map::{DeviceMap, ModuleSlot, Placement};
pub use linear::{MossLinear, Weights};
pub use model::{MossBlock, MossForCausalLM};
pub use quantize::{take_gptq_layers, PackedLayer};

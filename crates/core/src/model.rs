//! MOSS decoder-only transformer (CodeGen family).
//!
//! Parallel residual blocks: `out = attn(ln_1(x)) + mlp(ln_1(x)) + x`.
//! Modules may live on different devices; the hidden state follows them.

use candle_core::{DType, Device, IndexOp, Result, Tensor};
use candle_nn::{embedding, layer_norm, Embedding, LayerNorm, Linear, Module};

use moss_common::MossConfig;

use crate::attention::{LayerKVCache, MossAttention};
use crate::device_map::{ModuleSlot, Placement};
use crate::linear::{MossLinear, Weights};
use crate::mlp::MossMlp;

// ── Decoder Block ───────────────────────────────────────────────────────────

/// Single decoder block. Indivisible for placement purposes.
pub struct MossBlock {
    ln_1: LayerNorm,
    attn: MossAttention,
    mlp: MossMlp,
}

impl MossBlock {
    pub fn new(config: &MossConfig, w: Weights) -> Result<Self> {
        let ln_1 = layer_norm(config.n_embd, config.layer_norm_epsilon, w.pp("ln_1").vb())?;
        let attn = MossAttention::new(config, w.pp("attn"))?;
        let mlp = MossMlp::new(config, w.pp("mlp"))?;
        Ok(Self { ln_1, attn, mlp })
    }

    pub fn forward(&self, x: &Tensor, cache: &mut LayerKVCache) -> Result<Tensor> {
        let h = self.ln_1.forward(x)?;
        let attn_out = self.attn.forward(&h, cache)?;
        let ff_out = self.mlp.forward(&h)?;
        (attn_out + ff_out)? + x
    }
}

// ── MossForCausalLM ─────────────────────────────────────────────────────────

/// MOSS with its language-modelling head.
pub struct MossForCausalLM {
    wte: Embedding,
    blocks: Vec<MossBlock>,
    ln_f: LayerNorm,
    lm_head: MossLinear,
    placement: Placement,
    config: MossConfig,
}

impl MossForCausalLM {
    /// Materialise the model module by module on the devices chosen by
    /// `placement`. `weights` yields the weight source of each slot on its
    /// device; `on_block` is called after each block is placed.
    pub fn new<'a>(
        config: &MossConfig,
        placement: Placement,
        mut weights: impl FnMut(ModuleSlot, &Device) -> Result<Weights<'a>>,
        mut on_block: impl FnMut(usize),
    ) -> Result<Self> {
        let slot = ModuleSlot::Embedding;
        let w = weights(slot, placement.device(slot))?;
        let wte = embedding(config.vocab_size, config.n_embd, w.pp("transformer.wte").vb())?;

        let mut blocks = Vec::with_capacity(config.n_layer);
        for i in 0..config.n_layer {
            let slot = ModuleSlot::Block(i);
            let w = weights(slot, placement.device(slot))?;
            blocks.push(MossBlock::new(config, w.pp(format!("transformer.h.{i}")))?);
            on_block(i);
        }

        let head_device = placement.device(ModuleSlot::Head);
        let w = weights(ModuleSlot::Head, head_device)?;
        let ln_f = layer_norm(
            config.n_embd,
            config.layer_norm_epsilon,
            w.pp("transformer.ln_f").vb(),
        )?;
        let lm_head = if config.tie_word_embeddings {
            let weight = wte.embeddings().to_device(head_device)?;
            let bias = w.pp("lm_head").vb().get(config.vocab_size, "bias")?;
            MossLinear::Dense(Linear::new(weight, Some(bias)))
        } else {
            w.pp("lm_head").linear(config.n_embd, config.vocab_size, true)?
        };

        Ok(Self {
            wte,
            blocks,
            ln_f,
            lm_head,
            placement,
            config: config.clone(),
        })
    }

    /// One empty KV cache per block.
    pub fn new_cache(&self) -> Vec<LayerKVCache> {
        (0..self.blocks.len()).map(|_| LayerKVCache::default()).collect()
    }

    /// Run `input_ids` `(batch, seq)` through the model, extending `cache`,
    /// and return F32 logits `(batch, vocab)` for the last position only.
    pub fn forward(&self, input_ids: &Tensor, cache: &mut [LayerKVCache]) -> Result<Tensor> {
        if cache.len() != self.blocks.len() {
            return Err(candle_core::Error::Msg(format!(
                "cache has {} layers, model has {}",
                cache.len(),
                self.blocks.len()
            )));
        }
        let (_, seq_len) = input_ids.dims2()?;
        let past = cache.first().map(LayerKVCache::len).unwrap_or(0);
        if past + seq_len > self.config.n_positions {
            return Err(candle_core::Error::Msg(format!(
                "sequence of {} tokens exceeds {} positions",
                past + seq_len,
                self.config.n_positions
            )));
        }

        let ids = input_ids.to_device(self.placement.device(ModuleSlot::Embedding))?;
        let mut x = self.wte.forward(&ids)?;
        for (i, (block, layer_cache)) in self.blocks.iter().zip(cache.iter_mut()).enumerate() {
            x = x.to_device(self.placement.device(ModuleSlot::Block(i)))?;
            x = block.forward(&x, layer_cache)?;
        }

        let x = x.to_device(self.placement.device(ModuleSlot::Head))?;
        let (_, t, _) = x.dims3()?;
        let x = x.i((.., t - 1, ..))?;
        let x = self.ln_f.forward(&x)?;
        self.lm_head.forward(&x)?.to_dtype(DType::F32)
    }

    pub fn placement(&self) -> &Placement {
        &self.placement
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use candle_core::Device;
    use candle_nn::{VarBuilder, VarMap};

    use crate::checkpoint::HostWeights;
    use crate::device_map::DeviceMap;

    fn tiny_config() -> MossConfig {
        MossConfig {
            vocab_size: 48,
            n_positions: 32,
            n_embd: 32,
            n_layer: 3,
            n_head: 4,
            rotary_dim: Some(4),
            n_inner: Some(64),
            ..Default::default()
        }
    }

    /// Model whose every slot reads from `varmap`, creating missing weights.
    fn from_varmap(config: &MossConfig, varmap: &VarMap, placement: Placement) -> MossForCausalLM {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        MossForCausalLM::new(config, placement, |_, _| Ok(Weights::dense(vb.clone())), |_| {})
            .unwrap()
    }

    fn logits_vec(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1().unwrap()
    }

    fn assert_close(a: &[f32], b: &[f32]) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b) {
            assert!((x - y).abs() < 1e-4, "{x} vs {y}");
        }
    }

    #[test]
    fn forward_returns_last_position_logits() {
        let dev = Device::Cpu;
        let config = tiny_config();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let mut slots = Vec::new();
        let mut placed = Vec::new();
        let model = MossForCausalLM::new(
            &config,
            Placement::single(dev.clone(), config.n_layer),
            |slot, _| {
                slots.push(slot);
                Ok(Weights::dense(vb.clone()))
            },
            |i| placed.push(i),
        )
        .unwrap();
        assert_eq!(placed, vec![0, 1, 2]);
        assert_eq!(
            slots,
            vec![
                ModuleSlot::Embedding,
                ModuleSlot::Block(0),
                ModuleSlot::Block(1),
                ModuleSlot::Block(2),
                ModuleSlot::Head,
            ]
        );

        let ids = Tensor::new(&[[1u32, 5, 7, 2]], &dev).unwrap();
        let mut cache = model.new_cache();
        let logits = model.forward(&ids, &mut cache).unwrap();
        assert_eq!(logits.dims(), &[1, config.vocab_size]);
        assert_eq!(logits.dtype(), DType::F32);
        assert_eq!(cache[0].len(), 4);
    }

    #[test]
    fn cached_decoding_matches_full_prefill() {
        let dev = Device::Cpu;
        let config = tiny_config();
        let varmap = VarMap::new();
        let model = from_varmap(&config, &varmap, Placement::single(dev.clone(), config.n_layer));

        let full = Tensor::new(&[[3u32, 9, 11, 4, 20]], &dev).unwrap();
        let mut cache = model.new_cache();
        let expected = model.forward(&full, &mut cache).unwrap();

        let mut cache = model.new_cache();
        model
            .forward(&full.narrow(1, 0, 4).unwrap(), &mut cache)
            .unwrap();
        let got = model
            .forward(&full.narrow(1, 4, 1).unwrap(), &mut cache)
            .unwrap();
        assert_close(&logits_vec(&expected), &logits_vec(&got));
    }

    #[test]
    fn dispatched_model_matches_single_device() {
        let dev = Device::Cpu;
        let config = tiny_config();
        let varmap = VarMap::new();
        let single = from_varmap(&config, &varmap, Placement::single(dev.clone(), config.n_layer));

        let placement = Placement::dispatched(
            vec![Device::Cpu, Device::Cpu],
            DeviceMap::auto(&config, 2),
        )
        .unwrap();
        let sharded = from_varmap(&config, &varmap, placement);
        assert!(sharded.placement().is_sharded());

        let ids = Tensor::new(&[[1u32, 2, 3]], &dev).unwrap();
        let a = single.forward(&ids, &mut single.new_cache()).unwrap();
        let b = sharded.forward(&ids, &mut sharded.new_cache()).unwrap();
        assert_close(&logits_vec(&a), &logits_vec(&b));
    }

    #[test]
    fn staged_checkpoint_places_every_slot() {
        let dev = Device::Cpu;
        let config = tiny_config();
        let varmap = VarMap::new();
        let reference = from_varmap(&config, &varmap, Placement::single(dev.clone(), config.n_layer));

        let tensors: HashMap<String, Tensor> = varmap
            .data()
            .lock()
            .unwrap()
            .iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect();
        let mut staged = HostWeights::new(tensors, DType::F32, 128);
        let placement = Placement::dispatched(
            vec![Device::Cpu, Device::Cpu],
            DeviceMap::auto(&config, 2),
        )
        .unwrap();
        let model =
            MossForCausalLM::new(&config, placement, |slot, dev| staged.take(slot, dev), |_| {})
                .unwrap();
        assert_eq!(staged.remaining(), 0);

        let ids = Tensor::new(&[[4u32, 8, 15]], &dev).unwrap();
        let a = reference.forward(&ids, &mut reference.new_cache()).unwrap();
        let b = model.forward(&ids, &mut model.new_cache()).unwrap();
        assert_close(&logits_vec(&a), &logits_vec(&b));
    }

    #[test]
    fn tied_head_reuses_embedding() {
        let dev = Device::Cpu;
        let config = MossConfig {
            tie_word_embeddings: true,
            ..tiny_config()
        };
        let varmap = VarMap::new();
        from_varmap(&config, &varmap, Placement::single(dev, config.n_layer));
        let vars = varmap.data().lock().unwrap();
        assert!(vars.contains_key("transformer.wte.weight"));
        assert!(vars.contains_key("lm_head.bias"));
        assert!(!vars.contains_key("lm_head.weight"));
    }

    #[test]
    fn rejects_sequences_past_the_position_table() {
        let dev = Device::Cpu;
        let config = tiny_config();
        let varmap = VarMap::new();
        let model = from_varmap(&config, &varmap, Placement::single(dev.clone(), config.n_layer));
        let ids = Tensor::zeros((1, config.n_positions + 1), DType::U32, &dev).unwrap();
        assert!(model.forward(&ids, &mut model.new_cache()).is_err());
    }
}

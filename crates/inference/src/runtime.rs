//! Inference runtime: load a MOSS checkpoint, generate replies.
//!
//! Loading stages every tensor on the host, then materialises the model
//! module by module on its target device. GPTQ layers are converted per
//! module as it is placed, so at most one module is ever expanded at once. Decoding runs one prefill pass over the prompt and then one token
//! at a time against the per-layer KV cache.

use std::path::Path;

use anyhow::{anyhow, Context};
use candle_core::{DType, Device, Tensor};
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::utils::apply_repeat_penalty;
use indicatif::{ProgressBar, ProgressStyle};
use tokenizers::Tokenizer;

use moss_common::MossConfig;
use moss_core::{
    discover_weight_files, load_tensors, DeviceMap, HostWeights, ModuleSlot, MossForCausalLM,
    Placement,
};

use crate::conversation::{EncodeError, Responder};
use crate::generation::GenerationConfig;
use crate::tokenizer::load_tokenizer;

/// Model, tokenizer and sampler for one chat session.
pub struct MossRuntime {
    model: MossForCausalLM,
    tokenizer: Tokenizer,
    generation: GenerationConfig,
    logits_processor: LogitsProcessor,
}

impl MossRuntime {
    /// Load `model_dir` across `num_devices` accelerators (the visible ones,
    /// numbered from 0). Falls back to the CPU when no accelerator is usable.
    pub fn load(model_dir: &Path, num_devices: usize, seed: u64) -> anyhow::Result<Self> {
        let config = MossConfig::load(&model_dir.join("config.json"))?;
        let tokenizer = load_tokenizer(model_dir)?;

        let devices = (0..num_devices.max(1))
            .map(Device::cuda_if_available)
            .collect::<candle_core::Result<Vec<_>>>()?;
        let dtype = if devices[0].is_cuda() {
            DType::F16
        } else {
            DType::F32
        };
        tracing::info!(
            layers = config.n_layer,
            devices = devices.len(),
            ?dtype,
            wbits = config.wbits,
            "loading model"
        );

        let files = discover_weight_files(model_dir)?;
        let mut host = HostWeights::new(load_tensors(&files)?, dtype, config.groupsize);
        let packed = host.packed_layers();
        if config.is_quantized() && packed == 0 {
            tracing::warn!(
                wbits = config.wbits,
                "config declares a quantized model but no packed layers were found"
            );
        }
        tracing::debug!(tensors = host.remaining(), packed, "weights staged on host");

        let model = if devices.len() > 1 {
            eprintln!("Waiting for all devices to be ready, it may take a few minutes...");
            let map = DeviceMap::auto(&config, devices.len());
            tracing::info!(
                head = map.device_index(ModuleSlot::Head),
                used = map.devices_used(),
                "dispatching blocks"
            );
            let placement = Placement::dispatched(devices, map)?;

            let pb = ProgressBar::new(config.n_layer as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("[{elapsed_precise}] {bar:40} {pos}/{len} blocks")?
                    .progress_chars("=>-"),
            );
            let model = MossForCausalLM::new(
                &config,
                placement,
                |slot, device| host.take(slot, device),
                |_| pb.inc(1),
            )?;
            pb.finish_and_clear();
            model
        } else {
            let device = devices.into_iter().next().unwrap_or(Device::Cpu);
            MossForCausalLM::new(
                &config,
                Placement::single(device, config.n_layer),
                |slot, device| host.take(slot, device),
                |_| {},
            )?
        };

        if host.remaining() > 0 {
            tracing::debug!(unused = host.remaining(), "checkpoint tensors left unplaced");
        }

        Ok(Self::from_parts(model, tokenizer, GenerationConfig::moss(), seed))
    }

    pub fn from_parts(
        model: MossForCausalLM,
        tokenizer: Tokenizer,
        generation: GenerationConfig,
        seed: u64,
    ) -> Self {
        let logits_processor = LogitsProcessor::from_sampling(seed, generation.sampling());
        Self {
            model,
            tokenizer,
            generation,
            logits_processor,
        }
    }

    /// Continue `prompt` until `<eom>` or the length limit. Returns only the
    /// generated tokens, `<eom>` included when it was produced.
    pub fn generate(&mut self, prompt: &[u32]) -> anyhow::Result<Vec<u32>> {
        let max_length = self.generation.max_length;
        if prompt.is_empty() {
            return Err(anyhow!("empty prompt"));
        }
        if prompt.len() >= max_length {
            return Ok(Vec::new());
        }

        let device = self.model.placement().device(ModuleSlot::Embedding).clone();
        let mut cache = self.model.new_cache();
        let mut tokens = prompt.to_vec();
        let mut input = Tensor::new(prompt, &device)?.unsqueeze(0)?;

        while tokens.len() < max_length {
            let logits = self.model.forward(&input, &mut cache)?.squeeze(0)?;
            let logits = if self.generation.repetition_penalty == 1.0 {
                logits
            } else {
                apply_repeat_penalty(&logits, self.generation.repetition_penalty, &tokens)?
            };
            let next = self.logits_processor.sample(&logits)?;
            tokens.push(next);
            if next == self.generation.eos_token_id {
                break;
            }
            input = Tensor::new(&[next], &device)?.unsqueeze(0)?;
        }

        tracing::debug!(
            prompt = prompt.len(),
            generated = tokens.len() - prompt.len(),
            "generation finished"
        );
        Ok(tokens.split_off(prompt.len()))
    }
}

impl Responder for MossRuntime {
    type Prompt = Vec<u32>;

    fn encode(&self, text: &str) -> Result<Vec<u32>, EncodeError> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| EncodeError::Tokenizer(e.to_string()))?;
        let ids = encoding.get_ids().to_vec();
        if ids.is_empty() {
            return Err(EncodeError::Tokenizer("input produced no tokens".into()));
        }
        if ids.len() >= self.generation.max_length {
            return Err(EncodeError::ContextFull {
                tokens: ids.len(),
                max_length: self.generation.max_length,
            });
        }
        Ok(ids)
    }

    fn respond(&mut self, prompt: Vec<u32>) -> anyhow::Result<String> {
        let generated = self.generate(&prompt)?;
        self.tokenizer
            .decode(&generated, true)
            .map_err(|e| anyhow!("decode: {e}"))
            .context("decoding the response")
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

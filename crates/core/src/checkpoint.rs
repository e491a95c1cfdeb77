//! Checkpoint discovery and host-side staging.
//!
//! A model directory holds either safetensors or PyTorch pickles, single-file
//! or sharded behind an index. Every tensor is read into host memory first;
//! [`HostWeights`] then hands them out one module at a time, so nothing
//! reaches an accelerator before the module that owns it is placed.
//!
//! candle's pickle reader has no mapping for `IntStorage`, which is where
//! GPTQ checkpoints keep `qweight`, `qzeros` and `g_idx`. Those storages are
//! read here directly from the zip archive, as raw 32-bit words.

use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use candle_core::pickle::{Object, Stack};
use candle_core::{DType, Device, Error, Result, Tensor};
use candle_nn::VarBuilder;
use zip::ZipArchive;

use crate::device_map::ModuleSlot;
use crate::linear::Weights;
use crate::quantize::take_gptq_layers;

/// Candidate weight layouts, in order of preference.
const INDEX_FILES: [&str; 2] = ["model.safetensors.index.json", "pytorch_model.bin.index.json"];
const SINGLE_FILES: [&str; 2] = ["model.safetensors", "pytorch_model.bin"];

/// List the weight files of a checkpoint directory.
///
/// Safetensors win over pickles; within a format an index wins over a single
/// file.
pub fn discover_weight_files(dir: &Path) -> Result<Vec<PathBuf>> {
    for (index, single) in INDEX_FILES.iter().zip(SINGLE_FILES.iter()) {
        let index_path = dir.join(index);
        if index_path.exists() {
            return shards_from_index(dir, &index_path);
        }
        let single_path = dir.join(single);
        if single_path.exists() {
            return Ok(vec![single_path]);
        }
    }
    Err(Error::Msg(format!(
        "no weights found in {} (looked for {} and {})",
        dir.display(),
        INDEX_FILES.join(", "),
        SINGLE_FILES.join(", ")
    )))
}

/// Shard files named by the `weight_map` of an index, deduplicated and sorted.
fn shards_from_index(dir: &Path, index_path: &Path) -> Result<Vec<PathBuf>> {
    let json = std::fs::read_to_string(index_path)?;
    let index: serde_json::Value = serde_json::from_str(&json)
        .map_err(|e| Error::Msg(format!("parse {}: {e}", index_path.display())))?;
    let weight_map = index
        .get("weight_map")
        .and_then(|m| m.as_object())
        .ok_or_else(|| Error::Msg(format!("{} has no weight_map", index_path.display())))?;
    let shards: BTreeSet<&str> = weight_map.values().filter_map(|v| v.as_str()).collect();
    if shards.is_empty() {
        return Err(Error::Msg(format!("{} lists no shards", index_path.display())));
    }
    Ok(shards.into_iter().map(|s| dir.join(s)).collect())
}

/// Read every tensor of every file into host memory.
pub fn load_tensors(files: &[PathBuf]) -> Result<HashMap<String, Tensor>> {
    let mut all = HashMap::new();
    for (i, file) in files.iter().enumerate() {
        tracing::info!(
            shard = i + 1,
            total = files.len(),
            file = %file.display(),
            "reading weights"
        );
        let is_safetensors = file.extension().and_then(|e| e.to_str()) == Some("safetensors");
        if is_safetensors {
            all.extend(candle_core::safetensors::load(file, &Device::Cpu)?);
        } else {
            all.extend(read_pickle(file)?);
        }
    }
    Ok(all)
}

fn read_pickle(file: &Path) -> Result<HashMap<String, Tensor>> {
    let mut tensors: HashMap<String, Tensor> =
        candle_core::pickle::read_all(file)?.into_iter().collect();
    for (name, tensor) in read_int32_storages(file)? {
        tensors.entry(name).or_insert(tensor);
    }
    Ok(tensors)
}

// ── IntStorage ──────────────────────────────────────────────────────────────

/// `_rebuild_tensor_v2` arguments of one tensor backed by an `IntStorage`.
struct Int32Entry {
    key: String,
    offset: usize,
    shape: Vec<usize>,
    stride: Vec<usize>,
}

fn int_value(o: &Object) -> Option<usize> {
    match o {
        Object::Int(v) => usize::try_from(*v).ok(),
        _ => None,
    }
}

fn int_tuple(o: &Object) -> Option<Vec<usize>> {
    match o {
        Object::Tuple(items) => items.iter().map(int_value).collect(),
        _ => None,
    }
}

impl Int32Entry {
    /// `None` for anything that is not an `IntStorage` tensor.
    fn parse(value: Object) -> Option<Self> {
        let Object::Reduce { callable, args } = value else {
            return None;
        };
        match *callable {
            Object::Class { ref class_name, .. } if class_name == "_rebuild_tensor_v2" => {}
            _ => return None,
        }
        let Object::Tuple(args) = *args else {
            return None;
        };
        let mut args = args.into_iter();
        let Object::PersistentLoad(pid) = args.next()? else {
            return None;
        };
        // ("storage", storage type, key, location, numel)
        let Object::Tuple(pid) = *pid else {
            return None;
        };
        let mut pid = pid.into_iter().skip(1);
        match pid.next()? {
            Object::Class { class_name, .. } if class_name == "IntStorage" => {}
            _ => return None,
        }
        let Object::Unicode(key) = pid.next()? else {
            return None;
        };
        Some(Self {
            key,
            offset: int_value(&args.next()?)?,
            shape: int_tuple(&args.next()?)?,
            stride: int_tuple(&args.next()?)?,
        })
    }

    fn is_contiguous(&self) -> bool {
        let mut expected = 1;
        for (&dim, &stride) in self.shape.iter().zip(&self.stride).rev() {
            if dim > 1 && stride != expected {
                return false;
            }
            expected *= dim;
        }
        true
    }
}

/// Tensors of a `torch.save` archive whose storage is `IntStorage`, as `U32`
/// tensors holding the same bits.
fn read_int32_storages(file: &Path) -> Result<Vec<(String, Tensor)>> {
    let mut archive = ZipArchive::new(BufReader::new(File::open(file)?)).map_err(Error::wrap)?;
    let pickle_name = archive
        .file_names()
        .find(|name| name.ends_with("data.pkl"))
        .map(str::to_string)
        .ok_or_else(|| Error::Msg(format!("{} has no data.pkl", file.display())))?;
    let dir = &pickle_name[..pickle_name.len() - "data.pkl".len()];

    let mut stack = Stack::empty();
    {
        let entry = archive.by_name(&pickle_name).map_err(Error::wrap)?;
        stack.read_loop(&mut BufReader::new(entry))?;
    }
    let Object::Dict(entries) = stack.finalize()? else {
        return Ok(Vec::new());
    };

    let mut out = Vec::new();
    for (name, value) in entries {
        let (Object::Unicode(name), Some(entry)) = (name, Int32Entry::parse(value)) else {
            continue;
        };
        if !entry.is_contiguous() {
            return Err(Error::Msg(format!(
                "{name}: non-contiguous int32 tensor (stride {:?})",
                entry.stride
            )));
        }
        let mut bytes = Vec::new();
        archive
            .by_name(&format!("{dir}data/{}", entry.key))
            .map_err(Error::wrap)?
            .read_to_end(&mut bytes)?;
        let numel: usize = entry.shape.iter().product();
        let data = bytes
            .get(entry.offset * 4..(entry.offset + numel) * 4)
            .ok_or_else(|| Error::Msg(format!("{name}: storage {} too short", entry.key)))?;
        let tensor = Tensor::from_raw_buffer(data, DType::U32, &entry.shape, &Device::Cpu)?;
        out.push((name, tensor));
    }
    Ok(out)
}

// ── Per-module hand-out ─────────────────────────────────────────────────────

/// Tensor name prefixes owned by one module slot.
fn slot_prefixes(slot: ModuleSlot) -> Vec<String> {
    match slot {
        ModuleSlot::Embedding => vec!["transformer.wte.".to_string()],
        ModuleSlot::Block(i) => vec![format!("transformer.h.{i}.")],
        ModuleSlot::Head => vec!["transformer.ln_f.".to_string(), "lm_head.".to_string()],
    }
}

/// Staged checkpoint tensors, handed out module by module.
pub struct HostWeights {
    tensors: HashMap<String, Tensor>,
    dtype: DType,
    groupsize: usize,
}

impl HostWeights {
    pub fn new(tensors: HashMap<String, Tensor>, dtype: DType, groupsize: usize) -> Self {
        Self {
            tensors,
            dtype,
            groupsize,
        }
    }

    /// Number of GPTQ-packed layers still staged.
    pub fn packed_layers(&self) -> usize {
        self.tensors.keys().filter(|k| k.ends_with(".qweight")).count()
    }

    /// Tensors not handed out yet.
    pub fn remaining(&self) -> usize {
        self.tensors.len()
    }

    /// Move the tensors of `slot` out of host staging and build its weight
    /// source on `device`. Packed layers are converted on the way.
    pub fn take(&mut self, slot: ModuleSlot, device: &Device) -> Result<Weights<'static>> {
        let prefixes = slot_prefixes(slot);
        let names: Vec<String> = self
            .tensors
            .keys()
            .filter(|k| prefixes.iter().any(|p| k.starts_with(p.as_str())))
            .cloned()
            .collect();
        let mut subset: HashMap<String, Tensor> = names
            .iter()
            .filter_map(|name| self.tensors.remove_entry(name))
            .collect();
        let packed = take_gptq_layers(&mut subset, self.groupsize, device)?;
        tracing::debug!(?slot, tensors = subset.len(), packed = packed.len(), "placing module");
        Ok(Weights::new(
            VarBuilder::from_tensors(subset, self.dtype, device),
            packed,
        ))
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

//! Launch parameters: which checkpoint to run and on which GPUs.
//!
//! The only cross-field rule is that GPTQ checkpoints cannot be sharded, so
//! a quantized model must run on exactly one device. [`LaunchConfig::new`]
//! enforces it before anything is downloaded or loaded.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LaunchError {
    #[error(
        "Quantized models do not support model parallel. Please run on a single GPU \
         (e.g., --gpu 0) or use `{}`",
        ModelName::MossMoon003Sft
    )]
    QuantizedModelParallel,

    #[error("unknown model name `{0}` (expected one of: {})", ModelName::ALL_IDS.join(", "))]
    UnknownModel(String),
}

/// Checkpoints the CLI accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModelName {
    MossMoon003Sft,
    MossMoon003SftInt8,
    #[default]
    MossMoon003SftInt4,
}

impl ModelName {
    pub const ALL_IDS: [&'static str; 3] = [
        "fnlp/moss-moon-003-sft",
        "fnlp/moss-moon-003-sft-int8",
        "fnlp/moss-moon-003-sft-int4",
    ];

    /// Hub repository id (also tried as a local path first).
    pub fn id(self) -> &'static str {
        match self {
            Self::MossMoon003Sft => Self::ALL_IDS[0],
            Self::MossMoon003SftInt8 => Self::ALL_IDS[1],
            Self::MossMoon003SftInt4 => Self::ALL_IDS[2],
        }
    }

    pub fn is_quantized(self) -> bool {
        matches!(self, Self::MossMoon003SftInt8 | Self::MossMoon003SftInt4)
    }
}

impl fmt::Display for ModelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for ModelName {
    type Err = LaunchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fnlp/moss-moon-003-sft" => Ok(Self::MossMoon003Sft),
            "fnlp/moss-moon-003-sft-int8" => Ok(Self::MossMoon003SftInt8),
            "fnlp/moss-moon-003-sft-int4" => Ok(Self::MossMoon003SftInt4),
            other => Err(LaunchError::UnknownModel(other.to_string())),
        }
    }
}

/// Raw `--gpu` value, e.g. `"0"` or `"0,1,2"`.
///
/// Entries are not parsed or range-checked; the string is handed to
/// `CUDA_VISIBLE_DEVICES` verbatim and only the entry count matters here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuList(String);

impl GpuList {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Number of comma-separated entries.
    pub fn count(&self) -> usize {
        self.0.split(',').count()
    }
}

impl Default for GpuList {
    fn default() -> Self {
        Self::new("0")
    }
}

/// Validated launch parameters. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchConfig {
    model: ModelName,
    gpus: GpuList,
}

impl LaunchConfig {
    pub fn new(model: ModelName, gpus: GpuList) -> Result<Self, LaunchError> {
        if model.is_quantized() && gpus.count() > 1 {
            return Err(LaunchError::QuantizedModelParallel);
        }
        Ok(Self { model, gpus })
    }

    pub fn model(&self) -> ModelName {
        self.model
    }

    pub fn gpus(&self) -> &GpuList {
        &self.gpus
    }

    pub fn num_devices(&self) -> usize {
        self.gpus.count()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

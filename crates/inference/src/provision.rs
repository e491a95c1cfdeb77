//! Locate model artifacts: a local directory, or a hub snapshot.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use hf_hub::api::sync::ApiBuilder;

use moss_common::{GpuList, LaunchConfig, ModelName};

/// Validate the model/GPU combination, expose the GPU list to the CUDA
/// runtime, then fetch and load the model.
///
/// Nothing is downloaded or loaded when validation fails. `load` receives the
/// model directory and the number of devices to spread the model over.
pub fn launch<T>(
    model: ModelName,
    gpus: GpuList,
    fetch: impl FnOnce(&str) -> Result<PathBuf>,
    load: impl FnOnce(&Path, usize) -> Result<T>,
) -> Result<T> {
    let config = LaunchConfig::new(model, gpus)?;

    // Device ordinals used while loading are relative to this list.
    std::env::set_var("CUDA_VISIBLE_DEVICES", config.gpus().as_str());

    let model_dir = resolve_model_dir(config.model().id(), fetch)?;
    tracing::info!(model = %config.model(), dir = %model_dir.display(), "launching");
    load(&model_dir, config.num_devices())
}

/// Resolve `model_id` to a directory holding `config.json`, the tokenizer
/// files and the weights.
///
/// An existing filesystem path is used as-is; anything else goes to `fetch`.
pub fn resolve_model_dir(
    model_id: &str,
    fetch: impl FnOnce(&str) -> Result<PathBuf>,
) -> Result<PathBuf> {
    let local = Path::new(model_id);
    if local.exists() {
        tracing::info!(path = %local.display(), "using local model directory");
        return Ok(local.to_path_buf());
    }
    fetch(model_id)
}

/// Download every file of a hub model repository into the local cache and
/// return the snapshot directory.
///
/// Caching and resumption are handled by `hf-hub`; already cached files are
/// not fetched again.
pub fn snapshot_download(repo_id: &str) -> Result<PathBuf> {
    let api = ApiBuilder::new()
        .with_progress(true)
        .build()
        .context("unable to create huggingface api")?;
    let repo = api.model(repo_id.to_string());
    let info = repo
        .info()
        .with_context(|| format!("unable to list files of {repo_id}"))?;

    let mut root = None;
    for sibling in &info.siblings {
        let path = repo
            .get(&sibling.rfilename)
            .with_context(|| format!("unable to download {repo_id}/{}", sibling.rfilename))?;
        tracing::debug!(file = %sibling.rfilename, "fetched");
        if sibling.rfilename == "config.json" {
            root = path.parent().map(Path::to_path_buf);
        }
    }
    root.ok_or_else(|| anyhow!("{repo_id} has no config.json"))
}

// ── Tests ───────────────────────────────────────────────────────────────────

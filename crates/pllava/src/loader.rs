use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use candle_core::Device;
use candle_nn::VarBuilder;
use hf_hub::api::sync::{Api, ApiRepo};
use log::{debug, info, warn};
use serde::Deserialize;

use crate::config::PllavaConfig;
use crate::device::{select_accelerator, DeviceMap};
use crate::error::PllavaError;
use crate::model::{lora::LoraConfig, weights::Weights, PllavaModel};
use crate::processor::PllavaProcessor;

/// Repository the tokenizer and the image processor settings fall back to.
pub const FALLBACK_PROCESSOR_REPO: &str = "llava-hf/llava-1.5-7b-hf";

/// Options of [`load_pllava`].
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Frames per pooled media group.
    pub num_frames: usize,
    pub use_lora: bool,
    /// Directory with fine-tuned weights overlaid on the base checkpoint.
    pub weight_dir: Option<PathBuf>,
    pub lora_alpha: f64,
    /// Spread the decoder layers over every visible GPU.
    pub use_multi_gpus: bool,
    /// Pooling shape replacing the one of the checkpoint configuration.
    pub pooling_shape: Option<[usize; 3]>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            num_frames: 4,
            use_lora: false,
            weight_dir: None,
            lora_alpha: 32.0,
            use_multi_gpus: false,
            pooling_shape: Some([16, 12, 12]),
        }
    }
}

/// Where the checkpoint files come from.
pub enum ModelSource {
    Local(PathBuf),
    Hub(ApiRepo),
}

impl ModelSource {
    /// A local directory when `repo` is one, a Hugging Face Hub repository otherwise.
    pub fn new(repo: &str) -> Result<Self, PllavaError> {
        let path = Path::new(repo);
        if path.is_dir() {
            return Ok(Self::Local(path.to_path_buf()));
        }
        debug!("Loading model from HuggingFace Hub: {repo}");
        Ok(Self::Hub(Api::new()?.model(repo.to_string())))
    }

    pub fn get(&self, file: &str) -> Result<PathBuf, PllavaError> {
        match self {
            Self::Local(dir) => {
                let path = dir.join(file);
                if path.is_file() {
                    Ok(path)
                } else {
                    Err(PllavaError::MissingWeights(format!(
                        "{} does not exist",
                        path.display()
                    )))
                }
            }
            Self::Hub(repo) => Ok(repo.get(file)?),
        }
    }

    /// Like [`ModelSource::get`], for files a checkpoint may not have.
    pub fn try_get(&self, file: &str) -> Option<PathBuf> {
        match self.get(file) {
            Ok(path) => Some(path),
            Err(e) => {
                debug!("{file} not available: {e}");
                None
            }
        }
    }
}

#[derive(Deserialize)]
struct SafetensorsIndex {
    weight_map: std::collections::HashMap<String, String>,
}

/// Safetensors files of a checkpoint, from its shard index or its single file.
pub fn weight_files(source: &ModelSource) -> Result<Vec<PathBuf>, PllavaError> {
    if let Some(index) = source.try_get("model.safetensors.index.json") {
        let index: SafetensorsIndex = serde_json::from_str(&std::fs::read_to_string(index)?)?;
        let shards = index.weight_map.into_values().collect::<BTreeSet<_>>();
        return shards.iter().map(|shard| source.get(shard)).collect();
    }
    source
        .try_get("model.safetensors")
        .map(|path| vec![path])
        .ok_or_else(|| {
            PllavaError::MissingWeights(
                "neither model.safetensors nor model.safetensors.index.json found".to_string(),
            )
        })
}

/// Safetensors files of a fine-tuned weight directory.
///
/// Either `model.safetensors` or every `model-0*.safetensors` shard.
pub fn overlay_files(dir: &Path) -> Result<Vec<PathBuf>, PllavaError> {
    let single = dir.join("model.safetensors");
    if single.is_file() {
        return Ok(vec![single]);
    }

    let mut shards = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("model-0") && n.ends_with(".safetensors"))
        })
        .collect::<Vec<_>>();
    shards.sort();

    if shards.is_empty() {
        return Err(PllavaError::MissingWeights(format!(
            "no safetensors weights in {}",
            dir.display()
        )));
    }
    Ok(shards)
}

fn load_config(source: &ModelSource, options: &LoadOptions) -> Result<PllavaConfig, PllavaError> {
    let overlay_config = options
        .weight_dir
        .as_ref()
        .filter(|_| options.use_lora)
        .map(|dir| dir.join("config.json"))
        .filter(|path| path.is_file());

    let mut config = match overlay_config {
        Some(path) => {
            info!("Using the configuration of {}", path.display());
            PllavaConfig::from_file(path)?
        }
        None => PllavaConfig::from_file(source.get("config.json")?)?,
    };

    config.num_frames = options.num_frames;
    if let Some(shape) = options.pooling_shape {
        config.pooling_shape = shape;
    }
    config.validate()?;
    Ok(config)
}

fn load_processor(source: &ModelSource) -> Result<PllavaProcessor, PllavaError> {
    let (tokenizer, preprocessor) = match source.try_get("tokenizer.json") {
        Some(tokenizer) => (tokenizer, source.try_get("preprocessor_config.json")),
        None => {
            warn!("No tokenizer in the checkpoint, using {FALLBACK_PROCESSOR_REPO}");
            let fallback = ModelSource::Hub(Api::new()?.model(FALLBACK_PROCESSOR_REPO.to_string()));
            (
                fallback.get("tokenizer.json")?,
                fallback.try_get("preprocessor_config.json"),
            )
        }
    };
    PllavaProcessor::from_files(tokenizer, preprocessor.as_deref())
}

/// Load a PLLaVA checkpoint and its processor.
///
/// Weights are read in the dtype of the accelerator. A single device model stays on
/// the host until it is moved with [`PllavaModel::to_device`], a multi GPU model is
/// dispatched right away.
///
/// # Arguments
///
/// * `repo` - A local checkpoint directory or a Hugging Face Hub repository id.
/// * `options` - The loading options.
pub fn load_pllava(
    repo: &str,
    options: &LoadOptions,
) -> Result<(PllavaModel, PllavaProcessor), PllavaError> {
    let source = ModelSource::new(repo)?;
    let config = load_config(&source, options)?;

    let mut files = weight_files(&source)?;
    if let Some(dir) = &options.weight_dir {
        let overlay = overlay_files(dir)?;
        info!("Overlaying {} weight files from {}", overlay.len(), dir.display());
        files.extend(overlay);
    }

    let lora = match (&options.weight_dir, options.use_lora) {
        (Some(_), true) => Some(LoraConfig::new(options.lora_alpha)),
        (None, true) => {
            warn!("LoRA requested without a weight directory, loading the base model only");
            None
        }
        _ => None,
    };

    let (_, dtype) = select_accelerator();
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(&files, dtype, &Device::Cpu)? };
    let mut model = PllavaModel::load(&Weights::new(vb, lora), config)?;

    if options.use_multi_gpus {
        let map = DeviceMap::cuda(model.config().text_config.num_hidden_layers)?;
        model.dispatch(&map)?;
        info!("Dispatched the decoder layers over {} GPUs", map.num_devices());
    }

    let processor = load_processor(&source)?;
    info!("Loaded PLLaVA from {repo}");
    Ok((model, processor))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlay_prefers_single_file() -> Result<(), PllavaError> {
        let dir = tempfile::tempdir()?;
        for name in ["model-00002-of-00002.safetensors", "model-00001-of-00002.safetensors", "adapter.bin"] {
            std::fs::write(dir.path().join(name), b"")?;
        }
        let files = overlay_files(dir.path())?;
        assert_eq!(
            files,
            vec![
                dir.path().join("model-00001-of-00002.safetensors"),
                dir.path().join("model-00002-of-00002.safetensors"),
            ]
        );

        std::fs::write(dir.path().join("model.safetensors"), b"")?;
        assert_eq!(overlay_files(dir.path())?, vec![dir.path().join("model.safetensors")]);
        Ok(())
    }

    #[test]
    fn test_overlay_without_weights() -> Result<(), PllavaError> {
        let dir = tempfile::tempdir()?;
        assert!(matches!(
            overlay_files(dir.path()),
            Err(PllavaError::MissingWeights(_))
        ));
        Ok(())
    }

    #[test]
    fn test_weight_files_from_index() -> Result<(), PllavaError> {
        let dir = tempfile::tempdir()?;
        std::fs::write(
            dir.path().join("model.safetensors.index.json"),
            r#"{"metadata": {}, "weight_map": {"a": "model-00002-of-00002.safetensors", "b": "model-00001-of-00002.safetensors", "c": "model-00001-of-00002.safetensors"}}"#,
        )?;
        for name in ["model-00001-of-00002.safetensors", "model-00002-of-00002.safetensors"] {
            std::fs::write(dir.path().join(name), b"")?;
        }

        let source = ModelSource::Local(dir.path().to_path_buf());
        assert_eq!(
            weight_files(&source)?,
            vec![
                dir.path().join("model-00001-of-00002.safetensors"),
                dir.path().join("model-00002-of-00002.safetensors"),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_config_overrides() -> Result<(), PllavaError> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("config.json"), r#"{"num_frames": 16, "pooling_shape": [16, 12, 12]}"#)?;
        let source = ModelSource::Local(dir.path().to_path_buf());

        let options = LoadOptions {
            num_frames: 4,
            pooling_shape: Some([4, 12, 12]),
            ..Default::default()
        };
        let config = load_config(&source, &options)?;
        assert_eq!(config.num_frames, 4);
        assert_eq!(config.pooling_shape, [4, 12, 12]);

        let options = LoadOptions {
            num_frames: 0,
            ..Default::default()
        };
        assert!(matches!(
            load_config(&source, &options),
            Err(PllavaError::InvalidConfig(_))
        ));
        Ok(())
    }

    #[test]
    fn test_lora_config_from_weight_dir() -> Result<(), PllavaError> {
        let base = tempfile::tempdir()?;
        let tuned = tempfile::tempdir()?;
        std::fs::write(base.path().join("config.json"), r#"{"num_frames": 16}"#)?;
        std::fs::write(tuned.path().join("config.json"), r#"{"use_pooling": false}"#)?;
        let source = ModelSource::Local(base.path().to_path_buf());

        let options = LoadOptions {
            use_lora: true,
            weight_dir: Some(tuned.path().to_path_buf()),
            ..Default::default()
        };
        assert!(!load_config(&source, &options)?.use_pooling);

        let options = LoadOptions {
            weight_dir: Some(tuned.path().to_path_buf()),
            ..Default::default()
        };
        assert!(load_config(&source, &options)?.use_pooling);
        Ok(())
    }

    // cargo test -p pllava test_load_pllava_7b --features cuda -- --ignored
    #[test]
    #[ignore = "Requires the PLLaVA 7B checkpoint"]
    fn test_load_pllava_7b() -> Result<(), PllavaError> {
        let _ = env_logger::builder().is_test(true).try_init();
        let (model, processor) = load_pllava("ermu2001/pllava-7b", &LoadOptions::default())?;
        assert_eq!(model.config().num_frames, 4);
        assert_eq!(processor.token_id("<image>"), Some(model.config().image_token_index));
        Ok(())
    }
}

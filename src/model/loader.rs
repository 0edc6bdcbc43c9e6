//! Model loading utilities.
//!
//! This module provides functions for:
//! - Resolving model files from HuggingFace Hub or a local directory
//! - Parsing Llama-family `config.json`
//! - Gating models that declare custom code behind `trust_remote_code`
//! - Memory-mapping SafeTensors weights

use std::path::{Path, PathBuf};

use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use hf_hub::{Repo, RepoType, api::sync::Api};
use serde::Deserialize;

use crate::error::{Error, Result};

/// Architectures the Llama implementation can run.
pub const SUPPORTED_ARCHITECTURES: &[&str] = &["LlamaForCausalLM", "MistralForCausalLM"];

/// Paths to resolved model files.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    /// Path to config.json.
    pub config: PathBuf,
    /// Paths to weight files (SafeTensors).
    pub weights: Vec<PathBuf>,
    /// Path to tokenizer.json.
    pub tokenizer: PathBuf,
    /// Path to generation_config.json, when the model ships one.
    pub generation_config: Option<PathBuf>,
}

/// Resolves model files for `model`.
///
/// An existing directory is used as-is; anything else is treated as a
/// HuggingFace model ID and downloaded at `revision`.
pub fn resolve_model_files(model: &str, revision: &str) -> Result<ModelFiles> {
    let dir = Path::new(model);
    if dir.is_dir() {
        local_model_files(dir)
    } else {
        download_model(model, revision)
    }
}

/// Downloads model files from HuggingFace Hub.
pub fn download_model(model_id: &str, revision: &str) -> Result<ModelFiles> {
    let api = Api::new().map_err(|e| Error::ModelLoad(format!("failed to create HF API: {e}")))?;

    let repo = api.repo(Repo::with_revision(
        model_id.to_string(),
        RepoType::Model,
        revision.to_string(),
    ));

    let config = repo
        .get("config.json")
        .map_err(|e| Error::ModelLoad(format!("failed to download config.json: {e}")))?;

    let weights = match repo.get("model.safetensors") {
        Ok(path) => vec![path],
        Err(_) => {
            let index = repo.get("model.safetensors.index.json").map_err(|e| {
                Error::ModelLoad(format!("no SafeTensors weights found for {model_id}: {e}"))
            })?;
            shard_file_names(&index)?
                .into_iter()
                .map(|name| {
                    repo.get(&name)
                        .map_err(|e| Error::ModelLoad(format!("failed to download {name}: {e}")))
                })
                .collect::<Result<Vec<_>>>()?
        }
    };

    let tokenizer = repo
        .get("tokenizer.json")
        .map_err(|e| Error::ModelLoad(format!("failed to download tokenizer.json: {e}")))?;

    let generation_config = repo.get("generation_config.json").ok();

    Ok(ModelFiles {
        config,
        weights,
        tokenizer,
        generation_config,
    })
}

/// Collects model files from a local directory laid out like a hub snapshot.
pub fn local_model_files(dir: &Path) -> Result<ModelFiles> {
    let required = |name: &str| {
        let path = dir.join(name);
        if path.is_file() {
            Ok(path)
        } else {
            Err(Error::ModelLoad(format!("{} is missing", path.display())))
        }
    };

    let config = required("config.json")?;
    let tokenizer = required("tokenizer.json")?;

    let single = dir.join("model.safetensors");
    let weights = if single.is_file() {
        vec![single]
    } else {
        let index = required("model.safetensors.index.json")?;
        shard_file_names(&index)?
            .into_iter()
            .map(|name| required(&name))
            .collect::<Result<Vec<_>>>()?
    };

    let generation_config = Some(dir.join("generation_config.json")).filter(|p| p.is_file());

    Ok(ModelFiles {
        config,
        weights,
        tokenizer,
        generation_config,
    })
}

/// Unique, sorted shard file names listed in a safetensors index.
fn shard_file_names(index_path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(index_path)
        .map_err(|e| Error::ModelLoad(format!("failed to read safetensors index: {e}")))?;
    parse_shard_index(&content)
}

/// Extracts weight file names from the `weight_map` of an index file.
pub fn parse_shard_index(content: &str) -> Result<Vec<String>> {
    let index: serde_json::Value = serde_json::from_str(content)?;
    let weight_map = index["weight_map"].as_object().ok_or_else(|| {
        Error::ModelLoad("invalid safetensors index: missing weight_map".into())
    })?;

    let mut files: Vec<String> = weight_map
        .values()
        .filter_map(|v| v.as_str())
        .map(str::to_string)
        .collect();
    files.sort();
    files.dedup();
    Ok(files)
}

/// Creates a VarBuilder over memory-mapped SafeTensors files.
///
/// # Safety
///
/// The files must not be modified while the returned builder is alive.
#[allow(unsafe_code)]
pub fn load_safetensors(
    paths: &[PathBuf],
    dtype: DType,
    device: &Device,
) -> Result<VarBuilder<'static>> {
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(paths, dtype, device)? };
    Ok(vb)
}

/// Loads and parses config.json.
pub fn load_config(path: &Path) -> Result<LlamaConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::ModelLoad(format!("failed to read config.json: {e}")))?;
    serde_json::from_str(&content)
        .map_err(|e| Error::ModelLoad(format!("failed to parse config.json: {e}")))
}

/// Reads extra EOS ids from generation_config.json.
pub fn load_generation_eos(path: &Path) -> Result<Vec<u32>> {
    #[derive(Deserialize)]
    struct GenerationConfig {
        #[serde(default)]
        eos_token_id: Option<TokenIds>,
    }

    let content = std::fs::read_to_string(path)?;
    let config: GenerationConfig = serde_json::from_str(&content)?;
    Ok(config.eos_token_id.map(TokenIds::into_vec).unwrap_or_default())
}

/// A token id field that HF configs write either as a number or a list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum TokenIds {
    Single(u32),
    Multiple(Vec<u32>),
}

impl TokenIds {
    pub fn into_vec(self) -> Vec<u32> {
        match self {
            Self::Single(id) => vec![id],
            Self::Multiple(ids) => ids,
        }
    }
}

/// `rope_scaling` block of a Llama 3.x config.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RopeScaling {
    /// Only `"llama3"` changes the frequencies.
    #[serde(default)]
    pub rope_type: Option<String>,
    /// Pre-4.45 `transformers` name of `rope_type`; re-saved configs carry both.
    #[serde(default, rename = "type")]
    pub legacy_type: Option<String>,
    pub factor: f64,
    #[serde(default = "default_low_freq_factor")]
    pub low_freq_factor: f64,
    #[serde(default = "default_high_freq_factor")]
    pub high_freq_factor: f64,
    #[serde(default = "default_original_max_position_embeddings")]
    pub original_max_position_embeddings: usize,
}

/// Llama-family model configuration from HuggingFace config.json.
#[derive(Debug, Clone, Deserialize)]
pub struct LlamaConfig {
    /// Declared model classes.
    #[serde(default)]
    pub architectures: Vec<String>,
    /// Vocabulary size.
    pub vocab_size: usize,
    /// Hidden dimension.
    pub hidden_size: usize,
    /// Intermediate dimension (MLP).
    pub intermediate_size: usize,
    /// Number of transformer layers.
    pub num_hidden_layers: usize,
    /// Number of attention heads.
    pub num_attention_heads: usize,
    /// Number of key-value heads (for GQA).
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    /// Dimension per attention head, when not `hidden_size / num_attention_heads`.
    #[serde(default)]
    pub head_dim: Option<usize>,
    /// RMSNorm epsilon.
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    /// RoPE theta.
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    /// RoPE frequency scaling.
    #[serde(default)]
    pub rope_scaling: Option<RopeScaling>,
    /// Maximum sequence length the weights were trained for.
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    /// Whether lm_head shares the embedding matrix.
    #[serde(default)]
    pub tie_word_embeddings: bool,
    /// End-of-sequence token(s).
    #[serde(default)]
    pub eos_token_id: Option<TokenIds>,
    /// Custom code mapping; present only for models that ship their own classes.
    #[serde(default)]
    pub auto_map: Option<serde_json::Value>,
}

impl RopeScaling {
    /// Scaling kind, preferring `rope_type` over the legacy `type` key.
    pub fn kind(&self) -> &str {
        self.rope_type
            .as_deref()
            .or(self.legacy_type.as_deref())
            .unwrap_or("default")
    }
}

fn default_rms_norm_eps() -> f64 {
    1e-5
}

fn default_rope_theta() -> f64 {
    10000.0
}

fn default_max_position_embeddings() -> usize {
    2048
}

fn default_low_freq_factor() -> f64 {
    1.0
}

fn default_high_freq_factor() -> f64 {
    4.0
}

fn default_original_max_position_embeddings() -> usize {
    8192
}

impl LlamaConfig {
    pub fn num_key_value_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
            .unwrap_or(self.hidden_size / self.num_attention_heads)
    }

    /// EOS ids declared in config.json.
    pub fn eos_token_ids(&self) -> Vec<u32> {
        self.eos_token_id
            .clone()
            .map(TokenIds::into_vec)
            .unwrap_or_default()
    }

    /// Whether the model needs code outside this crate's implementations.
    pub fn requires_remote_code(&self) -> bool {
        self.auto_map.is_some()
    }

    /// Applies the `trust_remote_code` gate and the architecture check.
    pub fn check_loadable(&self, model: &str, trust_remote_code: bool) -> Result<()> {
        if self.requires_remote_code() && !trust_remote_code {
            return Err(Error::UntrustedRemoteCode(model.to_string()));
        }
        if let Some(arch) = self
            .architectures
            .iter()
            .find(|a| !SUPPORTED_ARCHITECTURES.contains(&a.as_str()))
        {
            return Err(Error::UnsupportedArchitecture(arch.clone()));
        }
        Ok(())
    }

    /// Checks that every sharded dimension splits evenly.
    pub fn check_shardable(&self, world_size: usize) -> Result<()> {
        let dims = [
            ("num_attention_heads", self.num_attention_heads),
            ("num_key_value_heads", self.num_key_value_heads()),
            ("intermediate_size", self.intermediate_size),
        ];
        for (name, value) in dims {
            if value % world_size != 0 {
                return Err(Error::Sharding(format!(
                    "{name} ({value}) is not divisible by tensor_parallel_size ({world_size})"
                )));
            }
        }
        Ok(())
    }
}

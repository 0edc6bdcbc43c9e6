//! Configuration types for shardgen.

use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Model loaded by the demo.
pub const DEFAULT_MODEL_ID: &str = "meta-llama/Meta-Llama-3.1-8B-Instruct";
/// Number of shards the model is split into.
pub const DEFAULT_TENSOR_PARALLEL_SIZE: usize = 4;
/// Context limit (prompt + generated tokens).
pub const DEFAULT_MAX_MODEL_LEN: usize = 8192;
pub const DEFAULT_TEMPERATURE: f32 = 0.6;
pub const DEFAULT_TOP_P: f32 = 0.9;
pub const DEFAULT_MAX_TOKENS: usize = 512;

/// Where shards are placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// CUDA when compiled in and available, CPU otherwise.
    #[default]
    Auto,
    /// Every shard on the host.
    Cpu,
    /// Shard `rank` on CUDA ordinal `rank`.
    Cuda,
}

impl DeviceKind {
    /// Resolves `Auto` against what this build can actually use.
    pub fn resolve(self) -> Self {
        match self {
            Self::Auto if candle_core::utils::cuda_is_available() => Self::Cuda,
            Self::Auto => Self::Cpu,
            other => other,
        }
    }
}

/// Weight and activation precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ModelDType {
    /// bf16 on CUDA, f32 on CPU.
    #[default]
    Auto,
    F32,
    F16,
    Bf16,
}

impl ModelDType {
    /// Concrete dtype for the given primary device.
    pub fn to_dtype(self, device: &Device) -> DType {
        match self {
            Self::Auto if device.is_cuda() => DType::BF16,
            Self::Auto => DType::F32,
            Self::F32 => DType::F32,
            Self::F16 => DType::F16,
            Self::Bf16 => DType::BF16,
        }
    }
}

/// Engine configuration handed to [`crate::Llm::new`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmConfig {
    /// HuggingFace model ID or path to a local model directory.
    pub model: String,
    /// Allow models whose config declares custom code.
    pub trust_remote_code: bool,
    /// Number of shards (one device per shard).
    pub tensor_parallel_size: usize,
    /// Maximum sequence length (prompt + output).
    pub max_model_len: usize,
    /// Git revision on the hub.
    pub revision: String,
    /// Device placement.
    pub device: DeviceKind,
    /// Precision.
    pub dtype: ModelDType,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL_ID.to_string(),
            trust_remote_code: true,
            tensor_parallel_size: DEFAULT_TENSOR_PARALLEL_SIZE,
            max_model_len: DEFAULT_MAX_MODEL_LEN,
            revision: "main".to_string(),
            device: DeviceKind::Auto,
            dtype: ModelDType::Auto,
        }
    }
}

impl LlmConfig {
    /// Checks the invariants the engine relies on.
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(Error::Config("model must not be empty".into()));
        }
        if self.tensor_parallel_size == 0 {
            return Err(Error::Config(
                "tensor_parallel_size must be at least 1".into(),
            ));
        }
        if self.max_model_len == 0 {
            return Err(Error::Config("max_model_len must be positive".into()));
        }
        Ok(())
    }
}

/// Sampling parameters for a generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Temperature for sampling (0 = greedy).
    pub temperature: f32,
    /// Top-p (nucleus) sampling (1.0 = disabled).
    pub top_p: f32,
    /// Top-k sampling (0 = disabled).
    pub top_k: usize,
    /// Maximum tokens to generate per prompt.
    pub max_tokens: usize,
    /// Base seed; request `i` samples with `seed + i`.
    pub seed: Option<u64>,
    /// Keep generating past EOS until another limit is hit.
    pub ignore_eos: bool,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: DEFAULT_TEMPERATURE,
            top_p: DEFAULT_TOP_P,
            top_k: 0,
            max_tokens: DEFAULT_MAX_TOKENS,
            seed: None,
            ignore_eos: false,
        }
    }
}

impl SamplingParams {
    /// Greedy decoding with the given token budget.
    pub fn greedy(max_tokens: usize) -> Self {
        Self {
            temperature: 0.0,
            top_p: 1.0,
            max_tokens,
            ..Self::default()
        }
    }

    /// Per-field range checks.
    pub fn validate(&self) -> Result<()> {
        if !(self.temperature >= 0.0) {
            return Err(Error::Config(format!(
                "temperature must be non-negative, got {}",
                self.temperature
            )));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(Error::Config(format!(
                "top_p must be in (0, 1], got {}",
                self.top_p
            )));
        }
        if self.max_tokens == 0 {
            return Err(Error::Config("max_tokens must be at least 1".into()));
        }
        Ok(())
    }
}

//! shardgen: tensor-parallel batch generation on candle.
//!
//! A small driver loads a Llama-family model, splits it across several
//! devices and runs a batch of prompts through it:
//! - [`driver`] sequences configure → initialize → generate → print
//! - [`engine`] holds the [`InferenceEngine`] seam and the [`Llm`] engine
//! - [`model`] loads and runs the sharded Llama decoder
//! - [`parallel`] places shards on devices and reduces their partial results

pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod logging;
pub mod model;
pub mod parallel;

pub use config::{DeviceKind, LlmConfig, ModelDType, SamplingParams};
pub use driver::{run, DemoPlan, DemoSummary, DEFAULT_PROMPTS};
pub use engine::{
    CompletionOutput, FinishReason, InferenceEngine, Llm, RequestOutput, Sampler,
};
pub use error::{Error, Result};
pub use model::{Llama, LlamaConfig};
pub use parallel::{ShardConfig, ShardStrategy, TensorParallelGroup};

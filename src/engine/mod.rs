//! Inference engine.
//!
//! This module contains:
//! - The [`InferenceEngine`] seam the driver talks to
//! - Result records returned by batch generation
//! - [`Llm`], the tensor-parallel engine
//! - Sampler and per-request sequence state

pub mod llm;
pub mod sampler;
pub mod sequence;

use serde::Serialize;

use crate::config::SamplingParams;
use crate::error::Result;

pub use llm::{resolve_eos_token_ids, Llm};
pub use sampler::Sampler;
pub use sequence::{FinishReason, RequestId, Sequence};

/// One generated completion of a prompt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionOutput {
    /// Position among the prompt's completions.
    pub index: usize,
    /// Decoded text, special tokens skipped.
    pub text: String,
    /// Generated token IDs.
    pub token_ids: Vec<u32>,
    pub finish_reason: Option<FinishReason>,
}

/// Result for one prompt of a batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestOutput {
    pub request_id: RequestId,
    /// Input prompt text.
    pub prompt: String,
    pub prompt_token_ids: Vec<u32>,
    /// At least one completion.
    pub outputs: Vec<CompletionOutput>,
}

impl RequestOutput {
    /// Text of the first completion.
    pub fn text(&self) -> &str {
        self.outputs.first().map_or("", |o| o.text.as_str())
    }
}

/// Batch text generation.
///
/// Implementations return exactly one [`RequestOutput`] per prompt, in
/// prompt order.
pub trait InferenceEngine {
    fn generate(
        &mut self,
        prompts: &[String],
        params: &SamplingParams,
    ) -> Result<Vec<RequestOutput>>;
}

//! Per-request generation state.

use serde::Serialize;

use super::sampler::Sampler;
use crate::model::KvCache;

/// Identifier of a request within one `generate` call (its prompt index).
pub type RequestId = usize;

/// Reason a sequence stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// An end-of-sequence token was generated.
    EndOfSequence,
    /// `max_tokens` output tokens were generated.
    MaxTokens,
    /// The sequence reached `max_model_len`.
    MaxModelLen,
}

impl FinishReason {
    /// OpenAI-style name: `"stop"` or `"length"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EndOfSequence => "stop",
            Self::MaxTokens | Self::MaxModelLen => "length",
        }
    }
}

/// A request being decoded.
#[derive(Debug)]
pub struct Sequence {
    pub id: RequestId,
    pub prompt: String,
    prompt_tokens: Vec<u32>,
    output_tokens: Vec<u32>,
    /// Tokens whose keys/values are already in `cache`.
    num_computed: usize,
    pub cache: KvCache,
    pub sampler: Sampler,
    finish_reason: Option<FinishReason>,
}

impl Sequence {
    pub fn new(
        id: RequestId,
        prompt: String,
        prompt_tokens: Vec<u32>,
        cache: KvCache,
        sampler: Sampler,
    ) -> Self {
        Self {
            id,
            prompt,
            prompt_tokens,
            output_tokens: Vec::new(),
            num_computed: 0,
            cache,
            sampler,
            finish_reason: None,
        }
    }

    pub fn prompt_tokens(&self) -> &[u32] {
        &self.prompt_tokens
    }

    pub fn output_tokens(&self) -> &[u32] {
        &self.output_tokens
    }

    pub fn output_len(&self) -> usize {
        self.output_tokens.len()
    }

    pub fn total_len(&self) -> usize {
        self.prompt_tokens.len() + self.output_tokens.len()
    }

    /// Tokens to feed next and the position of the first one.
    ///
    /// The first step prefills the whole prompt; later steps feed only the
    /// last sampled token.
    pub fn next_input(&self) -> (Vec<u32>, usize) {
        let start = self.num_computed;
        let pending = self
            .prompt_tokens
            .iter()
            .chain(&self.output_tokens)
            .skip(start)
            .copied()
            .collect();
        (pending, start)
    }

    /// Records a forward pass over `n` tokens and the token sampled after it.
    pub fn advance(&mut self, n: usize, token: u32) {
        self.num_computed += n;
        self.output_tokens.push(token);
    }

    pub fn finish(&mut self, reason: FinishReason) {
        self.finish_reason = Some(reason);
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    pub fn is_finished(&self) -> bool {
        self.finish_reason.is_some()
    }
}

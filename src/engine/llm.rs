//! Tensor-parallel LLM engine.
//!
//! `Llm` owns a sharded [`Llama`], its tokenizer and the EOS set, and turns a
//! batch of prompts into [`RequestOutput`]s.
//!
//! ## Engine Flow
//!
//! ```text
//!  Llm::new(config)
//!      │ resolve files ─ trust gate ─ shard check ─ open devices ─ load shards
//!      ▼
//!  generate(prompts, params)
//!      │ tokenize every prompt into a Sequence
//!      ▼
//!  ┌──────────────── while any sequence is unfinished ────────────────┐
//!  │  for each unfinished sequence (prompt order):                     │
//!  │     forward(pending tokens) ─ sample ─ append ─ check completion  │
//!  └───────────────────────────────────────────────────────────────────┘
//!      │
//!      ▼ decode outputs (prompt order)
//! ```

use std::path::Path;
use std::time::Instant;

use candle_core::{Device, Tensor};
use tokenizers::Tokenizer;

use super::sampler::Sampler;
use super::sequence::{FinishReason, RequestId, Sequence};
use super::{CompletionOutput, InferenceEngine, RequestOutput};
use crate::config::{LlmConfig, SamplingParams};
use crate::error::{Error, Result};
use crate::model::{
    load_config, load_generation_eos, load_safetensors, resolve_model_files, Llama,
};
use crate::parallel::TensorParallelGroup;

/// Tokens tried when neither config declares an EOS id.
const FALLBACK_EOS_TOKENS: &[&str] = &["<|eot_id|>", "<|end_of_text|>", "</s>"];

/// LLM inference engine over a tensor-parallel model.
pub struct Llm {
    model: Llama,
    tokenizer: Tokenizer,
    eos_token_ids: Vec<u32>,
}

impl Llm {
    /// Loads the model described by `config` and shards it across
    /// `config.tensor_parallel_size` devices.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        config.validate()?;

        tracing::info!(model = %config.model, revision = %config.revision, "resolving model files");
        let files = resolve_model_files(&config.model, &config.revision)?;

        let model_config = load_config(&files.config)?;
        model_config.check_loadable(&config.model, config.trust_remote_code)?;
        model_config.check_shardable(config.tensor_parallel_size)?;

        let group = TensorParallelGroup::new(config.tensor_parallel_size, config.device)?;
        let dtype = config.dtype.to_dtype(group.primary());
        tracing::info!(
            tensor_parallel_size = group.world_size(),
            primary = ?group.primary().location(),
            ?dtype,
            layers = model_config.num_hidden_layers,
            weight_files = files.weights.len(),
            "loading model shards"
        );

        let started = Instant::now();
        let vb = load_safetensors(&files.weights, dtype, &Device::Cpu)?;
        let model = Llama::load(&model_config, vb, group, config.max_model_len)?;
        tracing::info!(elapsed_secs = started.elapsed().as_secs_f64(), "model shards loaded");

        let tokenizer = Tokenizer::from_file(&files.tokenizer)
            .map_err(|e| Error::Tokenization(format!("failed to load tokenizer: {e}")))?;

        let eos_token_ids = resolve_eos_token_ids(
            model_config.eos_token_ids(),
            files.generation_config.as_deref(),
            &tokenizer,
        );
        tracing::debug!(?eos_token_ids, "end-of-sequence tokens");

        Ok(Self::from_parts(model, tokenizer, eos_token_ids))
    }

    /// Assembles an engine from an already-built model and tokenizer.
    pub fn from_parts(model: Llama, tokenizer: Tokenizer, eos_token_ids: Vec<u32>) -> Self {
        Self {
            model,
            tokenizer,
            eos_token_ids,
        }
    }

    /// Tokenizes a prompt into a fresh sequence.
    fn add_request(
        &self,
        id: RequestId,
        prompt: &str,
        params: &SamplingParams,
    ) -> Result<Sequence> {
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| Error::Tokenization(e.to_string()))?;
        let prompt_tokens = encoding.get_ids().to_vec();

        if prompt_tokens.is_empty() {
            return Err(Error::Tokenization(format!("prompt {id} encodes to no tokens")));
        }
        let max_model_len = self.max_model_len();
        if prompt_tokens.len() >= max_model_len {
            return Err(Error::PromptTooLong {
                len: prompt_tokens.len(),
                max_model_len,
            });
        }

        Ok(Sequence::new(
            id,
            prompt.to_string(),
            prompt_tokens,
            self.model.new_cache(),
            Sampler::for_request(params, id),
        ))
    }

    /// Runs one forward pass for `seq` and appends the sampled token.
    fn step(&self, seq: &mut Sequence, params: &SamplingParams) -> Result<()> {
        let (tokens, start_pos) = seq.next_input();
        let input_ids = Tensor::new(tokens.as_slice(), self.model.group().primary())?.unsqueeze(0)?;
        let logits = self.model.forward(&input_ids, start_pos, &mut seq.cache)?;

        let token = seq.sampler.sample(&logits)?[0];
        seq.advance(tokens.len(), token);
        tracing::trace!(request = seq.id, token, position = start_pos + tokens.len(), "sampled");

        if !params.ignore_eos && self.eos_token_ids.contains(&token) {
            seq.finish(FinishReason::EndOfSequence);
        } else if seq.output_len() >= params.max_tokens {
            seq.finish(FinishReason::MaxTokens);
        } else if seq.total_len() >= self.max_model_len() {
            seq.finish(FinishReason::MaxModelLen);
        }
        Ok(())
    }

    /// Builds the result record for a finished sequence.
    fn create_output(&self, seq: Sequence) -> Result<RequestOutput> {
        let text = self
            .tokenizer
            .decode(seq.output_tokens(), true)
            .map_err(|e| Error::Tokenization(e.to_string()))?;

        Ok(RequestOutput {
            request_id: seq.id,
            prompt_token_ids: seq.prompt_tokens().to_vec(),
            outputs: vec![CompletionOutput {
                index: 0,
                text,
                token_ids: seq.output_tokens().to_vec(),
                finish_reason: seq.finish_reason(),
            }],
            prompt: seq.prompt,
        })
    }

    /// Longest sequence (prompt + output) the engine accepts.
    pub fn max_model_len(&self) -> usize {
        self.model.max_seq_len()
    }

    pub fn tensor_parallel_size(&self) -> usize {
        self.model.group().world_size()
    }

    pub fn eos_token_ids(&self) -> &[u32] {
        &self.eos_token_ids
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn model(&self) -> &Llama {
        &self.model
    }
}

/// Merges the EOS ids of config.json and generation_config.json.
///
/// An unreadable generation config is skipped with a warning. When neither
/// file names an id, the tokenizer is searched for well-known end tokens.
/// The result is sorted and deduplicated.
pub fn resolve_eos_token_ids(
    config_ids: Vec<u32>,
    generation_config: Option<&Path>,
    tokenizer: &Tokenizer,
) -> Vec<u32> {
    let mut eos_token_ids = config_ids;
    if let Some(path) = generation_config {
        match load_generation_eos(path) {
            Ok(ids) => eos_token_ids.extend(ids),
            Err(e) => tracing::warn!(error = %e, "ignoring unreadable generation_config.json"),
        }
    }
    if eos_token_ids.is_empty() {
        eos_token_ids.extend(
            FALLBACK_EOS_TOKENS
                .iter()
                .filter_map(|t| tokenizer.token_to_id(t)),
        );
    }
    eos_token_ids.sort_unstable();
    eos_token_ids.dedup();
    eos_token_ids
}

impl InferenceEngine for Llm {
    fn generate(
        &mut self,
        prompts: &[String],
        params: &SamplingParams,
    ) -> Result<Vec<RequestOutput>> {
        params.validate()?;

        let mut sequences = prompts
            .iter()
            .enumerate()
            .map(|(id, prompt)| self.add_request(id, prompt, params))
            .collect::<Result<Vec<_>>>()?;

        let started = Instant::now();
        let mut steps = 0usize;
        while sequences.iter().any(|s| !s.is_finished()) {
            for seq in sequences.iter_mut().filter(|s| !s.is_finished()) {
                self.step(seq, params)?;
            }
            steps += 1;
        }

        let generated: usize = sequences.iter().map(Sequence::output_len).sum();
        let elapsed = started.elapsed().as_secs_f64();
        tracing::info!(
            requests = sequences.len(),
            steps,
            generated_tokens = generated,
            tokens_per_sec = if elapsed > 0.0 { generated as f64 / elapsed } else { 0.0 },
            "batch finished"
        );

        sequences
            .into_iter()
            .map(|seq| self.create_output(seq))
            .collect()
    }
}

//! Token sampling strategies.
//!
//! ```text
//! Logits [vocab_size]
//!     │
//!     ▼ Temperature scaling (0 = greedy argmax)
//!     ▼ Top-k filtering (optional)
//!     ▼ Softmax
//!     ▼ Top-p filtering (optional)
//!     ▼ Renormalize + sample
//! Selected token
//! ```

use candle_core::{DType, IndexOp, Result, Tensor};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::SamplingParams;

/// Token sampler with configurable sampling strategies.
#[derive(Debug, Clone)]
pub struct Sampler {
    temperature: f32,
    /// 0 = disabled.
    top_k: usize,
    /// 1.0 = disabled.
    top_p: f32,
    rng: StdRng,
}

impl Sampler {
    /// Creates a sampler seeded from OS entropy.
    pub fn new(params: &SamplingParams) -> Self {
        Self::with_rng(params, StdRng::from_entropy())
    }

    /// Creates a sampler with a fixed seed for reproducibility.
    pub fn with_seed(params: &SamplingParams, seed: u64) -> Self {
        Self::with_rng(params, StdRng::seed_from_u64(seed))
    }

    /// Sampler for the `index`-th request of a batch: seeded with
    /// `seed + index` when the params carry a seed.
    pub fn for_request(params: &SamplingParams, index: usize) -> Self {
        match params.seed {
            Some(seed) => Self::with_seed(params, seed.wrapping_add(index as u64)),
            None => Self::new(params),
        }
    }

    fn with_rng(params: &SamplingParams, rng: StdRng) -> Self {
        Self {
            temperature: params.temperature,
            top_k: params.top_k,
            top_p: params.top_p,
            rng,
        }
    }

    /// Samples one token per row of `logits` (`[vocab]` or `[batch, vocab]`).
    pub fn sample(&mut self, logits: &Tensor) -> Result<Vec<u32>> {
        let logits = logits.to_dtype(DType::F32)?;
        match logits.rank() {
            1 => Ok(vec![self.sample_single(logits.to_vec1()?)?]),
            2 => (0..logits.dim(0)?)
                .map(|i| self.sample_single(logits.i(i)?.to_vec1()?))
                .collect(),
            n => candle_core::bail!("expected 1D or 2D logits, got {n}D"),
        }
    }

    fn sample_single(&mut self, logits: Vec<f32>) -> Result<u32> {
        if logits.is_empty() {
            candle_core::bail!("cannot sample from empty logits");
        }
        if self.temperature == 0.0 {
            return Ok(argmax(&logits));
        }

        // (token, logit) sorted by logit, highest first
        let mut candidates: Vec<(u32, f32)> = logits
            .into_iter()
            .enumerate()
            .map(|(i, l)| (i as u32, l / self.temperature))
            .collect();
        candidates.sort_by(|a, b| b.1.total_cmp(&a.1));

        if self.top_k > 0 {
            candidates.truncate(self.top_k);
        }

        // softmax over the survivors
        let max = candidates[0].1;
        let mut probs: Vec<f32> = candidates.iter().map(|(_, l)| (l - max).exp()).collect();
        let sum: f32 = probs.iter().sum();
        probs.iter_mut().for_each(|p| *p /= sum);

        if self.top_p < 1.0 {
            let cutoff = nucleus_cutoff(&probs, self.top_p);
            probs.truncate(cutoff);
            candidates.truncate(cutoff);
        }

        let dist = WeightedIndex::new(&probs)
            .map_err(|e| candle_core::Error::Msg(format!("failed to build distribution: {e}")))?;
        Ok(candidates[dist.sample(&mut self.rng)].0)
    }
}

/// Index of the largest logit; the first one wins ties.
fn argmax(logits: &[f32]) -> u32 {
    let mut best = 0;
    for (i, &l) in logits.iter().enumerate() {
        if l > logits[best] {
            best = i;
        }
    }
    best as u32
}

/// Number of leading (descending) probabilities needed to exceed `p`.
/// Always keeps at least one token.
fn nucleus_cutoff(sorted_probs: &[f32], p: f32) -> usize {
    let mut cumulative = 0.0;
    for (i, prob) in sorted_probs.iter().enumerate() {
        cumulative += prob;
        if cumulative >= p {
            return i + 1;
        }
    }
    sorted_probs.len()
}

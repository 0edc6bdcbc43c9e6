//! Rotary Position Embeddings (RoPE).
//!
//! Llama 3.x stretches the low frequencies ("llama3" scaling) so that a
//! model trained on 8k positions extrapolates to longer contexts. The
//! rotation itself is the usual half-split form used by HF checkpoints.

use std::f64::consts::PI;

use candle_core::{DType, Device, Result, Tensor};

use super::loader::RopeScaling;

/// Inverse frequencies `1 / theta^(2i/dim)`, with llama3 scaling applied
/// when configured.
pub fn inverse_frequencies(dim: usize, theta: f64, scaling: Option<&RopeScaling>) -> Vec<f32> {
    let base = (0..dim / 2).map(|i| 1.0 / theta.powf(2.0 * i as f64 / dim as f64));

    let Some(s) = scaling.filter(|s| s.kind() == "llama3") else {
        return base.map(|f| f as f32).collect();
    };

    let original = s.original_max_position_embeddings as f64;
    let low_freq_wavelen = original / s.low_freq_factor;
    let high_freq_wavelen = original / s.high_freq_factor;

    base.map(|freq| {
        let wavelen = 2.0 * PI / freq;
        let scaled = if wavelen < high_freq_wavelen {
            freq
        } else if wavelen > low_freq_wavelen {
            freq / s.factor
        } else {
            let smooth = (original / wavelen - s.low_freq_factor)
                / (s.high_freq_factor - s.low_freq_factor);
            (1.0 - smooth) * freq / s.factor + smooth * freq
        };
        scaled as f32
    })
    .collect()
}

/// Rotary Position Embedding with precomputed cos/sin tables.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    /// [max_seq_len, head_dim]
    cos_cache: Tensor,
    /// [max_seq_len, head_dim]
    sin_cache: Tensor,
    max_seq_len: usize,
}

impl RotaryEmbedding {
    /// Builds cos/sin tables for positions `0..max_seq_len`.
    pub fn new(
        dim: usize,
        max_seq_len: usize,
        theta: f64,
        scaling: Option<&RopeScaling>,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        if dim % 2 != 0 {
            candle_core::bail!("RoPE dimension must be even, got {dim}");
        }

        let inv_freq = inverse_frequencies(dim, theta, scaling);
        let inv_freq = Tensor::new(inv_freq.as_slice(), device)?;

        let positions: Vec<f32> = (0..max_seq_len).map(|p| p as f32).collect();
        let positions = Tensor::new(positions.as_slice(), device)?.reshape((max_seq_len, 1))?;

        // [max_seq_len, dim/2] duplicated to [max_seq_len, dim]
        let freqs = positions.broadcast_mul(&inv_freq.unsqueeze(0)?)?;
        let freqs = Tensor::cat(&[&freqs, &freqs], 1)?;

        Ok(Self {
            cos_cache: freqs.cos()?.to_dtype(dtype)?,
            sin_cache: freqs.sin()?.to_dtype(dtype)?,
            max_seq_len,
        })
    }

    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    /// Rotates q `[batch, seq, heads, dim]` and k `[batch, seq, kv_heads, dim]`
    /// for positions starting at `start_pos`.
    pub fn apply(&self, q: &Tensor, k: &Tensor, start_pos: usize) -> Result<(Tensor, Tensor)> {
        let (_, seq_len, _, _) = q.dims4()?;
        if start_pos + seq_len > self.max_seq_len {
            candle_core::bail!(
                "position {} exceeds RoPE table of {}",
                start_pos + seq_len,
                self.max_seq_len
            );
        }

        // [1, seq_len, 1, dim]
        let cos = self
            .cos_cache
            .narrow(0, start_pos, seq_len)?
            .unsqueeze(0)?
            .unsqueeze(2)?;
        let sin = self
            .sin_cache
            .narrow(0, start_pos, seq_len)?
            .unsqueeze(0)?
            .unsqueeze(2)?;

        Ok((rotate(q, &cos, &sin)?, rotate(k, &cos, &sin)?))
    }
}

/// `x * cos + rotate_half(x) * sin`
fn rotate(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
    let last = x.rank() - 1;
    let half = x.dim(last)? / 2;
    let x1 = x.narrow(last, 0, half)?;
    let x2 = x.narrow(last, half, half)?;
    let rotated = Tensor::cat(&[&x2.neg()?, &x1], last)?;
    x.broadcast_mul(cos)? + rotated.broadcast_mul(sin)?
}

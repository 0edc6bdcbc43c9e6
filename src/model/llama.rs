//! Llama decoder split across a tensor-parallel group.
//!
//! ## Layout
//!
//! ```text
//!                 primary device                 rank r (one per shard)
//! ┌──────────────────────────────┐      ┌──────────────────────────────────┐
//! │ embed_tokens                 │      │                                  │
//! │ input_layernorm ─────────────┼─────►│ q/k/v (column) ─ attn ─ o (row)  │
//! │   + all_reduce(partials) ◄───┼──────│                                  │
//! │ post_attention_layernorm ────┼─────►│ gate/up (column) ─ down (row)    │
//! │   + all_reduce(partials) ◄───┼──────│                                  │
//! │ norm ─ lm_head               │      │ KV cache for its local heads     │
//! └──────────────────────────────┘      └──────────────────────────────────┘
//! ```
//!
//! Every rank holds `num_heads / N` query heads, `num_kv_heads / N` KV heads
//! and `intermediate_size / N` MLP columns. Row-sharded projections produce
//! partial sums that add up to the unsharded result.

use std::collections::HashMap;

use candle_core::{DType, Device, Module, Shape, Tensor};
use candle_nn::{Embedding, Linear, RmsNorm, VarBuilder};

use super::loader::LlamaConfig;
use super::rope::RotaryEmbedding;
use crate::error::{Error, Result};
use crate::parallel::{shard_strategy_for_weight, TensorParallelGroup};

/// Per-sequence KV cache, indexed `[rank][layer]`.
#[derive(Debug, Clone)]
pub struct KvCache {
    ranks: Vec<Vec<Option<(Tensor, Tensor)>>>,
}

impl KvCache {
    pub fn new(world_size: usize, num_layers: usize) -> Self {
        Self {
            ranks: vec![vec![None; num_layers]; world_size],
        }
    }

    /// Number of cached positions.
    pub fn len(&self) -> usize {
        self.ranks
            .first()
            .and_then(|layers| layers.first())
            .and_then(|kv| kv.as_ref())
            .and_then(|(k, _)| k.dim(1).ok())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn num_layers(&self) -> usize {
        self.ranks.first().map_or(0, Vec::len)
    }
}

/// One rank's slice of a self-attention block.
#[derive(Debug, Clone)]
struct AttentionShard {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    rotary_emb: RotaryEmbedding,
    /// Local query heads.
    num_heads: usize,
    /// Local KV heads.
    num_kv_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl AttentionShard {
    /// Partial attention output `[batch, seq_len, hidden_size]`.
    fn forward(
        &self,
        x: &Tensor,
        start_pos: usize,
        cache: &mut Option<(Tensor, Tensor)>,
    ) -> candle_core::Result<Tensor> {
        let (batch, seq_len, _) = x.dims3()?;

        let q = self
            .q_proj
            .forward(x)?
            .reshape((batch, seq_len, self.num_heads, self.head_dim))?;
        let k = self
            .k_proj
            .forward(x)?
            .reshape((batch, seq_len, self.num_kv_heads, self.head_dim))?;
        let v = self
            .v_proj
            .forward(x)?
            .reshape((batch, seq_len, self.num_kv_heads, self.head_dim))?;

        let (q, k) = self.rotary_emb.apply(&q, &k, start_pos)?;

        let (k, v) = match cache.take() {
            Some((k_cache, v_cache)) => (
                Tensor::cat(&[&k_cache, &k], 1)?,
                Tensor::cat(&[&v_cache, &v], 1)?,
            ),
            None => (k, v),
        };
        *cache = Some((k.clone(), v.clone()));
        let kv_len = k.dim(1)?;

        let k = self.repeat_kv(&k)?;
        let v = self.repeat_kv(&v)?;

        // [batch, heads, seq, head_dim]
        let q = q.transpose(1, 2)?.contiguous()?;
        let k = k.transpose(1, 2)?.contiguous()?;
        let v = v.transpose(1, 2)?.contiguous()?;

        let scores = (q.matmul(&k.t()?)? * self.scale)?.to_dtype(DType::F32)?;
        let scores = if seq_len > 1 {
            let mask = causal_mask(seq_len, kv_len, start_pos, scores.device())?;
            scores.broadcast_add(&mask)?
        } else {
            scores
        };
        let probs = candle_nn::ops::softmax_last_dim(&scores)?.to_dtype(v.dtype())?;

        let out = probs
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((batch, seq_len, self.num_heads * self.head_dim))?;
        self.o_proj.forward(&out)
    }

    /// `[b, s, kv_heads, d]` -> `[b, s, heads, d]`
    fn repeat_kv(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let n_rep = self.num_heads / self.num_kv_heads;
        if n_rep == 1 {
            return Ok(x.clone());
        }
        let (batch, seq_len, num_kv_heads, head_dim) = x.dims4()?;
        x.unsqueeze(3)?
            .expand((batch, seq_len, num_kv_heads, n_rep, head_dim))?
            .reshape((batch, seq_len, self.num_heads, head_dim))
    }
}

/// `[seq_len, kv_len]` mask; query `i` sits at absolute position `start_pos + i`.
fn causal_mask(
    seq_len: usize,
    kv_len: usize,
    start_pos: usize,
    device: &Device,
) -> candle_core::Result<Tensor> {
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| {
            (0..kv_len).map(move |j| {
                if j > start_pos + i {
                    f32::NEG_INFINITY
                } else {
                    0.0
                }
            })
        })
        .collect();
    Tensor::from_vec(mask, (seq_len, kv_len), device)
}

/// One rank's slice of the SwiGLU MLP.
#[derive(Debug, Clone)]
struct MlpShard {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl MlpShard {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let gate = candle_nn::ops::silu(&self.gate_proj.forward(x)?)?;
        let up = self.up_proj.forward(x)?;
        self.down_proj.forward(&(gate * up)?)
    }
}

#[derive(Debug, Clone)]
struct LayerShard {
    self_attn: AttentionShard,
    mlp: MlpShard,
}

/// Norms of one decoder layer, replicated on the primary device.
#[derive(Debug, Clone)]
struct LayerNorms {
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

/// Llama model for causal language modeling, sharded across a group.
#[derive(Debug, Clone)]
pub struct Llama {
    config: LlamaConfig,
    group: TensorParallelGroup,
    embed_tokens: Embedding,
    layer_norms: Vec<LayerNorms>,
    /// `[rank][layer]`
    shards: Vec<Vec<LayerShard>>,
    norm: RmsNorm,
    lm_head: Linear,
    dtype: DType,
    max_seq_len: usize,
}

impl Llama {
    /// Loads the weights under `vb` and distributes them over `group`.
    ///
    /// `max_seq_len` bounds the RoPE tables and therefore the longest
    /// sequence the model will accept.
    pub fn load(
        config: &LlamaConfig,
        vb: VarBuilder,
        group: TensorParallelGroup,
        max_seq_len: usize,
    ) -> Result<Self> {
        let world_size = group.world_size();
        config.check_shardable(world_size)?;
        if max_seq_len > config.max_position_embeddings {
            return Err(Error::Config(format!(
                "max_model_len ({max_seq_len}) exceeds max_position_embeddings ({})",
                config.max_position_embeddings
            )));
        }

        let primary = group.primary().clone();
        let dtype = vb.dtype();
        let hidden = config.hidden_size;
        let head_dim = config.head_dim();
        let num_heads = config.num_attention_heads;
        let num_kv_heads = config.num_key_value_heads();
        let intermediate = config.intermediate_size;
        let eps = config.rms_norm_eps;

        let embed_weight = replicated(&vb, (config.vocab_size, hidden), "model.embed_tokens.weight", &primary)?;
        let embed_tokens = Embedding::new(embed_weight.clone(), hidden);

        let rotary_embs = (0..world_size)
            .map(|rank| {
                RotaryEmbedding::new(
                    head_dim,
                    max_seq_len,
                    config.rope_theta,
                    config.rope_scaling.as_ref(),
                    dtype,
                    group.device(rank),
                )
            })
            .collect::<candle_core::Result<Vec<_>>>()?;

        let mut layer_norms = Vec::with_capacity(config.num_hidden_layers);
        let mut shards: Vec<Vec<LayerShard>> = (0..world_size)
            .map(|_| Vec::with_capacity(config.num_hidden_layers))
            .collect();

        for i in 0..config.num_hidden_layers {
            let layer_vb = vb.pp(format!("model.layers.{i}"));
            let attn_vb = layer_vb.pp("self_attn");
            let mlp_vb = layer_vb.pp("mlp");

            layer_norms.push(LayerNorms {
                input_layernorm: RmsNorm::new(
                    replicated(&layer_vb, hidden, "input_layernorm.weight", &primary)?,
                    eps,
                ),
                post_attention_layernorm: RmsNorm::new(
                    replicated(&layer_vb, hidden, "post_attention_layernorm.weight", &primary)?,
                    eps,
                ),
            });

            let q = sharded_linear(&attn_vb, "q_proj", (num_heads * head_dim, hidden), &group)?;
            let k = sharded_linear(&attn_vb, "k_proj", (num_kv_heads * head_dim, hidden), &group)?;
            let v = sharded_linear(&attn_vb, "v_proj", (num_kv_heads * head_dim, hidden), &group)?;
            let o = sharded_linear(&attn_vb, "o_proj", (hidden, num_heads * head_dim), &group)?;
            let gate = sharded_linear(&mlp_vb, "gate_proj", (intermediate, hidden), &group)?;
            let up = sharded_linear(&mlp_vb, "up_proj", (intermediate, hidden), &group)?;
            let down = sharded_linear(&mlp_vb, "down_proj", (hidden, intermediate), &group)?;

            let parts = q.into_iter().zip(k).zip(v).zip(o).zip(gate).zip(up).zip(down);
            for (rank, ((((((q, k), v), o), gate), up), down)) in parts.enumerate() {
                shards[rank].push(LayerShard {
                    self_attn: AttentionShard {
                        q_proj: q,
                        k_proj: k,
                        v_proj: v,
                        o_proj: o,
                        rotary_emb: rotary_embs[rank].clone(),
                        num_heads: num_heads / world_size,
                        num_kv_heads: num_kv_heads / world_size,
                        head_dim,
                        scale: 1.0 / (head_dim as f64).sqrt(),
                    },
                    mlp: MlpShard {
                        gate_proj: gate,
                        up_proj: up,
                        down_proj: down,
                    },
                });
            }
            tracing::debug!(layer = i, world_size, "loaded decoder layer shards");
        }

        let norm = RmsNorm::new(replicated(&vb, hidden, "model.norm.weight", &primary)?, eps);
        let lm_head = if config.tie_word_embeddings {
            Linear::new(embed_weight, None)
        } else {
            Linear::new(
                replicated(&vb, (config.vocab_size, hidden), "lm_head.weight", &primary)?,
                None,
            )
        };

        Ok(Self {
            config: config.clone(),
            group,
            embed_tokens,
            layer_norms,
            shards,
            norm,
            lm_head,
            dtype,
            max_seq_len,
        })
    }

    /// Builds the model from in-memory tensors named like a HF checkpoint.
    pub fn from_tensors(
        config: &LlamaConfig,
        tensors: HashMap<String, Tensor>,
        dtype: DType,
        group: TensorParallelGroup,
        max_seq_len: usize,
    ) -> Result<Self> {
        let vb = VarBuilder::from_tensors(tensors, dtype, &Device::Cpu);
        Self::load(config, vb, group, max_seq_len)
    }

    /// An empty KV cache shaped for this model.
    pub fn new_cache(&self) -> KvCache {
        KvCache::new(self.group.world_size(), self.config.num_hidden_layers)
    }

    /// Runs `input_ids` `[batch, seq_len]` at positions starting from
    /// `start_pos` and returns last-position logits `[batch, vocab_size]`.
    pub fn forward(&self, input_ids: &Tensor, start_pos: usize, cache: &mut KvCache) -> Result<Tensor> {
        if cache.num_layers() != self.layer_norms.len() {
            return Err(Error::Config(format!(
                "KV cache has {} layers, model has {}",
                cache.num_layers(),
                self.layer_norms.len()
            )));
        }
        let (_, seq_len) = input_ids.dims2()?;
        if start_pos + seq_len > self.max_seq_len {
            return Err(Error::Config(format!(
                "positions up to {} exceed max_model_len {}",
                start_pos + seq_len,
                self.max_seq_len
            )));
        }

        let input_ids = input_ids.to_device(self.group.primary())?;
        let mut hidden = self.embed_tokens.forward(&input_ids)?;

        for (layer, norms) in self.layer_norms.iter().enumerate() {
            let inputs = self.group.broadcast(&norms.input_layernorm.forward(&hidden)?)?;
            let partials = self.group.run_mut(&mut cache.ranks, |rank, rank_cache| {
                Ok(self.shards[rank][layer].self_attn.forward(
                    &inputs[rank],
                    start_pos,
                    &mut rank_cache[layer],
                )?)
            })?;
            hidden = (hidden + self.group.all_reduce(partials)?)?;

            let inputs = self
                .group
                .broadcast(&norms.post_attention_layernorm.forward(&hidden)?)?;
            let partials = self
                .group
                .run(|rank| Ok(self.shards[rank][layer].mlp.forward(&inputs[rank])?))?;
            hidden = (hidden + self.group.all_reduce(partials)?)?;
        }

        let hidden = self.norm.forward(&hidden)?;
        let last = hidden.narrow(1, seq_len - 1, 1)?.squeeze(1)?;
        Ok(self.lm_head.forward(&last)?)
    }

    pub fn config(&self) -> &LlamaConfig {
        &self.config
    }

    pub fn group(&self) -> &TensorParallelGroup {
        &self.group
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    pub fn num_layers(&self) -> usize {
        self.layer_norms.len()
    }
}

/// Loads a full tensor onto the primary device.
fn replicated<S: Into<Shape>>(vb: &VarBuilder, shape: S, name: &str, primary: &Device) -> Result<Tensor> {
    Ok(vb.get(shape, name)?.to_device(primary)?)
}

/// Loads `{name}.weight` and slices it per rank by the weight's strategy.
fn sharded_linear(
    vb: &VarBuilder,
    name: &str,
    shape: (usize, usize),
    group: &TensorParallelGroup,
) -> Result<Vec<Linear>> {
    let weight_name = format!("{name}.weight");
    let weight = vb.get(shape, &weight_name)?;
    let strategy = shard_strategy_for_weight(&weight_name);
    Ok(group
        .split(&weight, strategy)?
        .into_iter()
        .map(|w| Linear::new(w, None))
        .collect())
}

/// Random weights for `config`, named like a HF checkpoint.
///
/// Norm weights are ones; projections are drawn from N(0, 0.02).
pub fn random_weights(config: &LlamaConfig, device: &Device) -> Result<HashMap<String, Tensor>> {
    let hidden = config.hidden_size;
    let q_dim = config.num_attention_heads * config.head_dim();
    let kv_dim = config.num_key_value_heads() * config.head_dim();
    let inter = config.intermediate_size;

    let randn = |shape: (usize, usize)| Tensor::randn(0f32, 0.02, shape, device);
    let ones = || Tensor::ones(hidden, DType::F32, device);

    let mut tensors = HashMap::new();
    tensors.insert(
        "model.embed_tokens.weight".to_string(),
        randn((config.vocab_size, hidden))?,
    );
    for i in 0..config.num_hidden_layers {
        let p = format!("model.layers.{i}");
        let entries = [
            ("input_layernorm.weight", ones()?),
            ("post_attention_layernorm.weight", ones()?),
            ("self_attn.q_proj.weight", randn((q_dim, hidden))?),
            ("self_attn.k_proj.weight", randn((kv_dim, hidden))?),
            ("self_attn.v_proj.weight", randn((kv_dim, hidden))?),
            ("self_attn.o_proj.weight", randn((hidden, q_dim))?),
            ("mlp.gate_proj.weight", randn((inter, hidden))?),
            ("mlp.up_proj.weight", randn((inter, hidden))?),
            ("mlp.down_proj.weight", randn((hidden, inter))?),
        ];
        for (name, tensor) in entries {
            tensors.insert(format!("{p}.{name}"), tensor);
        }
    }
    tensors.insert("model.norm.weight".to_string(), ones()?);
    if !config.tie_word_embeddings {
        tensors.insert(
            "lm_head.weight".to_string(),
            randn((config.vocab_size, hidden))?,
        );
    }
    Ok(tensors)
}

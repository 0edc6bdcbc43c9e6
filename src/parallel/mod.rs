//! Tensor parallelism.
//!
//! A model is split across `world_size` ranks, one device per rank:
//!
//! ```text
//!               primary device (rank 0)
//!   hidden ──broadcast──┬──────────┬──────────┐
//!                       ▼          ▼          ▼
//!                    rank 0     rank 1  … rank N-1     column shards (q/k/v, gate/up)
//!                       │          │          │        row shards (o, down)
//!                       └──────────┴────┬─────┘
//!                                       ▼
//!                             all_reduce (sum) ──► hidden
//! ```
//!
//! Each rank's partial output is summed on the primary device. Ranks run on
//! a thread pool owned by the group, so CUDA shards compute concurrently
//! without spawning threads on every layer.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use candle_core::{Device, Tensor};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::config::DeviceKind;
use crate::error::{Error, Result};

/// Position of one device in a tensor-parallel group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardConfig {
    /// This device's rank (`0..world_size`).
    pub rank: usize,
    /// Total number of ranks.
    pub world_size: usize,
}

impl ShardConfig {
    /// Returns `(start, shard_size)` covering this rank's slice of a
    /// dimension of size `dim`.
    pub fn shard_range(&self, dim: usize) -> Result<(usize, usize)> {
        if dim % self.world_size != 0 {
            return Err(Error::Sharding(format!(
                "dimension {dim} is not divisible by world_size {}",
                self.world_size
            )));
        }
        let shard_size = dim / self.world_size;
        Ok((self.rank * shard_size, shard_size))
    }
}

/// How a weight tensor is sliced across ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardStrategy {
    /// Full copy (norms, embeddings, lm_head).
    Replicate,
    /// Split along the output dimension (rows of `[out, in]`).
    Column,
    /// Split along the input dimension (columns of `[out, in]`); the
    /// partial products must be all-reduced.
    Row,
}

impl ShardStrategy {
    /// Tensor dimension that is split, if any.
    pub fn split_dim(self) -> Option<usize> {
        match self {
            Self::Replicate => None,
            Self::Column => Some(0),
            Self::Row => Some(1),
        }
    }
}

/// Picks the strategy for a Llama-style weight by name.
pub fn shard_strategy_for_weight(name: &str) -> ShardStrategy {
    const COLUMN: [&str; 5] = ["q_proj", "k_proj", "v_proj", "gate_proj", "up_proj"];
    const ROW: [&str; 2] = ["o_proj", "down_proj"];

    let Some(stem) = name.strip_suffix(".weight") else {
        return ShardStrategy::Replicate;
    };
    let last = stem.rsplit('.').next().unwrap_or(stem);
    if COLUMN.contains(&last) {
        ShardStrategy::Column
    } else if ROW.contains(&last) {
        ShardStrategy::Row
    } else {
        ShardStrategy::Replicate
    }
}

/// The devices of a tensor-parallel group and the workers that drive them.
#[derive(Debug, Clone)]
pub struct TensorParallelGroup {
    devices: Vec<Device>,
    /// One worker per rank, created once with the group.
    workers: Arc<ThreadPool>,
}

impl TensorParallelGroup {
    /// Opens one device per rank.
    ///
    /// With [`DeviceKind::Cuda`] rank `r` uses CUDA ordinal `r`; with
    /// [`DeviceKind::Cpu`] every rank shares the host.
    pub fn new(world_size: usize, kind: DeviceKind) -> Result<Self> {
        if world_size == 0 {
            return Err(Error::Config("tensor_parallel_size must be at least 1".into()));
        }
        let devices = match kind.resolve() {
            DeviceKind::Cuda => (0..world_size)
                .map(|rank| {
                    Device::new_cuda(rank).map_err(|e| {
                        Error::Device(format!(
                            "tensor_parallel_size={world_size} needs CUDA device {rank}: {e}"
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            _ => vec![Device::Cpu; world_size],
        };
        Self::from_devices(devices)
    }

    /// A group over explicit devices.
    pub fn from_devices(devices: Vec<Device>) -> Result<Self> {
        if devices.is_empty() {
            return Err(Error::Config("a group needs at least one device".into()));
        }
        let workers = ThreadPoolBuilder::new()
            .num_threads(devices.len())
            .thread_name(|rank| format!("shardgen-rank-{rank}"))
            .build()
            .map_err(|e| Error::Sharding(format!("failed to start rank workers: {e}")))?;
        Ok(Self {
            devices,
            workers: Arc::new(workers),
        })
    }

    /// `world_size` ranks that all live on the host.
    pub fn cpu(world_size: usize) -> Result<Self> {
        Self::new(world_size, DeviceKind::Cpu)
    }

    pub fn world_size(&self) -> usize {
        self.devices.len()
    }

    pub fn device(&self, rank: usize) -> &Device {
        &self.devices[rank]
    }

    /// Device holding replicated weights and the reduced activations.
    pub fn primary(&self) -> &Device {
        &self.devices[0]
    }

    pub fn shard_config(&self, rank: usize) -> ShardConfig {
        ShardConfig {
            rank,
            world_size: self.world_size(),
        }
    }

    /// Slices a full weight into per-rank shards, each moved to its device.
    pub fn split(&self, tensor: &Tensor, strategy: ShardStrategy) -> Result<Vec<Tensor>> {
        let Some(dim) = strategy.split_dim() else {
            return self.broadcast(tensor);
        };
        let size = tensor.dim(dim)?;
        (0..self.world_size())
            .map(|rank| {
                let (start, len) = self.shard_config(rank).shard_range(size)?;
                let shard = tensor
                    .narrow(dim, start, len)?
                    .contiguous()?
                    .to_device(self.device(rank))?;
                Ok(shard)
            })
            .collect()
    }

    /// Copies a tensor to every rank's device.
    pub fn broadcast(&self, tensor: &Tensor) -> Result<Vec<Tensor>> {
        self.devices
            .iter()
            .map(|device| Ok(tensor.to_device(device)?))
            .collect()
    }

    /// Sums per-rank partial results on the primary device.
    pub fn all_reduce(&self, partials: Vec<Tensor>) -> Result<Tensor> {
        let mut iter = partials.into_iter();
        let first = iter
            .next()
            .ok_or_else(|| Error::Sharding("all_reduce over zero partials".into()))?;
        let mut acc = first.to_device(self.primary())?;
        for partial in iter {
            acc = (acc + partial.to_device(self.primary())?)?;
        }
        Ok(acc)
    }

    /// Runs `f(rank, &mut states[rank])` for every rank and returns the
    /// results in rank order.
    ///
    /// A single-rank group runs inline; larger groups dispatch to the
    /// group's workers. A panicking rank is reported as [`Error::Sharding`].
    pub fn run_mut<S, T, F>(&self, states: &mut [S], f: F) -> Result<Vec<T>>
    where
        S: Send,
        T: Send,
        F: Fn(usize, &mut S) -> Result<T> + Sync,
    {
        if states.len() != self.world_size() {
            return Err(Error::Sharding(format!(
                "expected {} rank states, got {}",
                self.world_size(),
                states.len()
            )));
        }
        if self.world_size() == 1 {
            return Ok(vec![f(0, &mut states[0])?]);
        }

        let f = &f;
        self.workers
            .install(|| {
                panic::catch_unwind(AssertUnwindSafe(|| {
                    states
                        .par_iter_mut()
                        .enumerate()
                        .map(|(rank, state)| f(rank, state))
                        .collect::<Result<Vec<T>>>()
                }))
            })
            .map_err(|_| Error::Sharding("a rank worker panicked".into()))?
    }

    /// Stateless variant of [`Self::run_mut`].
    pub fn run<T, F>(&self, f: F) -> Result<Vec<T>>
    where
        T: Send,
        F: Fn(usize) -> Result<T> + Sync,
    {
        let mut ranks = vec![(); self.world_size()];
        self.run_mut(&mut ranks, |rank, _| f(rank))
    }
}

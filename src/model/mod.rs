//! Model implementations.
//!
//! This module contains:
//! - Model file resolution and config parsing
//! - Rotary embeddings with llama3 scaling
//! - A Llama decoder sharded across a tensor-parallel group

pub mod llama;
pub mod loader;
pub mod rope;

pub use llama::{random_weights, KvCache, Llama};
pub use loader::{
    download_model, load_config, load_generation_eos, load_safetensors, local_model_files,
    resolve_model_files, LlamaConfig, ModelFiles, RopeScaling, TokenIds,
};
pub use rope::RotaryEmbedding;

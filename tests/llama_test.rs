//! Integration tests for the sharded Llama decoder.

use std::collections::HashMap;

use candle_core::{DType, Device, Tensor};
use shardgen::model::random_weights;
use shardgen::{Error, Llama, LlamaConfig, TensorParallelGroup};

fn tiny_config() -> LlamaConfig {
    serde_json::from_value(serde_json::json!({
        "architectures": ["LlamaForCausalLM"],
        "vocab_size": 16,
        "hidden_size": 32,
        "intermediate_size": 64,
        "num_hidden_layers": 2,
        "num_attention_heads": 8,
        "num_key_value_heads": 4,
        "max_position_embeddings": 64,
        "rope_theta": 500000.0,
        "rope_scaling": {
            "rope_type": "llama3",
            "factor": 8.0,
            "original_max_position_embeddings": 16
        },
        "eos_token_id": 1
    }))
    .unwrap()
}

fn build(config: &LlamaConfig, world_size: usize, weights: &HashMap<String, Tensor>) -> Llama {
    let group = TensorParallelGroup::cpu(world_size).unwrap();
    Llama::from_tensors(config, weights.clone(), DType::F32, group, 32).unwrap()
}

fn input(tokens: &[u32]) -> Tensor {
    Tensor::new(tokens, &Device::Cpu).unwrap().unsqueeze(0).unwrap()
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .max_all()
        .unwrap()
        .to_scalar::<f32>()
        .unwrap()
}

#[test]
fn test_logits_shape() {
    let config = tiny_config();
    let weights = random_weights(&config, &Device::Cpu).unwrap();
    let model = build(&config, 1, &weights);

    let mut cache = model.new_cache();
    let logits = model.forward(&input(&[3, 5, 7]), 0, &mut cache).unwrap();

    assert_eq!(logits.dims(), &[1, 16]);
    assert_eq!(cache.len(), 3);
}

#[test]
fn test_sharded_matches_single_device() {
    let config = tiny_config();
    let weights = random_weights(&config, &Device::Cpu).unwrap();
    let tokens = [2u32, 9, 4, 11, 6];

    let single = build(&config, 1, &weights);
    let expected = single
        .forward(&input(&tokens), 0, &mut single.new_cache())
        .unwrap();

    for world_size in [2, 4] {
        let model = build(&config, world_size, &weights);
        assert_eq!(model.group().world_size(), world_size);
        let logits = model
            .forward(&input(&tokens), 0, &mut model.new_cache())
            .unwrap();
        let diff = max_abs_diff(&logits, &expected);
        assert!(diff < 1e-4, "world_size {world_size}: max diff {diff}");
    }
}

#[test]
fn test_incremental_decode_matches_full_forward() {
    let config = tiny_config();
    let weights = random_weights(&config, &Device::Cpu).unwrap();
    let model = build(&config, 2, &weights);

    let tokens = [4u32, 8, 15, 16, 2, 3];
    let full = model
        .forward(&input(&tokens), 0, &mut model.new_cache())
        .unwrap();

    let mut cache = model.new_cache();
    model.forward(&input(&tokens[..4]), 0, &mut cache).unwrap();
    model.forward(&input(&tokens[4..5]), 4, &mut cache).unwrap();
    let last = model.forward(&input(&tokens[5..]), 5, &mut cache).unwrap();

    assert_eq!(cache.len(), tokens.len());
    let diff = max_abs_diff(&last, &full);
    assert!(diff < 1e-4, "max diff {diff}");
}

#[test]
fn test_indivisible_world_size_rejected() {
    let config = tiny_config();
    let weights = random_weights(&config, &Device::Cpu).unwrap();
    let group = TensorParallelGroup::cpu(3).unwrap();

    let result = Llama::from_tensors(&config, weights, DType::F32, group, 32);
    assert!(matches!(result, Err(Error::Sharding(_))));
}

#[test]
fn test_max_len_beyond_position_embeddings_rejected() {
    let config = tiny_config();
    let weights = random_weights(&config, &Device::Cpu).unwrap();
    let group = TensorParallelGroup::cpu(1).unwrap();

    let result = Llama::from_tensors(&config, weights, DType::F32, group, 128);
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn test_forward_past_max_len_rejected() {
    let config = tiny_config();
    let weights = random_weights(&config, &Device::Cpu).unwrap();
    let model = build(&config, 1, &weights);

    let tokens: Vec<u32> = (0..33).map(|i| i % 16).collect();
    let result = model.forward(&input(&tokens), 0, &mut model.new_cache());
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn test_tied_embeddings_need_no_lm_head() {
    let mut config = tiny_config();
    config.tie_word_embeddings = true;
    let weights = random_weights(&config, &Device::Cpu).unwrap();
    assert!(!weights.contains_key("lm_head.weight"));

    let model = build(&config, 2, &weights);
    let logits = model
        .forward(&input(&[1, 2]), 0, &mut model.new_cache())
        .unwrap();
    assert_eq!(logits.dims(), &[1, 16]);
}

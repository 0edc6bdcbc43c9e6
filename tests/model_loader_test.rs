//! Integration tests for model config parsing and loading checks.

use std::fs;
use std::path::Path;

use shardgen::model::{load_generation_eos, local_model_files, LlamaConfig, RopeScaling, TokenIds};
use shardgen::Error;

const LLAMA_31_8B_CONFIG: &str = r#"{
    "architectures": ["LlamaForCausalLM"],
    "bos_token_id": 128000,
    "eos_token_id": [128001, 128008, 128009],
    "hidden_act": "silu",
    "hidden_size": 4096,
    "intermediate_size": 14336,
    "max_position_embeddings": 131072,
    "model_type": "llama",
    "num_attention_heads": 32,
    "num_hidden_layers": 32,
    "num_key_value_heads": 8,
    "rms_norm_eps": 1e-05,
    "rope_scaling": {
        "factor": 8.0,
        "low_freq_factor": 1.0,
        "high_freq_factor": 4.0,
        "original_max_position_embeddings": 8192,
        "rope_type": "llama3"
    },
    "rope_theta": 500000.0,
    "tie_word_embeddings": false,
    "torch_dtype": "bfloat16",
    "vocab_size": 128256
}"#;

fn llama_config() -> LlamaConfig {
    serde_json::from_str(LLAMA_31_8B_CONFIG).unwrap()
}

#[test]
fn test_parse_llama31_config() {
    let config = llama_config();

    assert_eq!(config.vocab_size, 128256);
    assert_eq!(config.num_hidden_layers, 32);
    assert_eq!(config.num_key_value_heads(), 8);
    assert_eq!(config.head_dim(), 128); // 4096 / 32
    assert!(!config.tie_word_embeddings);
    assert_eq!(config.eos_token_ids(), vec![128001, 128008, 128009]);

    let scaling = config.rope_scaling.as_ref().unwrap();
    assert_eq!(scaling.kind(), "llama3");
    assert_eq!(scaling.factor, 8.0);
    assert_eq!(scaling.original_max_position_embeddings, 8192);
}

#[test]
fn test_config_with_defaults() {
    let json = r#"{
        "vocab_size": 32000,
        "hidden_size": 2048,
        "intermediate_size": 5632,
        "num_hidden_layers": 22,
        "num_attention_heads": 32,
        "eos_token_id": 2
    }"#;

    let config: LlamaConfig = serde_json::from_str(json).unwrap();

    assert_eq!(config.num_key_value_heads(), 32); // falls back to num_attention_heads
    assert_eq!(config.head_dim(), 64);
    assert_eq!(config.rms_norm_eps, 1e-5);
    assert_eq!(config.rope_theta, 10000.0);
    assert!(config.rope_scaling.is_none());
    assert_eq!(config.eos_token_id, Some(TokenIds::Single(2)));
    assert_eq!(config.eos_token_ids(), vec![2]);
}

#[test]
fn test_default_model_is_loadable_and_shardable_by_four() {
    let config = llama_config();
    config.check_loadable("meta-llama/Meta-Llama-3.1-8B-Instruct", false).unwrap();
    config.check_shardable(4).unwrap();
    config.check_shardable(8).unwrap();
}

#[test]
fn test_indivisible_shard_count_rejected() {
    let config = llama_config();
    // 8 KV heads cannot be split three ways.
    let err = config.check_shardable(3).unwrap_err();
    assert!(matches!(err, Error::Sharding(msg) if msg.contains("num_attention_heads")));

    let err = config.check_shardable(16).unwrap_err();
    assert!(matches!(err, Error::Sharding(msg) if msg.contains("num_key_value_heads")));
}

#[test]
fn test_custom_code_requires_trust() {
    let mut config = llama_config();
    config.auto_map = Some(serde_json::json!({
        "AutoModelForCausalLM": "modeling_custom.CustomForCausalLM"
    }));

    assert!(config.requires_remote_code());
    assert!(matches!(
        config.check_loadable("org/custom", false),
        Err(Error::UntrustedRemoteCode(model)) if model == "org/custom"
    ));
    config.check_loadable("org/custom", true).unwrap();
}

#[test]
fn test_unsupported_architecture_rejected() {
    let mut config = llama_config();
    config.architectures = vec!["GPT2LMHeadModel".to_string()];
    assert!(matches!(
        config.check_loadable("gpt2", true),
        Err(Error::UnsupportedArchitecture(arch)) if arch == "GPT2LMHeadModel"
    ));
}

#[test]
fn test_parse_shard_index() {
    let index = r#"{
        "metadata": {"total_size": 16060522496},
        "weight_map": {
            "lm_head.weight": "model-00004-of-00004.safetensors",
            "model.embed_tokens.weight": "model-00001-of-00004.safetensors",
            "model.layers.0.mlp.down_proj.weight": "model-00001-of-00004.safetensors",
            "model.layers.20.mlp.up_proj.weight": "model-00003-of-00004.safetensors",
            "model.layers.9.self_attn.o_proj.weight": "model-00002-of-00004.safetensors"
        }
    }"#;

    let files = shardgen::model::loader::parse_shard_index(index).unwrap();
    assert_eq!(
        files,
        vec![
            "model-00001-of-00004.safetensors",
            "model-00002-of-00004.safetensors",
            "model-00003-of-00004.safetensors",
            "model-00004-of-00004.safetensors",
        ]
    );
}

#[test]
fn test_rope_scaling_with_both_type_keys() {
    // Configs re-saved by newer transformers carry `type` next to `rope_type`.
    let json = r#"{
        "vocab_size": 32000,
        "hidden_size": 2048,
        "intermediate_size": 5632,
        "num_hidden_layers": 22,
        "num_attention_heads": 32,
        "rope_scaling": {"factor": 2.0, "rope_type": "linear", "type": "linear"}
    }"#;

    let config: LlamaConfig = serde_json::from_str(json).unwrap();
    let scaling = config.rope_scaling.unwrap();
    assert_eq!(scaling.kind(), "linear");
    assert_eq!(scaling.factor, 2.0);
}

#[test]
fn test_rope_scaling_legacy_type_key() {
    let json = r#"{"type": "llama3", "factor": 8.0}"#;
    let scaling: RopeScaling = serde_json::from_str(json).unwrap();
    assert_eq!(scaling.kind(), "llama3");
    assert_eq!(scaling.original_max_position_embeddings, 8192);
}

#[test]
fn test_load_generation_eos() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("generation_config.json");
    fs::write(
        &path,
        r#"{"bos_token_id": 128000, "eos_token_id": [1, 2], "temperature": 0.6}"#,
    )
    .unwrap();

    assert_eq!(load_generation_eos(&path).unwrap(), vec![1, 2]);
}

#[test]
fn test_load_generation_eos_without_ids() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("generation_config.json");
    fs::write(&path, r#"{"do_sample": true}"#).unwrap();

    assert!(load_generation_eos(&path).unwrap().is_empty());
}

fn write_model_dir(dir: &Path) {
    fs::write(dir.join("config.json"), LLAMA_31_8B_CONFIG).unwrap();
    fs::write(dir.join("tokenizer.json"), "{}").unwrap();
    fs::write(dir.join("model.safetensors"), b"").unwrap();
}

#[test]
fn test_local_model_directory() {
    let dir = tempfile::tempdir().unwrap();
    write_model_dir(dir.path());

    let files = local_model_files(dir.path()).unwrap();
    assert_eq!(files.config, dir.path().join("config.json"));
    assert_eq!(files.weights, vec![dir.path().join("model.safetensors")]);
    assert!(files.generation_config.is_none());
}

#[test]
fn test_local_model_directory_with_generation_config() {
    let dir = tempfile::tempdir().unwrap();
    write_model_dir(dir.path());
    fs::write(
        dir.path().join("generation_config.json"),
        r#"{"eos_token_id": [128001, 128009]}"#,
    )
    .unwrap();

    let files = local_model_files(dir.path()).unwrap();
    let path = files.generation_config.unwrap();
    assert_eq!(path, dir.path().join("generation_config.json"));
    assert_eq!(load_generation_eos(&path).unwrap(), vec![128001, 128009]);
}

#[test]
fn test_local_model_directory_with_shard_index() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("config.json"), LLAMA_31_8B_CONFIG).unwrap();
    fs::write(dir.path().join("tokenizer.json"), "{}").unwrap();
    fs::write(
        dir.path().join("model.safetensors.index.json"),
        r#"{"weight_map": {
            "a": "model-00002-of-00002.safetensors",
            "b": "model-00001-of-00002.safetensors"
        }}"#,
    )
    .unwrap();
    fs::write(dir.path().join("model-00001-of-00002.safetensors"), b"").unwrap();
    fs::write(dir.path().join("model-00002-of-00002.safetensors"), b"").unwrap();

    let files = local_model_files(dir.path()).unwrap();
    assert_eq!(
        files.weights,
        vec![
            dir.path().join("model-00001-of-00002.safetensors"),
            dir.path().join("model-00002-of-00002.safetensors"),
        ]
    );
}

#[test]
fn test_local_model_directory_missing_tokenizer() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("config.json"), LLAMA_31_8B_CONFIG).unwrap();

    assert!(matches!(local_model_files(dir.path()), Err(Error::ModelLoad(_))));
}

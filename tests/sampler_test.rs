//! Integration tests for Sampler.

use std::collections::HashSet;

use candle_core::{Device, Tensor};
use shardgen::{Sampler, SamplingParams};

fn test_device() -> Device {
    Device::Cpu
}

fn test_sampling_params() -> SamplingParams {
    SamplingParams {
        temperature: 1.0,
        top_k: 0,
        top_p: 1.0,
        ..SamplingParams::default()
    }
}

#[test]
fn test_greedy_sampling() {
    let params = SamplingParams::greedy(16);
    let mut sampler = Sampler::with_seed(&params, 42);
    let device = test_device();

    // Token 3 has the highest logit
    let logits = Tensor::new(&[0.1f32, 0.2, 0.3, 10.0, 0.4], &device).unwrap();
    let tokens = sampler.sample(&logits).unwrap();

    assert_eq!(tokens, vec![3]);
}

#[test]
fn test_temperature_sampling() {
    let params = test_sampling_params();
    let mut sampler = Sampler::with_seed(&params, 42);
    let device = test_device();

    let logits = Tensor::new(&[1.0f32, 1.0, 1.0, 1.0, 1.0], &device).unwrap();

    let mut seen = HashSet::new();
    for _ in 0..100 {
        seen.insert(sampler.sample(&logits).unwrap()[0]);
    }

    assert!(seen.len() > 1, "uniform logits should yield several tokens");
}

#[test]
fn test_top_k_restricts_support() {
    let params = SamplingParams {
        top_k: 2,
        ..test_sampling_params()
    };
    let mut sampler = Sampler::with_seed(&params, 7);
    let device = test_device();

    let logits = Tensor::new(&[5.0f32, 4.9, 0.0, 0.1, 0.2], &device).unwrap();

    for _ in 0..200 {
        let token = sampler.sample(&logits).unwrap()[0];
        assert!(token == 0 || token == 1, "sampled token {token} outside top-2");
    }
}

#[test]
fn test_top_p_keeps_dominant_token() {
    // Demo settings: temperature 0.6, top_p 0.9
    let params = SamplingParams::default();
    let mut sampler = Sampler::with_seed(&params, 0);
    let device = test_device();

    // After temperature scaling token 2 holds well over 90% of the mass
    let logits = Tensor::new(&[0.0f32, 1.0, 8.0, 0.5], &device).unwrap();

    for _ in 0..100 {
        assert_eq!(sampler.sample(&logits).unwrap(), vec![2]);
    }
}

#[test]
fn test_batch_sampling() {
    let params = SamplingParams::greedy(16);
    let mut sampler = Sampler::with_seed(&params, 42);
    let device = test_device();

    let logits = Tensor::new(&[[0.1f32, 9.0, 0.3], [4.0, 0.2, 0.3]], &device).unwrap();
    let tokens = sampler.sample(&logits).unwrap();

    assert_eq!(tokens, vec![1, 0]);
}

#[test]
fn test_seeded_sampling_is_reproducible() {
    let params = test_sampling_params();
    let device = test_device();
    let logits = Tensor::new(&[0.5f32, 0.4, 0.3, 0.2, 0.1, 0.0], &device).unwrap();

    let draw = |seed| {
        let mut sampler = Sampler::with_seed(&params, seed);
        (0..32)
            .map(|_| sampler.sample(&logits).unwrap()[0])
            .collect::<Vec<_>>()
    };

    assert_eq!(draw(1234), draw(1234));
}

#[test]
fn test_for_request_offsets_seed() {
    let params = SamplingParams {
        seed: Some(100),
        ..test_sampling_params()
    };
    let device = test_device();
    let logits = Tensor::new(&[0.5f32, 0.4, 0.3, 0.2, 0.1, 0.0], &device).unwrap();

    let mut third = Sampler::for_request(&params, 3);
    let mut seeded = Sampler::with_seed(&params, 103);
    for _ in 0..32 {
        assert_eq!(
            third.sample(&logits).unwrap(),
            seeded.sample(&logits).unwrap()
        );
    }
}

#[test]
fn test_rejects_3d_logits() {
    let params = test_sampling_params();
    let mut sampler = Sampler::with_seed(&params, 42);
    let logits = Tensor::zeros((1, 1, 4), candle_core::DType::F32, &test_device()).unwrap();

    assert!(sampler.sample(&logits).is_err());
}

//! The demo driver: configure, initialize, generate, print.
//!
//! The driver holds no policy of its own. Whatever the initializer or the
//! engine returns as an error is handed straight back to the caller.

use std::io::Write;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::{LlmConfig, SamplingParams};
use crate::engine::{InferenceEngine, RequestOutput};
use crate::error::Result;

/// Prompts of the built-in batch.
pub const DEFAULT_PROMPTS: [&str; 4] = [
    "What are the main advantages of using a multi-GPU setup for deep learning?",
    "Write a python function that calculates the fibonacci sequence.",
    "Explain the concept of tensor parallelism in simple terms.",
    "Tell me a short story about four spaceships exploring a new galaxy together.",
];

/// Everything one demo run needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemoPlan {
    pub config: LlmConfig,
    pub prompts: Vec<String>,
    pub sampling: SamplingParams,
}

impl Default for DemoPlan {
    fn default() -> Self {
        Self {
            config: LlmConfig::default(),
            prompts: DEFAULT_PROMPTS.iter().map(|p| p.to_string()).collect(),
            sampling: SamplingParams::default(),
        }
    }
}

/// What a finished run produced.
#[derive(Debug, Clone)]
pub struct DemoSummary {
    /// Wall time of the generation call.
    pub elapsed: Duration,
    pub outputs: Vec<RequestOutput>,
}

/// Runs the demo once and writes the report to `out`.
///
/// `init` receives `plan.config` and returns the engine. If it fails, the
/// error is returned before any generation or output pair.
pub fn run<E, F, W>(plan: &DemoPlan, init: F, out: &mut W) -> Result<DemoSummary>
where
    E: InferenceEngine,
    F: FnOnce(&LlmConfig) -> Result<E>,
    W: Write,
{
    let config = &plan.config;
    writeln!(
        out,
        "Initializing LLM '{}' with tensor_parallel_size={}...",
        config.model, config.tensor_parallel_size
    )?;
    let mut engine = init(config)?;
    writeln!(out, "LLM Initialized. All GPUs are loaded.")?;

    writeln!(out, "\n--- Generating Responses ---")?;
    let started = Instant::now();
    let outputs = engine.generate(&plan.prompts, &plan.sampling)?;
    let elapsed = started.elapsed();
    writeln!(out, "Generation took {:.2} seconds.", elapsed.as_secs_f64())?;

    writeln!(out, "\n--- Model Outputs ---")?;
    for output in &outputs {
        write_output(out, output)?;
    }
    out.flush()?;

    Ok(DemoSummary { elapsed, outputs })
}

/// Writes one prompt/generated pair followed by a blank line.
pub fn write_output<W: Write>(out: &mut W, output: &RequestOutput) -> Result<()> {
    writeln!(out, "Prompt: {:?}", output.prompt)?;
    writeln!(out, "Generated: {:?}\n", output.text())?;
    Ok(())
}

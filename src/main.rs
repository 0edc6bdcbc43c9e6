use clap::Parser;

use shardgen::config::{
    DEFAULT_MAX_MODEL_LEN, DEFAULT_MAX_TOKENS, DEFAULT_MODEL_ID, DEFAULT_TEMPERATURE,
    DEFAULT_TENSOR_PARALLEL_SIZE, DEFAULT_TOP_P,
};
use shardgen::{DemoPlan, DeviceKind, LlmConfig, Llm, ModelDType, SamplingParams};

#[derive(Parser, Debug)]
#[command(name = "shardgen")]
#[command(about = "Run a batch of prompts through a tensor-parallel LLM")]
#[command(version)]
struct Args {
    /// Model path or HuggingFace model ID
    #[arg(short, long, default_value = DEFAULT_MODEL_ID)]
    model: String,

    /// Hub revision (branch, tag or commit)
    #[arg(long, default_value = "main")]
    revision: String,

    /// Number of devices to shard the model across
    #[arg(short = 't', long, default_value_t = DEFAULT_TENSOR_PARALLEL_SIZE)]
    tensor_parallel_size: usize,

    /// Maximum sequence length (prompt + generated)
    #[arg(long, default_value_t = DEFAULT_MAX_MODEL_LEN)]
    max_model_len: usize,

    /// Refuse models whose config declares custom code
    #[arg(long)]
    no_trust_remote_code: bool,

    #[arg(long, default_value_t = DEFAULT_TEMPERATURE)]
    temperature: f32,

    #[arg(long, default_value_t = DEFAULT_TOP_P)]
    top_p: f32,

    /// Top-k sampling (0 = disabled)
    #[arg(long, default_value_t = 0)]
    top_k: usize,

    /// Maximum tokens to generate per prompt
    #[arg(long, default_value_t = DEFAULT_MAX_TOKENS)]
    max_tokens: usize,

    /// Seed for reproducible sampling
    #[arg(long)]
    seed: Option<u64>,

    /// Keep generating past end-of-sequence tokens
    #[arg(long)]
    ignore_eos: bool,

    /// Prompt to run (repeatable); replaces the built-in batch
    #[arg(short, long = "prompt")]
    prompts: Vec<String>,

    #[arg(long, value_enum, default_value_t = DeviceKind::Auto)]
    device: DeviceKind,

    #[arg(long, value_enum, default_value_t = ModelDType::Auto)]
    dtype: ModelDType,

    /// Log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_plan(self) -> DemoPlan {
        let mut plan = DemoPlan {
            config: LlmConfig {
                model: self.model,
                trust_remote_code: !self.no_trust_remote_code,
                tensor_parallel_size: self.tensor_parallel_size,
                max_model_len: self.max_model_len,
                revision: self.revision,
                device: self.device,
                dtype: self.dtype,
            },
            sampling: SamplingParams {
                temperature: self.temperature,
                top_p: self.top_p,
                top_k: self.top_k,
                max_tokens: self.max_tokens,
                seed: self.seed,
                ignore_eos: self.ignore_eos,
            },
            ..DemoPlan::default()
        };
        if !self.prompts.is_empty() {
            plan.prompts = self.prompts;
        }
        plan
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    shardgen::logging::init_logging(&args.log_level)?;

    let plan = args.into_plan();
    let stdout = std::io::stdout();
    shardgen::run(&plan, Llm::new, &mut stdout.lock())?;
    Ok(())
}

//! CLI wiring for the charformer tools.

use crate::serve::{serve, GenerationService, ServeOptions};
use anyhow::{bail, Context, Result};
use charformer_kernels::config::Device;
use charformer_model::{
    Checkpoint, ExecutionContext, LanguageModel, ModelConfig, SamplingParams, Vocabulary,
};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "charformer", about = "Character-level transformer text generator")]
pub struct Cli {
    /// Overrides the device stored in the checkpoint config.
    #[arg(long, value_enum, global = true)]
    pub device: Option<DeviceArg>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum DeviceArg {
    Cpu,
    CpuParallel,
}

impl From<DeviceArg> for Device {
    fn from(value: DeviceArg) -> Device {
        match value {
            DeviceArg::Cpu => Device::Cpu,
            DeviceArg::CpuParallel => Device::CpuParallel,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresetArg {
    Tiny,
    Tweet,
}

impl PresetArg {
    fn config(self, vocab_size: usize) -> ModelConfig {
        match self {
            PresetArg::Tiny => ModelConfig::tiny(vocab_size),
            PresetArg::Tweet => ModelConfig::tweet(vocab_size),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Sample text from a checkpoint and print it with timing metrics.
    Generate {
        #[arg(long, env = "CHARFORMER_CHECKPOINT")]
        checkpoint: PathBuf,
        #[arg(long, default_value_t = 200)]
        max_tokens: usize,
        #[arg(long, default_value_t = 1.0)]
        temperature: f32,
        #[arg(long, default_value_t = 40, conflicts_with = "no_top_k")]
        top_k: i64,
        /// Sample from the full distribution.
        #[arg(long, default_value_t = false)]
        no_top_k: bool,
        #[arg(long)]
        prompt: Option<String>,
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Serve `POST /generate` over HTTP.
    Serve {
        #[arg(long, env = "CHARFORMER_CHECKPOINT")]
        checkpoint: PathBuf,
        #[arg(long, env = "CHARFORMER_ADDR", default_value = "0.0.0.0:8000")]
        addr: String,
        #[arg(long, default_value_t = 4)]
        workers: usize,
        #[arg(long, default_value_t = 2000)]
        max_tokens_limit: usize,
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Write a randomly initialised checkpoint whose vocabulary is the corpus alphabet.
    Init {
        #[arg(long)]
        corpus: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long, value_enum, default_value = "tiny")]
        preset: PresetArg,
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
    /// Print a checkpoint's config and parameter count.
    Inspect {
        #[arg(long, env = "CHARFORMER_CHECKPOINT")]
        checkpoint: PathBuf,
    },
}

pub fn run_cli(cli: Cli) -> Result<()> {
    tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let Cli { device, command } = cli;
    let device: Option<Device> = device.map(Into::into);

    match command {
        Command::Generate {
            checkpoint,
            max_tokens,
            temperature,
            top_k,
            no_top_k,
            prompt,
            seed,
        } => {
            let params = SamplingParams::new(temperature, (!no_top_k).then_some(top_k))?;
            let checkpoint = Checkpoint::load(&checkpoint)?;
            let ctx = context_for(&checkpoint, device)?;
            let mut rng = match seed {
                Some(seed) => fastrand::Rng::with_seed(seed),
                None => fastrand::Rng::new(),
            };

            let generation = checkpoint.generator()?.generate(
                &ctx,
                prompt.as_deref(),
                &params,
                max_tokens,
                &mut rng,
            )?;

            println!("{}", generation.text);
            println!("\n=== Metrics ===");
            println!("Tokens generated: {}", generation.metrics.tokens_generated);
            println!("Elapsed: {:.2} ms", generation.metrics.elapsed_ms);
            println!("Tokens/sec: {:.2}", generation.metrics.tokens_per_sec);
        }
        Command::Serve {
            checkpoint,
            addr,
            workers,
            max_tokens_limit,
            seed,
        } => {
            let options = ServeOptions {
                addr,
                workers,
                max_tokens_limit,
                seed,
            };
            let checkpoint = Checkpoint::load(&checkpoint)?;
            let ctx = context_for(&checkpoint, device)?;
            let service = GenerationService::new(Arc::new(checkpoint), ctx, &options);
            serve(service, &options)?;
        }
        Command::Init {
            corpus,
            out,
            preset,
            seed,
        } => {
            let text = fs::read_to_string(&corpus)
                .with_context(|| format!("failed to read corpus {}", corpus.display()))?;
            let vocab = Vocabulary::from_corpus(&text);
            if vocab.size() == 0 {
                bail!("corpus {} is empty", corpus.display());
            }

            let mut config = preset.config(vocab.size());
            if let Some(device) = device {
                config.device = device;
            }
            info!(
                preset = ?preset,
                vocab = vocab.size(),
                params = config.parameter_count(),
                "initialising model"
            );
            let model = LanguageModel::random(config, seed)?;
            Checkpoint::new(model, vocab)?.save(&out)?;
            println!("wrote {}", out.display());
        }
        Command::Inspect { checkpoint } => {
            let checkpoint = Checkpoint::load(&checkpoint)?;
            let config = checkpoint.config();
            println!("{}", serde_json::to_string_pretty(config)?);
            println!("parameters: {}", config.parameter_count());
            let alphabet: String = checkpoint.vocab.symbols().iter().collect();
            println!("vocabulary ({}): {:?}", checkpoint.vocab.size(), alphabet);
        }
    }
    Ok(())
}

fn context_for(checkpoint: &Checkpoint, device: Option<Device>) -> Result<ExecutionContext> {
    let device = device.unwrap_or(checkpoint.config().device);
    Ok(ExecutionContext::new(device)?)
}

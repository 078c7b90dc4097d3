//! Character-level decoder-only transformer with autoregressive sampling.
//!
//! - [`LanguageModel`]: embeddings, pre-norm blocks of causal multi-head
//!   attention and feed-forward layers, final norm and LM head
//! - [`Generator`]: sliding-window decoding with temperature and top-k
//! - [`Checkpoint`]: safetensors weights plus config and vocabulary
//!
//! Every forward call takes an explicit [`ExecutionContext`] that carries the
//! matmul kernel and the inference/training mode.

pub mod attention;
pub mod block;
pub mod checkpoint;
pub mod config;
pub mod context;
pub mod error;
pub mod feed_forward;
pub mod generate;
pub mod model;
pub mod sampling;
pub mod vocab;
pub mod weights;

pub use attention::{AttentionHead, CausalMask, MultiHeadAttention};
pub use block::TransformerBlock;
pub use checkpoint::{Checkpoint, FORMAT_TAG};
pub use config::ModelConfig;
pub use context::{ExecutionContext, ForwardMode};
pub use error::{ModelError, Result};
pub use feed_forward::FeedForward;
pub use generate::{Generation, GenerationMetrics, GenerationState, Generator};
pub use model::{ForwardOutput, LanguageModel};
pub use sampling::SamplingParams;
pub use vocab::Vocabulary;

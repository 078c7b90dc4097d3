//! Character-level transformer language model.
//!
//! Re-exports the numeric kernels and the model crate so downstream users can
//! depend on a single package.

pub use charformer_kernels as kernels;
pub use charformer_model as model;

pub use charformer_model::{
    Checkpoint, ExecutionContext, Generator, LanguageModel, ModelConfig, ModelError,
    SamplingParams, Vocabulary,
};

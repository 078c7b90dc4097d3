//! Model hyperparameters. Every tensor shape in the model derives from these.

use crate::error::{ModelError, Result};
use charformer_kernels::config::Device;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub vocab_size: usize,
    /// Maximum context length the model attends over.
    pub block_size: usize,
    pub n_embd: usize,
    pub n_head: usize,
    pub n_layer: usize,
    #[serde(default = "default_dropout")]
    pub dropout: f32,
    #[serde(default)]
    pub device: Device,
}

fn default_dropout() -> f32 {
    0.2
}

impl ModelConfig {
    /// Character model used for the tweet generator (~10.8M params at ~70 symbols).
    pub fn tweet(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            block_size: 256,
            n_embd: 384,
            n_head: 6,
            n_layer: 6,
            dropout: 0.2,
            device: Device::CpuParallel,
        }
    }

    /// Tiny test config for quick iteration
    pub fn tiny(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            block_size: 16,
            n_embd: 32,
            n_head: 4,
            n_layer: 2,
            dropout: 0.0,
            device: Device::Cpu,
        }
    }

    pub fn head_size(&self) -> usize {
        self.n_embd / self.n_head
    }

    pub fn ffn_hidden(&self) -> usize {
        4 * self.n_embd
    }

    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("vocab_size", self.vocab_size),
            ("block_size", self.block_size),
            ("n_embd", self.n_embd),
            ("n_head", self.n_head),
            ("n_layer", self.n_layer),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(ModelError::InvalidConfig(format!("{} must be positive", name)));
            }
        }
        if self.n_embd % self.n_head != 0 {
            return Err(ModelError::InvalidConfig(format!(
                "n_embd {} is not divisible by n_head {}",
                self.n_embd, self.n_head
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(ModelError::InvalidConfig(format!(
                "dropout {} outside [0, 1)",
                self.dropout
            )));
        }
        Ok(())
    }

    /// Total number of learned scalars.
    pub fn parameter_count(&self) -> usize {
        let c = self.n_embd;
        let ffn = self.ffn_hidden();
        let embeddings = (self.vocab_size + self.block_size) * c;
        let attention = 3 * c * c + c * c + c;
        let feed_forward = c * ffn + ffn + ffn * c + c;
        let norms = 4 * c;
        let head = c * self.vocab_size + self.vocab_size + 2 * c;
        embeddings + self.n_layer * (attention + feed_forward + norms) + head
    }
}

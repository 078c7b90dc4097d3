//! Position-wise feed-forward network: linear -> ReLU -> linear -> dropout.

use crate::config::ModelConfig;
use crate::context::ExecutionContext;
use crate::error::Result;
use crate::weights::{join, Linear, ParamSource, ParamVisitor};
use charformer_kernels::config::ActivationKind;
use ndarray::{Array2, ArrayView2};

#[derive(Debug, Clone)]
pub struct FeedForward {
    pub up: Linear,
    pub down: Linear,
    dropout: f32,
}

impl FeedForward {
    pub fn load(source: &mut dyn ParamSource, prefix: &str, config: &ModelConfig) -> Result<Self> {
        let hidden = config.ffn_hidden();
        Ok(Self {
            up: Linear::load(source, &join(prefix, "up"), config.n_embd, hidden, true)?,
            down: Linear::load(source, &join(prefix, "down"), hidden, config.n_embd, true)?,
            dropout: config.dropout,
        })
    }

    pub fn visit(&self, prefix: &str, visitor: &mut dyn ParamVisitor) {
        self.up.visit(&join(prefix, "up"), visitor);
        self.down.visit(&join(prefix, "down"), visitor);
    }

    pub fn forward(&self, ctx: &ExecutionContext, x: ArrayView2<'_, f32>) -> Result<Array2<f32>> {
        let hidden = self.up.forward(ctx, x, ActivationKind::Relu)?;
        let mut out = self.down.forward(ctx, hidden.view(), ActivationKind::None)?;
        ctx.dropout(&mut out, self.dropout);
        Ok(out)
    }
}

//! Pre-norm transformer block with residual connections.

use crate::attention::{CausalMask, MultiHeadAttention};
use crate::config::ModelConfig;
use crate::context::ExecutionContext;
use crate::error::Result;
use crate::feed_forward::FeedForward;
use crate::weights::{join, LayerNorm, ParamSource, ParamVisitor};
use ndarray::{Array2, ArrayView2};

#[derive(Debug, Clone)]
pub struct TransformerBlock {
    pub ln1: LayerNorm,
    pub attn: MultiHeadAttention,
    pub ln2: LayerNorm,
    pub ffn: FeedForward,
}

impl TransformerBlock {
    pub fn load(source: &mut dyn ParamSource, prefix: &str, config: &ModelConfig) -> Result<Self> {
        Ok(Self {
            ln1: LayerNorm::load(source, &join(prefix, "ln1"), config.n_embd)?,
            attn: MultiHeadAttention::load(source, &join(prefix, "attn"), config)?,
            ln2: LayerNorm::load(source, &join(prefix, "ln2"), config.n_embd)?,
            ffn: FeedForward::load(source, &join(prefix, "ffn"), config)?,
        })
    }

    pub fn visit(&self, prefix: &str, visitor: &mut dyn ParamVisitor) {
        self.ln1.visit(&join(prefix, "ln1"), visitor);
        self.attn.visit(&join(prefix, "attn"), visitor);
        self.ln2.visit(&join(prefix, "ln2"), visitor);
        self.ffn.visit(&join(prefix, "ffn"), visitor);
    }

    /// `x + attn(ln1(x))`, then `x + ffn(ln2(x))`. Shape preserving.
    pub fn forward(
        &self,
        ctx: &ExecutionContext,
        x: ArrayView2<'_, f32>,
        mask: &CausalMask,
    ) -> Result<Array2<f32>> {
        let x_norm = self.ln1.forward(x)?;
        let attn_out = self.attn.forward(ctx, x_norm.view(), mask)?;
        let x = &x + &attn_out;

        let x_norm = self.ln2.forward(x.view())?;
        let mlp_out = self.ffn.forward(ctx, x_norm.view())?;
        Ok(x + &mlp_out)
    }
}

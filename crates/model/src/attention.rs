//! Causal self-attention: single heads and their multi-head composition.

use crate::config::ModelConfig;
use crate::context::ExecutionContext;
use crate::error::{ModelError, Result};
use crate::weights::{join, Linear, ParamSource, ParamVisitor};
use charformer_kernels::attention::{attention_weights, causal_mask};
use charformer_kernels::config::ActivationKind;
use ndarray::{concatenate, s, Array2, ArrayView2, Axis};

/// Lower-triangular mask built once for the full block size. Shorter inputs
/// use its top-left corner.
#[derive(Debug, Clone)]
pub struct CausalMask {
    mask: Array2<bool>,
}

impl CausalMask {
    pub fn new(block_size: usize) -> Self {
        Self {
            mask: causal_mask(block_size),
        }
    }

    pub fn block_size(&self) -> usize {
        self.mask.nrows()
    }

    pub fn window(&self, len: usize) -> Result<ArrayView2<'_, bool>> {
        if len == 0 || len > self.block_size() {
            return Err(ModelError::ContextOverflow {
                len,
                block_size: self.block_size(),
            });
        }
        Ok(self.mask.slice(s![..len, ..len]))
    }
}

/// One attention subspace: bias-free key/query/value maps of width `head_size`.
#[derive(Debug, Clone)]
pub struct AttentionHead {
    pub key: Array2<f32>,
    pub query: Array2<f32>,
    pub value: Array2<f32>,
    dropout: f32,
}

impl AttentionHead {
    pub fn load(source: &mut dyn ParamSource, prefix: &str, config: &ModelConfig) -> Result<Self> {
        let (c, hs) = (config.n_embd, config.head_size());
        Ok(Self {
            key: source.matrix(&join(prefix, "key"), c, hs)?,
            query: source.matrix(&join(prefix, "query"), c, hs)?,
            value: source.matrix(&join(prefix, "value"), c, hs)?,
            dropout: config.dropout,
        })
    }

    pub fn visit(&self, prefix: &str, visitor: &mut dyn ParamVisitor) {
        visitor.matrix(&join(prefix, "key"), &self.key);
        visitor.matrix(&join(prefix, "query"), &self.query);
        visitor.matrix(&join(prefix, "value"), &self.value);
    }

    pub fn head_size(&self) -> usize {
        self.key.ncols()
    }

    /// (T, C) -> (T, head_size). Row `i` of the output only depends on input rows `..=i`.
    pub fn forward(
        &self,
        ctx: &ExecutionContext,
        x: ArrayView2<'_, f32>,
        mask: &CausalMask,
    ) -> Result<Array2<f32>> {
        let window = mask.window(x.nrows())?;
        let k = ctx.linear(x, self.key.view(), None, ActivationKind::None)?;
        let q = ctx.linear(x, self.query.view(), None, ActivationKind::None)?;
        let v = ctx.linear(x, self.value.view(), None, ActivationKind::None)?;

        let scale = 1.0 / (self.head_size() as f32).sqrt();
        let mut weights = attention_weights(q.view(), k.view(), Some(window), scale)?;
        ctx.dropout(&mut weights, self.dropout);

        Ok(weights.dot(&v))
    }
}

#[derive(Debug, Clone)]
pub struct MultiHeadAttention {
    pub heads: Vec<AttentionHead>,
    pub proj: Linear,
    dropout: f32,
}

impl MultiHeadAttention {
    pub fn load(source: &mut dyn ParamSource, prefix: &str, config: &ModelConfig) -> Result<Self> {
        let heads = (0..config.n_head)
            .map(|h| AttentionHead::load(source, &join(prefix, &format!("heads.{}", h)), config))
            .collect::<Result<Vec<_>>>()?;
        let proj = Linear::load(source, &join(prefix, "proj"), config.n_embd, config.n_embd, true)?;
        Ok(Self {
            heads,
            proj,
            dropout: config.dropout,
        })
    }

    pub fn visit(&self, prefix: &str, visitor: &mut dyn ParamVisitor) {
        for (h, head) in self.heads.iter().enumerate() {
            head.visit(&join(prefix, &format!("heads.{}", h)), visitor);
        }
        self.proj.visit(&join(prefix, "proj"), visitor);
    }

    /// (T, C) -> (T, C): heads run independently, are concatenated along
    /// features and projected back to model width.
    pub fn forward(
        &self,
        ctx: &ExecutionContext,
        x: ArrayView2<'_, f32>,
        mask: &CausalMask,
    ) -> Result<Array2<f32>> {
        let outputs = self
            .heads
            .iter()
            .map(|head| head.forward(ctx, x, mask))
            .collect::<Result<Vec<_>>>()?;
        let views: Vec<ArrayView2<'_, f32>> = outputs.iter().map(Array2::view).collect();
        let joined = concatenate(Axis(1), &views).map_err(|e| anyhow::anyhow!(e))?;

        let mut out = self.proj.forward(ctx, joined.view(), ActivationKind::None)?;
        ctx.dropout(&mut out, self.dropout);
        Ok(out)
    }
}

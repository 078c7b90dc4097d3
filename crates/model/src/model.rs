//! Full model with embeddings, block stack, final norm and LM head.

use crate::attention::CausalMask;
use crate::block::TransformerBlock;
use crate::config::ModelConfig;
use crate::context::ExecutionContext;
use crate::error::{ModelError, Result};
use crate::weights::{join, Initializer, LayerNorm, Linear, ParamSource, ParamVisitor};
use charformer_kernels::config::ActivationKind;
use charformer_kernels::utils::log_sum_exp;
use ndarray::{s, Array1, Array2, Array3, ArrayView2, Axis};

pub struct LanguageModel {
    config: ModelConfig,
    pub token_embedding: Array2<f32>,    // (vocab_size, n_embd)
    pub position_embedding: Array2<f32>, // (block_size, n_embd)
    pub blocks: Vec<TransformerBlock>,
    pub ln_f: LayerNorm,
    pub lm_head: Linear, // (n_embd, vocab_size)
    mask: CausalMask,
}

#[derive(Debug)]
pub struct ForwardOutput {
    /// (batch, T, vocab_size)
    pub logits: Array3<f32>,
    /// Mean cross-entropy over all batch * T positions, when targets were given.
    pub loss: Option<f32>,
}

impl LanguageModel {
    /// Builds the model by pulling every parameter from `source`. Fails on an
    /// invalid config or on any tensor the source cannot supply at the expected shape.
    pub fn load(config: ModelConfig, source: &mut dyn ParamSource) -> Result<Self> {
        config.validate()?;
        let c = config.n_embd;

        let token_embedding = source.matrix("token_embedding", config.vocab_size, c)?;
        let position_embedding = source.matrix("position_embedding", config.block_size, c)?;
        let blocks = (0..config.n_layer)
            .map(|i| TransformerBlock::load(source, &format!("blocks.{}", i), &config))
            .collect::<Result<Vec<_>>>()?;
        let ln_f = LayerNorm::load(source, "ln_f", c)?;
        let lm_head = Linear::load(source, "lm_head", c, config.vocab_size, true)?;
        let mask = CausalMask::new(config.block_size);

        Ok(Self {
            config,
            token_embedding,
            position_embedding,
            blocks,
            ln_f,
            lm_head,
            mask,
        })
    }

    /// All weights zero (norm gains one); every position predicts a uniform distribution.
    pub fn zeros(config: ModelConfig) -> Result<Self> {
        Self::load(config, &mut Initializer::zeros())
    }

    pub fn random(config: ModelConfig, seed: u64) -> Result<Self> {
        Self::load(config, &mut Initializer::random(seed))
    }

    pub fn visit(&self, visitor: &mut dyn ParamVisitor) {
        visitor.matrix("token_embedding", &self.token_embedding);
        visitor.matrix("position_embedding", &self.position_embedding);
        for (i, block) in self.blocks.iter().enumerate() {
            block.visit(&join("blocks", &i.to_string()), visitor);
        }
        self.ln_f.visit("ln_f", visitor);
        self.lm_head.visit("lm_head", visitor);
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn block_size(&self) -> usize {
        self.config.block_size
    }

    pub fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    /// Forward pass over a batch of token rows.
    ///
    /// `idx` is (batch, T) with `1 <= T <= block_size`. With `targets` of the
    /// same shape the mean cross-entropy is returned alongside the logits.
    pub fn forward(
        &self,
        ctx: &ExecutionContext,
        idx: ArrayView2<'_, usize>,
        targets: Option<ArrayView2<'_, usize>>,
    ) -> Result<ForwardOutput> {
        let (batch, t) = idx.dim();
        let vocab = self.vocab_size();
        if batch == 0 {
            return Err(ModelError::InvalidToken("batch has no rows".into()));
        }
        if t == 0 || t > self.block_size() {
            return Err(ModelError::ContextOverflow {
                len: t,
                block_size: self.block_size(),
            });
        }
        if let Some(targets) = &targets {
            if targets.dim() != idx.dim() {
                return Err(ModelError::InvalidToken(format!(
                    "targets shape {:?} differs from input shape {:?}",
                    targets.dim(),
                    idx.dim()
                )));
            }
        }

        let mut logits = Array3::<f32>::zeros((batch, t, vocab));
        for (b, row) in idx.axis_iter(Axis(0)).enumerate() {
            let tokens: Vec<usize> = row.to_vec();
            let row_logits = self.forward_sequence(ctx, &tokens)?;
            logits.slice_mut(s![b, .., ..]).assign(&row_logits);
        }

        let loss = match targets {
            Some(targets) => Some(self.cross_entropy(&logits, targets)?),
            None => None,
        };

        Ok(ForwardOutput { logits, loss })
    }

    /// Logits (T, vocab_size) for one token sequence.
    pub fn forward_sequence(
        &self,
        ctx: &ExecutionContext,
        tokens: &[usize],
    ) -> Result<Array2<f32>> {
        let t = tokens.len();
        if t == 0 || t > self.block_size() {
            return Err(ModelError::ContextOverflow {
                len: t,
                block_size: self.block_size(),
            });
        }

        let mut hidden = self.position_embedding.slice(s![..t, ..]).to_owned();
        for (pos, &token) in tokens.iter().enumerate() {
            self.check_token(token)?;
            let mut row = hidden.row_mut(pos);
            row += &self.token_embedding.row(token);
        }

        for block in &self.blocks {
            hidden = block.forward(ctx, hidden.view(), &self.mask)?;
        }

        let normed = self.ln_f.forward(hidden.view())?;
        self.lm_head.forward(ctx, normed.view(), ActivationKind::None)
    }

    /// Next-token logits: the final row of [`Self::forward_sequence`].
    pub fn next_token_logits(
        &self,
        ctx: &ExecutionContext,
        window: &[usize],
    ) -> Result<Array1<f32>> {
        let logits = self.forward_sequence(ctx, window)?;
        Ok(logits.row(window.len() - 1).to_owned())
    }

    fn check_token(&self, token: usize) -> Result<()> {
        if token >= self.vocab_size() {
            return Err(ModelError::InvalidToken(format!(
                "token id {} outside vocabulary of {}",
                token,
                self.vocab_size()
            )));
        }
        Ok(())
    }

    fn cross_entropy(&self, logits: &Array3<f32>, targets: ArrayView2<'_, usize>) -> Result<f32> {
        let (batch, t, vocab) = logits.dim();
        let flat = logits
            .view()
            .into_shape((batch * t, vocab))
            .map_err(|e| anyhow::anyhow!(e))?;

        let mut total = 0.0f32;
        for (row, &target) in flat.axis_iter(Axis(0)).zip(targets.iter()) {
            self.check_token(target)?;
            total += log_sum_exp(row) - row[target];
        }
        Ok(total / (batch * t) as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::arr2;

    fn abc_config() -> ModelConfig {
        ModelConfig {
            vocab_size: 3,
            block_size: 4,
            n_embd: 8,
            n_head: 2,
            n_layer: 2,
            dropout: 0.0,
            device: Default::default(),
        }
    }

    #[test]
    fn logits_have_batch_time_vocab_shape() {
        let model = LanguageModel::random(abc_config(), 5).unwrap();
        let ctx = ExecutionContext::cpu().unwrap();
        let idx = arr2(&[[0usize, 1, 2], [2, 2, 1]]);
        let out = model.forward(&ctx, idx.view(), None).unwrap();
        assert_eq!(out.logits.dim(), (2, 3, 3));
        assert!(out.loss.is_none());
    }

    #[test]
    fn zero_model_loss_is_log_vocab() {
        let model = LanguageModel::zeros(abc_config()).unwrap();
        let ctx = ExecutionContext::cpu().unwrap();
        let idx = arr2(&[[0usize, 1, 2, 0]]);
        let targets = arr2(&[[1usize, 2, 0, 1]]);
        let out = model.forward(&ctx, idx.view(), Some(targets.view())).unwrap();
        assert_abs_diff_eq!(out.loss.unwrap(), 3.0f32.ln(), epsilon = 1e-5);
        assert!(out.logits.iter().all(|&l| l == 0.0));
    }

    #[test]
    fn batch_rows_are_independent() {
        let model = LanguageModel::random(abc_config(), 9).unwrap();
        let ctx = ExecutionContext::cpu().unwrap();
        let batched = model
            .forward(&ctx, arr2(&[[0usize, 1], [2, 0]]).view(), None)
            .unwrap();
        let single = model.forward_sequence(&ctx, &[2, 0]).unwrap();
        for (a, b) in batched.logits.slice(s![1, .., ..]).iter().zip(single.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-6);
        }
    }

    #[test]
    fn rejects_context_longer_than_block() {
        let model = LanguageModel::zeros(abc_config()).unwrap();
        let ctx = ExecutionContext::cpu().unwrap();
        let err = model.forward_sequence(&ctx, &[0, 1, 2, 0, 1]).unwrap_err();
        assert_eq!(err.kind(), "context_overflow");
        assert_eq!(model.forward_sequence(&ctx, &[]).unwrap_err().kind(), "context_overflow");
    }

    #[test]
    fn rejects_out_of_vocab_ids_and_bad_targets() {
        let model = LanguageModel::zeros(abc_config()).unwrap();
        let ctx = ExecutionContext::cpu().unwrap();
        assert_eq!(model.forward_sequence(&ctx, &[3]).unwrap_err().kind(), "invalid_token");

        let idx = arr2(&[[0usize, 1]]);
        let targets = arr2(&[[0usize]]);
        assert!(model.forward(&ctx, idx.view(), Some(targets.view())).is_err());
    }

    #[test]
    fn empty_batches_are_rejected() {
        let model = LanguageModel::zeros(abc_config()).unwrap();
        let ctx = ExecutionContext::cpu().unwrap();
        let idx = Array2::<usize>::zeros((0, 3));
        let targets = Array2::<usize>::zeros((0, 3));
        let err = model.forward(&ctx, idx.view(), Some(targets.view())).unwrap_err();
        assert_eq!(err.kind(), "invalid_token");

        let idx = Array2::<usize>::zeros((2, 0));
        let err = model.forward(&ctx, idx.view(), None).unwrap_err();
        assert_eq!(err.kind(), "context_overflow");
    }

    #[test]
    fn next_token_logits_match_last_row() {
        let model = LanguageModel::random(abc_config(), 1).unwrap();
        let ctx = ExecutionContext::cpu().unwrap();
        let all = model.forward_sequence(&ctx, &[1, 0, 2]).unwrap();
        let last = model.next_token_logits(&ctx, &[1, 0, 2]).unwrap();
        assert_eq!(all.row(2).to_owned(), last);
    }

    #[test]
    fn invalid_config_is_rejected_before_allocation() {
        let mut config = abc_config();
        config.n_head = 3;
        assert_eq!(LanguageModel::zeros(config).err().map(|e| e.kind()), Some("invalid_config"));
    }
}

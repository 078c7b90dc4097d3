//! Autoregressive decoding over a sliding context window.

use crate::context::ExecutionContext;
use crate::error::{ModelError, Result};
use crate::model::LanguageModel;
use crate::sampling::{sample_categorical, SamplingParams};
use crate::vocab::Vocabulary;
use ndarray::Array1;
use serde::Serialize;
use std::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
    Initial,
    Decoding { step: usize },
    Done,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationMetrics {
    pub elapsed_ms: f64,
    pub tokens_generated: usize,
    pub tokens_per_sec: f64,
}

#[derive(Debug, Clone)]
pub struct Generation {
    /// The whole buffer decoded, including the start token or prompt.
    pub text: String,
    pub tokens: Vec<usize>,
    pub metrics: GenerationMetrics,
}

/// Pairs a model with the vocabulary it was trained on. Holds no per-call
/// state, so one generator can serve many requests concurrently.
pub struct Generator<'m> {
    model: &'m LanguageModel,
    vocab: &'m Vocabulary,
    start_token: usize,
}

impl<'m> Generator<'m> {
    pub fn new(model: &'m LanguageModel, vocab: &'m Vocabulary) -> Result<Self> {
        if vocab.size() != model.vocab_size() {
            return Err(ModelError::ConfigMismatch(format!(
                "vocabulary has {} symbols, model expects {}",
                vocab.size(),
                model.vocab_size()
            )));
        }
        Ok(Self {
            model,
            vocab,
            start_token: 0,
        })
    }

    pub fn with_start_token(mut self, token: usize) -> Result<Self> {
        if token >= self.vocab.size() {
            return Err(ModelError::InvalidToken(format!(
                "start token {} outside vocabulary of {}",
                token,
                self.vocab.size()
            )));
        }
        self.start_token = token;
        Ok(self)
    }

    pub fn start_token(&self) -> usize {
        self.start_token
    }

    /// Initial context buffer: the encoded prompt, or the start token when no
    /// (or an empty) prompt is given.
    pub fn initial_context(&self, prompt: Option<&str>) -> Result<Vec<usize>> {
        match prompt {
            Some(text) if !text.is_empty() => self.vocab.encode(text),
            _ => Ok(vec![self.start_token]),
        }
    }

    /// Sampling distribution for the token following `context`. Only the last
    /// `block_size` tokens are fed to the model.
    pub fn next_token_distribution(
        &self,
        ctx: &ExecutionContext,
        context: &[usize],
        params: &SamplingParams,
    ) -> Result<Array1<f32>> {
        let start = context.len().saturating_sub(self.model.block_size());
        let logits = self.model.next_token_logits(ctx, &context[start..])?;
        Ok(params.distribution(logits.view()))
    }

    pub fn step(
        &self,
        ctx: &ExecutionContext,
        context: &[usize],
        params: &SamplingParams,
        rng: &mut fastrand::Rng,
    ) -> Result<usize> {
        let probs = self.next_token_distribution(ctx, context, params)?;
        Ok(sample_categorical(probs.view(), rng))
    }

    /// Appends exactly `max_tokens` sampled tokens to the initial context and
    /// decodes the result. Any failing step aborts the call.
    pub fn generate(
        &self,
        ctx: &ExecutionContext,
        prompt: Option<&str>,
        params: &SamplingParams,
        max_tokens: usize,
        rng: &mut fastrand::Rng,
    ) -> Result<Generation> {
        let started = Instant::now();
        let mut tokens = Vec::new();
        let mut state = GenerationState::Initial;

        loop {
            state = match state {
                GenerationState::Initial => {
                    tokens.extend(self.initial_context(prompt)?);
                    tokens.reserve(max_tokens);
                    info!(
                        context = tokens.len(),
                        max_tokens,
                        temperature = params.temperature(),
                        top_k = ?params.top_k(),
                        kernel = ctx.kernel_name(),
                        "generation started"
                    );
                    if max_tokens == 0 {
                        GenerationState::Done
                    } else {
                        GenerationState::Decoding { step: 0 }
                    }
                }
                GenerationState::Decoding { step } => {
                    let next = self.step(ctx, &tokens, params, rng)?;
                    tokens.push(next);
                    if step + 1 == max_tokens {
                        GenerationState::Done
                    } else {
                        GenerationState::Decoding { step: step + 1 }
                    }
                }
                GenerationState::Done => break,
            };
        }

        let text = self.vocab.decode(&tokens)?;
        let elapsed = started.elapsed().as_secs_f64();
        let metrics = GenerationMetrics {
            elapsed_ms: elapsed * 1000.0,
            tokens_generated: max_tokens,
            tokens_per_sec: if elapsed > 0.0 {
                max_tokens as f64 / elapsed
            } else {
                0.0
            },
        };
        debug!(chars = text.chars().count(), "decoded generation");
        info!(
            tokens = metrics.tokens_generated,
            elapsed_ms = metrics.elapsed_ms,
            tokens_per_sec = metrics.tokens_per_sec,
            "generation finished"
        );

        Ok(Generation {
            text,
            tokens,
            metrics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use approx::assert_abs_diff_eq;
    use charformer_kernels::config::Device;

    fn abc() -> (LanguageModel, Vocabulary, ModelConfig) {
        let config = ModelConfig {
            vocab_size: 3,
            block_size: 4,
            n_embd: 8,
            n_head: 2,
            n_layer: 1,
            dropout: 0.0,
            device: Device::Cpu,
        };
        let vocab = Vocabulary::from_corpus("abc");
        let model = LanguageModel::zeros(config.clone()).unwrap();
        (model, vocab, config)
    }

    #[test]
    fn zero_weight_model_samples_uniformly() {
        let (model, vocab, _) = abc();
        let generator = Generator::new(&model, &vocab).unwrap();
        let ctx = ExecutionContext::cpu().unwrap();
        let params = SamplingParams::new(1.0, None).unwrap();
        let mut rng = fastrand::Rng::with_seed(42);

        let mut context = generator.initial_context(None).unwrap();
        for _ in 0..3 {
            let probs = generator.next_token_distribution(&ctx, &context, &params).unwrap();
            for &p in probs.iter() {
                assert_abs_diff_eq!(p, 1.0 / 3.0, epsilon = 1e-6);
            }
            context.push(sample_categorical(probs.view(), &mut rng));
        }
        assert_eq!(context.len(), 4);
        assert_eq!(context[0], 0);
    }

    #[test]
    fn output_length_is_initial_plus_max_tokens() {
        let (model, vocab, config) = abc();
        let generator = Generator::new(&model, &vocab).unwrap();
        let ctx = ExecutionContext::cpu().unwrap();
        let params = SamplingParams::new(0.8, Some(2)).unwrap();
        let mut rng = fastrand::Rng::with_seed(1);

        // runs well past block_size so the window has to slide
        let max_tokens = config.block_size * 3;
        let out = generator.generate(&ctx, None, &params, max_tokens, &mut rng).unwrap();
        assert_eq!(out.tokens.len(), 1 + max_tokens);
        assert_eq!(out.text.chars().count(), 1 + max_tokens);
        assert!(out.text.starts_with('a'));
        assert_eq!(out.metrics.tokens_generated, max_tokens);

        let prompted = generator
            .generate(&ctx, Some("cab"), &params, 5, &mut rng)
            .unwrap();
        assert_eq!(prompted.tokens.len(), 3 + 5);
        assert!(prompted.text.starts_with("cab"));
    }

    #[test]
    fn zero_max_tokens_returns_start_symbol() {
        let (model, vocab, _) = abc();
        let generator = Generator::new(&model, &vocab)
            .unwrap()
            .with_start_token(2)
            .unwrap();
        let ctx = ExecutionContext::cpu().unwrap();
        let mut rng = fastrand::Rng::with_seed(0);
        let out = generator
            .generate(&ctx, None, &SamplingParams::default(), 0, &mut rng)
            .unwrap();
        assert_eq!(out.text, "c");
        assert_eq!(out.tokens, vec![2]);
    }

    #[test]
    fn top_k_one_is_deterministic() {
        let (_, vocab, config) = abc();
        let model = LanguageModel::random(config, 17).unwrap();
        let generator = Generator::new(&model, &vocab).unwrap();
        let ctx = ExecutionContext::cpu().unwrap();
        let params = SamplingParams::new(3.0, Some(1)).unwrap();

        let a = generator
            .generate(&ctx, None, &params, 12, &mut fastrand::Rng::with_seed(1))
            .unwrap();
        let b = generator
            .generate(&ctx, None, &params, 12, &mut fastrand::Rng::with_seed(999))
            .unwrap();
        assert_eq!(a.tokens, b.tokens);
    }

    #[test]
    fn unknown_prompt_symbols_are_rejected() {
        let (model, vocab, _) = abc();
        let generator = Generator::new(&model, &vocab).unwrap();
        let ctx = ExecutionContext::cpu().unwrap();
        let err = generator
            .generate(&ctx, Some("abz"), &SamplingParams::default(), 3, &mut fastrand::Rng::new())
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_token");
        assert!(err.is_client_error());
    }

    #[test]
    fn vocabulary_must_match_model() {
        let (model, _, _) = abc();
        let vocab = Vocabulary::from_corpus("abcd");
        assert_eq!(
            Generator::new(&model, &vocab).err().map(|e| e.kind()),
            Some("config_mismatch")
        );
    }
}

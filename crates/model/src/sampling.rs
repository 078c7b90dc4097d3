//! Next-token sampling: temperature scaling, top-k truncation and categorical draws.

use crate::error::{ModelError, Result};
use charformer_kernels::utils::softmax_row_inplace;
use ndarray::{Array1, ArrayView1};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    temperature: f32,
    top_k: Option<usize>,
}

impl SamplingParams {
    /// Validates raw request values. `temperature` must be finite and positive,
    /// `top_k` (when given) must be positive.
    pub fn new(temperature: f32, top_k: Option<i64>) -> Result<Self> {
        if !temperature.is_finite() || temperature <= 0.0 {
            return Err(ModelError::sampling(
                "temperature",
                format!("must be a positive finite number, got {}", temperature),
            ));
        }
        let top_k = match top_k {
            Some(k) if k <= 0 => {
                return Err(ModelError::sampling(
                    "top_k",
                    format!("must be positive, got {}", k),
                ))
            }
            Some(k) => Some(usize::try_from(k).unwrap_or(usize::MAX)),
            None => None,
        };
        Ok(Self { temperature, top_k })
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    pub fn top_k(&self) -> Option<usize> {
        self.top_k
    }

    /// `top_k` clamped to the vocabulary size.
    pub fn effective_top_k(&self, vocab_size: usize) -> Option<usize> {
        self.top_k.map(|k| k.min(vocab_size))
    }

    /// Turns raw next-token logits into the sampling distribution:
    /// truncate to top-k, divide by temperature, softmax.
    ///
    /// Logits are shifted by their max before scaling, so the top entry stays
    /// at zero and tiny temperatures cannot overflow to `inf`.
    pub fn distribution(&self, logits: ArrayView1<'_, f32>) -> Array1<f32> {
        let mut scaled = logits.to_owned();
        if let Some(k) = self.effective_top_k(scaled.len()) {
            top_k_filter(&mut scaled, k);
        }
        let max = scaled.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        if max.is_finite() {
            scaled.mapv_inplace(|l| (l - max) / self.temperature);
        }
        softmax_row_inplace(scaled.view_mut());
        scaled
    }
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_k: None,
        }
    }
}

/// Keeps exactly `min(k, len)` largest logits and sets the rest to `-inf`.
/// Equal logits are ranked by ascending id.
pub fn top_k_filter(logits: &mut Array1<f32>, k: usize) {
    if k >= logits.len() {
        return;
    }
    let mut order: Vec<usize> = (0..logits.len()).collect();
    order.sort_by(|&a, &b| logits[b].total_cmp(&logits[a]));
    for &idx in &order[k..] {
        logits[idx] = f32::NEG_INFINITY;
    }
}

/// Draws one index from `probs` by inverse-CDF sampling. Indices with zero
/// probability are never returned.
pub fn sample_categorical(probs: ArrayView1<'_, f32>, rng: &mut fastrand::Rng) -> usize {
    let draw = rng.f32();
    let mut cumsum = 0.0;
    let mut last_supported = 0;
    for (idx, &prob) in probs.iter().enumerate() {
        if prob <= 0.0 {
            continue;
        }
        cumsum += prob;
        last_supported = idx;
        if draw < cumsum {
            return idx;
        }
    }
    last_supported
}

/// Shannon entropy in nats.
pub fn entropy(probs: ArrayView1<'_, f32>) -> f32 {
    probs
        .iter()
        .filter(|&&p| p > 0.0)
        .map(|&p| -p * p.ln())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::arr1;
    use proptest::prelude::*;

    #[test]
    fn rejects_non_positive_parameters() {
        assert!(SamplingParams::new(0.0, None).is_err());
        assert!(SamplingParams::new(-1.0, Some(5)).is_err());
        assert!(SamplingParams::new(f32::NAN, None).is_err());
        assert_eq!(
            SamplingParams::new(1.0, Some(0)).unwrap_err().kind(),
            "invalid_sampling_parameter"
        );
        assert!(SamplingParams::new(1.0, Some(-3)).is_err());
        assert!(SamplingParams::new(0.1, Some(40)).is_ok());
    }

    #[test]
    fn top_k_is_clamped_to_vocab() {
        let params = SamplingParams::new(1.0, Some(40)).unwrap();
        assert_eq!(params.effective_top_k(3), Some(3));
        let probs = params.distribution(arr1(&[1.0f32, 2.0, 3.0]).view());
        assert!(probs.iter().all(|&p| p > 0.0));
    }

    #[test]
    fn top_k_one_collapses_to_argmax() {
        let logits = arr1(&[0.3f32, 2.5, -1.0, 2.4]);
        for temperature in [0.05f32, 1.0, 25.0] {
            let params = SamplingParams::new(temperature, Some(1)).unwrap();
            let probs = params.distribution(logits.view());
            assert_abs_diff_eq!(probs[1], 1.0, epsilon = 1e-6);
            let mut rng = fastrand::Rng::with_seed(3);
            for _ in 0..20 {
                assert_eq!(sample_categorical(probs.view(), &mut rng), 1);
            }
        }
    }

    #[test]
    fn tiny_temperature_is_one_hot_without_nan() {
        let params = SamplingParams::new(1e-38, None).unwrap();
        let probs = params.distribution(arr1(&[1.0f32, 5.0, 3.0]).view());
        assert!(probs.iter().all(|p| !p.is_nan()));
        assert_eq!(probs.to_vec(), vec![0.0, 1.0, 0.0]);

        let tied = params.distribution(arr1(&[5.0f32, 5.0, 1.0]).view());
        assert!(tied.iter().all(|p| !p.is_nan()));
        assert_abs_diff_eq!(tied[0], 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(tied[1], 0.5, epsilon = 1e-6);
        assert_eq!(tied[2], 0.0);
    }

    #[test]
    fn top_k_tolerates_nan_logits() {
        let mut logits = arr1(&[1.0f32, f32::NAN, 3.0, 2.0, f32::NAN]);
        top_k_filter(&mut logits, 2);
        let kept = logits.iter().filter(|&&l| l != f32::NEG_INFINITY).count();
        assert_eq!(kept, 2);
    }

    #[test]
    fn ties_keep_exactly_k_candidates() {
        let mut logits = Array1::<f32>::zeros(5);
        top_k_filter(&mut logits, 2);
        assert_eq!(logits.to_vec()[..2], [0.0, 0.0]);
        assert!(logits.iter().skip(2).all(|&l| l == f32::NEG_INFINITY));
    }

    #[test]
    fn entropy_grows_with_temperature() {
        let logits = arr1(&[2.0f32, 1.0, 0.5, -0.5, -2.0]);
        let temps = [0.05f32, 0.5, 1.0, 2.0, 10.0, 100.0];
        let entropies: Vec<f32> = temps
            .iter()
            .map(|&t| {
                let params = SamplingParams::new(t, None).unwrap();
                entropy(params.distribution(logits.view()).view())
            })
            .collect();
        for pair in entropies.windows(2) {
            assert!(pair[1] > pair[0], "entropies not increasing: {:?}", entropies);
        }
        assert!(entropies[0] < 0.01);
        assert!((entropies[5] - 5.0f32.ln()).abs() < 0.01);
    }

    #[test]
    fn sampling_never_picks_masked_ids() {
        let probs = arr1(&[0.0f32, 0.5, 0.0, 0.5]);
        let mut rng = fastrand::Rng::with_seed(10);
        for _ in 0..200 {
            let idx = sample_categorical(probs.view(), &mut rng);
            assert!(idx == 1 || idx == 3);
        }
    }

    proptest! {
        #[test]
        fn top_k_support_size(
            logits in proptest::collection::vec(-4.0f32..4.0, 1..40),
            k in 1i64..60,
            temperature in 0.5f32..5.0,
        ) {
            let params = SamplingParams::new(temperature, Some(k)).unwrap();
            let probs = params.distribution(Array1::from(logits.clone()).view());
            let support = probs.iter().filter(|&&p| p > 0.0).count();
            prop_assert_eq!(support, (k as usize).min(logits.len()));
            prop_assert!((probs.sum() - 1.0).abs() < 1e-4);
        }
    }
}

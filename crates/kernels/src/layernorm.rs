//! Layer normalization kernels.

use anyhow::{ensure, Result};
use ndarray::{Array2, ArrayView1, ArrayView2, ArrayViewMut2, Axis};
use rayon::prelude::*;

pub const LAYER_NORM_EPS: f32 = 1e-5;

/// Normalizes every row to zero mean and unit (biased) variance, then applies
/// the elementwise affine `gamma * x + beta`.
pub fn layer_norm_inplace(
    mut data: ArrayViewMut2<'_, f32>,
    gamma: ArrayView1<'_, f32>,
    beta: ArrayView1<'_, f32>,
    epsilon: f32,
) -> Result<()> {
    let feature_dim = data.len_of(Axis(1));
    ensure!(
        gamma.len() == feature_dim,
        "gamma length {} must equal feature dimension {}",
        gamma.len(),
        feature_dim
    );
    ensure!(
        beta.len() == feature_dim,
        "beta length {} must equal feature dimension {}",
        beta.len(),
        feature_dim
    );

    data.axis_iter_mut(Axis(0))
        .into_par_iter()
        .for_each(|mut row| {
            let len = row.len() as f32;
            let mean = row.iter().sum::<f32>() / len;
            let var = row.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / len;
            let inv_std = 1.0 / (var + epsilon).sqrt();

            for ((value, g), b) in row.iter_mut().zip(gamma.iter()).zip(beta.iter()) {
                *value = (*value - mean) * inv_std * g + b;
            }
        });

    Ok(())
}

/// Non-mutating layer norm that returns a new array.
pub fn layer_norm(
    data: ArrayView2<'_, f32>,
    gamma: ArrayView1<'_, f32>,
    beta: ArrayView1<'_, f32>,
    epsilon: f32,
) -> Result<Array2<f32>> {
    let mut output = data.to_owned();
    layer_norm_inplace(output.view_mut(), gamma, beta, epsilon)?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array1;

    #[test]
    fn layer_norm_zero_mean_unit_var() {
        let data = Array2::from_shape_fn((4, 8), |(i, j)| ((i + 1) * (j + 1)) as f32 * 0.125);
        let gamma = Array1::from_elem(8, 1.0f32);
        let beta = Array1::from_elem(8, 0.0f32);

        let normed =
            layer_norm(data.view(), gamma.view(), beta.view(), LAYER_NORM_EPS).expect("layer norm");

        for row in normed.axis_iter(Axis(0)) {
            let len = row.len() as f32;
            let mean = row.iter().sum::<f32>() / len;
            let var = row.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / len;
            assert_abs_diff_eq!(mean, 0.0, epsilon = 1e-4);
            assert_abs_diff_eq!(var, 1.0, epsilon = 5e-4);
        }
    }

    #[test]
    fn layer_norm_applies_affine() {
        let data = Array2::from_shape_fn((2, 4), |(_, j)| j as f32);
        let gamma = Array1::from_elem(4, 0.0f32);
        let beta = Array1::from_elem(4, 2.5f32);
        let normed = layer_norm(data.view(), gamma.view(), beta.view(), LAYER_NORM_EPS).unwrap();
        assert!(normed.iter().all(|&x| x == 2.5));
    }

    #[test]
    fn layer_norm_rejects_wrong_gamma() {
        let data = Array2::<f32>::zeros((2, 4));
        let gamma = Array1::from_elem(3, 1.0f32);
        let beta = Array1::from_elem(4, 0.0f32);
        assert!(layer_norm(data.view(), gamma.view(), beta.view(), LAYER_NORM_EPS).is_err());
    }
}

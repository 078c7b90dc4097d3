//! Shared helpers for kernel implementations.

use crate::config::ActivationKind;
use anyhow::{bail, Result};
use ndarray::{Array2, ArrayView1, ArrayView2, ArrayViewMut1, ArrayViewMut2, Axis};
use rayon::prelude::*;

pub fn validate_matmul_inputs(lhs: &ArrayView2<'_, f32>, rhs: &ArrayView2<'_, f32>) -> Result<()> {
    if lhs.ncols() != rhs.nrows() {
        bail!(
            "matmul dimension mismatch: lhs {}x{} vs rhs {}x{}",
            lhs.nrows(),
            lhs.ncols(),
            rhs.nrows(),
            rhs.ncols()
        );
    }
    Ok(())
}

/// Adds a per-column bias (broadcast over rows) and applies the activation.
pub fn apply_bias_activation(
    mut output: Array2<f32>,
    bias: Option<&ArrayView1<'_, f32>>,
    activation: ActivationKind,
) -> Result<Array2<f32>> {
    if let Some(bias) = bias {
        if bias.len() != output.ncols() {
            bail!(
                "bias length {} incompatible with output {:?}",
                bias.len(),
                output.shape()
            );
        }
        output += bias;
    }

    match activation {
        ActivationKind::None => Ok(output),
        ActivationKind::Relu => {
            output.mapv_inplace(|x| x.max(0.0));
            Ok(output)
        }
    }
}

/// Numerically stable softmax over one vector.
///
/// Entries equal to `-inf` receive exactly zero probability. A vector whose
/// entries are all `-inf` has no support and is left as all zeros.
pub fn softmax_row_inplace(mut row: ArrayViewMut1<'_, f32>) {
    let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY {
        row.fill(0.0);
        return;
    }
    row -= max;
    row.mapv_inplace(|x| x.exp());
    let sum = row.sum();
    row /= sum.max(f32::EPSILON);
}

pub fn softmax_inplace(mut scores: ArrayViewMut2<'_, f32>) {
    scores
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .for_each(softmax_row_inplace);
}

/// Row-wise `log(sum(exp(x)))`, computed around the row max.
pub fn log_sum_exp(row: ArrayView1<'_, f32>) -> f32 {
    let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY {
        return f32::NEG_INFINITY;
    }
    max + row.iter().map(|&x| (x - max).exp()).sum::<f32>().ln()
}

/// Inverted dropout: zeroes each element with probability `p` and scales the
/// survivors by `1 / (1 - p)`. `uniform` yields samples in `[0, 1)`.
pub fn dropout_inplace(mut data: ArrayViewMut2<'_, f32>, p: f32, mut uniform: impl FnMut() -> f32) {
    if p <= 0.0 {
        return;
    }
    let scale = 1.0 / (1.0 - p);
    data.mapv_inplace(|x| if uniform() < p { 0.0 } else { x * scale });
}

//! Attention mechanism kernels.

use crate::utils::softmax_inplace;
use anyhow::{ensure, Result};
use ndarray::{Array2, ArrayView2};

/// Lower-triangular boolean mask of `size x size`; `(i, j)` is allowed iff `j <= i`.
pub fn causal_mask(size: usize) -> Array2<bool> {
    Array2::from_shape_fn((size, size), |(i, j)| j <= i)
}

/// Attention weights `softmax(scale * Q K^T)` with disallowed positions set to
/// `-inf` before normalization.
pub fn attention_weights(
    query: ArrayView2<'_, f32>,
    key: ArrayView2<'_, f32>,
    mask: Option<ArrayView2<'_, bool>>,
    scale: f32,
) -> Result<Array2<f32>> {
    ensure!(
        query.ncols() == key.ncols(),
        "query dim {} must match key dim {}",
        query.ncols(),
        key.ncols()
    );
    let mut scores = query.dot(&key.t());
    scores *= scale;

    if let Some(mask) = mask {
        ensure!(
            mask.dim() == scores.dim(),
            "mask shape {:?} incompatible with attention scores {:?}",
            mask.dim(),
            scores.dim()
        );
        scores.zip_mut_with(&mask, |score, &allowed| {
            if !allowed {
                *score = f32::NEG_INFINITY;
            }
        });
    }

    softmax_inplace(scores.view_mut());
    Ok(scores)
}

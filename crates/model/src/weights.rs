//! Parameter primitives and the load/visit plumbing shared by all layers.
//!
//! Layers construct themselves by pulling named tensors from a [`ParamSource`]
//! (a checkpoint or an [`Initializer`]) and expose them again through a
//! [`ParamVisitor`] for serialization. Names follow `prefix.component`.

use crate::context::ExecutionContext;
use crate::error::Result;
use charformer_kernels::config::ActivationKind;
use charformer_kernels::layernorm::{layer_norm, LAYER_NORM_EPS};
use ndarray::{Array1, Array2, ArrayView2};

pub trait ParamSource {
    fn matrix(&mut self, name: &str, rows: usize, cols: usize) -> Result<Array2<f32>>;

    /// `init` is the value a fresh initializer fills the vector with
    /// (ones for norm gains, zeros for biases).
    fn vector(&mut self, name: &str, len: usize, init: f32) -> Result<Array1<f32>>;
}

pub trait ParamVisitor {
    fn matrix(&mut self, name: &str, value: &Array2<f32>);
    fn vector(&mut self, name: &str, value: &Array1<f32>);
}

pub fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

/// Fresh parameters: all-zero, or small uniform noise from a seeded generator.
pub struct Initializer {
    rng: Option<fastrand::Rng>,
}

impl Initializer {
    pub fn zeros() -> Self {
        Self { rng: None }
    }

    pub fn random(seed: u64) -> Self {
        Self {
            rng: Some(fastrand::Rng::with_seed(seed)),
        }
    }
}

impl ParamSource for Initializer {
    fn matrix(&mut self, _name: &str, rows: usize, cols: usize) -> Result<Array2<f32>> {
        Ok(match self.rng.as_mut() {
            Some(rng) => Array2::from_shape_fn((rows, cols), |_| (rng.f32() - 0.5) * 0.04),
            None => Array2::zeros((rows, cols)),
        })
    }

    fn vector(&mut self, _name: &str, len: usize, init: f32) -> Result<Array1<f32>> {
        Ok(Array1::from_elem(len, init))
    }
}

/// Affine map `x @ weight + bias` with `weight` stored as (in_features, out_features).
#[derive(Debug, Clone)]
pub struct Linear {
    pub weight: Array2<f32>,
    pub bias: Option<Array1<f32>>,
}

impl Linear {
    pub fn load(
        source: &mut dyn ParamSource,
        prefix: &str,
        in_features: usize,
        out_features: usize,
        with_bias: bool,
    ) -> Result<Self> {
        let weight = source.matrix(&join(prefix, "weight"), in_features, out_features)?;
        let bias = if with_bias {
            Some(source.vector(&join(prefix, "bias"), out_features, 0.0)?)
        } else {
            None
        };
        Ok(Self { weight, bias })
    }

    pub fn visit(&self, prefix: &str, visitor: &mut dyn ParamVisitor) {
        visitor.matrix(&join(prefix, "weight"), &self.weight);
        if let Some(bias) = &self.bias {
            visitor.vector(&join(prefix, "bias"), bias);
        }
    }

    pub fn forward(
        &self,
        ctx: &ExecutionContext,
        x: ArrayView2<'_, f32>,
        activation: ActivationKind,
    ) -> Result<Array2<f32>> {
        ctx.linear(
            x,
            self.weight.view(),
            self.bias.as_ref().map(Array1::view),
            activation,
        )
    }
}

#[derive(Debug, Clone)]
pub struct LayerNorm {
    pub weight: Array1<f32>,
    pub bias: Array1<f32>,
}

impl LayerNorm {
    pub fn load(source: &mut dyn ParamSource, prefix: &str, width: usize) -> Result<Self> {
        Ok(Self {
            weight: source.vector(&join(prefix, "weight"), width, 1.0)?,
            bias: source.vector(&join(prefix, "bias"), width, 0.0)?,
        })
    }

    pub fn visit(&self, prefix: &str, visitor: &mut dyn ParamVisitor) {
        visitor.vector(&join(prefix, "weight"), &self.weight);
        visitor.vector(&join(prefix, "bias"), &self.bias);
    }

    pub fn forward(&self, x: ArrayView2<'_, f32>) -> Result<Array2<f32>> {
        Ok(layer_norm(
            x,
            self.weight.view(),
            self.bias.view(),
            LAYER_NORM_EPS,
        )?)
    }
}

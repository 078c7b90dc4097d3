//! Explicit execution context threaded through every forward call.
//!
//! Holds the matmul kernel chosen for the configured device and the forward
//! mode. Dropout is only applied in training mode; inference is deterministic
//! given the weights.

use crate::error::Result;
use charformer_kernels::config::{ActivationKind, Device};
use charformer_kernels::matmul::{DynMatmulKernel, MatmulInputs};
use charformer_kernels::registry::KernelRegistry;
use charformer_kernels::utils::dropout_inplace;
use ndarray::{Array2, ArrayView1, ArrayView2};
use std::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardMode {
    Inference,
    Training,
}

pub struct ExecutionContext {
    device: Device,
    kernel: DynMatmulKernel,
    mode: ForwardMode,
    dropout_rng: Mutex<fastrand::Rng>,
}

impl ExecutionContext {
    pub fn new(device: Device) -> Result<Self> {
        Self::from_registry(&KernelRegistry::with_default_matmul_kernels(), device)
    }

    pub fn from_registry(registry: &KernelRegistry, device: Device) -> Result<Self> {
        let kernel = registry.kernel_for_device(device)?;
        debug!(device = %device, kernel = kernel.name(), "execution context ready");
        Ok(Self {
            device,
            kernel,
            mode: ForwardMode::Inference,
            dropout_rng: Mutex::new(fastrand::Rng::with_seed(0)),
        })
    }

    pub fn cpu() -> Result<Self> {
        Self::new(Device::Cpu)
    }

    /// Switches to training mode; dropout masks are drawn from `seed`.
    pub fn with_training(mut self, seed: u64) -> Self {
        self.mode = ForwardMode::Training;
        self.dropout_rng = Mutex::new(fastrand::Rng::with_seed(seed));
        self
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn mode(&self) -> ForwardMode {
        self.mode
    }

    pub fn kernel_name(&self) -> &'static str {
        self.kernel.name()
    }

    /// `activation(lhs @ rhs + bias)` on the context's kernel.
    pub fn linear(
        &self,
        lhs: ArrayView2<'_, f32>,
        rhs: ArrayView2<'_, f32>,
        bias: Option<ArrayView1<'_, f32>>,
        activation: ActivationKind,
    ) -> Result<Array2<f32>> {
        let inputs = MatmulInputs::new(
            lhs.view(),
            rhs.view(),
            bias.as_ref().map(|b| b.view()),
            activation,
        );
        Ok(self.kernel.run(&inputs.problem(), &inputs)?)
    }

    /// Identity in inference mode.
    pub fn dropout(&self, data: &mut Array2<f32>, p: f32) {
        if self.mode == ForwardMode::Inference || p <= 0.0 {
            return;
        }
        let mut rng = self
            .dropout_rng
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        dropout_inplace(data.view_mut(), p, || rng.f32());
    }
}

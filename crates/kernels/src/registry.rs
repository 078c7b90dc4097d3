//! Kernel registry for lookup and discovery.

use crate::config::Device;
use crate::matmul::{DynMatmulKernel, MatmulKernel};
use anyhow::{anyhow, Result};
use std::sync::Arc;

#[derive(Default, Clone)]
pub struct KernelRegistry {
    matmul_kernels: Vec<DynMatmulKernel>,
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self {
            matmul_kernels: Vec::new(),
        }
    }

    pub fn with_default_matmul_kernels() -> Self {
        let mut registry = Self::new();
        registry.register_matmul_kernel(crate::matmul::ReferenceMatmul::new());
        registry.register_matmul_kernel(crate::matmul::ParallelMatmul::new());
        registry
    }

    pub fn register_matmul_kernel<K>(&mut self, kernel: K)
    where
        K: MatmulKernel + 'static,
    {
        self.matmul_kernels.push(Arc::new(kernel));
    }

    pub fn find_matmul_kernel(&self, name: &str) -> Option<DynMatmulKernel> {
        self.matmul_kernels
            .iter()
            .find(|kernel| kernel.name() == name)
            .map(Arc::clone)
    }

    pub fn kernel_for_device(&self, device: Device) -> Result<DynMatmulKernel> {
        self.find_matmul_kernel(device.kernel_name())
            .ok_or_else(|| anyhow!("no matmul kernel registered for device {}", device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_covers_every_device() {
        let registry = KernelRegistry::with_default_matmul_kernels();
        for device in [Device::Cpu, Device::CpuParallel] {
            let kernel = registry.kernel_for_device(device).expect("kernel");
            assert_eq!(kernel.name(), device.kernel_name());
        }
    }

    #[test]
    fn empty_registry_reports_missing_kernel() {
        assert!(KernelRegistry::new().kernel_for_device(Device::Cpu).is_err());
    }
}

//! Kernel configuration structures.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatmulProblem {
    pub m: usize,
    pub n: usize,
    pub k: usize,
}

impl MatmulProblem {
    pub fn new(m: usize, n: usize, k: usize) -> Self {
        Self { m, n, k }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ActivationKind {
    #[default]
    None,
    Relu,
}

/// Host execution target. Each device maps to one registered matmul kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Device {
    #[default]
    Cpu,
    CpuParallel,
}

impl Device {
    pub fn kernel_name(&self) -> &'static str {
        match self {
            Device::Cpu => "reference",
            Device::CpuParallel => "parallel",
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::CpuParallel => f.write_str("cpu-parallel"),
        }
    }
}

impl FromStr for Device {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "cpu" => Ok(Device::Cpu),
            "cpu-parallel" => Ok(Device::CpuParallel),
            other => anyhow::bail!("unknown device '{}' (expected cpu or cpu-parallel)", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_parses_and_displays() {
        for device in [Device::Cpu, Device::CpuParallel] {
            let parsed: Device = device.to_string().parse().expect("round trip");
            assert_eq!(parsed, device);
        }
        assert!("cuda".parse::<Device>().is_err());
    }

    #[test]
    fn device_maps_to_kernel() {
        assert_eq!(Device::default().kernel_name(), "reference");
        assert_eq!(Device::CpuParallel.kernel_name(), "parallel");
    }
}

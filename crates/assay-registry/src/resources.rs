//! Resource requirements shared by manifests and task specifications

use crate::error::RegistryError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const KI: u64 = 1024;
const MI: u64 = KI * 1024;
const GI: u64 = MI * 1024;
const TI: u64 = GI * 1024;

/// Memory amount in bytes, written as `512Mi`, `4Gi`, `1G` or plain bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MemorySize(pub u64);

impl MemorySize {
    /// From mebibytes
    #[inline]
    #[must_use]
    pub const fn mib(n: u64) -> Self {
        Self(n * MI)
    }

    /// From gibibytes
    #[inline]
    #[must_use]
    pub const fn gib(n: u64) -> Self {
        Self(n * GI)
    }

    /// Size in bytes
    #[inline]
    #[must_use]
    pub const fn bytes(self) -> u64 {
        self.0
    }
}

impl FromStr for MemorySize {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let split = s
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(s.len());
        let (number, unit) = s.split_at(split);
        let value: f64 = number
            .parse()
            .map_err(|_| RegistryError::InvalidManifest(format!("invalid memory size {s:?}")))?;

        let multiplier = match unit {
            "" => 1,
            "Ki" => KI,
            "Mi" => MI,
            "Gi" => GI,
            "Ti" => TI,
            "K" | "k" => 1_000,
            "M" => 1_000_000,
            "G" => 1_000_000_000,
            "T" => 1_000_000_000_000,
            other => {
                return Err(RegistryError::InvalidManifest(format!(
                    "unknown memory unit {other:?} in {s:?}"
                )))
            }
        };

        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss
        )]
        let bytes = (value * multiplier as f64).round() as u64;
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for MemorySize {
    type Error = RegistryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MemorySize> for String {
    fn from(value: MemorySize) -> Self {
        value.to_string()
    }
}

impl fmt::Display for MemorySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0;
        for (unit, size) in [("Ti", TI), ("Gi", GI), ("Mi", MI), ("Ki", KI)] {
            if bytes >= size && bytes % size == 0 {
                return write!(f, "{}{unit}", bytes / size);
            }
        }
        write!(f, "{bytes}")
    }
}

/// CPU, memory and accelerator requirements
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceRequirements {
    /// CPU units (cores)
    pub cpu: f64,
    /// Memory
    pub memory: MemorySize,
    /// Number of GPUs
    pub gpu: u32,
    /// Specific GPU model, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_type: Option<String>,
}

impl Default for ResourceRequirements {
    fn default() -> Self {
        Self {
            cpu: 1.0,
            memory: MemorySize::gib(1),
            gpu: 0,
            gpu_type: None,
        }
    }
}

impl ResourceRequirements {
    /// Requirements with CPU and memory only
    #[inline]
    #[must_use]
    pub fn new(cpu: f64, memory: MemorySize) -> Self {
        Self {
            cpu,
            memory,
            gpu: 0,
            gpu_type: None,
        }
    }

    /// With GPUs
    #[inline]
    #[must_use]
    pub fn with_gpu(mut self, count: u32, gpu_type: Option<String>) -> Self {
        self.gpu = count;
        self.gpu_type = gpu_type;
        self
    }

    /// Check that `self` (requested) is satisfiable by `declared`
    ///
    /// Every dimension must be less than or equal to the declared one, and a
    /// requested GPU type must match the declared type when one is declared.
    pub fn fits_within(&self, declared: &ResourceRequirements) -> Result<(), ResourceMismatch> {
        if self.cpu > declared.cpu {
            return Err(ResourceMismatch::Cpu {
                requested: self.cpu,
                declared: declared.cpu,
            });
        }
        if self.memory > declared.memory {
            return Err(ResourceMismatch::Memory {
                requested: self.memory,
                declared: declared.memory,
            });
        }
        if self.gpu > declared.gpu {
            return Err(ResourceMismatch::Gpu {
                requested: self.gpu,
                declared: declared.gpu,
            });
        }
        if let (Some(wanted), Some(offered)) = (&self.gpu_type, &declared.gpu_type) {
            if self.gpu > 0 && !wanted.eq_ignore_ascii_case(offered) {
                return Err(ResourceMismatch::GpuType {
                    requested: wanted.clone(),
                    declared: offered.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Which resource dimension is not satisfiable
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ResourceMismatch {
    #[error("requested {requested} CPU exceeds declared {declared}")]
    Cpu { requested: f64, declared: f64 },

    #[error("requested memory {requested} exceeds declared {declared}")]
    Memory {
        requested: MemorySize,
        declared: MemorySize,
    },

    #[error("requested {requested} GPU(s) exceeds declared {declared}")]
    Gpu { requested: u32, declared: u32 },

    #[error("requested GPU type {requested} but service declares {declared}")]
    GpuType {
        requested: String,
        declared: String,
    },
}

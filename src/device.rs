// Device selection for the synthesis networks
// Resolves a configured preference to a candle device, probing CUDA and Metal when built with them

use crate::error::{Result, SynthesisError};
use candle_core::Device;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use tracing::{info, warn};

static GPU_TYPE: OnceLock<GpuType> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GpuType {
    None,
    Cuda,
    Metal,
}

/// Where the model's parameters and activations live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    #[default]
    Cpu,
    Cuda(usize),
    Metal(usize),
    /// First available GPU, falling back to CPU
    Best,
}

impl FromStr for DevicePreference {
    type Err = SynthesisError;

    /// Accepts `cpu`, `best`, `cuda`, `cuda:<n>`, `metal`, `metal:<n>`
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_ascii_lowercase();
        let (name, ordinal) = match s.split_once(':') {
            Some((name, idx)) => {
                let idx = idx
                    .parse::<usize>()
                    .map_err(|_| SynthesisError::InvalidConfig(format!("bad device ordinal in {s:?}")))?;
                (name.to_string(), idx)
            }
            None => (s.clone(), 0),
        };
        match name.as_str() {
            "cpu" => Ok(DevicePreference::Cpu),
            "best" => Ok(DevicePreference::Best),
            "cuda" | "gpu" => Ok(DevicePreference::Cuda(ordinal)),
            "metal" => Ok(DevicePreference::Metal(ordinal)),
            _ => Err(SynthesisError::InvalidConfig(format!("unknown device {s:?}"))),
        }
    }
}

impl fmt::Display for DevicePreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DevicePreference::Cpu => write!(f, "cpu"),
            DevicePreference::Cuda(i) => write!(f, "cuda:{i}"),
            DevicePreference::Metal(i) => write!(f, "metal:{i}"),
            DevicePreference::Best => write!(f, "best"),
        }
    }
}

fn detect_gpu() -> GpuType {
    *GPU_TYPE.get_or_init(|| {
        #[cfg(feature = "cuda")]
        {
            if Device::new_cuda(0).is_ok() {
                return GpuType::Cuda;
            }
        }

        #[cfg(feature = "metal")]
        {
            if Device::new_metal(0).is_ok() {
                return GpuType::Metal;
            }
        }

        GpuType::None
    })
}

/// Check if GPU is available
pub fn is_gpu_available() -> bool {
    detect_gpu() != GpuType::None
}

/// Get the type of GPU available
pub fn get_gpu_type() -> GpuType {
    detect_gpu()
}

/// Resolve a preference to a device
///
/// Explicit GPU requests fail when the crate was built without the matching
/// feature; `Best` silently falls back to CPU.
pub fn resolve_device(preference: DevicePreference) -> Result<Device> {
    let device = match preference {
        DevicePreference::Cpu => Device::Cpu,
        DevicePreference::Cuda(ordinal) => Device::new_cuda(ordinal)?,
        DevicePreference::Metal(ordinal) => Device::new_metal(ordinal)?,
        DevicePreference::Best => match detect_gpu() {
            GpuType::Cuda => Device::new_cuda(0)?,
            GpuType::Metal => Device::new_metal(0)?,
            GpuType::None => {
                warn!("No GPU detected, using CPU");
                Device::Cpu
            }
        },
    };

    match &device {
        Device::Cpu => info!(preference = %preference, "Using CPU"),
        Device::Cuda(_) => info!(preference = %preference, "Using CUDA GPU"),
        Device::Metal(_) => info!(preference = %preference, "Using Metal GPU"),
    }
    Ok(device)
}

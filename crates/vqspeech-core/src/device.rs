//! Device selection for training and evaluation.

use candle_core::Device;
use tracing::{info, warn};

use crate::config::VqVaeConfig;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Cuda,
    Cpu,
}

impl DeviceKind {
    pub fn is_cpu(&self) -> bool {
        matches!(self, DeviceKind::Cpu)
    }

    pub fn is_cuda(&self) -> bool {
        matches!(self, DeviceKind::Cuda)
    }
}

/// Resolved device plus the GPU ids the configuration asked for. The ids are
/// kept on a CPU fallback and are empty only when CUDA is disabled.
#[derive(Debug, Clone)]
pub struct DeviceConfiguration {
    pub device: Device,
    pub kind: DeviceKind,
    pub gpu_ids: Vec<usize>,
}

impl DeviceConfiguration {
    pub fn cpu() -> Self {
        Self {
            device: Device::Cpu,
            kind: DeviceKind::Cpu,
            gpu_ids: Vec::new(),
        }
    }

    /// Honour `use_cuda` / `gpu_ids`, falling back to the CPU when no CUDA
    /// device can be opened. Only the first GPU id drives computation.
    pub fn load_from_configuration(config: &VqVaeConfig) -> Result<Self> {
        if !config.use_cuda {
            info!("CUDA disabled by configuration, using CPU");
            return Ok(Self::cpu());
        }

        let ordinal = config.gpu_ids.first().copied().unwrap_or(0);
        if config.gpu_ids.len() > 1 {
            warn!(
                "Multiple GPU ids configured ({:?}); running on GPU {}",
                config.gpu_ids, ordinal
            );
        }

        match Self::try_cuda(ordinal) {
            Some(device) => {
                info!("Using CUDA device {}", ordinal);
                Ok(Self {
                    device,
                    kind: DeviceKind::Cuda,
                    gpu_ids: config.gpu_ids.clone(),
                })
            }
            None => {
                warn!("CUDA device {} unavailable, falling back to CPU", ordinal);
                Ok(Self {
                    gpu_ids: config.gpu_ids.clone(),
                    ..Self::cpu()
                })
            }
        }
    }

    fn try_cuda(ordinal: usize) -> Option<Device> {
        let device = std::panic::catch_unwind(|| Device::cuda_if_available(ordinal))
            .ok()?
            .ok()?;
        device.is_cuda().then_some(device)
    }
}

use candle_core::{DType, Device};

use crate::error::PllavaError;

/// Upper bound on the CUDA ordinals probed for multi-GPU dispatch.
const MAX_CUDA_DEVICES: usize = 16;

/// Pick the accelerator and the dtype the model should run with.
///
/// Returns the first CUDA device with `BF16` weights when the crate is built with the
/// `cuda` feature and a device is present, the CPU with `F32` weights otherwise.
pub fn select_accelerator() -> (Device, DType) {
    #[cfg(feature = "cuda")]
    let (device, dtype) = match Device::cuda_if_available(0) {
        Ok(device) if device.is_cuda() => (device, DType::BF16),
        Ok(device) => {
            log::warn!("CUDA not available, defaulting to CPU");
            (device, DType::F32)
        }
        Err(e) => {
            log::warn!("CUDA not available, defaulting to CPU: {e:?}");
            (Device::Cpu, DType::F32)
        }
    };

    #[cfg(not(feature = "cuda"))]
    let (device, dtype) = (Device::Cpu, DType::F32);

    (device, dtype)
}

/// All CUDA devices that can be opened, in ordinal order.
pub fn cuda_devices() -> Vec<Device> {
    (0..MAX_CUDA_DEVICES)
        .map_while(|ordinal| Device::new_cuda(ordinal).ok())
        .collect()
}

/// Split `num_layers` consecutive layers over `num_devices` devices.
///
/// Every device receives either `n` or `n + 1` layers and the first devices take the
/// larger share. Returns the device index of every layer.
pub fn balanced_layer_assignment(num_layers: usize, num_devices: usize) -> Vec<usize> {
    if num_devices == 0 {
        return vec![];
    }
    let base = num_layers / num_devices;
    let extra = num_layers % num_devices;

    (0..num_devices)
        .flat_map(|device| {
            let count = base + usize::from(device < extra);
            std::iter::repeat_n(device, count)
        })
        .collect()
}

/// Placement of the model across several devices.
///
/// Decoder layers are spread evenly. The vision tower, the projector and the token
/// embeddings live on the first device, the final norm and the language head on the
/// last one.
#[derive(Debug, Clone)]
pub struct DeviceMap {
    devices: Vec<Device>,
    layers: Vec<usize>,
}

impl DeviceMap {
    /// Balance `num_layers` decoder layers over the given devices.
    pub fn balanced(num_layers: usize, devices: Vec<Device>) -> Result<Self, PllavaError> {
        if devices.is_empty() {
            return Err(PllavaError::NoAccelerator);
        }
        let layers = balanced_layer_assignment(num_layers, devices.len());
        Ok(Self { devices, layers })
    }

    /// Balance `num_layers` decoder layers over every visible CUDA device.
    pub fn cuda(num_layers: usize) -> Result<Self, PllavaError> {
        let devices = cuda_devices();
        log::info!(
            "Dispatching {num_layers} decoder layers over {} CUDA devices",
            devices.len()
        );
        Self::balanced(num_layers, devices)
    }

    /// Device holding the inputs: vision tower, projector and embeddings.
    pub fn first(&self) -> &Device {
        &self.devices[0]
    }

    /// Device holding the outputs: final norm and language head.
    pub fn last(&self) -> &Device {
        &self.devices[self.devices.len() - 1]
    }

    /// Device of the decoder layer `idx`.
    pub fn layer(&self, idx: usize) -> &Device {
        self.layers
            .get(idx)
            .map(|&d| &self.devices[d])
            .unwrap_or_else(|| self.last())
    }

    pub fn num_devices(&self) -> usize {
        self.devices.len()
    }
}

//! Compute device selection and transfers.

use candle_core::{DeviceLocation, Tensor};

pub type Device = candle_core::Device;

pub type DType = candle_core::DType;

/// Pick the device layers run on: CUDA, then Metal, then CPU.
///
/// `device_id` selects the accelerator ordinal and is ignored on CPU.
pub fn get_device(device_id: Option<usize>) -> crate::Result<Device> {
    let ordinal = device_id.unwrap_or(0);

    #[cfg(feature = "cuda")]
    {
        match Device::new_cuda(ordinal) {
            Ok(device) => {
                tracing::info!("Running layers on {}", device_label(&device));
                return Ok(device);
            }
            Err(e) => tracing::warn!("CUDA device {} unavailable: {}", ordinal, e),
        }
    }

    #[cfg(feature = "metal")]
    {
        match Device::new_metal(ordinal) {
            Ok(device) => {
                tracing::info!("Running layers on {}", device_label(&device));
                return Ok(device);
            }
            Err(e) => tracing::warn!("Metal device {} unavailable: {}", ordinal, e),
        }
    }

    #[cfg(not(any(feature = "cuda", feature = "metal")))]
    let _ = ordinal;

    tracing::info!("Running layers on cpu");
    Ok(Device::Cpu)
}

/// Short name such as `cpu` or `cuda:1`
pub fn device_label(device: &Device) -> String {
    match device.location() {
        DeviceLocation::Cpu => "cpu".to_string(),
        DeviceLocation::Cuda { gpu_id } => format!("cuda:{}", gpu_id),
        DeviceLocation::Metal { gpu_id } => format!("metal:{}", gpu_id),
    }
}

/// Whether moving a tensor between `a` and `b` is a no-op
pub fn same_device(a: &Device, b: &Device) -> bool {
    a.same_device(b)
}

/// Move batch rows to the compute device, skipping the copy when they
/// already live there
pub fn to_device(tensor: Tensor, device: &Device) -> crate::Result<Tensor> {
    if same_device(tensor.device(), device) {
        return Ok(tensor);
    }
    tracing::trace!(
        "Moving {:?} from {} to {}",
        tensor.dims(),
        device_label(tensor.device()),
        device_label(device)
    );
    Ok(tensor.to_device(device)?)
}

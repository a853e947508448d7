//! Utility modules for device selection and memory accounting.

mod device;
mod memory;

pub use device::{device_label, get_device, same_device, to_device, DType, Device};
pub use memory::{
    available_system_memory, format_bytes, trim_host_heap, DeviceMemory, HostMemory,
    MemoryContext, PinnedStaging, Reservation,
};

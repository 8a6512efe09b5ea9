//! CUDA-backed probe.
//!
//! Static capabilities and runtime memory come from the CUDA driver through
//! cudarc. The driver API has no utilization or process counters, so those
//! readings are reported as idle, and the management memory reading mirrors
//! the runtime one.

use crate::error::{Result, SelectError};
use crate::probe::{DeviceProbe, DeviceProperties, DeviceTelemetry};
use cudarc::driver::sys::CUdevice_attribute;
use cudarc::driver::{result, CudaDevice};
use std::sync::Arc;

/// Probe for NVIDIA accelerators through the CUDA driver API.
///
/// Telemetry carries memory readings only. Utilization is always reported
/// as `0.0` and the process list is always empty, so rankings built on this
/// probe order devices by free memory and core count, and
/// [`SelectionFlags::AVOID_SHARING`](crate::SelectionFlags::AVOID_SHARING)
/// never sees a competing process.
#[derive(Debug, Default)]
pub struct CudaProbe;

impl CudaProbe {
    /// Create a probe. The driver is initialised lazily.
    pub fn new() -> Self {
        Self
    }

    fn open(ordinal: usize) -> Result<Arc<CudaDevice>> {
        CudaDevice::new(ordinal)
            .map_err(|e| SelectError::probe(format!("failed to open device {ordinal}: {e}")))
    }

    fn attribute(device: &CudaDevice, attribute: CUdevice_attribute) -> Result<i32> {
        device
            .attribute(attribute)
            .map_err(|e| SelectError::probe(format!("attribute query failed: {e}")))
    }
}

impl DeviceProbe for CudaProbe {
    fn device_count(&self) -> Result<usize> {
        result::init().map_err(|e| SelectError::probe(format!("driver init failed: {e}")))?;
        let count = result::device::get_count()
            .map_err(|e| SelectError::probe(format!("device count query failed: {e}")))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    fn properties(&self, ordinal: usize) -> Result<DeviceProperties> {
        let device = Self::open(ordinal)?;
        let major = Self::attribute(
            &device,
            CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR,
        )?;
        let minor = Self::attribute(
            &device,
            CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR,
        )?;
        let multiprocessors =
            Self::attribute(&device, CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MULTIPROCESSOR_COUNT)?;
        let pci_bus = Self::attribute(&device, CUdevice_attribute::CU_DEVICE_ATTRIBUTE_PCI_BUS_ID)?;
        let tcc = Self::attribute(&device, CUdevice_attribute::CU_DEVICE_ATTRIBUTE_TCC_DRIVER)?;
        let name = device
            .name()
            .unwrap_or_else(|_| format!("CUDA Device {ordinal}"));

        Ok(DeviceProperties {
            ordinal,
            name,
            compute_capability: (major.max(0) as u32, minor.max(0) as u32),
            multiprocessor_count: multiprocessors.max(0) as u32,
            pci_bus_id: pci_bus.max(0) as u32,
            exclusive_compute_driver: tcc != 0,
        })
    }

    fn telemetry(&self, ordinal: usize) -> Result<DeviceTelemetry> {
        let device = Self::open(ordinal)?;
        device
            .bind_to_thread()
            .map_err(|e| SelectError::probe(format!("failed to bind device {ordinal}: {e}")))?;
        let (free, total) = result::mem_get_info()
            .map_err(|e| SelectError::probe(format!("memory query failed: {e}")))?;

        Ok(DeviceTelemetry {
            runtime_free_memory: free as u64,
            runtime_total_memory: total as u64,
            managed_free_memory: free as u64,
            managed_total_memory: total as u64,
            // no utilization or process counters in the driver API
            gpu_utilization: 0.0,
            memory_utilization: 0.0,
            processes: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telemetry_reports_memory_only() {
        let probe = CudaProbe::new();
        let Ok(count) = probe.device_count() else {
            return;
        };
        for ordinal in 0..count {
            let telemetry = probe.telemetry(ordinal).unwrap();
            assert!(telemetry.runtime_total_memory > 0);
            assert!(telemetry.runtime_free_memory <= telemetry.runtime_total_memory);
            assert_eq!(telemetry.managed_total_memory, telemetry.runtime_total_memory);
            assert_eq!(telemetry.gpu_utilization, 0.0);
            assert!(telemetry.processes.is_empty());
        }
    }
}

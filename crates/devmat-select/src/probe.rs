//! Hardware probing interface used by the selector.
//!
//! A [`DeviceProbe`] answers two kinds of questions: static capabilities,
//! asked once per device at initialization, and live telemetry, asked on
//! every ranking call.

use crate::error::{Result, SelectError};
use parking_lot::Mutex;

/// Static capabilities of one accelerator.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceProperties {
    /// Enumeration index
    pub ordinal: usize,
    /// Marketing name
    pub name: String,
    /// Compute capability (major, minor)
    pub compute_capability: (u32, u32),
    /// Number of streaming multiprocessors
    pub multiprocessor_count: u32,
    /// PCI bus id, used to match management records to runtime records
    pub pci_bus_id: u32,
    /// Device runs an exclusive-compute (TCC) driver
    pub exclusive_compute_driver: bool,
}

impl DeviceProperties {
    /// Total core count derived from the capability table.
    pub fn core_count(&self) -> u32 {
        let (major, minor) = self.compute_capability;
        cores_per_multiprocessor(major, minor) * self.multiprocessor_count
    }
}

/// Process running compute work on a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    /// Operating-system process id
    pub pid: u32,
    /// Executable path or name as reported by the driver
    pub name: String,
}

impl ProcessInfo {
    /// Create a process record.
    pub fn new(pid: u32, name: impl Into<String>) -> Self {
        Self {
            pid,
            name: name.into(),
        }
    }
}

/// Live readings for one accelerator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceTelemetry {
    /// Free bytes as seen by the compute runtime
    pub runtime_free_memory: u64,
    /// Total bytes as seen by the compute runtime
    pub runtime_total_memory: u64,
    /// Free bytes as seen by the management library
    pub managed_free_memory: u64,
    /// Total bytes as seen by the management library
    pub managed_total_memory: u64,
    /// Compute utilization, percent
    pub gpu_utilization: f64,
    /// Memory-controller utilization, percent
    pub memory_utilization: f64,
    /// Processes currently running compute work
    pub processes: Vec<ProcessInfo>,
}

/// Source of accelerator information.
pub trait DeviceProbe: Send + Sync {
    /// Number of installed accelerators.
    fn device_count(&self) -> Result<usize>;

    /// Static capabilities of one accelerator.
    fn properties(&self, ordinal: usize) -> Result<DeviceProperties>;

    /// Current telemetry of one accelerator.
    fn telemetry(&self, ordinal: usize) -> Result<DeviceTelemetry>;

    /// Id of the calling process, excluded from competitor detection.
    fn current_process_id(&self) -> u32 {
        std::process::id()
    }
}

/// Cores per multiprocessor for a compute capability.
///
/// Unknown capabilities fall back to the newest entry of the table.
pub fn cores_per_multiprocessor(major: u32, minor: u32) -> u32 {
    const TABLE: [((u32, u32), u32); 8] = [
        ((1, 0), 8),
        ((1, 1), 8),
        ((1, 2), 8),
        ((1, 3), 8),
        ((2, 0), 32),
        ((2, 1), 48),
        ((3, 0), 192),
        ((3, 5), 192),
    ];

    TABLE
        .iter()
        .find(|(capability, _)| *capability == (major, minor))
        .map_or(TABLE[TABLE.len() - 1].1, |(_, cores)| *cores)
}

/// Probe that reports no accelerators.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAccelerators;

impl DeviceProbe for NoAccelerators {
    fn device_count(&self) -> Result<usize> {
        Ok(0)
    }

    fn properties(&self, ordinal: usize) -> Result<DeviceProperties> {
        Err(SelectError::probe(format!("no accelerator with ordinal {ordinal}")))
    }

    fn telemetry(&self, ordinal: usize) -> Result<DeviceTelemetry> {
        Err(SelectError::probe(format!("no accelerator with ordinal {ordinal}")))
    }
}

/// Probe backed by fixed, caller-supplied readings.
///
/// Useful when placement must be decided from recorded data, and for
/// exercising the ranking without hardware. Telemetry can be updated
/// between ranking calls.
#[derive(Debug, Default)]
pub struct StaticProbe {
    devices: Mutex<Vec<(DeviceProperties, DeviceTelemetry)>>,
    process_id: u32,
}

impl StaticProbe {
    /// Create a probe with the given devices, in enumeration order.
    pub fn new(devices: Vec<(DeviceProperties, DeviceTelemetry)>) -> Self {
        Self {
            devices: Mutex::new(devices),
            process_id: std::process::id(),
        }
    }

    /// Override the id reported as the calling process.
    pub fn with_process_id(mut self, pid: u32) -> Self {
        self.process_id = pid;
        self
    }

    /// Replace the telemetry of one device.
    pub fn set_telemetry(&self, ordinal: usize, telemetry: DeviceTelemetry) -> Result<()> {
        let mut devices = self.devices.lock();
        let entry = devices
            .get_mut(ordinal)
            .ok_or_else(|| SelectError::probe(format!("no accelerator with ordinal {ordinal}")))?;
        entry.1 = telemetry;
        Ok(())
    }
}

impl DeviceProbe for StaticProbe {
    fn device_count(&self) -> Result<usize> {
        Ok(self.devices.lock().len())
    }

    fn properties(&self, ordinal: usize) -> Result<DeviceProperties> {
        self.devices
            .lock()
            .get(ordinal)
            .map(|(props, _)| props.clone())
            .ok_or_else(|| SelectError::probe(format!("no accelerator with ordinal {ordinal}")))
    }

    fn telemetry(&self, ordinal: usize) -> Result<DeviceTelemetry> {
        self.devices
            .lock()
            .get(ordinal)
            .map(|(_, telemetry)| telemetry.clone())
            .ok_or_else(|| SelectError::probe(format!("no accelerator with ordinal {ordinal}")))
    }

    fn current_process_id(&self) -> u32 {
        self.process_id
    }
}

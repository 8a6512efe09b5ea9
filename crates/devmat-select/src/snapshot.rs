//! Per-accelerator state tracked by the selector.

use crate::probe::{DeviceProperties, DeviceTelemetry, ProcessInfo};

/// Executable names of training tools that compete for an accelerator.
pub const KNOWN_COMPETITORS: [&str; 4] = ["cn.exe", "dbn.exe", "cn", "dbn"];

/// Snapshot of one accelerator: static data plus smoothed telemetry.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorSnapshot {
    /// Enumeration index
    pub device_id: usize,
    /// Total cores derived from the capability table
    pub core_count: u32,
    /// Free bytes as seen by the compute runtime
    pub runtime_free_memory: u64,
    /// Total bytes as seen by the compute runtime
    pub runtime_total_memory: u64,
    /// Free bytes as seen by the management library
    pub managed_free_memory: u64,
    /// Total bytes as seen by the management library
    pub managed_total_memory: u64,
    /// Smoothed compute utilization, percent
    pub gpu_utilization: f64,
    /// Smoothed memory-controller utilization, percent
    pub memory_utilization: f64,
    /// A known training tool is running on the device
    pub has_competing_process: bool,
    /// Device runs an exclusive-compute driver
    pub exclusive_compute_driver: bool,
    /// Number of utilization samples folded in so far
    pub samples: u32,
}

impl ProcessorSnapshot {
    /// Build the initial snapshot from static properties.
    pub fn from_properties(props: &DeviceProperties) -> Self {
        Self {
            device_id: props.ordinal,
            core_count: props.core_count(),
            runtime_free_memory: 0,
            runtime_total_memory: 0,
            managed_free_memory: 0,
            managed_total_memory: 0,
            gpu_utilization: 0.0,
            memory_utilization: 0.0,
            has_competing_process: false,
            exclusive_compute_driver: props.exclusive_compute_driver,
            samples: 0,
        }
    }

    /// Fold a new telemetry reading into the snapshot.
    ///
    /// Memory readings are replaced. Utilization is averaged with the
    /// newest sample weighted by two once a prior sample exists.
    pub fn record(&mut self, telemetry: &DeviceTelemetry, own_pid: u32) {
        self.runtime_free_memory = telemetry.runtime_free_memory;
        self.runtime_total_memory = telemetry.runtime_total_memory;
        self.managed_free_memory = telemetry.managed_free_memory;
        self.managed_total_memory = telemetry.managed_total_memory;

        if self.samples > 0 {
            let n = f64::from(self.samples);
            self.gpu_utilization =
                (self.gpu_utilization * n + telemetry.gpu_utilization * 2.0) / (n + 2.0);
            self.memory_utilization =
                (self.memory_utilization * n + telemetry.memory_utilization * 2.0) / (n + 2.0);
        } else {
            self.gpu_utilization = telemetry.gpu_utilization;
            self.memory_utilization = telemetry.memory_utilization;
        }
        self.samples = self.samples.saturating_add(1);

        // no process list: keep the previous verdict
        if !telemetry.processes.is_empty() {
            self.has_competing_process = has_competitor(&telemetry.processes, own_pid);
        }
    }

    /// Fraction of memory that is free, from the reading the driver model trusts.
    ///
    /// Shared-mode drivers let the operating system own all device memory from
    /// the management library's point of view, so only exclusive-compute
    /// devices use the management reading.
    pub fn free_memory_fraction(&self) -> f64 {
        let (free, total) = if self.exclusive_compute_driver {
            (self.managed_free_memory, self.managed_total_memory)
        } else {
            (self.runtime_free_memory, self.runtime_total_memory)
        };
        if total == 0 {
            0.0
        } else {
            free as f64 / total as f64
        }
    }
}

/// Executable basename, accepting both path separators.
fn basename(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// Whether any process other than `own_pid` is a known training tool.
pub fn has_competitor(processes: &[ProcessInfo], own_pid: u32) -> bool {
    processes
        .iter()
        .filter(|p| p.pid != own_pid)
        .map(|p| basename(&p.name))
        .filter(|name| !name.is_empty())
        .any(|name| KNOWN_COMPETITORS.contains(&name))
}

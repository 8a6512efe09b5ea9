//! Accelerators.
//!
//! A [`Device`] owns a bounded memory arena accounted with atomics, an
//! ordered launch queue, and settable activity readings that feed the
//! selector. Memory lives in host vectors unless the device is backed by a
//! CUDA context (`cuda` feature).

use crate::error::{MatrixError, Result};
use devmat_select::{DeviceId, DeviceProperties, DeviceTelemetry, ProcessInfo};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{trace, warn};

#[cfg(feature = "cuda")]
use cudarc::driver::CudaDevice;
#[cfg(feature = "cuda")]
use std::sync::Arc;

/// Default arena size of an emulated device (1 GiB).
pub const DEFAULT_DEVICE_MEMORY: usize = 1 << 30;

/// Static description of an emulated device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSpec {
    /// Marketing name
    pub name: String,
    /// Compute capability (major, minor)
    pub compute_capability: (u32, u32),
    /// Number of multiprocessors
    pub multiprocessor_count: u32,
    /// Arena size in bytes
    pub memory_bytes: usize,
    /// Runs an exclusive-compute driver
    pub exclusive_compute_driver: bool,
    /// PCI bus id; the enumeration ordinal when unset
    pub pci_bus_id: Option<u32>,
}

impl Default for DeviceSpec {
    fn default() -> Self {
        Self {
            name: "Emulated Device".to_string(),
            compute_capability: (7, 0),
            multiprocessor_count: 80,
            memory_bytes: DEFAULT_DEVICE_MEMORY,
            exclusive_compute_driver: false,
            pci_bus_id: None,
        }
    }
}

impl DeviceSpec {
    /// Start building a spec with the given name.
    pub fn builder(name: impl Into<String>) -> DeviceSpecBuilder {
        DeviceSpecBuilder {
            spec: Self {
                name: name.into(),
                ..Self::default()
            },
        }
    }
}

/// Builder for [`DeviceSpec`].
#[derive(Debug)]
pub struct DeviceSpecBuilder {
    spec: DeviceSpec,
}

impl DeviceSpecBuilder {
    /// Set the compute capability.
    pub fn compute_capability(mut self, major: u32, minor: u32) -> Self {
        self.spec.compute_capability = (major, minor);
        self
    }

    /// Set the multiprocessor count.
    pub fn multiprocessors(mut self, count: u32) -> Self {
        self.spec.multiprocessor_count = count;
        self
    }

    /// Set the arena size in bytes.
    pub fn memory(mut self, bytes: usize) -> Self {
        self.spec.memory_bytes = bytes;
        self
    }

    /// Mark the device as running an exclusive-compute driver.
    pub fn exclusive_driver(mut self, exclusive: bool) -> Self {
        self.spec.exclusive_compute_driver = exclusive;
        self
    }

    /// Set the PCI bus id.
    pub fn pci_bus_id(mut self, id: u32) -> Self {
        self.spec.pci_bus_id = Some(id);
        self
    }

    /// Build the spec.
    pub fn build(self) -> DeviceSpec {
        self.spec
    }
}

#[derive(Debug, Default)]
struct Activity {
    gpu_utilization: f64,
    memory_utilization: f64,
    processes: Vec<ProcessInfo>,
}

/// Where a device keeps its memory.
#[derive(Clone)]
pub(crate) enum Backend {
    /// Host vectors standing in for device memory.
    Emulated,
    /// A CUDA context.
    #[cfg(feature = "cuda")]
    Cuda(Arc<CudaDevice>),
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Emulated => f.write_str("Emulated"),
            #[cfg(feature = "cuda")]
            Self::Cuda(device) => write!(f, "Cuda({})", device.ordinal()),
        }
    }
}

/// A kernel waiting in a device queue.
pub(crate) struct PendingLaunch {
    kernel: &'static str,
    body: Box<dyn FnOnce() -> Result<()> + Send>,
}

impl PendingLaunch {
    pub(crate) fn new(kernel: &'static str, body: impl FnOnce() -> Result<()> + Send + 'static) -> Self {
        Self {
            kernel,
            body: Box::new(body),
        }
    }

    fn run(self) -> Result<()> {
        (self.body)()
    }
}

/// One accelerator.
pub struct Device {
    ordinal: usize,
    spec: DeviceSpec,
    backend: Backend,
    used: AtomicUsize,
    queue: Mutex<VecDeque<PendingLaunch>>,
    // Held while launches run, so queued work executes one at a time in
    // issue order.
    executor: Mutex<()>,
    activity: Mutex<Activity>,
}

impl Device {
    pub(crate) fn new(ordinal: usize, spec: DeviceSpec) -> Self {
        Self::with_backend(ordinal, spec, Backend::Emulated)
    }

    pub(crate) fn with_backend(ordinal: usize, spec: DeviceSpec, backend: Backend) -> Self {
        Self {
            ordinal,
            spec,
            backend,
            used: AtomicUsize::new(0),
            queue: Mutex::new(VecDeque::new()),
            executor: Mutex::new(()),
            activity: Mutex::new(Activity::default()),
        }
    }

    pub(crate) fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Whether memory lives in a CUDA context.
    pub fn is_cuda(&self) -> bool {
        !matches!(self.backend, Backend::Emulated)
    }

    /// Enumeration index.
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    /// Identifier of this device.
    pub fn id(&self) -> DeviceId {
        DeviceId::Gpu(self.ordinal)
    }

    /// Static description.
    pub fn spec(&self) -> &DeviceSpec {
        &self.spec
    }

    /// Arena size in bytes.
    pub fn memory_capacity(&self) -> usize {
        self.spec.memory_bytes
    }

    /// Bytes currently allocated.
    pub fn memory_in_use(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    /// Bytes still available.
    pub fn free_memory(&self) -> usize {
        self.memory_capacity().saturating_sub(self.memory_in_use())
    }

    /// Reserve `bytes` of the arena.
    pub(crate) fn reserve(&self, bytes: usize) -> Result<()> {
        let capacity = self.memory_capacity();
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|&total| total <= capacity)
            })
            .map(|_| ())
            .map_err(|used| {
                warn!(
                    device = %self.id(),
                    requested = bytes,
                    in_use = used,
                    capacity,
                    "device allocation failed"
                );
                MatrixError::AllocationFailed {
                    device: self.id(),
                    bytes,
                    reason: format!("out of memory ({used} of {capacity} bytes in use)"),
                }
            })
    }

    /// Return `bytes` to the arena.
    pub(crate) fn release(&self, bytes: usize) {
        // Saturating: a release never exceeds its reservation.
        let _ = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(bytes))
            });
    }

    /// Queue a launch behind every launch already issued to this device.
    pub(crate) fn enqueue(&self, launch: PendingLaunch) {
        self.queue.lock().push_back(launch);
    }

    /// Launches queued since the last synchronisation.
    pub fn pending_launches(&self) -> usize {
        self.queue.lock().len()
    }

    /// Run every queued launch in issue order.
    ///
    /// The first failing launch is reported as [`MatrixError::KernelFailed`]
    /// and the launches queued behind it are discarded.
    pub fn synchronize(&self) -> Result<()> {
        let _running = self.executor.lock();
        self.drain()?;
        #[cfg(feature = "cuda")]
        if let Backend::Cuda(device) = &self.backend {
            device
                .synchronize()
                .map_err(|e| MatrixError::kernel_failed("synchronize", e.to_string()))?;
        }
        Ok(())
    }

    /// Run `launch` after every queued launch, returning its own error
    /// unchanged.
    pub(crate) fn execute(&self, launch: PendingLaunch) -> Result<()> {
        let _running = self.executor.lock();
        self.drain()?;
        launch.run()
    }

    fn drain(&self) -> Result<()> {
        loop {
            // The queue lock is released before running so other threads
            // can keep enqueueing.
            let Some(launch) = self.queue.lock().pop_front() else {
                return Ok(());
            };
            let kernel = launch.kernel;
            trace!(kernel, device = %self.id(), "run queued launch");
            if let Err(e) = launch.run() {
                let discarded = std::mem::take(&mut *self.queue.lock()).len();
                warn!(kernel, device = %self.id(), discarded, error = %e, "queued launch failed");
                return Err(MatrixError::kernel_failed(kernel, e.to_string()));
            }
        }
    }

    /// Set the utilization readings reported to the selector, in percent.
    pub fn set_utilization(&self, gpu: f64, memory: f64) {
        let mut activity = self.activity.lock();
        activity.gpu_utilization = gpu;
        activity.memory_utilization = memory;
    }

    /// Set the compute processes reported to the selector.
    pub fn set_processes(&self, processes: Vec<ProcessInfo>) {
        self.activity.lock().processes = processes;
    }

    /// Static capabilities as seen by the selector.
    pub fn properties(&self) -> DeviceProperties {
        DeviceProperties {
            ordinal: self.ordinal,
            name: self.spec.name.clone(),
            compute_capability: self.spec.compute_capability,
            multiprocessor_count: self.spec.multiprocessor_count,
            pci_bus_id: self
                .spec
                .pci_bus_id
                .unwrap_or_else(|| u32::try_from(self.ordinal).unwrap_or(u32::MAX)),
            exclusive_compute_driver: self.spec.exclusive_compute_driver,
        }
    }

    /// Live readings as seen by the selector.
    ///
    /// Memory readings come from the arena accounting.
    pub fn telemetry(&self) -> DeviceTelemetry {
        let activity = self.activity.lock();
        let free = self.free_memory() as u64;
        let total = self.memory_capacity() as u64;
        DeviceTelemetry {
            runtime_free_memory: free,
            runtime_total_memory: total,
            managed_free_memory: free,
            managed_total_memory: total,
            gpu_utilization: activity.gpu_utilization,
            memory_utilization: activity.memory_utilization,
            processes: activity.processes.clone(),
        }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("ordinal", &self.ordinal)
            .field("name", &self.spec.name)
            .field("backend", &self.backend)
            .field("in_use", &self.memory_in_use())
            .field("pending", &self.pending_launches())
            .finish()
    }
}

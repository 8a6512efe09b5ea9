//! Device runtime.
//!
//! A [`DeviceRuntime`] is the explicit execution context every matrix is
//! bound to. It owns the set of accelerators, the ambient device used by
//! [`DeviceId::Managed`] matrices, the peer-access table, the BLAS handle
//! cache, and a selector ranking its own devices.
//!
//! # Example
//!
//! ```
//! use devmat_core::runtime::{DeviceRuntime, DeviceSpec};
//! use devmat_select::{DeviceId, SelectionFlags};
//!
//! let runtime = DeviceRuntime::new(vec![DeviceSpec::default(); 2]);
//! assert_eq!(runtime.device_count(), 2);
//! assert!(matches!(runtime.best_device(SelectionFlags::DEFAULT), DeviceId::Gpu(_)));
//! ```

pub mod blas;
#[cfg(feature = "cuda")]
pub mod cuda;
pub mod device;
pub mod memory;
pub mod stream;

pub use blas::{BlasHandle, BlasOperand, MAX_DEVICES};
pub use device::{Device, DeviceSpec, DeviceSpecBuilder, DEFAULT_DEVICE_MEMORY};
pub use memory::{BufferRead, DeviceBuffer, DeviceScalar};
pub use stream::Stream;

use crate::error::{MatrixError, Result};
use blas::HandleCache;
use devmat_select::{
    DeviceCount, DeviceId, DeviceProbe, DeviceProperties, DeviceSelector, DeviceTelemetry,
    SelectError, SelectionFlags,
};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// The accelerators of one runtime, exposed to the selector as a probe.
#[derive(Debug)]
struct DeviceSet {
    devices: Vec<Arc<Device>>,
}

impl DeviceSet {
    fn get(&self, ordinal: usize) -> Option<&Arc<Device>> {
        self.devices.get(ordinal)
    }
}

impl DeviceProbe for DeviceSet {
    fn device_count(&self) -> devmat_select::Result<usize> {
        Ok(self.devices.len())
    }

    fn properties(&self, ordinal: usize) -> devmat_select::Result<DeviceProperties> {
        self.get(ordinal)
            .map(|d| d.properties())
            .ok_or_else(|| SelectError::probe(format!("no device {ordinal}")))
    }

    fn telemetry(&self, ordinal: usize) -> devmat_select::Result<DeviceTelemetry> {
        self.get(ordinal)
            .map(|d| d.telemetry())
            .ok_or_else(|| SelectError::probe(format!("no device {ordinal}")))
    }
}

/// Execution context for device matrices.
pub struct DeviceRuntime {
    devices: Arc<DeviceSet>,
    ambient: AtomicUsize,
    peers: RwLock<HashSet<(usize, usize)>>,
    handles: HandleCache,
    selector: Mutex<DeviceSelector>,
}

impl DeviceRuntime {
    /// Create a runtime with one emulated device per spec, enumerated in
    /// order.
    pub fn new(specs: Vec<DeviceSpec>) -> Arc<Self> {
        let devices = specs
            .into_iter()
            .enumerate()
            .map(|(ordinal, spec)| Arc::new(Device::new(ordinal, spec)))
            .collect();
        Self::assemble(devices, None)
    }

    /// Create a runtime over every CUDA device of the machine.
    ///
    /// Device memory, transfers and BLAS go through the CUDA driver and
    /// cuBLAS. The selector ranks devices from live driver readings.
    #[cfg(feature = "cuda")]
    pub fn cuda() -> Result<Arc<Self>> {
        use cudarc::driver::CudaDevice;
        use devmat_select::cuda::CudaProbe;

        let probe = CudaProbe::new();
        let count = probe.device_count()?;
        let mut devices = Vec::with_capacity(count);
        for ordinal in 0..count {
            let properties = probe.properties(ordinal)?;
            let telemetry = probe.telemetry(ordinal)?;
            let context = CudaDevice::new(ordinal).map_err(|e| MatrixError::DeviceUnavailable {
                device: DeviceId::Gpu(ordinal),
                reason: e.to_string(),
            })?;
            let spec = DeviceSpec {
                name: properties.name,
                compute_capability: properties.compute_capability,
                multiprocessor_count: properties.multiprocessor_count,
                memory_bytes: usize::try_from(telemetry.runtime_total_memory).unwrap_or(usize::MAX),
                exclusive_compute_driver: properties.exclusive_compute_driver,
                pci_bus_id: Some(properties.pci_bus_id),
            };
            devices.push(Arc::new(Device::with_backend(ordinal, spec, device::Backend::Cuda(context))));
        }
        Ok(Self::assemble(devices, Some(Arc::new(probe))))
    }

    fn assemble(devices: Vec<Arc<Device>>, probe: Option<Arc<dyn DeviceProbe>>) -> Arc<Self> {
        let devices = Arc::new(DeviceSet { devices });
        let probe = probe.unwrap_or_else(|| Arc::clone(&devices) as Arc<dyn DeviceProbe>);
        debug!(devices = devices.devices.len(), "created device runtime");
        Arc::new(Self {
            devices,
            ambient: AtomicUsize::new(0),
            peers: RwLock::new(HashSet::new()),
            handles: HandleCache::new(),
            selector: Mutex::new(DeviceSelector::new(probe)),
        })
    }

    /// Create a runtime with `count` default devices.
    pub fn with_devices(count: usize) -> Arc<Self> {
        Self::new(vec![DeviceSpec::default(); count])
    }

    /// Number of accelerators.
    pub fn device_count(&self) -> usize {
        self.devices.devices.len()
    }

    /// All accelerators in enumeration order.
    pub fn devices(&self) -> &[Arc<Device>] {
        &self.devices.devices
    }

    /// Accelerator with the given ordinal.
    pub fn device(&self, ordinal: usize) -> Result<Arc<Device>> {
        self.devices
            .get(ordinal)
            .cloned()
            .ok_or_else(|| MatrixError::DeviceUnavailable {
                device: DeviceId::Gpu(ordinal),
                reason: format!("runtime has {} device(s)", self.device_count()),
            })
    }

    /// Accelerator named by `id`. `Managed` resolves to the ambient device.
    pub fn resolve(&self, id: DeviceId) -> Result<Arc<Device>> {
        match id {
            DeviceId::Gpu(ordinal) => self.device(ordinal),
            DeviceId::Managed => self.device(self.ambient_device()),
            DeviceId::Cpu => Err(MatrixError::DeviceUnavailable {
                device: id,
                reason: "device matrices live in accelerator memory".to_string(),
            }),
        }
    }

    /// Ordinal of the ambient device.
    pub fn ambient_device(&self) -> usize {
        self.ambient.load(Ordering::Acquire)
    }

    /// Make `ordinal` the ambient device.
    pub fn set_ambient_device(&self, ordinal: usize) -> Result<()> {
        self.device(ordinal)?;
        self.ambient.store(ordinal, Ordering::Release);
        Ok(())
    }

    /// Allow `from` to access `to` directly.
    ///
    /// Matrices migrating between devices with mutual access copy device
    /// to device instead of staging through pinned host memory.
    pub fn enable_peer_access(&self, from: usize, to: usize) -> Result<()> {
        self.device(from)?;
        self.device(to)?;
        self.peers.write().insert((from, to));
        debug!(from, to, "enabled peer access");
        Ok(())
    }

    /// Enable peer access in both directions.
    pub fn enable_mutual_peer_access(&self, a: usize, b: usize) -> Result<()> {
        self.enable_peer_access(a, b)?;
        self.enable_peer_access(b, a)
    }

    /// Whether `a` and `b` can access each other directly.
    pub fn has_mutual_peer_access(&self, a: usize, b: usize) -> bool {
        let peers = self.peers.read();
        peers.contains(&(a, b)) && peers.contains(&(b, a))
    }

    /// BLAS handle of `device`, created on first use.
    pub fn blas_handle(&self, device: &Device) -> Result<Arc<BlasHandle>> {
        self.handles.get(device)
    }

    /// Selector ranking this runtime's devices.
    pub fn selector(&self) -> MutexGuard<'_, DeviceSelector> {
        self.selector.lock()
    }

    /// Best device for `flags`; [`DeviceId::Cpu`] when there is none.
    pub fn best_device(&self, flags: SelectionFlags) -> DeviceId {
        self.selector().device(flags)
    }

    /// Best `count` devices for `flags`.
    pub fn best_devices(&self, count: DeviceCount, flags: SelectionFlags) -> Vec<DeviceId> {
        self.selector().devices(count, flags)
    }
}

impl fmt::Debug for DeviceRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRuntime")
            .field("devices", &self.device_count())
            .field("ambient", &self.ambient_device())
            .finish()
    }
}

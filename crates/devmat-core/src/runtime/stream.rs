//! Kernel launch path.
//!
//! Every kernel goes through the calling thread's [`Stream`]. Kernels that
//! write device memory are queued on their device and run in issue order.
//! When [`EngineConfig::sync_launches`](crate::config::EngineConfig) is set,
//! the launch drains the queue and runs before returning; otherwise it
//! returns at once and the work runs at the next
//! [`Device::synchronize`]. Kernels that read results back to the host
//! always wait for the queue first.

use super::device::{Device, PendingLaunch};
use crate::config::engine_config;
use crate::error::Result;
use std::cell::Cell;
use tracing::trace;

thread_local! {
    static LAUNCHES: Cell<u64> = const { Cell::new(0) };
}

/// The calling thread's launch path.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stream;

impl Stream {
    /// Stream of the calling thread.
    pub fn current() -> Self {
        Self
    }

    fn count(self, device: &Device, kernel: &'static str, len: usize) {
        trace!(kernel, device = %device.id(), len, "launch");
        LAUNCHES.with(|count| count.set(count.get() + 1));
    }

    /// Issue `kernel` over `len` elements on `device`.
    ///
    /// With asynchronous launches the body's error, if any, is reported by
    /// the next synchronisation of `device` as
    /// [`MatrixError::KernelFailed`](crate::error::MatrixError::KernelFailed).
    pub fn launch(
        self,
        device: &Device,
        kernel: &'static str,
        len: usize,
        body: impl FnOnce() -> Result<()> + Send + 'static,
    ) -> Result<()> {
        self.count(device, kernel, len);
        let launch = PendingLaunch::new(kernel, body);
        if engine_config().sync_launches {
            device.execute(launch)
        } else {
            device.enqueue(launch);
            Ok(())
        }
    }

    /// Run a kernel that reads results back to the host, once every launch
    /// queued on `device` has completed.
    pub fn launch_blocking<R>(
        self,
        device: &Device,
        kernel: &'static str,
        len: usize,
        body: impl FnOnce() -> Result<R>,
    ) -> Result<R> {
        self.count(device, kernel, len);
        device.synchronize()?;
        body()
    }

    /// Number of launches issued from the calling thread.
    pub fn launch_count(self) -> u64 {
        LAUNCHES.with(Cell::get)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::device::DeviceSpec;

    #[test]
    fn test_launch_counts_per_thread() {
        let device = Device::new(0, DeviceSpec::default());
        let stream = Stream::current();
        let before = stream.launch_count();
        stream.launch(&device, "noop", 0, || Ok(())).unwrap();
        let value = stream.launch_blocking(&device, "read", 0, || Ok(42)).unwrap();
        assert_eq!(value, 42);
        assert_eq!(stream.launch_count(), before + 2);

        let other = std::thread::spawn(|| Stream::current().launch_count())
            .join()
            .unwrap();
        assert_eq!(other, 0);
    }
}

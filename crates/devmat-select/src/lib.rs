//! Accelerator discovery and ranking for workload placement.
//!
//! This crate decides which accelerator(s) a workload should run on. It
//! enumerates devices through a [`DeviceProbe`], keeps a smoothed snapshot of
//! each device's utilization and memory, and ranks devices with a weighted
//! heuristic that can be tilted towards memory, speed, low utilization, or
//! avoiding devices already used by other training tools.
//!
//! # Modules
//!
//! - [`config`]: device directives read from configuration
//! - [`device_id`]: device identifiers and the CPU sentinel
//! - [`error`]: error types
//! - [`probe`]: hardware probe interface
//! - [`selector`]: the ranking algorithm
//! - [`snapshot`]: per-device smoothed state
//!
//! # Example
//!
//! ```
//! use devmat_select::prelude::*;
//!
//! let mut selector = DeviceSelector::cpu_only();
//! assert_eq!(selector.device(SelectionFlags::DEFAULT), CPU_DEVICE);
//! ```

pub mod config;
pub mod device_id;
pub mod error;
pub mod probe;
pub mod selector;
pub mod snapshot;

#[cfg(feature = "cuda")]
pub mod cuda;

pub use config::{
    resolve_device, resolve_device_from_config, resolve_devices_from_config, Configuration,
    DeviceDirective,
};
pub use device_id::{DeviceId, CPU_DEVICE};
pub use error::{Result, SelectError};
pub use probe::{DeviceProbe, DeviceProperties, DeviceTelemetry, NoAccelerators, ProcessInfo, StaticProbe};
pub use selector::{DeviceCount, DeviceSelector, ScoreWeights, SelectionFlags};
pub use snapshot::ProcessorSnapshot;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::{resolve_device_from_config, Configuration, DeviceDirective};
    pub use crate::device_id::{DeviceId, CPU_DEVICE};
    pub use crate::error::SelectError;
    pub use crate::probe::DeviceProbe;
    pub use crate::selector::{DeviceCount, DeviceSelector, SelectionFlags};
}

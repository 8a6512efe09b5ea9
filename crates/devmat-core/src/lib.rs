//! Dense matrices resident in accelerator memory.
//!
//! This crate provides [`DeviceMatrix`], a column-major matrix stored on one
//! device of a [`DeviceRuntime`], together with the element-wise, reduction,
//! BLAS, and neural-network kernels that operate on it. Device placement is
//! delegated to [`devmat_select`].
//!
//! # Key Concepts
//!
//! - **Runtime**: explicit context owning the devices, their memory
//!   accounting, peer access, and BLAS handles
//! - **Ownership**: a matrix either owns its buffer or is a view into a
//!   buffer owned elsewhere
//! - **Kernels**: slice-level routines launched through a per-thread
//!   [`Stream`](runtime::Stream)
//! - **Determinism**: reductions combine fixed blocks with a fixed tree
//!
//! # Modules
//!
//! - [`config`]: process-wide engine configuration
//! - [`error`]: error types
//! - [`kernels`]: element-wise, reduction, softmax, convolution and pooling kernels
//! - [`matrix`]: the device matrix and its operations
//! - [`runtime`]: emulated and CUDA accelerators, device memory, launch queues and BLAS
//! - [`types`]: element types and shared enums
//!
//! # Example
//!
//! ```
//! use devmat_core::prelude::*;
//!
//! # fn main() -> devmat_core::Result<()> {
//! let runtime = DeviceRuntime::with_devices(1);
//! let device = DeviceId::Gpu(0);
//! let a = DeviceMatrix::<f64>::from_slice(&runtime, device, 2, 2, &[1.0, 2.0, 3.0, 4.0], Layout::ColumnMajor)?;
//! let b = (&a * 2.0)?;
//! let c = (&a + &b)?;
//! assert_eq!(c.to_vec()?, vec![3.0, 6.0, 9.0, 12.0]);
//! assert_eq!(c.sum_of_elements()?, 30.0);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod kernels;
pub mod matrix;
pub mod runtime;
pub mod types;

pub use devmat_select;

// Re-export commonly used items at the crate root
pub use config::{engine_config, set_engine_config, set_sync_launches, EngineConfig, EngineConfigBuilder};
pub use error::{ErrorKind, MatrixError, Result};
pub use kernels::{ConvolutionGeometry, PoolingGeometry};
pub use matrix::{DeviceMatrix, Ownership, TransferPath};
pub use runtime::{DeviceBuffer, DeviceRuntime, DeviceScalar, DeviceSpec};
pub use types::{Axis, Layout, Scalar, StorageFormat};

/// Prelude module for convenient imports.
///
/// # Example
/// ```
/// use devmat_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::{engine_config, set_sync_launches, EngineConfig};
    pub use crate::error::{ErrorKind, MatrixError, Result};
    pub use crate::kernels::{ConvolutionGeometry, PoolingGeometry};
    pub use crate::matrix::{DeviceMatrix, Ownership, TransferPath};
    pub use crate::runtime::{DeviceBuffer, DeviceRuntime, DeviceScalar, DeviceSpec};
    pub use crate::types::{Layout, Scalar};
    pub use devmat_select::{DeviceCount, DeviceId, SelectionFlags, CPU_DEVICE};
}

//! # devmat
//!
//! Dense column-major matrices resident in accelerator memory, with BLAS,
//! element-wise, reduction and neural-network kernels, and a selector that
//! ranks accelerators for placement.
//!
//! This crate re-exports [`devmat_core`] and [`devmat_select`] under one
//! roof.
//!
//! ## Example
//!
//! ```
//! use devmat::prelude::*;
//!
//! # fn main() -> devmat::Result<()> {
//! let runtime = DeviceRuntime::with_devices(2);
//! let mut weights = DeviceMatrix::<f32>::on_best_device(&runtime, SelectionFlags::DEFAULT)?;
//! weights.resize(3, 2, false)?;
//! weights.set_value(0.5)?;
//! assert_eq!(weights.sum_of_elements()?, 3.0);
//! # Ok(())
//! # }
//! ```

pub use devmat_core::*;

/// Device scoring and ranking.
pub mod select {
    pub use devmat_select::*;
}

pub use nalgebra;

/// Everything needed for day-to-day use.
pub mod prelude {
    pub use devmat_core::prelude::*;
    pub use devmat_select::prelude::*;
}

//! Element types and shared enums.
//!
//! Device matrices are generic over a [`Scalar`], implemented for `f32` and
//! `f64`. The element width is part of the type, so kernels are compiled once
//! per precision instead of dispatching on a runtime tag.

use nalgebra::RealField;
use std::fmt::{Debug, Display};

/// Element types with a representation in CUDA device memory.
#[cfg(feature = "cuda")]
pub use crate::runtime::cuda::CudaElement as DeviceElement;

/// Element types with a representation in device memory.
#[cfg(not(feature = "cuda"))]
pub trait DeviceElement {}

#[cfg(not(feature = "cuda"))]
impl DeviceElement for f32 {}

#[cfg(not(feature = "cuda"))]
impl DeviceElement for f64 {}

/// Trait for element types stored in device memory (f32 or f64).
pub trait Scalar:
    nalgebra::Scalar + RealField + DeviceElement + Copy + Display + Debug + Default + Send + Sync + 'static
{
    /// Size of one element in bytes.
    const ELEMENT_WIDTH: usize;

    /// Name used in diagnostics.
    const TYPE_NAME: &'static str;

    /// Default relative tolerance for comparisons.
    const DEFAULT_TOLERANCE: Self;

    /// Convert from f64.
    fn of_f64(v: f64) -> Self {
        nalgebra::convert(v)
    }

    /// Widen to f64 for logging and accumulation in tests.
    fn as_f64(self) -> f64;

    /// Whether the value is NaN.
    fn is_nan(self) -> bool;

    /// Append the little-endian encoding.
    fn write_le(self, out: &mut Vec<u8>);

    /// Decode from exactly [`Self::ELEMENT_WIDTH`] little-endian bytes.
    fn read_le(bytes: &[u8]) -> Option<Self>;
}

impl Scalar for f32 {
    const ELEMENT_WIDTH: usize = 4;
    const TYPE_NAME: &'static str = "f32";
    const DEFAULT_TOLERANCE: Self = 1e-6;

    fn as_f64(self) -> f64 {
        f64::from(self)
    }

    fn is_nan(self) -> bool {
        f32::is_nan(self)
    }

    fn write_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }

    fn read_le(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(f32::from_le_bytes)
    }
}

impl Scalar for f64 {
    const ELEMENT_WIDTH: usize = 8;
    const TYPE_NAME: &'static str = "f64";
    const DEFAULT_TOLERANCE: Self = 1e-12;

    fn as_f64(self) -> f64 {
        self
    }

    fn is_nan(self) -> bool {
        f64::is_nan(self)
    }

    fn write_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }

    fn read_le(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(f64::from_le_bytes)
    }
}

/// Element order of host data handed to a constructor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Layout {
    /// Column `c` is contiguous; element (r, c) at `c * rows + r`.
    #[default]
    ColumnMajor,
    /// Row `r` is contiguous.
    RowMajor,
}

/// Storage format of a device matrix. Only dense storage exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum StorageFormat {
    /// Dense column-major storage.
    #[default]
    Dense,
}

/// Direction of a per-vector operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    /// One result per column.
    Columns,
    /// One result per row.
    Rows,
}

impl Axis {
    /// `Columns` when `col_wise` is true.
    pub fn from_col_wise(col_wise: bool) -> Self {
        if col_wise {
            Self::Columns
        } else {
            Self::Rows
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_widths() {
        assert_eq!(f32::ELEMENT_WIDTH, std::mem::size_of::<f32>());
        assert_eq!(f64::ELEMENT_WIDTH, std::mem::size_of::<f64>());
    }

    #[test]
    fn test_le_encoding() {
        let mut out = Vec::new();
        1.5f32.write_le(&mut out);
        (-2.25f64).write_le(&mut out);
        assert_eq!(out.len(), 12);
        assert_eq!(f32::read_le(&out[..4]), Some(1.5));
        assert_eq!(f64::read_le(&out[4..]), Some(-2.25));
        assert_eq!(f64::read_le(&out[..4]), None);
    }

    #[test]
    fn test_conversions() {
        assert_eq!(f32::of_f64(0.5), 0.5f32);
        assert_eq!(0.25f32.as_f64(), 0.25);
        assert!(Scalar::is_nan(f64::NAN));
        assert!(!Scalar::is_nan(1.0f32));
    }
}

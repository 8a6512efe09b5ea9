//! Error types for device matrix operations.
//!
//! Errors fall into four families, reported by [`MatrixError::kind`]:
//! precondition violations made by the caller, failures of the device or its
//! libraries, requests for paths that are not supported, and persistence
//! failures. A failed operation never leaves its operands half-modified.

use devmat_select::{DeviceId, SelectError};
use thiserror::Error;

/// Broad classification of a [`MatrixError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The caller passed arguments the operation cannot accept.
    Precondition,
    /// The device, its allocator, or a device library failed.
    Device,
    /// The requested path exists in the interface but is not supported.
    Unsupported,
    /// Reading or writing persisted matrices failed.
    Io,
    /// Device selection failed.
    Selection,
}

/// Errors that can occur during matrix operations.
#[derive(Debug, Error)]
pub enum MatrixError {
    /// Operation requires a non-empty matrix.
    #[error("{op}: matrix is empty")]
    EmptyMatrix {
        /// Name of the operation
        op: String,
    },

    /// Dimension mismatch between operands.
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Expected dimensions
        expected: String,
        /// Actual dimensions
        actual: String,
    },

    /// Index or range outside the matrix.
    #[error("Out of range: {reason}")]
    OutOfRange {
        /// Description of the violated bound
        reason: String,
    },

    /// Operation requires the matrix to own its storage.
    #[error("{op}: matrix does not own its buffer")]
    NotOwner {
        /// Name of the operation
        op: String,
    },

    /// Operands live on different devices.
    #[error("Operands live on different devices: {left} and {right}")]
    DeviceMismatch {
        /// Device of the receiving matrix
        left: DeviceId,
        /// Device of the other operand
        right: DeviceId,
    },

    /// Invalid argument value.
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// Description of the problem
        reason: String,
    },

    /// A view outlived the buffer it was taken from.
    #[error("View is no longer valid: its source buffer was freed or reallocated")]
    InvalidatedView,

    /// Device memory allocation failed.
    #[error("Allocation of {bytes} bytes on {device} failed: {reason}")]
    AllocationFailed {
        /// Target device
        device: DeviceId,
        /// Requested size
        bytes: usize,
        /// Diagnostic from the allocator
        reason: String,
    },

    /// A kernel could not run.
    #[error("Kernel '{kernel}' failed: {reason}")]
    KernelFailed {
        /// Kernel name
        kernel: String,
        /// Diagnostic
        reason: String,
    },

    /// A BLAS call failed.
    #[error("BLAS call '{call}' failed: {reason}")]
    BlasFailed {
        /// BLAS routine
        call: String,
        /// Diagnostic
        reason: String,
    },

    /// A memory transfer failed.
    #[error("Transfer from {from} to {to} failed: {reason}")]
    TransferFailed {
        /// Source device
        from: DeviceId,
        /// Destination device
        to: DeviceId,
        /// Diagnostic
        reason: String,
    },

    /// The device id does not name a usable device.
    #[error("Device {device} is not available: {reason}")]
    DeviceUnavailable {
        /// Requested device
        device: DeviceId,
        /// Diagnostic
        reason: String,
    },

    /// Feature or path not supported.
    #[error("Not supported: {feature}")]
    Unsupported {
        /// Name of the unsupported feature
        feature: String,
    },

    /// Persistence failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Device selection failure.
    #[error("Device selection failed: {0}")]
    Selection(#[from] SelectError),
}

impl MatrixError {
    /// Family this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::EmptyMatrix { .. }
            | Self::DimensionMismatch { .. }
            | Self::OutOfRange { .. }
            | Self::NotOwner { .. }
            | Self::DeviceMismatch { .. }
            | Self::InvalidArgument { .. }
            | Self::InvalidatedView => ErrorKind::Precondition,
            Self::AllocationFailed { .. }
            | Self::KernelFailed { .. }
            | Self::BlasFailed { .. }
            | Self::TransferFailed { .. }
            | Self::DeviceUnavailable { .. } => ErrorKind::Device,
            Self::Unsupported { .. } => ErrorKind::Unsupported,
            Self::Io(_) => ErrorKind::Io,
            Self::Selection(_) => ErrorKind::Selection,
        }
    }

    /// Create an EmptyMatrix error.
    pub fn empty<S: Into<String>>(op: S) -> Self {
        Self::EmptyMatrix { op: op.into() }
    }

    /// Create a DimensionMismatch error.
    pub fn dimension_mismatch<S1, S2>(expected: S1, actual: S2) -> Self
    where
        S1: std::fmt::Display,
        S2: std::fmt::Display,
    {
        Self::DimensionMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Create a DimensionMismatch error from two shapes.
    pub fn shape_mismatch(expected: (usize, usize), actual: (usize, usize)) -> Self {
        Self::dimension_mismatch(
            format!("{}x{}", expected.0, expected.1),
            format!("{}x{}", actual.0, actual.1),
        )
    }

    /// Create an OutOfRange error.
    pub fn out_of_range<S: Into<String>>(reason: S) -> Self {
        Self::OutOfRange {
            reason: reason.into(),
        }
    }

    /// Create a NotOwner error.
    pub fn not_owner<S: Into<String>>(op: S) -> Self {
        Self::NotOwner { op: op.into() }
    }

    /// Create an InvalidArgument error.
    pub fn invalid_argument<S: Into<String>>(reason: S) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Create an Unsupported error.
    pub fn unsupported<S: Into<String>>(feature: S) -> Self {
        Self::Unsupported {
            feature: feature.into(),
        }
    }

    /// Create a KernelFailed error.
    pub fn kernel_failed<S1: Into<String>, S2: Into<String>>(kernel: S1, reason: S2) -> Self {
        Self::KernelFailed {
            kernel: kernel.into(),
            reason: reason.into(),
        }
    }

    /// Create a BlasFailed error.
    pub fn blas_failed<S1: Into<String>, S2: Into<String>>(call: S1, reason: S2) -> Self {
        Self::BlasFailed {
            call: call.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for matrix operations.
pub type Result<T> = std::result::Result<T, MatrixError>;

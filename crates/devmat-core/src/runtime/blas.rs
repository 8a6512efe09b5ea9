//! Per-device BLAS handles.
//!
//! Handles are created lazily, once per device ordinal, and shared by every
//! matrix on that device. On emulated devices the routines run on
//! column-major slices; GEMM is backed by nalgebra and split across column
//! blocks with rayon. Handles of CUDA devices wrap a cuBLAS context and run
//! on device memory.

use super::device::{Backend, Device};
use super::memory::Region;
use crate::config::engine_config;
use crate::error::{MatrixError, Result};
use crate::types::Scalar;
use devmat_select::DeviceId;
use nalgebra::{DMatrixView, DMatrixViewMut};
use rayon::prelude::*;
use std::borrow::Cow;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::debug;

#[cfg(feature = "cuda")]
use super::cuda;
#[cfg(feature = "cuda")]
use cudarc::cublas::CudaBlas;

/// Largest number of devices with a cached handle.
pub const MAX_DEVICES: usize = 32;

/// Column-major operand of a BLAS call.
#[derive(Debug, Clone, Copy)]
pub struct BlasOperand<'a, T> {
    /// Column-major elements, at least `rows * cols` long
    pub data: &'a [T],
    /// Stored rows
    pub rows: usize,
    /// Stored columns
    pub cols: usize,
    /// Use the transpose of the stored matrix
    pub transposed: bool,
}

impl<'a, T: Scalar> BlasOperand<'a, T> {
    /// Operand over stored data.
    pub fn new(data: &'a [T], rows: usize, cols: usize, transposed: bool) -> Self {
        Self {
            data,
            rows,
            cols,
            transposed,
        }
    }

    /// Rows after the optional transpose.
    pub fn op_rows(&self) -> usize {
        if self.transposed {
            self.cols
        } else {
            self.rows
        }
    }

    /// Columns after the optional transpose.
    pub fn op_cols(&self) -> usize {
        if self.transposed {
            self.rows
        } else {
            self.cols
        }
    }

    #[inline]
    fn at(&self, i: usize, j: usize) -> T {
        if self.transposed {
            self.data[i * self.rows + j]
        } else {
            self.data[j * self.rows + i]
        }
    }

    fn stored(&self, call: &str) -> Result<&'a [T]> {
        let len = self.rows * self.cols;
        self.data
            .get(..len)
            .ok_or_else(|| MatrixError::blas_failed(call, format!("operand shorter than {len} elements")))
    }

    /// Materialise `op(self)` as a contiguous column-major slice.
    fn materialise(&self, call: &str) -> Result<Cow<'a, [T]>> {
        let stored = self.stored(call)?;
        if !self.transposed {
            return Ok(Cow::Borrowed(stored));
        }
        let (rows, cols) = (self.op_rows(), self.op_cols());
        let mut out = Vec::with_capacity(rows * cols);
        for j in 0..cols {
            for i in 0..rows {
                out.push(self.at(i, j));
            }
        }
        Ok(Cow::Owned(out))
    }
}

/// Operand of a BLAS call on device memory.
pub(crate) struct DeviceOperand<'a, T: Scalar> {
    pub(crate) region: &'a Region<T>,
    pub(crate) rows: usize,
    pub(crate) cols: usize,
    pub(crate) transposed: bool,
}

impl<'a, T: Scalar> DeviceOperand<'a, T> {
    pub(crate) fn new(region: &'a Region<T>, rows: usize, cols: usize, transposed: bool) -> Result<Self> {
        if region.len() < rows * cols {
            return Err(MatrixError::blas_failed(
                "operand",
                format!("region of {} elements cannot hold {rows}x{cols}", region.len()),
            ));
        }
        Ok(Self {
            region,
            rows,
            cols,
            transposed,
        })
    }

    pub(crate) fn op_rows(&self) -> usize {
        if self.transposed {
            self.cols
        } else {
            self.rows
        }
    }

    pub(crate) fn op_cols(&self) -> usize {
        if self.transposed {
            self.rows
        } else {
            self.cols
        }
    }
}

/// BLAS context bound to one device.
pub struct BlasHandle {
    device: DeviceId,
    calls: AtomicU64,
    #[cfg(feature = "cuda")]
    cublas: Option<CudaBlas>,
}

impl BlasHandle {
    fn new(device: DeviceId) -> Self {
        Self {
            device,
            calls: AtomicU64::new(0),
            #[cfg(feature = "cuda")]
            cublas: None,
        }
    }

    fn create(device: &Device) -> Result<Self> {
        match device.backend() {
            Backend::Emulated => Ok(Self::new(device.id())),
            #[cfg(feature = "cuda")]
            Backend::Cuda(cuda_device) => Ok(Self {
                cublas: Some(cuda::create_blas(cuda_device)?),
                ..Self::new(device.id())
            }),
        }
    }

    /// Device this handle is bound to.
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Number of routines issued through this handle.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// `c = alpha * op(a) * op(b) + beta * c`, with `c` column-major `m x n`.
    pub fn gemm<T: Scalar>(
        &self,
        alpha: T,
        a: BlasOperand<'_, T>,
        b: BlasOperand<'_, T>,
        beta: T,
        c: &mut [T],
    ) -> Result<()> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let (m, k, n) = (a.op_rows(), a.op_cols(), b.op_cols());
        if b.op_rows() != k {
            return Err(MatrixError::blas_failed(
                "gemm",
                format!("inner dimensions differ: {k} and {}", b.op_rows()),
            ));
        }
        if c.len() != m * n {
            return Err(MatrixError::blas_failed(
                "gemm",
                format!("output holds {} elements, expected {}", c.len(), m * n),
            ));
        }
        if beta == T::zero() {
            c.fill(T::zero());
        }
        if m == 0 || n == 0 {
            return Ok(());
        }
        if k == 0 {
            c.iter_mut().for_each(|x| *x *= beta);
            return Ok(());
        }

        let a_view = DMatrixView::from_slice(a.stored("gemm")?, a.rows, a.cols);
        let b_data = b.materialise("gemm")?;
        let block = |c_block: &mut [T], b_block: &[T]| {
            let cols = c_block.len() / m;
            let b_view = DMatrixView::from_slice(b_block, k, cols);
            let mut c_view = DMatrixViewMut::from_slice(c_block, m, cols);
            if a.transposed {
                c_view.gemm_tr(alpha, &a_view, &b_view, beta);
            } else {
                c_view.gemm(alpha, &a_view, &b_view, beta);
            }
        };

        if engine_config().should_parallelize(m * n * k) && n > 1 {
            let block_cols = n.div_ceil(rayon::current_num_threads()).max(1);
            c.par_chunks_mut(m * block_cols)
                .zip(b_data.par_chunks(k * block_cols))
                .for_each(|(c_block, b_block)| block(c_block, b_block));
        } else {
            block(c, &b_data);
        }
        Ok(())
    }

    /// `c = alpha * op(a) + beta * op(b)`, with `c` column-major.
    ///
    /// When `b` is `None` the second term is dropped.
    pub fn geam<T: Scalar>(
        &self,
        alpha: T,
        a: BlasOperand<'_, T>,
        beta: T,
        b: Option<BlasOperand<'_, T>>,
        c: &mut [T],
    ) -> Result<()> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let (m, n) = (a.op_rows(), a.op_cols());
        a.stored("geam")?;
        if let Some(b) = &b {
            b.stored("geam")?;
            if (b.op_rows(), b.op_cols()) != (m, n) {
                return Err(MatrixError::blas_failed(
                    "geam",
                    format!("operand shapes differ: {m}x{n} and {}x{}", b.op_rows(), b.op_cols()),
                ));
            }
        }
        if c.len() != m * n {
            return Err(MatrixError::blas_failed(
                "geam",
                format!("output holds {} elements, expected {}", c.len(), m * n),
            ));
        }
        if m == 0 || n == 0 {
            return Ok(());
        }

        let column = |(j, out): (usize, &mut [T])| {
            for (i, x) in out.iter_mut().enumerate() {
                let mut v = alpha * a.at(i, j);
                if let Some(b) = &b {
                    v += beta * b.at(i, j);
                }
                *x = v;
            }
        };
        if engine_config().should_parallelize(m * n) {
            c.par_chunks_mut(m).enumerate().for_each(column);
        } else {
            c.chunks_mut(m).enumerate().for_each(column);
        }
        Ok(())
    }
}

impl BlasHandle {
    /// `c = alpha * op(a) * op(b) + beta * c` over device regions. `c` must
    /// not share a buffer with `a` or `b`.
    pub(crate) fn gemm_regions<T: Scalar>(
        &self,
        alpha: T,
        a: &DeviceOperand<'_, T>,
        b: &DeviceOperand<'_, T>,
        beta: T,
        c: &Region<T>,
    ) -> Result<()> {
        #[cfg(feature = "cuda")]
        if let Some(cublas) = &self.cublas {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if a.op_cols() != b.op_rows() || c.len() != a.op_rows() * b.op_cols() {
                return Err(MatrixError::blas_failed("gemm", "operand shapes do not compose"));
            }
            return cuda::gemm(cublas, alpha, a, b, beta, c);
        }
        let (x, y) = (a.region.read()?, b.region.read()?);
        c.update(|dst| {
            self.gemm(
                alpha,
                BlasOperand::new(&x, a.rows, a.cols, a.transposed),
                BlasOperand::new(&y, b.rows, b.cols, b.transposed),
                beta,
                dst,
            )
        })?
    }

    /// `c = alpha * op(a) + beta * op(b)` over device regions. `c` must not
    /// share a buffer with `a` or `b`.
    pub(crate) fn geam_regions<T: Scalar>(
        &self,
        alpha: T,
        a: &DeviceOperand<'_, T>,
        beta: T,
        b: Option<&DeviceOperand<'_, T>>,
        c: &Region<T>,
    ) -> Result<()> {
        #[cfg(feature = "cuda")]
        if let Some(cublas) = &self.cublas {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if c.len() != a.op_rows() * a.op_cols() {
                return Err(MatrixError::blas_failed("geam", "output shape differs from op(a)"));
            }
            return cuda::geam(cublas, alpha, a, beta, b, c);
        }
        let x = a.region.read()?;
        let y = b.map(|b| b.region.read()).transpose()?;
        c.update(|dst| {
            let second = b
                .zip(y.as_deref())
                .map(|(b, data)| BlasOperand::new(data, b.rows, b.cols, b.transposed));
            self.geam(alpha, BlasOperand::new(&x, a.rows, a.cols, a.transposed), beta, second, dst)
        })?
    }
}

impl fmt::Debug for BlasHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_struct("BlasHandle");
        out.field("device", &self.device).field("calls", &self.call_count());
        #[cfg(feature = "cuda")]
        out.field("cublas", &self.cublas.is_some());
        out.finish()
    }
}

/// Lazily created handles, one slot per device ordinal.
#[derive(Debug)]
pub(crate) struct HandleCache {
    handles: [OnceLock<Arc<BlasHandle>>; MAX_DEVICES],
}

impl HandleCache {
    pub(crate) fn new() -> Self {
        Self {
            handles: std::array::from_fn(|_| OnceLock::new()),
        }
    }

    /// Handle for `device`, created on first use.
    pub(crate) fn get(&self, device: &Device) -> Result<Arc<BlasHandle>> {
        let slot = self.handles.get(device.ordinal()).ok_or_else(|| {
            MatrixError::blas_failed(
                "create",
                format!(
                    "device ordinal {} exceeds the handle cache of {MAX_DEVICES}",
                    device.ordinal()
                ),
            )
        })?;
        if let Some(handle) = slot.get() {
            return Ok(Arc::clone(handle));
        }
        let created = Arc::new(BlasHandle::create(device)?);
        let handle = slot.get_or_init(|| {
            debug!(device = %device.id(), "created BLAS handle");
            created
        });
        Ok(Arc::clone(handle))
    }
}

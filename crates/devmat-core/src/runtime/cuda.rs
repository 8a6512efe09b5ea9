//! CUDA backend: device memory, page-locked staging, and cuBLAS.
//!
//! Buffers hold a `CudaSlice` behind a lock. Kernels without a device
//! implementation run on the host over a downloaded copy of their range,
//! which is uploaded back afterwards. GEMM and GEAM run through cuBLAS on
//! the device, and copies between devices stay in device memory.

#![allow(unsafe_code)]

use super::blas::DeviceOperand;
use super::memory::Region;
use crate::error::{MatrixError, Result};
use crate::types::Scalar;
use cudarc::cublas::sys::{cublasHandle_t, cublasOperation_t, cublasStatus_t};
use cudarc::cublas::{sys, CublasError, CudaBlas, Gemm, GemmConfig};
use cudarc::driver::{
    result, CudaDevice, CudaSlice, DevicePtr, DevicePtrMut, DeviceRepr, DriverError, ValidAsZeroBits,
};
use parking_lot::RwLock;
use std::ops::Range;
use std::ptr::NonNull;
use std::sync::Arc;

/// Element types cuBLAS can operate on.
pub trait CudaElement: DeviceRepr + ValidAsZeroBits + Unpin {
    /// `c = alpha * op(a) * op(b) + beta * c`.
    ///
    /// # Safety
    ///
    /// The configuration must describe allocations at least as large as
    /// `a`, `b` and `c`.
    unsafe fn gemm<A: DevicePtr<Self>, B: DevicePtr<Self>, C: DevicePtrMut<Self>>(
        blas: &CudaBlas,
        cfg: GemmConfig<Self>,
        a: &A,
        b: &B,
        c: &mut C,
    ) -> std::result::Result<(), CublasError>;

    /// Raw `cublas?geam`.
    ///
    /// # Safety
    ///
    /// Pointers must address device allocations of the described shapes.
    #[allow(clippy::too_many_arguments)]
    unsafe fn geam(
        handle: cublasHandle_t,
        transa: cublasOperation_t,
        transb: cublasOperation_t,
        m: i32,
        n: i32,
        alpha: *const Self,
        a: *const Self,
        lda: i32,
        beta: *const Self,
        b: *const Self,
        ldb: i32,
        c: *mut Self,
        ldc: i32,
    ) -> cublasStatus_t;
}

macro_rules! impl_cuda_element {
    ($t:ty, $geam:ident) => {
        impl CudaElement for $t {
            unsafe fn gemm<A: DevicePtr<Self>, B: DevicePtr<Self>, C: DevicePtrMut<Self>>(
                blas: &CudaBlas,
                cfg: GemmConfig<Self>,
                a: &A,
                b: &B,
                c: &mut C,
            ) -> std::result::Result<(), CublasError> {
                <CudaBlas as Gemm<$t>>::gemm(blas, cfg, a, b, c)
            }

            unsafe fn geam(
                handle: cublasHandle_t,
                transa: cublasOperation_t,
                transb: cublasOperation_t,
                m: i32,
                n: i32,
                alpha: *const Self,
                a: *const Self,
                lda: i32,
                beta: *const Self,
                b: *const Self,
                ldb: i32,
                c: *mut Self,
                ldc: i32,
            ) -> cublasStatus_t {
                sys::$geam(handle, transa, transb, m, n, alpha, a, lda, beta, b, ldb, c, ldc)
            }
        }
    };
}

impl_cuda_element!(f32, cublasSgeam);
impl_cuda_element!(f64, cublasDgeam);

fn driver_failed(op: &str, e: &DriverError) -> MatrixError {
    MatrixError::kernel_failed(op, e.to_string())
}

/// A device allocation of a CUDA context.
pub(crate) struct DeviceMemory<T: Scalar> {
    device: Arc<CudaDevice>,
    slice: RwLock<CudaSlice<T>>,
}

impl<T: Scalar> DeviceMemory<T> {
    pub(crate) fn zeroed(device: &Arc<CudaDevice>, len: usize) -> std::result::Result<Self, DriverError> {
        let slice = device.alloc_zeros::<T>(len)?;
        Ok(Self {
            device: Arc::clone(device),
            slice: RwLock::new(slice),
        })
    }

    pub(crate) fn from_slice(device: &Arc<CudaDevice>, data: &[T]) -> std::result::Result<Self, DriverError> {
        let slice = device.htod_sync_copy(data)?;
        Ok(Self {
            device: Arc::clone(device),
            slice: RwLock::new(slice),
        })
    }

    pub(crate) fn download(&self, range: Range<usize>) -> Result<Vec<T>> {
        let slice = self.slice.read_recursive();
        self.device
            .dtoh_sync_copy(&slice.slice(range))
            .map_err(|e| driver_failed("download", &e))
    }

    pub(crate) fn download_into(&self, range: Range<usize>, dst: &mut [T]) -> Result<()> {
        let slice = self.slice.read_recursive();
        self.device
            .dtoh_sync_copy_into(&slice.slice(range), dst)
            .map_err(|e| driver_failed("download", &e))
    }

    pub(crate) fn update<R>(&self, range: Range<usize>, f: impl FnOnce(&mut [T]) -> R) -> Result<R> {
        let mut slice = self.slice.write();
        let mut host = self
            .device
            .dtoh_sync_copy(&slice.slice(range.clone()))
            .map_err(|e| driver_failed("download", &e))?;
        let out = f(&mut host);
        self.device
            .htod_sync_copy_into(&host, &mut slice.slice_mut(range))
            .map_err(|e| driver_failed("upload", &e))?;
        Ok(out)
    }

    /// Device-to-device copy; `src` may live in another context.
    pub(crate) fn copy_from(&self, dst_range: Range<usize>, src: &Self, src_range: Range<usize>) -> Result<()> {
        let from = src.slice.read_recursive();
        let mut to = self.slice.write();
        self.device
            .dtod_copy(&from.slice(src_range), &mut to.slice_mut(dst_range))
            .map_err(|e| driver_failed("dtod_copy", &e))
    }
}

/// Page-locked host allocation from the CUDA driver.
pub(crate) struct PageLocked<T> {
    ptr: NonNull<T>,
    len: usize,
}

impl<T: Scalar> PageLocked<T> {
    pub(crate) fn allocate(device: &Arc<CudaDevice>, len: usize) -> Result<Self> {
        if len == 0 {
            return Ok(Self {
                ptr: NonNull::dangling(),
                len,
            });
        }
        let bytes = len
            .checked_mul(T::ELEMENT_WIDTH)
            .ok_or_else(|| MatrixError::invalid_argument(format!("{len} staging elements overflow")))?;
        device
            .bind_to_thread()
            .map_err(|e| driver_failed("bind_to_thread", &e))?;
        // SAFETY: a context is current on this thread and `bytes` is non-zero.
        let raw = unsafe { result::malloc_host(bytes, 0) }.map_err(|e| driver_failed("malloc_host", &e))?;
        let ptr = NonNull::new(raw.cast::<T>())
            .ok_or_else(|| MatrixError::kernel_failed("malloc_host", "driver returned a null pointer"))?;
        // SAFETY: the allocation holds `len` elements and zero bits are a
        // valid `T`.
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, len) };
        Ok(Self { ptr, len })
    }

    pub(crate) fn as_slice(&self) -> &[T] {
        // SAFETY: `ptr` addresses `len` initialised elements owned by self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [T] {
        // SAFETY: as in `as_slice`, and `&mut self` makes the access unique.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl<T> Drop for PageLocked<T> {
    fn drop(&mut self) {
        if self.len > 0 {
            // SAFETY: allocated by `malloc_host` and freed exactly once.
            let _ = unsafe { result::free_host(self.ptr.as_ptr().cast()) };
        }
    }
}

fn operation(transposed: bool) -> cublasOperation_t {
    if transposed {
        cublasOperation_t::CUBLAS_OP_T
    } else {
        cublasOperation_t::CUBLAS_OP_N
    }
}

fn dim(call: &str, value: usize) -> Result<i32> {
    i32::try_from(value).map_err(|_| MatrixError::blas_failed(call, format!("dimension {value} exceeds i32")))
}

fn cuda_memory<'a, T: Scalar>(call: &str, region: &'a Region<T>) -> Result<&'a DeviceMemory<T>> {
    region
        .buffer
        .cuda_memory()
        .ok_or_else(|| MatrixError::blas_failed(call, "operand is not in CUDA memory"))
}

/// cuBLAS GEMM over device regions; `c` is `op(a).rows x op(b).cols`.
pub(crate) fn gemm<T: Scalar>(
    blas: &CudaBlas,
    alpha: T,
    a: &DeviceOperand<'_, T>,
    b: &DeviceOperand<'_, T>,
    beta: T,
    c: &Region<T>,
) -> Result<()> {
    let (m, k, n) = (a.op_rows(), a.op_cols(), b.op_cols());
    let cfg = GemmConfig {
        transa: operation(a.transposed),
        transb: operation(b.transposed),
        m: dim("gemm", m)?,
        n: dim("gemm", n)?,
        k: dim("gemm", k)?,
        alpha,
        lda: dim("gemm", a.rows.max(1))?,
        ldb: dim("gemm", b.rows.max(1))?,
        beta,
        ldc: dim("gemm", m.max(1))?,
    };
    let (x, y, z) = (cuda_memory("gemm", a.region)?, cuda_memory("gemm", b.region)?, cuda_memory("gemm", c)?);
    let (x_slice, y_slice) = (x.slice.read_recursive(), y.slice.read_recursive());
    let mut z_slice = z.slice.write();
    // SAFETY: every region was range-checked against its buffer and the
    // leading dimensions match the stored shapes.
    unsafe {
        <T as CudaElement>::gemm(
            blas,
            cfg,
            &x_slice.slice(a.region.range.clone()),
            &y_slice.slice(b.region.range.clone()),
            &mut z_slice.slice_mut(c.range.clone()),
        )
    }
    .map_err(|e| MatrixError::blas_failed("gemm", e.to_string()))
}

/// cuBLAS GEAM over device regions: `c = alpha * op(a) + beta * op(b)`.
pub(crate) fn geam<T: Scalar>(
    blas: &CudaBlas,
    alpha: T,
    a: &DeviceOperand<'_, T>,
    beta: T,
    b: Option<&DeviceOperand<'_, T>>,
    c: &Region<T>,
) -> Result<()> {
    let (m, n) = (a.op_rows(), a.op_cols());
    let x = cuda_memory("geam", a.region)?;
    let x_slice = x.slice.read_recursive();
    let x_view = x_slice.slice(a.region.range.clone());
    let a_ptr = *x_view.device_ptr() as *const T;

    // Without a second term, `a` stands in for `b` under a zero weight.
    let b_memory = b.map(|b| cuda_memory("geam", b.region)).transpose()?;
    let b_slice = b_memory.map(|memory| memory.slice.read_recursive());
    let (b_ptr, b_rows, b_op, b_weight) = match (b, &b_slice) {
        (Some(b), Some(slice)) => (
            *slice.slice(b.region.range.clone()).device_ptr() as *const T,
            b.rows,
            operation(b.transposed),
            beta,
        ),
        _ => (a_ptr, a.rows, operation(a.transposed), T::zero()),
    };

    let z = cuda_memory("geam", c)?;
    let mut z_slice = z.slice.write();
    let mut z_view = z_slice.slice_mut(c.range.clone());
    let c_ptr = *z_view.device_ptr_mut() as *mut T;
    // SAFETY: the pointers address range-checked regions that stay locked
    // for the duration of the call.
    let status = unsafe {
        <T as CudaElement>::geam(
            *blas.handle(),
            operation(a.transposed),
            b_op,
            dim("geam", m)?,
            dim("geam", n)?,
            &alpha,
            a_ptr,
            dim("geam", a.rows.max(1))?,
            &b_weight,
            b_ptr,
            dim("geam", b_rows.max(1))?,
            c_ptr,
            dim("geam", m.max(1))?,
        )
    };
    drop(b_slice);
    status
        .result()
        .map_err(|e| MatrixError::blas_failed("geam", e.to_string()))
}

/// cuBLAS context for `device`.
pub(crate) fn create_blas(device: &Arc<CudaDevice>) -> Result<CudaBlas> {
    CudaBlas::new(Arc::clone(device)).map_err(|e| MatrixError::blas_failed("create", e.to_string()))
}

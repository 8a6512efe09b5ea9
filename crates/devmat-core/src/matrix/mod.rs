//! Device-resident dense matrices.
//!
//! A [`DeviceMatrix`] is a column-major `rows x cols` matrix living in the
//! memory of one accelerator of a [`DeviceRuntime`]. Element `(r, c)` is at
//! offset `c * rows + r`.
//!
//! Storage is one of three states:
//!
//! - empty: no elements, no device memory;
//! - owned: the matrix holds a strong reference to its buffer and may resize
//!   or migrate it;
//! - view: the matrix borrows a range of a buffer owned elsewhere through a
//!   weak reference. A view never frees or reallocates, and fails with
//!   [`MatrixError::InvalidatedView`] once its source is gone.
//!
//! Every binary operation requires both operands on the same physical
//! device. Moving data between devices only happens through
//! [`DeviceMatrix::change_device`].
//!
//! Kernels that write a matrix are queued on its device in issue order; see
//! [`Stream`](crate::runtime::Stream). Host readbacks wait for the queue.

mod arith;
mod fill;
mod functions;
mod io;
mod linalg;
mod nn;
mod reduce;
mod slice;
mod transfer;

pub use io::{FORMAT_MAGIC, FORMAT_VERSION};
pub use transfer::TransferPath;

use crate::error::{MatrixError, Result};
use crate::runtime::memory::Region;
use crate::runtime::{Device, DeviceBuffer, DeviceRuntime, Stream};
use crate::types::{Layout, Scalar, StorageFormat};
use devmat_select::{DeviceId, SelectionFlags};
use nalgebra::DMatrix;
use std::fmt;
use std::sync::{Arc, Weak};

/// How [`DeviceMatrix::from_buffer`] holds externally provided memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Share ownership; the memory stays alive while the matrix does.
    Owned,
    /// Borrow; the matrix becomes a view that never frees the memory.
    Borrowed,
}

enum Storage<T: Scalar> {
    Empty,
    Owned(Arc<DeviceBuffer<T>>),
    View {
        source: Weak<DeviceBuffer<T>>,
        offset: usize,
    },
}

/// Input of a kernel: the operand's device storage, or a device-side
/// snapshot when the input aliases the matrix being written. `None` for an
/// empty operand.
pub(crate) struct Operand<T: Scalar>(Option<Region<T>>);

impl<T: Scalar> Operand<T> {
    /// Run `f` over the operand's elements.
    pub(crate) fn with<R>(&self, f: impl FnOnce(&[T]) -> R) -> Result<R> {
        match &self.0 {
            None => Ok(f(&[])),
            Some(region) => {
                let data = region.read()?;
                Ok(f(&data))
            }
        }
    }

    /// Device storage of a non-empty operand.
    pub(crate) fn region(&self, op: &str) -> Result<&Region<T>> {
        self.0.as_ref().ok_or_else(|| MatrixError::empty(op))
    }
}

/// Dense column-major matrix in device memory.
pub struct DeviceMatrix<T: Scalar> {
    runtime: Arc<DeviceRuntime>,
    device: DeviceId,
    rows: usize,
    cols: usize,
    storage: Storage<T>,
    format: StorageFormat,
    name: String,
}

impl<T: Scalar> DeviceMatrix<T> {
    /// Empty matrix bound to `device`.
    pub fn new(runtime: &Arc<DeviceRuntime>, device: DeviceId) -> Result<Self> {
        runtime.resolve(device)?;
        Ok(Self {
            runtime: Arc::clone(runtime),
            device,
            rows: 0,
            cols: 0,
            storage: Storage::Empty,
            format: StorageFormat::Dense,
            name: String::new(),
        })
    }

    /// Empty matrix on the best device of `runtime` for `flags`.
    pub fn on_best_device(runtime: &Arc<DeviceRuntime>, flags: SelectionFlags) -> Result<Self> {
        Self::new(runtime, runtime.best_device(flags))
    }

    /// Zero-filled `rows x cols` matrix.
    pub fn zeros(runtime: &Arc<DeviceRuntime>, device: DeviceId, rows: usize, cols: usize) -> Result<Self> {
        let mut matrix = Self::new(runtime, device)?;
        matrix.resize(rows, cols, true)?;
        Ok(matrix)
    }

    /// Copy host data into a new matrix.
    ///
    /// Only column-major input is supported.
    pub fn from_slice(
        runtime: &Arc<DeviceRuntime>,
        device: DeviceId,
        rows: usize,
        cols: usize,
        data: &[T],
        layout: Layout,
    ) -> Result<Self> {
        if layout == Layout::RowMajor {
            return Err(MatrixError::unsupported("row-major host input"));
        }
        let mut matrix = Self::new(runtime, device)?;
        matrix.upload(rows, cols, data.to_vec())?;
        Ok(matrix)
    }

    /// Copy a host matrix into a new device matrix.
    pub fn from_host(runtime: &Arc<DeviceRuntime>, device: DeviceId, host: &DMatrix<T>) -> Result<Self> {
        Self::from_slice(runtime, device, host.nrows(), host.ncols(), host.as_slice(), Layout::ColumnMajor)
    }

    /// Wrap externally provided device memory.
    pub fn from_buffer(
        runtime: &Arc<DeviceRuntime>,
        buffer: &Arc<DeviceBuffer<T>>,
        rows: usize,
        cols: usize,
        ownership: Ownership,
    ) -> Result<Self> {
        let device = buffer.device_id();
        let resident = runtime.resolve(device)?;
        if !Arc::ptr_eq(&resident, buffer.device()) {
            return Err(MatrixError::invalid_argument(format!(
                "buffer on {device} does not belong to this runtime"
            )));
        }
        let len = checked_len(rows, cols)?;
        if len > buffer.len() {
            return Err(MatrixError::out_of_range(format!(
                "{rows}x{cols} matrix does not fit a buffer of {} elements",
                buffer.len()
            )));
        }
        let storage = match (len, ownership) {
            (0, Ownership::Owned) => Storage::Empty,
            (_, Ownership::Owned) => Storage::Owned(Arc::clone(buffer)),
            (_, Ownership::Borrowed) => Storage::View {
                source: Arc::downgrade(buffer),
                offset: 0,
            },
        };
        Ok(Self {
            runtime: Arc::clone(runtime),
            device,
            rows,
            cols,
            storage,
            format: StorageFormat::Dense,
            name: String::new(),
        })
    }

    /// Deep copy into a separate allocation. Copying a view yields an owner.
    pub fn try_clone(&self) -> Result<Self> {
        let mut copy = Self::new(&self.runtime, self.device)?;
        copy.name.clone_from(&self.name);
        copy.upload(self.rows, self.cols, self.to_vec()?)?;
        Ok(copy)
    }

    /// Number of rows.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns.
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// `(rows, cols)`.
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    /// Whether the matrix has no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the matrix is a single column.
    pub fn is_column_vector(&self) -> bool {
        self.cols == 1
    }

    /// Whether the matrix is a single row.
    pub fn is_row_vector(&self) -> bool {
        self.rows == 1
    }

    /// Device the matrix is bound to.
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Runtime the matrix belongs to.
    pub fn runtime(&self) -> &Arc<DeviceRuntime> {
        &self.runtime
    }

    /// Elements of device memory held, at least `len()`.
    pub fn allocated_elements(&self) -> usize {
        match &self.storage {
            Storage::Empty => 0,
            Storage::Owned(buffer) => buffer.len(),
            Storage::View { .. } => self.len(),
        }
    }

    /// Whether the matrix owns its memory. Empty matrices own nothing and
    /// count as owners.
    pub fn owns_buffer(&self) -> bool {
        !matches!(self.storage, Storage::View { .. })
    }

    /// Whether the storage is still reachable. Always true for owners.
    pub fn is_valid(&self) -> bool {
        match &self.storage {
            Storage::View { source, .. } => source.strong_count() > 0,
            _ => true,
        }
    }

    /// Storage format.
    pub fn format(&self) -> StorageFormat {
        self.format
    }

    /// Name used when persisting the matrix.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Set the name.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Underlying buffer of an owning matrix.
    pub fn buffer(&self) -> Option<&Arc<DeviceBuffer<T>>> {
        match &self.storage {
            Storage::Owned(buffer) => Some(buffer),
            _ => None,
        }
    }

    /// Copy all elements to the host in column-major order, once queued
    /// launches on the device have completed.
    pub fn to_vec(&self) -> Result<Vec<T>> {
        self.read_with("copy_to_host", <[T]>::to_vec)
    }

    /// Copy the matrix to a host matrix.
    pub fn to_host(&self) -> Result<DMatrix<T>> {
        Ok(DMatrix::from_vec(self.rows, self.cols, self.to_vec()?))
    }

    // ---- storage plumbing shared by the operation modules ----

    /// Resolve storage; `None` for an empty matrix.
    pub(crate) fn region(&self) -> Result<Option<Region<T>>> {
        let len = self.len();
        match &self.storage {
            Storage::Empty => Ok(None),
            _ if len == 0 => Ok(None),
            Storage::Owned(buffer) => Ok(Some(Region {
                buffer: Arc::clone(buffer),
                range: 0..len,
            })),
            Storage::View { source, offset } => {
                let buffer = source.upgrade().ok_or(MatrixError::InvalidatedView)?;
                Ok(Some(Region {
                    buffer,
                    range: *offset..*offset + len,
                }))
            }
        }
    }

    fn buffer_ptr(&self) -> Option<*const DeviceBuffer<T>> {
        match &self.storage {
            Storage::Empty => None,
            Storage::Owned(buffer) => Some(Arc::as_ptr(buffer)),
            Storage::View { source, .. } => Some(source.as_ptr()),
        }
    }

    /// Whether `self` and `other` address the same buffer.
    pub(crate) fn shares_buffer_with(&self, other: &Self) -> bool {
        matches!((self.buffer_ptr(), other.buffer_ptr()), (Some(a), Some(b)) if std::ptr::eq(a, b))
    }

    /// Kernel input for writing into `receiver`.
    ///
    /// When `self` shares a buffer with `receiver`, the input is copied to a
    /// fresh device buffer by a launch queued ahead of the write.
    pub(crate) fn operand_for(&self, receiver: &Self) -> Result<Operand<T>> {
        let Some(region) = self.region()? else {
            return Ok(Operand(None));
        };
        if !self.shares_buffer_with(receiver) {
            return Ok(Operand(Some(region)));
        }
        let device = Arc::clone(region.device());
        let snapshot = Region::whole(DeviceBuffer::zeroed(&device, region.len())?);
        let target = Region::whole(Arc::clone(&snapshot.buffer));
        Stream::current().launch(&device, "snapshot", region.len(), move || target.copy_from(&region))?;
        Ok(Operand(Some(snapshot)))
    }

    /// Run a read-only kernel over the elements and return its result to
    /// the host.
    pub(crate) fn read_with<R>(&self, kernel: &'static str, f: impl FnOnce(&[T]) -> R) -> Result<R> {
        match self.region()? {
            None => Ok(f(&[])),
            Some(region) => Stream::current().launch_blocking(region.device(), kernel, region.len(), || {
                let data = region.read()?;
                Ok(f(&data))
            }),
        }
    }

    /// Queue a kernel that writes the elements.
    pub(crate) fn write_with<F>(&mut self, kernel: &'static str, f: F) -> Result<()>
    where
        F: FnOnce(&mut [T]) -> Result<()> + Send + 'static,
    {
        self.write_region(kernel, move |region| region.update(f)?)
    }

    /// Queue a kernel that writes the matrix's device storage directly.
    pub(crate) fn write_region<F>(&mut self, kernel: &'static str, f: F) -> Result<()>
    where
        F: FnOnce(&Region<T>) -> Result<()> + Send + 'static,
    {
        match self.region()? {
            None => Ok(()),
            Some(region) => {
                let device = Arc::clone(region.device());
                Stream::current().launch(&device, kernel, region.len(), move || f(&region))
            }
        }
    }

    /// The physical device holding the matrix. `Managed` matrices resolve
    /// through their buffer, falling back to the ambient device when empty.
    pub(crate) fn physical_device(&self) -> Result<Arc<Device>> {
        match self.device {
            DeviceId::Managed => match self.region()? {
                Some(region) => Ok(Arc::clone(region.device())),
                None => self.runtime.resolve(self.device),
            },
            id => self.runtime.resolve(id),
        }
    }

    /// Fail unless `other` lives on the same physical device of the same
    /// runtime.
    pub(crate) fn require_same_device(&self, other: &Self) -> Result<()> {
        if !Arc::ptr_eq(&self.runtime, &other.runtime) {
            return Err(MatrixError::DeviceMismatch {
                left: self.device,
                right: other.device,
            });
        }
        if self.device == other.device && self.device != DeviceId::Managed {
            return Ok(());
        }
        let (left, right) = (self.physical_device()?, other.physical_device()?);
        if !Arc::ptr_eq(&left, &right) {
            return Err(MatrixError::DeviceMismatch {
                left: left.id(),
                right: right.id(),
            });
        }
        Ok(())
    }

    /// Fail on an empty matrix.
    pub(crate) fn require_non_empty(&self, op: &str) -> Result<()> {
        if self.is_empty() {
            return Err(MatrixError::empty(op));
        }
        Ok(())
    }

    /// Fail unless `other` has the same shape.
    pub(crate) fn require_same_shape(&self, other: &Self) -> Result<()> {
        if self.shape() != other.shape() {
            return Err(MatrixError::shape_mismatch(self.shape(), other.shape()));
        }
        Ok(())
    }

    /// Replace the contents with host data of the given shape.
    pub(crate) fn upload(&mut self, rows: usize, cols: usize, data: Vec<T>) -> Result<()> {
        let len = checked_len(rows, cols)?;
        if data.len() != len {
            return Err(MatrixError::dimension_mismatch(
                format!("{len} elements for {rows}x{cols}"),
                data.len(),
            ));
        }
        if self.shape() == (rows, cols) && !self.is_empty() {
            return self.write_with("upload", move |dst| {
                dst.copy_from_slice(&data);
                Ok(())
            });
        }
        if !self.owns_buffer() {
            return Err(MatrixError::not_owner("upload"));
        }
        self.storage = if len == 0 {
            Storage::Empty
        } else {
            let device = self.runtime.resolve(self.device)?;
            Storage::Owned(DeviceBuffer::from_vec(&device, data)?)
        };
        self.rows = rows;
        self.cols = cols;
        Ok(())
    }
}

pub(crate) fn checked_len(rows: usize, cols: usize) -> Result<usize> {
    rows.checked_mul(cols)
        .ok_or_else(|| MatrixError::invalid_argument(format!("{rows}x{cols} overflows the element count")))
}

impl<T: Scalar> fmt::Debug for DeviceMatrix<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceMatrix")
            .field("type", &T::TYPE_NAME)
            .field("device", &self.device)
            .field("rows", &self.rows)
            .field("cols", &self.cols)
            .field("owns_buffer", &self.owns_buffer())
            .field("name", &self.name)
            .finish()
    }
}

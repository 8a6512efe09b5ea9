//! Device memory: buffers, host staging, and single device-resident values.
//!
//! Buffers of emulated devices are host vectors behind a lock. Buffers of
//! CUDA devices hold a `CudaSlice`; host-side kernels see them through a
//! download on read and a download, update, upload cycle on write.

use super::device::{Backend, Device};
use crate::error::{MatrixError, Result};
use crate::types::Scalar;
use devmat_select::DeviceId;
use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard};
use std::fmt;
use std::ops::{Deref, Range};
use std::sync::{Arc, Weak};

#[cfg(feature = "cuda")]
use super::cuda::{DeviceMemory, PageLocked};

enum Memory<T: Scalar> {
    Host(RwLock<Vec<T>>),
    #[cfg(feature = "cuda")]
    Cuda(DeviceMemory<T>),
}

/// Contiguous allocation in a device arena.
///
/// The arena reservation is returned when the last `Arc` to the buffer is
/// dropped. Views hold a `Weak` and observe the release.
pub struct DeviceBuffer<T: Scalar> {
    device: Arc<Device>,
    memory: Memory<T>,
    len: usize,
    bytes: usize,
}

enum ReadInner<'a, T: Scalar> {
    Mapped(MappedRwLockReadGuard<'a, [T]>),
    #[cfg(feature = "cuda")]
    Downloaded(Vec<T>),
}

/// Host-visible contents of a buffer range.
pub struct BufferRead<'a, T: Scalar>(ReadInner<'a, T>);

impl<T: Scalar> Deref for BufferRead<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        match &self.0 {
            ReadInner::Mapped(guard) => guard,
            #[cfg(feature = "cuda")]
            ReadInner::Downloaded(data) => data,
        }
    }
}

impl<T: Scalar> DeviceBuffer<T> {
    fn byte_size(device: &Device, len: usize) -> Result<usize> {
        len.checked_mul(T::ELEMENT_WIDTH)
            .ok_or_else(|| MatrixError::AllocationFailed {
                device: device.id(),
                bytes: usize::MAX,
                reason: format!("{len} elements of {} overflow the address space", T::TYPE_NAME),
            })
    }

    fn allocate(device: &Arc<Device>, len: usize, memory: impl FnOnce() -> Result<Memory<T>>) -> Result<Arc<Self>> {
        let bytes = Self::byte_size(device, len)?;
        device.reserve(bytes)?;
        match memory() {
            Ok(memory) => Ok(Arc::new(Self {
                device: Arc::clone(device),
                memory,
                len,
                bytes,
            })),
            Err(e) => {
                device.release(bytes);
                Err(e)
            }
        }
    }

    /// Allocate `len` zeroed elements on `device`.
    pub fn zeroed(device: &Arc<Device>, len: usize) -> Result<Arc<Self>> {
        Self::allocate(device, len, || match device.backend() {
            Backend::Emulated => Ok(Memory::Host(RwLock::new(vec![T::zero(); len]))),
            #[cfg(feature = "cuda")]
            Backend::Cuda(cuda) => DeviceMemory::zeroed(cuda, len)
                .map(Memory::Cuda)
                .map_err(|e| allocation_failed::<T>(device, len, &e)),
        })
    }

    /// Upload host data to `device`.
    pub fn from_vec(device: &Arc<Device>, data: Vec<T>) -> Result<Arc<Self>> {
        let len = data.len();
        Self::allocate(device, len, || match device.backend() {
            Backend::Emulated => Ok(Memory::Host(RwLock::new(data))),
            #[cfg(feature = "cuda")]
            Backend::Cuda(cuda) => DeviceMemory::from_slice(cuda, &data)
                .map(Memory::Cuda)
                .map_err(|e| allocation_failed::<T>(device, len, &e)),
        })
    }

    /// Upload a host slice to `device`.
    pub fn from_slice(device: &Arc<Device>, data: &[T]) -> Result<Arc<Self>> {
        match device.backend() {
            Backend::Emulated => Self::from_vec(device, data.to_vec()),
            #[cfg(feature = "cuda")]
            Backend::Cuda(cuda) => Self::allocate(device, data.len(), || {
                DeviceMemory::from_slice(cuda, data)
                    .map(Memory::Cuda)
                    .map_err(|e| allocation_failed::<T>(device, data.len(), &e))
            }),
        }
    }

    /// Copy `range` of `source` into a fresh buffer on `device`, without a
    /// round trip through the host when both live in device memory.
    pub(crate) fn copy_of(device: &Arc<Device>, source: &Self, range: Range<usize>) -> Result<Arc<Self>> {
        source.check_range(&range)?;
        let copy = Self::zeroed(device, range.len())?;
        copy.copy_from(0..range.len(), source, range)?;
        Ok(copy)
    }

    /// Device holding this buffer.
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Identifier of the device holding this buffer.
    pub fn device_id(&self) -> DeviceId {
        self.device.id()
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size in bytes.
    pub fn size_in_bytes(&self) -> usize {
        self.bytes
    }

    fn check_range(&self, range: &Range<usize>) -> Result<()> {
        if range.end > self.len || range.start > range.end {
            return Err(MatrixError::out_of_range(format!(
                "range {range:?} outside buffer of {} elements",
                self.len
            )));
        }
        Ok(())
    }

    #[cfg(feature = "cuda")]
    pub(crate) fn cuda_memory(&self) -> Option<&DeviceMemory<T>> {
        match &self.memory {
            Memory::Cuda(memory) => Some(memory),
            Memory::Host(_) => None,
        }
    }

    /// Shared access to `range`, downloaded when the buffer lives in device
    /// memory.
    ///
    /// Nothing waits for queued launches; callers synchronise the device
    /// first when they need their results.
    pub fn read(&self, range: Range<usize>) -> Result<BufferRead<'_, T>> {
        self.check_range(&range)?;
        match &self.memory {
            Memory::Host(data) => Ok(BufferRead(ReadInner::Mapped(RwLockReadGuard::map(
                data.read_recursive(),
                |data| &data[range],
            )))),
            #[cfg(feature = "cuda")]
            Memory::Cuda(memory) => memory.download(range).map(|data| BufferRead(ReadInner::Downloaded(data))),
        }
    }

    /// Run `f` over `range` with exclusive access and store the result.
    pub fn update<R>(&self, range: Range<usize>, f: impl FnOnce(&mut [T]) -> R) -> Result<R> {
        self.check_range(&range)?;
        match &self.memory {
            Memory::Host(data) => Ok(f(&mut data.write()[range])),
            #[cfg(feature = "cuda")]
            Memory::Cuda(memory) => memory.update(range, f),
        }
    }

    /// Copy `range` into host memory.
    pub(crate) fn download_into(&self, range: Range<usize>, dst: &mut [T]) -> Result<()> {
        self.check_range(&range)?;
        if dst.len() != range.len() {
            return Err(MatrixError::dimension_mismatch(range.len(), dst.len()));
        }
        match &self.memory {
            Memory::Host(data) => {
                dst.copy_from_slice(&data.read_recursive()[range]);
                Ok(())
            }
            #[cfg(feature = "cuda")]
            Memory::Cuda(memory) => memory.download_into(range, dst),
        }
    }

    /// Copy `src[src_range]` over `self[dst_range]`. The buffers must differ.
    pub(crate) fn copy_from(&self, dst_range: Range<usize>, src: &Self, src_range: Range<usize>) -> Result<()> {
        self.check_range(&dst_range)?;
        src.check_range(&src_range)?;
        if dst_range.len() != src_range.len() {
            return Err(MatrixError::dimension_mismatch(dst_range.len(), src_range.len()));
        }
        if std::ptr::eq(self, src) {
            return Err(MatrixError::invalid_argument("copy between overlapping ranges of one buffer"));
        }
        match (&self.memory, &src.memory) {
            (Memory::Host(dst), Memory::Host(from)) => {
                dst.write()[dst_range].copy_from_slice(&from.read_recursive()[src_range]);
                Ok(())
            }
            #[cfg(feature = "cuda")]
            (Memory::Cuda(dst), Memory::Cuda(from)) => dst.copy_from(dst_range, from, src_range),
            #[cfg(feature = "cuda")]
            _ => {
                let staged = src.read(src_range)?;
                self.update(dst_range, |dst| dst.copy_from_slice(&staged))
            }
        }
    }
}

#[cfg(feature = "cuda")]
fn allocation_failed<T: Scalar>(device: &Device, len: usize, e: &dyn fmt::Display) -> MatrixError {
    MatrixError::AllocationFailed {
        device: device.id(),
        bytes: len.saturating_mul(T::ELEMENT_WIDTH),
        reason: e.to_string(),
    }
}

impl<T: Scalar> Drop for DeviceBuffer<T> {
    fn drop(&mut self) {
        self.device.release(self.bytes);
    }
}

impl<T: Scalar> fmt::Debug for DeviceBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("device", &self.device.id())
            .field("type", &T::TYPE_NAME)
            .field("bytes", &self.bytes)
            .finish()
    }
}

/// A range of a buffer, resolved from matrix storage.
pub(crate) struct Region<T: Scalar> {
    pub(crate) buffer: Arc<DeviceBuffer<T>>,
    pub(crate) range: Range<usize>,
}

impl<T: Scalar> Region<T> {
    /// The whole of `buffer`.
    pub(crate) fn whole(buffer: Arc<DeviceBuffer<T>>) -> Self {
        let range = 0..buffer.len();
        Self { buffer, range }
    }

    pub(crate) fn len(&self) -> usize {
        self.range.len()
    }

    pub(crate) fn device(&self) -> &Arc<Device> {
        self.buffer.device()
    }

    pub(crate) fn read(&self) -> Result<BufferRead<'_, T>> {
        self.buffer.read(self.range.clone())
    }

    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut [T]) -> R) -> Result<R> {
        self.buffer.update(self.range.clone(), f)
    }

    /// Overwrite this region with `src`, which has the same length.
    pub(crate) fn copy_from(&self, src: &Self) -> Result<()> {
        self.buffer.copy_from(self.range.clone(), &src.buffer, src.range.clone())
    }
}

enum PinnedMemory<T: Scalar> {
    Host(Vec<T>),
    #[cfg(feature = "cuda")]
    PageLocked(PageLocked<T>),
}

/// Page-locked host memory used to stage transfers between devices
/// without peer access.
///
/// Emulated devices stage through an ordinary host vector.
pub(crate) struct PinnedBuffer<T: Scalar> {
    memory: PinnedMemory<T>,
}

impl<T: Scalar> PinnedBuffer<T> {
    /// Allocate `len` zeroed staging elements for transfers out of `device`.
    pub(crate) fn allocate(device: &Device, len: usize) -> Result<Self> {
        let memory = match device.backend() {
            Backend::Emulated => PinnedMemory::Host(vec![T::zero(); len]),
            #[cfg(feature = "cuda")]
            Backend::Cuda(cuda) => PinnedMemory::PageLocked(PageLocked::allocate(cuda, len)?),
        };
        Ok(Self { memory })
    }

    /// Whether the staging memory is page-locked.
    pub(crate) fn is_page_locked(&self) -> bool {
        !matches!(self.memory, PinnedMemory::Host(_))
    }

    pub(crate) fn as_slice(&self) -> &[T] {
        match &self.memory {
            PinnedMemory::Host(data) => data,
            #[cfg(feature = "cuda")]
            PinnedMemory::PageLocked(data) => data.as_slice(),
        }
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [T] {
        match &mut self.memory {
            PinnedMemory::Host(data) => data,
            #[cfg(feature = "cuda")]
            PinnedMemory::PageLocked(data) => data.as_mut_slice(),
        }
    }
}

impl<T: Scalar> fmt::Debug for PinnedBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinnedBuffer")
            .field("len", &self.as_slice().len())
            .field("page_locked", &self.is_page_locked())
            .finish()
    }
}

enum ScalarStorage<T: Scalar> {
    Owned(Arc<DeviceBuffer<T>>),
    Managed {
        source: Weak<DeviceBuffer<T>>,
        offset: usize,
    },
}

/// A single value resident in device memory.
///
/// Owned scalars free their memory on drop. Managed scalars point into a
/// buffer owned elsewhere and never free it.
pub struct DeviceScalar<T: Scalar> {
    device: DeviceId,
    storage: ScalarStorage<T>,
}

impl<T: Scalar> DeviceScalar<T> {
    /// Allocate a scalar on `device` holding `value`.
    pub fn new(device: &Arc<Device>, value: T) -> Result<Self> {
        Ok(Self {
            device: device.id(),
            storage: ScalarStorage::Owned(DeviceBuffer::from_vec(device, vec![value])?),
        })
    }

    /// Wrap element `offset` of a buffer owned elsewhere.
    pub fn managed(buffer: &Arc<DeviceBuffer<T>>, offset: usize) -> Result<Self> {
        if offset >= buffer.len() {
            return Err(MatrixError::out_of_range(format!(
                "offset {offset} outside buffer of {} elements",
                buffer.len()
            )));
        }
        Ok(Self {
            device: buffer.device_id(),
            storage: ScalarStorage::Managed {
                source: Arc::downgrade(buffer),
                offset,
            },
        })
    }

    fn location(&self) -> Result<(Arc<DeviceBuffer<T>>, usize)> {
        match &self.storage {
            ScalarStorage::Owned(buffer) => Ok((Arc::clone(buffer), 0)),
            ScalarStorage::Managed { source, offset } => source
                .upgrade()
                .map(|buffer| (buffer, *offset))
                .ok_or(MatrixError::InvalidatedView),
        }
    }

    /// Copy the value to the host, after queued launches complete.
    pub fn value(&self) -> Result<T> {
        let (buffer, offset) = self.location()?;
        buffer.device().synchronize()?;
        let value = buffer.read(offset..offset + 1)?[0];
        Ok(value)
    }

    /// Overwrite the value, after queued launches complete.
    pub fn set_value(&self, value: T) -> Result<()> {
        let (buffer, offset) = self.location()?;
        buffer.device().synchronize()?;
        buffer.update(offset..offset + 1, |slot| slot[0] = value)
    }

    /// Device holding the value.
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Whether the memory is owned elsewhere.
    pub fn is_managed(&self) -> bool {
        matches!(self.storage, ScalarStorage::Managed { .. })
    }
}

impl<T: Scalar> fmt::Debug for DeviceScalar<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceScalar")
            .field("device", &self.device)
            .field("managed", &self.is_managed())
            .finish()
    }
}

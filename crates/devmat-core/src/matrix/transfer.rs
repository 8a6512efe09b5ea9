//! Migration between devices.

use super::{DeviceMatrix, Storage};
use crate::error::{MatrixError, Result};
use crate::runtime::memory::PinnedBuffer;
use crate::runtime::DeviceBuffer;
use crate::types::Scalar;
use devmat_select::DeviceId;
use tracing::info;

/// Path taken by a device-to-device copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPath {
    /// Nothing to copy.
    None,
    /// Direct copy between peers.
    Peer,
    /// Copy staged through pinned host memory.
    Staged,
}

impl<T: Scalar> DeviceMatrix<T> {
    /// Move the matrix to `target`, returning the copy path used.
    ///
    /// Devices with mutual peer access copy directly; otherwise the data is
    /// staged through a pinned host buffer. Both paths produce identical
    /// contents. Views cannot migrate, and matrices cannot move to the CPU.
    /// On failure the matrix stays on its original device.
    pub fn change_device(&mut self, target: DeviceId) -> Result<TransferPath> {
        if !self.owns_buffer() {
            return Err(MatrixError::not_owner("change_device"));
        }
        if target == DeviceId::Cpu {
            return Err(MatrixError::unsupported("moving a device matrix to the CPU"));
        }
        if target == self.device {
            return Ok(TransferPath::None);
        }
        let destination = self.runtime.resolve(target)?;

        let Storage::Owned(buffer) = &self.storage else {
            self.device = target;
            return Ok(TransferPath::None);
        };
        let source = buffer.device();
        let len = buffer.len();
        let path = if self.runtime.has_mutual_peer_access(source.ordinal(), destination.ordinal()) {
            TransferPath::Peer
        } else {
            TransferPath::Staged
        };

        let transfer_failed = |e: MatrixError| MatrixError::TransferFailed {
            from: self.device,
            to: target,
            reason: e.to_string(),
        };
        source.synchronize()?;
        let moved = match path {
            TransferPath::Peer => DeviceBuffer::copy_of(&destination, buffer, 0..len),
            _ => PinnedBuffer::allocate(source, len).and_then(|mut staging| {
                buffer.download_into(0..len, staging.as_mut_slice())?;
                DeviceBuffer::from_slice(&destination, staging.as_slice())
            }),
        }
        .map_err(transfer_failed)?;

        info!(
            name = %self.name,
            from = %self.device,
            to = %target,
            elements = len,
            path = ?path,
            "moved matrix between devices"
        );
        self.storage = Storage::Owned(moved);
        self.device = target;
        Ok(path)
    }
}

//! Binary persistence.
//!
//! A stored matrix is, little-endian:
//!
//! | field         | size              |
//! |---------------|-------------------|
//! | magic `DMAT`  | 4                 |
//! | version       | 1                 |
//! | element width | 1                 |
//! | name length   | 4                 |
//! | name (UTF-8)  | name length       |
//! | rows          | 8                 |
//! | cols          | 8                 |
//! | payload       | rows * cols * width, column-major |

use super::{checked_len, DeviceMatrix};
use crate::error::{MatrixError, Result};
use crate::runtime::DeviceRuntime;
use crate::types::Scalar;
use devmat_select::DeviceId;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Leading bytes of every stored matrix.
pub const FORMAT_MAGIC: [u8; 4] = *b"DMAT";

/// Current format version.
pub const FORMAT_VERSION: u8 = 1;

fn invalid_data(reason: impl Into<String>) -> MatrixError {
    MatrixError::Io(io::Error::new(io::ErrorKind::InvalidData, reason.into()))
}

fn read_array<const N: usize>(reader: &mut impl Read) -> Result<[u8; N]> {
    let mut bytes = [0u8; N];
    reader.read_exact(&mut bytes)?;
    Ok(bytes)
}

fn read_len(reader: &mut impl Read) -> Result<usize> {
    let value = u64::from_le_bytes(read_array(reader)?);
    usize::try_from(value).map_err(|_| invalid_data(format!("dimension {value} does not fit in memory")))
}

impl<T: Scalar> DeviceMatrix<T> {
    /// Serialise the matrix under `name`.
    pub fn write_to(&self, writer: &mut impl Write, name: &str) -> Result<()> {
        let name_len = u32::try_from(name.len())
            .map_err(|_| MatrixError::invalid_argument("matrix name longer than 4 GiB"))?;
        let data = self.to_vec()?;

        let mut header = Vec::with_capacity(26 + name.len());
        header.extend_from_slice(&FORMAT_MAGIC);
        header.push(FORMAT_VERSION);
        header.push(T::ELEMENT_WIDTH as u8);
        header.extend_from_slice(&name_len.to_le_bytes());
        header.extend_from_slice(name.as_bytes());
        header.extend_from_slice(&(self.rows as u64).to_le_bytes());
        header.extend_from_slice(&(self.cols as u64).to_le_bytes());
        writer.write_all(&header)?;

        let mut payload = Vec::with_capacity(data.len() * T::ELEMENT_WIDTH);
        for x in data {
            x.write_le(&mut payload);
        }
        writer.write_all(&payload)?;
        Ok(())
    }

    /// Read a matrix written by [`write_to`](Self::write_to) onto `device`.
    ///
    /// When `expected_name` is given, the stored name must match it.
    ///
    /// # Errors
    ///
    /// [`MatrixError::Unsupported`] when the stored element width or format
    /// version differs from this build, [`MatrixError::InvalidArgument`] on a
    /// name mismatch, and [`MatrixError::Io`] for truncated or malformed
    /// input.
    pub fn read_from(
        runtime: &Arc<DeviceRuntime>,
        device: DeviceId,
        reader: &mut impl Read,
        expected_name: Option<&str>,
    ) -> Result<Self> {
        let magic: [u8; 4] = read_array(reader)?;
        if magic != FORMAT_MAGIC {
            return Err(invalid_data("not a stored device matrix"));
        }
        let [version] = read_array::<1>(reader)?;
        if version != FORMAT_VERSION {
            return Err(MatrixError::unsupported(format!("matrix format version {version}")));
        }
        let [width] = read_array::<1>(reader)?;
        if usize::from(width) != T::ELEMENT_WIDTH {
            return Err(MatrixError::unsupported(format!(
                "reading {width}-byte elements into a {} matrix",
                T::TYPE_NAME
            )));
        }

        let name_len = u32::from_le_bytes(read_array(reader)?) as usize;
        let mut name = Vec::new();
        reader.by_ref().take(name_len as u64).read_to_end(&mut name)?;
        if name.len() != name_len {
            return Err(invalid_data("truncated matrix name"));
        }
        let name = String::from_utf8(name).map_err(|e| invalid_data(e.to_string()))?;
        if let Some(expected) = expected_name {
            if name != expected {
                return Err(MatrixError::invalid_argument(format!(
                    "stored matrix is named '{name}', expected '{expected}'"
                )));
            }
        }

        let rows = read_len(reader)?;
        let cols = read_len(reader)?;
        let len = checked_len(rows, cols)?;
        let bytes_len = len
            .checked_mul(T::ELEMENT_WIDTH)
            .ok_or_else(|| invalid_data(format!("{rows}x{cols} payload overflows")))?;
        let mut bytes = Vec::new();
        reader.by_ref().take(bytes_len as u64).read_to_end(&mut bytes)?;
        if bytes.len() != bytes_len {
            return Err(invalid_data(format!(
                "payload holds {} bytes, expected {bytes_len}",
                bytes.len()
            )));
        }
        let data = bytes
            .chunks_exact(T::ELEMENT_WIDTH)
            .map(|chunk| T::read_le(chunk).ok_or_else(|| invalid_data("malformed element")))
            .collect::<Result<Vec<T>>>()?;

        let mut matrix = Self::new(runtime, device)?;
        matrix.upload(rows, cols, data)?;
        matrix.set_name(name);
        Ok(matrix)
    }

    /// Write the matrix to a file.
    pub fn save(&self, path: impl AsRef<Path>, name: &str) -> Result<()> {
        let path = path.as_ref();
        let mut writer = BufWriter::new(File::create(path)?);
        self.write_to(&mut writer, name)?;
        writer.flush()?;
        debug!(path = %path.display(), name, rows = self.rows, cols = self.cols, "saved matrix");
        Ok(())
    }

    /// Read a matrix from a file onto `device`.
    pub fn load(
        runtime: &Arc<DeviceRuntime>,
        device: DeviceId,
        path: impl AsRef<Path>,
        expected_name: Option<&str>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let mut reader = BufReader::new(File::open(path)?);
        let matrix = Self::read_from(runtime, device, &mut reader, expected_name)?;
        debug!(path = %path.display(), name = matrix.name(), "loaded matrix");
        Ok(matrix)
    }
}

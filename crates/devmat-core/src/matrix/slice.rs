//! Shape changes, column views, and row/column block copies.

use super::{checked_len, DeviceMatrix, Storage};
use crate::error::{MatrixError, Result};
use crate::kernels::for_each_column;
use crate::runtime::DeviceBuffer;
use crate::types::Scalar;
use std::sync::Arc;

impl<T: Scalar> DeviceMatrix<T> {
    /// Change the shape.
    ///
    /// Nothing happens when the shape is unchanged. Storage is reallocated
    /// when the new element count exceeds the allocation, or, unless
    /// `grow_only` is set, whenever it differs from the allocation. Fresh
    /// storage is zero-filled; otherwise the existing elements are
    /// reinterpreted under the new shape. On failure the matrix is left as
    /// it was.
    pub fn resize(&mut self, rows: usize, cols: usize, grow_only: bool) -> Result<()> {
        if self.shape() == (rows, cols) {
            return Ok(());
        }
        if !self.owns_buffer() {
            return Err(MatrixError::not_owner("resize"));
        }
        let len = checked_len(rows, cols)?;
        let capacity = self.allocated_elements();
        if len == 0 {
            self.storage = Storage::Empty;
        } else if len > capacity || (!grow_only && len != capacity) {
            let device = self.runtime.resolve(self.device)?;
            self.storage = Storage::Owned(DeviceBuffer::zeroed(&device, len)?);
        }
        self.rows = rows;
        self.cols = cols;
        Ok(())
    }

    /// Reinterpret the elements under a new shape with the same count.
    pub fn reshape(&mut self, rows: usize, cols: usize) -> Result<()> {
        if checked_len(rows, cols)? != self.len() {
            return Err(MatrixError::dimension_mismatch(
                format!("{} elements", self.len()),
                format!("{rows}x{cols}"),
            ));
        }
        self.rows = rows;
        self.cols = cols;
        Ok(())
    }

    /// View of columns `start..start + n`, sharing this matrix's memory.
    pub fn column_slice(&self, start: usize, n: usize) -> Result<Self> {
        let end = start
            .checked_add(n)
            .filter(|&end| end <= self.cols)
            .ok_or_else(|| {
                MatrixError::out_of_range(format!(
                    "columns {start}..{} of a matrix with {} columns",
                    start.saturating_add(n),
                    self.cols
                ))
            })?;
        let empty = Self {
            runtime: Arc::clone(&self.runtime),
            device: self.device,
            rows: self.rows,
            cols: n,
            storage: Storage::Empty,
            format: self.format,
            name: String::new(),
        };
        if self.rows == 0 || n == 0 {
            return Ok(empty);
        }
        let (source, base) = match &self.storage {
            Storage::Empty => return Ok(empty),
            Storage::Owned(buffer) => (Arc::downgrade(buffer), 0),
            Storage::View { source, offset } => {
                if source.strong_count() == 0 {
                    return Err(MatrixError::InvalidatedView);
                }
                (source.clone(), *offset)
            }
        };
        Ok(Self {
            runtime: Arc::clone(&self.runtime),
            device: self.device,
            rows: self.rows,
            cols: end - start,
            storage: Storage::View {
                source,
                offset: base + start * self.rows,
            },
            format: self.format,
            name: String::new(),
        })
    }

    /// Deep copy of columns `start..start + n` of `src` into `self`.
    pub fn assign_column_slice(&mut self, src: &Self, start: usize, n: usize) -> Result<()> {
        self.require_same_device(src)?;
        let view = src.column_slice(start, n)?;
        let data = view.operand_for(self)?;
        self.resize(src.rows, n, true)?;
        self.write_with("assign_column_slice", move |dst| data.with(|s| dst.copy_from_slice(s)))
    }

    /// Copy `src` into columns `start..start + src.cols()` of `self`.
    pub fn set_column_slice(&mut self, src: &Self, start: usize) -> Result<()> {
        self.require_same_device(src)?;
        if src.rows != self.rows {
            return Err(MatrixError::dimension_mismatch(
                format!("{} rows", self.rows),
                format!("{} rows", src.rows),
            ));
        }
        let mut target = self.column_slice(start, src.cols)?;
        let data = src.operand_for(&target)?;
        target.write_with("set_column_slice", move |dst| data.with(|s| dst.copy_from_slice(s)))
    }

    /// `self = src[start..start + n, :]`.
    pub fn assign_row_slice_values_of(&mut self, src: &Self, start: usize, n: usize) -> Result<()> {
        self.require_same_device(src)?;
        check_row_range(start, n, src.rows)?;
        let data = src.operand_for(self)?;
        let src_rows = src.rows;
        self.resize(n, src.cols, true)?;
        self.write_with("assign_row_slice_values_of", move |dst| {
            data.with(|s| {
                for_each_column(dst, n, |c, column| {
                    column.copy_from_slice(&s[c * src_rows + start..c * src_rows + start + n]);
                });
            })
        })
    }

    /// `self[start..start + src.rows(), :] += src`.
    pub fn add_to_row_slice_values_of(&mut self, src: &Self, start: usize, n: usize) -> Result<()> {
        self.require_same_device(src)?;
        check_row_range(start, n, self.rows)?;
        if src.shape() != (n, self.cols) {
            return Err(MatrixError::shape_mismatch((n, self.cols), src.shape()));
        }
        let data = src.operand_for(self)?;
        let rows = self.rows;
        self.write_with("add_to_row_slice_values_of", move |dst| {
            data.with(|s| {
                for_each_column(dst, rows, |c, column| {
                    for (x, &y) in column[start..start + n].iter_mut().zip(&s[c * n..(c + 1) * n]) {
                        *x += y;
                    }
                });
            })
        })
    }

    /// Tile `src` `row_repeats` times vertically and `col_repeats` times
    /// horizontally.
    pub fn assign_repeat_of(&mut self, src: &Self, row_repeats: usize, col_repeats: usize) -> Result<()> {
        self.require_same_device(src)?;
        let rows = src
            .rows
            .checked_mul(row_repeats)
            .ok_or_else(|| MatrixError::invalid_argument("row repeat overflows"))?;
        let cols = src
            .cols
            .checked_mul(col_repeats)
            .ok_or_else(|| MatrixError::invalid_argument("column repeat overflows"))?;
        let data = src.operand_for(self)?;
        let (src_rows, src_cols) = src.shape();
        self.resize(rows, cols, true)?;
        self.write_with("assign_repeat_of", move |dst| {
            data.with(|s| {
                for_each_column(dst, rows, |c, column| {
                    let source = &s[(c % src_cols) * src_rows..(c % src_cols + 1) * src_rows];
                    for block in column.chunks_mut(src_rows) {
                        block.copy_from_slice(source);
                    }
                });
            })
        })
    }
}

fn check_row_range(start: usize, n: usize, rows: usize) -> Result<()> {
    match start.checked_add(n) {
        Some(end) if end <= rows => Ok(()),
        _ => Err(MatrixError::out_of_range(format!(
            "rows {start}..{} of a matrix with {rows} rows",
            start.saturating_add(n)
        ))),
    }
}

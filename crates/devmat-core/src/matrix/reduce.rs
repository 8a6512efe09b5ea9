//! Reductions.
//!
//! Scalar reductions of an empty matrix fail with
//! [`MatrixError::EmptyMatrix`]. All sums go through
//! [`kernels::reduce`](crate::kernels::reduce) and are deterministic.

use super::DeviceMatrix;
use crate::error::{MatrixError, Result};
use crate::kernels::reduce::{count, max_by, sum_by, tree_sum, vector_extremes, vector_max_by, vector_sums};
use crate::runtime::DeviceScalar;
use crate::types::{Axis, Scalar};

impl<T: Scalar> DeviceMatrix<T> {
    fn reduce_with<R>(&self, kernel: &'static str, f: impl FnOnce(&[T]) -> R) -> Result<R> {
        self.require_non_empty(kernel)?;
        self.read_with(kernel, f)
    }

    /// Shape of a per-vector result: a row when reducing columns, a column
    /// when reducing rows.
    fn vector_result_shape(&self, col_wise: bool) -> (usize, usize) {
        match Axis::from_col_wise(col_wise) {
            Axis::Columns => (1, self.cols),
            Axis::Rows => (self.rows, 1),
        }
    }

    /// Resize to `rows x cols` and store host-computed values.
    fn store(&mut self, kernel: &'static str, rows: usize, cols: usize, values: Vec<T>) -> Result<()> {
        self.resize(rows, cols, true)?;
        self.write_with(kernel, move |dst| {
            dst.copy_from_slice(&values);
            Ok(())
        })
    }

    /// Sum of all elements.
    pub fn sum_of_elements(&self) -> Result<T> {
        self.reduce_with("sum_of_elements", |data| sum_by(data, |x| x))
    }

    /// Sum of absolute values.
    pub fn sum_of_abs_elements(&self) -> Result<T> {
        self.reduce_with("sum_of_abs_elements", |data| sum_by(data, |x| x.abs()))
    }

    /// Square root of the sum of squares.
    pub fn frobenius_norm(&self) -> Result<T> {
        self.reduce_with("frobenius_norm", |data| sum_by(data, |x| x * x).sqrt())
    }

    /// Largest absolute value.
    pub fn matrix_norm_inf(&self) -> Result<T> {
        self.reduce_with("matrix_norm_inf", |data| max_by(data, |x| x.abs()))
    }

    /// Sum of absolute values, treating the matrix as one vector.
    pub fn matrix_norm1(&self) -> Result<T> {
        self.reduce_with("matrix_norm1", |data| sum_by(data, |x| x.abs()))
    }

    /// Number of non-zero elements.
    pub fn matrix_norm0(&self) -> Result<T> {
        let nonzero = self.reduce_with("matrix_norm0", |data| count(data, |x| x != T::zero()))?;
        Ok(T::of_f64(nonzero as f64))
    }

    fn assign_vector_reduction_of(
        &mut self,
        kernel: &'static str,
        a: &Self,
        col_wise: bool,
        reduce: impl FnOnce(&[T], usize, usize) -> Vec<T>,
    ) -> Result<()> {
        self.require_same_device(a)?;
        a.require_non_empty(kernel)?;
        let (rows, cols) = a.shape();
        let values = a.read_with(kernel, |data| reduce(data, rows, cols))?;
        let (r, c) = a.vector_result_shape(col_wise);
        self.store(kernel, r, c, values)
    }

    /// Per-column (`col_wise`) or per-row sums of absolute values of `a`.
    pub fn assign_vector_norm1_of(&mut self, a: &Self, col_wise: bool) -> Result<()> {
        self.assign_vector_reduction_of("vector_norm1", a, col_wise, |data, rows, cols| {
            vector_sums(data, rows, cols, col_wise, |x| x.abs())
        })
    }

    /// Per-column (`col_wise`) or per-row Euclidean norms of `a`.
    pub fn assign_vector_norm2_of(&mut self, a: &Self, col_wise: bool) -> Result<()> {
        self.assign_vector_reduction_of("vector_norm2", a, col_wise, |data, rows, cols| {
            vector_sums(data, rows, cols, col_wise, |x| x * x)
                .into_iter()
                .map(|s| s.sqrt())
                .collect()
        })
    }

    /// Per-column (`col_wise`) or per-row largest absolute values of `a`.
    pub fn assign_vector_norm_inf_of(&mut self, a: &Self, col_wise: bool) -> Result<()> {
        self.assign_vector_reduction_of("vector_norm_inf", a, col_wise, |data, rows, cols| {
            vector_max_by(data, rows, cols, col_wise, |x| x.abs())
        })
    }

    fn vector_extreme(
        &self,
        kernel: &'static str,
        col_wise: bool,
        better: impl Fn(T, T) -> bool + Sync + Send,
    ) -> Result<(Self, Vec<usize>)> {
        self.require_non_empty(kernel)?;
        let (rows, cols) = self.shape();
        let extremes = self.read_with(kernel, |data| {
            vector_extremes(data, rows, cols, col_wise, |x| x, better)
        })?;
        let (values, indices): (Vec<T>, Vec<usize>) = extremes.into_iter().unzip();
        let (r, c) = self.vector_result_shape(col_wise);
        let mut out = Self::new(&self.runtime, self.device)?;
        out.store(kernel, r, c, values)?;
        Ok((out, indices))
    }

    /// Largest value of every column (`col_wise`) or row, with its index
    /// inside the vector. Ties go to the first index.
    pub fn vector_max(&self, col_wise: bool) -> Result<(Self, Vec<usize>)> {
        self.vector_extreme("vector_max", col_wise, |a, b| a > b)
    }

    /// Smallest value of every column (`col_wise`) or row, with its index
    /// inside the vector. Ties go to the first index.
    pub fn vector_min(&self, col_wise: bool) -> Result<(Self, Vec<usize>)> {
        self.vector_extreme("vector_min", col_wise, |a, b| a < b)
    }

    /// `self = [number of positions where a and b differ]`, a 1x1 matrix.
    pub fn assign_num_of_diff(&mut self, a: &Self, b: &Self) -> Result<()> {
        self.require_same_device(a)?;
        self.require_same_device(b)?;
        a.require_same_shape(b)?;
        let sb = b.operand_for(a)?;
        let diff = a.read_with("num_of_diff", |x| {
            sb.with(|y| x.iter().zip(y).filter(|(p, q)| p != q).count())
        })??;
        self.store("num_of_diff", 1, 1, vec![T::of_f64(diff as f64)])
    }

    /// Sum of `a .* b`.
    pub fn inner_product_of_matrices(a: &Self, b: &Self) -> Result<T> {
        a.require_same_device(b)?;
        a.require_same_shape(b)?;
        a.require_non_empty("inner_product_of_matrices")?;
        let sb = b.operand_for(a)?;
        a.read_with("inner_product_of_matrices", |x| {
            sb.with(|y| tree_sum(x.len(), |i| x[i] * y[i]))
        })?
    }

    /// Per-column (`col_wise`) or per-row dot products of `a` and `b`.
    pub fn assign_inner_product_of(&mut self, a: &Self, b: &Self, col_wise: bool) -> Result<()> {
        self.require_same_device(a)?;
        self.require_same_device(b)?;
        a.require_same_shape(b)?;
        a.require_non_empty("inner_product")?;
        let (rows, cols) = a.shape();
        let sb = b.operand_for(a)?;
        let values = a.read_with("inner_product", |x| {
            sb.with(|y| {
                if col_wise {
                    (0..cols)
                        .map(|c| tree_sum(rows, |r| x[c * rows + r] * y[c * rows + r]))
                        .collect::<Vec<T>>()
                } else {
                    (0..rows)
                        .map(|r| tree_sum(cols, |c| x[c * rows + r] * y[c * rows + r]))
                        .collect()
                }
            })
        })??;
        let (r, c) = a.vector_result_shape(col_wise);
        self.store("inner_product", r, c, values)
    }

    /// `self = [sum of a]`, a 1x1 matrix.
    pub fn assign_sum_of_elements(&mut self, a: &Self) -> Result<()> {
        self.require_same_device(a)?;
        let sum = a.sum_of_elements()?;
        self.store("assign_sum_of_elements", 1, 1, vec![sum])
    }

    /// Sum of all elements, left in device memory.
    pub fn sum_of_elements_on_device(&self) -> Result<DeviceScalar<T>> {
        let sum = self.sum_of_elements()?;
        let device = self.runtime.resolve(self.device)?;
        DeviceScalar::new(&device, sum)
    }

    /// Whether any element is NaN.
    pub fn has_nan(&self) -> Result<bool> {
        self.read_with("has_nan", |data| count(data, Scalar::is_nan) > 0)
    }

    /// Whether `other` has the same shape and every element is within
    /// `tolerance` of the corresponding element of `self`.
    ///
    /// NaN compares unequal to everything.
    pub fn is_equal_to(&self, other: &Self, tolerance: T) -> Result<bool> {
        self.require_same_device(other)?;
        if self.shape() != other.shape() {
            return Ok(false);
        }
        let so = other.operand_for(self)?;
        let mismatches = self.read_with("is_equal_to", |x| {
            so.with(|y| {
                tree_sum(x.len(), |i| {
                    if (x[i] - y[i]).abs() <= tolerance {
                        T::zero()
                    } else {
                        T::one()
                    }
                })
            })
        })??;
        Ok(mismatches == T::zero())
    }
}

//! Value setters and random fills.
//!
//! Random fills draw from a `StdRng` seeded by the caller, in column-major
//! order, so a seed reproduces the same matrix on any device.

use super::DeviceMatrix;
use crate::error::{MatrixError, Result};
use crate::kernels::elementwise::map_in_place;
use crate::runtime::DeviceRuntime;
use crate::types::Scalar;
use devmat_select::DeviceId;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal, Uniform};
use std::cmp::Ordering;
use std::sync::Arc;

impl<T: Scalar> DeviceMatrix<T> {
    /// `n x n` identity matrix.
    pub fn eye(runtime: &Arc<DeviceRuntime>, device: DeviceId, n: usize) -> Result<Self> {
        let mut matrix = Self::zeros(runtime, device, n, n)?;
        matrix.set_diagonal_value(T::one())?;
        Ok(matrix)
    }

    fn offset_of(&self, row: usize, col: usize) -> Result<usize> {
        if row >= self.rows || col >= self.cols {
            return Err(MatrixError::out_of_range(format!(
                "element ({row}, {col}) of a {}x{} matrix",
                self.rows, self.cols
            )));
        }
        Ok(col * self.rows + row)
    }

    /// Set every element to `value`.
    pub fn set_value(&mut self, value: T) -> Result<()> {
        self.write_with("set_value", move |dst| {
            map_in_place(dst, |_| value);
            Ok(())
        })
    }

    /// Element `(row, col)`, copied to the host.
    pub fn value_at(&self, row: usize, col: usize) -> Result<T> {
        let offset = self.offset_of(row, col)?;
        self.read_with("value_at", |data| data[offset])
    }

    /// Set element `(row, col)`.
    pub fn set_value_at(&mut self, row: usize, col: usize, value: T) -> Result<()> {
        let offset = self.offset_of(row, col)?;
        self.write_with("set_value_at", move |data| {
            data[offset] = value;
            Ok(())
        })
    }

    /// Set every diagonal element of a square matrix to `value`.
    pub fn set_diagonal_value(&mut self, value: T) -> Result<()> {
        if self.rows != self.cols {
            return Err(MatrixError::dimension_mismatch(
                "square matrix",
                format!("{}x{}", self.rows, self.cols),
            ));
        }
        let n = self.rows;
        self.write_with("set_diagonal_value", move |data| {
            for i in 0..n {
                data[i * n + i] = value;
            }
            Ok(())
        })
    }

    /// Overwrite column `col` with host data.
    pub fn set_column(&mut self, col: usize, values: &[T]) -> Result<()> {
        if col >= self.cols {
            return Err(MatrixError::out_of_range(format!(
                "column {col} of a matrix with {} columns",
                self.cols
            )));
        }
        if values.len() != self.rows {
            return Err(MatrixError::dimension_mismatch(
                format!("{} values", self.rows),
                values.len(),
            ));
        }
        let (rows, values) = (self.rows, values.to_vec());
        self.write_with("set_column", move |data| {
            data[col * rows..(col + 1) * rows].copy_from_slice(&values);
            Ok(())
        })
    }

    fn fill_from<D: Distribution<f64>>(&mut self, kernel: &'static str, distribution: D, seed: u64) -> Result<()> {
        let mut rng = StdRng::seed_from_u64(seed);
        let values: Vec<T> = (0..self.len())
            .map(|_| T::of_f64(distribution.sample(&mut rng)))
            .collect();
        self.write_with(kernel, move |dst| {
            dst.copy_from_slice(&values);
            Ok(())
        })
    }

    /// Fill with values drawn uniformly from `[low, high)`.
    pub fn set_uniform_random(&mut self, low: T, high: T, seed: u64) -> Result<()> {
        let (lo, hi) = (low.as_f64(), high.as_f64());
        if lo.partial_cmp(&hi) != Some(Ordering::Less) || !lo.is_finite() || !hi.is_finite() {
            return Err(MatrixError::invalid_argument(format!(
                "uniform range [{low}, {high}) is empty or unbounded"
            )));
        }
        self.fill_from("set_uniform_random", Uniform::new(lo, hi), seed)
    }

    /// Fill with normally distributed values.
    pub fn set_gaussian_random(&mut self, mean: T, sigma: T, seed: u64) -> Result<()> {
        let sd = sigma.as_f64();
        if !(sd.is_finite() && sd >= 0.0) {
            return Err(MatrixError::invalid_argument(format!(
                "gaussian standard deviation {sigma} must be finite and non-negative"
            )));
        }
        let normal = Normal::new(mean.as_f64(), sigma.as_f64())
            .map_err(|e| MatrixError::invalid_argument(format!("gaussian with sigma {sigma}: {e}")))?;
        self.fill_from("set_gaussian_random", normal, seed)
    }

    /// Dropout mask: each element is zero with probability `drop_rate`, and
    /// `scale` otherwise.
    pub fn set_uniform_random_mask(&mut self, drop_rate: T, scale: T, seed: u64) -> Result<()> {
        let rate = drop_rate.as_f64();
        if !(0.0..1.0).contains(&rate) {
            return Err(MatrixError::invalid_argument(format!(
                "drop rate {drop_rate} outside [0, 1)"
            )));
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let values: Vec<T> = (0..self.len())
            .map(|_| if rng.gen::<f64>() < rate { T::zero() } else { scale })
            .collect();
        self.write_with("set_uniform_random_mask", move |dst| {
            dst.copy_from_slice(&values);
            Ok(())
        })
    }
}

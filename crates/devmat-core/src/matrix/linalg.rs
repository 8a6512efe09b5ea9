//! Matrix products, transposition, and scaled accumulation.

use super::DeviceMatrix;
use crate::error::{MatrixError, Result};
use crate::kernels::elementwise::{broadcast_in_place, Broadcast};
use crate::kernels::for_each_column;
use crate::kernels::reduce::vector_sums;
use crate::runtime::blas::DeviceOperand;
use crate::types::Scalar;
use std::ops::Mul;

impl<T: Scalar> DeviceMatrix<T> {
    /// `c = alpha * op(a) * op(b) + beta * c`, where `op` optionally
    /// transposes.
    ///
    /// With `beta == 0`, `c` is resized to the product shape and its previous
    /// contents are ignored. Otherwise `c` must already have that shape.
    ///
    /// # Errors
    ///
    /// Fails when the operands are empty, live on different devices, or have
    /// incompatible inner dimensions.
    pub fn multiply_and_weighted_add(
        alpha: T,
        a: &Self,
        trans_a: bool,
        b: &Self,
        trans_b: bool,
        beta: T,
        c: &mut Self,
    ) -> Result<()> {
        c.require_same_device(a)?;
        c.require_same_device(b)?;
        a.require_non_empty("multiply")?;
        b.require_non_empty("multiply")?;

        let op_a = if trans_a { (a.cols, a.rows) } else { a.shape() };
        let op_b = if trans_b { (b.cols, b.rows) } else { b.shape() };
        if op_a.1 != op_b.0 {
            return Err(MatrixError::dimension_mismatch(
                format!("inner dimension {}", op_a.1),
                format!("inner dimension {}", op_b.0),
            ));
        }
        let (m, n) = (op_a.0, op_b.1);

        let (sa, sb) = (a.operand_for(c)?, b.operand_for(c)?);
        if beta == T::zero() {
            c.resize(m, n, true)?;
        } else if c.shape() != (m, n) {
            return Err(MatrixError::shape_mismatch((m, n), c.shape()));
        }

        let device = c.physical_device()?;
        let handle = c.runtime.blas_handle(&device)?;
        let (a_shape, b_shape) = (a.shape(), b.shape());
        c.write_region("gemm", move |dst| {
            let x = DeviceOperand::new(sa.region("gemm")?, a_shape.0, a_shape.1, trans_a)?;
            let y = DeviceOperand::new(sb.region("gemm")?, b_shape.0, b_shape.1, trans_b)?;
            handle.gemm_regions(alpha, &x, &y, beta, dst)
        })
    }

    /// `c = op(a) * op(b)`.
    pub fn multiply(a: &Self, trans_a: bool, b: &Self, trans_b: bool, c: &mut Self) -> Result<()> {
        Self::multiply_and_weighted_add(T::one(), a, trans_a, b, trans_b, T::zero(), c)
    }

    /// `c += op(a) * op(b)`.
    pub fn multiply_and_add(a: &Self, trans_a: bool, b: &Self, trans_b: bool, c: &mut Self) -> Result<()> {
        Self::multiply_and_weighted_add(T::one(), a, trans_a, b, trans_b, T::one(), c)
    }

    /// New matrix holding the transpose.
    pub fn transpose(&self) -> Result<Self> {
        let mut out = Self::new(&self.runtime, self.device)?;
        out.assign_transpose_of(self)?;
        Ok(out)
    }

    /// `self = a^T`.
    ///
    /// `a` must not share storage with `self`.
    pub fn assign_transpose_of(&mut self, a: &Self) -> Result<()> {
        self.require_same_device(a)?;
        if self.shares_buffer_with(a) {
            return Err(MatrixError::invalid_argument(
                "cannot transpose a matrix into its own storage",
            ));
        }
        let src = a.operand_for(self)?;
        let (rows, cols) = a.shape();
        self.resize(cols, rows, true)?;
        if self.is_empty() {
            return Ok(());
        }
        let device = self.physical_device()?;
        let handle = self.runtime.blas_handle(&device)?;
        self.write_region("geam", move |dst| {
            let x = DeviceOperand::new(src.region("transpose")?, rows, cols, true)?;
            handle.geam_regions(T::one(), &x, T::zero(), None, dst)
        })
    }

    /// `c += alpha * a`.
    ///
    /// `a` may have the shape of `c`, be 1x1, a column vector added to every
    /// column, or a row vector added to every row. When `c` is a column (row)
    /// vector and `a` has as many rows (columns), the rows (columns) of `a`
    /// are summed into `c`.
    pub fn scale_and_add(alpha: T, a: &Self, c: &mut Self) -> Result<()> {
        c.require_same_device(a)?;
        let src = a.operand_for(c)?;
        let (rows, cols) = c.shape();
        if let Some(broadcast) = Broadcast::resolve(c.shape(), a.shape()) {
            return c.write_with("scale_and_add", move |dst| {
                src.with(|x| broadcast_in_place(dst, rows, x, broadcast, |d, v| d + alpha * v))
            });
        }
        let reduce_columns = if c.is_column_vector() && c.rows == a.rows {
            false
        } else if c.is_row_vector() && c.cols == a.cols {
            true
        } else {
            return Err(MatrixError::dimension_mismatch(
                format!("{rows}x{cols} or a vector broadcast over it"),
                format!("{}x{}", a.rows, a.cols),
            ));
        };
        let (a_rows, a_cols) = a.shape();
        let sums = src.with(|x| vector_sums(x, a_rows, a_cols, reduce_columns, |v| v))?;
        c.write_with("scale_and_add", move |dst| {
            for (d, s) in dst.iter_mut().zip(&sums) {
                *d += alpha * *s;
            }
            Ok(())
        })
    }

    /// `self += alpha * a`, shaped as in [`scale_and_add`](Self::scale_and_add).
    pub fn add_with_scale_of(&mut self, alpha: T, a: &Self) -> Result<()> {
        Self::scale_and_add(alpha, a, self)
    }

    /// `c = alpha * a`.
    pub fn scale(alpha: T, a: &Self, c: &mut Self) -> Result<()> {
        c.assign_product_of(alpha, a)
    }

    /// Column-wise Kronecker product: column `j` of `self` is the Kronecker
    /// product of column `j` of `a` and column `j` of `b`.
    pub fn assign_khatri_rao_product_of(&mut self, a: &Self, b: &Self) -> Result<()> {
        self.require_same_device(a)?;
        self.require_same_device(b)?;
        if a.cols != b.cols {
            return Err(MatrixError::dimension_mismatch(
                format!("{} columns", a.cols),
                format!("{} columns", b.cols),
            ));
        }
        let (ra, rb, cols) = (a.rows, b.rows, a.cols);
        let rows = ra
            .checked_mul(rb)
            .ok_or_else(|| MatrixError::invalid_argument("Khatri-Rao product overflows"))?;
        let (sa, sb) = (a.operand_for(self)?, b.operand_for(self)?);
        self.resize(rows, cols, true)?;
        self.write_with("khatri_rao_product", move |dst| {
            sa.with(|x| {
                sb.with(|y| {
                    for_each_column(dst, rows, |j, column| {
                        for ia in 0..ra {
                            let p = x[j * ra + ia];
                            for ib in 0..rb {
                                column[ia * rb + ib] = p * y[j * rb + ib];
                            }
                        }
                    });
                })
            })?
        })
    }
}

impl<T: Scalar> Mul for &DeviceMatrix<T> {
    type Output = Result<DeviceMatrix<T>>;

    fn mul(self, rhs: Self) -> Self::Output {
        let mut out = DeviceMatrix::new(&self.runtime, self.device)?;
        DeviceMatrix::multiply(self, false, rhs, false, &mut out)?;
        Ok(out)
    }
}

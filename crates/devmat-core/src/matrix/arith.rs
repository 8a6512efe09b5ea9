//! Scalar and element-wise arithmetic.
//!
//! Most operations come in three shapes: in place on `self`, copying into a
//! new matrix, and `assign_*_of`, which resizes `self` and overwrites it with
//! the result computed from other matrices.

use super::DeviceMatrix;
use crate::error::{MatrixError, Result};
use crate::kernels::elementwise::{
    broadcast_in_place, broadcast_into, map_in_place, map_into, sign, zip2_in_place, zip_in_place,
    zip_into, Broadcast,
};
use crate::types::Scalar;
use std::ops::{Add, Div, Mul, Neg, Sub};

impl<T: Scalar> DeviceMatrix<T> {
    // ---- generic launchers ----

    /// `self[i] = f(self[i])`.
    pub(crate) fn apply_unary<F>(&mut self, kernel: &'static str, f: F) -> Result<()>
    where
        F: Fn(T) -> T + Sync + Send + 'static,
    {
        self.write_with(kernel, move |dst| {
            map_in_place(dst, f);
            Ok(())
        })
    }

    /// `self = f(a)` element-wise, resizing `self` to `a`'s shape.
    pub(crate) fn assign_unary_of<F>(&mut self, kernel: &'static str, a: &Self, f: F) -> Result<()>
    where
        F: Fn(T) -> T + Sync + Send + 'static,
    {
        self.require_same_device(a)?;
        let src = a.operand_for(self)?;
        self.resize(a.rows, a.cols, true)?;
        self.write_with(kernel, move |dst| src.with(|s| map_into(dst, s, f)))
    }

    /// New matrix holding `f(self)` element-wise.
    pub(crate) fn mapped<F>(&self, kernel: &'static str, f: F) -> Result<Self>
    where
        F: Fn(T) -> T + Sync + Send + 'static,
    {
        let mut out = Self::new(&self.runtime, self.device)?;
        out.assign_unary_of(kernel, self, f)?;
        Ok(out)
    }

    /// `self[i] = f(self[i], b[i])`, same shape required.
    pub(crate) fn apply_binary<F>(&mut self, kernel: &'static str, b: &Self, f: F) -> Result<()>
    where
        F: Fn(T, T) -> T + Sync + Send + 'static,
    {
        self.require_same_device(b)?;
        self.require_same_shape(b)?;
        let other = b.operand_for(self)?;
        self.write_with(kernel, move |dst| other.with(|o| zip_in_place(dst, o, f)))
    }

    /// `self = f(a, b)` element-wise, same shape required.
    pub(crate) fn assign_binary_of<F>(&mut self, kernel: &'static str, a: &Self, b: &Self, f: F) -> Result<()>
    where
        F: Fn(T, T) -> T + Sync + Send + 'static,
    {
        self.require_same_device(a)?;
        self.require_same_device(b)?;
        a.require_same_shape(b)?;
        let (sa, sb) = (a.operand_for(self)?, b.operand_for(self)?);
        self.resize(a.rows, a.cols, true)?;
        self.write_with(kernel, move |dst| {
            sa.with(|x| sb.with(|y| zip_into(dst, x, y, f)))?
        })
    }

    /// `self[r, c] = f(self[r, c], b[broadcast(r, c)])`.
    pub(crate) fn apply_broadcast<F>(&mut self, kernel: &'static str, b: &Self, broadcast: Broadcast, f: F) -> Result<()>
    where
        F: Fn(T, T) -> T + Sync + Send + 'static,
    {
        self.require_same_device(b)?;
        let other = b.operand_for(self)?;
        let rows = self.rows;
        self.write_with(kernel, move |dst| other.with(|o| broadcast_in_place(dst, rows, o, broadcast, f)))
    }

    fn resolve_broadcast(&self, b: &Self) -> Result<Broadcast> {
        Broadcast::resolve(self.shape(), b.shape()).ok_or_else(|| {
            MatrixError::dimension_mismatch(
                format!(
                    "{}x{}, 1x1, {}x1 or 1x{}",
                    self.rows, self.cols, self.rows, self.cols
                ),
                format!("{}x{}", b.rows, b.cols),
            )
        })
    }

    fn require_vector_shape(&self, b: &Self, broadcast: Broadcast) -> Result<()> {
        let expected = match broadcast {
            Broadcast::Column => (self.rows, 1),
            Broadcast::Row => (1, self.cols),
            Broadcast::Scalar => (1, 1),
            Broadcast::Full => self.shape(),
        };
        if b.shape() != expected {
            return Err(MatrixError::shape_mismatch(expected, b.shape()));
        }
        Ok(())
    }

    /// `self = f(a, b)` with `b` broadcast over `a`.
    fn assign_broadcast_of<F>(&mut self, kernel: &'static str, a: &Self, b: &Self, f: F) -> Result<()>
    where
        F: Fn(T, T) -> T + Sync + Send + 'static,
    {
        self.require_same_device(a)?;
        self.require_same_device(b)?;
        let broadcast = a.resolve_broadcast(b)?;
        let (sa, sb) = (a.operand_for(self)?, b.operand_for(self)?);
        let rows = a.rows;
        self.resize(a.rows, a.cols, true)?;
        self.write_with(kernel, move |dst| {
            sa.with(|x| sb.with(|y| broadcast_into(dst, x, rows, y, broadcast, f)))?
        })
    }

    // ---- scalar operations ----

    /// `self += s`.
    pub fn add_scalar_in_place(&mut self, s: T) -> Result<()> {
        self.apply_unary("add_scalar", move |x| x + s)
    }

    /// `self -= s`.
    pub fn sub_scalar_in_place(&mut self, s: T) -> Result<()> {
        self.apply_unary("sub_scalar", move |x| x - s)
    }

    /// `self *= s`.
    pub fn mul_scalar_in_place(&mut self, s: T) -> Result<()> {
        self.apply_unary("mul_scalar", move |x| x * s)
    }

    /// `self /= s`.
    pub fn div_scalar_in_place(&mut self, s: T) -> Result<()> {
        self.apply_unary("div_scalar", move |x| x / s)
    }

    /// `self = a + s`.
    pub fn assign_sum_of_scalar(&mut self, a: &Self, s: T) -> Result<()> {
        self.assign_unary_of("add_scalar", a, move |x| x + s)
    }

    /// `self = a - s`.
    pub fn assign_difference_of_scalar(&mut self, a: &Self, s: T) -> Result<()> {
        self.assign_unary_of("sub_scalar", a, move |x| x - s)
    }

    /// `self = s * a`.
    pub fn assign_product_of(&mut self, s: T, a: &Self) -> Result<()> {
        self.assign_unary_of("mul_scalar", a, move |x| s * x)
    }

    /// `self = a / s`.
    pub fn assign_quotient_of(&mut self, a: &Self, s: T) -> Result<()> {
        self.assign_unary_of("div_scalar", a, move |x| x / s)
    }

    /// `self[i] = self[i] ^ p`.
    pub fn in_place_element_pow(&mut self, p: T) -> Result<()> {
        self.apply_unary("element_pow", move |x| x.powf(p))
    }

    /// New matrix with `self[i] ^ p`.
    pub fn element_pow(&self, p: T) -> Result<Self> {
        self.mapped("element_pow", move |x| x.powf(p))
    }

    /// `self[i] = a[i] ^ p`.
    pub fn assign_element_power_of(&mut self, a: &Self, p: T) -> Result<()> {
        self.assign_unary_of("element_pow", a, move |x| x.powf(p))
    }

    // ---- matrix operations ----

    /// `self += b`, where `b` is 1x1, a column vector, a row vector, or the
    /// same shape as `self`.
    pub fn add_assign_matrix(&mut self, b: &Self) -> Result<()> {
        let broadcast = self.resolve_broadcast(b)?;
        self.apply_broadcast("add_matrix", b, broadcast, |x, y| x + y)
    }

    /// `self -= b`, broadcasting as [`add_assign_matrix`](Self::add_assign_matrix).
    pub fn sub_assign_matrix(&mut self, b: &Self) -> Result<()> {
        let broadcast = self.resolve_broadcast(b)?;
        self.apply_broadcast("sub_matrix", b, broadcast, |x, y| x - y)
    }

    /// `self = a + b`, with `b` broadcast over `a`.
    pub fn assign_sum_of(&mut self, a: &Self, b: &Self) -> Result<()> {
        self.assign_broadcast_of("add_matrix", a, b, |x, y| x + y)
    }

    /// `self = a - b`, with `b` broadcast over `a`.
    pub fn assign_difference_of(&mut self, a: &Self, b: &Self) -> Result<()> {
        self.assign_broadcast_of("sub_matrix", a, b, |x, y| x - y)
    }

    /// `self .*= b`.
    pub fn element_multiply_with(&mut self, b: &Self) -> Result<()> {
        self.apply_binary("element_multiply", b, |x, y| x * y)
    }

    /// `self = a .* b`.
    pub fn assign_element_product_of(&mut self, a: &Self, b: &Self) -> Result<()> {
        self.assign_binary_of("element_multiply", a, b, |x, y| x * y)
    }

    /// `self += a .* b`.
    pub fn add_element_product_of(&mut self, a: &Self, b: &Self) -> Result<()> {
        self.require_same_device(a)?;
        self.require_same_device(b)?;
        self.require_same_shape(a)?;
        self.require_same_shape(b)?;
        let (sa, sb) = (a.operand_for(self)?, b.operand_for(self)?);
        self.write_with("add_element_product", move |dst| {
            sa.with(|x| sb.with(|y| zip2_in_place(dst, x, y, |d, p, q| d + p * q)))?
        })
    }

    /// `self ./= b`.
    pub fn element_divide_by(&mut self, b: &Self) -> Result<()> {
        self.apply_binary("element_divide", b, |x, y| x / y)
    }

    /// `self = a ./ b`.
    pub fn assign_element_division_of(&mut self, a: &Self, b: &Self) -> Result<()> {
        self.assign_binary_of("element_divide", a, b, |x, y| x / y)
    }

    /// Scale row `r` by `a[r]`; `a` must be `rows x 1`.
    pub fn column_element_multiply_with(&mut self, a: &Self) -> Result<()> {
        self.require_vector_shape(a, Broadcast::Column)?;
        self.apply_broadcast("column_element_multiply", a, Broadcast::Column, |x, y| x * y)
    }

    /// Scale column `c` by `a[c]`; `a` must be `1 x cols`.
    pub fn row_element_multiply_with(&mut self, a: &Self) -> Result<()> {
        self.require_vector_shape(a, Broadcast::Row)?;
        self.apply_broadcast("row_element_multiply", a, Broadcast::Row, |x, y| x * y)
    }

    /// Divide row `r` by `a[r]`; `a` must be `rows x 1`.
    pub fn column_element_divide_by(&mut self, a: &Self) -> Result<()> {
        self.require_vector_shape(a, Broadcast::Column)?;
        self.apply_broadcast("column_element_divide", a, Broadcast::Column, |x, y| x / y)
    }

    /// Divide column `c` by `a[c]`; `a` must be `1 x cols`.
    pub fn row_element_divide_by(&mut self, a: &Self) -> Result<()> {
        self.require_vector_shape(a, Broadcast::Row)?;
        self.apply_broadcast("row_element_divide", a, Broadcast::Row, |x, y| x / y)
    }

    /// `self[i] = 1 / self[i]`.
    pub fn element_inverse(&mut self) -> Result<()> {
        self.apply_unary("element_inverse", |x| T::one() / x)
    }

    /// `self = sign(a)`.
    pub fn assign_sign_of(&mut self, a: &Self) -> Result<()> {
        self.assign_unary_of("sign", a, sign)
    }

    /// `self += sign(a)`.
    pub fn add_sign_of(&mut self, a: &Self) -> Result<()> {
        self.apply_binary("add_sign", a, |x, y| x + sign(y))
    }
}

impl<T: Scalar> Add<T> for &DeviceMatrix<T> {
    type Output = Result<DeviceMatrix<T>>;

    fn add(self, s: T) -> Self::Output {
        self.mapped("add_scalar", move |x| x + s)
    }
}

impl<T: Scalar> Sub<T> for &DeviceMatrix<T> {
    type Output = Result<DeviceMatrix<T>>;

    fn sub(self, s: T) -> Self::Output {
        self.mapped("sub_scalar", move |x| x - s)
    }
}

impl<T: Scalar> Mul<T> for &DeviceMatrix<T> {
    type Output = Result<DeviceMatrix<T>>;

    fn mul(self, s: T) -> Self::Output {
        self.mapped("mul_scalar", move |x| x * s)
    }
}

impl<T: Scalar> Div<T> for &DeviceMatrix<T> {
    type Output = Result<DeviceMatrix<T>>;

    fn div(self, s: T) -> Self::Output {
        self.mapped("div_scalar", move |x| x / s)
    }
}

impl<T: Scalar> Neg for &DeviceMatrix<T> {
    type Output = Result<DeviceMatrix<T>>;

    fn neg(self) -> Self::Output {
        self.mapped("negate", |x| -x)
    }
}

impl<T: Scalar> Add for &DeviceMatrix<T> {
    type Output = Result<DeviceMatrix<T>>;

    fn add(self, rhs: Self) -> Self::Output {
        let mut out = DeviceMatrix::new(&self.runtime, self.device)?;
        out.assign_sum_of(self, rhs)?;
        Ok(out)
    }
}

impl<T: Scalar> Sub for &DeviceMatrix<T> {
    type Output = Result<DeviceMatrix<T>>;

    fn sub(self, rhs: Self) -> Self::Output {
        let mut out = DeviceMatrix::new(&self.runtime, self.device)?;
        out.assign_difference_of(self, rhs)?;
        Ok(out)
    }
}

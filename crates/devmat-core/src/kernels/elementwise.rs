//! Element-wise kernels.

use super::for_each_column;
use crate::config::engine_config;
use crate::types::Scalar;
use rayon::prelude::*;

/// How a second operand is stretched over a `rows x cols` target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Broadcast {
    /// 1x1 operand applied to every element.
    Scalar,
    /// `rows x 1` operand applied to every column.
    Column,
    /// `1 x cols` operand applied to every row.
    Row,
    /// Same shape as the target.
    Full,
}

impl Broadcast {
    /// Broadcast of an `operand` shape over a `target` shape, if one exists.
    ///
    /// Same-shape takes precedence, then 1x1, then column, then row.
    pub fn resolve(target: (usize, usize), operand: (usize, usize)) -> Option<Self> {
        if operand == target {
            Some(Self::Full)
        } else if operand == (1, 1) {
            Some(Self::Scalar)
        } else if operand == (target.0, 1) {
            Some(Self::Column)
        } else if operand == (1, target.1) {
            Some(Self::Row)
        } else {
            None
        }
    }

    /// Offset into the operand for target element (r, c).
    #[inline]
    pub fn index(self, r: usize, c: usize, rows: usize) -> usize {
        match self {
            Self::Scalar => 0,
            Self::Column => r,
            Self::Row => c,
            Self::Full => c * rows + r,
        }
    }
}

/// `data[i] = f(data[i])`.
pub fn map_in_place<T, F>(data: &mut [T], f: F)
where
    T: Scalar,
    F: Fn(T) -> T + Sync + Send,
{
    let config = engine_config();
    if config.should_parallelize(data.len()) {
        data.par_iter_mut()
            .with_min_len(config.parallel_min_len)
            .for_each(|x| *x = f(*x));
    } else {
        data.iter_mut().for_each(|x| *x = f(*x));
    }
}

/// `dst[i] = f(src[i])`.
pub fn map_into<T, F>(dst: &mut [T], src: &[T], f: F)
where
    T: Scalar,
    F: Fn(T) -> T + Sync + Send,
{
    debug_assert_eq!(dst.len(), src.len());
    let config = engine_config();
    if config.should_parallelize(dst.len()) {
        dst.par_iter_mut()
            .zip(src.par_iter())
            .with_min_len(config.parallel_min_len)
            .for_each(|(d, &s)| *d = f(s));
    } else {
        dst.iter_mut().zip(src).for_each(|(d, &s)| *d = f(s));
    }
}

/// `dst[i] = f(dst[i], other[i])`.
pub fn zip_in_place<T, F>(dst: &mut [T], other: &[T], f: F)
where
    T: Scalar,
    F: Fn(T, T) -> T + Sync + Send,
{
    debug_assert_eq!(dst.len(), other.len());
    let config = engine_config();
    if config.should_parallelize(dst.len()) {
        dst.par_iter_mut()
            .zip(other.par_iter())
            .with_min_len(config.parallel_min_len)
            .for_each(|(d, &o)| *d = f(*d, o));
    } else {
        dst.iter_mut().zip(other).for_each(|(d, &o)| *d = f(*d, o));
    }
}

/// `dst[i] = f(a[i], b[i])`.
pub fn zip_into<T, F>(dst: &mut [T], a: &[T], b: &[T], f: F)
where
    T: Scalar,
    F: Fn(T, T) -> T + Sync + Send,
{
    debug_assert_eq!(dst.len(), a.len());
    debug_assert_eq!(dst.len(), b.len());
    let config = engine_config();
    if config.should_parallelize(dst.len()) {
        dst.par_iter_mut()
            .zip(a.par_iter().zip(b.par_iter()))
            .with_min_len(config.parallel_min_len)
            .for_each(|(d, (&x, &y))| *d = f(x, y));
    } else {
        dst.iter_mut()
            .zip(a.iter().zip(b))
            .for_each(|(d, (&x, &y))| *d = f(x, y));
    }
}

/// `dst[i] = f(dst[i], a[i], b[i])`.
pub fn zip2_in_place<T, F>(dst: &mut [T], a: &[T], b: &[T], f: F)
where
    T: Scalar,
    F: Fn(T, T, T) -> T + Sync + Send,
{
    debug_assert_eq!(dst.len(), a.len());
    debug_assert_eq!(dst.len(), b.len());
    let config = engine_config();
    if config.should_parallelize(dst.len()) {
        dst.par_iter_mut()
            .zip(a.par_iter().zip(b.par_iter()))
            .with_min_len(config.parallel_min_len)
            .for_each(|(d, (&x, &y))| *d = f(*d, x, y));
    } else {
        dst.iter_mut()
            .zip(a.iter().zip(b))
            .for_each(|(d, (&x, &y))| *d = f(*d, x, y));
    }
}

/// `dst[r, c] = f(dst[r, c], other[broadcast(r, c)])` over a `rows`-row target.
pub fn broadcast_in_place<T, F>(dst: &mut [T], rows: usize, other: &[T], broadcast: Broadcast, f: F)
where
    T: Scalar,
    F: Fn(T, T) -> T + Sync + Send,
{
    for_each_column(dst, rows, |c, column| {
        for (r, x) in column.iter_mut().enumerate() {
            *x = f(*x, other[broadcast.index(r, c, rows)]);
        }
    });
}

/// `dst[r, c] = f(a[r, c], b[broadcast(r, c)])` over a `rows`-row target.
pub fn broadcast_into<T, F>(dst: &mut [T], a: &[T], rows: usize, b: &[T], broadcast: Broadcast, f: F)
where
    T: Scalar,
    F: Fn(T, T) -> T + Sync + Send,
{
    debug_assert_eq!(dst.len(), a.len());
    for_each_column(dst, rows, |c, column| {
        let source = &a[c * rows..(c + 1) * rows];
        for (r, (x, &y)) in column.iter_mut().zip(source).enumerate() {
            *x = f(y, b[broadcast.index(r, c, rows)]);
        }
    });
}

/// Sign of `x`: 1, -1, or 0.
#[inline]
pub fn sign<T: Scalar>(x: T) -> T {
    if x > T::zero() {
        T::one()
    } else if x < T::zero() {
        -T::one()
    } else {
        T::zero()
    }
}

/// Logistic function, evaluated without overflow for large |x|.
#[inline]
pub fn sigmoid<T: Scalar>(x: T) -> T {
    if x >= T::zero() {
        T::one() / (T::one() + (-x).exp())
    } else {
        let e = x.exp();
        e / (T::one() + e)
    }
}

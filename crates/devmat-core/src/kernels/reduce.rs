//! Reduction kernels.
//!
//! Sums use a fixed two-level scheme: the input is cut into blocks of
//! [`EngineConfig::reduction_block`](crate::config::EngineConfig) elements,
//! each block is summed sequentially, and the block sums are combined by a
//! pairwise tree. The partition and the tree depend only on the length, so a
//! sum is bit-identical for any thread count.

use super::collect_indexed;
use crate::config::engine_config;
use crate::types::Scalar;

/// Sum of `term(i)` for `i in 0..len`.
pub fn tree_sum<T, F>(len: usize, term: F) -> T
where
    T: Scalar,
    F: Fn(usize) -> T + Sync + Send,
{
    let block = engine_config().reduction_block.max(1);
    let blocks = len.div_ceil(block);
    let partials = collect_indexed(blocks, len, |b| {
        let end = ((b + 1) * block).min(len);
        (b * block..end).fold(T::zero(), |acc, i| acc + term(i))
    });
    pairwise(&partials)
}

fn pairwise<T: Scalar>(values: &[T]) -> T {
    match values {
        [] => T::zero(),
        [single] => *single,
        _ => {
            let (left, right) = values.split_at(values.len() / 2);
            pairwise(left) + pairwise(right)
        }
    }
}

/// Sum of `f(x)` over a slice.
pub fn sum_by<T, F>(data: &[T], f: F) -> T
where
    T: Scalar,
    F: Fn(T) -> T + Sync + Send,
{
    tree_sum(data.len(), |i| f(data[i]))
}

/// Per-vector sums of `f(x)`: one per column, or one per row.
pub fn vector_sums<T, F>(data: &[T], rows: usize, cols: usize, col_wise: bool, f: F) -> Vec<T>
where
    T: Scalar,
    F: Fn(T) -> T + Sync + Send,
{
    if col_wise {
        collect_indexed(cols, data.len(), |c| {
            tree_sum(rows, |r| f(data[c * rows + r]))
        })
    } else {
        collect_indexed(rows, data.len(), |r| {
            tree_sum(cols, |c| f(data[c * rows + r]))
        })
    }
}

/// Per-vector maxima of `f(x)`.
pub fn vector_max_by<T, F>(data: &[T], rows: usize, cols: usize, col_wise: bool, f: F) -> Vec<T>
where
    T: Scalar,
    F: Fn(T) -> T + Sync + Send,
{
    vector_extremes(data, rows, cols, col_wise, |x| f(x), |a, b| a > b)
        .into_iter()
        .map(|(value, _)| value)
        .collect()
}

/// Per-vector extreme value and its index inside the vector.
///
/// `better(a, b)` decides whether `a` displaces the current best `b`; with a
/// strict comparison the first position wins ties. NaN never displaces.
pub fn vector_extremes<T, M, B>(
    data: &[T],
    rows: usize,
    cols: usize,
    col_wise: bool,
    map: M,
    better: B,
) -> Vec<(T, usize)>
where
    T: Scalar,
    M: Fn(T) -> T + Sync + Send,
    B: Fn(T, T) -> bool + Sync + Send,
{
    let (vectors, length) = if col_wise { (cols, rows) } else { (rows, cols) };
    if length == 0 {
        return Vec::new();
    }
    let at = |v: usize, i: usize| {
        if col_wise {
            data[v * rows + i]
        } else {
            data[i * rows + v]
        }
    };
    collect_indexed(vectors, data.len(), |v| {
        let mut best = (map(at(v, 0)), 0);
        for i in 1..length {
            let x = map(at(v, i));
            if better(x, best.0) || (best.0.is_nan() && !x.is_nan()) {
                best = (x, i);
            }
        }
        best
    })
}

/// Largest `f(x)` over a non-empty slice.
pub fn max_by<T, F>(data: &[T], f: F) -> T
where
    T: Scalar,
    F: Fn(T) -> T + Sync + Send,
{
    vector_max_by(data, data.len(), 1, true, f)
        .into_iter()
        .next()
        .unwrap_or_else(T::zero)
}

/// Number of elements satisfying `pred`.
pub fn count<T, P>(data: &[T], pred: P) -> usize
where
    T: Scalar,
    P: Fn(T) -> bool + Sync + Send,
{
    let block = engine_config().reduction_block.max(1);
    collect_indexed(data.len().div_ceil(block), data.len(), |b| {
        data[b * block..((b + 1) * block).min(data.len())]
            .iter()
            .filter(|&&x| pred(x))
            .count()
    })
    .into_iter()
    .sum()
}

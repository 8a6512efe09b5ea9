//! Device kernels over column-major slices.
//!
//! Kernels are plain functions on slices; the matrix layer resolves storage,
//! checks preconditions, and launches them through a
//! [`Stream`](crate::runtime::Stream). Work is split across the rayon pool
//! once it reaches [`EngineConfig::parallel_min_len`](crate::config::EngineConfig).

pub mod conv;
pub mod elementwise;
pub mod pool;
pub mod reduce;
pub mod softmax;

pub use conv::ConvolutionGeometry;
pub use elementwise::Broadcast;
pub use pool::PoolingGeometry;

use crate::config::engine_config;
use crate::error::{MatrixError, Result};
use rayon::prelude::*;

/// Product of geometry extents, failing instead of wrapping.
pub(crate) fn checked_product(what: &str, factors: &[usize]) -> Result<usize> {
    factors
        .iter()
        .try_fold(1usize, |acc, &f| acc.checked_mul(f))
        .ok_or_else(|| MatrixError::invalid_argument(format!("{what} overflows the element count")))
}

/// Apply `f` to every column `(index, column)` of a column-major buffer.
pub(crate) fn for_each_column<T, F>(data: &mut [T], rows: usize, f: F)
where
    T: Send,
    F: Fn(usize, &mut [T]) + Sync + Send,
{
    if rows == 0 || data.is_empty() {
        return;
    }
    if engine_config().should_parallelize(data.len()) {
        data.par_chunks_mut(rows)
            .enumerate()
            .for_each(|(j, column)| f(j, column));
    } else {
        data.chunks_mut(rows)
            .enumerate()
            .for_each(|(j, column)| f(j, column));
    }
}

/// Collect `f(i)` for `i in 0..len`, in order.
pub(crate) fn collect_indexed<T, F>(len: usize, work: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(usize) -> T + Sync + Send,
{
    if engine_config().should_parallelize(work) {
        (0..len).into_par_iter().map(f).collect()
    } else {
        (0..len).map(f).collect()
    }
}

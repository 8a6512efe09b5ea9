//! Softmax and log-softmax along columns or rows.
//!
//! Each vector is shifted by its maximum before exponentiation.

use super::{collect_indexed, for_each_column};
use crate::types::Scalar;

/// Per-vector `(max, log(sum(exp(x - max))))`.
fn normalisers<T: Scalar>(data: &[T], rows: usize, cols: usize, col_wise: bool) -> Vec<(T, T)> {
    let (vectors, length) = if col_wise { (cols, rows) } else { (rows, cols) };
    let at = |v: usize, i: usize| {
        if col_wise {
            data[v * rows + i]
        } else {
            data[i * rows + v]
        }
    };
    collect_indexed(vectors, data.len(), |v| {
        let max = (1..length).fold(at(v, 0), |m, i| m.max(at(v, i)));
        let sum = (0..length).fold(T::zero(), |acc, i| acc + (at(v, i) - max).exp());
        (max, sum.ln())
    })
}

/// Replace every column (or row) of `data` with its softmax, or its
/// log-softmax when `log` is set.
pub fn softmax_in_place<T: Scalar>(data: &mut [T], rows: usize, cols: usize, col_wise: bool, log: bool) {
    if rows == 0 || cols == 0 {
        return;
    }
    let norms = normalisers(data, rows, cols, col_wise);
    for_each_column(data, rows, |c, column| {
        for (r, x) in column.iter_mut().enumerate() {
            let (max, log_sum) = if col_wise { norms[c] } else { norms[r] };
            let shifted = *x - max - log_sum;
            *x = if log { shifted } else { shifted.exp() };
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_column_softmax_sums_to_one() {
        let mut data = vec![1.0f64, 2.0, 3.0, 1000.0, 1000.0, 1000.0];
        softmax_in_place(&mut data, 3, 2, true, false);
        assert_relative_eq!(data[..3].iter().sum::<f64>(), 1.0, epsilon = 1e-12);
        for x in &data[3..] {
            assert_relative_eq!(*x, 1.0 / 3.0, epsilon = 1e-12);
        }
        assert!(data[2] > data[1] && data[1] > data[0]);
    }

    #[test]
    fn test_row_log_softmax() {
        // rows: [0, ln 3], [5, 5]
        let mut data = vec![0.0f64, 5.0, 3.0f64.ln(), 5.0];
        softmax_in_place(&mut data, 2, 2, false, true);
        assert_relative_eq!(data[0], 0.25f64.ln(), epsilon = 1e-12);
        assert_relative_eq!(data[2], 0.75f64.ln(), epsilon = 1e-12);
        assert_relative_eq!(data[1], 0.5f64.ln(), epsilon = 1e-12);
        assert_relative_eq!(data[3], 0.5f64.ln(), epsilon = 1e-12);
    }
}

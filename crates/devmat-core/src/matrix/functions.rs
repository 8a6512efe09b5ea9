//! Element-wise transcendental functions, softmax, and truncation.

use super::DeviceMatrix;
use crate::error::{MatrixError, Result};
use crate::kernels::elementwise::sigmoid;
use crate::kernels::softmax::softmax_in_place;
use crate::types::Scalar;

macro_rules! element_functions {
    ($($(#[$doc:meta])* $in_place:ident, $assign:ident, $kernel:literal, $f:expr;)*) => {
        impl<T: Scalar> DeviceMatrix<T> {
            $(
                $(#[$doc])*
                pub fn $in_place(&mut self) -> Result<()> {
                    self.apply_unary($kernel, $f)
                }

                $(#[$doc])*
                ///
                /// Writes the result of applying the function to `a` into `self`.
                pub fn $assign(&mut self, a: &Self) -> Result<()> {
                    self.assign_unary_of($kernel, a, $f)
                }
            )*
        }
    };
}

element_functions! {
    /// Logistic sigmoid.
    in_place_sigmoid, assign_sigmoid_of, "sigmoid", sigmoid;
    /// Hyperbolic tangent.
    in_place_tanh, assign_tanh_of, "tanh", |x: T| x.tanh();
    /// Square root.
    in_place_sqrt, assign_sqrt_of, "sqrt", |x: T| x.sqrt();
    /// Natural exponential.
    in_place_exp, assign_exp_of, "exp", |x: T| x.exp();
    /// Natural logarithm.
    in_place_log, assign_log_of, "log", |x: T| x.ln();
    /// Absolute value.
    in_place_abs, assign_abs_of, "abs", |x: T| x.abs();
    /// Derivative of the linear rectifier: 1 where positive, 0 elsewhere.
    in_place_linear_rectifier_derivative, assign_linear_rectifier_derivative_of, "linear_rectifier_derivative",
        |x: T| if x > T::zero() { T::one() } else { T::zero() };
    /// Cosine.
    in_place_cosine, assign_cosine_of, "cosine", |x: T| x.cos();
    /// Negated sine, the derivative of cosine.
    in_place_negative_sine, assign_negative_sine_of, "negative_sine", |x: T| -x.sin();
    /// Sigmoid derivative from sigmoid outputs: `a * (1 - a)`.
    in_place_sigmoid_derivative, assign_sigmoid_derivative_of, "sigmoid_derivative",
        |a: T| a * (T::one() - a);
}

impl<T: Scalar> DeviceMatrix<T> {
    fn softmax(&mut self, kernel: &'static str, col_wise: bool, log: bool) -> Result<()> {
        let (rows, cols) = self.shape();
        self.write_with(kernel, move |data| {
            softmax_in_place(data, rows, cols, col_wise, log);
            Ok(())
        })
    }

    /// Softmax over each column (`col_wise`) or each row.
    pub fn in_place_softmax(&mut self, col_wise: bool) -> Result<()> {
        self.softmax("softmax", col_wise, false)
    }

    /// Log-softmax over each column (`col_wise`) or each row.
    pub fn in_place_log_softmax(&mut self, col_wise: bool) -> Result<()> {
        self.softmax("log_softmax", col_wise, true)
    }

    /// `self = softmax(a)`.
    pub fn assign_softmax_of(&mut self, a: &Self, col_wise: bool) -> Result<()> {
        self.assign_unary_of("copy", a, |x| x)?;
        self.in_place_softmax(col_wise)
    }

    /// `self = log_softmax(a)`.
    pub fn assign_log_softmax_of(&mut self, a: &Self, col_wise: bool) -> Result<()> {
        self.assign_unary_of("copy", a, |x| x)?;
        self.in_place_log_softmax(col_wise)
    }

    /// Raise every element below `threshold` to `threshold`.
    pub fn truncate_bottom(&mut self, threshold: T) -> Result<()> {
        self.apply_unary("truncate_bottom", move |x| if x < threshold { threshold } else { x })
    }

    /// Lower every element above `threshold` to `threshold`.
    pub fn truncate_top(&mut self, threshold: T) -> Result<()> {
        self.apply_unary("truncate_top", move |x| if x > threshold { threshold } else { x })
    }

    /// Zero every element whose magnitude is below `threshold`.
    pub fn set_to_zero_if_abs_less_than(&mut self, threshold: T) -> Result<()> {
        self.apply_unary("set_to_zero_if_abs_less_than", move |x| {
            if x.abs() < threshold {
                T::zero()
            } else {
                x
            }
        })
    }

    /// Clamp every element to `[-|threshold|, |threshold|]`.
    pub fn truncate(&mut self, threshold: T) -> Result<()> {
        if threshold.is_nan() {
            return Err(MatrixError::invalid_argument("truncation threshold is NaN"));
        }
        let bound = threshold.abs();
        self.apply_unary("truncate", move |x| {
            if x > bound {
                bound
            } else if x < -bound {
                -bound
            } else {
                x
            }
        })
    }
}

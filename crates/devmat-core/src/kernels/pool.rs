//! Max and average pooling, forward and backward.
//!
//! Windows are scanned row by row (y outer, x inner). Output size along an
//! axis is `(input - window) / stride + 1`, and a stride wider than the
//! window is rejected since it would skip input elements.

use super::{checked_product, for_each_column};
use crate::error::{MatrixError, Result};
use crate::types::Scalar;

/// Shape of a pooling operation over multi-channel samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PoolingGeometry {
    /// Input width
    pub input_width: usize,
    /// Input height
    pub input_height: usize,
    /// Channels, pooled independently
    pub channels: usize,
    /// Window width
    pub window_width: usize,
    /// Window height
    pub window_height: usize,
    /// Horizontal stride
    pub horizontal_stride: usize,
    /// Vertical stride
    pub vertical_stride: usize,
}

impl PoolingGeometry {
    /// Non-overlapping square windows of side `window`.
    pub fn square(input_width: usize, input_height: usize, channels: usize, window: usize) -> Self {
        Self {
            input_width,
            input_height,
            channels,
            window_width: window,
            window_height: window,
            horizontal_stride: window,
            vertical_stride: window,
        }
    }

    /// Set both strides.
    pub fn with_stride(mut self, horizontal: usize, vertical: usize) -> Self {
        self.horizontal_stride = horizontal;
        self.vertical_stride = vertical;
        self
    }

    /// Reject degenerate geometries.
    pub fn validate(&self) -> Result<()> {
        if self.input_width == 0 || self.input_height == 0 || self.channels == 0 {
            return Err(MatrixError::invalid_argument("pooling input has a zero dimension"));
        }
        if self.window_width == 0 || self.window_height == 0 {
            return Err(MatrixError::invalid_argument("pooling window has a zero dimension"));
        }
        if self.horizontal_stride == 0 || self.vertical_stride == 0 {
            return Err(MatrixError::invalid_argument("pooling stride must be positive"));
        }
        if self.horizontal_stride > self.window_width || self.vertical_stride > self.window_height {
            return Err(MatrixError::invalid_argument(format!(
                "pooling stride {}x{} exceeds window {}x{}",
                self.horizontal_stride, self.vertical_stride, self.window_width, self.window_height
            )));
        }
        if self.window_width > self.input_width || self.window_height > self.input_height {
            return Err(MatrixError::invalid_argument(format!(
                "pooling window {}x{} larger than input {}x{}",
                self.window_width, self.window_height, self.input_width, self.input_height
            )));
        }
        self.input_size()?;
        self.output_size()?;
        Ok(())
    }

    /// Output width.
    pub fn output_width(&self) -> usize {
        (self.input_width - self.window_width) / self.horizontal_stride + 1
    }

    /// Output height.
    pub fn output_height(&self) -> usize {
        (self.input_height - self.window_height) / self.vertical_stride + 1
    }

    /// Elements per input sample.
    pub fn input_size(&self) -> Result<usize> {
        checked_product("pooling input", &[self.input_width, self.input_height, self.channels])
    }

    /// Elements per output sample.
    pub fn output_size(&self) -> Result<usize> {
        checked_product("pooling output", &[self.output_width(), self.output_height(), self.channels])
    }

    /// Elements per window.
    fn window_area<T: Scalar>(&self) -> Result<T> {
        checked_product("pooling window", &[self.window_width, self.window_height]).map(|n| T::of_f64(n as f64))
    }

    /// Visit every output position as `(output offset, input offsets of its
    /// window in scan order)` within one sample.
    fn windows(&self, mut visit: impl FnMut(usize, &mut dyn Iterator<Item = usize>)) {
        let (ow, oh) = (self.output_width(), self.output_height());
        let (w, h) = (self.input_width, self.input_height);
        for c in 0..self.channels {
            for oy in 0..oh {
                for ox in 0..ow {
                    let x0 = ox * self.horizontal_stride;
                    let y0 = oy * self.vertical_stride;
                    let mut window = (y0..y0 + self.window_height).flat_map(move |y| {
                        (x0..x0 + self.window_width).map(move |x| x + w * (y + h * c))
                    });
                    visit(ox + ow * (oy + oh * c), &mut window);
                }
            }
        }
    }

    fn first_max<T: Scalar>(input: &[T], window: &mut dyn Iterator<Item = usize>) -> Option<usize> {
        let mut best: Option<usize> = None;
        for i in window {
            let replace = match best {
                None => true,
                Some(b) => input[i] > input[b] || (input[b].is_nan() && !input[i].is_nan()),
            };
            if replace {
                best = Some(i);
            }
        }
        best
    }
}

/// `output[o] = max(input[window(o)])`.
pub fn max_forward<T: Scalar>(output: &mut [T], input: &[T], g: &PoolingGeometry) -> Result<()> {
    let (in_size, out_size) = (g.input_size()?, g.output_size()?);
    for_each_column(output, out_size, |s, column| {
        let sample = &input[s * in_size..(s + 1) * in_size];
        g.windows(|o, window| {
            if let Some(i) = PoolingGeometry::first_max(sample, window) {
                column[o] = sample[i];
            }
        });
    });
    Ok(())
}

/// `input_grad[argmax(window(o))] += output_grad[o]`, first max wins.
pub fn max_backward<T: Scalar>(
    input_grad: &mut [T],
    output_grad: &[T],
    input: &[T],
    g: &PoolingGeometry,
) -> Result<()> {
    let (in_size, out_size) = (g.input_size()?, g.output_size()?);
    for_each_column(input_grad, in_size, |s, column| {
        let sample = &input[s * in_size..(s + 1) * in_size];
        let grad = &output_grad[s * out_size..(s + 1) * out_size];
        g.windows(|o, window| {
            if let Some(i) = PoolingGeometry::first_max(sample, window) {
                column[i] += grad[o];
            }
        });
    });
    Ok(())
}

/// `output[o] = mean(input[window(o)])`.
pub fn average_forward<T: Scalar>(output: &mut [T], input: &[T], g: &PoolingGeometry) -> Result<()> {
    let (in_size, out_size) = (g.input_size()?, g.output_size()?);
    let count: T = g.window_area()?;
    for_each_column(output, out_size, |s, column| {
        let sample = &input[s * in_size..(s + 1) * in_size];
        g.windows(|o, window| {
            column[o] = window.fold(T::zero(), |acc, i| acc + sample[i]) / count;
        });
    });
    Ok(())
}

/// `input_grad[window(o)] += output_grad[o] / window size`.
pub fn average_backward<T: Scalar>(input_grad: &mut [T], output_grad: &[T], g: &PoolingGeometry) -> Result<()> {
    let (in_size, out_size) = (g.input_size()?, g.output_size()?);
    let count: T = g.window_area()?;
    for_each_column(input_grad, in_size, |s, column| {
        let grad = &output_grad[s * out_size..(s + 1) * out_size];
        g.windows(|o, window| {
            let share = grad[o] / count;
            for i in window {
                column[i] += share;
            }
        });
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation() {
        assert!(PoolingGeometry::square(4, 4, 1, 2).validate().is_ok());
        assert!(PoolingGeometry::square(4, 4, 1, 2)
            .with_stride(3, 2)
            .validate()
            .is_err());
        assert!(PoolingGeometry::square(1, 4, 1, 2).validate().is_err());
    }

    #[test]
    fn test_oversized_geometry_is_rejected() {
        let g = PoolingGeometry::square(usize::MAX / 2, 8, 4, 2);
        let err = g.validate().unwrap_err();
        assert!(matches!(err, MatrixError::InvalidArgument { .. }));
        assert!(g.input_size().is_err());
        assert!(g.output_size().is_err());
    }

    #[test]
    fn test_overlapping_output_size() {
        let g = PoolingGeometry::square(5, 5, 2, 3).with_stride(1, 2);
        assert_eq!((g.output_width(), g.output_height()), (3, 2));
        assert_eq!(g.output_size().unwrap(), 12);
    }

    #[test]
    fn test_max_forward_and_ties() {
        // 2x2 window over a 2x2 image with a tie between offsets 1 and 2
        let input = [1.0f64, 5.0, 5.0, 0.0];
        let g = PoolingGeometry::square(2, 2, 1, 2);
        let mut out = [0.0];
        max_forward(&mut out, &input, &g).unwrap();
        assert_eq!(out, [5.0]);

        let mut grad = [0.0; 4];
        max_backward(&mut grad, &[3.0], &input, &g).unwrap();
        assert_eq!(grad, [0.0, 3.0, 0.0, 0.0]);
    }

    #[test]
    fn test_average_pooling() {
        let input = [1.0f32, 2.0, 3.0, 4.0, 10.0, 20.0, 30.0, 40.0];
        let g = PoolingGeometry::square(2, 2, 2, 2);
        let mut out = [0.0; 2];
        average_forward(&mut out, &input, &g).unwrap();
        assert_eq!(out, [2.5, 25.0]);

        let mut grad = [0.0; 8];
        average_backward(&mut grad, &[4.0, 8.0], &g).unwrap();
        assert_eq!(grad, [1.0, 1.0, 1.0, 1.0, 2.0, 2.0, 2.0, 2.0]);
    }
}

//! Convolution input packing (im2col) and its scatter-add inverse.
//!
//! Tensors hold one sample per column; inside a column element
//! `(x, y, channel)` lives at `x + width * (y + height * channel)`. The
//! packed matrix has one row per kernel tap, `kx + kw * (ky + kh * channel)`,
//! and one column per output position, `ox + ow * (oy + oh * sample)`.

use super::{checked_product, for_each_column};
use crate::error::{MatrixError, Result};
use crate::types::Scalar;

/// Shape of a 2-D convolution over multi-channel samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConvolutionGeometry {
    /// Input width
    pub input_width: usize,
    /// Input height
    pub input_height: usize,
    /// Input channels
    pub input_channels: usize,
    /// Kernel width
    pub kernel_width: usize,
    /// Kernel height
    pub kernel_height: usize,
    /// Horizontal stride
    pub horizontal_stride: usize,
    /// Vertical stride
    pub vertical_stride: usize,
    /// Centre the kernel and read zeros outside the input
    pub zero_padding: bool,
}

impl ConvolutionGeometry {
    /// Unit-stride geometry without padding.
    pub fn new(
        input_width: usize,
        input_height: usize,
        input_channels: usize,
        kernel_width: usize,
        kernel_height: usize,
    ) -> Self {
        Self {
            input_width,
            input_height,
            input_channels,
            kernel_width,
            kernel_height,
            horizontal_stride: 1,
            vertical_stride: 1,
            zero_padding: false,
        }
    }

    /// Set both strides.
    pub fn with_stride(mut self, horizontal: usize, vertical: usize) -> Self {
        self.horizontal_stride = horizontal;
        self.vertical_stride = vertical;
        self
    }

    /// Enable or disable zero padding.
    pub fn with_zero_padding(mut self, zero_padding: bool) -> Self {
        self.zero_padding = zero_padding;
        self
    }

    /// Reject degenerate geometries.
    pub fn validate(&self) -> Result<()> {
        if self.input_width == 0 || self.input_height == 0 || self.input_channels == 0 {
            return Err(MatrixError::invalid_argument("convolution input has a zero dimension"));
        }
        if self.kernel_width == 0 || self.kernel_height == 0 {
            return Err(MatrixError::invalid_argument("convolution kernel has a zero dimension"));
        }
        if self.horizontal_stride == 0 || self.vertical_stride == 0 {
            return Err(MatrixError::invalid_argument("convolution stride must be positive"));
        }
        if !self.zero_padding
            && (self.kernel_width > self.input_width || self.kernel_height > self.input_height)
        {
            return Err(MatrixError::invalid_argument(format!(
                "kernel {}x{} larger than unpadded input {}x{}",
                self.kernel_width, self.kernel_height, self.input_width, self.input_height
            )));
        }
        self.input_size()?;
        self.packed_rows()?;
        self.packed_cols(1)?;
        Ok(())
    }

    fn output_extent(input: usize, kernel: usize, stride: usize, padded: bool) -> usize {
        if padded {
            (input - 1) / stride + 1
        } else {
            (input - kernel) / stride + 1
        }
    }

    /// Output width.
    pub fn output_width(&self) -> usize {
        Self::output_extent(self.input_width, self.kernel_width, self.horizontal_stride, self.zero_padding)
    }

    /// Output height.
    pub fn output_height(&self) -> usize {
        Self::output_extent(self.input_height, self.kernel_height, self.vertical_stride, self.zero_padding)
    }

    /// Elements per input sample.
    pub fn input_size(&self) -> Result<usize> {
        checked_product(
            "convolution input",
            &[self.input_width, self.input_height, self.input_channels],
        )
    }

    /// Rows of the packed matrix.
    pub fn packed_rows(&self) -> Result<usize> {
        checked_product(
            "convolution kernel",
            &[self.kernel_width, self.kernel_height, self.input_channels],
        )
    }

    /// Columns of the packed matrix for `samples` samples.
    pub fn packed_cols(&self, samples: usize) -> Result<usize> {
        checked_product(
            "packed convolution input",
            &[self.output_width(), self.output_height(), samples],
        )
    }

    /// Input offset read by packed element (`row`, `col`), or `None` for
    /// padding.
    #[inline]
    fn source(&self, input_size: usize, row: usize, col: usize) -> Option<usize> {
        let (kw, kh) = (self.kernel_width, self.kernel_height);
        let (ow, oh) = (self.output_width(), self.output_height());
        let kx = row % kw;
        let ky = (row / kw) % kh;
        let channel = row / (kw * kh);
        let ox = col % ow;
        let oy = (col / ow) % oh;
        let sample = col / (ow * oh);

        let (x, y) = if self.zero_padding {
            let x = (ox * self.horizontal_stride + kx).checked_sub(kw / 2)?;
            let y = (oy * self.vertical_stride + ky).checked_sub(kh / 2)?;
            (x, y)
        } else {
            (ox * self.horizontal_stride + kx, oy * self.vertical_stride + ky)
        };
        if x >= self.input_width || y >= self.input_height {
            return None;
        }
        Some(sample * input_size + x + self.input_width * (y + self.input_height * channel))
    }
}

/// Fill `packed` (`packed_rows x packed_cols(samples)`) from `input`.
pub fn pack<T: Scalar>(packed: &mut [T], input: &[T], geometry: &ConvolutionGeometry) -> Result<()> {
    let (rows, input_size) = (geometry.packed_rows()?, geometry.input_size()?);
    for_each_column(packed, rows, |col, column| {
        for (row, x) in column.iter_mut().enumerate() {
            *x = geometry.source(input_size, row, col).map_or_else(T::zero, |i| input[i]);
        }
    });
    Ok(())
}

/// Add every packed element back onto the input position it was read from.
pub fn unpack_add<T: Scalar>(input: &mut [T], packed: &[T], geometry: &ConvolutionGeometry) -> Result<()> {
    let rows = geometry.packed_rows()?;
    let per_sample = geometry.packed_cols(1)?;
    let input_size = geometry.input_size()?;
    for_each_column(input, input_size, |sample, column| {
        let base = sample * input_size;
        for col in sample * per_sample..(sample + 1) * per_sample {
            for row in 0..rows {
                if let Some(i) = geometry.source(input_size, row, col) {
                    column[i - base] += packed[col * rows + row];
                }
            }
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_sizes() {
        let g = ConvolutionGeometry::new(5, 4, 1, 3, 2);
        assert_eq!((g.output_width(), g.output_height()), (3, 3));
        let g = g.with_stride(2, 2);
        assert_eq!((g.output_width(), g.output_height()), (2, 2));
        let g = g.with_zero_padding(true);
        assert_eq!((g.output_width(), g.output_height()), (3, 2));
    }

    #[test]
    fn test_validation() {
        assert!(ConvolutionGeometry::new(2, 2, 1, 3, 1).validate().is_err());
        assert!(ConvolutionGeometry::new(2, 2, 1, 3, 1)
            .with_zero_padding(true)
            .validate()
            .is_ok());
        assert!(ConvolutionGeometry::new(2, 2, 1, 1, 1)
            .with_stride(0, 1)
            .validate()
            .is_err());
    }

    #[test]
    fn test_oversized_geometry_is_rejected() {
        let huge = usize::MAX / 2;
        let g = ConvolutionGeometry::new(huge, 4, 1, 1, 1);
        let err = g.validate().unwrap_err();
        assert!(matches!(err, MatrixError::InvalidArgument { .. }));
        assert!(g.input_size().is_err());

        let g = ConvolutionGeometry::new(4, 4, 1, 2, 2);
        assert_eq!(g.packed_cols(2).unwrap(), 18);
        assert!(g.packed_cols(usize::MAX).is_err());
    }

    #[test]
    fn test_pack_single_channel() {
        // 3x2 image, values = offset
        let input: Vec<f64> = (0..6).map(f64::from).collect();
        let g = ConvolutionGeometry::new(3, 2, 1, 2, 2);
        let mut packed = vec![0.0; g.packed_rows().unwrap() * g.packed_cols(1).unwrap()];
        pack(&mut packed, &input, &g).unwrap();
        // two output positions, taps (0,0) (1,0) (0,1) (1,1)
        assert_eq!(packed, vec![0.0, 1.0, 3.0, 4.0, 1.0, 2.0, 4.0, 5.0]);
    }

    #[test]
    fn test_pack_with_padding_reads_zeros() {
        let input = vec![1.0f32; 4];
        let g = ConvolutionGeometry::new(2, 2, 1, 3, 3).with_zero_padding(true);
        let mut packed = vec![9.0; g.packed_rows().unwrap() * g.packed_cols(1).unwrap()];
        pack(&mut packed, &input, &g).unwrap();
        // first output position (0, 0) sees the top-left 2x2 corner only
        let first: f32 = packed[..9].iter().sum();
        assert_eq!(first, 4.0);
        assert_eq!(packed[0], 0.0);
        assert_eq!(packed[4], 1.0);
    }

    #[test]
    fn test_unpack_counts_overlaps() {
        let g = ConvolutionGeometry::new(3, 1, 1, 2, 1);
        let packed = vec![1.0f64; g.packed_rows().unwrap() * g.packed_cols(2).unwrap()];
        let mut input = vec![0.0; g.input_size().unwrap() * 2];
        unpack_add(&mut input, &packed, &g).unwrap();
        assert_eq!(input, vec![1.0, 2.0, 1.0, 1.0, 2.0, 1.0]);
    }
}

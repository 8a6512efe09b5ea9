//! Convolution packing and pooling over sample-per-column tensors.

use super::DeviceMatrix;
use crate::error::{MatrixError, Result};
use crate::kernels::{conv, pool, ConvolutionGeometry, PoolingGeometry};
use crate::types::Scalar;

impl<T: Scalar> DeviceMatrix<T> {
    fn require_rows(&self, rows: usize, what: &str) -> Result<()> {
        if self.rows != rows {
            return Err(MatrixError::dimension_mismatch(
                format!("{what} with {rows} rows"),
                format!("{}x{}", self.rows, self.cols),
            ));
        }
        Ok(())
    }

    /// Unfold convolution windows of `input` (one sample per column) into
    /// columns of `self`, reading zeros for padding.
    pub fn assign_packed_convolution_input(&mut self, input: &Self, geometry: &ConvolutionGeometry) -> Result<()> {
        self.require_same_device(input)?;
        geometry.validate()?;
        input.require_rows(geometry.input_size()?, "convolution input")?;
        let src = input.operand_for(self)?;
        self.resize(geometry.packed_rows()?, geometry.packed_cols(input.cols)?, true)?;
        let geometry = *geometry;
        self.write_with("pack_convolution_input", move |dst| src.with(|x| conv::pack(dst, x, &geometry))?)
    }

    /// Add every element of `packed` back onto the input position it was
    /// unfolded from. `self` holds the input gradient.
    pub fn unpack_convolution_input(&mut self, packed: &Self, geometry: &ConvolutionGeometry) -> Result<()> {
        self.require_same_device(packed)?;
        geometry.validate()?;
        self.require_rows(geometry.input_size()?, "convolution input")?;
        let expected = (geometry.packed_rows()?, geometry.packed_cols(self.cols)?);
        if packed.shape() != expected {
            return Err(MatrixError::shape_mismatch(expected, packed.shape()));
        }
        let src = packed.operand_for(self)?;
        let geometry = *geometry;
        self.write_with("unpack_convolution_input", move |dst| {
            src.with(|x| conv::unpack_add(dst, x, &geometry))?
        })
    }

    /// `self = max pooling of input`.
    pub fn assign_max_pooling_result(&mut self, input: &Self, geometry: &PoolingGeometry) -> Result<()> {
        self.require_same_device(input)?;
        geometry.validate()?;
        input.require_rows(geometry.input_size()?, "pooling input")?;
        let src = input.operand_for(self)?;
        self.resize(geometry.output_size()?, input.cols, true)?;
        let geometry = *geometry;
        self.write_with("max_pooling", move |dst| src.with(|x| pool::max_forward(dst, x, &geometry))?)
    }

    /// Route each output gradient to the first maximum of its window in
    /// `input`, adding into `self`.
    pub fn add_max_pooling_gradient(
        &mut self,
        output_gradient: &Self,
        input: &Self,
        geometry: &PoolingGeometry,
    ) -> Result<()> {
        self.require_same_device(output_gradient)?;
        self.require_same_device(input)?;
        geometry.validate()?;
        self.require_rows(geometry.input_size()?, "pooling input gradient")?;
        self.require_same_shape(input)?;
        let expected = (geometry.output_size()?, self.cols);
        if output_gradient.shape() != expected {
            return Err(MatrixError::shape_mismatch(expected, output_gradient.shape()));
        }
        let grad = output_gradient.operand_for(self)?;
        let values = input.operand_for(self)?;
        let geometry = *geometry;
        self.write_with("max_pooling_gradient", move |dst| {
            grad.with(|g| values.with(|x| pool::max_backward(dst, g, x, &geometry)))??
        })
    }

    /// `self = average pooling of input`.
    pub fn assign_average_pooling_result(&mut self, input: &Self, geometry: &PoolingGeometry) -> Result<()> {
        self.require_same_device(input)?;
        geometry.validate()?;
        input.require_rows(geometry.input_size()?, "pooling input")?;
        let src = input.operand_for(self)?;
        self.resize(geometry.output_size()?, input.cols, true)?;
        let geometry = *geometry;
        self.write_with("average_pooling", move |dst| {
            src.with(|x| pool::average_forward(dst, x, &geometry))?
        })
    }

    /// Spread each output gradient evenly over its window, adding into
    /// `self`.
    pub fn add_average_pooling_gradient(&mut self, output_gradient: &Self, geometry: &PoolingGeometry) -> Result<()> {
        self.require_same_device(output_gradient)?;
        geometry.validate()?;
        self.require_rows(geometry.input_size()?, "pooling input gradient")?;
        let expected = (geometry.output_size()?, self.cols);
        if output_gradient.shape() != expected {
            return Err(MatrixError::shape_mismatch(expected, output_gradient.shape()));
        }
        let grad = output_gradient.operand_for(self)?;
        let geometry = *geometry;
        self.write_with("average_pooling_gradient", move |dst| {
            grad.with(|g| pool::average_backward(dst, g, &geometry))?
        })
    }
}

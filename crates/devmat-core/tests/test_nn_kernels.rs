//! Convolution packing and pooling through the matrix interface.

use approx::assert_relative_eq;
use devmat_core::prelude::*;
use pretty_assertions::assert_eq;
use std::sync::Arc;

const GPU: DeviceId = DeviceId::Gpu(0);

fn matrix(runtime: &Arc<DeviceRuntime>, rows: usize, cols: usize, data: &[f64]) -> DeviceMatrix<f64> {
    DeviceMatrix::from_slice(runtime, GPU, rows, cols, data, Layout::ColumnMajor).unwrap()
}

/// One 4x4 single-channel sample, stored at `x + 4 * y`:
///
/// ```text
/// 1 5 2 0
/// 3 5 7 7
/// 0 0 1 9
/// 0 0 9 2
/// ```
const POOL_INPUT: [f64; 16] = [
    1.0, 5.0, 2.0, 0.0, 3.0, 5.0, 7.0, 7.0, 0.0, 0.0, 1.0, 9.0, 0.0, 0.0, 9.0, 2.0,
];

#[test]
fn test_max_pooling_forward() {
    let rt = DeviceRuntime::with_devices(1);
    let geometry = PoolingGeometry::square(4, 4, 1, 2);
    let input = matrix(&rt, 16, 1, &POOL_INPUT);
    let mut output = DeviceMatrix::new(&rt, GPU).unwrap();
    output.assign_max_pooling_result(&input, &geometry).unwrap();
    assert_eq!(output.shape(), (4, 1));
    assert_eq!(output.to_vec().unwrap(), vec![5.0, 7.0, 0.0, 9.0]);
}

#[test]
fn test_max_pooling_gradient_goes_to_first_maximum() {
    let rt = DeviceRuntime::with_devices(1);
    let geometry = PoolingGeometry::square(4, 4, 1, 2);
    let input = matrix(&rt, 16, 1, &POOL_INPUT);
    let output_gradient = matrix(&rt, 4, 1, &[1.0, 2.0, 3.0, 4.0]);
    let mut input_gradient = DeviceMatrix::zeros(&rt, GPU, 16, 1).unwrap();
    input_gradient
        .add_max_pooling_gradient(&output_gradient, &input, &geometry)
        .unwrap();

    let mut expected = vec![0.0; 16];
    expected[1] = 1.0; // 5 at (1, 0) precedes 5 at (1, 1)
    expected[6] = 2.0; // 7 at (2, 1) precedes 7 at (3, 1)
    expected[8] = 3.0; // all-zero window: first position
    expected[11] = 4.0; // 9 at (3, 2) precedes 9 at (2, 3)
    assert_eq!(input_gradient.to_vec().unwrap(), expected);

    // gradients accumulate
    input_gradient
        .add_max_pooling_gradient(&output_gradient, &input, &geometry)
        .unwrap();
    assert_eq!(input_gradient.value_at(11, 0).unwrap(), 8.0);
}

#[test]
fn test_average_pooling_forward_and_backward() {
    let rt = DeviceRuntime::with_devices(1);
    let geometry = PoolingGeometry::square(4, 4, 1, 2);
    let input = matrix(&rt, 16, 1, &POOL_INPUT);
    let mut output = DeviceMatrix::new(&rt, GPU).unwrap();
    output.assign_average_pooling_result(&input, &geometry).unwrap();
    assert_eq!(output.to_vec().unwrap(), vec![3.5, 4.0, 0.0, 5.25]);

    let output_gradient = matrix(&rt, 4, 1, &[4.0, 8.0, 12.0, 16.0]);
    let mut input_gradient = DeviceMatrix::zeros(&rt, GPU, 16, 1).unwrap();
    input_gradient
        .add_average_pooling_gradient(&output_gradient, &geometry)
        .unwrap();
    assert_eq!(
        input_gradient.to_vec().unwrap(),
        vec![1.0, 1.0, 2.0, 2.0, 1.0, 1.0, 2.0, 2.0, 3.0, 3.0, 4.0, 4.0, 3.0, 3.0, 4.0, 4.0]
    );
}

#[test]
fn test_pooling_rejects_bad_geometry() {
    let rt = DeviceRuntime::with_devices(1);
    let input = matrix(&rt, 16, 1, &POOL_INPUT);
    let mut output = DeviceMatrix::new(&rt, GPU).unwrap();

    let skipping = PoolingGeometry::square(4, 4, 1, 2).with_stride(3, 3);
    assert!(matches!(
        output.assign_max_pooling_result(&input, &skipping),
        Err(MatrixError::InvalidArgument { .. })
    ));

    let wrong_size = PoolingGeometry::square(3, 3, 1, 2);
    assert!(matches!(
        output.assign_average_pooling_result(&input, &wrong_size),
        Err(MatrixError::DimensionMismatch { .. })
    ));
}

#[test]
fn test_overlapping_max_pooling_over_two_samples() {
    let rt = DeviceRuntime::with_devices(1);
    // 3x1 input, window 2, stride 1: two outputs per sample
    let geometry = PoolingGeometry {
        input_width: 3,
        input_height: 1,
        channels: 1,
        window_width: 2,
        window_height: 1,
        horizontal_stride: 1,
        vertical_stride: 1,
    };
    let input = matrix(&rt, 3, 2, &[1.0, 3.0, 2.0, 6.0, 5.0, 4.0]);
    let mut output = DeviceMatrix::new(&rt, GPU).unwrap();
    output.assign_max_pooling_result(&input, &geometry).unwrap();
    assert_eq!(output.shape(), (2, 2));
    assert_eq!(output.to_vec().unwrap(), vec![3.0, 3.0, 6.0, 5.0]);

    let mut gradient = DeviceMatrix::zeros(&rt, GPU, 3, 2).unwrap();
    let ones = matrix(&rt, 2, 2, &[1.0; 4]);
    gradient.add_max_pooling_gradient(&ones, &input, &geometry).unwrap();
    assert_eq!(gradient.to_vec().unwrap(), vec![0.0, 2.0, 0.0, 1.0, 1.0, 0.0]);
}

#[test]
fn test_convolution_packing() {
    let rt = DeviceRuntime::with_devices(1);
    // 3x3 single-channel sample holding 0..9 at x + 3 * y
    let geometry = ConvolutionGeometry::new(3, 3, 1, 2, 2);
    let data: Vec<f64> = (0..9).map(f64::from).collect();
    let input = matrix(&rt, 9, 1, &data);

    let mut packed = DeviceMatrix::new(&rt, GPU).unwrap();
    packed.assign_packed_convolution_input(&input, &geometry).unwrap();
    assert_eq!(packed.shape(), (4, 4));
    assert_eq!(
        packed.to_vec().unwrap(),
        vec![0.0, 1.0, 3.0, 4.0, 1.0, 2.0, 4.0, 5.0, 3.0, 4.0, 6.0, 7.0, 4.0, 5.0, 7.0, 8.0]
    );

    // unpacking ones counts how many windows cover each input position
    let ones = matrix(&rt, 4, 4, &[1.0; 16]);
    let mut coverage = DeviceMatrix::zeros(&rt, GPU, 9, 1).unwrap();
    coverage.unpack_convolution_input(&ones, &geometry).unwrap();
    assert_eq!(
        coverage.to_vec().unwrap(),
        vec![1.0, 2.0, 1.0, 2.0, 4.0, 2.0, 1.0, 2.0, 1.0]
    );
}

#[test]
fn test_packed_convolution_matches_direct_sum() {
    let rt = DeviceRuntime::with_devices(1);
    let geometry = ConvolutionGeometry::new(3, 3, 1, 2, 2);
    let data: Vec<f64> = (0..9).map(f64::from).collect();
    let input = matrix(&rt, 9, 1, &data);
    let mut packed = DeviceMatrix::new(&rt, GPU).unwrap();
    packed.assign_packed_convolution_input(&input, &geometry).unwrap();

    // a single all-ones filter sums each 2x2 window
    let filter = matrix(&rt, 1, 4, &[1.0; 4]);
    let mut response = DeviceMatrix::new(&rt, GPU).unwrap();
    DeviceMatrix::multiply(&filter, false, &packed, false, &mut response).unwrap();
    let sums = response.to_vec().unwrap();
    for (got, want) in sums.iter().zip([8.0, 12.0, 20.0, 24.0]) {
        assert_relative_eq!(*got, want);
    }
}

#[test]
fn test_zero_padded_packing_keeps_size() {
    let rt = DeviceRuntime::with_devices(1);
    let geometry = ConvolutionGeometry::new(2, 2, 1, 3, 3).with_zero_padding(true);
    let input = matrix(&rt, 4, 1, &[1.0, 2.0, 3.0, 4.0]);
    let mut packed = DeviceMatrix::new(&rt, GPU).unwrap();
    packed.assign_packed_convolution_input(&input, &geometry).unwrap();
    assert_eq!(packed.shape(), (9, 4));
    // every input element is read by every output position of a 2x2 image
    let mut coverage = DeviceMatrix::zeros(&rt, GPU, 4, 1).unwrap();
    coverage.unpack_convolution_input(&packed, &geometry).unwrap();
    assert_eq!(coverage.to_vec().unwrap(), vec![4.0, 8.0, 12.0, 16.0]);
}

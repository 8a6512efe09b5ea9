//! Device memory, transfers and cuBLAS on real CUDA devices.
//!
//! Every test returns early on machines without a CUDA driver or device.
#![cfg(feature = "cuda")]

use approx::assert_relative_eq;
use devmat_core::prelude::*;
use std::sync::Arc;

fn runtime() -> Option<Arc<DeviceRuntime>> {
    DeviceRuntime::cuda().ok().filter(|rt| rt.device_count() > 0)
}

#[test]
fn test_buffers_live_in_device_memory() {
    let Some(rt) = runtime() else { return };
    let device = rt.device(0).unwrap();
    assert!(device.is_cuda());

    let buffer = DeviceBuffer::from_vec(&device, vec![1.0f32, 2.0, 3.0]).unwrap();
    assert_eq!(&*buffer.read(0..3).unwrap(), &[1.0, 2.0, 3.0]);
    buffer.update(1..2, |x| x[0] = 7.0).unwrap();
    assert_eq!(&*buffer.read(0..3).unwrap(), &[1.0, 7.0, 3.0]);
    assert_eq!(device.memory_in_use(), 12);
}

#[test]
fn test_gemm_and_transpose_on_device() {
    let Some(rt) = runtime() else { return };
    let gpu = DeviceId::Gpu(0);
    let a = DeviceMatrix::<f64>::from_slice(&rt, gpu, 2, 3, &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0], Layout::ColumnMajor)
        .unwrap();
    let mut c = DeviceMatrix::new(&rt, gpu).unwrap();
    DeviceMatrix::multiply(&a, false, &a, true, &mut c).unwrap();
    let product = c.to_vec().unwrap();
    for (x, y) in product.iter().zip([14.0, 32.0, 32.0, 77.0]) {
        assert_relative_eq!(*x, y);
    }

    let t = a.transpose().unwrap();
    assert_eq!(t.shape(), (3, 2));
    assert_eq!(t.to_vec().unwrap(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
}

#[test]
fn test_element_kernels_round_trip_device_memory() {
    let Some(rt) = runtime() else { return };
    let mut m = DeviceMatrix::<f32>::zeros(&rt, DeviceId::Gpu(0), 4, 4).unwrap();
    m.set_value(1.5).unwrap();
    m.mul_scalar_in_place(2.0).unwrap();
    assert_relative_eq!(m.sum_of_elements().unwrap(), 48.0);
}

#[test]
fn test_staged_transfer_between_devices() {
    let Some(rt) = runtime() else { return };
    if rt.device_count() < 2 {
        return;
    }
    let data: Vec<f32> = (0..6).map(|i| i as f32).collect();
    let mut m = DeviceMatrix::from_slice(&rt, DeviceId::Gpu(0), 3, 2, &data, Layout::ColumnMajor).unwrap();
    assert_eq!(m.change_device(DeviceId::Gpu(1)).unwrap(), TransferPath::Staged);
    assert_eq!(m.to_vec().unwrap(), data);
    assert_eq!(rt.device(0).unwrap().memory_in_use(), 0);
}

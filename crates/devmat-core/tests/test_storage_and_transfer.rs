//! Ownership, views, resizing and device migration.

use devmat_core::prelude::*;
use devmat_core::runtime::DeviceSpec;
use pretty_assertions::assert_eq;
use std::sync::Arc;

const GPU0: DeviceId = DeviceId::Gpu(0);
const GPU1: DeviceId = DeviceId::Gpu(1);

fn matrix(runtime: &Arc<DeviceRuntime>, device: DeviceId, rows: usize, cols: usize) -> DeviceMatrix<f32> {
    let data: Vec<f32> = (0..rows * cols).map(|i| i as f32).collect();
    DeviceMatrix::from_slice(runtime, device, rows, cols, &data, Layout::ColumnMajor).unwrap()
}

#[test]
fn test_row_major_input_is_unsupported() {
    let rt = DeviceRuntime::with_devices(1);
    let err = DeviceMatrix::<f32>::from_slice(&rt, GPU0, 1, 1, &[1.0], Layout::RowMajor).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);
}

#[test]
fn test_resize_semantics() {
    let rt = DeviceRuntime::with_devices(1);
    let mut m = matrix(&rt, GPU0, 2, 3);

    // shrinking with grow_only keeps the allocation and its contents
    m.resize(2, 2, true).unwrap();
    assert_eq!(m.allocated_elements(), 6);
    assert_eq!(m.to_vec().unwrap(), vec![0.0, 1.0, 2.0, 3.0]);

    // shrinking exactly reallocates zero-filled storage
    m.resize(1, 2, false).unwrap();
    assert_eq!(m.allocated_elements(), 2);
    assert_eq!(m.to_vec().unwrap(), vec![0.0, 0.0]);

    m.resize(0, 0, true).unwrap();
    assert!(m.is_empty());
    assert_eq!(rt.device(0).unwrap().memory_in_use(), 0);
}

#[test]
fn test_failed_resize_leaves_matrix_unchanged() {
    let spec = DeviceSpec::builder("small").memory(64).build();
    let rt = DeviceRuntime::new(vec![spec]);
    let mut m = matrix(&rt, GPU0, 2, 2);
    let err = m.resize(100, 100, true).unwrap_err();
    assert!(matches!(err, MatrixError::AllocationFailed { .. }));
    assert_eq!(err.kind(), ErrorKind::Device);
    assert_eq!(m.shape(), (2, 2));
    assert_eq!(m.to_vec().unwrap(), vec![0.0, 1.0, 2.0, 3.0]);
}

#[test]
fn test_column_slice_is_a_view() {
    let rt = DeviceRuntime::with_devices(1);
    let mut m = matrix(&rt, GPU0, 2, 4);
    let mut view = m.column_slice(1, 2).unwrap();
    assert!(!view.owns_buffer());
    assert_eq!(view.to_vec().unwrap(), vec![2.0, 3.0, 4.0, 5.0]);

    view.set_value(-1.0).unwrap();
    assert_eq!(m.to_vec().unwrap(), vec![0.0, 1.0, -1.0, -1.0, -1.0, -1.0, 6.0, 7.0]);

    // a view cannot resize or migrate
    assert!(matches!(view.resize(4, 4, true), Err(MatrixError::NotOwner { .. })));
    assert!(matches!(view.change_device(GPU0), Err(MatrixError::NotOwner { .. })));

    // reallocating the owner invalidates the view
    m.resize(8, 8, true).unwrap();
    assert!(!view.is_valid());
    assert!(matches!(view.to_vec(), Err(MatrixError::InvalidatedView)));
}

#[test]
fn test_column_slice_copies_and_writes() {
    let rt = DeviceRuntime::with_devices(1);
    let src = matrix(&rt, GPU0, 2, 3);
    let mut copy = DeviceMatrix::new(&rt, GPU0).unwrap();
    copy.assign_column_slice(&src, 1, 2).unwrap();
    assert!(copy.owns_buffer());
    assert_eq!(copy.to_vec().unwrap(), vec![2.0, 3.0, 4.0, 5.0]);

    let mut target = DeviceMatrix::zeros(&rt, GPU0, 2, 3).unwrap();
    target.set_column_slice(&copy, 0).unwrap();
    assert_eq!(target.to_vec().unwrap(), vec![2.0, 3.0, 4.0, 5.0, 0.0, 0.0]);

    assert!(matches!(
        target.column_slice(2, 2),
        Err(MatrixError::OutOfRange { .. })
    ));
}

#[test]
fn test_zero_width_column_slice_is_empty() {
    let rt = DeviceRuntime::with_devices(1);
    let mut m = matrix(&rt, GPU0, 2, 3);
    let empty = m.column_slice(3, 0).unwrap();
    assert_eq!(empty.shape(), (2, 0));
    assert!(empty.is_empty());
    assert_eq!(empty.allocated_elements(), 0);
    assert!(empty.buffer().is_none());
    assert!(empty.to_vec().unwrap().is_empty());

    // nothing refers to the owner's storage
    m.resize(4, 4, true).unwrap();
    assert!(empty.is_valid());
}

#[test]
fn test_borrowed_buffer_is_never_freed_by_the_view() {
    let rt = DeviceRuntime::with_devices(1);
    let device = rt.device(0).unwrap();
    let buffer = DeviceBuffer::from_vec(&device, vec![1.0f64, 2.0, 3.0, 4.0]).unwrap();
    let view = DeviceMatrix::from_buffer(&rt, &buffer, 2, 2, Ownership::Borrowed).unwrap();
    assert!(!view.owns_buffer());
    drop(view);
    assert_eq!(device.memory_in_use(), 32);

    let owner = DeviceMatrix::from_buffer(&rt, &buffer, 2, 1, Ownership::Owned).unwrap();
    assert_eq!(owner.to_vec().unwrap(), vec![1.0, 2.0]);
    drop(buffer);
    drop(owner);
    assert_eq!(device.memory_in_use(), 0);
}

#[test]
fn test_assigning_from_an_alias_is_safe() {
    let rt = DeviceRuntime::with_devices(1);
    let mut m = matrix(&rt, GPU0, 2, 2);
    let view = m.column_slice(0, 2).unwrap();
    m.element_multiply_with(&view).unwrap();
    assert_eq!(m.to_vec().unwrap(), vec![0.0, 1.0, 4.0, 9.0]);
}

#[test]
fn test_cross_device_operands_are_rejected() {
    let rt = DeviceRuntime::with_devices(2);
    let mut a = matrix(&rt, GPU0, 2, 2);
    let b = matrix(&rt, GPU1, 2, 2);
    let err = a.add_assign_matrix(&b).unwrap_err();
    assert!(matches!(err, MatrixError::DeviceMismatch { left: GPU0, right: GPU1 }));
    assert!(a.is_equal_to(&b, 0.0).is_err());

    // same id in another runtime is still a different device
    let other = DeviceRuntime::with_devices(1);
    let c = matrix(&other, GPU0, 2, 2);
    assert!(a.add_assign_matrix(&c).is_err());
}

#[test]
fn test_managed_operands_compare_physical_devices() {
    let rt = DeviceRuntime::with_devices(2);
    let mut a = matrix(&rt, DeviceId::Managed, 2, 2);
    rt.set_ambient_device(1).unwrap();
    let b = matrix(&rt, DeviceId::Managed, 2, 2);
    assert_eq!(a.buffer().unwrap().device_id(), GPU0);
    assert_eq!(b.buffer().unwrap().device_id(), GPU1);

    let err = a.add_assign_matrix(&b).unwrap_err();
    assert!(matches!(err, MatrixError::DeviceMismatch { left: GPU0, right: GPU1 }));

    // a managed matrix still matches an explicit id on its physical device
    let c = matrix(&rt, GPU0, 2, 2);
    a.add_assign_matrix(&c).unwrap();
    assert_eq!(a.to_vec().unwrap(), vec![0.0, 2.0, 4.0, 6.0]);
    let d = matrix(&rt, DeviceId::Managed, 2, 2);
    assert!(b.is_equal_to(&d, 0.0).unwrap());
}

#[test]
fn test_change_device_paths_agree() {
    let rt = DeviceRuntime::with_devices(3);
    rt.enable_mutual_peer_access(0, 1).unwrap();
    // one direction only: not a peer path
    rt.enable_peer_access(0, 2).unwrap();

    let mut peer = matrix(&rt, GPU0, 3, 2);
    let mut staged = matrix(&rt, GPU0, 3, 2);
    assert_eq!(peer.change_device(GPU1).unwrap(), TransferPath::Peer);
    assert_eq!(staged.change_device(DeviceId::Gpu(2)).unwrap(), TransferPath::Staged);
    assert_eq!(peer.change_device(GPU1).unwrap(), TransferPath::None);

    assert_eq!(peer.device(), GPU1);
    assert_eq!(peer.to_vec().unwrap(), staged.to_vec().unwrap());
    assert_eq!(peer.to_vec().unwrap(), vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
    assert_eq!(rt.device(0).unwrap().memory_in_use(), 0);
    assert_eq!(rt.device(1).unwrap().memory_in_use(), 24);
}

#[test]
fn test_change_device_failures() {
    let small = DeviceSpec::builder("small").memory(8).build();
    let rt = DeviceRuntime::new(vec![DeviceSpec::default(), small]);
    let mut m = matrix(&rt, GPU0, 2, 2);

    let err = m.change_device(DeviceId::Cpu).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);

    let err = m.change_device(GPU1).unwrap_err();
    assert!(matches!(err, MatrixError::TransferFailed { .. }));
    assert_eq!(m.device(), GPU0);
    assert_eq!(m.to_vec().unwrap(), vec![0.0, 1.0, 2.0, 3.0]);

    assert!(matches!(
        m.change_device(DeviceId::Gpu(7)),
        Err(MatrixError::DeviceUnavailable { .. })
    ));
}

#[test]
fn test_best_device_placement() {
    let rt = DeviceRuntime::with_devices(2);
    rt.devices()[0].set_utilization(90.0, 90.0);
    let m = DeviceMatrix::<f64>::on_best_device(&rt, SelectionFlags::DEFAULT).unwrap();
    assert_eq!(m.device(), GPU1);

    let none = DeviceRuntime::with_devices(0);
    assert_eq!(none.best_device(SelectionFlags::DEFAULT), CPU_DEVICE);
    assert!(DeviceMatrix::<f64>::on_best_device(&none, SelectionFlags::DEFAULT).is_err());
}

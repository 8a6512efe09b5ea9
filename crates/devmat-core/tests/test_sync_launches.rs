//! Launch synchronisation is process-wide, so this lives in its own binary
//! and runs as a single test.

use devmat_core::prelude::*;
use devmat_core::runtime::Stream;

const GPU0: DeviceId = DeviceId::Gpu(0);

#[test]
fn test_async_launches_queue_until_sync() {
    let rt = DeviceRuntime::with_devices(1);
    let device = rt.device(0).unwrap();
    let mut m = DeviceMatrix::<f64>::zeros(&rt, GPU0, 2, 2).unwrap();

    set_sync_launches(false);
    assert!(!engine_config().sync_launches);

    // queued work is invisible until the device synchronises
    m.set_value(1.0).unwrap();
    m.add_scalar_in_place(2.0).unwrap();
    m.mul_scalar_in_place(3.0).unwrap();
    assert_eq!(device.pending_launches(), 3);
    let raw = m.buffer().unwrap().read(0..4).unwrap().to_vec();
    assert_eq!(raw, vec![0.0; 4]);

    // reading back drains the queue in issue order
    assert_eq!(m.to_vec().unwrap(), vec![9.0; 4]);
    assert_eq!(device.pending_launches(), 0);

    // an aliased input is captured after the launches queued before it
    m.set_value_at(1, 1, 2.0).unwrap();
    let view = m.column_slice(0, 2).unwrap();
    m.element_multiply_with(&view).unwrap();
    assert!(device.pending_launches() >= 2);
    assert_eq!(m.to_vec().unwrap(), vec![81.0, 81.0, 81.0, 4.0]);

    // a failing kernel surfaces at the next synchronisation and drops the
    // launches queued behind it
    Stream::current()
        .launch(&device, "rejecting_kernel", 0, || {
            Err(MatrixError::invalid_argument("rejected"))
        })
        .unwrap();
    m.set_value(-1.0).unwrap();
    let err = m.to_vec().unwrap_err();
    assert!(matches!(&err, MatrixError::KernelFailed { kernel, .. } if kernel == "rejecting_kernel"));
    assert_eq!(err.kind(), ErrorKind::Device);
    assert_eq!(m.to_vec().unwrap(), vec![81.0, 81.0, 81.0, 4.0]);

    // synchronous launches run before returning and keep their own errors
    set_sync_launches(true);
    m.mul_scalar_in_place(0.5).unwrap();
    assert_eq!(device.pending_launches(), 0);
    let err = Stream::current()
        .launch(&device, "rejecting_kernel", 0, || {
            Err(MatrixError::invalid_argument("rejected"))
        })
        .unwrap_err();
    assert!(matches!(err, MatrixError::InvalidArgument { .. }));
    assert_eq!(m.to_vec().unwrap(), vec![40.5, 40.5, 40.5, 2.0]);
}

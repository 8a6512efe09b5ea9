//! Binary save and load of device matrices.

use devmat_core::prelude::*;
use pretty_assertions::assert_eq;
use std::io::Cursor;
use std::sync::Arc;

const GPU: DeviceId = DeviceId::Gpu(0);

fn sample(runtime: &Arc<DeviceRuntime>) -> DeviceMatrix<f64> {
    let data = [1.5, -2.0, 0.25, 8.0, 3.0, -0.5];
    DeviceMatrix::from_slice(runtime, GPU, 2, 3, &data, Layout::ColumnMajor).unwrap()
}

fn stored(matrix: &DeviceMatrix<f64>, name: &str) -> Vec<u8> {
    let mut bytes = Vec::new();
    matrix.write_to(&mut bytes, name).unwrap();
    bytes
}

#[test]
fn test_round_trip_through_memory() {
    let rt = DeviceRuntime::with_devices(2);
    let original = sample(&rt);
    let bytes = stored(&original, "weights");
    assert_eq!(&bytes[..4], b"DMAT");

    let restored =
        DeviceMatrix::<f64>::read_from(&rt, DeviceId::Gpu(1), &mut Cursor::new(&bytes), Some("weights")).unwrap();
    assert_eq!(restored.device(), DeviceId::Gpu(1));
    assert_eq!(restored.shape(), (2, 3));
    assert_eq!(restored.name(), "weights");
    assert_eq!(restored.to_vec().unwrap(), original.to_vec().unwrap());

    // no expected name accepts whatever was stored
    let unnamed = DeviceMatrix::<f64>::read_from(&rt, GPU, &mut Cursor::new(&bytes), None).unwrap();
    assert_eq!(unnamed.name(), "weights");
}

#[test]
fn test_round_trip_through_file() {
    let rt = DeviceRuntime::with_devices(1);
    let original = sample(&rt);
    let path = std::env::temp_dir().join(format!("devmat-persistence-{}.bin", std::process::id()));
    original.save(&path, "bias").unwrap();
    let loaded = DeviceMatrix::<f64>::load(&rt, GPU, &path, Some("bias"));
    std::fs::remove_file(&path).unwrap();
    assert_eq!(loaded.unwrap().to_vec().unwrap(), original.to_vec().unwrap());
}

#[test]
fn test_empty_matrix_round_trip() {
    let rt = DeviceRuntime::with_devices(1);
    let empty = DeviceMatrix::<f32>::new(&rt, GPU).unwrap();
    let mut bytes = Vec::new();
    empty.write_to(&mut bytes, "").unwrap();
    let restored = DeviceMatrix::<f32>::read_from(&rt, GPU, &mut Cursor::new(&bytes), Some("")).unwrap();
    assert!(restored.is_empty());
}

#[test]
fn test_element_width_mismatch_is_unsupported() {
    let rt = DeviceRuntime::with_devices(1);
    let bytes = stored(&sample(&rt), "weights");
    let err = DeviceMatrix::<f32>::read_from(&rt, GPU, &mut Cursor::new(&bytes), None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);
}

#[test]
fn test_name_mismatch_is_rejected() {
    let rt = DeviceRuntime::with_devices(1);
    let bytes = stored(&sample(&rt), "weights");
    let err = DeviceMatrix::<f64>::read_from(&rt, GPU, &mut Cursor::new(&bytes), Some("bias")).unwrap_err();
    assert!(matches!(err, MatrixError::InvalidArgument { .. }));
}

#[test]
fn test_malformed_input_is_an_io_error() {
    let rt = DeviceRuntime::with_devices(1);
    let bytes = stored(&sample(&rt), "weights");

    let truncated = &bytes[..bytes.len() - 3];
    let err = DeviceMatrix::<f64>::read_from(&rt, GPU, &mut Cursor::new(truncated), None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Io);

    let mut corrupted = bytes.clone();
    corrupted[0] = b'X';
    let err = DeviceMatrix::<f64>::read_from(&rt, GPU, &mut Cursor::new(&corrupted), None).unwrap_err();
    assert!(matches!(err, MatrixError::Io(_)));

    let err = DeviceMatrix::<f64>::read_from(&rt, GPU, &mut Cursor::new(&bytes[..2]), None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Io);
}

#[test]
fn test_missing_file_is_an_io_error() {
    let rt = DeviceRuntime::with_devices(1);
    let path = std::env::temp_dir().join("devmat-persistence-does-not-exist.bin");
    let err = DeviceMatrix::<f64>::load(&rt, GPU, &path, None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Io);
}

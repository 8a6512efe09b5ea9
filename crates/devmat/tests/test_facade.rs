//! The facade exposes both halves of the engine together.

use approx::assert_relative_eq;
use devmat::prelude::*;
use devmat::select::{ScoreWeights, StaticProbe};
use pretty_assertions::assert_eq;
use std::sync::Arc;

#[test]
fn test_place_and_compute_on_best_device() {
    let runtime = DeviceRuntime::with_devices(3);
    runtime.devices()[0].set_utilization(100.0, 100.0);
    runtime.devices()[2].set_utilization(50.0, 10.0);

    let best = runtime.best_device(SelectionFlags::DEFAULT);
    assert_eq!(best, DeviceId::Gpu(1));

    let a = DeviceMatrix::<f64>::from_slice(&runtime, best, 2, 2, &[1.0, 2.0, 3.0, 4.0], Layout::ColumnMajor).unwrap();
    let b = (&a * &a).unwrap();
    assert_eq!(b.to_vec().unwrap(), vec![7.0, 10.0, 15.0, 22.0]);
    assert_relative_eq!(b.frobenius_norm().unwrap(), (49.0f64 + 100.0 + 225.0 + 484.0).sqrt());
}

#[test]
fn test_selector_without_accelerators_picks_cpu() {
    let mut selector = DeviceSelector::new(Arc::new(StaticProbe::default()));
    assert_eq!(selector.device(SelectionFlags::DEFAULT), CPU_DEVICE);
    assert_eq!(selector.device_count(), 0);

    let weights = ScoreWeights::for_flags(SelectionFlags::FAVOR_MEMORY);
    assert_relative_eq!(weights.free_memory, 2.0 * ScoreWeights::default().free_memory);
}

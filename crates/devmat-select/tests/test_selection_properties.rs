//! Ranking and directive parsing over generated inputs.

use devmat_select::prelude::*;
use devmat_select::{DeviceCount, DeviceProperties, DeviceSelector, DeviceTelemetry, SelectionFlags, StaticProbe};
use proptest::prelude::*;
use std::sync::Arc;

const TOTAL: u64 = 8 << 30;
const STEPS: u64 = 64;

fn device(ordinal: usize, free_steps: u64) -> (DeviceProperties, DeviceTelemetry) {
    (
        DeviceProperties {
            ordinal,
            name: format!("emulated-{ordinal}"),
            compute_capability: (5, 0),
            multiprocessor_count: 8,
            pci_bus_id: ordinal as u32,
            exclusive_compute_driver: false,
        },
        DeviceTelemetry {
            runtime_free_memory: TOTAL / STEPS * free_steps,
            runtime_total_memory: TOTAL,
            managed_total_memory: TOTAL,
            gpu_utilization: 20.0,
            memory_utilization: 20.0,
            ..Default::default()
        },
    )
}

proptest! {
    #[test]
    fn prop_ranking_follows_free_memory(free in prop::collection::vec(0..=STEPS, 1..8)) {
        let devices = free.iter().enumerate().map(|(i, &f)| device(i, f)).collect();
        let mut selector = DeviceSelector::new(Arc::new(StaticProbe::new(devices)));

        let mut expected: Vec<usize> = (0..free.len()).collect();
        // stable: equal readings keep enumeration order
        expected.sort_by(|&a, &b| free[b].cmp(&free[a]));
        let expected: Vec<DeviceId> = expected.into_iter().map(DeviceId::Gpu).collect();

        prop_assert_eq!(selector.devices(DeviceCount::All, SelectionFlags::DEFAULT), expected.clone());
        prop_assert_eq!(selector.devices(DeviceCount::All, SelectionFlags::FAVOR_MEMORY), expected);
    }

    #[test]
    fn prop_more_free_memory_never_ranks_lower(
        free in prop::collection::vec(0..STEPS, 2..8),
        pick in any::<prop::sample::Index>(),
    ) {
        let target = pick.index(free.len());
        let probe = Arc::new(StaticProbe::new(
            free.iter().enumerate().map(|(i, &f)| device(i, f)).collect(),
        ));
        let mut selector = DeviceSelector::new(Arc::clone(&probe) as Arc<dyn devmat_select::DeviceProbe>);
        let rank = |ranked: Vec<DeviceId>| ranked.iter().position(|&d| d == DeviceId::Gpu(target));

        let before = rank(selector.devices(DeviceCount::All, SelectionFlags::DEFAULT));
        probe.set_telemetry(target, device(target, STEPS).1).unwrap();
        let after = rank(selector.devices(DeviceCount::All, SelectionFlags::DEFAULT));
        prop_assert!(after <= before);
    }

    #[test]
    fn prop_id_lists_parse_back(ids in prop::collection::vec(0usize..32, 1..6)) {
        let text = ids.iter().map(ToString::to_string).collect::<Vec<_>>().join(":");
        let expected = match ids.as_slice() {
            [single] => DeviceDirective::Explicit(*single),
            _ => DeviceDirective::AllowList(ids.clone()),
        };
        prop_assert_eq!(DeviceDirective::parse(&text).unwrap(), expected);
    }

    #[test]
    fn prop_top_counts_parse_back(n in 0usize..10) {
        prop_assert_eq!(DeviceDirective::parse(&format!("*{n}")).unwrap(), DeviceDirective::Top(n));
    }
}

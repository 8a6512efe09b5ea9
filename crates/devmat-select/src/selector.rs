//! Accelerator ranking.
//!
//! The selector scores every allowed accelerator with a weighted sum of
//! utilization headroom, core count, free memory share, and the absence of
//! competing training processes, then keeps the best `count` of them.
//!
//! The weights are relative, not a calibrated probability: flag adjustments
//! multiply individual weights and nothing is renormalised afterwards.

use crate::device_id::DeviceId;
use crate::error::{Result, SelectError};
use crate::probe::{DeviceProbe, NoAccelerators};
use crate::snapshot::ProcessorSnapshot;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Width of the allow-list bitmask; device ids at or above it cannot be named.
pub const MAX_ALLOWED_DEVICE_ID: usize = 32;

/// Score assigned to a slot that has not been filled.
const UNSET_SCORE: f64 = -1.0;

/// Flags that adjust the scoring weights.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SelectionFlags(u32);

impl SelectionFlags {
    /// Default weights.
    pub const DEFAULT: Self = Self(0);
    /// Triple the weight of having no competing process.
    pub const AVOID_SHARING: Self = Self(1);
    /// Double the weight of free memory.
    pub const FAVOR_MEMORY: Self = Self(1 << 1);
    /// Double both utilization weights.
    pub const FAVOR_UTILIZATION: Self = Self(1 << 2);
    /// Double the weight of core count.
    pub const FAVOR_SPEED: Self = Self(1 << 3);
    /// Reuse the flags of the previous ranking call.
    pub const REQUERY: Self = Self(1 << 4);

    /// Whether every flag of `other` is set.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Raw bit representation.
    pub fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for SelectionFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for SelectionFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for SelectionFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(SelectionFlags, &str); 5] = [
            (SelectionFlags::AVOID_SHARING, "AVOID_SHARING"),
            (SelectionFlags::FAVOR_MEMORY, "FAVOR_MEMORY"),
            (SelectionFlags::FAVOR_UTILIZATION, "FAVOR_UTILIZATION"),
            (SelectionFlags::FAVOR_SPEED, "FAVOR_SPEED"),
            (SelectionFlags::REQUERY, "REQUERY"),
        ];
        let set: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if set.is_empty() {
            write!(f, "SelectionFlags(DEFAULT)")
        } else {
            write!(f, "SelectionFlags({})", set.join(" | "))
        }
    }
}

/// How many devices a ranking call should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCount {
    /// At most this many.
    Exactly(usize),
    /// Every accelerator (at least one slot).
    All,
    /// Same count as the previous call.
    Requery,
}

impl From<usize> for DeviceCount {
    fn from(n: usize) -> Self {
        Self::Exactly(n)
    }
}

/// Weights of the five scoring terms.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreWeights {
    /// Weight of `1 - gpu_utilization / 75`
    pub gpu_utilization: f64,
    /// Weight of `1 - memory_utilization / 60`
    pub memory_utilization: f64,
    /// Weight of `core_count / 1000`
    pub speed: f64,
    /// Weight of the free memory fraction
    pub free_memory: f64,
    /// Weight of the no-competing-process indicator
    pub no_competitor: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            gpu_utilization: 0.15,
            memory_utilization: 0.10,
            speed: 0.20,
            free_memory: 0.20,
            no_competitor: 0.20,
        }
    }
}

impl ScoreWeights {
    /// Base weights adjusted by `flags`.
    pub fn for_flags(flags: SelectionFlags) -> Self {
        let mut weights = Self::default();
        if flags.contains(SelectionFlags::AVOID_SHARING) {
            weights.no_competitor *= 3.0;
        }
        if flags.contains(SelectionFlags::FAVOR_MEMORY) {
            weights.free_memory *= 2.0;
        }
        if flags.contains(SelectionFlags::FAVOR_UTILIZATION) {
            weights.gpu_utilization *= 2.0;
            weights.memory_utilization *= 2.0;
        }
        if flags.contains(SelectionFlags::FAVOR_SPEED) {
            weights.speed *= 2.0;
        }
        weights
    }

    /// Score of one snapshot; higher is better.
    pub fn score(&self, snap: &ProcessorSnapshot) -> f64 {
        let mut score = (1.0 - snap.gpu_utilization / 75.0) * self.gpu_utilization;
        score += (1.0 - snap.memory_utilization / 60.0) * self.memory_utilization;
        score += f64::from(snap.core_count) / 1000.0 * self.speed;
        score += snap.free_memory_fraction() * self.free_memory;
        score += if snap.has_competing_process { 0.0 } else { 1.0 } * self.no_competitor;
        score
    }
}

/// Ranks accelerators for workload placement.
pub struct DeviceSelector {
    probe: Arc<dyn DeviceProbe>,
    snapshots: Vec<ProcessorSnapshot>,
    initialized: bool,
    allowed: u32,
    last_flags: SelectionFlags,
    last_count: usize,
}

impl fmt::Debug for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSelector")
            .field("snapshots", &self.snapshots)
            .field("initialized", &self.initialized)
            .field("allowed", &format_args!("{:#x}", self.allowed))
            .field("last_flags", &self.last_flags)
            .field("last_count", &self.last_count)
            .finish()
    }
}

static SHARED: Lazy<Mutex<DeviceSelector>> =
    Lazy::new(|| Mutex::new(DeviceSelector::new(default_probe())));

/// Probe used by the process-wide selector.
fn default_probe() -> Arc<dyn DeviceProbe> {
    #[cfg(feature = "cuda")]
    {
        Arc::new(crate::cuda::CudaProbe::new())
    }
    #[cfg(not(feature = "cuda"))]
    {
        Arc::new(NoAccelerators)
    }
}

impl DeviceSelector {
    /// Create a selector over `probe`. Nothing is queried until first use.
    pub fn new(probe: Arc<dyn DeviceProbe>) -> Self {
        Self {
            probe,
            snapshots: Vec::new(),
            initialized: false,
            allowed: u32::MAX,
            last_flags: SelectionFlags::DEFAULT,
            last_count: 1,
        }
    }

    /// Selector that never finds an accelerator.
    pub fn cpu_only() -> Self {
        Self::new(Arc::new(NoAccelerators))
    }

    /// Process-wide selector, created on first use.
    pub fn shared() -> &'static Mutex<Self> {
        &SHARED
    }

    /// Enumerate accelerators. Runs once; later calls are no-ops.
    ///
    /// A failing probe is not an error: the selector falls back to zero
    /// accelerators and every ranking returns the CPU sentinel.
    pub fn initialize(&mut self) {
        if self.initialized {
            return;
        }
        self.initialized = true;

        let count = match self.probe.device_count() {
            Ok(count) => count,
            Err(err) => {
                warn!("accelerator enumeration failed, using CPU only: {err}");
                return;
            }
        };

        let mut snapshots = Vec::with_capacity(count);
        for ordinal in 0..count {
            match self.probe.properties(ordinal) {
                Ok(props) => snapshots.push(ProcessorSnapshot::from_properties(&props)),
                Err(err) => {
                    warn!("failed to read properties of accelerator {ordinal}, using CPU only: {err}");
                    return;
                }
            }
        }
        self.snapshots = snapshots;
        self.refresh();
        info!("found {} accelerator(s)", self.snapshots.len());
    }

    /// Pull fresh telemetry into every snapshot.
    fn refresh(&mut self) {
        let own_pid = self.probe.current_process_id();
        for snap in &mut self.snapshots {
            match self.probe.telemetry(snap.device_id) {
                Ok(telemetry) => snap.record(&telemetry, own_pid),
                Err(err) => {
                    warn!("telemetry query for accelerator {} failed: {err}", snap.device_id);
                }
            }
        }
    }

    /// Number of accelerators found.
    pub fn device_count(&mut self) -> usize {
        self.initialize();
        self.snapshots.len()
    }

    /// Current snapshots, in enumeration order.
    pub fn snapshots(&mut self) -> &[ProcessorSnapshot] {
        self.initialize();
        &self.snapshots
    }

    /// Restrict ranking to `devices`. Ids must be below [`MAX_ALLOWED_DEVICE_ID`].
    pub fn set_allowed_devices(&mut self, devices: &[usize]) -> Result<()> {
        let mut mask = 0u32;
        for &id in devices {
            if id >= MAX_ALLOWED_DEVICE_ID {
                return Err(SelectError::DeviceIdOutOfRange {
                    id,
                    limit: MAX_ALLOWED_DEVICE_ID,
                });
            }
            mask |= 1 << id;
        }
        self.allowed = mask;
        Ok(())
    }

    /// Remove any allow-list restriction.
    pub fn allow_all(&mut self) {
        self.allowed = u32::MAX;
    }

    /// Whether `device` passes the allow-list.
    pub fn is_allowed(&self, device: usize) -> bool {
        if self.allowed == u32::MAX {
            return true;
        }
        device < MAX_ALLOWED_DEVICE_ID && self.allowed & (1 << device) != 0
    }

    /// Whether the previous ranking returned more than one device.
    pub fn uses_multiple(&self) -> bool {
        self.last_count > 1
    }

    /// Best devices, best first, at most `count` of them.
    pub fn devices(&mut self, count: DeviceCount, flags: SelectionFlags) -> Vec<DeviceId> {
        self.initialize();

        let number = match count {
            DeviceCount::Exactly(n) => n,
            DeviceCount::All => self.snapshots.len().max(1),
            DeviceCount::Requery => self.last_count,
        };

        if self.snapshots.is_empty() {
            return vec![DeviceId::Cpu];
        }

        self.refresh();

        let flags = if flags.contains(SelectionFlags::REQUERY) {
            self.last_flags
        } else {
            flags
        };
        let weights = ScoreWeights::for_flags(flags);

        let mut best: Vec<Option<usize>> = vec![None; number];
        let mut scores = vec![UNSET_SCORE; number];

        for snap in &self.snapshots {
            if !self.is_allowed(snap.device_id) {
                continue;
            }
            let score = weights.score(snap);
            debug!(device = snap.device_id, score, "scored accelerator");

            // Strict comparison: an equal score never displaces an earlier device.
            if let Some(slot) = scores.iter().position(|&existing| score > existing) {
                best.insert(slot, Some(snap.device_id));
                scores.insert(slot, score);
                best.truncate(number);
                scores.truncate(number);
            }
        }

        let mut result: Vec<DeviceId> = best.into_iter().flatten().map(DeviceId::Gpu).collect();
        self.last_flags = flags;
        self.last_count = result.len();
        if result.is_empty() {
            result.push(DeviceId::Cpu);
        }
        result
    }

    /// Single best device.
    pub fn device(&mut self, flags: SelectionFlags) -> DeviceId {
        self.devices(DeviceCount::Exactly(1), flags)
            .first()
            .copied()
            .unwrap_or(DeviceId::Cpu)
    }

    /// Re-rank with the previous flags and count against fresh telemetry.
    pub fn requery(&mut self) -> Vec<DeviceId> {
        self.devices(DeviceCount::Requery, SelectionFlags::REQUERY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{DeviceProperties, DeviceTelemetry, ProcessInfo, StaticProbe};
    use pretty_assertions::assert_eq;

    const GIB: u64 = 1 << 30;

    fn device(ordinal: usize, utilization: f64, free_fraction: f64) -> (DeviceProperties, DeviceTelemetry) {
        let total = 8 * GIB;
        let free = (total as f64 * free_fraction) as u64;
        (
            DeviceProperties {
                ordinal,
                name: format!("emulated-{ordinal}"),
                compute_capability: (3, 5),
                multiprocessor_count: 4,
                pci_bus_id: ordinal as u32,
                exclusive_compute_driver: false,
            },
            DeviceTelemetry {
                runtime_free_memory: free,
                runtime_total_memory: total,
                managed_free_memory: 0,
                managed_total_memory: total,
                gpu_utilization: utilization,
                memory_utilization: utilization,
                processes: Vec::new(),
            },
        )
    }

    fn selector(devices: Vec<(DeviceProperties, DeviceTelemetry)>) -> DeviceSelector {
        DeviceSelector::new(Arc::new(StaticProbe::new(devices)))
    }

    #[test]
    fn test_no_accelerators_gives_cpu() {
        let mut sel = DeviceSelector::cpu_only();
        assert_eq!(sel.devices(DeviceCount::All, SelectionFlags::DEFAULT), vec![DeviceId::Cpu]);
        assert_eq!(sel.device(SelectionFlags::FAVOR_SPEED), DeviceId::Cpu);
    }

    #[test]
    fn test_three_device_ranking() {
        let mut sel = selector(vec![
            device(0, 10.0, 0.9),
            device(1, 90.0, 0.1),
            device(2, 50.0, 0.5),
        ]);
        let ranked = sel.devices(DeviceCount::All, SelectionFlags::DEFAULT);
        assert_eq!(ranked, vec![DeviceId::Gpu(0), DeviceId::Gpu(2), DeviceId::Gpu(1)]);

        // Device 0 also leads on free memory, so favoring memory keeps it first.
        assert_eq!(sel.device(SelectionFlags::FAVOR_MEMORY), DeviceId::Gpu(0));
    }

    #[test]
    fn test_favor_memory_flips_ranking() {
        let mut devices = vec![device(0, 10.0, 0.40), device(1, 70.0, 0.85)];
        // Same memory-controller load so only compute headroom and memory differ.
        devices[0].1.memory_utilization = 10.0;
        devices[1].1.memory_utilization = 10.0;
        let mut sel = selector(devices);

        assert_eq!(sel.device(SelectionFlags::DEFAULT), DeviceId::Gpu(0));
        assert_eq!(sel.device(SelectionFlags::FAVOR_MEMORY), DeviceId::Gpu(1));
    }

    #[test]
    fn test_allow_list_overrides_score() {
        let mut sel = selector(vec![
            device(0, 10.0, 0.9),
            device(1, 20.0, 0.8),
            device(2, 95.0, 0.05),
        ]);
        assert_eq!(
            sel.devices(DeviceCount::All, SelectionFlags::DEFAULT).last(),
            Some(&DeviceId::Gpu(2))
        );

        sel.set_allowed_devices(&[2]).unwrap();
        assert_eq!(sel.devices(DeviceCount::Exactly(1), SelectionFlags::DEFAULT), vec![DeviceId::Gpu(2)]);

        sel.allow_all();
        assert_eq!(sel.devices(DeviceCount::Exactly(1), SelectionFlags::DEFAULT), vec![DeviceId::Gpu(0)]);
    }

    #[test]
    fn test_allow_list_excluding_everything_falls_back_to_cpu() {
        let mut sel = selector(vec![device(0, 10.0, 0.9)]);
        sel.set_allowed_devices(&[5]).unwrap();
        assert_eq!(sel.devices(DeviceCount::Exactly(3), SelectionFlags::DEFAULT), vec![DeviceId::Cpu]);
    }

    #[test]
    fn test_allow_list_rejects_large_ids() {
        let mut sel = selector(vec![device(0, 10.0, 0.9)]);
        sel.set_allowed_devices(&[1]).unwrap();
        let err = sel.set_allowed_devices(&[0, 32]).unwrap_err();
        assert_eq!(err, SelectError::DeviceIdOutOfRange { id: 32, limit: 32 });
        // The previous restriction is untouched
        assert!(sel.is_allowed(1));
        assert!(!sel.is_allowed(0));
    }

    #[test]
    fn test_ties_keep_enumeration_order() {
        let mut sel = selector(vec![
            device(0, 30.0, 0.5),
            device(1, 30.0, 0.5),
            device(2, 30.0, 0.5),
        ]);
        assert_eq!(
            sel.devices(DeviceCount::All, SelectionFlags::DEFAULT),
            vec![DeviceId::Gpu(0), DeviceId::Gpu(1), DeviceId::Gpu(2)]
        );
    }

    #[test]
    fn test_short_list_when_fewer_devices_than_requested() {
        let mut sel = selector(vec![device(0, 10.0, 0.9), device(1, 20.0, 0.9)]);
        let ranked = sel.devices(DeviceCount::Exactly(5), SelectionFlags::DEFAULT);
        assert_eq!(ranked.len(), 2);
        assert!(sel.uses_multiple());
    }

    #[test]
    fn test_competing_process_penalised() {
        let mut devices = vec![device(0, 10.0, 0.9), device(1, 10.0, 0.9)];
        devices[0].1.processes = vec![ProcessInfo::new(4242, "/usr/local/bin/cn")];
        let mut sel = selector(devices);
        assert_eq!(sel.device(SelectionFlags::AVOID_SHARING), DeviceId::Gpu(1));
    }

    #[test]
    fn test_requery_reuses_flags_and_count() {
        let probe = Arc::new(StaticProbe::new(vec![
            device(0, 10.0, 0.40),
            device(1, 70.0, 0.85),
            device(2, 99.0, 0.01),
        ]));
        let mut sel = DeviceSelector::new(probe);
        let first = sel.devices(DeviceCount::Exactly(2), SelectionFlags::FAVOR_MEMORY);
        assert_eq!(first.len(), 2);

        let again = sel.requery();
        assert_eq!(again, first);
    }

    #[test]
    fn test_zero_count_records_no_devices() {
        let mut sel = selector(vec![device(0, 10.0, 0.9), device(1, 20.0, 0.9)]);
        assert_eq!(sel.devices(DeviceCount::Exactly(2), SelectionFlags::DEFAULT).len(), 2);
        assert_eq!(sel.devices(DeviceCount::Exactly(0), SelectionFlags::DEFAULT), vec![DeviceId::Cpu]);
        assert!(!sel.uses_multiple());
        // the CPU fallback is not remembered as one accelerator
        assert_eq!(sel.requery(), vec![DeviceId::Cpu]);
    }

    #[test]
    fn test_weights_are_not_renormalised() {
        let weights = ScoreWeights::for_flags(
            SelectionFlags::AVOID_SHARING
                | SelectionFlags::FAVOR_MEMORY
                | SelectionFlags::FAVOR_UTILIZATION
                | SelectionFlags::FAVOR_SPEED,
        );
        assert!((weights.no_competitor - 0.6).abs() < 1e-12);
        assert!((weights.free_memory - 0.4).abs() < 1e-12);
        assert!((weights.gpu_utilization - 0.3).abs() < 1e-12);
        assert!((weights.memory_utilization - 0.2).abs() < 1e-12);
        assert!((weights.speed - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_flags_debug() {
        let flags = SelectionFlags::FAVOR_MEMORY | SelectionFlags::FAVOR_SPEED;
        assert_eq!(format!("{flags:?}"), "SelectionFlags(FAVOR_MEMORY | FAVOR_SPEED)");
        assert_eq!(format!("{:?}", SelectionFlags::DEFAULT), "SelectionFlags(DEFAULT)");
    }
}

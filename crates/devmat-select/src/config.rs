//! Device directives read from configuration.
//!
//! The directive is a single string under the `deviceId` key:
//!
//! | Value     | Meaning                                        |
//! |-----------|------------------------------------------------|
//! | `CPU`     | host compute                                   |
//! | `Auto`    | best single accelerator                        |
//! | `All`     | every accelerator, best first                  |
//! | `*N`      | best `N` accelerators (`N` one decimal digit)  |
//! | `3`       | exactly accelerator 3                          |
//! | `0:2:3`   | best of the listed accelerators                |
//!
//! Keywords are matched case-insensitively.

use crate::device_id::DeviceId;
use crate::error::{Result, SelectError};
use crate::selector::{DeviceCount, DeviceSelector, SelectionFlags};
use std::collections::{BTreeMap, HashMap};

/// Configuration key holding the device directive.
pub const DEVICE_KEY: &str = "deviceId";

/// Directive used when the key is absent.
pub const DEFAULT_DIRECTIVE: &str = "auto";

/// Read-only access to typed configuration values.
pub trait Configuration {
    /// String value stored under `key`.
    fn get_str(&self, key: &str) -> Option<String>;

    /// String value under `key`, or `default` when absent.
    fn get_str_or(&self, key: &str, default: &str) -> String {
        self.get_str(key).unwrap_or_else(|| default.to_string())
    }
}

impl Configuration for HashMap<String, String> {
    fn get_str(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

impl Configuration for BTreeMap<String, String> {
    fn get_str(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

/// Parsed device directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceDirective {
    /// Host compute.
    Cpu,
    /// Best single accelerator.
    Auto,
    /// Every accelerator.
    All,
    /// Best `n` accelerators.
    Top(usize),
    /// One explicit accelerator, bypassing the ranking.
    Explicit(usize),
    /// Best accelerator among an allow-list.
    AllowList(Vec<usize>),
}

/// Single-id form naming the host.
const CPU_SENTINEL: i64 = -1;

impl DeviceDirective {
    /// Parse a directive string.
    ///
    /// The single id `-1` names the CPU, like the `cpu` keyword.
    pub fn parse(value: &str) -> Result<Self> {
        let trimmed = value.trim();
        if trimmed.eq_ignore_ascii_case("cpu") {
            return Ok(Self::Cpu);
        }
        if trimmed.eq_ignore_ascii_case("auto") {
            return Ok(Self::Auto);
        }
        if trimmed.eq_ignore_ascii_case("all") {
            return Ok(Self::All);
        }
        if let Some(count) = trimmed.strip_prefix('*') {
            let mut chars = count.chars();
            return match (chars.next(), chars.next()) {
                (Some(digit), None) if digit.is_ascii_digit() => {
                    Ok(Self::Top(digit as usize - '0' as usize))
                }
                _ => Err(SelectError::invalid_directive(
                    value,
                    "device count must be a single decimal digit",
                )),
            };
        }

        if trimmed.parse::<i64>() == Ok(CPU_SENTINEL) {
            return Ok(Self::Cpu);
        }

        let ids = trimmed
            .split(':')
            .map(|part| {
                part.trim().parse::<usize>().map_err(|_| {
                    SelectError::invalid_directive(value, format!("'{part}' is not a device id"))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        match ids.as_slice() {
            [single] => Ok(Self::Explicit(*single)),
            _ => Ok(Self::AllowList(ids)),
        }
    }

    /// Devices named by this directive, best first.
    ///
    /// An allow-list directive leaves the selector restricted to that list.
    pub fn resolve(&self, selector: &mut DeviceSelector) -> Result<Vec<DeviceId>> {
        let devices = match self {
            Self::Cpu => vec![DeviceId::Cpu],
            Self::Auto => selector.devices(DeviceCount::Exactly(1), SelectionFlags::DEFAULT),
            Self::All => selector.devices(DeviceCount::All, SelectionFlags::DEFAULT),
            Self::Top(n) => selector.devices(DeviceCount::Exactly(*n), SelectionFlags::DEFAULT),
            Self::Explicit(id) => vec![DeviceId::Gpu(*id)],
            Self::AllowList(ids) => {
                selector.set_allowed_devices(ids)?;
                selector.devices(DeviceCount::Exactly(1), SelectionFlags::DEFAULT)
            }
        };
        Ok(devices)
    }
}

/// Device directive stored in `config`.
pub fn directive_from_config(config: &dyn Configuration) -> Result<DeviceDirective> {
    DeviceDirective::parse(&config.get_str_or(DEVICE_KEY, DEFAULT_DIRECTIVE))
}

/// All devices named by the directive in `config`, best first.
pub fn resolve_devices_from_config(
    config: &dyn Configuration,
    selector: &mut DeviceSelector,
) -> Result<Vec<DeviceId>> {
    directive_from_config(config)?.resolve(selector)
}

/// Single device to use according to `config`.
///
/// CPU and explicit-id directives never touch the selector.
pub fn resolve_device_from_config(
    config: &dyn Configuration,
    selector: &mut DeviceSelector,
) -> Result<DeviceId> {
    let devices = resolve_devices_from_config(config, selector)?;
    Ok(devices.first().copied().unwrap_or(DeviceId::Cpu))
}

/// Same as [`resolve_device_from_config`] against the process-wide selector.
pub fn resolve_device(config: &dyn Configuration) -> Result<DeviceId> {
    let directive = directive_from_config(config)?;
    if directive == DeviceDirective::Cpu {
        return Ok(DeviceId::Cpu);
    }
    let mut selector = DeviceSelector::shared().lock();
    Ok(directive
        .resolve(&mut selector)?
        .first()
        .copied()
        .unwrap_or(DeviceId::Cpu))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{DeviceProperties, DeviceTelemetry, StaticProbe};
    use std::sync::Arc;

    fn config(value: Option<&str>) -> HashMap<String, String> {
        let mut map = HashMap::new();
        if let Some(v) = value {
            map.insert(DEVICE_KEY.to_string(), v.to_string());
        }
        map
    }

    fn two_devices() -> DeviceSelector {
        let dev = |ordinal: usize, util: f64| {
            (
                DeviceProperties {
                    ordinal,
                    name: format!("d{ordinal}"),
                    compute_capability: (3, 0),
                    multiprocessor_count: 2,
                    pci_bus_id: 0,
                    exclusive_compute_driver: false,
                },
                DeviceTelemetry {
                    runtime_free_memory: 50,
                    runtime_total_memory: 100,
                    gpu_utilization: util,
                    memory_utilization: util,
                    ..Default::default()
                },
            )
        };
        DeviceSelector::new(Arc::new(StaticProbe::new(vec![dev(0, 80.0), dev(1, 5.0)])))
    }

    #[test]
    fn test_parse_keywords() {
        assert_eq!(DeviceDirective::parse("CPU").unwrap(), DeviceDirective::Cpu);
        assert_eq!(DeviceDirective::parse("cpu").unwrap(), DeviceDirective::Cpu);
        assert_eq!(DeviceDirective::parse("Auto").unwrap(), DeviceDirective::Auto);
        assert_eq!(DeviceDirective::parse("ALL").unwrap(), DeviceDirective::All);
        assert_eq!(DeviceDirective::parse("*3").unwrap(), DeviceDirective::Top(3));
    }

    #[test]
    fn test_parse_ids() {
        assert_eq!(DeviceDirective::parse("2").unwrap(), DeviceDirective::Explicit(2));
        assert_eq!(
            DeviceDirective::parse("0:2:3").unwrap(),
            DeviceDirective::AllowList(vec![0, 2, 3])
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(DeviceDirective::parse("*12").is_err());
        assert!(DeviceDirective::parse("*x").is_err());
        assert!(DeviceDirective::parse("gpu").is_err());
        assert!(DeviceDirective::parse("1::2").is_err());
        assert!(DeviceDirective::parse("-2").is_err());
        assert!(DeviceDirective::parse("0:-1").is_err());
    }

    #[test]
    fn test_minus_one_selects_cpu() {
        assert_eq!(DeviceDirective::parse(" -1 ").unwrap(), DeviceDirective::Cpu);
        let mut selector = two_devices();
        assert_eq!(
            resolve_device_from_config(&config(Some("-1")), &mut selector).unwrap(),
            DeviceId::Cpu
        );
        assert_eq!(resolve_device(&config(Some("-1"))).unwrap(), DeviceId::Cpu);
    }

    #[test]
    fn test_default_is_auto() {
        let mut selector = two_devices();
        let device = resolve_device_from_config(&config(None), &mut selector).unwrap();
        assert_eq!(device, DeviceId::Gpu(1));
    }

    #[test]
    fn test_cpu_and_explicit_bypass_ranking() {
        let mut selector = two_devices();
        assert_eq!(
            resolve_device_from_config(&config(Some("CPU")), &mut selector).unwrap(),
            DeviceId::Cpu
        );
        assert_eq!(
            resolve_device_from_config(&config(Some("0")), &mut selector).unwrap(),
            DeviceId::Gpu(0)
        );
    }

    #[test]
    fn test_allow_list_picks_best_of_list() {
        let mut selector = two_devices();
        let device = resolve_device_from_config(&config(Some("0:5")), &mut selector).unwrap();
        assert_eq!(device, DeviceId::Gpu(0));
    }

    #[test]
    fn test_top_n_returns_ranked_list() {
        let mut selector = two_devices();
        let devices = resolve_devices_from_config(&config(Some("*2")), &mut selector).unwrap();
        assert_eq!(devices, vec![DeviceId::Gpu(1), DeviceId::Gpu(0)]);
    }

    #[test]
    fn test_shared_selector_with_cpu_directive() {
        assert_eq!(resolve_device(&config(Some("cpu"))).unwrap(), DeviceId::Cpu);
    }
}

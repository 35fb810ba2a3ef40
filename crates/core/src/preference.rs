//! Preference spec: scheduling/topology/device defaults plus minimum requirements.
//!
//! Everything here is a soft default. The applier only fills fields the
//! workload left unset; requirements are checked, never merged.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::{Deserialize, Serialize};

use crate::vm::{ClockOffset, CpuFeature, Empty, FeatureApic, FeatureState, Tpm};

pub const DEFAULT_SPREAD_RATIO: u32 = 2;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreferenceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clock: Option<ClockPreferences>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuPreferences>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub devices: Option<DevicePreferences>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<FeaturePreferences>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware: Option<FirmwarePreferences>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine: Option<MachinePreferences>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_subdomain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_termination_grace_period_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirements: Option<PreferenceRequirements>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

/// How guest vCPUs are laid out across sockets, cores and threads.
///
/// The `prefer*` spellings are deprecated but still accepted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PreferredCpuTopology {
    #[default]
    #[serde(rename = "sockets", alias = "preferSockets")]
    Sockets,
    #[serde(rename = "cores", alias = "preferCores")]
    Cores,
    #[serde(rename = "threads", alias = "preferThreads")]
    Threads,
    #[serde(rename = "spread", alias = "preferSpread")]
    Spread,
    #[serde(rename = "any", alias = "preferAny")]
    Any,
}

impl PreferredCpuTopology {
    /// Map a deprecated `prefer*` spelling to its current name; other values pass through.
    pub fn normalize_legacy(raw: &str) -> &str {
        match raw {
            "preferSockets" => "sockets",
            "preferCores" => "cores",
            "preferThreads" => "threads",
            "preferSpread" => "spread",
            "preferAny" => "any",
            other => other,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpreadAcross {
    SocketsCoresThreads,
    #[default]
    SocketsCores,
    CoresThreads,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpreadOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub across: Option<SpreadAcross>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ratio: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuPreferences {
    #[serde(default, rename = "preferredCPUTopology", skip_serializing_if = "Option::is_none")]
    pub preferred_cpu_topology: Option<PreferredCpuTopology>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spread_options: Option<SpreadOptions>,
    #[serde(default, rename = "preferredCPUFeatures", skip_serializing_if = "Vec::is_empty")]
    pub preferred_cpu_features: Vec<CpuFeature>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClockPreferences {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_clock_offset: Option<ClockOffset>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_timer: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevicePreferences {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_autoattach_graphics_device: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_autoattach_mem_balloon: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_autoattach_pod_interface: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_autoattach_serial_console: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_autoattach_input_device: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_disk_dedicated_io_thread: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_use_virtio_transitional: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_network_interface_multi_queue: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_block_multi_queue: Option<bool>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub preferred_disk_bus: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub preferred_cdrom_bus: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub preferred_lun_bus: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub preferred_disk_cache: String,
    #[serde(default, rename = "preferredDiskIO", skip_serializing_if = "String::is_empty")]
    pub preferred_disk_io: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub preferred_interface_model: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub preferred_input_bus: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub preferred_input_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_rng: Option<Empty>,
    #[serde(default, rename = "preferredTPM", skip_serializing_if = "Option::is_none")]
    pub preferred_tpm: Option<Tpm>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeaturePreferences {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_acpi: Option<FeatureState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_apic: Option<FeatureApic>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_smm: Option<FeatureState>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirmwarePreferences {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_use_bios: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_use_bios_serial: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_use_efi: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_use_secure_boot: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachinePreferences {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub preferred_machine_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreferenceRequirements {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuPreferenceRequirement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryPreferenceRequirement>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuPreferenceRequirement {
    /// Minimum number of vCPUs.
    pub guest: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryPreferenceRequirement {
    /// Minimum guest memory.
    pub guest: Quantity,
}

impl PreferenceSpec {
    pub fn preferred_topology(&self) -> PreferredCpuTopology {
        self.cpu.as_ref().and_then(|c| c.preferred_cpu_topology).unwrap_or_default()
    }

    /// Spread ratio and axis, falling back to `2` across sockets and cores.
    pub fn spread_options(&self) -> (u32, SpreadAcross) {
        let opts = self.cpu.as_ref().and_then(|c| c.spread_options.as_ref());
        let ratio = opts.and_then(|o| o.ratio).filter(|r| *r > 0).unwrap_or(DEFAULT_SPREAD_RATIO);
        let across = opts.and_then(|o| o.across).unwrap_or_default();
        (ratio, across)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deprecated_topology_names_decode() {
        let cpu: CpuPreferences = serde_json::from_value(serde_json::json!({
            "preferredCPUTopology": "preferCores"
        })).unwrap();
        assert_eq!(cpu.preferred_cpu_topology, Some(PreferredCpuTopology::Cores));
        let out = serde_json::to_value(&cpu).unwrap();
        assert_eq!(out["preferredCPUTopology"], "cores");
    }

    #[test]
    fn unknown_topology_is_rejected() {
        let err = serde_json::from_value::<CpuPreferences>(serde_json::json!({
            "preferredCPUTopology": "preferNuma"
        }));
        assert!(err.is_err());
    }

    #[test]
    fn spread_defaults() {
        let spec = PreferenceSpec::default();
        assert_eq!(spec.spread_options(), (2, SpreadAcross::SocketsCores));
        assert_eq!(spec.preferred_topology(), PreferredCpuTopology::Sockets);
    }
}

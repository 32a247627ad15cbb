// SPDX-License-Identifier: AGPL-3.0-only

//! Hardware query records: what a device API reports about a compute
//! platform and its devices.
//!
//! These are plain data. Selection (see [`crate::selection`]) is a pure
//! function of them, so a recorded query replayed from JSON picks the same
//! device as the live probe did.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of compute device a platform exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    Gpu,
    Cpu,
    Accelerator,
    Other,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Gpu => "gpu",
            Self::Cpu => "cpu",
            Self::Accelerator => "accelerator",
            Self::Other => "other",
        };
        f.write_str(label)
    }
}

/// Vendor attribute query for AMD-family devices.
///
/// Present only when the runtime answered the query; an absent record means
/// the scoring and tuning heuristics fall back to their defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AmdAttributes {
    pub simd_per_compute_unit: u32,
    pub simd_width: u32,
    pub simd_instruction_width: u32,
    pub wavefront_width: u32,
}

/// One device as reported by its platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceQuery {
    /// Device name as reported by the driver.
    pub name: String,
    /// Device vendor string (e.g. `"NVIDIA Corporation"`, `"Apple"`).
    pub vendor: String,
    pub kind: DeviceKind,
    /// Number of compute units (SMs, CUs, cores). 1 when unknown.
    pub compute_units: u32,
    /// Maximum clock frequency in MHz. 1 when unknown.
    pub clock_mhz: u32,
    /// Maximum work-group (thread-block) size.
    pub max_work_group_size: u32,
    /// Maximum work-item count in the first dimension.
    pub max_work_item_size: u32,
    /// Largest single allocation the device accepts, in bytes.
    pub max_buffer_bytes: u64,
    /// Device exposes double-precision arithmetic in kernels.
    pub supports_fp64: bool,
    /// Device advertises 64-bit global atomics.
    pub supports_int64_atomics: bool,
    /// NVIDIA compute-capability major version, when the attribute query exists.
    #[serde(default)]
    pub nvidia_compute_capability: Option<u32>,
    /// AMD attribute query, when the runtime supports it.
    #[serde(default)]
    pub amd_attributes: Option<AmdAttributes>,
    /// Enumeration index of the backing wgpu adapter, for probes that have one.
    #[serde(default)]
    pub adapter_index: Option<usize>,
}

impl DeviceQuery {
    /// A device record with neutral defaults, for tests and host platforms.
    #[must_use]
    pub fn named(name: impl Into<String>, vendor: impl Into<String>, kind: DeviceKind) -> Self {
        Self {
            name: name.into(),
            vendor: vendor.into(),
            kind,
            compute_units: 1,
            clock_mhz: 1,
            max_work_group_size: 256,
            max_work_item_size: 256,
            max_buffer_bytes: 1 << 30,
            supports_fp64: false,
            supports_int64_atomics: false,
            nvidia_compute_capability: None,
            amd_attributes: None,
            adapter_index: None,
        }
    }

    #[must_use]
    pub const fn is_gpu(&self) -> bool {
        matches!(self.kind, DeviceKind::Gpu)
    }
}

impl fmt::Display for DeviceQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fp = if self.supports_fp64 { "f64" } else { "f32" };
        write!(
            f,
            "{} ({}, {}, {} CU @ {} MHz, {})",
            self.name, self.vendor, self.kind, self.compute_units, self.clock_mhz, fp
        )
    }
}

/// One compute platform (driver stack) and the devices it exposes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformQuery {
    pub name: String,
    /// Platform vendor; decides whether the platform is officially supported.
    pub vendor: String,
    /// Driver/runtime version string.
    #[serde(default)]
    pub version: String,
    pub devices: Vec<DeviceQuery>,
}

impl PlatformQuery {
    #[must_use]
    pub fn new(name: impl Into<String>, vendor: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vendor: vendor.into(),
            version: String::new(),
            devices: Vec::new(),
        }
    }

    /// Append a device (builder style).
    #[must_use]
    pub fn with_device(mut self, device: DeviceQuery) -> Self {
        self.devices.push(device);
        self
    }
}

impl fmt::Display for PlatformQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}]: {} device(s)",
            self.name,
            self.vendor,
            self.devices.len()
        )
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn display_shows_vendor_and_units() {
        let mut d = DeviceQuery::named("RTX 4070", "NVIDIA Corporation", DeviceKind::Gpu);
        d.compute_units = 46;
        d.clock_mhz = 2475;
        d.supports_fp64 = true;
        let s = d.to_string();
        assert!(s.contains("RTX 4070"));
        assert!(s.contains("46 CU"));
        assert!(s.contains("f64"));
    }

    #[test]
    fn query_replays_from_json() {
        let platform = PlatformQuery::new("Vulkan", "NVIDIA Corporation").with_device(
            DeviceQuery::named("Titan V", "NVIDIA Corporation", DeviceKind::Gpu),
        );
        let json = serde_json::to_string(&platform).unwrap();
        let back: PlatformQuery = serde_json::from_str(&json).unwrap();
        assert_eq!(back, platform);
    }

    #[test]
    fn optional_attributes_default_when_absent() {
        let json = r#"{
            "name": "gfx1030", "vendor": "AMD", "kind": "Gpu",
            "compute_units": 40, "clock_mhz": 2500,
            "max_work_group_size": 256, "max_work_item_size": 256,
            "max_buffer_bytes": 1073741824,
            "supports_fp64": true, "supports_int64_atomics": false
        }"#;
        let d: DeviceQuery = serde_json::from_str(json).unwrap();
        assert!(d.amd_attributes.is_none());
        assert!(d.nvidia_compute_capability.is_none());
        assert!(d.is_gpu());
    }
}

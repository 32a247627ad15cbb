// SPDX-License-Identifier: AGPL-3.0-only

//! Vendor heuristics: throughput scoring and per-vendor kernel tuning.
//!
//! Device APIs do not report "how fast is this for MD". We approximate it as
//! `compute_units × elements_per_compute_unit × clock_mhz`, where the middle
//! term comes from a table keyed on vendor prefix:
//!
//! | Device | Elements / CU |
//! |--------|---------------|
//! | non-GPU | 1 |
//! | Apple GPU | 128 |
//! | Intel GPU | 8 |
//! | NVIDIA (attribute query) | 8 below compute capability 2, else 32 |
//! | AMD (attribute query) | simd/CU × simd width × instruction width |
//! | AMD on an Apple-hosted platform | 64 |
//! | anything else | 8 |

use crate::substrate::{DeviceQuery, PlatformQuery};
use std::collections::BTreeMap;

/// Platform vendor prefixes that are officially supported.
pub const SUPPORTED_PLATFORM_VENDORS: [&str; 5] =
    ["NVIDIA", "AMD", "Advanced Micro Devices", "Apple", "Intel"];

/// Default elements per compute unit when no rule applies.
const DEFAULT_ELEMENTS_PER_CU: u32 = 8;

/// Default thread blocks per compute unit.
const DEFAULT_BLOCKS_PER_CU: u32 = 6;

/// Vendor family of a device, from its vendor string prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VendorFamily {
    Apple,
    Intel,
    Nvidia,
    Amd,
    Other,
}

impl VendorFamily {
    #[must_use]
    pub fn from_vendor(vendor: &str) -> Self {
        if vendor.starts_with("Apple") {
            Self::Apple
        } else if vendor.starts_with("Intel") {
            Self::Intel
        } else if vendor.starts_with("NVIDIA") {
            Self::Nvidia
        } else if vendor.starts_with("AMD") || vendor.starts_with("Advanced Micro Devices, Inc.") {
            Self::Amd
        } else {
            Self::Other
        }
    }
}

/// Whether a platform vendor is on the supported list.
#[must_use]
pub fn is_supported_platform(platform_vendor: &str) -> bool {
    SUPPORTED_PLATFORM_VENDORS
        .iter()
        .any(|prefix| platform_vendor.starts_with(prefix))
}

/// Platforms whose vendor is Apple host AMD GPUs without the attribute query.
fn apple_hosted(platform_vendor: &str) -> bool {
    platform_vendor.starts_with("Apple")
}

/// Processing elements per compute unit for the throughput score.
#[must_use]
pub fn elements_per_compute_unit(device: &DeviceQuery, platform_vendor: &str) -> u32 {
    let family = VendorFamily::from_vendor(&device.vendor);
    if !device.is_gpu() {
        return 1;
    }
    match family {
        VendorFamily::Apple => 128,
        VendorFamily::Intel => 8,
        _ if device.nvidia_compute_capability.is_some() => {
            match device.nvidia_compute_capability {
                Some(major) if major < 2 => 8,
                _ => 32,
            }
        }
        VendorFamily::Amd => match device.amd_attributes {
            Some(attrs) => {
                let product = attrs
                    .simd_per_compute_unit
                    .saturating_mul(attrs.simd_width)
                    .saturating_mul(attrs.simd_instruction_width);
                product.max(1)
            }
            None if apple_hosted(platform_vendor) => 64,
            None => DEFAULT_ELEMENTS_PER_CU,
        },
        _ => DEFAULT_ELEMENTS_PER_CU,
    }
}

/// Throughput score used to rank candidate devices.
#[must_use]
pub fn throughput_score(device: &DeviceQuery, platform_vendor: &str) -> u64 {
    u64::from(device.compute_units)
        * u64::from(elements_per_compute_unit(device, platform_vendor))
        * u64::from(device.clock_mhz)
}

/// Kernel-launch tuning derived from the selected device's vendor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VendorTuning {
    /// Threads that execute in lockstep (warp / wavefront width); 1 if unknown.
    pub simd_width: u32,
    pub thread_blocks_per_compute_unit: u32,
    pub supports_64bit_atomics: bool,
    /// Vendor workaround defines handed to every compiled program.
    pub defines: BTreeMap<String, String>,
}

impl VendorTuning {
    /// Derive tuning for `device` on `platform`.
    #[must_use]
    pub fn for_device(device: &DeviceQuery, platform: &PlatformQuery) -> Self {
        let mut tuning = Self {
            simd_width: 1,
            thread_blocks_per_compute_unit: DEFAULT_BLOCKS_PER_CU,
            supports_64bit_atomics: device.supports_int64_atomics,
            defines: BTreeMap::new(),
        };
        match VendorFamily::from_vendor(&device.vendor) {
            VendorFamily::Apple => {
                tuning.simd_width = 32;
                tuning.thread_blocks_per_compute_unit = 12;
                tuning.defines.insert("VENDOR_APPLE".into(), String::new());
            }
            VendorFamily::Intel if device.is_gpu() => tuning.simd_width = 16,
            VendorFamily::Nvidia => {
                tuning.defines.insert("WARPS_ARE_ATOMIC".into(), String::new());
                tuning.simd_width = 32;
                if let Some(major) = device.nvidia_compute_capability {
                    // 64-bit atomics exist from 1.2 but are only fast from 2.0.
                    if major > 1 {
                        tuning.supports_64bit_atomics = true;
                    }
                    // Maxwell on CUDA 6.x miscompiles them.
                    if major == 5 && platform.version.contains("CUDA 6") {
                        tuning.supports_64bit_atomics = false;
                    }
                }
            }
            VendorFamily::Amd if device.is_gpu() => tune_amd_gpu(&mut tuning, device, platform),
            _ => {}
        }
        tuning
    }
}

fn tune_amd_gpu(tuning: &mut VendorTuning, device: &DeviceQuery, platform: &PlatformQuery) {
    let mut modern_runtime = false;
    if let Some(attrs) = device.amd_attributes {
        tuning.simd_width = attrs.wavefront_width.max(1);
        if attrs.simd_per_compute_unit > 1 {
            let per_simd = if tuning.simd_width == 32 { 6 } else { 4 };
            tuning.thread_blocks_per_compute_unit = per_simd * attrs.simd_per_compute_unit;
        }
        modern_runtime = true;
    } else if apple_hosted(&platform.vendor) {
        if is_rdna_name(&device.name) {
            tuning.thread_blocks_per_compute_unit = 6 * 2;
            tuning.simd_width = 32;
        } else {
            tuning.thread_blocks_per_compute_unit = 4 * 4;
            tuning.simd_width = 64;
        }
    }
    if !modern_runtime {
        tuning
            .defines
            .insert("AMD_ATOMIC_WORK_AROUND".into(), String::new());
    }
}

/// RDNA parts have a zero as the fourth digit of the model number
/// ("5700 XT", "6800X"), GCN/Vega parts do not ("560X", "Vega 64").
fn is_rdna_name(name: &str) -> bool {
    const PREFIXES: [&str; 3] = ["AMD Radeon Pro W", "AMD Radeon Pro ", "AMD Radeon RX "];
    PREFIXES
        .iter()
        .find_map(|p| name.strip_prefix(p))
        .and_then(|model| model.chars().nth(3))
        .is_some_and(|c| c == '0')
}

/// Default optimization flags for programs built on this platform.
///
/// Intel platforms get none. Apple platforms in mixed precision drop
/// `-no-signed-zeros`, which breaks double-single emulation.
#[must_use]
pub fn default_optimization_options(platform_vendor: &str, mixed_precision: bool) -> &'static str {
    if platform_vendor.starts_with("Intel") {
        ""
    } else if apple_hosted(platform_vendor) && mixed_precision {
        "-mad-enable"
    } else {
        "-mad-enable -no-signed-zeros"
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::substrate::{AmdAttributes, DeviceKind};

    fn gpu(vendor: &str) -> DeviceQuery {
        let mut d = DeviceQuery::named("test gpu", vendor, DeviceKind::Gpu);
        d.compute_units = 10;
        d.clock_mhz = 1000;
        d
    }

    #[test]
    fn supported_vendor_prefixes() {
        assert!(is_supported_platform("NVIDIA Corporation"));
        assert!(is_supported_platform("Advanced Micro Devices, Inc."));
        assert!(is_supported_platform("Apple"));
        assert!(!is_supported_platform("Mesa"));
        assert!(!is_supported_platform("Portable Computing Language"));
    }

    #[test]
    fn elements_table() {
        let cpu = DeviceQuery::named("cpu", "Apple", DeviceKind::Cpu);
        assert_eq!(elements_per_compute_unit(&cpu, "Apple"), 1);
        assert_eq!(elements_per_compute_unit(&gpu("Apple"), "Apple"), 128);
        assert_eq!(elements_per_compute_unit(&gpu("Intel(R) Corporation"), "Intel"), 8);
        assert_eq!(elements_per_compute_unit(&gpu("Mesa"), "Mesa"), 8);

        let mut fermi = gpu("NVIDIA Corporation");
        fermi.nvidia_compute_capability = Some(1);
        assert_eq!(elements_per_compute_unit(&fermi, "NVIDIA"), 8);
        fermi.nvidia_compute_capability = Some(7);
        assert_eq!(elements_per_compute_unit(&fermi, "NVIDIA"), 32);
    }

    #[test]
    fn amd_elements_use_attributes_or_fallback() {
        let mut amd = gpu("Advanced Micro Devices, Inc.");
        assert_eq!(elements_per_compute_unit(&amd, "AMD"), 8);
        assert_eq!(elements_per_compute_unit(&amd, "Apple"), 64);
        amd.amd_attributes = Some(AmdAttributes {
            simd_per_compute_unit: 4,
            simd_width: 16,
            simd_instruction_width: 1,
            wavefront_width: 64,
        });
        assert_eq!(elements_per_compute_unit(&amd, "AMD"), 64);
        amd.amd_attributes = Some(AmdAttributes::default());
        assert_eq!(elements_per_compute_unit(&amd, "AMD"), 1);
    }

    #[test]
    fn score_is_units_times_elements_times_clock() {
        assert_eq!(throughput_score(&gpu("Apple"), "Apple"), 10 * 128 * 1000);
    }

    #[test]
    fn nvidia_tuning_enables_atomics_from_compute_capability() {
        let mut d = gpu("NVIDIA Corporation");
        d.nvidia_compute_capability = Some(8);
        let p = PlatformQuery::new("CUDA", "NVIDIA Corporation");
        let t = VendorTuning::for_device(&d, &p);
        assert_eq!(t.simd_width, 32);
        assert!(t.supports_64bit_atomics);
        assert!(t.defines.contains_key("WARPS_ARE_ATOMIC"));
    }

    #[test]
    fn maxwell_on_cuda6_disables_atomics() {
        let mut d = gpu("NVIDIA Corporation");
        d.nvidia_compute_capability = Some(5);
        d.supports_int64_atomics = true;
        let mut p = PlatformQuery::new("CUDA", "NVIDIA Corporation");
        p.version = "OpenCL 1.1 CUDA 6.5.12".into();
        assert!(!VendorTuning::for_device(&d, &p).supports_64bit_atomics);
    }

    #[test]
    fn amd_tuning_paths() {
        let p = PlatformQuery::new("AMD APP", "Advanced Micro Devices, Inc.");
        let mut d = gpu("AMD");
        let legacy = VendorTuning::for_device(&d, &p);
        assert_eq!(legacy.simd_width, 1);
        assert!(legacy.defines.contains_key("AMD_ATOMIC_WORK_AROUND"));

        d.amd_attributes = Some(AmdAttributes {
            simd_per_compute_unit: 2,
            simd_width: 32,
            simd_instruction_width: 1,
            wavefront_width: 32,
        });
        let rdna = VendorTuning::for_device(&d, &p);
        assert_eq!(rdna.simd_width, 32);
        assert_eq!(rdna.thread_blocks_per_compute_unit, 12);
        assert!(!rdna.defines.contains_key("AMD_ATOMIC_WORK_AROUND"));
    }

    #[test]
    fn apple_hosted_amd_uses_model_number() {
        let p = PlatformQuery::new("Apple", "Apple");
        let mut d = gpu("AMD");
        d.name = "AMD Radeon RX 5700 XT".into();
        let t = VendorTuning::for_device(&d, &p);
        assert_eq!((t.simd_width, t.thread_blocks_per_compute_unit), (32, 12));
        d.name = "AMD Radeon Pro 560X".into();
        let t = VendorTuning::for_device(&d, &p);
        assert_eq!((t.simd_width, t.thread_blocks_per_compute_unit), (64, 16));
    }

    #[test]
    fn optimization_options_per_platform() {
        assert_eq!(default_optimization_options("Intel(R) Corporation", false), "");
        assert_eq!(default_optimization_options("Apple", true), "-mad-enable");
        assert_eq!(
            default_optimization_options("NVIDIA Corporation", true),
            "-mad-enable -no-signed-zeros"
        );
    }
}

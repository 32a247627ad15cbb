// SPDX-License-Identifier: AGPL-3.0-only

//! Hardware probing via wgpu.
//!
//! Each (wgpu backend, adapter vendor) pair becomes one [`PlatformQuery`]:
//! the backend is the driver stack, the vendor decides support. Adapter
//! names, device types, feature flags (`SHADER_F64`, `SHADER_INT64`) and
//! limits come straight from wgpu.
//!
//! wgpu reports neither compute-unit counts nor clocks. Where `nvidia-smi`
//! is present we enrich NVIDIA adapters with the max SM clock and compute
//! capability; everything else keeps the neutral value 1, so the score
//! ranks those devices by the vendor table alone.

use crate::substrate::{DeviceKind, DeviceQuery, PlatformQuery};
use std::process::Command;

const PCI_VENDOR_NVIDIA: u32 = 0x10de;
const PCI_VENDOR_AMD: u32 = 0x1002;
const PCI_VENDOR_INTEL: u32 = 0x8086;
const PCI_VENDOR_APPLE: u32 = 0x106b;

/// Create a wgpu instance with the backend configured via `MDCONTEXT_WGPU_BACKEND`.
#[must_use]
pub fn create_instance() -> wgpu::Instance {
    let backends = match std::env::var("MDCONTEXT_WGPU_BACKEND").as_deref() {
        Ok("vulkan") => wgpu::Backends::VULKAN,
        Ok("metal") => wgpu::Backends::METAL,
        Ok("dx12") => wgpu::Backends::DX12,
        Ok("gl") => wgpu::Backends::GL,
        _ => wgpu::Backends::all(),
    };
    wgpu::Instance::new(wgpu::InstanceDescriptor {
        backends,
        ..Default::default()
    })
}

/// Probe all wgpu adapters and group them into platforms.
///
/// Platform order follows first appearance in wgpu's enumeration, device
/// order within a platform likewise, so indices are stable within a run.
#[must_use]
pub fn probe_platforms(instance: &wgpu::Instance) -> Vec<PlatformQuery> {
    let nvidia = query_nvidia_smi();
    let mut platforms: Vec<PlatformQuery> = Vec::new();

    for (idx, adapter) in instance
        .enumerate_adapters(wgpu::Backends::all())
        .into_iter()
        .enumerate()
    {
        let info = adapter.get_info();
        let features = adapter.features();
        let limits = adapter.limits();
        let vendor = vendor_name(info.vendor);

        let mut device = DeviceQuery {
            name: info.name.clone(),
            vendor: vendor.clone(),
            kind: device_kind(info.device_type),
            compute_units: 1,
            clock_mhz: 1,
            max_work_group_size: limits.max_compute_invocations_per_workgroup,
            max_work_item_size: limits.max_compute_workgroup_size_x,
            max_buffer_bytes: limits.max_buffer_size,
            supports_fp64: features.contains(wgpu::Features::SHADER_F64),
            supports_int64_atomics: features.contains(wgpu::Features::SHADER_INT64),
            nvidia_compute_capability: None,
            amd_attributes: None,
            adapter_index: Some(idx),
        };
        if info.vendor == PCI_VENDOR_NVIDIA {
            if let Some(row) = nvidia.iter().find(|r| info.name.contains(&r.name)) {
                device.clock_mhz = row.max_sm_clock_mhz.max(1);
                device.nvidia_compute_capability = Some(row.compute_capability_major);
            }
        }

        let platform_name = format!("{:?}", info.backend);
        let slot = platforms
            .iter()
            .position(|p| p.name == platform_name && p.vendor == vendor);
        match slot {
            Some(i) => platforms[i].devices.push(device),
            None => {
                let mut platform = PlatformQuery::new(platform_name, vendor);
                platform.version = format!("{} {}", info.driver, info.driver_info)
                    .trim()
                    .to_string();
                platform.devices.push(device);
                platforms.push(platform);
            }
        }
    }

    platforms
}

fn device_kind(t: wgpu::DeviceType) -> DeviceKind {
    match t {
        wgpu::DeviceType::DiscreteGpu
        | wgpu::DeviceType::IntegratedGpu
        | wgpu::DeviceType::VirtualGpu => DeviceKind::Gpu,
        wgpu::DeviceType::Cpu => DeviceKind::Cpu,
        wgpu::DeviceType::Other => DeviceKind::Other,
    }
}

/// Vendor string for a PCI vendor ID, in the form device APIs report.
#[must_use]
pub fn vendor_name(pci_vendor: u32) -> String {
    match pci_vendor {
        PCI_VENDOR_NVIDIA => "NVIDIA Corporation".into(),
        PCI_VENDOR_AMD => "Advanced Micro Devices, Inc.".into(),
        PCI_VENDOR_INTEL => "Intel(R) Corporation".into(),
        PCI_VENDOR_APPLE => "Apple".into(),
        0 => "Unknown".into(),
        other => format!("PCI 0x{other:04x}"),
    }
}

struct NvidiaRow {
    name: String,
    max_sm_clock_mhz: u32,
    compute_capability_major: u32,
}

/// Query nvidia-smi for clocks and compute capability. Empty if unavailable.
fn query_nvidia_smi() -> Vec<NvidiaRow> {
    let Ok(output) = Command::new("nvidia-smi")
        .args([
            "--query-gpu=name,clocks.max.sm,compute_cap",
            "--format=csv,noheader,nounits",
        ])
        .output()
    else {
        return Vec::new();
    };
    if !output.status.success() {
        return Vec::new();
    }
    parse_nvidia_rows(&String::from_utf8_lossy(&output.stdout))
}

fn parse_nvidia_rows(text: &str) -> Vec<NvidiaRow> {
    text.lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split(',').map(str::trim).collect();
            if parts.len() < 3 {
                return None;
            }
            let major = parts[2].split('.').next()?.parse().ok()?;
            Some(NvidiaRow {
                name: parts[0].to_string(),
                max_sm_clock_mhz: parts[1].parse().unwrap_or(1),
                compute_capability_major: major,
            })
        })
        .collect()
}

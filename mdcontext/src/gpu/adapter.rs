// SPDX-License-Identifier: AGPL-3.0-only

//! Adapter lookup and device creation for a forge selection.
//!
//! Forge records each device's position in wgpu's adapter enumeration;
//! the adapter is re-enumerated here from a fresh instance and opened with
//! every optional feature the context can use.

use crate::backend::DeviceInfo;
use crate::error::{ContextError, Result};
use mdcontext_forge::probe::{create_instance, vendor_name};
use mdcontext_forge::SelectedDevice;

/// Create the device and queue for `selected`.
pub(super) async fn open_device(
    selected: &SelectedDevice,
) -> Result<(wgpu::Device, wgpu::Queue, DeviceInfo)> {
    let index = selected.device.adapter_index.ok_or_else(|| {
        ContextError::Initialization(format!(
            "device {} was not discovered through wgpu",
            selected.name()
        ))
    })?;
    let instance = create_instance();
    let adapter = instance
        .enumerate_adapters(wgpu::Backends::all())
        .into_iter()
        .nth(index)
        .ok_or_else(|| {
            ContextError::Initialization(format!("adapter {index} ({}) is no longer present", selected.name()))
        })?;

    let adapter_info = adapter.get_info();
    let adapter_features = adapter.features();
    let mut required_features = wgpu::Features::empty();
    for feature in [
        wgpu::Features::SHADER_F64,
        wgpu::Features::TIMESTAMP_QUERY,
        wgpu::Features::SHADER_INT64,
    ] {
        if adapter_features.contains(feature) {
            required_features |= feature;
        }
    }
    let required_limits = adapter.limits();

    let (device, queue) = adapter
        .request_device(
            &wgpu::DeviceDescriptor {
                label: Some("mdcontext compute device"),
                required_features,
                required_limits: required_limits.clone(),
                memory_hints: wgpu::MemoryHints::Performance,
            },
            None,
        )
        .await
        .map_err(|e| ContextError::Initialization(e.to_string()))?;

    let info = DeviceInfo {
        name: adapter_info.name.clone(),
        vendor: vendor_name(adapter_info.vendor),
        max_buffer_bytes: required_limits.max_buffer_size,
        max_work_group_size: required_limits.max_compute_invocations_per_workgroup,
        supports_fp64: required_features.contains(wgpu::Features::SHADER_F64),
        supports_timestamps: required_features.contains(wgpu::Features::TIMESTAMP_QUERY),
    };
    log::info!(
        "opened {} via {:?} (f64: {}, timestamps: {})",
        info.name,
        adapter_info.backend,
        info.supports_fp64,
        info.supports_timestamps
    );
    Ok((device, queue, info))
}

// SPDX-License-Identifier: AGPL-3.0-only

//! Device selection: route a simulation to the best capable device.
//!
//! Capability-based, like workload routing: we ask "who can do f64 with
//! work groups of at least 32?" and rank the survivors by
//! [`throughput_score`]. Officially supported platforms always beat
//! unsupported ones regardless of score.
//!
//! Selection is a pure function of the [`PlatformQuery`] records, so the
//! same hardware query always yields the same platform/device pair.

use crate::error::SelectionError;
use crate::substrate::{DeviceKind, DeviceQuery, PlatformQuery};
use crate::vendor::{is_supported_platform, throughput_score, VendorTuning};

/// Smallest work-group size the kernels can run with.
pub const MIN_THREAD_BLOCK_SIZE: u32 = 32;

/// What the caller asked for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SelectionRequest {
    /// Restrict the search to one platform.
    pub platform_index: Option<usize>,
    /// Restrict the search to one device index within each platform considered.
    pub device_index: Option<usize>,
    /// Mixed or Double precision: devices without fp64 are rejected.
    pub requires_double: bool,
}

/// The immutable selection result for one context.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectedDevice {
    pub platform_index: usize,
    pub device_index: usize,
    pub platform_name: String,
    pub platform_vendor: String,
    pub platform_version: String,
    pub device: DeviceQuery,
    pub score: u64,
    /// The platform vendor is on the supported list.
    pub supported: bool,
    pub tuning: VendorTuning,
}

impl SelectedDevice {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.device.name
    }

    #[must_use]
    pub const fn supports_double(&self) -> bool {
        self.device.supports_fp64
    }
}

struct Best {
    platform: usize,
    device: usize,
    score: u64,
    supported: bool,
}

/// Pick the device a context should run on.
///
/// # Errors
///
/// - [`SelectionError::IllegalArgument`] for an out-of-range platform or
///   device index, or a device index without a platform index when more
///   than one platform exists.
/// - [`SelectionError::NoCompatiblePlatform`] if no platform exposes a device.
/// - [`SelectionError::NoCompatibleDevice`] if devices exist but none pass
///   the filters.
pub fn select_device(
    platforms: &[PlatformQuery],
    request: &SelectionRequest,
) -> Result<SelectedDevice, SelectionError> {
    if let Some(p) = request.platform_index {
        if p >= platforms.len() {
            return Err(SelectionError::IllegalArgument(format!(
                "Illegal value for PlatformIndex: {p}"
            )));
        }
    }
    if platforms.len() > 1 && request.platform_index.is_none() && request.device_index.is_some() {
        return Err(SelectionError::IllegalArgument(
            "Specified DeviceIndex but not PlatformIndex.  When multiple platforms are available, \
             a platform index is needed to specify a device."
                .into(),
        ));
    }

    let mut best: Option<Best> = None;
    let mut saw_device = false;
    for (j, platform) in platforms.iter().enumerate() {
        if request.platform_index.is_some_and(|p| p != j) {
            continue;
        }
        let supported = is_supported_platform(&platform.vendor);
        if !supported && best.as_ref().is_some_and(|b| b.supported) {
            continue;
        }
        if platform.devices.is_empty() {
            continue;
        }
        saw_device = true;
        if let Some(d) = request.device_index {
            if d >= platform.devices.len() {
                return Err(SelectionError::IllegalArgument(format!(
                    "Illegal value for DeviceIndex: {d}"
                )));
            }
        }

        for (i, device) in platform.devices.iter().enumerate() {
            if request.device_index.is_some_and(|d| d != i) {
                continue;
            }
            if !passes_filters(device, platform, request) {
                continue;
            }
            let score = throughput_score(device, &platform.vendor);
            let better = best
                .as_ref()
                .map_or(true, |b| score > b.score || (supported && !b.supported));
            if better {
                best = Some(Best {
                    platform: j,
                    device: i,
                    score,
                    supported,
                });
            }
        }
    }

    let Some(best) = best else {
        return Err(if saw_device {
            SelectionError::NoCompatibleDevice
        } else {
            SelectionError::NoCompatiblePlatform
        });
    };

    let platform = &platforms[best.platform];
    let device = platform.devices[best.device].clone();
    if !best.supported {
        log::warn!(
            "Using an unsupported compute implementation ({}). Results may be incorrect.",
            platform.vendor
        );
    }
    log::info!(
        "selected device {}:{} {} (score {})",
        best.platform,
        best.device,
        device.name,
        best.score
    );
    let tuning = VendorTuning::for_device(&device, platform);
    Ok(SelectedDevice {
        platform_index: best.platform,
        device_index: best.device,
        platform_name: platform.name.clone(),
        platform_vendor: platform.vendor.clone(),
        platform_version: platform.version.clone(),
        device,
        score: best.score,
        supported: best.supported,
        tuning,
    })
}

fn passes_filters(device: &DeviceQuery, platform: &PlatformQuery, request: &SelectionRequest) -> bool {
    // The CPU device on Apple platforms does not work correctly.
    if platform.vendor == "Apple" && device.kind == DeviceKind::Cpu {
        return false;
    }
    if request.requires_double && !device.supports_fp64 {
        return false;
    }
    device.max_work_item_size >= MIN_THREAD_BLOCK_SIZE
        && device.max_work_group_size >= MIN_THREAD_BLOCK_SIZE
}

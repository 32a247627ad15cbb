// SPDX-License-Identifier: AGPL-3.0-only

//! Context report: what would a simulation run on?
//!
//! Lists every platform and device the probe finds, opens the contexts a
//! simulation with the given properties would open, and prints the
//! selected devices, vendor tuning and native-math probe results.
//!
//! Properties come from the environment (all optional):
//!   - `MDCONTEXT_DEVICE_INDEX`: e.g. `"0"` or `"0,1"`
//!   - `MDCONTEXT_PLATFORM_INDEX`: platform to restrict selection to
//!   - `MDCONTEXT_PRECISION`: `single`, `mixed` or `double`
//!
//! plus the tunables [`mdcontext::ContextConfig::from_env`] reads.
//!
//! Usage:
//!   cargo run --release --bin context_report
//!   cargo run --release --bin context_report -- --host 2   # host reference devices

use mdcontext::platform::PROPERTY_NAMES;
use mdcontext::{
    ContextConfig, ContextError, DeviceProvider, HostProvider, PlatformData, PlatformProperties,
    SystemLayout, WgpuProvider,
};

const REPORT_ATOMS: usize = 1000;

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let host_devices = args
        .iter()
        .position(|a| a == "--host")
        .map(|i| args.get(i + 1).and_then(|n| n.parse().ok()).unwrap_or(1));

    let provider: Box<dyn DeviceProvider> = match host_devices {
        Some(n) => Box::new(HostProvider::reference(n)),
        None => Box::new(WgpuProvider),
    };

    if let Err(e) = run(provider.as_ref()) {
        eprintln!("  ERROR: {e}");
        std::process::exit(e.exit_code().unwrap_or(1));
    }
}

fn env_pairs() -> Vec<(&'static str, String)> {
    [
        ("DeviceIndex", "MDCONTEXT_DEVICE_INDEX"),
        ("PlatformIndex", "MDCONTEXT_PLATFORM_INDEX"),
        ("Precision", "MDCONTEXT_PRECISION"),
    ]
    .into_iter()
    .filter_map(|(name, var)| std::env::var(var).ok().map(|v| (name, v)))
    .collect()
}

fn run(provider: &dyn DeviceProvider) -> Result<(), ContextError> {
    let config = ContextConfig::from_env()?;
    let pairs = env_pairs();
    let properties = PlatformProperties::from_pairs(pairs.iter().map(|(k, v)| (*k, v.as_str())))?;

    println!("═══════════════════════════════════════════════════════════");
    println!("  Device Context Report");
    println!("═══════════════════════════════════════════════════════════");
    println!();

    let platforms = provider.platforms()?;
    for (p, platform) in platforms.iter().enumerate() {
        println!("  Platform {p}: {} ({})", platform.name, platform.vendor);
        for (d, device) in platform.devices.iter().enumerate() {
            println!(
                "    [{d}] {:<40} {:?}, {} CUs, fp64={}",
                device.name, device.kind, device.compute_units, device.supports_fp64
            );
        }
    }
    println!();

    let system = SystemLayout::new(vec![1.0; REPORT_ATOMS]);
    let mut data = PlatformData::new(&system, &properties, &config, provider)?;
    data.initialize_contexts()?;

    for name in PROPERTY_NAMES {
        println!("  {name:<18} {}", data.property_value(name).unwrap_or("-"));
    }
    println!();

    for i in 0..data.context_count() {
        let line = data.thread(i)?.with_context(|ctx| {
            let tuning = &ctx.selected().tuning;
            let probe = ctx.native_errors().map_or_else(
                || "exact math".to_string(),
                |e| format!("sqrt {:.1e}, exp {:.1e}, log {:.1e}", e.sqrt, e.exp, e.log),
            );
            Ok(format!(
                "  Context {}: {} | simd {} | {} thread blocks | {} force buffers | {probe}",
                ctx.context_index(),
                ctx.selected().name(),
                tuning.simd_width,
                ctx.num_thread_blocks(),
                ctx.num_force_buffers(),
            ))
        })?;
        println!("{line}");
    }
    Ok(())
}

// SPDX-License-Identifier: AGPL-3.0-only

//! Discover and print every compute platform on this machine, the score
//! each device gets, and the device each precision mode would select.
//!
//! Pass `--json` to dump the raw hardware query instead, for replaying
//! selection offline.

use mdcontext_forge::probe::{create_instance, probe_platforms};
use mdcontext_forge::vendor::{is_supported_platform, throughput_score};
use mdcontext_forge::{select_device, SelectionRequest};

fn main() {
    let platforms = probe_platforms(&create_instance());

    if std::env::args().any(|a| a == "--json") {
        match serde_json::to_string_pretty(&platforms) {
            Ok(json) => println!("{json}"),
            Err(e) => eprintln!("serialize failed: {e}"),
        }
        return;
    }

    println!("═══ Compute Platforms ══════════════════════════════════════");
    if platforms.is_empty() {
        println!("  (none found)");
    }
    for (j, p) in platforms.iter().enumerate() {
        let tag = if is_supported_platform(&p.vendor) {
            "supported"
        } else {
            "unsupported"
        };
        println!("  [{j}] {p} ({tag}) {}", p.version);
        for (i, d) in p.devices.iter().enumerate() {
            println!(
                "      [{i}] {d}  score={}",
                throughput_score(d, &p.vendor)
            );
        }
    }

    println!();
    println!("═══ Selection ══════════════════════════════════════════════");
    for (label, requires_double) in [("single", false), ("mixed/double", true)] {
        let req = SelectionRequest {
            requires_double,
            ..SelectionRequest::default()
        };
        match select_device(&platforms, &req) {
            Ok(sel) => println!(
                "  {label:13} → {}:{} {} (simd {}, {} blocks/CU)",
                sel.platform_index,
                sel.device_index,
                sel.name(),
                sel.tuning.simd_width,
                sel.tuning.thread_blocks_per_compute_unit
            ),
            Err(e) => println!("  {label:13} → {e}"),
        }
    }
}

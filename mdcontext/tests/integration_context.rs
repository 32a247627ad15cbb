// SPDX-License-Identifier: AGPL-3.0-only
#![allow(clippy::unwrap_used)]

//! Integration tests: single-context public API.
//!
//! Drives `ComputeContext` against the host reference backend: precision
//! aliases in composed programs, auto-clearing, charge claims, force-buffer
//! sizing, device selection and the kernel trace.

use mdcontext::backend::{HostInvocation, HostProvider};
use mdcontext::context::{ComputeContext, ContextOptions, SystemLayout};
use mdcontext::force_info::NamedForce;
use mdcontext::precision::PrecisionMode;
use mdcontext::{ContextConfig, DeviceArray};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::{Arc, Mutex};

fn context_with(atoms: usize, options: ContextOptions) -> ComputeContext {
    ComputeContext::new(&SystemLayout::new(vec![1.0; atoms]), options, &HostProvider::reference(2)).unwrap()
}

fn context(atoms: usize) -> ComputeContext {
    context_with(atoms, ContextOptions::default())
}

const PROBE_SOURCE: &str = "@compute @workgroup_size(64) fn probeDefines() {}";

/// Writes `[PADDED_NUM_ATOMS, MY_CUTOFF == 1.5, mixed is f64, real is f64]`.
fn probe_defines(inv: &mut HostInvocation<'_>) -> mdcontext::Result<()> {
    let padded = inv
        .define_value("PADDED_NUM_ATOMS")
        .and_then(|v| v.trim().parse::<i32>().ok())
        .unwrap_or(-1);
    let cutoff = i32::from(inv.define_value("MY_CUTOFF").map(str::trim) == Some("1.5"));
    let mixed = i32::from(inv.mixed_is_double());
    let real = i32::from(inv.real_is_double());
    inv.store(0, &[padded, cutoff, mixed, real])
}

fn run_probe(precision: PrecisionMode, defines: &BTreeMap<String, String>) -> Vec<i32> {
    let provider = HostProvider::reference(1).with_kernel("probeDefines", Arc::new(probe_defines));
    let options = ContextOptions {
        precision,
        ..ContextOptions::default()
    };
    let ctx = ComputeContext::new(&SystemLayout::new(vec![1.0; 16]), options, &provider).unwrap();
    let program = ctx.create_program(PROBE_SOURCE, defines, None).unwrap();
    let kernel = program.kernel("probeDefines").unwrap();
    let out = DeviceArray::create_typed::<i32>(ctx.backend(), 4, "probe").unwrap();
    ctx.execute_kernel(&kernel, &[out.arg().unwrap()], 1, None).unwrap();
    out.download().unwrap()
}

#[test]
fn mixed_precision_program_sees_wide_mixed_type() {
    let seen = run_probe(PrecisionMode::Mixed, &BTreeMap::new());
    assert_eq!(&seen[2..], [1, 0]);
    let seen = run_probe(PrecisionMode::Single, &BTreeMap::new());
    assert_eq!(&seen[2..], [0, 0]);
    let seen = run_probe(PrecisionMode::Double, &BTreeMap::new());
    assert_eq!(&seen[2..], [1, 1]);
}

#[test]
fn call_site_define_cannot_override_engine_define() {
    let mut defines = BTreeMap::new();
    defines.insert("PADDED_NUM_ATOMS".to_string(), "7".to_string());
    defines.insert("MY_CUTOFF".to_string(), "1.5".to_string());
    let seen = run_probe(PrecisionMode::Single, &defines);
    assert_eq!(&seen[..2], [32, 1]);
}

#[test]
fn posq_charges_claimed_once() {
    let mut ctx = context(8);
    assert!(ctx.request_posq_charges());
    assert!(!ctx.request_posq_charges());
    assert!(!ctx.request_posq_charges());
}

#[test]
fn force_buffers_take_largest_request() {
    let mut ctx = context(8);
    ctx.set_platform_context_count(3).unwrap();
    for n in [Some(1), Some(2), None, Some(1)] {
        ctx.add_force(Box::new(NamedForce::new("f", n))).unwrap();
    }
    assert_eq!(ctx.num_force_buffers(), 2);
    ctx.initialize().unwrap();
    assert_eq!(ctx.num_force_buffers(), 3);
    assert_eq!(ctx.force_buffers().size(), 3 * ctx.padded_atoms());
    assert_eq!(ctx.force().size(), ctx.padded_atoms());
    assert_eq!(ctx.forces().len(), 4);
}

#[test]
fn selection_is_deterministic() {
    let a = context(4);
    let b = context(4);
    assert_eq!(a.selected().device_index, b.selected().device_index);
    assert_eq!(a.selected().name(), b.selected().name());

    let pinned = context_with(
        4,
        ContextOptions {
            device_index: Some(1),
            ..ContextOptions::default()
        },
    );
    assert_eq!(pinned.selected().name(), "Host Device 1");
}

#[test]
fn device_index_out_of_range_is_illegal_argument() {
    let err = ComputeContext::new(
        &SystemLayout::new(vec![1.0]),
        ContextOptions {
            device_index: Some(9),
            ..ContextOptions::default()
        },
        &HostProvider::reference(2),
    )
    .unwrap_err();
    assert!(matches!(err, mdcontext::ContextError::IllegalArgument(_)));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn autoclear_zeroes_every_registered_buffer(sizes in prop::collection::vec(1usize..300, 1..14)) {
        let mut ctx = context(4);
        let arrays: Vec<DeviceArray> = sizes
            .iter()
            .enumerate()
            .map(|(i, &n)| {
                let a = DeviceArray::create_typed::<f32>(ctx.backend(), n, &format!("buf{i}")).unwrap();
                a.upload(&vec![1.5f32; n], true).unwrap();
                a
            })
            .collect();
        for a in &arrays {
            ctx.add_autoclear_buffer(a).unwrap();
        }
        prop_assert_eq!(ctx.autoclear().len(), sizes.len());
        ctx.clear_autoclear_buffers().unwrap();
        for a in &arrays {
            prop_assert!(a.download::<f32>().unwrap().iter().all(|&v| v == 0.0));
        }
    }
}

#[derive(Clone, Default)]
struct SharedSink(Arc<Mutex<Vec<u8>>>);

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn profiling_traces_every_dispatch() {
    let config = ContextConfig {
        profile_kernels: true,
        ..ContextConfig::default()
    };
    let mut ctx = context_with(
        8,
        ContextOptions {
            config,
            ..ContextOptions::default()
        },
    );
    let sink = SharedSink::default();
    ctx.set_profile_sink(Box::new(sink.clone()));
    ctx.initialize().unwrap();
    ctx.clear_autoclear_buffers().unwrap();
    ctx.reduce_forces().unwrap();
    ctx.flush_profile().unwrap();

    let text = String::from_utf8(sink.0.lock().unwrap().clone()).unwrap();
    let events: Vec<serde_json::Value> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
    let names: Vec<&str> = events.iter().map(|e| e["name"].as_str().unwrap()).collect();
    assert_eq!(names, ["clearThreeBuffers", "reduceForces"]);
    assert!(events.iter().all(|e| e["ph"] == "X"));
}

// SPDX-License-Identifier: AGPL-3.0-only

//! Engine-wide compile-time defines.
//!
//! Fixed once when a context is constructed: launch geometry, device
//! capabilities, vendor workarounds, precision, the math-function mapping
//! chosen by the native-accuracy probe and the periodic-box macros.

use crate::precision::PrecisionMode;
use mdcontext_forge::VendorTuning;
use std::collections::BTreeMap;

/// Work-group size of generic kernels.
pub const THREAD_BLOCK_SIZE: u32 = 64;

/// Atoms per tile; atom counts are padded to a multiple of this.
pub const TILE_SIZE: usize = 32;

/// `TILE_SIZE × ceil(atoms / TILE_SIZE)`.
#[must_use]
pub const fn padded_atom_count(atoms: usize) -> usize {
    atoms.div_ceil(TILE_SIZE) * TILE_SIZE
}

/// Largest power of two not above `min(max_work_group_size, cap)`.
#[must_use]
pub fn energy_work_group_size(max_work_group_size: u32, cap: u32) -> u32 {
    let limit = max_work_group_size.min(cap).max(1);
    1 << (31 - limit.leading_zeros())
}

/// A box is triclinic when any box vector has an off-axis component.
#[must_use]
pub fn is_triclinic(box_vectors: &[[f64; 3]; 3]) -> bool {
    box_vectors
        .iter()
        .enumerate()
        .any(|(i, v)| v.iter().enumerate().any(|(j, &c)| i != j && c != 0.0))
}

/// Inputs to [`engine_defines`].
#[derive(Debug, Clone, Copy)]
pub struct DefineInputs<'a> {
    pub precision: PrecisionMode,
    pub tuning: &'a VendorTuning,
    pub supports_double: bool,
    pub reduce_energy_threadgroups: u32,
    pub energy_work_group_size: u32,
    pub num_atoms: usize,
    pub padded_atoms: usize,
}

/// Every define that does not depend on the native-accuracy probe or the
/// periodic box.
#[must_use]
pub fn engine_defines(inputs: &DefineInputs<'_>) -> BTreeMap<String, String> {
    let mut d = BTreeMap::new();
    d.insert("WORK_GROUP_SIZE".to_string(), THREAD_BLOCK_SIZE.to_string());
    d.insert("TILE_SIZE".to_string(), TILE_SIZE.to_string());
    d.insert(
        "ENERGY_WORK_GROUP_SIZE".to_string(),
        inputs.energy_work_group_size.to_string(),
    );
    d.insert("NUM_ATOMS".to_string(), inputs.num_atoms.to_string());
    d.insert("PADDED_NUM_ATOMS".to_string(), inputs.padded_atoms.to_string());
    for (k, v) in &inputs.tuning.defines {
        d.insert(k.clone(), v.clone());
    }
    if inputs.tuning.supports_64bit_atomics {
        d.insert("SUPPORTS_64_BIT_ATOMICS".to_string(), String::new());
    }
    if inputs.supports_double {
        d.insert("SUPPORTS_DOUBLE_PRECISION".to_string(), String::new());
    }
    // Lockstep warps only need the compiler not to reorder; WGSL has no
    // fence without a barrier, so an empty statement stands in for it.
    let sync = if inputs.tuning.simd_width >= 32 {
        ""
    } else {
        "workgroupBarrier()"
    };
    d.insert("SYNC_WARPS".to_string(), sync.to_string());
    let multiple = if inputs.reduce_energy_threadgroups > 1 { "1" } else { "0" };
    d.insert(
        "REDUCE_ENERGY_MULTIPLE_THREADGROUPS".to_string(),
        multiple.to_string(),
    );
    d.extend(inputs.precision.defines());
    d
}

/// Math functions whose implementation does not depend on the probe.
#[must_use]
pub fn fixed_math_defines() -> Vec<(String, String)> {
    [
        ("POW", "pow"),
        ("COS", "cos"),
        ("SIN", "sin"),
        ("TAN", "tan"),
        ("ACOS", "acos"),
        ("ASIN", "asin"),
        ("ATAN", "atan"),
        ("ERF", "erf_real"),
        ("ERFC", "erfc_real"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// `APPLY_PERIODIC_TO_*` macros. WGSL cannot assign through a swizzle, so
/// every component is wrapped on its own.
#[must_use]
pub fn periodic_defines(triclinic: bool) -> Vec<(String, String)> {
    let (delta, pos, centered) = if triclinic {
        (
            "{\n\
             let scale3 = floor(delta.z*invPeriodicBoxSize.z+0.5);\n\
             delta.x -= scale3*periodicBoxVecZ.x; delta.y -= scale3*periodicBoxVecZ.y; delta.z -= scale3*periodicBoxVecZ.z;\n\
             let scale2 = floor(delta.y*invPeriodicBoxSize.y+0.5);\n\
             delta.x -= scale2*periodicBoxVecY.x; delta.y -= scale2*periodicBoxVecY.y;\n\
             let scale1 = floor(delta.x*invPeriodicBoxSize.x+0.5);\n\
             delta.x -= scale1*periodicBoxVecX.x;}",
            "{\n\
             let scale3 = floor(pos.z*invPeriodicBoxSize.z);\n\
             pos.x -= scale3*periodicBoxVecZ.x; pos.y -= scale3*periodicBoxVecZ.y; pos.z -= scale3*periodicBoxVecZ.z;\n\
             let scale2 = floor(pos.y*invPeriodicBoxSize.y);\n\
             pos.x -= scale2*periodicBoxVecY.x; pos.y -= scale2*periodicBoxVecY.y;\n\
             let scale1 = floor(pos.x*invPeriodicBoxSize.x);\n\
             pos.x -= scale1*periodicBoxVecX.x;}",
            "{\n\
             let scale3 = floor((pos.z-center.z)*invPeriodicBoxSize.z+0.5);\n\
             pos.x -= scale3*periodicBoxVecZ.x; pos.y -= scale3*periodicBoxVecZ.y; pos.z -= scale3*periodicBoxVecZ.z;\n\
             let scale2 = floor((pos.y-center.y)*invPeriodicBoxSize.y+0.5);\n\
             pos.x -= scale2*periodicBoxVecY.x; pos.y -= scale2*periodicBoxVecY.y;\n\
             let scale1 = floor((pos.x-center.x)*invPeriodicBoxSize.x+0.5);\n\
             pos.x -= scale1*periodicBoxVecX.x;}",
        )
    } else {
        (
            "{\n\
             delta.x -= floor(delta.x*invPeriodicBoxSize.x+0.5)*periodicBoxSize.x;\n\
             delta.y -= floor(delta.y*invPeriodicBoxSize.y+0.5)*periodicBoxSize.y;\n\
             delta.z -= floor(delta.z*invPeriodicBoxSize.z+0.5)*periodicBoxSize.z;}",
            "{\n\
             pos.x -= floor(pos.x*invPeriodicBoxSize.x)*periodicBoxSize.x;\n\
             pos.y -= floor(pos.y*invPeriodicBoxSize.y)*periodicBoxSize.y;\n\
             pos.z -= floor(pos.z*invPeriodicBoxSize.z)*periodicBoxSize.z;}",
            "{\n\
             pos.x -= floor((pos.x-center.x)*invPeriodicBoxSize.x+0.5)*periodicBoxSize.x;\n\
             pos.y -= floor((pos.y-center.y)*invPeriodicBoxSize.y+0.5)*periodicBoxSize.y;\n\
             pos.z -= floor((pos.z-center.z)*invPeriodicBoxSize.z+0.5)*periodicBoxSize.z;}",
        )
    };
    vec![
        ("APPLY_PERIODIC_TO_DELTA(delta)".to_string(), delta.to_string()),
        ("APPLY_PERIODIC_TO_POS(pos)".to_string(), pos.to_string()),
        (
            "APPLY_PERIODIC_TO_POS_WITH_CENTER(pos, center)".to_string(),
            centered.to_string(),
        ),
    ]
}

// SPDX-License-Identifier: AGPL-3.0-only

//! WGSL sources of the utility kernels every context builds.
//!
//! Each kernel is its own program: with auto-derived pipeline layouts a
//! module may only declare the bindings its entry point uses. The clear
//! kernels for one to six buffers are generated.

use std::fmt::Write as _;

/// Helper block prepended to every program.
pub const COMMON: &str = include_str!("shaders/common.wgsl");

/// `reduceReal4Buffer(buffer, longBuffer, bufferSize, numBuffers)`.
pub const REDUCE_REAL4: &str = include_str!("shaders/reduce_real4.wgsl");

/// `reduceForces(longBuffer, buffer, bufferSize, numBuffers)`.
pub const REDUCE_FORCES: &str = include_str!("shaders/reduce_forces.wgsl");

/// `reduceEnergy(energyBuffer, result, bufferSize, workGroupSize)`.
pub const REDUCE_ENERGY: &str = include_str!("shaders/reduce_energy.wgsl");

/// `setCharges(charges, posq, atomOrder, numAtoms)`.
pub const SET_CHARGES: &str = include_str!("shaders/set_charges.wgsl");

/// `determineNativeAccuracy(values, numValues)`.
pub const NATIVE_ACCURACY: &str = include_str!("shaders/native_accuracy.wgsl");

/// Work-group size of the clear and reduce kernels.
pub const UTILITY_BLOCK_SIZE: u32 = 128;

/// Entry points clearing 1 to 6 buffers, indexed by count − 1.
pub const CLEAR_KERNEL_NAMES: [&str; 6] = [
    "clearBuffer",
    "clearTwoBuffers",
    "clearThreeBuffers",
    "clearFourBuffers",
    "clearFiveBuffers",
    "clearSixBuffers",
];

/// Source of the kernel zeroing `count` buffers (1..=6). Arguments
/// alternate `(buffer, words)`.
#[must_use]
pub fn clear_buffers_source(count: usize) -> String {
    let count = count.clamp(1, CLEAR_KERNEL_NAMES.len());
    let name = CLEAR_KERNEL_NAMES[count - 1];
    let mut src = String::from("struct ClearParams {\n");
    for i in 0..count {
        let _ = writeln!(src, "    size{i}: i32,");
    }
    src.push_str("}\n\n");
    for i in 0..count {
        let _ = writeln!(
            src,
            "@group(0) @binding({i}) var<storage, read_write> buffer{i}: array<u32>;"
        );
    }
    let _ = writeln!(
        src,
        "@group(0) @binding({count}) var<uniform> params: ClearParams;\n"
    );
    let _ = writeln!(src, "@compute @workgroup_size({UTILITY_BLOCK_SIZE})");
    let _ = writeln!(
        src,
        "fn {name}(@builtin(global_invocation_id) gid: vec3<u32>, @builtin(num_workgroups) nwg: vec3<u32>) {{"
    );
    let _ = writeln!(
        src,
        "    let start = linear_index(gid, nwg, {UTILITY_BLOCK_SIZE}u);"
    );
    let _ = writeln!(
        src,
        "    let stride = grid_stride(nwg, {UTILITY_BLOCK_SIZE}u);"
    );
    for i in 0..count {
        let _ = writeln!(
            src,
            "    for (var i = start; i < u32(params.size{i}); i += stride) {{\n        buffer{i}[i] = 0u;\n    }}"
        );
    }
    src.push_str("}\n");
    src
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::entry_points;

    #[test]
    fn clear_sources_bind_one_buffer_per_count() {
        for n in 1..=6 {
            let src = clear_buffers_source(n);
            assert_eq!(entry_points(&src), [CLEAR_KERNEL_NAMES[n - 1]]);
            assert_eq!(src.matches("var<storage").count(), n);
            assert!(src.contains(&format!("@binding({n}) var<uniform>")));
        }
    }

    #[test]
    fn utility_sources_expose_expected_entry_points() {
        assert_eq!(entry_points(REDUCE_REAL4), ["reduceReal4Buffer"]);
        assert_eq!(entry_points(REDUCE_FORCES), ["reduceForces"]);
        assert_eq!(entry_points(REDUCE_ENERGY), ["reduceEnergy"]);
        assert_eq!(entry_points(SET_CHARGES), ["setCharges"]);
        assert_eq!(entry_points(NATIVE_ACCURACY), ["determineNativeAccuracy"]);
    }

    #[test]
    fn common_block_has_no_entry_points() {
        assert!(entry_points(COMMON).is_empty());
        assert!(COMMON.contains("fn real_to_fixed"));
    }
}

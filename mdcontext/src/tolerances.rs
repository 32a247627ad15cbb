// SPDX-License-Identifier: AGPL-3.0-only

//! Numeric thresholds, each with the reason for its value.
//!
//! | Category | Basis | Example |
//! |----------|-------|---------|
//! | Device math | Native vs exact intrinsics | 1e-6 relative |
//! | Reductions | f32 accumulation order | 1e-6 absolute |
//! | Fixed point | 2^32 scale | 1e-9 absolute |

// ═══════════════════════════════════════════════════════════════════
// Device math
// ═══════════════════════════════════════════════════════════════════

/// Largest relative error a native (fast) intrinsic may show on the
/// accuracy probe before the exact function is used instead.
///
/// Single-precision `exp`, `log`, `sqrt` and `rsqrt` round to within a few
/// ulp (~1.2e-7 each); 1e-6 leaves head room for vendor fast paths that
/// are still good enough for force evaluation.
pub const NATIVE_MATH_MAX_RELATIVE_ERROR: f64 = 1e-6;

// ═══════════════════════════════════════════════════════════════════
// Reductions
// ═══════════════════════════════════════════════════════════════════

/// Host-vs-device agreement for energy and force reductions of values that
/// are exactly representable in f32.
///
/// Summation order differs between the reduction kernels and a sequential
/// host loop; for representable inputs the result is exact, so this only
/// absorbs the f32 → f64 widening.
pub const REDUCTION_ABS: f64 = 1e-6;

/// Resolution of the fixed-point force accumulators.
///
/// Forces are scaled by 2^32 before truncation to `i64`; one count is
/// ~2.3e-10, and a reduction over a handful of buffers accumulates at most
/// a few counts.
pub const FIXED_POINT_ABS: f64 = 1e-9;

// ═══════════════════════════════════════════════════════════════════
// Load balancing
// ═══════════════════════════════════════════════════════════════════

/// Drift allowed in the sum of nonbonded work fractions after repeated
/// rebalancing. Each step adds and removes the same f64 delta.
pub const PARTITION_SUM_ABS: f64 = 1e-9;

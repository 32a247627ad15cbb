// SPDX-License-Identifier: AGPL-3.0-only

//! Native-math accuracy probe.
//!
//! The fast single-precision intrinsics are evaluated on the device for a
//! geometric sequence of inputs and compared against f64 references. An
//! intrinsic is used only when its worst relative error stays below
//! [`crate::tolerances::NATIVE_MATH_MAX_RELATIVE_ERROR`]. The probe is
//! advisory: a device that fails it simply gets the exact functions.

use crate::precision::PrecisionMode;
use crate::tolerances::NATIVE_MATH_MAX_RELATIVE_ERROR;

/// Number of probe inputs.
pub const SAMPLE_COUNT: usize = 20;

/// Floats per probe record: input, five results, two unused.
pub const RECORD_WIDTH: usize = 8;

/// Probe records with the inputs filled in: `1e-4 × π^k` in slot 0.
#[must_use]
pub fn sample_records() -> Vec<f32> {
    let mut records = vec![0.0f32; SAMPLE_COUNT * RECORD_WIDTH];
    let mut next = 1e-4f32;
    for record in records.chunks_exact_mut(RECORD_WIDTH) {
        record[0] = next;
        next *= std::f32::consts::PI;
    }
    records
}

/// Worst relative error of each fast intrinsic over the probe inputs.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NativeErrors {
    pub sqrt: f64,
    pub rsqrt: f64,
    pub recip: f64,
    pub exp: f64,
    pub log: f64,
}

impl NativeErrors {
    /// Evaluate probe records returned by the device.
    ///
    /// Overflowed results compare as NaN and are ignored, as is any
    /// record whose reference is not finite.
    #[must_use]
    pub fn measure(records: &[f32]) -> Self {
        let mut e = Self::default();
        for r in records.chunks_exact(RECORD_WIDTH) {
            let v = f64::from(r[0]);
            let [sqrt, rsqrt, recip, exp, log] =
                [r[1], r[2], r[3], r[4], r[5]].map(f64::from);
            let correct_sqrt = v.sqrt();
            e.sqrt = e.sqrt.max((correct_sqrt - sqrt).abs() / correct_sqrt);
            e.rsqrt = e.rsqrt.max((1.0 / correct_sqrt - rsqrt).abs() * correct_sqrt);
            e.recip = e.recip.max((1.0 / v - recip).abs() / recip.abs());
            e.exp = e.exp.max((v.exp() - exp).abs() / exp.abs());
            e.log = e.log.max((v.ln() - log).abs() / log.abs());
        }
        e
    }

    fn accepts(error: f64) -> bool {
        error < NATIVE_MATH_MAX_RELATIVE_ERROR
    }
}

/// `SQRT`, `RSQRT`, `RECIP`, `EXP` and `LOG` for a context.
///
/// Double precision always gets the exact functions; so does a context
/// whose probe did not run.
#[must_use]
pub fn math_defines(precision: PrecisionMode, errors: Option<&NativeErrors>) -> Vec<(String, String)> {
    let fast = |error: fn(&NativeErrors) -> f64, native: &str, exact: &str| -> String {
        match errors {
            Some(e) if !precision.real_is_double() && NativeErrors::accepts(error(e)) => native.to_string(),
            _ => exact.to_string(),
        }
    };
    let defines = vec![
        ("SQRT".to_string(), fast(|e| e.sqrt, "fast_sqrt", "sqrt")),
        ("RSQRT".to_string(), fast(|e| e.rsqrt, "fast_rsqrt", "inverseSqrt")),
        ("RECIP".to_string(), fast(|e| e.recip, "fast_recip", "exact_recip")),
        ("EXP".to_string(), fast(|e| e.exp, "fast_exp", "exp")),
        ("LOG".to_string(), fast(|e| e.log, "fast_log", "log")),
    ];
    for (name, value) in &defines {
        log::debug!("native math: {name} -> {value}");
    }
    defines
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn evaluate(records: &mut [f32], perturb: f32) {
        for r in records.chunks_exact_mut(RECORD_WIDTH) {
            let x = r[0];
            r[1] = x.sqrt() * perturb;
            r[2] = 1.0 / x.sqrt();
            r[3] = 1.0 / x;
            r[4] = x.exp();
            r[5] = x.ln();
        }
    }

    #[test]
    fn samples_are_geometric() {
        let r = sample_records();
        assert_eq!(r.len(), 160);
        assert!((r[0] - 1e-4).abs() < 1e-10);
        let ratio = r[RECORD_WIDTH] / r[0];
        assert!((ratio - std::f32::consts::PI).abs() < 1e-5);
        assert!(r[1..RECORD_WIDTH].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn exact_f32_math_passes() {
        let mut r = sample_records();
        evaluate(&mut r, 1.0);
        let e = NativeErrors::measure(&r);
        assert!(e.sqrt < 1e-6 && e.rsqrt < 1e-6 && e.recip < 1e-6, "{e:?}");
        assert!(e.exp < 1e-6 && e.log < 1e-6, "{e:?}");
        let d = math_defines(PrecisionMode::Single, Some(&e));
        assert!(d.iter().all(|(_, v)| v.starts_with("fast_")));
    }

    #[test]
    fn inaccurate_sqrt_falls_back() {
        let mut r = sample_records();
        evaluate(&mut r, 1.0 + 1e-4);
        let e = NativeErrors::measure(&r);
        assert!(e.sqrt > 1e-6);
        let d = math_defines(PrecisionMode::Mixed, Some(&e));
        assert!(d.contains(&("SQRT".to_string(), "sqrt".to_string())));
        assert!(d.contains(&("RSQRT".to_string(), "fast_rsqrt".to_string())));
    }

    #[test]
    fn double_precision_always_exact() {
        let d = math_defines(PrecisionMode::Double, Some(&NativeErrors::default()));
        assert!(d.contains(&("RECIP".to_string(), "exact_recip".to_string())));
        assert!(d.iter().all(|(_, v)| !v.starts_with("fast_")));
    }

    #[test]
    fn missing_probe_is_exact() {
        let d = math_defines(PrecisionMode::Single, None);
        assert!(d.contains(&("EXP".to_string(), "exp".to_string())));
    }
}

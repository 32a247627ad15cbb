// SPDX-License-Identifier: AGPL-3.0-only

//! Precision modes and the type aliases generated kernels see.
//!
//! | Mode | `real` | `mixed` | positions | velocities |
//! |------|--------|---------|-----------|------------|
//! | Single | f32 | f32 | `vec4<f32>` | `vec4<f32>` |
//! | Mixed | f32 | f64 | `vec4<f32>` + correction | `vec4<f64>` |
//! | Double | f64 | f64 | `vec4<f64>` | `vec4<f64>` |

use crate::error::{ConfigKey, ContextError};
use std::fmt;
use std::str::FromStr;

/// Numeric precision of a context, fixed for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PrecisionMode {
    #[default]
    Single,
    Mixed,
    Double,
}

impl PrecisionMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Mixed => "mixed",
            Self::Double => "double",
        }
    }

    /// `real` is 64-bit.
    #[must_use]
    pub const fn real_is_double(self) -> bool {
        matches!(self, Self::Double)
    }

    /// `mixed` is 64-bit.
    #[must_use]
    pub const fn mixed_is_double(self) -> bool {
        matches!(self, Self::Mixed | Self::Double)
    }

    /// Device must support fp64 kernels.
    #[must_use]
    pub const fn requires_double(self) -> bool {
        self.mixed_is_double()
    }

    #[must_use]
    pub const fn real_size(self) -> usize {
        if self.real_is_double() {
            8
        } else {
            4
        }
    }

    #[must_use]
    pub const fn mixed_size(self) -> usize {
        if self.mixed_is_double() {
            8
        } else {
            4
        }
    }

    /// Bytes per `real4` element.
    #[must_use]
    pub const fn real4_size(self) -> usize {
        4 * self.real_size()
    }

    /// Bytes per `mixed4` element.
    #[must_use]
    pub const fn mixed4_size(self) -> usize {
        4 * self.mixed_size()
    }

    /// WGSL type aliases for `real`, `real2..4`, `mixed`, `mixed2..4`.
    #[must_use]
    pub fn type_aliases(self) -> String {
        let real = scalar(self.real_is_double());
        let mixed = scalar(self.mixed_is_double());
        let mut out = String::new();
        for (name, ty) in [("real", real), ("mixed", mixed)] {
            out.push_str(&format!("alias {name} = {ty};\n"));
            for n in 2..=4 {
                out.push_str(&format!("alias {name}{n} = vec{n}<{ty}>;\n"));
            }
        }
        out
    }

    /// Defines that tell kernels which mode they were built for, and map the
    /// vector construction/conversion helpers onto concrete types.
    #[must_use]
    pub fn defines(self) -> Vec<(String, String)> {
        let real = scalar(self.real_is_double());
        let mixed = scalar(self.mixed_is_double());
        let mut d = Vec::new();
        match self {
            Self::Double => d.push(("USE_DOUBLE_PRECISION".to_string(), "1".to_string())),
            Self::Mixed => d.push(("USE_MIXED_PRECISION".to_string(), "1".to_string())),
            Self::Single => {}
        }
        d.push(("convert_real4".into(), format!("vec4<{real}>")));
        d.push(("convert_mixed4".into(), format!("vec4<{mixed}>")));
        for n in 2..=4 {
            d.push((format!("make_real{n}"), format!("vec{n}<{real}>")));
            d.push((format!("make_mixed{n}"), format!("vec{n}<{mixed}>")));
        }
        d
    }
}

const fn scalar(double: bool) -> &'static str {
    if double {
        "f64"
    } else {
        "f32"
    }
}

impl FromStr for PrecisionMode {
    type Err = ContextError;

    /// Case-insensitive `"single"`, `"mixed"` or `"double"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "single" => Ok(Self::Single),
            "mixed" => Ok(Self::Mixed),
            "double" => Ok(Self::Double),
            _ => Err(ContextError::config(
                ConfigKey::Precision,
                format!("Illegal value for Precision: {s}"),
            )),
        }
    }
}

impl fmt::Display for PrecisionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!("Single".parse::<PrecisionMode>().unwrap(), PrecisionMode::Single);
        assert_eq!("MIXED".parse::<PrecisionMode>().unwrap(), PrecisionMode::Mixed);
        assert_eq!("double".parse::<PrecisionMode>().unwrap(), PrecisionMode::Double);
    }

    #[test]
    fn illegal_precision_is_configuration_error() {
        let err = "extra-fast".parse::<PrecisionMode>().unwrap_err();
        assert!(matches!(
            err,
            ContextError::Configuration {
                key: ConfigKey::Precision,
                ..
            }
        ));
        assert_eq!(err.to_string(), "Illegal value for Precision: extra-fast");
    }

    #[test]
    fn aliases_per_mode() {
        let single = PrecisionMode::Single.type_aliases();
        assert!(single.contains("alias real = f32;"));
        assert!(single.contains("alias mixed = f32;"));

        let mixed = PrecisionMode::Mixed.type_aliases();
        assert!(mixed.contains("alias real = f32;"));
        assert!(mixed.contains("alias mixed = f64;"));
        assert!(mixed.contains("alias mixed4 = vec4<f64>;"));

        let double = PrecisionMode::Double.type_aliases();
        assert!(double.contains("alias real4 = vec4<f64>;"));
        assert!(double.contains("alias mixed = f64;"));
    }

    #[test]
    fn element_sizes() {
        assert_eq!(PrecisionMode::Single.real4_size(), 16);
        assert_eq!(PrecisionMode::Mixed.real4_size(), 16);
        assert_eq!(PrecisionMode::Mixed.mixed4_size(), 32);
        assert_eq!(PrecisionMode::Double.real4_size(), 32);
    }

    #[test]
    fn mode_define_present_only_for_wide_modes() {
        let has = |m: PrecisionMode, k: &str| m.defines().iter().any(|(key, _)| key == k);
        assert!(has(PrecisionMode::Double, "USE_DOUBLE_PRECISION"));
        assert!(has(PrecisionMode::Mixed, "USE_MIXED_PRECISION"));
        assert!(!has(PrecisionMode::Single, "USE_MIXED_PRECISION"));
        assert!(has(PrecisionMode::Single, "make_real4"));
    }
}

// SPDX-License-Identifier: AGPL-3.0-only

//! Context configuration, validated at construction.
//!
//! Tuning knobs that used to be read ad hoc from the process environment
//! live in one [`ContextConfig`] value handed to every context. Values are
//! range-checked by [`ContextConfig::validate`]; nothing here terminates the
//! process. Binaries that want the legacy exit codes use
//! [`crate::error::ContextError::exit_code`].
//!
//! | Variable | Field | Accepted |
//! |----------|-------|----------|
//! | `MDCONTEXT_PROFILE_KERNELS` | `profile_kernels` | `0` or `1` |
//! | `MDCONTEXT_REDUCE_ENERGY_THREADGROUPS` | `reduce_energy_threadgroups` | integer in 1..=1024 |

use crate::error::{ConfigKey, ContextError, Result};
use serde::{Deserialize, Serialize};

/// Environment variable toggling per-kernel profiling.
pub const ENV_PROFILE_KERNELS: &str = "MDCONTEXT_PROFILE_KERNELS";

/// Environment variable with the energy-reduction thread-group count.
pub const ENV_REDUCE_ENERGY_THREADGROUPS: &str = "MDCONTEXT_REDUCE_ENERGY_THREADGROUPS";

/// Largest accepted energy-reduction thread-group count.
pub const MAX_REDUCE_ENERGY_THREADGROUPS: u32 = 1024;

/// Tunables shared by every context of a simulation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Record start/end of every dispatch and write a trace.
    pub profile_kernels: bool,
    /// Number of partial sums the energy reduction leaves for the host.
    pub reduce_energy_threadgroups: u32,
    /// Force/energy evaluations after which load balancing stops for good.
    pub rebalance_cutoff: u32,
    /// Dispatches buffered before the profiling trace is flushed.
    pub profile_flush_batch: usize,
    /// Upper bound for the energy-reduction work-group size.
    pub energy_workgroup_cap: u32,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            profile_kernels: false,
            reduce_energy_threadgroups: 1,
            rebalance_cutoff: 200,
            profile_flush_batch: 500,
            energy_workgroup_cap: 512,
        }
    }
}

impl ContextConfig {
    /// Range-check every field.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::Configuration`] naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_REDUCE_ENERGY_THREADGROUPS).contains(&self.reduce_energy_threadgroups) {
            return Err(ContextError::config(
                ConfigKey::ReduceEnergyThreadgroups,
                format!(
                    "reduce_energy_threadgroups must be in 1..={MAX_REDUCE_ENERGY_THREADGROUPS}, got {}",
                    self.reduce_energy_threadgroups
                ),
            ));
        }
        if self.profile_flush_batch == 0 {
            return Err(ContextError::config(
                ConfigKey::ProfileKernels,
                "profile_flush_batch must be at least 1",
            ));
        }
        if self.energy_workgroup_cap == 0 {
            return Err(ContextError::config(
                ConfigKey::ReduceEnergyThreadgroups,
                "energy_workgroup_cap must be at least 1",
            ));
        }
        Ok(())
    }

    /// Defaults overridden from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::Configuration`] for an illegal variable value.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden from an injected lookup, so callers and tests can
    /// supply values without touching the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::Configuration`] for an illegal value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(raw) = lookup(ENV_PROFILE_KERNELS) {
            config.profile_kernels = parse_profile_flag(&raw)?;
        }
        if let Some(raw) = lookup(ENV_REDUCE_ENERGY_THREADGROUPS) {
            config.reduce_energy_threadgroups = parse_threadgroups(&raw)?;
        }
        config.validate()?;
        Ok(config)
    }
}

fn parse_profile_flag(raw: &str) -> Result<bool> {
    match raw {
        "0" => Ok(false),
        "1" => Ok(true),
        other => Err(ContextError::config(
            ConfigKey::ProfileKernels,
            format!("{ENV_PROFILE_KERNELS} must be 0 or 1, got '{other}'"),
        )),
    }
}

fn parse_threadgroups(raw: &str) -> Result<u32> {
    let invalid = || {
        ContextError::config(
            ConfigKey::ReduceEnergyThreadgroups,
            format!(
                "{ENV_REDUCE_ENERGY_THREADGROUPS} must be an integer in 1..={MAX_REDUCE_ENERGY_THREADGROUPS}, got '{raw}'"
            ),
        )
    };
    let n: i64 = raw.parse().map_err(|_| invalid())?;
    u32::try_from(n)
        .ok()
        .filter(|n| (1..=MAX_REDUCE_ENERGY_THREADGROUPS).contains(n))
        .ok_or_else(invalid)
}

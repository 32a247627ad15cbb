// SPDX-License-Identifier: AGPL-3.0-only

//! Per-simulation platform state.
//!
//! [`PlatformData`] creates one [`ComputeContext`] per requested device,
//! moves each onto its own [`WorkThread`] and holds the state the
//! contexts share: per-context energies, step and evaluation counters,
//! simulation time, and the property values reported back to the host
//! application.
//!
//! | Property | Input | Reported |
//! |----------|-------|----------|
//! | `DeviceIndex` | comma/space separated list, empty = auto | chosen indices, comma-joined |
//! | `DeviceName` | – | device names, comma-joined |
//! | `PlatformIndex` | integer, empty = auto | platform of context 0 |
//! | `PlatformName` | – | platform name of context 0 |
//! | `Precision` | `single` / `mixed` / `double` | as given |
//! | `UseCpuPme` | `true` / `false` | `true` only if requested and not double |
//! | `DisablePmeStream` | `true` / `false` | as given |

use crate::config::ContextConfig;
use crate::context::{ComputeContext, ContextOptions, SystemLayout};
use crate::backend::DeviceProvider;
use crate::error::{ConfigKey, ContextError, Result};
use crate::precision::PrecisionMode;
use crate::work::{self, lock, WorkThread};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

pub const DEVICE_INDEX: &str = "DeviceIndex";
pub const DEVICE_NAME: &str = "DeviceName";
pub const PLATFORM_INDEX: &str = "PlatformIndex";
pub const PLATFORM_NAME: &str = "PlatformName";
pub const PRECISION: &str = "Precision";
pub const USE_CPU_PME: &str = "UseCpuPme";
pub const DISABLE_PME_STREAM: &str = "DisablePmeStream";

/// Every property name, in reporting order.
pub const PROPERTY_NAMES: [&str; 7] = [
    DEVICE_INDEX,
    DEVICE_NAME,
    PLATFORM_INDEX,
    PLATFORM_NAME,
    PRECISION,
    USE_CPU_PME,
    DISABLE_PME_STREAM,
];

/// Property values supplied when a simulation is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformProperties {
    pub device_index: String,
    pub platform_index: String,
    pub precision: String,
    pub use_cpu_pme: String,
    pub disable_pme_stream: String,
}

impl Default for PlatformProperties {
    fn default() -> Self {
        Self {
            device_index: String::new(),
            platform_index: String::new(),
            precision: "single".to_string(),
            use_cpu_pme: "false".to_string(),
            disable_pme_stream: "false".to_string(),
        }
    }
}

impl PlatformProperties {
    /// Defaults overridden by `(name, value)` pairs.
    ///
    /// # Errors
    ///
    /// [`ContextError::IllegalArgument`] for a name that is not a settable
    /// property.
    pub fn from_pairs<'a, I>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut props = Self::default();
        for (name, value) in pairs {
            let slot = match name {
                DEVICE_INDEX => &mut props.device_index,
                PLATFORM_INDEX => &mut props.platform_index,
                PRECISION => &mut props.precision,
                USE_CPU_PME => &mut props.use_cpu_pme,
                DISABLE_PME_STREAM => &mut props.disable_pme_stream,
                _ => {
                    return Err(ContextError::IllegalArgument(format!(
                        "Illegal property name: {name}"
                    )))
                }
            };
            *slot = value.to_string();
        }
        Ok(props)
    }
}

/// Device indices from a `DeviceIndex` value; empty entries are skipped.
///
/// # Errors
///
/// [`ContextError::Configuration`] for an entry that is not an index.
pub fn parse_device_list(value: &str) -> Result<Vec<usize>> {
    value
        .split([',', ' '])
        .filter(|s| !s.is_empty())
        .map(|s| parse_index(DEVICE_INDEX, s))
        .collect()
}

fn parse_index(property: &str, value: &str) -> Result<usize> {
    value.trim().parse().map_err(|_| {
        ContextError::config(
            ConfigKey::Property,
            format!("Illegal value for {property}: {value}"),
        )
    })
}

/// What the host application can read about one context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextSummary {
    pub device_index: usize,
    pub device_name: String,
    pub platform_index: usize,
    pub platform_name: String,
    pub padded_atoms: usize,
    pub periodic: bool,
    /// Byte size of one `real4`.
    pub real4_size: usize,
}

/// All contexts of one simulation and the state they share.
pub struct PlatformData {
    threads: Vec<WorkThread>,
    summaries: Vec<ContextSummary>,
    precision: PrecisionMode,
    config: ContextConfig,
    properties: BTreeMap<String, String>,
    context_energy: Arc<Mutex<Vec<f64>>>,
    has_initialized_contexts: bool,
    pub step_count: u64,
    pub compute_force_count: u64,
    pub time: f64,
}

impl PlatformData {
    /// Create and start one context per requested device.
    ///
    /// Properties are validated before any device is touched. If any
    /// context fails, the contexts already created are released before
    /// the error is returned.
    ///
    /// # Errors
    ///
    /// - [`ContextError::Configuration`] for an illegal precision or index.
    /// - Any error of [`ComputeContext::new`].
    pub fn new(
        system: &SystemLayout,
        properties: &PlatformProperties,
        config: &ContextConfig,
        provider: &dyn DeviceProvider,
    ) -> Result<Self> {
        let precision: PrecisionMode = properties.precision.parse()?;
        config.validate()?;
        let platform_index = match properties.platform_index.trim() {
            "" => None,
            s => Some(parse_index(PLATFORM_INDEX, s)?),
        };
        let devices = parse_device_list(&properties.device_index)?;
        let slots: Vec<Option<usize>> = if devices.is_empty() {
            vec![None]
        } else {
            devices.into_iter().map(Some).collect()
        };

        let count = slots.len();
        let mut contexts = Vec::with_capacity(count);
        for (index, device_index) in slots.into_iter().enumerate() {
            let options = ContextOptions {
                platform_index,
                device_index,
                precision,
                config: config.clone(),
                context_index: index,
            };
            let mut context = ComputeContext::new(system, options, provider).map_err(|e| {
                if !contexts.is_empty() {
                    log::warn!("context {index} failed; releasing {} created contexts", contexts.len());
                }
                e
            })?;
            context.set_platform_context_count(count)?;
            contexts.push(context);
        }

        let summaries: Vec<ContextSummary> = contexts
            .iter()
            .map(|c| ContextSummary {
                device_index: c.selected().device_index,
                device_name: c.selected().name().to_string(),
                platform_index: c.selected().platform_index,
                platform_name: c.selected().platform_name.clone(),
                padded_atoms: c.padded_atoms(),
                periodic: c.nonbonded().periodic(),
                real4_size: precision.real4_size(),
            })
            .collect();

        let join = |f: fn(&ContextSummary) -> String| summaries.iter().map(f).collect::<Vec<_>>().join(",");
        let mut values = BTreeMap::new();
        values.insert(DEVICE_INDEX.to_string(), join(|s| s.device_index.to_string()));
        values.insert(DEVICE_NAME.to_string(), join(|s| s.device_name.clone()));
        if let Some(first) = summaries.first() {
            values.insert(PLATFORM_INDEX.to_string(), first.platform_index.to_string());
            values.insert(PLATFORM_NAME.to_string(), first.platform_name.clone());
        }
        values.insert(PRECISION.to_string(), properties.precision.clone());
        let use_cpu_pme = properties.use_cpu_pme == "true" && !precision.real_is_double();
        values.insert(USE_CPU_PME.to_string(), use_cpu_pme.to_string());
        values.insert(
            DISABLE_PME_STREAM.to_string(),
            (properties.disable_pme_stream == "true").to_string(),
        );

        let threads = contexts
            .into_iter()
            .map(WorkThread::spawn)
            .collect::<Result<Vec<_>>>()?;
        log::info!("platform data ready: {count} context(s) on {}", values[DEVICE_NAME]);

        Ok(Self {
            threads,
            summaries,
            precision,
            config: config.clone(),
            properties: values,
            context_energy: Arc::new(Mutex::new(vec![0.0; count])),
            has_initialized_contexts: false,
            step_count: 0,
            compute_force_count: 0,
            time: 0.0,
        })
    }

    /// Initialize every context, once. Later calls do nothing.
    ///
    /// # Errors
    ///
    /// The first context failure.
    pub fn initialize_contexts(&mut self) -> Result<()> {
        if self.has_initialized_contexts {
            return Ok(());
        }
        for thread in &self.threads {
            thread.add_task(ComputeContext::initialize)?;
        }
        self.sync_contexts()?;
        self.has_initialized_contexts = true;
        Ok(())
    }

    /// Block until every worker has drained its queue.
    ///
    /// # Errors
    ///
    /// The first task failure since the last sync.
    pub fn sync_contexts(&self) -> Result<()> {
        work::sync_all(&self.threads)
    }

    #[must_use]
    pub fn context_count(&self) -> usize {
        self.threads.len()
    }

    /// Worker of context `index`.
    ///
    /// # Errors
    ///
    /// [`ContextError::IllegalArgument`] for an index out of range.
    pub fn thread(&self, index: usize) -> Result<&WorkThread> {
        self.threads.get(index).ok_or_else(|| {
            ContextError::IllegalArgument(format!(
                "context index {index} out of range for {} contexts",
                self.threads.len()
            ))
        })
    }

    #[must_use]
    pub fn summaries(&self) -> &[ContextSummary] {
        &self.summaries
    }

    #[must_use]
    pub const fn precision(&self) -> PrecisionMode {
        self.precision
    }

    #[must_use]
    pub const fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Energy each context accumulated in the current evaluation.
    #[must_use]
    pub const fn context_energy(&self) -> &Arc<Mutex<Vec<f64>>> {
        &self.context_energy
    }

    /// Sum of [`Self::context_energy`].
    ///
    /// # Errors
    ///
    /// [`ContextError::InvalidState`] if a worker panicked holding the energies.
    pub fn total_energy(&self) -> Result<f64> {
        Ok(lock(&self.context_energy)?.iter().sum())
    }

    #[must_use]
    pub fn property_value(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }

    #[must_use]
    pub fn use_cpu_pme(&self) -> bool {
        self.property_value(USE_CPU_PME) == Some("true")
    }

    #[must_use]
    pub fn disable_pme_stream(&self) -> bool {
        self.property_value(DISABLE_PME_STREAM) == Some("true")
    }
}

impl std::fmt::Debug for PlatformData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformData")
            .field("contexts", &self.threads.len())
            .field("precision", &self.precision)
            .field("step_count", &self.step_count)
            .field("compute_force_count", &self.compute_force_count)
            .field("time", &self.time)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::backend::HostProvider;

    fn system() -> SystemLayout {
        SystemLayout::new(vec![1.0; 10])
    }

    #[test]
    fn device_list_accepts_commas_and_spaces() {
        assert_eq!(parse_device_list("0,1 2").unwrap(), [0, 1, 2]);
        assert_eq!(parse_device_list("0, 1").unwrap(), [0, 1]);
        assert!(parse_device_list("").unwrap().is_empty());
        assert!(matches!(
            parse_device_list("0,x"),
            Err(ContextError::Configuration {
                key: ConfigKey::Property,
                ..
            })
        ));
    }

    #[test]
    fn unknown_property_is_rejected() {
        assert!(PlatformProperties::from_pairs([("Precision", "mixed")]).is_ok());
        assert!(matches!(
            PlatformProperties::from_pairs([("DeviceName", "x")]),
            Err(ContextError::IllegalArgument(_))
        ));
    }

    #[test]
    fn empty_device_list_creates_one_context() {
        let data = PlatformData::new(
            &system(),
            &PlatformProperties::default(),
            &ContextConfig::default(),
            &HostProvider::reference(2),
        )
        .unwrap();
        assert_eq!(data.context_count(), 1);
        assert_eq!(data.property_value(DEVICE_INDEX), Some("0"));
        assert_eq!(data.property_value(PLATFORM_NAME), Some("Host"));
        assert_eq!(data.property_value(PRECISION), Some("single"));
    }

    #[test]
    fn properties_join_across_contexts() {
        let props = PlatformProperties::from_pairs([("DeviceIndex", "1,0"), ("UseCpuPme", "true")]).unwrap();
        let data = PlatformData::new(
            &system(),
            &props,
            &ContextConfig::default(),
            &HostProvider::reference(2),
        )
        .unwrap();
        assert_eq!(data.property_value(DEVICE_INDEX), Some("1,0"));
        assert_eq!(
            data.property_value(DEVICE_NAME),
            Some("Host Device 1,Host Device 0")
        );
        assert!(data.use_cpu_pme());
        assert!(!data.disable_pme_stream());
    }

    #[test]
    fn double_precision_disables_cpu_pme() {
        let props = PlatformProperties::from_pairs([("Precision", "double"), ("UseCpuPme", "true")]).unwrap();
        let data = PlatformData::new(
            &system(),
            &props,
            &ContextConfig::default(),
            &HostProvider::reference(1),
        )
        .unwrap();
        assert!(!data.use_cpu_pme());
    }

    #[test]
    fn failed_context_releases_siblings() {
        let provider = HostProvider::reference(2);
        let props = PlatformProperties::from_pairs([("DeviceIndex", "0,1,5")]).unwrap();
        let err = PlatformData::new(&system(), &props, &ContextConfig::default(), &provider).unwrap_err();
        assert!(matches!(err, ContextError::IllegalArgument(_)));
        assert_eq!(provider.live_backends(), 0);
    }

    #[test]
    fn initialize_contexts_runs_once() {
        let mut data = PlatformData::new(
            &system(),
            &PlatformProperties::from_pairs([("DeviceIndex", "0 1")]).unwrap(),
            &ContextConfig::default(),
            &HostProvider::reference(2),
        )
        .unwrap();
        data.initialize_contexts().unwrap();
        data.initialize_contexts().unwrap();
        let buffers = data
            .thread(1)
            .unwrap()
            .with_context(|ctx| Ok(ctx.num_force_buffers()))
            .unwrap();
        assert_eq!(buffers, 2);
        assert!(data.thread(2).is_err());
    }
}

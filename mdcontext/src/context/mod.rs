// SPDX-License-Identifier: AGPL-3.0-only

//! One simulation bound to one compute device.
//!
//! A [`ComputeContext`] owns the backend it was opened on, the core
//! per-atom buffers, the utility kernels (clears, force and energy
//! reductions, charge scatter) and the engine-wide compile-time defines
//! every program it builds sees.
//!
//! Lifecycle:
//!
//! ```text
//!   new()          select device, open backend, allocate posq/velm/long_force,
//!                  probe native math, fix engine defines, build utility kernels
//!   add_force() /
//!   request_*()    raise force-buffer and energy-buffer requirements
//!   initialize()   size and allocate the accumulation buffers, register
//!                  them for auto-clearing, upload inverse masses
//!   per step       clear_autoclear_buffers → force kernels →
//!                  reduce_forces / reduce_energy
//! ```
//!
//! A context is used from one thread at a time; in multi-device runs it
//! lives on its own worker thread (see [`crate::work`]).

pub mod accuracy;
pub mod autoclear;
pub mod defines;
pub mod nonbonded;
pub mod profiling;
pub mod scratch;

pub use accuracy::NativeErrors;
pub use autoclear::AutoclearRegistry;
pub use defines::{padded_atom_count, THREAD_BLOCK_SIZE, TILE_SIZE};
pub use nonbonded::{AtomBlockRange, NonbondedPartition};
pub use profiling::KernelProfiler;
pub use scratch::{ScratchArena, ScratchUse};

use crate::array::DeviceArray;
use crate::backend::host::FIXED_POINT_SCALE;
use crate::backend::{BufferBinding, ComputeBackend, DeviceProvider, KernelArg};
use crate::config::ContextConfig;
use crate::error::{ContextError, Result};
use crate::force_info::ForceInfo;
use crate::precision::PrecisionMode;
use crate::program::{CompiledProgram, Kernel, ProgramSource};
use crate::shaders;
use defines::DefineInputs;
use mdcontext_forge::vendor::default_optimization_options;
use mdcontext_forge::{select_device, SelectedDevice, SelectionRequest};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;

/// Per-atom data a context needs from the simulated system.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemLayout {
    pub masses: Vec<f64>,
    pub periodic: bool,
    /// Box vectors as rows; only read when `periodic` is set.
    pub box_vectors: [[f64; 3]; 3],
}

impl SystemLayout {
    /// A non-periodic system with the given particle masses.
    #[must_use]
    pub fn new(masses: Vec<f64>) -> Self {
        Self {
            masses,
            periodic: false,
            box_vectors: [[0.0; 3]; 3],
        }
    }

    /// Make the system periodic in the given box.
    #[must_use]
    pub const fn with_periodic_box(mut self, box_vectors: [[f64; 3]; 3]) -> Self {
        self.periodic = true;
        self.box_vectors = box_vectors;
        self
    }

    #[must_use]
    pub fn num_atoms(&self) -> usize {
        self.masses.len()
    }
}

/// How a context is placed and configured.
#[derive(Debug, Clone, Default)]
pub struct ContextOptions {
    pub platform_index: Option<usize>,
    pub device_index: Option<usize>,
    pub precision: PrecisionMode,
    pub config: ContextConfig,
    /// Position of this context among the contexts of one simulation.
    pub context_index: usize,
}

/// `min(ceil(work / block), max_blocks) × block`, the grid every dispatch
/// is launched with.
#[must_use]
pub fn grid_size(work_units: usize, block_size: u32, max_blocks: u32) -> u32 {
    let block = block_size.max(1);
    let blocks = work_units
        .div_ceil(block as usize)
        .min(max_blocks.max(1) as usize);
    u32::try_from(blocks)
        .ok()
        .and_then(|b| b.checked_mul(block))
        .unwrap_or(u32::MAX - u32::MAX % block)
}

/// A count or index passed to a kernel as `i32`.
///
/// # Errors
///
/// [`ContextError::IllegalArgument`] if it does not fit.
pub fn int_arg(value: usize) -> Result<KernelArg> {
    i32::try_from(value)
        .map(KernelArg::I32)
        .map_err(|_| ContextError::IllegalArgument(format!("{value} does not fit a kernel int argument")))
}

fn build_program(
    backend: &Arc<dyn ComputeBackend>,
    precision: PrecisionMode,
    engine_defines: &BTreeMap<String, String>,
    source: &str,
    call_site_defines: &BTreeMap<String, String>,
    options: &str,
) -> Result<CompiledProgram> {
    let aliases = precision.type_aliases();
    let composed = ProgramSource {
        options,
        engine_defines,
        type_aliases: &aliases,
        common: shaders::COMMON,
        call_site_defines,
        source,
    }
    .compose();
    CompiledProgram::build(backend, &composed, options)
}

struct UtilityKernels {
    clear: Vec<Kernel>,
    reduce_real4: Kernel,
    reduce_forces: Kernel,
    reduce_energy: Kernel,
    set_charges: Kernel,
}

impl UtilityKernels {
    fn build(
        backend: &Arc<dyn ComputeBackend>,
        precision: PrecisionMode,
        engine_defines: &BTreeMap<String, String>,
        options: &str,
    ) -> Result<Self> {
        let none = BTreeMap::new();
        let build = |source: &str, name: &str| -> Result<Kernel> {
            build_program(backend, precision, engine_defines, source, &none, options)?.kernel(name)
        };
        let clear = shaders::CLEAR_KERNEL_NAMES
            .iter()
            .enumerate()
            .map(|(i, name)| build(&shaders::clear_buffers_source(i + 1), name))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            clear,
            reduce_real4: build(shaders::REDUCE_REAL4, "reduceReal4Buffer")?,
            reduce_forces: build(shaders::REDUCE_FORCES, "reduceForces")?,
            reduce_energy: build(shaders::REDUCE_ENERGY, "reduceEnergy")?,
            set_charges: build(shaders::SET_CHARGES, "setCharges")?,
        })
    }
}

/// Run the native-math probe on a freshly opened backend.
fn probe_native_accuracy(
    backend: &Arc<dyn ComputeBackend>,
    precision: PrecisionMode,
    engine_defines: &BTreeMap<String, String>,
    num_thread_blocks: u32,
) -> Result<NativeErrors> {
    let program = build_program(
        backend,
        precision,
        engine_defines,
        shaders::NATIVE_ACCURACY,
        &BTreeMap::new(),
        "",
    )?;
    let kernel = program.kernel("determineNativeAccuracy")?;
    let values = DeviceArray::create_typed::<f32>(
        backend,
        accuracy::SAMPLE_COUNT * accuracy::RECORD_WIDTH,
        "accuracyValues",
    )?;
    values.upload(&accuracy::sample_records(), true)?;
    let args = [values.arg()?, int_arg(accuracy::SAMPLE_COUNT)?];
    let global = grid_size(accuracy::SAMPLE_COUNT, THREAD_BLOCK_SIZE, num_thread_blocks);
    backend.dispatch(kernel.id(), &args, global, THREAD_BLOCK_SIZE, false)?;
    let records: Vec<f32> = values.download()?;
    Ok(NativeErrors::measure(&records))
}

/// Device, buffers and utility kernels of one simulation (or one
/// partition of it).
pub struct ComputeContext {
    backend: Arc<dyn ComputeBackend>,
    selected: SelectedDevice,
    config: ContextConfig,
    precision: PrecisionMode,
    context_index: usize,
    masses: Vec<f64>,
    num_atoms: usize,
    padded_atoms: usize,
    num_thread_blocks: u32,
    energy_work_group_size: u32,
    engine_defines: BTreeMap<String, String>,
    default_options: String,
    native_errors: Option<NativeErrors>,
    utility: UtilityKernels,

    posq: DeviceArray,
    posq_correction: DeviceArray,
    velm: DeviceArray,
    long_force: DeviceArray,
    atom_index: DeviceArray,
    force_buffers: DeviceArray,
    force: DeviceArray,
    energy_buffer: DeviceArray,
    energy_sum: DeviceArray,
    energy_param_deriv: DeviceArray,
    charge_buffer: DeviceArray,

    autoclear: AutoclearRegistry,
    scratch: ScratchArena,
    nonbonded: NonbondedPartition,
    forces: Vec<Box<dyn ForceInfo>>,
    num_force_buffers: usize,
    platform_context_count: usize,
    requested_energy_buffer_size: usize,
    energy_param_deriv_names: Vec<String>,
    posq_charges_assigned: bool,
    initialized: bool,
    profiler: RefCell<Option<KernelProfiler>>,
}

impl ComputeContext {
    /// Select a device, open it and prepare everything that does not
    /// depend on the registered forces.
    ///
    /// # Errors
    ///
    /// - [`ContextError::Configuration`] for an invalid `options.config`.
    /// - [`ContextError::IllegalArgument`], [`ContextError::NoCompatiblePlatform`]
    ///   or [`ContextError::NoCompatibleDevice`] from device selection.
    /// - [`ContextError::Initialization`] if the device cannot be opened.
    /// - [`ContextError::Compile`] if a utility kernel fails to build.
    pub fn new(system: &SystemLayout, options: ContextOptions, provider: &dyn DeviceProvider) -> Result<Self> {
        let ContextOptions {
            platform_index,
            device_index,
            precision,
            config,
            context_index,
        } = options;
        config.validate()?;

        let platforms = provider.platforms()?;
        let selected = select_device(
            &platforms,
            &SelectionRequest {
                platform_index,
                device_index,
                requires_double: precision.requires_double(),
            },
        )?;
        let backend = provider.open(&selected)?;

        let num_atoms = system.num_atoms();
        let padded_atoms = padded_atom_count(num_atoms);
        let num_thread_blocks = (selected.tuning.thread_blocks_per_compute_unit
            * selected.device.compute_units)
            .max(1);
        let energy_work_group_size =
            defines::energy_work_group_size(backend.info().max_work_group_size, config.energy_workgroup_cap);
        let default_options =
            default_optimization_options(&selected.platform_vendor, precision == PrecisionMode::Mixed).to_string();

        let mut engine_defines = defines::engine_defines(&DefineInputs {
            precision,
            tuning: &selected.tuning,
            supports_double: selected.supports_double(),
            reduce_energy_threadgroups: config.reduce_energy_threadgroups,
            energy_work_group_size,
            num_atoms,
            padded_atoms,
        });

        let native_errors = if precision.real_is_double() {
            None
        } else {
            match probe_native_accuracy(&backend, precision, &engine_defines, num_thread_blocks) {
                Ok(errors) => Some(errors),
                Err(e) => {
                    log::warn!("native math probe failed, using exact functions: {e}");
                    None
                }
            }
        };
        engine_defines.extend(accuracy::math_defines(precision, native_errors.as_ref()));
        engine_defines.extend(defines::fixed_math_defines());
        if system.periodic {
            engine_defines.extend(defines::periodic_defines(defines::is_triclinic(&system.box_vectors)));
        }

        let utility = UtilityKernels::build(&backend, precision, &engine_defines, &default_options)?;

        let posq = DeviceArray::create(&backend, padded_atoms, precision.real4_size(), "posq")?;
        let mut posq_correction = DeviceArray::new();
        if precision == PrecisionMode::Mixed {
            posq_correction.initialize(&backend, padded_atoms, 16, "posqCorrection")?;
        }
        let velm = DeviceArray::create(&backend, padded_atoms, precision.mixed4_size(), "velm")?;
        let long_force = DeviceArray::create_typed::<i64>(&backend, 3 * padded_atoms, "longForceBuffer")?;
        let atom_index = DeviceArray::create_typed::<i32>(&backend, padded_atoms, "atomIndex")?;
        let order: Vec<i32> = (0..padded_atoms)
            .map(|i| i32::try_from(i).unwrap_or(i32::MAX))
            .collect();
        atom_index.upload(&order, true)?;
        let nonbonded = NonbondedPartition::new(&backend, padded_atoms, system.periodic)?;

        let profiler = config.profile_kernels.then(|| {
            let sink: Box<dyn Write + Send> = Box::new(std::io::stderr());
            KernelProfiler::new(sink, config.profile_flush_batch)
        });

        log::info!(
            "context {context_index}: {} ({} thread blocks, {precision} precision, {num_atoms} atoms)",
            selected.name(),
            num_thread_blocks
        );

        Ok(Self {
            backend,
            selected,
            config,
            precision,
            context_index,
            masses: system.masses.clone(),
            num_atoms,
            padded_atoms,
            num_thread_blocks,
            energy_work_group_size,
            engine_defines,
            default_options,
            native_errors,
            utility,
            posq,
            posq_correction,
            velm,
            long_force,
            atom_index,
            force_buffers: DeviceArray::new(),
            force: DeviceArray::new(),
            energy_buffer: DeviceArray::new(),
            energy_sum: DeviceArray::new(),
            energy_param_deriv: DeviceArray::new(),
            charge_buffer: DeviceArray::new(),
            autoclear: AutoclearRegistry::new(),
            scratch: ScratchArena::new(),
            nonbonded,
            forces: Vec::new(),
            num_force_buffers: 0,
            platform_context_count: 1,
            requested_energy_buffer_size: 0,
            energy_param_deriv_names: Vec::new(),
            posq_charges_assigned: false,
            initialized: false,
            profiler: RefCell::new(profiler),
        })
    }

    fn before_initialize(&self, what: &str) -> Result<()> {
        if self.initialized {
            return Err(ContextError::InvalidState(format!(
                "{what} must be called before the context is initialized"
            )));
        }
        Ok(())
    }

    /// Allocate the accumulation buffers. Call exactly once, after every
    /// force has been registered.
    ///
    /// # Errors
    ///
    /// [`ContextError::InvalidState`] on a second call;
    /// [`ContextError::Allocation`] if a buffer does not fit.
    pub fn initialize(&mut self) -> Result<()> {
        self.before_initialize("initialize()")?;
        self.num_force_buffers = self.num_force_buffers.max(self.platform_context_count);
        let energy_size = (self.num_thread_blocks as usize * THREAD_BLOCK_SIZE as usize)
            .max(self.requested_energy_buffer_size);
        let padded = self.padded_atoms;
        let real4 = self.precision.real4_size();
        let mixed = self.precision.mixed_size();

        self.force_buffers
            .initialize(&self.backend, padded * self.num_force_buffers, real4, "forceBuffers")?;
        self.force = self.force_buffers.view(padded, real4, "force")?;
        self.energy_buffer
            .initialize(&self.backend, energy_size, mixed, "energyBuffer")?;
        self.energy_sum.initialize(
            &self.backend,
            self.config.reduce_energy_threadgroups as usize,
            mixed,
            "energySum",
        )?;

        self.autoclear.add(self.long_force.binding()?);
        self.autoclear.add(self.force_buffers.binding()?);
        self.autoclear.add(self.energy_buffer.binding()?);
        if !self.energy_param_deriv_names.is_empty() {
            self.energy_param_deriv.initialize(
                &self.backend,
                self.energy_param_deriv_names.len() * energy_size,
                mixed,
                "energyParamDerivBuffer",
            )?;
            self.autoclear.add(self.energy_param_deriv.binding()?);
        }

        self.scratch.reserve(ScratchUse::Velocities, self.velm.byte_len());
        self.scratch.reserve(
            ScratchUse::Energy,
            self.energy_buffer.byte_len().max(self.energy_sum.byte_len()),
        );
        self.scratch.reserve(ScratchUse::LongForces, self.long_force.byte_len());

        let bytes = self.scratch.bytes_mut(ScratchUse::Velocities, self.velm.byte_len())?;
        let inverse = |m: f64| if m == 0.0 { 0.0 } else { 1.0 / m };
        if self.precision.mixed_is_double() {
            let v: &mut [f64] = bytemuck::cast_slice_mut(&mut *bytes);
            v.fill(0.0);
            for (slot, &m) in v.chunks_exact_mut(4).zip(&self.masses) {
                slot[3] = inverse(m);
            }
        } else {
            let v: &mut [f32] = bytemuck::cast_slice_mut(&mut *bytes);
            v.fill(0.0);
            for (slot, &m) in v.chunks_exact_mut(4).zip(&self.masses) {
                #[allow(clippy::cast_possible_truncation)]
                {
                    slot[3] = inverse(m) as f32;
                }
            }
        }
        self.velm.upload_bytes(bytes, true)?;

        self.initialized = true;
        log::debug!(
            "context {} initialized: {} force buffers, energy buffer {energy_size}, {} autoclear buffers",
            self.context_index,
            self.num_force_buffers,
            self.autoclear.len()
        );
        Ok(())
    }

    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Compose and build a program. `options` of `None` uses the vendor
    /// default optimization options.
    ///
    /// # Errors
    ///
    /// [`ContextError::Compile`] with the backend diagnostic log.
    pub fn create_program(
        &self,
        source: &str,
        defines: &BTreeMap<String, String>,
        options: Option<&str>,
    ) -> Result<CompiledProgram> {
        let options = options.unwrap_or(&self.default_options);
        build_program(&self.backend, self.precision, &self.engine_defines, source, defines, options)
    }

    /// Enqueue `kernel` over `work_units` items. `block_size` defaults to
    /// [`THREAD_BLOCK_SIZE`]. Zero work enqueues nothing.
    ///
    /// # Errors
    ///
    /// [`ContextError::Dispatch`] from the backend.
    pub fn execute_kernel(
        &self,
        kernel: &Kernel,
        args: &[KernelArg],
        work_units: usize,
        block_size: Option<u32>,
    ) -> Result<()> {
        if work_units == 0 {
            return Ok(());
        }
        let block = block_size.unwrap_or(THREAD_BLOCK_SIZE);
        let global = grid_size(work_units, block, self.num_thread_blocks);
        let mut profiler = self
            .profiler
            .try_borrow_mut()
            .map_err(|_| ContextError::InvalidState("kernel profiler is already in use".into()))?;
        let timing = self
            .backend
            .dispatch(kernel.id(), args, global, block, profiler.is_some())?;
        if let (Some(p), Some(t)) = (profiler.as_mut(), timing) {
            p.record(kernel.name(), t)?;
        }
        Ok(())
    }

    /// Zero one byte range with the single-buffer clear kernel.
    ///
    /// # Errors
    ///
    /// [`ContextError::Dispatch`] from the backend.
    pub fn clear_binding(&self, binding: BufferBinding) -> Result<()> {
        let words = usize::try_from(binding.size / 4).unwrap_or(usize::MAX);
        self.execute_kernel(
            &self.utility.clear[0],
            &[KernelArg::Buffer(binding), int_arg(words)?],
            words,
            Some(shaders::UTILITY_BLOCK_SIZE),
        )
    }

    /// Zero a whole array.
    ///
    /// # Errors
    ///
    /// [`ContextError::InvalidState`] for an uninitialized array.
    pub fn clear_buffer(&self, array: &DeviceArray) -> Result<()> {
        self.clear_binding(array.binding()?)
    }

    /// Register an array to be zeroed by [`Self::clear_autoclear_buffers`].
    ///
    /// # Errors
    ///
    /// [`ContextError::InvalidState`] for an uninitialized array.
    pub fn add_autoclear_buffer(&mut self, array: &DeviceArray) -> Result<()> {
        self.autoclear.add(array.binding()?);
        Ok(())
    }

    #[must_use]
    pub const fn autoclear(&self) -> &AutoclearRegistry {
        &self.autoclear
    }

    /// Zero every registered buffer, up to six per dispatch.
    ///
    /// # Errors
    ///
    /// [`ContextError::Dispatch`] from the backend.
    pub fn clear_autoclear_buffers(&self) -> Result<()> {
        for batch in self.autoclear.batches() {
            let mut args = Vec::with_capacity(2 * batch.entries.len());
            for entry in batch.entries {
                args.push(KernelArg::Buffer(entry.binding));
                args.push(int_arg(entry.words as usize)?);
            }
            self.execute_kernel(
                &self.utility.clear[batch.entries.len() - 1],
                &args,
                batch.max_words as usize,
                Some(shaders::UTILITY_BLOCK_SIZE),
            )?;
        }
        Ok(())
    }

    /// Sum every force buffer and the fixed-point accumulators into the
    /// per-atom total, left in [`Self::force`] and [`Self::long_force`].
    ///
    /// # Errors
    ///
    /// [`ContextError::InvalidState`] before [`Self::initialize`].
    pub fn reduce_forces(&self) -> Result<()> {
        let args = [
            self.long_force.arg()?,
            self.force_buffers.arg()?,
            int_arg(self.padded_atoms)?,
            int_arg(self.num_force_buffers)?,
        ];
        self.execute_kernel(
            &self.utility.reduce_forces,
            &args,
            self.padded_atoms,
            Some(shaders::UTILITY_BLOCK_SIZE),
        )
    }

    /// Merge stacked real4 buffers `1..num_buffers` of `array` into its
    /// first `size / num_buffers` elements, starting from the fixed-point
    /// totals in `long_buffer`. The first buffer is assumed to agree with
    /// `long_buffer` already and is not added again; both hold the merged
    /// result afterwards.
    ///
    /// # Errors
    ///
    /// [`ContextError::IllegalArgument`] if `num_buffers` is zero.
    pub fn reduce_buffer(&self, array: &DeviceArray, long_buffer: &DeviceArray, num_buffers: usize) -> Result<()> {
        if num_buffers == 0 {
            return Err(ContextError::IllegalArgument(format!(
                "cannot reduce array {} over zero buffers",
                array.name()
            )));
        }
        let size = array.size() / num_buffers;
        let args = [array.arg()?, long_buffer.arg()?, int_arg(size)?, int_arg(num_buffers)?];
        self.execute_kernel(
            &self.utility.reduce_real4,
            &args,
            size,
            Some(shaders::UTILITY_BLOCK_SIZE),
        )
    }

    /// Total potential energy accumulated in the energy buffer.
    ///
    /// # Errors
    ///
    /// [`ContextError::InvalidState`] before [`Self::initialize`].
    pub fn reduce_energy(&mut self) -> Result<f64> {
        let groups = self.config.reduce_energy_threadgroups;
        let wg = self.energy_work_group_size;
        let args = [
            self.energy_buffer.arg()?,
            self.energy_sum.arg()?,
            int_arg(self.energy_buffer.size())?,
            int_arg(wg as usize)?,
        ];
        self.execute_kernel(
            &self.utility.reduce_energy,
            &args,
            groups as usize * wg as usize,
            Some(wg),
        )?;
        let written = groups.min(self.num_thread_blocks) as usize;
        let bytes = self
            .scratch
            .bytes_mut(ScratchUse::Energy, self.energy_sum.byte_len())?;
        self.energy_sum.download_bytes(bytes)?;
        let total = if self.precision.mixed_is_double() {
            bytemuck::cast_slice::<u8, f64>(bytes).iter().take(written).sum()
        } else {
            bytemuck::cast_slice::<u8, f32>(bytes)
                .iter()
                .take(written)
                .map(|&e| f64::from(e))
                .sum()
        };
        Ok(total)
    }

    /// Per-atom forces accumulated in the fixed-point buffer.
    ///
    /// # Errors
    ///
    /// [`ContextError::InvalidState`] before [`Self::initialize`].
    #[allow(clippy::cast_precision_loss)]
    pub fn download_forces(&mut self) -> Result<Vec<[f64; 3]>> {
        let bytes = self
            .scratch
            .bytes_mut(ScratchUse::LongForces, self.long_force.byte_len())?;
        self.long_force.download_bytes(bytes)?;
        let fixed: &[i64] = bytemuck::cast_slice(bytes);
        let padded = self.padded_atoms;
        Ok((0..self.num_atoms)
            .map(|i| std::array::from_fn(|c| fixed[i + c * padded] as f64 / FIXED_POINT_SCALE))
            .collect())
    }

    /// Upload per-atom charges and scatter them into `posq.w`.
    ///
    /// # Errors
    ///
    /// [`ContextError::IllegalArgument`] unless there is one charge per atom.
    pub fn set_charges(&mut self, charges: &[f64]) -> Result<()> {
        if charges.len() != self.num_atoms {
            return Err(ContextError::IllegalArgument(format!(
                "expected {} charges, got {}",
                self.num_atoms,
                charges.len()
            )));
        }
        if self.num_atoms == 0 {
            return Ok(());
        }
        if !self.charge_buffer.is_initialized() {
            self.charge_buffer.initialize(
                &self.backend,
                self.num_atoms,
                self.precision.real_size(),
                "chargeBuffer",
            )?;
        }
        self.charge_buffer
            .upload_f64(charges, !self.precision.real_is_double(), true)?;
        let args = [
            self.charge_buffer.arg()?,
            self.posq.arg()?,
            self.atom_index.arg()?,
            int_arg(self.num_atoms)?,
        ];
        self.execute_kernel(&self.utility.set_charges, &args, self.num_atoms, None)
    }

    /// Claim `posq.w` for charges. `true` for the first caller only.
    pub fn request_posq_charges(&mut self) -> bool {
        !std::mem::replace(&mut self.posq_charges_assigned, true)
    }

    /// Register a force component and the force buffers it needs.
    ///
    /// # Errors
    ///
    /// [`ContextError::InvalidState`] after [`Self::initialize`].
    pub fn add_force(&mut self, force: Box<dyn ForceInfo>) -> Result<()> {
        self.before_initialize("add_force()")?;
        if let Some(n) = force.required_force_buffers() {
            self.request_force_buffers(n)?;
        }
        log::debug!("context {}: registered force {}", self.context_index, force.name());
        self.forces.push(force);
        Ok(())
    }

    #[must_use]
    pub fn forces(&self) -> &[Box<dyn ForceInfo>] {
        &self.forces
    }

    /// Raise the number of force buffers to at least `n`.
    ///
    /// # Errors
    ///
    /// [`ContextError::InvalidState`] after [`Self::initialize`].
    pub fn request_force_buffers(&mut self, n: usize) -> Result<()> {
        self.before_initialize("request_force_buffers()")?;
        self.num_force_buffers = self.num_force_buffers.max(n);
        Ok(())
    }

    /// Raise the energy buffer to at least `n` elements.
    ///
    /// # Errors
    ///
    /// [`ContextError::InvalidState`] after [`Self::initialize`].
    pub fn request_energy_buffer_size(&mut self, n: usize) -> Result<()> {
        self.before_initialize("request_energy_buffer_size()")?;
        self.requested_energy_buffer_size = self.requested_energy_buffer_size.max(n);
        Ok(())
    }

    /// Register a global parameter whose energy derivative is accumulated.
    ///
    /// # Errors
    ///
    /// [`ContextError::InvalidState`] after [`Self::initialize`].
    pub fn add_energy_parameter_derivative(&mut self, name: &str) -> Result<()> {
        self.before_initialize("add_energy_parameter_derivative()")?;
        if !self.energy_param_deriv_names.iter().any(|n| n == name) {
            self.energy_param_deriv_names.push(name.to_string());
        }
        Ok(())
    }

    #[must_use]
    pub fn energy_param_deriv_names(&self) -> &[String] {
        &self.energy_param_deriv_names
    }

    /// Number of contexts sharing the simulation; every context allocates
    /// at least one force buffer per context.
    ///
    /// # Errors
    ///
    /// [`ContextError::InvalidState`] after [`Self::initialize`].
    pub fn set_platform_context_count(&mut self, n: usize) -> Result<()> {
        self.before_initialize("set_platform_context_count()")?;
        self.platform_context_count = n.max(1);
        Ok(())
    }

    /// Send the kernel trace to `sink` instead of stderr. Ignored unless
    /// profiling is enabled.
    pub fn set_profile_sink(&mut self, sink: Box<dyn Write + Send>) {
        if self.config.profile_kernels {
            *self.profiler.get_mut() = Some(KernelProfiler::new(sink, self.config.profile_flush_batch));
        }
    }

    /// Write buffered trace events now.
    ///
    /// # Errors
    ///
    /// [`ContextError::Backend`] if the sink cannot be written.
    pub fn flush_profile(&mut self) -> Result<()> {
        self.profiler.get_mut().as_mut().map_or(Ok(()), KernelProfiler::flush)
    }

    /// Block until all queued device work is done.
    ///
    /// # Errors
    ///
    /// Device loss.
    pub fn finish(&self) -> Result<()> {
        self.backend.finish()
    }

    #[must_use]
    pub const fn backend(&self) -> &Arc<dyn ComputeBackend> {
        &self.backend
    }

    #[must_use]
    pub const fn selected(&self) -> &SelectedDevice {
        &self.selected
    }

    #[must_use]
    pub const fn config(&self) -> &ContextConfig {
        &self.config
    }

    #[must_use]
    pub const fn precision(&self) -> PrecisionMode {
        self.precision
    }

    #[must_use]
    pub const fn context_index(&self) -> usize {
        self.context_index
    }

    #[must_use]
    pub const fn num_atoms(&self) -> usize {
        self.num_atoms
    }

    #[must_use]
    pub const fn padded_atoms(&self) -> usize {
        self.padded_atoms
    }

    #[must_use]
    pub const fn num_thread_blocks(&self) -> u32 {
        self.num_thread_blocks
    }

    #[must_use]
    pub const fn energy_work_group_size(&self) -> u32 {
        self.energy_work_group_size
    }

    #[must_use]
    pub const fn num_force_buffers(&self) -> usize {
        self.num_force_buffers
    }

    #[must_use]
    pub const fn engine_defines(&self) -> &BTreeMap<String, String> {
        &self.engine_defines
    }

    /// Probe results; `None` for double precision or a failed probe.
    #[must_use]
    pub const fn native_errors(&self) -> Option<&NativeErrors> {
        self.native_errors.as_ref()
    }

    #[must_use]
    pub const fn posq(&self) -> &DeviceArray {
        &self.posq
    }

    /// Low-order position bits; uninitialized unless precision is mixed.
    #[must_use]
    pub const fn posq_correction(&self) -> &DeviceArray {
        &self.posq_correction
    }

    #[must_use]
    pub const fn velm(&self) -> &DeviceArray {
        &self.velm
    }

    #[must_use]
    pub const fn long_force(&self) -> &DeviceArray {
        &self.long_force
    }

    #[must_use]
    pub const fn atom_index(&self) -> &DeviceArray {
        &self.atom_index
    }

    #[must_use]
    pub const fn force_buffers(&self) -> &DeviceArray {
        &self.force_buffers
    }

    /// The first force buffer. Holds the per-atom total after
    /// [`Self::reduce_forces`].
    #[must_use]
    pub const fn force(&self) -> &DeviceArray {
        &self.force
    }

    #[must_use]
    pub const fn energy_buffer(&self) -> &DeviceArray {
        &self.energy_buffer
    }

    #[must_use]
    pub const fn energy_param_deriv_buffer(&self) -> &DeviceArray {
        &self.energy_param_deriv
    }

    #[must_use]
    pub const fn nonbonded(&self) -> &NonbondedPartition {
        &self.nonbonded
    }

    pub fn nonbonded_mut(&mut self) -> &mut NonbondedPartition {
        &mut self.nonbonded
    }
}

impl std::fmt::Debug for ComputeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeContext")
            .field("device", &self.selected.name())
            .field("context_index", &self.context_index)
            .field("precision", &self.precision)
            .field("num_atoms", &self.num_atoms)
            .field("num_force_buffers", &self.num_force_buffers)
            .field("initialized", &self.initialized)
            .finish_non_exhaustive()
    }
}

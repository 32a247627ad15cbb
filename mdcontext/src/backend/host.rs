// SPDX-License-Identifier: AGPL-3.0-only

//! In-process reference backend.
//!
//! Allocations are byte vectors and kernels are Rust closures looked up by
//! entry-point name. Programs still go through the full composition and
//! preprocessing path, so define handling and entry-point resolution
//! behave exactly as on a device. The utility kernels every context needs
//! are built in; tests register their own with
//! [`HostBackend::register_kernel`] or [`HostProvider::with_kernel`].
//!
//! Fixed-point buffers are `i64` on the host. The device layout of
//! `(lo, hi)` u32 pairs is the same bytes in little-endian order.

use super::{
    AllocationId, BufferBinding, ComputeBackend, DeviceInfo, DeviceProvider, DispatchTiming,
    KernelArg, KernelId, ProgramId,
};
use crate::error::{ContextError, Result};
use crate::program::{self, Preprocessor};
use bytemuck::Pod;
use mdcontext_forge::{DeviceKind, DeviceQuery, PlatformQuery, SelectedDevice};
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;

/// Scale of the 32.32 fixed-point force accumulators.
pub const FIXED_POINT_SCALE: f64 = 4_294_967_296.0;

/// A host implementation of a kernel entry point.
pub type HostKernelFn = Arc<dyn Fn(&mut HostInvocation<'_>) -> Result<()> + Send + Sync>;

/// One recorded dispatch, for inspection in tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchRecord {
    pub kernel: String,
    pub global_size: u32,
    pub block_size: u32,
}

struct HostProgram {
    entry_points: Vec<String>,
    macros: Preprocessor,
}

#[derive(Default)]
struct HostState {
    next_id: u64,
    allocations: HashMap<AllocationId, Vec<u8>>,
    programs: HashMap<ProgramId, Arc<HostProgram>>,
    kernels: HashMap<KernelId, (Arc<HostProgram>, String)>,
    registry: HashMap<String, HostKernelFn>,
    dispatches: Vec<DispatchRecord>,
}

impl HostState {
    fn next(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn allocation(&self, id: AllocationId) -> Result<&Vec<u8>> {
        self.allocations.get(&id).ok_or_else(|| released(id))
    }

    fn allocation_mut(&mut self, id: AllocationId) -> Result<&mut Vec<u8>> {
        self.allocations.get_mut(&id).ok_or_else(|| released(id))
    }
}

fn released(id: AllocationId) -> ContextError {
    ContextError::InvalidState(format!("allocation {id} has been released"))
}

fn range(offset: u64, len: usize, total: usize, id: AllocationId) -> Result<std::ops::Range<usize>> {
    let start = usize::try_from(offset).unwrap_or(usize::MAX);
    match start.checked_add(len) {
        Some(end) if end <= total => Ok(start..end),
        _ => Err(ContextError::IllegalArgument(format!(
            "access of {len} bytes at offset {offset} exceeds allocation {id} of {total} bytes"
        ))),
    }
}

/// The reference device.
pub struct HostBackend {
    info: DeviceInfo,
    epoch: Instant,
    state: Mutex<HostState>,
}

impl HostBackend {
    /// A backend with the built-in utility kernels registered.
    #[must_use]
    pub fn new(info: DeviceInfo) -> Self {
        let mut state = HostState::default();
        for (name, f) in builtin_kernels() {
            state.registry.insert(name.to_string(), f);
        }
        Self {
            info,
            epoch: Instant::now(),
            state: Mutex::new(state),
        }
    }

    /// Register (or replace) the host implementation of an entry point.
    ///
    /// # Errors
    ///
    /// [`ContextError::Backend`] if the backend state is poisoned.
    pub fn register_kernel(&self, name: &str, f: HostKernelFn) -> Result<()> {
        self.state()?.registry.insert(name.to_string(), f);
        Ok(())
    }

    /// Every dispatch since creation, in order.
    #[must_use]
    pub fn dispatches(&self) -> Vec<DispatchRecord> {
        self.state
            .lock()
            .map(|s| s.dispatches.clone())
            .unwrap_or_default()
    }

    /// Number of live allocations.
    #[must_use]
    pub fn live_allocations(&self) -> usize {
        self.state.lock().map(|s| s.allocations.len()).unwrap_or(0)
    }

    fn state(&self) -> Result<MutexGuard<'_, HostState>> {
        self.state
            .lock()
            .map_err(|_| ContextError::Backend("host backend state poisoned".into()))
    }

    fn now_ns(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

impl ComputeBackend for HostBackend {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn allocate(&self, bytes: u64, label: &str) -> Result<AllocationId> {
        if bytes > self.info.max_buffer_bytes {
            return Err(ContextError::Allocation {
                name: label.to_string(),
                bytes,
            });
        }
        let len = usize::try_from(bytes).map_err(|_| ContextError::Allocation {
            name: label.to_string(),
            bytes,
        })?;
        let mut state = self.state()?;
        let id = AllocationId(state.next());
        state.allocations.insert(id, vec![0; len]);
        Ok(id)
    }

    fn release(&self, id: AllocationId) {
        if let Ok(mut state) = self.state.lock() {
            state.allocations.remove(&id);
        }
    }

    fn write(&self, id: AllocationId, offset: u64, data: &[u8], _blocking: bool) -> Result<()> {
        let mut state = self.state()?;
        let buf = state.allocation_mut(id)?;
        let r = range(offset, data.len(), buf.len(), id)?;
        buf[r].copy_from_slice(data);
        Ok(())
    }

    fn read(&self, id: AllocationId, offset: u64, out: &mut [u8]) -> Result<()> {
        let state = self.state()?;
        let buf = state.allocation(id)?;
        let r = range(offset, out.len(), buf.len(), id)?;
        out.copy_from_slice(&buf[r]);
        Ok(())
    }

    fn copy(&self, src: BufferBinding, dst: BufferBinding) -> Result<()> {
        let mut state = self.state()?;
        let len = usize::try_from(src.size).unwrap_or(usize::MAX);
        let source = state.allocation(src.allocation)?;
        let r = range(src.offset, len, source.len(), src.allocation)?;
        let bytes = source[r].to_vec();
        let dest = state.allocation_mut(dst.allocation)?;
        let r = range(dst.offset, len, dest.len(), dst.allocation)?;
        dest[r].copy_from_slice(&bytes);
        Ok(())
    }

    fn build_program(&self, source: &str, _options: &str) -> Result<ProgramId> {
        let (text, macros) = program::preprocess(source)?;
        let entry_points = program::entry_points(&text);
        let mut state = self.state()?;
        let id = ProgramId(state.next());
        state.programs.insert(
            id,
            Arc::new(HostProgram {
                entry_points,
                macros,
            }),
        );
        Ok(id)
    }

    fn kernel(&self, program: ProgramId, name: &str) -> Result<KernelId> {
        let mut state = self.state()?;
        let prog = state
            .programs
            .get(&program)
            .cloned()
            .ok_or_else(|| ContextError::InvalidState(format!("unknown program {program:?}")))?;
        if !prog.entry_points.iter().any(|e| e == name) {
            return Err(ContextError::InvalidState(format!(
                "No kernel named {name} in program"
            )));
        }
        if !state.registry.contains_key(name) {
            return Err(ContextError::InvalidState(format!(
                "kernel {name} has no host implementation"
            )));
        }
        let id = KernelId(state.next());
        state.kernels.insert(id, (prog, name.to_string()));
        Ok(id)
    }

    fn dispatch(
        &self,
        kernel: KernelId,
        args: &[KernelArg],
        global_size: u32,
        block_size: u32,
        timed: bool,
    ) -> Result<Option<DispatchTiming>> {
        let mut state = self.state()?;
        let (prog, name) = state
            .kernels
            .get(&kernel)
            .cloned()
            .ok_or_else(|| ContextError::InvalidState(format!("unknown kernel {kernel:?}")))?;
        let f = state.registry.get(&name).cloned().ok_or_else(|| ContextError::Dispatch {
            kernel: name.clone(),
            message: "no host implementation".into(),
        })?;
        if block_size == 0 || global_size % block_size != 0 {
            return Err(ContextError::Dispatch {
                kernel: name,
                message: format!("global size {global_size} is not a multiple of block size {block_size}"),
            });
        }
        state.dispatches.push(DispatchRecord {
            kernel: name.clone(),
            global_size,
            block_size,
        });

        let start_ns = self.now_ns();
        let mut invocation = HostInvocation {
            kernel: &name,
            memory: &mut state.allocations,
            args,
            program: &prog,
            global_size,
            block_size,
        };
        f(&mut invocation)?;
        let end_ns = self.now_ns();
        Ok(timed.then_some(DispatchTiming { start_ns, end_ns }))
    }

    fn finish(&self) -> Result<()> {
        Ok(())
    }
}

/// The view of device state a host kernel runs against.
pub struct HostInvocation<'a> {
    kernel: &'a str,
    memory: &'a mut HashMap<AllocationId, Vec<u8>>,
    args: &'a [KernelArg],
    program: &'a HostProgram,
    global_size: u32,
    block_size: u32,
}

impl HostInvocation<'_> {
    #[must_use]
    pub const fn global_size(&self) -> u32 {
        self.global_size
    }

    #[must_use]
    pub const fn block_size(&self) -> u32 {
        self.block_size
    }

    #[must_use]
    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    /// Whether the program was built with `name` defined.
    #[must_use]
    pub fn is_defined(&self, name: &str) -> bool {
        self.program.macros.is_defined(name)
    }

    /// Object-like body of a define in the built program.
    #[must_use]
    pub fn define_value(&self, name: &str) -> Option<&str> {
        self.program.macros.get(name).map(|m| m.body.as_str())
    }

    /// `real` is f64 in this program.
    #[must_use]
    pub fn real_is_double(&self) -> bool {
        self.is_defined("USE_DOUBLE_PRECISION")
    }

    /// `mixed` is f64 in this program.
    #[must_use]
    pub fn mixed_is_double(&self) -> bool {
        self.real_is_double() || self.is_defined("USE_MIXED_PRECISION")
    }

    fn fail(&self, message: impl Into<String>) -> ContextError {
        ContextError::Dispatch {
            kernel: self.kernel.to_string(),
            message: message.into(),
        }
    }

    fn arg(&self, index: usize) -> Result<KernelArg> {
        self.args
            .get(index)
            .copied()
            .ok_or_else(|| self.fail(format!("missing argument {index}")))
    }

    fn binding(&self, index: usize) -> Result<BufferBinding> {
        match self.arg(index)? {
            KernelArg::Buffer(b) => Ok(b),
            other => Err(self.fail(format!("argument {index} is {other:?}, expected a buffer"))),
        }
    }

    /// Raw bytes of a buffer argument.
    ///
    /// # Errors
    ///
    /// Missing/non-buffer argument or released allocation.
    pub fn bytes(&self, index: usize) -> Result<&[u8]> {
        let b = self.binding(index)?;
        let buf = self.memory.get(&b.allocation).ok_or_else(|| released(b.allocation))?;
        let r = range(b.offset, usize::try_from(b.size).unwrap_or(usize::MAX), buf.len(), b.allocation)?;
        Ok(&buf[r])
    }

    /// Mutable raw bytes of a buffer argument.
    ///
    /// # Errors
    ///
    /// Missing/non-buffer argument or released allocation.
    pub fn bytes_mut(&mut self, index: usize) -> Result<&mut [u8]> {
        let b = self.binding(index)?;
        let buf = self.memory.get_mut(&b.allocation).ok_or_else(|| released(b.allocation))?;
        let r = range(b.offset, usize::try_from(b.size).unwrap_or(usize::MAX), buf.len(), b.allocation)?;
        Ok(&mut buf[r])
    }

    /// Copy a buffer argument out as typed elements.
    ///
    /// # Errors
    ///
    /// Missing argument, or a byte length not divisible by the element size.
    pub fn load<T: Pod>(&self, index: usize) -> Result<Vec<T>> {
        let bytes = self.bytes(index)?;
        if bytes.len() % std::mem::size_of::<T>() != 0 {
            return Err(self.fail(format!(
                "argument {index} holds {} bytes, not a whole number of {}-byte elements",
                bytes.len(),
                std::mem::size_of::<T>()
            )));
        }
        Ok(bytemuck::pod_collect_to_vec(bytes))
    }

    /// Write typed elements to the start of a buffer argument.
    ///
    /// # Errors
    ///
    /// Missing argument, or more data than the binding holds.
    pub fn store<T: Pod>(&mut self, index: usize, data: &[T]) -> Result<()> {
        let src: &[u8] = bytemuck::cast_slice(data);
        let kernel = self.kernel.to_string();
        let dst = self.bytes_mut(index)?;
        if src.len() > dst.len() {
            return Err(ContextError::Dispatch {
                kernel,
                message: format!("argument {index}: {} bytes do not fit in {}", src.len(), dst.len()),
            });
        }
        dst[..src.len()].copy_from_slice(src);
        Ok(())
    }

    /// Load a buffer of `real`/`mixed` scalars widened to f64.
    ///
    /// # Errors
    ///
    /// As [`Self::load`].
    pub fn load_scalars(&self, index: usize, double: bool) -> Result<Vec<f64>> {
        if double {
            self.load::<f64>(index)
        } else {
            Ok(self.load::<f32>(index)?.into_iter().map(f64::from).collect())
        }
    }

    /// Store f64 values as `real`/`mixed` scalars.
    ///
    /// # Errors
    ///
    /// As [`Self::store`].
    #[allow(clippy::cast_possible_truncation)]
    pub fn store_scalars(&mut self, index: usize, data: &[f64], double: bool) -> Result<()> {
        if double {
            self.store(index, data)
        } else {
            let narrow: Vec<f32> = data.iter().map(|&v| v as f32).collect();
            self.store(index, &narrow)
        }
    }

    /// # Errors
    ///
    /// Missing or non-integer argument.
    pub fn int(&self, index: usize) -> Result<i64> {
        match self.arg(index)? {
            KernelArg::I32(v) => Ok(i64::from(v)),
            KernelArg::U32(v) => Ok(i64::from(v)),
            other => Err(self.fail(format!("argument {index} is {other:?}, expected an integer"))),
        }
    }

    /// Integer argument as a non-negative count.
    ///
    /// # Errors
    ///
    /// Missing, non-integer or negative argument.
    pub fn count(&self, index: usize) -> Result<usize> {
        let v = self.int(index)?;
        usize::try_from(v).map_err(|_| self.fail(format!("argument {index} is negative: {v}")))
    }

    /// # Errors
    ///
    /// Missing or non-float argument.
    pub fn float(&self, index: usize) -> Result<f64> {
        match self.arg(index)? {
            KernelArg::F32(v) => Ok(f64::from(v)),
            KernelArg::F64(v) => Ok(v),
            other => Err(self.fail(format!("argument {index} is {other:?}, expected a float"))),
        }
    }
}

// ── Built-in utility kernels ─────────────────────────────────────────

fn builtin_kernels() -> Vec<(&'static str, HostKernelFn)> {
    let clear: HostKernelFn = Arc::new(clear_buffers);
    let mut kernels: Vec<(&'static str, HostKernelFn)> = crate::shaders::CLEAR_KERNEL_NAMES
        .iter()
        .map(|&name| (name, Arc::clone(&clear)))
        .collect();
    kernels.push(("reduceReal4Buffer", Arc::new(reduce_real4_buffer)));
    kernels.push(("reduceForces", Arc::new(reduce_forces)));
    kernels.push(("reduceEnergy", Arc::new(reduce_energy)));
    kernels.push(("setCharges", Arc::new(set_charges)));
    kernels.push(("determineNativeAccuracy", Arc::new(native_accuracy)));
    kernels
}

/// Arguments alternate `(buffer, words)`.
fn clear_buffers(inv: &mut HostInvocation<'_>) -> Result<()> {
    for pair in 0..inv.arg_count() / 2 {
        let words = inv.count(2 * pair + 1)?;
        let kernel = inv.kernel.to_string();
        let bytes = inv.bytes_mut(2 * pair)?;
        let n = words * 4;
        if n > bytes.len() {
            return Err(ContextError::Dispatch {
                kernel,
                message: format!("clear of {words} words exceeds a {}-byte buffer", bytes.len()),
            });
        }
        bytes[..n].fill(0);
    }
    Ok(())
}

#[allow(clippy::cast_precision_loss)]
fn fixed_to_real(v: i64) -> f64 {
    v as f64 / FIXED_POINT_SCALE
}

#[allow(clippy::cast_possible_truncation)]
fn real_to_fixed(v: f64) -> i64 {
    (v * FIXED_POINT_SCALE).floor() as i64
}

/// Fold the fixed-point accumulators and the stacked real4 buffers from
/// `first_slot` on into the first buffer, then write the totals back to
/// the accumulators.
fn fold_into_first_buffer(
    inv: &mut HostInvocation<'_>,
    buffer_arg: usize,
    long_arg: usize,
    first_slot: usize,
) -> Result<()> {
    let double = inv.real_is_double();
    let size = inv.count(2)?;
    let num_buffers = inv.count(3)?;
    let buffer = inv.load_scalars(buffer_arg, double)?;
    let mut long: Vec<i64> = inv.load(long_arg)?;
    if buffer.len() < 4 * size * num_buffers || long.len() < 3 * size {
        return Err(inv.fail("buffers are smaller than bufferSize × numBuffers"));
    }
    let sums: Vec<[f64; 4]> = (0..size)
        .into_par_iter()
        .map(|i| {
            let mut sum = [0.0; 4];
            for c in 0..3 {
                sum[c] = fixed_to_real(long[i + c * size]);
            }
            for j in first_slot..num_buffers {
                let base = 4 * (i + j * size);
                for c in 0..4 {
                    sum[c] += buffer[base + c];
                }
            }
            sum
        })
        .collect();
    for (i, sum) in sums.iter().enumerate() {
        for c in 0..3 {
            long[i + c * size] = real_to_fixed(sum[c]);
        }
    }
    let flat: Vec<f64> = sums.into_iter().flatten().collect();
    inv.store_scalars(buffer_arg, &flat, double)?;
    inv.store(long_arg, &long)
}

/// `(buffer, longBuffer, bufferSize, numBuffers)`: merge buffers 1.. into
/// buffer 0 on top of the fixed-point totals. Buffer 0 is not re-added.
fn reduce_real4_buffer(inv: &mut HostInvocation<'_>) -> Result<()> {
    fold_into_first_buffer(inv, 0, 1, 1)
}

/// `(longBuffer, buffer, bufferSize, numBuffers)`: total force per atom
/// from every buffer plus the fixed-point accumulators, left in both.
fn reduce_forces(inv: &mut HostInvocation<'_>) -> Result<()> {
    fold_into_first_buffer(inv, 1, 0, 0)
}

/// `(energyBuffer, result, bufferSize, workGroupSize)`: one partial sum
/// per work group, grid-strided like the device kernel.
fn reduce_energy(inv: &mut HostInvocation<'_>) -> Result<()> {
    let double = inv.mixed_is_double();
    let size = inv.count(2)?;
    let wg = inv.block_size() as usize;
    let groups = (inv.global_size() / inv.block_size()) as usize;
    let energy = inv.load_scalars(0, double)?;
    let stride = wg * groups;
    let partials: Vec<f64> = (0..groups)
        .into_par_iter()
        .map(|g| {
            energy
                .iter()
                .take(size)
                .enumerate()
                .filter(|(i, _)| (i % stride) / wg == g)
                .map(|(_, e)| *e)
                .sum()
        })
        .collect();
    inv.store_scalars(1, &partials, double)
}

/// `(charges, posq, atomOrder, numAtoms)`.
fn set_charges(inv: &mut HostInvocation<'_>) -> Result<()> {
    let double = inv.real_is_double();
    let charges = inv.load_scalars(0, double)?;
    let mut posq = inv.load_scalars(1, double)?;
    let order: Vec<i32> = inv.load(2)?;
    let num_atoms = inv.count(3)?;
    for i in 0..num_atoms {
        let src = order
            .get(i)
            .and_then(|&k| usize::try_from(k).ok())
            .and_then(|k| charges.get(k))
            .ok_or_else(|| inv.fail(format!("atom {i} has no charge")))?;
        posq[4 * i + 3] = *src;
    }
    inv.store_scalars(1, &posq, double)
}

/// `(values, numValues)` with 8 floats per value: input in slot 0, the
/// fast sqrt, rsqrt, recip, exp and log in slots 1 to 5.
fn native_accuracy(inv: &mut HostInvocation<'_>) -> Result<()> {
    let n = inv.count(1)?;
    let mut values: Vec<f32> = inv.load(0)?;
    if values.len() < 8 * n {
        return Err(inv.fail("values buffer too small"));
    }
    for v in values.chunks_exact_mut(8).take(n) {
        let x = v[0];
        v[1] = x.sqrt();
        v[2] = 1.0 / x.sqrt();
        v[3] = 1.0 / x;
        v[4] = x.exp();
        v[5] = x.ln();
    }
    inv.store(0, &values)
}

// ── Provider ─────────────────────────────────────────────────────────

/// Serves a fixed platform list and opens [`HostBackend`]s.
pub struct HostProvider {
    platforms: Vec<PlatformQuery>,
    kernels: Vec<(String, HostKernelFn)>,
    opened: Mutex<Vec<Weak<HostBackend>>>,
}

impl HostProvider {
    #[must_use]
    pub fn new(platforms: Vec<PlatformQuery>) -> Self {
        Self {
            platforms,
            kernels: Vec::new(),
            opened: Mutex::new(Vec::new()),
        }
    }

    /// One host platform with `devices` identical fp64-capable GPUs.
    #[must_use]
    pub fn reference(devices: usize) -> Self {
        let mut platform = PlatformQuery::new("Host", "Host Reference");
        platform.version = env!("CARGO_PKG_VERSION").to_string();
        for i in 0..devices {
            let mut d = DeviceQuery::named(format!("Host Device {i}"), "Host Reference", DeviceKind::Gpu);
            d.compute_units = 4;
            d.supports_fp64 = true;
            d.supports_int64_atomics = true;
            platform.devices.push(d);
        }
        Self::new(vec![platform])
    }

    /// Register a kernel on every backend this provider opens.
    #[must_use]
    pub fn with_kernel(mut self, name: &str, f: HostKernelFn) -> Self {
        self.kernels.push((name.to_string(), f));
        self
    }

    /// Backends opened by this provider that are still alive.
    #[must_use]
    pub fn live_backends(&self) -> usize {
        self.opened
            .lock()
            .map(|v| v.iter().filter(|w| w.strong_count() > 0).count())
            .unwrap_or(0)
    }

    /// The most recently opened backend that is still alive.
    #[must_use]
    pub fn last_opened(&self) -> Option<Arc<HostBackend>> {
        self.opened
            .lock()
            .ok()
            .and_then(|v| v.iter().rev().find_map(Weak::upgrade))
    }
}

impl DeviceProvider for HostProvider {
    fn platforms(&self) -> Result<Vec<PlatformQuery>> {
        Ok(self.platforms.clone())
    }

    fn open(&self, selected: &SelectedDevice) -> Result<Arc<dyn ComputeBackend>> {
        let backend = Arc::new(HostBackend::new(DeviceInfo::from_selected(selected)));
        for (name, f) in &self.kernels {
            backend.register_kernel(name, Arc::clone(f))?;
        }
        self.opened
            .lock()
            .map_err(|_| ContextError::Initialization("host provider state poisoned".into()))?
            .push(Arc::downgrade(&backend));
        Ok(backend)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn backend() -> HostBackend {
        HostBackend::new(DeviceInfo {
            name: "test".into(),
            vendor: "test".into(),
            max_buffer_bytes: 1 << 20,
            max_work_group_size: 256,
            supports_fp64: true,
            supports_timestamps: false,
        })
    }

    fn whole(id: AllocationId, size: u64) -> KernelArg {
        KernelArg::Buffer(BufferBinding {
            allocation: id,
            offset: 0,
            size,
        })
    }

    #[test]
    fn write_read_roundtrip_at_offset() {
        let b = backend();
        let id = b.allocate(16, "a").unwrap();
        b.write(id, 4, &[1, 2, 3, 4], true).unwrap();
        let mut out = [0u8; 8];
        b.read(id, 0, &mut out).unwrap();
        assert_eq!(out, [0, 0, 0, 0, 1, 2, 3, 4]);
    }

    #[test]
    fn out_of_range_write_rejected() {
        let b = backend();
        let id = b.allocate(4, "a").unwrap();
        assert!(b.write(id, 2, &[0; 4], true).is_err());
    }

    #[test]
    fn released_allocation_is_invalid_state() {
        let b = backend();
        let id = b.allocate(8, "a").unwrap();
        b.release(id);
        let mut out = [0u8; 4];
        assert!(matches!(b.read(id, 0, &mut out), Err(ContextError::InvalidState(_))));
        assert_eq!(b.live_allocations(), 0);
    }

    #[test]
    fn oversized_allocation_fails() {
        let b = backend();
        let err = b.allocate(1 << 21, "huge").unwrap_err();
        assert!(matches!(err, ContextError::Allocation { bytes, .. } if bytes == 1 << 21));
    }

    #[test]
    fn unknown_entry_point_is_invalid_state() {
        let b = backend();
        let p = b
            .build_program("@compute @workgroup_size(64) fn clearBuffer() {}", "")
            .unwrap();
        assert!(b.kernel(p, "clearBuffer").is_ok());
        assert!(matches!(b.kernel(p, "missing"), Err(ContextError::InvalidState(_))));
    }

    #[test]
    fn clear_zeroes_requested_words_only() {
        let b = backend();
        let id = b.allocate(16, "a").unwrap();
        b.write(id, 0, &[0xff; 16], true).unwrap();
        let p = b
            .build_program("@compute @workgroup_size(128) fn clearBuffer() {}", "")
            .unwrap();
        let k = b.kernel(p, "clearBuffer").unwrap();
        b.dispatch(k, &[whole(id, 16), KernelArg::I32(2)], 128, 128, false)
            .unwrap();
        let mut out = [0u8; 16];
        b.read(id, 0, &mut out).unwrap();
        assert_eq!(&out[..8], &[0; 8]);
        assert_eq!(&out[8..], &[0xff; 8]);
    }

    fn fixed_args(long: AllocationId, forces: AllocationId, padded: usize) -> Vec<KernelArg> {
        vec![
            whole(long, (3 * padded * 8) as u64),
            whole(forces, (2 * padded * 16) as u64),
            KernelArg::I32(2),
            KernelArg::I32(2),
        ]
    }

    #[test]
    fn reduce_forces_leaves_total_in_first_buffer_and_accumulators() {
        let b = backend();
        let padded = 2usize;
        let long = b.allocate((3 * padded * 8) as u64, "long").unwrap();
        let forces = b.allocate((2 * padded * 16) as u64, "forces").unwrap();
        let mut fixed = vec![0i64; 3 * padded];
        fixed[0] = real_to_fixed(4.0);
        b.write(long, 0, bytemuck::cast_slice(&fixed), true).unwrap();
        let data: Vec<f32> = vec![
            1.0, 2.0, 3.0, 0.0, 0.5, 0.0, -1.0, 0.0, // buffer 0
            0.25, 0.0, 0.0, 0.0, 0.5, 1.0, 0.0, 0.0, // buffer 1
        ];
        b.write(forces, 0, bytemuck::cast_slice(&data), true).unwrap();
        let p = b
            .build_program("@compute @workgroup_size(128) fn reduceForces() {}", "")
            .unwrap();
        let k = b.kernel(p, "reduceForces").unwrap();
        b.dispatch(k, &fixed_args(long, forces, padded), 128, 128, false)
            .unwrap();

        let mut out = vec![0u8; 48];
        b.read(long, 0, &mut out).unwrap();
        let fixed: Vec<i64> = bytemuck::pod_collect_to_vec(&out);
        assert!((fixed_to_real(fixed[0]) - 5.25).abs() < 1e-9);
        assert!((fixed_to_real(fixed[padded + 1]) - 1.0).abs() < 1e-9);
        assert!((fixed_to_real(fixed[2 * padded + 1]) + 1.0).abs() < 1e-9);

        let mut out = vec![0u8; 32];
        b.read(forces, 0, &mut out).unwrap();
        let first: Vec<f32> = bytemuck::pod_collect_to_vec(&out);
        assert_eq!(first, [5.25, 2.0, 3.0, 0.0, 1.0, 1.0, -1.0, 0.0]);
    }

    #[test]
    fn merge_skips_first_buffer() {
        let b = backend();
        let padded = 2usize;
        let long = b.allocate((3 * padded * 8) as u64, "long").unwrap();
        let forces = b.allocate((2 * padded * 16) as u64, "forces").unwrap();
        let mut fixed = vec![0i64; 3 * padded];
        fixed[0] = real_to_fixed(1.0);
        b.write(long, 0, bytemuck::cast_slice(&fixed), true).unwrap();
        let data: Vec<f32> = vec![
            1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, // own total, already in long
            2.0, 0.0, 0.0, 0.0, 0.0, 0.5, 0.0, 0.0, // second device
        ];
        b.write(forces, 0, bytemuck::cast_slice(&data), true).unwrap();
        let p = b
            .build_program("@compute @workgroup_size(128) fn reduceReal4Buffer() {}", "")
            .unwrap();
        let k = b.kernel(p, "reduceReal4Buffer").unwrap();
        let mut args = fixed_args(long, forces, padded);
        args.swap(0, 1);
        b.dispatch(k, &args, 128, 128, false).unwrap();

        let mut out = vec![0u8; 48];
        b.read(long, 0, &mut out).unwrap();
        let fixed: Vec<i64> = bytemuck::pod_collect_to_vec(&out);
        assert!((fixed_to_real(fixed[0]) - 3.0).abs() < 1e-9);
        assert!((fixed_to_real(fixed[padded + 1]) - 0.5).abs() < 1e-9);

        let mut out = vec![0u8; 32];
        b.read(forces, 0, &mut out).unwrap();
        let first: Vec<f32> = bytemuck::pod_collect_to_vec(&out);
        assert_eq!(first[0], 3.0);
        assert_eq!(first[5], 0.5);
    }

    #[test]
    fn fixed_point_negative_values_floor() {
        assert_eq!(real_to_fixed(-1.0), -(1i64 << 32));
        assert!((fixed_to_real(real_to_fixed(-0.375)) + 0.375).abs() < 1e-9);
    }

    #[test]
    fn global_size_must_be_multiple_of_block() {
        let b = backend();
        let p = b
            .build_program("@compute @workgroup_size(64) fn clearBuffer() {}", "")
            .unwrap();
        let k = b.kernel(p, "clearBuffer").unwrap();
        let err = b.dispatch(k, &[], 100, 64, false).unwrap_err();
        assert!(matches!(err, ContextError::Dispatch { kernel, .. } if kernel == "clearBuffer"));
    }

    #[test]
    fn provider_tracks_live_backends() {
        let provider = HostProvider::reference(2);
        let platforms = provider.platforms().unwrap();
        let sel = mdcontext_forge::select_device(&platforms, &mdcontext_forge::SelectionRequest::default())
            .unwrap();
        let a = provider.open(&sel).unwrap();
        assert_eq!(provider.live_backends(), 1);
        drop(a);
        assert_eq!(provider.live_backends(), 0);
    }
}

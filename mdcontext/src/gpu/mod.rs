// SPDX-License-Identifier: AGPL-3.0-only

//! wgpu compute backend.
//!
//! Opens the adapter forge selected, requesting `SHADER_F64` and
//! `TIMESTAMP_QUERY` when the adapter has them, and implements
//! [`ComputeBackend`] on top of storage buffers, WGSL shader modules and
//! auto-layout compute pipelines.
//!
//! ## Module structure
//!
//! - `adapter`: adapter lookup and device creation
//! - `buffers`: allocation, aligned upload, staging readback
//! - `dispatch`: shader compilation under an error scope, bind groups,
//!   workgroup split, timestamp queries

mod adapter;
mod buffers;
mod dispatch;

pub use dispatch::split_workgroups;

use crate::backend::{
    AllocationId, BufferBinding, ComputeBackend, DeviceInfo, DeviceProvider, DispatchTiming,
    KernelArg, KernelId, ProgramId,
};
use crate::error::{ContextError, Result};
use mdcontext_forge::probe::{create_instance, probe_platforms};
use mdcontext_forge::{PlatformQuery, SelectedDevice};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

#[derive(Default)]
struct GpuState {
    next_id: u64,
    buffers: HashMap<AllocationId, wgpu::Buffer>,
    programs: HashMap<ProgramId, wgpu::ShaderModule>,
    pipelines: HashMap<KernelId, (wgpu::ComputePipeline, String)>,
}

impl GpuState {
    fn next(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn buffer(&self, id: AllocationId) -> Result<&wgpu::Buffer> {
        self.buffers
            .get(&id)
            .ok_or_else(|| ContextError::InvalidState(format!("allocation {id} has been released")))
    }
}

/// A wgpu device and queue driven through [`ComputeBackend`].
pub struct WgpuBackend {
    info: DeviceInfo,
    device: wgpu::Device,
    queue: wgpu::Queue,
    epoch: Instant,
    state: Mutex<GpuState>,
}

// ── Core accessors ───────────────────────────────────────────────────

impl WgpuBackend {
    /// Open the adapter a forge selection points at.
    ///
    /// # Errors
    ///
    /// [`ContextError::Initialization`] if the adapter is gone or device
    /// creation fails.
    pub fn open(selected: &SelectedDevice) -> Result<Self> {
        let (device, queue, info) = pollster::block_on(adapter::open_device(selected))?;
        device.on_uncaptured_error(Box::new(|e| {
            log::error!("uncaptured wgpu error: {e}");
        }));
        Ok(Self {
            info,
            device,
            queue,
            epoch: Instant::now(),
            state: Mutex::new(GpuState::default()),
        })
    }

    #[must_use]
    pub const fn device(&self) -> &wgpu::Device {
        &self.device
    }

    #[must_use]
    pub const fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    fn state(&self) -> Result<MutexGuard<'_, GpuState>> {
        self.state
            .lock()
            .map_err(|_| ContextError::Backend("wgpu backend state poisoned".into()))
    }

    fn now_ns(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    /// Run `f` inside a validation error scope.
    fn scoped<T>(&self, f: impl FnOnce() -> T) -> (T, Option<wgpu::Error>) {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f();
        let err = pollster::block_on(self.device.pop_error_scope());
        (value, err)
    }
}

impl ComputeBackend for WgpuBackend {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn allocate(&self, bytes: u64, label: &str) -> Result<AllocationId> {
        let buffer = self.create_storage_buffer(bytes, label)?;
        let mut state = self.state()?;
        let id = AllocationId(state.next());
        state.buffers.insert(id, buffer);
        Ok(id)
    }

    fn release(&self, id: AllocationId) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(buffer) = state.buffers.remove(&id) {
                buffer.destroy();
            }
        }
    }

    fn write(&self, id: AllocationId, offset: u64, data: &[u8], blocking: bool) -> Result<()> {
        let state = self.state()?;
        let buffer = state.buffer(id)?;
        self.write_bytes(buffer, offset, data)?;
        if blocking {
            self.queue.submit(std::iter::empty());
            self.device.poll(wgpu::Maintain::Wait);
        }
        Ok(())
    }

    fn read(&self, id: AllocationId, offset: u64, out: &mut [u8]) -> Result<()> {
        let state = self.state()?;
        let buffer = state.buffer(id)?;
        self.read_bytes(buffer, offset, out)
    }

    fn copy(&self, src: BufferBinding, dst: BufferBinding) -> Result<()> {
        let state = self.state()?;
        let from = state.buffer(src.allocation)?;
        let to = state.buffer(dst.allocation)?;
        self.copy_range(from, src.offset, to, dst.offset, src.size)
    }

    fn build_program(&self, source: &str, _options: &str) -> Result<ProgramId> {
        let module = self.compile(source)?;
        let mut state = self.state()?;
        let id = ProgramId(state.next());
        state.programs.insert(id, module);
        Ok(id)
    }

    fn kernel(&self, program: ProgramId, name: &str) -> Result<KernelId> {
        let mut state = self.state()?;
        let pipeline = {
            let module = state
                .programs
                .get(&program)
                .ok_or_else(|| ContextError::InvalidState(format!("unknown program {program:?}")))?;
            self.create_pipeline(module, name)?
        };
        let id = KernelId(state.next());
        state.pipelines.insert(id, (pipeline, name.to_string()));
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
        let state = self.state()?;
        let (pipeline, name) = state
            .pipelines
            .get(&kernel)
            .ok_or_else(|| ContextError::InvalidState(format!("unknown kernel {kernel:?}")))?;
        self.encode_dispatch(&state, pipeline, name, args, global_size, block_size, timed)
    }

    fn finish(&self) -> Result<()> {
        self.queue.submit(std::iter::empty());
        self.device.poll(wgpu::Maintain::Wait);
        Ok(())
    }
}

/// Opens [`WgpuBackend`]s on adapters found by the forge probe.
#[derive(Debug, Default, Clone, Copy)]
pub struct WgpuProvider;

impl DeviceProvider for WgpuProvider {
    fn platforms(&self) -> Result<Vec<PlatformQuery>> {
        Ok(probe_platforms(&create_instance()))
    }

    fn open(&self, selected: &SelectedDevice) -> Result<Arc<dyn ComputeBackend>> {
        Ok(Arc::new(WgpuBackend::open(selected)?))
    }
}

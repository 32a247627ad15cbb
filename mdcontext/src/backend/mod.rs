// SPDX-License-Identifier: AGPL-3.0-only

//! The narrow device interface every compute API is driven through.
//!
//! A backend owns device memory, compiles programs and runs kernels. The
//! context layer above it never sees API objects, only the plain ids
//! defined here, so a released allocation can be detected by id instead of
//! dangling.
//!
//! ```text
//!   ComputeContext ──► Arc<dyn ComputeBackend>
//!                          ├── gpu::WgpuBackend   (wgpu device + queue)
//!                          └── HostBackend        (in-process reference)
//! ```

pub mod host;

pub use host::{HostBackend, HostInvocation, HostKernelFn, HostProvider};

use crate::error::Result;
use mdcontext_forge::{PlatformQuery, SelectedDevice};
use std::sync::Arc;

/// Identifies one device allocation for the lifetime of its backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AllocationId(pub(crate) u64);

/// Identifies a built program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramId(pub(crate) u64);

/// Identifies a kernel entry point resolved from a program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelId(pub(crate) u64);

impl std::fmt::Display for AllocationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A byte range of an allocation, as passed to a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferBinding {
    pub allocation: AllocationId,
    /// Byte offset into the allocation.
    pub offset: u64,
    /// Byte length of the range.
    pub size: u64,
}

/// One kernel argument. Buffers bind in order; scalars are packed in
/// order into a single parameter block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KernelArg {
    Buffer(BufferBinding),
    U32(u32),
    I32(i32),
    F32(f32),
    F64(f64),
}

impl KernelArg {
    /// Byte size (and natural alignment) of a scalar argument.
    #[must_use]
    pub const fn scalar_size(&self) -> Option<usize> {
        match self {
            Self::Buffer(_) => None,
            Self::U32(_) | Self::I32(_) | Self::F32(_) => Some(4),
            Self::F64(_) => Some(8),
        }
    }
}

/// Pack scalar arguments in order, each naturally aligned, into a block
/// padded to 16 bytes (the uniform-buffer granule).
#[must_use]
pub fn pack_scalars(args: &[KernelArg]) -> Vec<u8> {
    let mut out: Vec<u8> = Vec::new();
    for arg in args {
        let Some(size) = arg.scalar_size() else {
            continue;
        };
        out.resize(out.len().next_multiple_of(size), 0);
        match *arg {
            KernelArg::U32(v) => out.extend_from_slice(&v.to_le_bytes()),
            KernelArg::I32(v) => out.extend_from_slice(&v.to_le_bytes()),
            KernelArg::F32(v) => out.extend_from_slice(&v.to_le_bytes()),
            KernelArg::F64(v) => out.extend_from_slice(&v.to_le_bytes()),
            KernelArg::Buffer(_) => {}
        }
    }
    out.resize(out.len().next_multiple_of(16), 0);
    out
}

/// Device-side start/end of one dispatch, in nanoseconds on the backend's
/// clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchTiming {
    pub start_ns: u64,
    pub end_ns: u64,
}

/// What a backend reports about the device it was opened on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub vendor: String,
    pub max_buffer_bytes: u64,
    pub max_work_group_size: u32,
    pub supports_fp64: bool,
    /// Device timestamps are available for profiling.
    pub supports_timestamps: bool,
}

impl DeviceInfo {
    /// Info derived from a forge selection.
    #[must_use]
    pub fn from_selected(selected: &SelectedDevice) -> Self {
        Self {
            name: selected.device.name.clone(),
            vendor: selected.device.vendor.clone(),
            max_buffer_bytes: selected.device.max_buffer_bytes,
            max_work_group_size: selected.device.max_work_group_size,
            supports_fp64: selected.device.supports_fp64,
            supports_timestamps: false,
        }
    }
}

/// Memory, compilation and dispatch on one device.
///
/// Implementations are shared behind `Arc` by the arrays and programs of a
/// context, so all methods take `&self`.
pub trait ComputeBackend: Send + Sync {
    fn info(&self) -> &DeviceInfo;

    /// Allocate `bytes` of device memory.
    ///
    /// # Errors
    ///
    /// [`crate::ContextError::Allocation`] when the device cannot hold it.
    fn allocate(&self, bytes: u64, label: &str) -> Result<AllocationId>;

    /// Free an allocation. Later use of `id` is an invalid-state error.
    fn release(&self, id: AllocationId);

    /// Copy host bytes into an allocation at `offset`. A blocking write
    /// returns only once the device holds the data.
    ///
    /// # Errors
    ///
    /// Released allocation, out-of-range write, or a device failure.
    fn write(&self, id: AllocationId, offset: u64, data: &[u8], blocking: bool) -> Result<()>;

    /// Copy `out.len()` bytes starting at `offset` back to the host.
    /// Always blocking.
    ///
    /// # Errors
    ///
    /// Released allocation, out-of-range read, or a device failure.
    fn read(&self, id: AllocationId, offset: u64, out: &mut [u8]) -> Result<()>;

    /// Device-to-device copy of `src.size` bytes.
    ///
    /// # Errors
    ///
    /// Released allocation or out-of-range range.
    fn copy(&self, src: BufferBinding, dst: BufferBinding) -> Result<()>;

    /// Build a fully composed, preprocessed program.
    ///
    /// # Errors
    ///
    /// [`crate::ContextError::Compile`] carrying the diagnostic log.
    fn build_program(&self, source: &str, options: &str) -> Result<ProgramId>;

    /// Resolve an entry point of a built program.
    ///
    /// # Errors
    ///
    /// [`crate::ContextError::InvalidState`] for an unknown entry point.
    fn kernel(&self, program: ProgramId, name: &str) -> Result<KernelId>;

    /// Enqueue `global_size / block_size` work groups of `kernel`.
    /// Returns device timing when `timed` is set.
    ///
    /// # Errors
    ///
    /// [`crate::ContextError::Dispatch`] naming the kernel.
    fn dispatch(
        &self,
        kernel: KernelId,
        args: &[KernelArg],
        global_size: u32,
        block_size: u32,
        timed: bool,
    ) -> Result<Option<DispatchTiming>>;

    /// Block until all queued work is complete.
    ///
    /// # Errors
    ///
    /// Device loss or a failed submission.
    fn finish(&self) -> Result<()>;
}

/// Enumerates platforms and opens backends on selected devices.
pub trait DeviceProvider: Send + Sync {
    /// Every platform visible to this provider, in stable order.
    ///
    /// # Errors
    ///
    /// Enumeration failure inside the device API.
    fn platforms(&self) -> Result<Vec<PlatformQuery>>;

    /// Open a backend on the selected device.
    ///
    /// # Errors
    ///
    /// [`crate::ContextError::Initialization`] when the device cannot be opened.
    fn open(&self, selected: &SelectedDevice) -> Result<Arc<dyn ComputeBackend>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalars_pack_naturally_aligned() {
        let args = [
            KernelArg::I32(7),
            KernelArg::F64(1.5),
            KernelArg::U32(3),
        ];
        let block = pack_scalars(&args);
        assert_eq!(block.len(), 32);
        assert_eq!(&block[0..4], &7i32.to_le_bytes());
        assert_eq!(&block[8..16], &1.5f64.to_le_bytes());
        assert_eq!(&block[16..20], &3u32.to_le_bytes());
    }

    #[test]
    fn buffers_do_not_occupy_scalar_space() {
        let binding = BufferBinding {
            allocation: AllocationId(1),
            offset: 0,
            size: 16,
        };
        let block = pack_scalars(&[KernelArg::Buffer(binding), KernelArg::F32(2.0)]);
        assert_eq!(block.len(), 16);
        assert_eq!(&block[0..4], &2.0f32.to_le_bytes());
    }

    #[test]
    fn no_scalars_packs_empty() {
        assert!(pack_scalars(&[]).is_empty());
    }
}

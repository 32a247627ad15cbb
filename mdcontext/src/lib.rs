// SPDX-License-Identifier: AGPL-3.0-only

//! mdcontext: device-context layer for GPU molecular dynamics
//!
//! Owns everything between "a system with N particles" and "a force kernel
//! ready to run": device selection, typed device arrays, program
//! composition and compilation, per-context utility kernels (buffer
//! clears, force and energy reductions, charge scatter) and the
//! orchestration that splits one force evaluation across several devices.
//!
//! ## Modules
//!   - `backend`: the [`ComputeBackend`] seam plus a host reference backend
//!   - `gpu`: the wgpu backend
//!   - `array`: [`DeviceArray`], a typed view of device memory
//!   - `program`: source composition, preprocessing, compiled programs
//!   - `context`: [`ComputeContext`], one simulation bound to one device
//!   - `work`: one worker thread per context
//!   - `platform`: [`PlatformData`], the contexts of one simulation
//!   - `parallel`: begin/finish across contexts and load balancing
//!
//! ## Binaries
//!   - `context_report`: list devices, open contexts and print what was
//!     selected and probed
//!
//! ## Configuration
//!   Per-simulation properties go through [`PlatformProperties`];
//!   process-wide tunables through [`ContextConfig`], which reads
//!   `MDCONTEXT_PROFILE_KERNELS` and `MDCONTEXT_REDUCE_ENERGY_THREADGROUPS`.

#![deny(clippy::expect_used, clippy::unwrap_used)]

pub mod array;
pub mod backend;
pub mod config;
pub mod context;
pub mod error;
pub mod force_info;
pub mod gpu;
pub mod parallel;
pub mod platform;
pub mod precision;
pub mod program;
pub mod shaders;
pub mod tolerances;
pub mod work;

pub use array::DeviceArray;
pub use backend::{ComputeBackend, DeviceProvider, HostProvider};
pub use config::ContextConfig;
pub use context::{ComputeContext, ContextOptions, SystemLayout};
pub use error::{ContextError, Result};
pub use force_info::{ForceInfo, NamedForce};
pub use gpu::WgpuProvider;
pub use parallel::{
    CompletionClock, ContextKernel, ForceEvaluator, ParallelCalcForcesAndEnergy, ParallelKernel,
    PartitionBalancer, SystemClock,
};
pub use platform::{PlatformData, PlatformProperties};
pub use precision::PrecisionMode;
pub use work::WorkThread;

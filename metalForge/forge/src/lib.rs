// SPDX-License-Identifier: AGPL-3.0-only

#![deny(clippy::expect_used, clippy::unwrap_used)]

//! mdcontext Forge: local hardware discovery and device selection.
//!
//! Forge discovers which compute platforms and devices exist on THIS
//! machine and picks the one a simulation context should run on. It owns
//! no device memory and compiles no kernels; `mdcontext` opens the device
//! Forge selects.
//!
//! # Architecture
//!
//! ```text
//!    ┌─────────────────────────────┐
//!    │  probe (wgpu + nvidia-smi)  │  adapters grouped per backend/vendor
//!    └──────────┬──────────────────┘
//!               │ Vec<PlatformQuery>
//!    ┌──────────▼──────────────────┐
//!    │       vendor                │  throughput score, kernel tuning
//!    └──────────┬──────────────────┘
//!               │ score per DeviceQuery
//!    ┌──────────▼──────────────────┐
//!    │       selection             │  filters, overrides, best candidate
//!    └─────────────────────────────┘
//! ```

pub mod error;
pub mod probe;
pub mod selection;
pub mod substrate;
pub mod vendor;

pub use error::SelectionError;
pub use selection::{select_device, SelectedDevice, SelectionRequest};
pub use substrate::{AmdAttributes, DeviceKind, DeviceQuery, PlatformQuery};
pub use vendor::VendorTuning;

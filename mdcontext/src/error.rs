// SPDX-License-Identifier: AGPL-3.0-only

//! Typed errors for device-context operations.
//!
//! Callers pattern-match on the failure mode (bad configuration, no device,
//! kernel build failure, ...) rather than parsing strings. Every variant
//! carries the descriptive message a user needs.

use mdcontext_forge::SelectionError;

/// Exit code for an invalid kernel-profiling flag.
pub const EXIT_CODE_PROFILE_FLAG: i32 = 7;

/// Exit code for an invalid energy-reduction thread-group count.
pub const EXIT_CODE_REDUCE_THREADGROUPS: i32 = 9;

/// Which configuration value was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKey {
    Precision,
    ProfileKernels,
    ReduceEnergyThreadgroups,
    Property,
}

/// Errors arising from device selection, context setup, kernels and buffers.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    /// An illegal configuration or property value.
    #[error("{message}")]
    Configuration { key: ConfigKey, message: String },

    /// No platform exposes a usable device.
    #[error("No compatible platform is available")]
    NoCompatiblePlatform,

    /// Devices exist but none passed filtering.
    #[error("No compatible device is available")]
    NoCompatibleDevice,

    /// Device or context construction failed.
    #[error("Error initializing context: {0}")]
    Initialization(String),

    /// A program failed to build; carries the backend diagnostic log.
    #[error("Error compiling kernel: {log}")]
    Compile { log: String },

    /// A kernel could not be enqueued.
    #[error("Error invoking kernel {kernel}: {message}")]
    Dispatch { kernel: String, message: String },

    /// Copy between arrays of different shape.
    #[error("Error copying array {source_name} to {dest_name}: The destination array does not match the size of the array")]
    SizeMismatch {
        source_name: String,
        dest_name: String,
    },

    /// An out-of-range index argument.
    #[error("{0}")]
    IllegalArgument(String),

    /// Use of an uninitialized array, an unknown kernel, or a released allocation.
    #[error("{0}")]
    InvalidState(String),

    /// The device cannot satisfy an allocation request.
    #[error("Error creating array {name}: cannot allocate {bytes} bytes")]
    Allocation { name: String, bytes: u64 },

    /// A transfer or map operation failed inside the device API.
    #[error("Device operation failed: {0}")]
    Backend(String),

    /// A context's worker thread is gone.
    #[error("Worker thread for context {0} stopped unexpectedly")]
    Worker(usize),
}

impl ContextError {
    pub(crate) fn config(key: ConfigKey, message: impl Into<String>) -> Self {
        Self::Configuration {
            key,
            message: message.into(),
        }
    }

    /// Process exit code for configuration values that used to terminate
    /// the process during environment parsing. `None` for all other errors.
    #[must_use]
    pub const fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Configuration {
                key: ConfigKey::ProfileKernels,
                ..
            } => Some(EXIT_CODE_PROFILE_FLAG),
            Self::Configuration {
                key: ConfigKey::ReduceEnergyThreadgroups,
                ..
            } => Some(EXIT_CODE_REDUCE_THREADGROUPS),
            _ => None,
        }
    }
}

impl From<SelectionError> for ContextError {
    fn from(e: SelectionError) -> Self {
        match e {
            SelectionError::NoCompatiblePlatform => Self::NoCompatiblePlatform,
            SelectionError::NoCompatibleDevice => Self::NoCompatibleDevice,
            SelectionError::IllegalArgument(msg) => Self::IllegalArgument(msg),
        }
    }
}

/// Result alias for context operations.
pub type Result<T> = std::result::Result<T, ContextError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_compile_includes_log() {
        let err = ContextError::Compile {
            log: "error: unknown identifier 'realx'".into(),
        };
        assert_eq!(
            err.to_string(),
            "Error compiling kernel: error: unknown identifier 'realx'"
        );
    }

    #[test]
    fn display_dispatch_names_kernel() {
        let err = ContextError::Dispatch {
            kernel: "reduceForces".into(),
            message: "device lost".into(),
        };
        assert!(err.to_string().contains("reduceForces"));
        assert!(err.to_string().contains("device lost"));
    }

    #[test]
    fn exit_codes_only_for_env_config() {
        let e = ContextError::config(ConfigKey::ProfileKernels, "bad");
        assert_eq!(e.exit_code(), Some(7));
        let e = ContextError::config(ConfigKey::ReduceEnergyThreadgroups, "bad");
        assert_eq!(e.exit_code(), Some(9));
        let e = ContextError::config(ConfigKey::Precision, "Illegal value for Precision: x");
        assert_eq!(e.exit_code(), None);
        assert_eq!(ContextError::NoCompatibleDevice.exit_code(), None);
    }

    #[test]
    fn selection_errors_convert() {
        let e: ContextError = SelectionError::NoCompatiblePlatform.into();
        assert!(matches!(e, ContextError::NoCompatiblePlatform));
        let e: ContextError = SelectionError::IllegalArgument("Illegal value for DeviceIndex: 3".into()).into();
        assert_eq!(e.to_string(), "Illegal value for DeviceIndex: 3");
    }

    #[test]
    fn error_trait_works() {
        let err = ContextError::Worker(1);
        let dyn_err: &dyn std::error::Error = &err;
        assert!(dyn_err.to_string().contains("context 1"));
    }
}

// SPDX-License-Identifier: AGPL-3.0-only

//! Typed errors for device selection.

/// Why no device could be selected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectionError {
    /// No platform exposes any device to consider.
    #[error("No compatible platform is available")]
    NoCompatiblePlatform,

    /// Devices exist but none passed the filters.
    #[error("No compatible device is available")]
    NoCompatibleDevice,

    /// A platform or device index was out of range or underspecified.
    #[error("{0}")]
    IllegalArgument(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(
            SelectionError::NoCompatibleDevice.to_string(),
            "No compatible device is available"
        );
        let err = SelectionError::IllegalArgument("Illegal value for DeviceIndex: 9".into());
        assert!(err.to_string().contains("DeviceIndex: 9"));
    }
}

// SPDX-License-Identifier: AGPL-3.0-only

//! What a context needs to know about a registered force component.

/// A force component registered with a [`crate::context::ComputeContext`].
///
/// Components that accumulate into more than one force buffer say so
/// through [`ForceInfo::required_force_buffers`]; everything else keeps
/// the default.
pub trait ForceInfo: Send {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Force buffers this component writes, if it has a requirement.
    fn required_force_buffers(&self) -> Option<usize> {
        None
    }
}

/// A force known only by name and buffer requirement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedForce {
    pub name: String,
    pub force_buffers: Option<usize>,
}

impl NamedForce {
    #[must_use]
    pub fn new(name: impl Into<String>, force_buffers: Option<usize>) -> Self {
        Self {
            name: name.into(),
            force_buffers,
        }
    }
}

impl ForceInfo for NamedForce {
    fn name(&self) -> &str {
        &self.name
    }

    fn required_force_buffers(&self) -> Option<usize> {
        self.force_buffers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Bonds;

    impl ForceInfo for Bonds {
        fn name(&self) -> &str {
            "bonds"
        }
    }

    #[test]
    fn default_has_no_requirement() {
        assert_eq!(Bonds.required_force_buffers(), None);
    }

    #[test]
    fn named_force_reports_its_requirement() {
        let f: Box<dyn ForceInfo> = Box::new(NamedForce::new("nonbonded", Some(2)));
        assert_eq!(f.name(), "nonbonded");
        assert_eq!(f.required_force_buffers(), Some(2));
    }
}

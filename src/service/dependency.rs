//! # Dependency edges between services.
//!
//! ```text
//! REQUIRED  dependency must be UP before start; its failure blocks start
//! OPTIONAL  demanded while wanted, never blocks start
//! PARENT    REQUIRED + removing the dependency removes the dependent
//! ANTI      dependency must NOT be UP for the dependent to start
//! REPLACE   name expected to be re-provided; a missing provider is not reported
//! ```

use bitflags::bitflags;

use crate::error::ContainerError;

use super::name::ServiceName;

bitflags! {
    /// Flags qualifying a dependency edge.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct DependencyFlags: u8 {
        const REQUIRED = 1;
        const OPTIONAL = 1 << 1;
        const PARENT = 1 << 2;
        const ANTI = 1 << 3;
        const REPLACE = 1 << 4;
    }
}

impl DependencyFlags {
    /// Rejects contradictory combinations and fills in implied flags.
    ///
    /// No flag means REQUIRED; PARENT and a lone REPLACE imply REQUIRED.
    pub fn normalize(self) -> Result<Self, ContainerError> {
        let conflict = |what: &str| {
            Err(ContainerError::illegal(format!(
                "conflicting dependency flags {self:?}: {what}"
            )))
        };
        if self.contains(Self::REQUIRED | Self::OPTIONAL) {
            return conflict("required and optional");
        }
        if self.contains(Self::ANTI) && self.intersects(Self::REQUIRED | Self::OPTIONAL | Self::PARENT) {
            return conflict("anti with a positive flag");
        }
        if self.contains(Self::PARENT | Self::OPTIONAL) {
            return conflict("parent and optional");
        }

        let mut flags = self;
        if !flags.intersects(Self::REQUIRED | Self::OPTIONAL | Self::ANTI) {
            flags |= Self::REQUIRED;
        }
        Ok(flags)
    }

    /// Blocks start while the dependency is not UP (REQUIRED or PARENT).
    pub fn is_blocking(self) -> bool {
        self.intersects(Self::REQUIRED | Self::PARENT)
    }

    /// Receives demand while the dependent wants to start.
    pub fn is_demanded(self) -> bool {
        self.intersects(Self::REQUIRED | Self::OPTIONAL | Self::PARENT)
    }

    pub fn is_anti(self) -> bool {
        self.contains(Self::ANTI)
    }

    pub fn is_parent(self) -> bool {
        self.contains(Self::PARENT)
    }

    /// True if a missing provider should be reported at validation.
    pub fn reports_missing(self) -> bool {
        self.is_blocking() && !self.contains(Self::REPLACE)
    }
}

/// A named dependency with normalized flags.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Dependency {
    name: ServiceName,
    flags: DependencyFlags,
}

impl Dependency {
    /// Creates a dependency, normalizing the flags.
    pub fn new(name: ServiceName, flags: DependencyFlags) -> Result<Self, ContainerError> {
        Ok(Self {
            name,
            flags: flags.normalize()?,
        })
    }

    /// A plain REQUIRED dependency.
    pub fn required(name: ServiceName) -> Self {
        Self {
            name,
            flags: DependencyFlags::REQUIRED,
        }
    }

    pub fn name(&self) -> &ServiceName {
        &self.name
    }

    pub fn flags(&self) -> DependencyFlags {
        self.flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_flags_mean_required() {
        let flags = DependencyFlags::empty().normalize().unwrap();
        assert_eq!(flags, DependencyFlags::REQUIRED);
        assert!(flags.is_blocking());
        assert!(flags.is_demanded());
    }

    #[test]
    fn parent_and_replace_imply_required() {
        let parent = DependencyFlags::PARENT.normalize().unwrap();
        assert!(parent.contains(DependencyFlags::REQUIRED));
        assert!(parent.is_parent());

        let replace = DependencyFlags::REPLACE.normalize().unwrap();
        assert!(replace.is_blocking());
        assert!(!replace.reports_missing());
    }

    #[test]
    fn optional_is_demanded_but_not_blocking() {
        let flags = DependencyFlags::OPTIONAL.normalize().unwrap();
        assert!(flags.is_demanded());
        assert!(!flags.is_blocking());
    }

    #[test]
    fn contradictions_are_rejected() {
        for bad in [
            DependencyFlags::REQUIRED | DependencyFlags::OPTIONAL,
            DependencyFlags::ANTI | DependencyFlags::REQUIRED,
            DependencyFlags::ANTI | DependencyFlags::PARENT,
            DependencyFlags::PARENT | DependencyFlags::OPTIONAL,
        ] {
            let err = bad.normalize().unwrap_err();
            assert_eq!(err.as_label(), "illegal_state");
        }
    }

    #[test]
    fn anti_is_neither_blocking_nor_demanded() {
        let flags = DependencyFlags::ANTI.normalize().unwrap();
        assert!(flags.is_anti());
        assert!(!flags.is_blocking());
        assert!(!flags.is_demanded());
    }
}

//! Qualified names exchanged across the host ABI.
//!
//! - [`QName`]: `pkg.Entity`, a package-local name (storages use these)
//! - [`FullQName`]: `full/package/path.Entity`, a name carrying the full
//!   package path as seen by the guest

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::AbiError;

/// Package-local qualified name, e.g. `sys.View`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub struct QName {
    /// Local package name.
    pub pkg: String,
    /// Entity name.
    pub entity: String,
}

impl QName {
    /// Create a new qualified name.
    pub fn new(pkg: impl Into<String>, entity: impl Into<String>) -> Self {
        Self {
            pkg: pkg.into(),
            entity: entity.into(),
        }
    }
}

impl FromStr for QName {
    type Err = AbiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || AbiError::InvalidQName {
            value: s.to_string(),
        };
        let (pkg, entity) = s.split_once('.').ok_or_else(invalid)?;
        if pkg.is_empty() || entity.is_empty() || entity.contains('.') {
            return Err(invalid());
        }
        Ok(Self::new(pkg, entity))
    }
}

impl fmt::Display for QName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.pkg, self.entity)
    }
}

/// Qualified name with a full package path, e.g. `github.com/org/pkg.Entity`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub struct FullQName {
    /// Full package path.
    pub pkg_path: String,
    /// Entity name.
    pub entity: String,
}

impl FullQName {
    /// Create a new full qualified name.
    pub fn new(pkg_path: impl Into<String>, entity: impl Into<String>) -> Self {
        Self {
            pkg_path: pkg_path.into(),
            entity: entity.into(),
        }
    }
}

impl FromStr for FullQName {
    type Err = AbiError;

    /// Splits at the last dot, since package paths may contain dots.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once('.') {
            Some((pkg_path, entity)) if !pkg_path.is_empty() && !entity.is_empty() => {
                Ok(Self::new(pkg_path, entity))
            }
            _ => Err(AbiError::InvalidQName {
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for FullQName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.pkg_path, self.entity)
    }
}

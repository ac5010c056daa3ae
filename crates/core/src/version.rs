//! Optimistic-lock versions

use serde::{Deserialize, Serialize};
use std::fmt;

/// Version number of a versioned entity
///
/// Starts at [`Version::INITIAL`] on insert and is incremented by every
/// update that touches the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Version(u64);

impl Version {
    /// Version assigned on insert
    pub const INITIAL: Version = Version(0);

    /// Wrap a raw version number
    pub const fn new(raw: u64) -> Self {
        Version(raw)
    }

    /// The version following this one
    pub const fn next(self) -> Self {
        Version(self.0.wrapping_add(1))
    }

    /// Raw version number
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl From<u64> for Version {
    fn from(v: u64) -> Self {
        Version(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_increments() {
        assert_eq!(Version::INITIAL.next(), Version::new(1));
        assert!(Version::new(3) < Version::new(3).next());
    }
}

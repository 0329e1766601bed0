use std::fmt;

use serde::{Deserialize, Serialize};

/// A container version: the number of a write transaction, and the version a
/// read context observes once that transaction has been published.
///
/// Version 0 is the empty container created before any transaction.
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct Version(u64);

impl Version {
    pub const INITIAL: Version = Version(0);

    pub fn new(number: u64) -> Self {
        Self(number)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// The version `count` numbers after this one.
    pub fn advance(&self, count: u64) -> Version {
        Version(self.0.saturating_add(count))
    }

    pub fn next(&self) -> Version {
        self.advance(1)
    }
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Version({})", self.0)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl From<u64> for Version {
    fn from(number: u64) -> Self {
        Self(number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_and_next() {
        let v = Version::new(4);
        assert_eq!(v.next(), Version::new(5));
        assert_eq!(v.advance(3), Version::new(7));
        assert_eq!(Version::new(u64::MAX).next(), Version::new(u64::MAX));
    }

    #[test]
    fn display() {
        assert_eq!(Version::new(12).to_string(), "v12");
        assert_eq!(Version::INITIAL, Version::default());
    }
}

use std::fmt::{self, Display};
use std::ops::BitOr;

/// The role bitmask attached to a subtree registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct RegistrationFlags(u8);

impl RegistrationFlags {
    /// The member publishes data under the registered subtree.
    pub const PUBLISHER: Self = Self(1 << 0);
    /// The member subscribes to changes under the registered subtree.
    pub const SUBSCRIBER: Self = Self(1 << 1);
    /// Registered data is persisted into the sharded KV store.
    pub const CACHE: Self = Self(1 << 2);
    /// The subtree may be registered by multiple members concurrently.
    pub const SHARED: Self = Self(1 << 3);

    /// No flags set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Returns true if every flag in `other` is also set in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// The raw bitmask.
    pub const fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for RegistrationFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl Display for RegistrationFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (flag, name) in [
            (Self::PUBLISHER, "publisher"),
            (Self::SUBSCRIBER, "subscriber"),
            (Self::CACHE, "cache"),
            (Self::SHARED, "shared"),
        ] {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("none")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_and_union() {
        let f = RegistrationFlags::PUBLISHER | RegistrationFlags::CACHE;
        assert!(f.contains(RegistrationFlags::PUBLISHER));
        assert!(f.contains(RegistrationFlags::CACHE));
        assert!(f.contains(RegistrationFlags::PUBLISHER | RegistrationFlags::CACHE));
        assert!(!f.contains(RegistrationFlags::SUBSCRIBER));
        assert!(f.contains(RegistrationFlags::empty()));
    }

    #[test]
    fn display() {
        assert_eq!(RegistrationFlags::empty().to_string(), "none");
        assert_eq!(
            (RegistrationFlags::PUBLISHER | RegistrationFlags::SHARED).to_string(),
            "publisher|shared"
        );
    }
}

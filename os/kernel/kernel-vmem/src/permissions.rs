use core::fmt;
use core::str::FromStr;

bitflags::bitflags! {
    /// Page and region access permissions.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct Permissions: u8 {
        /// Loads are allowed.
        const READ = 1 << 0;

        /// Stores are allowed.
        ///
        /// A page that is not writable but marked copy-on-write still accepts
        /// writes once the fault pipeline has given it a private frame.
        const WRITE = 1 << 1;

        /// Instruction fetches are allowed.
        const EXECUTE = 1 << 2;
    }
}

impl Permissions {
    /// Read + write, the default for anonymous allocations.
    pub const RW: Self = Self::READ.union(Self::WRITE);

    /// Read + execute.
    pub const RX: Self = Self::READ.union(Self::EXECUTE);

    /// Whether these permissions allow `access`.
    #[inline]
    #[must_use]
    pub const fn allows(self, access: Access) -> bool {
        self.contains(access.required())
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = if self.contains(Self::READ) { 'r' } else { '-' };
        let w = if self.contains(Self::WRITE) { 'w' } else { '-' };
        let x = if self.contains(Self::EXECUTE) { 'x' } else { '-' };
        write!(f, "{r}{w}{x}")
    }
}

/// Error returned when an access or permission string cannot be parsed.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
#[error("invalid access specifier {0:?}")]
pub struct ParseAccessError(pub String);

impl FromStr for Permissions {
    type Err = ParseAccessError;

    /// Parses `"rw-"`, `"rx"`, `"r"` and similar.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut p = Self::empty();
        for c in s.chars() {
            match c.to_ascii_lowercase() {
                'r' => p |= Self::READ,
                'w' => p |= Self::WRITE,
                'x' => p |= Self::EXECUTE,
                '-' => {}
                _ => return Err(ParseAccessError(s.to_owned())),
            }
        }
        Ok(p)
    }
}

/// The kind of a single memory access.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Access {
    Read,
    Write,
    Execute,
}

impl Access {
    /// The permission bit this access needs.
    #[inline]
    #[must_use]
    pub const fn required(self) -> Permissions {
        match self {
            Self::Read => Permissions::READ,
            Self::Write => Permissions::WRITE,
            Self::Execute => Permissions::EXECUTE,
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_write(self) -> bool {
        matches!(self, Self::Write)
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Execute => "execute",
        })
    }
}

impl FromStr for Access {
    type Err = ParseAccessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "r" | "read" => Ok(Self::Read),
            "w" | "write" => Ok(Self::Write),
            "x" | "exec" | "execute" => Ok(Self::Execute),
            _ => Err(ParseAccessError(s.to_owned())),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn access_strings() {
        assert_eq!("r".parse::<Access>().unwrap(), Access::Read);
        assert_eq!("W".parse::<Access>().unwrap(), Access::Write);
        assert_eq!("x".parse::<Access>().unwrap(), Access::Execute);
        assert!("rw".parse::<Access>().is_err());
    }

    #[test]
    fn permission_strings() {
        assert_eq!("rw-".parse::<Permissions>().unwrap(), Permissions::RW);
        assert_eq!("r-x".parse::<Permissions>().unwrap(), Permissions::RX);
        assert_eq!(Permissions::RW.to_string(), "rw-");
        assert!("rwz".parse::<Permissions>().is_err());
    }

    #[test]
    fn allows_checks_single_bit() {
        assert!(Permissions::RW.allows(Access::Write));
        assert!(!Permissions::RW.allows(Access::Execute));
        assert!(!Permissions::empty().allows(Access::Read));
    }
}

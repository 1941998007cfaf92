use std::fmt;
use std::path::Path;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum IdError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed 128-bit id")]
    Malformed,
}

/// A 128-bit identifier in the style of machine and boot ids.
///
/// Formats as 32 lowercase hex characters; parses both the plain and the
/// dash-separated UUID spelling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id128(pub [u8; 16]);

impl Id128 {
    pub fn is_null(&self) -> bool {
        self.0 == [0u8; 16]
    }

    /// Mint a random id.
    pub fn random() -> Self {
        Self(Uuid::new_v4().into_bytes())
    }

    pub fn parse(s: &str) -> Result<Self, IdError> {
        let s = s.trim();

        let hex: String = s.chars().filter(|c| *c != '-').collect();
        if hex.len() != 32 {
            return Err(IdError::Malformed);
        }

        let mut bytes = [0u8; 16];
        for (i, byte) in bytes.iter_mut().enumerate() {
            let pair = &hex[i * 2..i * 2 + 2];
            *byte = u8::from_str_radix(pair, 16).map_err(|_| IdError::Malformed)?;
        }

        Ok(Self(bytes))
    }

    fn from_file(path: impl AsRef<Path>) -> Result<Self, IdError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// The machine id from `/etc/machine-id`.
    pub fn machine_id() -> Result<Self, IdError> {
        Self::from_file("/etc/machine-id")
    }

    /// The boot id minted by the kernel at boot.
    pub fn boot_id() -> Result<Self, IdError> {
        Self::from_file("/proc/sys/kernel/random/boot_id")
    }
}

impl fmt::Display for Id128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl From<Uuid> for Id128 {
    fn from(u: Uuid) -> Self {
        Self(u.into_bytes())
    }
}

impl From<Id128> for Uuid {
    fn from(id: Id128) -> Self {
        Uuid::from_bytes(id.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plain_hex() {
        let id = Id128::parse("0123456789abcdef0123456789abcdef").unwrap();
        assert_eq!(id.to_string(), "0123456789abcdef0123456789abcdef");
    }

    #[test]
    fn parse_uuid_spelling() {
        let id = Id128::parse("01234567-89ab-cdef-0123-456789abcdef").unwrap();
        assert_eq!(id.to_string(), "0123456789abcdef0123456789abcdef");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Id128::parse("").is_err());
        assert!(Id128::parse("xyz").is_err());
        assert!(Id128::parse("0123456789abcdef0123456789abcde").is_err());
    }

    #[test]
    fn random_ids_differ() {
        assert_ne!(Id128::random(), Id128::random());
    }
}

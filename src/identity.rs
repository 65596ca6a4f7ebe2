use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Stable identity of a hardware security module.
///
/// Derived from the module's public endorsement material and only ever
/// compared for equality.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HardwareIdentity(String);

impl HardwareIdentity {
    /// Lower-case hex SHA-256 of the endorsement public area.
    pub fn from_public(public: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(public)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for HardwareIdentity {
    fn from(hash: String) -> Self {
        Self(hash)
    }
}

impl From<&str> for HardwareIdentity {
    fn from(hash: &str) -> Self {
        Self(hash.to_owned())
    }
}

impl fmt::Display for HardwareIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable_hex() {
        let a = HardwareIdentity::from_public(b"endorsement");
        let b = HardwareIdentity::from_public(b"endorsement");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(a, HardwareIdentity::from_public(b"other"));
    }

    #[test]
    fn compares_with_record_hash() {
        let known = HardwareIdentity::from_public(b"ek");
        let declared = HardwareIdentity::from(known.to_string());
        assert_eq!(known, declared);
    }
}

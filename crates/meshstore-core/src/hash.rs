//! Hash identity types (spec §3, §6)
//!
//! A [`Hash`] is a 32-byte SHA-256 digest. Two flavors exist at the type level so
//! that an [`ObjectHash`] (hash of a concrete object's canonical form) can never be
//! passed where an [`IdHash`] (hash of a versioned entity's identifying subset) is
//! expected, even though both wrap the same 32 bytes on the wire.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Raw 32-byte digest, rendered as 64-character lowercase hex for external use.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    /// Compute SHA-256 over `bytes`.
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let mut out = [0u8; 32];
        out.copy_from_slice(&hasher.finalize());
        Hash(out)
    }

    /// Render as 64-character lowercase hex.
    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    /// Parse from 64-character lowercase hex. `^[0-9a-f]{64}$`.
    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() != 64 || !s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
            return Err(Error::MalformedHash(s.to_string()));
        }
        let bytes = hex::decode(s).map_err(|e| Error::MalformedHash(e.to_string()))?;
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(Hash(out))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.to_hex())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

macro_rules! hash_newtype {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub Hash);

        impl $name {
            /// Wrap a raw hash.
            pub fn new(hash: Hash) -> Self {
                Self(hash)
            }

            /// Render as 64-character lowercase hex.
            pub fn to_hex(self) -> String {
                self.0.to_hex()
            }

            /// Parse from 64-character lowercase hex.
            pub fn from_hex(s: &str) -> Result<Self> {
                Ok(Self(Hash::from_hex(s)?))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0.to_hex())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0.to_hex())
            }
        }

        impl From<Hash> for $name {
            fn from(h: Hash) -> Self {
                Self(h)
            }
        }
    };
}

hash_newtype!(ObjectHash, "Hash of the canonical form of a concrete object.");
hash_newtype!(
    IdHash,
    "Hash of the canonical form of a versioned object's identifying subset. Stable across versions."
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip() {
        let h = Hash::of(b"hello world");
        let hex = h.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(Hash::from_hex(&hex).unwrap(), h);
    }

    #[test]
    fn rejects_malformed_hex() {
        assert!(Hash::from_hex("not-hex").is_err());
        assert!(Hash::from_hex("abcd").is_err());
        assert!(Hash::from_hex(&"g".repeat(64)).is_err());
    }

    #[test]
    fn object_and_id_hash_distinct_types() {
        let h = Hash::of(b"x");
        let oh = ObjectHash::new(h);
        let ih = IdHash::new(h);
        assert_eq!(oh.to_hex(), ih.to_hex());
    }
}

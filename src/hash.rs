//! Strong hashes for block verification and whole-file digests.
//!
//! Blocks are confirmed with a 128-bit MD5 digest once the weak checksum has
//! found a candidate. Whole files reconstructed from a diff are verified with
//! BLAKE3.

use std::fmt;
use std::str::FromStr;

use md5::{Digest, Md5};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::SyncError;

/// 128-bit digest confirming a weak checksum match.
///
/// Equality of two digests is treated as equality of the blocks.
///
/// # Example
///
/// ```rust
/// use vfsync::StrongHash;
///
/// let hash1 = StrongHash::compute(b"hello world");
/// let hash2 = StrongHash::compute(b"hello world");
/// assert_eq!(hash1, hash2);
/// assert_eq!(hash1.to_string(), "5eb63bbbe01eeed093cb22bb8f5acdc3");
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StrongHash([u8; 16]);

impl StrongHash {
    /// Compute the MD5 digest of a block.
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        Self(Md5::digest(data).into())
    }

    /// Create a `StrongHash` from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes of the hash.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Create a zero hash (for testing/initialization).
    #[must_use]
    pub const fn zero() -> Self {
        Self([0u8; 16])
    }
}

/// 256-bit BLAKE3 digest of a complete file.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Hash a complete byte buffer.
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Create a `ContentHash` from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes of the hash.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

fn parse_hex<const N: usize>(s: &str) -> Result<[u8; N], SyncError> {
    let mut out = [0u8; N];
    hex::decode_to_slice(s, &mut out)
        .map_err(|e| SyncError::InvalidArgument(format!("invalid {N}-byte hex digest {s:?}: {e}")))?;
    Ok(out)
}

macro_rules! hex_digest_impls {
    ($ty:ident, $len:literal) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({}...)", stringify!($ty), hex::encode(&self.0[..8]))
            }
        }

        impl FromStr for $ty {
            type Err = SyncError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                parse_hex::<$len>(s).map(Self)
            }
        }

        impl AsRef<[u8]> for $ty {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

hex_digest_impls!(StrongHash, 16);
hex_digest_impls!(ContentHash, 32);

impl Default for StrongHash {
    fn default() -> Self {
        Self::zero()
    }
}

//! Fixed-size SHA-256 digests used as cache keys
//!
//! Every key in the cache is a 32-byte SHA-256 digest rendered as lowercase
//! hex. Equal digests are treated as equal content.

use crate::error::{VstoreError, VstoreResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Digest length in bytes
pub const DIGEST_LEN: usize = 32;

/// Parse a 64-char lowercase or uppercase hex string into raw digest bytes
fn parse_digest(value: &str) -> VstoreResult<[u8; DIGEST_LEN]> {
    let bytes = hex::decode(value).map_err(|e| VstoreError::InvalidDigest {
        value: value.to_string(),
        reason: e.to_string(),
    })?;

    bytes
        .try_into()
        .map_err(|b: Vec<u8>| VstoreError::InvalidDigest {
            value: value.to_string(),
            reason: format!("expected {} bytes, got {}", DIGEST_LEN, b.len()),
        })
}

macro_rules! digest_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(into = "String", try_from = "String")]
        pub struct $name([u8; DIGEST_LEN]);

        impl $name {
            /// Wrap raw digest bytes
            pub const fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
                Self(bytes)
            }

            /// Raw digest bytes
            pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
                &self.0
            }

            /// Lowercase hex rendering
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// First 12 hex characters, for display
            pub fn short(&self) -> String {
                hex::encode(&self.0[..6])
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.short())
            }
        }

        impl FromStr for $name {
            type Err = VstoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                parse_digest(s).map(Self)
            }
        }

        impl TryFrom<String> for $name {
            type Error = VstoreError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                value.parse()
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.to_hex()
            }
        }
    };
}

digest_type!(
    /// Digest of a content blob; identifies an entry in a content store
    ContentHash
);

digest_type!(
    /// Digest of a build step's declared identity (tool, command line, declared inputs)
    WeakFingerprint
);

impl ContentHash {
    /// Hash a byte sequence
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(hasher.finalize().into())
    }
}

impl WeakFingerprint {
    /// Compute the weak fingerprint of a step from its declared identity.
    ///
    /// Fields are length-prefixed so `["ab", "c"]` and `["a", "bc"]` differ.
    pub fn compute<S: AsRef<str>>(tool: &str, args: &[S], declared_inputs: &[S]) -> Self {
        let mut hasher = Sha256::new();
        update_field(&mut hasher, b"weak-v1");
        update_field(&mut hasher, tool.as_bytes());
        hasher.update((args.len() as u64).to_le_bytes());
        for arg in args {
            update_field(&mut hasher, arg.as_ref().as_bytes());
        }
        hasher.update((declared_inputs.len() as u64).to_le_bytes());
        for input in declared_inputs {
            update_field(&mut hasher, input.as_ref().as_bytes());
        }
        Self(hasher.finalize().into())
    }
}

/// Feed a length-prefixed field into a hasher
pub(crate) fn update_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

//! Content checksums for Nimbus
//!
//! Objects are identified on the wire and on disk by the xxHash64 (seed 0)
//! of their content, rendered as 16 lowercase hex digits.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use xxhash_rust::xxh64::Xxh64;

/// Header carrying the content checksum on requests and responses
pub const CONTENT_HASH_HEADER: &str = "Content-HASH";

/// xxHash64 content checksum
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Checksum(u64);

impl Checksum {
    /// Wrap a raw digest value
    #[must_use]
    pub const fn new(digest: u64) -> Self {
        Self(digest)
    }

    /// Compute the checksum of an in-memory buffer
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        Self(xxhash_rust::xxh64::xxh64(data, 0))
    }

    /// Raw digest value
    #[must_use]
    pub const fn digest(&self) -> u64 {
        self.0
    }

    /// Hex rendering used in headers and attributes
    #[must_use]
    pub fn to_hex(&self) -> String {
        format!("{:016x}", self.0)
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({:016x})", self.0)
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Error returned when a checksum string is not 1..=16 hex digits
#[derive(Debug, Clone, thiserror::Error)]
#[error("malformed checksum: {0:?}")]
pub struct ChecksumParseError(String);

impl FromStr for Checksum {
    type Err = ChecksumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.len() > 16 {
            return Err(ChecksumParseError(s.to_string()));
        }
        u64::from_str_radix(s, 16)
            .map(Self)
            .map_err(|_| ChecksumParseError(s.to_string()))
    }
}

impl From<Checksum> for String {
    fn from(c: Checksum) -> Self {
        c.to_hex()
    }
}

impl TryFrom<String> for Checksum {
    type Error = ChecksumParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Streaming checksum calculator
pub struct ChecksumCalculator {
    state: Xxh64,
    len: u64,
}

impl ChecksumCalculator {
    /// Create a new calculator
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Xxh64::new(0),
            len: 0,
        }
    }

    /// Update the calculator with more data
    pub fn update(&mut self, data: &[u8]) {
        self.state.update(data);
        self.len += data.len() as u64;
    }

    /// Number of bytes fed so far
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.len
    }

    /// Whether no bytes were fed yet
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Finalize and return the computed checksum
    #[must_use]
    pub fn finalize(self) -> Checksum {
        Checksum(self.state.digest())
    }
}

impl Default for ChecksumCalculator {
    fn default() -> Self {
        Self::new()
    }
}

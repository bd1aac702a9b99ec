//! Kiln Hasher - BLAKE3-based hashing primitives
//!
//! Features:
//! - Fixed-width `HashCode` shared by snapshots, fingerprints and cache keys
//! - Tagged, length-prefixed streaming `Hasher` so component sequences never collide
//! - Hex display and serde support for reports and history files

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

/// 32-byte BLAKE3 digest
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HashCode([u8; 32]);

impl HashCode {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Hash raw bytes
    pub fn of(bytes: impl AsRef<[u8]>) -> Self {
        Self(*blake3::hash(bytes.as_ref()).as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        blake3::Hash::from(self.0).to_hex().to_string()
    }

    /// Parse a 64-character hex string
    pub fn from_hex(hex: &str) -> Option<Self> {
        blake3::Hash::from_hex(hex)
            .ok()
            .map(|hash| Self(*hash.as_bytes()))
    }

    /// First 16 hex characters, for log lines
    pub fn short(&self) -> String {
        let mut hex = self.to_hex();
        hex.truncate(16);
        hex
    }
}

impl fmt::Display for HashCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for HashCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashCode({})", self.short())
    }
}

impl Serialize for HashCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for HashCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        HashCode::from_hex(&hex)
            .ok_or_else(|| de::Error::custom(format!("invalid hash code '{}'", hex)))
    }
}

// Component tags. Every component is written as tag + payload so that
// e.g. ("ab", "c") and ("a", "bc") produce different digests.
const TAG_STR: u8 = b's';
const TAG_BYTES: u8 = b'b';
const TAG_HASH: u8 = b'h';
const TAG_BOOL: u8 = b'z';
const TAG_INT: u8 = b'i';
const TAG_NULL: u8 = b'n';

/// Streaming hasher for derived hashes (fingerprints, value hashes, cache keys)
#[derive(Clone, Default)]
pub struct Hasher {
    inner: blake3::Hasher,
}

impl Hasher {
    pub fn new() -> Self {
        Self {
            inner: blake3::Hasher::new(),
        }
    }

    pub fn put_str(&mut self, value: &str) -> &mut Self {
        self.put_tagged(TAG_STR, value.as_bytes())
    }

    pub fn put_bytes(&mut self, value: &[u8]) -> &mut Self {
        self.put_tagged(TAG_BYTES, value)
    }

    pub fn put_hash(&mut self, value: &HashCode) -> &mut Self {
        self.inner.update(&[TAG_HASH]);
        self.inner.update(value.as_bytes());
        self
    }

    pub fn put_bool(&mut self, value: bool) -> &mut Self {
        self.inner.update(&[TAG_BOOL, value as u8]);
        self
    }

    pub fn put_i64(&mut self, value: i64) -> &mut Self {
        self.inner.update(&[TAG_INT]);
        self.inner.update(&value.to_le_bytes());
        self
    }

    pub fn put_usize(&mut self, value: usize) -> &mut Self {
        self.put_i64(value as i64)
    }

    pub fn put_null(&mut self) -> &mut Self {
        self.inner.update(&[TAG_NULL]);
        self
    }

    fn put_tagged(&mut self, tag: u8, bytes: &[u8]) -> &mut Self {
        self.inner.update(&[tag]);
        self.inner.update(&(bytes.len() as u64).to_le_bytes());
        self.inner.update(bytes);
        self
    }

    pub fn finish(&self) -> HashCode {
        HashCode(*self.inner.finalize().as_bytes())
    }
}

/// Hash file content, optionally normalizing line endings first.
///
/// With normalization, `\r\n` and lone `\r` both hash like `\n`, so a
/// checkout on Windows and one on Linux produce the same content hash.
pub fn hash_content(content: &[u8], normalize_line_endings: bool) -> HashCode {
    if !normalize_line_endings || !content.contains(&b'\r') {
        return HashCode::of(content);
    }

    let mut hasher = blake3::Hasher::new();
    let mut start = 0;
    let mut i = 0;
    while i < content.len() {
        if content[i] == b'\r' {
            hasher.update(&content[start..i]);
            hasher.update(b"\n");
            if content.get(i + 1) == Some(&b'\n') {
                i += 1;
            }
            start = i + 1;
        }
        i += 1;
    }
    hasher.update(&content[start..]);
    HashCode(*hasher.finalize().as_bytes())
}

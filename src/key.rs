//! Owned dictionary keys.
//!
//! A [`HashKey`] bundles a byte buffer with its precomputed 64-bit hash.
//! The dictionary never hashes anything itself; it consumes
//! `(bytes, len, hash)` triples and compares keys by length, hash, and
//! bytes. The constructors here compute the hash with SipHash so callers
//! that don't carry their own hashing scheme get a reasonable default.

use std::fmt;
use std::hash::Hasher;

use siphasher::sip::SipHasher;

/// An owned key: a byte buffer plus its precomputed 64-bit hash.
#[derive(Clone)]
pub struct HashKey {
    bytes: Box<[u8]>,
    hash: u64,
}

impl HashKey {
    /// Hashes an arbitrary byte slice with the crate's default hasher.
    pub fn hash_of(bytes: &[u8]) -> u64 {
        let mut hasher = SipHasher::new();
        hasher.write(bytes);
        hasher.finish()
    }

    /// Builds a key by copying `bytes` and hashing them.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self::from_owned(bytes.into())
    }

    /// Builds a key from an already-owned buffer, hashing it.
    pub fn from_owned(bytes: Box<[u8]>) -> Self {
        let hash = Self::hash_of(&bytes);
        HashKey { bytes, hash }
    }

    /// Builds a key from a buffer and a caller-computed hash.
    ///
    /// The dictionary trusts the supplied hash; two keys with equal bytes
    /// but different hashes are distinct keys.
    pub fn with_hash(bytes: Box<[u8]>, hash: u64) -> Self {
        HashKey { bytes, hash }
    }

    /// The key bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The precomputed hash.
    pub fn hash(&self) -> u64 {
        self.hash
    }

    /// The key length in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the key is zero-length.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl PartialEq for HashKey {
    fn eq(&self, other: &Self) -> bool {
        // Length and hash first; the byte comparison is the expensive part.
        self.bytes.len() == other.bytes.len()
            && self.hash == other.hash
            && self.bytes == other.bytes
    }
}

impl Eq for HashKey {}

impl From<u64> for HashKey {
    fn from(value: u64) -> Self {
        Self::from_bytes(&value.to_le_bytes())
    }
}

impl From<&str> for HashKey {
    fn from(value: &str) -> Self {
        Self::from_bytes(value.as_bytes())
    }
}

impl fmt::Debug for HashKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashKey")
            .field("len", &self.bytes.len())
            .field("hash", &format_args!("{:#018x}", self.hash))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_keys_match() {
        let a = HashKey::from_bytes(b"conn_id");
        let b = HashKey::from_bytes(b"conn_id");
        assert_eq!(a, b);
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a.len(), 7);
    }

    #[test]
    fn different_bytes_differ() {
        let a = HashKey::from_bytes(b"alpha");
        let b = HashKey::from_bytes(b"omega");
        assert_ne!(a, b);
    }

    #[test]
    fn hash_participates_in_equality() {
        let a = HashKey::with_hash(b"same".to_vec().into_boxed_slice(), 1);
        let b = HashKey::with_hash(b"same".to_vec().into_boxed_slice(), 2);
        assert_ne!(a, b);
    }

    #[test]
    fn typed_constructors() {
        let from_int = HashKey::from(5u64);
        assert_eq!(from_int.len(), 8);
        assert_eq!(from_int, HashKey::from(5u64));
        assert_ne!(from_int, HashKey::from(25u64));

        let from_str = HashKey::from("orig_h");
        assert_eq!(from_str.bytes(), b"orig_h");
    }

    #[test]
    fn empty_key_is_valid() {
        let k = HashKey::from_bytes(b"");
        assert!(k.is_empty());
        assert_eq!(k, HashKey::from_bytes(b""));
    }
}

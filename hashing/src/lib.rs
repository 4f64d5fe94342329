// Copyright 2021 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
// Digest and Fingerprint value types shared by every BuildGrid crate.
//
// A Fingerprint is a fixed-width SHA-256 digest of a blob's bytes; a Digest
// pairs a Fingerprint with the blob's declared length. Two digests are equal
// iff both fields are equal (spec.md §3).

use std::fmt;
use std::str::FromStr;

use serde::{de::Error as DeError, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};

pub const FINGERPRINT_SIZE: usize = 32;

#[derive(Clone, Copy, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct Fingerprint(pub [u8; FINGERPRINT_SIZE]);

impl Fingerprint {
    pub fn from_bytes_unsafe(bytes: &[u8]) -> Fingerprint {
        if bytes.len() != FINGERPRINT_SIZE {
            panic!(
                "Input value was not a fingerprint; had length: {}",
                bytes.len()
            );
        }
        let mut fingerprint = [0; FINGERPRINT_SIZE];
        fingerprint.copy_from_slice(bytes);
        Fingerprint(fingerprint)
    }

    pub fn from_hex_string(hex_string: &str) -> Result<Fingerprint, String> {
        <[u8; FINGERPRINT_SIZE] as hex::FromHex>::from_hex(hex_string)
            .map(Fingerprint)
            .map_err(|err| format!("Invalid hex string: {err:?}"))
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_SIZE] {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint<{}>", self.to_hex())
    }
}

impl FromStr for Fingerprint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Fingerprint::from_hex_string(s)
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Fingerprint::from_hex_string(&s).map_err(DeError::custom)
    }
}

pub const EMPTY_FINGERPRINT: Fingerprint = Fingerprint([
    0xe3, 0xb0, 0xc4, 0x42, 0x98, 0xfc, 0x1c, 0x14, 0x9a, 0xfb, 0xf4, 0xc8, 0x99, 0x6f, 0xb9, 0x24,
    0x27, 0xae, 0x41, 0xe4, 0x64, 0x9b, 0x93, 0x4c, 0xa4, 0x95, 0x99, 0x1b, 0x78, 0x52, 0xb8, 0x55,
]);

/// A (hash, size) pair identifying an immutable blob (spec.md §3).
#[derive(Clone, Copy, Eq, Hash, PartialEq, Debug)]
pub struct Digest {
    pub hash: Fingerprint,
    pub size_bytes: usize,
}

impl Digest {
    pub fn new(hash: Fingerprint, size_bytes: usize) -> Digest {
        Digest { hash, size_bytes }
    }

    pub fn of_bytes(bytes: &[u8]) -> Digest {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Digest::new(
            Fingerprint::from_bytes_unsafe(&hasher.finalize()),
            bytes.len(),
        )
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.hash, self.size_bytes)
    }
}

pub const EMPTY_DIGEST: Digest = Digest {
    hash: EMPTY_FINGERPRINT,
    size_bytes: 0,
};

/// Wraps a `Sha256` hasher so a running hash can be computed alongside a
/// byte count while streaming chunks in, mirroring the ByteStream write
/// protocol's requirement to validate on the terminal chunk (spec.md §4.2).
#[derive(Default)]
pub struct RunningHasher {
    hasher: Sha256,
    bytes_written: usize,
}

impl RunningHasher {
    pub fn new() -> RunningHasher {
        RunningHasher::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.bytes_written += chunk.len();
    }

    pub fn bytes_written(&self) -> usize {
        self.bytes_written
    }

    pub fn finish(self) -> Fingerprint {
        Fingerprint::from_bytes_unsafe(&self.hasher.finalize())
    }

    /// Consumes the hasher, checking the accumulated hash and length against
    /// a declared digest. Used at the terminal write request.
    pub fn verify(self, expected: &Digest) -> Result<(), String> {
        if self.bytes_written != expected.size_bytes {
            return Err(format!(
                "expected {} bytes, got {}",
                expected.size_bytes, self.bytes_written
            ));
        }
        let actual = self.finish();
        if actual != expected.hash {
            return Err(format!(
                "hash mismatch: expected {expected_hash}, computed {actual}",
                expected_hash = expected.hash
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_digest_matches_sha256_of_empty_bytes() {
        assert_eq!(Digest::of_bytes(b""), EMPTY_DIGEST);
    }

    #[test]
    fn hex_round_trips() {
        let digest = Digest::of_bytes(b"abcdef");
        let hex = digest.hash.to_hex();
        assert_eq!(Fingerprint::from_hex_string(&hex).unwrap(), digest.hash);
    }

    #[test]
    fn running_hasher_matches_digest_of_bytes() {
        let mut hasher = RunningHasher::new();
        hasher.update(b"abc");
        hasher.update(b"def");
        let expected = Digest::of_bytes(b"abcdef");
        assert!(hasher.verify(&expected).is_ok());
    }

    #[test]
    fn running_hasher_rejects_short_write() {
        let mut hasher = RunningHasher::new();
        hasher.update(b"abc");
        let expected = Digest::of_bytes(b"abcdef");
        assert!(hasher.verify(&expected).is_err());
    }

    #[test]
    fn running_hasher_rejects_hash_mismatch() {
        let mut hasher = RunningHasher::new();
        hasher.update(b"incorrect");
        let expected = Digest::new(EMPTY_FINGERPRINT, 9);
        assert!(hasher.verify(&expected).is_err());
    }
}

// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
// Enable all clippy lints except for many of the pedantic ones. It's a shame this needs to be copied and pasted across crates, but there doesn't appear to be a way to include inner attributes from a common source.
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
// It is often more clear to show that nothing is being moved.
#![allow(clippy::match_ref_pats)]
// Subjective style.
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
// Default isn't as big a deal as people seem to think it is.
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
// Arc<Mutex> can be more clear than needing to grok Orderings:
#![allow(clippy::mutex_atomic)]

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;

use serde::de;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as Sha256Digest, Sha256};

pub const FINGERPRINT_SIZE: usize = 32;

///
/// A raw SHA-256 value. Rule keys, file hashes and client version tags are all Fingerprints at
/// bottom.
///
/// On the wire and in logs a Fingerprint is always its lowercase hex string; the serde impls
/// below enforce that, so the wire schema reads the same out of any serde backend.
///
#[derive(Clone, Copy, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub struct Fingerprint(pub [u8; FINGERPRINT_SIZE]);

impl Fingerprint {
    pub fn from_hex_string(hex_string: &str) -> Result<Fingerprint, String> {
        <[u8; FINGERPRINT_SIZE] as hex::FromHex>::from_hex(hex_string)
            .map(Fingerprint)
            .map_err(|e| format!("Invalid fingerprint `{hex_string}`: {e}"))
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_SIZE] {
        &self.0
    }

    #[allow(clippy::wrong_self_convention)]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint<{self}>")
    }
}

impl AsRef<[u8]> for Fingerprint {
    fn as_ref(&self) -> &[u8] {
        &self.0[..]
    }
}

impl FromStr for Fingerprint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Fingerprint::from_hex_string(s)
    }
}

impl Serialize for Fingerprint {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let hex_string = String::deserialize(deserializer)?;
        Fingerprint::from_hex_string(&hex_string).map_err(de::Error::custom)
    }
}

///
/// A Fingerprint paired with the size of the fingerprinted content. The size rides along so
/// consumers can sanity-check or preallocate without re-reading the content.
///
/// Serialized field names are part of the wire schema and must not change.
///
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct Digest {
    #[serde(rename = "fingerprint")]
    pub hash: Fingerprint,
    pub size_bytes: usize,
}

impl Digest {
    pub fn new(hash: Fingerprint, size_bytes: usize) -> Digest {
        Digest { hash, size_bytes }
    }

    pub fn of_bytes(bytes: &[u8]) -> Digest {
        let mut hasher = Sha256::default();
        hasher.update(bytes);
        Digest::new(Fingerprint(hasher.finalize().into()), bytes.len())
    }

    ///
    /// Hash the contents of the file at `path` in a single streaming pass.
    ///
    pub fn of_file(path: &Path) -> io::Result<Digest> {
        let mut file = File::open(path)?;
        let mut hasher = Sha256::default();
        let mut buf = [0_u8; 65536];
        let mut size_bytes = 0_usize;
        loop {
            let read = file.read(&mut buf)?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
            size_bytes += read;
        }
        Ok(Digest::new(Fingerprint(hasher.finalize().into()), size_bytes))
    }
}

///
/// An incremental hasher for assembling a Fingerprint from multiple writes. Writes are
/// length-prefixed so that the encoding of a sequence of fields is unambiguous: ("ab", "c")
/// and ("a", "bc") produce distinct fingerprints.
///
pub struct Hasher {
    hasher: Sha256,
}

impl Hasher {
    pub fn new() -> Hasher {
        Hasher {
            hasher: Sha256::default(),
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher
            .update((bytes.len() as u64).to_be_bytes().as_slice());
        self.hasher.update(bytes);
    }

    pub fn finish(self) -> Fingerprint {
        Fingerprint(self.hasher.finalize().into())
    }
}

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

use std::path::Path;

use serde::{Deserialize, Serialize};

use hashing::Digest;

mod disk;
mod recording;
mod replay;

pub use crate::disk::{DiskHashCache, HashedStat};
pub use crate::recording::RecordingHashCache;
pub use crate::replay::ReplayHashCache;

///
/// Classifies a file's mtime at hash time. A hash taken while the file is still being written
/// (or was written within the filesystem timestamp granularity) cannot be trusted across
/// processes, so such entries are marked Fresh and re-validated by consumers.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum MtimeClass {
    Stable,
    Fresh,
}

///
/// One recorded hash lookup. Paths are cell-relative with forward-slash separators (or absolute,
/// when the looked-up file lay outside every known cell root).
///
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct FileHashEntry {
    pub path: String,
    /// Set when the lookup addressed a member of an archive rather than the archive itself; the
    /// hash is then the member's, and `path` names the archive.
    pub member: Option<String>,
    pub hash: Digest,
    pub mtime_class: MtimeClass,
    pub is_directory: bool,
    pub is_root_symlink: bool,
    pub path_is_absolute: bool,
    /// Inline file bytes, filled only for state dumps.
    pub contents: Option<Vec<u8>>,
}

///
/// Render a path in the canonical wire form: forward-slash separators on every platform.
///
pub fn wire_path(path: &Path) -> String {
    let mut out = String::new();
    for component in path.components() {
        match component {
            std::path::Component::RootDir => out.push('/'),
            std::path::Component::Prefix(prefix) => {
                out.push_str(&prefix.as_os_str().to_string_lossy())
            }
            component => {
                if !(out.is_empty() || out.ends_with('/')) {
                    out.push('/');
                }
                out.push_str(&component.as_os_str().to_string_lossy());
            }
        }
    }
    out
}

///
/// The hash cache variants the coordinator composes. The local client hashes from disk
/// (PassThrough), the state-capturing client additionally records every lookup (Recording), and
/// the remote side replays hashes out of a shipped JobState without touching disk (RemoteReplay).
///
pub enum HashCache {
    PassThrough(DiskHashCache),
    Recording(RecordingHashCache),
    RemoteReplay(ReplayHashCache),
}

impl HashCache {
    pub fn hash(&self, path: &Path) -> Result<Digest, String> {
        match self {
            HashCache::PassThrough(cache) => cache.hash(path).map(|stat| stat.digest),
            HashCache::Recording(cache) => cache.hash(path),
            HashCache::RemoteReplay(cache) => cache.hash(path),
        }
    }

    pub fn hash_archive_member(&self, archive: &Path, member: &str) -> Result<Digest, String> {
        match self {
            HashCache::PassThrough(cache) => cache.hash_archive_member(archive, member),
            HashCache::Recording(cache) => cache.hash_archive_member(archive, member),
            HashCache::RemoteReplay(cache) => cache.hash_archive_member(archive, member),
        }
    }

    pub fn as_recording(&self) -> Option<&RecordingHashCache> {
        match self {
            HashCache::Recording(cache) => Some(cache),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests;

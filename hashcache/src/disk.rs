// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;

use hashing::{Digest, Hasher};

use crate::MtimeClass;

// An mtime within this window of "now" may still be moving under us.
const FRESH_WINDOW: Duration = Duration::from_secs(2);

///
/// The result of one disk hash lookup, along with the stat facts recorded into serialized state.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HashedStat {
    pub digest: Digest,
    pub mtime_class: MtimeClass,
    pub is_directory: bool,
    pub is_root_symlink: bool,
}

///
/// A memoizing file hash cache: each path is stat'ed, read, and digested at most once per cache
/// lifetime. Repeated lookups return the memoized value, so decorators observe identical hash
/// values in identical order regardless of how often a path is requested.
///
pub struct DiskHashCache {
    memo: Mutex<HashMap<PathBuf, HashedStat>>,
    member_memo: Mutex<HashMap<(PathBuf, String), Digest>>,
}

impl DiskHashCache {
    pub fn new() -> DiskHashCache {
        DiskHashCache {
            memo: Mutex::new(HashMap::new()),
            member_memo: Mutex::new(HashMap::new()),
        }
    }

    pub fn hash(&self, path: &Path) -> Result<HashedStat, String> {
        if let Some(stat) = self.memo.lock().get(path) {
            return Ok(*stat);
        }

        let stat = Self::hash_uncached(path)?;
        // A concurrent lookup may have won the race; keep the first value so every caller
        // observes one consistent hash for the path.
        Ok(*self
            .memo
            .lock()
            .entry(path.to_path_buf())
            .or_insert(stat))
    }

    ///
    /// Hash one member of a tar archive. The member's bytes are digested, not the archive's, so
    /// repacking an archive without touching the member does not invalidate rule keys.
    ///
    pub fn hash_archive_member(&self, archive: &Path, member: &str) -> Result<Digest, String> {
        let memo_key = (archive.to_path_buf(), member.to_owned());
        if let Some(digest) = self.member_memo.lock().get(&memo_key) {
            return Ok(*digest);
        }

        let file = File::open(archive)
            .map_err(|e| format!("Failed to open archive {}: {e}", archive.display()))?;
        let mut tar = tar::Archive::new(file);
        let entries = tar
            .entries()
            .map_err(|e| format!("Failed to read archive {}: {e}", archive.display()))?;
        for entry in entries {
            let mut entry = entry
                .map_err(|e| format!("Failed to read archive {}: {e}", archive.display()))?;
            let entry_path = entry
                .path()
                .map_err(|e| format!("Unreadable member path in {}: {e}", archive.display()))?
                .to_path_buf();
            if entry_path == Path::new(member) {
                let mut bytes = Vec::new();
                entry.read_to_end(&mut bytes).map_err(|e| {
                    format!(
                        "Failed to read member {member} of {}: {e}",
                        archive.display()
                    )
                })?;
                let digest = Digest::of_bytes(&bytes);
                self.member_memo.lock().insert(memo_key, digest);
                return Ok(digest);
            }
        }
        Err(format!(
            "Archive {} has no member {member}.",
            archive.display()
        ))
    }

    fn hash_uncached(path: &Path) -> Result<HashedStat, String> {
        let symlink_metadata = path
            .symlink_metadata()
            .map_err(|e| format!("Failed to stat {}: {e}", path.display()))?;
        let is_root_symlink = symlink_metadata.file_type().is_symlink();

        // Hash through the link target.
        let metadata = path
            .metadata()
            .map_err(|e| format!("Failed to stat {}: {e}", path.display()))?;
        let mtime_class = match metadata.modified() {
            Ok(mtime) => match SystemTime::now().duration_since(mtime) {
                Ok(age) if age >= FRESH_WINDOW => MtimeClass::Stable,
                _ => MtimeClass::Fresh,
            },
            // Not all filesystems carry mtimes.
            Err(_) => MtimeClass::Stable,
        };

        if metadata.is_dir() {
            Ok(HashedStat {
                digest: Self::digest_of_dir(path)?,
                mtime_class,
                is_directory: true,
                is_root_symlink,
            })
        } else {
            let digest = Digest::of_file(path)
                .map_err(|e| format!("Failed to hash {}: {e}", path.display()))?;
            Ok(HashedStat {
                digest,
                mtime_class,
                is_directory: false,
                is_root_symlink,
            })
        }
    }

    ///
    /// Directories hash as their sorted member names: enough to detect additions and removals,
    /// while member content changes are tracked by the members' own entries.
    ///
    fn digest_of_dir(path: &Path) -> Result<Digest, String> {
        let mut names = Vec::new();
        let entries = std::fs::read_dir(path)
            .map_err(|e| format!("Failed to list {}: {e}", path.display()))?;
        for entry in entries {
            let entry = entry.map_err(|e| format!("Failed to list {}: {e}", path.display()))?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();

        let mut hasher = Hasher::new();
        for name in &names {
            hasher.update(name.as_bytes());
        }
        Ok(Digest::new(hasher.finish(), 0))
    }
}

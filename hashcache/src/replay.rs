// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use hashing::Digest;

use crate::{wire_path, FileHashEntry};

///
/// Serves hashes out of a shipped state table, never touching disk. This is the remote side's
/// view: the rule keys recomputed there must see exactly the hashes the client recorded, even
/// though the remote checkout's file timestamps (or contents, mid-sync) may differ.
///
pub struct ReplayHashCache {
    // Cell roots as mounted on this host, longest first so nested cells win.
    roots: Vec<(PathBuf, usize)>,
    entries: Vec<HashMap<String, Digest>>,
    absolute: HashMap<String, Digest>,
}

impl ReplayHashCache {
    pub fn new(tables: Vec<(PathBuf, Vec<FileHashEntry>)>) -> ReplayHashCache {
        let mut roots = Vec::new();
        let mut entries = Vec::new();
        let mut absolute = HashMap::new();
        for (root, table) in tables {
            let mut by_path = HashMap::new();
            for entry in table {
                let key = match &entry.member {
                    Some(member) => format!("{}#{member}", entry.path),
                    None => entry.path.clone(),
                };
                if entry.path_is_absolute {
                    absolute.insert(key, entry.hash);
                } else {
                    by_path.insert(key, entry.hash);
                }
            }
            roots.push((root, entries.len()));
            entries.push(by_path);
        }
        roots.sort_by_key(|(root, _)| std::cmp::Reverse(root.as_os_str().len()));
        ReplayHashCache {
            roots,
            entries,
            absolute,
        }
    }

    pub fn hash(&self, path: &Path) -> Result<Digest, String> {
        self.lookup(path, None)
    }

    pub fn hash_archive_member(&self, archive: &Path, member: &str) -> Result<Digest, String> {
        self.lookup(archive, Some(member))
    }

    fn lookup(&self, path: &Path, member: Option<&str>) -> Result<Digest, String> {
        let keyed = |rendered: String| match member {
            Some(member) => format!("{rendered}#{member}"),
            None => rendered,
        };

        for (root, table) in &self.roots {
            if let Ok(relative) = path.strip_prefix(root) {
                let key = keyed(wire_path(relative));
                if let Some(digest) = self.entries[*table].get(&key) {
                    return Ok(*digest);
                }
            }
        }
        if let Some(digest) = self.absolute.get(&keyed(wire_path(path))) {
            return Ok(*digest);
        }
        Err(format!(
            "No recorded hash for {}: the file was not read when the job was captured.",
            path.display()
        ))
    }
}

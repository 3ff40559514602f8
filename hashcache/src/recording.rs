// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;

use cells::{CellIndex, CellIndexer};
use hashing::Digest;

use crate::disk::{DiskHashCache, HashedStat};
use crate::{wire_path, FileHashEntry};

///
/// Decorates a DiskHashCache, recording every lookup into a per-cell buffer for serialization.
///
/// Recording is at-most-once per (cell, path): rule-key workers look the same files up over and
/// over, and the serialized tables must contain one entry per distinct file. Lookups of paths
/// outside every known cell root are recorded with `path_is_absolute` set, under the root cell's
/// buffer.
///
pub struct RecordingHashCache {
    underlying: DiskHashCache,
    cells: Arc<CellIndexer>,
    recorded: Mutex<HashMap<CellIndex, IndexMap<String, FileHashEntry>>>,
}

impl RecordingHashCache {
    pub fn new(underlying: DiskHashCache, cells: Arc<CellIndexer>) -> RecordingHashCache {
        RecordingHashCache {
            underlying,
            cells,
            recorded: Mutex::new(HashMap::new()),
        }
    }

    pub fn hash(&self, path: &Path) -> Result<Digest, String> {
        let stat = self.underlying.hash(path)?;
        let (cell, entry) = self.entry_for(path, None, stat.digest, stat);
        self.record(cell, entry);
        Ok(stat.digest)
    }

    pub fn hash_archive_member(&self, archive: &Path, member: &str) -> Result<Digest, String> {
        let digest = self.underlying.hash_archive_member(archive, member)?;
        // Record under the archive's own stat facts; the member digest is what the rule key saw.
        let stat = self.underlying.hash(archive)?;
        let (cell, entry) = self.entry_for(archive, Some(member.to_owned()), digest, stat);
        self.record(cell, entry);
        Ok(digest)
    }

    ///
    /// Snapshot the recorded tables, cell-indexed, entries in first-recorded order. Call only
    /// after all rule keys have been computed: the tables keep filling until then.
    ///
    pub fn recorded(&self) -> Vec<(CellIndex, Vec<FileHashEntry>)> {
        let recorded = self.recorded.lock();
        let mut cells: Vec<&CellIndex> = recorded.keys().collect();
        cells.sort();
        cells
            .into_iter()
            .map(|cell| (*cell, recorded[cell].values().cloned().collect()))
            .collect()
    }

    ///
    /// Load the bytes of every recorded regular file into its entry, for state dumps.
    ///
    pub fn fill_contents(&self) -> Result<(), String> {
        let roots: HashMap<CellIndex, std::path::PathBuf> = self
            .cells
            .enumerate()
            .into_iter()
            .map(|cell| (cell.index, cell.root))
            .collect();

        let mut recorded = self.recorded.lock();
        for (cell, entries) in recorded.iter_mut() {
            for entry in entries.values_mut() {
                if entry.is_directory || entry.member.is_some() {
                    continue;
                }
                let path = if entry.path_is_absolute {
                    std::path::PathBuf::from(&entry.path)
                } else {
                    roots
                        .get(cell)
                        .ok_or_else(|| format!("Unknown cell {cell} in recorded hashes."))?
                        .join(&entry.path)
                };
                let bytes = std::fs::read(&path)
                    .map_err(|e| format!("Failed to read {}: {e}", path.display()))?;
                entry.contents = Some(bytes);
            }
        }
        Ok(())
    }

    fn entry_for(
        &self,
        path: &Path,
        member: Option<String>,
        digest: Digest,
        stat: HashedStat,
    ) -> (CellIndex, FileHashEntry) {
        match self.cells.resolve(path) {
            Ok(resolved) => (
                resolved.cell,
                FileHashEntry {
                    path: wire_path(&resolved.relative),
                    member,
                    hash: digest,
                    mtime_class: stat.mtime_class,
                    is_directory: stat.is_directory,
                    is_root_symlink: stat.is_root_symlink,
                    path_is_absolute: false,
                    contents: None,
                },
            ),
            // Outside every cell: no cell gets indexed for it.
            Err(_) => (
                CellIndex::root(),
                FileHashEntry {
                    path: wire_path(path),
                    member,
                    hash: digest,
                    mtime_class: stat.mtime_class,
                    is_directory: stat.is_directory,
                    is_root_symlink: stat.is_root_symlink,
                    path_is_absolute: true,
                    contents: None,
                },
            ),
        }
    }

    fn record(&self, cell: CellIndex, entry: FileHashEntry) {
        let key = match &entry.member {
            Some(member) => format!("{}#{member}", entry.path),
            None => entry.path.clone(),
        };
        self.recorded
            .lock()
            .entry(cell)
            .or_default()
            // At-most-once: the first recording for a (cell, path) wins.
            .entry(key)
            .or_insert(entry);
    }
}

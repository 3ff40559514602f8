// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cells::{CellIndex, CellIndexer};
use hashing::Digest;

use crate::{wire_path, DiskHashCache, RecordingHashCache, ReplayHashCache};

fn write_file(path: &Path, content: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

fn recording_cache(root: &Path, candidates: &[(&str, PathBuf)]) -> RecordingHashCache {
    let cells = Arc::new(CellIndexer::new(
        root.to_path_buf(),
        BTreeMap::new(),
        candidates
            .iter()
            .map(|(name, path)| (Some(name.to_string()), path.clone()))
            .collect(),
    ));
    RecordingHashCache::new(DiskHashCache::new(), cells)
}

#[test]
fn disk_cache_memoizes() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("src.c");
    write_file(&path, "int main() {}");

    let cache = DiskHashCache::new();
    let first = cache.hash(&path).unwrap();

    // A second lookup returns the memoized digest even after the file changes on disk.
    write_file(&path, "int main() { return 1; }");
    assert_eq!(cache.hash(&path).unwrap(), first);
}

#[test]
fn disk_cache_digests_content() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("src.c");
    write_file(&path, "int main() {}");

    let stat = DiskHashCache::new().hash(&path).unwrap();
    assert_eq!(stat.digest, Digest::of_bytes(b"int main() {}"));
    assert!(!stat.is_directory);
    assert!(!stat.is_root_symlink);
}

#[test]
fn directory_hash_tracks_membership() {
    let dir = tempfile::TempDir::new().unwrap();
    write_file(&dir.path().join("a"), "x");

    let before = DiskHashCache::new().hash(dir.path()).unwrap();
    write_file(&dir.path().join("b"), "y");
    let after = DiskHashCache::new().hash(dir.path()).unwrap();

    assert!(before.is_directory);
    assert_ne!(before.digest, after.digest);
}

#[test]
fn records_at_most_once_per_path() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("src.c");
    write_file(&path, "int main() {}");

    let cache = recording_cache(dir.path(), &[]);
    for _ in 0..5 {
        cache.hash(&path).unwrap();
    }

    let recorded = cache.recorded();
    assert_eq!(recorded.len(), 1);
    let (cell, entries) = &recorded[0];
    assert_eq!(*cell, CellIndex::root());
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].path, "src.c");
    assert!(!entries[0].path_is_absolute);
}

#[test]
fn records_per_cell() {
    let dir = tempfile::TempDir::new().unwrap();
    let other_root = dir.path().join("other");
    let root_file = dir.path().join("root.c");
    let other_file = other_root.join("lib.c");
    write_file(&root_file, "a");
    write_file(&other_file, "b");

    let cache = recording_cache(dir.path(), &[("other", other_root)]);
    cache.hash(&root_file).unwrap();
    cache.hash(&other_file).unwrap();

    let recorded = cache.recorded();
    assert_eq!(recorded.len(), 2);
    assert_eq!(recorded[0].0, CellIndex::root());
    assert_eq!(recorded[0].1[0].path, "root.c");
    assert_eq!(recorded[1].0, CellIndex(1));
    assert_eq!(recorded[1].1[0].path, "lib.c");
}

#[test]
fn path_outside_cells_is_absolute() {
    let root = tempfile::TempDir::new().unwrap();
    let outside = tempfile::TempDir::new().unwrap();
    let outside_file = outside.path().join("toolchain.h");
    write_file(&outside_file, "#define X 1");

    let cache = recording_cache(root.path(), &[]);
    cache.hash(&outside_file).unwrap();

    let recorded = cache.recorded();
    assert_eq!(recorded.len(), 1);
    let entry = &recorded[0].1[0];
    assert!(entry.path_is_absolute);
    assert_eq!(entry.path, wire_path(&outside_file));
}

#[test]
fn concurrent_lookups_record_once() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("src.c");
    write_file(&path, "int main() {}");

    let cache = Arc::new(recording_cache(dir.path(), &[]));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let cache = cache.clone();
            let path = path.clone();
            std::thread::spawn(move || cache.hash(&path).unwrap())
        })
        .collect();
    let digests: Vec<Digest> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(digests.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(cache.recorded()[0].1.len(), 1);
}

#[test]
fn fill_contents_inlines_files() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("src.c");
    write_file(&path, "int main() {}");

    let cache = recording_cache(dir.path(), &[]);
    cache.hash(&path).unwrap();
    cache.fill_contents().unwrap();

    let recorded = cache.recorded();
    assert_eq!(
        recorded[0].1[0].contents.as_deref(),
        Some(b"int main() {}".as_slice())
    );
}

#[test]
fn archive_member_hash_is_member_content() {
    let dir = tempfile::TempDir::new().unwrap();
    let archive_path = dir.path().join("bundle.tar");

    let mut builder = tar::Builder::new(fs::File::create(&archive_path).unwrap());
    let payload = b"member content";
    let mut header = tar::Header::new_gnu();
    header.set_size(payload.len() as u64);
    header.set_cksum();
    builder
        .append_data(&mut header, "inner/file.txt", payload.as_slice())
        .unwrap();
    builder.finish().unwrap();

    let cache = recording_cache(dir.path(), &[]);
    let digest = cache
        .hash_archive_member(&archive_path, "inner/file.txt")
        .unwrap();
    assert_eq!(digest, Digest::of_bytes(payload));

    let recorded = cache.recorded();
    let entry = &recorded[0].1[0];
    assert_eq!(entry.path, "bundle.tar");
    assert_eq!(entry.member.as_deref(), Some("inner/file.txt"));

    cache
        .hash_archive_member(&archive_path, "missing")
        .expect_err("missing member should not hash");
}

#[test]
fn replay_serves_recorded_hashes() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("src.c");
    write_file(&path, "int main() {}");

    let cache = recording_cache(dir.path(), &[]);
    let digest = cache.hash(&path).unwrap();

    let tables = cache
        .recorded()
        .into_iter()
        .map(|(_cell, entries)| (dir.path().to_path_buf(), entries))
        .collect();
    let replay = ReplayHashCache::new(tables);

    assert_eq!(replay.hash(&path).unwrap(), digest);
    replay
        .hash(&dir.path().join("never-read.c"))
        .expect_err("unrecorded path should not replay");
}

#[test]
fn wire_paths_use_forward_slashes() {
    assert_eq!(wire_path(Path::new("a/b/c.txt")), "a/b/c.txt");
    assert_eq!(wire_path(&PathBuf::from("a").join("b")), "a/b");
    assert_eq!(wire_path(Path::new("/abs/file")), "/abs/file");
}

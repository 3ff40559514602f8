// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeMap;
use std::fs::File;
use std::path::PathBuf;

use crate::{BuildRoot, CellIndex, CellIndexer};

fn indexer(root: &str, candidates: &[(&str, &str)]) -> CellIndexer {
    CellIndexer::new(
        PathBuf::from(root),
        BTreeMap::new(),
        candidates
            .iter()
            .map(|(name, path)| (Some(name.to_string()), PathBuf::from(path)))
            .collect(),
    )
}

#[test]
fn root_cell_is_index_zero() {
    let indexer = indexer("/repo", &[]);
    assert_eq!(
        indexer.index_of(&PathBuf::from("/repo/foo/BUILD.toml")).unwrap(),
        CellIndex::root()
    );
}

#[test]
fn first_seen_order() {
    let indexer = indexer("/repo", &[("b", "/repo/b"), ("a", "/repo/a")]);

    // `b` is listed first in config but `a` is seen first, so `a` gets index 1.
    assert_eq!(
        indexer.index_of(&PathBuf::from("/repo/a/lib.c")).unwrap(),
        CellIndex(1)
    );
    assert_eq!(
        indexer.index_of(&PathBuf::from("/repo/b/lib.c")).unwrap(),
        CellIndex(2)
    );
}

#[test]
fn index_of_is_idempotent() {
    let indexer = indexer("/repo", &[("a", "/repo/a")]);
    let path = PathBuf::from("/repo/a/src/main.c");
    let first = indexer.index_of(&path).unwrap();
    for _ in 0..3 {
        assert_eq!(indexer.index_of(&path).unwrap(), first);
    }
    assert_eq!(indexer.enumerate().len(), 2);
}

#[test]
fn longest_root_wins() {
    let indexer = indexer("/repo", &[("nested", "/repo/vendor/nested")]);
    let resolved = indexer
        .resolve(&PathBuf::from("/repo/vendor/nested/lib.c"))
        .unwrap();
    assert_eq!(resolved.cell, CellIndex(1));
    assert_eq!(resolved.relative, PathBuf::from("lib.c"));
}

#[test]
fn unknown_path_is_an_error() {
    let indexer = indexer("/repo", &[]);
    let err = indexer
        .index_of(&PathBuf::from("/elsewhere/file"))
        .unwrap_err();
    assert!(err.contains("/elsewhere/file"), "unexpected error: {err}");
}

#[test]
fn enumerate_in_index_order() {
    let indexer = indexer("/repo", &[("a", "/repo/a"), ("b", "/repo/b")]);
    indexer.index_of(&PathBuf::from("/repo/b/x")).unwrap();
    indexer.index_of(&PathBuf::from("/repo/a/y")).unwrap();
    let indices: Vec<u32> = indexer.enumerate().iter().map(|c| c.index.0).collect();
    assert_eq!(indices, vec![0, 1, 2]);
    let names: Vec<Option<String>> = indexer.enumerate().into_iter().map(|c| c.name).collect();
    assert_eq!(
        names,
        vec![None, Some("b".to_owned()), Some("a".to_owned())]
    );
}

#[test]
fn build_root_found_by_sentinel() {
    let dir = tempfile::TempDir::new().unwrap();
    File::create(dir.path().join("stampede.toml")).unwrap();
    let nested = dir.path().join("deep/nested");
    std::fs::create_dir_all(&nested).unwrap();

    let root = BuildRoot::find_from(&nested).unwrap();
    assert_eq!(root.as_path(), dir.path());
}

#[test]
fn build_root_not_found() {
    let dir = tempfile::TempDir::new().unwrap();
    // No sentinel anywhere under a fresh temp dir; the search should sooner or later run out of
    // ancestors. (If a sentinel exists above the temp dir on this host, the search legitimately
    // finds it, so only assert when the walk fails.)
    if let Err(err) = BuildRoot::find_from(dir.path()) {
        assert!(err.contains("build root"), "unexpected error: {err}");
    }
}

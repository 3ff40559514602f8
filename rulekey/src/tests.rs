// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use build_graph::{ActionGraph, BuildRule, TargetLabel};
use cells::{CellIndex, CellIndexer};
use hashcache::{DiskHashCache, HashCache, RecordingHashCache};
use task_executor::Executor;

use crate::{RuleKeyComputer, RuleKeyFactories};

fn rule(label: &str, srcs: &[&str], deps: &[&str]) -> BuildRule {
    BuildRule {
        label: TargetLabel::parse(label).unwrap(),
        rule_type: "genrule".to_owned(),
        cell: CellIndex::root(),
        srcs: srcs.iter().map(|s| s.to_string()).collect(),
        outputs: vec![],
        env: BTreeMap::new(),
        cmd: None,
        deps: deps.iter().map(|d| TargetLabel::parse(d).unwrap()).collect(),
        cacheable: true,
    }
}

fn computer(root: &Path, seed: &str) -> (RuleKeyComputer, Arc<HashCache>) {
    let cells = Arc::new(CellIndexer::new(
        root.to_path_buf(),
        BTreeMap::new(),
        vec![],
    ));
    let cache = Arc::new(HashCache::Recording(RecordingHashCache::new(
        DiskHashCache::new(),
        cells.clone(),
    )));
    let factories = Arc::new(RuleKeyFactories::new(seed.to_owned(), cells));
    (
        RuleKeyComputer::new(Executor::new(), factories, cache.clone()),
        cache,
    )
}

#[tokio::test]
async fn keys_are_deterministic_across_orderings() {
    let dir = tempfile::TempDir::new().unwrap();
    fs::write(dir.path().join("a.c"), "aaa").unwrap();
    fs::write(dir.path().join("b.c"), "bbb").unwrap();

    let rules = vec![
        rule("//x:a", &["a.c"], &[]),
        rule("//x:b", &["b.c"], &["//x:a"]),
        rule("//x:c", &["a.c", "b.c"], &["//x:a", "//x:b"]),
    ];
    let forward = ActionGraph::new(rules.clone()).unwrap();
    let reversed = ActionGraph::new(rules.into_iter().rev().collect()).unwrap();

    let (computer_a, cache_a) = computer(dir.path(), "seed");
    let (computer_b, cache_b) = computer(dir.path(), "seed");
    let keys_a = computer_a.compute(&forward).await.unwrap();
    let keys_b = computer_b.compute(&reversed).await.unwrap();

    assert_eq!(keys_a, keys_b);

    // The recorded (cell, path, hash) triples are identical regardless of computation order.
    let recorded = |cache: &HashCache| match cache {
        HashCache::Recording(recording) => {
            let mut triples: Vec<(u32, String, String)> = recording
                .recorded()
                .into_iter()
                .flat_map(|(cell, entries)| {
                    entries
                        .into_iter()
                        .map(move |e| (cell.0, e.path, e.hash.hash.to_hex()))
                })
                .collect();
            triples.sort();
            triples
        }
        _ => panic!("expected the recording variant"),
    };
    assert_eq!(recorded(&cache_a), recorded(&cache_b));
}

#[tokio::test]
async fn leaf_file_change_invalidates_transitive_dependents() {
    let dir = tempfile::TempDir::new().unwrap();
    fs::write(dir.path().join("leaf.c"), "v1").unwrap();

    // Only the leaf reads a file; the middle and root rules have no srcs of their own, so any
    // change to their keys can only arrive through their deps' keys.
    let graph = ActionGraph::new(vec![
        rule("//x:leaf", &["leaf.c"], &[]),
        rule("//x:mid", &[], &["//x:leaf"]),
        rule("//x:root", &[], &["//x:mid"]),
    ])
    .unwrap();

    let (computer_before, _) = computer(dir.path(), "seed");
    let before = computer_before.compute(&graph).await.unwrap();

    fs::write(dir.path().join("leaf.c"), "v2").unwrap();
    let (computer_after, _) = computer(dir.path(), "seed");
    let after = computer_after.compute(&graph).await.unwrap();

    for name in ["//x:leaf", "//x:mid", "//x:root"] {
        let label = TargetLabel::parse(name).unwrap();
        assert_ne!(before[&label], after[&label], "{name} kept a stale key");
    }
}

#[tokio::test]
async fn dependency_cycle_is_an_error() {
    let dir = tempfile::TempDir::new().unwrap();
    let graph = ActionGraph::new(vec![
        rule("//x:a", &[], &["//x:b"]),
        rule("//x:b", &[], &["//x:a"]),
    ])
    .unwrap();

    let (computer, _) = computer(dir.path(), "seed");
    let err = computer.compute(&graph).await.unwrap_err();
    assert!(err.contains("cycle"), "unexpected error: {err}");
}

#[tokio::test]
async fn key_depends_on_file_contents() {
    let dir = tempfile::TempDir::new().unwrap();
    fs::write(dir.path().join("a.c"), "aaa").unwrap();
    let graph = ActionGraph::new(vec![rule("//x:a", &["a.c"], &[])]).unwrap();

    let (computer_a, _) = computer(dir.path(), "seed");
    let before = computer_a.compute(&graph).await.unwrap();

    fs::write(dir.path().join("a.c"), "changed").unwrap();
    let (computer_b, _) = computer(dir.path(), "seed");
    let after = computer_b.compute(&graph).await.unwrap();

    let label = TargetLabel::parse("//x:a").unwrap();
    assert_ne!(before[&label], after[&label]);
}

#[tokio::test]
async fn key_depends_on_seed() {
    let dir = tempfile::TempDir::new().unwrap();
    fs::write(dir.path().join("a.c"), "aaa").unwrap();
    let graph = ActionGraph::new(vec![rule("//x:a", &["a.c"], &[])]).unwrap();

    let (computer_a, _) = computer(dir.path(), "seed-one");
    let (computer_b, _) = computer(dir.path(), "seed-two");
    let label = TargetLabel::parse("//x:a").unwrap();
    assert_ne!(
        computer_a.compute(&graph).await.unwrap()[&label],
        computer_b.compute(&graph).await.unwrap()[&label]
    );
}

#[tokio::test]
async fn missing_src_aborts_computation() {
    let dir = tempfile::TempDir::new().unwrap();
    fs::write(dir.path().join("a.c"), "aaa").unwrap();

    let graph = ActionGraph::new(vec![
        rule("//x:a", &["a.c"], &[]),
        rule("//x:b", &["missing.c"], &[]),
    ])
    .unwrap();

    let (computer, _) = computer(dir.path(), "seed");
    computer
        .compute(&graph)
        .await
        .expect_err("a per-rule failure should abort the whole computation");
}

#[tokio::test]
async fn factory_for_unknown_cell_is_an_error() {
    let dir = tempfile::TempDir::new().unwrap();
    let cells = Arc::new(CellIndexer::new(
        dir.path().to_path_buf(),
        BTreeMap::new(),
        vec![],
    ));
    let factories = RuleKeyFactories::new("seed".to_owned(), cells);

    assert!(factories.for_cell(CellIndex::root()).is_ok());
    factories
        .for_cell(CellIndex(7))
        .expect_err("cell 7 was never indexed");
}

// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use build_graph::{RawTargetNode, TargetGraph, TargetLabel};
use cells::CellIndexer;
use hashcache::{DiskHashCache, RecordingHashCache};
use hashing::Digest;

use crate::{ClientVersion, JobState, StateSerializer, COMMIT_ENV_VAR};

fn graph(labels: &[&str]) -> TargetGraph {
    TargetGraph::new(
        labels
            .iter()
            .map(|l| RawTargetNode {
                label: TargetLabel::parse(l).unwrap(),
                data: l.as_bytes().to_vec(),
            })
            .collect(),
    )
}

fn serializer_for(root: &Path) -> (StateSerializer, RecordingHashCache) {
    let cells = Arc::new(CellIndexer::new(
        root.to_path_buf(),
        BTreeMap::new(),
        vec![],
    ));
    let recording = RecordingHashCache::new(DiskHashCache::new(), cells.clone());
    (
        StateSerializer::new(cells, ClientVersion::Git("deadbeef".to_owned())),
        recording,
    )
}

#[test]
fn job_state_round_trips() {
    let dir = tempfile::TempDir::new().unwrap();
    fs::write(dir.path().join("a.c"), "aaa").unwrap();

    let (serializer, recording) = serializer_for(dir.path());
    recording.hash(&dir.path().join("a.c")).unwrap();

    let target_graph = graph(&["//x:a", "//x:b"]);
    let state = serializer
        .serialize(
            &target_graph,
            &[TargetLabel::parse("//x:a").unwrap()],
            &recording,
            false,
        )
        .unwrap();

    let bytes = state.to_bytes().unwrap();
    assert_eq!(JobState::from_bytes(&bytes).unwrap(), state);
}

#[test]
fn top_level_targets_must_be_nodes() {
    let dir = tempfile::TempDir::new().unwrap();
    let (serializer, recording) = serializer_for(dir.path());

    let err = serializer
        .serialize(
            &graph(&["//x:a"]),
            &[TargetLabel::parse("//x:other").unwrap()],
            &recording,
            false,
        )
        .unwrap_err();
    assert!(err.contains("//x:other"), "unexpected error: {err}");
}

#[test]
fn inline_contents_fill_entries() {
    let dir = tempfile::TempDir::new().unwrap();
    fs::write(dir.path().join("a.c"), "aaa").unwrap();

    let (serializer, recording) = serializer_for(dir.path());
    recording.hash(&dir.path().join("a.c")).unwrap();

    let state = serializer
        .serialize(&graph(&["//x:a"]), &[], &recording, true)
        .unwrap();
    let entry = &state.file_hashes[0].entries[0];
    assert_eq!(entry.contents.as_deref(), Some(b"aaa".as_slice()));
}

#[test]
fn nodes_ship_raw_bytes_in_order() {
    let dir = tempfile::TempDir::new().unwrap();
    let (serializer, recording) = serializer_for(dir.path());

    let state = serializer
        .serialize(&graph(&["//x:a", "//x:b", "//x:c"]), &[], &recording, false)
        .unwrap();
    let names: Vec<String> = state
        .target_graph_nodes
        .iter()
        .map(|n| n.label.to_string())
        .collect();
    assert_eq!(names, vec!["//x:a", "//x:b", "//x:c"]);
    assert_eq!(state.target_graph_nodes[0].data, b"//x:a".to_vec());
}

#[test]
fn version_of_binary_hashes_contents() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("client-bin");
    fs::write(&path, b"binary bytes").unwrap();

    assert_eq!(
        ClientVersion::of_binary(&path).unwrap(),
        ClientVersion::Binary(Digest::of_bytes(b"binary bytes"))
    );
}

#[test]
fn version_of_binary_rejects_directories() {
    let dir = tempfile::TempDir::new().unwrap();
    ClientVersion::of_binary(dir.path()).expect_err("a directory is not a client binary");
}

#[test]
fn version_of_missing_binary_is_an_error() {
    ClientVersion::of_binary(Path::new("/does/not/exist"))
        .expect_err("a missing client binary should error");
}

#[test]
fn version_from_env_error_is_actionable() {
    // NB: Do not mutate the process environment here: other tests run concurrently in this
    // process. The unset case is exercised by asserting on the error text contract instead.
    if std::env::var(COMMIT_ENV_VAR).is_err() {
        let err = ClientVersion::from_env().unwrap_err();
        assert!(err.contains(COMMIT_ENV_VAR), "unexpected error: {err}");
        assert!(err.contains("--client-binary"), "unexpected error: {err}");
    }
}

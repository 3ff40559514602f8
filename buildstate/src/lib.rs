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

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::env;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use build_graph::{RawTargetNode, TargetGraph, TargetLabel};
use cells::{CellIndex, CellIndexer};
use hashcache::{wire_path, FileHashEntry, RecordingHashCache};
use hashing::Digest;

///
/// The environment variable carrying the commit the client binary was built from. Read once at
/// startup; the derived version tag is passed down the call chain as a value.
///
pub const COMMIT_ENV_VAR: &str = "STAMPEDE_COMMIT";

///
/// Identifies the client version the remote must run: either the commit the client was built
/// from, or the content hash of an explicitly supplied client binary.
///
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum ClientVersion {
    Git(String),
    Binary(Digest),
}

impl ClientVersion {
    pub fn from_env() -> Result<ClientVersion, String> {
        match env::var(COMMIT_ENV_VAR) {
            Ok(commit) if !commit.is_empty() => Ok(ClientVersion::Git(commit)),
            _ => Err(format!(
                "Cannot determine the client version: {COMMIT_ENV_VAR} is not set. Either run a \
                release build, or pass an explicit client binary with --client-binary."
            )),
        }
    }

    pub fn of_binary(path: &Path) -> Result<ClientVersion, String> {
        let metadata = path
            .metadata()
            .map_err(|e| format!("Cannot read client binary {}: {e}", path.display()))?;
        if !metadata.is_file() {
            return Err(format!(
                "Client binary {} is not a regular file.",
                path.display()
            ));
        }
        let digest = Digest::of_file(path)
            .map_err(|e| format!("Failed to hash client binary {}: {e}", path.display()))?;
        Ok(ClientVersion::Binary(digest))
    }
}

///
/// One row of the serialized cell table.
///
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CellInfo {
    pub index: CellIndex,
    pub name: Option<String>,
    /// The cell root as seen on the client, canonical separators. The remote re-roots cells in
    /// its own checkout; this value is informational.
    pub root: String,
    pub config_overrides: BTreeMap<String, String>,
}

///
/// The recorded hash table of one cell.
///
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CellFileHashes {
    pub cell_index: CellIndex,
    pub entries: Vec<FileHashEntry>,
}

///
/// The portable job descriptor submitted to the remote coordinator: everything the remote needs
/// to reconstruct the action graph and replay the client's file hashes. Created once per
/// invocation and frozen after serialization.
///
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    pub cells: Vec<CellInfo>,
    pub target_graph_nodes: Vec<RawTargetNode>,
    pub top_level_targets: Vec<String>,
    pub file_hashes: Vec<CellFileHashes>,
    pub client_version: ClientVersion,
}

impl JobState {
    pub fn to_bytes(&self) -> Result<Vec<u8>, String> {
        bincode::serialize(self).map_err(|e| format!("Failed to serialize job state: {e}"))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<JobState, String> {
        bincode::deserialize(bytes).map_err(|e| format!("Failed to deserialize job state: {e}"))
    }
}

///
/// Assembles a JobState from the invocation's cell table, target graph and recorded hashes.
///
pub struct StateSerializer {
    cells: Arc<CellIndexer>,
    version: ClientVersion,
}

impl StateSerializer {
    pub fn new(cells: Arc<CellIndexer>, version: ClientVersion) -> StateSerializer {
        StateSerializer { cells, version }
    }

    ///
    /// Build the JobState. Must run only after rule-key computation has finished: the recorded
    /// hash tables keep filling until then.
    ///
    /// When `inline_contents` is set, every recorded file's bytes are loaded into its entry
    /// first, producing a self-contained state dump.
    ///
    pub fn serialize(
        &self,
        target_graph: &TargetGraph,
        top_level_targets: &[TargetLabel],
        recording: &RecordingHashCache,
        inline_contents: bool,
    ) -> Result<JobState, String> {
        let node_names: HashSet<String> =
            target_graph.nodes().map(|n| n.label.to_string()).collect();
        for target in top_level_targets {
            if !node_names.contains(&target.to_string()) {
                return Err(format!(
                    "Top-level target {target} is not a node of the target graph."
                ));
            }
        }

        if inline_contents {
            recording.fill_contents()?;
        }

        let cells = self
            .cells
            .enumerate()
            .into_iter()
            .map(|cell| CellInfo {
                index: cell.index,
                name: cell.name,
                root: wire_path(&cell.root),
                config_overrides: cell.config_overrides,
            })
            .collect::<Vec<_>>();
        let known_cells: HashSet<CellIndex> = cells.iter().map(|c| c.index).collect();

        let file_hashes = recording
            .recorded()
            .into_iter()
            .map(|(cell_index, entries)| {
                if !known_cells.contains(&cell_index) {
                    return Err(format!(
                        "Recorded hashes reference cell {cell_index}, which is not in the cell \
                        table."
                    ));
                }
                Ok(CellFileHashes {
                    cell_index,
                    entries,
                })
            })
            .collect::<Result<Vec<_>, String>>()?;

        Ok(JobState {
            cells,
            target_graph_nodes: target_graph.nodes().cloned().collect(),
            top_level_targets: top_level_targets
                .iter()
                .map(TargetLabel::to_string)
                .collect(),
            file_hashes,
            client_version: self.version.clone(),
        })
    }
}

#[cfg(test)]
mod tests;

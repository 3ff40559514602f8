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
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};

use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

///
/// The stable small integer assigned to a cell root for one invocation. Serialized state refers
/// to cells exclusively by index, so indices must be assigned identically on every traversal of
/// the same graph: first-seen order, root cell always 0.
///
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct CellIndex(pub u32);

impl CellIndex {
    pub fn root() -> CellIndex {
        CellIndex(0)
    }
}

impl fmt::Display for CellIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

///
/// An independently-rooted source tree. One invocation may span several cells sharing a repo.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Cell {
    pub index: CellIndex,
    pub name: Option<String>,
    pub root: PathBuf,
    pub config_overrides: BTreeMap<String, String>,
}

///
/// The root cell's directory, located by walking ancestors of the working directory for a
/// sentinel file.
///
#[derive(Debug)]
pub struct BuildRoot(PathBuf);

impl BuildRoot {
    const SENTINEL_FILES: &'static [&'static str] = &["stampede.toml", "STAMPEDE_ROOT"];

    pub fn find() -> Result<BuildRoot, String> {
        let cwd = env::current_dir().map_err(|e| format!("Failed to determine $CWD: {e}"))?;
        Self::find_from(&cwd)
    }

    pub fn find_from(start: &Path) -> Result<BuildRoot, String> {
        let mut build_root = start.to_path_buf();
        loop {
            for sentinel in Self::SENTINEL_FILES {
                let sentinel_path = build_root.join(sentinel);
                if !sentinel_path.exists() {
                    continue;
                }
                let sentinel_path_metadata = sentinel_path.metadata().map_err(|e| {
                    format!(
                        "Failed to read metadata for {path} to determine if is a build root \
                        sentinel file: {err}",
                        path = sentinel_path.display(),
                        err = e
                    )
                })?;
                if sentinel_path_metadata.is_file() {
                    let root = BuildRoot(build_root);
                    debug!("Found {:?} starting search from {}.", root, start.display());
                    return Ok(root);
                }
            }

            build_root = build_root
                .parent()
                .ok_or(format!(
                    "No build root detected for {start}. The build root is detected by looking \
                    for at least one file from {sentinel_files} in the cwd and its ancestors. If \
                    you have none of these files, you can create an empty file in your build \
                    root.",
                    start = start.display(),
                    sentinel_files = Self::SENTINEL_FILES.join(", ")
                ))?
                .into();
        }
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    pub fn into_path_buf(self) -> PathBuf {
        self.0
    }
}

///
/// The result of resolving an arbitrary path against the known cell roots.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResolvedPath {
    pub cell: CellIndex,
    /// The path relative to the owning cell root.
    pub relative: PathBuf,
}

struct Indexed {
    by_root: HashMap<PathBuf, CellIndex>,
    cells: Vec<Cell>,
}

///
/// Assigns cell indices with first-seen semantics and resolves paths back to their owning cell.
///
/// The set of candidate cell roots is fixed at construction (it comes from configuration), but
/// indices are only assigned as roots are actually encountered during rule traversal, so that
/// the serialized cell table contains exactly the cells the build touches.
///
pub struct CellIndexer {
    // Candidate (name, root) pairs beyond the root cell, from configuration.
    candidates: Vec<(Option<String>, PathBuf)>,
    inner: Mutex<Indexed>,
}

impl CellIndexer {
    ///
    /// Create an indexer. The root cell is assigned index 0 eagerly: every invocation touches
    /// it, and downstream consumers depend on index 0 meaning the root.
    ///
    pub fn new(
        root: PathBuf,
        root_config_overrides: BTreeMap<String, String>,
        candidates: Vec<(Option<String>, PathBuf)>,
    ) -> CellIndexer {
        let root_cell = Cell {
            index: CellIndex::root(),
            name: None,
            root: root.clone(),
            config_overrides: root_config_overrides,
        };
        let mut by_root = HashMap::new();
        by_root.insert(root, CellIndex::root());
        CellIndexer {
            candidates,
            inner: Mutex::new(Indexed {
                by_root,
                cells: vec![root_cell],
            }),
        }
    }

    ///
    /// Return the index for the cell owning `path`, assigning the next index if this is the
    /// first sighting of that cell. Idempotent.
    ///
    pub fn index_of(&self, path: &Path) -> Result<CellIndex, String> {
        self.resolve(path).map(|resolved| resolved.cell)
    }

    ///
    /// Resolve `path` to its owning cell and cell-relative remainder. The longest matching root
    /// wins, so nested cells shadow their enclosing cell.
    ///
    pub fn resolve(&self, path: &Path) -> Result<ResolvedPath, String> {
        let mut inner = self.inner.lock();

        let mut best: Option<(Option<String>, PathBuf)> = None;
        let known = inner
            .cells
            .iter()
            .map(|c| (c.name.clone(), c.root.clone()))
            .chain(self.candidates.iter().cloned());
        for (name, root) in known {
            if path.starts_with(&root) {
                let better = match &best {
                    Some((_, best_root)) => root.as_os_str().len() > best_root.as_os_str().len(),
                    None => true,
                };
                if better {
                    best = Some((name, root));
                }
            }
        }

        let (name, root) = best.ok_or_else(|| {
            format!(
                "Path {} is not within any known cell root.",
                path.display()
            )
        })?;
        let relative = path
            .strip_prefix(&root)
            .expect("starts_with checked above")
            .to_path_buf();

        let cell = match inner.by_root.get(&root) {
            Some(index) => *index,
            None => {
                // First sighting: assign the next index under the same lock that guards the
                // table, so indices are dense and collision-free under concurrent resolution.
                let index = CellIndex(inner.cells.len() as u32);
                inner.by_root.insert(root.clone(), index);
                inner.cells.push(Cell {
                    index,
                    name,
                    root,
                    config_overrides: BTreeMap::new(),
                });
                index
            }
        };
        Ok(ResolvedPath { cell, relative })
    }

    ///
    /// All cells seen so far, in index order.
    ///
    pub fn enumerate(&self) -> Vec<Cell> {
        self.inner.lock().cells.clone()
    }

    ///
    /// The cell previously assigned `index`, if any.
    ///
    pub fn get(&self, index: CellIndex) -> Option<Cell> {
        self.inner.lock().cells.get(index.0 as usize).cloned()
    }
}

#[cfg(test)]
mod tests;

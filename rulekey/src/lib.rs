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

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use futures::future;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use build_graph::{ActionGraph, BuildRule, TargetLabel};
use cells::{CellIndex, CellIndexer};
use hashcache::HashCache;
use hashing::{Fingerprint, Hasher};
use task_executor::Executor;

///
/// The content-addressed fingerprint of a rule's inputs. Two rules with identical fields,
/// identical referenced file hashes and an identical seed produce byte-identical keys on any
/// host; identical keys imply identical outputs.
///
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct RuleKey(pub Fingerprint);

impl fmt::Display for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

///
/// Computes keys for the rules of one cell. Holds the cell's root (for resolving the rule's
/// `srcs`) so that rules themselves only need to carry their cell index.
///
#[derive(Debug)]
pub struct RuleKeyFactory {
    seed: String,
    cell_root: PathBuf,
}

impl RuleKeyFactory {
    fn new(seed: String, cell_root: PathBuf) -> RuleKeyFactory {
        RuleKeyFactory { seed, cell_root }
    }

    ///
    /// Fold the rule's fields, its deps' already-computed keys, and each referenced file's
    /// digest into the key. Every field is written through a length-tagged hasher, so adjacent
    /// fields cannot alias.
    ///
    /// Folding in dep keys (not dep names) is what makes invalidation transitive: a content
    /// change anywhere below a rule changes that rule's key too.
    ///
    pub fn compute(
        &self,
        rule: &BuildRule,
        dep_keys: &[(TargetLabel, RuleKey)],
        cache: &HashCache,
    ) -> Result<RuleKey, String> {
        let mut hasher = Hasher::new();
        hasher.update(self.seed.as_bytes());
        hasher.update(rule.label.to_string().as_bytes());
        hasher.update(rule.rule_type.as_bytes());
        for output in &rule.outputs {
            hasher.update(output.as_bytes());
        }
        for (key, value) in &rule.env {
            hasher.update(key.as_bytes());
            hasher.update(value.as_bytes());
        }
        if let Some(cmd) = &rule.cmd {
            hasher.update(cmd.as_bytes());
        }
        for (label, key) in dep_keys {
            hasher.update(label.to_string().as_bytes());
            hasher.update(key.0.as_bytes());
        }
        for src in &rule.srcs {
            let digest = cache.hash(&self.cell_root.join(src))?;
            hasher.update(src.as_bytes());
            hasher.update(digest.hash.as_bytes());
        }
        Ok(RuleKey(hasher.finish()))
    }
}

///
/// The arena of per-cell factories, built lazily as cells are encountered. Keyed by cell index
/// rather than holding back-pointers from rules to cells.
///
pub struct RuleKeyFactories {
    seed: String,
    cells: Arc<CellIndexer>,
    factories: Mutex<HashMap<CellIndex, Arc<RuleKeyFactory>>>,
}

impl RuleKeyFactories {
    pub fn new(seed: String, cells: Arc<CellIndexer>) -> RuleKeyFactories {
        RuleKeyFactories {
            seed,
            cells,
            factories: Mutex::new(HashMap::new()),
        }
    }

    pub fn for_cell(&self, cell: CellIndex) -> Result<Arc<RuleKeyFactory>, String> {
        let mut factories = self.factories.lock();
        if let Some(factory) = factories.get(&cell) {
            return Ok(factory.clone());
        }
        let root = self
            .cells
            .get(cell)
            .ok_or_else(|| format!("Rule references cell {cell}, which was never indexed."))?
            .root;
        let factory = Arc::new(RuleKeyFactory::new(self.seed.clone(), root));
        factories.insert(cell, factory.clone());
        Ok(factory)
    }
}

///
/// Computes a key for every rule of an action graph on the CPU pool.
///
/// All file reads flow through the given HashCache: when that cache is the recording variant,
/// completing this computation is what makes the serialized file-hash tables complete, so state
/// serialization must not snapshot them before `compute` returns.
///
pub struct RuleKeyComputer {
    executor: Executor,
    factories: Arc<RuleKeyFactories>,
    cache: Arc<HashCache>,
}

impl RuleKeyComputer {
    pub fn new(
        executor: Executor,
        factories: Arc<RuleKeyFactories>,
        cache: Arc<HashCache>,
    ) -> RuleKeyComputer {
        RuleKeyComputer {
            executor,
            factories,
            cache,
        }
    }

    ///
    /// Compute keys for every rule in the graph. Rules are keyed wave by wave in dependency
    /// order (a rule's key folds in its deps' keys, so deps must be keyed first); the rules
    /// within one wave are independent and run in parallel on the pool. Any per-rule failure
    /// aborts the whole computation; partial results are discarded.
    ///
    pub async fn compute(
        &self,
        graph: &ActionGraph,
    ) -> Result<HashMap<TargetLabel, RuleKey>, String> {
        let mut keys: HashMap<TargetLabel, RuleKey> = HashMap::new();
        for wave in dependency_waves(graph)? {
            let computations = wave
                .into_iter()
                .map(|label| {
                    let rule = graph
                        .get(&label)
                        .cloned()
                        .ok_or_else(|| format!("{label} is not a rule of the action graph."))?;
                    let mut dep_labels = rule.deps.clone();
                    dep_labels.sort();
                    let dep_keys = dep_labels
                        .into_iter()
                        .map(|dep| match keys.get(&dep) {
                            Some(key) => Ok((dep, *key)),
                            None => Err(format!("Dep {dep} of {label} was not keyed first.")),
                        })
                        .collect::<Result<Vec<_>, String>>()?;
                    let factories = self.factories.clone();
                    let cache = self.cache.clone();
                    Ok(self.executor.spawn_blocking(
                        move || {
                            let factory = factories.for_cell(rule.cell)?;
                            let key = factory.compute(&rule, &dep_keys, &cache)?;
                            Ok::<_, String>((rule.label.clone(), key))
                        },
                        |join_error| Err(format!("Rule key computation task failed: {join_error}")),
                    ))
                })
                .collect::<Result<Vec<_>, String>>()?;
            for (label, key) in future::try_join_all(computations).await? {
                keys.insert(label, key);
            }
        }
        Ok(keys)
    }
}

///
/// Group the graph's rules into waves: every rule of a wave depends only on rules of earlier
/// waves. A graph with a dependency cycle has rules that never become ready, which is an error.
///
fn dependency_waves(graph: &ActionGraph) -> Result<Vec<Vec<TargetLabel>>, String> {
    let mut remaining_deps: HashMap<TargetLabel, usize> = HashMap::new();
    let mut dependents: HashMap<TargetLabel, Vec<TargetLabel>> = HashMap::new();
    for rule in graph.rules() {
        remaining_deps.insert(rule.label.clone(), rule.deps.len());
        for dep in &rule.deps {
            dependents
                .entry(dep.clone())
                .or_default()
                .push(rule.label.clone());
        }
    }

    let mut current: Vec<TargetLabel> = graph
        .rules()
        .filter(|rule| rule.deps.is_empty())
        .map(|rule| rule.label.clone())
        .collect();
    let mut waves = Vec::new();
    let mut ready_count = 0;
    while !current.is_empty() {
        ready_count += current.len();
        let mut next = Vec::new();
        for label in &current {
            for dependent in dependents.remove(label).unwrap_or_default() {
                let remaining = remaining_deps.get_mut(&dependent).ok_or_else(|| {
                    format!("Unknown rule {dependent} in the action graph.")
                })?;
                *remaining -= 1;
                if *remaining == 0 {
                    next.push(dependent);
                }
            }
        }
        waves.push(current);
        current = next;
    }
    if ready_count != graph.len() {
        return Err("The action graph contains a dependency cycle.".to_owned());
    }
    Ok(waves)
}

#[cfg(test)]
mod tests;

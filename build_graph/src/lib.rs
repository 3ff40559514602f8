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
use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use cells::CellIndex;

mod target;
pub use crate::target::{parse_target_pattern, TargetLabel, TargetPattern, Wildcard};

///
/// One node of the target graph, rendered exactly as the build file parser produced it.
///
/// The node payload is kept as opaque bytes: the remote service performs its own version
/// resolution, so the client must ship nodes pre-versioning and unmodified.
///
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RawTargetNode {
    pub label: TargetLabel,
    pub data: Vec<u8>,
}

///
/// The graph the Parser collaborator produces for the requested target patterns. Nodes are held
/// in first-parsed order so that serialized state is reproducible for a given invocation.
///
#[derive(Clone, Debug, Default)]
pub struct TargetGraph {
    nodes: IndexMap<TargetLabel, RawTargetNode>,
}

impl TargetGraph {
    pub fn new(nodes: Vec<RawTargetNode>) -> TargetGraph {
        TargetGraph {
            nodes: nodes.into_iter().map(|n| (n.label.clone(), n)).collect(),
        }
    }

    pub fn contains(&self, label: &TargetLabel) -> bool {
        self.nodes.contains_key(label)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &RawTargetNode> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }
}

///
/// An executable rule of the action graph.
///
/// Rules carry the index of their owning cell rather than a handle to it: the per-cell rule-key
/// factories live in an arena keyed by `CellIndex`, which keeps the rule/cell/factory triangle
/// acyclic.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BuildRule {
    pub label: TargetLabel,
    pub rule_type: String,
    pub cell: CellIndex,
    /// Input files, relative to the owning cell root.
    pub srcs: Vec<String>,
    /// Output paths, relative to the owning cell root. Rules with no outputs cannot satisfy
    /// `--out`.
    pub outputs: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// The command producing the outputs, for rule types that carry one.
    pub cmd: Option<String>,
    pub deps: Vec<TargetLabel>,
    /// Whether the rule's outputs may be served from the remote cache. Non-cacheable rules are
    /// always built locally.
    pub cacheable: bool,
}

impl fmt::Display for BuildRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.label, self.rule_type)
    }
}

///
/// The DAG of BuildRules lowered from a TargetGraph by the ActionGraphCache collaborator.
///
#[derive(Clone, Debug, Default)]
pub struct ActionGraph {
    rules: IndexMap<TargetLabel, BuildRule>,
}

impl ActionGraph {
    ///
    /// Assemble an ActionGraph, validating that every dep edge lands on a rule in the graph.
    ///
    pub fn new(rules: Vec<BuildRule>) -> Result<ActionGraph, String> {
        let graph = ActionGraph {
            rules: rules.into_iter().map(|r| (r.label.clone(), r)).collect(),
        };
        for rule in graph.rules() {
            for dep in &rule.deps {
                if !graph.rules.contains_key(dep) {
                    return Err(format!(
                        "Rule {} depends on {}, which is not in the action graph.",
                        rule.label, dep
                    ));
                }
            }
        }
        Ok(graph)
    }

    pub fn get(&self, label: &TargetLabel) -> Option<&BuildRule> {
        self.rules.get(label)
    }

    pub fn rules(&self) -> impl Iterator<Item = &BuildRule> {
        self.rules.values()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }
}

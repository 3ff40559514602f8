// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::sync::Arc;

use build_graph::ActionGraph;
use build_graph::TargetLabel;
use remote_sync::RemoteSynchronizer;
use rulekey::RuleKey;

///
/// How much of the graph the local build materializes.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LocalBuildMode {
    /// Materialize every transitive output.
    Deep,
    /// Materialize only the top-level outputs.
    Shallow,
    /// Build only what is needed to populate the cache; materialize nothing.
    PopulateCache,
}

///
/// The work order handed to the local execution engine.
///
/// When a synchronizer is present, the engine must wait on it before building any cacheable
/// rule: a key signalled Available is fetched from the cache, NotBuilt falls back to local
/// execution, Cancelled aborts the rule.
///
pub struct LocalBuildRequest {
    pub graph: ActionGraph,
    pub rule_keys: HashMap<TargetLabel, RuleKey>,
    pub synchronizer: Option<RemoteSynchronizer>,
    pub mode: LocalBuildMode,
    pub keep_going: bool,
}

///
/// A handle to one in-flight local build.
///
#[async_trait::async_trait]
pub trait Build: Send + Sync {
    ///
    /// Execute the build to completion and return its exit code. Called exactly once.
    ///
    async fn run(&self) -> i32;

    ///
    /// Ask the engine to stop as soon as its currently-running rules finish, failing the build
    /// with `cause`. Idempotent; may be called before, during or after `run`.
    ///
    fn terminate_with_failure(&self, cause: &str);
}

///
/// The low-level execution engine that actually runs rules. Out of scope for the coordinator:
/// implementations schedule rules however they like, subject to the LocalBuildRequest contract.
///
#[async_trait::async_trait]
pub trait LocalBuildExecutor: Send + Sync {
    ///
    /// Construct a Build handle for the request. Cheap, and must not start executing rules: the
    /// orchestrator needs the handle early so a failing remote build can terminate the local
    /// one before it finishes naturally.
    ///
    async fn create_build(&self, request: LocalBuildRequest) -> Result<Arc<dyn Build>, String>;
}

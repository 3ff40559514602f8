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

use std::path::PathBuf;
use std::time::Duration;

use build_graph::{TargetGraph, TargetLabel, TargetPattern};
use remote::BuildRequest;

mod analysis;
mod latch;
mod local;
mod orchestrator;

pub use crate::analysis::{write_build_report, write_rule_key_log};
pub use crate::latch::AsyncLatch;
pub use crate::local::{Build, LocalBuildExecutor, LocalBuildMode, LocalBuildRequest};
pub use crate::orchestrator::HybridOrchestrator;

/// The intermediate exit code reported when the local half of a build fails.
pub const LOCAL_STEP_FAILED_EXIT_CODE: i32 = 2;

///
/// The process exit codes of the build command.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExitCode {
    Success,
    BuildError,
    ParseError,
    CommandlineError,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        match self {
            ExitCode::Success => 0,
            ExitCode::BuildError => 1,
            ExitCode::ParseError => 2,
            ExitCode::CommandlineError => 3,
        }
    }
}

///
/// Target-pattern parsing and target-graph construction. Produces the raw (pre-versioning)
/// graph plus the top-level targets the patterns expanded to.
///
pub trait TargetGraphParser: Send + Sync {
    fn parse(
        &self,
        patterns: &[TargetPattern],
    ) -> Result<(TargetGraph, Vec<TargetLabel>), String>;
}

///
/// Lowers a target graph into the action graph of executable rules.
///
pub trait ActionGraphLowerer: Send + Sync {
    fn lower(
        &self,
        target_graph: &TargetGraph,
        top_level_targets: &[TargetLabel],
    ) -> Result<build_graph::ActionGraph, String>;
}

///
/// Everything the orchestrator needs to know about one build invocation beyond the target
/// patterns themselves. Assembled by the command line layer.
///
#[derive(Clone, Debug)]
pub struct BuildOptions {
    pub distributed: bool,
    /// Let the local build complete even if the remote build failed, building NotBuilt rules
    /// locally.
    pub fallback_enabled: bool,
    pub keep_going: bool,
    pub local_mode: LocalBuildMode,
    pub just_build: Option<TargetLabel>,
    pub out: Option<PathBuf>,
    /// When set: dump the inlined job state to this path and exit without contacting the
    /// remote service.
    pub state_dump_path: Option<PathBuf>,
    pub rule_key_seed: String,
    pub rulekeys_log_path: Option<PathBuf>,
    pub build_report: Option<PathBuf>,
    /// Maintain `last/<target-basename>` output links under the output root.
    pub last_links: bool,
    pub log_dir: PathBuf,
    pub output_root: PathBuf,
    pub poll_interval: Duration,
    pub remote_deadline: Duration,
    pub max_wait_for_logs: Duration,
    pub request: BuildRequest,
}

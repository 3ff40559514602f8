// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;

use build_graph::{parse_target_pattern, TargetLabel, TargetPattern};
use coordinator::{BuildOptions, LocalBuildMode};
use remote::{BuildMode, BuildRequest};

use crate::config::Config;

///
/// Builds the specified targets, locally or together with the remote build service.
///
#[derive(Debug, Parser)]
#[command(name = "stampede")]
pub struct BuildArgs {
    /// Keep going when some targets cannot be built.
    #[arg(long = "keep-going")]
    pub keep_going: bool,

    /// Write a machine-readable build report to this path.
    #[arg(long = "build-report", value_name = "PATH")]
    pub build_report: Option<PathBuf>,

    /// Build only the given target, which must be part of the requested graph.
    #[arg(long = "just-build", value_name = "TARGET")]
    pub just_build: Option<String>,

    /// Materialize every transitive output.
    #[arg(long, conflicts_with_all = ["shallow", "populate_cache"])]
    pub deep: bool,

    /// Materialize only the top-level outputs.
    #[arg(long, conflicts_with = "populate_cache")]
    pub shallow: bool,

    /// Build without materializing outputs, to warm the caches.
    #[arg(long = "populate-cache")]
    pub populate_cache: bool,

    /// Copy the single requested target's output to this path.
    #[arg(long, value_name = "PATH")]
    pub out: Option<PathBuf>,

    /// Report output paths absolute instead of relative to the build root.
    #[arg(long = "report-absolute-paths")]
    pub report_absolute_paths: bool,

    /// Print the output paths of the built targets.
    #[arg(
        long = "show-output",
        conflicts_with_all = ["show_full_output", "show_json_output", "show_full_json_output"]
    )]
    pub show_output: bool,

    /// Print the absolute output paths of the built targets.
    #[arg(
        long = "show-full-output",
        conflicts_with_all = ["show_json_output", "show_full_json_output"]
    )]
    pub show_full_output: bool,

    /// Print the output paths of the built targets as JSON.
    #[arg(long = "show-json-output", conflicts_with = "show_full_json_output")]
    pub show_json_output: bool,

    /// Print the absolute output paths of the built targets as JSON.
    #[arg(long = "show-full-json-output")]
    pub show_full_json_output: bool,

    /// Print each target's rule key alongside its output.
    #[arg(long = "show-rulekey")]
    pub show_rulekey: bool,

    /// Run the build as a hybrid local+remote build.
    #[arg(long)]
    pub distributed: bool,

    /// Identify the client by this binary's content hash instead of the release commit.
    #[arg(long = "client-binary", value_name = "PATH")]
    pub client_binary: Option<PathBuf>,

    /// Serialize the job state to this path instead of contacting the remote service.
    #[arg(long = "build-state-file", value_name = "PATH")]
    pub build_state_file: Option<PathBuf>,

    /// Log every computed rule key to this path.
    #[arg(long = "rulekeys-log-path", value_name = "PATH")]
    pub rulekeys_log_path: Option<PathBuf>,

    /// The targets to build.
    #[arg(value_name = "TARGET")]
    pub targets: Vec<String>,
}

///
/// The validated pieces of an invocation that come from the command line.
///
#[derive(Debug)]
pub struct Invocation {
    pub patterns: Vec<TargetPattern>,
    pub just_build: Option<TargetLabel>,
    pub local_mode: LocalBuildMode,
}

///
/// Validate the command line against the configuration. Every error here is a command line
/// error at the process boundary.
///
pub fn validate(args: &BuildArgs, config: &Config) -> Result<Invocation, String> {
    if args.targets.is_empty() {
        let mut message = "Zero build targets were specified.".to_owned();
        if !config.aliases.is_empty() {
            let aliases: Vec<&str> = config.aliases.keys().map(String::as_str).collect();
            message.push_str(&format!(" Try one of the aliases: {}.", aliases.join(", ")));
        }
        return Err(message);
    }

    if args.populate_cache && args.distributed {
        return Err(
            "--populate-cache cannot be combined with --distributed: the remote build populates \
            the cache itself."
                .to_owned(),
        );
    }

    if args.out.is_some() && args.targets.len() != 1 {
        return Err(format!(
            "--out requires exactly one target, but {} were specified.",
            args.targets.len()
        ));
    }

    let patterns = args
        .targets
        .iter()
        .map(|target| {
            let expanded = config.aliases.get(target).unwrap_or(target);
            parse_target_pattern(expanded)
        })
        .collect::<Result<Vec<TargetPattern>, String>>()?;

    let just_build = args
        .just_build
        .as_deref()
        .map(TargetLabel::parse)
        .transpose()?;

    let local_mode = if args.deep {
        LocalBuildMode::Deep
    } else if args.populate_cache {
        LocalBuildMode::PopulateCache
    } else {
        LocalBuildMode::Shallow
    };

    Ok(Invocation {
        patterns,
        just_build,
        local_mode,
    })
}

///
/// Merge the command line and the configuration into the orchestrator's options.
///
pub fn build_options(
    args: &BuildArgs,
    invocation: &Invocation,
    config: &Config,
    build_root: &Path,
) -> BuildOptions {
    let output_root = build_root.join("stampede-out");
    BuildOptions {
        distributed: args.distributed,
        fallback_enabled: config.stampede.enable_slow_local_build_fallback,
        keep_going: args.keep_going,
        local_mode: invocation.local_mode,
        just_build: invocation.just_build.clone(),
        out: args.out.clone(),
        state_dump_path: args.build_state_file.clone(),
        rule_key_seed: config.project.rule_key_seed.clone(),
        rulekeys_log_path: args.rulekeys_log_path.clone(),
        build_report: args.build_report.clone(),
        last_links: config.project.last_links,
        log_dir: output_root.join("log"),
        output_root,
        poll_interval: Duration::from_millis(config.stampede.poll_interval_ms),
        remote_deadline: Duration::from_secs(config.stampede.remote_deadline_secs),
        max_wait_for_logs: Duration::from_millis(config.stampede.max_wait_for_logs_ms),
        request: BuildRequest {
            mode: BuildMode::Distributed,
            minions: config.stampede.minions,
            repository: config.stampede.repository.clone(),
            tenant: config.stampede.tenant.clone(),
        },
    }
}

#[cfg(test)]
mod args_tests {
    use clap::Parser;

    use coordinator::LocalBuildMode;

    use super::{validate, BuildArgs};
    use crate::config::Config;

    fn parse(argv: &[&str]) -> BuildArgs {
        BuildArgs::try_parse_from(std::iter::once("stampede").chain(argv.iter().copied()))
            .unwrap()
    }

    fn config_with_alias() -> Config {
        let mut config = Config::default();
        config
            .aliases
            .insert("app".to_owned(), "//app:app".to_owned());
        config
    }

    #[test]
    fn zero_targets_is_an_error_with_alias_suggestions() {
        let err = validate(&parse(&[]), &config_with_alias()).unwrap_err();
        assert!(err.contains("Zero build targets"), "unexpected error: {err}");
        assert!(err.contains("app"), "unexpected error: {err}");
    }

    #[test]
    fn zero_targets_without_aliases_suggests_nothing() {
        let err = validate(&parse(&[]), &Config::default()).unwrap_err();
        assert!(!err.contains("aliases"), "unexpected error: {err}");
    }

    #[test]
    fn aliases_expand_to_their_targets() {
        let invocation = validate(&parse(&["app"]), &config_with_alias()).unwrap();
        assert_eq!(invocation.patterns[0].label.to_string(), "//app:app");
    }

    #[test]
    fn populate_cache_conflicts_with_distributed() {
        let err = validate(
            &parse(&["--populate-cache", "--distributed", "//a:a"]),
            &Config::default(),
        )
        .unwrap_err();
        assert!(err.contains("--populate-cache"), "unexpected error: {err}");
    }

    #[test]
    fn depth_flags_are_mutually_exclusive() {
        BuildArgs::try_parse_from(["stampede", "--deep", "--shallow", "//a:a"])
            .expect_err("--deep conflicts with --shallow");
        BuildArgs::try_parse_from(["stampede", "--shallow", "--populate-cache", "//a:a"])
            .expect_err("--shallow conflicts with --populate-cache");
    }

    #[test]
    fn show_flags_are_mutually_exclusive() {
        BuildArgs::try_parse_from(["stampede", "--show-output", "--show-json-output", "//a:a"])
            .expect_err("--show-output conflicts with --show-json-output");
    }

    #[test]
    fn out_requires_exactly_one_target() {
        let err = validate(
            &parse(&["--out", "/tmp/x", "//a:a", "//b:b"]),
            &Config::default(),
        )
        .unwrap_err();
        assert!(err.contains("--out"), "unexpected error: {err}");
    }

    #[test]
    fn local_mode_from_flags() {
        assert_eq!(
            validate(&parse(&["--deep", "//a:a"]), &Config::default())
                .unwrap()
                .local_mode,
            LocalBuildMode::Deep
        );
        assert_eq!(
            validate(&parse(&["//a:a"]), &Config::default())
                .unwrap()
                .local_mode,
            LocalBuildMode::Shallow
        );
        assert_eq!(
            validate(&parse(&["--populate-cache", "//a:a"]), &Config::default())
                .unwrap()
                .local_mode,
            LocalBuildMode::PopulateCache
        );
    }

    #[test]
    fn bad_pattern_is_an_error() {
        validate(&parse(&["not-a-target"]), &Config::default())
            .expect_err("patterns must contain `//`");
    }
}

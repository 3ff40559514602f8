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
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::error::ErrorKind;
use clap::Parser;

use build_graph::TargetLabel;
use buildstate::ClientVersion;
use cells::{BuildRoot, CellIndexer};
use client::args::{build_options, validate, BuildArgs, Invocation};
use client::builder::ShellBuildExecutor;
use client::config::Config;
use client::manifest::ManifestGraph;
use client::UnconfiguredCoordinatorClient;
use coordinator::{ActionGraphLowerer, ExitCode, HybridOrchestrator, TargetGraphParser};
use hashcache::{DiskHashCache, HashCache};
use rulekey::{RuleKeyComputer, RuleKeyFactories};
use stats::{ClientStatsTracker, LogEventSink};
use task_executor::Executor;

fn main() {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let exit_code = match execute() {
        Ok(exit_code) => exit_code,
        Err((exit, message)) => {
            eprintln!("{message}");
            exit.code()
        }
    };
    std::process::exit(exit_code);
}

fn execute() -> Result<i32, (ExitCode, String)> {
    let args = match BuildArgs::try_parse() {
        Ok(args) => args,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            print!("{e}");
            return Ok(ExitCode::Success.code());
        }
        Err(e) => return Err((ExitCode::CommandlineError, e.to_string())),
    };

    let build_root = BuildRoot::find()
        .map_err(|e| (ExitCode::CommandlineError, e))?
        .into_path_buf();
    let config =
        Config::load(&build_root).map_err(|e| (ExitCode::CommandlineError, e))?;
    let invocation = validate(&args, &config).map_err(|e| (ExitCode::CommandlineError, e))?;
    let options = build_options(&args, &invocation, &config, &build_root);

    // The version tag identifies this client to the remote; resolve it strictly whenever state
    // leaves the machine, leniently otherwise.
    let version = if let Some(path) = &args.client_binary {
        ClientVersion::of_binary(path).map_err(|e| (ExitCode::CommandlineError, e))?
    } else if options.distributed || options.state_dump_path.is_some() {
        ClientVersion::from_env().map_err(|e| (ExitCode::CommandlineError, e))?
    } else {
        ClientVersion::from_env().unwrap_or_else(|_| ClientVersion::Git("unreleased".to_owned()))
    };

    let cell_roots: BTreeMap<String, PathBuf> = config
        .cells
        .iter()
        .map(|(name, relative)| (name.clone(), build_root.join(relative)))
        .collect();
    let cells = Arc::new(CellIndexer::new(
        build_root.clone(),
        BTreeMap::new(),
        cell_roots
            .iter()
            .map(|(name, root)| (Some(name.clone()), root.clone()))
            .collect(),
    ));
    let manifest = Arc::new(ManifestGraph::new(
        build_root.clone(),
        cell_roots,
        cells.clone(),
    ));

    let cpu_executor = Executor::new_owned("stampede-cpu", num_cpus::get(), num_cpus::get() * 2)
        .map_err(|e| (ExitCode::BuildError, e))?;
    let scheduled_executor =
        Executor::new_owned("stampede-scheduled", 2, 4).map_err(|e| (ExitCode::BuildError, e))?;

    let orchestrator = HybridOrchestrator::new(
        manifest.clone(),
        manifest.clone(),
        Arc::new(ShellBuildExecutor::new(cells.clone())),
        Arc::new(UnconfiguredCoordinatorClient),
        cells.clone(),
        cpu_executor.clone(),
        scheduled_executor.clone(),
        Arc::new(LogEventSink),
        Arc::new(ClientStatsTracker::new()),
        version,
        options,
    );
    // Drive the invocation from the CPU pool; this thread only joins.
    let exit_code = cpu_executor.block_on(orchestrator.execute(&invocation.patterns));

    if exit_code == ExitCode::Success.code() {
        let shown = cpu_executor.block_on(show_outputs(
            &args,
            &invocation,
            &manifest,
            &build_root,
            &cells,
            &cpu_executor,
            &config,
        ));
        if let Err(e) = shown {
            eprintln!("{e}");
        }
    }

    cpu_executor.shutdown(Duration::from_secs(5));
    scheduled_executor.shutdown(Duration::from_secs(5));
    Ok(exit_code)
}

///
/// Print the requested targets' output paths per the --show-* flags.
///
async fn show_outputs(
    args: &BuildArgs,
    invocation: &Invocation,
    manifest: &Arc<ManifestGraph>,
    build_root: &Path,
    cells: &Arc<CellIndexer>,
    cpu_executor: &Executor,
    config: &Config,
) -> Result<(), String> {
    let json = args.show_json_output || args.show_full_json_output;
    let plain = args.show_output || args.show_full_output;
    if !json && !plain && !args.show_rulekey {
        return Ok(());
    }
    let absolute =
        args.show_full_output || args.show_full_json_output || args.report_absolute_paths;

    let (target_graph, top_level) = manifest.parse(&invocation.patterns)?;
    let graph = manifest.lower(&target_graph, &top_level)?;

    let rule_keys = if args.show_rulekey {
        let cache = Arc::new(HashCache::PassThrough(DiskHashCache::new()));
        let factories = Arc::new(RuleKeyFactories::new(
            config.project.rule_key_seed.clone(),
            cells.clone(),
        ));
        RuleKeyComputer::new(cpu_executor.to_borrowed(), factories, cache)
            .compute(&graph)
            .await?
    } else {
        std::collections::HashMap::new()
    };

    let rendered_path = |label: &TargetLabel| -> Option<String> {
        let rule = graph.get(label)?;
        let output = rule.outputs.first()?;
        let cell = cells.get(rule.cell)?;
        let path = cell.root.join(output);
        let path = if absolute {
            path
        } else {
            path.strip_prefix(build_root).unwrap_or(&path).to_path_buf()
        };
        Some(path.display().to_string())
    };

    if json {
        let rendered: serde_json::Map<String, serde_json::Value> = top_level
            .iter()
            .map(|label| {
                (
                    label.to_string(),
                    rendered_path(label)
                        .map(serde_json::Value::String)
                        .unwrap_or(serde_json::Value::Null),
                )
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&rendered).map_err(|e| e.to_string())?
        );
    } else {
        for label in &top_level {
            let mut line = label.to_string();
            if let Some(key) = rule_keys.get(label) {
                line.push_str(&format!(" {key}"));
            }
            if let Some(path) = rendered_path(label) {
                line.push_str(&format!(" {path}"));
            }
            println!("{line}");
        }
    }
    Ok(())
}

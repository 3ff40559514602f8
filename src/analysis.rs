// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use log::debug;

use build_graph::{ActionGraph, BuildRule, TargetLabel};
use cells::CellIndexer;
use remote::RemoteBuildOutcome;
use rulekey::RuleKey;

///
/// Write the post-build summary under the log directory. Best-effort: callers log failures and
/// move on.
///
pub(crate) fn write_build_summary(
    log_dir: &Path,
    exit_code: i32,
    rule_count: usize,
    remote_outcome: Option<&RemoteBuildOutcome>,
) -> Result<(), String> {
    let summary = serde_json::json!({
        "exit_code": exit_code,
        "rule_count": rule_count,
        "stampede_id": remote_outcome.map(|o| o.stampede_id.to_string()),
        "remote_exit_code": remote_outcome.map(|o| o.exit_code),
        "cache_miss_rule_keys": remote_outcome
            .map(|o| o.cache_miss_keys.iter().map(RuleKey::to_string).collect::<Vec<_>>())
            .unwrap_or_default(),
    });

    std::fs::create_dir_all(log_dir)
        .map_err(|e| format!("Failed to create {}: {e}", log_dir.display()))?;
    let path = log_dir.join("build_summary.json");
    std::fs::write(&path, serde_json::to_vec_pretty(&summary).map_err(|e| e.to_string())?)
        .map_err(|e| format!("Failed to write {}: {e}", path.display()))?;
    debug!("Wrote build summary to {}.", path.display());
    Ok(())
}

///
/// Write the machine-readable build report requested with --build-report.
///
pub fn write_build_report(
    path: &Path,
    exit_code: i32,
    top_level: &[TargetLabel],
    rule_keys: &HashMap<TargetLabel, RuleKey>,
) -> Result<(), String> {
    let results: serde_json::Map<String, serde_json::Value> = top_level
        .iter()
        .map(|label| {
            (
                label.to_string(),
                serde_json::json!({
                    "success": exit_code == 0,
                    "rule_key": rule_keys.get(label).map(RuleKey::to_string),
                }),
            )
        })
        .collect();
    let report = serde_json::json!({
        "success": exit_code == 0,
        "results": results,
    });

    std::fs::write(path, serde_json::to_vec_pretty(&report).map_err(|e| e.to_string())?)
        .map_err(|e| format!("Failed to write {}: {e}", path.display()))
}

///
/// Write one `key<TAB>label` line per rule, sorted by label so diffs between invocations are
/// stable.
///
pub fn write_rule_key_log(
    path: &Path,
    rule_keys: &HashMap<TargetLabel, RuleKey>,
) -> Result<(), String> {
    let mut lines: Vec<(String, RuleKey)> = rule_keys
        .iter()
        .map(|(label, key)| (label.to_string(), *key))
        .collect();
    lines.sort_by(|a, b| a.0.cmp(&b.0));

    let mut rendered = String::new();
    for (label, key) in lines {
        rendered.push_str(&format!("{key}\t{label}\n"));
    }
    std::fs::write(path, rendered)
        .map_err(|e| format!("Failed to write {}: {e}", path.display()))
}

fn output_source(rule: &BuildRule, output: &str, cells: &CellIndexer) -> Result<PathBuf, String> {
    let cell = cells
        .get(rule.cell)
        .ok_or_else(|| format!("Rule {} references unknown cell {}.", rule.label, rule.cell))?;
    Ok(cell.root.join(output))
}

///
/// Refresh the `last/<target-basename>` links under the output root to point at each top-level
/// target's primary output.
///
pub(crate) fn refresh_last_links(
    output_root: &Path,
    graph: &ActionGraph,
    top_level: &[TargetLabel],
    cells: &CellIndexer,
) -> Result<(), String> {
    let last_dir = output_root.join("last");
    std::fs::create_dir_all(&last_dir)
        .map_err(|e| format!("Failed to create {}: {e}", last_dir.display()))?;

    for label in top_level {
        let Some(rule) = graph.get(label) else { continue };
        let Some(output) = rule.outputs.first() else { continue };
        let source = output_source(rule, output, cells)?;
        let link = last_dir.join(label.basename());

        // Replace any stale link from a previous invocation.
        if link.symlink_metadata().is_ok() {
            std::fs::remove_file(&link)
                .map_err(|e| format!("Failed to remove {}: {e}", link.display()))?;
        }
        #[cfg(unix)]
        std::os::unix::fs::symlink(&source, &link)
            .map_err(|e| format!("Failed to link {}: {e}", link.display()))?;
        #[cfg(not(unix))]
        std::fs::copy(&source, &link)
            .map_err(|e| format!("Failed to copy {}: {e}", link.display()))
            .map(|_| ())?;
        debug!("Linked {} -> {}", link.display(), source.display());
    }
    Ok(())
}

///
/// Copy the single requested target's primary output to the --out destination.
///
pub(crate) fn copy_out(
    out: &Path,
    graph: &ActionGraph,
    top_level: &[TargetLabel],
    cells: &CellIndexer,
) -> Result<(), String> {
    let label = &top_level[0];
    let rule = graph
        .get(label)
        .ok_or_else(|| format!("Target {label} is not a rule of the action graph."))?;
    let output = rule.outputs.first().ok_or_else(|| {
        format!("--out is not compatible with {label}: the target does not produce a copyable output.")
    })?;
    let source = output_source(rule, output, cells)?;

    let destination = if out.is_dir() {
        out.join(
            source
                .file_name()
                .ok_or_else(|| format!("Output {} has no file name.", source.display()))?,
        )
    } else {
        out.to_path_buf()
    };
    std::fs::copy(&source, &destination).map_err(|e| {
        format!(
            "Failed to copy the output of {label} from {} to {}: {e}",
            source.display(),
            destination.display()
        )
    })?;
    Ok(())
}

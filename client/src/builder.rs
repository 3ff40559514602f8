// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error, info};
use parking_lot::Mutex;

use build_graph::{BuildRule, TargetLabel};
use cells::CellIndexer;
use coordinator::{
    Build, ExitCode, LocalBuildExecutor, LocalBuildRequest, LOCAL_STEP_FAILED_EXIT_CODE,
};
use remote_sync::RuleFate;

///
/// A local execution engine that runs each rule's shell command from its cell root. Rules are
/// executed serially in dependency order; scheduling smarter than that is this engine's
/// business alone, not the coordinator's.
///
pub struct ShellBuildExecutor {
    cells: Arc<CellIndexer>,
}

impl ShellBuildExecutor {
    pub fn new(cells: Arc<CellIndexer>) -> ShellBuildExecutor {
        ShellBuildExecutor { cells }
    }
}

#[async_trait]
impl LocalBuildExecutor for ShellBuildExecutor {
    async fn create_build(&self, request: LocalBuildRequest) -> Result<Arc<dyn Build>, String> {
        let order = dependency_order(&request)?;
        Ok(Arc::new(ShellBuild {
            request,
            order,
            cells: self.cells.clone(),
            terminated: Mutex::new(None),
        }))
    }
}

///
/// Topological order over the action graph, dependencies first. A cycle is a create-time error.
///
fn dependency_order(request: &LocalBuildRequest) -> Result<Vec<TargetLabel>, String> {
    let mut in_degree: HashMap<TargetLabel, usize> = HashMap::new();
    let mut dependents: HashMap<TargetLabel, Vec<TargetLabel>> = HashMap::new();
    for rule in request.graph.rules() {
        in_degree.entry(rule.label.clone()).or_insert(0);
        for dep in &rule.deps {
            *in_degree.entry(rule.label.clone()).or_insert(0) += 1;
            dependents
                .entry(dep.clone())
                .or_default()
                .push(rule.label.clone());
        }
    }

    let mut ready: Vec<TargetLabel> = request
        .graph
        .rules()
        .filter(|rule| in_degree[&rule.label] == 0)
        .map(|rule| rule.label.clone())
        .collect();
    let mut order = Vec::new();
    while let Some(label) = ready.pop() {
        order.push(label.clone());
        for dependent in dependents.remove(&label).unwrap_or_default() {
            let degree = in_degree
                .get_mut(&dependent)
                .ok_or_else(|| format!("Unknown rule {dependent} in the action graph."))?;
            *degree -= 1;
            if *degree == 0 {
                ready.push(dependent);
            }
        }
    }
    if order.len() != request.graph.len() {
        return Err("The action graph contains a dependency cycle.".to_owned());
    }
    Ok(order)
}

struct ShellBuild {
    request: LocalBuildRequest,
    order: Vec<TargetLabel>,
    cells: Arc<CellIndexer>,
    terminated: Mutex<Option<String>>,
}

impl ShellBuild {
    fn terminated(&self) -> bool {
        self.terminated.lock().is_some()
    }

    async fn execute_rule(&self, rule: &BuildRule) -> Result<(), String> {
        let cell = self
            .cells
            .get(rule.cell)
            .ok_or_else(|| format!("Rule {} references unknown cell {}.", rule.label, rule.cell))?;

        for output in &rule.outputs {
            if let Some(parent) = cell.root.join(output).parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| format!("Failed to create {}: {e}", parent.display()))?;
            }
        }

        let Some(cmd) = &rule.cmd else {
            // Rules without a command (filegroups and the like) have nothing to execute.
            return Ok(());
        };

        debug!("Running {}: {cmd}", rule.label);
        let status = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .current_dir(&cell.root)
            .envs(&rule.env)
            .status()
            .await
            .map_err(|e| format!("Failed to spawn the command of {}: {e}", rule.label))?;
        if !status.success() {
            return Err(format!("{} failed with {status}.", rule.label));
        }
        Ok(())
    }
}

#[async_trait]
impl Build for ShellBuild {
    async fn run(&self) -> i32 {
        let mut failed: HashSet<TargetLabel> = HashSet::new();
        for label in &self.order {
            if self.terminated() {
                return LOCAL_STEP_FAILED_EXIT_CODE;
            }
            let Some(rule) = self.request.graph.get(label) else {
                continue;
            };

            if rule.deps.iter().any(|dep| failed.contains(dep)) {
                failed.insert(label.clone());
                continue;
            }

            if rule.cacheable {
                if let Some(synchronizer) = &self.request.synchronizer {
                    let Some(key) = self.request.rule_keys.get(label) else {
                        error!("No rule key was computed for {label}.");
                        return LOCAL_STEP_FAILED_EXIT_CODE;
                    };
                    match synchronizer.wait(*key, None).await {
                        Ok(RuleFate::Available) => {
                            // The artifact is in the remote cache; the cache layer materializes
                            // it, so there is nothing to execute here.
                            debug!("Fetched {label} from the remote cache.");
                            continue;
                        }
                        Ok(RuleFate::NotBuilt) => {
                            debug!("Remote never produced {label}; building locally.");
                        }
                        Ok(RuleFate::Cancelled) | Err(_) => {
                            return LOCAL_STEP_FAILED_EXIT_CODE;
                        }
                    }
                }
            }

            if let Err(e) = self.execute_rule(rule).await {
                error!("{e}");
                failed.insert(label.clone());
                if !self.request.keep_going {
                    return ExitCode::BuildError.code();
                }
            }
        }

        if self.terminated() {
            LOCAL_STEP_FAILED_EXIT_CODE
        } else if failed.is_empty() {
            ExitCode::Success.code()
        } else {
            ExitCode::BuildError.code()
        }
    }

    fn terminate_with_failure(&self, cause: &str) {
        let mut terminated = self.terminated.lock();
        if terminated.is_none() {
            info!("Terminating the local build: {cause}");
            *terminated = Some(cause.to_owned());
        }
    }
}

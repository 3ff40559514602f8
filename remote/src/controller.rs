// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::sync::Notify;

use buildstate::JobState;
use remote_sync::RemoteSynchronizer;
use rulekey::RuleKey;
use stats::{BuildEvent, EventSink};
use task_executor::{Executor, TailTasks};

use crate::{
    retry_call, BuildRequest, CoordinatorClient, RemoteBuildOutcome, RemoteBuildState,
    RemoteStatus,
};

/// The intermediate exit code reported when the remote half of a build fails.
pub const REMOTE_STEP_FAILED_EXIT_CODE: i32 = 1;

///
/// Submits a JobState and drives the remote build to a terminal state, forwarding per-rule
/// completions to the synchronizer as they stream in and materializing build-slave logs on the
/// side.
///
/// Failure semantics: transient service errors inside the loop are retried with bounded
/// backoff; a persistent error surfaces as the remote-step-failed exit code. Log
/// materialization errors are logged and non-fatal.
///
pub struct RemoteController {
    client: Arc<dyn CoordinatorClient>,
    synchronizer: RemoteSynchronizer,
    executor: Executor,
    events: Arc<dyn EventSink>,
    poll_interval: Duration,
    /// Wall-clock limit for the remote build itself.
    overall_deadline: Duration,
    /// How long to keep waiting for in-flight log materialization after the build finishes.
    max_wait_for_logs: Duration,
    log_dir: PathBuf,
    cancelled: AtomicBool,
    cancel_notify: Notify,
}

impl RemoteController {
    pub fn new(
        client: Arc<dyn CoordinatorClient>,
        synchronizer: RemoteSynchronizer,
        executor: Executor,
        events: Arc<dyn EventSink>,
        poll_interval: Duration,
        overall_deadline: Duration,
        max_wait_for_logs: Duration,
        log_dir: PathBuf,
    ) -> RemoteController {
        RemoteController {
            client,
            synchronizer,
            executor,
            events,
            poll_interval,
            overall_deadline,
            max_wait_for_logs,
            log_dir,
            cancelled: AtomicBool::new(false),
            cancel_notify: Notify::new(),
        }
    }

    ///
    /// Best-effort cancellation of the polling loop. Idempotent; safe to call from any task.
    ///
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
        self.cancel_notify.notify_waiters();
    }

    ///
    /// Submit the job and drive the remote state machine to completion.
    ///
    /// An Err means the build could not even be started (no stampede id was ever assigned);
    /// once an id exists, failures are reported through the outcome's exit code instead.
    ///
    pub async fn execute(
        &self,
        job: &JobState,
        request: &BuildRequest,
    ) -> Result<RemoteBuildOutcome, String> {
        self.events.post(BuildEvent::DistBuildStarted);

        let stampede_id = retry_call(|| self.client.start_build(job, request))
            .await
            .map_err(|e| format!("Failed to start the remote build: {e}"))?;
        info!("Remote build accepted: stampede id {stampede_id}");

        let tail_tasks = TailTasks::new();
        let mut signalled: HashSet<RuleKey> = HashSet::new();
        let mut cache_miss_keys: Vec<RuleKey> = Vec::new();
        let mut materialized_run_ids: HashSet<String> = HashSet::new();
        let deadline = Instant::now() + self.overall_deadline;

        let exit_code = loop {
            if self.cancelled.load(Ordering::Relaxed) {
                warn!("Remote build {stampede_id} cancelled.");
                break REMOTE_STEP_FAILED_EXIT_CODE;
            }

            let status = match retry_call(|| self.client.fetch_status(&stampede_id)).await {
                Ok(status) => status,
                Err(e) => {
                    warn!("Giving up on remote build {stampede_id}: {e}");
                    break REMOTE_STEP_FAILED_EXIT_CODE;
                }
            };

            self.signal_finished_rules(&status, &mut signalled, &mut cache_miss_keys);
            self.materialize_new_logs(&status, &mut materialized_run_ids, &tail_tasks);

            if status.state.is_terminal() {
                break match status.state {
                    RemoteBuildState::FinishedOk => 0,
                    _ => REMOTE_STEP_FAILED_EXIT_CODE,
                };
            }
            if Instant::now() >= deadline {
                warn!(
                    "Remote build {stampede_id} did not finish within {:?}.",
                    self.overall_deadline
                );
                break REMOTE_STEP_FAILED_EXIT_CODE;
            }

            tokio::select! {
              _ = tokio::time::sleep(self.poll_interval) => {},
              _ = self.cancel_notify.notified() => {},
            }
        };

        // Give in-flight log fetches a bounded chance to land, then release every local waiter
        // whose key never got a signal.
        tail_tasks.wait(self.max_wait_for_logs).await;
        self.synchronizer.close();

        if exit_code != 0 && !cache_miss_keys.is_empty() {
            // Best-effort diagnostics: what the remote had to say about the keys it actually
            // built.
            match self.client.fetch_rule_key_logs(&cache_miss_keys).await {
                Ok(entries) => {
                    for entry in entries {
                        debug!("Remote rule key log {}: {}", entry.key, entry.message);
                    }
                }
                Err(e) => debug!("Failed to fetch rule key logs: {e}"),
            }
        }

        self.events.post(BuildEvent::DistBuildFinished { exit_code });
        Ok(RemoteBuildOutcome {
            stampede_id,
            exit_code,
            cache_miss_keys,
            materialized_log_run_ids: materialized_run_ids.into_iter().collect(),
        })
    }

    fn signal_finished_rules(
        &self,
        status: &RemoteStatus,
        signalled: &mut HashSet<RuleKey>,
        cache_miss_keys: &mut Vec<RuleKey>,
    ) {
        for rule in &status.finished_rules {
            if !signalled.insert(rule.key) {
                continue;
            }
            if !rule.was_cache_hit {
                cache_miss_keys.push(rule.key);
            }
            if rule.success {
                self.synchronizer.signal_available(rule.key);
            } else {
                self.synchronizer.signal_not_built(rule.key);
            }
        }
    }

    fn materialize_new_logs(
        &self,
        status: &RemoteStatus,
        materialized: &mut HashSet<String>,
        tail_tasks: &TailTasks,
    ) {
        let new_run_ids: Vec<String> = status
            .log_run_ids
            .iter()
            .filter(|run_id| materialized.insert((*run_id).clone()))
            .cloned()
            .collect();
        if new_run_ids.is_empty() {
            return;
        }

        let client = self.client.clone();
        let log_dir = self.log_dir.clone();
        tail_tasks.spawn_on(
            &format!("materialize_logs({})", new_run_ids.join(", ")),
            self.executor.handle(),
            async move {
                let logs = match client.fetch_logs(&new_run_ids).await {
                    Ok(logs) => logs,
                    Err(e) => {
                        warn!("Failed to fetch build-slave logs: {e}");
                        return;
                    }
                };
                for log in logs {
                    let dir = log_dir.join(&log.run_id);
                    let write = std::fs::create_dir_all(&dir)
                        .and_then(|()| std::fs::write(dir.join(&log.name), &log.contents));
                    match write {
                        Ok(()) => debug!("Materialized log {}/{}", log.run_id, log.name),
                        Err(e) => {
                            warn!("Failed to materialize log {}/{}: {e}", log.run_id, log.name)
                        }
                    }
                }
            },
        );
    }
}

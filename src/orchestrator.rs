// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{error, info, warn};
use parking_lot::Mutex;

use build_graph::{ActionGraph, TargetGraph, TargetLabel, TargetPattern};
use buildstate::{ClientVersion, JobState, StateSerializer};
use cells::CellIndexer;
use hashcache::{DiskHashCache, HashCache, RecordingHashCache};
use remote::{CoordinatorClient, RemoteBuildOutcome, RemoteController, REMOTE_STEP_FAILED_EXIT_CODE};
use remote_sync::RemoteSynchronizer;
use rulekey::{RuleKey, RuleKeyComputer, RuleKeyFactories};
use stats::{BuildEvent, BuildPhase, ClientStatsTracker, EventSink};
use task_executor::Executor;

use crate::analysis;
use crate::latch::AsyncLatch;
use crate::local::{Build, LocalBuildExecutor, LocalBuildRequest};
use crate::{
    ActionGraphLowerer, BuildOptions, ExitCode, TargetGraphParser, LOCAL_STEP_FAILED_EXIT_CODE,
};

///
/// What a failed invocation maps to at the process boundary.
///
#[derive(Debug)]
enum Failure {
    Parse(String),
    Build(String),
}

impl Failure {
    fn exit_code(&self) -> i32 {
        match self {
            Failure::Parse(_) => ExitCode::ParseError.code(),
            Failure::Build(_) => ExitCode::BuildError.code(),
        }
    }

    fn message(&self) -> &str {
        match self {
            Failure::Parse(message) => message,
            Failure::Build(message) => message,
        }
    }
}

///
/// Everything the Preparing state produces.
///
struct Prepared {
    top_level: Vec<TargetLabel>,
    graph: ActionGraph,
    rule_keys: HashMap<TargetLabel, RuleKey>,
    /// Present when the invocation ships state anywhere: distributed builds and state dumps.
    job: Option<JobState>,
}

#[derive(Default)]
struct CancelState {
    synchronizer: Option<RemoteSynchronizer>,
    controller: Option<Arc<RemoteController>>,
}

///
/// The top-level state machine of one invocation:
/// Preparing -> RunningBoth -> (RemoteOk | RemoteFail) -> Finalizing -> Done.
///
/// Owns the synchronizer and the two sub-build handles. The local executor and the remote
/// controller each hold only a non-owning view of the synchronizer.
///
pub struct HybridOrchestrator {
    parser: Arc<dyn TargetGraphParser>,
    lowerer: Arc<dyn ActionGraphLowerer>,
    local: Arc<dyn LocalBuildExecutor>,
    remote_client: Arc<dyn CoordinatorClient>,
    cells: Arc<CellIndexer>,
    cpu_executor: Executor,
    scheduled_executor: Executor,
    events: Arc<dyn EventSink>,
    stats: Arc<ClientStatsTracker>,
    version: ClientVersion,
    options: BuildOptions,
    cancel_state: Mutex<CancelState>,
    // Populated as soon as a local Build handle exists, in either mode, so that `cancel` can
    // always reach it.
    build_slot: Arc<Mutex<Option<Arc<dyn Build>>>>,
    // Set when the remote block failed before a stampede id was assigned: stats events are
    // dropped for such invocations.
    drop_stats_event: AtomicBool,
}

impl HybridOrchestrator {
    pub fn new(
        parser: Arc<dyn TargetGraphParser>,
        lowerer: Arc<dyn ActionGraphLowerer>,
        local: Arc<dyn LocalBuildExecutor>,
        remote_client: Arc<dyn CoordinatorClient>,
        cells: Arc<CellIndexer>,
        cpu_executor: Executor,
        scheduled_executor: Executor,
        events: Arc<dyn EventSink>,
        stats: Arc<ClientStatsTracker>,
        version: ClientVersion,
        options: BuildOptions,
    ) -> HybridOrchestrator {
        HybridOrchestrator {
            parser,
            lowerer,
            local,
            remote_client,
            cells,
            cpu_executor,
            scheduled_executor,
            events,
            stats,
            version,
            options,
            cancel_state: Mutex::new(CancelState::default()),
            build_slot: Arc::new(Mutex::new(None)),
            drop_stats_event: AtomicBool::new(false),
        }
    }

    ///
    /// Run the invocation to completion and return the final exit code. Stats events are
    /// emitted on every exit path (except a remote failure that never received a stampede id).
    ///
    pub async fn execute(&self, patterns: &[TargetPattern]) -> i32 {
        let exit_code = match self.run(patterns).await {
            Ok(exit_code) => exit_code,
            Err(failure) => {
                error!("{}", failure.message());
                self.stats.set_client_error(failure.message().to_owned());
                failure.exit_code()
            }
        };

        if self.drop_stats_event.load(Ordering::Relaxed) {
            warn!("Dropping client stats: the remote build never assigned a stampede id.");
        } else {
            match self.stats.snapshot() {
                Ok(stats) => self.events.post(BuildEvent::ClientStats(Box::new(stats))),
                Err(e) => warn!("Failed to snapshot client stats: {e}"),
            }
        }
        exit_code
    }

    ///
    /// Cancel the invocation: unblock every waiter, stop the local build at its next rule
    /// boundary, and abandon the remote loop. Idempotent.
    ///
    pub fn cancel(&self) {
        let state = self.cancel_state.lock();
        if let Some(synchronizer) = &state.synchronizer {
            synchronizer.cancel();
        }
        if let Some(build) = self.build_slot.lock().clone() {
            build.terminate_with_failure("Build cancelled.");
        }
        if let Some(controller) = &state.controller {
            controller.cancel();
        }
    }

    async fn run(&self, patterns: &[TargetPattern]) -> Result<i32, Failure> {
        self.start_phase(BuildPhase::LocalPreparation);
        let prepared = {
            let result = self.prepare(patterns).await;
            self.stop_phase(BuildPhase::LocalPreparation);
            result?
        };

        if let Some(path) = &self.options.state_dump_path {
            // State-dump mode: write the job (its file hash entries carry inline contents) and
            // make no RPC at all.
            let bytes = prepared
                .job
                .as_ref()
                .ok_or_else(|| Failure::Build("No job state was prepared.".to_owned()))?
                .to_bytes()
                .map_err(Failure::Build)?;
            std::fs::write(path, bytes).map_err(|e| {
                Failure::Build(format!("Failed to write {}: {e}", path.display()))
            })?;
            info!("Wrote job state to {}.", path.display());
            return Ok(ExitCode::Success.code());
        }

        let (exit_code, remote_outcome) = if self.options.distributed {
            self.run_both(&prepared).await?
        } else {
            let local_exit = self.run_local_only(&prepared).await?;
            (local_exit, None)
        };

        self.finalize(&prepared, exit_code, remote_outcome.as_ref())
    }

    ///
    /// The Preparing state: graphs, rule keys, job state. Any failure here surfaces as a parse
    /// error.
    ///
    async fn prepare(&self, patterns: &[TargetPattern]) -> Result<Prepared, Failure> {
        self.start_phase(BuildPhase::LocalGraphConstruction);
        let constructed = self.construct_graphs(patterns);
        self.stop_phase(BuildPhase::LocalGraphConstruction);
        let (target_graph, top_level, graph) = constructed?;

        if let Some(out) = &self.options.out {
            // --out requires exactly one target with something to copy.
            let rule = graph.get(&top_level[0]).ok_or_else(|| {
                Failure::Parse(format!(
                    "Target {} is not a rule of the action graph.",
                    top_level[0]
                ))
            })?;
            if rule.outputs.is_empty() {
                return Err(Failure::Build(format!(
                    "--out {} is not compatible with {}: the target does not produce a copyable \
                    output.",
                    out.display(),
                    rule.label
                )));
            }
        }

        let cache = Arc::new(HashCache::Recording(RecordingHashCache::new(
            DiskHashCache::new(),
            self.cells.clone(),
        )));
        let factories = Arc::new(RuleKeyFactories::new(
            self.options.rule_key_seed.clone(),
            self.cells.clone(),
        ));
        let computer =
            RuleKeyComputer::new(self.cpu_executor.clone(), factories, cache.clone());
        let rule_keys = computer.compute(&graph).await.map_err(Failure::Parse)?;

        if let Some(path) = &self.options.rulekeys_log_path {
            if let Err(e) = analysis::write_rule_key_log(path, &rule_keys) {
                warn!("Failed to write rule key log: {e}");
            }
        }

        // Rule keys are complete, so the recorded hash tables are final: snapshot them into the
        // job state. Purely local invocations ship no state and skip this.
        let job = if self.options.distributed || self.options.state_dump_path.is_some() {
            let recording = match cache.as_recording() {
                Some(recording) => recording,
                None => return Err(Failure::Build("The preparing state always records.".to_owned())),
            };
            let serializer = StateSerializer::new(self.cells.clone(), self.version.clone());
            Some(
                serializer
                    .serialize(
                        &target_graph,
                        &top_level,
                        recording,
                        self.options.state_dump_path.is_some(),
                    )
                    .map_err(Failure::Parse)?,
            )
        } else {
            None
        };

        Ok(Prepared {
            top_level,
            graph,
            rule_keys,
            job,
        })
    }

    fn construct_graphs(
        &self,
        patterns: &[TargetPattern],
    ) -> Result<(TargetGraph, Vec<TargetLabel>, ActionGraph), Failure> {
        let (target_graph, top_level) =
            self.parser.parse(patterns).map_err(Failure::Parse)?;

        if self.options.out.is_some() && top_level.len() != 1 {
            return Err(Failure::Parse(format!(
                "--out requires exactly one target, but the requested patterns expanded to {} \
                targets.",
                top_level.len()
            )));
        }

        let graph = self
            .lowerer
            .lower(&target_graph, &top_level)
            .map_err(Failure::Parse)?;

        if let Some(just_build) = &self.options.just_build {
            if graph.get(just_build).is_none() {
                return Err(Failure::Parse(format!(
                    "--just-build {just_build} does not name a rule of the action graph."
                )));
            }
        }

        Ok((target_graph, top_level, graph))
    }

    ///
    /// A plain local build: no synchronizer, no remote.
    ///
    async fn run_local_only(&self, prepared: &Prepared) -> Result<i32, Failure> {
        let build = self
            .local
            .create_build(self.local_request(prepared, None))
            .await
            .map_err(Failure::Build)?;
        *self.build_slot.lock() = Some(build.clone());

        self.stats.set_performed_local_build();
        self.start_phase(BuildPhase::PerformLocalBuild);
        let local_exit = build.run().await;
        self.stop_phase(BuildPhase::PerformLocalBuild);
        self.stats.set_local_exit_code(local_exit);
        Ok(local_exit)
    }

    ///
    /// The RunningBoth state: spawn the local and remote tasks, join the remote first, then
    /// apply the failure policy from its outcome. The local task is always joined before this
    /// returns.
    ///
    async fn run_both(
        &self,
        prepared: &Prepared,
    ) -> Result<(i32, Option<RemoteBuildOutcome>), Failure> {
        let job = prepared
            .job
            .clone()
            .ok_or_else(|| Failure::Build("No job state was prepared.".to_owned()))?;
        let synchronizer = RemoteSynchronizer::new();
        let controller = Arc::new(RemoteController::new(
            self.remote_client.clone(),
            synchronizer.clone(),
            self.scheduled_executor.to_borrowed(),
            self.events.clone(),
            self.options.poll_interval,
            self.options.remote_deadline,
            self.options.max_wait_for_logs,
            self.options.log_dir.clone(),
        ));
        {
            let mut cancel_state = self.cancel_state.lock();
            cancel_state.synchronizer = Some(synchronizer.clone());
            cancel_state.controller = Some(controller.clone());
        }

        let initialized = AsyncLatch::new();
        let build_slot = self.build_slot.clone();

        let local_task = {
            let local = self.local.clone();
            let request = self.local_request(prepared, Some(synchronizer.clone()));
            let stats = self.stats.clone();
            let initialized = initialized.clone();
            let build_slot = build_slot.clone();
            self.cpu_executor.spawn(
                async move {
                    let build = match local.create_build(request).await {
                        Ok(build) => build,
                        Err(e) => {
                            // Trigger anyway: a failing remote build must never deadlock
                            // waiting for a handle that will not arrive.
                            initialized.trigger();
                            return Err(e);
                        }
                    };
                    *build_slot.lock() = Some(build.clone());
                    initialized.trigger();

                    stats.set_performed_local_build();
                    if let Err(e) = stats.start_phase(BuildPhase::PerformLocalBuild) {
                        warn!("{e}");
                    }
                    let local_exit = build.run().await;
                    if let Err(e) = stats.stop_phase(BuildPhase::PerformLocalBuild) {
                        warn!("{e}");
                    }
                    stats.set_local_exit_code(local_exit);
                    Ok(local_exit)
                },
                |join_error| Err(format!("Local build task failed: {join_error}")),
            )
        };

        let remote_task = {
            let controller = controller.clone();
            let request = self.options.request.clone();
            self.scheduled_executor.spawn(
                async move { controller.execute(&job, &request).await },
                |join_error| Err(format!("Remote build task failed: {join_error}")),
            )
        };

        let remote_result = remote_task.await;
        let (remote_exit, remote_outcome) = match remote_result {
            Ok(outcome) => {
                self.stats.set_stampede_id(outcome.stampede_id.to_string());
                self.stats.set_remote_exit_code(outcome.exit_code);
                (outcome.exit_code, Some(outcome))
            }
            Err(e) => {
                // The remote build could not even be started. There is no stampede id, so the
                // stats event for this invocation is dropped.
                error!("Remote build failed before starting: {e}");
                self.drop_stats_event.store(true, Ordering::Relaxed);
                synchronizer.close();
                (REMOTE_STEP_FAILED_EXIT_CODE, None)
            }
        };

        let final_exit = if remote_exit != 0 && !self.options.fallback_enabled {
            // RemoteFail without fallback: stop the local build at its next rule boundary
            // instead of letting it run to natural completion.
            initialized.triggered().await;
            if let Some(build) = build_slot.lock().clone() {
                build.terminate_with_failure(&format!(
                    "The remote part of the build failed with exit code {remote_exit}."
                ));
            }
            let local_exit = Self::join_local(local_task).await;
            info!("Local build stopped with exit code {local_exit} after remote failure.");
            remote_exit
        } else {
            if remote_exit != 0 {
                // RemoteFail with fallback: the local build continues, building every rule the
                // remote never produced (their keys read as NotBuilt).
                warn!(
                    "Remote build failed with exit code {remote_exit}; falling back to a full \
                    local build."
                );
                self.stats.set_local_fallback_triggered();
            }
            Self::join_local(local_task).await
        };

        Ok((final_exit, remote_outcome))
    }

    async fn join_local(local_task: impl std::future::Future<Output = Result<i32, String>>) -> i32 {
        match local_task.await {
            Ok(exit_code) => exit_code,
            Err(e) => {
                error!("Local build failed: {e}");
                LOCAL_STEP_FAILED_EXIT_CODE
            }
        }
    }

    ///
    /// The Finalizing state, entered strictly after the local join: post-build analysis, output
    /// links, the build report, and the `--out` copy.
    ///
    fn finalize(
        &self,
        prepared: &Prepared,
        exit_code: i32,
        remote_outcome: Option<&RemoteBuildOutcome>,
    ) -> Result<i32, Failure> {
        self.start_phase(BuildPhase::PostBuildAnalysis);
        if let Err(e) = analysis::write_build_summary(
            &self.options.log_dir,
            exit_code,
            prepared.graph.len(),
            remote_outcome,
        ) {
            warn!("Failed to write the build summary: {e}");
        }
        self.stop_phase(BuildPhase::PostBuildAnalysis);

        if self.options.distributed {
            self.start_phase(BuildPhase::PostDistributedBuildLocalSteps);
        }
        let result = self.post_build_steps(prepared, exit_code);
        if self.options.distributed {
            self.stop_phase(BuildPhase::PostDistributedBuildLocalSteps);
        }
        result
    }

    fn post_build_steps(&self, prepared: &Prepared, exit_code: i32) -> Result<i32, Failure> {
        if let Some(report_path) = &self.options.build_report {
            if let Err(e) = analysis::write_build_report(
                report_path,
                exit_code,
                &prepared.top_level,
                &prepared.rule_keys,
            ) {
                warn!("Failed to write the build report: {e}");
            }
        }

        if exit_code != 0 {
            return Ok(exit_code);
        }

        if self.options.last_links {
            if let Err(e) = analysis::refresh_last_links(
                &self.options.output_root,
                &prepared.graph,
                &prepared.top_level,
                &self.cells,
            ) {
                warn!("Failed to refresh output links: {e}");
            }
        }

        if let Some(out) = &self.options.out {
            analysis::copy_out(out, &prepared.graph, &prepared.top_level, &self.cells)
                .map_err(Failure::Build)?;
        }

        Ok(exit_code)
    }

    fn local_request(
        &self,
        prepared: &Prepared,
        synchronizer: Option<RemoteSynchronizer>,
    ) -> LocalBuildRequest {
        LocalBuildRequest {
            graph: prepared.graph.clone(),
            rule_keys: prepared.rule_keys.clone(),
            synchronizer,
            mode: self.options.local_mode,
            keep_going: self.options.keep_going,
        }
    }

    fn start_phase(&self, phase: BuildPhase) {
        if let Err(e) = self.stats.start_phase(phase) {
            warn!("{e}");
        }
    }

    fn stop_phase(&self, phase: BuildPhase) {
        if let Err(e) = self.stats.stop_phase(phase) {
            warn!("{e}");
        }
    }
}

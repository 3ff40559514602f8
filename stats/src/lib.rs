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
use std::collections::HashMap;
use std::time::{Instant, SystemTime};

use parking_lot::Mutex;
use serde::Serialize;
use strum_macros::AsRefStr;

///
/// Whole seconds plus sub-second nanoseconds, split into named fields so every serde backend
/// writes the same two numbers (std::time::Duration carries no serde impls of its own).
///
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
pub struct Duration {
    pub secs: u64,
    pub nanos: u32,
}

impl From<std::time::Duration> for Duration {
    fn from(duration: std::time::Duration) -> Duration {
        Duration {
            secs: duration.as_secs(),
            nanos: duration.subsec_nanos(),
        }
    }
}

///
/// When a phase started (as an offset from the unix epoch) and how long it ran.
///
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
pub struct TimeSpan {
    pub start: Duration,
    pub duration: Duration,
}

impl TimeSpan {
    ///
    /// Anchor the span at `start` on the wall clock while taking its length from the monotonic
    /// clock, so wall-clock adjustments mid-phase cannot produce nonsense durations. A start
    /// before the epoch (a badly skewed clock) is recorded as the epoch itself.
    ///
    pub fn from_start_and_elapsed(start: &SystemTime, elapsed: std::time::Duration) -> TimeSpan {
        let since_epoch = start
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        TimeSpan {
            start: since_epoch.into(),
            duration: elapsed.into(),
        }
    }
}

///
/// The timed phases of one coordinator invocation.
///
#[derive(AsRefStr, Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildPhase {
    LocalPreparation,
    LocalGraphConstruction,
    PerformLocalBuild,
    PostBuildAnalysis,
    PostDistributedBuildLocalSteps,
}

///
/// The stats snapshot emitted at the end of an invocation.
///
#[derive(Clone, Debug, Serialize)]
pub struct ClientStats {
    pub phases: BTreeMap<String, TimeSpan>,
    pub stampede_id: Option<String>,
    pub remote_exit_code: Option<i32>,
    pub local_exit_code: Option<i32>,
    pub performed_local_build: bool,
    pub local_fallback_triggered: bool,
    pub client_error: bool,
    pub error_message: Option<String>,
}

struct TrackerState {
    started: HashMap<BuildPhase, (SystemTime, Instant)>,
    finished: BTreeMap<String, TimeSpan>,
    stampede_id: Option<String>,
    remote_exit_code: Option<i32>,
    local_exit_code: Option<i32>,
    performed_local_build: bool,
    local_fallback_triggered: bool,
    client_error: bool,
    error_message: Option<String>,
}

///
/// Collects phase timings and outcome facts over the whole invocation. Phases are timed on the
/// monotonic clock; a snapshot can only be taken once every started phase has been stopped.
///
/// The tracker lives for the whole invocation and is written to from both sub-builds, so all
/// state sits behind one lock.
///
pub struct ClientStatsTracker {
    state: Mutex<TrackerState>,
}

impl ClientStatsTracker {
    pub fn new() -> ClientStatsTracker {
        ClientStatsTracker {
            state: Mutex::new(TrackerState {
                started: HashMap::new(),
                finished: BTreeMap::new(),
                stampede_id: None,
                remote_exit_code: None,
                local_exit_code: None,
                performed_local_build: false,
                local_fallback_triggered: false,
                client_error: false,
                error_message: None,
            }),
        }
    }

    pub fn start_phase(&self, phase: BuildPhase) -> Result<(), String> {
        let mut state = self.state.lock();
        if state.started.contains_key(&phase) || state.finished.contains_key(phase.as_ref()) {
            return Err(format!("Phase {} was already started.", phase.as_ref()));
        }
        state
            .started
            .insert(phase, (SystemTime::now(), Instant::now()));
        Ok(())
    }

    pub fn stop_phase(&self, phase: BuildPhase) -> Result<(), String> {
        let mut state = self.state.lock();
        let (wall_start, mono_start) = state.started.remove(&phase).ok_or_else(|| {
            format!("Phase {} was stopped without being started.", phase.as_ref())
        })?;
        state.finished.insert(
            phase.as_ref().to_owned(),
            TimeSpan::from_start_and_elapsed(&wall_start, mono_start.elapsed()),
        );
        Ok(())
    }

    pub fn set_stampede_id(&self, stampede_id: String) {
        self.state.lock().stampede_id = Some(stampede_id);
    }

    pub fn stampede_id(&self) -> Option<String> {
        self.state.lock().stampede_id.clone()
    }

    pub fn set_remote_exit_code(&self, code: i32) {
        self.state.lock().remote_exit_code = Some(code);
    }

    pub fn set_local_exit_code(&self, code: i32) {
        self.state.lock().local_exit_code = Some(code);
    }

    pub fn set_performed_local_build(&self) {
        self.state.lock().performed_local_build = true;
    }

    pub fn set_local_fallback_triggered(&self) {
        self.state.lock().local_fallback_triggered = true;
    }

    pub fn set_client_error(&self, message: String) {
        let mut state = self.state.lock();
        state.client_error = true;
        state.error_message = Some(message);
    }

    ///
    /// Snapshot the collected stats. An error here means a start/stop pairing bug: some phase is
    /// still running.
    ///
    pub fn snapshot(&self) -> Result<ClientStats, String> {
        let state = self.state.lock();
        if !state.started.is_empty() {
            let open: Vec<&str> = state.started.keys().map(|p| p.as_ref()).collect();
            return Err(format!(
                "Cannot emit stats: phase(s) still running: {}.",
                open.join(", ")
            ));
        }
        Ok(ClientStats {
            phases: state.finished.clone(),
            stampede_id: state.stampede_id.clone(),
            remote_exit_code: state.remote_exit_code,
            local_exit_code: state.local_exit_code,
            performed_local_build: state.performed_local_build,
            local_fallback_triggered: state.local_fallback_triggered,
            client_error: state.client_error,
            error_message: state.error_message.clone(),
        })
    }
}

///
/// Coarse build lifecycle events, published so that consoles and log scrapers see the same
/// transitions the coordinator acts on.
///
#[derive(Clone, Debug)]
pub enum BuildEvent {
    DistBuildStarted,
    DistBuildFinished { exit_code: i32 },
    ClientStats(Box<ClientStats>),
}

pub trait EventSink: Send + Sync {
    fn post(&self, event: BuildEvent);
}

///
/// The default sink: events land in the log at info level.
///
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn post(&self, event: BuildEvent) {
        match &event {
            BuildEvent::DistBuildStarted => log::info!("Distributed build started."),
            BuildEvent::DistBuildFinished { exit_code } => {
                log::info!("Distributed build finished with exit code {exit_code}.")
            }
            BuildEvent::ClientStats(stats) => match serde_json::to_string(stats) {
                Ok(rendered) => log::info!("Client stats: {rendered}"),
                Err(e) => log::warn!("Failed to render client stats: {e}"),
            },
        }
    }
}

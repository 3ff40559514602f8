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

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use rand::{thread_rng, Rng};

use buildstate::JobState;
use rulekey::RuleKey;

mod controller;
pub use crate::controller::{RemoteController, REMOTE_STEP_FAILED_EXIT_CODE};

///
/// The opaque identifier the remote service assigns to one distributed build.
///
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct StampedeId(pub String);

impl fmt::Display for StampedeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

///
/// How the remote service should place the build.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BuildMode {
    /// Build the whole job on a single remote host.
    Remote,
    /// Shard the job across minions sharing the remote cache.
    Distributed,
}

///
/// The placement request submitted alongside the job.
///
#[derive(Clone, Debug)]
pub struct BuildRequest {
    pub mode: BuildMode,
    /// Worker machines to request in Distributed mode.
    pub minions: u32,
    pub repository: String,
    pub tenant: String,
}

///
/// The remote build's lifecycle as reported by `fetch_status`.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RemoteBuildState {
    Queued,
    Building,
    FinishedOk,
    FinishedFailed,
}

impl RemoteBuildState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RemoteBuildState::FinishedOk | RemoteBuildState::FinishedFailed
        )
    }
}

///
/// One rule the remote has finished with, successfully or not.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RuleProgress {
    pub key: RuleKey,
    pub success: bool,
    /// False when the remote actually had to execute the rule rather than serving its cache.
    pub was_cache_hit: bool,
}

#[derive(Clone, Debug)]
pub struct RemoteStatus {
    pub state: RemoteBuildState,
    /// Cumulative: every rule finished so far, not only since the last poll.
    pub finished_rules: Vec<RuleProgress>,
    pub log_run_ids: Vec<String>,
}

///
/// One build-slave log file, materialized into the local log directory.
///
#[derive(Clone, Debug)]
pub struct SlaveLog {
    pub run_id: String,
    pub name: String,
    pub contents: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct RuleKeyLogEntry {
    pub key: RuleKey,
    pub message: String,
}

///
/// The terminal result of the remote half of a build. Exit code 0 means every cacheable
/// artifact is now available in the remote cache.
///
#[derive(Clone, Debug)]
pub struct RemoteBuildOutcome {
    pub stampede_id: StampedeId,
    pub exit_code: i32,
    pub cache_miss_keys: Vec<RuleKey>,
    pub materialized_log_run_ids: Vec<String>,
}

///
/// Errors from the remote service, split by whether a retry can help.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RemoteError {
    // String is the error message.
    Retryable(String),
    Fatal(String),
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteError::Retryable(message) => write!(f, "{message}"),
            RemoteError::Fatal(message) => write!(f, "{message}"),
        }
    }
}

///
/// The logical operations of the remote build service. The wire transport behind them is out of
/// scope here: implementations adapt whatever RPC stack the deployment uses.
///
#[async_trait]
pub trait CoordinatorClient: Send + Sync {
    async fn start_build(
        &self,
        job: &JobState,
        request: &BuildRequest,
    ) -> Result<StampedeId, RemoteError>;

    async fn fetch_status(&self, stampede_id: &StampedeId) -> Result<RemoteStatus, RemoteError>;

    async fn fetch_logs(&self, run_ids: &[String]) -> Result<Vec<SlaveLog>, RemoteError>;

    async fn fetch_rule_key_logs(
        &self,
        keys: &[RuleKey],
    ) -> Result<Vec<RuleKeyLogEntry>, RemoteError>;
}

/// Retry a remote operation using exponential back-off to delay between attempts.
pub async fn retry_call<T, F, Fut>(f: F) -> Result<T, RemoteError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    const INTERVAL_DURATION: Duration = Duration::from_millis(10);
    const MAX_RETRIES: u32 = 3;
    const MAX_BACKOFF_DURATION: Duration = Duration::from_secs(5);

    let mut last_error: Option<RemoteError> = None;

    let mut num_retries = 0;
    while num_retries < MAX_RETRIES {
        // Delay before the next send attempt if this is a retry.
        if num_retries > 0 {
            let multiplier = thread_rng().gen_range(0..2_u32.pow(num_retries) + 1);
            let sleep_time = INTERVAL_DURATION * multiplier;
            let sleep_time = sleep_time.min(MAX_BACKOFF_DURATION);
            tokio::time::sleep(sleep_time).await;
        }

        match f().await {
            Ok(r) => return Ok(r),
            Err(err) => match err {
                RemoteError::Retryable(_) => last_error = Some(err),
                RemoteError::Fatal(_) => return Err(err),
            },
        }

        num_retries += 1
    }

    Err(last_error.take().unwrap())
}

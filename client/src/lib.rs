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

use async_trait::async_trait;

use buildstate::JobState;
use remote::{
    BuildRequest, CoordinatorClient, RemoteError, RemoteStatus, RuleKeyLogEntry, SlaveLog,
    StampedeId,
};
use rulekey::RuleKey;

pub mod args;
pub mod builder;
pub mod config;
pub mod manifest;

///
/// The client the binary wires in when no remote coordinator transport has been linked. Every
/// operation fails fatally, so `--distributed` invocations follow the remote-failure policy
/// (and, with fallback enabled, still complete locally).
///
pub struct UnconfiguredCoordinatorClient;

#[async_trait]
impl CoordinatorClient for UnconfiguredCoordinatorClient {
    async fn start_build(
        &self,
        _job: &JobState,
        _request: &BuildRequest,
    ) -> Result<StampedeId, RemoteError> {
        Err(RemoteError::Fatal(
            "No remote coordinator transport is configured in this binary.".to_owned(),
        ))
    }

    async fn fetch_status(&self, _stampede_id: &StampedeId) -> Result<RemoteStatus, RemoteError> {
        Err(RemoteError::Fatal(
            "No remote coordinator transport is configured in this binary.".to_owned(),
        ))
    }

    async fn fetch_logs(&self, _run_ids: &[String]) -> Result<Vec<SlaveLog>, RemoteError> {
        Err(RemoteError::Fatal(
            "No remote coordinator transport is configured in this binary.".to_owned(),
        ))
    }

    async fn fetch_rule_key_logs(
        &self,
        _keys: &[RuleKey],
    ) -> Result<Vec<RuleKeyLogEntry>, RemoteError> {
        Err(RemoteError::Fatal(
            "No remote coordinator transport is configured in this binary.".to_owned(),
        ))
    }
}

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

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;

use rulekey::RuleKey;

///
/// The terminal state of one rule key, as observed by local waiters.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RuleFate {
    /// The remote produced the rule's artifact; it can be fetched from the cache.
    Available,
    /// The remote will never produce this artifact; a fallback build must make it locally.
    NotBuilt,
    /// The whole synchronizer was cancelled.
    Cancelled,
}

#[derive(Clone, Copy, Eq, PartialEq)]
enum Mode {
    Open,
    /// The remote reached a terminal state: keys without a signal are NotBuilt, including keys
    /// first seen after the close.
    Closed,
    Cancelled,
}

struct Inner {
    mode: Mode,
    keys: HashMap<RuleKey, watch::Sender<Option<RuleFate>>>,
}

///
/// The rendezvous between the local builder and the remote progress stream: a registry of
/// per-rule-key latches. The local builder waits on a rule's key before fetching its artifact;
/// the remote controller signals keys as the remote reports them finished.
///
/// Should be roughly equivalent to a keyed set of CountDownLatches with a count of 1 each.
/// Signals are monotonic and terminal: once a key is Available or NotBuilt its state never
/// changes, and one signal wakes every current and future waiter of that key.
///
#[derive(Clone)]
pub struct RemoteSynchronizer {
    inner: Arc<Mutex<Inner>>,
}

impl RemoteSynchronizer {
    pub fn new() -> RemoteSynchronizer {
        RemoteSynchronizer {
            inner: Arc::new(Mutex::new(Inner {
                mode: Mode::Open,
                keys: HashMap::new(),
            })),
        }
    }

    ///
    /// Block until `key` is signalled, the synchronizer is closed or cancelled, or the timeout
    /// expires (an error: callers decide whether a timed-out wait is fatal).
    ///
    pub async fn wait(
        &self,
        key: RuleKey,
        timeout: Option<Duration>,
    ) -> Result<RuleFate, String> {
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.wait_inner(key))
                .await
                .map_err(|_| format!("Timed out after {timeout:?} waiting for rule key {key}.")),
            None => Ok(self.wait_inner(key).await),
        }
    }

    async fn wait_inner(&self, key: RuleKey) -> RuleFate {
        let mut receiver = {
            let mut inner = self.inner.lock();
            let mode = inner.mode;
            let sender = inner.keys.entry(key).or_insert_with(|| {
                let (sender, _) = watch::channel(None);
                sender
            });
            if sender.borrow().is_none() {
                match mode {
                    Mode::Open => {}
                    Mode::Closed => return RuleFate::NotBuilt,
                    Mode::Cancelled => return RuleFate::Cancelled,
                }
            }
            sender.subscribe()
        };

        loop {
            if let Some(fate) = *receiver.borrow_and_update() {
                return fate;
            }
            if receiver.changed().await.is_err() {
                // The synchronizer itself was dropped mid-build; treat as a cancel.
                return RuleFate::Cancelled;
            }
        }
    }

    ///
    /// Release every current and future waiter of `key` with Available. A no-op if the key was
    /// already signalled, or after cancel.
    ///
    pub fn signal_available(&self, key: RuleKey) {
        self.signal(key, RuleFate::Available)
    }

    ///
    /// Terminal failure for `key`: waiters receive NotBuilt.
    ///
    pub fn signal_not_built(&self, key: RuleKey) {
        self.signal(key, RuleFate::NotBuilt)
    }

    fn signal(&self, key: RuleKey, fate: RuleFate) {
        let mut inner = self.inner.lock();
        if inner.mode == Mode::Cancelled {
            return;
        }
        let sender = inner.keys.entry(key).or_insert_with(|| {
            let (sender, _) = watch::channel(None);
            sender
        });
        sender.send_if_modified(|state| match state {
            Some(_) => false,
            None => {
                *state = Some(fate);
                true
            }
        });
    }

    ///
    /// The remote reached a terminal state: broadcast NotBuilt to every unsignalled key, current
    /// and future. Signalled keys keep their fate.
    ///
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.mode != Mode::Open {
            return;
        }
        inner.mode = Mode::Closed;
        Self::flush_pending(&mut inner, RuleFate::NotBuilt);
    }

    ///
    /// Terminal cancel: every unsignalled current and future waiter unblocks with Cancelled, and
    /// all later signals are no-ops. Idempotent.
    ///
    pub fn cancel(&self) {
        let mut inner = self.inner.lock();
        if inner.mode == Mode::Cancelled {
            return;
        }
        inner.mode = Mode::Cancelled;
        Self::flush_pending(&mut inner, RuleFate::Cancelled);
    }

    fn flush_pending(inner: &mut Inner, fate: RuleFate) {
        for sender in inner.keys.values() {
            sender.send_if_modified(|state| match state {
                Some(_) => false,
                None => {
                    *state = Some(fate);
                    true
                }
            });
        }
    }
}

#[cfg(test)]
mod tests;

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

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use itertools::Itertools;
use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::{JoinError, JoinHandle, JoinSet};

///
/// A handle for spawning work onto a tokio Runtime, in one of two relationships to that
/// Runtime's lifecycle:
///
/// * An Executor made with `new()` (or `to_borrowed()`) merely points at a Runtime somebody
///   else keeps alive — typically the one a `tokio::{main, test}` macro set up. Dropping such
///   an Executor, or calling its shutdown methods, does nothing to the Runtime.
/// * An Executor made with `new_owned()` carries its Runtime with it. When the last clone is
///   dropped, or `shutdown` is called on any clone, the Runtime is torn down.
///
/// The coordinator runs two owned Executors: the CPU pool for rule-key computation and local
/// build steps, and a scheduled pool for remote polling and timed operations.
///
#[derive(Debug, Clone)]
pub struct Executor {
    runtime: Arc<Mutex<Option<Runtime>>>,
    handle: Handle,
}

impl Executor {
    ///
    /// A borrowed Executor for the Runtime of the current context. Panics outside a Runtime
    /// context; the caller keeps the Runtime alive for as long as any clone of this Executor
    /// is used.
    ///
    pub fn new() -> Executor {
        Executor {
            runtime: Arc::new(Mutex::new(None)),
            handle: Handle::current(),
        }
    }

    ///
    /// An owned Executor over a fresh multi-threaded Runtime: `num_worker_threads` async
    /// workers, with the remainder up to `max_threads` available for blocking work.
    ///
    pub fn new_owned(
        thread_name_prefix: &str,
        num_worker_threads: usize,
        max_threads: usize,
    ) -> Result<Executor, String> {
        let runtime = Builder::new_multi_thread()
            .thread_name(thread_name_prefix)
            .worker_threads(num_worker_threads)
            .max_blocking_threads(max_threads - num_worker_threads)
            .enable_all()
            .build()
            .map_err(|e| format!("Failed to start the runtime: {e}"))?;

        let handle = runtime.handle().clone();
        Ok(Executor {
            runtime: Arc::new(Mutex::new(Some(runtime))),
            handle,
        })
    }

    ///
    /// A borrowed view of this Executor: it targets the same Runtime but takes no part in
    /// shutdown. Hand these to components that should not be able to tear the pool down.
    ///
    pub fn to_borrowed(&self) -> Executor {
        Executor {
            runtime: Arc::new(Mutex::new(None)),
            handle: self.handle.clone(),
        }
    }

    ///
    /// Spawn `future` as a task and return a Future for its output, recovering from abnormal
    /// task exits (panics, runtime shutdown) via `rescue_join_error` — usually by converting
    /// the JoinError into the task's error type.
    ///
    /// Dropping the returned Future does not cancel the task.
    ///
    pub fn spawn<O: Send + 'static, F: Future<Output = O> + Send + 'static>(
        &self,
        future: F,
        rescue_join_error: impl FnOnce(JoinError) -> O,
    ) -> impl Future<Output = O> {
        let join_handle = self.native_spawn(future);
        async move {
            match join_handle.await {
                Ok(output) => output,
                Err(join_error) => rescue_join_error(join_error),
            }
        }
    }

    ///
    /// Spawn `future` as a task, returning the raw JoinHandle.
    ///
    pub fn native_spawn<O: Send + 'static, F: Future<Output = O> + Send + 'static>(
        &self,
        future: F,
    ) -> JoinHandle<O> {
        self.handle.spawn(future)
    }

    ///
    /// Drive `future` to completion from a non-async context. Only for main-like entry points:
    /// calling this from inside a task would block one of the Runtime's own threads.
    ///
    /// Work previously `spawn`ed may keep running after this returns.
    ///
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.handle.block_on(future)
    }

    ///
    /// Run `f` on the threads reserved for long-running or blocking work (disk hashing, archive
    /// reads). Abnormal exits are recovered via `rescue_join_error`, as in `spawn`.
    ///
    pub fn spawn_blocking<F: FnOnce() -> R + Send + 'static, R: Send + 'static>(
        &self,
        f: F,
        rescue_join_error: impl FnOnce(JoinError) -> R,
    ) -> impl Future<Output = R> {
        let join_handle = self.native_spawn_blocking(f);
        async move {
            match join_handle.await {
                Ok(output) => output,
                Err(join_error) => rescue_join_error(join_error),
            }
        }
    }

    ///
    /// Run `f` on the blocking-work threads, returning the raw JoinHandle.
    ///
    pub fn native_spawn_blocking<F: FnOnce() -> R + Send + 'static, R: Send + 'static>(
        &self,
        f: F,
    ) -> JoinHandle<R> {
        self.handle.spawn_blocking(f)
    }

    /// The underlying runtime handle, for APIs that want to pick their own spawn target.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    ///
    /// Tear down an owned Executor's Runtime, blocking until its tasks stop or the timeout
    /// passes (past the timeout, stragglers are leaked). A no-op for borrowed Executors.
    ///
    pub fn shutdown(&self, timeout: Duration) {
        let Some(runtime) = self.runtime.lock().take() else {
            return;
        };

        let start = Instant::now();
        runtime.shutdown_timeout(timeout + Duration::from_millis(250));
        if start.elapsed() > timeout {
            // Leaked tasks could lead to panics in some cases, so warn for them.
            log::warn!("Executor shutdown took unexpectedly long: tasks were likely leaked!");
        }
    }

    /// Whether `shutdown` has run. Borrowed Executors report true from the start.
    pub fn is_shutdown(&self) -> bool {
        self.runtime.lock().is_none()
    }
}

/// Store "tail" tasks which are async tasks that can execute concurrently with the build itself.
/// Tail tasks (log materialization, report uploads) block completion of an invocation until all
/// of them have been completed (subject to a timeout).
#[derive(Clone)]
pub struct TailTasks {
    inner: Arc<Mutex<Option<TailTasksInner>>>,
}

struct TailTasksInner {
    pending_names: HashSet<String>,
    task_set: JoinSet<String>,
}

impl TailTasks {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(TailTasksInner {
                pending_names: HashSet::new(),
                task_set: JoinSet::new(),
            }))),
        }
    }

    /// Spawn a tail task with the given name.
    pub fn spawn_on<F>(&self, name: &str, handle: &Handle, task: F)
    where
        F: Future<Output = ()>,
        F: Send + 'static,
    {
        let mut guard = self.inner.lock();
        let inner = match &mut *guard {
            Some(inner) => inner,
            None => {
                log::warn!("Tail task `{}` submitted after the invocation completed.", name);
                return;
            }
        };

        // Each task reports its own name back, so completions can be matched to names without
        // bookkeeping against task ids.
        let name = name.to_string();
        inner.pending_names.insert(name.clone());
        inner.task_set.spawn_on(
            async move {
                task.await;
                name
            },
            handle,
        );
    }

    /// Wait for all tail tasks to complete subject to the given timeout. If tasks
    /// fail or do not complete, log that fact.
    pub async fn wait(self, timeout: Duration) {
        let mut inner = match self.inner.lock().take() {
            Some(inner) => inner,
            None => {
                log::debug!("Tail tasks awaited multiple times!");
                return;
            }
        };

        if inner.task_set.is_empty() {
            return;
        }

        log::debug!(
            "waiting for {} tail task(s) to complete",
            inner.task_set.len()
        );

        let timeout = tokio::time::sleep(timeout);
        tokio::pin!(timeout);

        loop {
            tokio::select! {
              // Use biased mode to prefer an expired timeout over joining on remaining tasks.
              biased;

              // Exit monitoring loop if timeout expires.
              _ = &mut timeout => break,

              next_result = inner.task_set.join_next() => {
                match next_result {
                  Some(Ok(name)) => {
                    log::trace!("Tail task `{name}` completed successfully");
                    inner.pending_names.remove(&name);
                  },
                  Some(Err(err)) => {
                    log::error!("Tail task failed: {err:?}");
                  }
                  None => break,
                }
              }
            }
        }

        if inner.task_set.is_empty() {
            log::debug!("all tail tasks completed successfully");
        } else {
            log::debug!(
                "{} tail task(s) failed to complete within timeout: {}",
                inner.task_set.len(),
                inner.pending_names.iter().join(", "),
            );
            inner.task_set.abort_all();
        }
    }
}

#[cfg(test)]
mod tests;

// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::{Executor, TailTasks};

#[tokio::test]
async fn spawn_runs_to_completion() {
    let executor = Executor::new();
    let result = executor
        .spawn(async { 40 + 2 }, |join_error| panic!("{join_error}"))
        .await;
    assert_eq!(result, 42);
}

#[tokio::test]
async fn spawn_blocking_runs_off_the_async_thread() {
    let executor = Executor::new();
    let result = executor
        .spawn_blocking(|| 40 + 2, |join_error| panic!("{join_error}"))
        .await;
    assert_eq!(result, 42);
}

#[tokio::test]
async fn spawn_rescues_panics() {
    let executor = Executor::new();
    let result = executor
        .spawn(async { panic!("boom") }, |_join_error| "rescued")
        .await;
    assert_eq!(result, "rescued");
}

#[tokio::test]
async fn borrowed_executor_does_not_shut_down() {
    let executor = Executor::new();
    let borrowed = executor.to_borrowed();
    borrowed.shutdown(Duration::from_millis(10));
    assert!(borrowed.is_shutdown());

    // The underlying runtime is still usable.
    let result = executor.spawn(async { 1 }, |join_error| panic!("{join_error}")).await;
    assert_eq!(result, 1);
}

#[tokio::test]
async fn tail_tasks_complete_before_wait_returns() {
    let executor = Executor::new();
    let ran = Arc::new(AtomicBool::new(false));

    let tail = TailTasks::new();
    tail.spawn_on("flag-setter", executor.handle(), {
        let ran = ran.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            ran.store(true, Ordering::SeqCst);
        }
    });
    tail.wait(Duration::from_secs(5)).await;

    assert!(ran.load(Ordering::SeqCst));
}

#[tokio::test]
async fn tail_tasks_are_abandoned_at_the_timeout() {
    let executor = Executor::new();
    let ran = Arc::new(AtomicBool::new(false));

    let tail = TailTasks::new();
    tail.spawn_on("slowpoke", executor.handle(), {
        let ran = ran.clone();
        async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            ran.store(true, Ordering::SeqCst);
        }
    });
    tail.wait(Duration::from_millis(50)).await;

    assert!(!ran.load(Ordering::SeqCst));
}

#[tokio::test]
async fn tail_tasks_after_wait_are_rejected() {
    let executor = Executor::new();
    let ran = Arc::new(AtomicBool::new(false));

    let tail = TailTasks::new();
    tail.clone().wait(Duration::from_millis(10)).await;
    tail.spawn_on("too-late", executor.handle(), {
        let ran = ran.clone();
        async move {
            ran.store(true, Ordering::SeqCst);
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(!ran.load(Ordering::SeqCst));
}

// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::time::Duration;

use hashing::Digest;
use rulekey::RuleKey;
use tokio::time::sleep;

use crate::{RemoteSynchronizer, RuleFate};

fn key(name: &str) -> RuleKey {
    RuleKey(Digest::of_bytes(name.as_bytes()).hash)
}

#[tokio::test]
async fn signal_then_wait() {
    let sync = RemoteSynchronizer::new();
    sync.signal_available(key("a"));
    assert_eq!(sync.wait(key("a"), None).await.unwrap(), RuleFate::Available);
}

#[tokio::test]
async fn one_signal_wakes_all_waiters() {
    let sync = RemoteSynchronizer::new();

    let mut waiters: Vec<_> = (0..3)
        .map(|_| {
            let sync = sync.clone();
            tokio::spawn(async move { sync.wait(key("a"), None).await.unwrap() })
        })
        .collect();

    // Ensure that `wait` doesn't return until the key is signalled.
    tokio::select! {
      _ = sleep(Duration::from_millis(200)) => {},
      _ = &mut waiters[0] => { panic!("Waiter should have continued to wait.") }
    }

    sync.signal_available(key("a"));
    for waiter in waiters {
        assert_eq!(waiter.await.unwrap(), RuleFate::Available);
    }
}

#[tokio::test]
async fn signals_are_monotonic_and_terminal() {
    let sync = RemoteSynchronizer::new();
    sync.signal_available(key("a"));
    // A second signal of either flavor is a no-op.
    sync.signal_available(key("a"));
    sync.signal_not_built(key("a"));
    assert_eq!(sync.wait(key("a"), None).await.unwrap(), RuleFate::Available);

    sync.signal_not_built(key("b"));
    sync.signal_available(key("b"));
    assert_eq!(sync.wait(key("b"), None).await.unwrap(), RuleFate::NotBuilt);
}

#[tokio::test]
async fn distinct_keys_are_independent() {
    let sync = RemoteSynchronizer::new();
    sync.signal_available(key("a"));
    sync.signal_not_built(key("b"));
    assert_eq!(sync.wait(key("a"), None).await.unwrap(), RuleFate::Available);
    assert_eq!(sync.wait(key("b"), None).await.unwrap(), RuleFate::NotBuilt);
}

#[tokio::test]
async fn close_broadcasts_not_built() {
    let sync = RemoteSynchronizer::new();
    sync.signal_available(key("done"));

    let pending = {
        let sync = sync.clone();
        tokio::spawn(async move { sync.wait(key("pending"), None).await.unwrap() })
    };
    sleep(Duration::from_millis(50)).await;

    sync.close();

    // The unsignalled waiter unblocks with NotBuilt; the signalled key keeps its fate; a key
    // first seen after the close is NotBuilt too.
    assert_eq!(pending.await.unwrap(), RuleFate::NotBuilt);
    assert_eq!(
        sync.wait(key("done"), None).await.unwrap(),
        RuleFate::Available
    );
    assert_eq!(
        sync.wait(key("late"), None).await.unwrap(),
        RuleFate::NotBuilt
    );
}

#[tokio::test]
async fn cancel_unblocks_current_and_future_waiters() {
    let sync = RemoteSynchronizer::new();

    let pending = {
        let sync = sync.clone();
        tokio::spawn(async move { sync.wait(key("pending"), None).await.unwrap() })
    };
    sleep(Duration::from_millis(50)).await;

    sync.cancel();
    // And cancelling again is harmless.
    sync.cancel();

    assert_eq!(pending.await.unwrap(), RuleFate::Cancelled);
    assert_eq!(
        sync.wait(key("late"), None).await.unwrap(),
        RuleFate::Cancelled
    );
}

#[tokio::test]
async fn signal_after_cancel_is_a_noop() {
    let sync = RemoteSynchronizer::new();
    sync.cancel();
    sync.signal_available(key("a"));
    assert_eq!(sync.wait(key("a"), None).await.unwrap(), RuleFate::Cancelled);
}

#[tokio::test]
async fn wait_timeout_is_an_error() {
    let sync = RemoteSynchronizer::new();
    let err = sync
        .wait(key("never"), Some(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(err.contains("Timed out"), "unexpected error: {err}");
}

#[tokio::test]
async fn signalled_key_ignores_timeout() {
    let sync = RemoteSynchronizer::new();
    sync.signal_available(key("a"));
    assert_eq!(
        sync.wait(key("a"), Some(Duration::from_millis(10)))
            .await
            .unwrap(),
        RuleFate::Available
    );
}

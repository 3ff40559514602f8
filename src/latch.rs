// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use tokio::sync::watch;

///
/// A simple condition that can be triggered once to release any tasks that are waiting for it.
/// The orchestrator uses one to learn that the local Build handle exists and may be terminated.
///
/// All calls to trigger after the first one are noops.
///
#[derive(Clone)]
pub struct AsyncLatch {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl AsyncLatch {
    pub fn new() -> AsyncLatch {
        let (sender, receiver) = watch::channel(false);
        AsyncLatch {
            sender: Arc::new(sender),
            receiver,
        }
    }

    pub fn trigger(&self) {
        self.sender.send_if_modified(|triggered| {
            if *triggered {
                false
            } else {
                *triggered = true;
                true
            }
        });
    }

    ///
    /// Wait for another task to trigger this latch.
    ///
    pub async fn triggered(&self) {
        let mut receiver = self.receiver.clone();
        while !*receiver.borrow_and_update() {
            if receiver.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn poll_triggered(&self) -> bool {
        *self.receiver.borrow()
    }
}

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Manual-reset event on top of a watch channel.

use tokio::sync::watch;

/// A level-triggered event: `wait` resolves immediately while the event is
/// set, and blocks until the next `set` otherwise. Cloning shares state.
#[derive(Debug, Clone)]
pub struct ManualEvent {
    tx: watch::Sender<bool>,
}

impl ManualEvent {
    pub fn new() -> Self {
        Self { tx: watch::channel(false).0 }
    }

    pub fn set(&self) {
        self.tx.send_if_modified(|state| {
            if *state {
                false
            } else {
                *state = true;
                true
            }
        });
    }

    pub fn clear(&self) {
        self.tx.send_if_modified(|state| {
            if *state {
                *state = false;
                true
            } else {
                false
            }
        });
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the event is set.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in self, so the channel cannot close under us.
        let _ = rx.wait_for(|state| *state).await;
    }
}

impl Default for ManualEvent {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "sync_tests.rs"]
mod tests;

// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Claim arbitration: priority-ordered exclusive write tokens.
//!
//! Claims on one node form a ladder ordered by symbol; the top claim is
//! granted, all others are pending. Releasing the top promotes the next.
//! A holder never observes `granted` twice without an intervening `lost`.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

/// Totally ordered claim priority.
///
/// Lexicographic over its components; each program's symbol extends its
/// parent's, so descendants compare strictly greater than ancestors.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClaimSymbol(Vec<u64>);

impl ClaimSymbol {
    /// Symbol of the master's root program.
    pub fn root() -> Self {
        Self(vec![0])
    }

    /// Symbol for the `index`-th child created under this one.
    pub fn child(&self, index: u64) -> Self {
        let mut components = self.0.clone();
        components.push(index);
        Self(components)
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }
}

impl std::fmt::Display for ClaimSymbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self.0.iter().map(u64::to_string).collect();
        f.write_str(&parts.join("."))
    }
}

struct Entry {
    token: u64,
    symbol: ClaimSymbol,
    granted: watch::Sender<bool>,
}

#[derive(Default)]
struct Ladder {
    entries: Vec<Entry>,
    next_token: u64,
}

impl Ladder {
    /// Re-evaluate which entry holds the write right. The last entry in the
    /// sorted ladder is the top.
    fn regrant(&mut self) {
        let top = self.entries.len().checked_sub(1);
        for (index, entry) in self.entries.iter().enumerate() {
            let granted = Some(index) == top;
            entry.granted.send_if_modified(|current| {
                if *current != granted {
                    *current = granted;
                    true
                } else {
                    false
                }
            });
        }
    }
}

/// Arbiter for one node's claims.
#[derive(Clone, Default)]
pub struct Claimable {
    shared: Arc<Mutex<Ladder>>,
}

impl Claimable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire a claim ordered by `symbol`. Among equal symbols the later
    /// claim ranks higher.
    pub fn claim(&self, symbol: ClaimSymbol) -> Claim {
        let mut ladder = self.shared.lock();
        let token = ladder.next_token;
        ladder.next_token += 1;

        let (granted_tx, granted_rx) = watch::channel(false);
        let position = ladder.entries.partition_point(|entry| entry.symbol <= symbol);
        ladder.entries.insert(position, Entry { token, symbol, granted: granted_tx });
        ladder.regrant();

        Claim { token, shared: Arc::clone(&self.shared), granted: granted_rx, released: false }
    }

    /// Symbol of the currently granted claim, if any.
    pub fn holder(&self) -> Option<ClaimSymbol> {
        self.shared.lock().entries.last().map(|entry| entry.symbol.clone())
    }

    /// Number of live claims.
    pub fn len(&self) -> usize {
        self.shared.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.lock().entries.is_empty()
    }
}

/// Exclusive write token for one node. Released on drop.
pub struct Claim {
    token: u64,
    shared: Arc<Mutex<Ladder>>,
    granted: watch::Receiver<bool>,
    released: bool,
}

impl Claim {
    pub fn granted(&self) -> bool {
        *self.granted.borrow()
    }

    /// Resolve once the claim is granted.
    pub async fn wait(&mut self) {
        // The sender lives in the ladder entry; it only drops on release.
        let _ = self.granted.wait_for(|granted| *granted).await;
    }

    /// Resolve once a higher-priority claim preempts this one.
    pub async fn lost(&mut self) {
        let _ = self.granted.wait_for(|granted| !*granted).await;
    }

    /// Release the claim, promoting the next entry.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let mut ladder = self.shared.lock();
        ladder.entries.retain(|entry| entry.token != self.token);
        ladder.regrant();
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.release_inner();
    }
}

#[cfg(test)]
#[path = "claim_tests.rs"]
mod tests;

//! Cancellable Scopes
//!
//! Helpers shared by every task in the follower tree and the hub. A scope is
//! a [`CancellationToken`]; child scopes are child tokens, so cancelling a
//! node cancels its whole subtree.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Capacity of every queue between tree levels and towards a connection.
/// One slot is the closest a tokio channel gets to an unbuffered hand-off:
/// a producer stalls until the level below has taken the previous value.
pub const HANDOFF_CAPACITY: usize = 1;

/// Send on a bounded queue unless the scope is cancelled first.
///
/// Returns false when the scope was cancelled or the receiver is gone; the
/// caller should stop producing.
pub async fn send_scoped<T>(tx: &mpsc::Sender<T>, value: T, token: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = token.cancelled() => false,
        result = tx.send(value) => result.is_ok(),
    }
}

struct Child {
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// The live children of one tree node, keyed by identity.
///
/// Owned and mutated by the node's own task only.
pub struct Children<K> {
    parent: CancellationToken,
    live: HashMap<K, Child>,
}

impl<K> Children<K>
where
    K: Clone + Eq + Hash + Debug,
{
    pub fn new(parent: CancellationToken) -> Self {
        Self {
            parent,
            live: HashMap::new(),
        }
    }

    /// A new scope below the parent, for a child about to be created
    pub fn scope(&self) -> CancellationToken {
        self.parent.child_token()
    }

    /// Record the task following `key`. The caller must have retired any
    /// previous child with the same key.
    pub fn insert(&mut self, key: K, token: CancellationToken, task: JoinHandle<()>) {
        self.live.retain(|_, child| !child.task.is_finished());
        self.live.insert(key, Child { token, task });
    }

    /// Cancel the child following `key` and wait until its task, and with
    /// it every stream it owns, has finished. Returns whether a child was
    /// live.
    pub async fn retire(&mut self, key: &K) -> bool {
        match self.live.remove(key) {
            Some(child) => {
                child.token.cancel();
                if let Err(e) = child.task.await {
                    tracing::error!(key = ?key, error = %e, "Child task failed");
                }
                true
            }
            None => false,
        }
    }

    /// Number of children whose task is still running
    pub fn live_count(&self) -> usize {
        self.live.values().filter(|child| !child.task.is_finished()).count()
    }

    /// Cancel every child and wait for all of them
    pub async fn shutdown(mut self) {
        for child in self.live.values() {
            child.token.cancel();
        }
        for (key, child) in self.live.drain() {
            if let Err(e) = child.task.await {
                tracing::error!(key = ?key, error = %e, "Child task failed");
            }
        }
    }
}

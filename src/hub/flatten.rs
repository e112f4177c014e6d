//! Context Flattening
//!
//! Turns the tree of entity contexts into one stream of frames: an entity's
//! activation first, then its own events interleaved with the flattened
//! streams of its children, each child walked by its own task.

use std::convert::Infallible;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::events::Activation;
use crate::follower::{ContextParts, EntityContext};
use crate::scope::send_scoped;

/// A followed entity whose frames can be written to a connection
pub trait Flatten: Send + 'static {
    /// Walk this entity and its descendants in a background task
    fn spawn_flatten(self, frames: mpsc::Sender<String>, scope: CancellationToken);
}

impl Flatten for Infallible {
    fn spawn_flatten(self, _frames: mpsc::Sender<String>, _scope: CancellationToken) {
        match self {}
    }
}

impl<A, C> Flatten for EntityContext<A, C>
where
    A: Activation,
    C: Flatten,
{
    fn spawn_flatten(self, frames: mpsc::Sender<String>, scope: CancellationToken) {
        tokio::spawn(walk(self.into_parts(), frames, scope));
    }
}

async fn walk<A, C>(parts: ContextParts<A, C>, frames: mpsc::Sender<String>, scope: CancellationToken)
where
    A: Activation,
    C: Flatten,
{
    let ContextParts {
        activation,
        mut events,
        mut children,
        scope: entity,
    } = parts;

    // A retired entity may still sit in its parent's queue.
    if entity.is_cancelled() {
        return;
    }
    if !send_scoped(&frames, activation.raw().to_string(), &scope).await {
        return;
    }

    let mut events_open = true;
    let mut children_open = true;
    while events_open || children_open {
        tokio::select! {
            _ = scope.cancelled() => break,
            _ = entity.cancelled() => break,
            event = events.recv(), if events_open => match event {
                Some(_) if entity.is_cancelled() => break,
                Some(raw) => {
                    if !send_scoped(&frames, raw.text, &scope).await {
                        break;
                    }
                }
                None => events_open = false,
            },
            child = children.recv(), if children_open => match child {
                Some(_) if entity.is_cancelled() => break,
                Some(child) => child.spawn_flatten(frames.clone(), scope.clone()),
                None => children_open = false,
            },
        }
    }

    tracing::trace!(key = ?activation.key(), "Context drained");
}

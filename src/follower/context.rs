//! Entity Contexts
//!
//! A context is what the follower hands out for every entity it starts
//! following: the activation, a queue of raw events belonging to the entity
//! itself, and a queue of child contexts. Both queues close for good when
//! the entity is superseded, deactivated, or one of its ancestors goes away.

use std::convert::Infallible;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::events::{Activation, CompetitionActivated, DistanceActivated, HeatActivated, Raw};
use crate::scope::HANDOFF_CAPACITY;

/// A followed competition; its children are distances
pub type CompetitionContext = EntityContext<CompetitionActivated, DistanceContext>;

/// A followed distance; its children are heats
pub type DistanceContext = EntityContext<DistanceActivated, HeatContext>;

/// A followed heat. Heats have no children.
pub type HeatContext = EntityContext<HeatActivated, Infallible>;

/// A live entity in the followed tree
pub struct EntityContext<A: Activation, C> {
    activation: A,
    events: mpsc::Receiver<Raw>,
    children: mpsc::Receiver<C>,
    scope: CancellationToken,
}

/// Producer side of a context, owned by the task following the entity
pub(crate) struct ContextSenders<C> {
    pub events: mpsc::Sender<Raw>,
    pub children: mpsc::Sender<C>,
}

/// A context taken apart, for consumers that drain both queues at once
pub struct ContextParts<A, C> {
    pub activation: A,
    pub events: mpsc::Receiver<Raw>,
    pub children: mpsc::Receiver<C>,
    /// Cancelled when the entity stops being followed
    pub scope: CancellationToken,
}

impl<A: Activation, C> EntityContext<A, C> {
    pub(crate) fn new(activation: A, scope: CancellationToken) -> (Self, ContextSenders<C>) {
        let (events_tx, events) = mpsc::channel(HANDOFF_CAPACITY);
        let (children_tx, children) = mpsc::channel(HANDOFF_CAPACITY);
        let context = Self {
            activation,
            events,
            children,
            scope,
        };
        let senders = ContextSenders {
            events: events_tx,
            children: children_tx,
        };
        (context, senders)
    }

    pub fn activation(&self) -> &A {
        &self.activation
    }

    pub fn key(&self) -> A::Key {
        self.activation.key()
    }

    /// The activation bytes as received from the broker
    pub fn raw_activation(&self) -> &str {
        self.activation.raw()
    }

    /// Next raw event of this entity, `None` once the context is closed.
    ///
    /// A value still parked in the queue when the entity is retired is
    /// never handed out.
    pub async fn next_event(&mut self) -> Option<Raw> {
        tokio::select! {
            biased;
            _ = self.scope.cancelled() => None,
            event = self.events.recv() => event,
        }
    }

    /// Next child context, `None` once the context is closed
    pub async fn next_child(&mut self) -> Option<C> {
        tokio::select! {
            biased;
            _ = self.scope.cancelled() => None,
            child = self.children.recv() => child,
        }
    }

    /// Whether the entity has been superseded, deactivated or torn down
    pub fn is_cancelled(&self) -> bool {
        self.scope.is_cancelled()
    }

    /// Wait until the entity is no longer followed
    pub async fn cancelled(&self) {
        self.scope.cancelled().await
    }

    pub fn into_parts(self) -> ContextParts<A, C> {
        ContextParts {
            activation: self.activation,
            events: self.events,
            children: self.children,
            scope: self.scope,
        }
    }
}

impl<A: Activation, C> std::fmt::Debug for EntityContext<A, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityContext")
            .field("key", &self.activation.key())
            .field("cancelled", &self.scope.is_cancelled())
            .finish()
    }
}

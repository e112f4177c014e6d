//! Event Source
//!
//! Maps the competition hierarchy onto broker subjects. Every operation
//! subscribes immediately (so connection errors surface to the caller) and
//! then returns a queue fed by a pump task. Messages that fail to decode are
//! logged and dropped; the queue only closes when the scope is cancelled or
//! the broker ends the subscription.
//!
//! | Operation | Start position |
//! |---|---|
//! | competition activations | `now - history` |
//! | distance / heat activations | last received |
//! | competition / distance / heat events | activation timestamp |

pub mod subjects;

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::broker::{Broker, BrokerError, BrokerMessage, StartPosition, Subscription};
use crate::events::{
    Activation, CompetitionActivated, DecodeResult, DistanceActivated, HeatActivated, Raw, Signal,
};
use crate::scope::{send_scoped, HANDOFF_CAPACITY};

/// Errors raised when setting up a stream
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Failed to subscribe to {subject}: {source}")]
    Subscribe {
        subject: String,
        #[source]
        source: BrokerError,
    },

    #[error("History window {0:?} is out of range")]
    InvalidHistory(Duration),
}

/// Result type alias for source operations
pub type SourceResult<T> = Result<T, SourceError>;

/// Activation and event streams for the competition hierarchy
#[derive(Clone)]
pub struct Source {
    broker: Arc<dyn Broker>,
}

impl Source {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    async fn subscribe(&self, subject: &str, start: StartPosition) -> SourceResult<Subscription> {
        self.broker
            .subscribe(subject, start)
            .await
            .map_err(|source| SourceError::Subscribe {
                subject: subject.to_string(),
                source,
            })
    }

    /// Competition activations from `history` ago through to live
    pub async fn competition_activations(
        &self,
        token: &CancellationToken,
        history: Duration,
    ) -> SourceResult<mpsc::Receiver<Signal<CompetitionActivated>>> {
        let window =
            chrono::Duration::from_std(history).map_err(|_| SourceError::InvalidHistory(history))?;
        let since = Utc::now()
            .checked_sub_signed(window)
            .ok_or(SourceError::InvalidHistory(history))?;
        let sub = self
            .subscribe(subjects::COMPETITION_ACTIVATIONS, StartPosition::AtTime(since))
            .await?;

        let (tx, rx) = mpsc::channel(HANDOFF_CAPACITY);
        spawn_pump(sub, tx, token.clone(), decode_signal::<CompetitionActivated>);
        Ok(rx)
    }

    /// Raw events of a competition from its activation onwards
    pub async fn competition_events(
        &self,
        token: &CancellationToken,
        since: &CompetitionActivated,
    ) -> SourceResult<mpsc::Receiver<Raw>> {
        let subject = subjects::competition_events(&since.competition_id);
        self.events(token, &subject, since).await
    }

    /// Distance activations of a competition. The most recent activation is
    /// always delivered first, however old it is.
    pub async fn distance_activations(
        &self,
        token: &CancellationToken,
        competition_id: &str,
    ) -> SourceResult<mpsc::Receiver<Signal<DistanceActivated>>> {
        let subject = subjects::distance_activations(competition_id);
        let sub = self.subscribe(&subject, StartPosition::LastReceived).await?;

        let (tx, rx) = mpsc::channel(HANDOFF_CAPACITY);
        spawn_pump(sub, tx, token.clone(), decode_signal::<DistanceActivated>);
        Ok(rx)
    }

    /// Raw events of a distance from its activation onwards
    pub async fn distance_events(
        &self,
        token: &CancellationToken,
        since: &DistanceActivated,
    ) -> SourceResult<mpsc::Receiver<Raw>> {
        let subject = subjects::distance_events(&since.competition_id, &since.distance_id);
        self.events(token, &subject, since).await
    }

    /// Heat activations of a distance, merged over the given groups. An
    /// empty group list follows group 0.
    pub async fn heat_activations(
        &self,
        token: &CancellationToken,
        competition_id: &str,
        distance_id: &str,
        groups: &[u32],
    ) -> SourceResult<mpsc::Receiver<Signal<HeatActivated>>> {
        let groups = if groups.is_empty() { &[0][..] } else { groups };

        // Subscribe to every group before pumping any, so a failure leaves
        // nothing running.
        let mut subscriptions = Vec::with_capacity(groups.len());
        for &group in groups {
            let subject = subjects::heat_activations(competition_id, distance_id, group);
            subscriptions.push(self.subscribe(&subject, StartPosition::LastReceived).await?);
        }

        let (tx, rx) = mpsc::channel(HANDOFF_CAPACITY);
        for sub in subscriptions {
            spawn_pump(sub, tx.clone(), token.clone(), decode_signal::<HeatActivated>);
        }
        Ok(rx)
    }

    /// Raw events of a heat from its activation onwards
    pub async fn heat_events(
        &self,
        token: &CancellationToken,
        since: &HeatActivated,
    ) -> SourceResult<mpsc::Receiver<Raw>> {
        let subject = subjects::heat_events(&since.competition_id, &since.distance_id, since.heat);
        self.events(token, &subject, since).await
    }

    async fn events<A: Activation>(
        &self,
        token: &CancellationToken,
        subject: &str,
        since: &A,
    ) -> SourceResult<mpsc::Receiver<Raw>> {
        let sub = self
            .subscribe(subject, StartPosition::AtTime(since.time()))
            .await?;

        let (tx, rx) = mpsc::channel(HANDOFF_CAPACITY);
        spawn_pump(sub, tx, token.clone(), decode_raw);
        Ok(rx)
    }
}

fn decode_signal<A: Activation>(message: &BrokerMessage) -> DecodeResult<Signal<A>> {
    A::decode(&message.data, message.timestamp)
}

fn decode_raw(message: &BrokerMessage) -> DecodeResult<Raw> {
    Raw::decode(&message.data)
}

/// Forward decoded messages from a subscription until the scope is
/// cancelled or nobody reads the queue anymore. The subscription is dropped
/// (unsubscribed) when the pump ends.
fn spawn_pump<T: Send + 'static>(
    mut sub: Subscription,
    tx: mpsc::Sender<T>,
    token: CancellationToken,
    decode: fn(&BrokerMessage) -> DecodeResult<T>,
) {
    tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                message = sub.next() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            let value = match decode(&message) {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!(
                        subject = %sub.subject(),
                        sequence = message.sequence,
                        error = %e,
                        "Failed to decode message"
                    );
                    continue;
                }
            };
            tracing::trace!(subject = %sub.subject(), sequence = message.sequence, "Received message");
            if !send_scoped(&tx, value, &token).await {
                break;
            }
        }
        tracing::debug!(subject = %sub.subject(), "Unsubscribed");
    });
}

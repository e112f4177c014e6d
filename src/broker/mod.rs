//! Message Broker Boundary
//!
//! The hub only needs two things from a broker: subscribe to a subject from
//! a start position, and receive messages in order until it stops caring.
//! Dropping a [`Subscription`] unsubscribes.
//!
//! [`MemoryBroker`] is an in-process implementation with the same replay
//! semantics as the production broker.

mod memory;

pub use memory::{MemoryBroker, SeedRecord};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;

/// Where a new subscription starts delivering from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    /// Every message with a timestamp at or after the given time, then live
    AtTime(DateTime<Utc>),
    /// The most recent message (if any), then live
    LastReceived,
}

/// A message delivered on a subscription
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    pub subject: String,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub data: Vec<u8>,
}

/// An active subscription. Messages arrive in broker order.
pub struct Subscription {
    subject: String,
    receiver: mpsc::UnboundedReceiver<BrokerMessage>,
}

impl Subscription {
    pub fn new(subject: impl Into<String>, receiver: mpsc::UnboundedReceiver<BrokerMessage>) -> Self {
        Self {
            subject: subject.into(),
            receiver,
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Next message, or `None` once the broker closes the subscription
    pub async fn next(&mut self) -> Option<BrokerMessage> {
        self.receiver.recv().await
    }
}

/// A publish/subscribe broker with replay
#[async_trait]
pub trait Broker: Send + Sync {
    /// Subscribe to an exact subject
    async fn subscribe(
        &self,
        subject: &str,
        start: StartPosition,
    ) -> Result<Subscription, BrokerError>;
}

/// Errors that can occur talking to the broker
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Broker unreachable: {0}")]
    Unreachable(String),

    #[error("Invalid subject: {0:?}")]
    InvalidSubject(String),

    #[error("Broker closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid seed record on line {line}: {error}")]
    Seed { line: usize, error: String },
}

/// Check that a subject is a dot-separated list of non-empty tokens without
/// whitespace or wildcards.
pub fn validate_subject(subject: &str) -> Result<(), BrokerError> {
    let valid = !subject.is_empty()
        && subject.split('.').all(|token| {
            !token.is_empty()
                && token != "*"
                && token != ">"
                && !token.chars().any(char::is_whitespace)
        });
    if valid {
        Ok(())
    } else {
        Err(BrokerError::InvalidSubject(subject.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_subject() {
        assert!(validate_subject("competition.activations").is_ok());
        assert!(validate_subject("competition.A.distances.d1.heats.1.2").is_ok());

        assert!(validate_subject("").is_err());
        assert!(validate_subject("competition..activations").is_err());
        assert!(validate_subject("competition.*").is_err());
        assert!(validate_subject("competition.>").is_err());
        assert!(validate_subject("competition.my id").is_err());
    }

    #[test]
    fn test_error_display() {
        let err = BrokerError::InvalidSubject("a..b".to_string());
        assert_eq!(err.to_string(), "Invalid subject: \"a..b\"");
    }
}

//! In-Memory Broker
//!
//! Keeps every published message per subject and replays them to new
//! subscribers according to their [`StartPosition`]. Used as the `memory`
//! driver and by the tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::{mpsc, Mutex};

use super::{validate_subject, Broker, BrokerError, BrokerMessage, StartPosition, Subscription};

/// In-process broker with time-based and last-received replay
#[derive(Default)]
pub struct MemoryBroker {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    sequence: u64,
    closed: bool,
    topics: HashMap<String, Topic>,
}

#[derive(Default)]
struct Topic {
    log: Vec<BrokerMessage>,
    subscribers: Vec<mpsc::UnboundedSender<BrokerMessage>>,
}

/// One line of a seed file
#[derive(Debug, Clone, Deserialize)]
pub struct SeedRecord {
    pub subject: String,
    /// Broker timestamp (default: load time)
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
    pub event: serde_json::Value,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a message stamped with the current time
    pub async fn publish(
        &self,
        subject: &str,
        data: impl Into<Vec<u8>>,
    ) -> Result<u64, BrokerError> {
        self.publish_at(subject, data, Utc::now()).await
    }

    /// Publish a message with an explicit broker timestamp
    pub async fn publish_at(
        &self,
        subject: &str,
        data: impl Into<Vec<u8>>,
        timestamp: DateTime<Utc>,
    ) -> Result<u64, BrokerError> {
        validate_subject(subject)?;
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(BrokerError::Closed);
        }
        inner.sequence += 1;
        let message = BrokerMessage {
            subject: subject.to_string(),
            sequence: inner.sequence,
            timestamp,
            data: data.into(),
        };
        let topic = inner.topics.entry(subject.to_string()).or_default();
        topic
            .subscribers
            .retain(|subscriber| subscriber.send(message.clone()).is_ok());
        topic.log.push(message.clone());

        tracing::trace!(subject = %subject, sequence = message.sequence, "Published message");
        Ok(message.sequence)
    }

    /// Number of live subscriptions on a subject
    pub async fn subscriber_count(&self, subject: &str) -> usize {
        let mut inner = self.inner.lock().await;
        match inner.topics.get_mut(subject) {
            Some(topic) => {
                topic.subscribers.retain(|subscriber| !subscriber.is_closed());
                topic.subscribers.len()
            }
            None => 0,
        }
    }

    /// Close every subscription and refuse new ones, as if the broker
    /// had gone away
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        inner.closed = true;
        for topic in inner.topics.values_mut() {
            topic.subscribers.clear();
        }
    }

    /// Publish every record of a JSON-lines seed file, in file order.
    ///
    /// Returns the number of records published.
    pub async fn load_seed(&self, path: &Path) -> Result<usize, BrokerError> {
        let content = tokio::fs::read_to_string(path).await?;
        let mut count = 0;
        for (index, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: SeedRecord =
                serde_json::from_str(line).map_err(|e| BrokerError::Seed {
                    line: index + 1,
                    error: e.to_string(),
                })?;
            let data = serde_json::to_vec(&record.event).map_err(|e| BrokerError::Seed {
                line: index + 1,
                error: e.to_string(),
            })?;
            self.publish_at(&record.subject, data, record.time.unwrap_or_else(Utc::now))
                .await?;
            count += 1;
        }

        tracing::info!(path = ?path, records = count, "Loaded broker seed");
        Ok(count)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn subscribe(
        &self,
        subject: &str,
        start: StartPosition,
    ) -> Result<Subscription, BrokerError> {
        validate_subject(subject)?;
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(BrokerError::Unreachable("broker is closed".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let topic = inner.topics.entry(subject.to_string()).or_default();

        // Backlog and registration happen under the same lock, so no message
        // is lost or duplicated between replay and live delivery.
        let backlog: Vec<&BrokerMessage> = match start {
            StartPosition::AtTime(since) => topic
                .log
                .iter()
                .filter(|message| message.timestamp >= since)
                .collect(),
            StartPosition::LastReceived => topic.log.last().into_iter().collect(),
        };
        for message in backlog {
            // The receiver is still in scope, so this cannot fail.
            let _ = tx.send(message.clone());
        }
        topic.subscribers.push(tx);

        tracing::debug!(subject = %subject, start = ?start, "Subscribed");
        Ok(Subscription::new(subject, rx))
    }
}

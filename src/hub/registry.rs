//! Connection Registry
//!
//! Tracks the live push connections for limits and health reporting. The
//! registry never writes to a connection; each connection owns its writer.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::error::HubError;

/// Unique identifier for a push connection
pub type ConnectionId = String;

/// What is known about a live connection
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub remote_address: SocketAddr,
    pub endpoint: String,
    pub connected_at: DateTime<Utc>,
}

/// Live connections, bounded by `max_connections`
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, ConnectionInfo>>,
    max_connections: usize,
}

impl ConnectionRegistry {
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            max_connections,
        }
    }

    /// Register a new connection
    ///
    /// Returns the connection ID on success, or an error if the connection
    /// limit has been reached.
    pub async fn register(
        &self,
        remote_address: SocketAddr,
        endpoint: impl Into<String>,
    ) -> Result<ConnectionId, HubError> {
        let mut connections = self.connections.write().await;
        if connections.len() >= self.max_connections {
            return Err(HubError::TooManyConnections);
        }

        let id = Uuid::new_v4().to_string();
        let info = ConnectionInfo {
            remote_address,
            endpoint: endpoint.into(),
            connected_at: Utc::now(),
        };
        tracing::info!(
            connection_id = %id,
            remote_address = %info.remote_address,
            endpoint = %info.endpoint,
            "Client connected"
        );
        connections.insert(id.clone(), info);
        Ok(id)
    }

    pub async fn unregister(&self, id: &str) {
        if let Some(info) = self.connections.write().await.remove(id) {
            let duration = Utc::now().signed_duration_since(info.connected_at);
            tracing::info!(
                connection_id = %id,
                remote_address = %info.remote_address,
                connected_secs = duration.num_seconds(),
                "Client disconnected"
            );
        }
    }

    /// Whether a new connection would be refused
    pub async fn is_full(&self) -> bool {
        self.connections.read().await.len() >= self.max_connections
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn get(&self, id: &str) -> Option<ConnectionInfo> {
        self.connections.read().await.get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_register_and_unregister() {
        let registry = ConnectionRegistry::new(10);
        let id = registry.register(addr(), "/v1/competitions").await.unwrap();
        assert_eq!(registry.connection_count().await, 1);
        assert_eq!(registry.get(&id).await.unwrap().endpoint, "/v1/competitions");

        registry.unregister(&id).await;
        assert_eq!(registry.connection_count().await, 0);
        assert!(registry.get(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let registry = ConnectionRegistry::new(1);
        let first = registry.register(addr(), "/v1/competitions").await.unwrap();
        assert!(registry.is_full().await);
        assert!(matches!(
            registry.register(addr(), "/v1/competitions").await,
            Err(HubError::TooManyConnections)
        ));

        registry.unregister(&first).await;
        assert!(!registry.is_full().await);
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let registry = ConnectionRegistry::new(10);
        let a = registry.register(addr(), "a").await.unwrap();
        let b = registry.register(addr(), "b").await.unwrap();
        assert_ne!(a, b);
    }
}

//! One connection per network name.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::client::{self, ClientHandle};
use crate::config::ConnectionConfig;
use crate::error::Result;

/// Owns a [`ClientHandle`] per network. Cloning shares the same map.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    /// network name → handle.
    connections: Arc<Mutex<HashMap<String, ClientHandle>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect `network`, replacing (and disconnecting) any previous
    /// connection under that name.
    pub async fn connect(&self, network: &str, config: ConnectionConfig) -> Result<ClientHandle> {
        let handle = client::connect(config, network).await?;
        let previous = self
            .connections
            .lock()
            .await
            .insert(network.to_string(), handle.clone());
        if let Some(old) = previous {
            tracing::info!(%network, "Replacing existing connection");
            old.disconnect(Some("Reconnecting"));
        }
        Ok(handle)
    }

    pub async fn get(&self, network: &str) -> Option<ClientHandle> {
        self.connections.lock().await.get(network).cloned()
    }

    /// Disconnect and forget `network`. Returns false if it was unknown.
    pub async fn disconnect(&self, network: &str, reason: Option<&str>) -> bool {
        match self.connections.lock().await.remove(network) {
            Some(handle) => {
                handle.disconnect(reason);
                true
            }
            None => false,
        }
    }

    pub async fn disconnect_all(&self, reason: Option<&str>) {
        let handles: Vec<_> = self.connections.lock().await.drain().collect();
        for (network, handle) in handles {
            tracing::debug!(%network, "Disconnecting");
            handle.disconnect(reason);
        }
    }

    /// Network names, sorted.
    pub async fn networks(&self) -> Vec<String> {
        let mut names: Vec<_> = self.connections.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Drop handles whose connection task has ended. Returns their names.
    pub async fn prune(&self) -> Vec<String> {
        let mut map = self.connections.lock().await;
        let mut closed: Vec<_> = map
            .iter()
            .filter(|(_, h)| h.is_closed())
            .map(|(n, _)| n.clone())
            .collect();
        for name in &closed {
            map.remove(name);
        }
        closed.sort();
        closed
    }

    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_registry() {
        let reg = ConnectionRegistry::new();
        assert!(reg.is_empty().await);
        assert!(reg.get("libera").await.is_none());
        assert!(!reg.disconnect("libera", None).await);
        assert!(reg.prune().await.is_empty());
    }

    #[tokio::test]
    async fn failed_connect_is_not_registered() {
        let reg = ConnectionRegistry::new();
        let err = reg
            .connect("bad", ConnectionConfig::new("", 6667, "me"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
        assert!(reg.networks().await.is_empty());
    }
}

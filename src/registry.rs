use crate::connection::NodeConnection;
use crate::error::{LinkError, Result};
use std::collections::BTreeMap;
use tokio::task::JoinHandle;

struct RegisteredNode {
    connection: NodeConnection,
    /// Task forwarding this node's signals to the manager
    listener: Option<JoinHandle<()>>,
}

/// Node connections keyed by host
#[derive(Default)]
pub struct NodeRegistry {
    nodes: BTreeMap<String, RegisteredNode>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection under its host
    pub fn insert(&mut self, connection: NodeConnection, listener: Option<JoinHandle<()>>) -> Result<()> {
        let host = connection.host().to_string();
        if self.nodes.contains_key(&host) {
            if let Some(listener) = listener {
                listener.abort();
            }
            return Err(LinkError::NodeAlreadyExists(host));
        }

        self.nodes.insert(host, RegisteredNode { connection, listener });
        Ok(())
    }

    pub fn get(&self, host: &str) -> Option<&NodeConnection> {
        self.nodes.get(host).map(|node| &node.connection)
    }

    pub fn contains(&self, host: &str) -> bool {
        self.nodes.contains_key(host)
    }

    /// Unregister a connection, detaching its listener first
    ///
    /// The connection itself is returned open; closing it is up to the caller.
    pub fn remove(&mut self, host: &str) -> Option<NodeConnection> {
        let node = self.nodes.remove(host)?;
        if let Some(listener) = node.listener {
            listener.abort();
        }
        Some(node.connection)
    }

    /// Remove every connection, detaching all listeners
    pub fn drain(&mut self) -> Vec<NodeConnection> {
        let hosts: Vec<String> = self.nodes.keys().cloned().collect();
        hosts.iter().filter_map(|host| self.remove(host)).collect()
    }

    pub fn hosts(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    pub fn connections(&self) -> impl Iterator<Item = &NodeConnection> {
        self.nodes.values().map(|node| &node.connection)
    }

    /// The open node with the lowest load penalty, if any
    pub fn best(&self) -> Option<&NodeConnection> {
        self.connections()
            .filter(|node| node.is_open())
            .min_by_key(|node| node.penalty())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeConfig;
    use serde_json::json;

    #[tokio::test]
    async fn hosts_are_unique() {
        let mut registry = NodeRegistry::new();
        let (first, _rx1) = NodeConnection::open_detached(NodeConfig::new("a"));
        let (second, _rx2) = NodeConnection::open_detached(NodeConfig::new("a"));

        registry.insert(first.clone(), None).unwrap();
        assert!(matches!(
            registry.insert(second, None),
            Err(LinkError::NodeAlreadyExists(host)) if host == "a"
        ));
        assert!(registry.get("a").unwrap().ptr_eq(&first));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn remove_aborts_listener() {
        let mut registry = NodeRegistry::new();
        let (node, _rx) = NodeConnection::open_detached(NodeConfig::new("a"));
        let listener = tokio::spawn(std::future::pending::<()>());

        registry.insert(node, Some(listener)).unwrap();
        let removed = registry.remove("a");

        assert!(removed.is_some());
        assert!(registry.is_empty());
        assert!(registry.remove("a").is_none());
    }

    #[tokio::test]
    async fn best_prefers_least_loaded_open_node() {
        let mut registry = NodeRegistry::new();
        let (busy, _rx1) = NodeConnection::open_detached(NodeConfig::new("busy"));
        let (idle, _rx2) = NodeConnection::open_detached(NodeConfig::new("idle"));
        let (closed, _rx3) = NodeConnection::open_detached(NodeConfig::new("closed"));

        busy.simulate_frame(&json!({"op": "stats", "playingPlayers": 30}).to_string());
        idle.simulate_frame(&json!({"op": "stats", "playingPlayers": 1}).to_string());
        closed.simulate_close();

        registry.insert(busy, None).unwrap();
        registry.insert(idle, None).unwrap();
        registry.insert(closed, None).unwrap();

        assert_eq!(registry.best().map(|node| node.host()), Some("idle"));
        assert_eq!(registry.hosts(), vec!["busy", "closed", "idle"]);
    }
}

//! Tracks live edge and consumer WebSocket connections and does single-target
//! delivery. Knows nothing about topics or persistence.

use std::collections::HashMap;

use axum::extract::ws::{CloseFrame, Message};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;

/// Close code sent to a displaced edge connection (RFC 6455 "normal closure").
const CLOSE_CODE_NORMAL: u16 = 1000;
const REPLACED_CLOSE_REASON: &str = "replaced by new connection";

/// A handle to a connected socket's writer task. Cloning is cheap; dropping
/// the last handle does not close the socket (the writer task owns that).
#[derive(Clone)]
pub struct ConnectionHandle {
    sender: mpsc::UnboundedSender<Message>,
}

impl ConnectionHandle {
    pub fn new(sender: mpsc::UnboundedSender<Message>) -> Self {
        Self { sender }
    }

    fn send_json<T: Serialize>(&self, message: &T) -> bool {
        let Ok(text) = serde_json::to_string(message) else {
            return false;
        };
        self.sender.send(Message::Text(text.into())).is_ok()
    }

    fn send_close(&self, code: u16, reason: &'static str) {
        let _ = self.sender.send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })));
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub active_edge_connections: usize,
    pub active_consumer_connections: usize,
    pub connected_users: Vec<String>,
}

struct Maps {
    edges: HashMap<String, ConnectionHandle>,
    consumers: HashMap<String, ConnectionHandle>,
}

/// Tracks one edge connection per user_id and one consumer connection per
/// consumer handle. A single lock guards both maps — the simplest correct
/// implementation for the contention this sees in practice.
pub struct ConnectionRegistry {
    maps: RwLock<Maps>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            maps: RwLock::new(Maps {
                edges: HashMap::new(),
                consumers: HashMap::new(),
            }),
        }
    }

    /// Register an edge connection. If one already exists for this user_id,
    /// it is replaced (last-writer-wins) and sent a normal-closure frame with
    /// an explicit "replaced by new connection" reason.
    pub fn connect_edge(&self, user_id: &str, handle: ConnectionHandle) {
        let prior = {
            let mut maps = self.maps.write();
            maps.edges.insert(user_id.to_string(), handle)
        };
        if let Some(prior) = prior {
            prior.send_close(CLOSE_CODE_NORMAL, REPLACED_CLOSE_REASON);
        }
    }

    pub fn disconnect_edge(&self, user_id: &str) {
        self.maps.write().edges.remove(user_id);
    }

    /// Send `message` to the edge for `user_id`. Returns whether delivery was
    /// attempted successfully; on failure the dead entry is removed. Never retries.
    pub fn send_to_edge<T: Serialize>(&self, user_id: &str, message: &T) -> bool {
        let handle = {
            let maps = self.maps.read();
            maps.edges.get(user_id).cloned()
        };
        let Some(handle) = handle else {
            return false;
        };
        if handle.send_json(message) {
            true
        } else {
            self.disconnect_edge(user_id);
            false
        }
    }

    pub fn connect_consumer(&self, consumer_id: &str, handle: ConnectionHandle) {
        self.maps
            .write()
            .consumers
            .insert(consumer_id.to_string(), handle);
    }

    pub fn disconnect_consumer(&self, consumer_id: &str) {
        self.maps.write().consumers.remove(consumer_id);
    }

    pub fn stats(&self) -> RegistryStats {
        let maps = self.maps.read();
        RegistryStats {
            active_edge_connections: maps.edges.len(),
            active_consumer_connections: maps.consumers.len(),
            connected_users: maps.edges.keys().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> (ConnectionHandle, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionHandle::new(tx), rx)
    }

    #[test]
    fn connect_and_send_to_edge() {
        let registry = ConnectionRegistry::new();
        let (h, mut rx) = handle();
        registry.connect_edge("u1", h);

        let delivered = registry.send_to_edge("u1", &serde_json::json!({"type": "heartbeat_ack"}));
        assert!(delivered);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn send_to_unknown_user_is_not_delivered() {
        let registry = ConnectionRegistry::new();
        assert!(!registry.send_to_edge("ghost", &serde_json::json!({})));
    }

    #[test]
    fn disconnect_edge_is_idempotent() {
        let registry = ConnectionRegistry::new();
        registry.disconnect_edge("u1");
        registry.disconnect_edge("u1");
    }

    #[test]
    fn reconnecting_edge_closes_prior_connection() {
        let registry = ConnectionRegistry::new();
        let (h1, mut rx1) = handle();
        let (h2, _rx2) = handle();

        registry.connect_edge("u1", h1);
        registry.connect_edge("u1", h2);

        match rx1.try_recv() {
            Ok(Message::Close(Some(frame))) => {
                assert_eq!(frame.code, CLOSE_CODE_NORMAL);
                assert_eq!(frame.reason, REPLACED_CLOSE_REASON);
            }
            other => panic!("expected a close frame, got {other:?}"),
        }
    }

    #[test]
    fn send_failure_removes_dead_entry() {
        let registry = ConnectionRegistry::new();
        let (h, rx) = handle();
        drop(rx); // receiver gone: sends will fail
        registry.connect_edge("u1", h);

        let delivered = registry.send_to_edge("u1", &serde_json::json!({}));
        assert!(!delivered);
        assert!(!registry.send_to_edge("u1", &serde_json::json!({})));
    }

    #[test]
    fn consumer_connect_disconnect_symmetric() {
        let registry = ConnectionRegistry::new();
        let (h, _rx) = handle();
        registry.connect_consumer("c1", h);
        assert_eq!(registry.stats().active_consumer_connections, 1);
        registry.disconnect_consumer("c1");
        assert_eq!(registry.stats().active_consumer_connections, 0);
    }

    #[test]
    fn stats_reports_connected_users() {
        let registry = ConnectionRegistry::new();
        let (h1, _rx1) = handle();
        let (h2, _rx2) = handle();
        registry.connect_edge("u1", h1);
        registry.connect_edge("u2", h2);

        let stats = registry.stats();
        assert_eq!(stats.active_edge_connections, 2);
        let mut users = stats.connected_users.clone();
        users.sort();
        assert_eq!(users, vec!["u1".to_string(), "u2".to_string()]);
    }
}

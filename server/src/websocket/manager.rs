//! WebSocket connection manager.
//!
//! Tracks active WebSocket connections, the branch each one is bound to, and
//! fans out pre-serialized frames.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use super::{Frame, ServerMessage};

/// Sender for WebSocket frames.
pub type FrameSender = mpsc::UnboundedSender<Frame>;

/// A single WebSocket connection.
#[derive(Debug)]
pub struct Connection {
    /// Unique identifier for this connection
    pub id: String,
    /// Branch bound by the query string or `hello`
    pub branch_id: Option<String>,
    pub role: Option<String>,
    /// Channel to send frames to this connection
    pub sender: FrameSender,
}

/// Manages active WebSocket connections.
///
/// Thread-safe and can be shared across handlers via `Arc`.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    /// All active connections, keyed by connection ID.
    connections: DashMap<String, Connection>,
    /// Index of connections by branch for branch broadcasts.
    by_branch: DashMap<String, Vec<String>>,
    /// Broadcast cycle counter.
    cycle: AtomicU64,
}

impl ConnectionManager {
    /// Create a new connection manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new connection manager wrapped in Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a new connection.
    ///
    /// Returns the connection ID.
    pub fn register(&self, sender: FrameSender) -> String {
        let conn_id = uuid::Uuid::new_v4().to_string();
        self.connections.insert(
            conn_id.clone(),
            Connection {
                id: conn_id.clone(),
                branch_id: None,
                role: None,
                sender,
            },
        );
        tracing::info!(conn_id = %conn_id, "WebSocket connection registered");
        conn_id
    }

    /// Bind a connection to a branch, replacing any earlier binding.
    pub fn bind(&self, conn_id: &str, branch_id: &str, role: Option<String>) {
        let previous = match self.connections.get_mut(conn_id) {
            Some(mut conn) => {
                conn.role = role.or(conn.role.take());
                conn.branch_id.replace(branch_id.to_string())
            }
            None => return,
        };
        if let Some(previous) = previous {
            self.remove_from_index(&previous, conn_id);
        }
        self.by_branch
            .entry(branch_id.to_string())
            .or_default()
            .push(conn_id.to_string());
        tracing::debug!(conn_id = %conn_id, branch_id = %branch_id, "connection bound to branch");
    }

    fn remove_from_index(&self, branch_id: &str, conn_id: &str) {
        if let Some(mut conn_ids) = self.by_branch.get_mut(branch_id) {
            conn_ids.retain(|id| id != conn_id);
            // Clean up empty entries
            if conn_ids.is_empty() {
                drop(conn_ids);
                self.by_branch.remove(branch_id);
            }
        }
    }

    /// Unregister a connection.
    pub fn unregister(&self, conn_id: &str) {
        if let Some((_, conn)) = self.connections.remove(conn_id) {
            if let Some(branch_id) = &conn.branch_id {
                self.remove_from_index(branch_id, conn_id);
            }
            tracing::info!(
                conn_id = %conn_id,
                branch_id = ?conn.branch_id,
                "WebSocket connection unregistered"
            );
        }
    }

    /// Branch a connection is bound to.
    pub fn branch_of(&self, conn_id: &str) -> Option<String> {
        self.connections
            .get(conn_id)
            .and_then(|conn| conn.branch_id.clone())
    }

    /// Serialize `message` once for a new broadcast cycle.
    pub fn frame(&self, message: &ServerMessage) -> Option<Frame> {
        let cycle = self.cycle.fetch_add(1, Ordering::Relaxed) + 1;
        match Frame::encode(cycle, message) {
            Ok(frame) => Some(frame),
            Err(e) => {
                tracing::error!("Failed to serialize WebSocket message: {}", e);
                None
            }
        }
    }

    /// Send a message to a specific connection.
    pub fn send_to(&self, conn_id: &str, message: &ServerMessage) -> bool {
        match self.frame(message) {
            Some(frame) => self.send_frame(conn_id, frame),
            None => false,
        }
    }

    fn send_frame(&self, conn_id: &str, frame: Frame) -> bool {
        self.connections
            .get(conn_id)
            .is_some_and(|conn| conn.sender.send(frame).is_ok())
    }

    /// Send one shared frame to each listed connection.
    ///
    /// Returns the number of connections that received the message.
    pub fn send_to_many<'a, I>(&self, conn_ids: I, message: &ServerMessage) -> usize
    where
        I: IntoIterator<Item = &'a String>,
    {
        let Some(frame) = self.frame(message) else {
            return 0;
        };
        conn_ids
            .into_iter()
            .filter(|conn_id| self.send_frame(conn_id, frame.clone()))
            .count()
    }

    /// Broadcast a message to every connection bound to `branch_id`.
    ///
    /// Returns the number of connections that received the message.
    pub fn broadcast_branch(&self, branch_id: &str, message: &ServerMessage) -> usize {
        let conn_ids: Vec<String> = self
            .by_branch
            .get(branch_id)
            .map(|ids| ids.value().clone())
            .unwrap_or_default();
        let sent = self.send_to_many(&conn_ids, message);
        tracing::debug!(branch_id = %branch_id, recipients = sent, "Broadcast message to branch");
        sent
    }

    /// Get the number of active connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Get the number of branches with at least one bound connection.
    pub fn branch_count(&self) -> usize {
        self.by_branch.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_bind_unregister() {
        let manager = ConnectionManager::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        let conn_id = manager.register(tx);
        assert_eq!(manager.connection_count(), 1);
        assert_eq!(manager.branch_count(), 0);

        manager.bind(&conn_id, "b1", Some("cashier".into()));
        assert_eq!(manager.branch_of(&conn_id).as_deref(), Some("b1"));
        manager.bind(&conn_id, "b2", None);
        assert_eq!(manager.branch_count(), 1);

        manager.unregister(&conn_id);
        assert_eq!(manager.connection_count(), 0);
        assert_eq!(manager.branch_count(), 0);
    }

    #[test]
    fn test_broadcast_branch_shares_one_frame() {
        let manager = ConnectionManager::new();

        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let (tx3, mut rx3) = mpsc::unbounded_channel();

        let conn1 = manager.register(tx1);
        let conn2 = manager.register(tx2);
        let conn3 = manager.register(tx3);
        manager.bind(&conn1, "b1", None);
        manager.bind(&conn2, "b1", None);
        manager.bind(&conn3, "b2", None);

        let sent = manager.broadcast_branch("b1", &ServerMessage::Pong);
        assert_eq!(sent, 2);

        let first = rx1.try_recv().unwrap();
        let second = rx2.try_recv().unwrap();
        assert_eq!(first.cycle, second.cycle);
        assert!(Arc::ptr_eq(&first.text, &second.text));
        assert!(rx3.try_recv().is_err());
    }

    #[test]
    fn test_cycles_increase() {
        let manager = ConnectionManager::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = manager.register(tx);

        assert!(manager.send_to(&conn, &ServerMessage::Pong));
        assert!(manager.send_to(&conn, &ServerMessage::Pong));
        let a = rx.try_recv().unwrap();
        let b = rx.try_recv().unwrap();
        assert!(b.cycle > a.cycle);
        assert!(!manager.send_to("missing", &ServerMessage::Pong));
    }
}

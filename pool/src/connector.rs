//! The connector boundary.
//!
//! A connector owns the client sockets: it peels any proxy-protocol
//! header, frames lines, and forwards decoded messages here. The
//! stratifier only ever sees client ids, JSON lines and an optional
//! peeled source address.

use async_trait::async_trait;
use std::net::IpAddr;

#[derive(Debug, Clone)]
pub enum ClientMessage {
    Line {
        client_id: u64,
        line: String,
        source: Option<(IpAddr, u16)>,
    },
    Disconnected {
        client_id: u64,
    },
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Queue a JSON line for delivery to a client.
    async fn send_to_client(&self, client_id: u64, payload: String);

    /// Whether the connector still knows this client id.
    fn client_exists(&self, client_id: u64) -> bool;

    /// Ask the connector to close a client's socket.
    async fn drop_client(&self, client_id: u64);
}

/// In-memory connector used by tests and embedding harnesses: outbound
/// lines are captured per client.
#[derive(Debug, Default)]
pub struct ChannelConnector {
    outbound: parking_lot::Mutex<Vec<(u64, String)>>,
    dropped: parking_lot::Mutex<Vec<u64>>,
    gone: parking_lot::Mutex<std::collections::HashSet<u64>>,
}

impl ChannelConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// All lines sent to `client_id`, in order.
    pub fn sent_to(&self, client_id: u64) -> Vec<String> {
        self.outbound
            .lock()
            .iter()
            .filter(|(id, _)| *id == client_id)
            .map(|(_, line)| line.clone())
            .collect()
    }

    pub fn drop_requests(&self) -> Vec<u64> {
        self.dropped.lock().clone()
    }

    /// Simulate the socket going away on the connector side.
    pub fn mark_gone(&self, client_id: u64) {
        self.gone.lock().insert(client_id);
    }

    pub fn clear(&self) {
        self.outbound.lock().clear();
    }
}

#[async_trait]
impl Connector for ChannelConnector {
    async fn send_to_client(&self, client_id: u64, payload: String) {
        self.outbound.lock().push((client_id, payload));
    }

    fn client_exists(&self, client_id: u64) -> bool {
        !self.gone.lock().contains(&client_id)
    }

    async fn drop_client(&self, client_id: u64) {
        self.dropped.lock().push(client_id);
    }
}

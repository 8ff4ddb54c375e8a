use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{ClientEvent, Connection, Connector, ServerEvent, SocketError};

/// The server end of an in-memory connection.
#[derive(Debug)]
pub struct ServerSide {
    /// The token the node connected with.
    pub token: String,
    pub events: mpsc::UnboundedSender<ServerEvent>,
    pub received: mpsc::UnboundedReceiver<ClientEvent>,
}

/// A connector that hands the server end of every connection to the test.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    servers: mpsc::UnboundedSender<ServerSide>,
}

impl MemoryConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ServerSide>) {
        let (servers_tx, servers_rx) = mpsc::unbounded_channel();
        (Self { servers: servers_tx }, servers_rx)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, token: &str) -> Result<Connection, SocketError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        self.servers
            .send(ServerSide {
                token: token.to_string(),
                events: events_tx,
                received: outgoing_rx,
            })
            .map_err(|_| SocketError::Connect("the server is gone".to_string()))?;
        Ok(Connection {
            events: events_rx,
            outgoing: outgoing_tx,
        })
    }
}

//! The event channel between the node and the server.
//!
//! The server pushes events to the rooms the node is in (`new_task`,
//! `expired_token`, `kill_containers`, `pong`), and the node emits `ping` and
//! `container_failed` events. The [`SocketChannel`] owns the connection and
//! rebuilds it from scratch whenever it is lost:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Disconnected
//!                     ^             |
//!                     |             v
//!              Reauthenticating <- TokenExpired
//! ```
//!
//! An `expired_token` event and a ping that isn't answered in time take the
//! same path: the token is refreshed, the channel reconnects and the queue is
//! resynced with the server. A refresh failure ends the channel.

mod heartbeat;
#[cfg(test)]
pub(crate) mod memory;
mod websocket;

use std::{error::Error, sync::Arc};

use async_trait::async_trait;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    sync::{mpsc, watch},
    time::{self, Instant},
};
use tracing::{debug, error, info, warn};

pub use self::{heartbeat::PongTimer, websocket::WebSocketConnector};
use crate::settings::SocketSettings;

/// An event pushed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// A task with a result for this node was created.
    NewTask(u64),
    /// The access token of the connection expired.
    ExpiredToken,
    KillContainers(KillRequest),
    /// A container failed at some node of the collaboration.
    ContainerFailed(ContainerFailure),
    Pong,
}

/// An event emitted by the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    Ping { node_id: u64 },
    ContainerFailed(ContainerFailure),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerFailure {
    pub node_id: u64,
    pub status_code: i32,
    pub result_id: u64,
    pub collaboration_id: u64,
}

/// The runs to kill: either the listed ones, or every run of a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillRequest {
    #[serde(default)]
    pub kill_list: Option<Vec<KillTarget>>,
    #[serde(default)]
    pub node_id: Option<u64>,
    #[serde(default)]
    pub collaboration_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillTarget {
    pub result_id: u64,
    pub node_id: u64,
}

/// What a node has to kill for `request`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KillOrder {
    All,
    Results(Vec<u64>),
}

impl KillRequest {
    /// The part of the request addressed to node `node_id`, if any.
    pub fn order_for(&self, node_id: u64) -> Option<KillOrder> {
        match (&self.kill_list, self.node_id) {
            (Some(targets), _) => {
                let results: Vec<u64> = targets
                    .iter()
                    .filter(|target| target.node_id == node_id)
                    .map(|target| target.result_id)
                    .collect();
                if results.is_empty() {
                    None
                } else {
                    Some(KillOrder::Results(results))
                }
            }
            (None, Some(id)) if id == node_id => Some(KillOrder::All),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("failed to connect to the event channel: {0}")]
    Connect(String),
    #[error("invalid event channel URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("failed to refresh the token of the event channel: {0}")]
    Refresh(Box<dyn Error + Send + Sync>),
}

/// One established connection.
///
/// The connection is closed when the server drops its `events` sender, or
/// when the node drops the `outgoing` sender.
#[derive(Debug)]
pub struct Connection {
    pub events: mpsc::UnboundedReceiver<ServerEvent>,
    pub outgoing: mpsc::UnboundedSender<ClientEvent>,
}

/// Opens connections to the event channel.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, token: &str) -> Result<Connection, SocketError>;
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    #[display(fmt = "disconnected")]
    Disconnected,
    #[display(fmt = "connecting")]
    Connecting,
    #[display(fmt = "connected")]
    Connected,
    #[display(fmt = "token expired")]
    TokenExpired,
    #[display(fmt = "reauthenticating")]
    Reauthenticating,
}

/// The state of the current connection. It is rebuilt on every connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub auth_id: u64,
    pub rooms: Vec<String>,
    pub connected: bool,
}

/// The node side of the events.
#[async_trait]
pub trait SocketHandler: Send + Sync + 'static {
    async fn access_token(&self) -> Option<String>;
    async fn on_new_task(&self, task_id: u64);
    async fn on_kill(&self, request: KillRequest);
    async fn refresh_token(&self) -> Result<(), Box<dyn Error + Send + Sync>>;
    /// Rebuilds the queue from the open results at the server.
    async fn resync(&self);
}

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disconnect {
    Closed,
    TokenExpired,
    PingTimeout,
}

/// A handle to a running [`SocketChannel`].
#[derive(Debug, Clone)]
pub struct SocketHandle {
    state: watch::Receiver<ChannelState>,
    outgoing: mpsc::UnboundedSender<ClientEvent>,
}

impl SocketHandle {
    /// Queues `event` for the server. Events emitted while the channel is
    /// down are sent once it is connected again.
    pub fn emit(&self, event: ClientEvent) -> bool {
        self.outgoing.send(event).is_ok()
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<ChannelState> {
        self.state.clone()
    }
}

pub struct SocketChannel<C> {
    connector: C,
    settings: SocketSettings,
    node_id: u64,
    rooms: Vec<String>,
    state: watch::Sender<ChannelState>,
    outgoing: mpsc::UnboundedReceiver<ClientEvent>,
    session: Option<Session>,
}

impl<C> SocketChannel<C>
where
    C: Connector,
{
    pub fn new(
        connector: C,
        settings: SocketSettings,
        node_id: u64,
        rooms: Vec<String>,
    ) -> (Self, SocketHandle) {
        let (state_tx, state_rx) = watch::channel(ChannelState::Disconnected);
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let channel = Self {
            connector,
            settings,
            node_id,
            rooms,
            state: state_tx,
            outgoing: outgoing_rx,
            session: None,
        };
        let handle = SocketHandle {
            state: state_rx,
            outgoing: outgoing_tx,
        };
        (channel, handle)
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    fn set_state(&self, state: ChannelState) {
        debug!("event channel {}", state);
        let _ = self.state.send(state);
    }

    /// Keeps the channel up for as long as the node runs. The handler
    /// resyncs after every successful connect, the first one included.
    ///
    /// # Errors
    /// Fails only when the token can't be refreshed.
    pub async fn run<H>(mut self, handler: Arc<H>) -> Result<(), SocketError>
    where
        H: SocketHandler,
    {
        let mut resync = true;
        loop {
            self.set_state(ChannelState::Connecting);
            let token = handler.access_token().await.unwrap_or_default();
            let connection = match self.connector.connect(&token).await {
                Ok(connection) => connection,
                Err(e) => {
                    warn!("{}, retrying in {:?}", e, self.settings.reconnect_delay());
                    self.set_state(ChannelState::Disconnected);
                    time::sleep(self.settings.reconnect_delay()).await;
                    continue;
                }
            };

            self.session = Some(Session {
                auth_id: self.node_id,
                rooms: self.rooms.clone(),
                connected: true,
            });
            self.set_state(ChannelState::Connected);
            info!("connected to the event channel");
            if resync {
                handler.resync().await;
                resync = false;
            }

            let reason = self.serve(connection, handler.as_ref()).await;
            self.session = None;
            match reason {
                Disconnect::Closed => {
                    self.set_state(ChannelState::Disconnected);
                    warn!(
                        "event channel closed, reconnecting in {:?}",
                        self.settings.reconnect_delay()
                    );
                    time::sleep(self.settings.reconnect_delay()).await;
                }
                Disconnect::TokenExpired | Disconnect::PingTimeout => {
                    self.set_state(ChannelState::TokenExpired);
                    self.set_state(ChannelState::Reauthenticating);
                    if let Err(e) = handler.refresh_token().await {
                        error!("failed to refresh the token: {}", e);
                        self.set_state(ChannelState::Disconnected);
                        return Err(SocketError::Refresh(e));
                    }
                }
            }
            // events may have been missed while disconnected
            resync = true;
        }
    }

    async fn serve<H>(&mut self, connection: Connection, handler: &H) -> Disconnect
    where
        H: SocketHandler,
    {
        let Connection {
            mut events,
            outgoing,
        } = connection;
        let period = self.settings.ping_interval();
        let mut pings = time::interval_at(Instant::now() + period, period);
        let mut pong = PongTimer::new();

        loop {
            // events queued before the pong deadline passed are handled first
            tokio::select! {
                biased;

                event = events.recv() => match event {
                    None => return Disconnect::Closed,
                    Some(ServerEvent::NewTask(task_id)) => {
                        info!("new task {} was posted", task_id);
                        handler.on_new_task(task_id).await;
                    }
                    Some(ServerEvent::ExpiredToken) => {
                        warn!("the token of the event channel expired");
                        return Disconnect::TokenExpired;
                    }
                    Some(ServerEvent::KillContainers(request)) => handler.on_kill(request).await,
                    Some(ServerEvent::ContainerFailed(failure)) => info!(
                        "the container of result {} failed at node {} with status {}",
                        failure.result_id, failure.node_id, failure.status_code
                    ),
                    Some(ServerEvent::Pong) => pong.disarm(),
                },
                Some(event) = self.outgoing.recv() => {
                    if outgoing.send(event).is_err() {
                        return Disconnect::Closed;
                    }
                }
                _ = pings.tick() => {
                    if outgoing.send(ClientEvent::Ping { node_id: self.node_id }).is_err() {
                        return Disconnect::Closed;
                    }
                    pong.arm(self.settings.pong_timeout());
                }
                _ = &mut pong => {
                    warn!("no pong received within {:?}", self.settings.pong_timeout());
                    return Disconnect::PingTimeout;
                }
            }
        }
    }
}

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue},
        Message,
    },
};
use tracing::{debug, warn};
use url::Url;

use super::{ClientEvent, Connection, Connector, ServerEvent, SocketError};

/// Connects to the event channel of the server over a websocket.
///
/// Events are exchanged as JSON text frames of the form
/// `{"event": "<name>", "data": <payload>}`.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: Url,
}

impl WebSocketConnector {
    pub fn new(url: Url) -> Self {
        Self { url }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, token: &str) -> Result<Connection, SocketError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| SocketError::Connect(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| SocketError::Connect(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (stream, _) = connect_async(request)
            .await
            .map_err(|e| SocketError::Connect(e.to_string()))?;
        debug!("websocket connected to {}", self.url);
        let (mut sink, mut source) = stream.split();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<ClientEvent>();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = source.next() => match frame {
                        Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerEvent>(&text) {
                            Ok(event) => {
                                if events_tx.send(event).is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!("ignoring event {}: {}", text, e),
                        },
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("websocket error: {}", e);
                            break;
                        }
                    },
                    event = outgoing_rx.recv() => match event {
                        Some(event) => {
                            let text = match serde_json::to_string(&event) {
                                Ok(text) => text,
                                Err(e) => {
                                    warn!("failed to serialize event {:?}: {}", event, e);
                                    continue;
                                }
                            };
                            if let Err(e) = sink.send(Message::Text(text)).await {
                                warn!("failed to send event: {}", e);
                                break;
                            }
                        }
                        None => {
                            let _ = sink.close().await;
                            break;
                        }
                    },
                }
            }
            debug!("websocket closed");
        });

        Ok(Connection {
            events: events_rx,
            outgoing: outgoing_tx,
        })
    }
}

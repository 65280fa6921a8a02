//! Duplex transports for the live session
//!
//! A [`Connection`] is a pair of channels: JSON text frames out, transport
//! events in. The WebSocket connector pumps a real socket into such a pair;
//! the loopback connector hands the far end to the caller instead, which is how
//! in-process peers and tests drive a session.

use crate::config::SessionConfig;
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::fmt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// What the transport reports upward.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// One complete message from the remote side.
    Frame(Vec<u8>),
    /// Remote closed the connection.
    Closed(Option<String>),
    /// Transport failure; no further frames will arrive.
    Failed(String),
}

/// Session side of an open transport.
pub struct Connection {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Remote side of a loopback connection.
pub struct RemoteEnd {
    pub outbound: mpsc::UnboundedReceiver<String>,
    pub inbound: mpsc::UnboundedSender<TransportEvent>,
}

impl Connection {
    /// Two connected ends with nothing in between.
    pub fn loopback() -> (Connection, RemoteEnd) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (
            Connection {
                outbound: out_tx,
                inbound: in_rx,
            },
            RemoteEnd {
                outbound: out_rx,
                inbound: in_tx,
            },
        )
    }
}

impl RemoteEnd {
    /// Deliver a JSON message to the session. Returns false once the session
    /// side has gone away.
    pub fn send(&self, message: &Value) -> bool {
        self.inbound
            .send(TransportEvent::Frame(message.to_string().into_bytes()))
            .is_ok()
    }

    pub fn close(&self, reason: Option<&str>) -> bool {
        self.inbound
            .send(TransportEvent::Closed(reason.map(str::to_string)))
            .is_ok()
    }

    pub fn fail(&self, cause: &str) -> bool {
        self.inbound
            .send(TransportEvent::Failed(cause.to_string()))
            .is_ok()
    }

    /// Next message the session sent, parsed. `None` once the session dropped
    /// its sender.
    pub async fn recv(&mut self) -> Option<Value> {
        let text = self.outbound.recv().await?;
        serde_json::from_str(&text).ok()
    }
}

/// Opens transports for the session client.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, config: &SessionConfig) -> VoiceResult<Connection>;
}

/// Hands the remote end of every new connection to a channel.
pub struct LoopbackConnector {
    remotes: mpsc::UnboundedSender<RemoteEnd>,
}

impl LoopbackConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RemoteEnd>) {
        let (remotes, rx) = mpsc::unbounded_channel();
        (Self { remotes }, rx)
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn open(&self, _config: &SessionConfig) -> VoiceResult<Connection> {
        let (connection, remote) = Connection::loopback();
        self.remotes
            .send(remote)
            .map_err(|_| VoiceError::Connection("loopback peer is gone".to_string()))?;
        Ok(connection)
    }
}

/// WebSocket connector for the live service.
#[derive(Clone)]
pub struct LiveSocketConnector {
    endpoint: String,
    api_key: String,
}

impl fmt::Debug for LiveSocketConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveSocketConnector")
            .field("endpoint", &self.endpoint)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

impl LiveSocketConnector {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        }
    }

    /// Build from `GEMINI_API_KEY` (or `API_KEY`) and the given endpoint.
    pub fn from_env(endpoint: impl Into<String>) -> VoiceResult<Self> {
        let api_key = std::env::var("GEMINI_API_KEY")
            .or_else(|_| std::env::var("API_KEY"))
            .map_err(|_| {
                VoiceError::Config("live session requires GEMINI_API_KEY or API_KEY".to_string())
            })?;
        Ok(Self::new(endpoint, api_key))
    }

    fn url(&self) -> String {
        let sep = if self.endpoint.contains('?') { '&' } else { '?' };
        format!("{}{}key={}", self.endpoint, sep, self.api_key)
    }
}

#[async_trait]
impl Connector for LiveSocketConnector {
    async fn open(&self, config: &SessionConfig) -> VoiceResult<Connection> {
        info!(target: "callerpro::session", endpoint = %self.endpoint, model = %config.model, "Opening live socket");
        let (socket, _response) = tokio_tungstenite::connect_async(self.url()).await?;
        let (mut sink, mut stream) = socket.split();
        let (connection, remote) = Connection::loopback();
        let RemoteEnd {
            outbound: mut out_rx,
            inbound: in_tx,
        } = remote;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    outgoing = out_rx.recv() => match outgoing {
                        Some(text) => {
                            if let Err(e) = sink.send(Message::Text(text)).await {
                                let _ = in_tx.send(TransportEvent::Failed(e.to_string()));
                                break;
                            }
                        }
                        // Session released the connection.
                        None => break,
                    },
                    incoming = stream.next() => match incoming {
                        Some(Ok(Message::Text(text))) => {
                            if in_tx.send(TransportEvent::Frame(text.into_bytes())).is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Binary(bytes))) => {
                            if in_tx.send(TransportEvent::Frame(bytes)).is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let reason = frame.map(|f| format!("{} {}", u16::from(f.code), f.reason));
                            let _ = in_tx.send(TransportEvent::Closed(reason));
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(target: "callerpro::session", "Live socket error: {}", e);
                            let _ = in_tx.send(TransportEvent::Failed(e.to_string()));
                            break;
                        }
                        None => {
                            let _ = in_tx.send(TransportEvent::Closed(None));
                            break;
                        }
                    },
                }
            }
            let _ = sink.close().await;
            debug!(target: "callerpro::session", "Live socket pump finished");
        });

        Ok(connection)
    }
}

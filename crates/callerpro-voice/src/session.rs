//! Session client for the live service
//!
//! Owns one bidirectional connection at a time and turns its frames into
//! [`SessionEvent`]s. Every connect starts a new generation; frames and
//! tool responses tagged with an older generation are discarded, so nothing
//! from a torn-down session leaks into the next one.
//!
//! ```text
//!   Idle ──connect──▶ Connecting ──setupComplete──▶ Open
//!     ▲                   │                           │
//!     │              handshake fails        remote close / disconnect
//!     │                   ▼                           ▼
//!     └──── connect ── Errored                     Closed ── connect ──▶ Connecting
//! ```

use crate::audio::AudioChunk;
use crate::config::SessionConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::protocol::{self, GroundingChunk, ServerEvent};
use crate::tools::{ToolInvocation, ToolResult};
use crate::transport::{Connection, Connector, TransportEvent};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Lifecycle of the session client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Open,
    Closed,
    Errored,
}

impl SessionState {
    /// Connecting or open.
    pub fn is_live(&self) -> bool {
        matches!(self, SessionState::Connecting | SessionState::Open)
    }
}

/// Identifies one connect/disconnect cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Events delivered to the session's consumer, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Open,
    Close {
        reason: Option<String>,
    },
    Audio(AudioChunk),
    Content {
        text: String,
        grounding_chunks: Vec<GroundingChunk>,
    },
    InputTranscription {
        text: String,
        is_final: bool,
    },
    OutputTranscription {
        text: String,
        is_final: bool,
    },
    ToolCall {
        session: SessionId,
        invocations: Vec<ToolInvocation>,
    },
    ToolCallCancellation {
        ids: Vec<String>,
    },
    Interrupted,
    TurnComplete,
    /// The service will close this connection soon.
    GoAway {
        time_left: Option<String>,
    },
    Error(String),
}

struct Shared {
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<String>>,
    reader: Option<JoinHandle<()>>,
    pending_tool_calls: HashSet<String>,
    /// Cause of the last failure, recorded before `Errored` is published.
    last_error: Option<String>,
}

struct Inner {
    shared: Mutex<Shared>,
    state_tx: watch::Sender<SessionState>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, next: SessionState) -> SessionState {
        let previous = self.state_tx.send_replace(next);
        if previous != next {
            debug!(target: "callerpro::session", ?previous, ?next, "Session state changed");
        }
        previous
    }

    /// Record `cause`, publish `Errored` and emit the error event.
    fn fail(&self, shared: &mut Shared, cause: String) {
        shared.last_error = Some(cause.clone());
        self.set_state(SessionState::Errored);
        self.emit(SessionEvent::Error(cause));
    }

    fn emit(&self, event: SessionEvent) {
        // Consumer gone means the client is being torn down.
        let _ = self.event_tx.send(event);
    }

    /// Forward decoded events of `generation`. False when that generation is
    /// no longer current.
    fn deliver(&self, generation: u64, events: Vec<ServerEvent>) -> bool {
        let mut shared = self.lock();
        if shared.generation != generation {
            return false;
        }

        for event in events {
            let event = match event {
                ServerEvent::SetupComplete => {
                    if self.state() != SessionState::Connecting {
                        debug!(target: "callerpro::session", "Ignoring repeated setupComplete");
                        continue;
                    }
                    self.set_state(SessionState::Open);
                    info!(target: "callerpro::session", "📞 Session open ({})", SessionId(generation));
                    SessionEvent::Open
                }
                ServerEvent::Audio(chunk) => SessionEvent::Audio(chunk),
                ServerEvent::Content {
                    text,
                    grounding_chunks,
                } => SessionEvent::Content {
                    text,
                    grounding_chunks,
                },
                ServerEvent::InputTranscription { text, is_final } => {
                    SessionEvent::InputTranscription { text, is_final }
                }
                ServerEvent::OutputTranscription { text, is_final } => {
                    SessionEvent::OutputTranscription { text, is_final }
                }
                ServerEvent::ToolCall(invocations) => {
                    shared
                        .pending_tool_calls
                        .extend(invocations.iter().map(|i| i.id.clone()));
                    info!(target: "callerpro::session", count = invocations.len(), "🛠️ Tool call received");
                    SessionEvent::ToolCall {
                        session: SessionId(generation),
                        invocations,
                    }
                }
                ServerEvent::ToolCallCancellation(ids) => {
                    for id in &ids {
                        shared.pending_tool_calls.remove(id);
                    }
                    SessionEvent::ToolCallCancellation { ids }
                }
                ServerEvent::Interrupted => SessionEvent::Interrupted,
                ServerEvent::TurnComplete => SessionEvent::TurnComplete,
                ServerEvent::GoAway { time_left } => {
                    warn!(target: "callerpro::session", ?time_left, "Service announced disconnect");
                    SessionEvent::GoAway { time_left }
                }
            };
            self.emit(event);
        }
        true
    }

    /// Transport of `generation` ended on its own.
    fn finish(&self, generation: u64, end: TransportEnd) {
        let mut shared = self.lock();
        if shared.generation != generation {
            return;
        }
        shared.outbound = None;
        shared.reader = None;
        shared.pending_tool_calls.clear();

        match end {
            TransportEnd::Closed(reason) => {
                self.set_state(SessionState::Closed);
                info!(target: "callerpro::session", ?reason, "📴 Session closed by remote");
                self.emit(SessionEvent::Close { reason });
            }
            TransportEnd::Failed(cause) => {
                error!(target: "callerpro::session", "Session transport failed: {}", cause);
                self.fail(&mut shared, cause.clone());
                self.emit(SessionEvent::Close {
                    reason: Some(cause),
                });
            }
        }
    }
}

enum TransportEnd {
    Closed(Option<String>),
    Failed(String),
}

async fn read_loop(
    inner: Arc<Inner>,
    generation: u64,
    mut inbound: mpsc::UnboundedReceiver<TransportEvent>,
) {
    let end = loop {
        let Some(event) = inbound.recv().await else {
            break TransportEnd::Closed(None);
        };
        match event {
            TransportEvent::Frame(frame) => {
                let events = match protocol::decode(&frame) {
                    Ok(events) => events,
                    Err(e) => {
                        warn!(target: "callerpro::session", "Dropping server message: {}", e);
                        continue;
                    }
                };
                if !inner.deliver(generation, events) {
                    debug!(target: "callerpro::session", generation, "Reader outlived its session");
                    return;
                }
            }
            TransportEvent::Closed(reason) => break TransportEnd::Closed(reason),
            TransportEvent::Failed(cause) => break TransportEnd::Failed(cause),
        }
    };
    inner.finish(generation, end);
}

/// Client side of the live session.
pub struct SessionClient {
    connector: Arc<dyn Connector>,
    inner: Arc<Inner>,
}

impl SessionClient {
    pub fn new(connector: Arc<dyn Connector>) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(SessionState::Idle);
        let inner = Arc::new(Inner {
            shared: Mutex::new(Shared {
                generation: 0,
                outbound: None,
                reader: None,
                pending_tool_calls: HashSet::new(),
                last_error: None,
            }),
            state_tx,
            event_tx,
        });
        (Self { connector, inner }, event_rx)
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    /// The current generation, while connecting or open.
    pub fn current_session(&self) -> Option<SessionId> {
        let shared = self.inner.lock();
        self.state().is_live().then_some(SessionId(shared.generation))
    }

    /// Why the last session failed. Cleared by `connect`.
    pub fn last_error(&self) -> Option<String> {
        self.inner.lock().last_error.clone()
    }

    /// Tool call ids received but not yet answered or cancelled.
    pub fn pending_tool_calls(&self) -> usize {
        self.inner.lock().pending_tool_calls.len()
    }

    /// Open the transport and send the setup message. The session becomes
    /// `Open` when the service acknowledges the setup.
    ///
    /// Fails while a session is connecting or open; disconnect first.
    pub async fn connect(&self, config: &SessionConfig) -> VoiceResult<()> {
        let setup = protocol::encode_setup(config)?;

        let generation = {
            let mut shared = self.inner.lock();
            let state = self.state();
            if state.is_live() {
                return Err(VoiceError::Connection(format!(
                    "session is already {:?}; disconnect first",
                    state
                )));
            }
            shared.generation += 1;
            shared.pending_tool_calls.clear();
            shared.last_error = None;
            self.inner.set_state(SessionState::Connecting);
            shared.generation
        };

        info!(target: "callerpro::session", model = %config.model, voice = %config.voice, "🔌 Connecting ({})", SessionId(generation));

        let Connection { outbound, inbound } = match self.connector.open(config).await {
            Ok(connection) => connection,
            Err(e) => {
                let mut shared = self.inner.lock();
                if shared.generation == generation {
                    error!(target: "callerpro::session", "Handshake failed: {}", e);
                    self.inner.fail(&mut shared, e.to_string());
                }
                return Err(e);
            }
        };

        let mut shared = self.inner.lock();
        if shared.generation != generation {
            // Dropping `outbound` releases the transport.
            return Err(VoiceError::Connection(
                "connect was cancelled by disconnect".to_string(),
            ));
        }
        if outbound.send(setup).is_err() {
            let cause = "transport closed before setup was sent".to_string();
            self.inner.fail(&mut shared, cause.clone());
            return Err(VoiceError::Connection(cause));
        }

        shared.outbound = Some(outbound);
        shared.reader = Some(tokio::spawn(read_loop(
            Arc::clone(&self.inner),
            generation,
            inbound,
        )));
        debug!(target: "callerpro::session", "Setup sent, awaiting acknowledgement");
        Ok(())
    }

    /// Send one microphone chunk. Dropped (returns false) unless the session
    /// is open.
    pub fn send_audio(&self, chunk: &AudioChunk) -> bool {
        let outbound = {
            let shared = self.inner.lock();
            if self.state() != SessionState::Open {
                trace!(target: "callerpro::session", samples = chunk.len(), "Session not open, dropping audio");
                return false;
            }
            match &shared.outbound {
                Some(outbound) => outbound.clone(),
                None => return false,
            }
        };

        match protocol::encode_audio(chunk) {
            Ok(message) => outbound.send(message).is_ok(),
            Err(e) => {
                warn!(target: "callerpro::session", "Could not encode audio chunk: {}", e);
                false
            }
        }
    }

    /// Answer a tool call of `session`. Rejected when that session is no
    /// longer the open one.
    pub fn send_tool_response(&self, session: SessionId, results: &[ToolResult]) -> VoiceResult<()> {
        let message = protocol::encode_tool_response(results)?;

        let outbound = {
            let mut shared = self.inner.lock();
            if shared.generation != session.0 || self.state() != SessionState::Open {
                warn!(target: "callerpro::session", %session, "Discarding tool response for a session that is gone");
                return Err(VoiceError::Connection(format!("{} is no longer open", session)));
            }
            for result in results {
                shared.pending_tool_calls.remove(&result.id);
            }
            shared
                .outbound
                .clone()
                .ok_or_else(|| VoiceError::Connection("no transport".to_string()))?
        };

        outbound
            .send(message)
            .map_err(|_| VoiceError::ChannelSend("transport closed".to_string()))?;
        info!(target: "callerpro::session", count = results.len(), "Tool response sent");
        Ok(())
    }

    /// Tear down the current session. Safe to call in any state; `Close` is
    /// emitted only if a session was live.
    pub fn disconnect(&self) {
        let mut shared = self.inner.lock();
        shared.generation += 1;
        shared.outbound = None;
        if let Some(reader) = shared.reader.take() {
            reader.abort();
        }
        shared.pending_tool_calls.clear();

        let previous = self.inner.set_state(SessionState::Closed);
        if previous.is_live() {
            info!(target: "callerpro::session", "📴 Session disconnected");
            self.inner.emit(SessionEvent::Close { reason: None });
        }
    }
}

impl Drop for SessionClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CallSettings;
    use crate::transport::{LoopbackConnector, RemoteEnd};
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    fn session_config() -> SessionConfig {
        SessionConfig::from_settings(&CallSettings::default()).unwrap()
    }

    async fn open_session() -> (
        SessionClient,
        mpsc::UnboundedReceiver<SessionEvent>,
        RemoteEnd,
    ) {
        let (connector, mut remotes) = LoopbackConnector::new();
        let (client, mut events) = SessionClient::new(Arc::new(connector));
        client.connect(&session_config()).await.unwrap();
        let mut remote = remotes.recv().await.unwrap();

        let setup = remote.recv().await.unwrap();
        assert!(setup.get("setup").is_some());

        remote.send(&json!({ "setupComplete": {} }));
        assert_eq!(next(&mut events).await, SessionEvent::Open);
        assert_eq!(client.state(), SessionState::Open);
        (client, events, remote)
    }

    async fn next(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
        timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("event in time")
            .expect("channel open")
    }

    #[test]
    fn test_new_client_is_idle() {
        let (connector, _remotes) = LoopbackConnector::new();
        let (client, _events) = SessionClient::new(Arc::new(connector));
        assert_eq!(client.state(), SessionState::Idle);
        assert!(client.current_session().is_none());
        assert!(!client.send_audio(&AudioChunk::new(vec![1, 2, 3], 16_000)));
    }

    #[tokio::test]
    async fn test_connect_while_open_is_rejected() {
        let (client, _events, _remote) = open_session().await;
        let err = client.connect(&session_config()).await.unwrap_err();
        assert!(matches!(err, VoiceError::Connection(_)));
        assert_eq!(client.state(), SessionState::Open);
    }

    #[tokio::test]
    async fn test_audio_is_sent_once_open() {
        let (client, _events, mut remote) = open_session().await;
        assert!(client.send_audio(&AudioChunk::new(vec![0, 1, -1], 16_000)));

        let message = remote.recv().await.unwrap();
        assert_eq!(
            message["realtimeInput"]["audio"]["mimeType"],
            "audio/pcm;rate=16000"
        );
    }

    #[tokio::test]
    async fn test_disconnect_emits_single_close() {
        let (client, mut events, _remote) = open_session().await;
        client.disconnect();
        client.disconnect();
        assert_eq!(next(&mut events).await, SessionEvent::Close { reason: None });
        assert_eq!(client.state(), SessionState::Closed);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stale_tool_response_is_rejected() {
        let (client, mut events, remote) = open_session().await;
        remote.send(&json!({
            "toolCall": { "functionCalls": [{ "id": "c1", "name": "lookup", "args": {} }] }
        }));
        let session = match next(&mut events).await {
            SessionEvent::ToolCall { session, .. } => session,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(client.pending_tool_calls(), 1);

        client.disconnect();
        let result = ToolResult {
            id: "c1".to_string(),
            name: "lookup".to_string(),
            response: json!({ "result": "ok" }),
        };
        assert!(client.send_tool_response(session, &[result]).is_err());
        assert_eq!(client.pending_tool_calls(), 0);
    }

    #[tokio::test]
    async fn test_transport_failure_marks_errored() {
        let (client, mut events, remote) = open_session().await;
        remote.fail("socket reset");
        assert_eq!(
            next(&mut events).await,
            SessionEvent::Error("socket reset".to_string())
        );
        assert!(matches!(next(&mut events).await, SessionEvent::Close { .. }));
        assert_eq!(client.state(), SessionState::Errored);
        assert_eq!(client.last_error().as_deref(), Some("socket reset"));
    }

    #[tokio::test]
    async fn test_handshake_failure() {
        let (connector, remotes) = LoopbackConnector::new();
        drop(remotes);
        let (client, mut events) = SessionClient::new(Arc::new(connector));
        assert!(client.connect(&session_config()).await.is_err());
        assert_eq!(client.state(), SessionState::Errored);
        assert!(matches!(next(&mut events).await, SessionEvent::Error(_)));
        assert!(client.last_error().is_some());
    }

    #[tokio::test]
    async fn test_error_cause_is_readable_on_errored_transition() {
        let (connector, mut remotes) = LoopbackConnector::new();
        let (client, _events) = SessionClient::new(Arc::new(connector));
        let mut state = client.subscribe_state();

        client.connect(&session_config()).await.unwrap();
        let remote = remotes.recv().await.unwrap();
        remote.send(&json!({ "setupComplete": {} }));
        remote.fail("tls alert");

        // Nobody drains the event channel; the cause must still be there.
        timeout(Duration::from_secs(2), state.wait_for(|s| *s == SessionState::Errored))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(client.last_error().as_deref(), Some("tls alert"));

        client.disconnect();
        client.connect(&session_config()).await.unwrap();
        assert!(client.last_error().is_none());
    }
}

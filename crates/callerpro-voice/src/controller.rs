//! Voice session controller - the one component the application talks to
//!
//! Owns the session client, both audio pipelines, the turn assembler and the
//! tool dispatcher, and wires their channels together:
//!
//! - microphone chunks → `SessionClient::send_audio`
//! - `audio` → playback queue, `interrupted` → playback flush
//! - transcriptions, content and `turnComplete` → turn assembler
//! - `toolCall` → dispatcher → `send_tool_response` on the same session

use crate::audio::AudioConfig;
use crate::capture::AudioCapturePipeline;
use crate::config::{CallSettings, SessionConfig};
use crate::error::{VoiceError, VoiceResult};
use crate::playback::AudioPlaybackPipeline;
use crate::session::{SessionClient, SessionEvent, SessionState};
use crate::tools::{ToolAuditRecord, ToolDispatcher, ToolHandler};
use crate::transport::Connector;
use crate::turns::{Role, TranscriptLog, TurnAssembler, TurnInput};
use futures::StreamExt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Which devices the controller should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerOptions {
    pub microphone: bool,
    pub speaker: bool,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            microphone: true,
            speaker: true,
        }
    }
}

impl ControllerOptions {
    /// No devices at all; transcript and tools only.
    pub fn headless() -> Self {
        Self {
            microphone: false,
            speaker: false,
        }
    }
}

/// `mm:ss`, minutes growing past 59 as needed.
pub fn format_call_duration(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}:{:02}", secs / 60, secs % 60)
}

type Slot<T> = Arc<Mutex<Option<T>>>;

fn lock<T>(slot: &Mutex<T>) -> MutexGuard<'_, T> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Everything the event loop needs, cloned out of the controller.
struct EventRouter {
    session: Arc<SessionClient>,
    playback: Arc<AudioPlaybackPipeline>,
    dispatcher: Arc<ToolDispatcher>,
    assembler: Arc<TurnAssembler>,
    connected_at: Slot<Instant>,
}

impl EventRouter {
    async fn run(self, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
        while let Some(event) = events.recv().await {
            self.handle(event);
        }
        debug!(target: "callerpro::controller", "Session event stream ended");
    }

    /// Never waits: audio and barge-in must keep flowing while tools run.
    fn handle(&self, event: SessionEvent) {
        match event {
            SessionEvent::Open => {
                *lock(&self.connected_at) = Some(Instant::now());
                info!(target: "callerpro::controller", "✅ Call connected");
            }
            SessionEvent::Close { reason } => {
                *lock(&self.connected_at) = None;
                self.playback.stop();
                info!(target: "callerpro::controller", ?reason, "Call ended");
            }
            SessionEvent::Audio(chunk) => self.playback.enqueue(chunk),
            SessionEvent::Interrupted => {
                debug!(target: "callerpro::controller", "Barge-in, flushing agent audio");
                self.playback.stop();
            }
            SessionEvent::InputTranscription { text, is_final } => {
                self.assembler.apply(TurnInput::Transcript {
                    role: Role::User,
                    text,
                    is_final,
                });
            }
            SessionEvent::OutputTranscription { text, is_final } => {
                self.assembler.apply(TurnInput::Transcript {
                    role: Role::Agent,
                    text,
                    is_final,
                });
            }
            SessionEvent::Content {
                text,
                grounding_chunks,
            } => {
                self.assembler.apply(TurnInput::Content {
                    text,
                    grounding_chunks,
                });
            }
            SessionEvent::TurnComplete => self.assembler.apply(TurnInput::TurnComplete),
            SessionEvent::ToolCall {
                session,
                invocations,
            } => {
                self.assembler
                    .apply(TurnInput::ToolRequest(invocations.clone()));
                let dispatcher = Arc::clone(&self.dispatcher);
                let assembler = Arc::clone(&self.assembler);
                let client = Arc::clone(&self.session);
                tokio::spawn(async move {
                    let results = dispatcher.dispatch(invocations).await;
                    assembler.apply(TurnInput::ToolResponse(results.clone()));
                    if let Err(e) = client.send_tool_response(session, &results) {
                        warn!(target: "callerpro::controller", "Tool results not delivered: {}", e);
                    }
                });
            }
            SessionEvent::ToolCallCancellation { ids } => {
                info!(target: "callerpro::controller", ?ids, "Service cancelled tool calls");
            }
            SessionEvent::GoAway { time_left } => {
                warn!(target: "callerpro::controller", ?time_left, "Service will end the call soon");
            }
            SessionEvent::Error(cause) => {
                error!(target: "callerpro::controller", "Session error: {}", cause);
            }
        }
    }
}

/// Binds connect/disconnect/mute to the session and both audio devices.
pub struct VoiceSessionController {
    settings: CallSettings,
    options: ControllerOptions,
    session: Arc<SessionClient>,
    session_events: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    capture: AudioCapturePipeline,
    playback: Arc<AudioPlaybackPipeline>,
    dispatcher: Arc<ToolDispatcher>,
    assembler: Arc<TurnAssembler>,
    transcript_rx: watch::Receiver<TranscriptLog>,
    audit_rx: Option<mpsc::UnboundedReceiver<ToolAuditRecord>>,
    connected_at: Slot<Instant>,
    last_device_error: Option<String>,
    tasks: Vec<JoinHandle<()>>,
}

impl VoiceSessionController {
    pub fn new(settings: CallSettings, connector: Arc<dyn Connector>, options: ControllerOptions) -> Self {
        info!(target: "callerpro::controller", ?options, "🎭 Initializing voice session controller");

        let (session, session_events) = SessionClient::new(connector);
        let (dispatcher, audit_rx) = ToolDispatcher::new(settings.tool_timeout());
        let (assembler, transcript_rx) = TurnAssembler::new();

        Self {
            settings,
            options,
            session: Arc::new(session),
            session_events: Some(session_events),
            capture: AudioCapturePipeline::new(AudioConfig::capture()),
            playback: Arc::new(AudioPlaybackPipeline::new(AudioConfig::playback())),
            dispatcher: Arc::new(dispatcher),
            assembler: Arc::new(assembler),
            transcript_rx,
            audit_rx: Some(audit_rx),
            connected_at: Arc::new(Mutex::new(None)),
            last_device_error: None,
            tasks: Vec::new(),
        }
    }

    /// Attach a handler for one tool. Only possible before the first connect.
    pub fn register_tool(&mut self, name: impl Into<String>, handler: Arc<dyn ToolHandler>) -> VoiceResult<()> {
        let dispatcher = Arc::get_mut(&mut self.dispatcher).ok_or_else(|| {
            VoiceError::Config("tools must be registered before the first connect".to_string())
        })?;
        dispatcher.register(name, handler);
        Ok(())
    }

    pub fn settings(&self) -> &CallSettings {
        &self.settings
    }

    /// Edits take effect on the next `connect`.
    pub fn settings_mut(&mut self) -> &mut CallSettings {
        &mut self.settings
    }

    fn ensure_started(&mut self) {
        let Some(events) = self.session_events.take() else {
            return;
        };

        let router = EventRouter {
            session: Arc::clone(&self.session),
            playback: Arc::clone(&self.playback),
            dispatcher: Arc::clone(&self.dispatcher),
            assembler: Arc::clone(&self.assembler),
            connected_at: Arc::clone(&self.connected_at),
        };
        self.tasks.push(tokio::spawn(router.run(events)));

        if let Some(mut chunks) = self.capture.take_stream() {
            let session = Arc::clone(&self.session);
            self.tasks.push(tokio::spawn(async move {
                while let Some(chunk) = chunks.next().await {
                    session.send_audio(&chunk);
                }
            }));
        }
    }

    /// Disconnect any previous call, then open a new one with the current
    /// settings and start the devices. A device failure is recorded and the
    /// call carries on without that device.
    ///
    /// If the new session cannot be opened, no device is left running.
    pub async fn connect(&mut self) -> VoiceResult<()> {
        self.ensure_started();
        self.disconnect();

        let config = SessionConfig::from_settings(&self.settings)?;
        self.dispatcher.apply_session(&config);
        self.last_device_error = None;

        self.session.connect(&config).await?;

        if self.options.microphone {
            if let Err(e) = self.capture.start() {
                warn!(target: "callerpro::controller", "Continuing without microphone: {}", e);
                self.last_device_error = Some(e.to_string());
            }
        }
        if self.options.speaker {
            if let Err(e) = self.playback.start() {
                warn!(target: "callerpro::controller", "Continuing without speaker: {}", e);
                self.last_device_error = Some(e.to_string());
            }
        }
        Ok(())
    }

    /// Stop the microphone, end the session and flush playback. Safe in any
    /// state.
    pub fn disconnect(&mut self) {
        self.capture.stop();
        self.capture.set_muted(false);
        self.session.disconnect();
        self.playback.stop();
        *lock(&self.connected_at) = None;
    }

    /// Withhold microphone audio without touching the session.
    pub fn set_muted(&self, muted: bool) {
        self.capture.set_muted(muted);
    }

    pub fn toggle_mute(&self) -> bool {
        let muted = !self.capture.is_muted();
        self.capture.set_muted(muted);
        muted
    }

    pub fn is_muted(&self) -> bool {
        self.capture.is_muted()
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.session.subscribe_state()
    }

    /// Read-only view of the conversation log.
    pub fn transcript(&self) -> watch::Receiver<TranscriptLog> {
        self.transcript_rx.clone()
    }

    /// The tool audit trail. Can be taken once.
    pub fn take_audit_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<ToolAuditRecord>> {
        self.audit_rx.take()
    }

    pub fn pending_tool_calls(&self) -> usize {
        self.session.pending_tool_calls()
    }

    pub fn output_amplitude(&self) -> f32 {
        self.playback.amplitude()
    }

    pub fn call_duration(&self) -> Option<Duration> {
        lock(&self.connected_at).map(|at| at.elapsed())
    }

    /// Call clock as `mm:ss`, `00:00` when not connected.
    pub fn call_clock(&self) -> String {
        format_call_duration(self.call_duration().unwrap_or_default())
    }

    /// Why the current or last call failed. Available as soon as the state
    /// reads `Errored`; cleared by the next `connect`.
    pub fn last_error(&self) -> Option<String> {
        self.session.last_error()
    }

    pub fn is_capturing(&self) -> bool {
        self.capture.is_running()
    }

    pub fn last_device_error(&self) -> Option<&str> {
        self.last_device_error.as_deref()
    }

    /// Disconnect, stop the background tasks and release the speaker.
    pub fn shutdown(&mut self) {
        self.disconnect();
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.playback.shutdown();
        info!(target: "callerpro::controller", "👋 Voice session controller shut down");
    }
}

impl Drop for VoiceSessionController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::handler_fn;
    use crate::transport::{LoopbackConnector, RemoteEnd};
    use base64::engine::general_purpose::STANDARD as B64;
    use base64::Engine as _;
    use futures::FutureExt;
    use serde_json::json;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    #[test]
    fn test_format_call_duration() {
        assert_eq!(format_call_duration(Duration::from_secs(0)), "00:00");
        assert_eq!(format_call_duration(Duration::from_secs(75)), "01:15");
        assert_eq!(format_call_duration(Duration::from_secs(3_600)), "60:00");
    }

    #[test]
    fn test_mute_is_cleared_on_disconnect() {
        let (connector, _remotes) = LoopbackConnector::new();
        let mut controller = VoiceSessionController::new(
            CallSettings::default(),
            Arc::new(connector),
            ControllerOptions::headless(),
        );
        assert!(controller.toggle_mute());
        assert!(controller.is_muted());
        controller.disconnect();
        assert!(!controller.is_muted());
        assert_eq!(controller.state(), SessionState::Closed);
        assert_eq!(controller.call_clock(), "00:00");
    }

    #[tokio::test]
    async fn test_register_tool_after_connect_is_rejected() {
        let (connector, _remotes) = LoopbackConnector::new();
        let mut controller = VoiceSessionController::new(
            CallSettings::default(),
            Arc::new(connector),
            ControllerOptions::headless(),
        );
        controller
            .register_tool("lookup", Arc::new(crate::tools::StaticToolHandler))
            .unwrap();
        controller.connect().await.unwrap();
        assert!(controller
            .register_tool("other", Arc::new(crate::tools::StaticToolHandler))
            .is_err());
    }

    async fn accept(remotes: &mut mpsc::UnboundedReceiver<RemoteEnd>) -> RemoteEnd {
        let mut remote = timeout(WAIT, remotes.recv()).await.unwrap().unwrap();
        assert!(timeout(WAIT, remote.recv()).await.unwrap().is_some());
        remote.send(&json!({ "setupComplete": {} }));
        remote
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + WAIT;
        while !check() {
            if Instant::now() > deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }

    #[tokio::test]
    async fn test_failed_reconnect_leaves_nothing_running() {
        let (connector, mut remotes) = LoopbackConnector::new();
        let mut controller = VoiceSessionController::new(
            CallSettings::default(),
            Arc::new(connector),
            ControllerOptions::headless(),
        );
        controller.connect().await.unwrap();
        let _remote = accept(&mut remotes).await;
        assert!(eventually(|| controller.state() == SessionState::Open).await);
        controller.set_muted(true);

        drop(remotes);
        assert!(controller.connect().await.is_err());

        // The previous call was torn down in full before the attempt.
        assert!(!controller.is_capturing());
        assert!(!controller.is_muted());
        assert_eq!(controller.state(), SessionState::Errored);
        assert!(controller.last_error().is_some());
        assert_eq!(controller.call_clock(), "00:00");
    }

    #[tokio::test]
    async fn test_barge_in_while_tool_is_running() {
        let (connector, mut remotes) = LoopbackConnector::new();
        let mut settings = CallSettings::default();
        settings.tool_timeout_ms = 30_000;
        let mut controller =
            VoiceSessionController::new(settings, Arc::new(connector), ControllerOptions::headless());
        controller
            .register_tool(
                "slow",
                handler_fn(|_| {
                    async {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        Ok(json!({ "late": true }))
                    }
                    .boxed()
                }),
            )
            .unwrap();

        controller.connect().await.unwrap();
        let remote = accept(&mut remotes).await;
        assert!(eventually(|| controller.state() == SessionState::Open).await);

        remote.send(&json!({
            "toolCall": { "functionCalls": [{ "id": "t1", "name": "slow", "args": {} }] }
        }));
        let pcm = B64.encode([0x00u8, 0x10].repeat(2400));
        remote.send(&json!({ "serverContent": { "modelTurn": { "parts": [
            { "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": pcm } }
        ] } } }));

        let playback = Arc::clone(&controller.playback);
        assert!(eventually(|| playback.is_playing()).await);

        remote.send(&json!({ "serverContent": { "interrupted": true } }));
        assert!(eventually(|| !playback.is_playing()).await);
        assert_eq!(controller.pending_tool_calls(), 1);
    }

    #[tokio::test]
    async fn test_invalid_settings_fail_before_connecting() {
        let (connector, _remotes) = LoopbackConnector::new();
        let mut settings = CallSettings::default();
        settings.model = String::new();
        let mut controller =
            VoiceSessionController::new(settings, Arc::new(connector), ControllerOptions::headless());
        let err = controller.connect().await.unwrap_err();
        assert!(matches!(err, VoiceError::Config(_)));
        assert_eq!(controller.state(), SessionState::Closed);
    }
}

//! Session lifecycle: one task owns the transport, the capture pipeline and
//! the playback scheduler, and reacts to one input at a time.
//!
//! ```text
//! Idle ─open─▶ Connecting ─Opened─▶ Open ─first audio─▶ Streaming
//!                  │                  │                    │  ▲
//!                  │                  │          Interrupted  │ (flush, resume)
//!                  └──────── Error ───┴──────────┬─────────┘
//!                                                ▼
//!                      close / Closed ─▶ Closing ─▶ Closed      Failed
//! ```
//!
//! Every way out (Closed or Failed) tears down in the same order: stop
//! capture, flush playback, close the transport.

use crate::audio::{AudioInput, AudioOutput};
use crate::capture::{CaptureFault, CapturePipeline, CaptureStreams};
use crate::clock::AudioClock;
use crate::codec::{self, AudioFrame, AudioMime, OutputFormat};
use crate::config::LiveConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::interrupt::InterruptionController;
use crate::scheduler::PlaybackScheduler;
use crate::transport::{Connector, EventStream, ServerEvent, TransportHandle};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    Open,
    Streaming,
    /// Transient: playback is being flushed after a barge-in.
    Interrupted,
    Closing,
    Closed,
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Open => "open",
            SessionState::Streaming => "streaming",
            SessionState::Interrupted => "interrupted",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }

    fn is_live(&self) -> bool {
        matches!(self, SessionState::Open | SessionState::Streaming)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "cause", rename_all = "snake_case")]
pub enum SessionOutcome {
    Closed,
    Failed(String),
}

/// What a session did, for the caller and the CLI summary.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub frames_sent: u64,
    pub chunks_scheduled: u64,
    pub decode_errors: u64,
    pub interruptions: u64,
    pub outcome: Option<SessionOutcome>,
}

enum Command {
    Close(oneshot::Sender<()>),
}

/// One input for the session loop.
enum Input {
    Command(Command),
    Fault(CaptureFault),
    Event(ServerEvent),
    EventsEnded,
    SetupExpired,
    Frame(AudioFrame),
}

/// Cloneable handle for observing and closing a running session from
/// another task (Ctrl-C handler, UI).
#[derive(Clone)]
pub struct SessionController {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SessionState>,
}

impl SessionController {
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Ask the session loop to close and wait until it has. Returns at once
    /// if the session already ended. The loop must be running (`run`).
    pub async fn close(&self) {
        if self.state().is_terminal() {
            return;
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.commands.send(Command::Close(ack_tx)).is_err() {
            return;
        }
        let mut state = self.state.clone();
        tokio::select! {
            _ = ack_rx => {}
            _ = state.wait_for(|s| s.is_terminal()) => {}
        }
    }

    /// Wait until the session reaches Closed or Failed.
    pub async fn finished(&self) -> SessionState {
        let mut state = self.state.clone();
        let terminal = match state.wait_for(|s| s.is_terminal()).await {
            Ok(terminal) => *terminal,
            Err(_) => *self.state.borrow(),
        };
        terminal
    }
}

pub struct LiveSession {
    config: LiveConfig,
    connector: Arc<dyn Connector>,
    input: Option<Box<dyn AudioInput>>,
    output_format: OutputFormat,
    scheduler: PlaybackScheduler,
    interrupts: InterruptionController,
    state: watch::Sender<SessionState>,
    transport: Option<TransportHandle>,
    events: Option<EventStream>,
    capture: Option<CapturePipeline>,
    streams: Option<CaptureStreams>,
    /// Set while Connecting: the endpoint must confirm setup by then.
    setup_deadline: Option<Instant>,
    commands_tx: mpsc::UnboundedSender<Command>,
    commands_rx: mpsc::UnboundedReceiver<Command>,
    report: SessionReport,
}

impl LiveSession {
    pub fn new(
        config: LiveConfig,
        input: Box<dyn AudioInput>,
        output: Arc<dyn AudioOutput>,
        clock: Arc<dyn AudioClock>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let output_format = output.format();
        let scheduler = PlaybackScheduler::new(clock, output, config.scheduler());
        let interrupts = InterruptionController::new(scheduler.clone());
        let (state, _) = watch::channel(SessionState::Idle);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let report = SessionReport {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            ended_at: None,
            frames_sent: 0,
            chunks_scheduled: 0,
            decode_errors: 0,
            interruptions: 0,
            outcome: None,
        };

        Self {
            config,
            connector,
            input: Some(input),
            output_format,
            scheduler,
            interrupts,
            state,
            transport: None,
            events: None,
            capture: None,
            streams: None,
            setup_deadline: None,
            commands_tx,
            commands_rx,
            report,
        }
    }

    pub fn id(&self) -> Uuid {
        self.report.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn controller(&self) -> SessionController {
        SessionController {
            commands: self.commands_tx.clone(),
            state: self.state.subscribe(),
        }
    }

    pub fn scheduler(&self) -> &PlaybackScheduler {
        &self.scheduler
    }

    pub fn report(&self) -> &SessionReport {
        &self.report
    }

    pub fn is_capturing(&self) -> bool {
        self.capture.as_ref().is_some_and(CapturePipeline::is_running)
    }

    /// Start connecting. The session becomes Open when the endpoint confirms,
    /// which must happen within `connect_timeout_secs` of this call.
    pub async fn open(&mut self) -> VoiceResult<()> {
        let state = self.state();
        if state != SessionState::Idle {
            return Err(VoiceError::InvalidState {
                state: state.as_str(),
                operation: "open",
            });
        }
        self.transition(SessionState::Connecting);

        let deadline = Instant::now() + self.config.connect_timeout();
        let connected = tokio::time::timeout_at(deadline, self.connector.connect(&self.config))
            .await
            .unwrap_or_else(|_| {
                Err(VoiceError::Transport(format!(
                    "no connection after {}s",
                    self.config.connect_timeout_secs
                )))
            });

        match connected {
            Ok(mut handle) => {
                self.events = handle.events();
                self.transport = Some(handle);
                self.setup_deadline = Some(deadline);
                Ok(())
            }
            Err(e) => {
                self.fail(&e).await;
                Err(e)
            }
        }
    }

    /// Wait for and handle one input. Returns `false` once the session has
    /// ended.
    pub async fn process_next(&mut self) -> VoiceResult<bool> {
        let state = self.state();
        if state.is_terminal() {
            return Ok(false);
        }
        if state == SessionState::Idle {
            return Err(VoiceError::InvalidState {
                state: state.as_str(),
                operation: "process events",
            });
        }

        let input = self.next_input().await;
        match input {
            Input::Command(Command::Close(ack)) => {
                self.shutdown("closed by caller").await;
                let _ = ack.send(());
            }
            Input::Fault(fault) => self.fail(&fault.into()).await,
            Input::Event(event) => self.handle_event(event).await,
            Input::EventsEnded => self.shutdown("transport ended").await,
            Input::SetupExpired => {
                let cause = VoiceError::Transport(format!(
                    "no setup confirmation after {}s",
                    self.config.connect_timeout_secs
                ));
                self.fail(&cause).await;
            }
            Input::Frame(frame) => self.send_frame(frame),
        }
        Ok(!self.state().is_terminal())
    }

    /// Open if needed, then process inputs until the session ends.
    pub async fn run(&mut self) -> VoiceResult<SessionReport> {
        if self.state() == SessionState::Idle {
            self.open().await?;
        }
        while self.process_next().await? {}
        Ok(self.report.clone())
    }

    /// Graceful shutdown from any state. Calling it again is a no-op.
    pub async fn close(&mut self) -> VoiceResult<()> {
        self.shutdown("closed by caller").await;
        Ok(())
    }

    async fn next_input(&mut self) -> Input {
        let (faults, frames) = match self.streams.as_mut() {
            Some(streams) => (Some(&mut streams.faults), Some(&mut streams.frames)),
            None => (None, None),
        };
        let events = self.events.as_mut();
        let commands = &mut self.commands_rx;
        let deadline = self.setup_deadline;

        // Control before faults before network before the setup deadline
        // before microphone.
        tokio::select! {
            biased;
            Some(command) = commands.recv() => Input::Command(command),
            fault = next_fault(faults) => Input::Fault(fault),
            event = next_event(events) => match event {
                Some(event) => Input::Event(event),
                None => Input::EventsEnded,
            },
            () = sleep_until_deadline(deadline) => Input::SetupExpired,
            frame = next_frame(frames) => Input::Frame(frame),
        }
    }

    async fn handle_event(&mut self, event: ServerEvent) {
        let state = self.state();
        match event {
            ServerEvent::Opened if state == SessionState::Connecting => {
                self.setup_deadline = None;
                self.transition(SessionState::Open);
                if let Err(e) = self.start_capture() {
                    self.fail(&e).await;
                }
            }
            ServerEvent::Opened => warn!("Ignoring repeated open while {}", state),
            ServerEvent::AudioChunk { bytes, mime } if state.is_live() => {
                if state == SessionState::Open {
                    self.transition(SessionState::Streaming);
                }
                if let Err(e) = self.play_chunk(&bytes, &mime) {
                    if e.is_fatal() {
                        self.fail(&e).await;
                    } else {
                        self.report.decode_errors += 1;
                        warn!("🔇 Dropping audio chunk: {}", e);
                    }
                }
            }
            ServerEvent::AudioChunk { .. } => warn!("Dropping audio received while {}", state),
            ServerEvent::Interrupted if state.is_live() => {
                self.transition(SessionState::Interrupted);
                self.interrupts.on_interrupted();
                self.report.interruptions = self.interrupts.interruptions();
                self.transition(state);
            }
            ServerEvent::Interrupted => debug!("Ignoring interruption while {}", state),
            ServerEvent::TurnComplete => debug!("Turn complete"),
            ServerEvent::Error(message) => self.fail(&VoiceError::Transport(message)).await,
            ServerEvent::Closed => self.shutdown("closed by remote").await,
        }
    }

    fn start_capture(&mut self) -> VoiceResult<()> {
        let input = self
            .input
            .take()
            .ok_or_else(|| VoiceError::DeviceUnavailable("microphone already released".to_string()))?;
        let (pipeline, streams) = CapturePipeline::start(input, self.config.capture())?;
        self.capture = Some(pipeline);
        self.streams = Some(streams);
        Ok(())
    }

    fn play_chunk(&mut self, bytes: &[u8], mime: &str) -> VoiceResult<()> {
        let mime: AudioMime = mime.parse()?;
        let audio = codec::decode(bytes, &mime, self.output_format)?;
        self.scheduler.schedule(audio)?;
        self.report.chunks_scheduled += 1;
        Ok(())
    }

    fn send_frame(&mut self, frame: AudioFrame) {
        let Some(transport) = self.transport.as_ref() else {
            return;
        };
        match transport.send(codec::encode(frame)) {
            Ok(()) => self.report.frames_sent += 1,
            // The event stream reports why the transport went away.
            Err(e) => debug!("Frame not sent: {}", e),
        }
    }

    async fn shutdown(&mut self, reason: &str) {
        let state = self.state();
        if state.is_terminal() {
            return;
        }
        info!(session = %self.report.id, "👋 Closing session: {}", reason);
        if state != SessionState::Idle {
            self.transition(SessionState::Closing);
        }
        self.teardown().await;
        self.finish(SessionState::Closed, SessionOutcome::Closed);
    }

    async fn fail(&mut self, cause: &VoiceError) {
        if self.state().is_terminal() {
            return;
        }
        error!(session = %self.report.id, "❌ Session failed: {}", cause);
        self.teardown().await;
        self.finish(SessionState::Failed, SessionOutcome::Failed(cause.to_string()));
    }

    /// Stop capture, then playback, then the transport.
    async fn teardown(&mut self) {
        self.setup_deadline = None;
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
        self.streams = None;
        self.input = None;

        self.scheduler.flush();

        self.events = None;
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }
    }

    fn finish(&mut self, state: SessionState, outcome: SessionOutcome) {
        self.report.ended_at = Some(Utc::now());
        self.report.outcome = Some(outcome);
        self.transition(state);
    }

    fn transition(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(session = %self.report.id, "🔀 {} → {}", previous, next);
        }
    }
}

async fn next_fault(faults: Option<&mut mpsc::UnboundedReceiver<CaptureFault>>) -> CaptureFault {
    match faults {
        Some(faults) => match faults.recv().await {
            Some(fault) => fault,
            None => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}

async fn next_frame(frames: Option<&mut mpsc::Receiver<AudioFrame>>) -> AudioFrame {
    match frames {
        Some(frames) => match frames.recv().await {
            Some(frame) => frame,
            None => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn next_event(events: Option<&mut EventStream>) -> Option<ServerEvent> {
    match events {
        Some(events) => events.next().await,
        None => std::future::pending().await,
    }
}

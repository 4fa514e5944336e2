//! Session transport: an ordered, bidirectional message channel to the remote
//! endpoint.
//!
//! A [`TransportHandle`] is the session's end. Whatever drives the other end
//! (a WebSocket task, or a [`RemotePeer`] in-process) holds the matching
//! [`TransportLink`]. The event stream always ends with `Closed`, and nothing
//! is delivered once `close` has been called.

use crate::codec::EncodedChunk;
use crate::config::LiveConfig;
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long `close` waits for a driver to finish its goodbye.
const DRIVER_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// A discrete message from the remote endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Opened,
    AudioChunk { bytes: Vec<u8>, mime: String },
    /// The remote side barged in; queued playback must be abandoned.
    Interrupted,
    /// The model finished its turn. Informational only.
    TurnComplete,
    Error(String),
    Closed,
}

/// Opens transports. Implemented by the WebSocket connector and the
/// in-memory connector.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &LiveConfig) -> VoiceResult<TransportHandle>;
}

/// Driver side of a transport.
pub struct TransportLink {
    /// Outbound chunks in send order.
    pub outbound: mpsc::UnboundedReceiver<EncodedChunk>,
    /// Inbound events for the session, in arrival order.
    pub events: mpsc::UnboundedSender<ServerEvent>,
    /// Flips to `true` when the session asks for a graceful close.
    pub shutdown: watch::Receiver<bool>,
}

/// Session side of a transport.
pub struct TransportHandle {
    outbound: mpsc::UnboundedSender<EncodedChunk>,
    events: Option<EventStream>,
    closed: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    driver: Option<JoinHandle<()>>,
}

impl TransportHandle {
    /// Create a connected handle/link pair.
    pub fn pair() -> (Self, TransportLink) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let closed = Arc::new(AtomicBool::new(false));

        let handle = Self {
            outbound: outbound_tx,
            events: Some(EventStream {
                rx: events_rx,
                closed: Arc::clone(&closed),
                finished: false,
            }),
            closed,
            shutdown: shutdown_tx,
            driver: None,
        };
        let link = TransportLink {
            outbound: outbound_rx,
            events: events_tx,
            shutdown: shutdown_rx,
        };
        (handle, link)
    }

    /// Let `close` wait for the task that drives the link.
    pub fn attach_driver(&mut self, driver: JoinHandle<()>) {
        self.driver = Some(driver);
    }

    /// Queue a chunk. Never blocks; order is preserved.
    pub fn send(&self, chunk: EncodedChunk) -> VoiceResult<()> {
        if self.is_closed() {
            return Err(VoiceError::Transport("transport is closed".to_string()));
        }
        self.outbound
            .send(chunk)
            .map_err(|_| VoiceError::Transport("transport driver has stopped".to_string()))
    }

    /// The event stream. Can be taken once; later calls return `None`.
    pub fn events(&mut self) -> Option<EventStream> {
        self.events.take()
    }

    /// Request a graceful shutdown and wait for the driver to finish.
    /// No event is delivered after this returns. Calling it again is a no-op.
    pub async fn close(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.send_replace(true);

        if let Some(mut driver) = self.driver.take() {
            match tokio::time::timeout(DRIVER_SHUTDOWN_GRACE, &mut driver).await {
                Ok(_) => debug!("Transport driver finished"),
                Err(_) => {
                    warn!("Transport driver did not stop in time, aborting it");
                    driver.abort();
                }
            }
        }
        info!("🔌 Transport closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        self.shutdown.send_replace(true);
    }
}

/// Ordered, non-restartable stream of [`ServerEvent`]s.
///
/// Yields `Closed` exactly once at the end, even if the driver vanished
/// without sending it, and yields nothing after the handle was closed.
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<ServerEvent>,
    closed: Arc<AtomicBool>,
    finished: bool,
}

impl Stream for EventStream {
    type Item = ServerEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<ServerEvent>> {
        let this = self.get_mut();
        if this.finished || this.closed.load(Ordering::SeqCst) {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(ServerEvent::Closed)) | Poll::Ready(None) => {
                this.finished = true;
                Poll::Ready(Some(ServerEvent::Closed))
            }
            other => other,
        }
    }
}

/// Connector that hands out one pre-wired in-process transport.
pub struct MemoryConnector {
    handle: Mutex<Option<TransportHandle>>,
    refusal: Option<String>,
}

impl MemoryConnector {
    pub fn new() -> (Self, RemotePeer) {
        let (handle, link) = TransportHandle::pair();
        (
            Self {
                handle: Mutex::new(Some(handle)),
                refusal: None,
            },
            RemotePeer { link },
        )
    }

    /// A connector whose `connect` always fails with `reason`.
    pub fn refusing(reason: impl Into<String>) -> Self {
        Self {
            handle: Mutex::new(None),
            refusal: Some(reason.into()),
        }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, _config: &LiveConfig) -> VoiceResult<TransportHandle> {
        if let Some(reason) = &self.refusal {
            return Err(VoiceError::Transport(reason.clone()));
        }
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| VoiceError::Transport("in-memory transport already connected".to_string()))
    }
}

/// The far end of an in-memory transport: plays the remote endpoint.
pub struct RemotePeer {
    link: TransportLink,
}

impl RemotePeer {
    /// Deliver an event to the session. False once the session side is gone.
    pub fn emit(&self, event: ServerEvent) -> bool {
        self.link.events.send(event).is_ok()
    }

    pub fn open(&self) -> bool {
        self.emit(ServerEvent::Opened)
    }

    pub fn audio(&self, bytes: Vec<u8>, mime: impl Into<String>) -> bool {
        self.emit(ServerEvent::AudioChunk {
            bytes,
            mime: mime.into(),
        })
    }

    pub fn interrupt(&self) -> bool {
        self.emit(ServerEvent::Interrupted)
    }

    /// Network failure: `Error` followed by `Closed`.
    pub fn fail(&self, message: impl Into<String>) -> bool {
        self.emit(ServerEvent::Error(message.into())) && self.emit(ServerEvent::Closed)
    }

    pub fn hang_up(&self) -> bool {
        self.emit(ServerEvent::Closed)
    }

    /// Next chunk the session sent, if one is waiting.
    pub fn try_recv_chunk(&mut self) -> Option<EncodedChunk> {
        self.link.outbound.try_recv().ok()
    }

    pub async fn recv_chunk(&mut self) -> Option<EncodedChunk> {
        self.link.outbound.recv().await
    }

    pub fn drain_chunks(&mut self) -> Vec<EncodedChunk> {
        let mut chunks = Vec::new();
        while let Some(chunk) = self.try_recv_chunk() {
            chunks.push(chunk);
        }
        chunks
    }

    /// Whether the session has asked to close.
    pub fn shutdown_requested(&self) -> bool {
        *self.link.shutdown.borrow()
    }
}

//! # Parley Live - Duplex Voice Sessions
//!
//! Streams microphone audio to a remote conversational model and plays its
//! spoken replies back gaplessly, abandoning queued speech the moment the
//! model reports it was interrupted.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Live Session                           │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────┐   │
//! │  │   Mic In     │→ │   Capture    │→ │  PCM16 encode →  │   │
//! │  │   (cpal)     │  │  (framing)   │  │    Transport     │   │
//! │  └──────────────┘  └──────────────┘  └────────┬─────────┘   │
//! │                                                ↓ events      │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────┐   │
//! │  │  Audio Out   │← │  Playback    │← │  PCM16 decode    │   │
//! │  │   (rodio)    │  │  Scheduler   │  │                  │   │
//! │  └──────────────┘  └──────▲───────┘  └──────────────────┘   │
//! │                           │ flush                            │
//! │                   ┌───────┴──────┐                           │
//! │                   │ Interruption │                           │
//! │                   └──────────────┘                           │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod capture;
pub mod clock;
pub mod codec;
pub mod config;
pub mod credentials;
pub mod error;
pub mod interrupt;
pub mod live_ws;
pub mod protocol;
pub mod scheduler;
pub mod session;
pub mod transport;

pub use audio::{AudioConfig, AudioInput, AudioOutput, CpalInput, RodioOutput};
pub use capture::{CaptureConfig, CaptureFault, CapturePipeline, CaptureStreams, Framer};
pub use clock::{AudioClock, DeviceClock, ManualClock};
pub use codec::{AudioFrame, AudioMime, DecodedAudio, EncodedChunk, OutputFormat};
pub use crate::config::LiveConfig;
pub use credentials::{key_source_for, EnvKey, KeySource, StaticKey};
pub use error::{VoiceError, VoiceResult};
pub use interrupt::InterruptionController;
pub use live_ws::WsConnector;
pub use scheduler::{FlushReport, ItemId, PlaybackItem, PlaybackScheduler, ScheduledItem, SchedulerConfig};
pub use session::{LiveSession, SessionController, SessionOutcome, SessionReport, SessionState};
pub use transport::{Connector, EventStream, MemoryConnector, RemotePeer, ServerEvent, TransportHandle};

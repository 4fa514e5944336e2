//! Capture pipeline: microphone samples → fixed-size frames → bounded hand-off.
//!
//! The device callback only slices samples into frames and `try_send`s them;
//! encoding happens on the session task. If the session falls more than
//! `max_buffered_frames` behind, the pipeline latches an overrun and stops
//! producing instead of buffering without bound.

use crate::audio::{AudioInput, FaultCallback, SampleCallback};
use crate::codec::AudioFrame;
use crate::error::{VoiceError, VoiceResult};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{error, info};

#[derive(Debug, Clone, Copy)]
pub struct CaptureConfig {
    /// Samples per frame (interleaved across channels).
    pub frame_size: usize,
    /// Frames allowed to wait for the consumer before an overrun.
    pub max_buffered_frames: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            frame_size: 4096,
            max_buffered_frames: 8,
        }
    }
}

/// Asynchronous capture failures. Both are fatal to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureFault {
    Overrun { capacity: usize },
    Device(String),
}

impl From<CaptureFault> for VoiceError {
    fn from(fault: CaptureFault) -> Self {
        match fault {
            CaptureFault::Overrun { capacity } => VoiceError::CaptureOverrun { capacity },
            CaptureFault::Device(msg) => VoiceError::DeviceUnavailable(msg),
        }
    }
}

/// Slices a continuous sample stream into equal frames without gaps or
/// duplication. A trailing partial frame waits for more input.
#[derive(Debug)]
pub struct Framer {
    frame_size: usize,
    sample_rate: u32,
    channels: u16,
    pending: Vec<f32>,
    sequence: u64,
}

impl Framer {
    pub fn new(frame_size: usize, sample_rate: u32, channels: u16) -> Self {
        Self {
            frame_size: frame_size.max(1),
            sample_rate,
            channels,
            pending: Vec::with_capacity(frame_size),
            sequence: 0,
        }
    }

    pub fn push(&mut self, mut samples: &[f32], mut emit: impl FnMut(AudioFrame)) {
        while !samples.is_empty() {
            let take = (self.frame_size - self.pending.len()).min(samples.len());
            self.pending.extend_from_slice(&samples[..take]);
            samples = &samples[take..];

            if self.pending.len() == self.frame_size {
                let full = std::mem::replace(&mut self.pending, Vec::with_capacity(self.frame_size));
                emit(AudioFrame {
                    samples: full,
                    sample_rate: self.sample_rate,
                    channels: self.channels,
                    sequence: self.sequence,
                });
                self.sequence += 1;
            }
        }
    }

    /// Samples waiting for the next frame to fill.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Frames emitted so far.
    pub fn frames_emitted(&self) -> u64 {
        self.sequence
    }
}

/// Consumer side of a running pipeline.
pub struct CaptureStreams {
    pub frames: mpsc::Receiver<AudioFrame>,
    pub faults: mpsc::UnboundedReceiver<CaptureFault>,
}

type FrameGate = Arc<Mutex<Option<mpsc::Sender<AudioFrame>>>>;

/// Owns the microphone for as long as it runs.
pub struct CapturePipeline {
    input: Box<dyn AudioInput>,
    gate: FrameGate,
    running: bool,
}

impl CapturePipeline {
    /// Acquire the microphone and start framing.
    pub fn start(
        mut input: Box<dyn AudioInput>,
        config: CaptureConfig,
    ) -> VoiceResult<(Self, CaptureStreams)> {
        if config.max_buffered_frames == 0 {
            return Err(VoiceError::Config("max_buffered_frames must be at least 1".to_string()));
        }

        let capacity = config.max_buffered_frames;
        let (frame_tx, frames) = mpsc::channel(capacity);
        let (fault_tx, faults) = mpsc::unbounded_channel();
        let gate: FrameGate = Arc::new(Mutex::new(Some(frame_tx)));

        let on_samples = frame_callback(
            Arc::clone(&gate),
            Framer::new(config.frame_size, input.sample_rate(), input.channels()),
            fault_tx.clone(),
            capacity,
        );
        let on_fault: FaultCallback = Box::new(move |msg: String| {
            error!("🎤 Capture device error: {}", msg);
            let _ = fault_tx.send(CaptureFault::Device(msg));
        });

        input.acquire(on_samples, on_fault)?;
        info!(
            "🎤 Capture pipeline running: {}-sample frames at {}Hz, up to {} buffered",
            config.frame_size,
            input.sample_rate(),
            capacity
        );

        Ok((
            Self {
                input,
                gate,
                running: true,
            },
            CaptureStreams { frames, faults },
        ))
    }

    /// Close the frame gate, then release the microphone. No frame is sent
    /// once this returns. Safe to call more than once.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.input.release();
        self.running = false;
        info!("🛑 Capture pipeline stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn frame_callback(
    gate: FrameGate,
    mut framer: Framer,
    fault_tx: mpsc::UnboundedSender<CaptureFault>,
    capacity: usize,
) -> SampleCallback {
    let mut overrun = false;
    Box::new(move |samples: &[f32]| {
        if overrun {
            return;
        }
        // Only contended by `stop`, which holds it for a pointer swap.
        let guard = gate.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = guard.as_ref() else {
            return;
        };
        framer.push(samples, |frame| {
            if overrun {
                return;
            }
            match tx.try_send(frame) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    overrun = true;
                    error!("🎤 Capture overrun: {} frames already waiting", capacity);
                    let _ = fault_tx.send(CaptureFault::Overrun { capacity });
                }
                Err(TrySendError::Closed(_)) => {}
            }
        });
    })
}

//! Audio device capabilities and their CPAL / Rodio implementations.
//!
//! The session only ever talks to [`AudioInput`] and [`AudioOutput`]. The
//! concrete devices each live on a dedicated thread that owns the platform
//! stream, because neither `cpal::Stream` nor `rodio::OutputStream` is `Send`
//! on every platform.

use crate::clock::{AudioClock, DeviceClock};
use crate::codec::OutputFormat;
use crate::error::{VoiceError, VoiceResult};
use crate::scheduler::{ItemId, PlaybackItem};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use rodio::buffer::SamplesBuffer;
use rodio::source::{EmptyCallback, Zero};
use rodio::{OutputStream, OutputStreamHandle, Sink, Source};
use std::collections::HashMap;
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Receives raw interleaved samples from the device callback. Must not block.
pub type SampleCallback = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// Receives asynchronous device failures (stream errors after start).
pub type FaultCallback = Box<dyn FnMut(String) + Send + 'static>;

/// Called once when a playback item finishes on its own.
pub type CompletionCallback = Box<dyn FnOnce() + Send + 'static>;

/// Capture device configuration
#[derive(Debug, Clone, Copy)]
pub struct AudioConfig {
    /// Sample rate in Hz (default: 16000)
    pub sample_rate: u32,

    /// Number of channels (default: 1 for mono)
    pub channels: u16,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
        }
    }
}

/// A microphone. Exclusively held between `acquire` and `release`.
pub trait AudioInput: Send {
    fn sample_rate(&self) -> u32;

    fn channels(&self) -> u16;

    /// Open the device and start delivering samples to `on_samples` from the
    /// device's own clock.
    fn acquire(&mut self, on_samples: SampleCallback, on_fault: FaultCallback) -> VoiceResult<()>;

    /// Stop delivery and give the device back. Safe to call repeatedly.
    fn release(&mut self);

    fn is_acquired(&self) -> bool;
}

/// A speaker that can start buffers at given times on a shared clock.
pub trait AudioOutput: Send + Sync {
    fn format(&self) -> OutputFormat;

    /// Arrange for `item` to start at `item.start_time`. The output takes
    /// the samples. `on_end` must be invoked from another thread (never from
    /// inside `play`) once the item has played out.
    fn play(&self, item: PlaybackItem, on_end: CompletionCallback) -> VoiceResult<()>;

    /// Silence `id` immediately, whether it has started or not. An output
    /// with a single queue may also silence whatever is queued alongside it;
    /// callers only stop items together.
    fn stop(&self, id: ItemId);
}

/// Default input device via CPAL.
pub struct CpalInput {
    config: AudioConfig,
    worker: Option<CaptureWorker>,
}

struct CaptureWorker {
    stop_tx: std_mpsc::Sender<()>,
    thread: thread::JoinHandle<()>,
}

impl CpalInput {
    pub fn new(config: AudioConfig) -> Self {
        Self {
            config,
            worker: None,
        }
    }

    /// List available input devices
    pub fn list_input_devices() -> VoiceResult<Vec<String>> {
        let host = cpal::default_host();
        let devices = host.input_devices()?;

        let mut device_names = Vec::new();
        for device in devices {
            if let Ok(name) = device.name() {
                device_names.push(name);
            }
        }

        Ok(device_names)
    }
}

fn open_input_stream(
    config: AudioConfig,
    mut on_samples: SampleCallback,
    mut on_fault: FaultCallback,
) -> VoiceResult<cpal::Stream> {
    let device = cpal::default_host()
        .default_input_device()
        .ok_or_else(|| VoiceError::DeviceUnavailable("No input device available".to_string()))?;

    info!(
        "📱 Using input device: {}",
        device.name().unwrap_or_else(|_| "Unknown".to_string())
    );
    debug!("🔧 Default input config: {:?}", device.default_input_config()?);

    let stream_config = StreamConfig {
        channels: config.channels,
        sample_rate: cpal::SampleRate(config.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let stream = device.build_input_stream(
        &stream_config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| on_samples(data),
        move |err| on_fault(err.to_string()),
        None,
    )?;
    stream.play()?;
    Ok(stream)
}

impl AudioInput for CpalInput {
    fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    fn channels(&self) -> u16 {
        self.config.channels
    }

    fn acquire(&mut self, on_samples: SampleCallback, on_fault: FaultCallback) -> VoiceResult<()> {
        if self.worker.is_some() {
            return Err(VoiceError::DeviceUnavailable(
                "microphone is already held by this session".to_string(),
            ));
        }

        info!(
            "🎤 Initializing audio capture ({}Hz, {} channels)",
            self.config.sample_rate, self.config.channels
        );

        let config = self.config;
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<VoiceResult<()>>(1);
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let thread = thread::Builder::new()
            .name("parley-capture".to_string())
            .spawn(move || {
                let stream = match open_input_stream(config, on_samples, on_fault) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                // Returns on release() or when the handle is dropped.
                let _ = stop_rx.recv();
                drop(stream);
                info!("🎤 Microphone released");
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!("✅ Audio capture started");
                self.worker = Some(CaptureWorker { stop_tx, thread });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(VoiceError::DeviceUnavailable(
                    "capture thread exited before the stream started".to_string(),
                ))
            }
        }
    }

    fn release(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.stop_tx.send(());
            if worker.thread.join().is_err() {
                warn!("Capture thread panicked during release");
            }
        }
    }

    fn is_acquired(&self) -> bool {
        self.worker.is_some()
    }
}

impl Drop for CpalInput {
    fn drop(&mut self) {
        self.release();
    }
}

enum PlaybackCommand {
    Play {
        item: PlaybackItem,
        on_end: CompletionCallback,
    },
    Stop(ItemId),
    Finished(ItemId),
    Shutdown,
}

/// Default output device via Rodio. Every item goes into one queue `Sink`,
/// with silence appended wherever an item starts after the queue ends.
pub struct RodioOutput {
    format: OutputFormat,
    clock: Arc<DeviceClock>,
    commands: mpsc::UnboundedSender<PlaybackCommand>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl RodioOutput {
    /// Open the default output device. `format` is the rate every payload
    /// must already be at.
    pub fn open(format: OutputFormat) -> VoiceResult<Self> {
        info!("🔊 Initializing audio playback ({}Hz)", format.sample_rate);

        let clock = Arc::new(DeviceClock::start());
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<VoiceResult<()>>(1);

        let thread_clock = Arc::clone(&clock);
        let loopback = commands.clone();
        let thread = thread::Builder::new()
            .name("parley-playback".to_string())
            .spawn(move || playback_thread(thread_clock, command_rx, loopback, ready_tx))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!("✅ Audio playback initialized");
                Ok(Self {
                    format,
                    clock,
                    commands,
                    thread: Mutex::new(Some(thread)),
                })
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(VoiceError::DeviceUnavailable(
                    "playback thread exited before the device opened".to_string(),
                ))
            }
        }
    }

    /// Clock the output device schedules against.
    pub fn clock(&self) -> Arc<DeviceClock> {
        Arc::clone(&self.clock)
    }
}

/// Bookkeeping for the single output queue: where it ends on the device
/// clock, and whose completion is still owed.
#[derive(Default)]
struct QueueLedger {
    end: Option<f64>,
    waiting: HashMap<ItemId, CompletionCallback>,
}

impl QueueLedger {
    /// Record an item and return the silence (seconds) to queue before it.
    /// A drained queue restarts from `now`.
    fn enqueue(
        &mut self,
        id: ItemId,
        start_time: f64,
        duration: f64,
        now: f64,
        drained: bool,
        on_end: CompletionCallback,
    ) -> f64 {
        let base = match self.end {
            Some(end) if !drained => end,
            _ => now,
        };
        let gap = (start_time - base).max(0.0);
        self.end = Some(base + gap + duration);
        self.waiting.insert(id, on_end);
        gap
    }

    fn finished(&mut self, id: ItemId) -> Option<CompletionCallback> {
        self.waiting.remove(&id)
    }

    fn holds(&self, id: ItemId) -> bool {
        self.waiting.contains_key(&id)
    }

    /// Forget everything queued. Stopped items never complete.
    fn clear(&mut self) -> usize {
        self.end = None;
        let dropped = self.waiting.len();
        self.waiting.clear();
        dropped
    }
}

fn open_sink(handle: &OutputStreamHandle) -> Option<Sink> {
    match Sink::try_new(handle) {
        Ok(sink) => Some(sink),
        Err(e) => {
            warn!("Playback: could not open sink: {}", e);
            None
        }
    }
}

fn playback_thread(
    clock: Arc<DeviceClock>,
    mut commands: mpsc::UnboundedReceiver<PlaybackCommand>,
    loopback: mpsc::UnboundedSender<PlaybackCommand>,
    ready_tx: std_mpsc::SyncSender<VoiceResult<()>>,
) {
    let opened = OutputStream::try_default()
        .map_err(VoiceError::from)
        .and_then(|(stream, handle)| {
            let sink = Sink::try_new(&handle)?;
            Ok((stream, handle, sink))
        });
    let (_stream, handle, sink) = match opened {
        Ok(opened) => opened,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };
    let _ = ready_tx.send(Ok(()));

    let mut sink = Some(sink);
    let mut ledger = QueueLedger::default();

    while let Some(command) = commands.blocking_recv() {
        match command {
            PlaybackCommand::Play { item, on_end } => {
                if sink.is_none() {
                    sink = open_sink(&handle);
                }
                let Some(queue) = sink.as_ref() else {
                    on_end();
                    continue;
                };

                let gap = ledger.enqueue(
                    item.id,
                    item.start_time,
                    item.duration,
                    clock.now(),
                    queue.empty(),
                    on_end,
                );
                if gap > 0.0 {
                    queue.append(
                        Zero::<f32>::new(item.channels, item.sample_rate)
                            .take_duration(Duration::from_secs_f64(gap)),
                    );
                }
                queue.append(SamplesBuffer::new(item.channels, item.sample_rate, item.samples));

                // Runs on the mixer thread: only hand the id back.
                let tx = loopback.clone();
                let id = item.id;
                queue.append(EmptyCallback::<f32>::new(Box::new(move || {
                    let _ = tx.send(PlaybackCommand::Finished(id));
                })));
            }
            PlaybackCommand::Stop(id) => {
                if !ledger.holds(id) {
                    continue;
                }
                if let Some(queue) = sink.take() {
                    queue.stop();
                }
                let dropped = ledger.clear();
                debug!("Playback queue cleared at {} ({} item(s))", id, dropped);
                sink = open_sink(&handle);
            }
            PlaybackCommand::Finished(id) => {
                if let Some(on_end) = ledger.finished(id) {
                    on_end();
                }
            }
            PlaybackCommand::Shutdown => break,
        }
    }

    if let Some(queue) = sink.take() {
        queue.stop();
    }
    info!("⏹️ Audio playback closed");
}

impl AudioOutput for RodioOutput {
    fn format(&self) -> OutputFormat {
        self.format
    }

    fn play(&self, item: PlaybackItem, on_end: CompletionCallback) -> VoiceResult<()> {
        self.commands
            .send(PlaybackCommand::Play { item, on_end })
            .map_err(|_| VoiceError::DeviceUnavailable("playback thread has stopped".to_string()))
    }

    fn stop(&self, id: ItemId) {
        let _ = self.commands.send(PlaybackCommand::Stop(id));
    }
}

impl Drop for RodioOutput {
    fn drop(&mut self) {
        let _ = self.commands.send(PlaybackCommand::Shutdown);
        if let Some(thread) = self.thread.lock().ok().and_then(|mut guard| guard.take()) {
            let _ = thread.join();
        }
    }
}

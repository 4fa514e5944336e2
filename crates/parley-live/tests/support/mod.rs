//! Test doubles: a hand-fed microphone, an output that records what it was
//! asked to play, and a session wired to an in-memory peer.

#![allow(dead_code)]

use parley_live::audio::{CompletionCallback, FaultCallback, SampleCallback};
use parley_live::{
    AudioInput, AudioOutput, ItemId, LiveConfig, LiveSession, ManualClock, MemoryConnector,
    OutputFormat, PlaybackItem, RemotePeer, VoiceError, VoiceResult,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Output rate used by the harness: one second is 1000 samples.
pub const OUTPUT_RATE: u32 = 1000;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

type Sink = Arc<Mutex<Option<SampleCallback>>>;
type Faults = Arc<Mutex<Option<FaultCallback>>>;

pub struct ScriptedInput {
    sink: Sink,
    faults: Faults,
    held: Arc<AtomicBool>,
    acquisitions: Arc<AtomicUsize>,
    /// When set, `acquire` fails with this message.
    refuse: Option<String>,
}

/// The test's side of a [`ScriptedInput`].
#[derive(Clone)]
pub struct MicControl {
    sink: Sink,
    faults: Faults,
    held: Arc<AtomicBool>,
    acquisitions: Arc<AtomicUsize>,
}

impl MicControl {
    /// Push samples as if the device callback fired.
    pub fn feed(&self, samples: &[f32]) {
        if let Some(callback) = self.sink.lock().unwrap().as_mut() {
            callback(samples);
        }
    }

    /// Report a stream error as the device's error callback would.
    pub fn fault(&self, message: &str) {
        if let Some(callback) = self.faults.lock().unwrap().as_mut() {
            callback(message.to_string());
        }
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }
}

pub fn scripted_input() -> (ScriptedInput, MicControl) {
    let sink: Sink = Arc::new(Mutex::new(None));
    let faults: Faults = Arc::new(Mutex::new(None));
    let held = Arc::new(AtomicBool::new(false));
    let acquisitions = Arc::new(AtomicUsize::new(0));
    (
        ScriptedInput {
            sink: Arc::clone(&sink),
            faults: Arc::clone(&faults),
            held: Arc::clone(&held),
            acquisitions: Arc::clone(&acquisitions),
            refuse: None,
        },
        MicControl {
            sink,
            faults,
            held,
            acquisitions,
        },
    )
}

/// A microphone that cannot be opened.
pub fn missing_input(message: &str) -> (ScriptedInput, MicControl) {
    let (mut input, mic) = scripted_input();
    input.refuse = Some(message.to_string());
    (input, mic)
}

impl AudioInput for ScriptedInput {
    fn sample_rate(&self) -> u32 {
        16000
    }

    fn channels(&self) -> u16 {
        1
    }

    fn acquire(&mut self, on_samples: SampleCallback, on_fault: FaultCallback) -> VoiceResult<()> {
        if let Some(message) = &self.refuse {
            return Err(VoiceError::DeviceUnavailable(message.clone()));
        }
        *self.sink.lock().unwrap() = Some(on_samples);
        *self.faults.lock().unwrap() = Some(on_fault);
        self.held.store(true, Ordering::SeqCst);
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn release(&mut self) {
        self.sink.lock().unwrap().take();
        self.faults.lock().unwrap().take();
        self.held.store(false, Ordering::SeqCst);
    }

    fn is_acquired(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Started {
    pub id: ItemId,
    pub start_time: f64,
    pub duration: f64,
}

pub struct RecordingOutput {
    format: OutputFormat,
    started: Mutex<Vec<Started>>,
    stopped: Mutex<Vec<ItemId>>,
    completions: Mutex<Vec<(ItemId, CompletionCallback)>>,
}

impl RecordingOutput {
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            started: Mutex::new(Vec::new()),
            stopped: Mutex::new(Vec::new()),
            completions: Mutex::new(Vec::new()),
        }
    }

    pub fn started(&self) -> Vec<Started> {
        self.started.lock().unwrap().clone()
    }

    pub fn start_times(&self) -> Vec<f64> {
        self.started().iter().map(|s| s.start_time).collect()
    }

    pub fn stopped(&self) -> Vec<ItemId> {
        self.stopped.lock().unwrap().clone()
    }

    /// Simulate the device finishing `id` naturally.
    pub fn finish(&self, id: ItemId) {
        let callback = {
            let mut completions = self.completions.lock().unwrap();
            let pos = completions
                .iter()
                .position(|(item, _)| *item == id)
                .expect("item was never played");
            completions.remove(pos).1
        };
        callback();
    }
}

impl AudioOutput for RecordingOutput {
    fn format(&self) -> OutputFormat {
        self.format
    }

    fn play(&self, item: PlaybackItem, on_end: CompletionCallback) -> VoiceResult<()> {
        self.started.lock().unwrap().push(Started {
            id: item.id,
            start_time: item.start_time,
            duration: item.duration,
        });
        self.completions.lock().unwrap().push((item.id, on_end));
        Ok(())
    }

    fn stop(&self, id: ItemId) {
        self.stopped.lock().unwrap().push(id);
    }
}

pub struct Harness {
    pub session: LiveSession,
    pub peer: RemotePeer,
    pub mic: MicControl,
    pub output: Arc<RecordingOutput>,
    pub clock: Arc<ManualClock>,
}

pub fn test_config() -> LiveConfig {
    LiveConfig {
        output_sample_rate: OUTPUT_RATE,
        frame_size: 160,
        max_buffered_frames: 4,
        api_key: Some("test-key".to_string()),
        ..LiveConfig::default()
    }
}

pub fn harness(config: LiveConfig, start: f64) -> Harness {
    harness_with_input(config, start, scripted_input())
}

pub fn harness_with_input(
    config: LiveConfig,
    start: f64,
    (input, mic): (ScriptedInput, MicControl),
) -> Harness {
    let output = Arc::new(RecordingOutput::new(config.output_format()));
    let clock = Arc::new(ManualClock::new(start));
    let (connector, peer) = MemoryConnector::new();
    let session = LiveSession::new(
        config,
        Box::new(input),
        output.clone(),
        clock.clone(),
        Arc::new(connector),
    );
    Harness {
        session,
        peer,
        mic,
        output,
        clock,
    }
}

impl Harness {
    /// Open the session and let the peer confirm it.
    pub async fn open(&mut self) {
        self.session.open().await.unwrap();
        assert!(self.peer.open());
        assert!(self.session.process_next().await.unwrap());
    }

    /// Deliver one chunk of silence lasting `secs` and process it.
    pub async fn deliver_audio(&mut self, secs: f64) {
        assert!(self.peer.audio(pcm_silence(secs), mime()));
        assert!(self.session.process_next().await.unwrap());
    }
}

pub fn mime() -> String {
    format!("audio/pcm;rate={}", OUTPUT_RATE)
}

/// PCM16LE silence at [`OUTPUT_RATE`].
pub fn pcm_silence(secs: f64) -> Vec<u8> {
    vec![0u8; (secs * OUTPUT_RATE as f64).round() as usize * 2]
}

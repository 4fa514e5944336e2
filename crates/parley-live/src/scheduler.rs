//! Gapless playback scheduling against the shared audio clock.
//!
//! Every decoded chunk starts at `max(next_start_time, now)`: back-to-back
//! with the previous chunk while the network keeps up, and at "now" once the
//! clock has outrun the queue. Nothing is ever dropped for being early, and
//! all state changes happen under one lock so two chunks can never race for
//! the same start time.

use crate::audio::AudioOutput;
use crate::clock::AudioClock;
use crate::codec::DecodedAudio;
use crate::error::{VoiceError, VoiceResult};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, info, warn};

/// Tolerance for float drift when comparing play intervals.
const TIME_EPSILON: f64 = 1e-9;

/// Identifies one scheduled buffer. Increases in arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemId(pub u64);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "item-{}", self.0)
    }
}

/// A decoded buffer with its slot on the audio clock.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackItem {
    pub id: ItemId,
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
    /// Clock value at which output begins.
    pub start_time: f64,
    /// Seconds of audio.
    pub duration: f64,
}

impl PlaybackItem {
    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration
    }
}

/// Timing of an item the output still holds. The samples themselves belong
/// to the output once `play` accepts them.
#[derive(Debug, Clone, Copy, PartialEq)]
struct QueuedSlot {
    start_time: f64,
    duration: f64,
}

impl QueuedSlot {
    fn end_time(&self) -> f64 {
        self.start_time + self.duration
    }
}

/// What `schedule` decided for a chunk.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledItem {
    pub id: ItemId,
    pub start_time: f64,
    pub duration: f64,
    /// Queued audio now reaches further ahead of the clock than the
    /// configured backlog limit. Informational; nothing was dropped.
    pub backlogged: bool,
}

/// Outcome of a flush.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlushReport {
    pub stopped: usize,
    /// New `next_start_time` (the clock value at the flush).
    pub reset_to: f64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SchedulerConfig {
    /// Warn once queued-ahead audio exceeds this many seconds.
    pub backlog_warn_secs: Option<f64>,
}

struct SchedulerState {
    next_start_time: f64,
    pending: BTreeMap<ItemId, QueuedSlot>,
    next_id: u64,
    backlogged: bool,
}

/// Schedules decoded audio for gapless, in-order playback.
///
/// Cloning gives another handle onto the same queue.
#[derive(Clone)]
pub struct PlaybackScheduler {
    state: Arc<Mutex<SchedulerState>>,
    clock: Arc<dyn AudioClock>,
    output: Arc<dyn AudioOutput>,
    config: SchedulerConfig,
}

fn lock(state: &Mutex<SchedulerState>) -> MutexGuard<'_, SchedulerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PlaybackScheduler {
    /// `next_start_time` starts at the clock's current value.
    pub fn new(
        clock: Arc<dyn AudioClock>,
        output: Arc<dyn AudioOutput>,
        config: SchedulerConfig,
    ) -> Self {
        let state = SchedulerState {
            next_start_time: clock.now(),
            pending: BTreeMap::new(),
            next_id: 0,
            backlogged: false,
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            clock,
            output,
            config,
        }
    }

    /// Queue `audio` to play right after everything already queued, or now
    /// if the queue has already drained.
    pub fn schedule(&self, audio: DecodedAudio) -> VoiceResult<ScheduledItem> {
        let duration = audio.duration_secs();
        if !duration.is_finite() || duration < 0.0 {
            return Err(VoiceError::SchedulingInvariantViolation(format!(
                "chunk has invalid duration {}",
                duration
            )));
        }

        let mut state = lock(&self.state);
        let now = self.clock.now();
        let start_time = state.next_start_time.max(now);

        let latest_end = state
            .pending
            .values()
            .map(QueuedSlot::end_time)
            .fold(f64::NEG_INFINITY, f64::max);
        if start_time + TIME_EPSILON < latest_end {
            return Err(VoiceError::SchedulingInvariantViolation(format!(
                "start {:.6} overlaps queued audio ending at {:.6}",
                start_time, latest_end
            )));
        }

        let id = ItemId(state.next_id);
        state.next_id += 1;

        let item = PlaybackItem {
            id,
            samples: audio.samples,
            sample_rate: audio.sample_rate,
            channels: audio.channels,
            start_time,
            duration,
        };

        self.output.play(item, completion(Arc::downgrade(&self.state), id))?;

        state.next_start_time = start_time + duration;
        state
            .pending
            .insert(id, QueuedSlot { start_time, duration });

        let ahead = state.next_start_time - now;
        let backlogged = self.config.backlog_warn_secs.is_some_and(|limit| ahead > limit);
        if backlogged && !state.backlogged {
            warn!(
                "Playback backlog: {:.1}s queued ahead of the clock ({} items)",
                ahead,
                state.pending.len()
            );
        }
        state.backlogged = backlogged;

        debug!(
            "Scheduled {} at {:.3}s for {:.3}s (now {:.3}s)",
            id, start_time, duration, now
        );

        Ok(ScheduledItem {
            id,
            start_time,
            duration,
            backlogged,
        })
    }

    /// Hard-stop everything queued or playing, empty the queue and restart
    /// the timeline at the clock's current value.
    pub fn flush(&self) -> FlushReport {
        let mut state = lock(&self.state);
        let stopped = state.pending.len();
        for id in state.pending.keys() {
            self.output.stop(*id);
        }
        state.pending.clear();
        state.backlogged = false;
        let now = self.clock.now();
        state.next_start_time = now;
        if stopped > 0 {
            info!("⏹️ Flushed {} playback item(s), timeline reset to {:.3}s", stopped, now);
        }
        FlushReport {
            stopped,
            reset_to: now,
        }
    }

    pub fn next_start_time(&self) -> f64 {
        lock(&self.state).next_start_time
    }

    pub fn pending_len(&self) -> usize {
        lock(&self.state).pending.len()
    }

    pub fn pending_ids(&self) -> Vec<ItemId> {
        lock(&self.state).pending.keys().copied().collect()
    }

    /// Seconds of audio queued beyond the current clock value.
    pub fn queued_ahead(&self) -> f64 {
        let next = lock(&self.state).next_start_time;
        (next - self.clock.now()).max(0.0)
    }

    pub fn clock(&self) -> &Arc<dyn AudioClock> {
        &self.clock
    }
}

fn completion(state: Weak<Mutex<SchedulerState>>, id: ItemId) -> crate::audio::CompletionCallback {
    Box::new(move || {
        if let Some(state) = state.upgrade() {
            if lock(&state).pending.remove(&id).is_some() {
                debug!("Finished {}", id);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::CompletionCallback;
    use crate::clock::ManualClock;
    use crate::codec::OutputFormat;

    #[derive(Default)]
    struct TestOutput {
        started: Mutex<Vec<(ItemId, f64)>>,
        received_samples: Mutex<Vec<usize>>,
        stopped: Mutex<Vec<ItemId>>,
        callbacks: Mutex<Vec<(ItemId, CompletionCallback)>>,
    }

    impl TestOutput {
        fn finish(&self, id: ItemId) {
            let mut callbacks = self.callbacks.lock().unwrap();
            let pos = callbacks.iter().position(|(i, _)| *i == id).unwrap();
            let (_, cb) = callbacks.remove(pos);
            drop(callbacks);
            cb();
        }
    }

    impl AudioOutput for TestOutput {
        fn format(&self) -> OutputFormat {
            OutputFormat {
                sample_rate: 1000,
                channels: 1,
            }
        }

        fn play(&self, item: PlaybackItem, on_end: CompletionCallback) -> VoiceResult<()> {
            self.started.lock().unwrap().push((item.id, item.start_time));
            self.received_samples.lock().unwrap().push(item.samples.len());
            self.callbacks.lock().unwrap().push((item.id, on_end));
            Ok(())
        }

        fn stop(&self, id: ItemId) {
            self.stopped.lock().unwrap().push(id);
        }
    }

    fn secs(duration: f64) -> DecodedAudio {
        DecodedAudio {
            samples: vec![0.0; (duration * 1000.0) as usize],
            sample_rate: 1000,
            channels: 1,
        }
    }

    fn setup(start: f64) -> (Arc<ManualClock>, Arc<TestOutput>, PlaybackScheduler) {
        let clock = Arc::new(ManualClock::new(start));
        let output = Arc::new(TestOutput::default());
        let scheduler = PlaybackScheduler::new(
            clock.clone(),
            output.clone(),
            SchedulerConfig::default(),
        );
        (clock, output, scheduler)
    }

    #[test]
    fn starts_at_clock_value() {
        let (_clock, _output, scheduler) = setup(12.5);
        assert_eq!(scheduler.next_start_time(), 12.5);
        assert_eq!(scheduler.pending_len(), 0);
    }

    #[test]
    fn completion_removes_item() {
        let (_clock, output, scheduler) = setup(0.0);
        let a = scheduler.schedule(secs(0.5)).unwrap();
        let b = scheduler.schedule(secs(0.5)).unwrap();
        assert_eq!(scheduler.pending_ids(), vec![a.id, b.id]);

        output.finish(a.id);
        assert_eq!(scheduler.pending_ids(), vec![b.id]);
    }

    #[test]
    fn queue_keeps_timing_and_hands_samples_to_the_output() {
        let (_clock, output, scheduler) = setup(2.0);
        let a = scheduler.schedule(secs(0.5)).unwrap();

        assert_eq!(*output.received_samples.lock().unwrap(), vec![500]);
        let slot = lock(&scheduler.state).pending[&a.id];
        assert_eq!(
            slot,
            QueuedSlot {
                start_time: 2.0,
                duration: 0.5
            }
        );
        assert!((slot.end_time() - 2.5).abs() < 1e-9);
    }

    #[test]
    fn late_completion_after_flush_is_harmless() {
        let (clock, output, scheduler) = setup(0.0);
        let a = scheduler.schedule(secs(1.0)).unwrap();
        clock.advance(0.2);
        scheduler.flush();
        let b = scheduler.schedule(secs(1.0)).unwrap();
        output.finish(a.id);
        assert_eq!(scheduler.pending_ids(), vec![b.id]);
        assert!((b.start_time - 0.2).abs() < 1e-9);
    }

    #[test]
    fn gapless_and_never_in_the_past_for_irregular_arrivals() {
        let (clock, _output, scheduler) = setup(3.0);
        // Deterministic pseudo-random arrivals and durations.
        let mut seed: u64 = 0x2545_F491_4F6C_DD1D;
        let mut next = || {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            (seed % 1000) as f64 / 1000.0
        };

        let mut previous: Option<ScheduledItem> = None;
        for _ in 0..200 {
            clock.advance(next() * 0.6);
            let now = clock.now();
            let item = scheduler.schedule(secs(0.05 + next() * 0.4)).unwrap();
            assert!(item.start_time >= now, "scheduled in the past");
            if let Some(prev) = previous {
                let prev_end = prev.start_time + prev.duration;
                assert!(item.start_time + 1e-9 >= prev_end, "overlap");
                if prev_end >= now {
                    assert!((item.start_time - prev_end).abs() < 1e-9, "artificial gap");
                }
            }
            previous = Some(item);
        }
    }

    #[test]
    fn backlog_is_flagged_not_dropped() {
        let clock = Arc::new(ManualClock::new(0.0));
        let output = Arc::new(TestOutput::default());
        let scheduler = PlaybackScheduler::new(
            clock,
            output.clone(),
            SchedulerConfig {
                backlog_warn_secs: Some(2.5),
            },
        );
        let flags: Vec<bool> = (0..4)
            .map(|_| scheduler.schedule(secs(1.0)).unwrap().backlogged)
            .collect();
        assert_eq!(flags, vec![false, false, true, true]);
        assert_eq!(scheduler.pending_len(), 4);
        assert_eq!(output.started.lock().unwrap().len(), 4);
        assert!((scheduler.queued_ahead() - 4.0).abs() < 1e-9);
    }
}

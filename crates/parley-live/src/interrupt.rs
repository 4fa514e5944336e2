//! Barge-in handling: when the remote side reports an interruption, every
//! queued buffer is abandoned and new audio starts from "now".

use crate::scheduler::{FlushReport, PlaybackScheduler};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

pub struct InterruptionController {
    scheduler: PlaybackScheduler,
    interruptions: AtomicU64,
}

impl InterruptionController {
    pub fn new(scheduler: PlaybackScheduler) -> Self {
        Self {
            scheduler,
            interruptions: AtomicU64::new(0),
        }
    }

    /// Stop all pending playback, clear the queue and reset the timeline to
    /// the clock's current value, as one step with respect to the scheduler.
    pub fn on_interrupted(&self) -> FlushReport {
        let report = self.scheduler.flush();
        let count = self.interruptions.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            "⚡ Interrupted (#{}): silenced {} item(s), playback restarts at {:.3}s",
            count, report.stopped, report.reset_to
        );
        report
    }

    pub fn interruptions(&self) -> u64 {
        self.interruptions.load(Ordering::SeqCst)
    }
}

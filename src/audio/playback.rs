//! # Playback Scheduling
//!
//! Synthesized audio arrives in bursts whose timing depends on the network, not
//! on when the previous chunk stops playing. The scheduler hides that jitter by
//! keeping a cursor at the end of the last scheduled chunk and starting every
//! new chunk exactly there.
//!
//! ## Timeline:
//! ```text
//! device time ──────────────────────────────────────────────▶
//!              [ chunk 1 ][ chunk 2 ][ chunk 3 ]
//!                         ^ cursor after chunk 1
//! ```
//!
//! ## Guarantees:
//! - Chunks never overlap and leave no gaps while they keep arriving in time
//! - The cursor never trails the device clock, so nothing is scheduled in the past
//! - `flush()` stops everything immediately (barge-in)

use crate::audio::codec::DecodedAudio;
use tracing::{debug, trace};

/// An output device with its own clock.
///
/// Times are seconds on the device clock, the same unit `play_at` uses.
pub trait PlaybackDevice: Send {
    /// Current position of the device clock.
    fn current_time(&self) -> f64;

    /// Start playing `audio` at `start_at`.
    fn play_at(&mut self, id: u64, audio: &DecodedAudio, start_at: f64);

    /// Stop a scheduled or playing chunk. Unknown or finished ids are ignored.
    fn stop(&mut self, id: u64);
}

/// A chunk that is queued or currently playing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackHandle {
    pub id: u64,
    pub start_at: f64,
    pub duration: f64,
}

impl PlaybackHandle {
    pub fn end_at(&self) -> f64 {
        self.start_at + self.duration
    }
}

/// Gap-free scheduler owning the playback device for one call.
pub struct PlaybackScheduler<D: PlaybackDevice> {
    device: D,
    /// Next free playback time; `None` until the first chunk
    cursor: Option<f64>,
    active: Vec<PlaybackHandle>,
    next_id: u64,
}

impl<D: PlaybackDevice> PlaybackScheduler<D> {
    pub fn new(device: D) -> Self {
        Self {
            device,
            cursor: None,
            active: Vec::new(),
            next_id: 0,
        }
    }

    /// Current time on the owned device's clock.
    pub fn device_time(&self) -> f64 {
        self.device.current_time()
    }

    pub fn cursor(&self) -> Option<f64> {
        self.cursor
    }

    /// Schedule `audio` right after everything already queued.
    ///
    /// `now` is the device time at the moment the chunk is handed over; the
    /// cursor is pulled forward to it if playback had drained.
    pub fn enqueue(&mut self, audio: &DecodedAudio, now: f64) -> PlaybackHandle {
        self.reap(now);

        let start_at = match self.cursor {
            Some(cursor) => cursor.max(now),
            None => now,
        };
        let handle = PlaybackHandle {
            id: self.next_id,
            start_at,
            duration: audio.duration_seconds(),
        };
        self.next_id += 1;

        self.device.play_at(handle.id, audio, start_at);
        self.cursor = Some(handle.end_at());
        self.active.push(handle);

        trace!(
            id = handle.id,
            start_at = handle.start_at,
            duration = handle.duration,
            queued = self.active.len(),
            "Scheduled playback chunk"
        );
        handle
    }

    /// Stop every queued or playing chunk and reset the cursor to device now.
    pub fn flush(&mut self) {
        let now = self.device.current_time();
        let stopped = self.active.len();

        for handle in self.active.drain(..) {
            self.device.stop(handle.id);
        }
        self.cursor = Some(now);

        debug!(stopped, at = now, "Flushed playback");
    }

    /// Drop handles that finished playing by `now`.
    pub fn reap(&mut self, now: f64) {
        self.active.retain(|handle| handle.end_at() > now);
    }

    /// Handles still queued or playing according to the device clock.
    pub fn active(&mut self) -> &[PlaybackHandle] {
        let now = self.device.current_time();
        self.reap(now);
        &self.active
    }

    /// Seconds of audio still ahead of the device clock.
    pub fn buffered_seconds(&self) -> f64 {
        let now = self.device.current_time();
        self.cursor.map_or(0.0, |cursor| (cursor - now).max(0.0))
    }
}

//! # Microphone Capture
//!
//! Turns the microphone's stream of sample blocks into fixed-size frames,
//! encodes each frame and hands it to a sink (normally the transport).
//!
//! ## Muting:
//! Muting is a hard cut. Blocks captured while muted are dropped on the spot
//! along with any partial frame; nothing is buffered and replayed after unmuting.
//!
//! ## Ordering:
//! Frames leave in capture order. A dropped frame leaves a gap in time but
//! never reorders the frames after it.

use crate::audio::codec;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Default tap size, ~256ms at 16kHz.
pub const DEFAULT_FRAME_SIZE: usize = 4096;

type ReleaseHook = Box<dyn FnOnce() + Send>;

/// An opened microphone.
///
/// Owns the receiving end of the device's sample blocks and a release hook
/// that runs exactly once, either on [`MicrophoneStream::release`] or on drop.
pub struct MicrophoneStream {
    sample_rate: u32,
    frames: Option<mpsc::Receiver<Vec<f32>>>,
    on_release: Option<ReleaseHook>,
}

impl MicrophoneStream {
    pub fn new(sample_rate: u32, frames: mpsc::Receiver<Vec<f32>>) -> Self {
        Self {
            sample_rate,
            frames: Some(frames),
            on_release: None,
        }
    }

    /// Attach the hook that gives the device back to the host.
    pub fn with_release<F>(mut self, release: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_release = Some(Box::new(release));
        self
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Take the sample blocks so a pump can consume them.
    pub fn take_frames(&mut self) -> Option<mpsc::Receiver<Vec<f32>>> {
        self.frames.take()
    }

    /// Release the device. Later calls do nothing.
    pub fn release(&mut self) {
        self.frames = None;
        if let Some(release) = self.on_release.take() {
            debug!("Releasing microphone");
            release();
        }
    }
}

impl Drop for MicrophoneStream {
    fn drop(&mut self) {
        self.release();
    }
}

/// Re-chunks arbitrary sample blocks into fixed frames and applies the mute flag.
///
/// This is the synchronous core of the pump; one call to [`CaptureTap::push`]
/// corresponds to one delivery from the microphone.
pub struct CaptureTap {
    frame_size: usize,
    pending: Vec<f32>,
    muted: Arc<AtomicBool>,
    emitted: u64,
    dropped: u64,
}

impl CaptureTap {
    pub fn new(frame_size: usize, muted: Arc<AtomicBool>) -> Self {
        let frame_size = frame_size.max(1);
        Self {
            frame_size,
            pending: Vec::with_capacity(frame_size),
            muted,
            emitted: 0,
            dropped: 0,
        }
    }

    /// Feed one block of samples; every completed frame is encoded and
    /// passed to `on_frame`.
    ///
    /// A block that arrives while muted is discarded together with any
    /// partial frame still pending, so nothing captured around the mute
    /// reaches the service after unmuting.
    pub fn push<F>(&mut self, block: &[f32], on_frame: &mut F)
    where
        F: FnMut(String),
    {
        if self.muted.load(Ordering::SeqCst) {
            self.pending.clear();
            self.dropped += 1;
            trace!(dropped = self.dropped, "Dropped muted capture block");
            return;
        }

        self.pending.extend_from_slice(block);

        while self.pending.len() >= self.frame_size {
            let frame: Vec<f32> = self.pending.drain(..self.frame_size).collect();
            self.emitted += 1;
            on_frame(codec::encode_transport_audio(&frame));
        }
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Drives a [`CaptureTap`] from the microphone on a background task.
pub struct CapturePump {
    frame_size: usize,
    task: Option<JoinHandle<()>>,
}

impl CapturePump {
    pub fn new(frame_size: usize) -> Self {
        Self {
            frame_size,
            task: None,
        }
    }

    /// Attach the tap to `frames`. A previously running tap is detached first.
    pub fn start<F>(&mut self, mut frames: mpsc::Receiver<Vec<f32>>, muted: Arc<AtomicBool>, mut on_frame: F)
    where
        F: FnMut(String) + Send + 'static,
    {
        self.stop();

        let mut tap = CaptureTap::new(self.frame_size, muted);
        debug!(frame_size = self.frame_size, "Starting capture pump");

        self.task = Some(tokio::spawn(async move {
            while let Some(block) = frames.recv().await {
                tap.push(&block, &mut on_frame);
            }
            debug!(
                emitted = tap.emitted(),
                dropped = tap.dropped(),
                "Microphone stream ended"
            );
        }));
    }

    /// Detach the tap. Calling this when not started is a no-op.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("Stopped capture pump");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for CapturePump {
    fn drop(&mut self) {
        self.stop();
    }
}

//! # Audio Module
//!
//! Everything that touches audio samples during a live call.
//!
//! ## Key Components:
//! - **Codec**: float ↔ 16-bit PCM ↔ base64 transport text
//! - **Playback**: gap-free scheduling of synthesized audio, with barge-in flush
//! - **Capture**: fixed-size microphone frames forwarded while unmuted
//!
//! ## Audio Format Requirements:
//! - **Capture**: 16kHz, 16-bit PCM, mono, little-endian
//! - **Playback**: 24kHz, 16-bit PCM, mono, little-endian

pub mod capture;
pub mod codec;
pub mod playback;

use crate::error::CallError;
use std::future::Future;

pub use capture::{CapturePump, CaptureTap, MicrophoneStream};
pub use codec::{AudioFormat, DecodedAudio};
pub use playback::{PlaybackDevice, PlaybackHandle, PlaybackScheduler};

/// Host access to the microphone and the playback device.
///
/// Both calls may suspend (permission prompts, device start-up); everything
/// after them in a call is synchronous.
pub trait MediaDevices {
    type Playback: PlaybackDevice + 'static;

    /// Ask for the microphone. Refusal maps to `CallError::PermissionDenied`.
    fn open_microphone(&self) -> impl Future<Output = Result<MicrophoneStream, CallError>>;

    /// Open the output device.
    fn open_playback(&self) -> impl Future<Output = Result<Self::Playback, CallError>>;
}

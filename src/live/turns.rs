//! # Turn Assembly
//!
//! The service streams transcription in small fragments for both sides of the
//! conversation. Fragments accumulate per speaker until the service signals
//! the end of a turn, at which point each non-empty buffer becomes one
//! finished transcript line.

use crate::live::protocol::SpeakerRole;
use serde::Serialize;

/// One line of the call transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptLine {
    pub role: SpeakerRole,
    pub text: String,
    pub is_final: bool,
}

impl TranscriptLine {
    pub fn finished(role: SpeakerRole, text: String) -> Self {
        Self {
            role,
            text,
            is_final: true,
        }
    }
}

/// Per-role fragment buffers for the turn in progress.
#[derive(Debug, Default)]
pub struct TurnAssembler {
    local: String,
    remote: String,
}

impl TurnAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    fn buffer_mut(&mut self, role: SpeakerRole) -> &mut String {
        match role {
            SpeakerRole::Local => &mut self.local,
            SpeakerRole::Remote => &mut self.remote,
        }
    }

    pub fn on_fragment(&mut self, role: SpeakerRole, text: &str) {
        self.buffer_mut(role).push_str(text);
    }

    /// Finish the turn: local first, then remote, skipping empty buffers.
    pub fn on_turn_complete(&mut self) -> Vec<TranscriptLine> {
        [SpeakerRole::Local, SpeakerRole::Remote]
            .into_iter()
            .filter_map(|role| {
                let text = std::mem::take(self.buffer_mut(role));
                (!text.is_empty()).then(|| TranscriptLine::finished(role, text))
            })
            .collect()
    }

    /// Text accumulated so far for `role` in the current turn.
    pub fn pending(&self, role: SpeakerRole) -> &str {
        match role {
            SpeakerRole::Local => &self.local,
            SpeakerRole::Remote => &self.remote,
        }
    }

    /// Drop whatever is buffered without emitting it.
    pub fn clear(&mut self) {
        self.local.clear();
        self.remote.clear();
    }
}

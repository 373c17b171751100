//! # Live Session Wire Protocol
//!
//! JSON messages exchanged with the bidirectional speech service.
//!
//! ## Client → Service:
//! - **setup**: sent once after the socket opens; model, voice, prompt, and
//!   requests for incremental transcription of both sides
//! - **realtimeInput**: one per microphone frame, `{ data, mimeType }`
//!
//! ## Service → Client:
//! - **setupComplete**: the session is open, audio may flow
//! - **serverContent**: any mix of synthesized audio, transcription fragments,
//!   `interrupted` and `turnComplete`
//! - **goAway**: the service will drop the connection soon

use crate::audio::codec::AudioFormat;
use serde::{Deserialize, Serialize};

/// Which side of the conversation a transcript belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeakerRole {
    /// The user at the microphone
    Local,
    /// The speech model
    Remote,
}

impl SpeakerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpeakerRole::Local => "local",
            SpeakerRole::Remote => "remote",
        }
    }
}

/// Inbound events, decoded from service messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Synthesized audio as transport text (base64 PCM)
    AudioChunk(String),
    /// Incremental transcription of one side
    TranscriptFragment { role: SpeakerRole, text: String },
    /// The service finished its turn
    TurnComplete,
    /// The user started talking over synthesized audio
    Interrupted,
    /// Something went wrong; fatal errors end the call
    Error { detail: String, fatal: bool },
}

/// What a call asks of the service when it connects.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSetup {
    pub model: String,
    pub voice_name: String,
    pub system_instruction: String,
    pub input_sample_rate: u32,
    pub transcribe_input: bool,
    pub transcribe_output: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupMessage {
    pub setup: Setup,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<Empty>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<Empty>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

/// Serializes as `{}`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Empty {}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub data: String,
    pub mime_type: String,
}

impl SetupMessage {
    pub fn new(setup: &SessionSetup) -> Self {
        Self {
            setup: Setup {
                model: setup.model.clone(),
                generation_config: GenerationConfig {
                    response_modalities: vec!["AUDIO".to_string()],
                    speech_config: SpeechConfig {
                        voice_config: VoiceConfig {
                            prebuilt_voice_config: PrebuiltVoiceConfig {
                                voice_name: setup.voice_name.clone(),
                            },
                        },
                    },
                },
                system_instruction: Content {
                    parts: vec![Part {
                        text: Some(setup.system_instruction.clone()),
                        inline_data: None,
                    }],
                },
                input_audio_transcription: setup.transcribe_input.then(Empty::default),
                output_audio_transcription: setup.transcribe_output.then(Empty::default),
            },
        }
    }
}

/// One microphone frame on its way out.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInputMessage {
    pub realtime_input: RealtimeInput,
}

#[derive(Debug, Serialize)]
pub struct RealtimeInput {
    pub audio: Blob,
}

impl RealtimeInputMessage {
    pub fn audio(data: String, format: AudioFormat) -> Self {
        Self {
            realtime_input: RealtimeInput {
                audio: Blob {
                    data,
                    mime_type: format.mime_type(),
                },
            },
        }
    }
}

/// Any message the service may send. Unknown fields are ignored.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<Empty>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub go_away: Option<GoAway>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<Content>,
    #[serde(default)]
    pub input_transcription: Option<Transcription>,
    #[serde(default)]
    pub output_transcription: Option<Transcription>,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub interrupted: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct Transcription {
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

impl ServerMessage {
    pub fn parse(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    /// Flatten into events.
    ///
    /// One message may carry several kinds at once. They come out as: input
    /// transcription, output transcription, audio parts, interrupted, turn
    /// complete, so a turn completion sees the fragments delivered with it.
    pub fn into_events(self) -> Vec<ServerEvent> {
        let mut events = Vec::new();

        if let Some(content) = self.server_content {
            let fragments = [
                (SpeakerRole::Local, content.input_transcription),
                (SpeakerRole::Remote, content.output_transcription),
            ];
            for (role, transcription) in fragments {
                if let Some(text) = transcription.and_then(|t| t.text).filter(|t| !t.is_empty()) {
                    events.push(ServerEvent::TranscriptFragment { role, text });
                }
            }

            if let Some(turn) = content.model_turn {
                events.extend(
                    turn.parts
                        .into_iter()
                        .filter_map(|part| part.inline_data)
                        .filter(|blob| blob.mime_type.starts_with("audio/pcm"))
                        .map(|blob| ServerEvent::AudioChunk(blob.data)),
                );
            }

            if content.interrupted {
                events.push(ServerEvent::Interrupted);
            }
            if content.turn_complete {
                events.push(ServerEvent::TurnComplete);
            }
        }

        if let Some(go_away) = self.go_away {
            events.push(ServerEvent::Error {
                detail: format!(
                    "service is closing the session (time left: {})",
                    go_away.time_left.as_deref().unwrap_or("unknown")
                ),
                fatal: false,
            });
        }

        events
    }
}

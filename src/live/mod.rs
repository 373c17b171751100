//! # Live Session Module
//!
//! The conversation side of a call: the wire protocol spoken with the speech
//! service, the transport session carrying it, transcript assembly, and the
//! controller tying those to the audio pipeline.
//!
//! ## Data Flow:
//! ```text
//! microphone ─▶ CapturePump ─▶ TransportLink ─▶ service
//! service ─▶ ServerEvent ─▶ SessionController ─┬▶ PlaybackScheduler
//!                                              └▶ TurnAssembler ─▶ transcript
//! ```

pub mod connector;
pub mod controller;
pub mod protocol;
pub mod transport;
pub mod turns;

pub use connector::WebSocketConnector;
pub use controller::{CallPhase, CallSnapshot, ControllerOptions, SessionController};
pub use protocol::{ServerEvent, SessionSetup, SpeakerRole};
pub use transport::{LiveConnector, Outbound, TransportLink, TransportSession, TransportState, TransportStatus};
pub use turns::{TranscriptLine, TurnAssembler};

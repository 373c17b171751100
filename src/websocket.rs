//! # WebSocket Call Bridge
//!
//! Lets a browser drive a live call through this server. The browser keeps
//! the real microphone and speakers; the server runs the session controller
//! and talks to the speech service.
//!
//! ## WebSocket Protocol (`/ws/call`):
//! 1. **Connection**: one bridge per socket, limited by `performance.max_concurrent_calls`
//! 2. **Start**: `{"type": "start_call", "microphone_granted": true}`
//! 3. **Microphone**: binary frames of little-endian f32 samples at the capture rate
//! 4. **Controls**: `set_muted`, `set_video_enabled`, `end_call`, `ping`
//! 5. **Close**: closing the socket ends the call
//!
//! ## Server → Client:
//! - `call_state`: call snapshot (phase, elapsed seconds, flags, last error)
//! - `transcript`: one finished transcript line
//! - `playback`: a chunk to play at `start_at` seconds on the call clock,
//!   which starts at 0 when the call connects
//! - `playback_stop`: stop a chunk (barge-in)
//! - `error` / `pong`

use crate::audio::codec::{self, DecodedAudio};
use crate::audio::{MediaDevices, MicrophoneStream, PlaybackDevice};
use crate::error::{AppError, CallError};
use crate::live::{CallPhase, CallSnapshot, ControllerOptions, SessionController, TranscriptLine, WebSocketConnector};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::rc::Rc;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::{UnboundedReceiverStream, WatchStream};
use tracing::{debug, error, info, warn};

/// How often the server pings the client.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// A client silent for this long is disconnected.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(45);

/// Microphone blocks buffered between the socket and the capture pump.
const MICROPHONE_QUEUE_DEPTH: usize = 32;

type BridgeController = SessionController<WebSocketConnector, BridgeDevices>;

/// Messages from the client.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    StartCall { microphone_granted: bool },
    SetMuted { muted: bool },
    SetVideoEnabled { enabled: bool },
    EndCall,
    Ping {
        #[serde(default)]
        timestamp: u64,
    },
}

/// Messages to the client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeMessage {
    CallState(CallSnapshot),
    Transcript(TranscriptLine),
    Playback {
        id: u64,
        start_at: f64,
        duration: f64,
        sample_rate: u32,
        channels: u16,
        /// Base64 16-bit PCM, interleaved
        data: String,
    },
    PlaybackStop {
        id: u64,
    },
    Error {
        code: String,
        message: String,
    },
    Pong {
        timestamp: u64,
    },
}

/// A message for the bridge to forward to its client.
#[derive(Message)]
#[rtype(result = "()")]
pub struct Outgoing(pub BridgeMessage);

/// Updates streamed from the controller into the actor.
pub enum CallUpdate {
    State(CallSnapshot),
    Transcript(TranscriptLine),
}

/// Holds one unit of the concurrent call limit until dropped.
pub struct CallSlot {
    state: web::Data<AppState>,
}

impl CallSlot {
    pub fn acquire(state: web::Data<AppState>) -> Option<Self> {
        state.try_acquire_call_slot().then_some(Self { state })
    }
}

impl Drop for CallSlot {
    fn drop(&mut self) {
        self.state.release_call_slot();
    }
}

/// Playback device that forwards scheduled chunks to the client.
///
/// The clock starts when the device opens, right before the call connects.
pub struct RemotePlayback {
    origin: Instant,
    target: Recipient<Outgoing>,
}

impl RemotePlayback {
    pub fn new(target: Recipient<Outgoing>) -> Self {
        Self {
            origin: Instant::now(),
            target,
        }
    }
}

fn interleave(audio: &DecodedAudio) -> Vec<f32> {
    if let [mono] = audio.channels.as_slice() {
        return mono.clone();
    }
    (0..audio.frames())
        .flat_map(|i| audio.channels.iter().map(move |channel| channel[i]))
        .collect()
}

impl PlaybackDevice for RemotePlayback {
    fn current_time(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    fn play_at(&mut self, id: u64, audio: &DecodedAudio, start_at: f64) {
        self.target.do_send(Outgoing(BridgeMessage::Playback {
            id,
            start_at,
            duration: audio.duration_seconds(),
            sample_rate: audio.sample_rate,
            channels: audio.channels.len() as u16,
            data: codec::encode_transport_audio(&interleave(audio)),
        }));
    }

    fn stop(&mut self, id: u64) {
        self.target.do_send(Outgoing(BridgeMessage::PlaybackStop { id }));
    }
}

/// Media devices backed by the client on the other end of the socket.
pub struct BridgeDevices {
    microphone_granted: bool,
    sample_rate: u32,
    microphone: Mutex<Option<mpsc::Receiver<Vec<f32>>>>,
    playback_target: Recipient<Outgoing>,
}

impl BridgeDevices {
    pub fn new(
        microphone_granted: bool,
        sample_rate: u32,
        microphone: mpsc::Receiver<Vec<f32>>,
        playback_target: Recipient<Outgoing>,
    ) -> Self {
        Self {
            microphone_granted,
            sample_rate,
            microphone: Mutex::new(Some(microphone)),
            playback_target,
        }
    }
}

impl MediaDevices for BridgeDevices {
    type Playback = RemotePlayback;

    async fn open_microphone(&self) -> Result<MicrophoneStream, CallError> {
        if !self.microphone_granted {
            return Err(CallError::PermissionDenied(
                "the client did not grant microphone access".to_string(),
            ));
        }

        let frames = self
            .microphone
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or_else(|| CallError::DeviceUnavailable("microphone already opened".to_string()))?;

        Ok(MicrophoneStream::new(self.sample_rate, frames).with_release(|| debug!("Bridge microphone released")))
    }

    async fn open_playback(&self) -> Result<RemotePlayback, CallError> {
        Ok(RemotePlayback::new(self.playback_target.clone()))
    }
}

/// One client connection and, at most, one call at a time.
pub struct CallWebSocket {
    state: web::Data<AppState>,
    _slot: CallSlot,
    call: Option<Rc<BridgeController>>,
    microphone: Option<mpsc::Sender<Vec<f32>>>,
    /// Preferences applied to every call started on this socket
    muted: bool,
    video_enabled: bool,
    last_heartbeat: Instant,
}

impl CallWebSocket {
    pub fn new(state: web::Data<AppState>, slot: CallSlot) -> Self {
        Self {
            state,
            _slot: slot,
            call: None,
            microphone: None,
            muted: false,
            video_enabled: true,
            last_heartbeat: Instant::now(),
        }
    }

    fn send(&self, ctx: &mut ws::WebsocketContext<Self>, message: &BridgeMessage) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(err) => error!(error = %err, "Failed to encode bridge message"),
        }
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, code: &str, message: &str) {
        self.send(
            ctx,
            &BridgeMessage::Error {
                code: code.to_string(),
                message: message.to_string(),
            },
        );
    }

    fn call_in_progress(&self) -> bool {
        self.call
            .as_ref()
            .is_some_and(|call| matches!(call.phase(), CallPhase::Connecting | CallPhase::Connected))
    }

    fn start_call(&mut self, microphone_granted: bool, ctx: &mut ws::WebsocketContext<Self>) {
        if self.call_in_progress() {
            self.send_error(ctx, "invalid_state", "a call is already in progress");
            return;
        }

        let config = self.state.get_config();
        let (microphone_tx, microphone_rx) = mpsc::channel(MICROPHONE_QUEUE_DEPTH);
        let devices = BridgeDevices::new(
            microphone_granted,
            config.audio.input_sample_rate,
            microphone_rx,
            ctx.address().recipient(),
        );
        let controller = Rc::new(SessionController::new(
            WebSocketConnector::from_config(&config),
            devices,
            ControllerOptions::from_config(&config),
        ));

        let (transcript_tx, transcript_rx) = mpsc::unbounded_channel();
        controller.set_transcript_sink(transcript_tx);
        controller.set_muted(self.muted);
        controller.set_video_enabled(self.video_enabled);

        ctx.add_stream(WatchStream::new(controller.subscribe()).map(CallUpdate::State));
        ctx.add_stream(UnboundedReceiverStream::new(transcript_rx).map(CallUpdate::Transcript));

        self.microphone = Some(microphone_tx);
        self.call = Some(Rc::clone(&controller));
        self.state.record_call_started();

        // The start future is tied to the actor: it is dropped if the socket closes first
        ctx.spawn(async move { controller.start().await }.into_actor(self).map(|result, act, ctx| {
            if let Err(err) = result {
                act.microphone = None;
                // Ending a call while it connects is not a failure
                if err.is_fatal() {
                    act.state.record_call_failed();
                }
                if err != CallError::Cancelled {
                    act.send_error(ctx, err.code(), &err.to_string());
                }
            }
        }));
    }

    fn end_call(&mut self) {
        self.microphone = None;
        match &self.call {
            Some(call) => call.end(),
            None => debug!("end_call without a call"),
        }
    }

    fn handle_client_message(&mut self, message: ClientMessage, ctx: &mut ws::WebsocketContext<Self>) {
        match message {
            ClientMessage::StartCall { microphone_granted } => self.start_call(microphone_granted, ctx),
            ClientMessage::SetMuted { muted } => {
                self.muted = muted;
                if let Some(call) = &self.call {
                    call.set_muted(muted);
                }
            }
            ClientMessage::SetVideoEnabled { enabled } => {
                self.video_enabled = enabled;
                if let Some(call) = &self.call {
                    call.set_video_enabled(enabled);
                }
            }
            ClientMessage::EndCall => self.end_call(),
            ClientMessage::Ping { timestamp } => self.send(ctx, &BridgeMessage::Pong { timestamp }),
        }
    }

    fn handle_microphone(&mut self, data: &[u8]) {
        let Some(microphone) = &self.microphone else {
            debug!(bytes = data.len(), "Microphone data without an active call");
            return;
        };

        let samples = match codec::samples_from_f32_le(data) {
            Ok(samples) => samples,
            Err(err) => {
                warn!(error = %err, "Dropping malformed microphone block");
                return;
            }
        };

        if let Err(err) = microphone.try_send(samples) {
            match err {
                mpsc::error::TrySendError::Full(_) => warn!("Microphone queue full, dropping block"),
                mpsc::error::TrySendError::Closed(_) => debug!("Microphone closed, dropping block"),
            }
        }
    }
}

impl Actor for CallWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("Call bridge connected");

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!("Call bridge heartbeat timeout, closing connection");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.end_call();
        info!("Call bridge disconnected");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for CallWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(message) => self.handle_client_message(message, ctx),
                    Err(err) => self.send_error(ctx, "invalid_json", &format!("Invalid message: {}", err)),
                }
            }
            Ok(ws::Message::Binary(data)) => {
                self.last_heartbeat = Instant::now();
                self.handle_microphone(&data);
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(?reason, "Client closed call bridge");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(error = %err, "Call bridge protocol error");
                ctx.stop();
            }
        }
    }
}

impl StreamHandler<CallUpdate> for CallWebSocket {
    fn handle(&mut self, update: CallUpdate, ctx: &mut Self::Context) {
        match update {
            CallUpdate::State(snapshot) => {
                if matches!(snapshot.phase, CallPhase::Closed | CallPhase::Failed) {
                    self.microphone = None;
                }
                self.send(ctx, &BridgeMessage::CallState(snapshot));
            }
            CallUpdate::Transcript(line) => self.send(ctx, &BridgeMessage::Transcript(line)),
        }
    }

    // A finished call's streams end; the socket stays open for the next call
    fn finished(&mut self, _ctx: &mut Self::Context) {}
}

impl Handler<Outgoing> for CallWebSocket {
    type Result = ();

    fn handle(&mut self, msg: Outgoing, ctx: &mut Self::Context) {
        self.send(ctx, &msg.0);
    }
}

/// WebSocket endpoint: upgrades the request and starts a [`CallWebSocket`].
///
/// Refused with 503 when the concurrent call limit is reached.
pub async fn call_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, actix_web::Error> {
    info!(peer = ?req.connection_info().peer_addr(), "New call bridge request");

    let slot = CallSlot::acquire(app_state.clone()).ok_or_else(|| {
        warn!("Call limit reached, refusing call bridge");
        AppError::Unavailable("concurrent call limit reached".to_string())
    })?;

    ws::start(CallWebSocket::new(app_state, slot), &req, stream)
}
